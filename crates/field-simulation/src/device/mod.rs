//! Render-to-texture device abstraction
//!
//! Everything the simulation needs from a GPU goes through [`RenderDevice`]: allocate packed
//! float textures, compile an update program, draw one full-target quad into a texture, and
//! (rarely) read a texture back. [`WgpuDevice`] is the real implementation; [`ReferenceDevice`]
//! evaluates the same kernel on the CPU so the orchestration can be tested without an adapter.

pub mod gpu;
pub mod reference;

pub use gpu::WgpuDevice;
pub use reference::ReferenceDevice;

use crate::error::{CompileError, DeviceError};
use crate::params::UpdateUniforms;
use field_core::codec::PackedFloat;
use field_core::{ColorMode, Integrator};

/// Opaque id of a device-owned state texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u32);

/// Opaque id of a device-owned update program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub(crate) u32);

/// Build-time switches baked into a synthesized kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelOptions {
    pub color_mode: ColorMode,
    pub integrator: Integrator,
}

/// Complete source of one update program
#[derive(Debug, Clone)]
pub struct ProgramSource {
    pub label: String,
    pub vertex: String,
    pub fragment: String,
    pub options: KernelOptions,
}

/// One full-target draw of the update kernel
#[derive(Debug, Clone, Copy)]
pub struct DrawPass<'a> {
    pub program: ProgramHandle,
    pub position_x: TextureHandle,
    pub position_y: TextureHandle,
    pub aux_signal: Option<TextureHandle>,
    pub target: TextureHandle,
    pub uniforms: &'a UpdateUniforms,
}

pub trait RenderDevice {
    /// Allocate a square texture of `resolution`² texels initialized from `texels`.
    fn create_state_texture(
        &mut self,
        label: &str,
        resolution: u32,
        texels: &[PackedFloat],
    ) -> Result<TextureHandle, DeviceError>;

    /// Release a texture. Unknown handles are ignored.
    fn release_texture(&mut self, texture: TextureHandle);

    fn texture_resolution(&self, texture: TextureHandle) -> Option<u32>;

    fn compile_program(&mut self, source: &ProgramSource) -> Result<ProgramHandle, CompileError>;

    /// Release a program. Unknown handles are ignored.
    fn release_program(&mut self, program: ProgramHandle);

    /// Run the update kernel over every texel of `pass.target`.
    fn draw(&mut self, pass: &DrawPass<'_>) -> Result<(), DeviceError>;

    /// Synchronously copy a texture back to the host, row-major.
    fn read_pixels(&mut self, texture: TextureHandle) -> Result<Vec<PackedFloat>, DeviceError>;

    /// Number of textures and programs currently alive.
    fn live_resources(&self) -> usize;
}

/// Parse and validate WGSL with naga, rendering any error against the source.
pub fn validate_wgsl(label: &str, source: &str) -> Result<naga::Module, CompileError> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| CompileError::new(label, e.emit_to_string(source)))?;

    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| CompileError::new(label, e.emit_to_string(source)))?;

    Ok(module)
}

pub(crate) fn check_texel_count(resolution: u32, texels: &[PackedFloat]) -> Result<(), DeviceError> {
    let expected = resolution as usize * resolution as usize;
    if resolution == 0 || texels.len() != expected {
        return Err(DeviceError::Allocation(format!(
            "{} texels for a {resolution}x{resolution} texture",
            texels.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_minimal_shader() {
        let source = "@fragment fn main() -> @location(0) vec4<f32> { return vec4<f32>(1.0); }";
        assert!(validate_wgsl("minimal", source).is_ok());
    }

    #[test]
    fn test_validate_reports_diagnostic() {
        let err = validate_wgsl("broken", "fn main( {").unwrap_err();
        assert_eq!(err.label, "broken");
        assert!(!err.diagnostic.is_empty());
    }

    #[test]
    fn test_texel_count() {
        assert!(check_texel_count(2, &[[0; 4]; 4]).is_ok());
        assert!(check_texel_count(2, &[[0; 4]; 3]).is_err());
        assert!(check_texel_count(0, &[]).is_err());
    }
}
