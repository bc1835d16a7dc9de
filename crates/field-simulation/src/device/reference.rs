//! CPU implementation of [`RenderDevice`]
//!
//! Evaluates the update kernel with the host mirror in `field_core::kernel`. The vector field is
//! a Rust closure standing in for the WGSL expression; programs are still synthesized and run
//! through naga so compile failures behave exactly as on the GPU path.
//!
//! Failures can be injected to exercise error paths, and every draw and readback is counted.

use super::{
    check_texel_count, validate_wgsl, DrawPass, KernelOptions, ProgramHandle, ProgramSource,
    RenderDevice, TextureHandle,
};
use crate::error::{CompileError, DeviceError};
use crate::params::OutputChannel;
use field_core::codec::{self, PackedFloat};
use field_core::kernel::{self, StepInputs};
use field_core::BoundingBox;
use glam::Vec2;
use std::collections::HashMap;

/// Host-side stand-in for the user's vector field expression
pub type VelocityField = Box<dyn Fn(Vec2) -> Vec2 + Send>;

struct ReferenceTexture {
    resolution: u32,
    texels: Vec<PackedFloat>,
}

pub struct ReferenceDevice {
    field: VelocityField,
    textures: HashMap<TextureHandle, ReferenceTexture>,
    programs: HashMap<ProgramHandle, KernelOptions>,
    next_id: u32,

    draws: usize,
    readbacks: usize,
    last_signal: Vec<f32>,

    // Countdowns of successful calls before the next injected failure
    fail_allocation_in: Option<usize>,
    fail_draw_in: Option<usize>,
}

impl ReferenceDevice {
    pub fn new(field: impl Fn(Vec2) -> Vec2 + Send + 'static) -> Self {
        Self {
            field: Box::new(field),
            textures: HashMap::new(),
            programs: HashMap::new(),
            next_id: 0,
            draws: 0,
            readbacks: 0,
            last_signal: Vec::new(),
            fail_allocation_in: None,
            fail_draw_in: None,
        }
    }

    /// Replace the host velocity closure used by subsequent draws.
    pub fn set_field(&mut self, field: impl Fn(Vec2) -> Vec2 + Send + 'static) {
        self.field = Box::new(field);
    }

    /// Let `successes` allocations through, then fail the next one.
    pub fn fail_allocation_after(&mut self, successes: usize) {
        self.fail_allocation_in = Some(successes);
    }

    /// Let `successes` draws through, then fail the next one.
    pub fn fail_draw_after(&mut self, successes: usize) {
        self.fail_draw_in = Some(successes);
    }

    pub fn draw_count(&self) -> usize {
        self.draws
    }

    pub fn readback_count(&self) -> usize {
        self.readbacks
    }

    /// Aux signal samples bound to the most recent draw.
    pub fn last_aux_signal(&self) -> &[f32] {
        &self.last_signal
    }

    /// Texture contents without going through a counted readback.
    pub fn texels(&self, texture: TextureHandle) -> Option<&[PackedFloat]> {
        self.textures.get(&texture).map(|t| t.texels.as_slice())
    }

    /// Decoded texture contents.
    pub fn values(&self, texture: TextureHandle) -> Option<Vec<f32>> {
        self.texels(texture).map(codec::decode_all)
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    fn texture(&self, handle: TextureHandle) -> Result<&ReferenceTexture, DeviceError> {
        self.textures.get(&handle).ok_or(DeviceError::UnknownTexture)
    }

    fn aux_signal(&self, handle: Option<TextureHandle>, len: u32) -> Result<Vec<f32>, DeviceError> {
        match handle {
            Some(handle) => {
                let mut values = codec::decode_all(&self.texture(handle)?.texels);
                values.truncate(len as usize);
                Ok(values)
            }
            None => Ok(Vec::new()),
        }
    }
}

/// Tick a failure countdown; true when this call should fail.
fn countdown(slot: &mut Option<usize>) -> bool {
    match slot {
        Some(0) => {
            *slot = None;
            true
        }
        Some(remaining) => {
            *remaining -= 1;
            false
        }
        None => false,
    }
}

impl RenderDevice for ReferenceDevice {
    fn create_state_texture(
        &mut self,
        label: &str,
        resolution: u32,
        texels: &[PackedFloat],
    ) -> Result<TextureHandle, DeviceError> {
        check_texel_count(resolution, texels)?;
        if countdown(&mut self.fail_allocation_in) {
            return Err(DeviceError::Allocation(format!("injected failure for {label}")));
        }

        let handle = TextureHandle(self.next_id());
        self.textures.insert(
            handle,
            ReferenceTexture {
                resolution,
                texels: texels.to_vec(),
            },
        );
        Ok(handle)
    }

    fn release_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture);
    }

    fn texture_resolution(&self, texture: TextureHandle) -> Option<u32> {
        self.textures.get(&texture).map(|t| t.resolution)
    }

    fn compile_program(&mut self, source: &ProgramSource) -> Result<ProgramHandle, CompileError> {
        validate_wgsl(&format!("{} (vertex)", source.label), &source.vertex)?;
        validate_wgsl(&format!("{} (fragment)", source.label), &source.fragment)?;

        let handle = ProgramHandle(self.next_id());
        self.programs.insert(handle, source.options);
        Ok(handle)
    }

    fn release_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program);
    }

    fn draw(&mut self, pass: &DrawPass<'_>) -> Result<(), DeviceError> {
        let options = *self
            .programs
            .get(&pass.program)
            .ok_or(DeviceError::UnknownProgram)?;
        if countdown(&mut self.fail_draw_in) {
            return Err(DeviceError::Draw("injected failure".to_string()));
        }

        let resolution = self.texture(pass.target)?.resolution;
        let xs = self.texture(pass.position_x)?;
        let ys = self.texture(pass.position_y)?;
        for source in [xs, ys] {
            if source.resolution != resolution {
                return Err(DeviceError::ResolutionMismatch {
                    expected: resolution,
                    actual: source.resolution,
                });
            }
        }

        let uniforms = pass.uniforms;
        let channel = uniforms
            .output()
            .ok_or_else(|| DeviceError::Draw(format!("bad output channel {}", uniforms.control[0])))?;
        let signal = self.aux_signal(pass.aux_signal, uniforms.control[2] as u32)?;

        let inputs = StepInputs {
            time_step: uniforms.integration[0],
            rand_seed: uniforms.integration[1],
            drop_probability: uniforms.integration[3],
            bbox: BoundingBox::new(
                uniforms.bbox[0],
                uniforms.bbox[1],
                uniforms.bbox[2],
                uniforms.bbox[3],
            ),
        };
        let field = |p: Vec2| kernel::sanitize((self.field)(p));

        let output: Vec<PackedFloat> = xs
            .texels
            .iter()
            .zip(&ys.texels)
            .enumerate()
            .map(|(i, (&x, &y))| {
                let position = Vec2::new(codec::decode(x), codec::decode(y));
                let column = (i as u32 % resolution) as f32;
                let row = (i as u32 / resolution) as f32;
                let uv = (Vec2::new(column, row) + 0.5) / resolution as f32;

                let value = match channel {
                    OutputChannel::X | OutputChannel::Y => {
                        let next = kernel::step_particle(
                            position,
                            uv,
                            &inputs,
                            options.integrator,
                            field,
                        );
                        if channel == OutputChannel::X {
                            next.x
                        } else {
                            next.y
                        }
                    }
                    OutputChannel::VelocityX => field(position).x,
                    OutputChannel::VelocityY => field(position).y,
                    OutputChannel::Color => {
                        kernel::color_value(options.color_mode, field(position), uniforms.control[1])
                    }
                };
                codec::encode(value)
            })
            .collect();

        self.draws += 1;
        self.last_signal = signal;
        if let Some(target) = self.textures.get_mut(&pass.target) {
            target.texels = output;
        }
        Ok(())
    }

    fn read_pixels(&mut self, texture: TextureHandle) -> Result<Vec<PackedFloat>, DeviceError> {
        let texels = self.texture(texture)?.texels.clone();
        self.readbacks += 1;
        Ok(texels)
    }

    fn live_resources(&self) -> usize {
        self.textures.len() + self.programs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_countdown() {
        let mut slot = Some(1);
        assert!(!countdown(&mut slot));
        assert!(countdown(&mut slot));
        assert!(!countdown(&mut slot));
        assert_eq!(slot, None);
    }

    #[test]
    fn test_allocation_failure_injection() {
        let mut device = ReferenceDevice::new(|_| Vec2::ZERO);
        device.fail_allocation_after(1);

        assert!(device.create_state_texture("a", 1, &[[0; 4]]).is_ok());
        assert!(matches!(
            device.create_state_texture("b", 1, &[[0; 4]]),
            Err(DeviceError::Allocation(_))
        ));
        assert!(device.create_state_texture("c", 1, &[[0; 4]]).is_ok());
        assert_eq!(device.live_resources(), 2);
    }

    #[test]
    fn test_release_unknown_is_ignored() {
        let mut device = ReferenceDevice::new(|_| Vec2::ZERO);
        let texture = device.create_state_texture("a", 1, &[[0; 4]]).unwrap();
        device.release_texture(texture);
        device.release_texture(texture);
        assert_eq!(device.live_resources(), 0);
        assert_eq!(device.texture_resolution(texture), None);
    }

    #[test]
    fn test_readbacks_are_counted() {
        let mut device = ReferenceDevice::new(|_| Vec2::ZERO);
        let texture = device
            .create_state_texture("a", 1, &[codec::encode(2.5)])
            .unwrap();
        assert_eq!(device.read_pixels(texture).unwrap(), vec![codec::encode(2.5)]);
        assert_eq!(device.readback_count(), 1);
    }
}
