//! Synthesis of update programs from vector field expressions
//!
//! The expression is spliced into `update_kernel.wgsl` as the body of
//! `get_velocity(p: vec2<f32>) -> vec2<f32>`, which starts with `var v = vec2<f32>(0.0, 0.0);`
//! and returns `v`. Any `u_<name>` identifier in the expression becomes a uniform: the built-in
//! ones (`u_h`, `u_rand_seed`, `u_frame`, `u_drop_rate`, `u_aux`, `u_bbox`, `u_cursor`,
//! `u_hover`) alias engine state, anything else is assigned one of the custom scalar slots.

use crate::device::{KernelOptions, ProgramHandle, ProgramSource, RenderDevice};
use crate::error::CompileError;
use crate::params::{OutputChannel, UpdateUniforms};
use field_core::{ColorMode, Integrator, MAX_CUSTOM_UNIFORMS};

const QUAD_SHADER: &str = include_str!("shaders/update_quad.wgsl");
const KERNEL_TEMPLATE: &str = include_str!("shaders/update_kernel.wgsl");

const PROGRAM_LABEL: &str = "Update Program";

/// Kernel expressions for the built-in `u_*` names
const BUILTIN_UNIFORMS: [(&str, &str); 8] = [
    ("h", "u.integration.x"),
    ("rand_seed", "u.integration.y"),
    ("frame", "u.integration.z"),
    ("drop_rate", "u.integration.w"),
    ("aux", "u.control.y"),
    ("bbox", "u.bbox"),
    ("cursor", "u.cursor.xy"),
    ("hover", "u.cursor.zw"),
];

/// Generated kernel source, before it reaches a device
#[derive(Debug, Clone)]
pub struct SynthesizedProgram {
    pub source: ProgramSource,
    /// Custom uniform names (without the `u_` prefix), in slot order
    pub custom_uniforms: Vec<String>,
}

/// Builds update programs for one integrator
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgramSynthesizer {
    integrator: Integrator,
}

impl ProgramSynthesizer {
    pub fn new(integrator: Integrator) -> Self {
        Self { integrator }
    }

    pub fn integrator(&self) -> Integrator {
        self.integrator
    }

    /// Generate kernel source without touching a device.
    pub fn synthesize(
        &self,
        vector_field: &str,
        color_mode: ColorMode,
    ) -> Result<SynthesizedProgram, CompileError> {
        let mut bindings = String::new();
        let mut custom_uniforms = Vec::new();

        for name in scan_uniform_names(vector_field) {
            let expression = match BUILTIN_UNIFORMS.iter().find(|(builtin, _)| *builtin == name) {
                Some((_, expression)) => expression.to_string(),
                None => {
                    let slot = custom_uniforms.len();
                    if slot == MAX_CUSTOM_UNIFORMS {
                        return Err(CompileError::new(
                            PROGRAM_LABEL,
                            format!(
                                "too many custom uniforms (at most {MAX_CUSTOM_UNIFORMS}); \
                                 `u_{name}` does not fit"
                            ),
                        ));
                    }
                    custom_uniforms.push(name.clone());
                    format!("u.custom[{}].{}", slot / 4, ["x", "y", "z", "w"][slot % 4])
                }
            };
            bindings.push_str(&format!("    let u_{name} = {expression};\n"));
        }

        let fragment = KERNEL_TEMPLATE
            .replace("{{COLOR_MODE}}", &color_mode.index().to_string())
            .replace(
                "{{INTEGRATOR_RK4}}",
                if self.integrator == Integrator::Rk4 {
                    "true"
                } else {
                    "false"
                },
            )
            .replace("{{FIELD_UNIFORMS}}", &bindings)
            .replace("{{VECTOR_FIELD}}", vector_field);

        Ok(SynthesizedProgram {
            source: ProgramSource {
                label: PROGRAM_LABEL.to_string(),
                vertex: QUAD_SHADER.to_string(),
                fragment,
                options: KernelOptions {
                    color_mode,
                    integrator: self.integrator,
                },
            },
            custom_uniforms,
        })
    }

    /// Synthesize and compile. The device is untouched when synthesis fails.
    pub fn build<D: RenderDevice>(
        &self,
        device: &mut D,
        vector_field: &str,
        color_mode: ColorMode,
    ) -> Result<CompiledUpdateProgram, CompileError> {
        let synthesized = self.synthesize(vector_field, color_mode)?;
        let handle = device.compile_program(&synthesized.source)?;

        Ok(CompiledUpdateProgram {
            handle,
            options: synthesized.source.options,
            vector_field: vector_field.to_string(),
            custom_uniforms: synthesized.custom_uniforms,
            uniforms: UpdateUniforms::default(),
        })
    }
}

/// A compiled update program together with its uniform values
#[derive(Debug)]
pub struct CompiledUpdateProgram {
    handle: ProgramHandle,
    options: KernelOptions,
    vector_field: String,
    custom_uniforms: Vec<String>,
    uniforms: UpdateUniforms,
}

impl CompiledUpdateProgram {
    pub fn handle(&self) -> ProgramHandle {
        self.handle
    }

    pub fn color_mode(&self) -> ColorMode {
        self.options.color_mode
    }

    pub fn integrator(&self) -> Integrator {
        self.options.integrator
    }

    pub fn vector_field(&self) -> &str {
        &self.vector_field
    }

    pub fn custom_uniforms(&self) -> &[String] {
        &self.custom_uniforms
    }

    pub fn uniforms(&self) -> &UpdateUniforms {
        &self.uniforms
    }

    pub fn uniforms_mut(&mut self) -> &mut UpdateUniforms {
        &mut self.uniforms
    }

    pub fn set_output(&mut self, channel: OutputChannel) {
        self.uniforms.set_output(channel);
    }

    /// Set a scalar uniform by name, with or without the `u_` prefix.
    ///
    /// Returns false (and changes nothing) for names the program does not know or for
    /// non-finite values.
    pub fn set_uniform_scalar(&mut self, name: &str, value: f32) -> bool {
        if !value.is_finite() {
            return false;
        }
        let name = name.strip_prefix("u_").unwrap_or(name);
        if self.uniforms.set_builtin(name, value) {
            return true;
        }
        match self.custom_uniforms.iter().position(|n| n == name) {
            Some(slot) => {
                self.uniforms.set_custom(slot, value);
                true
            }
            None => false,
        }
    }

    pub fn uniform_scalar(&self, name: &str) -> Option<f32> {
        let name = name.strip_prefix("u_").unwrap_or(name);
        self.custom_uniforms
            .iter()
            .position(|n| n == name)
            .map(|slot| self.uniforms.custom(slot))
    }

    /// Carry custom uniform values over from the program this one replaces.
    pub fn inherit_uniforms(&mut self, previous: &CompiledUpdateProgram) {
        for (slot, name) in self.custom_uniforms.iter().enumerate() {
            if let Some(value) = previous.uniform_scalar(name) {
                self.uniforms.set_custom(slot, value);
            }
        }
    }

    pub fn dispose<D: RenderDevice>(self, device: &mut D) {
        device.release_program(self.handle);
    }
}

/// Unique `u_<name>` identifiers in order of first appearance, without the prefix.
fn scan_uniform_names(source: &str) -> Vec<String> {
    let bytes = source.as_bytes();
    let is_ident = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let mut names: Vec<String> = Vec::new();

    let mut i = 0;
    while i < bytes.len() {
        if !is_ident(bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && is_ident(bytes[i]) {
            i += 1;
        }
        let word = &source[start..i];
        if let Some(name) = word.strip_prefix("u_") {
            if !name.is_empty() && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}
