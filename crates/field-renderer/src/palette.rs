//! Particle colors and the painter's uniform block

use catppuccin::PALETTE;
use field_core::ColorMode;
use field_simulation::{Rgba, SimulationContext};

/// sRGB channel in [0, 1] to linear
pub fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear(color: &catppuccin::Color) -> [f32; 4] {
    let rgb = color.rgb;
    [
        srgb_to_linear(rgb.r as f32 / 255.0),
        srgb_to_linear(rgb.g as f32 / 255.0),
        srgb_to_linear(rgb.b as f32 / 255.0),
        1.0,
    ]
}

fn linear_rgba(color: &Rgba) -> [f32; 4] {
    [
        srgb_to_linear(color.r),
        srgb_to_linear(color.g),
        srgb_to_linear(color.b),
        color.a,
    ]
}

/// Linear colors used for particles
///
/// Uniform mode paints every particle with `uniform`. Velocity and angle modes blend from
/// `low` to `high` by the particle's color value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticlePalette {
    pub uniform: [f32; 4],
    pub low: [f32; 4],
    pub high: [f32; 4],
}

impl ParticlePalette {
    pub fn mocha() -> Self {
        let colors = &PALETTE.mocha.colors;
        Self {
            uniform: linear(&colors.lavender),
            low: linear(&colors.blue),
            high: linear(&colors.peach),
        }
    }
}

impl Default for ParticlePalette {
    fn default() -> Self {
        Self::mocha()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PaintUniforms {
    pub bbox: [f32; 4],
    /// Linear background color
    pub background: [f32; 4],
    pub uniform_color: [f32; 4],
    pub low_color: [f32; 4],
    pub high_color: [f32; 4],
    /// fade out, color mode, particle count, state resolution
    pub params: [f32; 4],
    /// Trail texel shown at the top-left surface pixel, in `xy`
    pub present_offset: [f32; 4],
}

impl PaintUniforms {
    pub fn new(context: &SimulationContext, particle_count: u32, palette: &ParticlePalette) -> Self {
        Self {
            bbox: context.bbox.to_array(),
            background: linear_rgba(&context.background),
            uniform_color: palette.uniform,
            low_color: palette.low,
            high_color: palette.high,
            params: [
                context.fade_out,
                context.color_mode.index() as f32,
                particle_count as f32,
                context.particle_state_resolution as f32,
            ],
            present_offset: [0.0; 4],
        }
    }

    pub fn color_mode(&self) -> Option<ColorMode> {
        ColorMode::from_index(self.params[1] as i64)
    }

    /// Background as a clear color.
    pub fn clear_color(&self) -> wgpu::Color {
        let [r, g, b, a] = self.background;
        wgpu::Color {
            r: r as f64,
            g: g as f64,
            b: b as f64,
            a: a as f64,
        }
    }
}
