//! Per-scene state shared by the simulation components

use crate::params::UpdateUniforms;
use field_core::{
    BoundingBox, ColorMode, DEFAULT_COLOR_AUX, DEFAULT_DROP_PROBABILITY, DEFAULT_FADE_OUT,
    DEFAULT_TIME_STEP,
};
use glam::Vec2;
use serde::{Deserialize, Serialize};

/// Straight-alpha color with every channel in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rgba {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Rgba {
    pub fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn is_valid(&self) -> bool {
        [self.r, self.g, self.b, self.a]
            .iter()
            .all(|c| c.is_finite() && (0.0..=1.0).contains(c))
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for Rgba {
    // Catppuccin Mocha base
    fn default() -> Self {
        Self::new(30.0 / 255.0, 30.0 / 255.0, 46.0 / 255.0, 1.0)
    }
}

/// Last click and current hover position, in simulation space
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Cursor {
    pub click: Vec2,
    pub hover: Vec2,
}

/// State shared by the driver, sampler, and painter for one scene
///
/// The scene owns it and is the only writer; everything else reads it.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationContext {
    pub bbox: BoundingBox,
    pub cursor: Cursor,
    /// Time step before frame-rate compensation
    pub integration_time_step: f32,
    pub drop_probability: f32,
    pub fade_out: f32,
    pub color_mode: ColorMode,
    pub color_aux: f32,
    pub background: Rgba,
    pub particle_state_resolution: u32,
    /// Updates since the program was last (re)built
    pub frame: u32,
    /// Per-frame random seed in [1, 2)
    pub frame_seed: f32,
    pub aux_signal_len: u32,
}

impl Default for SimulationContext {
    fn default() -> Self {
        Self {
            bbox: BoundingBox::default(),
            cursor: Cursor::default(),
            integration_time_step: DEFAULT_TIME_STEP,
            drop_probability: DEFAULT_DROP_PROBABILITY,
            fade_out: DEFAULT_FADE_OUT,
            color_mode: ColorMode::default(),
            color_aux: DEFAULT_COLOR_AUX,
            background: Rgba::default(),
            particle_state_resolution: 1,
            frame: 0,
            frame_seed: 1.0,
            aux_signal_len: 0,
        }
    }
}

impl SimulationContext {
    /// Copy the per-frame values into a program's uniform block.
    ///
    /// `time_step` is the compensated step actually used for this frame.
    pub fn apply_to(&self, uniforms: &mut UpdateUniforms, time_step: f32) {
        uniforms.integration = [
            time_step,
            self.frame_seed,
            self.frame as f32,
            self.drop_probability,
        ];
        uniforms.bbox = self.bbox.to_array();
        uniforms.cursor = [
            self.cursor.click.x,
            self.cursor.click.y,
            self.cursor.hover.x,
            self.cursor.hover.y,
        ];
        uniforms.control[1] = self.color_aux;
        uniforms.control[2] = self.aux_signal_len as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_to_uniforms() {
        let context = SimulationContext {
            frame: 7,
            frame_seed: 1.5,
            drop_probability: 0.25,
            cursor: Cursor {
                click: Vec2::new(1.0, 2.0),
                hover: Vec2::new(3.0, 4.0),
            },
            ..Default::default()
        };
        let mut uniforms = UpdateUniforms::default();
        uniforms.custom[0][0] = 9.0;

        context.apply_to(&mut uniforms, 0.02);

        assert_eq!(uniforms.integration, [0.02, 1.5, 7.0, 0.25]);
        assert_eq!(uniforms.cursor, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(uniforms.bbox, BoundingBox::default().to_array());
        assert_eq!(uniforms.custom[0][0], 9.0);
    }

    #[test]
    fn test_rgba_validation() {
        assert!(Rgba::default().is_valid());
        assert!(!Rgba::new(1.5, 0.0, 0.0, 1.0).is_valid());
        assert!(!Rgba::new(f32::NAN, 0.0, 0.0, 1.0).is_valid());
    }
}
