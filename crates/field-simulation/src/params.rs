//! Uniform block shared by every update pass

use bytemuck::{Pod, Zeroable};
use field_core::{BoundingBox, DEFAULT_COLOR_AUX, DEFAULT_DROP_PROBABILITY, DEFAULT_TIME_STEP};

/// Which value a single update pass writes into its target texture
///
/// Values are shared with `OUT_*` in `update_kernel.wgsl`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputChannel {
    X = 0,
    Y = 1,
    VelocityX = 2,
    VelocityY = 3,
    Color = 4,
}

impl OutputChannel {
    pub fn from_raw(raw: f32) -> Option<Self> {
        match raw as u32 {
            0 => Some(Self::X),
            1 => Some(Self::Y),
            2 => Some(Self::VelocityX),
            3 => Some(Self::VelocityY),
            4 => Some(Self::Color),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct UpdateUniforms {
    // Group 1: Integration
    // x: h (time step), y: rand_seed, z: frame, w: drop_rate
    pub integration: [f32; 4],

    // Group 2: Bounding box
    // xy: min, zw: max
    pub bbox: [f32; 4],

    // Group 3: Cursor
    // xy: last click, zw: hover
    pub cursor: [f32; 4],

    // Group 4: Pass control
    // x: output channel, y: color aux, z: aux signal length, w: padding
    pub control: [f32; 4],

    // Group 5: Custom `u_<name>` scalars in declaration order
    pub custom: [[f32; 4]; 2],
}

impl Default for UpdateUniforms {
    fn default() -> Self {
        Self {
            integration: [
                DEFAULT_TIME_STEP,        // h
                1.0,                      // rand_seed
                0.0,                      // frame
                DEFAULT_DROP_PROBABILITY, // drop_rate
            ],
            bbox: BoundingBox::default().to_array(),
            cursor: [0.0; 4],
            control: [
                OutputChannel::X as u32 as f32, // output channel
                DEFAULT_COLOR_AUX,              // color aux
                0.0,                            // aux signal length
                0.0,                            // padding
            ],
            custom: [[0.0; 4]; 2],
        }
    }
}

impl UpdateUniforms {
    pub fn set_output(&mut self, channel: OutputChannel) {
        self.control[0] = channel as u32 as f32;
    }

    pub fn output(&self) -> Option<OutputChannel> {
        OutputChannel::from_raw(self.control[0])
    }

    /// Set a built-in scalar by its kernel name. Returns false for unknown names.
    pub fn set_builtin(&mut self, name: &str, value: f32) -> bool {
        let slot = match name {
            "h" => &mut self.integration[0],
            "rand_seed" => &mut self.integration[1],
            "frame" => &mut self.integration[2],
            "drop_rate" => &mut self.integration[3],
            "aux" => &mut self.control[1],
            _ => return false,
        };
        *slot = value;
        true
    }

    pub fn custom(&self, index: usize) -> f32 {
        self.custom[index / 4][index % 4]
    }

    pub fn set_custom(&mut self, index: usize, value: f32) {
        self.custom[index / 4][index % 4] = value;
    }
}
