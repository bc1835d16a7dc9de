//! Particle state textures
//!
//! Particle `i` lives at texel `(i % resolution, i / resolution)` of every dimension texture.
//! A [`ParticleStatePair`] double-buffers the state: one [`TextureSet`] is read while the other
//! is written, and the roles flip after every successful step.

use crate::device::{RenderDevice, TextureHandle};
use crate::error::DeviceError;
use crate::params::OutputChannel;
use field_core::codec::{self, PackedFloat};
use field_core::{BoundingBox, MAX_STATE_RESOLUTION};
use rand::Rng;

/// Zero-filled contents for [`TextureSet::allocate`]
pub const NO_VALUES: &[f32] = &[];

/// One scalar field of particle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    X,
    Y,
    Color,
}

impl Dimension {
    /// Dimensions of a particle state set, in pass order.
    pub const ALL: [Dimension; 3] = [Dimension::X, Dimension::Y, Dimension::Color];

    pub fn name(self) -> &'static str {
        match self {
            Dimension::X => "x",
            Dimension::Y => "y",
            Dimension::Color => "color",
        }
    }

    /// Output channel that produces the next value of this dimension.
    pub fn output_channel(self) -> OutputChannel {
        match self {
            Dimension::X => OutputChannel::X,
            Dimension::Y => OutputChannel::Y,
            Dimension::Color => OutputChannel::Color,
        }
    }
}

/// Side length of the square state texture for `particle_count` particles
///
/// `ceil(sqrt(count))` computed in integers, clamped to `1..=MAX_STATE_RESOLUTION`.
pub fn state_resolution(particle_count: u32) -> u32 {
    let mut side = (particle_count as f64).sqrt() as u32;
    while (side as u64) * (side as u64) < particle_count as u64 {
        side += 1;
    }
    while side > 0 && ((side - 1) as u64) * ((side - 1) as u64) >= particle_count as u64 {
        side -= 1;
    }
    side.clamp(1, MAX_STATE_RESOLUTION)
}

/// Pad or truncate `values` to exactly `len`, replacing non-finite entries with zero.
pub fn fit_values(values: &[f32], len: usize) -> Vec<f32> {
    let mut fitted: Vec<f32> = values
        .iter()
        .take(len)
        .map(|v| if v.is_finite() { *v } else { 0.0 })
        .collect();
    fitted.resize(len, 0.0);
    fitted
}

/// Random positions inside `bbox` for `resolution`² texels.
pub fn random_positions(
    resolution: u32,
    bbox: &BoundingBox,
    rng: &mut impl Rng,
) -> (Vec<f32>, Vec<f32>) {
    let texels = resolution as usize * resolution as usize;
    let xs = (0..texels)
        .map(|_| bbox.min_x + rng.random::<f32>() * bbox.width())
        .collect();
    let ys = (0..texels)
        .map(|_| bbox.min_y + rng.random::<f32>() * bbox.height())
        .collect();
    (xs, ys)
}

/// Ordered set of same-sized textures, one per dimension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureSet {
    resolution: u32,
    textures: Vec<(Dimension, TextureHandle)>,
}

impl TextureSet {
    /// Allocate one texture per entry, initialized from the given values.
    ///
    /// Values are fitted to `resolution`². If any allocation fails, textures already created
    /// for this set are released before the error is returned.
    pub fn allocate<D: RenderDevice>(
        device: &mut D,
        resolution: u32,
        contents: &[(Dimension, &[f32])],
    ) -> Result<Self, DeviceError> {
        let texels = resolution as usize * resolution as usize;
        let mut textures = Vec::with_capacity(contents.len());

        for (dimension, values) in contents {
            let packed: Vec<PackedFloat> = codec::encode_all(&fit_values(values, texels));
            let label = format!("Particle State {}", dimension.name());
            match device.create_state_texture(&label, resolution, &packed) {
                Ok(handle) => textures.push((*dimension, handle)),
                Err(err) => {
                    for (_, handle) in textures {
                        device.release_texture(handle);
                    }
                    return Err(err);
                }
            }
        }

        Ok(Self {
            resolution,
            textures,
        })
    }

    pub fn release<D: RenderDevice>(self, device: &mut D) {
        for (_, handle) in self.textures {
            device.release_texture(handle);
        }
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    pub fn get(&self, dimension: Dimension) -> Option<TextureHandle> {
        self.textures
            .iter()
            .find(|(d, _)| *d == dimension)
            .map(|(_, handle)| *handle)
    }

    pub fn handles(&self) -> impl Iterator<Item = TextureHandle> + '_ {
        self.textures.iter().map(|(_, handle)| *handle)
    }

    /// The position textures this set exposes as kernel inputs.
    pub fn bind_for_read(&self) -> Result<(TextureHandle, TextureHandle), DeviceError> {
        match (self.get(Dimension::X), self.get(Dimension::Y)) {
            (Some(x), Some(y)) => Ok((x, y)),
            _ => Err(DeviceError::UnknownTexture),
        }
    }

    /// The render target for the `index`-th dimension of this set.
    pub fn bind_for_write(&self, index: usize) -> Option<(Dimension, TextureHandle)> {
        self.textures.get(index).copied()
    }
}

/// Double-buffered particle state
#[derive(Debug)]
pub struct ParticleStatePair {
    sets: [TextureSet; 2],
    current: usize,
    particle_count: u32,
}

impl ParticleStatePair {
    /// Allocate both sets for `particle_count` particles spread uniformly over `bbox`.
    pub fn allocate<D: RenderDevice>(
        device: &mut D,
        particle_count: u32,
        bbox: &BoundingBox,
        rng: &mut impl Rng,
    ) -> Result<Self, DeviceError> {
        let resolution = state_resolution(particle_count);
        let (xs, ys) = random_positions(resolution, bbox, rng);
        let contents = [
            (Dimension::X, xs.as_slice()),
            (Dimension::Y, ys.as_slice()),
            (Dimension::Color, NO_VALUES),
        ];

        let read = TextureSet::allocate(device, resolution, &contents)?;
        let write = match TextureSet::allocate(device, resolution, &contents) {
            Ok(set) => set,
            Err(err) => {
                read.release(device);
                return Err(err);
            }
        };

        log::info!(
            "Allocated particle state for {particle_count} particles ({resolution}x{resolution})"
        );
        Ok(Self {
            sets: [read, write],
            current: 0,
            particle_count,
        })
    }

    pub fn read(&self) -> &TextureSet {
        &self.sets[self.current]
    }

    pub fn write(&self) -> &TextureSet {
        &self.sets[1 - self.current]
    }

    /// Exchange the read and write roles.
    pub fn swap(&mut self) {
        self.current = 1 - self.current;
    }

    pub fn resolution(&self) -> u32 {
        self.sets[0].resolution()
    }

    pub fn particle_count(&self) -> u32 {
        self.particle_count
    }

    pub fn release<D: RenderDevice>(self, device: &mut D) {
        let [a, b] = self.sets;
        a.release(device);
        b.release(device);
    }
}
