//! On-demand sampling of the vector field at arbitrary points
//!
//! Requests land in a single-slot mailbox: a newer request overwrites an unprocessed one, and at
//! most one is served per frame. Serving a request writes the sample points into temporary
//! position textures, runs the velocity passes of the current program, and reads the results
//! back. This is the only place the engine reads textures back from the device.

use crate::device::{DrawPass, RenderDevice};
use crate::error::DeviceError;
use crate::params::OutputChannel;
use crate::program::CompiledUpdateProgram;
use crate::textures::{fit_values, Dimension, TextureSet, NO_VALUES};
use field_core::codec;
use field_core::{StatCounter, MAX_STATE_RESOLUTION};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

/// Points to sample, laid out on a `resolution` x `resolution` grid of texels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorLinesRequest {
    pub resolution: u32,
    pub x: Vec<f32>,
    pub y: Vec<f32>,
}

/// Velocities at the requested points, in request order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorSampleResult {
    pub resolution: u32,
    pub decoded_velocity_x: Vec<f32>,
    pub decoded_velocity_y: Vec<f32>,
    pub x_stats: StatCounter,
    pub y_stats: StatCounter,
}

/// Single-slot, last-writer-wins request mailbox
///
/// Clones share the slot, so producers on other threads can hold their own handle.
#[derive(Debug, Clone, Default)]
pub struct SampleMailbox {
    slot: Arc<Mutex<Option<VectorLinesRequest>>>,
}

impl SampleMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a request. Returns true when it replaced one that was never served.
    pub fn enqueue(&self, request: VectorLinesRequest) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.replace(request).is_some()
    }

    pub fn take(&self) -> Option<VectorLinesRequest> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn is_pending(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

#[derive(Debug, Default)]
pub struct VectorSampler {
    mailbox: SampleMailbox,
}

impl VectorSampler {
    pub fn new(mailbox: SampleMailbox) -> Self {
        Self { mailbox }
    }

    pub fn mailbox(&self) -> &SampleMailbox {
        &self.mailbox
    }

    pub fn enqueue(&self, request: VectorLinesRequest) -> bool {
        let replaced = self.mailbox.enqueue(request);
        if replaced {
            log::debug!("Vector sample request replaced before it was served");
        }
        replaced
    }

    /// Serve the pending request, if any.
    ///
    /// Temporary textures are released whether or not sampling succeeds. A request that fails
    /// is dropped; the error is returned and the next request starts fresh.
    pub fn process_one<D: RenderDevice>(
        &self,
        device: &mut D,
        program: &mut CompiledUpdateProgram,
    ) -> Result<Option<VectorSampleResult>, DeviceError> {
        let Some(request) = self.mailbox.take() else {
            return Ok(None);
        };

        let resolution = request.resolution;
        if resolution == 0 || resolution > MAX_STATE_RESOLUTION {
            log::debug!("Ignoring vector sample request with resolution {resolution}");
            return Ok(None);
        }

        let texels = resolution as usize * resolution as usize;
        let xs = fit_values(&request.x, texels);
        let ys = fit_values(&request.y, texels);

        let read = TextureSet::allocate(
            device,
            resolution,
            &[(Dimension::X, xs.as_slice()), (Dimension::Y, ys.as_slice())],
        )?;
        let write = match TextureSet::allocate(
            device,
            resolution,
            &[(Dimension::X, NO_VALUES), (Dimension::Y, NO_VALUES)],
        ) {
            Ok(set) => set,
            Err(err) => {
                read.release(device);
                return Err(err);
            }
        };

        let sampled = sample_velocities(device, program, &read, &write);
        read.release(device);
        write.release(device);
        let (decoded_velocity_x, decoded_velocity_y) = sampled?;

        Ok(Some(VectorSampleResult {
            resolution,
            x_stats: decoded_velocity_x.iter().copied().collect(),
            y_stats: decoded_velocity_y.iter().copied().collect(),
            decoded_velocity_x,
            decoded_velocity_y,
        }))
    }
}

fn sample_velocities<D: RenderDevice>(
    device: &mut D,
    program: &mut CompiledUpdateProgram,
    read: &TextureSet,
    write: &TextureSet,
) -> Result<(Vec<f32>, Vec<f32>), DeviceError> {
    let velocity_x = sample_channel(device, program, read, write, 0, OutputChannel::VelocityX)?;
    let velocity_y = sample_channel(device, program, read, write, 1, OutputChannel::VelocityY)?;
    Ok((velocity_x, velocity_y))
}

fn sample_channel<D: RenderDevice>(
    device: &mut D,
    program: &mut CompiledUpdateProgram,
    read: &TextureSet,
    write: &TextureSet,
    index: usize,
    channel: OutputChannel,
) -> Result<Vec<f32>, DeviceError> {
    let (position_x, position_y) = read.bind_for_read()?;
    let (_, target) = write
        .bind_for_write(index)
        .ok_or(DeviceError::UnknownTexture)?;

    program.set_output(channel);
    device.draw(&DrawPass {
        program: program.handle(),
        position_x,
        position_y,
        aux_signal: None,
        target,
        uniforms: program.uniforms(),
    })?;
    Ok(codec::decode_all(&device.read_pixels(target)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ReferenceDevice;
    use crate::program::ProgramSynthesizer;
    use field_core::{ColorMode, Integrator};
    use glam::Vec2;

    fn setup() -> (ReferenceDevice, CompiledUpdateProgram) {
        let mut device = ReferenceDevice::new(|p| Vec2::new(2.0 * p.x, -p.y));
        let program = ProgramSynthesizer::new(Integrator::Euler)
            .build(&mut device, "v.x = 2.0 * p.x;\nv.y = -p.y;", ColorMode::Uniform)
            .unwrap();
        (device, program)
    }

    fn request(resolution: u32, x: Vec<f32>, y: Vec<f32>) -> VectorLinesRequest {
        VectorLinesRequest { resolution, x, y }
    }

    #[test]
    fn test_mailbox_last_request_wins() {
        let mailbox = SampleMailbox::new();
        assert!(!mailbox.enqueue(request(1, vec![1.0], vec![1.0])));
        assert!(mailbox.enqueue(request(2, vec![], vec![])));
        assert_eq!(mailbox.take().map(|r| r.resolution), Some(2));
        assert_eq!(mailbox.take(), None);
    }

    #[test]
    fn test_samples_field_at_points() {
        let (mut device, mut program) = setup();
        let sampler = VectorSampler::default();
        sampler.enqueue(request(2, vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0, 7.0, 8.0]));

        let result = sampler
            .process_one(&mut device, &mut program)
            .unwrap()
            .unwrap();

        assert_eq!(result.resolution, 2);
        assert_eq!(result.decoded_velocity_x, vec![2.0, 4.0, 6.0, 0.0]);
        assert_eq!(result.decoded_velocity_y, vec![-4.0, -5.0, -6.0, -7.0]);
        assert_eq!(result.x_stats.max, 6.0);
        assert_eq!(result.y_stats.min, -7.0);
        assert_eq!(result.x_stats.count, 4);
    }

    #[test]
    fn test_temporaries_released() {
        let (mut device, mut program) = setup();
        let live = device.live_resources();
        let sampler = VectorSampler::default();
        sampler.enqueue(request(16, vec![0.5; 256], vec![0.5; 256]));

        let result = sampler.process_one(&mut device, &mut program).unwrap();
        assert_eq!(result.map(|r| r.decoded_velocity_x.len()), Some(256));
        assert_eq!(device.live_resources(), live);
        assert_eq!(device.readback_count(), 2);
    }

    #[test]
    fn test_failed_draw_releases_and_drops_request() {
        let (mut device, mut program) = setup();
        let live = device.live_resources();
        device.fail_draw_after(1);
        let sampler = VectorSampler::default();
        sampler.enqueue(request(4, vec![], vec![]));

        assert!(sampler.process_one(&mut device, &mut program).is_err());
        assert_eq!(device.live_resources(), live);
        assert!(!sampler.mailbox().is_pending());
        assert_eq!(sampler.process_one(&mut device, &mut program), Ok(None));
    }

    #[test]
    fn test_invalid_resolution_is_ignored() {
        let (mut device, mut program) = setup();
        let sampler = VectorSampler::default();
        sampler.enqueue(request(0, vec![], vec![]));
        assert_eq!(sampler.process_one(&mut device, &mut program), Ok(None));
        assert_eq!(device.live_resources(), 1);
    }
}
