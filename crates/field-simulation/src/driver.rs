//! Per-frame integration driver
//!
//! One step draws one pass per dimension of the write set, reading positions from the read
//! set, then swaps the roles. The color pass only runs when the color mode needs it.

use crate::context::SimulationContext;
use crate::device::{DrawPass, RenderDevice, TextureHandle};
use crate::error::DeviceError;
use crate::program::CompiledUpdateProgram;
use crate::textures::{Dimension, ParticleStatePair};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverState {
    #[default]
    Idle,
    Stepping(Dimension),
}

#[derive(Debug, Default)]
pub struct IntegrationDriver {
    state: DriverState,
    completed_steps: u64,
    last_passes: Vec<Dimension>,
}

impl IntegrationDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn completed_steps(&self) -> u64 {
        self.completed_steps
    }

    /// Dimensions written by the last step, in order.
    pub fn last_passes(&self) -> &[Dimension] {
        &self.last_passes
    }

    /// Advance every particle by one step.
    ///
    /// On a failed pass the driver returns to idle without swapping, so the read set still
    /// holds the last complete state.
    pub fn step<D: RenderDevice>(
        &mut self,
        device: &mut D,
        program: &mut CompiledUpdateProgram,
        pair: &mut ParticleStatePair,
        context: &SimulationContext,
        time_step: f32,
        aux_signal: Option<TextureHandle>,
    ) -> Result<(), DeviceError> {
        context.apply_to(program.uniforms_mut(), time_step);
        let (position_x, position_y) = pair.read().bind_for_read()?;
        let color_pass = program.color_mode().needs_color_pass();

        self.last_passes.clear();
        let mut index = 0;
        while let Some((dimension, target)) = pair.write().bind_for_write(index) {
            index += 1;
            if dimension == Dimension::Color && !color_pass {
                continue;
            }

            self.state = DriverState::Stepping(dimension);
            program.set_output(dimension.output_channel());
            let result = device.draw(&DrawPass {
                program: program.handle(),
                position_x,
                position_y,
                aux_signal,
                target,
                uniforms: program.uniforms(),
            });

            if let Err(err) = result {
                log::warn!("Update pass for {} failed: {err}", dimension.name());
                self.state = DriverState::Idle;
                return Err(err);
            }
            self.last_passes.push(dimension);
        }

        pair.swap();
        self.state = DriverState::Idle;
        self.completed_steps += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ReferenceDevice;
    use crate::program::ProgramSynthesizer;
    use field_core::codec;
    use field_core::kernel::{self, StepInputs};
    use field_core::{BoundingBox, ColorMode, Integrator};
    use glam::Vec2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const ROTATION: &str = "v.x = -p.y;\nv.y = p.x;";

    fn rotation(p: Vec2) -> Vec2 {
        Vec2::new(-p.y, p.x)
    }

    fn setup(
        mode: ColorMode,
        integrator: Integrator,
    ) -> (ReferenceDevice, CompiledUpdateProgram, ParticleStatePair) {
        let mut device = ReferenceDevice::new(rotation);
        let program = ProgramSynthesizer::new(integrator)
            .build(&mut device, ROTATION, mode)
            .unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let pair =
            ParticleStatePair::allocate(&mut device, 25, &BoundingBox::default(), &mut rng)
                .unwrap();
        (device, program, pair)
    }

    fn positions(device: &ReferenceDevice, pair: &ParticleStatePair) -> Vec<Vec2> {
        let (x, y) = pair.read().bind_for_read().unwrap();
        let xs = device.values(x).unwrap();
        let ys = device.values(y).unwrap();
        xs.into_iter().zip(ys).map(|(x, y)| Vec2::new(x, y)).collect()
    }

    #[test]
    fn test_step_matches_host_kernel() {
        for integrator in [Integrator::Euler, Integrator::Rk4] {
            let (mut device, mut program, mut pair) = setup(ColorMode::Uniform, integrator);
            let context = SimulationContext {
                drop_probability: 0.0,
                ..Default::default()
            };
            let before = positions(&device, &pair);

            let mut driver = IntegrationDriver::new();
            driver
                .step(&mut device, &mut program, &mut pair, &context, 0.01, None)
                .unwrap();

            let inputs = StepInputs {
                time_step: 0.01,
                rand_seed: context.frame_seed,
                drop_probability: 0.0,
                bbox: context.bbox,
            };
            let after = positions(&device, &pair);
            for (i, (p, q)) in before.iter().zip(&after).enumerate() {
                let uv = Vec2::new((i % 5) as f32 + 0.5, (i / 5) as f32 + 0.5) / 5.0;
                let expected = kernel::step_particle(*p, uv, &inputs, integrator, rotation);
                assert_eq!(codec::decode(codec::encode(expected.x)), q.x);
                assert_eq!(codec::decode(codec::encode(expected.y)), q.y);
            }
        }
    }

    #[test]
    fn test_color_pass_only_when_needed() {
        let (mut device, mut program, mut pair) = setup(ColorMode::Uniform, Integrator::Euler);
        let mut driver = IntegrationDriver::new();
        let context = SimulationContext::default();

        driver
            .step(&mut device, &mut program, &mut pair, &context, 0.01, None)
            .unwrap();
        assert_eq!(driver.last_passes(), &[Dimension::X, Dimension::Y]);
        assert_eq!(device.draw_count(), 2);

        let (mut device, mut program, mut pair) = setup(ColorMode::Velocity, Integrator::Euler);
        driver
            .step(&mut device, &mut program, &mut pair, &context, 0.01, None)
            .unwrap();
        assert_eq!(
            driver.last_passes(),
            &[Dimension::X, Dimension::Y, Dimension::Color]
        );
        assert_eq!(driver.completed_steps(), 2);
    }

    #[test]
    fn test_failed_pass_does_not_swap() {
        let (mut device, mut program, mut pair) = setup(ColorMode::Uniform, Integrator::Euler);
        let read = pair.read().clone();
        device.fail_draw_after(1);

        let mut driver = IntegrationDriver::new();
        let result = driver.step(
            &mut device,
            &mut program,
            &mut pair,
            &SimulationContext::default(),
            0.01,
            None,
        );

        assert!(matches!(result, Err(DeviceError::Draw(_))));
        assert_eq!(pair.read(), &read);
        assert_eq!(driver.state(), DriverState::Idle);
        assert_eq!(driver.completed_steps(), 0);
    }

    #[test]
    fn test_no_readback_on_primary_path() {
        let (mut device, mut program, mut pair) = setup(ColorMode::Angle, Integrator::Rk4);
        let mut driver = IntegrationDriver::new();
        for _ in 0..5 {
            driver
                .step(
                    &mut device,
                    &mut program,
                    &mut pair,
                    &SimulationContext::default(),
                    0.01,
                    None,
                )
                .unwrap();
        }
        assert_eq!(device.readback_count(), 0);
    }
}
