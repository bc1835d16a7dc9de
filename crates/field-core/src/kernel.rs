//! Host mirror of the particle update kernel
//!
//! NOTE: The running simulation evaluates `update_kernel.wgsl` on the GPU. These functions are
//! the CPU reference used by the reference device and tests, and must stay in step with the
//! shader: same random hash, same drop rule, same integrators.

use crate::bbox::BoundingBox;
use crate::constants::POSITION_LIMIT;
use glam::Vec2;
use std::f32::consts::{PI, TAU};

/// Numerical scheme used to advance a particle by one step
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Integrator {
    #[default]
    Euler = 0,
    Rk4 = 1,
}

/// What the per-particle color value encodes
///
/// The numeric values are the ones persisted in settings.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorMode {
    #[default]
    Uniform = 1,
    Velocity = 2,
    Angle = 3,
}

impl ColorMode {
    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            1 => Some(Self::Uniform),
            2 => Some(Self::Velocity),
            3 => Some(Self::Angle),
            _ => None,
        }
    }

    pub fn index(self) -> u32 {
        self as u32
    }

    /// Whether particles need a color value computed from the field every step.
    pub fn needs_color_pass(self) -> bool {
        !matches!(self, Self::Uniform)
    }

    pub fn next(self) -> Self {
        match self {
            Self::Uniform => Self::Velocity,
            Self::Velocity => Self::Angle,
            Self::Angle => Self::Uniform,
        }
    }
}

/// Per-step inputs shared by every particle
#[derive(Debug, Clone, Copy)]
pub struct StepInputs {
    pub time_step: f32,
    pub rand_seed: f32,
    pub drop_probability: f32,
    pub bbox: BoundingBox,
}

/// `fract(sin(dot(co, (12.9898, 78.233))) * 43758.5453)`, in [0, 1] (1 only through rounding).
pub fn rand(co: Vec2) -> f32 {
    let t = co.dot(Vec2::new(12.9898, 78.233));
    let s = t.sin() * 43_758.547;
    s - s.floor()
}

/// Replace non-finite (or absurdly large) velocity components with zero.
pub fn sanitize(velocity: Vec2) -> Vec2 {
    let keep = |c: f32| if c.abs() < POSITION_LIMIT { c } else { 0.0 };
    Vec2::new(keep(velocity.x), keep(velocity.y))
}

/// Whether a position can be stored in a state texture.
pub fn is_representable(position: Vec2) -> bool {
    position.x.abs() < POSITION_LIMIT && position.y.abs() < POSITION_LIMIT
}

/// Advance `position` by one step of `time_step`.
pub fn advance(
    position: Vec2,
    time_step: f32,
    integrator: Integrator,
    velocity: impl Fn(Vec2) -> Vec2,
) -> Vec2 {
    match integrator {
        Integrator::Euler => position + time_step * velocity(position),
        Integrator::Rk4 => {
            let k1 = velocity(position);
            let k2 = velocity(position + 0.5 * time_step * k1);
            let k3 = velocity(position + 0.5 * time_step * k2);
            let k4 = velocity(position + time_step * k3);
            position + time_step / 6.0 * (k1 + 2.0 * k2 + 2.0 * k3 + k4)
        }
    }
}

/// New position of one particle, including the stochastic drop.
///
/// `uv` is the texel center in [0, 1]^2; together with the position and the per-frame seed it
/// decorrelates the random draws between particles.
pub fn step_particle(
    position: Vec2,
    uv: Vec2,
    inputs: &StepInputs,
    integrator: Integrator,
    velocity: impl Fn(Vec2) -> Vec2,
) -> Vec2 {
    let next = advance(position, inputs.time_step, integrator, velocity);

    let seed = (position + uv) * inputs.rand_seed;
    let dropped = inputs.drop_probability >= 1.0 || rand(seed) < inputs.drop_probability;
    if dropped || !is_representable(next) {
        let r = Vec2::new(rand(seed + Vec2::splat(1.3)), rand(seed + Vec2::splat(2.1)));
        return inputs.bbox.min() + (inputs.bbox.max() - inputs.bbox.min()) * r;
    }
    next
}

/// Scalar handed to the painting stage for one particle.
pub fn color_value(mode: ColorMode, velocity: Vec2, aux: f32) -> f32 {
    match mode {
        ColorMode::Uniform => 0.0,
        ColorMode::Velocity => (velocity.length() / aux.max(1.0e-6)).clamp(0.0, 1.0),
        ColorMode::Angle => (velocity.y.atan2(velocity.x) + PI) / TAU,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotation(p: Vec2) -> Vec2 {
        Vec2::new(-p.y, p.x)
    }

    fn inputs(drop_probability: f32) -> StepInputs {
        StepInputs {
            time_step: 0.01,
            rand_seed: 1.37,
            drop_probability,
            bbox: BoundingBox::new(-1.0, -1.0, 1.0, 1.0),
        }
    }

    #[test]
    fn test_rand_in_unit_interval() {
        for i in 0..1000 {
            let r = rand(Vec2::new(i as f32 * 0.37, -(i as f32) * 1.91));
            assert!((0.0..=1.0).contains(&r), "{r}");
        }
    }

    #[test]
    fn test_euler_step() {
        let next = advance(Vec2::new(1.0, 0.0), 0.5, Integrator::Euler, rotation);
        assert_eq!(next, Vec2::new(1.0, 0.5));
    }

    #[test]
    fn test_rk4_stays_on_circle_better_than_euler() {
        let mut euler = Vec2::new(1.0, 0.0);
        let mut rk4 = euler;
        for _ in 0..100 {
            euler = advance(euler, 0.05, Integrator::Euler, rotation);
            rk4 = advance(rk4, 0.05, Integrator::Rk4, rotation);
        }
        assert!((rk4.length() - 1.0).abs() < (euler.length() - 1.0).abs());
        assert!((rk4.length() - 1.0).abs() < 1.0e-4);
    }

    #[test]
    fn test_no_drop_advects() {
        let pos = Vec2::new(0.5, 0.25);
        let next = step_particle(pos, Vec2::splat(0.5), &inputs(0.0), Integrator::Euler, rotation);
        assert_eq!(next, advance(pos, 0.01, Integrator::Euler, rotation));
    }

    #[test]
    fn test_full_drop_relocates_inside_bbox() {
        let bbox = inputs(1.0).bbox;
        for i in 0..200 {
            let pos = Vec2::new(i as f32 * 0.01, 0.3);
            let next = step_particle(pos, Vec2::splat(0.5), &inputs(1.0), Integrator::Euler, rotation);
            assert_ne!(next, advance(pos, 0.01, Integrator::Euler, rotation));
            assert!(bbox.contains(next));
        }
    }

    #[test]
    fn test_non_finite_result_is_recycled() {
        let next = step_particle(
            Vec2::ZERO,
            Vec2::splat(0.5),
            &inputs(0.0),
            Integrator::Euler,
            |_| Vec2::new(f32::INFINITY, 0.0),
        );
        assert!(is_representable(next));
        assert!(!is_representable(Vec2::new(f32::NAN, 0.0)));
    }

    #[test]
    fn test_color_values() {
        assert_eq!(color_value(ColorMode::Uniform, Vec2::new(3.0, 4.0), 1.0), 0.0);
        assert_eq!(color_value(ColorMode::Velocity, Vec2::new(3.0, 4.0), 10.0), 0.5);
        assert_eq!(color_value(ColorMode::Velocity, Vec2::new(3.0, 4.0), 1.0), 1.0);
        assert_eq!(color_value(ColorMode::Angle, Vec2::new(-1.0, 0.0), 1.0), 1.0);
        assert_eq!(color_value(ColorMode::Angle, Vec2::new(1.0, 0.0), 1.0), 0.5);
    }

    #[test]
    fn test_color_mode_indices() {
        assert_eq!(ColorMode::from_index(2), Some(ColorMode::Velocity));
        assert_eq!(ColorMode::from_index(0), None);
        assert_eq!(ColorMode::from_index(4), None);
        assert_eq!(ColorMode::Angle.index(), 3);
        assert!(!ColorMode::Uniform.needs_color_pass());
        assert_eq!(ColorMode::Angle.next(), ColorMode::Uniform);
    }
}
