//! Defaults and limits shared by the engine and its hosts

/// Integration time step used when nothing else is configured
pub const DEFAULT_TIME_STEP: f32 = 0.01;

/// Particle count used on first start
pub const DEFAULT_PARTICLE_COUNT: u32 = 10_000;

/// Per-step chance that a particle is recycled to a random position
pub const DEFAULT_DROP_PROBABILITY: f32 = 0.009;

/// How much of the previous frame survives each frame (0..1)
pub const DEFAULT_FADE_OUT: f32 = 0.998;

/// Speed that maps to full intensity in velocity color mode
pub const DEFAULT_COLOR_AUX: f32 = 1.0;

/// Largest side of a particle-state texture
pub const MAX_STATE_RESOLUTION: u32 = 2048;

/// Largest particle count a single state texture can hold
pub const MAX_PARTICLE_COUNT: u32 = MAX_STATE_RESOLUTION * MAX_STATE_RESOLUTION;

/// Bounding box corners are rounded to this many decimal digits
pub const BBOX_DECIMALS: i32 = 4;

/// Frame duration the time step is calibrated for (60 Hz)
pub const TARGET_FRAME_SECONDS: f32 = 1.0 / 60.0;

/// Upper clamp of the elapsed / target frame ratio
pub const MAX_FRAME_RATIO: f32 = 4.0;

/// Largest magnitude a compensated time step may reach
pub const MAX_TIME_STEP: f32 = 1.0;

/// Positions at or beyond this magnitude (or non-finite) are recycled
pub const POSITION_LIMIT: f32 = 1.0e30;

/// Number of `u_<name>` scalars a vector field expression may declare
pub const MAX_CUSTOM_UNIFORMS: usize = 8;
