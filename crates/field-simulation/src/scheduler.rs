//! Frame pacing

use field_core::{MAX_FRAME_RATIO, MAX_TIME_STEP, TARGET_FRAME_SECONDS};
use std::time::Instant;

/// Tracks whether a display frame has been requested and whether the scene is paused.
///
/// Pausing stops new requests but leaves an already requested frame in place, so the frame
/// in flight still runs.
#[derive(Debug, Clone, Default)]
pub struct FrameScheduler {
    paused: bool,
    pending: bool,
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for another frame. Returns true when a new request was recorded.
    pub fn request(&mut self) -> bool {
        if self.paused || self.pending {
            return false;
        }
        self.pending = true;
        true
    }

    /// Consume the pending request; false means this frame should not step.
    pub fn begin(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Returns true when resuming recorded a new frame request.
    pub fn set_paused(&mut self, paused: bool) -> bool {
        self.paused = paused;
        !paused && self.request()
    }
}

/// Scales the time step by how late a frame is relative to 60 Hz.
#[derive(Debug, Clone, Default)]
pub struct TimeStepCompensator {
    last_frame: Option<Instant>,
}

impl TimeStepCompensator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the previous frame time; the next frame uses a ratio of 1.
    pub fn reset(&mut self) {
        self.last_frame = None;
    }

    pub fn ratio(&mut self, now: Instant) -> f32 {
        let ratio = match self.last_frame {
            Some(last) => {
                let elapsed = now.saturating_duration_since(last).as_secs_f32();
                (elapsed / TARGET_FRAME_SECONDS).clamp(0.0, MAX_FRAME_RATIO)
            }
            None => 1.0,
        };
        self.last_frame = Some(now);
        ratio
    }

    /// Time step to use for a frame starting at `now`.
    pub fn corrected(&mut self, time_step: f32, now: Instant) -> f32 {
        (time_step * self.ratio(now)).clamp(-MAX_TIME_STEP, MAX_TIME_STEP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pause_keeps_in_flight_frame() {
        let mut scheduler = FrameScheduler::new();
        assert!(scheduler.request());
        assert!(!scheduler.request());

        scheduler.set_paused(true);
        assert!(scheduler.begin());
        assert!(!scheduler.request());
        assert!(!scheduler.begin());

        assert!(scheduler.set_paused(false));
        assert!(scheduler.begin());
    }

    #[test]
    fn test_first_frame_uses_base_step() {
        let mut compensator = TimeStepCompensator::new();
        assert_eq!(compensator.corrected(0.01, Instant::now()), 0.01);
    }

    #[test]
    fn test_slow_frames_scale_up_to_limit() {
        let mut compensator = TimeStepCompensator::new();
        let start = Instant::now();
        compensator.ratio(start);

        let ratio = compensator.ratio(start + Duration::from_secs_f32(2.0 * TARGET_FRAME_SECONDS));
        assert!((ratio - 2.0).abs() < 1.0e-3);

        let later = start + Duration::from_secs(10);
        assert_eq!(compensator.ratio(later), MAX_FRAME_RATIO);
    }

    #[test]
    fn test_corrected_step_is_clamped() {
        let mut compensator = TimeStepCompensator::new();
        let start = Instant::now();
        compensator.ratio(start);
        assert_eq!(compensator.corrected(0.9, start + Duration::from_secs(1)), MAX_TIME_STEP);
    }

    #[test]
    fn test_reset_restores_unit_ratio() {
        let mut compensator = TimeStepCompensator::new();
        let start = Instant::now();
        compensator.ratio(start);
        compensator.reset();
        assert_eq!(compensator.ratio(start + Duration::from_secs(3)), 1.0);
    }
}
