//! Adaptive frame pacing.
//!
//! Netplay manages its own throttle because the simulation speed must
//! track the peers, not the host's vsync. Timesync corrections from the
//! rollback engine are spread over three quarters of the reporting
//! interval, then speed snaps back to 100%.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::constants::THROTTLE_SLEEP_SLICE;
use crate::rollback::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleAction {
    /// The frame deadline is still ahead; sleep toward it in slices.
    Sleep,
    /// We fell behind by whole frames; the backlog was dropped and the
    /// transport should be drained once without blocking.
    SkipBacklog,
}

#[derive(Debug)]
pub struct FramePacer {
    nominal_hz: f64,
    target_speed: f64,
    frame_period: Duration,
    next_frame_time: Instant,
    next_recovery_frame: Frame,
}

impl FramePacer {
    pub fn new(nominal_hz: f64) -> Self {
        let mut pacer = Self {
            nominal_hz: nominal_hz.max(1.0),
            target_speed: 1.0,
            frame_period: Duration::from_secs(1),
            next_frame_time: Instant::now(),
            next_recovery_frame: -1,
        };
        pacer.reset();
        pacer
    }

    /// Back to 100% speed with a fresh deadline; called whenever a new
    /// rollback session starts.
    pub fn reset(&mut self) {
        self.target_speed = 1.0;
        self.next_recovery_frame = -1;
        self.update_period();
        self.next_frame_time = Instant::now() + self.frame_period;
    }

    pub fn target_speed(&self) -> f64 {
        self.target_speed
    }

    pub fn frame_period(&self) -> Duration {
        self.frame_period
    }

    fn update_period(&mut self) {
        self.frame_period =
            Duration::from_secs_f64(1.0 / (self.nominal_hz * self.target_speed));
    }

    /// Apply a timesync report: spread the correction over
    /// `0.75 × interval` frames, then recover.
    pub fn handle_time_sync(&mut self, frame_delta: f32, interval: u32, current_frame: Frame) {
        if frame_delta.abs() < 1.0 {
            return;
        }

        let period = self.frame_period.as_secs_f64();
        let total_time = frame_delta as f64 * period / 4.0;
        let recovery_frames = interval as f64 * 0.75;
        let added_time_per_frame = -(total_time / recovery_frames);

        self.target_speed = (period + added_time_per_frame) / period;
        self.next_recovery_frame = current_frame + recovery_frames.ceil() as Frame;
        self.update_period();

        debug!(
            frames = frame_delta,
            target_speed = self.target_speed,
            recovery_frame = self.next_recovery_frame,
            "timesync correction"
        );
    }

    /// Advance the frame deadline and decide how to spend the wait. When
    /// we are already late, the lost frames are dropped from the schedule
    /// instead of being run in a burst.
    pub fn begin_throttle(&mut self, current_frame: Frame, now: Instant) -> ThrottleAction {
        if self.target_speed != 1.0 && current_frame >= self.next_recovery_frame {
            self.target_speed = 1.0;
            self.update_period();
            debug!(frame = current_frame, "timesync recovery, back to 100%");
        }

        self.next_frame_time += self.frame_period;
        if now > self.next_frame_time {
            let behind = now - self.next_frame_time;
            let periods = behind.as_nanos() / self.frame_period.as_nanos().max(1);
            self.next_frame_time += self.frame_period * periods as u32;
            return ThrottleAction::SkipBacklog;
        }
        ThrottleAction::Sleep
    }

    /// Deadline for the next short poll-sleep, or `None` once the frame
    /// deadline has been reached.
    pub fn sleep_deadline(&self, now: Instant) -> Option<Instant> {
        if now >= self.next_frame_time {
            return None;
        }
        Some((now + THROTTLE_SLEEP_SLICE).min(self.next_frame_time))
    }
}
