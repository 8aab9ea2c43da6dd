use std::time::Duration;

use crate::protocol::TimelineState;

/// Controller tick cadence. Hosts that can gate ticks to media frame
/// delivery call `ClientSession::tick_now` themselves instead.
pub const TICK_INTERVAL: Duration = Duration::from_millis(400);

/// Proportional and integral gains around the authoritative rate.
const KP: f64 = 0.25;
const KI: f64 = 0.05;

/// Accumulated drift·dt is clamped to this many seconds either way.
const INTEGRAL_CLAMP: f64 = 2.0;

/// Correction band around the authoritative rate, and the absolute bound
/// the corrected rate may never leave.
const RATE_BAND: f64 = 0.15;
const RATE_ABS_MIN: f64 = 0.5;
const RATE_ABS_MAX: f64 = 2.0;

/// A corrected rate is only applied when it moves by more than this.
const RATE_EPSILON: f64 = 0.005;

/// Hard-jump floor: errors beyond `max(1.2s, rtt_ms/250)` are seeked away
/// rather than steered away.
const HARD_JUMP_FLOOR_SECS: f64 = 1.2;

/// Corrections the controller asks the local player to make.
#[derive(Debug, Clone, PartialEq)]
pub enum DriftAction {
    /// Error too large for rate steering: jump straight to the target.
    HardSeek(f64),
    SetRate(f64),
    Play,
    Pause,
}

/// Everything one tick needs, gathered by the session.
pub struct TickInput<'a> {
    pub timeline: &'a TimelineState,
    /// Skew-corrected local clock, epoch ms.
    pub corrected_now_ms: f64,
    pub local_position: f64,
    pub local_playing: bool,
    pub media_ready: bool,
    pub rtt_ms: f64,
    /// Seconds since the previous tick.
    pub dt_secs: f64,
}

/// Converges follower playback to the authoritative timeline.
///
/// Runs only on followers; the authoritative participant is ground truth
/// and is never corrected.
#[derive(Debug, Default)]
pub struct DriftController {
    integral: f64,
    applied_rate: Option<f64>,
    /// Play/pause reconciliation is suppressed until this corrected time;
    /// set by local transitions so authoritative broadcasts racing local
    /// buffering events cannot thrash the player.
    guard_until_ms: f64,
    /// Armed when the room is already playing but local media is not yet
    /// ready; fires once, then disarms.
    pending_autostart: bool,
}

impl DriftController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a local play/pause/seek so reconciliation backs off for a
    /// window sized from the current rtt.
    pub fn note_local_transition(&mut self, corrected_now_ms: f64, rtt_ms: f64) {
        self.guard_until_ms = corrected_now_ms + guard_window_ms(rtt_ms);
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn tick(&mut self, input: &TickInput) -> Vec<DriftAction> {
        let mut actions = Vec::new();
        let timeline = input.timeline;
        let target = timeline.target(input.corrected_now_ms);

        // Play/pause reconciliation first; position steering is pointless
        // while the play states disagree.
        if self.reconcile_play_state(input, &mut actions) {
            return actions;
        }

        let drift = input.local_position - target;
        let threshold = HARD_JUMP_FLOOR_SECS.max(input.rtt_ms / 250.0);

        if drift.abs() > threshold {
            // Reset the integral across the discontinuity to prevent windup.
            self.integral = 0.0;
            self.note_local_transition(input.corrected_now_ms, input.rtt_ms);
            tracing::debug!(drift, target, "hard jump");
            actions.push(DriftAction::HardSeek(target));
            return actions;
        }

        if !(timeline.is_playing && input.local_playing) {
            return actions;
        }

        self.integral =
            (self.integral + drift * input.dt_secs).clamp(-INTEGRAL_CLAMP, INTEGRAL_CLAMP);

        let authoritative = timeline.playback_rate;
        let corrected = authoritative - KP * drift - KI * self.integral;
        let next_rate = corrected
            .clamp(authoritative - RATE_BAND, authoritative + RATE_BAND)
            .clamp(RATE_ABS_MIN, RATE_ABS_MAX);

        let current = self.applied_rate.unwrap_or(authoritative);
        if (next_rate - current).abs() > RATE_EPSILON {
            self.applied_rate = Some(next_rate);
            tracing::debug!(drift, next_rate, "rate correction");
            actions.push(DriftAction::SetRate(next_rate));
        }

        actions
    }

    /// Returns true when a play/pause transition was emitted (or is still
    /// pending readiness), in which case position steering waits a tick.
    fn reconcile_play_state(&mut self, input: &TickInput, actions: &mut Vec<DriftAction>) -> bool {
        let want_playing = input.timeline.is_playing;

        if self.pending_autostart {
            if !want_playing {
                self.pending_autostart = false;
            } else if input.media_ready {
                self.pending_autostart = false;
                actions.push(DriftAction::Play);
                return true;
            } else {
                return true;
            }
        }

        if want_playing == input.local_playing {
            return false;
        }
        if input.corrected_now_ms < self.guard_until_ms {
            return true;
        }

        if want_playing {
            if input.media_ready {
                actions.push(DriftAction::Play);
            } else {
                self.pending_autostart = true;
            }
        } else {
            actions.push(DriftAction::Pause);
        }
        true
    }
}

fn guard_window_ms(rtt_ms: f64) -> f64 {
    (2.0 * rtt_ms + 200.0).max(300.0)
}
