use anyhow::Result;
use parking_lot::Mutex;
use std::time::Instant;

/// Local playback surface the drift controller steers.
///
/// The embedding player (libVLC, a browser element, an mpv handle) provides
/// this; the controller only ever reads position/readiness and issues
/// play/pause/seek/rate.
pub trait MediaHandle: Send + Sync {
    /// Current playback position in seconds.
    fn position(&self) -> f64;
    fn is_playing(&self) -> bool;
    /// True once minimum buffered readiness is reached.
    fn is_ready(&self) -> bool;
    fn play(&self) -> Result<()>;
    fn pause(&self) -> Result<()>;
    fn seek(&self, position: f64) -> Result<()>;
    fn set_rate(&self, rate: f64) -> Result<()>;
    fn rate(&self) -> f64;
}

/// Local reaction-camera capture handle consumed by the peer mesh.
pub trait CameraCapture: Send + Sync {
    /// Toggles the outgoing track without releasing the device.
    fn set_enabled(&self, enabled: bool);
    /// Releases the device. Must be called on every session exit path.
    fn stop(&self);
}

/// Headless playback that integrates position at the applied rate.
///
/// Used by the headless binary and by controller tests as a deterministic
/// stand-in for a real player.
pub struct SimulatedMedia {
    inner: Mutex<SimState>,
}

struct SimState {
    position: f64,
    rate: f64,
    playing: bool,
    ready: bool,
    anchored_at: Instant,
}

impl SimulatedMedia {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SimState {
                position: 0.0,
                rate: 1.0,
                playing: false,
                ready: true,
                anchored_at: Instant::now(),
            }),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.inner.lock().ready = ready;
    }
}

impl Default for SimulatedMedia {
    fn default() -> Self {
        Self::new()
    }
}

impl SimState {
    /// Folds elapsed wall time into `position` and re-anchors.
    fn settle(&mut self) {
        let now = Instant::now();
        if self.playing {
            self.position += now.duration_since(self.anchored_at).as_secs_f64() * self.rate;
        }
        self.anchored_at = now;
    }
}

impl MediaHandle for SimulatedMedia {
    fn position(&self) -> f64 {
        let mut state = self.inner.lock();
        state.settle();
        state.position
    }

    fn is_playing(&self) -> bool {
        self.inner.lock().playing
    }

    fn is_ready(&self) -> bool {
        self.inner.lock().ready
    }

    fn play(&self) -> Result<()> {
        let mut state = self.inner.lock();
        state.settle();
        state.playing = true;
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        let mut state = self.inner.lock();
        state.settle();
        state.playing = false;
        Ok(())
    }

    fn seek(&self, position: f64) -> Result<()> {
        let mut state = self.inner.lock();
        state.settle();
        state.position = position.max(0.0);
        Ok(())
    }

    fn set_rate(&self, rate: f64) -> Result<()> {
        let mut state = self.inner.lock();
        state.settle();
        state.rate = rate;
        Ok(())
    }

    fn rate(&self) -> f64 {
        self.inner.lock().rate
    }
}
