//! Clips
//!
//! A clip is a triggerable, time-bound entity attached to a channel slot.
//! The engine only observes `trigger` and `stop`; what a running clip does
//! to its channel is the host's business.

/// A triggerable clip in a channel's scene slot.
pub struct Clip {
    label: String,
    running: bool,
    elapsed_ms: f64,
}

impl Clip {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            running: false,
            elapsed_ms: 0.0,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Start the clip from the beginning.
    pub fn trigger(&mut self) {
        self.running = true;
        self.elapsed_ms = 0.0;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed_ms
    }

    /// Advance clip time; a no-op while stopped.
    pub fn tick(&mut self, delta_ms: f64) {
        if self.running {
            self.elapsed_ms += delta_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_restarts_time() {
        let mut clip = Clip::new("Intro");
        clip.trigger();
        clip.tick(100.0);
        assert!(clip.is_running());
        assert_eq!(clip.elapsed_ms(), 100.0);

        clip.trigger();
        assert_eq!(clip.elapsed_ms(), 0.0);
    }

    #[test]
    fn test_stopped_clip_does_not_advance() {
        let mut clip = Clip::new("Intro");
        clip.tick(100.0);
        assert_eq!(clip.elapsed_ms(), 0.0);
        clip.trigger();
        clip.stop();
        clip.tick(100.0);
        assert_eq!(clip.elapsed_ms(), 0.0);
    }
}
