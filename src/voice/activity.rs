//! Speech activity detection
//!
//! The user-speaking flag is set on the first frame whose RMS energy crosses
//! the threshold and only clears once a full release period passes without
//! another loud frame.

use std::time::Duration;

use tokio::time::Instant;

/// Speaking flag plus the last moment activity was observed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeechActivity {
    /// Whether the speaker is considered active
    pub active: bool,
    /// Last time activity was observed
    pub last_active: Option<Instant>,
}

impl SpeechActivity {
    /// Mark activity at `now`
    pub fn mark(&mut self, now: Instant) {
        self.active = true;
        self.last_active = Some(now);
    }

    /// Clear the flag, keeping the timestamp
    pub fn clear(&mut self) {
        self.active = false;
    }
}

/// Energy-based speech detector with release hysteresis
#[derive(Debug)]
pub struct SpeechDetector {
    threshold: f32,
    release: Duration,
    activity: SpeechActivity,
    deadline: Option<Instant>,
}

impl SpeechDetector {
    /// Create a detector
    #[must_use]
    pub const fn new(threshold: f32, release: Duration) -> Self {
        Self {
            threshold,
            release,
            activity: SpeechActivity {
                active: false,
                last_active: None,
            },
            deadline: None,
        }
    }

    /// Feed one frame's RMS level observed at `now`
    ///
    /// Returns `true` if the speaking flag changed.
    pub fn observe(&mut self, level: f32, now: Instant) -> bool {
        if level <= self.threshold {
            return false;
        }

        let changed = !self.activity.active;
        self.activity.mark(now);
        self.deadline = Some(now + self.release);

        if changed {
            tracing::trace!(level, "user speech started");
        }
        changed
    }

    /// Release the flag if the timer has elapsed by `now`
    ///
    /// Returns `true` exactly once per speaking period.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                self.activity.clear();
                tracing::trace!("user speech released");
                true
            }
            _ => false,
        }
    }

    /// Pending release deadline, if the flag is set
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the user is currently considered speaking
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.activity.active
    }

    /// Current activity record
    #[must_use]
    pub const fn activity(&self) -> SpeechActivity {
        self.activity
    }

    /// Cancel the timer and clear the flag
    pub fn reset(&mut self) {
        self.deadline = None;
        self.activity.clear();
    }
}

/// Calculate RMS energy of audio samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RELEASE: Duration = Duration::from_millis(500);

    #[test]
    fn rms_of_silence_and_tone() {
        assert!(rms(&[]) < f32::EPSILON);
        assert!(rms(&[0.0; 100]) < 0.001);
        assert!((rms(&[0.5; 100]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn single_loud_frame_sets_flag() {
        let mut detector = SpeechDetector::new(0.02, RELEASE);
        let t0 = Instant::now();

        assert!(detector.observe(0.1, t0));
        assert!(detector.is_active());
        assert_eq!(detector.deadline(), Some(t0 + RELEASE));
        assert_eq!(detector.activity().last_active, Some(t0));
    }

    #[test]
    fn quiet_frames_never_clear_the_flag() {
        let mut detector = SpeechDetector::new(0.02, RELEASE);
        let t0 = Instant::now();
        detector.observe(0.1, t0);

        assert!(!detector.observe(0.0, t0 + Duration::from_millis(100)));
        assert!(detector.is_active());
    }

    #[test]
    fn flag_clears_exactly_once_after_release() {
        let mut detector = SpeechDetector::new(0.02, RELEASE);
        let t0 = Instant::now();
        detector.observe(0.1, t0);

        assert!(!detector.poll(t0 + Duration::from_millis(499)));
        assert!(detector.is_active());

        assert!(detector.poll(t0 + RELEASE));
        assert!(!detector.is_active());
        assert!(!detector.poll(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn loud_frame_restarts_release_timer() {
        let mut detector = SpeechDetector::new(0.02, RELEASE);
        let t0 = Instant::now();
        detector.observe(0.1, t0);

        let t1 = t0 + Duration::from_millis(400);
        assert!(!detector.observe(0.1, t1));

        assert!(!detector.poll(t0 + RELEASE));
        assert!(detector.is_active());
        assert!(detector.poll(t1 + RELEASE));
    }

    #[test]
    fn reset_cancels_pending_release() {
        let mut detector = SpeechDetector::new(0.02, RELEASE);
        let t0 = Instant::now();
        detector.observe(0.1, t0);
        detector.reset();

        assert!(!detector.is_active());
        assert!(detector.deadline().is_none());
        assert!(!detector.poll(t0 + RELEASE));
    }
}
