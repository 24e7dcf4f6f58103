//! Debounced "assistant is speaking" flag
//!
//! The flag turns on as soon as audio is scheduled and turns off once the
//! playback timeline has drained and a short tail has passed. Only one
//! pending timer exists at a time; scheduling more audio replaces it.

use std::time::Duration;

use tokio::time::Instant;

/// Tail kept after the last buffer ends before the flag clears
pub const SPEAKING_TAIL: Duration = Duration::from_millis(250);

/// Single pending deadline, replaced on every arm
#[derive(Debug, Default, Clone, Copy)]
pub struct DebounceTimer {
    deadline: Option<Instant>,
}

impl DebounceTimer {
    /// Arm the timer `after` from now, cancelling any pending deadline
    pub fn arm(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    /// Cancel any pending deadline
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Pending deadline, if armed
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether a deadline is pending
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }
}

/// Tracks whether assistant audio is audibly playing
#[derive(Debug, Default)]
pub struct SpeakingDetector {
    speaking: bool,
    timer: DebounceTimer,
}

impl SpeakingDetector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Audio was scheduled and `remaining` plays out before the timeline drains
    ///
    /// Returns `true` if the flag changed.
    pub fn on_scheduled(&mut self, remaining: Duration) -> bool {
        let changed = !self.speaking;
        self.speaking = true;
        self.timer.arm(remaining + SPEAKING_TAIL);
        changed
    }

    /// The debounce deadline passed
    ///
    /// `remaining` is what is still queued on the playback timeline. If audio
    /// was scheduled after the timer was armed the timer is re-armed instead
    /// of clearing. Returns `true` if the flag changed.
    pub fn on_timer_fired(&mut self, remaining: Duration) -> bool {
        self.timer.cancel();
        if !self.speaking {
            return false;
        }
        if remaining > Duration::ZERO {
            self.timer.arm(remaining + SPEAKING_TAIL);
            return false;
        }
        self.speaking = false;
        true
    }

    /// Drop the flag immediately and cancel the pending timer
    ///
    /// Returns `true` if the flag changed.
    pub fn clear(&mut self) -> bool {
        self.timer.cancel();
        std::mem::replace(&mut self.speaking, false)
    }

    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// When the pending timer fires
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }
}
