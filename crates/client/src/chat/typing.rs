// Typing signals.
//
// Outbound: `typing=true` goes out at most once per emit window while
// keystrokes continue; `typing=false` follows one stop delay after the last
// keystroke. The stop timer is a single deadline that each keystroke
// pushes back, so it can never fire twice.
//
// Inbound: a remote `typing=true` lights the indicator until
// `now + window`. It goes dark on its own even if `typing=false` is lost.
//
// Uses tokio's `Instant` so paused-clock tests drive the timers.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::ChatConfig;

/// What the caller should emit after feeding the outbound signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingEmit {
    Started,
    Stopped,
}

impl TypingEmit {
    pub fn is_typing(self) -> bool {
        matches!(self, Self::Started)
    }
}

#[derive(Debug, Clone)]
pub struct TypingSignal {
    emit_window: Duration,
    stop_delay: Duration,
    last_emit: Option<Instant>,
    stop_deadline: Option<Instant>,
}

impl TypingSignal {
    pub fn new(emit_window: Duration, stop_delay: Duration) -> Self {
        Self { emit_window, stop_delay, last_emit: None, stop_deadline: None }
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self::new(config.typing_emit_window(), config.typing_stop_delay())
    }

    /// Whether a `typing=false` is still owed.
    pub fn is_armed(&self) -> bool {
        self.stop_deadline.is_some()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.stop_deadline
    }

    pub fn keystroke(&mut self) -> Option<TypingEmit> {
        self.keystroke_at(Instant::now())
    }

    /// Register a keystroke. Returns `Started` when a `typing=true` is due.
    pub fn keystroke_at(&mut self, now: Instant) -> Option<TypingEmit> {
        self.stop_deadline = Some(now + self.stop_delay);
        let due = match self.last_emit {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.emit_window,
        };
        if due {
            self.last_emit = Some(now);
            Some(TypingEmit::Started)
        } else {
            None
        }
    }

    pub fn poll(&mut self) -> Option<TypingEmit> {
        self.poll_at(Instant::now())
    }

    /// Fire the stop timer if its deadline has passed.
    pub fn poll_at(&mut self, now: Instant) -> Option<TypingEmit> {
        match self.stop_deadline {
            Some(deadline) if deadline <= now => Some(self.reset()),
            _ => None,
        }
    }

    /// Stop immediately (message sent, room left). `Stopped` if one was owed.
    pub fn cancel(&mut self) -> Option<TypingEmit> {
        self.stop_deadline.is_some().then(|| self.reset())
    }

    fn reset(&mut self) -> TypingEmit {
        self.stop_deadline = None;
        self.last_emit = None;
        TypingEmit::Stopped
    }
}

/// Remote typing indicator for the active room.
#[derive(Debug, Clone)]
pub struct TypingIndicator {
    window: Duration,
    their_typing_until: Option<Instant>,
}

impl TypingIndicator {
    pub fn new(window: Duration) -> Self {
        Self { window, their_typing_until: None }
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self::new(config.remote_typing_window())
    }

    pub fn their_typing_until(&self) -> Option<Instant> {
        self.their_typing_until
    }

    pub fn on_remote_at(&mut self, is_typing: bool, now: Instant) {
        self.their_typing_until = is_typing.then(|| now + self.window);
    }

    pub fn is_typing(&self) -> bool {
        self.is_typing_at(Instant::now())
    }

    pub fn is_typing_at(&self, now: Instant) -> bool {
        self.their_typing_until.is_some_and(|until| until > now)
    }

    /// Clear an elapsed indicator. Returns true if it just went dark.
    pub fn expire_at(&mut self, now: Instant) -> bool {
        match self.their_typing_until {
            Some(until) if until <= now => {
                self.their_typing_until = None;
                true
            }
            _ => false,
        }
    }
}
