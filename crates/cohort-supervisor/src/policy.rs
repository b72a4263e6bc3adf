//! What to do between a worker's exit and its replacement.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Restart behaviour of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Replace every dead worker right away, forever. A crash loop is
    /// neither detected nor throttled.
    Immediate,
    /// Replace right away until more than `threshold` exits happen within
    /// `window`; past that, wait `base`, then twice as long for each
    /// further exit, up to `max`.
    Backoff {
        window: Duration,
        threshold: u32,
        base: Duration,
        max: Duration,
    },
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::Immediate
    }
}

impl RestartPolicy {
    /// A backoff policy with the usual delays (250 ms doubling to 30 s).
    pub fn backoff(window: Duration, threshold: u32) -> Self {
        Self::Backoff {
            window,
            threshold,
            base: Duration::from_millis(250),
            max: Duration::from_secs(30),
        }
    }
}

/// Applies a [`RestartPolicy`] to the stream of exits.
#[derive(Debug)]
pub(crate) struct RestartTracker {
    policy: RestartPolicy,
    recent: VecDeque<Instant>,
}

impl RestartTracker {
    pub(crate) fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            recent: VecDeque::new(),
        }
    }

    /// Records an exit at `now` and returns how long to wait before the
    /// replacement.
    pub(crate) fn record_exit(&mut self, now: Instant) -> Duration {
        let RestartPolicy::Backoff {
            window,
            threshold,
            base,
            max,
        } = self.policy
        else {
            return Duration::ZERO;
        };

        self.recent.push_back(now);
        while let Some(&oldest) = self.recent.front() {
            if now.duration_since(oldest) > window {
                self.recent.pop_front();
            } else {
                break;
            }
        }

        let exits = u32::try_from(self.recent.len()).unwrap_or(u32::MAX);
        if exits <= threshold {
            return Duration::ZERO;
        }

        let over = (exits - threshold - 1).min(16);
        let delay = base.saturating_mul(1 << over).min(max);
        tracing::error!(
            exits,
            window_secs = window.as_secs(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "workers are crash-looping, delaying replacement"
        );
        delay
    }
}
