use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Window over which [`RateLimiter`] counts sends.
pub const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Sliding-window cap on how often one client may send.
#[derive(Debug)]
pub struct RateLimiter {
    max: usize,
    window: Duration,
    sent: VecDeque<Instant>,
}

impl RateLimiter {
    /// Allows `max` sends per `window`. A `max` of zero means no limit, and
    /// there is nothing to build.
    pub fn new(max: u32, window: Duration) -> Option<Self> {
        if max == 0 {
            return None;
        }
        let max = max as usize;
        Some(Self {
            max,
            window,
            sent: VecDeque::with_capacity(max),
        })
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.sent.front() {
            if now.duration_since(*oldest) < self.window {
                break;
            }
            self.sent.pop_front();
        }

        if self.sent.len() >= self.max {
            return false;
        }
        self.sent.push_back(now);
        true
    }
}
