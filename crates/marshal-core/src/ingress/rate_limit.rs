//! Per-chat token-bucket rate limiting.
//!
//! Two caps per chat: a rolling per-minute cap and a burst cap over the
//! last five seconds. Timestamps are passed in so tests control the
//! clock.

use std::collections::HashMap;

const MINUTE_WINDOW: f64 = 60.0;
const BURST_WINDOW: f64 = 5.0;

/// Sliding-window rate limiter keyed by chat id.
#[derive(Debug)]
pub struct RateLimiter {
    per_minute: u32,
    burst: u32,
    buckets: HashMap<i64, Vec<f64>>,
}

impl RateLimiter {
    pub fn new(per_minute: u32, burst: u32) -> Self {
        Self {
            per_minute,
            burst,
            buckets: HashMap::new(),
        }
    }

    /// Whether a message from `chat_id` at `now_ts` (unix seconds) is
    /// admitted. Admitted messages consume a slot; rejected ones do not.
    pub fn allow(&mut self, chat_id: i64, now_ts: f64) -> bool {
        if self.per_minute == 0 {
            return true;
        }

        let entries = self.buckets.entry(chat_id).or_default();
        entries.retain(|ts| *ts >= now_ts - MINUTE_WINDOW);

        if entries.len() >= self.per_minute as usize {
            return false;
        }

        if self.burst > 0 {
            let burst_count = entries.iter().filter(|ts| **ts >= now_ts - BURST_WINDOW).count();
            if burst_count >= self.burst as usize {
                return false;
            }
        }

        entries.push(now_ts);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_per_minute_disables_limiting() {
        let mut limiter = RateLimiter::new(0, 0);
        for i in 0..100 {
            assert!(limiter.allow(1, i as f64));
        }
    }

    #[test]
    fn nth_message_allowed_nth_plus_one_rejected() {
        // Messages spaced outside the burst window so only the per-minute
        // cap applies.
        let mut limiter = RateLimiter::new(3, 0);
        assert!(limiter.allow(1, 0.0));
        assert!(limiter.allow(1, 10.0));
        assert!(limiter.allow(1, 20.0));
        assert!(!limiter.allow(1, 30.0));
    }

    #[test]
    fn window_slides_after_a_minute() {
        let mut limiter = RateLimiter::new(2, 0);
        assert!(limiter.allow(1, 0.0));
        assert!(limiter.allow(1, 1.0));
        assert!(!limiter.allow(1, 2.0));
        // The first message aged out of the window.
        assert!(limiter.allow(1, 61.0));
    }

    #[test]
    fn burst_cap_rejects_within_five_seconds() {
        let mut limiter = RateLimiter::new(20, 2);
        assert!(limiter.allow(1, 0.0));
        assert!(limiter.allow(1, 1.0));
        assert!(!limiter.allow(1, 2.0));
        // Outside the burst window, the per-minute budget still has room.
        assert!(limiter.allow(1, 6.0));
    }

    #[test]
    fn chats_have_independent_buckets() {
        let mut limiter = RateLimiter::new(1, 0);
        assert!(limiter.allow(1, 0.0));
        assert!(!limiter.allow(1, 1.0));
        assert!(limiter.allow(2, 1.0));
    }

    #[test]
    fn rejected_messages_do_not_consume_slots() {
        let mut limiter = RateLimiter::new(1, 0);
        assert!(limiter.allow(1, 0.0));
        assert!(!limiter.allow(1, 1.0));
        assert!(!limiter.allow(1, 2.0));
        // Exactly one admitted message ages out; the next is admitted.
        assert!(limiter.allow(1, 61.0));
    }
}
