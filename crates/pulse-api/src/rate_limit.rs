//! Per-event-type rate limiter.
//!
//! Keeps the last accepted instant for each event type and rejects a second
//! event of the same type arriving within the configured spacing. Rejected
//! events do not refresh the timestamp.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

pub struct EventRateLimiter {
    /// Minimum spacing between two accepted events of the same type.
    min_interval: Duration,
    /// Last accepted instant per event type.
    last_seen: Mutex<HashMap<String, Instant>>,
}

impl EventRateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Try to acquire a permit for `event_type`. Returns true if allowed.
    pub fn try_acquire(&self, event_type: &str) -> bool {
        let now = Instant::now();
        let mut last_seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(prev) = last_seen.get(event_type) {
            if now.duration_since(*prev) < self.min_interval {
                return false;
            }
        }
        last_seen.insert(event_type.to_string(), now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_same_type_within_interval_is_rejected() {
        let limiter = EventRateLimiter::new(Duration::from_millis(1000));
        assert!(limiter.try_acquire("tool_call"));
        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!limiter.try_acquire("tool_call"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_again_after_interval() {
        let limiter = EventRateLimiter::new(Duration::from_millis(1000));
        assert!(limiter.try_acquire("cron_fire"));
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(limiter.try_acquire("cron_fire"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_types_are_independent() {
        let limiter = EventRateLimiter::new(Duration::from_millis(1000));
        assert!(limiter.try_acquire("tool_call"));
        assert!(limiter.try_acquire("message_sent"));
        assert!(!limiter.try_acquire("tool_call"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_does_not_extend_window() {
        let limiter = EventRateLimiter::new(Duration::from_millis(1000));
        assert!(limiter.try_acquire("error"));
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(!limiter.try_acquire("error"));
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(limiter.try_acquire("error"));
    }
}
