//! In-process fixed-window rate limiting, keyed `user:action`. State is
//! ephemeral: losing the counters on restart is acceptable, correctness never
//! depends on them. Multi-replica deployments should use the redis-backed
//! counters instead (`store-redis` feature).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::LexamError;

/// Per-minute caps for each rate-limited action. `None` disables the cap.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ActionLimitsConfig {
    pub exam_starts_per_minute: Option<u32>,
    pub submits_per_minute: Option<u32>,
    pub checkouts_per_minute: Option<u32>,
}

impl ActionLimitsConfig {
    pub fn for_action(&self, action: &str) -> Option<u32> {
        match action {
            "exam_start" => self.exam_starts_per_minute,
            "submit" => self.submits_per_minute,
            "checkout" => self.checkouts_per_minute,
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    usage: HashMap<String, MinuteUsage>,
    last_gc_minute: u64,
}

#[derive(Debug, Clone)]
struct MinuteUsage {
    minute: u64,
    count: u32,
}

impl RateLimiter {
    pub fn check_and_consume(
        &mut self,
        user_id: &str,
        action: &str,
        per_minute: Option<u32>,
        minute: u64,
    ) -> Result<(), LexamError> {
        let scope = format!("{user_id}:{action}");
        let Some(per_minute) = per_minute else {
            // If the cap is disabled for this scope, stop retaining per-minute
            // state for it.
            self.usage.remove(&scope);
            return Ok(());
        };

        if minute != self.last_gc_minute {
            // Keep only the active minute bucket. Older/future buckets are stale.
            self.usage.retain(|_, usage| usage.minute == minute);
            self.last_gc_minute = minute;
        }

        let usage = self
            .usage
            .entry(scope)
            .or_insert(MinuteUsage { minute, count: 0 });

        if usage.minute != minute {
            usage.minute = minute;
            usage.count = 0;
        }

        let next = usage.count.saturating_add(1);
        if per_minute == 0 || next > per_minute {
            return Err(LexamError::RateLimited {
                limit: format!("{action}>{per_minute}/min"),
            });
        }

        usage.count = next;
        Ok(())
    }
}

pub fn current_minute() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() / 60)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_caps_and_resets_next_minute() {
        let mut limiter = RateLimiter::default();

        limiter
            .check_and_consume("u1", "exam_start", Some(2), 100)
            .unwrap();
        limiter
            .check_and_consume("u1", "exam_start", Some(2), 100)
            .unwrap();
        let blocked = limiter.check_and_consume("u1", "exam_start", Some(2), 100);
        assert!(matches!(blocked, Err(LexamError::RateLimited { .. })));

        limiter
            .check_and_consume("u1", "exam_start", Some(2), 101)
            .unwrap();
    }

    #[test]
    fn scopes_are_independent_per_user_and_action() {
        let mut limiter = RateLimiter::default();

        limiter
            .check_and_consume("u1", "exam_start", Some(1), 100)
            .unwrap();
        limiter
            .check_and_consume("u2", "exam_start", Some(1), 100)
            .unwrap();
        limiter
            .check_and_consume("u1", "submit", Some(1), 100)
            .unwrap();

        let blocked = limiter.check_and_consume("u1", "exam_start", Some(1), 100);
        assert!(matches!(blocked, Err(LexamError::RateLimited { .. })));
    }

    #[test]
    fn gc_keeps_only_current_minute_after_clock_rollback() {
        let mut limiter = RateLimiter::default();

        limiter
            .check_and_consume("u1", "exam_start", Some(10), 100)
            .unwrap();
        limiter
            .check_and_consume("u2", "exam_start", Some(10), 99)
            .unwrap();

        assert_eq!(limiter.usage.len(), 1);
        assert_eq!(
            limiter.usage.get("u2:exam_start").map(|usage| usage.minute),
            Some(99)
        );
    }

    #[test]
    fn disabled_cap_drops_stale_usage_for_scope() {
        let mut limiter = RateLimiter::default();

        limiter
            .check_and_consume("u1", "exam_start", Some(5), 42)
            .unwrap();
        assert!(limiter.usage.contains_key("u1:exam_start"));

        limiter
            .check_and_consume("u1", "exam_start", None, 42)
            .unwrap();
        assert!(!limiter.usage.contains_key("u1:exam_start"));
    }

    #[test]
    fn zero_cap_always_blocks() {
        let mut limiter = RateLimiter::default();
        let blocked = limiter.check_and_consume("u1", "submit", Some(0), 7);
        assert!(matches!(blocked, Err(LexamError::RateLimited { .. })));
    }
}
