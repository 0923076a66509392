use crate::db::Database;
use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Fixed-window counter keyed by `(username, action)`. Counters live in
/// their own table, not in the entity partitions, and carry a TTL twice the
/// window so eviction can never cut a live window short.
#[derive(Debug)]
pub struct RateLimiter {
    db: Arc<Database>,
    window_secs: u64,
    max_requests: u32,
}

impl RateLimiter {
    pub fn new(db: Arc<Database>, window_secs: u64, max_requests: u32) -> Self {
        Self {
            db,
            window_secs,
            max_requests,
        }
    }

    /// Count one attempt and fail with `RateLimited` once the window budget
    /// is spent. The failing attempt is still counted, so hammering a closed
    /// window does not shorten the wait.
    pub fn check(&self, username: &str, action: &str, now: DateTime<Utc>) -> AppResult<()> {
        let window = self.window_secs as i64;
        let start_secs = now.timestamp() - now.timestamp().rem_euclid(window);
        let window_start = DateTime::<Utc>::from_timestamp(start_secs, 0)
            .ok_or_else(|| AppError::Internal("window start out of range".to_string()))?;
        let expires_at = window_start + Duration::seconds(window * 2);

        let count = self
            .db
            .bump_window_counter(username, action, window_start, expires_at)?;
        if count > self.max_requests {
            tracing::warn!(username, action, count, "rate limit exhausted");
            return Err(AppError::RateLimited(format!(
                "too many {action} requests, retry later"
            )));
        }
        Ok(())
    }
}
