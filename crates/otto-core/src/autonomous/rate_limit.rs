//! Persisted rate limiting for LLM calls.
//!
//! One bucket per session: `max_calls` over a rolling window. The counter is
//! written to the session's `call_count` file on every admit so a restart
//! preserves quota. All timestamps are UTC wall-clock.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::session::store::write_atomic;

/// On-disk bucket state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateBucket {
    pub window_start: DateTime<Utc>,
    pub calls_used: u32,
}

pub struct RateLimiter {
    path: PathBuf,
    max_calls: u32,
    window: Duration,
    bucket: RateBucket,
}

impl RateLimiter {
    /// Load persisted state from `path`, or start a fresh window.
    pub fn new(path: PathBuf, max_calls: u32, window_secs: u64) -> Self {
        let bucket = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_else(|| RateBucket {
                window_start: Utc::now(),
                calls_used: 0,
            });

        Self {
            path,
            max_calls,
            window: Duration::seconds(window_secs as i64),
            bucket,
        }
    }

    pub fn max_calls(&self) -> u32 {
        self.max_calls
    }

    /// Admit one call at `now`. Rolls the window first when it has elapsed;
    /// persists the new count on admission.
    pub fn admit_at(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if now - self.bucket.window_start >= self.window {
            self.bucket = RateBucket {
                window_start: now,
                calls_used: 0,
            };
        }

        if self.bucket.calls_used >= self.max_calls {
            debug!(
                calls_used = self.bucket.calls_used,
                max = self.max_calls,
                "rate limit reached"
            );
            return Ok(false);
        }

        self.bucket.calls_used += 1;
        self.persist()?;
        Ok(true)
    }

    pub fn admit(&mut self) -> Result<bool> {
        self.admit_at(Utc::now())
    }

    pub fn calls_remaining_at(&self, now: DateTime<Utc>) -> u32 {
        if now - self.bucket.window_start >= self.window {
            return self.max_calls;
        }
        self.max_calls.saturating_sub(self.bucket.calls_used)
    }

    pub fn calls_remaining(&self) -> u32 {
        self.calls_remaining_at(Utc::now())
    }

    pub fn bucket(&self) -> &RateBucket {
        &self.bucket
    }

    fn persist(&self) -> Result<()> {
        write_atomic(&self.path, &serde_json::to_vec_pretty(&self.bucket)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_calls: u32) -> (RateLimiter, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let limiter = RateLimiter::new(dir.path().join("call_count"), max_calls, 3600);
        (limiter, dir)
    }

    #[test]
    fn admits_up_to_max_then_refuses() {
        let (mut limiter, _dir) = limiter(3);
        let now = Utc::now();

        for _ in 0..3 {
            assert!(limiter.admit_at(now).unwrap());
        }
        assert!(!limiter.admit_at(now).unwrap());
        assert_eq!(limiter.calls_remaining_at(now), 0);
    }

    #[test]
    fn window_rollover_resets_bucket() {
        let (mut limiter, _dir) = limiter(3);
        let now = Utc::now();

        for _ in 0..3 {
            limiter.admit_at(now).unwrap();
        }
        assert!(!limiter.admit_at(now).unwrap());

        let later = now + Duration::hours(1) + Duration::seconds(1);
        assert!(limiter.admit_at(later).unwrap());
        assert_eq!(limiter.bucket().calls_used, 1);
    }

    #[test]
    fn quota_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("call_count");
        let now = Utc::now();

        {
            let mut limiter = RateLimiter::new(path.clone(), 3, 3600);
            limiter.admit_at(now).unwrap();
            limiter.admit_at(now).unwrap();
            limiter.admit_at(now).unwrap();
        }

        // New process, same file: quota is still spent.
        let mut limiter = RateLimiter::new(path, 3, 3600);
        assert_eq!(limiter.bucket().calls_used, 3);
        assert!(!limiter.admit_at(now).unwrap());
    }

    #[test]
    fn call_count_file_matches_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("call_count");
        let mut limiter = RateLimiter::new(path.clone(), 5, 3600);
        limiter.admit().unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(raw.get("window_start").is_some());
        assert_eq!(raw["calls_used"], 1);
    }
}
