//! Supervisor status snapshot.
//!
//! Written to the session's `status.json` after every iteration, replacing
//! the previous snapshot atomically. The schema is a stable external
//! interface; operators and tooling read this file while the loop runs.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::session::store::write_atomic;

use super::circuit::{CircuitBreaker, CircuitState};
use super::rate_limit::RateLimiter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub no_progress_count: u32,
    pub consecutive_errors: u32,
    pub permission_denials: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateSnapshot {
    pub calls_remaining: u32,
    pub max_calls: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// "running", "halted", or "idle".
    pub state: String,
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    pub circuit_breaker: CircuitSnapshot,
    pub rate_limit: RateSnapshot,
    pub halt_reason: Option<String>,
}

impl StatusSnapshot {
    pub fn capture(
        state: &str,
        iteration: u32,
        circuit: &CircuitBreaker,
        limiter: &RateLimiter,
        halt_reason: Option<String>,
    ) -> Self {
        Self {
            state: state.to_string(),
            iteration,
            timestamp: Utc::now(),
            circuit_breaker: CircuitSnapshot {
                state: circuit.state(),
                no_progress_count: circuit.no_progress_count,
                consecutive_errors: circuit.consecutive_errors,
                permission_denials: circuit.permission_denials,
            },
            rate_limit: RateSnapshot {
                calls_remaining: limiter.calls_remaining(),
                max_calls: limiter.max_calls(),
            },
            halt_reason,
        }
    }

    /// Replace `status.json` atomically.
    pub fn write(&self, path: &Path) -> Result<()> {
        write_atomic(path, &serde_json::to_vec_pretty(self)?)
    }

    pub fn read(path: &Path) -> Result<Self> {
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_to_stable_schema() {
        let dir = tempfile::tempdir().unwrap();
        let circuit = CircuitBreaker::default();
        let limiter = RateLimiter::new(dir.path().join("call_count"), 100, 3600);

        let snapshot = StatusSnapshot::capture("running", 4, &circuit, &limiter, None);
        let json = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(json["state"], "running");
        assert_eq!(json["iteration"], 4);
        assert_eq!(json["circuit_breaker"]["state"], "closed");
        assert_eq!(json["circuit_breaker"]["no_progress_count"], 0);
        assert_eq!(json["rate_limit"]["calls_remaining"], 100);
        assert_eq!(json["rate_limit"]["max_calls"], 100);
        assert_eq!(json["halt_reason"], serde_json::Value::Null);
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn write_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let circuit = CircuitBreaker::default();
        let limiter = RateLimiter::new(dir.path().join("call_count"), 100, 3600);

        StatusSnapshot::capture("running", 1, &circuit, &limiter, None)
            .write(&path)
            .unwrap();
        StatusSnapshot::capture("halted", 2, &circuit, &limiter, Some("max_loops".into()))
            .write(&path)
            .unwrap();

        let read = StatusSnapshot::read(&path).unwrap();
        assert_eq!(read.state, "halted");
        assert_eq!(read.iteration, 2);
        assert_eq!(read.halt_reason.as_deref(), Some("max_loops"));
    }
}
