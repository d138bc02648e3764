//! Session state.
//!
//! A session owns its context, its loop detector, and its counters. Every
//! collaborator that mutates session state does so through the owning
//! `Session`; the store only sees snapshots.

pub mod store;

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::context::{ContextManager, IndexedMessage, LoopDetector};
use crate::events::AgentEvent;
use crate::safety::ApprovalPolicy;

pub use store::{FsSessionStore, LoadedSession, SessionStore};

/// Per-session counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub turn_count: u32,
    pub tool_calls: u32,
    pub tool_failures: u32,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// The durable header of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHeader {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub token_total: usize,
    pub policy: ApprovalPolicy,
    pub metrics: SessionMetrics,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub active_skills: Vec<String>,
}

/// A live session.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expiry_hours: i64,
    pub policy: ApprovalPolicy,
    pub metrics: SessionMetrics,
    pub metadata: HashMap<String, String>,
    pub active_skills: Vec<String>,
    pub context: ContextManager,
    pub detector: LoopDetector,
    /// Snapshot of the event ring taken at save time.
    pub event_history: Vec<AgentEvent>,
}

impl Session {
    /// Mint a new session with a fresh 128-bit id.
    pub fn new(config: &RuntimeConfig) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            last_activity_at: now,
            expiry_hours: config.session_expiry_hours,
            policy: config.approval_policy,
            metrics: SessionMetrics::default(),
            metadata: HashMap::new(),
            active_skills: Vec::new(),
            context: ContextManager::new(
                config.compaction_threshold_tokens,
                config.compaction_tail_window,
            ),
            detector: LoopDetector::default(),
            event_history: Vec::new(),
        }
    }

    pub fn header(&self) -> SessionHeader {
        SessionHeader {
            id: self.id.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            token_total: self.context.token_total(),
            policy: self.policy,
            metrics: self.metrics,
            metadata: self.metadata.clone(),
            active_skills: self.active_skills.clone(),
        }
    }

    /// Mark activity now.
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Whether the idle window has elapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.last_activity_at > Duration::hours(self.expiry_hours)
    }

    /// Fold a finished turn into the counters.
    pub fn record_turn(&mut self, tool_calls: u32, tool_failures: u32, usage: crate::ai::types::Usage) {
        self.metrics.turn_count += 1;
        self.metrics.tool_calls += tool_calls;
        self.metrics.tool_failures += tool_failures;
        self.metrics.prompt_tokens += usage.prompt_tokens;
        self.metrics.completion_tokens += usage.completion_tokens;
        self.touch();
    }
}

/// Immutable named snapshot of a session's mutable parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub taken_at: DateTime<Utc>,
    pub header: SessionHeader,
    pub messages: Vec<IndexedMessage>,
}

impl Checkpoint {
    pub fn capture(session: &Session, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            taken_at: Utc::now(),
            header: session.header(),
            messages: session.context.entries().to_vec(),
        }
    }

    /// Replace the session's mutable parts with this snapshot. In-memory and
    /// all-or-nothing: the session is only touched after the snapshot
    /// deserialized cleanly.
    pub fn restore_into(&self, session: &mut Session) {
        session.last_activity_at = self.header.last_activity_at;
        session.policy = self.header.policy;
        session.metrics = self.header.metrics;
        session.metadata = self.header.metadata.clone();
        session.active_skills = self.header.active_skills.clone();
        session.context.restore(self.messages.clone());
        session.detector.reset();
    }
}
