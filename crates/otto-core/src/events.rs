//! Canonical event stream from the engine to its consumers.
//!
//! `AgentEvent` is the single protocol every consumer (CLI, API projection)
//! sees. Events are totally ordered per emitter by sequence number. Fan-out is
//! broadcast with a bounded per-consumer backlog: a slow consumer loses events
//! from the tail of its own queue and receives one `backpressure` marker; the
//! engine never blocks on a consumer.
//!
//! The last [`HISTORY_CAPACITY`] events are retained in a ring so a late
//! subscriber can replay from a sequence number while it is still buffered.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events retained for replay.
pub const HISTORY_CAPACITY: usize = 100;

/// Per-consumer broadcast backlog before the tail is dropped.
const CHANNEL_CAPACITY: usize = 256;

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Completed,
    ToolBudgetExhausted,
    Cancelled,
    Error,
}

/// Discrete engine state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEventKind {
    /// A turn started processing.
    AgentStart,

    /// Text content delta from the model.
    TextDelta { delta: String },

    /// The assistant text for the turn is complete.
    TextComplete { text: String },

    /// The model emitted a tool call and execution is starting.
    ToolCallStart { id: String, name: String },

    /// Tool execution finished. `output` is the full result, delivered here
    /// exactly once; the context receives the truncated form.
    ToolCallComplete {
        id: String,
        name: String,
        output: String,
        is_error: bool,
    },

    /// A non-fatal or fatal error surfaced to consumers.
    AgentError {
        error: String,
        code: String,
        trace_id: String,
    },

    /// The turn finished.
    AgentEnd { reason: EndReason },

    /// Autonomous supervisor state transition.
    LoopStateChange { state: String, iteration: u32 },

    /// This consumer fell behind and `dropped` events were discarded from its
    /// backlog. Emitted to that consumer only, never stored in history.
    Backpressure { dropped: u64 },
}

/// One event on the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub seq: u64,
    pub session_id: String,
    #[serde(flatten)]
    pub kind: AgentEventKind,
    pub timestamp: DateTime<Utc>,
}

/// Multi-producer, multi-consumer event stream for one session.
pub struct EventStream {
    session_id: String,
    seq: AtomicU64,
    tx: broadcast::Sender<AgentEvent>,
    history: Mutex<VecDeque<AgentEvent>>,
}

impl EventStream {
    pub fn new(session_id: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            session_id: session_id.into(),
            seq: AtomicU64::new(0),
            tx,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Emit an event. Non-blocking; ordering per emitter is the sequence
    /// number assigned here.
    pub fn emit(&self, kind: AgentEventKind) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let event = AgentEvent {
            seq,
            session_id: self.session_id.clone(),
            kind,
            timestamp: Utc::now(),
        };

        {
            let mut history = self.history.lock().expect("event history poisoned");
            if history.len() == HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // No receivers is fine; history still records the event.
        let _ = self.tx.send(event);
        seq
    }

    /// Subscribe to live events from now on.
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            session_id: self.session_id.clone(),
            rx: self.tx.subscribe(),
        }
    }

    /// Buffered events with `seq >= from_seq`. Empty if the range has already
    /// rotated out of the ring.
    pub fn replay_from(&self, from_seq: u64) -> Vec<AgentEvent> {
        let history = self.history.lock().expect("event history poisoned");
        history
            .iter()
            .filter(|e| e.seq >= from_seq)
            .cloned()
            .collect()
    }

    /// Snapshot of the retained history ring, oldest first.
    pub fn history(&self) -> Vec<AgentEvent> {
        let history = self.history.lock().expect("event history poisoned");
        history.iter().cloned().collect()
    }
}

/// A consumer handle. Dropping it detaches the consumer without affecting
/// producers or other consumers.
pub struct EventSubscriber {
    session_id: String,
    rx: broadcast::Receiver<AgentEvent>,
}

impl EventSubscriber {
    /// Receive the next event. A lagged consumer gets a single synthetic
    /// `Backpressure` marker carrying how many events it lost, then resumes
    /// from the oldest retained event.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(dropped)) => Some(AgentEvent {
                seq: 0,
                session_id: self.session_id.clone(),
                kind: AgentEventKind::Backpressure { dropped },
                timestamp: Utc::now(),
            }),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}
