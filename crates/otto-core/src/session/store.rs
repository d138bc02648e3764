//! Durable session storage.
//!
//! The filesystem backend lays each session out as:
//!
//! ```text
//! <root>/<session-id>/
//!   header.json         # id, timestamps, token total, policy, metrics
//!   messages.log        # one self-contained JSON record per line
//!   events.ring         # bounded event history
//!   status.json         # last supervisor snapshot (written by the supervisor)
//!   session.id          # autonomous-mode continuity sidecar
//!   call_count          # rate-bucket state
//!   iterations/         # one file per autonomous iteration
//!   checkpoints/<name>.json
//! ```
//!
//! Every write goes to a temp file in the same directory and is renamed into
//! place, so readers see either the prior state or the new state in full. A
//! shared (non-filesystem) backend must make the blob write and any
//! user-index update a single transaction; otherwise orphaned or
//! double-indexed sessions become observable.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;

use crate::context::IndexedMessage;
use crate::error::{EngineError, Result};

use super::{Checkpoint, Session, SessionHeader};

/// A loaded session plus its expiry verdict. Expired sessions carry their
/// content but must not be continued.
#[derive(Debug)]
pub struct LoadedSession {
    pub session: Session,
    pub expired: bool,
}

/// Storage backend contract.
pub trait SessionStore: Send + Sync {
    fn save(&self, session: &Session) -> Result<()>;
    fn load(&self, id: &str, config: &crate::config::RuntimeConfig) -> Result<LoadedSession>;
    fn list(&self) -> Result<Vec<SessionHeader>>;
    fn delete(&self, id: &str) -> Result<()>;
    fn checkpoint(&self, session: &Session, name: &str) -> Result<()>;
    fn restore(&self, session: &mut Session, name: &str) -> Result<()>;
    /// Root directory of one session's artifacts.
    fn session_dir(&self, id: &str) -> PathBuf;
}

/// Filesystem-backed store.
pub struct FsSessionStore {
    root: PathBuf,
}

impl FsSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn header_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join("header.json")
    }

    fn messages_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join("messages.log")
    }

    fn events_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join("events.ring")
    }

    fn checkpoint_path(&self, id: &str, name: &str) -> PathBuf {
        self.session_dir(id).join("checkpoints").join(format!("{}.json", sanitize(name)))
    }
}

impl SessionStore for FsSessionStore {
    fn session_dir(&self, id: &str) -> PathBuf {
        self.root.join(sanitize(id))
    }

    fn save(&self, session: &Session) -> Result<()> {
        let dir = self.session_dir(&session.id);
        fs::create_dir_all(dir.join("iterations"))?;

        let header = serde_json::to_vec_pretty(&session.header())?;

        let mut messages = Vec::new();
        for entry in session.context.entries() {
            serde_json::to_writer(&mut messages, entry)?;
            messages.push(b'\n');
        }

        let events = serde_json::to_vec_pretty(&session.event_history)?;

        // Messages first, header last: the header is the commit point a
        // loader trusts.
        write_atomic(&self.messages_path(&session.id), &messages)?;
        write_atomic(&self.events_path(&session.id), &events)?;
        write_atomic(&self.header_path(&session.id), &header)?;

        debug!(session_id = %session.id, messages = session.context.len(), "session saved");
        Ok(())
    }

    fn load(&self, id: &str, config: &crate::config::RuntimeConfig) -> Result<LoadedSession> {
        let header_path = self.header_path(id);
        if !header_path.exists() {
            return Err(EngineError::SessionNotFound(id.to_string()));
        }

        let header: SessionHeader = serde_json::from_slice(&fs::read(&header_path)?)?;

        let mut entries: Vec<IndexedMessage> = Vec::new();
        let messages_path = self.messages_path(id);
        if messages_path.exists() {
            for line in fs::read_to_string(&messages_path)?.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                entries.push(serde_json::from_str(line)?);
            }
        }

        let events = {
            let path = self.events_path(id);
            if path.exists() {
                serde_json::from_slice(&fs::read(&path)?)?
            } else {
                Vec::new()
            }
        };

        let mut session = Session::new(config);
        session.id = header.id.clone();
        session.created_at = header.created_at;
        session.last_activity_at = header.last_activity_at;
        session.policy = header.policy;
        session.metrics = header.metrics;
        session.metadata = header.metadata.clone();
        session.active_skills = header.active_skills.clone();
        session.context.restore(entries);
        session.event_history = events;

        let expired = session.is_expired(Utc::now());
        Ok(LoadedSession { session, expired })
    }

    fn list(&self) -> Result<Vec<SessionHeader>> {
        let mut headers = Vec::new();
        if !self.root.exists() {
            return Ok(headers);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let header_path = entry.path().join("header.json");
            if !header_path.exists() {
                continue;
            }
            match serde_json::from_slice::<SessionHeader>(&fs::read(&header_path)?) {
                Ok(header) => headers.push(header),
                Err(e) => debug!(path = %header_path.display(), "skipping unreadable header: {}", e),
            }
        }
        headers.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(headers)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let dir = self.session_dir(id);
        if !dir.exists() {
            return Err(EngineError::SessionNotFound(id.to_string()));
        }
        fs::remove_dir_all(&dir)?;
        tracing::info!(session_id = %id, "session deleted");
        Ok(())
    }

    fn checkpoint(&self, session: &Session, name: &str) -> Result<()> {
        let checkpoint = Checkpoint::capture(session, name);
        let path = self.checkpoint_path(&session.id, name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, &serde_json::to_vec_pretty(&checkpoint)?)?;
        Ok(())
    }

    fn restore(&self, session: &mut Session, name: &str) -> Result<()> {
        let path = self.checkpoint_path(&session.id, name);
        if !path.exists() {
            return Err(EngineError::SessionNotFound(format!(
                "checkpoint '{}' of session {}",
                name, session.id
            )));
        }
        let checkpoint: Checkpoint = serde_json::from_slice(&fs::read(&path)?)?;
        checkpoint.restore_into(session);
        Ok(())
    }
}

/// Write `bytes` to `path` atomically from the reader's perspective.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string()),
        std::process::id()
    ));

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
