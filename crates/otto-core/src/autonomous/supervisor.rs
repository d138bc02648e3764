//! The autonomous supervisor.
//!
//! Drives up to `max_loops` turns, fed by the response analyzer, the circuit
//! breaker, and the rate limiter. Every iteration persists the session, an
//! iteration log entry, and a fresh `status.json`. The loop halts on the
//! dual-condition exit gate (completion indicators AND an explicit exit
//! signal), on policy trips, or when the iteration budget runs out.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::turn::TurnEngine;
use crate::ai::types::{ModelMessage, Role};
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::events::{AgentEventKind, EventStream};
use crate::session::store::write_atomic;
use crate::session::{Session, SessionStore};
use crate::skills::SkillRegistry;

use super::analyzer::{ResponseAnalysis, ResponseAnalyzer};
use super::circuit::{CircuitBreaker, CircuitState, TickInput};
use super::rate_limit::RateLimiter;
use super::status::StatusSnapshot;

/// Completion indicators required by the dual exit gate.
const MIN_COMPLETION_INDICATORS: u32 = 2;

/// Cumulative analyzer denials that halt the loop.
const MAX_PERMISSION_DENIALS: u32 = 2;

/// The prompt bundle an autonomous run is parameterized by.
#[derive(Debug, Clone, Default)]
pub struct PromptBundle {
    /// Durable instruction document.
    pub instructions: String,
    /// Checklist markdown; unchecked items feed the loop context.
    pub checklist: Option<String>,
    /// Optional build/run notes.
    pub build_doc: Option<String>,
}

impl PromptBundle {
    /// Load the bundle from a directory of well-known files.
    pub fn load_from(dir: &std::path::Path) -> Self {
        let read = |name: &str| fs::read_to_string(dir.join(name)).ok();
        Self {
            instructions: read("PROMPT.md")
                .unwrap_or_else(|| "Continue improving the project.".to_string()),
            checklist: read("CHECKLIST.md"),
            build_doc: read("BUILD.md"),
        }
    }

    /// Unchecked checklist items, at most `limit`.
    pub fn unchecked_tasks(&self, limit: usize) -> Vec<String> {
        let Some(checklist) = &self.checklist else {
            return Vec::new();
        };
        checklist
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with("- [ ]") || line.starts_with("* [ ]"))
            .take(limit)
            .map(ToString::to_string)
            .collect()
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    CompleteWithSignal,
    PermissionDenied,
    CircuitOpen,
    RateLimited,
    MaxLoops,
    Cancelled,
    Error,
}

impl HaltReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CompleteWithSignal => "complete_with_signal",
            Self::PermissionDenied => "permission_denied",
            Self::CircuitOpen => "circuit_open",
            Self::RateLimited => "rate_limited",
            Self::MaxLoops => "max_loops",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    /// Process exit code for an autonomous run.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CompleteWithSignal => 0,
            Self::Error => 1,
            Self::MaxLoops => 2,
            Self::CircuitOpen => 3,
            Self::RateLimited => 4,
            Self::Cancelled => 5,
            Self::PermissionDenied => 1,
        }
    }
}

/// One iteration's durable record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopIteration {
    pub ordinal: u32,
    pub timestamp: DateTime<Utc>,
    pub analysis: ResponseAnalysis,
    pub circuit_state: CircuitState,
    pub calls_remaining: u32,
    pub files_modified: Vec<String>,
    pub error: Option<String>,
}

/// Final report of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub session_id: String,
    pub iterations_run: u32,
    pub halt_reason: HaltReason,
    pub files_modified: Vec<String>,
}

/// Autonomous-mode continuity sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionSidecar {
    session_id: String,
    loop_number: u32,
    last_activity: DateTime<Utc>,
}

pub struct AutonomousSupervisor {
    config: RuntimeConfig,
    store: Arc<dyn SessionStore>,
    turn_engine: TurnEngine,
    analyzer: ResponseAnalyzer,
    circuit: CircuitBreaker,
    limiter: RateLimiter,
    skills: Option<Arc<SkillRegistry>>,
}

impl AutonomousSupervisor {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<dyn SessionStore>,
        turn_engine: TurnEngine,
        session_id: &str,
    ) -> Self {
        let session_dir = store.session_dir(session_id);
        let limiter = RateLimiter::new(
            session_dir.join("call_count"),
            config.rate_max_calls,
            config.rate_window_secs,
        );

        // A restart resumes the persisted circuit verdict; an open circuit
        // must not silently close because the process bounced.
        let mut circuit = CircuitBreaker::default();
        if let Ok(status) = StatusSnapshot::read(&session_dir.join("status.json")) {
            circuit.restore(
                status.circuit_breaker.state,
                status.circuit_breaker.no_progress_count,
                status.circuit_breaker.consecutive_errors,
                status.circuit_breaker.permission_denials,
            );
        }

        Self {
            config,
            store,
            turn_engine,
            analyzer: ResponseAnalyzer::default(),
            circuit,
            limiter,
            skills: None,
        }
    }

    /// Attach the skill registry; sessions select from it via their active
    /// skill set.
    pub fn with_skills(mut self, skills: Arc<SkillRegistry>) -> Self {
        self.skills = Some(skills);
        self
    }

    pub fn circuit_mut(&mut self) -> &mut CircuitBreaker {
        &mut self.circuit
    }

    /// Resume the prior autonomous session if its sidecar is fresh, else mint
    /// a new one. Returns the session and the starting iteration ordinal.
    pub fn resume_or_new(
        store: &dyn SessionStore,
        config: &RuntimeConfig,
        root: &std::path::Path,
    ) -> (Session, u32) {
        let pointer = root.join("session.id");
        if let Ok(bytes) = fs::read(&pointer) {
            if let Ok(sidecar) = serde_json::from_slice::<SessionSidecar>(&bytes) {
                let age = Utc::now() - sidecar.last_activity;
                if age < Duration::hours(config.session_expiry_hours) {
                    match store.load(&sidecar.session_id, config) {
                        Ok(loaded) if !loaded.expired => {
                            info!(session_id = %sidecar.session_id, "resumed session");
                            return (loaded.session, sidecar.loop_number);
                        }
                        Ok(_) => info!("prior session expired, starting fresh"),
                        Err(e) => warn!("failed to load prior session: {}", e),
                    }
                } else {
                    info!("session sidecar expired, starting fresh");
                }
            }
        }
        (Session::new(config), 0)
    }

    /// Run the loop. `prior_iterations` continues a resumed session's count.
    pub async fn run(
        &mut self,
        session: &mut Session,
        bundle: &PromptBundle,
        max_loops: u32,
        prior_iterations: u32,
        events: &EventStream,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let session_dir = self.store.session_dir(&session.id);
        fs::create_dir_all(session_dir.join("iterations"))?;
        let status_path = session_dir.join("status.json");

        // Seed the system prompt once per fresh session.
        if session.context.is_empty() {
            let mut prompt = system_prompt(bundle);
            if let Some(skills) = &self.skills {
                let skill_text = skills.compose(&session.active_skills);
                if !skill_text.is_empty() {
                    prompt.push_str("\n\n");
                    prompt.push_str(&skill_text);
                }
            }
            session
                .context
                .append(ModelMessage::text(Role::System, prompt));
        }

        let mut iteration = prior_iterations;
        let mut files_modified: Vec<String> = Vec::new();
        let mut permission_denials_cumulative = 0u32;

        info!(session_id = %session.id, max_loops, "starting autonomous loop");

        let halt_reason = loop {
            if iteration >= prior_iterations + max_loops {
                break HaltReason::MaxLoops;
            }
            if cancel.is_cancelled() {
                break HaltReason::Cancelled;
            }

            if !self.limiter.admit()? {
                warn!("rate limit exceeded, halting loop");
                break HaltReason::RateLimited;
            }

            if self.circuit.state() == CircuitState::Open {
                warn!("circuit breaker open, halting loop");
                break HaltReason::CircuitOpen;
            }

            iteration += 1;
            self.write_status(&status_path, "running", iteration, None)?;
            events.emit(AgentEventKind::LoopStateChange {
                state: "running".to_string(),
                iteration,
            });

            // Compose this iteration's prompt and run one turn.
            let prompt = self.compose_prompt(bundle, session, iteration);
            session
                .context
                .append(ModelMessage::text(Role::User, prompt));

            let outcome = self
                .turn_engine
                .run_turn(&mut session.context, &mut session.detector, events, cancel)
                .await;

            let analysis = self.analyzer.analyze(&outcome.assistant_text);

            let mut iteration_files = outcome.modified_paths.clone();
            for file in &analysis.files_modified {
                if !iteration_files.contains(file) {
                    iteration_files.push(file.clone());
                }
            }

            // A detected repetition loop is never progress, whatever the
            // tools claim to have touched.
            self.circuit.tick(TickInput {
                files_changed: !iteration_files.is_empty() && !outcome.loop_detected,
                has_errors: analysis.has_errors || outcome.error.is_some(),
                has_completion_indicator: analysis.completion_indicators > 0,
                has_permission_denial: analysis.permission_denied,
                has_exit_signal: analysis.exit_signal,
                output_length: analysis.output_length,
            });

            if analysis.permission_denied {
                permission_denials_cumulative += 1;
            }

            // Durable iteration record.
            let record = LoopIteration {
                ordinal: iteration,
                timestamp: Utc::now(),
                analysis: analysis.clone(),
                circuit_state: self.circuit.state(),
                calls_remaining: self.limiter.calls_remaining(),
                files_modified: iteration_files.clone(),
                error: outcome.error.clone(),
            };
            self.write_iteration(&session_dir, &record)?;

            for file in iteration_files {
                if !files_modified.contains(&file) {
                    files_modified.push(file);
                }
            }

            // Persist before deciding: a halt must never lose the iteration.
            session.record_turn(outcome.tool_calls, outcome.tool_failures, outcome.usage);
            session.event_history = events.history();
            self.store.save(session)?;
            self.write_sidecar(session, iteration)?;

            info!(
                iteration,
                status = %analysis.status,
                indicators = analysis.completion_indicators,
                exit_signal = analysis.exit_signal,
                circuit = self.circuit.state().as_str(),
                "iteration complete"
            );

            // A genuine completion outranks a simultaneous denial trip.
            if dual_exit_condition(&analysis) {
                break HaltReason::CompleteWithSignal;
            }
            if permission_denials_cumulative >= MAX_PERMISSION_DENIALS {
                break HaltReason::PermissionDenied;
            }
        };

        self.write_status(
            &status_path,
            "halted",
            iteration,
            Some(halt_reason.as_str().to_string()),
        )?;
        events.emit(AgentEventKind::LoopStateChange {
            state: format!("halted:{}", halt_reason.as_str()),
            iteration,
        });

        session.event_history = events.history();
        self.store.save(session)?;

        info!(
            session_id = %session.id,
            iterations = iteration,
            reason = halt_reason.as_str(),
            "autonomous loop halted"
        );

        Ok(RunReport {
            session_id: session.id.clone(),
            iterations_run: iteration - prior_iterations,
            halt_reason,
            files_modified,
        })
    }

    /// The per-iteration user prompt: instructions, remaining checklist
    /// items, loop context, and the status-block contract.
    fn compose_prompt(&self, bundle: &PromptBundle, session: &Session, iteration: u32) -> String {
        let mut prompt = bundle.instructions.clone();

        let tasks = bundle.unchecked_tasks(10);
        if !tasks.is_empty() {
            prompt.push_str("\n\nRemaining tasks:\n");
            prompt.push_str(&tasks.join("\n"));
        }

        if let Some(build_doc) = &bundle.build_doc {
            prompt.push_str("\n\nBuild and run notes:\n");
            prompt.push_str(build_doc);
        }

        prompt.push_str(&format!(
            "\n\n---\nLoop context (iteration {iteration})\n---\n\
             Session: {session_id}\n\
             Rate limit: {remaining} calls remaining this window\n\
             Circuit breaker: {circuit} \
             (no progress {np}/{max_np}, consecutive errors {ce}/{max_ce})\n\n\
             Analyze the current state and make improvements. When the task is \
             genuinely finished, say so and emit a status block:\n\n\
             ```json\n\
             {{\"exit_signal\": true, \"status\": \"complete\", \"summary\": \"...\", \
             \"files_modified\": []}}\n\
             ```\n",
            iteration = iteration,
            session_id = session.id,
            remaining = self.limiter.calls_remaining(),
            circuit = self.circuit.state().as_str(),
            np = self.circuit.no_progress_count,
            max_np = 3,
            ce = self.circuit.consecutive_errors,
            max_ce = 5,
        ));

        prompt
    }

    fn write_status(
        &self,
        path: &PathBuf,
        state: &str,
        iteration: u32,
        halt_reason: Option<String>,
    ) -> Result<()> {
        StatusSnapshot::capture(state, iteration, &self.circuit, &self.limiter, halt_reason)
            .write(path)
    }

    fn write_iteration(&self, session_dir: &std::path::Path, record: &LoopIteration) -> Result<()> {
        let name = format!(
            "loop_{:04}_{}.json",
            record.ordinal,
            record.timestamp.format("%Y%m%d_%H%M%S")
        );
        write_atomic(
            &session_dir.join("iterations").join(name),
            &serde_json::to_vec_pretty(record)?,
        )
    }

    fn write_sidecar(&self, session: &Session, iteration: u32) -> Result<()> {
        let sidecar = SessionSidecar {
            session_id: session.id.clone(),
            loop_number: iteration,
            last_activity: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&sidecar)?;
        // Per-session copy and the root pointer used for resume.
        write_atomic(
            &self.store.session_dir(&session.id).join("session.id"),
            &bytes,
        )?;
        write_atomic(&self.config.session_root.join("session.id"), &bytes)
    }
}

/// The dual-condition exit gate.
fn dual_exit_condition(analysis: &ResponseAnalysis) -> bool {
    analysis.completion_indicators >= MIN_COMPLETION_INDICATORS && analysis.exit_signal
}

fn system_prompt(bundle: &PromptBundle) -> String {
    let mut prompt = String::from(
        "You are otto, an autonomous coding agent. You work in iterations: \
         inspect the project, use your tools to make concrete progress, and \
         report honestly. Never claim completion you have not verified.",
    );
    if bundle.build_doc.is_some() {
        prompt.push_str(" Build instructions are provided with each iteration.");
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dual_gate_requires_both_conditions() {
        let both = ResponseAnalysis {
            completion_indicators: 2,
            exit_signal: true,
            ..Default::default()
        };
        assert!(dual_exit_condition(&both));

        let indicators_only = ResponseAnalysis {
            completion_indicators: 5,
            exit_signal: false,
            ..Default::default()
        };
        assert!(!dual_exit_condition(&indicators_only));

        let signal_only = ResponseAnalysis {
            completion_indicators: 1,
            exit_signal: true,
            ..Default::default()
        };
        assert!(!dual_exit_condition(&signal_only));
    }

    #[test]
    fn halt_reasons_map_to_exit_codes() {
        assert_eq!(HaltReason::CompleteWithSignal.exit_code(), 0);
        assert_eq!(HaltReason::Error.exit_code(), 1);
        assert_eq!(HaltReason::MaxLoops.exit_code(), 2);
        assert_eq!(HaltReason::CircuitOpen.exit_code(), 3);
        assert_eq!(HaltReason::RateLimited.exit_code(), 4);
        assert_eq!(HaltReason::Cancelled.exit_code(), 5);
    }

    #[test]
    fn unchecked_tasks_parse_from_checklist() {
        let bundle = PromptBundle {
            instructions: "improve".to_string(),
            checklist: Some(
                "# Plan\n- [x] done item\n- [ ] first open item\n* [ ] second open item\nnotes\n"
                    .to_string(),
            ),
            build_doc: None,
        };
        let tasks = bundle.unchecked_tasks(10);
        assert_eq!(tasks.len(), 2);
        assert!(tasks[0].contains("first open item"));
    }

    #[test]
    fn bundle_defaults_when_files_missing() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = PromptBundle::load_from(dir.path());
        assert!(bundle.instructions.contains("Continue improving"));
        assert!(bundle.checklist.is_none());
    }
}
