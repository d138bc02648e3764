//! Circuit breaker for the autonomous loop.
//!
//! Three states. CLOSED is normal operation; OPEN halts the loop until an
//! operator intervenes; HALF_OPEN probes recovery after a manual
//! `begin_recovery` (the `/circuit reset` path) or an elapsed cooldown.
//!
//! One tick per iteration. The state after a tick is a pure function of the
//! prior state and the counters; nothing changes state without a tick except
//! `reset` and `begin_recovery`.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Transition history bound.
const HISTORY_CAPACITY: usize = 50;

/// Output-decline window size.
const OUTPUT_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        }
    }
}

/// Thresholds, all configurable.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub max_no_progress: u32,
    pub max_consecutive_errors: u32,
    pub max_completion_signals: u32,
    pub max_permission_denials: u32,
    /// Open-state cooldown before automatic HALF_OPEN. None disables it.
    pub cooldown: Option<Duration>,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            max_no_progress: 3,
            max_consecutive_errors: 5,
            max_completion_signals: 5,
            max_permission_denials: 2,
            cooldown: None,
        }
    }
}

/// Observations from one iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickInput {
    pub files_changed: bool,
    pub has_errors: bool,
    pub has_completion_indicator: bool,
    pub has_permission_denial: bool,
    pub has_exit_signal: bool,
    pub output_length: usize,
}

/// One recorded state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub at: DateTime<Utc>,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: String,
}

pub struct CircuitBreaker {
    config: CircuitConfig,
    state: CircuitState,
    pub no_progress_count: u32,
    pub consecutive_errors: u32,
    pub completion_signals: u32,
    pub permission_denials: u32,
    recent_output_lengths: VecDeque<usize>,
    opened_at: Option<DateTime<Utc>>,
    history: VecDeque<Transition>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            no_progress_count: 0,
            consecutive_errors: 0,
            completion_signals: 0,
            permission_denials: 0,
            recent_output_lengths: VecDeque::with_capacity(OUTPUT_WINDOW),
            opened_at: None,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }

    /// Feed one iteration's observations. Returns the state after the tick.
    pub fn tick(&mut self, input: TickInput) -> CircuitState {
        // Cooldown elapses into a recovery probe.
        if self.state == CircuitState::Open {
            if let (Some(cooldown), Some(opened_at)) = (self.config.cooldown, self.opened_at) {
                if Utc::now() - opened_at >= cooldown {
                    self.transition(CircuitState::HalfOpen, "cooldown_elapsed");
                }
            }
        }

        match self.state {
            CircuitState::Open => self.state,
            CircuitState::HalfOpen => {
                if input.has_errors || input.has_permission_denial {
                    self.transition(CircuitState::Open, "recovery_failed");
                } else if input.files_changed || input.has_completion_indicator {
                    self.clear_counters();
                    self.transition(CircuitState::Closed, "recovery_success");
                }
                self.state
            }
            CircuitState::Closed => self.tick_closed(input),
        }
    }

    fn tick_closed(&mut self, input: TickInput) -> CircuitState {
        if !input.files_changed && !input.has_errors {
            self.no_progress_count += 1;
        } else if input.files_changed {
            self.no_progress_count = 0;
        }

        if input.has_errors {
            self.consecutive_errors += 1;
        } else {
            self.consecutive_errors = 0;
        }

        if input.has_completion_indicator {
            self.completion_signals += 1;
        }

        if input.has_permission_denial {
            self.permission_denials += 1;
        } else {
            self.permission_denials = 0;
        }

        let output_declined = self.output_declined(input.output_length);
        if input.output_length > 0 {
            if self.recent_output_lengths.len() == OUTPUT_WINDOW {
                self.recent_output_lengths.pop_front();
            }
            self.recent_output_lengths.push_back(input.output_length);
        }

        if self.no_progress_count >= self.config.max_no_progress {
            warn!(
                count = self.no_progress_count,
                "circuit OPEN: no progress"
            );
            self.transition(
                CircuitState::Open,
                format!("no_progress_{}", self.no_progress_count),
            );
        } else if self.consecutive_errors >= self.config.max_consecutive_errors {
            warn!(
                count = self.consecutive_errors,
                "circuit OPEN: consecutive errors"
            );
            self.transition(
                CircuitState::Open,
                format!("errors_{}", self.consecutive_errors),
            );
        } else if self.completion_signals >= self.config.max_completion_signals
            && !input.has_exit_signal
        {
            // "Done" claims without the exit signal are livelock, not
            // completion.
            warn!(
                count = self.completion_signals,
                "circuit OPEN: completion indicators without exit signal"
            );
            self.transition(CircuitState::Open, "completion_indicators_overflow");
        } else if self.permission_denials >= self.config.max_permission_denials {
            warn!(
                count = self.permission_denials,
                "circuit OPEN: permission denials"
            );
            self.transition(
                CircuitState::Open,
                format!("permission_denied_{}", self.permission_denials),
            );
        } else if output_declined {
            warn!("circuit OPEN: output length collapsed");
            self.transition(CircuitState::Open, "output_decline");
        }

        self.state
    }

    /// Below 30% of the running mean over the last window.
    fn output_declined(&self, output_length: usize) -> bool {
        if output_length == 0 || self.recent_output_lengths.len() < OUTPUT_WINDOW {
            return false;
        }
        let mean: f64 = self.recent_output_lengths.iter().sum::<usize>() as f64
            / self.recent_output_lengths.len() as f64;
        (output_length as f64) < mean * 0.3
    }

    /// Seed state and persisted counters after a process restart. The
    /// completion-signal counter is not part of the persisted snapshot and
    /// restarts at zero.
    pub fn restore(
        &mut self,
        state: CircuitState,
        no_progress: u32,
        consecutive_errors: u32,
        permission_denials: u32,
    ) {
        self.state = state;
        self.no_progress_count = no_progress;
        self.consecutive_errors = consecutive_errors;
        self.permission_denials = permission_denials;
        self.opened_at = if state == CircuitState::Open {
            Some(Utc::now())
        } else {
            None
        };
    }

    /// Full reset to CLOSED with cleared counters. Idempotent.
    pub fn reset(&mut self) {
        if self.state != CircuitState::Closed {
            self.transition(CircuitState::Closed, "manual_reset");
        }
        self.clear_counters();
    }

    /// Begin a recovery probe: OPEN becomes HALF_OPEN. Other states are
    /// untouched.
    pub fn begin_recovery(&mut self) {
        if self.state == CircuitState::Open {
            self.transition(CircuitState::HalfOpen, "manual_recovery");
        }
    }

    fn clear_counters(&mut self) {
        self.no_progress_count = 0;
        self.consecutive_errors = 0;
        self.completion_signals = 0;
        self.permission_denials = 0;
        self.recent_output_lengths.clear();
    }

    fn transition(&mut self, to: CircuitState, reason: impl Into<String>) {
        let from = self.state;
        self.state = to;
        self.opened_at = if to == CircuitState::Open {
            Some(Utc::now())
        } else {
            None
        };
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(Transition {
            at: Utc::now(),
            from,
            to,
            reason: reason.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress_tick() -> TickInput {
        TickInput {
            files_changed: true,
            output_length: 500,
            ..Default::default()
        }
    }

    fn idle_tick() -> TickInput {
        TickInput {
            output_length: 500,
            ..Default::default()
        }
    }

    #[test]
    fn stays_closed_under_progress() {
        let mut breaker = CircuitBreaker::default();
        for _ in 0..20 {
            assert_eq!(breaker.tick(progress_tick()), CircuitState::Closed);
        }
    }

    #[test]
    fn opens_after_three_no_progress_ticks() {
        let mut breaker = CircuitBreaker::default();
        assert_eq!(breaker.tick(idle_tick()), CircuitState::Closed);
        assert_eq!(breaker.tick(idle_tick()), CircuitState::Closed);
        assert_eq!(breaker.tick(idle_tick()), CircuitState::Open);
    }

    #[test]
    fn file_change_resets_no_progress() {
        let mut breaker = CircuitBreaker::default();
        breaker.tick(idle_tick());
        breaker.tick(idle_tick());
        breaker.tick(progress_tick());
        assert_eq!(breaker.no_progress_count, 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn opens_after_five_consecutive_errors() {
        let mut breaker = CircuitBreaker::default();
        let error_tick = TickInput {
            has_errors: true,
            files_changed: true,
            output_length: 500,
            ..Default::default()
        };
        for _ in 0..4 {
            assert_eq!(breaker.tick(error_tick), CircuitState::Closed);
        }
        assert_eq!(breaker.tick(error_tick), CircuitState::Open);
    }

    #[test]
    fn completion_overflow_without_exit_signal_opens() {
        // Scenario 2: "done" claims with exit_signal=false. The ticks carry
        // no file changes, so keep errors interleaved to dodge no-progress.
        let mut breaker = CircuitBreaker::new(CircuitConfig {
            max_no_progress: 100,
            ..Default::default()
        });
        let tick = TickInput {
            has_completion_indicator: true,
            has_exit_signal: false,
            output_length: 500,
            ..Default::default()
        };
        for _ in 0..4 {
            assert_eq!(breaker.tick(tick), CircuitState::Closed);
        }
        assert_eq!(breaker.tick(tick), CircuitState::Open);
        assert_eq!(
            breaker.history().last().unwrap().reason,
            "completion_indicators_overflow"
        );
    }

    #[test]
    fn completion_with_exit_signal_does_not_open() {
        let mut breaker = CircuitBreaker::new(CircuitConfig {
            max_no_progress: 100,
            ..Default::default()
        });
        let tick = TickInput {
            has_completion_indicator: true,
            has_exit_signal: true,
            output_length: 500,
            ..Default::default()
        };
        for _ in 0..8 {
            assert_eq!(breaker.tick(tick), CircuitState::Closed);
        }
    }

    #[test]
    fn two_permission_denials_open() {
        let mut breaker = CircuitBreaker::default();
        let denial = TickInput {
            has_permission_denial: true,
            files_changed: true,
            output_length: 500,
            ..Default::default()
        };
        assert_eq!(breaker.tick(denial), CircuitState::Closed);
        assert_eq!(breaker.tick(denial), CircuitState::Open);
    }

    #[test]
    fn output_decline_opens_after_window_fills() {
        let mut breaker = CircuitBreaker::default();
        let healthy = TickInput {
            files_changed: true,
            output_length: 1000,
            ..Default::default()
        };
        for _ in 0..5 {
            breaker.tick(healthy);
        }
        let collapsed = TickInput {
            files_changed: true,
            output_length: 100,
            ..Default::default()
        };
        assert_eq!(breaker.tick(collapsed), CircuitState::Open);
        assert_eq!(breaker.history().last().unwrap().reason, "output_decline");
    }

    #[test]
    fn open_ignores_ticks_until_recovery() {
        let mut breaker = CircuitBreaker::default();
        for _ in 0..3 {
            breaker.tick(idle_tick());
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.tick(progress_tick()), CircuitState::Open);
    }

    #[test]
    fn half_open_recovery_paths() {
        // Scenario 3 shape: open -> begin_recovery -> half-open -> clean
        // tick -> closed.
        let mut breaker = CircuitBreaker::default();
        for _ in 0..3 {
            breaker.tick(idle_tick());
        }
        breaker.begin_recovery();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert_eq!(breaker.tick(progress_tick()), CircuitState::Closed);
        assert_eq!(breaker.no_progress_count, 0);
    }

    #[test]
    fn half_open_failure_reopens() {
        let mut breaker = CircuitBreaker::default();
        for _ in 0..3 {
            breaker.tick(idle_tick());
        }
        breaker.begin_recovery();
        let failing = TickInput {
            has_errors: true,
            output_length: 500,
            ..Default::default()
        };
        assert_eq!(breaker.tick(failing), CircuitState::Open);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut breaker = CircuitBreaker::default();
        for _ in 0..3 {
            breaker.tick(idle_tick());
        }
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.no_progress_count, 0);

        let transitions_after_first = breaker.history().count();
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.history().count(), transitions_after_first);
    }

    #[test]
    fn history_is_bounded_with_reasons() {
        let mut breaker = CircuitBreaker::default();
        for _ in 0..60 {
            for _ in 0..3 {
                breaker.tick(idle_tick());
            }
            breaker.reset();
        }
        let history: Vec<_> = breaker.history().collect();
        assert!(history.len() <= 50);
        assert!(history.iter().all(|t| !t.reason.is_empty()));
    }
}
