//! # Stage: Tuning loop
//!
//! ## Responsibility
//! Drive a bounded number of tuning iterations for one session. Each
//! iteration runs strictly in order:
//!
//! ```text
//! Idle → Collecting → ObservingBefore → Waiting → ObservingAfter
//!      → Requesting → Polling → Applying → (Idle | Done)
//! ```
//!
//! Any component error moves the loop to `Failed` and stops the whole run.
//!
//! ## Guarantees
//! - Iteration *n+1* starts only after iteration *n* applied its recommendation.
//! - The observation wait and the recommendation poll return promptly when
//!   the cancellation token fires; cancellation is also checked between phases.
//! - The error names the 1-based iteration and the state that failed.
//! - Journal write failures are logged and never abort a run.
//!
//! ## NOT Responsible For
//! - Retrying a failed iteration
//! - Rolling back a partial apply (see [`crate::driver`])

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collector::Collector;
use crate::config::TuneConfig;
use crate::driver::{ApplyReport, ConfigApplier};
use crate::error::{LoopError, TuneError};
use crate::journal::{Journal, Outcome};
use crate::knob::KnobSet;
use crate::observation::{Observation, ObservationWindow};
use crate::recommend::{PollPolicy, RecommendationService, Session};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Collecting,
    ObservingBefore,
    Waiting,
    ObservingAfter,
    Requesting,
    Polling,
    Applying,
    Done,
    Failed,
}

impl LoopState {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::Collecting => "collecting",
            LoopState::ObservingBefore => "observing-before",
            LoopState::Waiting => "waiting",
            LoopState::ObservingAfter => "observing-after",
            LoopState::Requesting => "requesting",
            LoopState::Polling => "polling",
            LoopState::Applying => "applying",
            LoopState::Done => "done",
            LoopState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Done | LoopState::Failed)
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Config and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    pub max_iterations: u32,
    /// Time between the before and after metric snapshots.
    pub observation_window: Duration,
    pub poll: PollPolicy,
    pub workload: String,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig::from(&TuneConfig::default())
    }
}

impl From<&TuneConfig> for LoopConfig {
    fn from(cfg: &TuneConfig) -> Self {
        Self {
            max_iterations: cfg.tuning.max_iterations,
            observation_window: cfg.observation_window(),
            poll: cfg.poll_policy(),
            workload: cfg.tuning.workload.clone(),
        }
    }
}

/// One completed iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationRecord {
    pub iteration: u32,
    pub recommendation: KnobSet,
    pub report: ApplyReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub session: Session,
    pub iterations: Vec<IterationRecord>,
}

// ---------------------------------------------------------------------------
// TuningLoop
// ---------------------------------------------------------------------------

/// The top-level controller for one session.
pub struct TuningLoop<C, R, A> {
    session: Session,
    collector: C,
    service: R,
    applier: A,
    config: LoopConfig,
    state: LoopState,
    transitions: Vec<LoopState>,
    journal: Option<Journal>,
    run_id: String,
}

impl<C, R, A> TuningLoop<C, R, A>
where
    C: Collector,
    R: RecommendationService,
    A: ConfigApplier,
{
    pub fn new(session: Session, collector: C, service: R, applier: A, config: LoopConfig) -> Self {
        Self {
            session,
            collector,
            service,
            applier,
            config,
            state: LoopState::Idle,
            transitions: vec![LoopState::Idle],
            journal: None,
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Record every iteration in `journal`.
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn transitions(&self) -> &[LoopState] {
        &self.transitions
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    /// Run up to `max_iterations` iterations.
    ///
    /// # Errors
    /// The first component failure, wrapped with its iteration and state.
    /// A fired `cancel` surfaces as [`TuneError::Cancelled`].
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<RunSummary, LoopError> {
        info!(
            session = %self.session,
            run_id = %self.run_id,
            max_iterations = self.config.max_iterations,
            "tuning run started"
        );

        let mut iterations = Vec::new();
        for iteration in 1..=self.config.max_iterations {
            let entry = self.journal_begin(iteration);

            match self.iterate(iteration, entry, cancel).await {
                Ok(record) => {
                    self.journal_outcome(
                        entry,
                        Outcome {
                            state: "applied",
                            globals_applied: &record.report.globals_applied,
                            roles_reloaded: &record.report.roles_reloaded,
                            error: None,
                        },
                    );
                    iterations.push(record);
                    let next = if iteration < self.config.max_iterations {
                        LoopState::Idle
                    } else {
                        LoopState::Done
                    };
                    self.transition(iteration, next);
                }
                Err(source) => {
                    let err = LoopError {
                        iteration,
                        phase: self.state,
                        source,
                    };
                    let message = err.to_string();
                    self.journal_outcome(
                        entry,
                        Outcome {
                            state: "failed",
                            globals_applied: err.source.applied_globals(),
                            error: Some(&message),
                            ..Outcome::default()
                        },
                    );
                    self.transition(iteration, LoopState::Failed);
                    error!(session = %self.session, iteration, phase = %err.phase, error = %err.source, "tuning run failed");
                    return Err(err);
                }
            }
        }

        if self.state != LoopState::Done {
            self.transition(self.config.max_iterations, LoopState::Done);
        }
        info!(session = %self.session, iterations = iterations.len(), "tuning run finished");
        Ok(RunSummary {
            run_id: self.run_id.clone(),
            session: self.session.clone(),
            iterations,
        })
    }

    async fn iterate(
        &mut self,
        iteration: u32,
        entry: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<IterationRecord, TuneError> {
        self.enter(iteration, LoopState::Collecting, cancel)?;
        let knobs = self.collector.collect_knobs().await?;

        self.enter(iteration, LoopState::ObservingBefore, cancel)?;
        let before = self.collector.collect_metrics().await?;

        self.enter(iteration, LoopState::Waiting, cancel)?;
        observe_for(self.config.observation_window, cancel).await?;

        self.enter(iteration, LoopState::ObservingAfter, cancel)?;
        let after = self.collector.collect_metrics().await?;
        let system = self.collector.collect_version().await?;

        self.enter(iteration, LoopState::Requesting, cancel)?;
        let observation = Observation {
            knobs,
            window: ObservationWindow {
                started_at: before.captured_at,
                ended_at: after.captured_at,
            },
            before,
            after,
            system,
            workload: self.config.workload.clone(),
        };
        self.service
            .request_recommendation(&self.session, &observation)
            .await?;

        self.enter(iteration, LoopState::Polling, cancel)?;
        let recommendation = self
            .service
            .poll_recommendation(&self.session, self.config.poll, cancel)
            .await?;
        self.journal_recommendation(entry, &recommendation.knobs);

        self.enter(iteration, LoopState::Applying, cancel)?;
        let report = self.applier.apply_config(&recommendation.knobs).await?;

        Ok(IterationRecord {
            iteration,
            recommendation: recommendation.knobs,
            report,
        })
    }

    /// Move to `next` unless the run was cancelled.
    fn enter(
        &mut self,
        iteration: u32,
        next: LoopState,
        cancel: &CancellationToken,
    ) -> Result<(), TuneError> {
        if cancel.is_cancelled() {
            return Err(TuneError::Cancelled);
        }
        self.transition(iteration, next);
        Ok(())
    }

    fn transition(&mut self, iteration: u32, next: LoopState) {
        info!(session = %self.session, iteration, from = %self.state, to = %next, "state transition");
        self.state = next;
        self.transitions.push(next);
    }

    // -- journal -------------------------------------------------------------

    fn journal_begin(&self, iteration: u32) -> Option<i64> {
        let journal = self.journal.as_ref()?;
        match journal.begin_iteration(self.session.name(), &self.run_id, iteration) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(iteration, error = %e, "journal write failed");
                None
            }
        }
    }

    fn journal_recommendation(&self, entry: Option<i64>, knobs: &KnobSet) {
        if let (Some(journal), Some(id)) = (self.journal.as_ref(), entry) {
            if let Err(e) = journal.record_recommendation(id, knobs) {
                warn!(error = %e, "journal write failed");
            }
        }
    }

    fn journal_outcome(&self, entry: Option<i64>, outcome: Outcome<'_>) {
        if let (Some(journal), Some(id)) = (self.journal.as_ref(), entry) {
            if let Err(e) = journal.record_outcome(id, outcome) {
                warn!(error = %e, "journal write failed");
            }
        }
    }
}

/// Sleep for the observation window, or until `cancel` fires.
async fn observe_for(window: Duration, cancel: &CancellationToken) -> Result<(), TuneError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(TuneError::Cancelled),
        _ = tokio::time::sleep(window) => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
