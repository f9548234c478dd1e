//! # Error taxonomy
//!
//! Every capability call returns [`TuneError`]. The tuning loop wraps the
//! first failure of a run in a [`LoopError`] that also names the iteration
//! and the state the loop was in, which is what the operator sees.
//!
//! A [`TuneError::PartialApply`] is kept distinct from every other failure:
//! it means some global variables were already changed on the live system
//! when a later step failed, and nothing was rolled back.

use std::time::Duration;

use crate::tuning_loop::LoopState;

/// Which half of a two-phase apply was running when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPhase {
    /// `SET @@GLOBAL.…` statements against the live system.
    GlobalVariables,
    /// Fetch / merge / persist / reload of the cluster topology.
    Topology,
}

impl std::fmt::Display for ApplyPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyPhase::GlobalVariables => write!(f, "global variables"),
            ApplyPhase::Topology => write!(f, "topology"),
        }
    }
}

/// All errors produced by the collector, recommendation client, driver and journal.
#[derive(Debug, thiserror::Error)]
pub enum TuneError {
    /// The database, the recommendation service or a tool binary could not be reached.
    #[error("{target} unavailable: {detail}")]
    SourceUnavailable { target: String, detail: String },

    /// A read or write against a reachable source failed. Partial results are discarded.
    #[error("statement `{statement}` failed: {detail}")]
    QueryFailed { statement: String, detail: String },

    /// The recommendation service refused an observation. `body` is verbatim.
    #[error("observation rejected with HTTP {status}: {body}")]
    SubmissionRejected { status: u16, body: String },

    /// A catalog or session request was refused. `body` is verbatim.
    #[error("{url} rejected with HTTP {status}: {body}")]
    RequestRejected {
        url: String,
        status: u16,
        body: String,
    },

    /// Polling did not yield a recommendation inside the wait budget.
    #[error("no recommendation after {waited:?} ({attempts} attempts)")]
    RecommendationTimeout { waited: Duration, attempts: u32 },

    /// A success response whose body could not be parsed.
    #[error("malformed response from {url}: {detail}")]
    MalformedResponse { url: String, detail: String },

    #[error("failed to fetch topology of cluster '{cluster}': {detail}")]
    TopologyFetchFailed { cluster: String, detail: String },

    #[error("failed to persist topology of cluster '{cluster}': {detail}")]
    TopologyPersistFailed { cluster: String, detail: String },

    #[error("failed to reload roles [{}] of cluster '{cluster}': {detail}", .roles.join(","))]
    ReloadFailed {
        cluster: String,
        roles: Vec<String>,
        detail: String,
    },

    /// The topology text is not a YAML mapping.
    #[error("invalid topology document: {0}")]
    InvalidTopology(String),

    /// Global variables were changed, then a later step failed. Nothing was rolled back.
    #[error(
        "partial apply: {phase} step failed after global variables [{}] were already changed: {source}",
        .applied_globals.join(", ")
    )]
    PartialApply {
        phase: ApplyPhase,
        applied_globals: Vec<String>,
        source: Box<TuneError>,
    },

    #[error("invalid knob '{key}': {reason}")]
    InvalidKnob { key: String, reason: String },

    /// The caller's cancellation token fired.
    #[error("cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("journal error: {0}")]
    Journal(#[from] rusqlite::Error),
}

impl TuneError {
    /// Global variables that are known to have been changed before this error.
    ///
    /// Empty for everything except [`TuneError::PartialApply`].
    pub fn applied_globals(&self) -> &[String] {
        match self {
            TuneError::PartialApply { applied_globals, .. } => applied_globals,
            _ => &[],
        }
    }

    pub fn is_partial_apply(&self) -> bool {
        matches!(self, TuneError::PartialApply { .. })
    }

    /// Wrap `self` as a partial apply when `applied_globals` is non-empty.
    pub(crate) fn after_globals(self, phase: ApplyPhase, applied_globals: &[String]) -> TuneError {
        if applied_globals.is_empty() {
            self
        } else {
            TuneError::PartialApply {
                phase,
                applied_globals: applied_globals.to_vec(),
                source: Box::new(self),
            }
        }
    }
}

/// The failure that stopped a tuning run.
#[derive(Debug, thiserror::Error)]
#[error("iteration {iteration} failed while {phase}: {source}")]
pub struct LoopError {
    /// 1-based iteration number.
    pub iteration: u32,
    /// State the loop was in when the component call failed.
    pub phase: LoopState,
    #[source]
    pub source: TuneError,
}

pub type Result<T, E = TuneError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn after_globals_without_applied_keeps_error() {
        let err = TuneError::Cancelled.after_globals(ApplyPhase::Topology, &[]);
        assert!(matches!(err, TuneError::Cancelled));
        assert!(err.applied_globals().is_empty());
    }

    #[test]
    fn after_globals_with_applied_wraps_partial() {
        let applied = vec!["timeout".to_string()];
        let err = TuneError::TopologyFetchFailed {
            cluster: "c1".into(),
            detail: "boom".into(),
        }
        .after_globals(ApplyPhase::Topology, &applied);
        assert!(err.is_partial_apply());
        assert_eq!(err.applied_globals(), &["timeout".to_string()]);
        let s = err.to_string();
        assert!(s.contains("timeout"), "display lists applied globals: {s}");
        assert!(s.contains("boom"), "display carries cause: {s}");
    }

    #[test]
    fn reload_failed_display_lists_roles() {
        let err = TuneError::ReloadFailed {
            cluster: "prod".into(),
            roles: vec!["tidb".into(), "tikv".into()],
            detail: "exit 1".into(),
        };
        assert!(err.to_string().contains("tidb,tikv"));
    }

    #[test]
    fn submission_rejected_keeps_body_verbatim() {
        let err = TuneError::SubmissionRejected {
            status: 400,
            body: "session 'x' not found\n".into(),
        };
        assert!(err.to_string().contains("session 'x' not found"));
    }

    #[test]
    fn loop_error_names_iteration_and_phase() {
        let err = LoopError {
            iteration: 3,
            phase: LoopState::Polling,
            source: TuneError::RecommendationTimeout {
                waited: Duration::from_secs(10),
                attempts: 3,
            },
        };
        let s = err.to_string();
        assert!(s.contains("iteration 3"), "{s}");
        assert!(s.contains("polling"), "{s}");
        assert!(std::error::Error::source(&err).is_some());
    }
}
