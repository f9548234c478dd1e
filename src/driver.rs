//! # Stage: Apply
//!
//! ## Responsibility
//! Push a recommended [`KnobSet`] onto the live cluster in two phases:
//!
//! 1. **Global variables**: every key without a role prefix becomes one
//!    `SET @@GLOBAL.<name> = <value>` statement, in key order, fail-fast.
//! 2. **Topology**: role-prefixed keys are merged into a freshly fetched
//!    topology, the result is persisted, and exactly the affected roles are
//!    reloaded.
//!
//! ## Guarantees
//! - A failing statement stops the apply; later statements are never issued.
//! - Any failure after at least one global variable changed is reported as
//!   [`TuneError::PartialApply`] naming those variables. Nothing is rolled back.
//! - Applying the same set twice leaves the cluster as applying it once, so
//!   re-applying is the recovery path for a partial apply.
//!
//! ## NOT Responsible For
//! - Choosing the knobs (see [`crate::recommend`])
//! - Verifying that reloaded nodes came back healthy

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{ApplyPhase, Result, TuneError};
use crate::journal::{Journal, Outcome};
use crate::knob::{is_valid_variable_name, KnobSet, KnobValue, RoleMap};
use crate::source::{SqlConnector, SqlSession};
use crate::topology::{TopologyDocument, TopologyManager, TopologyMerger};

/// What one successful apply changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Global variable names, in the order they were set.
    pub globals_applied: Vec<String>,
    /// Roles that were reloaded.
    pub roles_reloaded: Vec<String>,
    /// Topology nodes whose overrides were written.
    pub nodes_updated: usize,
}

/// Applies a recommendation to the tuned system.
#[async_trait]
pub trait ConfigApplier: Send + Sync {
    async fn apply_config(&self, knobs: &KnobSet) -> Result<ApplyReport>;
}

/// Two-phase applier for a TiDB cluster managed by a deployment tool.
pub struct ConfigDriver<C, T> {
    connector: C,
    manager: T,
    merger: TopologyMerger,
    cluster: String,
}

impl<C: SqlConnector, T: TopologyManager> ConfigDriver<C, T> {
    pub fn new(connector: C, manager: T, cluster: impl Into<String>) -> Self {
        Self {
            connector,
            manager,
            merger: TopologyMerger::default(),
            cluster: cluster.into(),
        }
    }

    /// Replace the role prefix → topology section mapping.
    pub fn with_roles(mut self, roles: RoleMap) -> Self {
        self.merger = TopologyMerger::new(roles);
        self
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Phase A. Returns the names that were set, in order.
    ///
    /// On failure, the error is already wrapped as a partial apply if any
    /// statement had succeeded.
    async fn apply_globals(&self, globals: &[(String, KnobValue)]) -> Result<Vec<String>> {
        let mut applied = Vec::with_capacity(globals.len());
        if globals.is_empty() {
            return Ok(applied);
        }

        let mut session = self.connector.connect().await?;
        let mut failure = None;
        for (name, value) in globals {
            let statement = format!("SET @@GLOBAL.{name} = {}", value.to_sql_literal());
            debug!(statement = %statement, "setting global variable");
            if let Err(e) = session.execute(&statement).await {
                failure = Some(e);
                break;
            }
            applied.push(name.clone());
        }
        session.close().await;

        match failure {
            Some(e) => Err(e.after_globals(ApplyPhase::GlobalVariables, &applied)),
            None => {
                info!(count = applied.len(), "global variables applied");
                Ok(applied)
            }
        }
    }

    /// Phase B. Returns `(roles reloaded, nodes updated)`.
    ///
    /// Only roles that own at least one node in the topology are reloaded.
    /// When no node was written the topology is neither persisted nor
    /// reloaded.
    async fn apply_topology(&self, role_knobs: &KnobSet) -> Result<(Vec<String>, usize)> {
        let text = self.manager.show_config(&self.cluster).await?;
        let mut topology = TopologyDocument::parse(&text)?;
        let counts = self.merger.merge_in_place(&mut topology, role_knobs);
        let nodes_updated: usize = counts.values().sum();

        let (roles, absent): (Vec<_>, Vec<_>) = counts.into_iter().partition(|(_, n)| *n > 0);
        if !absent.is_empty() {
            let absent: Vec<String> = absent.into_iter().map(|(role, _)| role).collect();
            warn!(
                cluster = %self.cluster,
                roles = %absent.join(","),
                "no nodes for role in topology, knobs skipped"
            );
        }
        let roles: Vec<String> = roles.into_iter().map(|(role, _)| role).collect();
        if roles.is_empty() {
            return Ok((roles, 0));
        }

        let merged = topology.to_yaml()?;
        self.manager.edit_config(&self.cluster, &merged).await?;
        self.manager.reload(&self.cluster, &roles).await?;
        info!(
            cluster = %self.cluster,
            roles = %roles.join(","),
            nodes = nodes_updated,
            "topology applied"
        );
        Ok((roles, nodes_updated))
    }
}

#[async_trait]
impl<C, T> ConfigApplier for ConfigDriver<C, T>
where
    C: SqlConnector,
    T: TopologyManager,
{
    async fn apply_config(&self, knobs: &KnobSet) -> Result<ApplyReport> {
        let parts = knobs.partition(self.merger.roles());

        // Reject bad names up front so nothing is applied at all.
        if let Some((name, _)) = parts
            .globals
            .iter()
            .find(|(name, _)| !is_valid_variable_name(name))
        {
            return Err(TuneError::InvalidKnob {
                key: name.clone(),
                reason: "not a valid variable name".to_string(),
            });
        }

        let globals_applied = self.apply_globals(&parts.globals).await?;

        if parts.by_role.is_empty() {
            return Ok(ApplyReport {
                globals_applied,
                ..ApplyReport::default()
            });
        }

        let (roles_reloaded, nodes_updated) = self
            .apply_topology(&parts.role_knobs())
            .await
            .map_err(|e| e.after_globals(ApplyPhase::Topology, &globals_applied))?;

        Ok(ApplyReport {
            globals_applied,
            roles_reloaded,
            nodes_updated,
        })
    }
}

/// Re-apply the last journaled recommendation of `session`.
///
/// This is the recovery path after a [`TuneError::PartialApply`]: applying is
/// idempotent, so whatever half already landed is simply written again. The
/// attempt is journaled as iteration 0 of its own run.
///
/// # Errors
/// [`TuneError::Config`] when the journal holds no recommendation for
/// `session`; otherwise whatever the apply itself returns.
pub async fn reapply_last<A>(journal: &Journal, session: &str, applier: &A) -> Result<ApplyReport>
where
    A: ConfigApplier + ?Sized,
{
    let knobs = journal.last_recommendation(session)?.ok_or_else(|| {
        TuneError::Config(format!("no journaled recommendation for session '{session}'"))
    })?;
    let run_id = format!("reapply-{}", uuid::Uuid::new_v4());
    let entry = journal.begin_iteration(session, &run_id, 0)?;
    journal.record_recommendation(entry, &knobs)?;
    info!(session, knobs = knobs.len(), "re-applying last recommendation");

    let result = applier.apply_config(&knobs).await;
    let written = match &result {
        Ok(report) => journal.record_outcome(
            entry,
            Outcome {
                state: "applied",
                globals_applied: &report.globals_applied,
                roles_reloaded: &report.roles_reloaded,
                error: None,
            },
        ),
        Err(e) => {
            let message = e.to_string();
            journal.record_outcome(
                entry,
                Outcome {
                    state: "failed",
                    globals_applied: e.applied_globals(),
                    error: Some(&message),
                    ..Outcome::default()
                },
            )
        }
    };
    if let Err(e) = written {
        warn!(error = %e, "journal write failed");
    }
    result
}
