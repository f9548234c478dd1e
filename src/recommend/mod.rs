//! # Recommendation exchange
//!
//! Talks to the remote optimizer that turns observations into knob
//! recommendations.
//!
//! 1. **Submit**: [`RecommendationService::request_recommendation`] posts one
//!    observation and returns as soon as the service acknowledges it.
//! 2. **Poll**: [`RecommendationService::poll_recommendation`] re-fetches the
//!    session's result at a fixed interval until it is ready, the wait budget
//!    runs out, or the caller cancels.
//!
//! The same client also manages the optimizer's side of a session: system
//! and catalog registration, session creation and modification.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let client = HttpRecommendationClient::builder("127.0.0.1:5000")
//!     .request_timeout(Duration::from_secs(10))
//!     .build();
//! client.request_recommendation(&session, &observation).await?;
//! let rec = client.poll_recommendation(&session, PollPolicy::default(), &cancel).await?;
//! ```

pub mod client;
pub mod poll;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::knob::{KnobSet, KnobValue};
use crate::observation::Observation;

pub use client::{HttpRecommendationClient, HttpRecommendationClientBuilder};
pub use poll::poll_until_ready;

/// Identifies one tuning run against one target system.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Session(String);

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        Session(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Body of `/api/session/modify`. Unset fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionChanges {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_objective: Option<String>,
    /// Only sent together with `target_objective`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub more_is_better: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tuning_knobs: Option<Vec<String>>,
}

impl SessionChanges {
    pub fn new(session: &Session) -> Self {
        Self {
            name: session.name().to_string(),
            ..Self::default()
        }
    }

    pub fn algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.algorithm = Some(algorithm.into());
        self
    }

    /// New target objective and its direction.
    pub fn target(mut self, objective: impl Into<String>, more_is_better: bool) -> Self {
        self.target_objective = Some(objective.into());
        self.more_is_better = Some(more_is_better);
        self
    }

    pub fn tuning_knobs(mut self, knobs: Vec<String>) -> Self {
        self.tuning_knobs = Some(knobs);
        self
    }

    /// True when only the session name would be sent.
    pub fn is_empty(&self) -> bool {
        self.algorithm.is_none() && self.target_objective.is_none() && self.tuning_knobs.is_none()
    }
}

/// Knobs recommended for a session, consumed once by the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub session: Session,
    pub knobs: KnobSet,
}

/// Wire shape of a ready result: `{"Recommendation": {key: value, ...}}`.
#[derive(Debug, Deserialize)]
pub(crate) struct RecommendationBody {
    #[serde(rename = "Recommendation", alias = "recommendation")]
    pub recommendation: BTreeMap<String, serde_json::Value>,
}

impl RecommendationBody {
    pub(crate) fn into_recommendation(self, session: &Session) -> Recommendation {
        Recommendation {
            session: session.clone(),
            knobs: self
                .recommendation
                .into_iter()
                .map(|(k, v)| (k, KnobValue::from(v)))
                .collect(),
        }
    }
}

/// Result of a single fetch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Ready(Recommendation),
    /// Non-success status; the service has nothing for this session yet.
    NotReady { status: u16, body: String },
}

/// How long and how often to poll. The interval is fixed; there is no backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_wait: Duration,
    pub interval: Duration,
}

impl Default for PollPolicy {
    /// 180 s budget, one attempt every 5 s.
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(180),
            interval: Duration::from_secs(5),
        }
    }
}

/// The remote optimizer.
#[async_trait]
pub trait RecommendationService: Send + Sync {
    /// Submit `observation` for `session`; returns the service's acknowledgement text.
    ///
    /// # Errors
    /// [`TuneError::SubmissionRejected`](crate::error::TuneError::SubmissionRejected)
    /// on a non-success status, carrying the body verbatim.
    async fn request_recommendation(
        &self,
        session: &Session,
        observation: &Observation,
    ) -> Result<String>;

    /// One fetch attempt. Non-success statuses are `Ok(NotReady)`, not errors.
    async fn fetch_recommendation(&self, session: &Session) -> Result<FetchOutcome>;

    /// Block until a recommendation is ready; see [`poll_until_ready`].
    async fn poll_recommendation(
        &self,
        session: &Session,
        policy: PollPolicy,
        cancel: &CancellationToken,
    ) -> Result<Recommendation> {
        poll_until_ready(self, session, policy, cancel).await
    }
}
