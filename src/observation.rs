//! Metric snapshots, the before/after observation built from them, and the
//! submission body sent to the recommendation service.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::knob::{KnobSet, KnobValue};

/// Scope a snapshot's values were read at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricScope {
    Global,
    Local,
}

impl MetricScope {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricScope::Global => "global",
            MetricScope::Local => "local",
        }
    }
}

/// Metric name → value, captured at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSnapshot {
    pub scope: MetricScope,
    pub captured_at: SystemTime,
    pub values: BTreeMap<String, KnobValue>,
}

impl MetricSnapshot {
    pub fn new(scope: MetricScope) -> Self {
        Self {
            scope,
            captured_at: SystemTime::now(),
            values: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&KnobValue> {
        self.values.get(name)
    }

    /// `{"global": {...}, "local": null}` with the snapshot's scope filled in.
    pub fn to_scoped_json(&self) -> serde_json::Value {
        let mut doc = serde_json::Map::new();
        for scope in [MetricScope::Global, MetricScope::Local] {
            let value = if scope == self.scope {
                serde_json::to_value(&self.values).unwrap_or(serde_json::Value::Null)
            } else {
                serde_json::Value::Null
            };
            doc.insert(scope.as_str().to_string(), value);
        }
        serde_json::Value::Object(doc)
    }
}

/// System type and version reported by the tuned database.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemVersion {
    pub system_type: String,
    pub version: String,
}

impl SystemVersion {
    /// Parse a `SELECT VERSION()` result such as `5.7.25-TiDB-v6.1.0`.
    ///
    /// Strings without a `-TiDB-` marker are reported as `mysql` with the
    /// raw string as version.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let mut parts = raw.splitn(3, '-');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(kind), Some(version)) if !kind.is_empty() => SystemVersion {
                system_type: kind.to_ascii_lowercase(),
                version: version.to_string(),
            },
            _ => SystemVersion {
                system_type: "mysql".to_string(),
                version: raw.to_string(),
            },
        }
    }
}

/// The wall-clock window between the two metric snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationWindow {
    pub started_at: SystemTime,
    pub ended_at: SystemTime,
}

impl ObservationWindow {
    pub fn elapsed(&self) -> Duration {
        self.ended_at
            .duration_since(self.started_at)
            .unwrap_or(Duration::ZERO)
    }
}

/// Everything learned about the currently applied configuration in one iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub knobs: KnobSet,
    pub before: MetricSnapshot,
    pub after: MetricSnapshot,
    pub window: ObservationWindow,
    pub system: SystemVersion,
    pub workload: String,
}

/// Summary document carried in the `summary` field of a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationSummary {
    /// Epoch milliseconds.
    pub start_time: u64,
    /// Epoch milliseconds.
    pub end_time: u64,
    /// Seconds.
    pub observation_time: u64,
    pub system_type: String,
    pub version: String,
    pub workload: String,
}

/// Body of `POST /api/result/generate/{session}`.
///
/// Every field is itself a JSON document encoded as a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub summary: String,
    pub knobs: String,
    pub metrics_before: String,
    pub metrics_after: String,
}

fn epoch_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Observation {
    pub fn summary(&self) -> ObservationSummary {
        ObservationSummary {
            start_time: epoch_millis(self.window.started_at),
            end_time: epoch_millis(self.window.ended_at),
            observation_time: self.window.elapsed().as_secs(),
            system_type: self.system.system_type.clone(),
            version: self.system.version.clone(),
            workload: self.workload.clone(),
        }
    }

    pub fn to_submission(&self) -> Result<SubmitRequest, serde_json::Error> {
        Ok(SubmitRequest {
            summary: serde_json::to_string(&self.summary())?,
            knobs: serde_json::to_string(&self.knobs.to_scoped_json())?,
            metrics_before: serde_json::to_string(&self.before.to_scoped_json())?,
            metrics_after: serde_json::to_string(&self.after.to_scoped_json())?,
        })
    }
}
