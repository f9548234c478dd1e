//! # Stage: Collector
//!
//! ## Responsibility
//! Reads the current knob values, a window of runtime metrics and the
//! server version from a live TiDB instance.
//!
//! ## Guarantees
//! - Scoped: every call opens its own session and closes it on every exit
//!   path, including errors.
//! - All-or-nothing: a failure part-way through a read discards whatever was
//!   read so far.
//! - First writer wins: when the configuration table and the variable table
//!   report the same key, the configuration table's value is kept.
//!
//! ## NOT Responsible For
//! - Deciding which knobs are tunable (the recommendation service does)
//! - Writing knobs back (see `driver`)

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, TuneError};
use crate::knob::{KnobSet, KnobValue};
use crate::observation::{MetricScope, MetricSnapshot, SystemVersion};
use crate::source::{Row, SqlConnector, SqlSession};

/// Observability reads against one tuned system.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn collect_knobs(&self) -> Result<KnobSet>;
    async fn collect_metrics(&self) -> Result<MetricSnapshot>;
    async fn collect_version(&self) -> Result<SystemVersion>;
}

/// A named single-value metric query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricQuery {
    pub name: String,
    pub sql: String,
}

impl MetricQuery {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

pub const SHOW_CONFIG: &str = "SHOW CONFIG";
pub const SHOW_GLOBAL_VARIABLES: &str = "SHOW GLOBAL VARIABLES";
pub const SELECT_VERSION: &str = "SELECT VERSION()";

/// Session settings that pin the metrics-schema aggregation window to 30 s.
pub fn default_session_settings() -> Vec<String> {
    vec![
        "SET @@tidb_metric_query_range_duration = 30".to_string(),
        "SET @@tidb_metric_query_step = 30".to_string(),
    ]
}

/// QPS and p99 query duration over `now()-4m .. now()-1m`.
pub fn default_metric_queries() -> Vec<MetricQuery> {
    vec![
        MetricQuery::new(
            "tidb.tidb_qps",
            "SELECT sum(value)/7 AS value FROM METRICS_SCHEMA.tidb_qps \
             WHERE result='OK' AND time BETWEEN now() - INTERVAL 4 MINUTE AND now() - INTERVAL 1 MINUTE",
        ),
        MetricQuery::new(
            "tidb.tidb_query_duration",
            "SELECT avg(value) AS value FROM METRICS_SCHEMA.tidb_query_duration \
             WHERE quantile=0.99 AND time BETWEEN now() - INTERVAL 4 MINUTE AND now() - INTERVAL 1 MINUTE",
        ),
    ]
}

/// [`Collector`] for TiDB, generic over how SQL reaches the server.
pub struct TidbCollector<C> {
    connector: C,
    session_settings: Vec<String>,
    metric_queries: Vec<MetricQuery>,
}

impl<C: SqlConnector> TidbCollector<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            session_settings: default_session_settings(),
            metric_queries: default_metric_queries(),
        }
    }

    pub fn with_metric_queries(mut self, queries: Vec<MetricQuery>) -> Self {
        self.metric_queries = queries;
        self
    }

    pub fn with_session_settings(mut self, settings: Vec<String>) -> Self {
        self.session_settings = settings;
        self
    }

    async fn read_knobs(session: &mut C::Session) -> Result<KnobSet> {
        let mut knobs = KnobSet::new();

        for row in session.query(SHOW_CONFIG).await? {
            let [kind, _instance, name, value] = columns::<4>(SHOW_CONFIG, row)?;
            let key = format!("{}.{}", kind.unwrap_or_default(), name.unwrap_or_default());
            knobs.insert_first(key, value.unwrap_or_default());
        }

        for row in session.query(SHOW_GLOBAL_VARIABLES).await? {
            let [name, value] = columns::<2>(SHOW_GLOBAL_VARIABLES, row)?;
            knobs.insert_first(name.unwrap_or_default(), value.unwrap_or_default());
        }

        Ok(knobs)
    }

    async fn read_metrics(&self, session: &mut C::Session) -> Result<MetricSnapshot> {
        for setting in &self.session_settings {
            session.execute(setting).await?;
        }

        let mut snapshot = MetricSnapshot::new(MetricScope::Global);
        for query in &self.metric_queries {
            let rows = session.query(&query.sql).await?;
            match rows.into_iter().next().and_then(|row| row.into_iter().next()).flatten() {
                Some(raw) => {
                    snapshot
                        .values
                        .entry(query.name.clone())
                        .or_insert_with(|| KnobValue::infer(&raw));
                }
                None => debug!(metric = %query.name, "metric query returned no value"),
            }
        }
        snapshot.captured_at = std::time::SystemTime::now();
        Ok(snapshot)
    }
}

/// Destructure a row into exactly `N` columns.
fn columns<const N: usize>(statement: &str, row: Row) -> Result<[Option<String>; N]> {
    let got = row.len();
    row.try_into().map_err(|_| TuneError::QueryFailed {
        statement: statement.to_string(),
        detail: format!("expected {N} columns, got {got}"),
    })
}

#[async_trait]
impl<C: SqlConnector> Collector for TidbCollector<C> {
    async fn collect_knobs(&self) -> Result<KnobSet> {
        let mut session = self.connector.connect().await?;
        let result = Self::read_knobs(&mut session).await;
        session.close().await;
        let knobs = result?;
        debug!(count = knobs.len(), "collected knobs");
        Ok(knobs)
    }

    async fn collect_metrics(&self) -> Result<MetricSnapshot> {
        let mut session = self.connector.connect().await?;
        let result = self.read_metrics(&mut session).await;
        session.close().await;
        result
    }

    async fn collect_version(&self) -> Result<SystemVersion> {
        let mut session = self.connector.connect().await?;
        let result = session.query(SELECT_VERSION).await;
        session.close().await;
        let raw = result?
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .flatten()
            .ok_or_else(|| TuneError::QueryFailed {
                statement: SELECT_VERSION.to_string(),
                detail: "empty result".to_string(),
            })?;
        Ok(SystemVersion::parse(&raw))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
