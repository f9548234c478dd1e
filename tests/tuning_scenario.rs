//! One full tuning iteration: collector over a scripted database, the real
//! HTTP client against a stub tuning server, and the two-phase driver over a
//! scripted deployment tool.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::StubServer;
use serde_yaml::Value;
use smarttune::collector::{TidbCollector, SELECT_VERSION, SHOW_CONFIG, SHOW_GLOBAL_VARIABLES};
use smarttune::driver::{reapply_last, ConfigDriver};
use smarttune::journal::Journal;
use smarttune::observation::SubmitRequest;
use smarttune::recommend::{HttpRecommendationClient, PollPolicy, Session};
use smarttune::source::{Row, SqlConnector, SqlSession};
use smarttune::topology::{TopologyDocument, TopologyManager};
use smarttune::tuning_loop::{LoopConfig, LoopState, TuningLoop};
use smarttune::{Result, TuneError};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Scripted database
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct ScriptedDb {
    statements: Arc<Mutex<Vec<String>>>,
}

struct ScriptedSession(ScriptedDb);

fn row(cols: &[&str]) -> Row {
    cols.iter().map(|c| Some(c.to_string())).collect()
}

#[async_trait]
impl SqlConnector for ScriptedDb {
    type Session = ScriptedSession;
    async fn connect(&self) -> Result<ScriptedSession> {
        Ok(ScriptedSession(self.clone()))
    }
}

#[async_trait]
impl SqlSession for ScriptedSession {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.0.statements.lock().unwrap().push(sql.to_string());
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> Result<Vec<Row>> {
        self.0.statements.lock().unwrap().push(sql.to_string());
        let rows = match sql {
            SHOW_CONFIG => vec![
                row(&["tikv", "10.0.0.3:20160", "storage.reserve-space", "5GiB"]),
                row(&["tikv", "10.0.0.4:20160", "storage.reserve-space", "2GiB"]),
                row(&["tidb", "10.0.0.1:4000", "log.level", "info"]),
            ],
            SHOW_GLOBAL_VARIABLES => vec![
                row(&["tidb_mem_quota_query", "1073741824"]),
                row(&["tidb.log.level", "debug"]),
            ],
            SELECT_VERSION => vec![row(&["5.7.25-TiDB-v6.1.0"])],
            q if q.contains("tidb_qps") => vec![row(&["1520.25"])],
            q if q.contains("tidb_query_duration") => vec![row(&["0.012"])],
            other => {
                return Err(TuneError::QueryFailed {
                    statement: other.to_string(),
                    detail: "unexpected".into(),
                })
            }
        };
        Ok(rows)
    }

    async fn close(self) {}
}

// ---------------------------------------------------------------------------
// Scripted deployment tool
// ---------------------------------------------------------------------------

const TOPOLOGY: &str = "\
global:
  user: tidb
tidb_servers:
  - host: 10.0.0.1
  - host: 10.0.0.2
    config:
      log.slow-threshold: 300
tikv_servers:
  - host: 10.0.0.3
";

#[derive(Clone, Default)]
struct ScriptedTiup {
    persisted: Arc<Mutex<Vec<String>>>,
    reloads: Arc<Mutex<Vec<Vec<String>>>>,
}

#[async_trait]
impl TopologyManager for ScriptedTiup {
    async fn show_config(&self, _: &str) -> Result<String> {
        let persisted = self.persisted.lock().unwrap();
        Ok(persisted.last().cloned().unwrap_or_else(|| TOPOLOGY.to_string()))
    }

    async fn edit_config(&self, _: &str, topology: &str) -> Result<()> {
        self.persisted.lock().unwrap().push(topology.to_string());
        Ok(())
    }

    async fn reload(&self, _: &str, roles: &[String]) -> Result<()> {
        self.reloads.lock().unwrap().push(roles.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

const RECOMMENDATION: &str =
    r#"{"Recommendation": {"global.timeout": 30, "tidb.cache_size": "256MB"}}"#;

async fn tuning_server() -> StubServer {
    StubServer::start(|req, _| match (req.method.as_str(), req.path.as_str()) {
        ("POST", "/api/result/generate/sess1") => (200, "ok".into()),
        ("GET", "/api/result/query/sess1") => (200, RECOMMENDATION.into()),
        _ => (404, "unknown session".into()),
    })
    .await
}

fn loop_config() -> LoopConfig {
    LoopConfig {
        max_iterations: 1,
        observation_window: Duration::from_millis(20),
        poll: PollPolicy {
            max_wait: Duration::from_secs(5),
            interval: Duration::from_millis(20),
        },
        workload: "tpcc".into(),
    }
}

#[tokio::test]
async fn sess1_full_iteration() {
    let server = tuning_server().await;
    let db = ScriptedDb::default();
    let tiup = ScriptedTiup::default();
    let dir = tempfile::tempdir().unwrap();
    let journal = Journal::open(&dir.path().join("journal.db")).unwrap();

    let mut tuning = TuningLoop::new(
        Session::new("sess1"),
        TidbCollector::new(db.clone()),
        HttpRecommendationClient::builder(server.addr.clone()).build(),
        ConfigDriver::new(db.clone(), tiup.clone(), "prod"),
        loop_config(),
    )
    .with_journal(journal);

    let summary = tuning.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(tuning.state(), LoopState::Done);
    assert_eq!(summary.iterations.len(), 1);
    let report = &summary.iterations[0].report;
    assert_eq!(report.globals_applied, vec!["timeout"]);
    assert_eq!(report.roles_reloaded, vec!["tidb"]);
    assert_eq!(report.nodes_updated, 2);

    // The submitted knobs: configuration table wins over variable table.
    let seen = server.seen();
    let post = seen.iter().find(|r| r.method == "POST").unwrap();
    let body: SubmitRequest = serde_json::from_str(&post.body).unwrap();
    let knobs: serde_json::Value = serde_json::from_str(&body.knobs).unwrap();
    assert_eq!(knobs["global"]["tikv.storage.reserve-space"], "5GiB");
    assert_eq!(knobs["global"]["tidb.log.level"], "info");
    assert_eq!(knobs["global"]["tidb_mem_quota_query"], "1073741824");
    let after: serde_json::Value = serde_json::from_str(&body.metrics_after).unwrap();
    assert_eq!(after["global"]["tidb.tidb_qps"], 1520.25);

    // Exactly one global statement, after the metric session settings.
    let statements = db.statements.lock().unwrap().clone();
    let globals: Vec<&String> = statements
        .iter()
        .filter(|s| s.starts_with("SET @@GLOBAL."))
        .collect();
    assert_eq!(globals, vec!["SET @@GLOBAL.timeout = 30"]);
    assert!(statements.iter().any(|s| s.contains("tidb_metric_query_step")));

    // Both tidb nodes carry the override; the tikv node does not.
    let persisted = tiup.persisted.lock().unwrap().clone();
    assert_eq!(persisted.len(), 1);
    let doc = TopologyDocument::parse(&persisted[0]).unwrap();
    for i in 0..2 {
        assert_eq!(
            doc.node_config("tidb_servers", i).unwrap().get("cache_size"),
            Some(&Value::from("256MB"))
        );
    }
    assert_eq!(
        doc.node_config("tidb_servers", 1).unwrap().get("log.slow-threshold"),
        Some(&Value::from(300))
    );
    assert!(doc.node_config("tikv_servers", 0).is_none());
    assert_eq!(*tiup.reloads.lock().unwrap(), vec![vec!["tidb".to_string()]]);

    // Journal entry is complete and re-applying it converges.
    let journal = tuning.journal().unwrap();
    let entries = journal.entries("sess1").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].state, "applied");

    let driver = ConfigDriver::new(db.clone(), tiup.clone(), "prod");
    reapply_last(journal, "sess1", &driver).await.unwrap();
    let persisted = tiup.persisted.lock().unwrap().clone();
    assert_eq!(
        TopologyDocument::parse(&persisted[0]).unwrap(),
        TopologyDocument::parse(&persisted[1]).unwrap()
    );
}

#[tokio::test]
async fn unknown_session_stops_in_requesting() {
    let server = tuning_server().await;
    let db = ScriptedDb::default();
    let tiup = ScriptedTiup::default();

    let mut tuning = TuningLoop::new(
        Session::new("other"),
        TidbCollector::new(db.clone()),
        HttpRecommendationClient::builder(server.addr.clone()).build(),
        ConfigDriver::new(db.clone(), tiup.clone(), "prod"),
        loop_config(),
    );
    let err = tuning.run(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.iteration, 1);
    assert_eq!(err.phase, LoopState::Requesting);
    assert!(matches!(
        err.source,
        TuneError::SubmissionRejected { status: 404, .. }
    ));
    assert!(tiup.persisted.lock().unwrap().is_empty());
}
