//! The HTTP recommendation client against a stub tuning server.

mod common;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::StubServer;
use smarttune::knob::{KnobSet, KnobValue};
use smarttune::observation::{
    MetricScope, MetricSnapshot, Observation, ObservationWindow, SubmitRequest, SystemVersion,
};
use smarttune::recommend::{
    FetchOutcome, HttpRecommendationClient, PollPolicy, RecommendationService, Session,
};
use smarttune::TuneError;
use tokio_util::sync::CancellationToken;

fn observation() -> Observation {
    let start = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    let end = start + Duration::from_secs(300);
    let mut before = MetricSnapshot::new(MetricScope::Global);
    before.captured_at = start;
    before
        .values
        .insert("tidb.tidb_qps".into(), KnobValue::Float(1500.5));
    let mut after = before.clone();
    after.captured_at = end;

    let mut knobs = KnobSet::new();
    knobs.insert("tikv.storage.block-cache.capacity", "4GB");
    knobs.insert("tidb_mem_quota_query", 1_073_741_824i64);

    Observation {
        knobs,
        before,
        after,
        window: ObservationWindow {
            started_at: start,
            ended_at: end,
        },
        system: SystemVersion::parse("5.7.25-TiDB-v6.1.0"),
        workload: "tpcc".into(),
    }
}

fn client(server: &StubServer) -> HttpRecommendationClient {
    HttpRecommendationClient::builder(server.addr.clone())
        .request_timeout(Duration::from_secs(5))
        .build()
}

#[tokio::test]
async fn submission_posts_string_encoded_documents() {
    let server = StubServer::start(|_, _| (200, "ok".into())).await;
    let ack = client(&server)
        .request_recommendation(&Session::new("sess1"), &observation())
        .await
        .unwrap();
    assert_eq!(ack, "ok");

    let seen = server.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, "POST");
    assert_eq!(seen[0].path, "/api/result/generate/sess1");

    let req: SubmitRequest = serde_json::from_str(&seen[0].body).unwrap();
    let summary: serde_json::Value = serde_json::from_str(&req.summary).unwrap();
    assert_eq!(summary["observation_time"], 300);
    assert_eq!(summary["start_time"], 1_700_000_000_000u64);
    assert_eq!(summary["system_type"], "tidb");
    assert_eq!(summary["version"], "v6.1.0");
    assert_eq!(summary["workload"], "tpcc");

    let knobs: serde_json::Value = serde_json::from_str(&req.knobs).unwrap();
    assert_eq!(knobs["global"]["tikv.storage.block-cache.capacity"], "4GB");
    assert!(knobs["local"].is_null());

    let before: serde_json::Value = serde_json::from_str(&req.metrics_before).unwrap();
    assert_eq!(before["global"]["tidb.tidb_qps"], 1500.5);
}

#[tokio::test]
async fn rejected_submission_keeps_body_verbatim() {
    let server = StubServer::start(|_, _| (500, "session sess1 not found".into())).await;
    let err = client(&server)
        .request_recommendation(&Session::new("sess1"), &observation())
        .await
        .unwrap_err();
    match err {
        TuneError::SubmissionRejected { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "session sess1 not found");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn fetch_parses_ready_recommendation() {
    let server = StubServer::start(|_, _| {
        (
            200,
            r#"{"Recommendation": {"global.timeout": 30, "tidb.cache_size": "256MB"}}"#.into(),
        )
    })
    .await;
    let outcome = client(&server)
        .fetch_recommendation(&Session::new("sess1"))
        .await
        .unwrap();
    let rec = match outcome {
        FetchOutcome::Ready(rec) => rec,
        other => panic!("expected ready, got {other:?}"),
    };
    assert_eq!(rec.knobs.get("global.timeout"), Some(&KnobValue::Int(30)));
    assert_eq!(
        rec.knobs.get("tidb.cache_size"),
        Some(&KnobValue::Text("256MB".into()))
    );
    assert_eq!(server.seen()[0].path, "/api/result/query/sess1");
    assert_eq!(server.seen()[0].method, "GET");
}

#[tokio::test]
async fn fetch_non_success_is_not_ready() {
    let server = StubServer::start(|_, _| (404, "pending".into())).await;
    let outcome = client(&server)
        .fetch_recommendation(&Session::new("s"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        FetchOutcome::NotReady {
            status: 404,
            body: "pending".into()
        }
    );
}

#[tokio::test]
async fn fetch_garbage_body_is_malformed() {
    let server = StubServer::start(|_, _| (200, "<html>".into())).await;
    let err = client(&server)
        .fetch_recommendation(&Session::new("s"))
        .await
        .unwrap_err();
    assert!(matches!(err, TuneError::MalformedResponse { .. }), "{err:?}");
}

#[tokio::test]
async fn poll_retries_until_ready() {
    let server = StubServer::start(|_, index| {
        if index < 2 {
            (404, "not yet".into())
        } else {
            (200, r#"{"Recommendation": {"tikv.raftstore.sync-log": false}}"#.into())
        }
    })
    .await;
    let policy = PollPolicy {
        max_wait: Duration::from_secs(5),
        interval: Duration::from_millis(50),
    };
    let rec = client(&server)
        .poll_recommendation(&Session::new("s"), policy, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        rec.knobs.get("tikv.raftstore.sync-log"),
        Some(&KnobValue::Bool(false))
    );
    assert_eq!(server.seen().len(), 3);
}

#[tokio::test]
async fn poll_gives_up_after_max_wait() {
    let server = StubServer::start(|_, _| (404, String::new())).await;
    let policy = PollPolicy {
        max_wait: Duration::from_millis(300),
        interval: Duration::from_millis(100),
    };
    let started = std::time::Instant::now();
    let err = client(&server)
        .poll_recommendation(&Session::new("s"), policy, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TuneError::RecommendationTimeout { .. }), "{err:?}");
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(server.seen().len() >= 3);
}

#[tokio::test]
async fn show_session_returns_document() {
    let server =
        StubServer::start(|_, _| (200, r#"{"name": "sess1", "system_type": "tidb"}"#.into())).await;
    let doc = client(&server)
        .show_session(&Session::new("sess1"))
        .await
        .unwrap();
    assert_eq!(doc["system_type"], "tidb");
    assert_eq!(server.seen()[0].path, "/api/session/show/sess1");
}

#[tokio::test]
async fn unreachable_server_is_source_unavailable() {
    // Bind then drop to get a port with nothing listening.
    let addr = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().to_string()
    };
    let err = HttpRecommendationClient::builder(addr)
        .connect_timeout(Duration::from_secs(1))
        .build()
        .fetch_recommendation(&Session::new("s"))
        .await
        .unwrap_err();
    assert!(matches!(err, TuneError::SourceUnavailable { .. }), "{err:?}");
}

#[test]
fn summary_timestamps_are_epoch_millis() {
    let obs = observation();
    let summary = obs.summary();
    let start_ms = obs
        .window
        .started_at
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    assert_eq!(summary.start_time, start_ms);
    assert_eq!(summary.end_time - summary.start_time, 300_000);
}
