//! A follower handing submissions and survey closes to a live leader over
//! signed HTTP.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use surveyshield::anonymize::PassThroughAnonymizer;
use surveyshield::cluster::{InstanceIdentity, LeaderCoordinator, PeerClient};
use surveyshield::config::{Config, DeploymentMode, FlushConfig};
use surveyshield::coordination::sqlite::SqliteSettingsStore;
use surveyshield::dss::{FixedDice, FlushPolicy, FlushScheduler};
use surveyshield::storage::memory::MemoryResponseSink;
use surveyshield::storage::ResponseSink;
use surveyshield::AppState;
use tempfile::TempDir;
use tower::ServiceExt;

const SECRET: &str = "integration-secret";

fn build_state(
    db_path: &str,
    identity: InstanceIdentity,
    sink: Arc<MemoryResponseSink>,
) -> Arc<AppState> {
    let mut config = Config::default();
    config.cluster.mode = DeploymentMode::Multi;
    config.cluster.shared_secret = SECRET.to_string();
    config.observability.metrics = false;

    let peer = Arc::new(PeerClient::new(identity.clone(), SECRET, Duration::from_secs(2)).unwrap());
    let coordinator = Arc::new(LeaderCoordinator::new(
        identity,
        DeploymentMode::Multi,
        Arc::new(SqliteSettingsStore::new(db_path).unwrap()),
        peer.clone(),
        config.election.clone(),
    ));
    let flush = FlushConfig {
        min_batch_size: 1,
        ..FlushConfig::default()
    };
    let scheduler = Arc::new(FlushScheduler::new(
        FlushPolicy::from_config(&flush).unwrap(),
        coordinator.clone(),
        Arc::new(PassThroughAnonymizer),
        sink,
        // Never flushes on a tick: only explicit closes persist here.
        Arc::new(FixedDice(99)),
    ));
    Arc::new(AppState {
        config,
        coordinator,
        scheduler,
        peer,
    })
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn follower_forwards_to_leader() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("shield.db").to_str().unwrap().to_string();

    // Leader: a real listener so the follower can reach it.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let leader_sink = Arc::new(MemoryResponseSink::new());
    let leader = build_state(
        &db_path,
        InstanceIdentity::new("127.0.0.1", port),
        leader_sink.clone(),
    );
    leader.coordinator.run_check().await;
    assert!(leader.coordinator.is_leader());
    let app = surveyshield::server::app(leader.clone());
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    // Follower: joins only after the connectivity guard passes.
    let follower_sink = Arc::new(MemoryResponseSink::new());
    let follower = build_state(
        &db_path,
        InstanceIdentity::new("127.0.0.2", 8480),
        follower_sink.clone(),
    );
    follower.coordinator.start().await.unwrap();
    follower.coordinator.wait_ready().await;
    assert!(!follower.coordinator.is_leader());

    let submit = Request::post("/surveys/21/responses")
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"answers":[
                {"question_id":1,"question_type":"rating","answer":"4"},
                {"question_id":2,"question_type":"yes_no","answer":"no"}
            ]}"#,
        ))
        .unwrap();
    let response = surveyshield::server::app(follower.clone())
        .oneshot(submit)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["count"], 2);

    assert_eq!(follower.scheduler.status().pending, 0);
    assert_eq!(leader.scheduler.status().pending, 2);

    let close = Request::post("/surveys/21/close").body(Body::empty()).unwrap();
    let response = surveyshield::server::app(follower.clone())
        .oneshot(close)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["count"], 2);

    assert_eq!(leader_sink.count_responses(21).await.unwrap(), 2);
    assert_eq!(follower_sink.count_responses(21).await.unwrap(), 0);

    follower.coordinator.stop().await;
    server.abort();
}
