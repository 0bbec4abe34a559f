//! Queue, flush policy and SQLite persistence working together.

use std::sync::Arc;
use std::time::Duration;

use surveyshield::anonymize::PatternAnonymizer;
use surveyshield::cluster::{InstanceIdentity, LeaderCoordinator, PeerClient};
use surveyshield::config::{DeploymentMode, ElectionConfig, FlushConfig};
use surveyshield::coordination::sqlite::SqliteSettingsStore;
use surveyshield::dss::{FixedDice, FlushPolicy, FlushScheduler, QuestionType, SubmittedAnswer};
use surveyshield::storage::sqlite::SqliteResponseSink;
use surveyshield::storage::ResponseSink;
use tempfile::TempDir;

struct Instance {
    coordinator: Arc<LeaderCoordinator>,
    scheduler: FlushScheduler,
}

fn instance(path: &str, host: &str, dice: u32, flush: &FlushConfig) -> (Instance, Arc<SqliteResponseSink>) {
    let identity = InstanceIdentity::new(host, 8480);
    let peer = PeerClient::new(identity.clone(), "secret", Duration::from_millis(200)).unwrap();
    let coordinator = Arc::new(LeaderCoordinator::new(
        identity,
        DeploymentMode::Multi,
        Arc::new(SqliteSettingsStore::new(path).unwrap()),
        Arc::new(peer),
        ElectionConfig::default(),
    ));
    let sink = Arc::new(SqliteResponseSink::new(path).unwrap());
    let scheduler = FlushScheduler::new(
        FlushPolicy::from_config(flush).unwrap(),
        coordinator.clone(),
        Arc::new(PatternAnonymizer::new().unwrap()),
        sink.clone(),
        Arc::new(FixedDice(dice)),
    );
    (
        Instance {
            coordinator,
            scheduler,
        },
        sink,
    )
}

fn answers(n: usize) -> Vec<SubmittedAnswer> {
    (0..n)
        .map(|i| SubmittedAnswer {
            question_id: i as i64 + 1,
            question_type: QuestionType::FreeText,
            answer: format!("answer {i}, reach me at p{i}@example.com"),
        })
        .collect()
}

fn db() -> (TempDir, String) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shield.db").to_str().unwrap().to_string();
    (dir, path)
}

#[tokio::test]
async fn small_batch_waits_for_explicit_flush() {
    let (_dir, path) = db();
    let flush = FlushConfig {
        min_percentage: 100,
        max_percentage: 100,
        min_batch_size: 3,
        ..FlushConfig::default()
    };
    let (leader, sink) = instance(&path, "a", 0, &flush);
    leader.coordinator.run_check().await;
    assert!(leader.coordinator.is_leader());

    leader.scheduler.enqueue(11, answers(2));
    for _ in 0..10 {
        let report = leader.scheduler.tick().await.unwrap();
        assert_eq!(report.persisted, 0);
    }
    assert_eq!(sink.count_responses(11).await.unwrap(), 0);

    let result = leader.scheduler.flush_now(11).await.unwrap();
    assert_eq!(result.persisted, 2);
    assert_eq!(sink.count_responses(11).await.unwrap(), 2);
    assert_eq!(leader.scheduler.status().pending, 0);
}

#[tokio::test]
async fn only_the_leader_writes() {
    let (_dir, path) = db();
    let flush = FlushConfig {
        min_percentage: 100,
        max_percentage: 100,
        min_batch_size: 1,
        ..FlushConfig::default()
    };
    let (a, sink) = instance(&path, "a", 0, &flush);
    let (b, _) = instance(&path, "b", 0, &flush);
    a.coordinator.run_check().await;
    b.coordinator.run_check().await;
    assert!(a.coordinator.is_leader());
    assert!(!b.coordinator.is_leader());

    a.scheduler.enqueue(1, answers(3));
    b.scheduler.enqueue(1, answers(4));

    let report_a = a.scheduler.tick().await.unwrap();
    let report_b = b.scheduler.tick().await.unwrap();
    assert_eq!(report_a.persisted, 3);
    assert_eq!(report_b.persisted, 0);
    assert_eq!(b.scheduler.flush_now(1).await.unwrap().persisted, 0);

    assert_eq!(sink.count_responses(1).await.unwrap(), 3);
    assert_eq!(a.scheduler.status().pending, 0);
    assert_eq!(b.scheduler.status().pending, 4);
}

#[tokio::test]
async fn status_pending_drops_by_flushed_count() {
    let (_dir, path) = db();
    let flush = FlushConfig {
        min_percentage: 100,
        max_percentage: 100,
        min_batch_size: 2,
        ..FlushConfig::default()
    };
    let (leader, sink) = instance(&path, "a", 0, &flush);
    leader.coordinator.run_check().await;

    leader.scheduler.enqueue(1, answers(5));
    leader.scheduler.enqueue(2, answers(1));
    let before = leader.scheduler.status().pending;

    let report = leader.scheduler.tick().await.unwrap();
    let after = leader.scheduler.status().pending;
    assert_eq!(report.persisted, 5);
    assert_eq!(before - after, report.persisted);
    assert_eq!(sink.count_responses(1).await.unwrap(), 5);
    assert_eq!(sink.count_responses(2).await.unwrap(), 0);
}

#[tokio::test]
async fn persisted_free_text_is_redacted() {
    let (_dir, path) = db();
    let flush = FlushConfig {
        min_batch_size: 1,
        ..FlushConfig::default()
    };
    let (leader, _) = instance(&path, "a", 0, &flush);
    leader.coordinator.run_check().await;
    leader.scheduler.enqueue(3, answers(1));
    leader.scheduler.flush_now(3).await.unwrap();

    let conn = rusqlite::Connection::open(&path).unwrap();
    let stored: String = conn
        .query_row("SELECT answer FROM responses WHERE survey_id = 3", [], |row| row.get(0))
        .unwrap();
    assert_eq!(stored, "answer 0, reach me at [email]");
}
