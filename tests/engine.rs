//! End-to-end behavior of the engine against fake sources.

mod common;

use std::sync::Arc;
use std::time::Duration;

use advisory_engine::models::{ChangeType, JobStatus, RiskLevel};
use advisory_engine::pipeline::{Readiness, SourceHealth};
use advisory_engine::storage::LocalStorage;
use chrono::{DateTime, Utc};
use common::{FakeSource, Reply};

const C1: &str = "Exercise increased caution due to terrorism.";
const C2: &str = "Exercise increased caution due to terrorism and civil unrest.";

fn since_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

#[tokio::test(start_paused = true)]
async fn repeated_identical_content_yields_one_event() {
    let source = FakeSource::new("fake", vec![Reply::Advisory(C1, RiskLevel::ExerciseCaution)]);
    let (engine, _store) = common::engine(common::config("fake"), source.clone());

    for _ in 0..3 {
        let report = engine.run_once("fake", Some("France")).await.unwrap();
        assert!(report.succeeded());
    }

    let events = engine.changes_since(since_epoch()).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].change_type, ChangeType::New);
    assert_eq!(source.calls(), 3);

    let latest = engine.latest_advisories("france", None).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].risk_level_standardized, RiskLevel::ExerciseCaution);
}

#[tokio::test(start_paused = true)]
async fn content_and_risk_changes_are_classified() {
    let source = FakeSource::new(
        "fake",
        vec![
            Reply::Advisory(C1, RiskLevel::ExerciseCaution),
            Reply::Advisory(C2, RiskLevel::ExerciseCaution),
            Reply::Advisory(C2, RiskLevel::ReconsiderTravel),
        ],
    );
    let (engine, _store) = common::engine(common::config("fake"), source);

    for _ in 0..3 {
        engine.run_once("fake", Some("France")).await.unwrap();
    }

    let types: Vec<_> = engine
        .changes_since(since_epoch())
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.change_type)
        .collect();
    assert_eq!(
        types,
        vec![ChangeType::New, ChangeType::ContentChanged, ChangeType::RiskChanged]
    );

    let snap = engine.metrics();
    assert_eq!(snap.sources["fake"].changes, 3);
}

#[tokio::test(start_paused = true)]
async fn retries_are_bounded_then_dead_lettered() {
    let source = FakeSource::new("fake", vec![Reply::Down]);
    let (engine, _store) = common::engine(common::config("fake"), source.clone());

    let report = engine.run_once("fake", Some("France")).await.unwrap();
    assert_eq!(report.job.status, JobStatus::DeadLetter);
    assert_eq!(report.job.attempt_count, 4);
    assert_eq!(source.calls(), 4);

    let dead = engine.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, report.job.id);
    assert_eq!(dead[0].attempt_count, 4);
    assert!(dead[0].reason.contains("connection refused"));

    let statuses: Vec<_> = report.job.history.iter().map(|h| h.status).collect();
    assert_eq!(statuses.first(), Some(&JobStatus::Pending));
    assert_eq!(statuses.last(), Some(&JobStatus::DeadLetter));
    assert_eq!(
        statuses.iter().filter(|s| **s == JobStatus::Retrying).count(),
        3
    );
}

#[tokio::test(start_paused = true)]
async fn open_circuit_defers_without_spending_attempts() {
    let mut config = common::config("fake");
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.recovery_timeout_secs = 30;
    let source = FakeSource::new("fake", vec![Reply::Down]);
    let (engine, _store) = common::engine(config, source.clone());

    let report = engine.run_once("fake", Some("France")).await.unwrap();
    assert_eq!(report.job.status, JobStatus::DeadLetter);

    // Every source call spent an attempt; breaker rejections did not.
    assert_eq!(source.calls(), report.job.attempt_count);
    assert_eq!(source.calls(), 4);

    let snap = engine.metrics();
    assert!(snap.sources["fake"].circuit_rejections >= 1);
    assert!(
        report
            .job
            .history
            .iter()
            .any(|h| h.note.as_deref().is_some_and(|n| n.contains("Circuit open")))
    );
    assert_eq!(engine.source_health()["fake"], SourceHealth::Down);
}

#[tokio::test(start_paused = true)]
async fn parse_failures_fail_fast_and_show_in_health() {
    let mut config = common::config("fake");
    config.health.window = 4;
    let source = FakeSource::new("fake", vec![Reply::Garbage]);
    let (engine, _store) = common::engine(config, source.clone());

    let report = engine.run_once("fake", Some("France")).await.unwrap();
    assert_eq!(report.job.status, JobStatus::Failure);
    assert_eq!(source.calls(), 1);
    assert!(engine.dead_letters().await.unwrap().is_empty());

    assert_eq!(engine.metrics().sources["fake"].parse_errors, 1);
    assert!(matches!(
        engine.source_health()["fake"],
        SourceHealth::Degraded { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn scheduled_work_runs_through_workers() {
    let source = FakeSource::new("fake", vec![Reply::Advisory(C1, RiskLevel::ExerciseCaution)]);
    let (engine, _store) = common::engine(common::config("fake"), source.clone());

    engine.start().unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(source.calls(), 1);

    // One more cadence (1h for high-priority sources).
    tokio::time::sleep(Duration::from_secs(3_600)).await;
    assert_eq!(source.calls(), 2);
    engine.shutdown().await;

    let done = engine.jobs(Some(JobStatus::Success)).await.unwrap();
    assert_eq!(done.len(), 2);
    assert_eq!(engine.changes_since(since_epoch()).await.unwrap().len(), 1);
    assert_eq!(engine.source_health()["fake"], SourceHealth::Healthy);
}

#[tokio::test(start_paused = true)]
async fn dead_letters_can_be_reprocessed() {
    let source = FakeSource::new("fake", vec![Reply::Down]);
    let (engine, _store) = common::engine(common::config("fake"), source.clone());

    let dead = engine.run_once("fake", Some("France")).await.unwrap().job;
    assert_eq!(dead.status, JobStatus::DeadLetter);

    source.set(vec![Reply::Advisory(C1, RiskLevel::ExerciseCaution)]);
    let job = engine.reprocess_dead_letter(&dead.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt_count, 0);
    assert!(engine.dead_letters().await.unwrap().is_empty());
    assert!(engine.queue_status().high >= 1);

    engine.start().unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    engine.shutdown().await;

    let replayed = engine.job(&dead.id).await.unwrap().unwrap();
    assert_eq!(replayed.status, JobStatus::Success);
    assert!(engine.reprocess_dead_letter(&dead.id).await.is_err());
}

#[tokio::test]
async fn readiness_tracks_backlog_and_store() {
    let mut config = common::config("fake");
    config.engine.queue_backlog_limit = 1;
    let source = FakeSource::new("fake", vec![Reply::Advisory(C1, RiskLevel::ExerciseCaution)]);
    let (engine, _store) = common::engine(config.clone(), source.clone());

    assert_eq!(engine.readiness().await, Readiness::Ready);
    engine.enqueue("fake", Some("France")).await.unwrap();
    engine.enqueue("fake", None).await.unwrap();
    match engine.readiness().await {
        Readiness::NotReady { reasons } => {
            assert_eq!(reasons.len(), 1);
            assert!(reasons[0].contains("backlog"));
        }
        Readiness::Ready => panic!("backlog over limit should not be ready"),
    }

    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "not a directory").unwrap();
    let root = blocker.join("state");
    let store = Arc::new(LocalStorage::new(&root));
    let engine = common::engine_with_store(config, source, store);
    assert!(!engine.readiness().await.is_ready());
}

#[tokio::test]
async fn unknown_sources_are_rejected() {
    let source = FakeSource::new("fake", vec![Reply::Down]);
    let (engine, _store) = common::engine(common::config("fake"), source);
    assert!(engine.enqueue("nope", None).await.is_err());
}
