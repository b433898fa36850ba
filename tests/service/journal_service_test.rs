//! Tests for `src/service/mod.rs`: scheduling, retry, single-writer
//! claims and shutdown.

use std::time::Duration;

use jotter::diagnosis::DiagnosisError;
use jotter::service::{ServiceConfig, ServiceError};
use jotter::store::Store;
use jotter::types::{LogLevel, Stage};
use uuid::Uuid;

use crate::support::{
    collaborators, events_until_terminal, stages, FakeAnalyzer, FakeDiagnosticModel,
    FakeEmbedder, FakeFetcher, ServiceFixture,
};

fn hanging() -> ServiceFixture {
    ServiceFixture::with_config(
        collaborators(
            FakeAnalyzer::hanging(),
            FakeFetcher::default(),
            FakeEmbedder::ok(),
        ),
        FakeDiagnosticModel::answering(&[0.9]),
        ServiceConfig {
            shutdown_timeout: Duration::from_secs(2),
            ..ServiceConfig::default()
        },
    )
}

fn failing_analysis() -> ServiceFixture {
    ServiceFixture::new(
        collaborators(
            FakeAnalyzer::failing("model offline"),
            FakeFetcher::default(),
            FakeEmbedder::ok(),
        ),
        FakeDiagnosticModel::answering(&[0.6, 0.3]),
    )
}

#[tokio::test]
async fn create_returns_before_processing_finishes() {
    let fixture = hanging();

    let entry = fixture
        .service
        .create_entry("will hang in analysis")
        .await
        .expect("create");
    assert_eq!(entry.stage, Stage::Created);
    assert_eq!(fixture.service.in_flight_count(), 1);

    let stored = fixture.service.get_entry(entry.id).await.expect("get");
    assert_eq!(stored.content, "will hang in analysis");

    fixture.service.shutdown().await;
}

#[tokio::test]
async fn created_entry_completes_in_the_background() {
    let fixture = ServiceFixture::succeeding();
    let mut observer = fixture.service.subscribe();

    let entry = fixture.service.create_entry("a good day").await.expect("create");
    let events = events_until_terminal(&mut observer, entry.id).await;
    assert_eq!(
        stages(&events),
        vec![Stage::Analyzing, Stage::GeneratingEmbeddings, Stage::Completed]
    );

    fixture.service.wait_idle().await;
    assert_eq!(fixture.service.in_flight_count(), 0);
    let done = fixture.service.get_entry(entry.id).await.expect("get");
    assert_eq!(done.stage, Stage::Completed);

    let records = fixture.service.query_logs(entry.id, None).await.expect("logs");
    assert_eq!(records[0].message, "entry created");
    assert_eq!(records[0].stage, Stage::Created);
    assert_eq!(records[0].details["chars"], 10);
    assert_eq!(records.last().map(|r| r.stage), Some(Stage::Completed));

    fixture.service.shutdown().await;
}

#[tokio::test]
async fn blank_content_is_rejected() {
    let fixture = ServiceFixture::succeeding();
    for content in ["", "   \n\t"] {
        assert!(matches!(
            fixture.service.create_entry(content).await,
            Err(ServiceError::EmptyContent)
        ));
    }
    assert!(fixture
        .service
        .list_entries(10)
        .await
        .expect("list")
        .is_empty());
    fixture.service.shutdown().await;
}

#[tokio::test]
async fn unknown_entries_are_not_found() {
    let fixture = ServiceFixture::succeeding();
    let id = Uuid::new_v4();
    assert!(matches!(
        fixture.service.get_entry(id).await,
        Err(ServiceError::NotFound(missing)) if missing == id
    ));
    assert!(matches!(
        fixture.service.retry(id).await,
        Err(ServiceError::NotFound(missing)) if missing == id
    ));
    // A failed lookup releases its claim.
    assert_eq!(fixture.service.in_flight_count(), 0);
    fixture.service.shutdown().await;
}

#[tokio::test]
async fn retry_while_in_flight_is_refused() {
    let fixture = hanging();
    let entry = fixture.service.create_entry("busy").await.expect("create");

    assert!(matches!(
        fixture.service.retry(entry.id).await,
        Err(ServiceError::InProgress(id)) if id == entry.id
    ));

    fixture.service.shutdown().await;
    assert_eq!(fixture.service.in_flight_count(), 0);
}

#[tokio::test]
async fn retry_appends_to_earlier_logs() {
    let fixture = failing_analysis();
    let entry = fixture.service.create_entry("try twice").await.expect("create");
    fixture.service.wait_idle().await;
    let failed = fixture.service.get_entry(entry.id).await.expect("get");
    assert_eq!(failed.stage, Stage::Failed);

    let retried = fixture.service.retry(entry.id).await.expect("retry");
    assert_eq!(retried.stage, Stage::Created);
    assert!(retried.error.is_none());
    fixture.service.wait_idle().await;

    let records = fixture.service.query_logs(entry.id, None).await.expect("logs");
    let messages: Vec<&str> = records.iter().map(|r| r.message.as_str()).collect();
    assert_eq!(
        messages,
        vec![
            "entry created",
            "analysis started",
            "processing failed",
            "retry requested",
            "analysis started",
            "processing failed",
        ]
    );
    let retry_record = &records[3];
    assert_eq!(retry_record.details["previous_stage"], "failed");
    assert_eq!(
        retry_record.details["previous_error"],
        "analysis error: unavailable: model offline"
    );
    fixture.service.shutdown().await;
}

#[tokio::test]
async fn many_entries_process_independently() {
    let fixture = ServiceFixture::succeeding();
    let mut ids = Vec::new();
    for i in 0..10 {
        ids.push(
            fixture
                .service
                .create_entry(&format!("entry {i}"))
                .await
                .expect("create")
                .id,
        );
    }
    fixture.service.wait_idle().await;

    for id in &ids {
        let entry = fixture.service.get_entry(*id).await.expect("get");
        assert_eq!(entry.stage, Stage::Completed);
        let records = fixture.service.query_logs(*id, None).await.expect("logs");
        assert!(records.iter().all(|r| r.entry_id == *id));
    }
    let listed = fixture.service.list_entries(3).await.expect("list");
    assert_eq!(listed.len(), 3);
    fixture.service.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_work_and_flushes_logs() {
    let fixture = hanging();
    let entry = fixture.service.create_entry("interrupted").await.expect("create");
    // Let the task reach the analyzer call.
    let mut observer = fixture.service.subscribe();
    let _ = tokio::time::timeout(Duration::from_millis(200), observer.next_event()).await;

    tokio::time::timeout(Duration::from_secs(5), fixture.service.shutdown())
        .await
        .expect("shutdown completes");
    assert!(fixture.service.is_shutting_down());
    assert_eq!(fixture.service.in_flight_count(), 0);

    // Abandoned, not failed.
    let stored = fixture
        .store
        .get_entry(entry.id)
        .await
        .expect("get")
        .expect("exists");
    assert!(!stored.stage.is_terminal());

    let flushed = fixture.store.stored_logs();
    assert!(flushed
        .iter()
        .any(|r| r.entry_id == entry.id && r.message == "entry created"));
    assert_eq!(fixture.service.log_stats().buffered, 0);

    assert!(matches!(
        fixture.service.create_entry("too late").await,
        Err(ServiceError::ShuttingDown)
    ));
    // A second shutdown is a no-op.
    fixture.service.shutdown().await;
}

#[tokio::test]
async fn failed_entry_can_be_diagnosed() {
    let fixture = failing_analysis();
    let entry = fixture.service.create_entry("diagnose me").await.expect("create");
    fixture.service.wait_idle().await;

    let causes = fixture
        .service
        .analyze_failure(entry.id)
        .await
        .expect("diagnosis");
    assert_eq!(causes.len(), 2);
    assert_eq!(causes[0].cause, "cause 0");

    let records = fixture.service.query_logs(entry.id, None).await.expect("logs");
    assert!(records.iter().any(|r| r.level == LogLevel::Error));

    let unknown = Uuid::new_v4();
    assert!(matches!(
        fixture.service.analyze_failure(unknown).await,
        Err(ServiceError::Diagnosis(DiagnosisError::NoLogsAvailable(id))) if id == unknown
    ));
    fixture.service.shutdown().await;
}
