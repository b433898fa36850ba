//! Tests for `src/pipeline/mod.rs`: stage transitions, fetch policy,
//! failures, timeouts and cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use jotter::pipeline::{Collaborators, PipelineConfig};
use jotter::store::Store;
use jotter::types::{EventType, JournalEntry, LogLevel, Stage};

use crate::support::{
    assert_stage_order, collaborators, drain_events, stages, FakeAnalyzer, FakeEmbedder,
    FakeFetcher, PipelineFixture,
};

fn live_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

async fn stored_entry(fixture: &PipelineFixture, entry: &JournalEntry) {
    fixture.store.insert_entry(entry).await.expect("insert");
}

#[tokio::test]
async fn entry_with_links_walks_every_stage() {
    let fixture = PipelineFixture::new(
        collaborators(
            FakeAnalyzer::with_links(&["https://a.example", "https://b.example"]),
            FakeFetcher::default(),
            FakeEmbedder::ok(),
        ),
        PipelineConfig::default(),
    );
    let mut observer = fixture.hub.subscribe();
    let entry = JournalEntry::new("read two articles");
    stored_entry(&fixture, &entry).await;
    let (_tx, rx) = live_shutdown();

    let done = fixture.pipeline.process(entry.clone(), rx).await;

    assert_eq!(done.stage, Stage::Completed);
    assert!(done.completed_at.is_some());
    assert!(done.error.is_none());
    let processed = done.processed.as_ref().expect("processed");
    assert_eq!(processed.embedding.len(), 4);
    assert_eq!(processed.links.len(), 2);
    assert_eq!(processed.links[0].title, "Title of https://a.example");

    let events = drain_events(&mut observer);
    assert_eq!(
        stages(&events),
        vec![
            Stage::Analyzing,
            Stage::FetchingUrls,
            Stage::GeneratingEmbeddings,
            Stage::Completed
        ]
    );
    assert_eq!(events.last().map(|e| e.event_type), Some(EventType::Completed));
    assert!(events.iter().all(|e| e.entry_id == Some(entry.id)));

    // One record per transition.
    let records = fixture.logs.query(entry.id, None).await.expect("query");
    let record_stages: Vec<Stage> = records.iter().map(|r| r.stage).collect();
    assert_eq!(record_stages, stages(&events));
    assert!(records.iter().all(|r| r.level == LogLevel::Info));

    assert_eq!(fixture.store.persisted_stages(entry.id), stages(&events));
    let persisted = fixture
        .store
        .get_entry(entry.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(persisted, done);
}

#[tokio::test]
async fn zero_links_skip_fetching() {
    let fetcher = Arc::new(FakeFetcher::default());
    let fixture = PipelineFixture::new(
        Collaborators {
            analyzer: Arc::new(FakeAnalyzer::with_links(&[])),
            fetcher: fetcher.clone(),
            embedder: Arc::new(FakeEmbedder::ok()),
        },
        PipelineConfig::default(),
    );
    let mut observer = fixture.hub.subscribe();
    let entry = JournalEntry::new("quiet day");
    stored_entry(&fixture, &entry).await;
    let (_tx, rx) = live_shutdown();

    let done = fixture.pipeline.process(entry.clone(), rx).await;
    assert_eq!(done.stage, Stage::Completed);

    let events = drain_events(&mut observer);
    assert_eq!(
        stages(&events),
        vec![Stage::Analyzing, Stage::GeneratingEmbeddings, Stage::Completed]
    );
    let fetching = fixture
        .logs
        .query(entry.id, Some(Stage::FetchingUrls))
        .await
        .expect("query");
    assert!(fetching.is_empty());
    assert_eq!(fetcher.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn one_failed_fetch_out_of_three_still_completes() {
    let embedder = Arc::new(FakeEmbedder::ok());
    let fixture = PipelineFixture::new(
        Collaborators {
            analyzer: Arc::new(FakeAnalyzer::with_links(&[
                "https://ok-1.example",
                "https://down.example",
                "https://ok-2.example",
            ])),
            fetcher: Arc::new(FakeFetcher::failing_for(&["https://down.example"])),
            embedder: embedder.clone(),
        },
        PipelineConfig::default(),
    );
    let mut observer = fixture.hub.subscribe();
    let entry = JournalEntry::new("three links");
    stored_entry(&fixture, &entry).await;
    let (_tx, rx) = live_shutdown();

    let done = fixture.pipeline.process(entry.clone(), rx).await;

    assert_eq!(done.stage, Stage::Completed);
    let links = &done.processed.as_ref().expect("processed").links;
    assert_eq!(links.len(), 3);
    let with_content = links.iter().filter(|l| !l.fetched_content.is_empty()).count();
    assert_eq!(with_content, 2);
    assert!(links[1].is_failed());
    assert!(links[1].fetched_content.is_empty());
    assert!(links[1]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("404")));

    let events = drain_events(&mut observer);
    assert!(stages(&events).contains(&Stage::GeneratingEmbeddings));
    assert_eq!(stages(&events).last(), Some(&Stage::Completed));

    let records = fixture.logs.query(entry.id, None).await.expect("query");
    let warnings: Vec<_> = records
        .iter()
        .filter(|r| r.level == LogLevel::Warn)
        .collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].stage, Stage::FetchingUrls);
    assert_eq!(warnings[0].details["url"], "https://down.example");

    // Fetched pages feed the embedding text; the failed one contributes nothing.
    let inputs = embedder.inputs();
    assert_eq!(inputs.len(), 1);
    assert!(inputs[0].contains("Body of https://ok-1.example"));
    assert!(!inputs[0].contains("down.example"));
}

#[tokio::test]
async fn analysis_failure_is_terminal() {
    let embedder = Arc::new(FakeEmbedder::ok());
    let fixture = PipelineFixture::new(
        Collaborators {
            analyzer: Arc::new(FakeAnalyzer::failing("model offline")),
            fetcher: Arc::new(FakeFetcher::default()),
            embedder: embedder.clone(),
        },
        PipelineConfig::default(),
    );
    let mut observer = fixture.hub.subscribe();
    let entry = JournalEntry::new("doomed");
    stored_entry(&fixture, &entry).await;
    let (_tx, rx) = live_shutdown();

    let done = fixture.pipeline.process(entry.clone(), rx).await;

    assert_eq!(done.stage, Stage::Failed);
    assert_eq!(
        done.error.as_deref(),
        Some("analysis error: unavailable: model offline")
    );
    assert!(done.completed_at.is_none());
    assert!(embedder.inputs().is_empty());

    let events = drain_events(&mut observer);
    assert_eq!(stages(&events), vec![Stage::Analyzing, Stage::Failed]);
    let failed = events.last().expect("failed event");
    assert_eq!(failed.event_type, EventType::Failed);
    assert_eq!(failed.payload["error"], "analysis error: unavailable: model offline");

    let records = fixture.logs.query(entry.id, None).await.expect("query");
    let last = records.last().expect("records");
    assert_eq!(last.level, LogLevel::Error);
    assert_eq!(last.stage, Stage::Failed);
}

#[tokio::test]
async fn embedding_failure_keeps_analysis() {
    let fixture = PipelineFixture::new(
        collaborators(
            FakeAnalyzer::with_links(&[]),
            FakeFetcher::default(),
            FakeEmbedder::failing("dimension mismatch"),
        ),
        PipelineConfig::default(),
    );
    let entry = JournalEntry::new("almost");
    stored_entry(&fixture, &entry).await;
    let (_tx, rx) = live_shutdown();

    let done = fixture.pipeline.process(entry.clone(), rx).await;

    assert_eq!(done.stage, Stage::Failed);
    assert_eq!(
        done.error.as_deref(),
        Some("embedding error: unavailable: dimension mismatch")
    );
    let processed = done.processed.expect("analysis survives the failure");
    assert_eq!(processed.summary, "summary of almost");
    assert!(processed.embedding.is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_collaborator_times_out() {
    let fixture = PipelineFixture::new(
        collaborators(
            FakeAnalyzer::with_links(&[]),
            FakeFetcher::default(),
            FakeEmbedder::slow(Duration::from_secs(120)),
        ),
        PipelineConfig {
            embed_timeout: Duration::from_secs(3),
            ..PipelineConfig::default()
        },
    );
    let entry = JournalEntry::new("slow");
    stored_entry(&fixture, &entry).await;
    let (_tx, rx) = live_shutdown();

    let done = fixture.pipeline.process(entry, rx).await;
    assert_eq!(done.stage, Stage::Failed);
    assert_eq!(
        done.error.as_deref(),
        Some("embedding error: timed out after 3s")
    );
}

#[tokio::test]
async fn shutdown_abandons_entry_mid_stage() {
    let fixture = Arc::new(PipelineFixture::new(
        collaborators(
            FakeAnalyzer::hanging(),
            FakeFetcher::default(),
            FakeEmbedder::ok(),
        ),
        PipelineConfig::default(),
    ));
    let mut observer = fixture.hub.subscribe();
    let entry = JournalEntry::new("interrupted");
    stored_entry(&fixture, &entry).await;
    let (tx, rx) = live_shutdown();

    let task = {
        let fixture = Arc::clone(&fixture);
        let entry = entry.clone();
        tokio::spawn(async move { fixture.pipeline.process(entry, rx).await })
    };
    let first = observer.next_event().await.expect("analyzing event");
    assert_eq!(first.stage(), Some(Stage::Analyzing));

    tx.send(true).expect("signal shutdown");
    let done = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("cancelled promptly")
        .expect("task");

    assert_eq!(done.stage, Stage::Analyzing);
    assert!(done.processed.is_none());
    assert!(observer.try_recv().is_none(), "no terminal event after cancel");
    assert_eq!(fixture.store.persisted_stages(entry.id), vec![Stage::Analyzing]);
}

#[tokio::test]
async fn concurrent_entries_stay_isolated_and_ordered() {
    let fixture = Arc::new(PipelineFixture::new(
        Collaborators {
            analyzer: Arc::new(FakeAnalyzer::with_links(&["https://x.example"])),
            fetcher: Arc::new(FakeFetcher::default()),
            embedder: Arc::new(FakeEmbedder::ok()),
        },
        PipelineConfig::default(),
    ));
    // Room for every event so nothing is dropped.
    let mut observer = fixture.hub.subscribe();
    let (_tx, rx) = live_shutdown();

    let mut tasks = Vec::new();
    let mut ids = Vec::new();
    for i in 0..12 {
        let entry = JournalEntry::new(format!("entry {i}"));
        ids.push(entry.id);
        stored_entry(&fixture, &entry).await;
        let fixture = Arc::clone(&fixture);
        let rx = rx.clone();
        tasks.push(tokio::spawn(async move {
            fixture.pipeline.process(entry, rx).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.expect("task").stage, Stage::Completed);
    }

    let events = drain_events(&mut observer);
    for id in &ids {
        let mine: Vec<_> = events
            .iter()
            .filter(|e| e.entry_id == Some(*id))
            .cloned()
            .collect();
        let seen = stages(&mine);
        assert_stage_order(&seen);
        assert_eq!(
            seen,
            vec![
                Stage::Analyzing,
                Stage::FetchingUrls,
                Stage::GeneratingEmbeddings,
                Stage::Completed
            ]
        );
    }
}

#[tokio::test]
async fn entry_not_at_created_is_left_alone() {
    let fixture = PipelineFixture::new(
        collaborators(
            FakeAnalyzer::with_links(&[]),
            FakeFetcher::default(),
            FakeEmbedder::ok(),
        ),
        PipelineConfig::default(),
    );
    let mut observer = fixture.hub.subscribe();
    let mut entry = JournalEntry::new("already done");
    entry.stage = Stage::Completed;
    let (_tx, rx) = live_shutdown();

    let done = fixture.pipeline.process(entry.clone(), rx).await;
    assert_eq!(done, entry);
    assert!(observer.try_recv().is_none());
    assert!(fixture.store.persisted_stages(entry.id).is_empty());
}
