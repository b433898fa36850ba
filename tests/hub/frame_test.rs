//! Tests for `src/hub/frame.rs`: SSE framing of observer streams.

use std::time::Duration;

use tokio_stream::StreamExt;
use uuid::Uuid;

use jotter::hub::frame::{parse_event_frame, sse_frames, KEEPALIVE_FRAME};
use jotter::hub::{EventHub, HubConfig};
use jotter::types::{EventType, Stage};

#[tokio::test]
async fn stream_yields_data_frames_in_order() {
    let hub = EventHub::default();
    let mut frames = sse_frames(hub.subscribe());
    let id = Uuid::new_v4();

    hub.publish(jotter::types::Event::stage_transition(id, Stage::Analyzing, None));
    hub.publish(jotter::types::Event::stage_transition(
        id,
        Stage::Failed,
        Some("analysis error: offline"),
    ));

    let first = frames.next().await.expect("frame");
    let second = frames.next().await.expect("frame");
    assert!(first.starts_with("data: ") && first.ends_with("\n\n"));

    let first = parse_event_frame(&first).expect("event");
    assert_eq!(first.event_type, EventType::StageChanged);
    let second = parse_event_frame(&second).expect("event");
    assert_eq!(second.event_type, EventType::Failed);
    assert_eq!(second.payload["error"], "analysis error: offline");
    assert_eq!(second.payload["stage"], "failed");
}

#[tokio::test(start_paused = true)]
async fn keepalive_becomes_comment_frame() {
    let hub = EventHub::new(HubConfig {
        queue_capacity: 4,
        keepalive: Duration::from_secs(1),
    });
    let mut frames = sse_frames(hub.subscribe());
    hub.start();

    let frame = tokio::time::timeout(Duration::from_secs(5), frames.next())
        .await
        .expect("keepalive within timeout")
        .expect("frame");
    assert_eq!(frame, KEEPALIVE_FRAME);
    hub.stop().await;
}

#[tokio::test]
async fn dropping_the_stream_unsubscribes() {
    let hub = EventHub::default();
    let frames = sse_frames(hub.subscribe());
    assert_eq!(hub.observer_count(), 1);
    drop(frames);
    assert_eq!(hub.observer_count(), 0);
}
