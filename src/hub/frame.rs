//! Server-sent-event framing for observer deliveries.
//!
//! Events become `data: <json>\n\n` frames; keepalives become the
//! comment-only frame `: keepalive\n\n`.

use tokio_stream::{Stream, StreamExt};
use tracing::warn;

use super::{Delivery, Observer};
use crate::types::Event;

/// Comment frame sent for every keepalive.
pub const KEEPALIVE_FRAME: &str = ": keepalive\n\n";

/// Encode one event as a `data:` frame.
///
/// # Errors
///
/// Returns the serializer error if the event cannot be encoded.
pub fn event_frame(event: &Event) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(event)?;
    Ok(format!("data: {json}\n\n"))
}

/// Encode one delivery. Events that fail to serialize are skipped.
pub fn delivery_frame(delivery: &Delivery) -> Option<String> {
    match delivery {
        Delivery::Keepalive => Some(KEEPALIVE_FRAME.to_owned()),
        Delivery::Event(event) => match event_frame(event) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(error = %e, "failed to encode event frame");
                None
            }
        },
    }
}

/// Turn an observer into a stream of SSE frames.
///
/// Dropping the stream drops the observer, which unsubscribes it.
pub fn sse_frames(observer: Observer) -> impl Stream<Item = String> + Send + Unpin {
    observer.filter_map(|delivery| delivery_frame(&delivery))
}

/// Parse the JSON payload back out of a `data:` frame.
///
/// Returns `None` for comment frames and malformed input.
pub fn parse_event_frame(frame: &str) -> Option<Event> {
    let json = frame.strip_prefix("data: ")?.trim_end_matches('\n');
    serde_json::from_str(json).ok()
}
