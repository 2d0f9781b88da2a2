//! Server-Sent-Events framing for [`StreamEvent`]s.
//!
//! Every event becomes one `data: <json>\n\n` frame, so a client can act on
//! each frame as soon as it arrives.

use anyhow::{Context, Result};

use crate::stream::StreamEvent;

const DATA_PREFIX: &str = "data:";

pub fn encode_frame(event: &StreamEvent) -> serde_json::Result<String> {
    Ok(format!("{} {}\n\n", DATA_PREFIX, serde_json::to_string(event)?))
}

pub fn decode_frame(frame: &str) -> Result<StreamEvent> {
    let payload = frame
        .trim()
        .strip_prefix(DATA_PREFIX)
        .context("Frame does not start with 'data:'")?;

    serde_json::from_str(payload.trim()).context("Frame payload is not a stream event")
}

/// Split an SSE body into its non-empty frames
pub fn split_frames(body: &str) -> impl Iterator<Item = &str> {
    body.split("\n\n").filter(|f| !f.trim().is_empty())
}
