//! Event-stream message decoding: JSON frames, binary preview frames, and
//! per-node progress milestone tracking.

use std::collections::HashMap;
use std::io::Cursor;

use image::ImageFormat;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// Milestone percentages at which progress callbacks fire.
pub const MILESTONES: [u8; 4] = [25, 50, 75, 100];

/// Outer envelope of a JSON text frame.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
pub struct ProgressData {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub value: f64,
    #[serde(default = "default_max")]
    pub max: f64,
}

fn default_max() -> f64 {
    100.0
}

#[derive(Debug, Deserialize)]
pub struct ExecutingData {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExecutedData {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub output: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// One decoded event-stream message.
#[derive(Debug)]
pub enum StreamEvent {
    Progress(ProgressData),
    Executing(ExecutingData),
    Executed(ExecutedData),
    Error(ErrorData),
    /// A recognized envelope whose type carries nothing we act on
    /// (status pings, cache notices and the like).
    Ignored,
}

impl StreamEvent {
    /// Decode a JSON text frame. Returns `None` when the frame is not valid
    /// JSON or not shaped like an envelope; such frames are non-fatal.
    pub fn decode(text: &str) -> Option<StreamEvent> {
        let envelope: Envelope = serde_json::from_str(text).ok()?;
        let event = match envelope.kind.as_str() {
            "progress" => StreamEvent::Progress(serde_json::from_value(envelope.data).ok()?),
            "executing" => StreamEvent::Executing(serde_json::from_value(envelope.data).ok()?),
            "executed" => StreamEvent::Executed(serde_json::from_value(envelope.data).ok()?),
            "error" => StreamEvent::Error(serde_json::from_value(envelope.data).ok()?),
            _ => StreamEvent::Ignored,
        };
        Some(event)
    }
}

/// A media descriptor inside an `executed` output.
#[derive(Debug, Deserialize)]
pub struct MediaRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(default = "default_media_type", rename = "type")]
    pub kind: String,
}

fn default_media_type() -> String {
    "output".to_string()
}

/// Output keys recognized as media-bearing, with the callback status used
/// when one of their files is delivered.
pub const MEDIA_KEYS: [(&str, &str); 3] = [
    ("images", "New image generated!"),
    ("gifs", "New video generated!"),
    ("audio", "New audio generated!"),
];

/// Extract the media descriptors under one output key, skipping entries
/// without a usable filename.
pub fn media_refs(output: &Value, key: &str) -> Vec<MediaRef> {
    let Some(items) = output.get(key).and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| serde_json::from_value::<MediaRef>(item.clone()).ok())
        .filter(|m| !m.filename.is_empty())
        .collect()
}

/// Tracks, per graph node, the highest progress milestone crossed, so the
/// caller is notified at most once per milestone rather than per message.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last_milestone: HashMap<String, u8>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a progress sample and return the milestones newly crossed by
    /// it, in ascending order. A node dropping below 100 after reaching it
    /// starts a new sub-phase and resets its tracker.
    pub fn record(&mut self, node: &str, value: f64, max: f64) -> Vec<u8> {
        let percentage = if max > 0.0 { value / max * 100.0 } else { 0.0 };

        let last = self.last_milestone.entry(node.to_string()).or_insert(0);
        if *last >= 100 && percentage < 100.0 {
            *last = 0;
        }

        let mut crossed = Vec::new();
        for milestone in MILESTONES {
            if percentage >= milestone as f64 && *last < milestone {
                *last = milestone;
                crossed.push(milestone);
            }
        }
        crossed
    }

    /// Forget a node's milestones (a fresh `executing` announcement).
    pub fn reset_node(&mut self, node: &str) {
        self.last_milestone.remove(node);
    }
}

/// Render a text progress bar like `[███░░░░░░░] 30%`.
pub fn build_progress_bar(value: f64, max: f64, length: usize) -> String {
    let ratio = if max > 0.0 {
        (value / max).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (length as f64 * ratio) as usize;
    let bar: String = "█".repeat(filled) + &"░".repeat(length - filled);
    format!("[{}] {}%", bar, (ratio * 100.0) as u32)
}

/// Decode a binary preview frame: an 8-byte header of two big-endian u32
/// tags (event type, payload encoding) followed by raw image bytes. The
/// image is re-encoded as JPEG in memory. Malformed payloads yield `None`.
pub fn decode_preview(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() <= 8 {
        return None;
    }

    let event_type = u32::from_be_bytes(payload[0..4].try_into().ok()?);
    let encoding = u32::from_be_bytes(payload[4..8].try_into().ok()?);

    let decoded = match image::load_from_memory(&payload[8..]) {
        Ok(img) => img,
        Err(e) => {
            debug!(event_type, encoding, error = %e, "Discarding malformed preview frame");
            return None;
        }
    };

    // JPEG has no alpha channel; flatten before re-encoding.
    let rgb = image::DynamicImage::ImageRgb8(decoded.to_rgb8());
    let mut buffer = Cursor::new(Vec::new());
    match rgb.write_to(&mut buffer, ImageFormat::Jpeg) {
        Ok(()) => Some(buffer.into_inner()),
        Err(e) => {
            debug!(error = %e, "Preview re-encode failed");
            None
        }
    }
}
