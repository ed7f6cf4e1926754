//! Wire messages exchanged with the Imagine WebSocket endpoint.

use serde::{Deserialize, Serialize};

/// Error code the upstream uses to signal rate limiting.
pub const RATE_LIMIT_ERROR_CODE: &str = "rate_limit_exceeded";

/// Error code the upstream uses for rejected sessions.
pub const UNAUTHORIZED_ERROR_CODE: &str = "unauthorized";

/// Outbound `conversation.item.create` request.
#[derive(Debug, Clone, Serialize)]
pub struct CreateItemRequest {
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    pub item: RequestItem,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestItem {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub content: Vec<RequestContent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestContent {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub text: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub properties: RequestProperties,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestProperties {
    pub section_count: u32,
    pub is_kids_mode: bool,
    pub enable_nsfw: bool,
    pub skip_upsampler: bool,
    pub is_initial: bool,
    pub aspect_ratio: String,
}

impl CreateItemRequest {
    /// Build a generation request with a fresh request id.
    pub fn new(prompt: &str, aspect_ratio: &str, enable_nsfw: bool) -> Self {
        Self {
            kind: "conversation.item.create",
            timestamp: chrono::Utc::now().timestamp_millis(),
            item: RequestItem {
                kind: "message",
                content: vec![RequestContent {
                    request_id: uuid::Uuid::new_v4().to_string(),
                    text: prompt.to_string(),
                    kind: "input_text",
                    properties: RequestProperties {
                        section_count: 0,
                        is_kids_mode: false,
                        enable_nsfw,
                        skip_upsampler: false,
                        is_initial: false,
                        aspect_ratio: aspect_ratio.to_string(),
                    },
                }],
            },
        }
    }

    /// Request id carried by this message.
    pub fn request_id(&self) -> &str {
        self.item
            .content
            .first()
            .map(|c| c.request_id.as_str())
            .unwrap_or_default()
    }
}

/// An inbound JSON frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Image delivery (any stage).
    Image {
        #[serde(default)]
        blob: String,
        #[serde(default)]
        url: String,
    },
    /// Upstream error event.
    Error {
        #[serde(default)]
        err_code: String,
        #[serde(default)]
        err_msg: String,
    },
    /// Anything else the endpoint sends (status, heartbeats, ...).
    #[serde(other)]
    Other,
}

/// A decoded transport frame, as seen by the attempt state machine.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A text frame that parsed into a known message.
    Message(InboundMessage),
    /// A text frame that could not be parsed.
    Malformed(String),
    /// Ping/pong/binary frames: no payload, not counted as activity.
    Control,
    /// The peer closed the session.
    Closed,
}

impl Frame {
    /// Parse a text frame.
    pub fn from_text(text: &str) -> Self {
        match serde_json::from_str::<InboundMessage>(text) {
            Ok(msg) => Self::Message(msg),
            Err(e) => Self::Malformed(e.to_string()),
        }
    }
}
