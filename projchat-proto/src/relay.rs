//! Relay wire protocol for the `ProjChat` development server.
//!
//! Frames are JSON objects tagged by `type`, sent as WebSocket text frames.
//! A client opens with [`RelayFrame::Hello`]; after [`RelayFrame::Welcome`]
//! it may issue requests (correlated by `requestId`) and subscribe to
//! project event streams.
//!
//! History is served in pages that each fit in one frame. A client asks for
//! the page after the last id it received until `hasMore` is false.

use serde::{Deserialize, Serialize};

use crate::message::{OutgoingMessage, ProjectId, ServerId, ServerMessage, UserId};

/// Maximum accepted frame size in bytes.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Encoded size budget for the messages of one history page, leaving room
/// for the frame envelope.
pub const HISTORY_PAGE_BUDGET: usize = MAX_FRAME_SIZE - 4 * 1024;

/// Messages exchanged between relay clients and the relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RelayFrame {
    /// Client identifies itself. Must be the first frame.
    Hello {
        /// The local user.
        user_id: UserId,
    },

    /// Server accepts the session.
    Welcome {
        /// Echo of the identified user.
        user_id: UserId,
    },

    /// Persist a new message.
    Send {
        /// Correlation id chosen by the client.
        request_id: u64,
        /// The message to store.
        message: OutgoingMessage,
    },

    /// Outcome of a [`RelayFrame::Send`].
    ///
    /// `message` is `None` when the server is configured not to echo the
    /// persisted record.
    SendResult {
        /// Correlation id of the request.
        request_id: u64,
        /// The persisted record, if echoed.
        message: Option<ServerMessage>,
    },

    /// Request a page of the history between the client and
    /// `counterpart_id`.
    FetchHistory {
        /// Correlation id chosen by the client.
        request_id: u64,
        /// Project scope.
        project_id: ProjectId,
        /// The other participant.
        counterpart_id: UserId,
        /// Return messages stored after this one. `None` starts at the
        /// oldest retained message.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<ServerId>,
    },

    /// One page of history, ascending by server time.
    History {
        /// Correlation id of the request.
        request_id: u64,
        /// The messages.
        messages: Vec<ServerMessage>,
        /// More messages follow the last one in this page.
        #[serde(default)]
        has_more: bool,
    },

    /// Start receiving [`RelayFrame::Event`]s for a project.
    Subscribe {
        /// Project to follow.
        project_id: ProjectId,
    },

    /// Server confirms a subscription.
    Subscribed {
        /// The followed project.
        project_id: ProjectId,
    },

    /// Push notification of a newly persisted message.
    Event {
        /// The new message.
        message: ServerMessage,
    },

    /// Server reports an error, optionally tied to a request.
    Error {
        /// Correlation id, if the error answers a request.
        request_id: Option<u64>,
        /// Human-readable description.
        reason: String,
    },
}

impl RelayFrame {
    /// Returns the correlation id for response frames.
    #[must_use]
    pub const fn request_id(&self) -> Option<u64> {
        match self {
            Self::SendResult { request_id, .. } | Self::History { request_id, .. } => {
                Some(*request_id)
            }
            Self::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }
}

/// Number of leading `records` whose combined encoded size fits `budget`.
///
/// Always at least one when `records` is non-empty, so paging makes
/// progress even if a single record exceeds the budget.
#[must_use]
pub fn page_len(records: &[ServerMessage], budget: usize) -> usize {
    let mut used = 0usize;
    for (i, record) in records.iter().enumerate() {
        let size = serde_json::to_string(record).map_or(usize::MAX, |text| text.len() + 1);
        used = used.saturating_add(size);
        if used > budget {
            return i.max(1);
        }
    }
    records.len()
}

/// Error type for frame encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// JSON serialization or deserialization failed.
    #[error("frame serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// Encodes a frame as JSON text.
///
/// # Errors
///
/// Returns [`FrameError::Json`] if serialization fails.
pub fn encode(frame: &RelayFrame) -> Result<String, FrameError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decodes a frame from JSON text.
///
/// # Errors
///
/// Returns [`FrameError::TooLarge`] for oversized input and
/// [`FrameError::Json`] for malformed JSON.
pub fn decode(text: &str) -> Result<RelayFrame, FrameError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: text.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(serde_json::from_str(text)?)
}
