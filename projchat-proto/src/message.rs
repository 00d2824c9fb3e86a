//! Wire format message types for the `ProjChat` protocol.
//!
//! These are the records exchanged with the chat backend: the server's view
//! of a message ([`ServerMessage`]), the request body for a send
//! ([`OutgoingMessage`]), and the identifiers that scope them.

use serde::{Deserialize, Serialize};

use crate::timestamp::{SentAt, WireTimestamp};

/// Maximum allowed message content size in bytes.
pub const MAX_CONTENT_LEN: usize = 4000;

/// Server-assigned identifier of a persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    /// Creates a server id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a user (sender, recipient, or subscriber).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Creates a user id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the project a conversation belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    /// Creates a project id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one logical thread: the counterpart user within a project.
///
/// The key is relative to the local user. A message belongs to the thread
/// when it was exchanged between the local user and the counterpart, in
/// either direction, inside the same project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationKey {
    /// The other participant of the thread.
    pub counterpart_id: UserId,
    /// The project the thread is scoped to.
    pub project_id: ProjectId,
}

impl ConversationKey {
    /// Creates a key for the thread with `counterpart_id` in `project_id`.
    #[must_use]
    pub const fn new(counterpart_id: UserId, project_id: ProjectId) -> Self {
        Self {
            counterpart_id,
            project_id,
        }
    }

    /// Returns `true` if `message` belongs to this thread as seen by `me`.
    #[must_use]
    pub fn matches(&self, me: &UserId, message: &ServerMessage) -> bool {
        if message.project_id != self.project_id {
            return false;
        }
        let (sender, recipient) = (&message.sender_id, &message.recipient_id);
        (sender == me && *recipient == self.counterpart_id)
            || (*sender == self.counterpart_id && recipient == me)
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project_id, self.counterpart_id)
    }
}

/// A persisted message as the server reports it.
///
/// `sent_at` is carried in whatever shape the backend produced; call
/// [`ServerMessage::sent_at`] to get the normalized instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    /// Server-assigned identifier.
    pub id: ServerId,
    /// Who wrote the message.
    pub sender_id: UserId,
    /// Who the message is addressed to.
    pub recipient_id: UserId,
    /// The project the message was posted in.
    pub project_id: ProjectId,
    /// Message text.
    pub content: String,
    /// Server timestamp in one of the supported wire shapes.
    #[serde(default)]
    pub sent_at: Option<WireTimestamp>,
}

impl ServerMessage {
    /// Returns the normalized send instant.
    ///
    /// Missing or unparseable timestamps yield [`SentAt::Unknown`] so the
    /// message can still be shown.
    #[must_use]
    pub fn sent_at(&self) -> SentAt {
        self.sent_at
            .as_ref()
            .map_or(SentAt::Unknown, SentAt::from_wire)
    }

    /// Returns the conversation key of this message as seen by `me`.
    #[must_use]
    pub fn conversation_for(&self, me: &UserId) -> ConversationKey {
        let counterpart = if self.sender_id == *me {
            self.recipient_id.clone()
        } else {
            self.sender_id.clone()
        };
        ConversationKey::new(counterpart, self.project_id.clone())
    }
}

/// Body of a send request: a message not yet persisted by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// The local user.
    pub sender_id: UserId,
    /// The counterpart.
    pub recipient_id: UserId,
    /// Project scope.
    pub project_id: ProjectId,
    /// Message text (already validated).
    pub content: String,
}

impl OutgoingMessage {
    /// Builds the send body for `content` from `me` into the thread `key`.
    #[must_use]
    pub fn new(me: &UserId, key: &ConversationKey, content: impl Into<String>) -> Self {
        Self {
            sender_id: me.clone(),
            recipient_id: key.counterpart_id.clone(),
            project_id: key.project_id.clone(),
            content: content.into(),
        }
    }
}

/// Error returned when message content fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Content is empty or whitespace only.
    #[error("message content is empty")]
    Empty,
    /// Content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Validates user-entered content before anything is sent.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] for empty or whitespace-only text and
/// [`ValidationError::TooLarge`] above [`MAX_CONTENT_LEN`].
pub fn validate_content(content: &str) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    let size = content.len();
    if size > MAX_CONTENT_LEN {
        return Err(ValidationError::TooLarge {
            size,
            max: MAX_CONTENT_LEN,
        });
    }
    Ok(())
}

/// Normalized form of message content used for dedup comparison.
///
/// Trims surrounding whitespace; case is preserved.
#[must_use]
pub fn normalize_content(content: &str) -> &str {
    content.trim()
}
