//! Conversation synchronization engine.
//!
//! Keeps one ordered, duplicate-free timeline per [`ConversationKey`] while
//! it is fed from three unreliable sources:
//!
//! - optimistic local writes ([`echo::OptimisticEchoManager`]),
//! - push events from a project subscription ([`push::PushListener`]),
//! - periodic full history re-fetches ([`poll::PollFallback`]).
//!
//! Every inbound batch goes through the [`reconcile::Reconciler`], which is
//! the only component that changes the order of a
//! [`store::ConversationStore`]. [`engine::ConversationEngine`] wires the
//! pieces together for one conversation and publishes immutable
//! [`ConversationSnapshot`]s after every mutation.
//!
//! [`ConversationKey`]: projchat_proto::message::ConversationKey

pub mod echo;
pub mod engine;
pub mod poll;
pub mod push;
pub mod reconcile;
pub mod retry;
pub(crate) mod shared;
pub mod store;

use std::fmt;
use std::sync::Arc;

use projchat_proto::message::{ServerId, ServerMessage, UserId};
use projchat_proto::timestamp::{SentAt, WireTimestamp};
use uuid::Uuid;

/// Temporary identity of a message that has not been confirmed by the server.
///
/// Backed by a UUID v7, so it never collides with a server id and sorts by
/// creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(Uuid);

impl LocalId {
    /// Generate a fresh local id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Returns the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a timeline entry: temporary until the server confirms it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Optimistic entry created on this client.
    Local(LocalId),
    /// Entry backed by a persisted server record.
    Remote(ServerId),
}

impl Identity {
    /// Returns the server id for remote entries.
    #[must_use]
    pub const fn server_id(&self) -> Option<&ServerId> {
        match self {
            Self::Remote(id) => Some(id),
            Self::Local(_) => None,
        }
    }

    /// Returns the local id for optimistic entries.
    #[must_use]
    pub const fn local_id(&self) -> Option<&LocalId> {
        match self {
            Self::Local(id) => Some(id),
            Self::Remote(_) => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(id) => write!(f, "local:{id}"),
            Self::Remote(id) => write!(f, "remote:{id}"),
        }
    }
}

/// Where a message is in its delivery lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    /// Appended locally; the server has not confirmed it yet.
    Pending,
    /// Matched to a persisted server record.
    Confirmed,
    /// The send failed or timed out; waiting for retry or dismissal.
    Failed,
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One entry of a conversation timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Local or server identity.
    pub identity: Identity,
    /// Author of the message.
    pub sender_id: UserId,
    /// Message text.
    pub content: String,
    /// Normalized send instant.
    pub sent_at: SentAt,
    /// Delivery lifecycle state.
    pub delivery: DeliveryState,
}

impl Message {
    /// Creates an optimistic entry stamped with the local clock.
    #[must_use]
    pub fn pending(sender_id: UserId, content: impl Into<String>) -> Self {
        Self {
            identity: Identity::Local(LocalId::new()),
            sender_id,
            content: content.into(),
            sent_at: SentAt::now(),
            delivery: DeliveryState::Pending,
        }
    }

    /// Converts a server record into a confirmed entry.
    ///
    /// Unreadable timestamps are logged and replaced by [`SentAt::Unknown`];
    /// the message is kept.
    #[must_use]
    pub fn from_server(record: &ServerMessage) -> Self {
        let sent_at = match &record.sent_at {
            Some(wire) => normalize_timestamp(&record.id, wire),
            None => {
                tracing::warn!(message_id = %record.id, "server record has no timestamp");
                SentAt::Unknown
            }
        };
        Self {
            identity: Identity::Remote(record.id.clone()),
            sender_id: record.sender_id.clone(),
            content: record.content.clone(),
            sent_at,
            delivery: DeliveryState::Confirmed,
        }
    }

    /// Returns the server id if this entry is remote.
    #[must_use]
    pub const fn server_id(&self) -> Option<&ServerId> {
        self.identity.server_id()
    }

    /// Returns the local id if this entry is still optimistic.
    #[must_use]
    pub const fn local_id(&self) -> Option<&LocalId> {
        self.identity.local_id()
    }

    /// Returns `true` for optimistic (not yet confirmed) entries.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self.identity, Identity::Local(_))
    }
}

fn normalize_timestamp(id: &ServerId, wire: &WireTimestamp) -> SentAt {
    match wire.to_utc() {
        Ok(instant) => SentAt::At(instant),
        Err(e) => {
            tracing::warn!(message_id = %id, error = %e, "malformed timestamp, using sentinel");
            SentAt::Unknown
        }
    }
}

/// Whether the push channel is delivering events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// A push subscription is active.
    Live,
    /// Push is unavailable; only periodic fetches keep the timeline fresh.
    #[default]
    Polling,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Polling => write!(f, "polling"),
        }
    }
}

/// Immutable view of a conversation, published after each mutation.
#[derive(Debug, Clone, Default)]
pub struct ConversationSnapshot {
    /// Ordered timeline.
    pub messages: Arc<[Message]>,
    /// Push or polling mode.
    pub connection: ConnectionState,
    /// `true` when history fetches keep failing while push is down.
    pub stalled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use projchat_proto::message::ProjectId;

    fn record(sent_at: Option<WireTimestamp>) -> ServerMessage {
        ServerMessage {
            id: ServerId::new("srv-1"),
            sender_id: UserId::new("bob"),
            recipient_id: UserId::new("alice"),
            project_id: ProjectId::new("p"),
            content: "hey".into(),
            sent_at,
        }
    }

    #[test]
    fn local_ids_are_unique() {
        assert_ne!(LocalId::new(), LocalId::new());
    }

    #[test]
    fn pending_message_is_local() {
        let msg = Message::pending(UserId::new("alice"), "hi");
        assert!(msg.is_local());
        assert_eq!(msg.delivery, DeliveryState::Pending);
        assert!(msg.sent_at.is_known());
        assert!(msg.server_id().is_none());
    }

    #[test]
    fn server_record_becomes_confirmed_remote() {
        let msg = Message::from_server(&record(Some(WireTimestamp::EpochMillis(1_000))));
        assert_eq!(msg.identity, Identity::Remote(ServerId::new("srv-1")));
        assert_eq!(msg.delivery, DeliveryState::Confirmed);
        assert_eq!(msg.sent_at, SentAt::from_millis(1_000));
    }

    #[test]
    fn malformed_timestamp_keeps_message() {
        let msg = Message::from_server(&record(Some(WireTimestamp::Iso("garbage".into()))));
        assert_eq!(msg.sent_at, SentAt::Unknown);
        assert_eq!(msg.content, "hey");

        let missing = Message::from_server(&record(None));
        assert_eq!(missing.sent_at, SentAt::Unknown);
    }

    #[test]
    fn identity_display_distinguishes_namespaces() {
        let remote = Identity::Remote(ServerId::new("x"));
        assert_eq!(remote.to_string(), "remote:x");
        assert!(Identity::Local(LocalId::new()).to_string().starts_with("local:"));
    }
}
