//! Chat backend abstraction for `ProjChat`.
//!
//! Defines the [`ChatBackend`] trait the sync engine talks to. Concrete
//! implementations:
//! - [`loopback::InMemoryBackend`]: in-process backend with failure knobs for testing
//! - [`relay::RelayBackend`]: JSON-over-WebSocket client for `projchat-relay`

pub mod loopback;
pub mod relay;

use projchat_proto::message::{ConversationKey, OutgoingMessage, ProjectId, ServerMessage, UserId};
use tokio::sync::mpsc;

/// Errors that can occur during backend operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection to the backend has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("backend operation timed out")]
    Timeout,

    /// The backend refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The backend URL is not usable.
    #[error("invalid backend url {url}: {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The backend answered with something the protocol does not allow.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An underlying I/O error occurred.
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stream of server records pushed for one project.
///
/// Yields every new message in the project; callers filter by conversation.
/// Dropping the subscription closes it.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::Receiver<ServerMessage>,
}

impl Subscription {
    /// Wraps the receiving end of an event channel.
    #[must_use]
    pub const fn new(events: mpsc::Receiver<ServerMessage>) -> Self {
        Self { events }
    }

    /// Waits for the next event. Returns `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<ServerMessage> {
        self.events.recv().await
    }
}

/// Async interface to the persisted chat history and its push stream.
///
/// All methods are cancel-safe from the caller's perspective: a dropped
/// future never leaves the engine in a half-updated state because the engine
/// only mutates its store after a call completes.
pub trait ChatBackend: Send + Sync + 'static {
    /// Persist a message.
    ///
    /// Returns the persisted record when the backend echoes it, or `None`
    /// when confirmation has to come from a later history fetch.
    fn send(
        &self,
        message: &OutgoingMessage,
    ) -> impl std::future::Future<Output = Result<Option<ServerMessage>, TransportError>> + Send;

    /// Fetch the full history between `me` and the key's counterpart,
    /// ascending by server time.
    fn fetch_history(
        &self,
        me: &UserId,
        key: &ConversationKey,
    ) -> impl std::future::Future<Output = Result<Vec<ServerMessage>, TransportError>> + Send;

    /// Open a push subscription for every conversation in `project`.
    fn subscribe(
        &self,
        project: &ProjectId,
        subscriber: &UserId,
    ) -> impl std::future::Future<Output = Result<Subscription, TransportError>> + Send;
}
