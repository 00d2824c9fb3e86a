//! Push event listener for one conversation.
//!
//! Opens a project-wide subscription, forwards only the events that belong
//! to the active conversation, and reports when the stream ends. It never
//! reconnects; the engine falls back to polling instead.

use projchat_proto::message::{ConversationKey, ServerMessage, UserId};
use tokio::task::JoinHandle;

use crate::backend::{ChatBackend, TransportError};

/// Errors from opening a push subscription.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// The backend refused or could not open the subscription.
    #[error("push subscription unavailable: {0}")]
    Unavailable(#[from] TransportError),
}

/// Handle to a running push listener. Dropping it closes the subscription.
#[derive(Debug)]
pub struct PushListener {
    key: ConversationKey,
    task: JoinHandle<()>,
}

impl PushListener {
    /// Subscribes to the key's project on behalf of `subscriber`.
    ///
    /// `on_event` runs for each event addressed to this conversation.
    /// `on_closed` runs once if the stream ends on its own; it does not run
    /// when the listener is stopped.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Unavailable`] if the subscription cannot
    /// be opened.
    pub async fn start<B, F, C>(
        backend: &B,
        subscriber: UserId,
        key: ConversationKey,
        on_event: F,
        on_closed: C,
    ) -> Result<Self, SubscriptionError>
    where
        B: ChatBackend,
        F: Fn(ServerMessage) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let mut subscription = backend.subscribe(&key.project_id, &subscriber).await?;
        tracing::info!(conversation = %key, "push subscription opened");

        let filter_key = key.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                if filter_key.matches(&subscriber, &event) {
                    on_event(event);
                } else {
                    tracing::debug!(message_id = %event.id, "ignoring event for another conversation");
                }
            }
            tracing::warn!(conversation = %filter_key, "push subscription ended");
            on_closed();
        });

        Ok(Self { key, task })
    }

    /// Returns `true` while the subscription stream is open.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Closes the subscription.
    pub fn stop(self) {
        tracing::info!(conversation = %self.key, "push subscription closed");
        drop(self);
    }
}

impl Drop for PushListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
