//! Optimistic sends.
//!
//! A send appends a `Pending` entry right away and hands the network call
//! to a spawned task. The task promotes the entry from the server's reply
//! (or from an immediate history refresh when the reply carries no record)
//! and marks it `Failed` on error or timeout. The task owns a reference to
//! the conversation, so it completes even if the view goes away.

use std::sync::Arc;

use projchat_proto::message::{OutgoingMessage, ValidationError, validate_content};
use tokio::task::JoinHandle;

use super::shared::{ConversationState, SharedConversation};
use super::store::{MessagePatch, StoreError};
use super::{DeliveryState, Identity, LocalId, Message};
use crate::backend::{ChatBackend, TransportError};

/// Default upper bound on one send call.
pub const DEFAULT_SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Errors that reject a send before anything is appended.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Content failed validation.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    /// Another send in this conversation has not finished yet.
    #[error("a send is already in flight ({0})")]
    AlreadyInFlight(LocalId),
    /// The optimistic entry could not be inserted.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ticket for an accepted send.
#[derive(Debug)]
pub struct PendingSend {
    local_id: LocalId,
    task: JoinHandle<DeliveryState>,
}

impl PendingSend {
    /// Temporary identity of the optimistic entry.
    #[must_use]
    pub const fn local_id(&self) -> &LocalId {
        &self.local_id
    }

    /// Waits until the send has settled.
    ///
    /// `Confirmed` means the entry was matched to a server record. `Pending`
    /// means the server accepted the message but no record has been seen
    /// yet; a later push or poll will confirm it. `Failed` means the entry
    /// is waiting for retry or dismissal.
    pub async fn settled(self) -> DeliveryState {
        match self.task.await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(local_id = %self.local_id, error = %e, "send task did not complete");
                DeliveryState::Failed
            }
        }
    }
}

/// Creates and tracks optimistic entries for one conversation.
pub struct OptimisticEchoManager<B> {
    shared: Arc<SharedConversation<B>>,
}

impl<B> Clone for OptimisticEchoManager<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: ChatBackend> OptimisticEchoManager<B> {
    pub(crate) const fn new(shared: Arc<SharedConversation<B>>) -> Self {
        Self { shared }
    }

    /// Appends a pending entry for `content` and starts delivering it.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Invalid`] for empty or oversized content and
    /// [`SendError::AlreadyInFlight`] while another send is unsettled. In
    /// both cases the store is not touched.
    pub fn send(&self, content: &str) -> Result<PendingSend, SendError> {
        self.start(content, |_| Ok::<(), SendError>(()))
    }

    /// Shared send path. `prepare` runs inside the same critical section
    /// that appends the entry, after the single-flight check.
    pub(crate) fn start<E>(
        &self,
        content: &str,
        prepare: impl FnOnce(&mut ConversationState) -> Result<(), E>,
    ) -> Result<PendingSend, E>
    where
        E: From<SendError>,
    {
        validate_content(content).map_err(SendError::from)?;
        let local_id = LocalId::new();
        let message = Message {
            identity: Identity::Local(local_id.clone()),
            ..Message::pending(self.shared.me.clone(), content)
        };

        self.shared.mutate(|state| {
            if let Some(current) = &state.in_flight {
                return Err(E::from(SendError::AlreadyInFlight(current.clone())));
            }
            prepare(state)?;
            state.store.append(message).map_err(SendError::from)?;
            state.in_flight = Some(local_id.clone());
            Ok(())
        })?;
        tracing::debug!(local_id = %local_id, conversation = %self.shared.key, "pending message appended");

        let outgoing = OutgoingMessage::new(&self.shared.me, &self.shared.key, content);
        let task = tokio::spawn(deliver(Arc::clone(&self.shared), local_id.clone(), outgoing));
        Ok(PendingSend { local_id, task })
    }
}

async fn deliver<B: ChatBackend>(
    shared: Arc<SharedConversation<B>>,
    local_id: LocalId,
    outgoing: OutgoingMessage,
) -> DeliveryState {
    let timeout = shared.config.send_timeout;
    let result = match tokio::time::timeout(timeout, shared.backend.send(&outgoing)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    };

    match result {
        Ok(Some(record)) => {
            let confirmed = Message::from_server(&record);
            shared.mutate(|state| {
                release(state, &local_id);
                shared.reconciler.confirm(&mut state.store, &local_id, &confirmed);
            });
            tracing::info!(local_id = %local_id, message_id = %record.id, "send confirmed");
            DeliveryState::Confirmed
        }
        Ok(None) => {
            shared.mutate(|state| release(state, &local_id));
            tracing::debug!(local_id = %local_id, "send accepted without record, refreshing");
            if let Err(e) = shared.refresh().await {
                tracing::warn!(local_id = %local_id, error = %e, "refresh after send failed");
            }
            let still_local = shared.read(|state| state.store.get(&Identity::Local(local_id.clone())).is_some());
            if still_local {
                DeliveryState::Pending
            } else {
                DeliveryState::Confirmed
            }
        }
        Err(e) => {
            tracing::warn!(local_id = %local_id, error = %e, "send failed");
            shared.mutate(|state| {
                release(state, &local_id);
                let target = Identity::Local(local_id.clone());
                match state.store.update_by_id(&target, MessagePatch::delivery(DeliveryState::Failed)) {
                    Ok(()) => DeliveryState::Failed,
                    // Already promoted by a push or poll that saw the persisted record.
                    Err(StoreError::NotFound(_)) => DeliveryState::Confirmed,
                    Err(other) => {
                        tracing::warn!(local_id = %local_id, error = %other, "could not mark send failed");
                        DeliveryState::Failed
                    }
                }
            })
        }
    }
}

fn release(state: &mut ConversationState, local_id: &LocalId) {
    if state.in_flight.as_ref() == Some(local_id) {
        state.in_flight = None;
    }
}
