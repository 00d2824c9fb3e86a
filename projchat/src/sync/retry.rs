//! Retry and dismiss actions for failed sends.

use std::sync::Arc;

use super::echo::{OptimisticEchoManager, PendingSend, SendError};
use super::shared::{ConversationState, SharedConversation};
use super::{DeliveryState, Identity, Message};
use crate::backend::ChatBackend;

/// Errors from retry and dismiss actions.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// No entry has this identity.
    #[error("no message with identity {0}")]
    NotFound(Identity),
    /// The entry exists but is not in the `Failed` state.
    #[error("message {identity} is {state}, not failed")]
    NotFailed {
        /// The entry.
        identity: Identity,
        /// Its current state.
        state: DeliveryState,
    },
    /// The resend was rejected; the failed entry is still in place.
    #[error(transparent)]
    Send(#[from] SendError),
}

/// Retry/dismiss surface for one conversation.
pub struct RetryController<B> {
    shared: Arc<SharedConversation<B>>,
    echo: OptimisticEchoManager<B>,
}

impl<B: ChatBackend> RetryController<B> {
    pub(crate) const fn new(shared: Arc<SharedConversation<B>>, echo: OptimisticEchoManager<B>) -> Self {
        Self { shared, echo }
    }

    /// Removes the failed entry and sends its content again as a new
    /// pending entry.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::NotFound`] or [`RetryError::NotFailed`] if the
    /// identity does not name a failed entry, and [`RetryError::Send`] if the
    /// resend is rejected. On error nothing is removed.
    pub fn retry(&self, identity: &Identity) -> Result<PendingSend, RetryError> {
        let content = self.shared.read(|state| failed_entry(state, identity).map(|m| m.content.clone()))?;
        let ticket = self.echo.start(&content, |state| {
            failed_entry(state, identity)?;
            state.store.remove_by_id(identity);
            Ok::<(), RetryError>(())
        })?;
        tracing::info!(old = %identity, local_id = %ticket.local_id(), "retrying failed send");
        Ok(ticket)
    }

    /// Removes a failed entry without resending it.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::NotFound`] or [`RetryError::NotFailed`].
    pub fn dismiss(&self, identity: &Identity) -> Result<Message, RetryError> {
        let removed = self.shared.mutate(|state| {
            failed_entry(state, identity)?;
            state
                .store
                .remove_by_id(identity)
                .ok_or_else(|| RetryError::NotFound(identity.clone()))
        })?;
        tracing::info!(identity = %identity, "failed message dismissed");
        Ok(removed)
    }
}

fn failed_entry<'a>(state: &'a ConversationState, identity: &Identity) -> Result<&'a Message, RetryError> {
    let entry = state
        .store
        .get(identity)
        .ok_or_else(|| RetryError::NotFound(identity.clone()))?;
    if entry.delivery == DeliveryState::Failed {
        Ok(entry)
    } else {
        Err(RetryError::NotFailed {
            identity: identity.clone(),
            state: entry.delivery,
        })
    }
}
