//! Per-conversation engine and the registry that hands engines out.
//!
//! A [`ConversationEngine`] owns the store of one conversation and outlives
//! any particular view of it. Mounting a view calls
//! [`ConversationEngine::start`], which opens the push subscription and
//! starts polling; the returned [`ViewSession`] stops both when it is
//! stopped or dropped. Sends started from the view keep running and keep
//! updating the engine after the view is gone.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use projchat_proto::message::{ConversationKey, ServerMessage, UserId};
use tokio::sync::watch;

use super::echo::{OptimisticEchoManager, PendingSend, SendError};
use super::poll::PollFallback;
use super::push::PushListener;
use super::reconcile::MergeReport;
use super::retry::{RetryController, RetryError};
use super::shared::{ConversationState, SharedConversation};
use super::{ConnectionState, ConversationSnapshot, Identity, Message};
use crate::backend::{ChatBackend, TransportError};
use crate::config::SyncConfig;

/// Sync engine for one conversation.
pub struct ConversationEngine<B> {
    shared: Arc<SharedConversation<B>>,
    echo: OptimisticEchoManager<B>,
    retry: RetryController<B>,
}

impl<B: ChatBackend> ConversationEngine<B> {
    /// Creates an idle engine with an empty timeline.
    #[must_use]
    pub fn new(backend: Arc<B>, me: UserId, key: ConversationKey, config: SyncConfig) -> Self {
        let shared = Arc::new(SharedConversation::new(backend, me, key, config));
        let echo = OptimisticEchoManager::new(Arc::clone(&shared));
        let retry = RetryController::new(Arc::clone(&shared), echo.clone());
        Self {
            shared,
            echo,
            retry,
        }
    }

    /// Activates the conversation for a mounted view.
    ///
    /// Tries to open the push subscription; if that fails the engine runs
    /// in [`ConnectionState::Polling`] without surfacing an error. Polling
    /// starts in both cases and its first tick loads the history.
    pub async fn start(&self) -> ViewSession<B> {
        let shared = &self.shared;
        let view = shared.mutate(ConversationState::open_view);
        let on_event = {
            let weak = Arc::downgrade(shared);
            move |record: ServerMessage| {
                if let Some(shared) = weak.upgrade() {
                    shared.apply_push(&record);
                }
            }
        };
        let on_closed = {
            let weak = Arc::downgrade(shared);
            move || {
                if let Some(shared) = weak.upgrade() {
                    tracing::warn!(conversation = %shared.key, view, "push dropped, degrading to polling");
                    shared.mutate(|state| state.push_closed(view));
                }
            }
        };

        let push = match PushListener::start(
            &*shared.backend,
            shared.me.clone(),
            shared.key.clone(),
            on_event,
            on_closed,
        )
        .await
        {
            Ok(listener) => {
                shared.mutate(|state| state.push_opened(view));
                Some(listener)
            }
            Err(e) => {
                tracing::warn!(conversation = %shared.key, error = %e, "push unavailable, polling only");
                shared.mutate(|state| state.push_closed(view));
                None
            }
        };

        let poll = {
            let weak = Arc::downgrade(shared);
            PollFallback::start(shared.config.poll_interval, move || {
                let weak = Weak::clone(&weak);
                async move {
                    if let Some(shared) = weak.upgrade() {
                        // Failures are counted and logged inside refresh.
                        let _ = shared.refresh().await;
                    }
                }
            })
        };

        tracing::info!(conversation = %shared.key, connection = %self.connection_state(), "view started");
        ViewSession {
            shared: Arc::clone(shared),
            view,
            push,
            poll: Some(poll),
        }
    }

    /// Current ordered timeline.
    #[must_use]
    pub fn messages(&self) -> Arc<[Message]> {
        self.shared.snapshot().messages
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ConversationSnapshot {
        self.shared.snapshot()
    }

    /// Receiver that observes every published snapshot.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConversationSnapshot> {
        self.shared.subscribe()
    }

    /// Whether push is currently delivering events.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.read(ConversationState::connection)
    }

    /// `true` when history fetches keep failing while push is down.
    #[must_use]
    pub fn is_stalled(&self) -> bool {
        self.shared.snapshot().stalled
    }

    /// Sends `content` optimistically. See [`OptimisticEchoManager::send`].
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the content is invalid or a send is already
    /// in flight.
    pub fn send(&self, content: &str) -> Result<PendingSend, SendError> {
        self.echo.send(content)
    }

    /// Resends a failed entry. See [`RetryController::retry`].
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] if the entry is unknown, not failed, or the
    /// resend is rejected.
    pub fn retry(&self, identity: &Identity) -> Result<PendingSend, RetryError> {
        self.retry.retry(identity)
    }

    /// Removes a failed entry. See [`RetryController::dismiss`].
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] if the entry is unknown or not failed.
    pub fn dismiss(&self, identity: &Identity) -> Result<Message, RetryError> {
        self.retry.dismiss(identity)
    }

    /// Fetches and reconciles the full history right now.
    ///
    /// # Errors
    ///
    /// Returns the backend error; the failure also counts toward the stall
    /// threshold.
    pub async fn refresh(&self) -> Result<MergeReport, TransportError> {
        self.shared.refresh().await
    }

    /// The local user.
    #[must_use]
    pub fn me(&self) -> &UserId {
        &self.shared.me
    }

    /// The conversation this engine serves.
    #[must_use]
    pub fn key(&self) -> &ConversationKey {
        &self.shared.key
    }
}

/// Active view of a conversation. Stopping or dropping it closes the push
/// subscription and stops polling.
pub struct ViewSession<B: ChatBackend> {
    shared: Arc<SharedConversation<B>>,
    view: u64,
    push: Option<PushListener>,
    poll: Option<PollFallback>,
}

impl<B: ChatBackend> ViewSession<B> {
    /// Forces an immediate history fetch on the poll timer.
    pub fn trigger_refresh(&self) {
        if let Some(poll) = &self.poll {
            poll.trigger();
        }
    }

    /// `true` while the push subscription is open.
    #[must_use]
    pub fn is_push_active(&self) -> bool {
        self.push.as_ref().is_some_and(PushListener::is_active)
    }

    /// `true` while the poll timer runs.
    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.poll.as_ref().is_some_and(PollFallback::is_running)
    }

    /// Tears the view down.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let mut stopped = false;
        if let Some(push) = self.push.take() {
            push.stop();
            stopped = true;
        }
        if let Some(poll) = self.poll.take() {
            poll.stop();
            stopped = true;
        }
        if stopped {
            let view = self.view;
            self.shared.mutate(|state| state.close_view(view));
            tracing::info!(conversation = %self.shared.key, view, "view stopped");
        }
    }
}

impl<B: ChatBackend> Drop for ViewSession<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Hands out one engine per conversation key.
pub struct EngineRegistry<B> {
    backend: Arc<B>,
    me: UserId,
    config: SyncConfig,
    engines: Mutex<HashMap<ConversationKey, Arc<ConversationEngine<B>>>>,
}

impl<B: ChatBackend> EngineRegistry<B> {
    /// Creates an empty registry for `me`.
    #[must_use]
    pub fn new(backend: Arc<B>, me: UserId, config: SyncConfig) -> Self {
        Self {
            backend,
            me,
            config,
            engines: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the engine for `key`, creating it on first use.
    pub fn engine(&self, key: &ConversationKey) -> Arc<ConversationEngine<B>> {
        let mut engines = self.engines.lock();
        let engine = engines.entry(key.clone()).or_insert_with(|| {
            tracing::debug!(conversation = %key, "creating conversation engine");
            Arc::new(ConversationEngine::new(
                Arc::clone(&self.backend),
                self.me.clone(),
                key.clone(),
                self.config.clone(),
            ))
        });
        Arc::clone(engine)
    }

    /// Forgets the engine for `key`. Existing handles keep working.
    pub fn evict(&self, key: &ConversationKey) -> Option<Arc<ConversationEngine<B>>> {
        self.engines.lock().remove(key)
    }

    /// Number of engines created and not evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.engines.lock().len()
    }

    /// Returns `true` if no engine has been created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.engines.lock().is_empty()
    }
}
