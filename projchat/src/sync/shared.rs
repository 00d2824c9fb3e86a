//! State shared between an engine, its background tasks and in-flight sends.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use projchat_proto::message::{ConversationKey, ServerMessage, UserId};
use tokio::sync::watch;

use super::reconcile::{MergeReport, Reconciler};
use super::store::ConversationStore;
use super::{ConnectionState, ConversationSnapshot, LocalId, Message};
use crate::backend::{ChatBackend, TransportError};
use crate::config::SyncConfig;

/// Push subscription state of one mounted view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushState {
    Opening,
    Live,
    Closed,
}

/// Mutable part of a conversation, guarded by one lock.
#[derive(Debug, Default)]
pub(crate) struct ConversationState {
    pub store: ConversationStore,
    pub in_flight: Option<LocalId>,
    pub poll_failures: u32,
    views: HashMap<u64, PushState>,
    next_view: u64,
}

impl ConversationState {
    /// `Live` while at least one mounted view has an open push stream.
    pub fn connection(&self) -> ConnectionState {
        if self.views.values().any(|push| *push == PushState::Live) {
            ConnectionState::Live
        } else {
            ConnectionState::Polling
        }
    }

    /// Registers a view whose push subscription is being opened.
    pub fn open_view(&mut self) -> u64 {
        self.next_view += 1;
        self.views.insert(self.next_view, PushState::Opening);
        self.next_view
    }

    /// Marks the view's push as live unless it already closed.
    pub fn push_opened(&mut self, view: u64) {
        if let Some(push) = self.views.get_mut(&view)
            && *push == PushState::Opening
        {
            *push = PushState::Live;
        }
    }

    pub fn push_closed(&mut self, view: u64) {
        if let Some(push) = self.views.get_mut(&view) {
            *push = PushState::Closed;
        }
    }

    pub fn close_view(&mut self, view: u64) {
        self.views.remove(&view);
    }

    fn stalled(&self, threshold: u32) -> bool {
        self.connection() == ConnectionState::Polling && self.poll_failures >= threshold
    }
}

pub(crate) struct SharedConversation<B> {
    pub me: UserId,
    pub key: ConversationKey,
    pub backend: Arc<B>,
    pub config: SyncConfig,
    pub reconciler: Reconciler,
    state: Mutex<ConversationState>,
    updates: watch::Sender<ConversationSnapshot>,
}

impl<B: ChatBackend> SharedConversation<B> {
    pub fn new(backend: Arc<B>, me: UserId, key: ConversationKey, config: SyncConfig) -> Self {
        let (updates, _) = watch::channel(ConversationSnapshot::default());
        Self {
            me,
            key,
            backend,
            reconciler: Reconciler::new(config.dedup_window),
            config,
            state: Mutex::new(ConversationState::default()),
            updates,
        }
    }

    /// Runs `f` under the lock and publishes the resulting snapshot.
    ///
    /// Publishing happens before the lock is released so snapshots are
    /// observed in mutation order.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut ConversationState) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state);
        let snapshot = ConversationSnapshot {
            messages: state.store.snapshot(),
            connection: state.connection(),
            stalled: state.stalled(self.config.stall_after_failures),
        };
        self.updates.send_replace(snapshot);
        result
    }

    pub fn read<R>(&self, f: impl FnOnce(&ConversationState) -> R) -> R {
        f(&self.state.lock())
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationSnapshot> {
        self.updates.subscribe()
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.updates.borrow().clone()
    }

    /// Merges one pushed record.
    pub fn apply_push(&self, record: &ServerMessage) -> MergeReport {
        let incoming = [Message::from_server(record)];
        self.mutate(|state| self.reconciler.merge(&mut state.store, &incoming))
    }

    /// Fetches the full history and reconciles it into the store.
    ///
    /// # Errors
    ///
    /// Returns the backend error after counting it toward the stall
    /// threshold.
    pub async fn refresh(&self) -> Result<MergeReport, TransportError> {
        let since = self.read(|state| state.store.revision());
        match self.backend.fetch_history(&self.me, &self.key).await {
            Ok(records) => {
                let snapshot: Vec<Message> = records
                    .iter()
                    .filter(|r| {
                        let ours = self.key.matches(&self.me, r);
                        if !ours {
                            tracing::debug!(message_id = %r.id, "history record outside conversation, skipped");
                        }
                        ours
                    })
                    .map(Message::from_server)
                    .collect();
                let report = self.mutate(|state| {
                    state.poll_failures = 0;
                    self.reconciler.reconcile_snapshot_since(&mut state.store, snapshot, since)
                });
                Ok(report)
            }
            Err(e) => {
                let failures = self.mutate(|state| {
                    state.poll_failures = state.poll_failures.saturating_add(1);
                    state.poll_failures
                });
                tracing::warn!(conversation = %self.key, failures, error = %e, "history fetch failed");
                Err(e)
            }
        }
    }
}
