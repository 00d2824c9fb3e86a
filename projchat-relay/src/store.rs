//! In-memory per-project message history.
//!
//! The [`HistoryStore`] keeps every persisted message for a project in
//! arrival order, assigning the server id and server timestamp. Each
//! project's history is capped; when the cap is exceeded the oldest
//! message is dropped.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};
use projchat_proto::message::{OutgoingMessage, ProjectId, ServerId, ServerMessage, UserId};
use projchat_proto::timestamp::TimestampStyle;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Default maximum number of messages kept per project.
pub const DEFAULT_MAX_HISTORY: usize = 10_000;

/// A message persisted by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Server-assigned identifier (UUID v7).
    pub id: ServerId,
    /// The accepted send body, sender already enforced.
    pub message: OutgoingMessage,
    /// Server time of persistence.
    pub stored_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Builds the wire record, rendering the timestamp in `style`.
    #[must_use]
    pub fn to_record(&self, style: TimestampStyle) -> ServerMessage {
        ServerMessage {
            id: self.id.clone(),
            sender_id: self.message.sender_id.clone(),
            recipient_id: self.message.recipient_id.clone(),
            project_id: self.message.project_id.clone(),
            content: self.message.content.clone(),
            sent_at: Some(style.render(self.stored_at)),
        }
    }

    /// Whether this message was exchanged between `a` and `b`.
    #[must_use]
    pub fn is_between(&self, a: &UserId, b: &UserId) -> bool {
        let (sender, recipient) = (&self.message.sender_id, &self.message.recipient_id);
        (sender == a && recipient == b) || (sender == b && recipient == a)
    }
}

#[derive(Default)]
struct Inner {
    projects: HashMap<ProjectId, VecDeque<StoredMessage>>,
    last_stored_at: Option<DateTime<Utc>>,
}

/// Thread-safe history of all projects, bounded per project.
pub struct HistoryStore {
    inner: RwLock<Inner>,
    max_per_project: usize,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryStore {
    /// Creates an empty store with the default cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_per_project(DEFAULT_MAX_HISTORY)
    }

    /// Creates an empty store keeping at most `max_per_project` messages
    /// per project.
    #[must_use]
    pub fn with_max_per_project(max_per_project: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_per_project: max_per_project.max(1),
        }
    }

    /// Persists `message`, returning the stored copy.
    ///
    /// Timestamps are strictly increasing at millisecond granularity so that
    /// every wire style preserves arrival order.
    pub async fn append(&self, message: OutgoingMessage) -> StoredMessage {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let stored_at = match inner.last_stored_at {
            Some(last) if now < last + TimeDelta::milliseconds(1) => last + TimeDelta::milliseconds(1),
            _ => now,
        };
        inner.last_stored_at = Some(stored_at);

        let stored = StoredMessage {
            id: ServerId::new(Uuid::now_v7().to_string()),
            message,
            stored_at,
        };
        let history = inner
            .projects
            .entry(stored.message.project_id.clone())
            .or_default();
        history.push_back(stored.clone());
        if history.len() > self.max_per_project {
            history.pop_front();
        }
        drop(inner);
        stored
    }

    /// Returns the messages between `a` and `b` in `project`, oldest first.
    pub async fn history(&self, project: &ProjectId, a: &UserId, b: &UserId) -> Vec<StoredMessage> {
        self.history_after(project, a, b, None).await
    }

    /// Like [`HistoryStore::history`], starting after the message `after`.
    ///
    /// An `after` id that is no longer retained was evicted, so every
    /// retained message is newer and the whole history is returned.
    pub async fn history_after(
        &self,
        project: &ProjectId,
        a: &UserId,
        b: &UserId,
        after: Option<&ServerId>,
    ) -> Vec<StoredMessage> {
        let inner = self.inner.read().await;
        let Some(history) = inner.projects.get(project) else {
            return Vec::new();
        };
        let start = after
            .and_then(|id| history.iter().position(|m| m.id == *id))
            .map_or(0, |i| i + 1);
        history
            .iter()
            .skip(start)
            .filter(|m| m.is_between(a, b))
            .cloned()
            .collect()
    }

    /// Number of messages retained for `project`.
    pub async fn len(&self, project: &ProjectId) -> usize {
        let inner = self.inner.read().await;
        inner.projects.get(project).map_or(0, VecDeque::len)
    }
}
