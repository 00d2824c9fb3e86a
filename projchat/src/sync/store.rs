//! Ordered in-memory timeline for one conversation.
//!
//! The store keeps entries sorted non-decreasing by `sent_at`, with ties in
//! arrival order, and holds at most one entry per server id. Every method
//! leaves both properties intact.
//!
//! The store also counts a revision that advances whenever a server-backed
//! entry first appears (inserted or promoted). A history snapshot fetched
//! before that revision cannot know about the entry, so
//! [`ConversationStore::replace_since`] keeps it instead of dropping it.

use std::collections::{HashMap, HashSet};

use projchat_proto::message::ServerId;
use projchat_proto::timestamp::SentAt;

use super::{DeliveryState, Identity, Message};

/// Errors from store mutations that would break its invariants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No entry has the given identity.
    #[error("no message with identity {0}")]
    NotFound(Identity),
    /// Another entry already carries this server id.
    #[error("server id {0} is already present")]
    DuplicateServerId(ServerId),
}

/// Partial update applied by [`ConversationStore::update_by_id`].
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePatch {
    /// New identity (used to promote a local entry).
    pub identity: Option<Identity>,
    /// New content.
    pub content: Option<String>,
    /// New send instant.
    pub sent_at: Option<SentAt>,
    /// New delivery state.
    pub delivery: Option<DeliveryState>,
}

impl MessagePatch {
    /// Patch that only changes the delivery state.
    #[must_use]
    pub fn delivery(state: DeliveryState) -> Self {
        Self {
            delivery: Some(state),
            ..Self::default()
        }
    }

    /// Patch that turns an entry into a copy of a confirmed server record.
    #[must_use]
    pub fn from_record(record: &Message) -> Self {
        Self {
            identity: Some(record.identity.clone()),
            content: Some(record.content.clone()),
            sent_at: Some(record.sent_at),
            delivery: Some(record.delivery),
        }
    }
}

/// Ordered collection of the messages of one conversation.
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    entries: Vec<Message>,
    revision: u64,
    /// Revision at which each server id first appeared.
    seen_at: HashMap<ServerId, u64>,
}

impl ConversationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current revision. Capture it before fetching a snapshot and pass it
    /// to [`ConversationStore::replace_since`].
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Overwrites the timeline with `snapshot`.
    ///
    /// Local entries (pending or failed) that the snapshot does not contain
    /// are merged back in at their own `sent_at`. Duplicate server ids in the
    /// snapshot keep their first occurrence.
    pub fn replace(&mut self, snapshot: Vec<Message>) {
        self.replace_since(snapshot, self.revision);
    }

    /// Overwrites the timeline with a snapshot fetched at revision `since`.
    ///
    /// Behaves like [`ConversationStore::replace`], and additionally keeps
    /// remote entries missing from the snapshot that appeared after `since`.
    pub fn replace_since(&mut self, snapshot: Vec<Message>, since: u64) {
        let mut seen = HashSet::new();
        let mut next: Vec<Message> = Vec::with_capacity(snapshot.len());
        for msg in snapshot {
            if let Some(id) = msg.server_id()
                && !seen.insert(id.clone())
            {
                tracing::debug!(message_id = %id, "dropping duplicate id in snapshot");
                continue;
            }
            next.push(msg);
        }
        next.sort_by_key(|m| m.sent_at);

        let seen_at = &self.seen_at;
        let retained: Vec<Message> = self
            .entries
            .drain(..)
            .filter(|m| match m.server_id() {
                None => true,
                Some(id) => !seen.contains(id) && seen_at.get(id).is_some_and(|rev| *rev > since),
            })
            .collect();
        for msg in retained {
            if let Some(id) = msg.server_id() {
                tracing::debug!(message_id = %id, since, "keeping record newer than snapshot");
            }
            let at = upper_bound(&next, msg.sent_at);
            next.insert(at, msg);
        }
        self.entries = next;

        for id in self.entries.iter().filter_map(Message::server_id) {
            self.seen_at.entry(id.clone()).or_insert(self.revision);
        }
        let present: HashSet<&ServerId> = self.entries.iter().filter_map(Message::server_id).collect();
        self.seen_at.retain(|id, _| present.contains(id));
    }

    /// Inserts `message` after every entry with an equal or earlier `sent_at`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateServerId`] if a remote entry with the
    /// same server id already exists.
    pub fn append(&mut self, message: Message) -> Result<(), StoreError> {
        if let Some(id) = message.server_id()
            && self.contains_server_id(id)
        {
            return Err(StoreError::DuplicateServerId(id.clone()));
        }
        if let Some(id) = message.server_id() {
            self.mark_seen(id.clone());
        }
        let at = upper_bound(&self.entries, message.sent_at);
        self.entries.insert(at, message);
        Ok(())
    }

    /// Applies `patch` to the entry with `identity`.
    ///
    /// The entry keeps its position unless its new `sent_at` would break the
    /// ordering, in which case it is moved to the correct place.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown identity and
    /// [`StoreError::DuplicateServerId`] if the patch would give the entry a
    /// server id another entry already has.
    pub fn update_by_id(&mut self, identity: &Identity, patch: MessagePatch) -> Result<(), StoreError> {
        let index = self
            .position(identity)
            .ok_or_else(|| StoreError::NotFound(identity.clone()))?;

        if let Some(Identity::Remote(new_id)) = &patch.identity
            && self
                .entries
                .iter()
                .enumerate()
                .any(|(i, m)| i != index && m.server_id() == Some(new_id))
        {
            return Err(StoreError::DuplicateServerId(new_id.clone()));
        }

        if let Some(Identity::Remote(new_id)) = &patch.identity
            && self.entries[index].server_id() != Some(new_id)
        {
            self.mark_seen(new_id.clone());
        }

        let entry = &mut self.entries[index];
        if let Some(id) = patch.identity {
            entry.identity = id;
        }
        if let Some(content) = patch.content {
            entry.content = content;
        }
        if let Some(sent_at) = patch.sent_at {
            entry.sent_at = sent_at;
        }
        if let Some(delivery) = patch.delivery {
            entry.delivery = delivery;
        }

        if !self.in_order_at(index) {
            let moved = self.entries.remove(index);
            let at = upper_bound(&self.entries, moved.sent_at);
            self.entries.insert(at, moved);
        }
        Ok(())
    }

    /// Removes and returns the entry with `identity`.
    pub fn remove_by_id(&mut self, identity: &Identity) -> Option<Message> {
        let index = self.position(identity)?;
        Some(self.entries.remove(index))
    }

    /// Looks up an entry by identity.
    #[must_use]
    pub fn get(&self, identity: &Identity) -> Option<&Message> {
        self.entries.iter().find(|m| m.identity == *identity)
    }

    /// Returns `true` if a remote entry carries `id`.
    #[must_use]
    pub fn contains_server_id(&self, id: &ServerId) -> bool {
        self.entries.iter().any(|m| m.server_id() == Some(id))
    }

    /// Iterates over entries in timeline order.
    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.entries.iter()
    }

    /// Iterates over local entries still waiting for confirmation.
    pub fn pending(&self) -> impl Iterator<Item = &Message> {
        self.entries
            .iter()
            .filter(|m| m.is_local() && m.delivery == DeliveryState::Pending)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when the timeline is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in timeline order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    /// Copies the timeline into an immutable, cheaply cloneable slice.
    #[must_use]
    pub fn snapshot(&self) -> std::sync::Arc<[Message]> {
        self.entries.as_slice().into()
    }

    /// Returns `true` if entries are sorted and server ids are unique.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let sorted = self.entries.windows(2).all(|w| w[0].sent_at <= w[1].sent_at);
        let mut ids = HashSet::new();
        let unique = self
            .entries
            .iter()
            .filter_map(Message::server_id)
            .all(|id| ids.insert(id));
        sorted && unique
    }

    fn mark_seen(&mut self, id: ServerId) {
        self.revision += 1;
        self.seen_at.insert(id, self.revision);
    }

    fn position(&self, identity: &Identity) -> Option<usize> {
        self.entries.iter().position(|m| m.identity == *identity)
    }

    fn in_order_at(&self, index: usize) -> bool {
        let at = self.entries[index].sent_at;
        let after_prev = index == 0 || self.entries[index - 1].sent_at <= at;
        let before_next = self
            .entries
            .get(index + 1)
            .is_none_or(|next| at <= next.sent_at);
        after_prev && before_next
    }
}

impl<'a> IntoIterator for &'a ConversationStore {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Index after the last entry whose `sent_at` is `<= at`.
fn upper_bound(entries: &[Message], at: SentAt) -> usize {
    entries.partition_point(|m| m.sent_at <= at)
}
