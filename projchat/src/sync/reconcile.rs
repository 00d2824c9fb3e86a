//! Merging inbound batches into a [`ConversationStore`].
//!
//! Matching rules, applied per incoming server record:
//!
//! 1. an entry with the same server id is replaced in place;
//! 2. otherwise a local entry from the same sender with the same trimmed
//!    content and a `sent_at` inside the dedup window is promoted in place;
//! 3. otherwise the record is inserted as a new entry.
//!
//! Because the same record always resolves to the same entry, merging is
//! idempotent and tolerant of re-delivery in any order.

use std::collections::HashSet;
use std::time::Duration;

use projchat_proto::message::{ServerId, normalize_content};

use super::store::{ConversationStore, MessagePatch, StoreError};
use super::{DeliveryState, Identity, LocalId, Message};

/// Default tolerance between a local send time and the server timestamp.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Counts of what a reconcile pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Records inserted as new entries.
    pub inserted: usize,
    /// Existing remote entries overwritten by id.
    pub replaced: usize,
    /// Local entries promoted to confirmed.
    pub promoted: usize,
    /// Remote entries absent from a full snapshot and therefore dropped.
    pub removed: usize,
}

impl MergeReport {
    /// Returns `true` if the pass touched nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.inserted == 0 && self.replaced == 0 && self.promoted == 0 && self.removed == 0
    }
}

/// Applies the matching rules with a configurable dedup window.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    window: Duration,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

impl Reconciler {
    /// Creates a reconciler with the given dedup window.
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self { window }
    }

    /// The dedup window in use.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Merges `incoming` server-backed messages into `store`.
    pub fn merge(&self, store: &mut ConversationStore, incoming: &[Message]) -> MergeReport {
        let mut report = MergeReport::default();
        for msg in incoming {
            self.merge_one(store, msg, &mut report);
        }
        tracing::debug!(
            inserted = report.inserted,
            replaced = report.replaced,
            promoted = report.promoted,
            "merge complete"
        );
        report
    }

    /// Reconciles a complete history snapshot and replaces the timeline.
    ///
    /// Local entries that match a snapshot record are promoted first so they
    /// are not duplicated; unmatched local entries survive the replace.
    pub fn reconcile_snapshot(&self, store: &mut ConversationStore, snapshot: Vec<Message>) -> MergeReport {
        self.reconcile(store, snapshot, None)
    }

    /// Like [`Reconciler::reconcile_snapshot`] for a snapshot whose fetch
    /// started at store revision `since`.
    ///
    /// Records that reached the store by push or send confirmation while
    /// the fetch was in flight are kept even though the snapshot lacks them.
    pub fn reconcile_snapshot_since(
        &self,
        store: &mut ConversationStore,
        snapshot: Vec<Message>,
        since: u64,
    ) -> MergeReport {
        self.reconcile(store, snapshot, Some(since))
    }

    fn reconcile(&self, store: &mut ConversationStore, snapshot: Vec<Message>, since: Option<u64>) -> MergeReport {
        let mut report = MergeReport::default();
        let before: HashSet<ServerId> = store.iter().filter_map(Message::server_id).cloned().collect();

        let mut promoted = HashSet::new();
        for msg in &snapshot {
            let Some(id) = msg.server_id() else { continue };
            if store.contains_server_id(id) {
                continue;
            }
            if let Some(local) = self.find_local_match(store, msg)
                && promote(store, &local, msg)
            {
                promoted.insert(id.clone());
            }
        }

        let mut kept = HashSet::new();
        for id in snapshot.iter().filter_map(Message::server_id) {
            if !kept.insert(id.clone()) {
                continue;
            }
            if promoted.contains(id) {
                report.promoted += 1;
            } else if before.contains(id) {
                report.replaced += 1;
            } else {
                report.inserted += 1;
            }
        }
        let since = since.unwrap_or_else(|| store.revision());
        store.replace_since(snapshot, since);
        report.removed = before.iter().filter(|id| !store.contains_server_id(id)).count();
        tracing::debug!(
            inserted = report.inserted,
            replaced = report.replaced,
            promoted = report.promoted,
            removed = report.removed,
            "snapshot reconciled"
        );
        report
    }

    /// Promotes the entry `local_id` using the record the server returned
    /// for that exact send.
    ///
    /// If a push event or poll tick got there first (the record is already
    /// present), the now-redundant local entry is dropped and the record is
    /// refreshed in place. If the local entry no longer exists the record is
    /// merged normally.
    pub fn confirm(&self, store: &mut ConversationStore, local_id: &LocalId, record: &Message) -> MergeReport {
        let mut report = MergeReport::default();
        let local = Identity::Local(local_id.clone());
        let Some(id) = record.server_id() else {
            return report;
        };

        if store.contains_server_id(id) {
            if store.remove_by_id(&local).is_some() {
                tracing::debug!(local_id = %local_id, message_id = %id, "dropping local twin of confirmed record");
            }
            self.merge_one(store, record, &mut report);
        } else if store.get(&local).is_some() {
            if promote(store, local_id, record) {
                report.promoted += 1;
            }
        } else {
            self.merge_one(store, record, &mut report);
        }
        report
    }

    fn merge_one(&self, store: &mut ConversationStore, msg: &Message, report: &mut MergeReport) {
        let Some(id) = msg.server_id() else {
            // Only server records flow through here; keep the entry rather than lose it.
            if store.append(msg.clone()).is_ok() {
                report.inserted += 1;
            }
            return;
        };

        if store.contains_server_id(id) {
            let target = Identity::Remote(id.clone());
            match store.update_by_id(&target, MessagePatch::from_record(msg)) {
                Ok(()) => report.replaced += 1,
                Err(e) => tracing::warn!(message_id = %id, error = %e, "in-place replace failed"),
            }
            return;
        }

        if let Some(local) = self.find_local_match(store, msg)
            && promote(store, &local, msg)
        {
            report.promoted += 1;
            return;
        }

        match store.append(msg.clone()) {
            Ok(()) => report.inserted += 1,
            Err(e) => tracing::warn!(message_id = %id, error = %e, "insert failed"),
        }
    }

    /// Finds the local entry that most plausibly is `incoming`.
    ///
    /// Pending entries win over failed ones (a failed send may still have
    /// been persisted); among those, the closest in time wins.
    fn find_local_match(&self, store: &ConversationStore, incoming: &Message) -> Option<LocalId> {
        let content = normalize_content(&incoming.content);
        store
            .iter()
            .filter_map(|m| m.local_id().map(|id| (id, m)))
            .filter(|(_, m)| {
                m.sender_id == incoming.sender_id
                    && normalize_content(&m.content) == content
                    && m.sent_at.within(&incoming.sent_at, self.window)
            })
            .min_by_key(|(_, m)| {
                let distance = match (m.sent_at.instant(), incoming.sent_at.instant()) {
                    (Some(a), Some(b)) => (a - b).num_milliseconds().unsigned_abs(),
                    _ => u64::MAX,
                };
                (m.delivery != DeliveryState::Pending, distance)
            })
            .map(|(id, _)| id.clone())
    }
}

fn promote(store: &mut ConversationStore, local_id: &LocalId, record: &Message) -> bool {
    let target = Identity::Local(local_id.clone());
    match store.update_by_id(&target, MessagePatch::from_record(record)) {
        Ok(()) => {
            tracing::info!(local_id = %local_id, identity = %record.identity, "message confirmed");
            true
        }
        Err(StoreError::NotFound(_)) => false,
        Err(e) => {
            tracing::warn!(local_id = %local_id, error = %e, "promotion failed");
            false
        }
    }
}
