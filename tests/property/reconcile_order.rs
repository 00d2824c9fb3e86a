//! Property-based tests for conversation reconciliation.
//!
//! Uses proptest to verify that after any interleaving of optimistic local
//! sends, pushed records and full history snapshots:
//! 1. The timeline is non-decreasing by `sent_at` with unique server ids.
//! 2. Every record just merged or snapshotted is present exactly once.
//! 3. Merging the same batch again changes nothing.
//! 4. Local entries only disappear by promotion, never by a snapshot.

use chrono::{DateTime, TimeDelta, Utc};
use proptest::prelude::*;
use projchat::sync::reconcile::Reconciler;
use projchat::sync::store::ConversationStore;
use projchat::sync::{DeliveryState, Message};
use projchat_proto::message::{ProjectId, ServerId, ServerMessage, UserId};
use projchat_proto::timestamp::{SentAt, WireTimestamp};

const CONTENTS: [&str; 4] = ["hi", "hello", " hi ", "lunch?"];

fn base() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
}

#[derive(Debug, Clone)]
enum Op {
    Local { content: usize, offset_ms: i64 },
    Push(Vec<ServerMessage>),
    Snapshot(Vec<ServerMessage>),
}

/// Strategy for server records drawn from a small id pool so that
/// redeliveries and conflicting updates are common.
fn arb_record() -> impl Strategy<Value = ServerMessage> {
    (
        0..8u8,
        prop::bool::ANY,
        0..CONTENTS.len(),
        prop::option::weighted(0.9, 0..20_000i64),
    )
        .prop_map(|(id, from_alice, content, offset_ms)| {
            let (sender, recipient) = if from_alice { ("alice", "bob") } else { ("bob", "alice") };
            ServerMessage {
                id: ServerId::new(format!("srv-{id}")),
                sender_id: UserId::new(sender),
                recipient_id: UserId::new(recipient),
                project_id: ProjectId::new("p"),
                content: CONTENTS[content].to_string(),
                sent_at: offset_ms.map(|ms| WireTimestamp::Native(base() + TimeDelta::milliseconds(ms))),
            }
        })
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..CONTENTS.len(), 0..20_000i64).prop_map(|(content, offset_ms)| Op::Local { content, offset_ms }),
        prop::collection::vec(arb_record(), 1..4).prop_map(Op::Push),
        prop::collection::vec(arb_record(), 0..8).prop_map(Op::Snapshot),
    ]
}

fn local_count(store: &ConversationStore) -> usize {
    store.iter().filter(|m| m.is_local()).count()
}

fn occurrences(store: &ConversationStore, id: &ServerId) -> usize {
    store.iter().filter(|m| m.server_id() == Some(id)).count()
}

proptest! {
    #[test]
    fn timeline_stays_ordered_and_unique(ops in prop::collection::vec(arb_op(), 1..40)) {
        let reconciler = Reconciler::default();
        let mut store = ConversationStore::new();

        for op in ops {
            let locals_before = local_count(&store);
            match op {
                Op::Local { content, offset_ms } => {
                    let message = Message {
                        sent_at: SentAt::At(base() + TimeDelta::milliseconds(offset_ms)),
                        ..Message::pending(UserId::new("alice"), CONTENTS[content])
                    };
                    prop_assert!(store.append(message).is_ok());
                    prop_assert_eq!(local_count(&store), locals_before + 1);
                }
                Op::Push(records) => {
                    let incoming: Vec<Message> = records.iter().map(Message::from_server).collect();
                    let report = reconciler.merge(&mut store, &incoming);
                    prop_assert_eq!(local_count(&store), locals_before - report.promoted);
                    for record in &records {
                        prop_assert_eq!(occurrences(&store, &record.id), 1);
                    }

                    let again = reconciler.merge(&mut store, &incoming);
                    prop_assert_eq!(again.inserted + again.promoted, 0);
                    prop_assert_eq!(local_count(&store), locals_before - report.promoted);
                }
                Op::Snapshot(records) => {
                    let incoming: Vec<Message> = records.iter().map(Message::from_server).collect();
                    let report = reconciler.reconcile_snapshot(&mut store, incoming);
                    prop_assert_eq!(local_count(&store), locals_before - report.promoted);
                    for record in &records {
                        prop_assert_eq!(occurrences(&store, &record.id), 1);
                    }
                    let remote = store.iter().filter(|m| !m.is_local()).count();
                    prop_assert!(remote <= records.len());
                }
            }
            prop_assert!(store.is_consistent(), "inconsistent store: {:?}", store.messages());
        }
    }

    #[test]
    fn local_entries_are_never_confirmed_without_a_record(
        contents in prop::collection::vec(0..CONTENTS.len(), 1..10),
    ) {
        let reconciler = Reconciler::default();
        let mut store = ConversationStore::new();
        for (i, content) in contents.iter().enumerate() {
            let message = Message {
                sent_at: SentAt::At(base() + TimeDelta::seconds(i64::try_from(i).unwrap_or_default())),
                ..Message::pending(UserId::new("alice"), CONTENTS[*content])
            };
            prop_assert!(store.append(message).is_ok());
        }

        reconciler.reconcile_snapshot(&mut store, Vec::new());

        prop_assert_eq!(store.len(), contents.len());
        prop_assert!(store.iter().all(|m| m.is_local() && m.delivery == DeliveryState::Pending));
    }
}
