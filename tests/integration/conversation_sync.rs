//! Integration tests for conversation sync against the in-memory backend.
//!
//! Covers the behaviour a chat view relies on:
//! - Merges are idempotent by server id and deduplicate optimistic entries
//! - Local entries survive history snapshots that do not contain them
//! - Failed sends stay isolated and can be retried or dismissed
//! - Push drops degrade to polling; view teardown stops background work
//! - A history response older than a confirmation never hides it
//! - Malformed timestamps keep the message with a sentinel label

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use projchat::backend::loopback::InMemoryBackend;
use projchat::config::SyncConfig;
use projchat::sync::engine::ConversationEngine;
use projchat::sync::echo::SendError;
use projchat::sync::reconcile::Reconciler;
use projchat::sync::retry::RetryError;
use projchat::sync::store::ConversationStore;
use projchat::sync::{ConnectionState, ConversationSnapshot, DeliveryState, Identity, Message};
use projchat_proto::message::{ConversationKey, OutgoingMessage, ProjectId, ServerId, ServerMessage, UserId};
use projchat_proto::timestamp::{SENTINEL_LABEL, SentAt, WireTimestamp};

fn alice() -> UserId {
    UserId::new("alice")
}

fn bob() -> UserId {
    UserId::new("bob")
}

/// Alice's view of her thread with Bob.
fn thread() -> ConversationKey {
    ConversationKey::new(bob(), ProjectId::new("apollo"))
}

/// Bob's view of the same thread.
fn reverse_thread() -> ConversationKey {
    ConversationKey::new(alice(), ProjectId::new("apollo"))
}

fn fast() -> SyncConfig {
    SyncConfig {
        poll_interval: Duration::from_millis(50),
        ..SyncConfig::default()
    }
}

fn engine_with(backend: &Arc<InMemoryBackend>, config: SyncConfig) -> ConversationEngine<InMemoryBackend> {
    ConversationEngine::new(Arc::clone(backend), alice(), thread(), config)
}

async fn wait_for(engine: &ConversationEngine<InMemoryBackend>, cond: impl Fn(&ConversationSnapshot) -> bool) {
    let mut rx = engine.watch();
    let reached = tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|s| cond(s)))
        .await
        .is_ok_and(|r| r.is_ok());
    assert!(reached, "condition not reached; last snapshot {:?}", engine.snapshot());
}

fn record(id: &str, sender: &UserId, content: &str, sent_at: Option<WireTimestamp>) -> ServerMessage {
    let recipient = if *sender == alice() { bob() } else { alice() };
    ServerMessage {
        id: ServerId::new(id),
        sender_id: sender.clone(),
        recipient_id: recipient,
        project_id: ProjectId::new("apollo"),
        content: content.to_string(),
        sent_at,
    }
}

// =============================================================================
// Reconciliation rules
// =============================================================================

#[test]
fn merging_the_same_record_twice_keeps_one_entry() {
    let reconciler = Reconciler::default();
    let mut store = ConversationStore::new();
    let incoming = Message::from_server(&record("srv-1", &bob(), "hey", Some(WireTimestamp::Native(Utc::now()))));

    reconciler.merge(&mut store, std::slice::from_ref(&incoming));
    let second = reconciler.merge(&mut store, &[incoming]);

    assert_eq!(store.len(), 1);
    assert_eq!(second.inserted, 0);
    assert_eq!(second.replaced, 1);
}

#[test]
fn pending_entry_is_replaced_by_record_two_seconds_later() {
    let reconciler = Reconciler::default();
    let mut store = ConversationStore::new();
    let t = Utc::now();
    let pending = Message {
        sent_at: SentAt::At(t),
        ..Message::pending(alice(), "hi")
    };
    let local = pending.identity.clone();
    store.append(pending).unwrap();

    let server = record("srv-9", &alice(), "hi", Some(WireTimestamp::Native(t + TimeDelta::seconds(2))));
    let report = reconciler.merge(&mut store, &[Message::from_server(&server)]);

    assert_eq!(report.promoted, 1);
    assert_eq!(store.len(), 1);
    assert!(store.get(&local).is_none());
    let entry = store.get(&Identity::Remote(ServerId::new("srv-9"))).unwrap();
    assert_eq!(entry.delivery, DeliveryState::Confirmed);
    assert_eq!(entry.sent_at, SentAt::At(t + TimeDelta::seconds(2)));
}

#[test]
fn snapshot_without_pending_entry_keeps_it() {
    let reconciler = Reconciler::default();
    let mut store = ConversationStore::new();
    let pending = Message::pending(alice(), "still sending");
    let local = pending.identity.clone();
    store.append(pending).unwrap();

    let earlier = Utc::now() - TimeDelta::minutes(5);
    let snapshot = vec![Message::from_server(&record(
        "srv-1",
        &bob(),
        "older",
        Some(WireTimestamp::Native(earlier)),
    ))];
    reconciler.reconcile_snapshot(&mut store, snapshot);

    assert_eq!(store.len(), 2);
    assert_eq!(store.messages()[0].content, "older");
    assert_eq!(store.messages()[1].identity, local);
    assert!(store.is_consistent());
}

// =============================================================================
// Sending
// =============================================================================

#[tokio::test]
async fn first_send_fails_second_succeeds() {
    let backend = Arc::new(InMemoryBackend::new());
    let engine = engine_with(&backend, SyncConfig::default());

    backend.set_offline(true);
    let first = engine.send("first").unwrap();
    assert_eq!(first.settled().await, DeliveryState::Failed);

    backend.set_offline(false);
    let second = engine.send("second").unwrap();
    assert_eq!(second.settled().await, DeliveryState::Confirmed);

    let messages = engine.messages();
    assert_eq!(messages.len(), 2);
    let failed: Vec<_> = messages.iter().filter(|m| m.delivery == DeliveryState::Failed).collect();
    let confirmed: Vec<_> = messages.iter().filter(|m| m.delivery == DeliveryState::Confirmed).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].content, "first");
    assert!(failed[0].is_local());
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].content, "second");
}

#[tokio::test]
async fn offline_send_retried_after_reconnect_confirms_once() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.set_push_available(false);
    let engine = engine_with(&backend, fast());
    let _session = engine.start().await;
    assert_eq!(engine.connection_state(), ConnectionState::Polling);

    backend.set_offline(true);
    let ticket = engine.send("hello").unwrap();
    assert_eq!(ticket.settled().await, DeliveryState::Failed);
    let failed = engine.messages()[0].identity.clone();

    backend.set_offline(false);
    backend.set_echo_records(false);
    backend.set_send_delay(Some(Duration::from_millis(100)));
    let retried = engine.retry(&failed).unwrap();

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].delivery, DeliveryState::Pending);
    assert_ne!(snapshot.messages[0].identity, failed);

    assert_eq!(retried.settled().await, DeliveryState::Confirmed);
    // Let a few poll ticks run over the persisted history.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let messages = engine.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "hello");
    assert_eq!(messages[0].delivery, DeliveryState::Confirmed);
    assert!(messages[0].server_id().is_some());
    assert_eq!(backend.history_len(), 1);
}

#[tokio::test]
async fn send_without_echo_is_confirmed_from_history() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.set_echo_records(false);
    let engine = engine_with(&backend, SyncConfig::default());

    let ticket = engine.send("no echo").unwrap();
    assert_eq!(ticket.settled().await, DeliveryState::Confirmed);

    let messages = engine.messages();
    assert_eq!(messages.len(), 1);
    assert!(!messages[0].is_local());
}

#[tokio::test]
async fn lost_response_is_healed_by_push_or_poll() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.set_lose_responses(true);
    let engine = engine_with(&backend, fast());
    let _session = engine.start().await;

    let _ticket = engine.send("did it land?").unwrap();
    wait_for(&engine, |s| {
        s.messages.len() == 1 && s.messages[0].delivery == DeliveryState::Confirmed
    })
    .await;
    assert_eq!(backend.history_len(), 1);
}

#[tokio::test]
async fn slow_send_times_out_as_failed() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.set_send_delay(Some(Duration::from_millis(500)));
    let config = SyncConfig {
        send_timeout: Duration::from_millis(50),
        ..SyncConfig::default()
    };
    let engine = engine_with(&backend, config);

    let ticket = engine.send("too slow").unwrap();
    assert_eq!(ticket.settled().await, DeliveryState::Failed);
    assert_eq!(engine.messages()[0].delivery, DeliveryState::Failed);

    // The timed-out call never persisted anything.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.history_len(), 0);
}

#[tokio::test]
async fn only_one_send_in_flight() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.set_send_delay(Some(Duration::from_millis(100)));
    let engine = engine_with(&backend, SyncConfig::default());

    let first = engine.send("one").unwrap();
    assert!(matches!(engine.send("two"), Err(SendError::AlreadyInFlight(id)) if id == *first.local_id()));
    assert_eq!(engine.messages().len(), 1);

    assert_eq!(first.settled().await, DeliveryState::Confirmed);
    assert!(engine.send("two").is_ok());
}

#[tokio::test]
async fn invalid_content_never_reaches_backend() {
    let backend = Arc::new(InMemoryBackend::new());
    let engine = engine_with(&backend, SyncConfig::default());

    assert!(matches!(engine.send("   "), Err(SendError::Invalid(_))));
    assert!(matches!(engine.send(&"x".repeat(5000)), Err(SendError::Invalid(_))));
    assert!(engine.messages().is_empty());
    assert_eq!(backend.send_attempts(), 0);
}

#[tokio::test]
async fn retry_and_dismiss_only_apply_to_failed_entries() {
    let backend = Arc::new(InMemoryBackend::new());
    let engine = engine_with(&backend, SyncConfig::default());

    let ok = engine.send("fine").unwrap();
    assert_eq!(ok.settled().await, DeliveryState::Confirmed);
    let confirmed = engine.messages()[0].identity.clone();
    assert!(matches!(engine.retry(&confirmed), Err(RetryError::NotFailed { .. })));
    assert!(matches!(engine.dismiss(&confirmed), Err(RetryError::NotFailed { .. })));

    backend.set_offline(true);
    let bad = engine.send("doomed").unwrap();
    assert_eq!(bad.settled().await, DeliveryState::Failed);
    let failed = Identity::Local(bad_local(&engine));
    let removed = engine.dismiss(&failed).unwrap();
    assert_eq!(removed.content, "doomed");
    assert_eq!(engine.messages().len(), 1);
    assert!(matches!(engine.retry(&failed), Err(RetryError::NotFound(_))));
}

fn bad_local(engine: &ConversationEngine<InMemoryBackend>) -> projchat::sync::LocalId {
    engine
        .messages()
        .iter()
        .filter(|m| m.delivery == DeliveryState::Failed)
        .find_map(Message::local_id)
        .cloned()
        .expect("a failed local entry")
}

#[tokio::test]
async fn server_clock_skew_within_window_still_dedups() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.set_clock_skew(TimeDelta::seconds(2));
    backend.set_echo_records(false);
    let engine = engine_with(&backend, fast());
    let _session = engine.start().await;

    let ticket = engine.send("skewed").unwrap();
    assert_eq!(ticket.settled().await, DeliveryState::Confirmed);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.messages().len(), 1);
}

// =============================================================================
// Push and polling
// =============================================================================

#[tokio::test]
async fn duplicate_push_delivery_keeps_one_entry() {
    let backend = Arc::new(InMemoryBackend::new());
    let engine = engine_with(&backend, SyncConfig::default());
    let _session = engine.start().await;

    let pushed = backend.post(&OutgoingMessage::new(&bob(), &reverse_thread(), "twice"));
    backend.deliver(&pushed);

    wait_for(&engine, |s| s.messages.iter().any(|m| m.content == "twice")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.messages().len(), 1);
}

#[tokio::test]
async fn push_for_other_conversations_is_ignored() {
    let backend = Arc::new(InMemoryBackend::new());
    let engine = engine_with(&backend, SyncConfig::default());
    let _session = engine.start().await;

    let carol_thread = ConversationKey::new(alice(), ProjectId::new("apollo"));
    backend.post(&OutgoingMessage::new(&UserId::new("carol"), &carol_thread, "not for this view"));
    backend.post(&OutgoingMessage::new(&bob(), &reverse_thread(), "for this view"));

    wait_for(&engine, |s| s.messages.iter().any(|m| m.content == "for this view")).await;
    assert_eq!(engine.messages().len(), 1);
}

#[tokio::test]
async fn push_drop_degrades_to_polling_which_keeps_syncing() {
    let backend = Arc::new(InMemoryBackend::new());
    let engine = engine_with(&backend, fast());
    let session = engine.start().await;
    assert_eq!(engine.connection_state(), ConnectionState::Live);

    backend.drop_subscriptions();
    wait_for(&engine, |s| s.connection == ConnectionState::Polling).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!session.is_push_active());
    assert!(session.is_polling());

    backend.post(&OutgoingMessage::new(&bob(), &reverse_thread(), "via poll"));
    wait_for(&engine, |s| s.messages.iter().any(|m| m.content == "via poll")).await;
    assert!(!engine.is_stalled());
}

#[tokio::test]
async fn stale_poll_does_not_hide_a_freshly_confirmed_send() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.set_fetch_delay(Some(Duration::from_millis(200)));
    let engine = engine_with(&backend, SyncConfig::default());

    // The poll reads the (empty) history first, then the send confirms
    // while that response is still on its way.
    let poll = engine.refresh();
    let send = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let state = engine.send("hi").unwrap().settled().await;
        (state, engine.messages().len())
    };
    let (polled, (state, len_after_confirm)) = tokio::join!(poll, send);

    assert_eq!(state, DeliveryState::Confirmed);
    assert_eq!(len_after_confirm, 1);
    assert_eq!(polled.unwrap().removed, 0);
    let messages = engine.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "hi");
    assert_eq!(messages[0].delivery, DeliveryState::Confirmed);

    // A poll started after the confirmation sees the record and keeps it.
    backend.set_fetch_delay(None);
    engine.refresh().await.unwrap();
    assert_eq!(engine.messages().len(), 1);
}

#[tokio::test]
async fn remounted_view_keeps_push_state_after_old_view_drops() {
    let backend = Arc::new(InMemoryBackend::new());
    let engine = engine_with(&backend, fast());
    let old_view = engine.start().await;
    let new_view = engine.start().await;

    drop(old_view);
    assert!(new_view.is_push_active());
    assert_eq!(engine.connection_state(), ConnectionState::Live);

    backend.post(&OutgoingMessage::new(&bob(), &reverse_thread(), "still live"));
    wait_for(&engine, |s| s.messages.iter().any(|m| m.content == "still live")).await;
    assert_eq!(engine.connection_state(), ConnectionState::Live);
}

#[tokio::test]
async fn teardown_stops_push_and_polling() {
    let backend = Arc::new(InMemoryBackend::new());
    let engine = engine_with(&backend, fast());
    let session = engine.start().await;
    assert_eq!(backend.subscriber_count(), 1);

    session.stop();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(backend.subscriber_count(), 0);

    backend.post(&OutgoingMessage::new(&bob(), &reverse_thread(), "unseen"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(engine.messages().is_empty());

    // A manual refresh still works on a torn-down view.
    engine.refresh().await.unwrap();
    assert_eq!(engine.messages().len(), 1);
}

#[tokio::test]
async fn malformed_timestamp_is_kept_with_sentinel() {
    let backend = Arc::new(InMemoryBackend::new());
    let json = serde_json::json!({
        "id": "srv-odd",
        "senderId": "bob",
        "recipientId": "alice",
        "projectId": "apollo",
        "content": "when was this?",
        "sentAt": "sometime last week",
    });
    let odd: ServerMessage = serde_json::from_value(json).unwrap();
    backend.store_record(odd);
    backend.store_record(record("srv-missing", &bob(), "no time at all", None));
    backend.post(&OutgoingMessage::new(&bob(), &reverse_thread(), "normal"));

    let engine = engine_with(&backend, SyncConfig::default());
    engine.refresh().await.unwrap();

    let messages = engine.messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].content, "normal");
    for entry in &messages[1..] {
        assert_eq!(entry.sent_at, SentAt::Unknown);
        assert_eq!(entry.sent_at.label("%H:%M"), SENTINEL_LABEL);
    }
}
