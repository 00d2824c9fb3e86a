//! Integration tests: conversation engines syncing through the relay server.
//!
//! Starts `projchat-relay` in-process and drives real `RelayBackend`
//! WebSocket connections through the engine:
//! - Messages sent by one participant reach the other's timeline via push
//! - Sends are confirmed with and without echoed records
//! - Every supported timestamp wire shape normalizes to a known instant
//! - Losing the relay degrades to polling and eventually reports a stall
//! - Histories larger than one frame still load and keep polling healthy

use std::sync::Arc;
use std::time::Duration;

use projchat::backend::relay::RelayBackend;
use projchat::config::{RelaySettings, SyncConfig};
use projchat::sync::engine::ConversationEngine;
use projchat::sync::{ConnectionState, ConversationSnapshot, DeliveryState};
use projchat_proto::message::{ConversationKey, MAX_CONTENT_LEN, OutgoingMessage, ProjectId, UserId};
use projchat_proto::timestamp::TimestampStyle;
use projchat_relay::relay::{self, RelayState};
use projchat_relay::store::HistoryStore;

async fn start_relay(state: RelayState) -> (Arc<RelayState>, RelaySettings) {
    let state = Arc::new(state);
    let (addr, _handle) = relay::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start relay server");
    let settings = RelaySettings {
        url: format!("ws://{addr}/ws"),
        connect_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
    };
    (state, settings)
}

fn fast() -> SyncConfig {
    SyncConfig {
        poll_interval: Duration::from_millis(50),
        stall_after_failures: 2,
        ..SyncConfig::default()
    }
}

async fn engine_for(
    settings: &RelaySettings,
    me: &str,
    counterpart: &str,
) -> ConversationEngine<RelayBackend> {
    let backend = RelayBackend::connect(settings, UserId::new(me))
        .await
        .expect("connect to relay");
    let key = ConversationKey::new(UserId::new(counterpart), ProjectId::new("apollo"));
    ConversationEngine::new(Arc::new(backend), UserId::new(me), key, fast())
}

async fn wait_for(engine: &ConversationEngine<RelayBackend>, cond: impl Fn(&ConversationSnapshot) -> bool) {
    let mut rx = engine.watch();
    let reached = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| cond(s)))
        .await
        .is_ok_and(|r| r.is_ok());
    assert!(reached, "condition not reached; last snapshot {:?}", engine.snapshot());
}

#[tokio::test]
async fn message_reaches_counterpart_through_push() {
    let (_state, settings) = start_relay(RelayState::default()).await;
    let alice = engine_for(&settings, "alice", "bob").await;
    let bob = engine_for(&settings, "bob", "alice").await;
    let _alice_view = alice.start().await;
    let _bob_view = bob.start().await;
    assert_eq!(bob.connection_state(), ConnectionState::Live);

    let ticket = alice.send("hi bob").unwrap();
    assert_eq!(ticket.settled().await, DeliveryState::Confirmed);

    wait_for(&bob, |s| s.messages.iter().any(|m| m.content == "hi bob")).await;
    let seen = bob.messages();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].sender_id, UserId::new("alice"));
    assert_eq!(seen[0].server_id(), alice.messages()[0].server_id());
}

#[tokio::test]
async fn send_without_echo_is_confirmed_by_refresh() {
    let state = RelayState::default();
    state.set_echo_records(false);
    let (_state, settings) = start_relay(state).await;
    let alice = engine_for(&settings, "alice", "bob").await;

    let ticket = alice.send("quiet").unwrap();
    assert_eq!(ticket.settled().await, DeliveryState::Confirmed);
    let messages = alice.messages();
    assert_eq!(messages.len(), 1);
    assert!(!messages[0].is_local());
}

#[tokio::test]
async fn all_timestamp_styles_normalize() {
    for style in [
        TimestampStyle::Iso,
        TimestampStyle::EpochSeconds,
        TimestampStyle::EpochMillis,
        TimestampStyle::Native,
    ] {
        let (_state, settings) = start_relay(RelayState::new(HistoryStore::new(), true, style)).await;
        let alice = engine_for(&settings, "alice", "bob").await;

        assert_eq!(alice.send("first").unwrap().settled().await, DeliveryState::Confirmed);
        assert_eq!(alice.send("second").unwrap().settled().await, DeliveryState::Confirmed);
        alice.refresh().await.unwrap();

        let messages = alice.messages();
        assert_eq!(messages.len(), 2, "style {style:?}");
        assert!(messages.iter().all(|m| m.sent_at.is_known()), "style {style:?}");
        assert_eq!(messages[0].content, "first");
        assert!(messages[0].sent_at < messages[1].sent_at);
    }
}

#[tokio::test]
async fn history_is_loaded_when_the_view_starts() {
    let (_state, settings) = start_relay(RelayState::default()).await;
    let bob = engine_for(&settings, "bob", "alice").await;
    assert_eq!(bob.send("left earlier").unwrap().settled().await, DeliveryState::Confirmed);

    let alice = engine_for(&settings, "alice", "bob").await;
    let _view = alice.start().await;
    wait_for(&alice, |s| s.messages.len() == 1).await;
    assert_eq!(alice.messages()[0].content, "left earlier");
}

#[tokio::test]
async fn losing_the_relay_degrades_then_stalls() {
    let (state, settings) = start_relay(RelayState::default()).await;
    let alice = engine_for(&settings, "alice", "bob").await;
    let _view = alice.start().await;
    assert_eq!(alice.connection_state(), ConnectionState::Live);

    state.close_all_connections().await;

    wait_for(&alice, |s| s.connection == ConnectionState::Polling).await;
    wait_for(&alice, |s| s.stalled).await;

    let ticket = alice.send("into the void").unwrap();
    assert_eq!(ticket.settled().await, DeliveryState::Failed);
}

#[tokio::test]
async fn history_beyond_one_frame_keeps_polling_healthy() {
    let state = RelayState::default();
    let big = "x".repeat(MAX_CONTENT_LEN);
    for _ in 0..70 {
        state
            .store
            .append(OutgoingMessage {
                sender_id: UserId::new("bob"),
                recipient_id: UserId::new("alice"),
                project_id: ProjectId::new("apollo"),
                content: big.clone(),
            })
            .await;
    }
    let (_state, settings) = start_relay(state).await;
    let alice = engine_for(&settings, "alice", "bob").await;

    let report = alice.refresh().await.expect("history fetch");
    assert_eq!(report.inserted, 70);
    assert_eq!(alice.messages().len(), 70);

    let _view = alice.start().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!alice.is_stalled());
    assert_eq!(alice.messages().len(), 70);
}
