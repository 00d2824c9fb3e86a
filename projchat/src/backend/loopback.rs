//! In-process chat backend for testing.
//!
//! [`InMemoryBackend`] keeps history in memory, assigns server ids and
//! timestamps, and fans new records out to project subscribers over
//! [`tokio::sync::mpsc`] channels. Knobs simulate the failure modes the
//! engine has to survive: going offline, slow or lost send responses, push
//! being unavailable or dropping, clock drift and odd timestamp shapes.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use projchat_proto::message::{
    ConversationKey, OutgoingMessage, ProjectId, ServerId, ServerMessage, UserId, validate_content,
};
use projchat_proto::timestamp::TimestampStyle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{ChatBackend, Subscription, TransportError};

/// Buffered events per subscription before new ones are dropped.
const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Knobs {
    offline: bool,
    push_available: bool,
    echo_records: bool,
    lose_responses: bool,
    send_delay: Option<Duration>,
    fetch_delay: Option<Duration>,
    clock_skew: TimeDelta,
    style: TimestampStyle,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            offline: false,
            push_available: true,
            echo_records: true,
            lose_responses: false,
            send_delay: None,
            fetch_delay: None,
            clock_skew: TimeDelta::zero(),
            style: TimestampStyle::Native,
        }
    }
}

struct Subscriber {
    project: ProjectId,
    tx: mpsc::Sender<ServerMessage>,
}

#[derive(Default)]
struct BackendState {
    /// Records with their server instant, ascending.
    history: Vec<(DateTime<Utc>, ServerMessage)>,
    subscribers: Vec<Subscriber>,
    next_id: u64,
    send_attempts: usize,
    knobs: Knobs,
}

impl BackendState {
    fn persist(&mut self, message: &OutgoingMessage) -> ServerMessage {
        self.next_id += 1;
        let instant = Utc::now() + self.knobs.clock_skew;
        let record = ServerMessage {
            id: ServerId::new(format!("srv-{}", self.next_id)),
            sender_id: message.sender_id.clone(),
            recipient_id: message.recipient_id.clone(),
            project_id: message.project_id.clone(),
            content: message.content.clone(),
            sent_at: Some(self.knobs.style.render(instant)),
        };
        self.insert(instant, record.clone());
        record
    }

    fn insert(&mut self, instant: DateTime<Utc>, record: ServerMessage) {
        let at = self.history.partition_point(|(t, _)| *t <= instant);
        self.history.insert(at, (instant, record));
    }

    fn broadcast(&mut self, record: &ServerMessage) {
        self.subscribers.retain(|sub| {
            if sub.project != record.project_id {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(record.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(project = %sub.project, "subscriber lagging, event dropped");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// Chat backend living entirely in process memory.
///
/// Defaults: online, push available, send responses echo the persisted
/// record, timestamps are native instants with no clock skew.
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<BackendState>,
}

impl InMemoryBackend {
    /// Creates an empty backend with default knobs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with [`TransportError::ConnectionClosed`].
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().knobs.offline = offline;
    }

    /// Controls whether [`ChatBackend::subscribe`] succeeds.
    pub fn set_push_available(&self, available: bool) {
        self.state.lock().knobs.push_available = available;
    }

    /// Controls whether sends return the persisted record.
    pub fn set_echo_records(&self, echo: bool) {
        self.state.lock().knobs.echo_records = echo;
    }

    /// When set, sends persist and broadcast but then report a timeout.
    pub fn set_lose_responses(&self, lose: bool) {
        self.state.lock().knobs.lose_responses = lose;
    }

    /// Delays every send by `delay` before it is processed.
    pub fn set_send_delay(&self, delay: Option<Duration>) {
        self.state.lock().knobs.send_delay = delay;
    }

    /// Delays history responses by `delay` after the history was read, so
    /// the caller receives a snapshot that is already out of date.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.state.lock().knobs.fetch_delay = delay;
    }

    /// Shifts server timestamps relative to the local clock.
    pub fn set_clock_skew(&self, skew: TimeDelta) {
        self.state.lock().knobs.clock_skew = skew;
    }

    /// Chooses the wire shape of emitted timestamps.
    pub fn set_timestamp_style(&self, style: TimestampStyle) {
        self.state.lock().knobs.style = style;
    }

    /// Persists a message from another participant and pushes it.
    pub fn post(&self, message: &OutgoingMessage) -> ServerMessage {
        let mut state = self.state.lock();
        let record = state.persist(message);
        state.broadcast(&record);
        record
    }

    /// Stores a prebuilt record without pushing it (a missed push event).
    pub fn store_record(&self, record: ServerMessage) {
        let instant = record
            .sent_at
            .as_ref()
            .and_then(|w| w.to_utc().ok())
            .unwrap_or_else(Utc::now);
        self.state.lock().insert(instant, record);
    }

    /// Pushes `record` to subscribers without storing it (re-delivery).
    pub fn deliver(&self, record: &ServerMessage) {
        self.state.lock().broadcast(record);
    }

    /// Ends every open subscription, as a dropped push connection would.
    pub fn drop_subscriptions(&self) {
        self.state.lock().subscribers.clear();
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|s| !s.tx.is_closed());
        state.subscribers.len()
    }

    /// Number of stored records.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    /// Number of send calls received, including failed ones.
    #[must_use]
    pub fn send_attempts(&self) -> usize {
        self.state.lock().send_attempts
    }
}

impl ChatBackend for InMemoryBackend {
    async fn send(&self, message: &OutgoingMessage) -> Result<Option<ServerMessage>, TransportError> {
        let delay = {
            let mut state = self.state.lock();
            state.send_attempts += 1;
            state.knobs.send_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.knobs.offline {
            return Err(TransportError::ConnectionClosed);
        }
        validate_content(&message.content).map_err(|e| TransportError::Rejected(e.to_string()))?;

        let record = state.persist(message);
        state.broadcast(&record);
        if state.knobs.lose_responses {
            return Err(TransportError::Timeout);
        }
        Ok(state.knobs.echo_records.then_some(record))
    }

    async fn fetch_history(&self, me: &UserId, key: &ConversationKey) -> Result<Vec<ServerMessage>, TransportError> {
        let (records, delay) = {
            let state = self.state.lock();
            if state.knobs.offline {
                return Err(TransportError::ConnectionClosed);
            }
            let records: Vec<ServerMessage> = state
                .history
                .iter()
                .filter(|(_, record)| key.matches(me, record))
                .map(|(_, record)| record.clone())
                .collect();
            (records, state.knobs.fetch_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(records)
    }

    async fn subscribe(&self, project: &ProjectId, subscriber: &UserId) -> Result<Subscription, TransportError> {
        let mut state = self.state.lock();
        if state.knobs.offline {
            return Err(TransportError::ConnectionClosed);
        }
        if !state.knobs.push_available {
            return Err(TransportError::Rejected("push unavailable".into()));
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        state.subscribers.push(Subscriber {
            project: project.clone(),
            tx,
        });
        tracing::debug!(project = %project, subscriber = %subscriber, "in-memory subscription opened");
        Ok(Subscription::new(rx))
    }
}
