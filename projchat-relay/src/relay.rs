//! Relay server core: shared state, WebSocket handler, session registry and
//! event fan-out.
//!
//! Each WebSocket connection identifies a user with a `Hello` frame. It may
//! then send messages, fetch conversation history and subscribe to project
//! event streams. Every accepted message is persisted in the
//! [`HistoryStore`] and pushed as an `Event` to subscribed sessions of both
//! participants.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use projchat_proto::message::{ProjectId, ServerMessage, UserId, validate_content};
use projchat_proto::relay::{self, RelayFrame};
use projchat_proto::timestamp::TimestampStyle;
use tokio::sync::{RwLock, mpsc};

use crate::config::RelayConfig;
use crate::store::HistoryStore;

/// A connected, identified client.
struct Session {
    user_id: UserId,
    sender: mpsc::UnboundedSender<Message>,
    projects: HashSet<ProjectId>,
}

/// Shared relay server state: live sessions, history and server behaviour.
pub struct RelayState {
    sessions: RwLock<HashMap<u64, Session>>,
    next_session: AtomicU64,
    /// Persisted messages.
    pub store: HistoryStore,
    echo_records: AtomicBool,
    timestamp_style: TimestampStyle,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new(HistoryStore::new(), true, TimestampStyle::default())
    }
}

impl RelayState {
    /// Creates a relay state around `store`.
    ///
    /// With `echo_records` unset, send responses omit the persisted record
    /// and clients must learn it from history or events.
    #[must_use]
    pub fn new(store: HistoryStore, echo_records: bool, timestamp_style: TimestampStyle) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            store,
            echo_records: AtomicBool::new(echo_records),
            timestamp_style,
        }
    }

    /// Creates a relay state from a resolved [`RelayConfig`].
    #[must_use]
    pub fn with_config(config: &RelayConfig) -> Self {
        Self::new(
            HistoryStore::with_max_per_project(config.max_history_per_project),
            config.echo_records,
            config.timestamp_style,
        )
    }

    /// Toggles whether send responses carry the persisted record.
    pub fn set_echo_records(&self, echo: bool) {
        self.echo_records.store(echo, Ordering::SeqCst);
    }

    fn echo_records(&self) -> bool {
        self.echo_records.load(Ordering::SeqCst)
    }

    async fn register(&self, user_id: UserId, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.sessions.write().await.insert(
            id,
            Session {
                user_id,
                sender,
                projects: HashSet::new(),
            },
        );
        id
    }

    async fn unregister(&self, session: u64) {
        self.sessions.write().await.remove(&session);
    }

    async fn subscribe(&self, session: u64, project: ProjectId) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(entry) = sessions.get_mut(&session) else {
            return false;
        };
        entry.projects.insert(project);
        true
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Send a WebSocket Close frame to every connected session.
    ///
    /// Each writer task forwards the close, which the client reader sees as
    /// a disconnect.
    pub async fn close_all_connections(&self) {
        let sessions = self.sessions.read().await;
        for (id, session) in sessions.iter() {
            tracing::info!(session = id, user_id = %session.user_id, "closing session");
            let _ = session.sender.send(Message::Close(None));
        }
    }

    async fn reply(&self, session: u64, frame: &RelayFrame) {
        let sessions = self.sessions.read().await;
        if let Some(entry) = sessions.get(&session)
            && let Ok(text) = relay::encode(frame)
        {
            let _ = entry.sender.send(Message::Text(text.into()));
        }
    }

    /// Pushes `record` to every session of either participant that follows
    /// the record's project.
    async fn broadcast(&self, record: &ServerMessage) {
        let text = match relay::encode(&RelayFrame::Event {
            message: record.clone(),
        }) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode event");
                return;
            }
        };
        let sessions = self.sessions.read().await;
        let mut delivered = 0usize;
        for session in sessions.values() {
            let participant = session.user_id == record.sender_id || session.user_id == record.recipient_id;
            if participant && session.projects.contains(&record.project_id) {
                let _ = session.sender.send(Message::Text(text.clone().into()));
                delivered += 1;
            }
        }
        tracing::debug!(id = %record.id, delivered, "event fanned out");
    }
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Wait for a `Hello` frame.
/// 2. Register the session and answer `Welcome`.
/// 3. Serve requests until either side closes.
/// 4. Unregister the session.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let user_id = match wait_for_hello(&mut ws_receiver).await {
        Ok(user_id) => user_id,
        Err(reason) => {
            tracing::warn!(reason = %reason, "handshake failed");
            let _ = send_frame(
                &mut ws_sender,
                &RelayFrame::Error {
                    request_id: None,
                    reason,
                },
            )
            .await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let session = state.register(user_id.clone(), tx).await;

    if let Err(e) = send_frame(&mut ws_sender, &RelayFrame::Welcome { user_id: user_id.clone() }).await {
        tracing::error!(user_id = %user_id, error = %e, "failed to send Welcome");
        state.unregister(session).await;
        return;
    }
    tracing::info!(session, user_id = %user_id, "session opened");

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let reader_user = user_id.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_text(session, &reader_user, text.as_str(), &reader_state).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    state.unregister(session).await;
    tracing::info!(session, user_id = %user_id, "session closed");
}

/// Waits for the opening `Hello` frame and returns the identified user.
async fn wait_for_hello(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Result<UserId, String> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                return match relay::decode(text.as_str()) {
                    Ok(RelayFrame::Hello { user_id }) if user_id.as_str().trim().is_empty() => {
                        Err("empty user id".to_string())
                    }
                    Ok(RelayFrame::Hello { user_id }) => Ok(user_id),
                    Ok(_) => Err("expected hello".to_string()),
                    Err(e) => Err(e.to_string()),
                };
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err("connection closed before hello".to_string())
}

/// Handles one text frame from an identified session.
async fn handle_text(session: u64, user_id: &UserId, text: &str, state: &Arc<RelayState>) {
    let frame = match relay::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(session, error = %e, "failed to decode frame");
            let err = RelayFrame::Error {
                request_id: None,
                reason: e.to_string(),
            };
            state.reply(session, &err).await;
            return;
        }
    };

    match frame {
        RelayFrame::Send {
            request_id,
            mut message,
        } => {
            if let Err(e) = validate_content(&message.content) {
                tracing::debug!(session, request_id, error = %e, "send rejected");
                let err = RelayFrame::Error {
                    request_id: Some(request_id),
                    reason: e.to_string(),
                };
                state.reply(session, &err).await;
                return;
            }
            if message.sender_id != *user_id {
                tracing::warn!(session, claimed = %message.sender_id, "overriding spoofed sender");
                message.sender_id = user_id.clone();
            }
            if message.recipient_id == message.sender_id {
                let err = RelayFrame::Error {
                    request_id: Some(request_id),
                    reason: "cannot message yourself".to_string(),
                };
                state.reply(session, &err).await;
                return;
            }

            let record = state.store.append(message).await.to_record(state.timestamp_style);
            tracing::debug!(session, request_id, id = %record.id, "message stored");

            let response = RelayFrame::SendResult {
                request_id,
                message: state.echo_records().then(|| record.clone()),
            };
            state.reply(session, &response).await;
            state.broadcast(&record).await;
        }
        RelayFrame::FetchHistory {
            request_id,
            project_id,
            counterpart_id,
            after,
        } => {
            let mut messages: Vec<ServerMessage> = state
                .store
                .history_after(&project_id, user_id, &counterpart_id, after.as_ref())
                .await
                .iter()
                .map(|m| m.to_record(state.timestamp_style))
                .collect();
            let page = relay::page_len(&messages, relay::HISTORY_PAGE_BUDGET);
            let has_more = page < messages.len();
            messages.truncate(page);
            tracing::debug!(session, request_id, page, has_more, "history page");
            state
                .reply(
                    session,
                    &RelayFrame::History {
                        request_id,
                        messages,
                        has_more,
                    },
                )
                .await;
        }
        RelayFrame::Subscribe { project_id } => {
            if state.subscribe(session, project_id.clone()).await {
                tracing::debug!(session, project_id = %project_id, "subscribed");
                state.reply(session, &RelayFrame::Subscribed { project_id }).await;
            }
        }
        other => {
            tracing::warn!(session, frame = ?other, "unexpected frame from client");
            let err = RelayFrame::Error {
                request_id: other.request_id(),
                reason: "unexpected frame".to_string(),
            };
            state.reply(session, &err).await;
        }
    }
}

async fn send_frame(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    frame: &RelayFrame,
) -> Result<(), String> {
    let text = relay::encode(frame).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Starts the relay server on the given address with default state and
/// returns the bound address and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>> {
    start_server_with_state(addr, Arc::new(RelayState::default())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
