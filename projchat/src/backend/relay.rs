//! WebSocket relay backend for `ProjChat`.
//!
//! Implements [`ChatBackend`] over one WebSocket connection to a
//! `projchat-relay` server. Requests carry a client-chosen id and are
//! matched to responses by a background reader task, which also fans push
//! events out to open subscriptions. When the socket closes, pending
//! requests fail and every subscription ends. History is fetched page by
//! page so no single frame exceeds the protocol limit.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use projchat_proto::message::{ConversationKey, OutgoingMessage, ProjectId, ServerMessage, UserId};
use projchat_proto::relay::{self, RelayFrame};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{ChatBackend, Subscription, TransportError};
use crate::config::RelaySettings;

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;

/// Type alias for the read half of a WebSocket connection.
type WsReader = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<RelayFrame>>>>;
type SubscriberMap = Arc<Mutex<HashMap<ProjectId, Vec<mpsc::Sender<ServerMessage>>>>>;

/// Buffered push events per subscription.
const SUBSCRIPTION_BUFFER: usize = 256;

/// Chat backend speaking the relay protocol.
///
/// Created via [`RelayBackend::connect`], which opens the WebSocket,
/// performs the `Hello`/`Welcome` handshake, and spawns the reader task.
pub struct RelayBackend {
    /// The identified user of this connection.
    user_id: UserId,
    /// The relay server URL.
    url: String,
    /// Write half of the WebSocket (shared for concurrent requests).
    ws_sender: tokio::sync::Mutex<WsSender>,
    /// Requests waiting for their response, by request id.
    pending: PendingMap,
    /// Push subscriptions, by project.
    subscribers: SubscriberMap,
    next_request: AtomicU64,
    request_timeout: Duration,
    /// Whether the WebSocket connection is up.
    connected: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl RelayBackend {
    /// Connect to a relay server as `user_id`.
    ///
    /// # Errors
    ///
    /// - [`TransportError::InvalidUrl`] unless the URL is `ws://` or `wss://`.
    /// - [`TransportError::Timeout`] if the handshake exceeds the connect timeout.
    /// - [`TransportError::Rejected`] if the server answers `Hello` with an error.
    /// - [`TransportError::ConnectionClosed`] or [`TransportError::Io`] for
    ///   socket failures.
    pub async fn connect(settings: &RelaySettings, user_id: UserId) -> Result<Self, TransportError> {
        let url = validate_url(&settings.url)?;

        let (ws_stream, _response) = tokio::time::timeout(settings.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                tracing::warn!(url = %url, "relay WebSocket connect timed out");
                TransportError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url = %url, error = %e, "relay WebSocket connect failed");
                map_ws_error(e)
            })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let hello = relay::encode(&RelayFrame::Hello {
            user_id: user_id.clone(),
        })
        .map_err(|e| TransportError::Protocol(e.to_string()))?;
        ws_sender.send(Message::Text(hello.into())).await.map_err(map_ws_error)?;

        let welcome = tokio::time::timeout(settings.connect_timeout, ws_reader.next())
            .await
            .map_err(|_| {
                tracing::warn!(url = %url, "relay welcome timed out");
                TransportError::Timeout
            })?;
        match welcome {
            Some(Ok(Message::Text(text))) => match relay::decode(text.as_str()) {
                Ok(RelayFrame::Welcome { user_id: welcomed }) => {
                    tracing::info!(user_id = %welcomed, url = %url, "connected to relay");
                }
                Ok(RelayFrame::Error { reason, .. }) => {
                    tracing::warn!(reason = %reason, "relay rejected hello");
                    return Err(TransportError::Rejected(reason));
                }
                Ok(other) => {
                    return Err(TransportError::Protocol(format!("expected welcome, got {other:?}")));
                }
                Err(e) => return Err(TransportError::Protocol(e.to_string())),
            },
            Some(Ok(Message::Close(_))) | None => return Err(TransportError::ConnectionClosed),
            Some(Ok(_)) => {
                return Err(TransportError::Protocol("unexpected frame during handshake".into()));
            }
            Some(Err(e)) => return Err(map_ws_error(e)),
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let subscribers: SubscriberMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(
            ws_reader,
            Arc::clone(&pending),
            Arc::clone(&subscribers),
            Arc::clone(&connected),
        ));

        Ok(Self {
            user_id,
            url: url.to_string(),
            ws_sender: tokio::sync::Mutex::new(ws_sender),
            pending,
            subscribers,
            next_request: AtomicU64::new(1),
            request_timeout: settings.request_timeout,
            connected,
            reader_handle,
        })
    }

    /// The relay URL this backend is connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The identified user.
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Whether the WebSocket connection is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn write(&self, frame: &RelayFrame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }
        let text = relay::encode(frame).map_err(|e| TransportError::Protocol(e.to_string()))?;
        let mut sender = self.ws_sender.lock().await;
        sender.send(Message::Text(text.into())).await.map_err(|e| {
            tracing::warn!(error = %e, "relay write failed");
            self.connected.store(false, Ordering::Relaxed);
            TransportError::ConnectionClosed
        })
    }

    /// Sends a request frame built for a fresh id and waits for its response.
    async fn request(&self, build: impl FnOnce(u64) -> RelayFrame) -> Result<RelayFrame, TransportError> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(e) = self.write(&build(id)).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(RelayFrame::Error { reason, .. })) => Err(TransportError::Rejected(reason)),
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                tracing::warn!(request_id = id, "relay request timed out");
                Err(TransportError::Timeout)
            }
        }
    }
}

impl Drop for RelayBackend {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

impl ChatBackend for RelayBackend {
    async fn send(&self, message: &OutgoingMessage) -> Result<Option<ServerMessage>, TransportError> {
        let response = self
            .request(|request_id| RelayFrame::Send {
                request_id,
                message: message.clone(),
            })
            .await?;
        match response {
            RelayFrame::SendResult { message, .. } => Ok(message),
            other => Err(unexpected(&other)),
        }
    }

    async fn fetch_history(&self, me: &UserId, key: &ConversationKey) -> Result<Vec<ServerMessage>, TransportError> {
        if *me != self.user_id {
            return Err(TransportError::Rejected(format!(
                "connection belongs to {}, not {me}",
                self.user_id
            )));
        }
        let mut history = Vec::new();
        let mut after = None;
        loop {
            let response = self
                .request(|request_id| RelayFrame::FetchHistory {
                    request_id,
                    project_id: key.project_id.clone(),
                    counterpart_id: key.counterpart_id.clone(),
                    after: after.clone(),
                })
                .await?;
            let (messages, has_more) = match response {
                RelayFrame::History { messages, has_more, .. } => (messages, has_more),
                other => return Err(unexpected(&other)),
            };
            let cursor = messages.last().map(|m| m.id.clone());
            history.extend(messages);
            match cursor {
                Some(id) if has_more => after = Some(id),
                _ => break,
            }
        }
        tracing::debug!(conversation = %key, messages = history.len(), "history fetched");
        Ok(history)
    }

    async fn subscribe(&self, project: &ProjectId, subscriber: &UserId) -> Result<Subscription, TransportError> {
        if *subscriber != self.user_id {
            return Err(TransportError::Rejected(format!(
                "connection belongs to {}, not {subscriber}",
                self.user_id
            )));
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let first = {
            let mut subscribers = self.subscribers.lock();
            let list = subscribers.entry(project.clone()).or_default();
            list.retain(|s| !s.is_closed());
            list.push(tx);
            list.len() == 1
        };
        if first {
            self.write(&RelayFrame::Subscribe {
                project_id: project.clone(),
            })
            .await?;
        }
        Ok(Subscription::new(rx))
    }
}

/// Background task that reads relay frames and dispatches them.
///
/// Responses complete the matching pending request, events go to every
/// subscription of their project. Malformed frames are logged and skipped.
/// On exit all pending requests and subscriptions are dropped, which the
/// waiting side observes as a closed connection.
async fn reader_loop(mut ws_reader: WsReader, pending: PendingMap, subscribers: SubscriberMap, connected: Arc<AtomicBool>) {
    while let Some(msg) = ws_reader.next().await {
        match msg {
            Ok(Message::Text(text)) => match relay::decode(text.as_str()) {
                Ok(RelayFrame::Event { message }) => dispatch_event(&subscribers, message),
                Ok(RelayFrame::Subscribed { project_id }) => {
                    tracing::debug!(project = %project_id, "relay subscription confirmed");
                }
                Ok(frame) => {
                    if let Some(id) = frame.request_id() {
                        match pending.lock().remove(&id) {
                            Some(waiter) => {
                                let _ = waiter.send(frame);
                            }
                            None => tracing::debug!(request_id = id, "response for unknown request"),
                        }
                    } else if let RelayFrame::Error { reason, .. } = frame {
                        tracing::warn!(reason = %reason, "relay server error");
                    } else {
                        tracing::debug!(?frame, "unexpected relay frame");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "malformed relay frame, skipping"),
            },
            Ok(Message::Close(_)) => {
                tracing::info!("relay WebSocket closed by server");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "relay WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    pending.lock().clear();
    subscribers.lock().clear();
    tracing::info!("relay reader task exiting");
}

fn dispatch_event(subscribers: &SubscriberMap, message: ServerMessage) {
    let mut subscribers = subscribers.lock();
    let Some(list) = subscribers.get_mut(&message.project_id) else {
        return;
    };
    list.retain(|tx| match tx.try_send(message.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(message_id = %message.id, "subscription lagging, event dropped");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

fn unexpected(frame: &RelayFrame) -> TransportError {
    TransportError::Protocol(format!("unexpected response {frame:?}"))
}

fn validate_url(raw: &str) -> Result<url::Url, TransportError> {
    let parsed = url::Url::parse(raw).map_err(|e| TransportError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(TransportError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {other:?}"),
        }),
    }
}

/// Map a `tokio_tungstenite` error to a [`TransportError`].
fn map_ws_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => TransportError::Io(io_err),
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::ConnectionClosed,
        WsError::Http(response) => TransportError::Rejected(format!("relay HTTP error: status {}", response.status())),
        other => TransportError::Io(std::io::Error::other(format!("relay connection error: {other}"))),
    }
}
