//! WebSocket link to the server's realtime hub.
//!
//! [`RealtimeClient`] connects to the server's `/ws` endpoint, identifies
//! with the user's bearer token, and then serves two directions of
//! traffic: outgoing [`ClientEvent`]s (room joins and same-user broadcast
//! hints) and incoming [`ServerEvent`]s, which a background reader task
//! streams into an mpsc channel for the session to drain.
//!
//! The server never inspects hint payloads for delivery decisions; it
//! forwards them to the same user's other connections only, so a second
//! browser tab sees messages the first tab just sent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use marketchat_proto::codec::{self, CodecError};
use marketchat_proto::events::{ClientEvent, ServerEvent};
use marketchat_proto::ids::{ChatId, UserId};
use marketchat_proto::model::Message;

/// Type alias for the write half of the WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

/// Type alias for the read half of the WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Timeout for establishing the WebSocket connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the identify acknowledgment after connecting.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffer size for the incoming server event channel.
const EVENT_BUFFER: usize = 256;

/// Errors from the realtime link.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// The URL was not a valid `ws://` or `wss://` endpoint.
    #[error("invalid realtime url: {0}")]
    InvalidUrl(String),

    /// Connecting or identifying took too long.
    #[error("realtime operation timed out")]
    Timeout,

    /// The WebSocket connection could not be established.
    #[error("realtime connect failed: {0}")]
    Connect(String),

    /// The server rejected the identify credential.
    #[error("identify rejected: {0}")]
    Rejected(String),

    /// The connection is gone.
    #[error("realtime connection closed")]
    ConnectionClosed,

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Room operations the session needs from the realtime side.
///
/// [`RealtimeClient`] is the wire implementation; tests substitute a
/// recording fake so reconciliation can be exercised without sockets.
pub trait RoomLink: Send + Sync {
    /// Subscribe this connection to a chat's room.
    fn join_room(&self, chat_id: ChatId)
    -> impl Future<Output = Result<(), RealtimeError>> + Send;

    /// Tell the server to echo a just-sent message to this user's other
    /// connections in the room.
    fn broadcast_hint(
        &self,
        chat_id: ChatId,
        message: &Message,
    ) -> impl Future<Output = Result<(), RealtimeError>> + Send;
}

/// A live, identified connection to the realtime hub.
pub struct RealtimeClient {
    /// Identity the server bound this connection to.
    user_id: UserId,
    /// Write half, shared for concurrent sends.
    ws_sender: Arc<Mutex<WsSender>>,
    /// Whether the socket is still up.
    connected: Arc<AtomicBool>,
    /// Keeps the background reader alive for the client's lifetime.
    _reader_handle: tokio::task::JoinHandle<()>,
}

impl RealtimeClient {
    /// Connect to the hub and identify with `token`.
    ///
    /// Steps:
    /// 1. Establish the WebSocket connection (10s timeout).
    /// 2. Send [`ClientEvent::Identify`] with the bearer token.
    /// 3. Wait for [`ServerEvent::Identified`] (5s timeout).
    /// 4. Spawn a background reader that streams further server events
    ///    into the returned channel.
    ///
    /// # Errors
    ///
    /// - [`RealtimeError::InvalidUrl`] for a non-WebSocket URL.
    /// - [`RealtimeError::Timeout`] if connect or identify times out.
    /// - [`RealtimeError::Rejected`] if the token is not recognized.
    /// - [`RealtimeError::Connect`] for transport-level failures.
    pub async fn connect(
        url: &str,
        token: &str,
    ) -> Result<(Self, mpsc::Receiver<ServerEvent>), RealtimeError> {
        let parsed =
            url::Url::parse(url).map_err(|e| RealtimeError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(RealtimeError::InvalidUrl(format!(
                "unsupported scheme: {}",
                parsed.scheme()
            )));
        }

        let (ws_stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, "realtime connect timed out");
                RealtimeError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, err = %e, "realtime connect failed");
                RealtimeError::Connect(e.to_string())
            })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let identify = ClientEvent::Identify {
            token: token.to_string(),
        };
        let bytes = codec::encode(&identify)?;
        ws_sender
            .send(WsMessage::Binary(bytes.into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "failed to send identify");
                RealtimeError::Connect(e.to_string())
            })?;

        let user_id = wait_for_identified(&mut ws_reader).await?;
        tracing::info!(user = %user_id, url, "identified with realtime hub");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let connected = Arc::new(AtomicBool::new(true));
        let reader_connected = Arc::clone(&connected);
        let reader_handle = tokio::spawn(reader_loop(ws_reader, tx, reader_connected));

        Ok((
            Self {
                user_id,
                ws_sender: Arc::new(Mutex::new(ws_sender)),
                connected,
                _reader_handle: reader_handle,
            },
            rx,
        ))
    }

    /// The identity the server bound this connection to.
    #[must_use]
    pub const fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Whether the socket is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Encode and send one client event over the socket.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::ConnectionClosed`] when the socket is
    /// down, or a codec error for an unencodable event.
    async fn send_event(&self, event: &ClientEvent) -> Result<(), RealtimeError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(RealtimeError::ConnectionClosed);
        }
        let bytes = codec::encode(event)?;
        let mut sender = self.ws_sender.lock().await;
        sender
            .send(WsMessage::Binary(bytes.into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "realtime send failed");
                self.connected.store(false, Ordering::Relaxed);
                RealtimeError::ConnectionClosed
            })
    }
}

impl RoomLink for RealtimeClient {
    async fn join_room(&self, chat_id: ChatId) -> Result<(), RealtimeError> {
        self.send_event(&ClientEvent::JoinRoom { chat_id }).await
    }

    async fn broadcast_hint(
        &self,
        chat_id: ChatId,
        message: &Message,
    ) -> Result<(), RealtimeError> {
        self.send_event(&ClientEvent::BroadcastHint {
            chat_id,
            message: message.clone(),
        })
        .await
    }
}

/// Wait for the server's identify acknowledgment.
async fn wait_for_identified(ws_reader: &mut WsReader) -> Result<UserId, RealtimeError> {
    let ack = tokio::time::timeout(IDENTIFY_TIMEOUT, ws_reader.next())
        .await
        .map_err(|_| {
            tracing::warn!("identify acknowledgment timed out");
            RealtimeError::Timeout
        })?;

    match ack {
        Some(Ok(WsMessage::Binary(data))) => match codec::decode::<ServerEvent>(&data) {
            Ok(ServerEvent::Identified { user_id }) => Ok(user_id),
            Ok(ServerEvent::Error { reason }) => {
                tracing::warn!(reason = %reason, "identify rejected");
                Err(RealtimeError::Rejected(reason))
            }
            Ok(other) => {
                tracing::warn!(?other, "unexpected event during identify");
                Err(RealtimeError::Connect(
                    "unexpected event during identify".to_string(),
                ))
            }
            Err(e) => {
                tracing::warn!(err = %e, "malformed identify response");
                Err(RealtimeError::Codec(e))
            }
        },
        Some(Ok(WsMessage::Close(_))) | None => Err(RealtimeError::ConnectionClosed),
        Some(Ok(_)) => Err(RealtimeError::Connect(
            "unexpected non-binary frame during identify".to_string(),
        )),
        Some(Err(e)) => Err(RealtimeError::Connect(e.to_string())),
    }
}

/// Background task that decodes incoming frames into [`ServerEvent`]s.
///
/// Malformed frames are logged and skipped; the task only exits when the
/// socket closes or the receiving side of the channel is dropped.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::Sender<ServerEvent>,
    connected: Arc<AtomicBool>,
) {
    while let Some(frame) = ws_reader.next().await {
        match frame {
            Ok(WsMessage::Binary(data)) => match codec::decode::<ServerEvent>(&data) {
                Ok(event) => {
                    if let ServerEvent::Error { reason } = &event {
                        tracing::warn!(reason = %reason, "server reported realtime error");
                    }
                    if tx.send(event).await.is_err() {
                        // Session dropped the receiver; nothing left to feed.
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed realtime frame, skipping");
                }
            },
            Ok(WsMessage::Close(_)) => {
                tracing::info!("realtime connection closed by server");
                break;
            }
            Ok(
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Text(_) | WsMessage::Frame(_),
            ) => {
                // Control and text frames carry no events.
            }
            Err(e) => {
                tracing::warn!(err = %e, "realtime read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::debug!("realtime reader task exiting");
}
