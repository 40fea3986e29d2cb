//! Relay server core: shared state, WebSocket handler, and signaling
//! dispatch.
//!
//! The relay accepts WebSocket connections on `/ws`, decodes each inbound
//! frame into a [`SignalMessage`], and acts on it against the
//! [`ChannelRegistry`]. The protocol is fire-and-forget: nothing is ever sent
//! back to the originating peer, including errors.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use futures_util::{SinkExt, StreamExt};
use phonly_proto::signal::{self, DecodeError, SignalMessage};
use tokio::sync::mpsc;

use crate::registry::{ChannelRegistry, ConnectionId, JoinOutcome};

/// Default largest accepted signaling frame in bytes (64 KB).
const DEFAULT_MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Shared relay server state.
pub struct RelayState {
    /// Channel membership and connection table.
    pub registry: ChannelRegistry,
    /// Largest accepted signaling frame in bytes.
    max_payload_size: usize,
    started_at: Instant,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a new relay state with an empty registry and the default
    /// payload size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Creates a new relay state with a custom payload size limit.
    #[must_use]
    pub fn with_config(max_payload_size: usize) -> Self {
        Self {
            registry: ChannelRegistry::new(),
            max_payload_size,
            started_at: Instant::now(),
        }
    }

    /// Largest accepted signaling frame in bytes.
    #[must_use]
    pub const fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }
}

/// Handles an upgraded WebSocket connection for a single peer.
///
/// The connection lifecycle:
/// 1. Register the connection with no channel.
/// 2. Spawn a writer task draining the connection's outbound queue.
/// 3. Read frames and dispatch them until close or a transport error.
/// 4. Remove the connection (and its channel membership) from the registry.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn = state.registry.connect(tx);
    tracing::info!(conn = %conn, "peer connected");

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(conn = %conn, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => handle_text_message(&reader_state, conn, &text),
                Ok(Message::Binary(data)) => match Utf8Bytes::try_from(data) {
                    Ok(text) => handle_text_message(&reader_state, conn, &text),
                    Err(e) => {
                        tracing::warn!(conn = %conn, error = %e, "dropping non-UTF-8 binary frame");
                    }
                },
                Ok(Message::Close(_)) => {
                    tracing::info!(conn = %conn, "received close frame");
                    break;
                }
                Ok(_) => {
                    // Ping/pong are answered by the transport.
                }
                Err(e) => {
                    // The transport closes the stream after reporting an error.
                    tracing::warn!(conn = %conn, error = %e, "WebSocket transport error");
                    break;
                }
            }
        }
    });

    // Wait for either task to finish, then abort the other.
    let finished = tokio::select! {
        res = &mut read_task => {
            write_task.abort();
            res
        }
        res = &mut write_task => {
            read_task.abort();
            res
        }
    };
    if let Err(e) = finished
        && e.is_panic()
    {
        tracing::error!(conn = %conn, error = %e, "connection task panicked");
    }

    match state.registry.disconnect(conn) {
        Some(channel) => {
            tracing::info!(conn = %conn, channel = %channel, "peer disconnected and left channel");
        }
        None => tracing::info!(conn = %conn, "peer disconnected"),
    }
}

/// Decodes one signaling frame from `conn` and applies it.
///
/// Oversized, malformed, and incomplete frames are logged and dropped; the
/// connection stays open and nothing is sent back.
pub fn handle_text_message(state: &RelayState, conn: ConnectionId, text: &Utf8Bytes) {
    let raw = text.as_str();
    if raw.len() > state.max_payload_size {
        tracing::warn!(
            conn = %conn,
            size = raw.len(),
            max = state.max_payload_size,
            "dropping oversized signaling message"
        );
        return;
    }

    let msg = match signal::decode(raw) {
        Ok(m) => m,
        Err(e @ (DecodeError::MissingField { .. } | DecodeError::InvalidField { .. })) => {
            tracing::warn!(conn = %conn, error = %e, "dropping incomplete signaling message");
            return;
        }
        Err(e) => {
            tracing::warn!(conn = %conn, error = %e, "failed to decode signaling message");
            return;
        }
    };

    match msg {
        SignalMessage::JoinChannel { channel, user_id } => {
            handle_join(state, conn, &channel, &user_id);
        }
        SignalMessage::ExtensionRequest { ref channel }
        | SignalMessage::ExtensionResponse { ref channel } => {
            let delivered = state.registry.forward(conn, channel, text);
            tracing::debug!(
                conn = %conn,
                channel = %channel,
                kind = msg.kind(),
                delivered,
                "forwarded signaling message"
            );
        }
        SignalMessage::UserReport { user_id } => {
            let channel = state.registry.channel_of(conn);
            tracing::info!(
                conn = %conn,
                reporter = user_id.as_deref().unwrap_or("<anonymous>"),
                channel = channel.as_deref().unwrap_or("<none>"),
                report = %raw,
                "user report received"
            );
        }
        SignalMessage::Unrecognized { kind } => {
            tracing::debug!(conn = %conn, kind = %kind, "ignoring unrecognized message type");
        }
    }
}

fn handle_join(state: &RelayState, conn: ConnectionId, channel: &str, user_id: &str) {
    match state.registry.join(conn, channel, user_id) {
        Ok(JoinOutcome::Joined) => {
            tracing::info!(conn = %conn, channel = %channel, user_id = %user_id, "peer joined channel");
        }
        Ok(JoinOutcome::AlreadyMember) => {
            tracing::debug!(conn = %conn, channel = %channel, user_id = %user_id, "peer re-joined channel");
        }
        Ok(JoinOutcome::Moved { from }) => {
            tracing::info!(
                conn = %conn,
                from = %from,
                channel = %channel,
                user_id = %user_id,
                "peer moved to another channel"
            );
        }
        Err(e) => {
            tracing::warn!(conn = %conn, channel = %channel, error = %e, "join failed");
        }
    }
}

/// Process status reported by `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Always `"ok"` while the process is serving.
    pub status: String,
    /// Number of non-empty channels.
    pub channels: usize,
    /// Number of live WebSocket connections.
    pub connections: usize,
    /// Seconds since the relay state was created.
    pub uptime_secs: u64,
}

/// axum handler for `GET /health`.
pub async fn health(
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> axum::Json<HealthReport> {
    let stats = state.registry.stats();
    axum::Json(HealthReport {
        status: "ok".to_string(),
        channels: stats.channels,
        connections: stats.connections,
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

/// Builds the relay's router: `/ws` for signaling and `/health` for status.
pub fn router(state: Arc<RelayState>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .route("/health", axum::routing::get(health))
        .with_state(state)
}

/// Starts the relay server with a pre-configured [`RelayState`] and returns
/// the bound address and a join handle.
///
/// Keeping a clone of `state` lets callers inspect the registry or close
/// every connection on shutdown.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
