//! WebSocket glue between a client socket and its `ConnectionActor`.
//!
//! Admission is checked before the upgrade, so a rejected source never
//! costs an actor. After the upgrade the socket is split:
//!
//! - the reader forwards text frames to the actor and reports pongs as activity
//! - the writer drains the actor's `Outbound` queue onto the socket
//!
//! The actor decides when the connection ends. Its final `Outbound::Close`
//! makes the writer send a close frame and stop, which also ends the reader.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use signaling_protocol::encode_event;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::GatewayState;
use crate::actors::{ConnectionActor, ConnectionActorHandle, Outbound};
use crate::admission::Admission;

/// Outbound frames queued per connection before it counts as a slow consumer.
const OUTBOUND_BUFFER: usize = 256;

/// How long the writer may take to flush after the actor stopped.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames above the protocol limit but below this multiple still reach the
/// actor and are answered with a protocol error. Larger frames fail the socket.
const SOCKET_FRAME_HEADROOM: usize = 2;

/// `GET /ws`: check admission, then upgrade.
#[instrument(skip_all, name = "sfu.gateway.upgrade", fields(peer = %peer.ip()))]
pub async fn ws_handler(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.health.is_draining() || state.shutdown.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "node is draining").into_response();
    }

    let source = peer.ip().to_string();
    if let Admission::Deny { retry_after } = state.connections.admission.check_connection(&source) {
        debug!(target: "sfu.gateway", source = %source, "Connection rate limited");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after_secs(retry_after).to_string())],
            "too many connections",
        )
            .into_response();
    }

    let max_frame = state
        .connections
        .settings
        .max_message_bytes
        .saturating_mul(SOCKET_FRAME_HEADROOM);
    ws.max_message_size(max_frame)
        .on_upgrade(move |socket| handle_socket(socket, state, source))
}

/// Whole seconds for a `Retry-After` header, rounded up and at least one.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

async fn handle_socket(socket: WebSocket, state: GatewayState, source: String) {
    let connection_id = Uuid::new_v4().to_string();
    info!(
        target: "sfu.gateway",
        connection_id = %connection_id,
        source = %source,
        "Client connected"
    );

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let (actor, actor_task) = ConnectionActor::spawn(
        connection_id.clone(),
        state.connections.clone(),
        outbound_tx,
        state.shutdown.child_token(),
    );

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(sink, outbound_rx));

    let writer_done = read_loop(stream, &actor, &mut writer).await;

    // No-op if the actor already decided to close.
    actor.disconnected().await;
    if let Err(e) = actor_task.await {
        warn!(target: "sfu.gateway", connection_id = %connection_id, error = %e, "Connection actor panicked");
    }

    if !writer_done && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        debug!(target: "sfu.gateway", connection_id = %connection_id, "Writer did not drain, aborting");
        writer.abort();
    }

    info!(target: "sfu.gateway", connection_id = %connection_id, "Client disconnected");
}

/// Forward socket frames until the client goes away or the writer stops.
/// Returns whether the writer already finished.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    actor: &ConnectionActorHandle,
    writer: &mut JoinHandle<()>,
) -> bool {
    loop {
        tokio::select! {
            _ = &mut *writer => return true,
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if actor.frame(text).await.is_err() {
                            return false;
                        }
                    }
                    Some(Ok(Message::Pong(_) | Message::Ping(_))) => actor.activity(),
                    Some(Ok(Message::Binary(_))) => {
                        // Binary frames are not part of the protocol; answer like a malformed frame.
                        if actor.frame(String::new()).await.is_err() {
                            return false;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return false,
                    Some(Err(e)) => {
                        debug!(
                            target: "sfu.gateway",
                            connection_id = %actor.connection_id(),
                            error = %e,
                            "Socket read failed"
                        );
                        return false;
                    }
                }
            }
        }
    }
}

/// Drain the actor's outbound queue onto the socket.
async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut outbound: mpsc::Receiver<Outbound>) {
    while let Some(frame) = outbound.recv().await {
        let message = match frame {
            Outbound::Event { id, event } => match encode_event(id, &event) {
                Ok(text) => Message::Text(text),
                Err(e) => {
                    warn!(target: "sfu.gateway", error = %e, "Failed to encode event");
                    continue;
                }
            },
            Outbound::Probe => Message::Ping(Vec::new()),
            Outbound::Close { reason } => {
                let frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        };

        if sink.send(message).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}
