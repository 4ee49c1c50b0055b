//! Websocket transport: one reader loop and one writer task per connection.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use cirrus_common::{decode, encode, Envelope, Error, PeerKind, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::lifecycle::{Connection, HubHandle};
use crate::registry::{CloseRequest, Origin, Outbound, PeerChannels, PeerHandle};

const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;
const RATE_WINDOW: Duration = Duration::from_secs(60);
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub outbox_capacity: usize,
    pub max_message_bytes: usize,
    pub max_messages_per_minute: u32,
}

impl ConnectionLimits {
    /// Hard cap handed to the websocket codec. Messages between the
    /// configured limit and this cap get an `error` and a 1009 close from the
    /// relay; anything larger is cut off by the transport itself.
    pub fn transport_cap(&self) -> usize {
        self.max_message_bytes.saturating_mul(2)
    }
}

impl From<&RelayConfig> for ConnectionLimits {
    fn from(config: &RelayConfig) -> Self {
        Self {
            outbox_capacity: config.outbox_capacity,
            max_message_bytes: config.max_message_bytes,
            max_messages_per_minute: config.max_messages_per_minute,
        }
    }
}

/// Shared by both listeners.
#[derive(Clone, Debug)]
pub struct AppState {
    pub hub: HubHandle,
    pub limits: ConnectionLimits,
}

pub async fn streamer_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    upgrade(ws, state, PeerKind::Streamer, addr)
}

pub async fn player_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    upgrade(ws, state, PeerKind::Player, addr)
}

fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    kind: PeerKind,
    addr: SocketAddr,
) -> axum::response::Response {
    let cap = state.limits.transport_cap();
    ws.max_message_size(cap)
        .max_frame_size(cap)
        .on_upgrade(move |socket| handle_socket(socket, state, kind, addr))
}

/// Fixed-window inbound message counter.
#[derive(Debug)]
struct RateLimiter {
    limit: u32,
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            window_start: Instant::now(),
            count: 0,
        }
    }

    fn allow(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= RATE_WINDOW {
            self.window_start = now;
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);
        self.count <= self.limit
    }
}

fn reject(peer: &PeerHandle, code: u16, message: &str) {
    let _ = peer.try_send(Envelope::error(message));
    let _ = peer.close_after_pending(code, message);
}

async fn send_close(
    sender: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: String,
) -> Result<()> {
    sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await
        .map_err(Error::transport)
}

/// Drain the outbox onto the socket. A forced close jumps the queue.
async fn write_outbound(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbox: mpsc::Receiver<Outbound>,
    mut close: watch::Receiver<Option<CloseRequest>>,
) -> Result<()> {
    let mut close_live = true;
    loop {
        let msg = tokio::select! {
            biased;
            changed = close.changed(), if close_live => {
                if changed.is_err() {
                    close_live = false;
                    continue;
                }
                let request = close.borrow_and_update().clone();
                match request {
                    Some(CloseRequest { code, reason }) => {
                        return send_close(&mut sender, code, reason).await;
                    }
                    None => continue,
                }
            }
            outbound = outbox.recv() => match outbound {
                None => return Ok(()),
                Some(Outbound::Close { code, reason }) => {
                    return send_close(&mut sender, code, reason).await;
                }
                Some(Outbound::Envelope(envelope)) => match encode(&envelope) {
                    Ok(text) => Message::Text(text),
                    Err(err) => {
                        warn!("failed to encode {}: {}", envelope.type_name(), err);
                        continue;
                    }
                },
            },
        };
        sender.send(msg).await.map_err(Error::transport)?;
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, kind: PeerKind, addr: SocketAddr) {
    let AppState { hub, limits } = state;
    hub.stats().record_accept();
    let mut conn = Connection::new(hub.next_connection_id(), kind);
    let conn_id = conn.conn_id();
    info!("{} connecting from {} ({})", kind, addr, conn_id);

    let (peer, channels) = PeerHandle::channel(conn_id, limits.outbox_capacity);
    let PeerChannels {
        outbox,
        close: mut close_rx,
    } = channels;
    let (sender, mut receiver) = socket.split();
    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    let writer_close = close_rx.clone();
    let mut writer = tokio::spawn(async move {
        let result = write_outbound(sender, outbox, writer_close).await;
        let _ = disconnect_tx.try_send(());
        result
    });

    let opened = match kind {
        PeerKind::Player => hub.open_player(peer.clone()).await.map(Origin::Player),
        PeerKind::Streamer => hub
            .open_streamer(peer.clone())
            .await
            .map(|()| Origin::Streamer),
    };
    let origin = match opened {
        Ok(origin) => origin,
        Err(err) => {
            error!("failed to register {} from {}: {}", kind, addr, err);
            conn.close();
            writer.abort();
            return;
        }
    };
    if let Err(err) = conn.open(origin) {
        error!("{} ({}): {}", origin, conn_id, err);
        hub.close(origin, conn_id).await;
        writer.abort();
        return;
    }

    let mut limiter = RateLimiter::new(limits.max_messages_per_minute);
    let mut outcome: Result<()> = Ok(());
    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => {
                break;
            }
            _ = close_rx.changed() => {
                if let Some(request) = close_rx.borrow_and_update().as_ref() {
                    info!("closing {} ({}): {}", origin, conn_id, request.reason);
                }
                break;
            }
            msg = receiver.next() => {
                let Some(msg) = msg else { break; };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(err) => {
                        outcome = Err(Error::transport(err));
                        break;
                    }
                };

                if !limiter.allow(Instant::now()) {
                    warn!("{} ({}) exceeded the message rate limit", origin, conn_id);
                    hub.stats().record_rate_limited();
                    reject(&peer, CLOSE_POLICY_VIOLATION, "rate limit exceeded");
                    break;
                }

                let raw = match msg {
                    Message::Text(text) => text.into_bytes(),
                    Message::Binary(bytes) => bytes,
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                if raw.len() > limits.max_message_bytes {
                    warn!("{} ({}) sent {} bytes, over the limit", origin, conn_id, raw.len());
                    reject(&peer, CLOSE_MESSAGE_TOO_BIG, "message too large");
                    break;
                }

                match decode(&raw, kind) {
                    Ok(envelope) => {
                        if let Err(err) = hub.route(origin, conn_id, envelope).await {
                            error!("{} ({}): {}", origin, conn_id, err);
                            break;
                        }
                    }
                    Err(err) => {
                        hub.stats().record_decode_error();
                        warn!("invalid message from {} ({}): {}", origin, conn_id, err);
                        let _ = peer.try_send(Envelope::error(format!("invalid message: {}", err)));
                    }
                }
            }
        }
    }

    conn.close();
    hub.close(origin, conn_id).await;

    // Let queued frames (e.g. a rejection notice) flush before the socket drops.
    drop(peer);
    match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await {
        Ok(Ok(Err(err))) => outcome = outcome.and(Err(err)),
        Ok(_) => {}
        Err(_) => {
            debug!("{} ({}) writer did not drain in time", origin, conn_id);
            writer.abort();
        }
    }
    if let Err(err) = outcome {
        debug!("{} ({}): {}", origin, conn_id, err);
    }
    info!("{} disconnected ({})", origin, conn_id);
}
