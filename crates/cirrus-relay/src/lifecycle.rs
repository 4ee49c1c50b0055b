//! Connection lifecycle.
//!
//! Every connection walks `Connecting -> Open -> Closed`. Registry changes
//! and the notifications they trigger happen inside the hub actor, which
//! owns the [`Registry`] and serializes connects, disconnects and routing
//! through one command channel:
//! - player opens: assign id, send `config`, tell the streamer, update counts
//! - streamer opens: take the slot, close the displaced streamer, tell players
//! - player closes: free the id, tell the streamer, update counts
//! - streamer closes: empty the slot (if still ours), tell players

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cirrus_common::{Envelope, Error, PeerKind, PlayerId, Result};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::registry::{ConnectionId, Origin, PeerHandle, Registry, RegistryError};
use crate::routing::{self, Action, Destination, RouteUnavailable};
use crate::stats::RelayStats;

/// Close code sent to a streamer displaced by a newer one.
pub const STREAMER_REPLACED_CLOSE_CODE: u16 = 4000;
/// Close code sent to a player the streamer asked us to drop.
pub const PLAYER_KICKED_CLOSE_CODE: u16 = 4001;

const HUB_COMMAND_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport accepted, not yet in the registry
    Connecting,
    /// Registered, traffic flows
    Open,
    /// Terminal
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal connection transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Per-connection lifecycle tracked by the connection's own task.
#[derive(Debug)]
pub struct Connection {
    conn_id: ConnectionId,
    kind: PeerKind,
    state: ConnectionState,
    origin: Option<Origin>,
}

impl Connection {
    pub fn new(conn_id: ConnectionId, kind: PeerKind) -> Self {
        Self {
            conn_id,
            kind,
            state: ConnectionState::Connecting,
            origin: None,
        }
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn kind(&self) -> PeerKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Registry identity, known once the connection is open.
    pub fn origin(&self) -> Option<Origin> {
        self.origin
    }

    pub fn open(&mut self, origin: Origin) -> std::result::Result<(), IllegalTransition> {
        if self.state != ConnectionState::Connecting {
            return Err(IllegalTransition {
                from: self.state,
                to: ConnectionState::Open,
            });
        }
        self.state = ConnectionState::Open;
        self.origin = Some(origin);
        Ok(())
    }

    /// Returns false if the connection was already closed.
    pub fn close(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        self.state = ConnectionState::Closed;
        true
    }
}

/// Registry occupancy at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub streamer: Option<ConnectionId>,
    pub players: Vec<PlayerId>,
}

#[derive(Debug, Clone, Default)]
pub struct HubSettings {
    /// Handed to every player in its `config` message.
    pub peer_connection_options: Option<Value>,
}

enum Command {
    OpenPlayer {
        peer: PeerHandle,
        reply: oneshot::Sender<Result<PlayerId>>,
    },
    OpenStreamer {
        peer: PeerHandle,
        reply: oneshot::Sender<()>,
    },
    Route {
        origin: Origin,
        conn_id: ConnectionId,
        envelope: Envelope,
    },
    Close {
        origin: Origin,
        conn_id: ConnectionId,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<RegistrySnapshot>,
    },
}

/// Handle to the hub actor. Cheap to clone.
#[derive(Clone)]
pub struct HubHandle {
    cmd_tx: mpsc::Sender<Command>,
    next_conn: Arc<AtomicU64>,
    stats: Arc<RelayStats>,
}

impl std::fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubHandle")
            .field("closed", &self.cmd_tx.is_closed())
            .finish()
    }
}

fn hub_stopped() -> Error {
    Error::internal("relay hub stopped")
}

impl HubHandle {
    /// Spawn the hub actor. The join handle resolves when every handle is
    /// dropped, or early with an error if a registry invariant breaks.
    pub fn spawn(settings: HubSettings, stats: Arc<RelayStats>) -> (Self, JoinHandle<Result<()>>) {
        Self::spawn_with_registry(Registry::new(), settings, stats)
    }

    pub(crate) fn spawn_with_registry(
        registry: Registry,
        settings: HubSettings,
        stats: Arc<RelayStats>,
    ) -> (Self, JoinHandle<Result<()>>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(HUB_COMMAND_CAPACITY);
        let hub = Hub {
            registry,
            settings,
            stats: stats.clone(),
        };
        let task = tokio::spawn(hub.run(cmd_rx));
        let handle = Self {
            cmd_tx,
            next_conn: Arc::new(AtomicU64::new(1)),
            stats,
        };
        (handle, task)
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a player. Its `config` message is queued before this returns.
    pub async fn open_player(&self, peer: PeerHandle) -> Result<PlayerId> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::OpenPlayer { peer, reply })
            .await
            .map_err(|_| hub_stopped())?;
        reply_rx.await.map_err(|_| hub_stopped())?
    }

    /// Put a streamer in the slot, displacing any previous one.
    pub async fn open_streamer(&self, peer: PeerHandle) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::OpenStreamer { peer, reply })
            .await
            .map_err(|_| hub_stopped())?;
        reply_rx.await.map_err(|_| hub_stopped())
    }

    /// Queue an inbound envelope for routing. Order per caller is preserved.
    pub async fn route(
        &self,
        origin: Origin,
        conn_id: ConnectionId,
        envelope: Envelope,
    ) -> Result<()> {
        self.cmd_tx
            .send(Command::Route {
                origin,
                conn_id,
                envelope,
            })
            .await
            .map_err(|_| hub_stopped())
    }

    /// Release a connection's registry entry. Safe to call more than once.
    pub async fn close(&self, origin: Origin, conn_id: ConnectionId) {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Close {
                origin,
                conn_id,
                reply,
            })
            .await
            .is_err()
        {
            return;
        }
        let _ = reply_rx.await;
    }

    pub async fn snapshot(&self) -> Result<RegistrySnapshot> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| hub_stopped())?;
        reply_rx.await.map_err(|_| hub_stopped())
    }
}

struct Hub {
    registry: Registry,
    settings: HubSettings,
    stats: Arc<RelayStats>,
}

impl Hub {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) -> Result<()> {
        while let Some(cmd) = cmd_rx.recv().await {
            if let Err(err) = self.handle(cmd) {
                error!("relay hub stopping: {}", err);
                return Err(err);
            }
        }
        debug!("relay hub exiting, all handles dropped");
        Ok(())
    }

    fn handle(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::OpenPlayer { peer, reply } => match self.open_player(peer) {
                Ok(id) => {
                    let _ = reply.send(Ok(id));
                }
                Err(err) => {
                    let _ = reply.send(Err(Error::invariant(&err)));
                    return Err(Error::invariant(err));
                }
            },
            Command::OpenStreamer { peer, reply } => {
                self.open_streamer(peer);
                let _ = reply.send(());
            }
            Command::Route {
                origin,
                conn_id,
                envelope,
            } => self.route(origin, conn_id, envelope),
            Command::Close {
                origin,
                conn_id,
                reply,
            } => {
                self.close(origin, conn_id);
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let mut players = self.registry.list_player_ids();
                players.sort();
                let _ = reply.send(RegistrySnapshot {
                    streamer: self.registry.streamer().map(PeerHandle::conn_id),
                    players,
                });
            }
        }
        Ok(())
    }

    fn open_player(&mut self, peer: PeerHandle) -> std::result::Result<PlayerId, RegistryError> {
        let conn_id = peer.conn_id();
        let id = self.registry.register_player(peer)?;
        info!("player {} connected ({})", id, conn_id);

        // Nothing else can reach the player before this: routing goes through us.
        self.deliver(
            Destination::Player(id),
            Envelope::Config {
                player_id: id,
                peer_connection_options: self.settings.peer_connection_options.clone(),
            },
        );
        if self.registry.streamer().is_some() {
            self.deliver(
                Destination::Streamer,
                Envelope::PlayerConnected { player_id: id },
            );
        }
        self.broadcast_player_count();
        Ok(id)
    }

    fn open_streamer(&mut self, peer: PeerHandle) {
        let conn_id = peer.conn_id();
        if let Some(previous) = self.registry.set_streamer(peer) {
            info!(
                "streamer {} replaced by {}, closing the old connection",
                previous.conn_id(),
                conn_id
            );
            previous.close(STREAMER_REPLACED_CLOSE_CODE, "replaced by a new streamer");
            self.stats.record_streamer_replaced();
        } else {
            info!("streamer connected ({})", conn_id);
        }

        // Let the new streamer set up state for everyone already waiting.
        let mut waiting = self.registry.list_player_ids();
        waiting.sort();
        for player_id in waiting {
            self.deliver(Destination::Streamer, Envelope::PlayerConnected { player_id });
        }
        self.broadcast(Envelope::StreamerConnected);
    }

    fn route(&mut self, origin: Origin, conn_id: ConnectionId, envelope: Envelope) {
        if !self.registry.is_current(origin, conn_id) {
            debug!(
                "ignoring {} from {} ({}): no longer registered",
                envelope.type_name(),
                origin,
                conn_id
            );
            return;
        }

        debug!("routing {} from {}", envelope.type_name(), origin);
        for action in routing::route(origin, envelope, &self.registry) {
            match action {
                Action::Deliver { to, envelope } => self.deliver(to, envelope),
                Action::DisconnectPlayer { id, reason } => {
                    if let Some(player) = self.registry.get_player(id) {
                        info!("streamer asked to disconnect player {}: {}", id, reason);
                        player.close(PLAYER_KICKED_CLOSE_CODE, reason);
                    }
                }
                Action::Drop(reason) => self.report(reason),
            }
        }
    }

    fn close(&mut self, origin: Origin, conn_id: ConnectionId) {
        match origin {
            Origin::Player(id) => {
                if !self.registry.is_current(origin, conn_id) {
                    debug!("player {} ({}) already released", id, conn_id);
                    return;
                }
                self.registry.remove_player(id);
                info!("player {} disconnected ({})", id, conn_id);
                if self.registry.streamer().is_some() {
                    self.deliver(
                        Destination::Streamer,
                        Envelope::PlayerDisconnected { player_id: id },
                    );
                }
                self.broadcast_player_count();
            }
            Origin::Streamer => {
                if self.registry.clear_streamer_if(conn_id).is_none() {
                    debug!("streamer {} was not the slot occupant", conn_id);
                    return;
                }
                info!("streamer disconnected ({})", conn_id);
                self.broadcast(Envelope::StreamerDisconnected);
            }
        }
    }

    fn deliver(&self, to: Destination, envelope: Envelope) {
        let peer = match to {
            Destination::Streamer => self.registry.streamer(),
            Destination::Player(id) => self.registry.get_player(id),
        };
        let Some(peer) = peer else {
            self.report(match to {
                Destination::Streamer => RouteUnavailable::NoStreamer,
                Destination::Player(id) => RouteUnavailable::PlayerNotFound(id),
            });
            return;
        };
        if peer.try_send(envelope) {
            self.stats.record_routed();
        } else {
            self.report(RouteUnavailable::Undeliverable(to));
        }
    }

    fn broadcast(&self, envelope: Envelope) {
        for (id, _) in self.registry.players() {
            self.deliver(Destination::Player(id), envelope.clone());
        }
    }

    fn broadcast_player_count(&self) {
        self.broadcast(Envelope::PlayerCount {
            count: self.registry.player_count(),
        });
    }

    fn report(&self, reason: RouteUnavailable) {
        self.stats.record_route_unavailable();
        warn!("dropping envelope: {}", reason);
    }
}
