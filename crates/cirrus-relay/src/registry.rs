//! Peer registry: the streamer slot plus every connected player.
//!
//! The registry is plain data. It is owned by the hub actor (see
//! [`crate::lifecycle`]) and never shared across tasks, so each method is
//! atomic with respect to connection churn.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use cirrus_common::{Envelope, PlayerId};
use tokio::sync::{mpsc, watch};

/// Relay-internal identifier of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Something the writer half of a connection should do, in queue order.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Envelope(Envelope),
    Close { code: u16, reason: String },
}

/// A close the relay imposes on a connection, delivered out of band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    pub code: u16,
    pub reason: String,
}

/// Connection-side ends of a [`PeerHandle`].
#[derive(Debug)]
pub struct PeerChannels {
    pub outbox: mpsc::Receiver<Outbound>,
    pub close: watch::Receiver<Option<CloseRequest>>,
}

/// The relay's handle on one live connection.
///
/// Sends never wait: a full or closed outbox means the peer is treated as absent.
/// Forced closes bypass the outbox and cannot be lost to a full queue.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    conn_id: ConnectionId,
    outbox: mpsc::Sender<Outbound>,
    close_tx: Arc<watch::Sender<Option<CloseRequest>>>,
}

impl PeerHandle {
    pub fn channel(conn_id: ConnectionId, outbox_capacity: usize) -> (Self, PeerChannels) {
        let (outbox, outbox_rx) = mpsc::channel(outbox_capacity);
        let (close_tx, close_rx) = watch::channel(None);
        let handle = Self {
            conn_id,
            outbox,
            close_tx: Arc::new(close_tx),
        };
        let channels = PeerChannels {
            outbox: outbox_rx,
            close: close_rx,
        };
        (handle, channels)
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn try_send(&self, envelope: Envelope) -> bool {
        self.outbox.try_send(Outbound::Envelope(envelope)).is_ok()
    }

    /// Queue a close behind whatever is already in the outbox.
    pub fn close_after_pending(&self, code: u16, reason: impl Into<String>) -> bool {
        self.outbox
            .try_send(Outbound::Close {
                code,
                reason: reason.into(),
            })
            .is_ok()
    }

    /// Force the connection closed. The first request wins.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let request = CloseRequest {
            code,
            reason: reason.into(),
        };
        self.close_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(request);
            true
        });
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }
}

/// Where an inbound envelope came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Streamer,
    Player(PlayerId),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Streamer => f.write_str("streamer"),
            Origin::Player(id) => write!(f, "player {}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("player id {0} is already assigned")]
    DuplicatePlayerId(PlayerId),
    #[error("player id space exhausted")]
    IdsExhausted,
}

#[derive(Debug)]
pub struct Registry {
    players: HashMap<PlayerId, PeerHandle>,
    streamer: Option<PeerHandle>,
    next_player_id: u64,
    /// Hands out id 1 every time, to exercise the duplicate-id guard.
    #[cfg(test)]
    reuse_ids: bool,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            players: HashMap::new(),
            streamer: None,
            next_player_id: 1,
            #[cfg(test)]
            reuse_ids: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_id_reuse() -> Self {
        Self {
            reuse_ids: true,
            ..Self::new()
        }
    }

    /// Allocate a fresh id and insert the player under it.
    pub fn register_player(&mut self, peer: PeerHandle) -> Result<PlayerId, RegistryError> {
        let id = self.allocate_player_id()?;
        if self.players.contains_key(&id) {
            return Err(RegistryError::DuplicatePlayerId(id));
        }
        self.players.insert(id, peer);
        Ok(id)
    }

    /// Idempotent: removing an absent id returns `None`.
    pub fn remove_player(&mut self, id: PlayerId) -> Option<PeerHandle> {
        self.players.remove(&id)
    }

    pub fn get_player(&self, id: PlayerId) -> Option<&PeerHandle> {
        self.players.get(&id)
    }

    pub fn list_player_ids(&self) -> Vec<PlayerId> {
        self.players.keys().copied().collect()
    }

    pub fn players(&self) -> impl Iterator<Item = (PlayerId, &PeerHandle)> {
        self.players.iter().map(|(id, peer)| (*id, peer))
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Swap the streamer slot, handing back whoever was displaced.
    pub fn set_streamer(&mut self, peer: PeerHandle) -> Option<PeerHandle> {
        self.streamer.replace(peer)
    }

    pub fn streamer(&self) -> Option<&PeerHandle> {
        self.streamer.as_ref()
    }

    /// Empty the slot only if `conn_id` still occupies it.
    pub fn clear_streamer_if(&mut self, conn_id: ConnectionId) -> Option<PeerHandle> {
        match &self.streamer {
            Some(current) if current.conn_id() == conn_id => self.streamer.take(),
            _ => None,
        }
    }

    /// Whether `conn_id` is still the registered connection for `origin`.
    pub fn is_current(&self, origin: Origin, conn_id: ConnectionId) -> bool {
        let peer = match origin {
            Origin::Streamer => self.streamer.as_ref(),
            Origin::Player(id) => self.players.get(&id),
        };
        peer.is_some_and(|peer| peer.conn_id() == conn_id)
    }

    #[cfg(test)]
    fn reused_id(&self) -> Option<PlayerId> {
        self.reuse_ids.then(|| PlayerId::new(1))
    }

    #[cfg(not(test))]
    fn reused_id(&self) -> Option<PlayerId> {
        None
    }

    fn allocate_player_id(&mut self) -> Result<PlayerId, RegistryError> {
        if let Some(id) = self.reused_id() {
            return Ok(id);
        }
        // At most len() ids are taken, so len() + 1 candidates always include a gap.
        for _ in 0..=self.players.len() {
            let candidate = PlayerId::new(self.next_player_id);
            self.next_player_id = match self.next_player_id.wrapping_add(1) {
                0 => 1,
                next => next,
            };
            if !self.players.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(RegistryError::IdsExhausted)
    }
}
