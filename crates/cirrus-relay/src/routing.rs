//! Routing engine: decides where an inbound envelope goes.
//!
//! [`route`] is a pure function of the origin, the envelope and the current
//! registry. It does not send anything; the hub executes the returned actions.

use std::fmt;

use cirrus_common::{Envelope, PlayerId};

use crate::registry::{Origin, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Streamer,
    Player(PlayerId),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Streamer => f.write_str("streamer"),
            Destination::Player(id) => write!(f, "player {}", id),
        }
    }
}

impl From<Origin> for Destination {
    fn from(origin: Origin) -> Self {
        match origin {
            Origin::Streamer => Destination::Streamer,
            Origin::Player(id) => Destination::Player(id),
        }
    }
}

/// Best-effort delivery failed. Reported, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteUnavailable {
    #[error("no streamer connected")]
    NoStreamer,
    #[error("player {0} is not connected")]
    PlayerNotFound(PlayerId),
    #[error("{0} outbox is full or closed")]
    Undeliverable(Destination),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Deliver { to: Destination, envelope: Envelope },
    DisconnectPlayer { id: PlayerId, reason: String },
    Drop(RouteUnavailable),
}

impl Action {
    fn deliver(to: impl Into<Destination>, envelope: Envelope) -> Self {
        Action::Deliver {
            to: to.into(),
            envelope,
        }
    }
}

pub fn route(origin: Origin, envelope: Envelope, registry: &Registry) -> Vec<Action> {
    match origin {
        Origin::Player(id) => route_from_player(id, envelope, registry),
        Origin::Streamer => route_from_streamer(envelope, registry),
    }
}

fn route_from_player(id: PlayerId, envelope: Envelope, registry: &Registry) -> Vec<Action> {
    let origin = Origin::Player(id);

    if envelope.is_signal() {
        if registry.streamer().is_none() {
            return vec![
                Action::Drop(RouteUnavailable::NoStreamer),
                Action::deliver(origin, Envelope::error("no streamer connected")),
            ];
        }
        return vec![Action::deliver(Destination::Streamer, envelope.stamped_with(id))];
    }

    match envelope {
        Envelope::Ping { time } => vec![Action::deliver(origin, Envelope::Pong { time })],
        other => vec![unsupported(origin, &other)],
    }
}

fn route_from_streamer(envelope: Envelope, registry: &Registry) -> Vec<Action> {
    if envelope.is_signal() {
        if envelope.is_broadcast() {
            return registry
                .players()
                .map(|(id, _)| Action::deliver(Destination::Player(id), envelope.clone()))
                .collect();
        }

        // The codec rejects streamer signals that name nobody.
        let Some(target) = envelope.player_id() else {
            return vec![unsupported(Origin::Streamer, &envelope)];
        };
        if registry.get_player(target).is_none() {
            return vec![Action::Drop(RouteUnavailable::PlayerNotFound(target))];
        }
        return vec![Action::deliver(Destination::Player(target), envelope)];
    }

    match envelope {
        Envelope::DisconnectPlayer { player_id, reason } => {
            if registry.get_player(player_id).is_none() {
                return vec![Action::Drop(RouteUnavailable::PlayerNotFound(player_id))];
            }
            vec![Action::DisconnectPlayer {
                id: player_id,
                reason: reason.unwrap_or_else(|| "disconnected by streamer".to_string()),
            }]
        }
        Envelope::Ping { time } => vec![Action::deliver(Origin::Streamer, Envelope::Pong { time })],
        other => vec![unsupported(Origin::Streamer, &other)],
    }
}

fn unsupported(origin: Origin, envelope: &Envelope) -> Action {
    Action::deliver(
        origin,
        Envelope::error(format!(
            "unsupported message type `{}` from {}",
            envelope.type_name(),
            match origin {
                Origin::Streamer => "streamer",
                Origin::Player(_) => "player",
            }
        )),
    )
}
