//! Signaling envelopes exchanged with streamer and player peers.
//!
//! Wire format is a JSON object tagged by `type`. Key names (`type`,
//! `playerId`, `sdp`, `candidate`) match what browser players and the
//! streaming engine already speak. SDP and ICE payloads are carried opaquely.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Relay-assigned identity of a player connection.
///
/// Serialized as a decimal string; both `"3"` and `3` are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerId(u64);

impl PlayerId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PlayerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl Serialize for PlayerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PlayerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(raw) => Ok(Self(raw)),
            Repr::Text(text) => text
                .parse()
                .map_err(|_| D::Error::custom(format!("invalid player id `{}`", text))),
        }
    }
}

/// Which endpoint a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerKind {
    Streamer,
    Player,
}

impl fmt::Display for PeerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerKind::Streamer => f.write_str("streamer"),
            PeerKind::Player => f.write_str("player"),
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// One signaling message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    /// SDP offer. `playerId` names the player on the streamer side of the relay.
    Offer {
        #[serde(rename = "playerId", default, skip_serializing_if = "Option::is_none")]
        player_id: Option<PlayerId>,
        sdp: String,
        #[serde(default, skip_serializing_if = "is_false")]
        broadcast: bool,
    },

    /// SDP answer.
    Answer {
        #[serde(rename = "playerId", default, skip_serializing_if = "Option::is_none")]
        player_id: Option<PlayerId>,
        sdp: String,
        #[serde(default, skip_serializing_if = "is_false")]
        broadcast: bool,
    },

    /// Trickled ICE candidate, kept as the JSON the browser produced.
    IceCandidate {
        #[serde(rename = "playerId", default, skip_serializing_if = "Option::is_none")]
        player_id: Option<PlayerId>,
        candidate: Value,
        #[serde(default, skip_serializing_if = "is_false")]
        broadcast: bool,
    },

    /// Relay -> streamer: a player joined.
    PlayerConnected {
        #[serde(rename = "playerId")]
        player_id: PlayerId,
    },

    /// Relay -> streamer: a player left.
    PlayerDisconnected {
        #[serde(rename = "playerId")]
        player_id: PlayerId,
    },

    /// Relay -> player: first message on every player connection.
    Config {
        #[serde(rename = "playerId")]
        player_id: PlayerId,
        #[serde(
            rename = "peerConnectionOptions",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        peer_connection_options: Option<Value>,
    },

    /// Relay -> players: number of connected players.
    PlayerCount { count: usize },

    /// Relay -> players: a streamer took the slot (fresh or replacing another).
    StreamerConnected,

    /// Relay -> players: the streamer slot is empty.
    StreamerDisconnected,

    /// Streamer -> relay: drop a player connection.
    DisconnectPlayer {
        #[serde(rename = "playerId")]
        player_id: PlayerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<u64>,
    },

    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<u64>,
    },

    Error { message: String },
}

/// Wire `type` tags and the fields each one cannot do without.
const ENVELOPE_TYPES: &[(&str, &[&str])] = &[
    ("offer", &["sdp"]),
    ("answer", &["sdp"]),
    ("iceCandidate", &["candidate"]),
    ("playerConnected", &["playerId"]),
    ("playerDisconnected", &["playerId"]),
    ("config", &["playerId"]),
    ("playerCount", &["count"]),
    ("streamerConnected", &[]),
    ("streamerDisconnected", &[]),
    ("disconnectPlayer", &["playerId"]),
    ("ping", &[]),
    ("pong", &[]),
    ("error", &["message"]),
];

impl Envelope {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// The wire `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "iceCandidate",
            Self::PlayerConnected { .. } => "playerConnected",
            Self::PlayerDisconnected { .. } => "playerDisconnected",
            Self::Config { .. } => "config",
            Self::PlayerCount { .. } => "playerCount",
            Self::StreamerConnected => "streamerConnected",
            Self::StreamerDisconnected => "streamerDisconnected",
            Self::DisconnectPlayer { .. } => "disconnectPlayer",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
        }
    }

    /// Offer, answer and ICE candidates: the messages peers exchange through the relay.
    pub fn is_signal(&self) -> bool {
        matches!(
            self,
            Self::Offer { .. } | Self::Answer { .. } | Self::IceCandidate { .. }
        )
    }

    pub fn is_broadcast(&self) -> bool {
        match self {
            Self::Offer { broadcast, .. }
            | Self::Answer { broadcast, .. }
            | Self::IceCandidate { broadcast, .. } => *broadcast,
            _ => false,
        }
    }

    /// Player a signal envelope is addressed to or came from.
    pub fn player_id(&self) -> Option<PlayerId> {
        match self {
            Self::Offer { player_id, .. }
            | Self::Answer { player_id, .. }
            | Self::IceCandidate { player_id, .. } => *player_id,
            Self::PlayerConnected { player_id }
            | Self::PlayerDisconnected { player_id }
            | Self::Config { player_id, .. }
            | Self::DisconnectPlayer { player_id, .. } => Some(*player_id),
            _ => None,
        }
    }

    /// Stamp a signal envelope with its sender, replacing whatever the client claimed.
    ///
    /// Non-signal envelopes are returned untouched.
    pub fn stamped_with(mut self, id: PlayerId) -> Self {
        match &mut self {
            Self::Offer {
                player_id,
                broadcast,
                ..
            }
            | Self::Answer {
                player_id,
                broadcast,
                ..
            }
            | Self::IceCandidate {
                player_id,
                broadcast,
                ..
            } => {
                *player_id = Some(id);
                *broadcast = false;
            }
            _ => {}
        }
        self
    }
}

/// Why an inbound message could not be turned into an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("message is not valid UTF-8")]
    NotUtf8,
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no string `type` field")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("`{kind}` message is missing `{field}`")]
    MissingField { kind: String, field: &'static str },
    #[error("invalid field: {0}")]
    InvalidField(String),
}

/// Decode one raw message received from a peer of the given kind.
///
/// Streamer signals must name their target player unless they are broadcast.
pub fn decode(raw: &[u8], origin: PeerKind) -> Result<Envelope, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::NotUtf8)?;
    let value: Value =
        serde_json::from_str(text).map_err(|err| DecodeError::Malformed(err.to_string()))?;

    let object = value.as_object().ok_or(DecodeError::NotAnObject)?;
    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?;

    let required = ENVELOPE_TYPES
        .iter()
        .find(|(name, _)| *name == kind)
        .map(|(_, fields)| *fields)
        .ok_or_else(|| DecodeError::UnknownType(kind.to_string()))?;

    for &field in required {
        if object.get(field).map_or(true, Value::is_null) {
            return Err(DecodeError::MissingField {
                kind: kind.to_string(),
                field,
            });
        }
    }

    let kind = kind.to_string();
    let envelope: Envelope =
        serde_json::from_value(value).map_err(|err| DecodeError::InvalidField(err.to_string()))?;

    if origin == PeerKind::Streamer
        && envelope.is_signal()
        && !envelope.is_broadcast()
        && envelope.player_id().is_none()
    {
        return Err(DecodeError::MissingField {
            kind,
            field: "playerId",
        });
    }

    Ok(envelope)
}

/// Serialize an envelope to its wire text.
pub fn encode(envelope: &Envelope) -> serde_json::Result<String> {
    serde_json::to_string(envelope)
}
