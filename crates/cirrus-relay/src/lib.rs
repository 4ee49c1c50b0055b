#![forbid(unsafe_code)]

//! Cirrus relay - WebRTC signaling between one streamer and many players.
//!
//! The relay:
//! 1. Accepts a single streamer and any number of players over websockets
//! 2. Forwards offers, answers and ICE candidates between them
//! 3. Never looks inside SDP or candidate payloads

pub mod config;
pub mod lifecycle;
pub mod registry;
pub mod routing;
pub mod server;
pub mod signal;
pub mod stats;

pub use config::{Args, RelayConfig};
pub use lifecycle::{Connection, ConnectionState, HubHandle, HubSettings, RegistrySnapshot};
pub use registry::{ConnectionId, Origin, Outbound, PeerHandle, Registry, RegistryError};
pub use routing::{route, Action, Destination, RouteUnavailable};
pub use server::RelayServer;
pub use stats::{RelayStats, StatsSnapshot};
