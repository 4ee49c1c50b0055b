use std::net::SocketAddr;

use cirrus_common::{Error, Result};
use clap::Parser;
use serde_json::Value;

pub const DEFAULT_STREAMER_LISTEN: &str = "127.0.0.1:8888";
pub const DEFAULT_PLAYER_LISTEN: &str = "127.0.0.1:8080";
pub const DEFAULT_STREAMER_BACKLOG: u32 = 1;
pub const DEFAULT_OUTBOX_CAPACITY: usize = 128;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_MESSAGES_PER_MINUTE: u32 = 600;

const ALLOW_PUBLIC_BIND_ENV: &str = "CIRRUS_ALLOW_PUBLIC_BIND";

#[derive(Parser, Debug, Clone)]
#[command(name = "cirrus-relay")]
#[command(about = "Cirrus relay - WebRTC signaling between one streamer and many players")]
pub struct Args {
    /// Websocket listen address for the streamer
    #[arg(long, env = "CIRRUS_STREAMER_LISTEN", default_value = DEFAULT_STREAMER_LISTEN)]
    pub streamer_listen: SocketAddr,

    /// Websocket listen address for players (also serves /health)
    #[arg(long, env = "CIRRUS_PLAYER_LISTEN", default_value = DEFAULT_PLAYER_LISTEN)]
    pub player_listen: SocketAddr,

    /// Accept backlog of the streamer listener
    #[arg(long, env = "CIRRUS_STREAMER_BACKLOG", default_value_t = DEFAULT_STREAMER_BACKLOG)]
    pub streamer_backlog: u32,

    /// Queued outbound messages per connection before new ones are dropped
    #[arg(long, env = "CIRRUS_OUTBOX_CAPACITY", default_value_t = DEFAULT_OUTBOX_CAPACITY)]
    pub outbox_capacity: usize,

    /// Largest accepted inbound websocket message
    #[arg(long, env = "CIRRUS_MAX_MESSAGE_BYTES", default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    pub max_message_bytes: usize,

    /// Per-connection inbound message budget
    #[arg(
        long,
        env = "CIRRUS_MAX_MESSAGES_PER_MINUTE",
        default_value_t = DEFAULT_MAX_MESSAGES_PER_MINUTE
    )]
    pub max_messages_per_minute: u32,

    /// JSON object passed to players as `peerConnectionOptions`
    #[arg(long, env = "CIRRUS_PEER_CONNECTION_OPTIONS")]
    pub peer_connection_options: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Validated runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub streamer_listen: SocketAddr,
    pub player_listen: SocketAddr,
    pub streamer_backlog: u32,
    pub outbox_capacity: usize,
    pub max_message_bytes: usize,
    pub max_messages_per_minute: u32,
    pub peer_connection_options: Option<Value>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            streamer_listen: SocketAddr::from(([127, 0, 0, 1], 8888)),
            player_listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            streamer_backlog: DEFAULT_STREAMER_BACKLOG,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_messages_per_minute: DEFAULT_MAX_MESSAGES_PER_MINUTE,
            peer_connection_options: None,
        }
    }
}

pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn check_bind_allowed(addr: SocketAddr, allow_public: bool) -> Result<()> {
    if addr.ip().is_loopback() || allow_public {
        return Ok(());
    }
    Err(Error::config(format!(
        "refusing non-loopback bind {} without {}=1",
        addr, ALLOW_PUBLIC_BIND_ENV
    )))
}

impl RelayConfig {
    /// Build from parsed arguments, honouring `CIRRUS_ALLOW_PUBLIC_BIND`.
    pub fn from_args(args: &Args) -> Result<Self> {
        let peer_connection_options = args
            .peer_connection_options
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()
            .map_err(|e| Error::config(format!("invalid --peer-connection-options: {}", e)))?;

        let config = Self {
            streamer_listen: args.streamer_listen,
            player_listen: args.player_listen,
            streamer_backlog: args.streamer_backlog,
            outbox_capacity: args.outbox_capacity,
            max_message_bytes: args.max_message_bytes,
            max_messages_per_minute: args.max_messages_per_minute,
            peer_connection_options,
        };
        config.validate(env_bool(ALLOW_PUBLIC_BIND_ENV, false))?;
        Ok(config)
    }

    pub fn validate(&self, allow_public_bind: bool) -> Result<()> {
        check_bind_allowed(self.streamer_listen, allow_public_bind)?;
        check_bind_allowed(self.player_listen, allow_public_bind)?;

        if self.streamer_backlog == 0 {
            return Err(Error::config("streamer backlog must be at least 1"));
        }
        if self.outbox_capacity == 0 {
            return Err(Error::config("outbox capacity must be at least 1"));
        }
        if self.max_message_bytes == 0 {
            return Err(Error::config("max message size must be non-zero"));
        }
        if self.max_messages_per_minute == 0 {
            return Err(Error::config("message rate limit must be non-zero"));
        }
        if let Some(options) = &self.peer_connection_options {
            if !options.is_object() {
                return Err(Error::config("peer connection options must be a JSON object"));
            }
        }
        Ok(())
    }
}
