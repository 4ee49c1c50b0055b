//! Runtime counters surfaced by `/health` and `/metrics/prometheus`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct RelayStats {
    connections_accepted: AtomicU64,
    envelopes_routed: AtomicU64,
    decode_errors: AtomicU64,
    routes_unavailable: AtomicU64,
    streamer_replacements: AtomicU64,
    rate_limited: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`] plus registry occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub streamer_connected: bool,
    pub players: usize,
    pub connections_accepted: u64,
    pub envelopes_routed: u64,
    pub decode_errors: u64,
    pub routes_unavailable: u64,
    pub streamer_replacements: u64,
    pub rate_limited: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accept(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_routed(&self) {
        self.envelopes_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_route_unavailable(&self) {
        self.routes_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_streamer_replaced(&self) {
        self.streamer_replacements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn routes_unavailable(&self) -> u64 {
        self.routes_unavailable.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, streamer_connected: bool, players: usize) -> StatsSnapshot {
        StatsSnapshot {
            streamer_connected,
            players,
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            envelopes_routed: self.envelopes_routed.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            routes_unavailable: self.routes_unavailable.load(Ordering::Relaxed),
            streamer_replacements: self.streamer_replacements.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    pub fn to_prometheus(&self) -> String {
        format!(
            r#"# HELP cirrus_streamer_connected Whether a streamer occupies the slot
# TYPE cirrus_streamer_connected gauge
cirrus_streamer_connected {streamer}
# HELP cirrus_players Connected players
# TYPE cirrus_players gauge
cirrus_players {players}
# HELP cirrus_connections_accepted_total Accepted websocket connections
# TYPE cirrus_connections_accepted_total counter
cirrus_connections_accepted_total {accepted}
# HELP cirrus_envelopes_routed_total Envelopes delivered to a peer outbox
# TYPE cirrus_envelopes_routed_total counter
cirrus_envelopes_routed_total {routed}
# HELP cirrus_decode_errors_total Inbound messages that failed to decode
# TYPE cirrus_decode_errors_total counter
cirrus_decode_errors_total {decode}
# HELP cirrus_routes_unavailable_total Envelopes dropped because the destination was absent
# TYPE cirrus_routes_unavailable_total counter
cirrus_routes_unavailable_total {unavailable}
# HELP cirrus_streamer_replacements_total Streamers displaced by a newer connection
# TYPE cirrus_streamer_replacements_total counter
cirrus_streamer_replacements_total {replaced}
# HELP cirrus_rate_limited_total Connections closed for exceeding the message rate
# TYPE cirrus_rate_limited_total counter
cirrus_rate_limited_total {limited}
"#,
            streamer = u8::from(self.streamer_connected),
            players = self.players,
            accepted = self.connections_accepted,
            routed = self.envelopes_routed,
            decode = self.decode_errors,
            unavailable = self.routes_unavailable,
            replaced = self.streamer_replacements,
            limited = self.rate_limited,
        )
    }
}
