use std::future::{Future, IntoFuture};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use cirrus_common::{Error, Result};
use tokio::net::{TcpListener, TcpSocket};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::RelayConfig;
use crate::lifecycle::{HubHandle, HubSettings};
use crate::registry::Registry;
use crate::signal::{player_ws_handler, streamer_ws_handler, AppState, ConnectionLimits};
use crate::stats::{RelayStats, StatsSnapshot};

/// Both listeners, bound and ready to serve.
pub struct RelayServer {
    config: RelayConfig,
    streamer_listener: TcpListener,
    player_listener: TcpListener,
    #[cfg(test)]
    reuse_player_ids: bool,
}

fn bind_with_backlog(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

async fn current_stats(state: &AppState) -> Result<StatsSnapshot> {
    let registry = state.hub.snapshot().await?;
    Ok(state
        .hub
        .stats()
        .snapshot(registry.streamer.is_some(), registry.players.len()))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match current_stats(&state).await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response(),
    }
}

async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match current_stats(&state).await {
        Ok(snapshot) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            snapshot.to_prometheus(),
        )
            .into_response(),
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response(),
    }
}

impl RelayServer {
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let streamer_listener = bind_with_backlog(config.streamer_listen, config.streamer_backlog)?;
        let player_listener = TcpListener::bind(config.player_listen).await?;
        Ok(Self {
            config,
            streamer_listener,
            player_listener,
            #[cfg(test)]
            reuse_player_ids: false,
        })
    }

    pub fn streamer_addr(&self) -> Result<SocketAddr> {
        Ok(self.streamer_listener.local_addr()?)
    }

    pub fn player_addr(&self) -> Result<SocketAddr> {
        Ok(self.player_listener.local_addr()?)
    }

    /// Serve until a listener fails or the hub stops.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, a listener fails, or the hub stops.
    ///
    /// A hub stopping on a broken registry invariant surfaces here as
    /// [`Error::RegistryInvariantViolation`].
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let registry = Registry::new();
        #[cfg(test)]
        let registry = if self.reuse_player_ids {
            Registry::with_id_reuse()
        } else {
            registry
        };
        let streamer_addr = self.streamer_addr()?;
        let player_addr = self.player_addr()?;

        let (hub, mut hub_task) = HubHandle::spawn_with_registry(
            registry,
            HubSettings {
                peer_connection_options: self.config.peer_connection_options.clone(),
            },
            Arc::new(RelayStats::new()),
        );
        let state = AppState {
            hub,
            limits: ConnectionLimits::from(&self.config),
        };

        let streamer_app = Router::new()
            .route("/", get(streamer_ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state.clone());
        let player_app = Router::new()
            .route("/", get(player_ws_handler))
            .route("/health", get(health))
            .route("/metrics/prometheus", get(prometheus_metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        info!("streamer endpoint listening on ws://{}/", streamer_addr);
        info!("player endpoint listening on ws://{}/", player_addr);

        let streamer_serve = axum::serve(
            self.streamer_listener,
            streamer_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .into_future();
        let player_serve = axum::serve(
            self.player_listener,
            player_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .into_future();

        tokio::select! {
            result = streamer_serve => {
                result?;
                Err(Error::internal("streamer listener stopped"))
            }
            result = player_serve => {
                result?;
                Err(Error::internal("player listener stopped"))
            }
            result = &mut hub_task => match result {
                Ok(Ok(())) => Err(Error::internal("relay hub exited")),
                Ok(Err(err)) => Err(err),
                Err(join_err) => Err(Error::internal(join_err)),
            },
            _ = shutdown => {
                info!("shutting down");
                hub_task.abort();
                Ok(())
            }
        }
    }
}
