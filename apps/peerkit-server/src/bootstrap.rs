use std::net::SocketAddr;
use std::sync::Arc;

use peerkit_core::{Config, ServerConfig};
use tracing::info;

use crate::diagnostics;
use crate::fetcher::ChunkFetcher;
use crate::hub::{self, Hub, HubSettings};
use crate::router;
use crate::tasks::{TaskHandle, TaskManager};
use crate::AppState;

pub(crate) struct BootstrapOutput {
    pub router: axum::Router<()>,
    pub background_tasks: TaskManager,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum HttpConfigError {
    #[error("invalid bind address {bind}:{port}")]
    InvalidBind { bind: String, port: u16 },
    #[error("failed to build origin http client: {0}")]
    Client(#[from] reqwest::Error),
}

pub(crate) struct HttpConfig {
    pub addr: SocketAddr,
}

pub(crate) fn http_config(server: &ServerConfig) -> Result<HttpConfig, HttpConfigError> {
    let invalid = || HttpConfigError::InvalidBind {
        bind: server.bind.clone(),
        port: server.port,
    };
    let ip: std::net::IpAddr = server.bind.parse().map_err(|_| invalid())?;
    Ok(HttpConfig {
        addr: SocketAddr::new(ip, server.port),
    })
}

/// Start the hub (and diagnostics when enabled) and assemble the router.
/// Must run inside a tokio runtime.
pub(crate) fn build(config: &Config) -> Result<BootstrapOutput, HttpConfigError> {
    let fetcher = Arc::new(ChunkFetcher::new(&config.fetcher)?);
    let (handle, events) = hub::channel(config.signaling.hub_queue);
    let core = Hub::new(HubSettings::from(&config.signaling), fetcher, &handle);

    let mut background_tasks = TaskManager::new();
    background_tasks.push(TaskHandle::new("hub", tokio::spawn(core.run(events))));
    if config.server.debug {
        background_tasks.push(diagnostics::spawn(
            handle.downgrade(),
            config.signaling.diagnostics_interval(),
        ));
    }

    let (routes, endpoints) = router::build_router();
    info!(endpoints = ?endpoints, "routes registered");
    let state = AppState::new(handle, config.signaling.outbound_queue);
    let router = attach_http_layers(routes.with_state::<()>(state));
    Ok(BootstrapOutput {
        router,
        background_tasks,
    })
}

pub(crate) fn attach_http_layers(router: axum::Router<()>) -> axum::Router<()> {
    use tower_http::{cors::CorsLayer, trace::TraceLayer};

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
