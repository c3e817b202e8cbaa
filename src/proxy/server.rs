use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, RwLock};
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::proxy::channel_registry::ChannelRegistry;
use crate::proxy::config::RelayConfig;
use crate::proxy::handlers;
use crate::proxy::orchestrator::RequestOrchestrator;
use crate::proxy::rotation::RotationController;
use crate::proxy::ProxySecurityConfig;

const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

/// Axum application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RequestOrchestrator>,
    pub rotation: Arc<RotationController>,
    pub registry: Arc<ChannelRegistry>,
    /// Where runtime changes are persisted; `None` keeps them in memory only
    pub config_path: Option<PathBuf>,
}

/// HTTP API: management routes plus a fallback that relays everything else.
pub fn build_relay_router(state: AppState, security: Arc<RwLock<ProxySecurityConfig>>) -> Router {
    Router::new()
        .route("/healthz", get(handlers::manage::health_check))
        .route("/api/status", get(handlers::manage::get_status))
        .route("/api/accounts/switch", post(handlers::manage::switch_account))
        .route("/api/streaming-mode", put(handlers::manage::set_streaming_mode))
        .fallback(handlers::relay::handle_relay)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(axum::middleware::from_fn_with_state(
            security,
            crate::proxy::middleware::auth_middleware,
        ))
        // preflight requests carry no key
        .layer(crate::proxy::middleware::cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bridging channel: the browser peer's WebSocket endpoint.
pub fn build_bridge_router(registry: Arc<ChannelRegistry>) -> Router {
    Router::new()
        .route("/ws", get(handlers::bridge::handle_bridge))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

fn serve_connection(stream: TcpStream, app: Router) {
    use hyper::server::conn::http1;
    use hyper_util::rt::TokioIo;
    use hyper_util::service::TowerToHyperService;

    let io = TokioIo::new(stream);
    let service = TowerToHyperService::new(app);

    tokio::task::spawn(async move {
        if let Err(err) = http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            debug!("Connection handling ended or error: {:?}", err);
        }
    });
}

/// Axum server instance
pub struct AxumServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    pub relay_addr: SocketAddr,
    pub bridge_addr: SocketAddr,
}

impl AxumServer {
    /// Binds the HTTP API on `port` and the bridging channel on `ws_port`.
    pub async fn start(
        config: &RelayConfig,
        state: AppState,
        security_config: ProxySecurityConfig,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), String> {
        let host = config.get_bind_address();
        let security_state = Arc::new(RwLock::new(security_config));

        let relay_app = build_relay_router(state.clone(), security_state);
        let bridge_app = build_bridge_router(state.registry.clone());

        let relay_listener = bind(host, config.port).await?;
        let bridge_listener = bind(host, config.ws_port).await?;
        let relay_addr = local_addr(&relay_listener)?;
        let bridge_addr = local_addr(&bridge_listener)?;

        tracing::info!("Relay API listening at http://{}", relay_addr);
        tracing::info!("Bridging channel listening at ws://{}/ws", bridge_addr);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = relay_listener.accept() => match res {
                        Ok((stream, _)) => serve_connection(stream, relay_app.clone()),
                        Err(e) => error!("Failed to accept API connection: {:?}", e),
                    },
                    res = bridge_listener.accept() => match res {
                        Ok((stream, peer)) => {
                            debug!("Bridging connection from {}", peer);
                            serve_connection(stream, bridge_app.clone());
                        }
                        Err(e) => error!("Failed to accept bridging connection: {:?}", e),
                    },
                    _ = &mut shutdown_rx => {
                        tracing::info!("Relay server stopped listening");
                        break;
                    }
                }
            }
        });

        Ok((
            Self {
                shutdown_tx: Some(shutdown_tx),
                relay_addr,
                bridge_addr,
            },
            handle,
        ))
    }

    /// Stop the server
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn bind(host: &str, port: u16) -> Result<TcpListener, String> {
    let addr = format!("{}:{}", host, port);
    TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("Failed to bind address {}: {}", addr, e))
}

fn local_addr(listener: &TcpListener) -> Result<SocketAddr, String> {
    listener
        .local_addr()
        .map_err(|e| format!("Failed to read local address: {}", e))
}
