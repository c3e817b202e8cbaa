use std::sync::Arc;
use std::time::Duration;

use studio_relay::modules;
use studio_relay::modules::account::{CredentialPool, CredentialSource};
use studio_relay::proxy;

#[tokio::main]
async fn main() -> Result<(), String> {
    let _log_guard = modules::logger::init_logger();

    let config_path = modules::config::config_path()?;
    let mut relay_config = match modules::config::load_relay_config_from(&config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::warn!("failed to load relay config: {}. using defaults", err);
            proxy::RelayConfig::default()
        }
    };
    modules::config::apply_env_overrides(&mut relay_config, |name| std::env::var(name).ok());

    let auth_dir = match &relay_config.auth_dir {
        Some(dir) => dir.clone(),
        None => modules::account::get_auth_dir()?,
    };
    let pool = tokio::task::spawn_blocking(move || {
        CredentialPool::new(CredentialSource::detect(auth_dir))
    })
    .await
    .map_err(|e| format!("credential scan failed: {}", e))?
    .map_err(|e| format!("failed to load credentials: {}", e))?;
    let pool = Arc::new(pool);

    let activator = Arc::new(proxy::upstream::AutomationClient::new(
        &relay_config.automation.url,
        Duration::from_secs(relay_config.timeouts.activation_secs),
    )?);
    let rotation = Arc::new(proxy::RotationController::new(
        pool,
        activator,
        proxy::RotationPolicy::from_config(&relay_config),
    ));
    let registry = Arc::new(proxy::ChannelRegistry::new(Duration::from_millis(
        relay_config.timeouts.reconnect_grace_ms,
    )));
    let orchestrator = Arc::new(proxy::RequestOrchestrator::new(
        registry.clone(),
        rotation.clone(),
        relay_config.streaming_mode,
        proxy::OrchestratorSettings::from_config(&relay_config),
    ));

    let state = proxy::AppState {
        orchestrator,
        rotation: rotation.clone(),
        registry,
        config_path: Some(config_path),
    };

    let (server, handle) = proxy::AxumServer::start(
        &relay_config,
        state,
        proxy::ProxySecurityConfig::from_relay_config(&relay_config),
    )
    .await
    .map_err(|e| format!("failed to start relay server: {}", e))?;

    if relay_config.api_keys.is_empty() {
        tracing::warn!("no API keys configured; the relay accepts unauthenticated requests");
    }
    tracing::info!(
        "studio-relay ready (mode: {}, api: {}, bridge: {})",
        relay_config.streaming_mode.as_str(),
        server.relay_addr,
        server.bridge_addr
    );

    // Activation opens the browser session, which then dials the bridge.
    if let Err(e) = rotation.initialize(relay_config.initial_auth_index).await {
        tracing::error!("initial account activation failed: {}", e);
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to listen for shutdown signal: {}", e))?;

    tracing::info!("shutdown requested, stopping server...");
    server.stop();
    let _ = handle.await;

    Ok(())
}
