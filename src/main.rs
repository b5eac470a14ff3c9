use std::sync::Arc;

use mcp_transport_server::{
    auth::StaticTokenResolver, build_app, config::Config, logging, mcp::handler::McpHandler,
    session::SessionRegistry, AppState,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let bind_socket = config.bind_socket()?;

    let registry = Arc::new(SessionRegistry::new(config.registry_config()));
    registry.start_sweeper(config.sweep_interval);

    let resolver = Arc::new(StaticTokenResolver::new(
        config.api_token.clone(),
        config.user_id.clone(),
        config.username.clone(),
        config.user_email.clone(),
    ));
    let state = AppState::new(
        Arc::clone(&registry),
        resolver,
        Arc::new(McpHandler),
        config.heartbeat_interval,
    );
    let health = state.health.clone();
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(bind_socket).await?;

    info!(
        bind_addr = %config.bind_addr,
        bind_port = config.bind_port,
        max_sessions = config.max_sessions,
        retention_window = config.retention_window,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "server starting"
    );
    health.mark_started();

    let shutdown_registry = Arc::clone(&registry);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
            // Closing every session ends the open streams, so the server can finish.
            shutdown_registry.shutdown();
        })
        .await?;

    Ok(())
}
