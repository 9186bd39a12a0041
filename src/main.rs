//! Huddle server binary.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use huddle_core::activity::MemoryActivityLog;
use huddle_core::authz::PermissionCache;
use huddle_core::realtime::{self, CollabState, StaticTokenValidator};
use huddle_core::workspace::grants::ResourceGrantStore;
use huddle_core::workspace::membership::MembershipStore;
use huddle_core::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::load()?;
    huddle_core::observability::init(&config.observability)?;

    info!(version = huddle_core::VERSION, "Starting huddle-server");

    let cache = Arc::new(PermissionCache::new());
    let membership = Arc::new(MembershipStore::new(cache.clone()));
    let grants = Arc::new(ResourceGrantStore::new());
    let activity = Arc::new(MemoryActivityLog::default());
    let validator = Arc::new(StaticTokenValidator::new());

    let state = Arc::new(CollabState::new(
        config.realtime.clone(),
        membership,
        grants,
        cache,
        activity,
        validator,
    ));

    spawn_maintenance(state.clone());

    let app = realtime::router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Presence demotion, lease reclamation, and cursor flushing run on their
/// own clocks for the life of the process.
fn spawn_maintenance(state: Arc<CollabState>) {
    let sweep_state = state.clone();
    let sweep_every = sweep_state.config.heartbeat_interval;
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(sweep_every);
        loop {
            tick.tick().await;
            sweep_state.sweep().await;
        }
    });

    let flush_every = state.config.coalesce_window.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(flush_every);
        loop {
            tick.tick().await;
            state.flush_cursors();
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
