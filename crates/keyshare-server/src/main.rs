use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keyshare_server::config::Config;
use keyshare_server::db::MemoryDb;
use keyshare_server::email::TracingMailer;
use keyshare_server::state::AppState;
use keyshare_server::create_router;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keyshare_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let bind_address = config.bind_address;

    let db = Arc::new(MemoryDb::new());
    tracing::warn!("using the in-memory user store; all users are lost on restart");

    let state = AppState::new(config, db, Arc::new(TracingMailer))?;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    tracing::info!("keyshare server listening on {bind_address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("graceful shutdown initiated");
}
