use axum::Router;
use orchestrator::Orchestrator;
use qbittorrent::mimic_qbittorrent;
use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tracing::info;

mod cache;
mod config;
mod error;
mod helpers;
mod orchestrator;
mod provider;
mod qbittorrent;
mod scheduler;
mod webdav;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    dotenv::dotenv().ok();

    config::apply_umask();
    let config = config::get_config();

    let orchestrator = Orchestrator::bootstrap(&config).await?;
    orchestrator.start(&config).await?;

    let app = Router::new()
        .merge(mimic_qbittorrent().with_state(orchestrator.clone()))
        .merge(webdav::server::build_router(&orchestrator, &config));

    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received termination signal");
        },
    }
}
