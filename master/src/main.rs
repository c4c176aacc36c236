mod aggregator;
mod handlers;
mod monitor;
mod segmenter;
mod state;

use std::sync::Arc;

use sumflow::config::env_string;
use sumflow::{CoordinatorConfig, DispatchConfig, FsBlobStore, MemoryQueue, QueueConfig};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,sumflow=debug,tower_http=info")),
        )
        .init();

    let bind = env_string("MASTER_BIND", "0.0.0.0:8080");
    let data_dir = env_string("DATA_DIR", "/data/blobs");
    let queue_config = QueueConfig::from_env();
    let dispatch_config = DispatchConfig::from_env();

    let client = reqwest::Client::new();
    let blobs = Arc::new(FsBlobStore::new(&data_dir));
    let queue = Arc::new(MemoryQueue::new(queue_config.ack_deadline));

    let state = AppState::new(
        blobs,
        queue.clone(),
        segmenter::from_env(client)?,
        aggregator::from_env(),
        dispatch_config,
        CoordinatorConfig::from_env(),
    );
    info!(
        "blobs en {}, topic '{}', plazo de ack {:?}",
        data_dir, state.topic, queue_config.ack_deadline
    );

    // re-entregas de workers caídos en segundo plano
    tokio::spawn(monitor::monitor_deliveries(
        queue,
        queue_config.sweep_interval,
    ));

    let app = handlers::build_router(state);

    let listener = TcpListener::bind(&bind).await?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("master detenido");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("no se pudo escuchar Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Ctrl-C recibido, cerrando el master");
}
