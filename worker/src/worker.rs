use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use sumflow::config::{env_or, env_string};
use sumflow::retry::Backoff;
use sumflow::{Consumer, ConsumerConfig, RemoteBlobStore, RemoteQueue, RemoteRegistry};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::analyzer::CommandAnalyzer;

/// Loop principal del worker.
/// - Espera a que el master responda.
/// - Saca segmentos de la cola mientras tenga "slots" libres.
/// - Con Ctrl-C deja de sacar y espera a que terminen los segmentos en vuelo.
pub async fn run() -> Result<()> {
    let base_url = env_string("MASTER_URL", "http://localhost:8080");
    let client = Client::new();

    let worker_id = worker_identity();
    let config = ConsumerConfig::from_env();
    let analyzer = CommandAnalyzer::new(
        env_string("ANALYZE_CMD", "cat"),
        Duration::from_secs(env_or("ANALYZE_TIMEOUT_SECS", 900)),
    );

    wait_for_master(&client, &base_url).await;

    info!(
        "worker {} contra {} (topic={}, concurrency={})",
        worker_id, base_url, config.topic, config.concurrency
    );

    let consumer = Arc::new(
        Consumer::new(
            Arc::new(RemoteRegistry::new(client.clone(), &base_url)),
            Arc::new(RemoteBlobStore::new(client.clone(), &base_url)),
            Arc::new(RemoteQueue::new(client, &base_url)),
            Arc::new(analyzer),
            config,
        )
        .with_name(worker_id),
    );

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C recibido, terminando segmentos en vuelo"),
            Err(e) => warn!("no se pudo escuchar Ctrl-C: {}", e),
        }
        let _ = tx.send(true);
    });

    consumer.consume(rx).await;
    Ok(())
}

/// hostname + sufijo corto, para distinguir varios workers en la misma máquina.
fn worker_identity() -> String {
    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", hostname, &suffix[..8])
}

async fn wait_for_master(client: &Client, base_url: &str) {
    let health_url = format!("{}/health", base_url);
    let mut delays = Backoff::new(Duration::from_millis(500), Duration::from_secs(10));

    loop {
        match client.get(&health_url).send().await {
            Ok(resp) if resp.status().is_success() => return,
            Ok(resp) => warn!("master respondió {} en /health", resp.status()),
            Err(e) => warn!("master no disponible en {}: {}", base_url, e),
        }
        sleep(delays.next().unwrap_or(Duration::from_secs(10))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_has_hostname_and_short_suffix() {
        let id = worker_identity();
        let (_, suffix) = id.rsplit_once('-').unwrap();
        assert_eq!(suffix.len(), 8);
        assert_ne!(worker_identity(), id);
    }
}
