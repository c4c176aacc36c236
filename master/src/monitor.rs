use std::sync::Arc;
use std::time::Duration;

use sumflow::MemoryQueue;
use tracing::{info, warn};

/// Cada `every` devuelve a la cola las entregas cuyo plazo de ack venció
/// (worker caído o colgado a mitad de un segmento).
pub async fn monitor_deliveries(queue: Arc<MemoryQueue>, every: Duration) {
    loop {
        tokio::time::sleep(every).await;

        match queue.requeue_expired() {
            Ok(0) => {}
            Ok(n) => info!("{} entregas vencidas vueltas a la cola", n),
            Err(e) => warn!("no se pudo revisar la cola: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sumflow::MessageQueue;

    #[tokio::test(start_paused = true)]
    async fn expired_deliveries_come_back() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
        queue.publish("segments", b"m".to_vec()).await.unwrap();
        let first = queue.pull("segments").await.unwrap().unwrap();

        let monitor = tokio::spawn(monitor_deliveries(queue.clone(), Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_secs(40)).await;

        let again = queue.pull("segments").await.unwrap().unwrap();
        assert_eq!(again.payload, first.payload);
        assert_eq!(again.delivery_count, 2);
        monitor.abort();
    }
}
