//! Cola de mensajes con entrega al-menos-una-vez.
//!
//! Modelo pull: `pull` presta un mensaje con un plazo de ack; el consumidor
//! debe llamar `ack` o `nack` exactamente una vez por entrega. Un `nack` o un
//! plazo vencido (worker caído) vuelve a dejar el mensaje en la cola.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::StoreError;

pub type DeliveryId = String;

/// Un mensaje entregado a un consumidor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub delivery_id: DeliveryId,
    pub payload: Vec<u8>,
    /// 1 en la primera entrega, 2+ en las re-entregas.
    pub delivery_count: u32,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), StoreError>;
    async fn pull(&self, topic: &str) -> Result<Option<Delivery>, StoreError>;
    async fn ack(&self, delivery_id: &str) -> Result<(), StoreError>;
    async fn nack(&self, delivery_id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub ready: usize,
    pub in_flight: usize,
    pub published: u64,
    pub delivered: u64,
    pub redelivered: u64,
    pub acked: u64,
}

#[derive(Debug, Clone)]
struct Envelope {
    topic: String,
    payload: Vec<u8>,
    delivery_count: u32,
}

#[derive(Debug)]
struct Lease {
    envelope: Envelope,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: HashMap<String, VecDeque<Envelope>>,
    in_flight: HashMap<DeliveryId, Lease>,
    stats: QueueStats,
}

impl QueueState {
    fn requeue(&mut self, envelope: Envelope) {
        self.stats.redelivered += 1;
        self.ready
            .entry(envelope.topic.clone())
            .or_default()
            .push_back(envelope);
    }
}

/// Cola en memoria del proceso master.
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    ack_deadline: Duration,
}

impl MemoryQueue {
    pub fn new(ack_deadline: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ack_deadline,
        }
    }

    /// Devuelve a la cola las entregas cuyo plazo de ack venció.
    pub fn requeue_expired(&self) -> Result<usize, StoreError> {
        let now = Instant::now();
        let mut state = self.lock()?;

        let expired: Vec<DeliveryId> = state
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(lease) = state.in_flight.remove(id) {
                info!(
                    "re-encolando entrega {} (topic={}, plazo de ack vencido)",
                    id, lease.envelope.topic
                );
                state.requeue(lease.envelope);
            }
        }

        Ok(expired.len())
    }

    pub fn stats(&self) -> Result<QueueStats, StoreError> {
        let state = self.lock()?;
        let mut stats = state.stats.clone();
        stats.ready = state.ready.values().map(|q| q.len()).sum();
        stats.in_flight = state.in_flight.len();
        Ok(stats)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Transport("lock cola".into()))
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.stats.published += 1;
        state
            .ready
            .entry(topic.to_string())
            .or_default()
            .push_back(Envelope {
                topic: topic.to_string(),
                payload,
                delivery_count: 0,
            });
        Ok(())
    }

    async fn pull(&self, topic: &str) -> Result<Option<Delivery>, StoreError> {
        let mut state = self.lock()?;

        let Some(mut envelope) = state.ready.get_mut(topic).and_then(|q| q.pop_front()) else {
            return Ok(None);
        };

        envelope.delivery_count += 1;
        let delivery = Delivery {
            delivery_id: uuid::Uuid::new_v4().to_string(),
            payload: envelope.payload.clone(),
            delivery_count: envelope.delivery_count,
        };

        state.stats.delivered += 1;
        state.in_flight.insert(
            delivery.delivery_id.clone(),
            Lease {
                envelope,
                deadline: Instant::now() + self.ack_deadline,
            },
        );

        Ok(Some(delivery))
    }

    async fn ack(&self, delivery_id: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        match state.in_flight.remove(delivery_id) {
            Some(_) => {
                state.stats.acked += 1;
                Ok(())
            }
            // ya re-encolada por vencimiento: el ack llega tarde
            None => Err(StoreError::NotFound(format!("entrega {}", delivery_id))),
        }
    }

    async fn nack(&self, delivery_id: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        match state.in_flight.remove(delivery_id) {
            Some(lease) => {
                debug!("nack de la entrega {}, vuelve a la cola", delivery_id);
                state.requeue(lease.envelope);
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("entrega {}", delivery_id))),
        }
    }
}
