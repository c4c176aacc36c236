//! Worker Consumer: saca mensajes de segmento de la cola y los procesa.
//!
//! `handle` decide qué hacer con una entrega y devuelve `Disposition`; el
//! loop de `consume` es el único que llama `ack`/`nack`, una vez por entrega.
//!
//! Idempotencia: un segmento que ya está DONE (o FAILED) se confirma sin
//! volver a analizarlo, y el incremento de `processed_count` va atado a la
//! transición a estado terminal en el registro, así que una re-entrega nunca
//! cuenta dos veces.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{watch, Semaphore};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::blob::BlobStore;
use crate::capability::Analyzer;
use crate::config::ConsumerConfig;
use crate::message::SegmentMessage;
use crate::queue::{Delivery, MessageQueue};
use crate::registry::{AttemptStart, FinishOutcome, TaskRegistry};
use crate::task::{keys, SegmentOutcome, SegmentRecord};

/// Qué hacer con una entrega.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack,
}

pub struct Consumer {
    registry: Arc<dyn TaskRegistry>,
    blobs: Arc<dyn BlobStore>,
    queue: Arc<dyn MessageQueue>,
    analyzer: Arc<dyn Analyzer>,
    config: ConsumerConfig,
    /// Sólo para logs.
    name: String,
}

impl Consumer {
    pub fn new(
        registry: Arc<dyn TaskRegistry>,
        blobs: Arc<dyn BlobStore>,
        queue: Arc<dyn MessageQueue>,
        analyzer: Arc<dyn Analyzer>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            registry,
            blobs,
            queue,
            analyzer,
            config,
            name: "consumer".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Loop principal:
    /// - saca mensajes mientras haya "slots" libres (hasta `concurrency`)
    /// - cada entrega se procesa en su propia tarea tokio
    /// - al recibir shutdown deja de sacar y espera a que terminen las entregas en vuelo
    pub async fn consume(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let concurrency = self.config.concurrency.max(1);
        let sem = Arc::new(Semaphore::new(concurrency));

        info!(
            "{} escuchando topic '{}' (concurrency={}, max_attempts={})",
            self.name, self.config.topic, concurrency, self.config.max_attempts
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                p = sem.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let delivery = match self.queue.pull(&self.config.topic).await {
                Ok(Some(d)) => d,
                Ok(None) => {
                    drop(permit);
                    if !self.idle(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    drop(permit);
                    warn!("{}: error sacando de la cola: {}", self.name, e);
                    if !self.idle(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let consumer = self.clone();
            tokio::spawn(async move {
                consumer.process_delivery(delivery).await;
                drop(permit);
            });
        }

        // esperar a que las entregas en vuelo hagan ack/nack
        info!("{}: apagando, esperando entregas en vuelo", self.name);
        let _ = sem.acquire_many(concurrency as u32).await;
        info!("{}: detenido", self.name);
    }

    /// Espera `idle_interval` o hasta un cambio de shutdown. Devuelve `false`
    /// si el emisor se cerró: no queda nadie que pueda despertarnos.
    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = sleep(self.config.idle_interval) => true,
            changed = shutdown.changed() => changed.is_ok(),
        }
    }

    /// Procesa una entrega y hace exactamente un ack o un nack.
    pub async fn process_delivery(&self, delivery: Delivery) {
        let disposition = self.handle(&delivery.payload).await;

        let res = match disposition {
            Disposition::Ack => self.queue.ack(&delivery.delivery_id).await,
            Disposition::Nack => self.queue.nack(&delivery.delivery_id).await,
        };
        if let Err(e) = res {
            // si el ack se pierde la cola lo re-entrega y el handler lo descarta por idempotencia
            warn!(
                "{}: {:?} de la entrega {} falló: {}",
                self.name, disposition, delivery.delivery_id, e
            );
        }
    }

    pub async fn handle(&self, payload: &[u8]) -> Disposition {
        let msg = match SegmentMessage::decode(payload) {
            Ok(m) => m,
            Err(e) => {
                // permanente para esta entrega: no tiene sentido re-entregarla
                error!("{}: descartando mensaje: {}", self.name, e);
                return Disposition::Ack;
            }
        };
        let (task_id, index) = (msg.task_id.as_str(), msg.segment_index);

        match self.registry.get_task(task_id).await {
            Ok(Some(task)) if task.status.is_terminal() => {
                debug!(
                    "{}: tarea {} ya está {:?}, ignorando segmento {}",
                    self.name, task_id, task.status, index
                );
                return Disposition::Ack;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                error!(
                    "{}: tarea {} desconocida, descartando segmento {}",
                    self.name, task_id, index
                );
                return Disposition::Ack;
            }
            Err(e) => {
                warn!("{}: registro no disponible: {}", self.name, e);
                return Disposition::Nack;
            }
        }

        let segment = match self.registry.begin_attempt(task_id, index).await {
            Ok(AttemptStart::Started(seg)) => seg,
            Ok(AttemptStart::AlreadyTerminal(seg)) => {
                debug!(
                    "{}: segmento {}/{} ya está {:?}, ack sin reprocesar",
                    self.name, task_id, index, seg.status
                );
                return Disposition::Ack;
            }
            Err(e) if e.is_transient() => {
                warn!("{}: no se pudo iniciar {}/{}: {}", self.name, task_id, index, e);
                return Disposition::Nack;
            }
            Err(e) => {
                error!("{}: segmento {}/{} inválido: {}", self.name, task_id, index, e);
                return Disposition::Ack;
            }
        };

        // entregas que siguen llegando tras agotar los intentos (handler que se cae)
        if segment.attempts > self.config.max_attempts {
            let reason = format!(
                "se superó el máximo de intentos ({}) sin resultado",
                self.config.max_attempts
            );
            return self.fail_segment(&segment, reason).await;
        }

        info!(
            "{}: procesando segmento {}/{} (intento {}/{})",
            self.name, task_id, index, segment.attempts, self.config.max_attempts
        );

        match self.process(&msg).await {
            Ok(result_ref) => self.complete_segment(&segment, result_ref).await,
            Err(e) if segment.attempts >= self.config.max_attempts => {
                error!(
                    "{}: segmento {}/{} falló en el último intento: {:#}",
                    self.name, task_id, index, e
                );
                self.fail_segment(&segment, format!("segmento {}: {:#}", index, e))
                    .await
            }
            Err(e) => {
                warn!(
                    "{}: segmento {}/{} falló (intento {}/{}), nack: {:#}",
                    self.name, task_id, index, segment.attempts, self.config.max_attempts, e
                );
                Disposition::Nack
            }
        }
    }

    /// descargar -> analizar -> subir resultado
    async fn process(&self, msg: &SegmentMessage) -> anyhow::Result<String> {
        let bytes = self
            .blobs
            .get(&msg.location)
            .await
            .with_context(|| format!("descargando {}", msg.location))?;

        let text = self
            .analyzer
            .analyze(&bytes)
            .await
            .context("análisis del segmento")?;

        let result_ref = keys::segment_result(&msg.task_id, msg.segment_index);
        self.blobs
            .put(&result_ref, text.into_bytes())
            .await
            .with_context(|| format!("subiendo {}", result_ref))?;

        Ok(result_ref)
    }

    async fn complete_segment(&self, segment: &SegmentRecord, result_ref: String) -> Disposition {
        self.finish(segment, SegmentOutcome::Done { result_ref }).await
    }

    async fn fail_segment(&self, segment: &SegmentRecord, reason: String) -> Disposition {
        self.finish(segment, SegmentOutcome::Failed { reason }).await
    }

    async fn finish(&self, segment: &SegmentRecord, outcome: SegmentOutcome) -> Disposition {
        let (task_id, index) = (segment.task_id.as_str(), segment.segment_index);

        match self.registry.finish_segment(task_id, index, outcome).await {
            Ok(FinishOutcome::Recorded { processed_count }) => {
                info!(
                    "{}: segmento {}/{} terminado ({} procesados)",
                    self.name, task_id, index, processed_count
                );
                Disposition::Ack
            }
            Ok(FinishOutcome::AlreadyTerminal { status }) => {
                debug!(
                    "{}: otra entrega ya cerró {}/{} ({:?})",
                    self.name, task_id, index, status
                );
                Disposition::Ack
            }
            Err(e) => {
                // el segmento queda en PROCESSING y la re-entrega lo intenta de nuevo
                warn!(
                    "{}: no se pudo registrar {}/{}: {}",
                    self.name, task_id, index, e
                );
                Disposition::Nack
            }
        }
    }
}
