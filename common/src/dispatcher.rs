//! Splitter/Dispatcher: convierte una tarea enviada en N mensajes de segmento.
//!
//! Orden de escritura:
//! 1. PENDING -> SPLITTING
//! 2. segmentar la fuente en ubicaciones (si falla: FAILED y no se publica nada)
//! 3. leer y subir cada segmento al blob store, de a uno
//! 4. fijar `segment_count` y crear los segmentos en QUEUED
//! 5. publicar un mensaje por segmento (cada publish con sus reintentos)
//! 6. SPLITTING -> IN_PROGRESS
//!
//! Ningún mensaje se publica antes de que su blob y su registro existan.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::blob::BlobStore;
use crate::capability::Segmenter;
use crate::config::DispatchConfig;
use crate::error::{SplitError, StoreError, TaskError};
use crate::message::SegmentMessage;
use crate::queue::MessageQueue;
use crate::registry::TaskRegistry;
use crate::retry::retry_with_backoff;
use crate::task::{keys, SegmentRecord, TaskId, TaskRecord, TaskStatus};

pub struct Dispatcher {
    registry: Arc<dyn TaskRegistry>,
    blobs: Arc<dyn BlobStore>,
    queue: Arc<dyn MessageQueue>,
    segmenter: Arc<dyn Segmenter>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<dyn TaskRegistry>,
        blobs: Arc<dyn BlobStore>,
        queue: Arc<dyn MessageQueue>,
        segmenter: Arc<dyn Segmenter>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            blobs,
            queue,
            segmenter,
            config,
        }
    }

    /// Crea la tarea en PENDING y devuelve su id.
    pub async fn submit(&self, source_ref: &str) -> Result<TaskId, StoreError> {
        let task_id = uuid::Uuid::new_v4().to_string();
        self.registry
            .create_task(TaskRecord::new(task_id.clone(), source_ref))
            .await?;
        info!("tarea {} creada (source={})", task_id, source_ref);
        Ok(task_id)
    }

    /// Segmenta, sube y publica. Cualquier error fatal deja la tarea en FAILED.
    pub async fn dispatch(&self, task_id: &str, source_ref: &str) -> Result<u32, TaskError> {
        match self.registry.get_task(task_id).await? {
            Some(_) => {}
            None => {
                self.registry
                    .create_task(TaskRecord::new(task_id.to_string(), source_ref))
                    .await?
            }
        }

        if let Err(e) = self
            .registry
            .transition(task_id, TaskStatus::Splitting, None)
            .await
        {
            // cancelada antes de empezar
            warn!("no se pudo pasar {} a SPLITTING: {}", task_id, e);
            return Err(e.into());
        }

        match self.split_and_publish(task_id, source_ref).await {
            Ok(n) => Ok(n),
            Err(e) => {
                error!("dispatch de la tarea {} falló: {}", task_id, e);
                self.fail(task_id, &e).await;
                Err(e)
            }
        }
    }

    async fn split_and_publish(&self, task_id: &str, source_ref: &str) -> Result<u32, TaskError> {
        // los archivos del segmentador viven hasta que termine la subida
        let workdir = tempfile::tempdir().map_err(|e| {
            TaskError::Dispatch(format!("no se pudo crear el directorio de trabajo: {}", e))
        })?;
        let locations = self.segmenter.segment(source_ref, workdir.path()).await?;
        if locations.is_empty() {
            return Err(SplitError::NoSegmentsProduced.into());
        }
        let n = locations.len() as u32;
        info!("tarea {}: fuente partida en {} segmentos", task_id, n);

        // 1) blobs primero: ningún mensaje apunta a un blob que no existe.
        // Se lee un segmento por vez, y de nuevo en cada intento.
        let mut records = Vec::with_capacity(locations.len());
        for (index, location) in locations.iter().enumerate() {
            let index = index as u32;
            let key = keys::segment(task_id, index);
            let key_ref = key.as_str();
            let segmenter = &self.segmenter;
            let blobs = &self.blobs;
            retry_with_backoff(&self.config.retry, &format!("put {}", key), || async move {
                let bytes = segmenter.read(location).await?;
                blobs.put(key_ref, bytes).await?;
                Ok::<(), StoreError>(())
            })
            .await?;
            records.push(SegmentRecord::queued(task_id.to_string(), index, key));
        }

        // 2) segment_count + registros QUEUED
        self.registry.set_segments(task_id, records.clone()).await?;

        // 3) un mensaje por segmento; un publish fallido se reintenta solo
        for record in &records {
            let msg = SegmentMessage::new(
                task_id.to_string(),
                record.segment_index,
                record.location.clone(),
            );
            let payload = msg
                .encode()
                .map_err(|e| TaskError::Dispatch(e.to_string()))?;

            retry_with_backoff(
                &self.config.retry,
                &format!("publish {}/{}", task_id, record.segment_index),
                || self.queue.publish(&self.config.topic, payload.clone()),
            )
            .await
            .map_err(|e| {
                TaskError::Dispatch(format!(
                    "publish del segmento {} falló: {}",
                    record.segment_index, e
                ))
            })?;
        }

        self.registry
            .transition(task_id, TaskStatus::InProgress, None)
            .await?;
        info!("tarea {}: {} mensajes publicados, IN_PROGRESS", task_id, n);

        Ok(n)
    }

    async fn fail(&self, task_id: &str, cause: &TaskError) {
        if let Err(e) = self
            .registry
            .transition(task_id, TaskStatus::Failed, Some(cause.to_string()))
            .await
        {
            warn!("no se pudo marcar {} como FAILED: {}", task_id, e);
        }
    }
}
