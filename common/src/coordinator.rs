//! Completion Coordinator: espera a que todos los segmentos de una tarea
//! lleguen a estado terminal y arma el resultado final.
//!
//! Un coordinator por tarea. El poll usa backoff exponencial acotado y un
//! plazo máximo; nunca hace busy-wait.

use std::sync::Arc;

use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::blob::BlobStore;
use crate::capability::Aggregator;
use crate::config::CoordinatorConfig;
use crate::error::{StoreError, TaskError};
use crate::registry::TaskRegistry;
use crate::retry::{retry_with_backoff, Backoff};
use crate::task::{keys, SegmentRecord, SegmentStatus, TaskRecord, TaskStatus};

pub struct Coordinator {
    registry: Arc<dyn TaskRegistry>,
    blobs: Arc<dyn BlobStore>,
    aggregator: Arc<dyn Aggregator>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        registry: Arc<dyn TaskRegistry>,
        blobs: Arc<dyn BlobStore>,
        aggregator: Arc<dyn Aggregator>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            registry,
            blobs,
            aggregator,
            config,
        }
    }

    /// Espera la tarea y la deja en COMPLETED o FAILED.
    ///
    /// Devuelve el registro final si la tarea se completó. Si la tarea termina
    /// por otro camino (cancelada, falló en el dispatch) devuelve
    /// `TaskError::Terminated` sin agregar nada. Cualquier otro error deja la
    /// tarea en FAILED; nunca queda en IN_PROGRESS.
    pub async fn await_completion(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        let task = match self.wait_all_processed(task_id).await {
            Ok(task) => task,
            Err(e @ (TaskError::Terminated { .. } | TaskError::NotFound(_))) => return Err(e),
            Err(e) => {
                error!("tarea {}: {}", task_id, e);
                return Err(self.fail(task_id, e).await);
            }
        };

        let segments = match retry_with_backoff(
            &self.config.retry,
            &format!("list_segments {}", task_id),
            || self.registry.list_segments(task_id),
        )
        .await
        {
            Ok(segments) => segments,
            Err(e) => {
                let err = TaskError::from(e);
                error!("tarea {}: no se pudieron leer los segmentos: {}", task_id, err);
                return Err(self.fail(task_id, err).await);
            }
        };
        let failed: Vec<&SegmentRecord> = segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Failed)
            .collect();

        if !failed.is_empty() {
            let err = TaskError::Aggregation {
                indices: failed.iter().map(|s| s.segment_index).collect(),
                reasons: failed
                    .iter()
                    .filter_map(|s| s.error.clone())
                    .collect(),
            };
            error!("tarea {}: {}", task_id, err);
            return Err(self.fail(task_id, err).await);
        }

        match self.aggregate(&task, &segments).await {
            Ok(record) => {
                info!(
                    "tarea {} COMPLETED ({} segmentos, resultado en {:?})",
                    task_id, record.processed_count, record.result_ref
                );
                Ok(record)
            }
            Err(e @ TaskError::Terminated { .. }) => Err(e),
            Err(e) => {
                error!("tarea {}: agregación falló: {}", task_id, e);
                Err(self.fail(task_id, e).await)
            }
        }
    }

    /// Hace poll hasta `processed_count == segment_count`.
    async fn wait_all_processed(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        let deadline = Instant::now() + self.config.max_wait;
        let mut backoff = Backoff::new(self.config.poll_initial, self.config.poll_max);

        loop {
            let task = match self.registry.get_task(task_id).await {
                Ok(Some(t)) => Some(t),
                Ok(None) => return Err(TaskError::NotFound(task_id.to_string())),
                Err(e) if e.is_transient() => {
                    warn!("tarea {}: registro no disponible: {}", task_id, e);
                    None
                }
                Err(e) => return Err(e.into()),
            };

            if let Some(task) = task {
                if task.status.is_terminal() {
                    info!(
                        "tarea {} terminó en {:?} mientras se esperaba",
                        task_id, task.status
                    );
                    return Err(TaskError::Terminated {
                        status: task.status,
                        error: task.error,
                    });
                }
                if task.all_segments_processed() {
                    return Ok(task);
                }
                debug!(
                    "tarea {}: {}/{:?} segmentos procesados",
                    task_id, task.processed_count, task.segment_count
                );
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TaskError::Timeout(self.config.max_wait));
            }
            let delay = backoff.next().unwrap_or(self.config.poll_max);
            sleep(delay.min(deadline - now)).await;
        }
    }

    /// Lee los resultados en orden de índice, agrega y registra COMPLETED.
    async fn aggregate(
        &self,
        task: &TaskRecord,
        segments: &[SegmentRecord],
    ) -> Result<TaskRecord, TaskError> {
        let task_id = task.task_id.as_str();

        // list_segments ya viene ordenado, pero el orden es lo que importa aquí
        let mut ordered: Vec<&SegmentRecord> = segments.iter().collect();
        ordered.sort_by_key(|s| s.segment_index);

        let mut texts = Vec::with_capacity(ordered.len());
        for seg in ordered {
            let result_ref = seg.result_ref.as_deref().ok_or_else(|| {
                TaskError::Aggregate(format!(
                    "el segmento {} está DONE sin result_ref",
                    seg.segment_index
                ))
            })?;
            let bytes = retry_with_backoff(
                &self.config.retry,
                &format!("get {}", result_ref),
                || self.blobs.get(result_ref),
            )
            .await?;
            texts.push(String::from_utf8_lossy(&bytes).into_owned());
        }

        let summary = self
            .aggregator
            .aggregate(&texts)
            .await
            .map_err(|e| TaskError::Aggregate(format!("{:#}", e)))?;

        let summary_ref = keys::summary(task_id);
        let bytes = summary.into_bytes();
        retry_with_backoff(&self.config.retry, &format!("put {}", summary_ref), || {
            self.blobs.put(&summary_ref, bytes.clone())
        })
        .await?;

        match self.registry.complete_task(task_id, summary_ref).await {
            Ok(record) => Ok(record),
            Err(StoreError::Conflict(msg)) => {
                // alguien la canceló mientras agregábamos
                warn!("tarea {}: no se pudo completar: {}", task_id, msg);
                Err(self.terminated(task_id).await)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Marca la tarea FAILED con el error dado y lo devuelve.
    async fn fail(&self, task_id: &str, err: TaskError) -> TaskError {
        match self
            .registry
            .transition(task_id, TaskStatus::Failed, Some(err.to_string()))
            .await
        {
            Ok(_) => err,
            Err(StoreError::Conflict(_)) => self.terminated(task_id).await,
            Err(e) => {
                error!("tarea {}: no se pudo marcar FAILED: {}", task_id, e);
                err
            }
        }
    }

    async fn terminated(&self, task_id: &str) -> TaskError {
        match self.registry.get_task(task_id).await {
            Ok(Some(t)) => TaskError::Terminated {
                status: t.status,
                error: t.error,
            },
            Ok(None) => TaskError::NotFound(task_id.to_string()),
            Err(e) => e.into(),
        }
    }
}
