//! Frente de tareas: submit, consulta de estado y resultado, cancelación.
//!
//! Cada `submit` lanza una tarea tokio que corre el dispatch y después el
//! coordinator de esa tarea.

use std::sync::Arc;

use tracing::{info, warn};

use crate::blob::BlobStore;
use crate::coordinator::Coordinator;
use crate::dispatcher::Dispatcher;
use crate::error::{StoreError, TaskError};
use crate::registry::TaskRegistry;
use crate::task::{SegmentRecord, TaskId, TaskRecord, TaskStatus};

/// Respuesta de `get_result`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultLookup {
    Ready(String),
    NotReady(TaskStatus),
}

#[derive(Clone)]
pub struct TaskService {
    registry: Arc<dyn TaskRegistry>,
    blobs: Arc<dyn BlobStore>,
    dispatcher: Arc<Dispatcher>,
    coordinator: Arc<Coordinator>,
}

impl TaskService {
    pub fn new(
        registry: Arc<dyn TaskRegistry>,
        blobs: Arc<dyn BlobStore>,
        dispatcher: Arc<Dispatcher>,
        coordinator: Arc<Coordinator>,
    ) -> Self {
        Self {
            registry,
            blobs,
            dispatcher,
            coordinator,
        }
    }

    /// Crea la tarea y la procesa en segundo plano.
    pub async fn submit(&self, source_ref: &str) -> Result<TaskId, StoreError> {
        let task_id = self.dispatcher.submit(source_ref).await?;

        let this = self.clone();
        let id = task_id.clone();
        let source = source_ref.to_string();
        tokio::spawn(async move {
            // el error ya quedó registrado en la tarea
            let _ = this.run(&id, &source).await;
        });

        Ok(task_id)
    }

    /// Dispatch + espera de una tarea ya creada.
    pub async fn run(&self, task_id: &str, source_ref: &str) -> Result<TaskRecord, TaskError> {
        self.dispatcher.dispatch(task_id, source_ref).await?;
        match self.coordinator.await_completion(task_id).await {
            Ok(record) => Ok(record),
            Err(e) => {
                info!("tarea {} terminó sin resultado: {}", task_id, e);
                Err(e)
            }
        }
    }

    pub async fn get_status(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        self.registry
            .get_task(task_id)
            .await?
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    pub async fn list_tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        self.registry.list_tasks().await
    }

    pub async fn list_segments(&self, task_id: &str) -> Result<Vec<SegmentRecord>, TaskError> {
        // 404 para tareas desconocidas, no lista vacía
        self.get_status(task_id).await?;
        Ok(self.registry.list_segments(task_id).await?)
    }

    pub async fn get_result(&self, task_id: &str) -> Result<ResultLookup, TaskError> {
        let task = self.get_status(task_id).await?;
        match (task.status, task.result_ref) {
            (TaskStatus::Completed, Some(result_ref)) => Ok(ResultLookup::Ready(result_ref)),
            (status, _) => Ok(ResultLookup::NotReady(status)),
        }
    }

    /// Texto final de una tarea COMPLETED.
    pub async fn get_summary(&self, task_id: &str) -> Result<ResultLookup, TaskError> {
        match self.get_result(task_id).await? {
            ResultLookup::Ready(result_ref) => {
                let bytes = self.blobs.get(&result_ref).await?;
                Ok(ResultLookup::Ready(
                    String::from_utf8_lossy(&bytes).into_owned(),
                ))
            }
            not_ready => Ok(not_ready),
        }
    }

    /// Pasa una tarea no terminal a CANCELLED. Los workers en vuelo terminan
    /// lo suyo y el coordinator ignora el resultado.
    pub async fn cancel(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        self.get_status(task_id).await?;
        match self
            .registry
            .transition(task_id, TaskStatus::Cancelled, Some("cancelada".to_string()))
            .await
        {
            Ok(record) => {
                info!("tarea {} cancelada", task_id);
                Ok(record)
            }
            Err(e) => {
                warn!("no se pudo cancelar {}: {}", task_id, e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    //! Escenarios completos: dispatcher, consumer y coordinator reales sobre
    //! los adaptadores en memoria.

    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::capability::{Aggregator, Analyzer, SegmentLocation, Segmenter};
    use crate::config::{ConsumerConfig, CoordinatorConfig, DispatchConfig, RetryPolicy};
    use crate::consumer::{Consumer, Disposition};
    use crate::error::SplitError;
    use crate::message::SegmentMessage;
    use crate::queue::{MemoryQueue, MessageQueue};
    use crate::registry::MemoryRegistry;
    use crate::task::SegmentStatus;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::watch;

    /// "vid1" -> segmentos "t0", "t1", "t2". El contenido de cada ubicación
    /// es su propio nombre, así no se toca el disco.
    struct ThreeParts;

    #[async_trait]
    impl Segmenter for ThreeParts {
        async fn segment(
            &self,
            source_ref: &str,
            _workdir: &Path,
        ) -> Result<Vec<SegmentLocation>, SplitError> {
            if source_ref != "vid1" {
                return Err(SplitError::SourceUnreadable(source_ref.into()));
            }
            Ok(["t0", "t1", "t2"]
                .iter()
                .map(|name| SegmentLocation::range(*name, 0, name.len() as u64))
                .collect())
        }

        async fn read(&self, location: &SegmentLocation) -> std::io::Result<Vec<u8>> {
            Ok(location.path.to_string_lossy().into_owned().into_bytes())
        }
    }

    /// Devuelve el segmento tal cual. Falla siempre con `fail_on` y nunca
    /// termina con `hang_on`.
    #[derive(Default)]
    struct ScriptedAnalyzer {
        fail_on: Option<&'static str>,
        hang_on: Option<&'static str>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Analyzer for ScriptedAnalyzer {
        async fn analyze(&self, segment: &[u8]) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = String::from_utf8_lossy(segment).into_owned();
            if self.hang_on == Some(text.as_str()) {
                std::future::pending::<()>().await;
            }
            if self.fail_on == Some(text.as_str()) {
                anyhow::bail!("no se pudo transcribir {}", text);
            }
            Ok(text)
        }
    }

    /// Guarda lo que recibió para comprobar el orden.
    #[derive(Default)]
    struct RecordingAggregator {
        seen: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl Aggregator for RecordingAggregator {
        async fn aggregate(&self, texts: &[String]) -> anyhow::Result<String> {
            self.seen.lock().unwrap().push(texts.to_vec());
            Ok(format!("resumen({})", texts.join(",")))
        }
    }

    struct Harness {
        registry: Arc<MemoryRegistry>,
        blobs: Arc<MemoryBlobStore>,
        queue: Arc<MemoryQueue>,
        analyzer: Arc<ScriptedAnalyzer>,
        aggregator: Arc<RecordingAggregator>,
        consumer: Arc<Consumer>,
        service: TaskService,
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        }
    }

    fn harness(analyzer: ScriptedAnalyzer) -> Harness {
        let registry = Arc::new(MemoryRegistry::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let analyzer = Arc::new(analyzer);
        let aggregator = Arc::new(RecordingAggregator::default());

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            blobs.clone(),
            queue.clone(),
            Arc::new(ThreeParts),
            DispatchConfig {
                topic: "segments".into(),
                retry: retry(),
            },
        ));
        let coordinator = Arc::new(Coordinator::new(
            registry.clone(),
            blobs.clone(),
            aggregator.clone(),
            CoordinatorConfig {
                poll_initial: Duration::from_millis(50),
                poll_max: Duration::from_millis(500),
                max_wait: Duration::from_secs(60),
                retry: retry(),
            },
        ));
        let consumer = Arc::new(Consumer::new(
            registry.clone(),
            blobs.clone(),
            queue.clone(),
            analyzer.clone(),
            ConsumerConfig {
                topic: "segments".into(),
                max_attempts: 3,
                concurrency: 2,
                idle_interval: Duration::from_millis(20),
            },
        ));
        let service = TaskService::new(registry.clone(), blobs.clone(), dispatcher, coordinator);

        Harness {
            registry,
            blobs,
            queue,
            analyzer,
            aggregator,
            consumer,
            service,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn three_segments_complete_in_order() {
        let h = harness(ScriptedAnalyzer::default());
        let (tx, rx) = watch::channel(false);
        let worker = tokio::spawn(h.consumer.clone().consume(rx));

        let task_id = h.service.dispatcher.submit("vid1").await.unwrap();
        let record = h.service.run(&task_id, "vid1").await.unwrap();

        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.processed_count, 3);
        assert_eq!(
            h.aggregator.seen.lock().unwrap().clone(),
            vec![vec!["t0".to_string(), "t1".into(), "t2".into()]]
        );
        assert_eq!(
            h.service.get_summary(&task_id).await.unwrap(),
            ResultLookup::Ready("resumen(t0,t1,t2)".into())
        );
        assert_eq!(
            h.service.get_result(&task_id).await.unwrap(),
            ResultLookup::Ready(crate::task::keys::summary(&task_id))
        );
        for seg in h.registry.list_segments(&task_id).await.unwrap() {
            assert_eq!(seg.status, SegmentStatus::Done);
            assert!(seg.result_ref.is_some());
        }

        tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn segment_past_retry_ceiling_fails_the_task() {
        let h = harness(ScriptedAnalyzer {
            fail_on: Some("t1"),
            ..Default::default()
        });
        let (tx, rx) = watch::channel(false);
        let worker = tokio::spawn(h.consumer.clone().consume(rx));

        let task_id = h.service.dispatcher.submit("vid1").await.unwrap();
        let err = h.service.run(&task_id, "vid1").await.unwrap_err();
        assert!(matches!(&err, TaskError::Aggregation { indices, .. } if indices == &vec![1]));

        let task = h.service.get_status(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.processed_count, 3);
        let error = task.error.unwrap();
        assert!(error.contains("[1]"), "{error}");
        assert!(error.contains("no se pudo transcribir t1"), "{error}");
        assert!(h.aggregator.seen.lock().unwrap().is_empty());

        let seg = h.registry.get_segment(&task_id, 1).await.unwrap().unwrap();
        assert_eq!(seg.status, SegmentStatus::Failed);
        assert_eq!(seg.attempts, 3);
        assert_eq!(seg.result_ref, None);

        tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_delivery_after_done_is_a_no_op() {
        let h = harness(ScriptedAnalyzer::default());
        let task_id = h.service.dispatcher.submit("vid1").await.unwrap();
        h.service.dispatcher.dispatch(&task_id, "vid1").await.unwrap();

        let payload = SegmentMessage::new(
            task_id.clone(),
            0,
            crate::task::keys::segment(&task_id, 0),
        )
        .encode()
        .unwrap();

        assert_eq!(h.consumer.handle(&payload).await, Disposition::Ack);
        assert_eq!(h.consumer.handle(&payload).await, Disposition::Ack);

        assert_eq!(h.analyzer.calls.load(Ordering::SeqCst), 1);
        let task = h.service.get_status(&task_id).await.unwrap();
        assert_eq!(task.processed_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_segment_times_out() {
        let h = harness(ScriptedAnalyzer {
            hang_on: Some("t2"),
            ..Default::default()
        });
        let (_tx, rx) = watch::channel(false);
        let worker = tokio::spawn(h.consumer.clone().consume(rx));

        let task_id = h.service.dispatcher.submit("vid1").await.unwrap();
        let err = h.service.run(&task_id, "vid1").await.unwrap_err();
        assert!(matches!(err, TaskError::Timeout(_)));

        let task = h.service.get_status(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.processed_count, 2);
        assert_eq!(task.result_ref, None);
        assert_eq!(
            h.service.get_result(&task_id).await.unwrap(),
            ResultLookup::NotReady(TaskStatus::Failed)
        );

        // el handler colgado nunca va a soltar su permiso
        worker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_a_running_task() {
        let h = harness(ScriptedAnalyzer::default());
        // sin workers: la tarea queda IN_PROGRESS
        let task_id = h.service.submit("vid1").await.unwrap();

        for _ in 0..20 {
            let t = h.service.get_status(&task_id).await.unwrap();
            if t.status == TaskStatus::InProgress {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            h.service.get_result(&task_id).await.unwrap(),
            ResultLookup::NotReady(TaskStatus::InProgress)
        );

        let record = h.service.cancel(&task_id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
        assert!(record.finished_at.is_some());

        // una segunda cancelación es un conflicto
        assert!(matches!(
            h.service.cancel(&task_id).await,
            Err(TaskError::Store(StoreError::Conflict(_)))
        ));

        // los mensajes pendientes se descartan sin analizar
        let delivery = h.queue.pull("segments").await.unwrap().unwrap();
        assert_eq!(h.consumer.handle(&delivery.payload).await, Disposition::Ack);
        assert_eq!(h.analyzer.calls.load(Ordering::SeqCst), 0);
        assert!(h.blobs.exists(&crate::task::keys::segment(&task_id, 0)).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_task_lookups_are_not_found() {
        let h = harness(ScriptedAnalyzer::default());
        assert!(matches!(
            h.service.get_status("nada").await,
            Err(TaskError::NotFound(_))
        ));
        assert!(matches!(
            h.service.list_segments("nada").await,
            Err(TaskError::NotFound(_))
        ));
        assert!(matches!(
            h.service.cancel("nada").await,
            Err(TaskError::NotFound(_))
        ));
    }
}
