//! Registro de tareas y segmentos.
//!
//! Cada mutación es atómica sobre su registro: las transiciones de estado,
//! el `segment_count` de una sola escritura, el inicio de un intento y el
//! resultado terminal de un segmento junto con el incremento de
//! `processed_count`. Así dos workers que terminan segmentos distintos a la
//! vez nunca pierden un incremento, y una re-entrega de un segmento ya
//! terminado no vuelve a contar.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::task::{
    SegmentIndex, SegmentOutcome, SegmentRecord, SegmentStatus, TaskId, TaskRecord, TaskStatus,
};

/// Resultado de `begin_attempt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "segment", rename_all = "snake_case")]
pub enum AttemptStart {
    /// Segmento pasado a PROCESSING con `attempts` ya incrementado.
    Started(SegmentRecord),
    /// El segmento ya estaba DONE o FAILED; no hay nada que hacer.
    AlreadyTerminal(SegmentRecord),
}

/// Resultado de `finish_segment`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FinishOutcome {
    Recorded { processed_count: u32 },
    AlreadyTerminal { status: SegmentStatus },
}

#[async_trait]
pub trait TaskRegistry: Send + Sync {
    async fn create_task(&self, task: TaskRecord) -> Result<(), StoreError>;
    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError>;
    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, StoreError>;

    /// Cambia el estado de una tarea no terminal. Falla con `Conflict` si ya es terminal.
    async fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        error: Option<String>,
    ) -> Result<TaskRecord, StoreError>;

    /// Escribe `segment_count` (una sola vez) y los registros de segmento.
    async fn set_segments(
        &self,
        task_id: &str,
        segments: Vec<SegmentRecord>,
    ) -> Result<(), StoreError>;

    async fn get_segment(
        &self,
        task_id: &str,
        index: SegmentIndex,
    ) -> Result<Option<SegmentRecord>, StoreError>;

    /// Segmentos de la tarea en orden ascendente de índice.
    async fn list_segments(&self, task_id: &str) -> Result<Vec<SegmentRecord>, StoreError>;

    async fn begin_attempt(
        &self,
        task_id: &str,
        index: SegmentIndex,
    ) -> Result<AttemptStart, StoreError>;

    /// Marca el segmento DONE/FAILED e incrementa `processed_count` en 1,
    /// sólo si el segmento no era terminal.
    async fn finish_segment(
        &self,
        task_id: &str,
        index: SegmentIndex,
        outcome: SegmentOutcome,
    ) -> Result<FinishOutcome, StoreError>;

    /// COMPLETED + `result_ref`, sólo cuando todos los segmentos están procesados.
    async fn complete_task(&self, task_id: &str, result_ref: String)
        -> Result<TaskRecord, StoreError>;
}

/* ---------------- implementación en memoria ---------------- */

#[derive(Default)]
struct RegistryState {
    tasks: HashMap<TaskId, TaskRecord>,
    // BTreeMap: list_segments sale ordenado por índice
    segments: HashMap<TaskId, BTreeMap<SegmentIndex, SegmentRecord>>,
}

#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<RegistryState>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Transport("lock registro".into()))
    }
}

fn task_not_found(task_id: &str) -> StoreError {
    StoreError::NotFound(format!("tarea {}", task_id))
}

fn segment_not_found(task_id: &str, index: SegmentIndex) -> StoreError {
    StoreError::NotFound(format!("segmento {}/{}", task_id, index))
}

/// El único punto donde se toca `processed_count`.
fn increment_processed(task: &mut TaskRecord) -> Result<u32, StoreError> {
    let count = task.segment_count.ok_or_else(|| {
        StoreError::Conflict(format!("tarea {} sin segment_count", task.task_id))
    })?;
    if task.processed_count >= count {
        return Err(StoreError::Conflict(format!(
            "processed_count de {} ya vale {}/{}",
            task.task_id, task.processed_count, count
        )));
    }
    task.processed_count += 1;
    Ok(task.processed_count)
}

#[async_trait]
impl TaskRegistry for MemoryRegistry {
    async fn create_task(&self, task: TaskRecord) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.tasks.contains_key(&task.task_id) {
            return Err(StoreError::Conflict(format!(
                "la tarea {} ya existe",
                task.task_id
            )));
        }
        state.tasks.insert(task.task_id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.lock()?.tasks.get(task_id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.lock()?;
        let mut tasks: Vec<TaskRecord> = state.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(tasks)
    }

    async fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        error: Option<String>,
    ) -> Result<TaskRecord, StoreError> {
        let mut state = self.lock()?;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| task_not_found(task_id))?;

        if task.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "la tarea {} ya terminó ({:?})",
                task_id, task.status
            )));
        }
        if matches!(to, TaskStatus::Pending | TaskStatus::Completed) {
            return Err(StoreError::Conflict(format!(
                "transición inválida {:?} -> {:?}",
                task.status, to
            )));
        }

        task.status = to;
        if to == TaskStatus::Splitting && task.started_at.is_none() {
            task.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            task.finished_at = Some(Utc::now());
            task.error = error;
        }
        Ok(task.clone())
    }

    async fn set_segments(
        &self,
        task_id: &str,
        segments: Vec<SegmentRecord>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| task_not_found(task_id))?;

        if task.segment_count.is_some() {
            return Err(StoreError::Conflict(format!(
                "segment_count de {} ya fue fijado",
                task_id
            )));
        }
        task.segment_count = Some(segments.len() as u32);

        let by_index = segments
            .into_iter()
            .map(|s| (s.segment_index, s))
            .collect::<BTreeMap<_, _>>();
        state.segments.insert(task_id.to_string(), by_index);
        Ok(())
    }

    async fn get_segment(
        &self,
        task_id: &str,
        index: SegmentIndex,
    ) -> Result<Option<SegmentRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .segments
            .get(task_id)
            .and_then(|segs| segs.get(&index))
            .cloned())
    }

    async fn list_segments(&self, task_id: &str) -> Result<Vec<SegmentRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .segments
            .get(task_id)
            .map(|segs| segs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn begin_attempt(
        &self,
        task_id: &str,
        index: SegmentIndex,
    ) -> Result<AttemptStart, StoreError> {
        let mut state = self.lock()?;
        let segment = state
            .segments
            .get_mut(task_id)
            .and_then(|segs| segs.get_mut(&index))
            .ok_or_else(|| segment_not_found(task_id, index))?;

        if segment.status.is_terminal() {
            return Ok(AttemptStart::AlreadyTerminal(segment.clone()));
        }

        segment.status = SegmentStatus::Processing;
        segment.attempts += 1;
        Ok(AttemptStart::Started(segment.clone()))
    }

    async fn finish_segment(
        &self,
        task_id: &str,
        index: SegmentIndex,
        outcome: SegmentOutcome,
    ) -> Result<FinishOutcome, StoreError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| task_not_found(task_id))?;
        let segment = state
            .segments
            .get_mut(task_id)
            .and_then(|segs| segs.get_mut(&index))
            .ok_or_else(|| segment_not_found(task_id, index))?;

        if segment.status.is_terminal() {
            return Ok(FinishOutcome::AlreadyTerminal {
                status: segment.status,
            });
        }

        let processed_count = increment_processed(task)?;
        match outcome {
            SegmentOutcome::Done { result_ref } => {
                segment.status = SegmentStatus::Done;
                segment.result_ref = Some(result_ref);
                segment.error = None;
            }
            SegmentOutcome::Failed { reason } => {
                segment.status = SegmentStatus::Failed;
                segment.result_ref = None;
                segment.error = Some(reason);
            }
        }

        Ok(FinishOutcome::Recorded { processed_count })
    }

    async fn complete_task(
        &self,
        task_id: &str,
        result_ref: String,
    ) -> Result<TaskRecord, StoreError> {
        let mut state = self.lock()?;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| task_not_found(task_id))?;

        if task.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "la tarea {} ya terminó ({:?})",
                task_id, task.status
            )));
        }
        if !task.all_segments_processed() {
            return Err(StoreError::Conflict(format!(
                "la tarea {} tiene {}/{:?} segmentos procesados",
                task_id, task.processed_count, task.segment_count
            )));
        }

        task.status = TaskStatus::Completed;
        task.result_ref = Some(result_ref);
        task.finished_at = Some(Utc::now());
        Ok(task.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn registry_with_task(n: u32) -> MemoryRegistry {
        let reg = MemoryRegistry::new();
        reg.create_task(TaskRecord::new("t1".into(), "vid1"))
            .await
            .unwrap();
        let segs = (0..n)
            .map(|i| SegmentRecord::queued("t1".into(), i, format!("seg/{i}")))
            .collect();
        reg.set_segments("t1", segs).await.unwrap();
        reg
    }

    fn done(i: u32) -> SegmentOutcome {
        SegmentOutcome::Done {
            result_ref: format!("res/{i}"),
        }
    }

    #[tokio::test]
    async fn create_task_rejects_duplicates() {
        let reg = MemoryRegistry::new();
        reg.create_task(TaskRecord::new("t1".into(), "a")).await.unwrap();
        assert!(matches!(
            reg.create_task(TaskRecord::new("t1".into(), "b")).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn segment_count_is_set_only_once() {
        let reg = registry_with_task(3).await;
        let again = vec![SegmentRecord::queued("t1".into(), 0, "x".into())];
        assert!(matches!(
            reg.set_segments("t1", again).await,
            Err(StoreError::Conflict(_))
        ));
        let t = reg.get_task("t1").await.unwrap().unwrap();
        assert_eq!(t.segment_count, Some(3));
    }

    #[tokio::test]
    async fn begin_attempt_counts_every_delivery() {
        let reg = registry_with_task(1).await;

        for expected in 1..=3 {
            match reg.begin_attempt("t1", 0).await.unwrap() {
                AttemptStart::Started(seg) => {
                    assert_eq!(seg.status, SegmentStatus::Processing);
                    assert_eq!(seg.attempts, expected);
                }
                other => panic!("esperaba Started, llegó {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn finish_is_idempotent_per_segment() {
        let reg = registry_with_task(2).await;

        let first = reg.finish_segment("t1", 0, done(0)).await.unwrap();
        assert_eq!(first, FinishOutcome::Recorded { processed_count: 1 });

        let second = reg.finish_segment("t1", 0, done(0)).await.unwrap();
        assert_eq!(
            second,
            FinishOutcome::AlreadyTerminal {
                status: SegmentStatus::Done
            }
        );

        let t = reg.get_task("t1").await.unwrap().unwrap();
        assert_eq!(t.processed_count, 1);

        assert!(matches!(
            reg.begin_attempt("t1", 0).await.unwrap(),
            AttemptStart::AlreadyTerminal(_)
        ));
    }

    #[tokio::test]
    async fn result_ref_only_exists_for_done_segments() {
        let reg = registry_with_task(2).await;
        reg.finish_segment("t1", 0, done(0)).await.unwrap();
        reg.finish_segment(
            "t1",
            1,
            SegmentOutcome::Failed {
                reason: "boom".into(),
            },
        )
        .await
        .unwrap();

        for seg in reg.list_segments("t1").await.unwrap() {
            assert_eq!(
                seg.result_ref.is_some(),
                seg.status == SegmentStatus::Done,
                "{:?}",
                seg
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_never_lost() {
        let n = 64;
        let reg = Arc::new(registry_with_task(n).await);

        let mut handles = Vec::new();
        for i in 0..n {
            // dos entregas por segmento, como haría una cola al-menos-una-vez
            for _ in 0..2 {
                let reg = reg.clone();
                handles.push(tokio::spawn(async move {
                    reg.finish_segment("t1", i, done(i)).await.unwrap()
                }));
            }
        }

        let mut recorded = 0;
        for h in handles {
            if matches!(h.await.unwrap(), FinishOutcome::Recorded { .. }) {
                recorded += 1;
            }
        }

        let t = reg.get_task("t1").await.unwrap().unwrap();
        assert_eq!(recorded, n);
        assert_eq!(t.processed_count, n);
        assert!(t.all_segments_processed());
    }

    #[tokio::test]
    async fn terminal_tasks_cannot_transition() {
        let reg = registry_with_task(1).await;
        reg.transition("t1", TaskStatus::Cancelled, Some("cancelada".into()))
            .await
            .unwrap();

        assert!(matches!(
            reg.transition("t1", TaskStatus::InProgress, None).await,
            Err(StoreError::Conflict(_))
        ));
        reg.finish_segment("t1", 0, done(0)).await.unwrap();
        assert!(matches!(
            reg.complete_task("t1", "summary".into()).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn complete_requires_every_segment_processed() {
        let reg = registry_with_task(2).await;
        reg.finish_segment("t1", 0, done(0)).await.unwrap();
        assert!(reg.complete_task("t1", "s".into()).await.is_err());

        reg.finish_segment("t1", 1, done(1)).await.unwrap();
        let t = reg.complete_task("t1", "s".into()).await.unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.result_ref.as_deref(), Some("s"));
        assert!(t.finished_at.is_some());
    }

    #[tokio::test]
    async fn list_segments_is_ordered_by_index() {
        let reg = MemoryRegistry::new();
        reg.create_task(TaskRecord::new("t1".into(), "v")).await.unwrap();
        let segs = [2, 0, 1]
            .into_iter()
            .map(|i| SegmentRecord::queued("t1".into(), i, format!("seg/{i}")))
            .collect();
        reg.set_segments("t1", segs).await.unwrap();

        let idx: Vec<u32> = reg
            .list_segments("t1")
            .await
            .unwrap()
            .iter()
            .map(|s| s.segment_index)
            .collect();
        assert_eq!(idx, vec![0, 1, 2]);
    }
}
