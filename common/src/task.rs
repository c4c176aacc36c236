use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TaskId = String;
pub type SegmentIndex = u32;

/// Ciclo de vida de una tarea enviada.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Splitting,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// De un estado terminal no se sale nunca.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentStatus {
    Queued,
    Processing,
    Done,
    Failed,
}

impl SegmentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SegmentStatus::Done | SegmentStatus::Failed)
    }
}

/// Una tarea (job) tal como queda guardada en el registro.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub source_ref: String,
    pub status: TaskStatus,

    /// Lo fija el dispatcher una sola vez, después de partir la fuente.
    pub segment_count: Option<u32>,
    /// Segmentos con resultado terminal registrado (DONE o FAILED).
    pub processed_count: u32,

    /// Artefacto final, sólo existe cuando la tarea está COMPLETED.
    pub result_ref: Option<String>,
    pub error: Option<String>,

    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(task_id: TaskId, source_ref: impl Into<String>) -> Self {
        Self {
            task_id,
            source_ref: source_ref.into(),
            status: TaskStatus::Pending,
            segment_count: None,
            processed_count: 0,
            result_ref: None,
            error: None,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// true cuando todos los segmentos tienen resultado terminal.
    pub fn all_segments_processed(&self) -> bool {
        matches!(self.segment_count, Some(n) if self.processed_count >= n)
    }

    /// Progreso en %, `None` mientras no se conozca segment_count.
    pub fn progress_percent(&self) -> Option<f64> {
        match self.segment_count {
            Some(0) | None => None,
            Some(n) => Some(self.processed_count as f64 / n as f64 * 100.0),
        }
    }
}

/// Unidad de trabajo, con clave `(task_id, segment_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub task_id: TaskId,
    pub segment_index: SegmentIndex,
    /// Clave del blob con los bytes del segmento.
    pub location: String,
    pub status: SegmentStatus,
    /// Clave del blob con el resultado del análisis, sólo si DONE.
    pub result_ref: Option<String>,
    pub attempts: u32,
    pub error: Option<String>,
}

impl SegmentRecord {
    pub fn queued(task_id: TaskId, segment_index: SegmentIndex, location: String) -> Self {
        Self {
            task_id,
            segment_index,
            location,
            status: SegmentStatus::Queued,
            result_ref: None,
            attempts: 0,
            error: None,
        }
    }
}

/// Resultado terminal que un worker registra para un segmento.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SegmentOutcome {
    Done { result_ref: String },
    Failed { reason: String },
}

/// Esquema de claves de blobs (para los stores son opacas).
pub mod keys {
    use super::SegmentIndex;

    pub fn segment(task_id: &str, index: SegmentIndex) -> String {
        format!("tasks/{}/segments/{:05}", task_id, index)
    }

    pub fn segment_result(task_id: &str, index: SegmentIndex) -> String {
        format!("tasks/{}/results/{:05}.txt", task_id, index)
    }

    pub fn summary(task_id: &str) -> String {
        format!("tasks/{}/summary.txt", task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(SegmentStatus::Done.is_terminal());
        assert!(!SegmentStatus::Processing.is_terminal());
    }

    #[test]
    fn status_serializes_screaming_snake_case() {
        let s = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(s, "\"IN_PROGRESS\"");
    }

    #[test]
    fn progress_is_unknown_until_segment_count_is_set() {
        let mut t = TaskRecord::new("t".into(), "vid1");
        assert_eq!(t.progress_percent(), None);
        assert!(!t.all_segments_processed());

        t.segment_count = Some(4);
        t.processed_count = 1;
        assert_eq!(t.progress_percent(), Some(25.0));

        t.processed_count = 4;
        assert!(t.all_segments_processed());
    }

    #[test]
    fn segment_keys_sort_in_index_order() {
        let a = keys::segment("t", 2);
        let b = keys::segment("t", 10);
        assert!(a < b);
        assert_ne!(keys::segment_result("t", 0), keys::segment("t", 0));
    }
}
