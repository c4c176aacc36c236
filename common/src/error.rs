//! Tipos de error del pipeline.
//!
//! - `StoreError`: adaptadores de blobs, cola y registro (errores de I/O transitorios)
//! - `SplitError`: fallos al segmentar, fatales para la tarea
//! - `MessageError`: mensajes de segmento mal formados, permanentes para esa entrega
//! - `TaskError`: fallos a nivel de tarea que quedan registrados

use std::time::Duration;

use thiserror::Error;

use crate::task::{SegmentIndex, TaskId, TaskStatus};

/// Errores de los adaptadores de almacenamiento, cola y registro.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no encontrado: {0}")]
    NotFound(String),

    #[error("conflicto: {0}")]
    Conflict(String),

    #[error("clave inválida: {0}")]
    InvalidKey(String),

    #[error("error de transporte: {0}")]
    Transport(String),

    #[error("error de IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("error de serialización JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Sólo vale la pena reintentar los transitorios.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transport(_) | StoreError::Io(_))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        StoreError::Transport(e.to_string())
    }
}

/// Fallos del segmentador.
#[derive(Debug, Error)]
pub enum SplitError {
    #[error("no se pudo leer la fuente: {0}")]
    SourceUnreadable(String),

    #[error("el segmentador no produjo segmentos")]
    NoSegmentsProduced,
}

/// Mensaje de segmento que nunca se va a poder procesar.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("mensaje de segmento mal formado: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("versión de mensaje {found} no soportada (se esperaba {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("mensaje de segmento inválido: {0}")]
    Invalid(String),
}

/// Resultados que terminan una tarea en FAILED (o CANCELLED).
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("tarea {0} no encontrada")]
    NotFound(TaskId),

    #[error("falló la segmentación: {0}")]
    Split(#[from] SplitError),

    #[error("falló el dispatch: {0}")]
    Dispatch(String),

    #[error("timeout: la tarea no terminó en {0:?}")]
    Timeout(Duration),

    #[error("segmentos {} fallaron definitivamente: {}", format_indices(.indices), .reasons.join("; "))]
    Aggregation {
        indices: Vec<SegmentIndex>,
        reasons: Vec<String>,
    },

    #[error("falló la agregación: {0}")]
    Aggregate(String),

    #[error("la tarea terminó en {status:?} antes de completarse")]
    Terminated {
        status: TaskStatus,
        error: Option<String>,
    },

    #[error("error de almacenamiento: {0}")]
    Store(#[from] StoreError),
}

fn format_indices(indices: &[SegmentIndex]) -> String {
    let parts: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregation_error_names_failed_indices() {
        let e = TaskError::Aggregation {
            indices: vec![1, 4],
            reasons: vec!["segmento 1: falló el modelo".into(), "segmento 4: timeout".into()],
        };
        let msg = e.to_string();
        assert!(msg.contains("[1, 4]"), "{msg}");
        assert!(msg.contains("segmento 1: falló el modelo"), "{msg}");
    }

    #[test]
    fn only_transport_and_io_errors_are_transient() {
        assert!(StoreError::Transport("reset".into()).is_transient());
        assert!(!StoreError::NotFound("k".into()).is_transient());
        assert!(!StoreError::Conflict("x".into()).is_transient());
    }
}
