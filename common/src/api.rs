//! Tipos de la API HTTP del master (pública e interna).

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::task::{TaskId, TaskRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Ruta local o URL http(s) de la fuente.
    pub source_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: TaskId,
}

/// Estado de una tarea tal como lo ve un cliente.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    #[serde(flatten)]
    pub task: TaskRecord,
    pub progress_percent: Option<f64>,
}

impl From<TaskRecord> for TaskSnapshot {
    fn from(task: TaskRecord) -> Self {
        let progress_percent = task.progress_percent();
        Self {
            task,
            progress_percent,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultResponse {
    pub task_id: TaskId,
    pub result_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    NotReady,
    BadRequest,
    Transport,
}

/// Cuerpo de toda respuesta de error del master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self.kind {
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict | ErrorKind::NotReady => 409,
            ErrorKind::BadRequest => 400,
            ErrorKind::Transport => 502,
        }
    }

    /// Reconstruye el error del lado del cliente remoto.
    pub fn into_store_error(self) -> StoreError {
        match self.kind {
            ErrorKind::NotFound => StoreError::NotFound(self.message),
            ErrorKind::Conflict | ErrorKind::NotReady => StoreError::Conflict(self.message),
            ErrorKind::BadRequest => StoreError::InvalidKey(self.message),
            ErrorKind::Transport => StoreError::Transport(self.message),
        }
    }
}

impl From<&StoreError> for ErrorBody {
    fn from(e: &StoreError) -> Self {
        let kind = match e {
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Conflict(_) => ErrorKind::Conflict,
            StoreError::InvalidKey(_) => ErrorKind::BadRequest,
            StoreError::Transport(_) | StoreError::Io(_) | StoreError::Json(_) => {
                ErrorKind::Transport
            }
        };
        let message = match e {
            StoreError::NotFound(m)
            | StoreError::Conflict(m)
            | StoreError::InvalidKey(m)
            | StoreError::Transport(m) => m.clone(),
            other => other.to_string(),
        };
        Self { kind, message }
    }
}
