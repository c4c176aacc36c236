use serde::{Deserialize, Serialize};

use crate::error::MessageError;
use crate::task::{SegmentIndex, TaskId};

pub const SEGMENT_MESSAGE_VERSION: u32 = 1;

/// Mensaje que publica el dispatcher, uno por segmento.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SegmentMessage {
    pub version: u32,
    pub task_id: TaskId,
    pub segment_index: SegmentIndex,
    /// Clave del blob con los bytes del segmento.
    pub location: String,
}

impl SegmentMessage {
    pub fn new(task_id: TaskId, segment_index: SegmentIndex, location: String) -> Self {
        Self {
            version: SEGMENT_MESSAGE_VERSION,
            task_id,
            segment_index,
            location,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parseo estricto: campos desconocidos, otra versión o ids vacíos se rechazan.
    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        let msg: SegmentMessage = serde_json::from_slice(payload)?;

        if msg.version != SEGMENT_MESSAGE_VERSION {
            return Err(MessageError::UnsupportedVersion {
                found: msg.version,
                expected: SEGMENT_MESSAGE_VERSION,
            });
        }
        if msg.task_id.trim().is_empty() {
            return Err(MessageError::Invalid("task_id vacío".into()));
        }
        if msg.location.trim().is_empty() {
            return Err(MessageError::Invalid("location vacía".into()));
        }

        Ok(msg)
    }
}
