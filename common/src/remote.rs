//! Adaptadores HTTP contra la API interna del master.
//!
//! El master es el dueño del registro, la cola y los blobs; los workers usan
//! estas implementaciones de los mismos traits. Rutas:
//!
//! - `POST /internal/registry`                      (RPC del registro)
//! - `POST /internal/queue/:topic/publish|pull`
//! - `POST /internal/deliveries/:id/ack|nack`
//! - `PUT|GET|HEAD /internal/blobs/*key`

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::api::ErrorBody;
use crate::blob::BlobStore;
use crate::error::StoreError;
use crate::queue::{Delivery, MessageQueue};
use crate::registry::{AttemptStart, FinishOutcome, TaskRegistry};
use crate::task::{SegmentIndex, SegmentOutcome, SegmentRecord, TaskId, TaskRecord, TaskStatus};

/// Convierte una respuesta no-2xx en `StoreError`.
async fn check(resp: Response) -> Result<Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match resp.json::<ErrorBody>().await {
        Ok(body) => Err(body.into_store_error()),
        Err(_) => Err(StoreError::Transport(format!("master respondió {}", status))),
    }
}

fn trim_base(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/* ---------------- blobs ---------------- */

#[derive(Clone)]
pub struct RemoteBlobStore {
    client: Client,
    base_url: String,
}

impl RemoteBlobStore {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: trim_base(base_url),
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}/internal/blobs/{}", self.base_url, key)
    }
}

#[async_trait]
impl BlobStore for RemoteBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let resp = self.client.put(self.url(key)).body(bytes).send().await?;
        check(resp).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let resp = check(self.client.get(self.url(key)).send().await?).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let resp = self.client.head(self.url(key)).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(StoreError::Transport(format!("HEAD {} -> {}", key, s))),
        }
    }
}

/* ---------------- cola ---------------- */

#[derive(Clone)]
pub struct RemoteQueue {
    client: Client,
    base_url: String,
}

impl RemoteQueue {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: trim_base(base_url),
        }
    }

    async fn post_delivery(&self, delivery_id: &str, action: &str) -> Result<(), StoreError> {
        let url = format!(
            "{}/internal/deliveries/{}/{}",
            self.base_url, delivery_id, action
        );
        check(self.client.post(url).send().await?).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for RemoteQueue {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), StoreError> {
        let url = format!("{}/internal/queue/{}/publish", self.base_url, topic);
        check(self.client.post(url).body(payload).send().await?).await?;
        Ok(())
    }

    async fn pull(&self, topic: &str) -> Result<Option<Delivery>, StoreError> {
        let url = format!("{}/internal/queue/{}/pull", self.base_url, topic);
        let resp = check(self.client.post(url).send().await?).await?;
        Ok(resp.json().await?)
    }

    async fn ack(&self, delivery_id: &str) -> Result<(), StoreError> {
        self.post_delivery(delivery_id, "ack").await
    }

    async fn nack(&self, delivery_id: &str) -> Result<(), StoreError> {
        self.post_delivery(delivery_id, "nack").await
    }
}

/* ---------------- registro ---------------- */

/// Una llamada al registro, tal como viaja por `POST /internal/registry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RegistryRequest {
    CreateTask {
        task: TaskRecord,
    },
    GetTask {
        task_id: TaskId,
    },
    ListTasks,
    Transition {
        task_id: TaskId,
        to: TaskStatus,
        error: Option<String>,
    },
    SetSegments {
        task_id: TaskId,
        segments: Vec<SegmentRecord>,
    },
    GetSegment {
        task_id: TaskId,
        index: SegmentIndex,
    },
    ListSegments {
        task_id: TaskId,
    },
    BeginAttempt {
        task_id: TaskId,
        index: SegmentIndex,
    },
    FinishSegment {
        task_id: TaskId,
        index: SegmentIndex,
        outcome: SegmentOutcome,
    },
    CompleteTask {
        task_id: TaskId,
        result_ref: String,
    },
}

/// Ejecuta una llamada RPC contra un registro local y serializa el resultado.
pub async fn serve_registry(
    registry: &dyn TaskRegistry,
    req: RegistryRequest,
) -> Result<serde_json::Value, StoreError> {
    use RegistryRequest::*;

    let value = match req {
        CreateTask { task } => serde_json::to_value(registry.create_task(task).await?)?,
        GetTask { task_id } => serde_json::to_value(registry.get_task(&task_id).await?)?,
        ListTasks => serde_json::to_value(registry.list_tasks().await?)?,
        Transition { task_id, to, error } => {
            serde_json::to_value(registry.transition(&task_id, to, error).await?)?
        }
        SetSegments { task_id, segments } => {
            serde_json::to_value(registry.set_segments(&task_id, segments).await?)?
        }
        GetSegment { task_id, index } => {
            serde_json::to_value(registry.get_segment(&task_id, index).await?)?
        }
        ListSegments { task_id } => serde_json::to_value(registry.list_segments(&task_id).await?)?,
        BeginAttempt { task_id, index } => {
            serde_json::to_value(registry.begin_attempt(&task_id, index).await?)?
        }
        FinishSegment {
            task_id,
            index,
            outcome,
        } => serde_json::to_value(registry.finish_segment(&task_id, index, outcome).await?)?,
        CompleteTask {
            task_id,
            result_ref,
        } => serde_json::to_value(registry.complete_task(&task_id, result_ref).await?)?,
    };
    Ok(value)
}

#[derive(Clone)]
pub struct RemoteRegistry {
    client: Client,
    url: String,
}

impl RemoteRegistry {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/internal/registry", trim_base(base_url)),
        }
    }

    async fn call<T: DeserializeOwned>(&self, req: &RegistryRequest) -> Result<T, StoreError> {
        let resp = check(self.client.post(&self.url).json(req).send().await?).await?;
        let value: serde_json::Value = resp.json().await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl TaskRegistry for RemoteRegistry {
    async fn create_task(&self, task: TaskRecord) -> Result<(), StoreError> {
        self.call(&RegistryRequest::CreateTask { task }).await
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        self.call(&RegistryRequest::GetTask {
            task_id: task_id.to_string(),
        })
        .await
    }

    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        self.call(&RegistryRequest::ListTasks).await
    }

    async fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        error: Option<String>,
    ) -> Result<TaskRecord, StoreError> {
        self.call(&RegistryRequest::Transition {
            task_id: task_id.to_string(),
            to,
            error,
        })
        .await
    }

    async fn set_segments(
        &self,
        task_id: &str,
        segments: Vec<SegmentRecord>,
    ) -> Result<(), StoreError> {
        self.call(&RegistryRequest::SetSegments {
            task_id: task_id.to_string(),
            segments,
        })
        .await
    }

    async fn get_segment(
        &self,
        task_id: &str,
        index: SegmentIndex,
    ) -> Result<Option<SegmentRecord>, StoreError> {
        self.call(&RegistryRequest::GetSegment {
            task_id: task_id.to_string(),
            index,
        })
        .await
    }

    async fn list_segments(&self, task_id: &str) -> Result<Vec<SegmentRecord>, StoreError> {
        self.call(&RegistryRequest::ListSegments {
            task_id: task_id.to_string(),
        })
        .await
    }

    async fn begin_attempt(
        &self,
        task_id: &str,
        index: SegmentIndex,
    ) -> Result<AttemptStart, StoreError> {
        self.call(&RegistryRequest::BeginAttempt {
            task_id: task_id.to_string(),
            index,
        })
        .await
    }

    async fn finish_segment(
        &self,
        task_id: &str,
        index: SegmentIndex,
        outcome: SegmentOutcome,
    ) -> Result<FinishOutcome, StoreError> {
        self.call(&RegistryRequest::FinishSegment {
            task_id: task_id.to_string(),
            index,
            outcome,
        })
        .await
    }

    async fn complete_task(
        &self,
        task_id: &str,
        result_ref: String,
    ) -> Result<TaskRecord, StoreError> {
        self.call(&RegistryRequest::CompleteTask {
            task_id: task_id.to_string(),
            result_ref,
        })
        .await
    }
}
