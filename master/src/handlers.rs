use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use sumflow::remote::{serve_registry, RegistryRequest};
use sumflow::{
    Delivery, ErrorBody, ErrorKind, MessageQueue, QueueStats, ResultLookup, ResultResponse,
    SegmentRecord, StoreError, SubmitRequest, SubmitResponse, TaskError, TaskSnapshot, TaskStatus,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::state::AppState;

// segmentos de video de varios MB viajan por /internal/blobs
const MAX_BLOB_BYTES: usize = 512 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/api/v1/tasks", post(submit_task).get(list_tasks))
        .route("/api/v1/tasks/:id", get(get_task))
        .route("/api/v1/tasks/:id/segments", get(get_segments))
        .route("/api/v1/tasks/:id/result", get(get_result))
        .route("/api/v1/tasks/:id/summary", get(get_summary))
        .route("/api/v1/tasks/:id/cancel", post(cancel_task))
        .route("/api/v1/queue/stats", get(queue_stats));

    let internal = Router::new()
        .route("/internal/registry", post(registry_rpc))
        .route("/internal/queue/:topic/publish", post(queue_publish))
        .route("/internal/queue/:topic/pull", post(queue_pull))
        .route("/internal/deliveries/:id/ack", post(queue_ack))
        .route("/internal/deliveries/:id/nack", post(queue_nack))
        // GET responde también HEAD
        .route("/internal/blobs/*key", get(blob_get).put(blob_put))
        .layer(DefaultBodyLimit::max(MAX_BLOB_BYTES));

    public
        .merge(internal)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- errores ---------------- */

pub struct ApiError(ErrorBody);

impl ApiError {
    fn not_ready(task_id: &str, status: TaskStatus) -> Self {
        Self(ErrorBody::new(
            ErrorKind::NotReady,
            format!("la tarea {} todavía no tiene resultado ({:?})", task_id, status),
        ))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(ErrorBody::from(&e))
    }
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::NotFound(id) => Self(ErrorBody::new(
                ErrorKind::NotFound,
                format!("tarea {} no encontrada", id),
            )),
            TaskError::Store(e) => e.into(),
            other => Self(ErrorBody::new(ErrorKind::Conflict, other.to_string())),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/* ---------------- API pública ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Crea la tarea y arranca el dispatch en segundo plano
async fn submit_task(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let source_ref = req.source_ref.trim();
    if source_ref.is_empty() {
        return Err(ApiError(ErrorBody::new(
            ErrorKind::BadRequest,
            "source_ref vacío",
        )));
    }

    let task_id = state.service.submit(source_ref).await?;
    info!("tarea {} recibida (source={})", task_id, source_ref);
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { task_id })))
}

async fn list_tasks(State(state): State<AppState>) -> ApiResult<Json<Vec<TaskSnapshot>>> {
    let tasks = state.service.list_tasks().await?;
    Ok(Json(tasks.into_iter().map(TaskSnapshot::from).collect()))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskSnapshot>> {
    let task = state.service.get_status(&id).await?;
    Ok(Json(task.into()))
}

async fn get_segments(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<SegmentRecord>>> {
    Ok(Json(state.service.list_segments(&id).await?))
}

async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ResultResponse>> {
    match state.service.get_result(&id).await? {
        ResultLookup::Ready(result_ref) => Ok(Json(ResultResponse {
            task_id: id,
            result_ref,
        })),
        ResultLookup::NotReady(status) => Err(ApiError::not_ready(&id, status)),
    }
}

async fn get_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    match state.service.get_summary(&id).await? {
        ResultLookup::Ready(text) => Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            text,
        )
            .into_response()),
        ResultLookup::NotReady(status) => Err(ApiError::not_ready(&id, status)),
    }
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskSnapshot>> {
    let task = state.service.cancel(&id).await?;
    Ok(Json(task.into()))
}

async fn queue_stats(State(state): State<AppState>) -> ApiResult<Json<QueueStats>> {
    Ok(Json(state.queue.stats()?))
}

/* ---------------- API interna (workers) ---------------- */

async fn registry_rpc(
    State(state): State<AppState>,
    Json(req): Json<RegistryRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    debug!("rpc registro: {:?}", req);
    Ok(Json(serve_registry(state.registry.as_ref(), req).await?))
}

async fn queue_publish(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    state.queue.publish(&topic, body.to_vec()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn queue_pull(
    State(state): State<AppState>,
    Path(topic): Path<String>,
) -> ApiResult<Json<Option<Delivery>>> {
    let delivery = state.queue.pull(&topic).await?;
    if let Some(d) = &delivery {
        debug!(
            "entrega {} de '{}' (entrega nº {})",
            d.delivery_id, topic, d.delivery_count
        );
    }
    Ok(Json(delivery))
}

async fn queue_ack(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.queue.ack(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn queue_nack(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.queue.nack(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn blob_get(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult<Vec<u8>> {
    Ok(state.blobs.get(&key).await?)
}

async fn blob_put(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    state.blobs.put(&key, body.to_vec()).await?;
    Ok(StatusCode::NO_CONTENT)
}
