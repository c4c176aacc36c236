//! Motor scatter-gather para procesar fuentes de media largas: parte la
//! fuente en segmentos, los reparte por una cola de mensajes a workers
//! independientes y junta los resultados en orden cuando todos terminaron.

pub mod api;
pub mod blob;
pub mod capability;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod retry;
pub mod service;
pub mod task;

pub use api::{ErrorBody, ErrorKind, ResultResponse, SubmitRequest, SubmitResponse, TaskSnapshot};
pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use capability::{Aggregator, Analyzer, SegmentLocation, Segmenter};
pub use config::{ConsumerConfig, CoordinatorConfig, DispatchConfig, QueueConfig, RetryPolicy};
pub use consumer::{Consumer, Disposition};
pub use coordinator::Coordinator;
pub use dispatcher::Dispatcher;
pub use error::{MessageError, SplitError, StoreError, TaskError};
pub use message::SegmentMessage;
pub use queue::{Delivery, MemoryQueue, MessageQueue, QueueStats};
pub use registry::{MemoryRegistry, TaskRegistry};
pub use remote::{RemoteBlobStore, RemoteQueue, RemoteRegistry};
pub use service::{ResultLookup, TaskService};
pub use task::{
    SegmentIndex, SegmentOutcome, SegmentRecord, SegmentStatus, TaskId, TaskRecord, TaskStatus,
};
