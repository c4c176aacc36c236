// master/src/state.rs

use std::sync::Arc;

use sumflow::{
    Aggregator, BlobStore, Coordinator, CoordinatorConfig, DispatchConfig, Dispatcher,
    MemoryQueue, MemoryRegistry, Segmenter, TaskRegistry, TaskService,
};

/// Todo lo que comparten los handlers HTTP y el monitor.
#[derive(Clone)]
pub struct AppState {
    pub service: TaskService,
    pub registry: Arc<dyn TaskRegistry>,
    // concreta: el monitor y /queue/stats usan métodos propios de la cola en memoria
    pub queue: Arc<MemoryQueue>,
    pub blobs: Arc<dyn BlobStore>,
    pub topic: String,
}

impl AppState {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        queue: Arc<MemoryQueue>,
        segmenter: Arc<dyn Segmenter>,
        aggregator: Arc<dyn Aggregator>,
        dispatch: DispatchConfig,
        coordinator: CoordinatorConfig,
    ) -> Self {
        let registry: Arc<dyn TaskRegistry> = Arc::new(MemoryRegistry::new());
        let topic = dispatch.topic.clone();

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            blobs.clone(),
            queue.clone(),
            segmenter,
            dispatch,
        ));
        let coordinator = Arc::new(Coordinator::new(
            registry.clone(),
            blobs.clone(),
            aggregator,
            coordinator,
        ));
        let service = TaskService::new(registry.clone(), blobs.clone(), dispatcher, coordinator);

        Self {
            service,
            registry,
            queue,
            blobs,
            topic,
        }
    }
}
