//! Collaborators shared by every layer in a process.

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::cache::FileStore;
use crate::config::DEFAULT_GPU_TEXTURE_TILE_CACHE_SIZE;
use crate::retrieve::{DEFAULT_MAX_ACTIVE, DEFAULT_QUEUE_CAPACITY, NetworkStatus, RetrievalService};
use crate::tile::TileCache;

/// The shared coordinator record handed to each layer.
///
/// Holds the task, local and remote retrieval services, network status,
/// the default file store, the texture tile cache and the HTTP client.
#[derive(Debug)]
pub struct Environment {
    runtime: Handle,
    task_service: RetrievalService,
    local_retrieval_service: RetrievalService,
    remote_retrieval_service: RetrievalService,
    network_status: Arc<NetworkStatus>,
    file_store: FileStore,
    tile_cache: Arc<TileCache>,
    http: reqwest::Client,
}

impl Environment {
    /// Build an environment with default pool sizes on `runtime`.
    #[must_use]
    pub fn new(runtime: Handle, file_store: FileStore) -> Self {
        Self::with_pool_sizes(runtime, file_store, DEFAULT_MAX_ACTIVE, DEFAULT_QUEUE_CAPACITY)
    }

    #[must_use]
    pub fn with_pool_sizes(
        runtime: Handle,
        file_store: FileStore,
        max_active: usize,
        queue_capacity: usize,
    ) -> Self {
        Self {
            task_service: RetrievalService::new(
                "tasks",
                runtime.clone(),
                max_active,
                queue_capacity,
            ),
            local_retrieval_service: RetrievalService::new(
                "local retrieval",
                runtime.clone(),
                max_active,
                queue_capacity,
            ),
            remote_retrieval_service: RetrievalService::new(
                "remote retrieval",
                runtime.clone(),
                max_active,
                queue_capacity,
            ),
            runtime,
            network_status: Arc::new(NetworkStatus::new()),
            file_store,
            tile_cache: Arc::new(TileCache::new(DEFAULT_GPU_TEXTURE_TILE_CACHE_SIZE)),
            http: reqwest::Client::new(),
        }
    }

    /// Replace the HTTP client, e.g. to set a user agent or proxy.
    #[must_use]
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    #[must_use]
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Service running tile load tasks.
    #[must_use]
    pub fn task_service(&self) -> &RetrievalService {
        &self.task_service
    }

    #[must_use]
    pub fn local_retrieval_service(&self) -> &RetrievalService {
        &self.local_retrieval_service
    }

    #[must_use]
    pub fn remote_retrieval_service(&self) -> &RetrievalService {
        &self.remote_retrieval_service
    }

    #[must_use]
    pub fn network_status(&self) -> &Arc<NetworkStatus> {
        &self.network_status
    }

    #[must_use]
    pub fn file_store(&self) -> &FileStore {
        &self.file_store
    }

    #[must_use]
    pub fn tile_cache(&self) -> &Arc<TileCache> {
        &self.tile_cache
    }

    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Grow the shared tile cache to at least `capacity` bytes.
    pub fn ensure_tile_cache_capacity(&self, capacity: usize) {
        if capacity > self.tile_cache.capacity() {
            tracing::debug!(capacity, "growing texture tile cache");
            self.tile_cache.set_capacity(capacity);
        }
    }

    /// Shut down all retrieval services.
    pub fn shutdown(&self) {
        self.task_service.shutdown();
        self.local_retrieval_service.shutdown();
        self.remote_retrieval_service.shutdown();
    }
}
