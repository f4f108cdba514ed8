//! Tile loading: file store lookup, texture publication and retrieval.
//!
//! Everything here runs off the render thread. Failures never propagate to
//! the selector; they are logged and recorded as absent resources.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::absent::AbsentResourceList;
use crate::cache::FileStore;
use crate::config::{DEFAULT_MAX_RESOURCE_ATTEMPTS, LayerParams};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::layer::{LayerEvent, LayerProperties};
use crate::level::LevelSet;
use crate::retrieve::{
    LocalRetrievalRequest, RetrievalPostProcessor, RetrievalService, RetrievedContent, Retriever,
    Task, TaskFuture, UrlRetriever,
};
use crate::texture::TextureFactory;
use crate::tile::{GpuTextureTile, TileKey};

/// The half of a layer shared with worker tasks.
pub struct LayerCore {
    pub(crate) env: Arc<Environment>,
    pub(crate) params: LayerParams,
    pub(crate) levels: LevelSet,
    pub(crate) properties: RwLock<LayerProperties>,
    pub(crate) texture_factory: Arc<dyn TextureFactory>,
    pub(crate) events: broadcast::Sender<LayerEvent>,
    /// Absence of the layer's own non-tile resources, keyed by URL. The
    /// retry interval is driven by the resource initializer's schedule.
    pub(crate) resource_absent: AbsentResourceList<String>,
    pub(crate) capabilities: RwLock<Option<String>>,
    /// Tiles with a load or retrieval submitted and not yet finished.
    in_flight: Arc<Mutex<HashSet<TileKey>>>,
    /// Serializes file-store reads for decoding and all writes.
    file_lock: Mutex<()>,
}

impl LayerCore {
    pub(crate) fn new(
        env: Arc<Environment>,
        params: LayerParams,
        levels: LevelSet,
        properties: LayerProperties,
        texture_factory: Arc<dyn TextureFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            env,
            params,
            levels,
            properties: RwLock::new(properties),
            texture_factory,
            events,
            resource_absent: AbsentResourceList::new(
                DEFAULT_MAX_RESOURCE_ATTEMPTS,
                Duration::from_millis(1),
            ),
            capabilities: RwLock::new(None),
            in_flight: Arc::default(),
            file_lock: Mutex::new(()),
        }
    }

    pub(crate) fn properties(&self) -> LayerProperties {
        self.properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn emit(&self, event: LayerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Whether a load or retrieval of `key` is queued or running.
    pub(crate) fn is_in_flight(&self, key: &TileKey) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Claim `key` for one load. Returns `None` if it is already claimed.
    pub(crate) fn begin_request(&self, key: &TileKey) -> Option<InFlightGuard> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        inserted.then(|| InFlightGuard {
            keys: Arc::clone(&self.in_flight),
            key: key.clone(),
        })
    }

    /// The task submitted to the task service for one queued tile.
    ///
    /// The claim on the tile is released when the load finishes, or when
    /// the retrieval it starts has been post-processed.
    pub(crate) fn request_task(
        self: &Arc<Self>,
        tile: Arc<GpuTextureTile>,
        claim: InFlightGuard,
    ) -> Task {
        let core = Arc::clone(self);
        Box::new(move |token: CancellationToken| -> TaskFuture {
            Box::pin(async move {
                if token.is_cancelled() {
                    return;
                }
                core.load_tile(tile, claim).await;
            })
        })
    }

    /// Load a tile from the file store, or start retrieving it.
    pub(crate) async fn load_tile(
        self: &Arc<Self>,
        tile: Arc<GpuTextureTile>,
        claim: InFlightGuard,
    ) {
        let core = Arc::clone(self);
        let cached = Arc::clone(&tile);
        let loaded = tokio::task::spawn_blocking(move || core.load_tile_from_store(&cached))
            .await
            .unwrap_or_else(|e| {
                tracing::error!(tile = %tile.key(), error = %e, "tile load panicked");
                false
            });

        if !loaded {
            self.retrieve_texture(&tile, claim);
        }
    }

    /// Returns `true` when the tile's texture was published from the store.
    fn load_tile_from_store(&self, tile: &Arc<GpuTextureTile>) -> bool {
        let store = self.env.file_store();
        let Some(file) = store.find(&tile.path()) else {
            return false;
        };

        if self.is_texture_file_expired(tile, &file) {
            if let Err(e) = store.remove_file(&file) {
                tracing::warn!(tile = %tile.key(), error = %e, "failed to remove expired tile");
            } else {
                tracing::debug!(tile = %tile.key(), path = %file.display(), "removed expired tile");
            }
            return false;
        }

        if self.load_tile_from_cache(tile, &file) {
            return true;
        }

        if let Err(e) = store.remove_file(&file) {
            tracing::warn!(tile = %tile.key(), error = %e, "failed to remove corrupt tile");
        } else {
            tracing::info!(tile = %tile.key(), path = %file.display(), "deleted corrupt data file");
        }
        false
    }

    /// Decode `file` and publish the texture to `tile`.
    pub(crate) fn load_tile_from_cache(&self, tile: &Arc<GpuTextureTile>, file: &Path) -> bool {
        let texture = {
            let _guard = self.file_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.texture_factory.create_texture_data(file)
        };
        let Some(texture) = texture else {
            return false;
        };

        tile.set_texture_data(Some(Arc::new(texture)));
        let cache = self.env.tile_cache();
        if cache.contains(tile.key()) {
            // The size changed now that the texture is attached.
            cache.put(tile.key().clone(), Arc::clone(tile), tile.size_in_bytes());
        }
        self.levels.unmark_resource_absent(tile.key());
        self.emit(LayerEvent::TextureLoaded(tile.key().clone()));
        true
    }

    /// Expiry threshold for a tile: the later of the layer's and its level's.
    pub(crate) fn expiry_time_for(&self, tile: &GpuTextureTile) -> i64 {
        self.properties()
            .expiry_time
            .max(tile.level().expiry_time())
    }

    fn is_texture_file_expired(&self, tile: &GpuTextureTile, file: &Path) -> bool {
        self.env
            .file_store()
            .is_file_expired(file, self.expiry_time_for(tile))
    }

    /// Build the retriever for a tile, or `None` if it cannot be retrieved
    /// now. Returns the service the retriever should run on.
    pub(crate) fn create_retriever(
        &self,
        tile: &GpuTextureTile,
    ) -> Option<(Arc<dyn Retriever>, &RetrievalService)> {
        if let Some(factory) = &self.params.retriever_factory_local {
            let request = LocalRetrievalRequest {
                sector: tile.sector(),
                width: tile.width(),
                height: tile.height(),
                file_name: tile.path(),
            };
            return factory
                .create_retriever(&request)
                .map(|r| (r, self.env.local_retrieval_service()));
        }

        let Some(template) = self.params.service_url.as_deref() else {
            tracing::debug!(tile = %tile.key(), "layer has no service url");
            self.levels.mark_resource_absent(tile.key());
            return None;
        };
        let url = match tile.resource_url(template, self.params.image_format.as_deref()) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(tile = %tile.key(), error = %e, "skipping tile");
                return None;
            }
        };

        let network = self.env.network_status();
        if network.is_offline_mode()
            || !network.is_url_available(&url)
            || !self.properties().network_retrieval_enabled
        {
            self.levels.mark_resource_absent(tile.key());
            return None;
        }

        let millis = |ms: Option<u64>| ms.map(Duration::from_millis);
        let retriever = UrlRetriever::new(self.env.http().clone(), url, Arc::clone(network))
            .with_connect_timeout(millis(self.params.url_connect_timeout))
            .with_read_timeout(millis(self.params.url_read_timeout))
            .with_stale_request_limit(millis(self.params.retrieval_queue_stale_request_limit));
        Some((Arc::new(retriever), self.env.remote_retrieval_service()))
    }

    /// Start retrieving a tile into the environment's file store.
    pub(crate) fn retrieve_texture(
        self: &Arc<Self>,
        tile: &Arc<GpuTextureTile>,
        claim: InFlightGuard,
    ) {
        let Some((retriever, service)) = self.create_retriever(tile) else {
            return;
        };
        let post = Arc::new(
            DownloadPostProcessor::new(
                Arc::clone(self),
                Arc::clone(tile),
                self.env.file_store().clone(),
            )
            .with_claim(claim),
        );
        if !service.run_retriever(retriever, post, tile.priority()) {
            tracing::debug!(tile = %tile.key(), service = service.name(), "retrieval service busy");
        }
    }
}

impl std::fmt::Debug for LayerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerCore")
            .field("params", &self.params)
            .field("levels", &self.levels)
            .finish_non_exhaustive()
    }
}

/// A tile's claim on the layer's in-flight set, released on drop.
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    keys: Arc<Mutex<HashSet<TileKey>>>,
    key: TileKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Persists a retrieved tile and records failures as absence.
pub struct DownloadPostProcessor {
    core: Arc<LayerCore>,
    tile: Arc<GpuTextureTile>,
    file_store: FileStore,
    _claim: Option<InFlightGuard>,
}

impl DownloadPostProcessor {
    #[must_use]
    pub fn new(core: Arc<LayerCore>, tile: Arc<GpuTextureTile>, file_store: FileStore) -> Self {
        Self {
            core,
            tile,
            file_store,
            _claim: None,
        }
    }

    /// Hold the tile's in-flight claim until this processor is dropped.
    #[must_use]
    pub(crate) fn with_claim(self, claim: InFlightGuard) -> Self {
        Self {
            _claim: Some(claim),
            ..self
        }
    }

    fn mark_absent(&self) {
        self.core.levels.mark_resource_absent(self.tile.key());
    }
}

impl RetrievalPostProcessor for DownloadPostProcessor {
    fn process(&self, outcome: Result<RetrievedContent>) -> Result<usize> {
        let key = self.tile.key();
        let content = match outcome {
            Ok(content) => content,
            Err(e) => {
                self.mark_absent();
                return Err(e);
            }
        };

        if content.is_text() {
            self.mark_absent();
            let content_type = content.content_type.unwrap_or_default();
            tracing::warn!(
                tile = %key,
                content_type = %content_type,
                "service returned text instead of tile data"
            );
            return Err(Error::TextContent {
                source_name: key.to_string(),
                content_type,
            });
        }
        if content.data.is_empty() {
            self.mark_absent();
            return Err(Error::EmptyContent {
                source_name: key.to_string(),
            });
        }

        let written = {
            let _guard = self.core.file_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.file_store.write_atomic(&self.tile.path(), &content.data)
        };
        if let Err(e) = written {
            tracing::error!(tile = %key, error = %e, "failed to store tile");
            self.mark_absent();
            return Err(e);
        }

        self.core.levels.unmark_resource_absent(key);
        self.core.emit(LayerEvent::DataStored(key.clone()));
        Ok(content.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Sector;
    use crate::layer::TiledImageLayer;
    use crate::layer::tests::{layer_params, test_env};
    use crate::retrieve::{RetrieveFuture, RetrieverFactory};
    use crate::tile::now_millis;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticRetriever(Vec<u8>, Option<String>);

    impl Retriever for StaticRetriever {
        fn name(&self) -> &str {
            "static"
        }

        fn retrieve(&self) -> RetrieveFuture<'_> {
            let content = RetrievedContent::new(self.1.clone(), self.0.clone());
            Box::pin(async move { Ok(content) })
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        calls: AtomicUsize,
    }

    impl RetrieverFactory for CountingFactory {
        fn create_retriever(&self, _request: &LocalRetrievalRequest) -> Option<Arc<dyn Retriever>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(Arc::new(StaticRetriever(vec![9; 32], Some("image/dds".into()))))
        }
    }

    fn first_tile(layer: &TiledImageLayer) -> Arc<GpuTextureTile> {
        let level = Arc::clone(layer.levels().first_level());
        let sector = Sector::from_degrees(-90.0, -54.0, -180.0, -144.0);
        Arc::new(GpuTextureTile::new(sector, level, 0, 0).unwrap())
    }

    fn claim(layer: &TiledImageLayer, tile: &GpuTextureTile) -> InFlightGuard {
        layer.core().begin_request(tile.key()).unwrap()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cached_file_is_published() {
        let (_dir, env) = test_env();
        let layer = TiledImageLayer::new(Arc::clone(&env), layer_params()).unwrap();
        let mut events = layer.subscribe();
        let tile = first_tile(&layer);
        env.file_store().write_atomic(&tile.path(), b"texture").unwrap();

        layer.core().load_tile(Arc::clone(&tile), claim(&layer, &tile)).await;
        assert!(tile.is_texture_in_memory());
        assert!(matches!(events.try_recv(), Ok(LayerEvent::TextureLoaded(k)) if &k == tile.key()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_corrupt_file_is_deleted_and_retrieved() {
        let (_dir, env) = test_env();
        let factory = Arc::new(CountingFactory::default());
        let mut params = layer_params();
        params.retriever_factory_local = Some(factory.clone());
        let layer = TiledImageLayer::new(Arc::clone(&env), params).unwrap();
        let tile = first_tile(&layer);
        // An empty file fails to decode.
        env.file_store().write_atomic(&tile.path(), b"").unwrap();

        layer.core().load_tile(Arc::clone(&tile), claim(&layer, &tile)).await;
        assert!(!tile.is_texture_in_memory());
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
        let store = env.file_store().clone();
        let path = tile.path();
        wait_for(|| store.file_size(&path) == Some(32)).await;
        let core = Arc::clone(layer.core());
        wait_for(|| !core.is_in_flight(tile.key())).await;
    }

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let (_dir, env) = test_env();
        let layer = TiledImageLayer::new(env, layer_params()).unwrap();
        let tile = first_tile(&layer);
        let core = layer.core();

        let first = claim(&layer, &tile);
        assert!(core.is_in_flight(tile.key()));
        assert!(core.begin_request(tile.key()).is_none());
        assert_eq!(core.in_flight_count(), 1);

        drop(first);
        assert!(!core.is_in_flight(tile.key()));
        assert!(core.begin_request(tile.key()).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_claim_released_when_retrieval_unavailable() {
        let (_dir, env) = test_env();
        let layer = TiledImageLayer::new(Arc::clone(&env), layer_params()).unwrap();
        let tile = first_tile(&layer);

        // No service URL and no local factory: nothing to retrieve from.
        layer.core().load_tile(Arc::clone(&tile), claim(&layer, &tile)).await;
        assert!(!layer.core().is_in_flight(tile.key()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_expired_file_removed_before_refetch() {
        let (_dir, env) = test_env();
        let factory = Arc::new(CountingFactory::default());
        let mut params = layer_params();
        params.retriever_factory_local = Some(factory.clone());
        let layer = TiledImageLayer::new(Arc::clone(&env), params).unwrap();
        let tile = first_tile(&layer);
        let file = env.file_store().write_atomic(&tile.path(), b"old").unwrap();

        std::thread::sleep(Duration::from_millis(20));
        layer.set_expiry_time(now_millis());
        std::thread::sleep(Duration::from_millis(5));

        layer.core().load_tile(Arc::clone(&tile), claim(&layer, &tile)).await;
        assert!(!tile.is_texture_in_memory());
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
        // The stale three-byte file is replaced by the fresh retrieval.
        let store = env.file_store().clone();
        let path = tile.path();
        wait_for(|| store.file_size(&path) == Some(32)).await;
        assert!(file.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_offline_marks_absent_without_retrieval() {
        let (_dir, env) = test_env();
        let mut params = layer_params();
        params.service_url = Some("https://tiles.example.com/{level}/{row}/{col}.dds".into());
        let layer = TiledImageLayer::new(Arc::clone(&env), params).unwrap();
        env.network_status().set_offline_mode(true);

        let tile = first_tile(&layer);
        for _ in 0..3 {
            layer.core().load_tile(Arc::clone(&tile), claim(&layer, &tile)).await;
        }
        assert!(layer.levels().is_resource_absent(tile.key()));
        assert_eq!(env.remote_retrieval_service().pending_count(), 0);
    }

    #[test]
    fn test_post_processor_outcomes() {
        let (_dir, env) = test_env();
        let layer = TiledImageLayer::new(Arc::clone(&env), layer_params()).unwrap();
        let mut events = layer.subscribe();
        let tile = first_tile(&layer);
        let post = DownloadPostProcessor::new(
            Arc::clone(layer.core()),
            Arc::clone(&tile),
            env.file_store().clone(),
        );
        let attempts = || layer.levels().absent_resources().attempts(tile.key());

        let page = RetrievedContent::new(Some("text/xml".into()), b"<ServiceException/>".to_vec());
        assert!(matches!(post.process(Ok(page)), Err(Error::TextContent { .. })));
        assert_eq!(attempts(), 1);

        assert!(post.process(Ok(RetrievedContent::default())).is_err());
        assert!(post.process(Err(Error::Cancelled)).is_err());
        assert_eq!(attempts(), 3);
        assert!(env.file_store().find(&tile.path()).is_none());

        let image = RetrievedContent::new(Some("image/dds".into()), vec![1; 8]);
        assert_eq!(post.process(Ok(image)).unwrap(), 8);
        assert_eq!(attempts(), 0);
        assert!(env.file_store().find(&tile.path()).is_some());
        assert!(matches!(events.try_recv(), Ok(LayerEvent::DataStored(_))));
    }
}
