//! Tiled image layers.
//!
//! A [`TiledImageLayer`] walks its level pyramid once per frame, choosing
//! the tiles fine enough for the view and queueing loads for those without
//! a resident texture. Tiles still loading are drawn with the texture of the
//! nearest resident ancestor.
//!
//! Loading and retrieval run off the render thread on the environment's
//! services; see [`LayerCore`]. Bulk prefetching and periodic resource
//! retrieval each run on a dedicated thread.

mod bulk;
mod loader;
mod resources;

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::cache::FileStore;
use crate::config::{DEFAULT_DETAIL_HINT_ORIGIN, LayerParams};
use crate::env::Environment;
use crate::error::Result;
use crate::geom::{DrawContext, Sector};
use crate::level::{Level, LevelSet};
use crate::queue::{RequestQueue, RequestTask};
use crate::texture::{RawTextureFactory, TextureFactory};
use crate::tile::{GpuTextureTile, TileKey, create_tiles_for_level};

pub use bulk::{
    BulkProgress, BulkRetrievalEvent, BulkRetrievalHandle, BulkRetrievalListener,
    BulkRetrievalOptions,
};
pub use loader::{DownloadPostProcessor, LayerCore};
pub use resources::{
    DEFAULT_RESOURCE_RETRIEVAL_PERIOD, ResourceFuture, ResourceInitializer, ResourceTask,
    RetrievalState,
};

/// Name used when the configuration has no display name.
const DEFAULT_LAYER_NAME: &str = "Tiled Image Layer";

/// Mutable, user-facing settings of a layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerProperties {
    pub name: String,
    pub enabled: bool,
    pub opacity: f64,
    /// Lowest eye altitude, in meters, at which the layer draws.
    pub min_active_altitude: f64,
    /// Highest eye altitude, in meters, at which the layer draws.
    pub max_active_altitude: f64,
    /// Added to `detail_hint_origin` to form the subdivision exponent.
    pub detail_hint: f64,
    pub detail_hint_origin: f64,
    pub network_retrieval_enabled: bool,
    /// Milliseconds since the epoch; zero means no expiry.
    pub expiry_time: i64,
}

impl LayerProperties {
    fn from_params(params: &LayerParams) -> Self {
        Self {
            name: params
                .display_name
                .clone()
                .unwrap_or_else(|| DEFAULT_LAYER_NAME.to_string()),
            enabled: true,
            opacity: params.opacity.unwrap_or(1.0),
            min_active_altitude: params.min_active_altitude.unwrap_or(-f64::MAX),
            max_active_altitude: params.max_active_altitude.unwrap_or(f64::MAX),
            detail_hint: params.detail_hint.unwrap_or(0.0),
            detail_hint_origin: DEFAULT_DETAIL_HINT_ORIGIN,
            network_retrieval_enabled: params.network_retrieval_enabled.unwrap_or(true),
            expiry_time: params.expiry_time.unwrap_or(0),
        }
    }

    /// Exponent handed to [`GpuTextureTile::must_subdivide`].
    #[must_use]
    pub fn detail_factor(&self) -> f64 {
        self.detail_hint_origin + self.detail_hint
    }
}

/// Change notifications published by a layer.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerEvent {
    /// A tile's texture became resident.
    TextureLoaded(TileKey),
    /// Retrieved tile data was written to a file store.
    DataStored(TileKey),
    /// The layer's auxiliary resources were retrieved.
    ResourcesRetrieved,
}

/// Draws the tiles a layer selected.
pub trait SurfaceTileRenderer {
    /// Tiles without a resident texture carry a fallback tile whose texture
    /// covers them.
    fn render_tiles(&self, dc: &DrawContext<'_>, tiles: &[Arc<GpuTextureTile>], opacity: f64);
}

/// A layer of imagery tiled over a level pyramid.
pub struct TiledImageLayer {
    core: Arc<LayerCore>,
    top_level_tiles: Vec<Arc<GpuTextureTile>>,
    current_tiles: Vec<Arc<GpuTextureTile>>,
    current_ancestor: Option<Arc<GpuTextureTile>>,
    request_queue: RequestQueue,
    resource_initializer: Option<ResourceInitializer>,
}

impl TiledImageLayer {
    /// Build a layer from a parameter record.
    ///
    /// Starts periodic resource retrieval when `RetrievePropertiesFromService`
    /// is set.
    pub fn new(env: Arc<Environment>, params: LayerParams) -> Result<Self> {
        let params = params.with_fallbacks();
        let levels = LevelSet::from_params(&params)?;
        let properties = LayerProperties::from_params(&params);
        let texture_factory: Arc<dyn TextureFactory> = match &params.gpu_texture_factory {
            Some(factory) => Arc::clone(factory),
            None => Arc::new(RawTextureFactory),
        };
        if let Some(capacity) = params.gpu_texture_tile_cache_size {
            env.ensure_tile_cache_capacity(capacity);
        }
        let retrieve_resources = params.retrieve_properties_from_service.unwrap_or(false);

        tracing::debug!(
            layer = %properties.name,
            levels = levels.num_levels(),
            sector = ?levels.sector(),
            "creating tiled image layer"
        );
        let core = Arc::new(LayerCore::new(env, params, levels, properties, texture_factory));
        let mut layer = Self {
            core,
            top_level_tiles: Vec::new(),
            current_tiles: Vec::new(),
            current_ancestor: None,
            request_queue: RequestQueue::new(),
            resource_initializer: None,
        };
        if retrieve_resources {
            layer.start_resource_retrieval()?;
        }
        Ok(layer)
    }

    /// The half of the layer shared with worker tasks.
    #[must_use]
    pub fn core(&self) -> &Arc<LayerCore> {
        &self.core
    }

    #[must_use]
    pub fn levels(&self) -> &LevelSet {
        &self.core.levels
    }

    /// The parameter record the layer was built from, fallbacks applied.
    #[must_use]
    pub fn construction_params(&self) -> &LayerParams {
        &self.core.params
    }

    #[must_use]
    pub fn properties(&self) -> LayerProperties {
        self.core.properties()
    }

    fn update_properties(&self, update: impl FnOnce(&mut LayerProperties)) {
        update(
            &mut self
                .core
                .properties
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.properties().name
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.update_properties(|p| p.name = name);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.properties().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.update_properties(|p| p.enabled = enabled);
    }

    #[must_use]
    pub fn opacity(&self) -> f64 {
        self.properties().opacity
    }

    pub fn set_opacity(&self, opacity: f64) {
        self.update_properties(|p| p.opacity = opacity);
    }

    pub fn set_active_altitudes(&self, min_active_altitude: f64, max_active_altitude: f64) {
        self.update_properties(|p| {
            p.min_active_altitude = min_active_altitude;
            p.max_active_altitude = max_active_altitude;
        });
    }

    #[must_use]
    pub fn detail_hint(&self) -> f64 {
        self.properties().detail_hint
    }

    /// Positive values select finer tiles at a given altitude, negative
    /// values coarser ones.
    pub fn set_detail_hint(&self, detail_hint: f64) {
        self.update_properties(|p| p.detail_hint = detail_hint);
    }

    #[must_use]
    pub fn is_network_retrieval_enabled(&self) -> bool {
        self.properties().network_retrieval_enabled
    }

    pub fn set_network_retrieval_enabled(&self, enabled: bool) {
        self.update_properties(|p| p.network_retrieval_enabled = enabled);
    }

    #[must_use]
    pub fn expiry_time(&self) -> i64 {
        self.properties().expiry_time
    }

    /// Treat tiles stored or loaded before `expiry_time` (ms since the epoch)
    /// as stale. Levels are updated too when the value is positive.
    pub fn set_expiry_time(&self, expiry_time: i64) {
        self.update_properties(|p| p.expiry_time = expiry_time);
        self.core.levels.set_expiry_time(expiry_time);
    }

    /// Receive texture and data notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LayerEvent> {
        self.core.events.subscribe()
    }

    /// The capabilities document, once resource retrieval has succeeded.
    #[must_use]
    pub fn capabilities(&self) -> Option<String> {
        self.core
            .capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn request_queue(&self) -> &RequestQueue {
        &self.request_queue
    }

    #[must_use]
    pub fn top_level_tiles(&self) -> &[Arc<GpuTextureTile>] {
        &self.top_level_tiles
    }

    /// Tiles with a load or retrieval queued or running.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.core.in_flight_count()
    }

    /// Tiles chosen by the last [`select`](Self::select).
    #[must_use]
    pub fn current_tiles(&self) -> &[Arc<GpuTextureTile>] {
        &self.current_tiles
    }

    /// Whether the eye altitude is within the layer's active range.
    #[must_use]
    pub fn is_layer_active(&self, dc: &DrawContext<'_>) -> bool {
        let properties = self.core.properties();
        let altitude = dc.eye_altitude();
        altitude >= properties.min_active_altitude && altitude <= properties.max_active_altitude
    }

    /// Whether the layer's sector overlaps the visible sector. An unknown
    /// visible sector counts as overlapping.
    #[must_use]
    pub fn is_layer_in_view(&self, dc: &DrawContext<'_>) -> bool {
        dc.visible_sector
            .is_none_or(|visible| visible.intersects(&self.core.levels.sector()))
    }

    /// Choose this frame's tiles and queue loads for those not resident.
    pub fn select(&mut self, dc: &DrawContext<'_>) -> &[Arc<GpuTextureTile>] {
        self.current_tiles.clear();
        // A frame starts with no pending requests.
        self.request_queue.clear();

        if !self.is_layer_in_view(dc) {
            return &self.current_tiles;
        }
        if self.top_level_tiles.is_empty() {
            self.create_top_level_tiles();
        }

        let detail_factor = self.core.properties().detail_factor();
        let top_level_tiles = std::mem::take(&mut self.top_level_tiles);
        for tile in &top_level_tiles {
            self.current_ancestor = None;
            if is_tile_visible(dc, tile) {
                self.add_tile_or_descendants(dc, detail_factor, tile);
            }
        }
        self.top_level_tiles = top_level_tiles;
        self.current_ancestor = None;

        &self.current_tiles
    }

    /// Select, draw and dispatch this frame's loads.
    pub fn render(&mut self, dc: &DrawContext<'_>, renderer: &dyn SurfaceTileRenderer) {
        let properties = self.core.properties();
        if !properties.enabled || !self.is_layer_active(dc) {
            return;
        }

        self.select(dc);
        if !self.current_tiles.is_empty() {
            renderer.render_tiles(dc, &self.current_tiles, properties.opacity);
            self.check_texture_expiration(dc);
        }

        self.send_requests();
        self.request_queue.clear();
        self.current_tiles.clear();
    }

    fn create_top_level_tiles(&mut self) {
        let levels = &self.core.levels;
        let Some(level) = levels.first_non_empty_level() else {
            tracing::warn!(layer = %self.core.properties().name, "every level is empty");
            return;
        };
        match create_tiles_for_level(level, &levels.sector(), levels.tile_origin()) {
            Ok(tiles) => {
                tracing::debug!(
                    level = level.level_number(),
                    count = tiles.len(),
                    "created top-level tiles"
                );
                self.top_level_tiles = tiles;
            }
            Err(e) => tracing::error!(error = %e, "failed to create top-level tiles"),
        }
    }

    fn is_top_level(&self, tile: &GpuTextureTile) -> bool {
        self.core
            .levels
            .first_non_empty_level()
            .is_some_and(|level| level.level_number() == tile.level_number())
    }

    fn meets_render_criteria(
        &self,
        dc: &DrawContext<'_>,
        detail_factor: f64,
        tile: &GpuTextureTile,
    ) -> bool {
        self.core.levels.is_final_level(tile.level_number())
            || !tile.must_subdivide(dc, detail_factor)
    }

    fn add_tile_or_descendants(
        &mut self,
        dc: &DrawContext<'_>,
        detail_factor: f64,
        tile: &Arc<GpuTextureTile>,
    ) {
        tile.update_extent(dc);
        if self.meets_render_criteria(dc, detail_factor, tile) {
            self.add_tile(dc, tile);
            return;
        }

        let saved_ancestor = self.current_ancestor.clone();
        if tile.is_texture_in_memory() || self.is_top_level(tile) {
            self.current_ancestor = Some(Arc::clone(tile));
        }

        let next_level: Option<Arc<Level>> =
            self.core.levels.get_level(tile.level_number() + 1).cloned();
        if let Some(next_level) = next_level {
            match tile.subdivide(&next_level, self.core.env.tile_cache()) {
                Ok(children) => {
                    let layer_sector = self.core.levels.sector();
                    for child in &children {
                        if child.sector().intersects(&layer_sector) && is_tile_visible(dc, child) {
                            self.add_tile_or_descendants(dc, detail_factor, child);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(tile = %tile.key(), error = %e, "failed to subdivide tile");
                }
            }
        }

        self.current_ancestor = saved_ancestor;
    }

    fn add_tile(&mut self, dc: &DrawContext<'_>, tile: &Arc<GpuTextureTile>) {
        tile.set_fallback_tile(None);
        let core = Arc::clone(&self.core);
        let levels = &core.levels;
        if levels.is_level_empty(tile.level_number()) {
            return;
        }

        if tile.is_texture_in_memory() {
            self.current_tiles.push(Arc::clone(tile));
            return;
        }

        if !levels.is_resource_absent(tile.key()) {
            self.request_texture(dc, tile);
        }

        let Some(ancestor) = self.current_ancestor.clone() else {
            return;
        };
        if ancestor.is_texture_in_memory() {
            tile.set_fallback_tile(Some(&ancestor));
            self.current_tiles.push(Arc::clone(tile));
        } else if self.is_top_level(&ancestor) && !levels.is_resource_absent(ancestor.key()) {
            self.request_texture(dc, &ancestor);
        }
    }

    /// Queue a load unless one is already queued or running for the tile.
    fn request_texture(&mut self, dc: &DrawContext<'_>, tile: &Arc<GpuTextureTile>) {
        if self.core.is_in_flight(tile.key()) {
            return;
        }
        let priority = tile.distance_squared_to(dc.view.eye_point());
        tile.set_priority(priority);
        self.request_queue.add(RequestTask::new(Arc::clone(tile), priority));
    }

    /// Queue reloads for drawn tiles whose textures predate the expiry time.
    fn check_texture_expiration(&mut self, dc: &DrawContext<'_>) {
        let tiles = std::mem::take(&mut self.current_tiles);
        for tile in &tiles {
            if tile.is_texture_expired(self.core.expiry_time_for(tile)) {
                tracing::debug!(tile = %tile.key(), "texture expired");
                self.request_texture(dc, tile);
            }
        }
        self.current_tiles = tiles;
    }

    /// Hand queued loads to the task service, best first, until it is full.
    /// Whatever remains is dropped.
    fn send_requests(&mut self) {
        let service = self.core.env.task_service();
        let mut sent = 0usize;
        while !service.is_full() {
            let Some(request) = self.request_queue.poll() else {
                break;
            };
            let Some(claim) = self.core.begin_request(request.tile.key()) else {
                continue;
            };
            let task = self.core.request_task(request.tile, claim);
            if !service.run_task(request.priority, task) {
                break;
            }
            sent += 1;
        }
        if sent > 0 || !self.request_queue.is_empty() {
            tracing::debug!(sent, dropped = self.request_queue.len(), "sent tile requests");
        }
    }

    /// (Re)start periodic retrieval of the layer's resources.
    pub fn start_resource_retrieval(&mut self) -> Result<()> {
        self.start_resource_retrieval_every(DEFAULT_RESOURCE_RETRIEVAL_PERIOD)
    }

    pub fn start_resource_retrieval_every(&mut self, period: Duration) -> Result<()> {
        if let Some(previous) = self.resource_initializer.take() {
            previous.shutdown();
        }

        let core = Arc::clone(&self.core);
        let task: ResourceTask = Arc::new(move || -> ResourceFuture {
            Box::pin(Arc::clone(&core).retrieve_resources())
        });
        self.resource_initializer = Some(ResourceInitializer::start(
            self.core.properties().name,
            self.core.env.runtime().clone(),
            period,
            task,
        )?);
        Ok(())
    }

    #[must_use]
    pub fn resource_initializer(&self) -> Option<&ResourceInitializer> {
        self.resource_initializer.as_ref()
    }

    /// Stop resource retrieval, interrupting an attempt in progress.
    pub fn dispose(&mut self) {
        if let Some(initializer) = self.resource_initializer.take() {
            initializer.shutdown_now();
        }
    }

    /// Level whose texel size best matches `resolution` in radians per texel.
    #[must_use]
    pub fn compute_level_for_resolution(&self, resolution: f64) -> &Arc<Level> {
        self.core.compute_level_for_resolution(resolution)
    }

    #[must_use]
    pub fn count_images_in_sector(&self, sector: &Sector, level_number: u32) -> u64 {
        self.core.count_images_in_sector(sector, level_number)
    }

    /// Tiles of a level covering `sector`, created lazily.
    pub fn tiles_in_sector(
        &self,
        sector: &Sector,
        level_number: u32,
    ) -> impl Iterator<Item = Result<Arc<GpuTextureTile>>> + use<> {
        self.core.get_tiles_in_sector(sector, level_number)
    }

    /// Retrieve every missing tile of `sector` at `resolution` on a
    /// background thread.
    ///
    /// Returns `Ok(None)` when the sector misses the layer. The file store
    /// defaults to the environment's.
    pub fn prefetch(
        &self,
        sector: &Sector,
        resolution: f64,
        file_store: Option<FileStore>,
        listener: Option<Arc<dyn BulkRetrievalListener>>,
    ) -> Result<Option<BulkRetrievalHandle>> {
        let options = BulkRetrievalOptions::default();
        self.prefetch_with_options(sector, resolution, file_store, listener, options)
    }

    pub fn prefetch_with_options(
        &self,
        sector: &Sector,
        resolution: f64,
        file_store: Option<FileStore>,
        listener: Option<Arc<dyn BulkRetrievalListener>>,
        options: BulkRetrievalOptions,
    ) -> Result<Option<BulkRetrievalHandle>> {
        let file_store = file_store.unwrap_or_else(|| self.core.env.file_store().clone());
        self.core.prefetch(sector, resolution, file_store, listener, options)
    }

    /// Estimate the bytes a [`prefetch`](Self::prefetch) would download.
    pub fn estimate_missing_bytes(
        &self,
        sector: &Sector,
        resolution: f64,
        file_store: Option<&FileStore>,
    ) -> Result<u64> {
        let file_store = file_store.unwrap_or_else(|| self.core.env.file_store());
        self.core.estimate_missing_bytes(sector, resolution, file_store)
    }
}

impl std::fmt::Debug for TiledImageLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiledImageLayer")
            .field("core", &self.core)
            .field("top_level_tiles", &self.top_level_tiles.len())
            .field("current_tiles", &self.current_tiles.len())
            .field("request_queue", &self.request_queue.len())
            .finish_non_exhaustive()
    }
}

/// Visible-sector and frustum test for one tile.
fn is_tile_visible(dc: &DrawContext<'_>, tile: &GpuTextureTile) -> bool {
    let extent = tile.update_extent(dc);
    dc.visible_sector
        .is_none_or(|visible| tile.sector().intersects(&visible))
        && dc.view.intersects_frustum(&extent)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::geom::{Extent, Globe, SphericalGlobe, View};
    use crate::retrieve::{
        LocalRetrievalRequest, RetrieveFuture, RetrievedContent, Retriever, RetrieverFactory,
    };
    use crate::texture::TextureData;
    use crate::tile::now_millis;
    use glam::DVec3;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, OnceLock};
    use std::time::{Instant, SystemTime, UNIX_EPOCH};
    use tokio::runtime::Handle;

    pub(crate) fn layer_params() -> LayerParams {
        LayerParams {
            display_name: Some("Test".to_string()),
            sector: Some(Sector::FULL_SPHERE),
            ..LayerParams::default()
        }
    }

    /// An environment on the current runtime, or on a shared one outside
    /// async tests.
    pub(crate) fn test_env() -> (tempfile::TempDir, Arc<Environment>) {
        static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let handle = Handle::try_current().unwrap_or_else(|_| {
            RUNTIME
                .get_or_init(|| {
                    tokio::runtime::Builder::new_multi_thread()
                        .worker_threads(2)
                        .enable_all()
                        .build()
                        .unwrap()
                })
                .handle()
                .clone()
        });
        let dir = tempfile::tempdir().unwrap();
        let http = reqwest::Client::builder().no_proxy().build().unwrap();
        let env = Environment::new(handle, FileStore::new(dir.path())).with_http_client(http);
        (dir, Arc::new(env))
    }

    /// Sees everything from `eye`.
    struct OpenView {
        eye: DVec3,
    }

    impl View for OpenView {
        fn eye_point(&self) -> DVec3 {
            self.eye
        }

        fn intersects_frustum(&self, _extent: &Extent) -> bool {
            true
        }
    }

    fn view_above_origin(globe: &SphericalGlobe, altitude: f64) -> OpenView {
        OpenView {
            eye: globe.compute_point(0.0, 0.0, altitude),
        }
    }

    fn two_level_params() -> LayerParams {
        LayerParams {
            num_levels: Some(2),
            ..layer_params()
        }
    }

    fn has_texture(tile: &GpuTextureTile) -> bool {
        tile.is_texture_in_memory()
            || tile
                .fallback_tile()
                .is_some_and(|f| f.is_texture_in_memory())
    }

    fn make_resident(tiles: &[Arc<GpuTextureTile>]) {
        for tile in tiles {
            tile.set_texture_data(Some(Arc::new(TextureData::new(vec![1; 4]))));
        }
    }

    #[derive(Default)]
    struct CountingRenderer {
        frames: Mutex<Vec<usize>>,
    }

    impl SurfaceTileRenderer for CountingRenderer {
        fn render_tiles(
            &self,
            _dc: &DrawContext<'_>,
            tiles: &[Arc<GpuTextureTile>],
            _opacity: f64,
        ) {
            self.frames.lock().unwrap().push(tiles.len());
        }
    }

    struct Payload;

    impl Retriever for Payload {
        fn name(&self) -> &str {
            "payload"
        }

        fn retrieve(&self) -> RetrieveFuture<'_> {
            Box::pin(async { Ok(RetrievedContent::new(Some("image/dds".into()), vec![3; 16])) })
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        calls: AtomicUsize,
    }

    impl RetrieverFactory for CountingFactory {
        fn create_retriever(&self, _request: &LocalRetrievalRequest) -> Option<Arc<dyn Retriever>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(Arc::new(Payload))
        }
    }

    struct SlowPayload;

    impl Retriever for SlowPayload {
        fn name(&self) -> &str {
            "slow"
        }

        fn retrieve(&self) -> RetrieveFuture<'_> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(RetrievedContent::new(Some("image/dds".into()), vec![3; 16]))
            })
        }
    }

    #[derive(Default)]
    struct SlowFactory {
        calls: AtomicUsize,
    }

    impl RetrieverFactory for SlowFactory {
        fn create_retriever(&self, _request: &LocalRetrievalRequest) -> Option<Arc<dyn Retriever>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(Arc::new(SlowPayload))
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_properties_from_params() {
        let (_dir, env) = test_env();
        let params = LayerParams {
            opacity: Some(0.5),
            detail_hint: Some(0.3),
            network_retrieval_enabled: Some(false),
            ..layer_params()
        };
        let layer = TiledImageLayer::new(env, params).unwrap();
        let properties = layer.properties();
        assert_eq!(properties.name, "Test");
        assert_eq!(properties.opacity, 0.5);
        assert!(!properties.network_retrieval_enabled);
        assert!((properties.detail_factor() - 3.1).abs() < 1e-12);
        assert_eq!(layer.construction_params().num_levels, Some(19));
    }

    #[test]
    fn test_missing_sector_is_rejected() {
        let (_dir, env) = test_env();
        let params = LayerParams {
            sector: None,
            ..layer_params()
        };
        assert!(matches!(
            TiledImageLayer::new(env, params),
            Err(crate::Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_far_view_selects_top_level_tiles() {
        let (_dir, env) = test_env();
        let mut layer = TiledImageLayer::new(env, two_level_params()).unwrap();
        let globe = SphericalGlobe::earth();
        let view = view_above_origin(&globe, 1e8);
        let dc = DrawContext::new(&globe, &view);

        // Nothing resident yet: every top-level tile is requested, none drawn.
        assert!(layer.select(&dc).is_empty());
        assert_eq!(layer.top_level_tiles().len(), 50);
        assert_eq!(layer.request_queue().len(), 50);

        make_resident(layer.top_level_tiles());
        let selected = layer.select(&dc);
        assert_eq!(selected.len(), 50);
        assert!(selected.iter().all(|t| t.level_number() == 0));
        assert!(layer.request_queue().is_empty());
    }

    #[test]
    fn test_near_view_subdivides_with_fallback() {
        let (_dir, env) = test_env();
        let mut layer = TiledImageLayer::new(env, two_level_params()).unwrap();
        let globe = SphericalGlobe::earth();
        let view = view_above_origin(&globe, 1e5);
        let dc = DrawContext::new(&globe, &view);

        layer.select(&dc);
        make_resident(layer.top_level_tiles());
        let selected = layer.select(&dc).to_vec();

        let children: Vec<_> = selected.iter().filter(|t| t.level_number() == 1).collect();
        assert!(!children.is_empty());
        for tile in &selected {
            assert!(has_texture(tile), "{} has nothing to draw", tile.key());
        }
        for child in &children {
            let parent = child.fallback_tile().unwrap();
            assert_eq!(parent.level_number(), 0);
            assert_eq!((parent.row(), parent.column()), (child.row() / 2, child.column() / 2));
        }
        assert_eq!(layer.request_queue().len(), children.len());
    }

    #[test]
    fn test_evicted_ancestor_still_backs_selected_tiles() {
        let (_dir, env) = test_env();
        let params = LayerParams {
            num_levels: Some(3),
            ..layer_params()
        };
        let mut layer = TiledImageLayer::new(Arc::clone(&env), params).unwrap();
        let globe = SphericalGlobe::earth();
        let view = view_above_origin(&globe, 1e4);
        let dc = DrawContext::new(&globe, &view);

        layer.select(&dc);
        make_resident(layer.top_level_tiles());
        layer.select(&dc);
        let ancestor_key = TileKey::new(1, 4, 10, "Test");
        let ancestor = env.tile_cache().get(&ancestor_key).unwrap();
        make_resident(std::slice::from_ref(&ancestor));
        drop(ancestor);

        let with_level_one_fallback = |tiles: &[Arc<GpuTextureTile>]| {
            tiles
                .iter()
                .filter(|t| t.fallback_tile().is_some_and(|f| f.key() == &ancestor_key))
                .count()
        };
        layer.select(&dc);
        let before = with_level_one_fallback(layer.current_tiles());
        assert!(before > 0);

        env.tile_cache().set_capacity(0);
        assert!(!env.tile_cache().contains(&ancestor_key));
        let selected = layer.current_tiles();
        assert_eq!(with_level_one_fallback(selected), before);
        for tile in selected {
            assert!(has_texture(tile), "{} has nothing to draw", tile.key());
        }
    }

    #[test]
    fn test_fallback_cleared_when_ancestor_unloaded() {
        let (_dir, env) = test_env();
        let mut layer = TiledImageLayer::new(env, two_level_params()).unwrap();
        let globe = SphericalGlobe::earth();
        let view = view_above_origin(&globe, 1e5);
        let dc = DrawContext::new(&globe, &view);

        layer.select(&dc);
        make_resident(layer.top_level_tiles());
        let children: Vec<_> = layer
            .select(&dc)
            .iter()
            .filter(|t| t.level_number() == 1)
            .cloned()
            .collect();
        assert!(children.iter().all(|c| c.fallback_tile().is_some()));

        for tile in layer.top_level_tiles() {
            tile.set_texture_data(None);
        }
        assert!(layer.select(&dc).is_empty());
        assert!(children.iter().all(|c| c.fallback_tile().is_none()));
    }

    #[test]
    fn test_subdivided_top_level_tile_requested_without_texture() {
        let (_dir, env) = test_env();
        let mut layer = TiledImageLayer::new(env, two_level_params()).unwrap();
        let globe = SphericalGlobe::earth();
        let view = view_above_origin(&globe, 1e5);
        let dc = DrawContext::new(&globe, &view);

        assert!(layer.select(&dc).is_empty());
        let queue = layer.request_queue();
        assert!(queue.contains(&TileKey::new(0, 2, 5, "Test")));
        assert!(queue.contains(&TileKey::new(1, 4, 10, "Test")));
    }

    #[test]
    fn test_children_are_shared_through_tile_cache() {
        let (_dir, env) = test_env();
        let mut layer = TiledImageLayer::new(Arc::clone(&env), two_level_params()).unwrap();
        let globe = SphericalGlobe::earth();
        let view = view_above_origin(&globe, 1e5);
        let dc = DrawContext::new(&globe, &view);

        layer.select(&dc);
        let key = TileKey::new(1, 4, 10, "Test");
        let cached = env.tile_cache().get(&key).unwrap();
        make_resident(layer.top_level_tiles());
        let selected = layer.select(&dc).to_vec();
        assert!(selected.iter().any(|t| Arc::ptr_eq(t, &cached)));
    }

    #[test]
    fn test_absent_tile_not_requested_until_cool_down() {
        let (_dir, env) = test_env();
        let params = LayerParams {
            num_levels: Some(1),
            ..layer_params()
        };
        let mut layer = TiledImageLayer::new(env, params).unwrap();
        let globe = SphericalGlobe::earth();
        let view = view_above_origin(&globe, 1e8);
        let dc = DrawContext::new(&globe, &view);

        layer.select(&dc);
        let key = layer.top_level_tiles()[0].key().clone();
        let core = Arc::clone(layer.core());
        let absent = core.levels.absent_resources();
        let t0 = Instant::now();
        for _ in 0..3 {
            absent.mark_resource_absent_at(key.clone(), t0);
        }

        layer.select(&dc);
        assert!(!layer.request_queue().contains(&key));
        assert_eq!(layer.request_queue().len(), 49);
        assert!(absent.is_resource_absent_at(&key, t0 + Duration::from_secs(60)));

        assert!(!absent.is_resource_absent_at(&key, t0 + Duration::from_secs(11 * 60)));
        layer.select(&dc);
        assert!(layer.request_queue().contains(&key));
        assert_eq!(layer.request_queue().len(), 50);
    }

    #[test]
    fn test_layer_outside_visible_sector_selects_nothing() {
        let (_dir, env) = test_env();
        let params = LayerParams {
            sector: Some(Sector::from_degrees(0.0, 36.0, 0.0, 36.0)),
            ..layer_params()
        };
        let mut layer = TiledImageLayer::new(env, params).unwrap();
        let globe = SphericalGlobe::earth();
        let view = view_above_origin(&globe, 1e8);
        let visible = Sector::from_degrees(-40.0, -10.0, -40.0, -10.0);
        let dc = DrawContext::new(&globe, &view).with_visible_sector(visible);

        assert!(layer.select(&dc).is_empty());
        assert!(layer.top_level_tiles().is_empty());
        assert!(layer.request_queue().is_empty());
    }

    #[test]
    fn test_inactive_or_disabled_layer_does_not_render() {
        let (_dir, env) = test_env();
        let mut layer = TiledImageLayer::new(env, layer_params()).unwrap();
        let globe = SphericalGlobe::earth();
        let view = view_above_origin(&globe, 1e8);
        let dc = DrawContext::new(&globe, &view);
        let renderer = CountingRenderer::default();

        layer.set_active_altitudes(0.0, 1e6);
        layer.render(&dc, &renderer);
        assert!(layer.top_level_tiles().is_empty());

        layer.set_active_altitudes(0.0, f64::MAX);
        layer.set_enabled(false);
        layer.render(&dc, &renderer);
        assert!(layer.top_level_tiles().is_empty());
        assert!(renderer.frames.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_render_loads_tiles_over_frames() {
        let (_dir, env) = test_env();
        let factory = Arc::new(CountingFactory::default());
        let params = LayerParams {
            num_levels: Some(1),
            retriever_factory_local: Some(factory.clone()),
            ..layer_params()
        };
        let mut layer = TiledImageLayer::new(Arc::clone(&env), params).unwrap();
        let globe = SphericalGlobe::earth();
        let view = view_above_origin(&globe, 1e8);
        let renderer = CountingRenderer::default();

        layer.render(&DrawContext::new(&globe, &view), &renderer);
        assert!(layer.request_queue().is_empty());
        assert!(layer.current_tiles().is_empty());
        let tiles = layer.top_level_tiles().to_vec();
        let store = env.file_store().clone();
        let core = Arc::clone(layer.core());
        wait_for(|| core.in_flight_count() == 0).await;
        assert!(tiles.iter().all(|t| store.contains(&t.path())));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 50);

        // Stored data is loaded on the next request.
        layer.render(&DrawContext::new(&globe, &view), &renderer);
        wait_for(|| tiles.iter().all(|t| t.is_texture_in_memory())).await;

        layer.render(&DrawContext::new(&globe, &view), &renderer);
        assert_eq!(renderer.frames.lock().unwrap().last(), Some(&50));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tiles_in_flight_are_not_requested_again() {
        let (_dir, env) = test_env();
        let factory = Arc::new(SlowFactory::default());
        let params = LayerParams {
            num_levels: Some(1),
            retriever_factory_local: Some(factory.clone()),
            ..layer_params()
        };
        let mut layer = TiledImageLayer::new(env, params).unwrap();
        let globe = SphericalGlobe::earth();
        let view = view_above_origin(&globe, 1e8);
        let renderer = CountingRenderer::default();

        for _ in 0..3 {
            layer.render(&DrawContext::new(&globe, &view), &renderer);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(layer.in_flight_count() > 0);

        let core = Arc::clone(layer.core());
        wait_for(|| core.in_flight_count() == 0).await;
        assert_eq!(factory.calls.load(Ordering::SeqCst), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_expired_textures_are_requested_again() {
        let (_dir, env) = test_env();
        let factory = Arc::new(CountingFactory::default());
        let params = LayerParams {
            num_levels: Some(1),
            retriever_factory_local: Some(factory.clone()),
            ..layer_params()
        };
        let mut layer = TiledImageLayer::new(env, params).unwrap();
        let globe = SphericalGlobe::earth();
        let view = view_above_origin(&globe, 1e8);
        let dc = DrawContext::new(&globe, &view);

        layer.select(&dc);
        let loaded_at = UNIX_EPOCH + Duration::from_secs(1);
        for tile in layer.top_level_tiles() {
            let texture = TextureData::with_loaded_at(vec![1; 4], loaded_at);
            tile.set_texture_data(Some(Arc::new(texture)));
        }
        assert!(loaded_at < SystemTime::now());

        layer.set_expiry_time(now_millis() - 1000);
        layer.render(&dc, &CountingRenderer::default());
        wait_for(|| factory.calls.load(Ordering::SeqCst) == 50).await;
    }

    #[test]
    fn test_set_expiry_time_updates_levels() {
        let (_dir, env) = test_env();
        let layer = TiledImageLayer::new(env, layer_params()).unwrap();
        layer.set_expiry_time(1234);
        assert_eq!(layer.expiry_time(), 1234);
        assert!(layer.levels().levels().iter().all(|l| l.expiry_time() == 1234));

        layer.set_expiry_time(0);
        assert_eq!(layer.expiry_time(), 0);
        assert!(layer.levels().levels().iter().all(|l| l.expiry_time() == 1234));
    }
}
