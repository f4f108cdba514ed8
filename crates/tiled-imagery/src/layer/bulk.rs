//! Bulk prefetching of every tile in a sector at a given resolution.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cache::FileStore;
use crate::error::{Error, Result};
use crate::geom::Sector;
use crate::layer::loader::{DownloadPostProcessor, LayerCore};
use crate::level::{
    Level, compute_column, compute_column_longitude, compute_row, compute_row_latitude,
};
use crate::retrieve::RetrievalPostProcessor;
use crate::tile::{GpuTextureTile, TileKey};

/// Tuning for a bulk retrieval.
#[derive(Debug, Clone, Copy)]
pub struct BulkRetrievalOptions {
    /// Tiles retrieved at once by one bulk task.
    pub max_concurrent: usize,
}

impl Default for BulkRetrievalOptions {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

/// Counters updated as a bulk retrieval proceeds.
#[derive(Debug, Default)]
pub struct BulkProgress {
    total_count: AtomicU64,
    current_count: AtomicU64,
    total_size: AtomicU64,
    current_size: AtomicU64,
}

impl BulkProgress {
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.total_count.load(Ordering::Relaxed)
    }

    /// Tiles handled so far, whether retrieved, skipped or failed.
    #[must_use]
    pub fn current_count(&self) -> u64 {
        self.current_count.load(Ordering::Relaxed)
    }

    /// Estimated bytes missing when the retrieval started.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    /// Bytes written so far.
    #[must_use]
    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    fn record(&self, bytes: u64) {
        self.current_count.fetch_add(1, Ordering::Relaxed);
        self.current_size.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Per-tile notifications from a bulk retrieval.
#[derive(Debug, Clone)]
pub enum BulkRetrievalEvent {
    Succeeded { key: TileKey, bytes: usize },
    Failed { key: TileKey, message: String },
}

pub trait BulkRetrievalListener: Send + Sync {
    fn on_event(&self, event: &BulkRetrievalEvent);
}

impl<F> BulkRetrievalListener for F
where
    F: Fn(&BulkRetrievalEvent) + Send + Sync,
{
    fn on_event(&self, event: &BulkRetrievalEvent) {
        self(event);
    }
}

/// Handle to a running bulk retrieval.
#[derive(Debug)]
pub struct BulkRetrievalHandle {
    sector: Sector,
    resolution: f64,
    progress: Arc<BulkProgress>,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl BulkRetrievalHandle {
    /// The requested sector clipped to the layer.
    #[must_use]
    pub fn sector(&self) -> Sector {
        self.sector
    }

    #[must_use]
    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    #[must_use]
    pub fn progress(&self) -> &Arc<BulkProgress> {
        &self.progress
    }

    /// Stop issuing new retrievals. Retrievals already started complete.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the retrieval thread to exit.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!(sector = ?self.sector, "bulk retrieval thread panicked");
        }
    }
}

/// Row and column range of a level's tiles over a sector, north-west to
/// south-east.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TileRange {
    pub nw_row: i32,
    pub nw_column: i32,
    pub se_row: i32,
    pub se_column: i32,
}

impl TileRange {
    fn new(level: &Level, sector: &Sector, origin: crate::geom::LatLon) -> Self {
        let delta = level.tile_delta();
        Self {
            nw_row: compute_row(delta.latitude, sector.max_latitude, origin.latitude),
            nw_column: compute_column(delta.longitude, sector.min_longitude, origin.longitude),
            se_row: compute_row(delta.latitude, sector.min_latitude, origin.latitude),
            se_column: compute_column(delta.longitude, sector.max_longitude, origin.longitude),
        }
    }

    #[allow(clippy::cast_sign_loss)]
    fn count(&self) -> u64 {
        let rows = i64::from(self.nw_row) - i64::from(self.se_row) + 1;
        let columns = i64::from(self.se_column) - i64::from(self.nw_column) + 1;
        (rows.max(0) * columns.max(0)) as u64
    }

    /// Rows north to south, columns west to east within each row.
    fn cells(self) -> impl Iterator<Item = (i32, i32)> {
        (self.se_row..=self.nw_row)
            .rev()
            .flat_map(move |row| (self.nw_column..=self.se_column).map(move |column| (row, column)))
    }
}

/// Stored files examined when estimating missing bytes.
const ESTIMATE_SAMPLE_SIZE: usize = 1024;

impl LayerCore {
    /// Level whose texel size best matches `resolution` (radians per texel).
    ///
    /// Picks the first non-empty level at least as fine as the resolution,
    /// then steps back one level if that level is closer.
    pub(crate) fn compute_level_for_resolution(&self, resolution: f64) -> &Arc<Level> {
        let levels = &self.levels;
        let mut target = levels.last_level();
        for level in levels.levels() {
            if level.is_empty() || level.texel_size() > resolution {
                continue;
            }
            target = level;
            break;
        }

        let number = target.level_number();
        if number > 0 && !levels.is_level_empty(number - 1) {
            if let Some(coarser) = levels.get_level(number - 1) {
                let d_coarser = (coarser.texel_size() - resolution).abs();
                let d_target = (target.texel_size() - resolution).abs();
                if d_coarser < d_target {
                    target = coarser;
                }
            }
        }
        target
    }

    /// First non-empty level at or after `level_number`, else the last level.
    fn level_at_or_after(&self, level_number: u32) -> &Arc<Level> {
        self.levels
            .levels()
            .iter()
            .skip(level_number as usize)
            .find(|level| !level.is_empty())
            .unwrap_or_else(|| self.levels.last_level())
    }

    pub(crate) fn count_images_in_sector(&self, sector: &Sector, level_number: u32) -> u64 {
        let level = self.level_at_or_after(level_number);
        TileRange::new(level, sector, self.levels.tile_origin()).count()
    }

    /// Every tile of a level overlapping `sector`, rows north to south and
    /// columns west to east. Tiles are created as the iterator advances.
    pub(crate) fn get_tiles_in_sector(
        &self,
        sector: &Sector,
        level_number: u32,
    ) -> impl Iterator<Item = Result<Arc<GpuTextureTile>>> + use<> {
        let level = Arc::clone(self.level_at_or_after(level_number));
        let origin = self.levels.tile_origin();
        let delta = level.tile_delta();
        let range = TileRange::new(&level, sector, origin);

        range.cells().map(move |(row, column)| {
            let min_latitude = compute_row_latitude(row, delta.latitude, origin.latitude);
            let min_longitude = compute_column_longitude(column, delta.longitude, origin.longitude);
            let tile_sector = Sector::from_degrees(
                min_latitude,
                min_latitude + delta.latitude,
                min_longitude,
                min_longitude + delta.longitude,
            );
            GpuTextureTile::new(tile_sector, Arc::clone(&level), row, column).map(Arc::new)
        })
    }

    /// Average stored tile size guessed from the image format.
    fn estimated_tile_size(&self, level: &Level) -> u64 {
        let pixels = u64::from(level.tile_width()) * u64::from(level.tile_height());
        if level.format_suffix().eq_ignore_ascii_case(".dds") {
            // DXT1 at four bits per pixel plus the header.
            pixels / 2 + 128
        } else {
            pixels * 3 / 10
        }
    }

    /// Bytes still needed to hold every tile of `sector` at `resolution`.
    ///
    /// Only the first tiles of the sector are looked up in `file_store`.
    /// For larger sectors the stored fraction and average size of that
    /// sample are scaled to the whole tile count.
    pub(crate) fn estimate_missing_bytes(
        &self,
        sector: &Sector,
        resolution: f64,
        file_store: &FileStore,
    ) -> Result<u64> {
        validate_resolution(resolution)?;
        let Some(target) = sector.intersection(&self.levels.sector()) else {
            return Ok(0);
        };
        let level = self.compute_level_for_resolution(resolution);
        let total = self.count_images_in_sector(&target, level.level_number());

        let mut sampled = 0u64;
        let mut stored_count = 0u64;
        let mut stored_size = 0u64;
        for tile in self
            .get_tiles_in_sector(&target, level.level_number())
            .take(ESTIMATE_SAMPLE_SIZE)
        {
            sampled += 1;
            if let Some(size) = file_store.file_size(&tile?.path()) {
                stored_count += 1;
                stored_size += size;
            }
        }
        if sampled == 0 {
            return Ok(0);
        }

        let average = if stored_count > 0 {
            stored_size / stored_count
        } else {
            self.estimated_tile_size(level)
        };
        let missing = u128::from(total) * u128::from(sampled - stored_count) / u128::from(sampled);
        Ok(u64::try_from(missing * u128::from(average)).unwrap_or(u64::MAX))
    }

    /// Start retrieving every missing tile of `sector` at `resolution` into
    /// `file_store` on a dedicated thread.
    pub(crate) fn prefetch(
        self: &Arc<Self>,
        sector: &Sector,
        resolution: f64,
        file_store: FileStore,
        listener: Option<Arc<dyn BulkRetrievalListener>>,
        options: BulkRetrievalOptions,
    ) -> Result<Option<BulkRetrievalHandle>> {
        validate_resolution(resolution)?;
        let Some(target) = sector.intersection(&self.levels.sector()) else {
            tracing::debug!(?sector, "prefetch sector does not intersect the layer");
            return Ok(None);
        };

        let level_number = self.compute_level_for_resolution(resolution).level_number();
        let progress = Arc::new(BulkProgress::default());
        progress
            .total_count
            .store(self.count_images_in_sector(&target, level_number), Ordering::Relaxed);

        let cancel = CancellationToken::new();
        let name = self.properties().name;
        let thread = std::thread::Builder::new()
            .name(format!("bulk retrieval {name}"))
            .spawn({
                let core = Arc::clone(self);
                let progress = Arc::clone(&progress);
                let cancel = cancel.clone();
                let runtime = self.env.runtime().clone();
                move || {
                    let job = BulkJob {
                        core,
                        sector: target,
                        resolution,
                        level_number,
                        file_store,
                        listener,
                        progress,
                        cancel,
                        max_concurrent: options.max_concurrent.max(1),
                    };
                    runtime.block_on(job.run());
                }
            })
            .map_err(|e| Error::Unavailable {
                what: format!("bulk retrieval thread: {e}"),
            })?;

        tracing::info!(
            layer = %name,
            sector = ?target,
            level = level_number,
            "bulk retrieval started"
        );
        Ok(Some(BulkRetrievalHandle {
            sector: target,
            resolution,
            progress,
            cancel,
            thread: Some(thread),
        }))
    }
}

fn validate_resolution(resolution: f64) -> Result<()> {
    if resolution.is_nan() || resolution < 0.0 {
        return Err(Error::invalid_argument(
            "generic.ResolutionInvalid",
            format!("resolution {resolution} must not be negative"),
        ));
    }
    Ok(())
}

struct BulkJob {
    core: Arc<LayerCore>,
    sector: Sector,
    resolution: f64,
    level_number: u32,
    file_store: FileStore,
    listener: Option<Arc<dyn BulkRetrievalListener>>,
    progress: Arc<BulkProgress>,
    cancel: CancellationToken,
    max_concurrent: usize,
}

impl BulkJob {
    async fn run(self) {
        match self
            .core
            .estimate_missing_bytes(&self.sector, self.resolution, &self.file_store)
        {
            Ok(bytes) => self.progress.total_size.store(bytes, Ordering::Relaxed),
            Err(e) => tracing::warn!(error = %e, "could not estimate bulk retrieval size"),
        }

        let budget = Arc::new(Semaphore::new(self.max_concurrent));
        let mut running = JoinSet::new();
        for tile in self.core.get_tiles_in_sector(&self.sector, self.level_number) {
            if self.cancel.is_cancelled() {
                break;
            }
            // Reap finished retrievals so a long run holds only the active ones.
            while running.try_join_next().is_some() {}
            let tile = match tile {
                Ok(tile) => tile,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping bulk tile");
                    self.progress.record(0);
                    continue;
                }
            };
            if self.file_store.contains(&tile.path()) {
                self.progress.record(0);
                continue;
            }

            let permit = tokio::select! {
                () = self.cancel.cancelled() => break,
                permit = Arc::clone(&budget).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let core = Arc::clone(&self.core);
            let file_store = self.file_store.clone();
            let listener = self.listener.clone();
            let progress = Arc::clone(&self.progress);
            running.spawn(async move {
                let _permit = permit;
                let outcome = retrieve_tile(&core, &tile, file_store).await;
                let event = match outcome {
                    Ok(bytes) => {
                        progress.record(u64::try_from(bytes).unwrap_or(u64::MAX));
                        BulkRetrievalEvent::Succeeded {
                            key: tile.key().clone(),
                            bytes,
                        }
                    }
                    Err(e) => {
                        progress.record(0);
                        BulkRetrievalEvent::Failed {
                            key: tile.key().clone(),
                            message: e.to_string(),
                        }
                    }
                };
                if let Some(listener) = listener {
                    listener.on_event(&event);
                }
            });
        }

        while running.join_next().await.is_some() {}
        tracing::info!(
            retrieved = self.progress.current_count(),
            total = self.progress.total_count(),
            cancelled = self.cancel.is_cancelled(),
            "bulk retrieval finished"
        );
    }
}

/// Retrieve one tile through the layer's retrieval path, bypassing the
/// shared services so the bulk task's own budget applies.
async fn retrieve_tile(
    core: &Arc<LayerCore>,
    tile: &Arc<GpuTextureTile>,
    file_store: FileStore,
) -> Result<usize> {
    let Some((retriever, _)) = core.create_retriever(tile) else {
        return Err(Error::Unavailable {
            what: format!("retrieval for {}", tile.key()),
        });
    };
    let outcome = retriever.retrieve().await;
    let post = DownloadPostProcessor::new(Arc::clone(core), Arc::clone(tile), file_store);
    tokio::task::spawn_blocking(move || post.process(outcome))
        .await
        .map_err(|e| Error::Unavailable {
            what: format!("post-processing for {}: {e}", tile.key()),
        })?
}
