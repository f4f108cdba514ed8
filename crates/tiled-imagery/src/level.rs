//! The level-of-detail pyramid behind a tiled image layer.
//!
//! A [`LevelSet`] describes a quadtree of image tiles covering a sector:
//! every level halves the tile delta of the level above it, and all levels
//! share one grid origin.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::absent::AbsentResourceList;
use crate::config::{
    DEFAULT_MAX_RESOURCE_ATTEMPTS, DEFAULT_MIN_RESOURCE_CHECK_INTERVAL_MS, LayerParams,
};
use crate::error::{Error, Result};
use crate::geom::{LatLon, Sector};
use crate::tile::TileKey;

/// Row containing `latitude` in a grid of `delta`-degree rows starting at
/// `origin`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
pub fn compute_row(delta: f64, latitude: f64, origin: f64) -> i32 {
    let offset = latitude - origin;
    let row = (offset / delta).floor() as i32;
    // A latitude on the far edge of the grid belongs to the last row.
    if offset == 180.0 { row - 1 } else { row }
}

/// Column containing `longitude`, see [`compute_row`].
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
pub fn compute_column(delta: f64, longitude: f64, origin: f64) -> i32 {
    let offset = longitude - origin;
    let column = (offset / delta).floor() as i32;
    if offset == 360.0 { column - 1 } else { column }
}

/// Southern latitude of `row`.
#[must_use]
pub fn compute_row_latitude(row: i32, delta: f64, origin: f64) -> f64 {
    origin + f64::from(row) * delta
}

/// Western longitude of `column`.
#[must_use]
pub fn compute_column_longitude(column: i32, delta: f64, origin: f64) -> f64 {
    origin + f64::from(column) * delta
}

/// One resolution tier of the pyramid.
#[derive(Debug)]
pub struct Level {
    level_number: u32,
    tile_delta: LatLon,
    tile_width: u32,
    tile_height: u32,
    /// Radians of latitude per texel.
    texel_size: f64,
    cache_name: Arc<str>,
    format_suffix: String,
    empty: bool,
    /// Milliseconds since the epoch; zero means no expiry.
    expiry_time: AtomicI64,
}

impl Level {
    #[must_use]
    pub fn level_number(&self) -> u32 {
        self.level_number
    }

    #[must_use]
    pub fn tile_delta(&self) -> LatLon {
        self.tile_delta
    }

    #[must_use]
    pub fn tile_width(&self) -> u32 {
        self.tile_width
    }

    #[must_use]
    pub fn tile_height(&self) -> u32 {
        self.tile_height
    }

    /// Angular size of one texel in radians of latitude.
    #[must_use]
    pub fn texel_size(&self) -> f64 {
        self.texel_size
    }

    #[must_use]
    pub fn cache_name(&self) -> &Arc<str> {
        &self.cache_name
    }

    #[must_use]
    pub fn format_suffix(&self) -> &str {
        &self.format_suffix
    }

    /// No tiles are requested for an empty level.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    #[must_use]
    pub fn expiry_time(&self) -> i64 {
        self.expiry_time.load(Ordering::Relaxed)
    }

    pub fn set_expiry_time(&self, expiry_time: i64) {
        self.expiry_time.store(expiry_time, Ordering::Relaxed);
    }
}

/// The full pyramid of levels covering a layer's sector.
#[derive(Debug)]
pub struct LevelSet {
    sector: Sector,
    tile_origin: LatLon,
    levels: Vec<Arc<Level>>,
    absent_resources: AbsentResourceList<TileKey>,
}

impl LevelSet {
    /// Build the pyramid described by a parameter record with fallbacks applied.
    pub fn from_params(params: &LayerParams) -> Result<Self> {
        let sector = params.require_sector()?;
        let cache_name: Arc<str> = Arc::from(params.require_data_cache_name()?);
        let level_zero_delta = params.level_zero_tile_delta.ok_or(Error::Config {
            key: "LevelZeroTileDelta",
            detail: "level zero tile delta is required".to_string(),
        })?;
        if level_zero_delta.latitude <= 0.0 || level_zero_delta.longitude <= 0.0 {
            return Err(Error::Config {
                key: "LevelZeroTileDelta",
                detail: format!(
                    "tile delta must be positive, got {}x{}",
                    level_zero_delta.latitude, level_zero_delta.longitude
                ),
            });
        }
        let num_levels = params.num_levels.unwrap_or(0);
        if num_levels == 0 {
            return Err(Error::Config {
                key: "NumLevels",
                detail: "at least one level is required".to_string(),
            });
        }
        let tile_width = params.tile_width.unwrap_or(crate::config::DEFAULT_TILE_SIZE);
        let tile_height = params.tile_height.unwrap_or(crate::config::DEFAULT_TILE_SIZE);
        let format_suffix = params
            .format_suffix
            .clone()
            .unwrap_or_else(|| crate::config::DEFAULT_FORMAT_SUFFIX.to_string());
        let num_empty_levels = params.num_empty_levels.unwrap_or(0);
        let expiry_time = params.expiry_time.unwrap_or(0);

        let levels = (0..num_levels)
            .map(|level_number| {
                let scale = f64::from(1u32 << level_number.min(31));
                let tile_delta = LatLon::from_degrees(
                    level_zero_delta.latitude / scale,
                    level_zero_delta.longitude / scale,
                );
                Arc::new(Level {
                    level_number,
                    tile_delta,
                    tile_width,
                    tile_height,
                    texel_size: tile_delta.latitude.to_radians() / f64::from(tile_height),
                    cache_name: Arc::clone(&cache_name),
                    format_suffix: format_suffix.clone(),
                    empty: level_number < num_empty_levels,
                    expiry_time: AtomicI64::new(expiry_time),
                })
            })
            .collect();

        Ok(Self {
            sector,
            tile_origin: params
                .tile_origin
                .unwrap_or(crate::config::DEFAULT_TILE_ORIGIN),
            levels,
            absent_resources: AbsentResourceList::new(
                DEFAULT_MAX_RESOURCE_ATTEMPTS,
                Duration::from_millis(DEFAULT_MIN_RESOURCE_CHECK_INTERVAL_MS),
            ),
        })
    }

    #[must_use]
    pub fn sector(&self) -> Sector {
        self.sector
    }

    #[must_use]
    pub fn tile_origin(&self) -> LatLon {
        self.tile_origin
    }

    #[must_use]
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    #[must_use]
    pub fn get_level(&self, level_number: u32) -> Option<&Arc<Level>> {
        self.levels.get(level_number as usize)
    }

    #[must_use]
    pub fn first_level(&self) -> &Arc<Level> {
        &self.levels[0]
    }

    #[must_use]
    pub fn last_level(&self) -> &Arc<Level> {
        &self.levels[self.levels.len() - 1]
    }

    #[must_use]
    pub fn first_non_empty_level(&self) -> Option<&Arc<Level>> {
        self.levels.iter().find(|l| !l.is_empty())
    }

    #[must_use]
    pub fn levels(&self) -> &[Arc<Level>] {
        &self.levels
    }

    /// Levels past the end of the pyramid count as empty.
    #[must_use]
    pub fn is_level_empty(&self, level_number: u32) -> bool {
        self.get_level(level_number).is_none_or(|l| l.is_empty())
    }

    #[must_use]
    pub fn is_final_level(&self, level_number: u32) -> bool {
        level_number as usize + 1 >= self.levels.len()
    }

    /// Geographic bounds of the tile a key names.
    pub fn compute_sector_for_key(&self, key: &TileKey) -> Result<Sector> {
        let level = self.get_level(key.level).ok_or_else(|| {
            Error::invalid_argument(
                "generic.LevelNumberOutOfRange",
                format!("level {} is outside the level set", key.level),
            )
        })?;
        let delta = level.tile_delta();
        let min_latitude = compute_row_latitude(key.row, delta.latitude, self.tile_origin.latitude);
        let min_longitude =
            compute_column_longitude(key.column, delta.longitude, self.tile_origin.longitude);
        Ok(Sector::from_degrees(
            min_latitude,
            min_latitude + delta.latitude,
            min_longitude,
            min_longitude + delta.longitude,
        ))
    }

    /// Overwrite the expiry time of every level when `expiry_time` is positive.
    pub fn set_expiry_time(&self, expiry_time: i64) {
        if expiry_time > 0 {
            for level in &self.levels {
                level.set_expiry_time(expiry_time);
            }
        }
    }

    #[must_use]
    pub fn absent_resources(&self) -> &AbsentResourceList<TileKey> {
        &self.absent_resources
    }

    pub fn mark_resource_absent(&self, key: &TileKey) {
        self.absent_resources.mark_resource_absent(key.clone());
    }

    pub fn unmark_resource_absent(&self, key: &TileKey) {
        self.absent_resources.unmark_resource_absent(key);
    }

    #[must_use]
    pub fn is_resource_absent(&self, key: &TileKey) -> bool {
        self.absent_resources.is_resource_absent(key)
    }
}
