//! Tile identity and per-tile state.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use glam::DVec3;

use crate::cache::MemoryCache;
use crate::error::{Error, Result};
use crate::geom::{DrawContext, Extent, LatLon, Sector};
use crate::level::{
    Level, compute_column, compute_column_longitude, compute_row, compute_row_latitude,
};
use crate::texture::TextureData;

/// Memory cache holding every tile the selector has materialized.
pub type TileCache = MemoryCache<TileKey, Arc<GpuTextureTile>>;

/// Identity of a tile: level, row, column and the dataset's cache name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub level: u32,
    pub row: i32,
    pub column: i32,
    pub cache_name: Arc<str>,
}

impl TileKey {
    #[must_use]
    pub fn new(level: u32, row: i32, column: i32, cache_name: impl Into<Arc<str>>) -> Self {
        Self {
            level,
            row,
            column,
            cache_name: cache_name.into(),
        }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.cache_name, self.level, self.row, self.column
        )
    }
}

/// Geometry derived from the globe, recomputed when the exaggeration changes.
#[derive(Debug, Clone, Copy)]
struct TileGeometry {
    vertical_exaggeration: f64,
    extent: Extent,
    reference_points: [DVec3; 5],
}

/// A tile whose texture may be resident in memory.
///
/// Tiles are shared as `Arc<GpuTextureTile>` between the tile cache, the
/// selector and worker tasks. The texture and the fallback are interior
/// mutable so workers can publish results while the render thread reads.
#[derive(Debug)]
pub struct GpuTextureTile {
    key: TileKey,
    sector: Sector,
    level: Arc<Level>,
    geometry: RwLock<Option<TileGeometry>>,
    /// `f64` bits.
    priority: AtomicU64,
    texture: RwLock<Option<Arc<TextureData>>>,
    /// Always a coarser tile, so the chain of strong references ends.
    fallback: RwLock<Option<Arc<GpuTextureTile>>>,
}

impl GpuTextureTile {
    /// Create a tile; rows and columns must be non-negative.
    pub fn new(sector: Sector, level: Arc<Level>, row: i32, column: i32) -> Result<Self> {
        if row < 0 {
            return Err(Error::invalid_argument(
                "generic.RowIndexOutOfRange",
                format!("row {row} is negative"),
            ));
        }
        if column < 0 {
            return Err(Error::invalid_argument(
                "generic.ColumnIndexOutOfRange",
                format!("column {column} is negative"),
            ));
        }

        let key = TileKey::new(level.level_number(), row, column, Arc::clone(level.cache_name()));
        Ok(Self {
            key,
            sector,
            level,
            geometry: RwLock::new(None),
            priority: AtomicU64::new(f64::MAX.to_bits()),
            texture: RwLock::new(None),
            fallback: RwLock::new(None),
        })
    }

    #[must_use]
    pub fn key(&self) -> &TileKey {
        &self.key
    }

    #[must_use]
    pub fn sector(&self) -> Sector {
        self.sector
    }

    #[must_use]
    pub fn level(&self) -> &Arc<Level> {
        &self.level
    }

    #[must_use]
    pub fn level_number(&self) -> u32 {
        self.key.level
    }

    #[must_use]
    pub fn row(&self) -> i32 {
        self.key.row
    }

    #[must_use]
    pub fn column(&self) -> i32 {
        self.key.column
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.level.tile_width()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.level.tile_height()
    }

    /// Relative file-store path: `<cacheName>/<level>/<row>/<row>_<col><suffix>`.
    #[must_use]
    pub fn path(&self) -> String {
        format!(
            "{}/{}/{}/{}_{}{}",
            self.key.cache_name,
            self.key.level,
            self.key.row,
            self.key.row,
            self.key.column,
            self.level.format_suffix()
        )
    }

    /// Expand a service URL template for this tile.
    ///
    /// Recognized placeholders are `{level}`, `{row}`, `{col}`, `{dataset}`
    /// and `{format}`.
    pub fn resource_url(&self, template: &str, image_format: Option<&str>) -> Result<reqwest::Url> {
        let url = template
            .replace("{level}", &self.key.level.to_string())
            .replace("{row}", &self.key.row.to_string())
            .replace("{col}", &self.key.column.to_string())
            .replace("{dataset}", &self.key.cache_name)
            .replace("{format}", image_format.unwrap_or_default());
        reqwest::Url::parse(&url).map_err(|e| Error::MalformedUrl {
            url,
            message: e.to_string(),
        })
    }

    /// Refresh the cached extent and reference points when missing or when
    /// the vertical exaggeration changed.
    pub fn update_extent(&self, dc: &DrawContext<'_>) -> Extent {
        if let Some(geometry) = *self.geometry.read().unwrap_or_else(PoisonError::into_inner)
            && geometry.vertical_exaggeration.to_bits() == dc.vertical_exaggeration.to_bits()
        {
            return geometry.extent;
        }

        let geometry = TileGeometry {
            vertical_exaggeration: dc.vertical_exaggeration,
            extent: self
                .sector
                .compute_bounding_box(dc.globe, dc.vertical_exaggeration),
            reference_points: self
                .sector
                .compute_reference_points(dc.globe, dc.vertical_exaggeration),
        };
        *self.geometry.write().unwrap_or_else(PoisonError::into_inner) = Some(geometry);
        geometry.extent
    }

    #[must_use]
    pub fn extent(&self) -> Option<Extent> {
        self.geometry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|g| g.extent)
    }

    /// Four corners then the centroid, once the extent has been computed.
    #[must_use]
    pub fn reference_points(&self) -> Option<[DVec3; 5]> {
        self.geometry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|g| g.reference_points)
    }

    /// Whether the tile is too coarse for the current view.
    ///
    /// A texel of `s` meters must subdivide once the eye is closer than
    /// `s * 10^detail_factor` meters to any of the tile's reference points,
    /// so at an altitude of `10^h` one-meter features stay discernible.
    #[must_use]
    pub fn must_subdivide(&self, dc: &DrawContext<'_>, detail_factor: f64) -> bool {
        self.update_extent(dc);
        let Some(points) = self.reference_points() else {
            return false;
        };

        let eye = dc.view.eye_point();
        let min_distance = points
            .iter()
            .map(|p| p.distance(eye))
            .fold(f64::INFINITY, f64::min);

        let texel_meters = self.level.texel_size() * dc.globe.radius();
        texel_meters * 10f64.powf(detail_factor) > min_distance
    }

    /// Squared distance from `eye` to the centre of the tile's extent.
    #[must_use]
    pub fn distance_squared_to(&self, eye: DVec3) -> f64 {
        self.extent()
            .map_or(f64::MAX, |extent| extent.center().distance_squared(eye))
    }

    #[must_use]
    pub fn priority(&self) -> f64 {
        f64::from_bits(self.priority.load(Ordering::Relaxed))
    }

    pub fn set_priority(&self, priority: f64) {
        self.priority.store(priority.to_bits(), Ordering::Relaxed);
    }

    /// The four children at `next_level`, reusing any already in `cache`.
    ///
    /// Children are returned south-west, south-east, north-west, north-east,
    /// at rows `2r, 2r+1` and columns `2c, 2c+1`.
    pub fn subdivide(
        &self,
        next_level: &Arc<Level>,
        cache: &TileCache,
    ) -> Result<[Arc<GpuTextureTile>; 4]> {
        let s = self.sector;
        let mid = s.centroid();
        let row = self.key.row * 2;
        let column = self.key.column * 2;

        let south = (s.min_latitude, mid.latitude);
        let north = (mid.latitude, s.max_latitude);
        let west = (s.min_longitude, mid.longitude);
        let east = (mid.longitude, s.max_longitude);
        let quadrants = [
            (row, column, south, west),
            (row, column + 1, south, east),
            (row + 1, column, north, west),
            (row + 1, column + 1, north, east),
        ];

        let mut children = Vec::with_capacity(4);
        for (row, column, (min_lat, max_lat), (min_lon, max_lon)) in quadrants {
            let key = TileKey::new(
                next_level.level_number(),
                row,
                column,
                Arc::clone(next_level.cache_name()),
            );
            let child = match cache.get(&key) {
                Some(child) => child,
                None => {
                    let sector = Sector::from_degrees(min_lat, max_lat, min_lon, max_lon);
                    let child = GpuTextureTile::new(sector, Arc::clone(next_level), row, column)?;
                    let child = Arc::new(child);
                    cache.put(key, Arc::clone(&child), child.size_in_bytes());
                    child
                }
            };
            children.push(child);
        }

        children.try_into().map_err(|_| {
            Error::invalid_argument("generic.SubdivisionFailed", "expected four children")
        })
    }

    /// Texture currently published for this tile.
    #[must_use]
    pub fn texture_data(&self) -> Option<Arc<TextureData>> {
        self.texture
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_texture_data(&self, texture: Option<Arc<TextureData>>) {
        *self.texture.write().unwrap_or_else(PoisonError::into_inner) = texture;
    }

    #[must_use]
    pub fn is_texture_in_memory(&self) -> bool {
        self.texture
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Whether the resident texture was loaded before `expiry_time` (ms since
    /// the epoch) and that time has already passed.
    #[must_use]
    pub fn is_texture_expired(&self, expiry_time: i64) -> bool {
        if expiry_time <= 0 || expiry_time > now_millis() {
            return false;
        }
        self.texture_data()
            .is_some_and(|texture| texture.loaded_at_millis() < expiry_time)
    }

    /// The ancestor whose texture stands in for this tile.
    ///
    /// The fallback is held strongly, so it outlives eviction from the tile
    /// cache for as long as this tile refers to it.
    #[must_use]
    pub fn fallback_tile(&self) -> Option<Arc<GpuTextureTile>> {
        self.fallback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_fallback_tile(&self, fallback: Option<&Arc<GpuTextureTile>>) {
        *self.fallback.write().unwrap_or_else(PoisonError::into_inner) = fallback.map(Arc::clone);
    }

    /// Approximate memory held by this tile and its texture.
    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.texture_data().map_or(0, |t| t.size_in_bytes())
    }
}

impl PartialEq for GpuTextureTile {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for GpuTextureTile {}

/// Tile every cell of `level` that intersects `sector`, rows then columns.
pub fn create_tiles_for_level(
    level: &Arc<Level>,
    sector: &Sector,
    origin: LatLon,
) -> Result<Vec<Arc<GpuTextureTile>>> {
    let delta = level.tile_delta();
    let first_row = compute_row(delta.latitude, sector.min_latitude, origin.latitude);
    let last_row = compute_row(delta.latitude, sector.max_latitude, origin.latitude);
    let first_column = compute_column(delta.longitude, sector.min_longitude, origin.longitude);
    let last_column = compute_column(delta.longitude, sector.max_longitude, origin.longitude);

    let mut tiles = Vec::new();
    for row in first_row..=last_row {
        let min_latitude = compute_row_latitude(row, delta.latitude, origin.latitude);
        for column in first_column..=last_column {
            let min_longitude = compute_column_longitude(column, delta.longitude, origin.longitude);
            let tile_sector = Sector::from_degrees(
                min_latitude,
                min_latitude + delta.latitude,
                min_longitude,
                min_longitude + delta.longitude,
            );
            tiles.push(Arc::new(GpuTextureTile::new(tile_sector, Arc::clone(level), row, column)?));
        }
    }
    Ok(tiles)
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::{FrustumView, Globe, SphericalGlobe};
    use crate::level::LevelSet;
    use crate::level::tests::params;

    fn level_set() -> LevelSet {
        LevelSet::from_params(&params(3, 0)).unwrap()
    }

    #[test]
    fn test_negative_row_and_column_rejected() {
        let levels = level_set();
        let level = Arc::clone(levels.first_level());
        let err = GpuTextureTile::new(Sector::FULL_SPHERE, Arc::clone(&level), -1, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { key: "generic.RowIndexOutOfRange", .. }));
        let err = GpuTextureTile::new(Sector::FULL_SPHERE, level, 0, -3).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { key: "generic.ColumnIndexOutOfRange", .. }));
    }

    #[test]
    fn test_path_layout() {
        let levels = level_set();
        let tile = GpuTextureTile::new(
            Sector::from_degrees(0.0, 18.0, 0.0, 18.0),
            Arc::clone(&levels.levels()[1]),
            5,
            10,
        )
        .unwrap();
        assert_eq!(tile.path(), "Test/1/5/5_10.dds");
        assert_eq!(tile.key().to_string(), "Test/1/5/10");
    }

    #[test]
    fn test_resource_url_expands_template() {
        let levels = level_set();
        let level = Arc::clone(levels.first_level());
        let tile = GpuTextureTile::new(Sector::FULL_SPHERE, level, 2, 7).unwrap();
        let url = tile
            .resource_url(
                "https://tiles.example.com/{dataset}/{level}/{row}/{col}?fmt={format}",
                Some("image/dds"),
            )
            .unwrap();
        assert_eq!(url.as_str(), "https://tiles.example.com/Test/0/2/7?fmt=image/dds");

        assert!(matches!(
            tile.resource_url("not a url {row}", None),
            Err(Error::MalformedUrl { .. })
        ));
    }

    #[test]
    fn test_top_level_grid_is_five_by_ten() {
        let levels = level_set();
        let origin = levels.tile_origin();
        let tiles =
            create_tiles_for_level(levels.first_level(), &Sector::FULL_SPHERE, origin).unwrap();
        assert_eq!(tiles.len(), 50);
        assert_eq!(tiles[0].sector(), Sector::from_degrees(-90.0, -54.0, -180.0, -144.0));
        let last = tiles.last().unwrap();
        assert_eq!((last.row(), last.column()), (4, 9));
    }

    #[test]
    fn test_subdivide_children_and_cache_reuse() {
        let levels = level_set();
        let cache = TileCache::new(1 << 20);
        let parent = GpuTextureTile::new(
            Sector::from_degrees(-18.0, 18.0, 0.0, 36.0),
            Arc::clone(levels.first_level()),
            2,
            5,
        )
        .unwrap();

        let children = parent.subdivide(&levels.levels()[1], &cache).unwrap();
        let rc: Vec<_> = children.iter().map(|c| (c.row(), c.column())).collect();
        assert_eq!(rc, vec![(4, 10), (4, 11), (5, 10), (5, 11)]);
        assert_eq!(children[0].sector(), Sector::from_degrees(-18.0, 0.0, 0.0, 18.0));
        assert_eq!(children[3].sector(), Sector::from_degrees(0.0, 18.0, 18.0, 36.0));
        assert_eq!(cache.len(), 4);

        let again = parent.subdivide(&levels.levels()[1], &cache).unwrap();
        assert!(Arc::ptr_eq(&children[2], &again[2]));
    }

    #[test]
    fn test_fallback_outlives_other_owners() {
        let levels = level_set();
        let child = GpuTextureTile::new(
            Sector::from_degrees(-18.0, 0.0, 0.0, 18.0),
            Arc::clone(&levels.levels()[1]),
            4,
            10,
        )
        .unwrap();
        let parent = Arc::new(
            GpuTextureTile::new(
                Sector::from_degrees(-18.0, 18.0, 0.0, 36.0),
                Arc::clone(levels.first_level()),
                2,
                5,
            )
            .unwrap(),
        );
        parent.set_texture_data(Some(Arc::new(TextureData::new(vec![1; 4]))));

        child.set_fallback_tile(Some(&parent));
        let weak = Arc::downgrade(&parent);
        drop(parent);
        let fallback = child.fallback_tile().unwrap();
        assert!(fallback.is_texture_in_memory());
        drop(fallback);

        child.set_fallback_tile(None);
        assert!(child.fallback_tile().is_none());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_must_subdivide_depends_on_distance() {
        let levels = level_set();
        let globe = SphericalGlobe::earth();
        let tile = GpuTextureTile::new(
            Sector::from_degrees(-18.0, 18.0, -18.0, 18.0),
            Arc::clone(levels.first_level()),
            2,
            4,
        )
        .unwrap();

        let near = FrustumView::new(globe.compute_point(0.0, 0.0, 10_000.0), glam::DMat4::IDENTITY);
        let far = FrustumView::new(globe.compute_point(0.0, 0.0, 1.0e8), glam::DMat4::IDENTITY);
        assert!(tile.must_subdivide(&DrawContext::new(&globe, &near), 2.8));
        assert!(!tile.must_subdivide(&DrawContext::new(&globe, &far), 2.8));
    }

    #[test]
    fn test_texture_expiry() {
        let levels = level_set();
        let level = Arc::clone(levels.first_level());
        let tile = GpuTextureTile::new(Sector::FULL_SPHERE, level, 0, 0).unwrap();
        assert!(!tile.is_texture_expired(1));

        tile.set_texture_data(Some(Arc::new(TextureData::new(vec![1, 2, 3]))));
        assert!(tile.is_texture_in_memory());
        assert!(!tile.is_texture_expired(0));
        assert!(!tile.is_texture_expired(now_millis() + 60_000));

        let stale = TextureData::with_loaded_at(vec![1], UNIX_EPOCH);
        tile.set_texture_data(Some(Arc::new(stale)));
        assert!(tile.is_texture_expired(now_millis() - 1));
    }
}
