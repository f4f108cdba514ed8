//! Layer configuration parameters.
//!
//! A [`LayerParams`] record carries every recognized configuration key. The
//! record deserializes from a JSON object whose member names are the keys
//! themselves; runtime collaborators (the local retriever factory and the
//! texture factory) are attached programmatically.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geom::{LatLon, Sector};
use crate::retrieve::RetrieverFactory;
use crate::texture::TextureFactory;

/// Default level-zero tile delta in degrees.
pub const DEFAULT_LEVEL_ZERO_TILE_DELTA: f64 = 36.0;
/// Default tile width and height in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 512;
/// Default image file suffix.
pub const DEFAULT_FORMAT_SUFFIX: &str = ".dds";
/// Default number of levels, roughly 0.1 meters per pixel at the equator.
pub const DEFAULT_NUM_LEVELS: u32 = 19;
/// Default number of leading empty levels.
pub const DEFAULT_NUM_EMPTY_LEVELS: u32 = 0;
/// Default tile grid origin.
pub const DEFAULT_TILE_ORIGIN: LatLon = LatLon::from_degrees(-90.0, -180.0);
/// Base-10 exponent of the default resolution-to-altitude relationship.
pub const DEFAULT_DETAIL_HINT_ORIGIN: f64 = 2.8;
/// Failures tolerated before a resource is considered absent.
pub const DEFAULT_MAX_RESOURCE_ATTEMPTS: u32 = 3;
/// Cool-down before an absent resource is tried again, in milliseconds.
pub const DEFAULT_MIN_RESOURCE_CHECK_INTERVAL_MS: u64 = 600_000;
/// Default size of the texture tile memory cache in bytes.
pub const DEFAULT_GPU_TEXTURE_TILE_CACHE_SIZE: usize = 64 * 1024 * 1024;

/// Every configuration key a layer understands.
pub const RECOGNIZED_KEYS: &[&str] = &[
    "DisplayName",
    "Opacity",
    "MaxActiveAltitude",
    "MinActiveAltitude",
    "MapScale",
    "DetailHint",
    "NetworkRetrievalEnabled",
    "URLConnectTimeout",
    "URLReadTimeout",
    "RetrievalQueueStaleRequestLimit",
    "TransparencyColors",
    "ConstructionParameters",
    "RetrieverFactoryLocal",
    "Sector",
    "LevelZeroTileDelta",
    "TileWidth",
    "TileHeight",
    "FormatSuffix",
    "NumLevels",
    "NumEmptyLevels",
    "ServiceName",
    "ImageFormat",
    "AvailableImageFormats",
    "RetrievePropertiesFromService",
    "GpuTextureFactory",
    "GpuTextureTileCacheSize",
    "DataCacheName",
    "DatasetName",
    "ServiceUrl",
    "TileOrigin",
    "ExpiryTime",
    "GetCapabilitiesUrl",
];

/// Configuration record for a tiled image layer.
///
/// Timeouts and limits are in milliseconds. Absent values fall back to the
/// defaults applied by [`LayerParams::with_fallbacks`] or to the layer's own
/// defaults.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LayerParams {
    pub display_name: Option<String>,
    pub opacity: Option<f64>,
    pub max_active_altitude: Option<f64>,
    pub min_active_altitude: Option<f64>,
    pub map_scale: Option<f64>,
    pub detail_hint: Option<f64>,
    pub network_retrieval_enabled: Option<bool>,
    #[serde(rename = "URLConnectTimeout")]
    pub url_connect_timeout: Option<u64>,
    #[serde(rename = "URLReadTimeout")]
    pub url_read_timeout: Option<u64>,
    pub retrieval_queue_stale_request_limit: Option<u64>,
    /// Colors rendered transparent, as `#RRGGBB` strings.
    pub transparency_colors: Option<Vec<String>>,
    pub sector: Option<Sector>,
    pub level_zero_tile_delta: Option<LatLon>,
    pub tile_width: Option<u32>,
    pub tile_height: Option<u32>,
    pub format_suffix: Option<String>,
    pub num_levels: Option<u32>,
    pub num_empty_levels: Option<u32>,
    pub service_name: Option<String>,
    pub image_format: Option<String>,
    pub available_image_formats: Option<Vec<String>>,
    pub retrieve_properties_from_service: Option<bool>,
    pub gpu_texture_tile_cache_size: Option<usize>,
    pub data_cache_name: Option<String>,
    pub dataset_name: Option<String>,
    /// Tile URL template; see [`crate::tile::GpuTextureTile::resource_url`].
    pub service_url: Option<String>,
    pub tile_origin: Option<LatLon>,
    /// Milliseconds since the epoch; zero means no expiry.
    pub expiry_time: Option<i64>,
    pub get_capabilities_url: Option<String>,
    #[serde(skip)]
    pub retriever_factory_local: Option<Arc<dyn RetrieverFactory>>,
    #[serde(skip)]
    pub gpu_texture_factory: Option<Arc<dyn TextureFactory>>,
}

impl LayerParams {
    /// Parse a parameter record from a JSON object.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Fill in the values every layer needs when the record omits them.
    #[must_use]
    pub fn with_fallbacks(mut self) -> Self {
        self.level_zero_tile_delta.get_or_insert(LatLon::from_degrees(
            DEFAULT_LEVEL_ZERO_TILE_DELTA,
            DEFAULT_LEVEL_ZERO_TILE_DELTA,
        ));
        self.tile_width.get_or_insert(DEFAULT_TILE_SIZE);
        self.tile_height.get_or_insert(DEFAULT_TILE_SIZE);
        self.format_suffix
            .get_or_insert_with(|| DEFAULT_FORMAT_SUFFIX.to_string());
        self.num_levels.get_or_insert(DEFAULT_NUM_LEVELS);
        self.num_empty_levels.get_or_insert(DEFAULT_NUM_EMPTY_LEVELS);
        self.tile_origin.get_or_insert(DEFAULT_TILE_ORIGIN);
        if self.data_cache_name.is_none() {
            self.data_cache_name = self
                .dataset_name
                .clone()
                .or_else(|| self.display_name.clone());
        }
        self
    }

    /// Data cache name, required to lay out the file store.
    pub fn require_data_cache_name(&self) -> Result<&str> {
        self.data_cache_name.as_deref().ok_or(Error::Config {
            key: "DataCacheName",
            detail: "a data cache name, dataset name or display name is required".to_string(),
        })
    }

    /// Layer sector, required to build the level set.
    pub fn require_sector(&self) -> Result<Sector> {
        self.sector
            .ok_or_else(|| Error::invalid_argument("nullValue.SectorIsNull", "Sector is required"))
    }

    /// The OGC capabilities document location, when the record names one.
    #[must_use]
    pub fn capabilities_url(&self) -> Option<String> {
        if let Some(url) = &self.get_capabilities_url {
            return Some(url.clone());
        }
        let service = self.service_url.as_deref()?;
        let name = self.service_name.as_deref()?;
        let base = service.split('?').next().unwrap_or(service);
        Some(format!(
            "{base}?SERVICE={name}&REQUEST=GetCapabilities"
        ))
    }
}

impl fmt::Debug for LayerParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerParams")
            .field("display_name", &self.display_name)
            .field("sector", &self.sector)
            .field("level_zero_tile_delta", &self.level_zero_tile_delta)
            .field("num_levels", &self.num_levels)
            .field("num_empty_levels", &self.num_empty_levels)
            .field("data_cache_name", &self.data_cache_name)
            .field("service_url", &self.service_url)
            .field(
                "retriever_factory_local",
                &self.retriever_factory_local.is_some(),
            )
            .field("gpu_texture_factory", &self.gpu_texture_factory.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallbacks_fill_defaults() {
        let params = LayerParams {
            display_name: Some("Blue Marble".to_string()),
            ..LayerParams::default()
        }
        .with_fallbacks();

        assert_eq!(params.level_zero_tile_delta, Some(LatLon::from_degrees(36.0, 36.0)));
        assert_eq!(params.tile_width, Some(512));
        assert_eq!(params.tile_height, Some(512));
        assert_eq!(params.format_suffix.as_deref(), Some(".dds"));
        assert_eq!(params.num_levels, Some(19));
        assert_eq!(params.num_empty_levels, Some(0));
        assert_eq!(params.data_cache_name.as_deref(), Some("Blue Marble"));
    }

    #[test]
    fn test_fallbacks_keep_explicit_values() {
        let params = LayerParams {
            tile_width: Some(256),
            num_levels: Some(4),
            ..LayerParams::default()
        }
        .with_fallbacks();
        assert_eq!(params.tile_width, Some(256));
        assert_eq!(params.num_levels, Some(4));
    }

    #[test]
    fn test_from_json_uses_recognized_keys() {
        let params = LayerParams::from_json(
            r#"{
                "DisplayName": "Landsat",
                "DetailHint": 0.25,
                "URLConnectTimeout": 5000,
                "NumEmptyLevels": 2,
                "Sector": {
                    "MinLatitude": -45, "MaxLatitude": 45,
                    "MinLongitude": 0, "MaxLongitude": 90
                },
                "AvailableImageFormats": ["image/png", "image/dds"]
            }"#,
        )
        .unwrap();

        assert_eq!(params.display_name.as_deref(), Some("Landsat"));
        assert_eq!(params.detail_hint, Some(0.25));
        assert_eq!(params.url_connect_timeout, Some(5000));
        assert_eq!(params.num_empty_levels, Some(2));
        assert_eq!(params.sector.unwrap().max_longitude, 90.0);
        assert_eq!(params.available_image_formats.unwrap().len(), 2);
    }

    #[test]
    fn test_missing_sector_is_invalid_argument() {
        let err = LayerParams::default().require_sector().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidArgument {
                key: "nullValue.SectorIsNull",
                ..
            }
        ));
    }

    #[test]
    fn test_capabilities_url_from_service() {
        let params = LayerParams {
            service_url: Some("https://example.com/wms?T={dataset}".to_string()),
            service_name: Some("WMS".to_string()),
            ..LayerParams::default()
        };
        assert_eq!(
            params.capabilities_url().as_deref(),
            Some("https://example.com/wms?SERVICE=WMS&REQUEST=GetCapabilities")
        );
    }

    #[test]
    fn test_recognized_keys_cover_serialized_fields() {
        let value = serde_json::to_value(LayerParams::default().with_fallbacks()).unwrap();
        for key in value.as_object().unwrap().keys() {
            assert!(RECOGNIZED_KEYS.contains(&key.as_str()), "{key}");
        }
    }
}
