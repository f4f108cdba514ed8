//! Level-of-detail streaming of tiled globe imagery.
//!
//! This crate selects, each frame, the image tiles fine enough for the
//! current view, serves them from a two-tier cache (decoded textures in
//! memory, tile files on disk) and retrieves missing tiles from local
//! producers or remote services in the background.
//!
//! # Design principles
//!
//! - **Never block the frame**: selection only queues requests; loading,
//!   decoding and retrieval run on the environment's retrieval services
//! - **Fallback rendering**: a tile still loading is drawn with its nearest
//!   resident ancestor's texture
//! - **Bounded retries**: repeatedly failing tiles are skipped for a
//!   cool-down interval
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tiled_imagery::{DrawContext, Environment, FileStore, LayerParams, TiledImageLayer};
//!
//! let env = Arc::new(Environment::new(runtime.handle().clone(), FileStore::new("cache")));
//! let params = LayerParams::from_json(r#"{"DisplayName": "Blue Marble", "Sector": {...}}"#)?;
//! let mut layer = TiledImageLayer::new(env, params)?;
//!
//! // Once per frame.
//! layer.render(&DrawContext::new(&globe, &view), &renderer);
//! ```

pub mod absent;
pub mod cache;
pub mod config;
pub mod env;
mod error;
pub mod geom;
pub mod layer;
pub mod level;
pub mod queue;
pub mod retrieve;
pub mod texture;
pub mod tile;

pub use absent::AbsentResourceList;
pub use cache::{FileStore, MemoryCache};
pub use config::LayerParams;
pub use env::Environment;
pub use error::{Error, Result};
pub use geom::{DrawContext, Extent, FrustumView, Globe, LatLon, Sector, SphericalGlobe, View};
pub use layer::{
    BulkProgress, BulkRetrievalEvent, BulkRetrievalHandle, BulkRetrievalListener,
    BulkRetrievalOptions, LayerEvent, LayerProperties, ResourceInitializer, RetrievalState,
    SurfaceTileRenderer, TiledImageLayer,
};
pub use level::{Level, LevelSet};
pub use queue::{RequestQueue, RequestTask};
pub use retrieve::{NetworkStatus, RetrievalService, Retriever, RetrieverFactory};
pub use texture::{RawTextureFactory, TextureData, TextureFactory};
pub use tile::{GpuTextureTile, TileKey};
