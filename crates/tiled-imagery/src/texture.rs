//! Decoded texture data and the factories that produce it.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Texture bytes ready for upload, stamped with the time they were loaded.
#[derive(Debug, Clone)]
pub struct TextureData {
    bytes: Vec<u8>,
    loaded_at: SystemTime,
}

impl TextureData {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self::with_loaded_at(bytes, SystemTime::now())
    }

    #[must_use]
    pub fn with_loaded_at(bytes: Vec<u8>, loaded_at: SystemTime) -> Self {
        Self { bytes, loaded_at }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn loaded_at(&self) -> SystemTime {
        self.loaded_at
    }

    /// Load time in milliseconds since the Unix epoch.
    #[must_use]
    pub fn loaded_at_millis(&self) -> i64 {
        self.loaded_at
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
    }

    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        self.bytes.len()
    }
}

/// Turns a file in the file store into texture data.
///
/// Returning `None` means the file could not be decoded; the caller treats
/// the file as corrupt.
pub trait TextureFactory: Send + Sync {
    fn create_texture_data(&self, path: &Path) -> Option<TextureData>;
}

/// Passes the file's bytes through undecoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawTextureFactory;

impl TextureFactory for RawTextureFactory {
    fn create_texture_data(&self, path: &Path) -> Option<TextureData> {
        match std::fs::read(path) {
            Ok(bytes) if bytes.is_empty() => {
                tracing::debug!(path = %path.display(), "texture file is empty");
                None
            }
            Ok(bytes) => Some(TextureData::new(bytes)),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "texture file unreadable");
                None
            }
        }
    }
}
