//! In-memory and on-disk tile storage.
//!
//! # Implementations
//!
//! - [`MemoryCache`]: size-bounded, least-recently-used in-memory cache
//! - [`FileStore`]: tile files under a writable root and optional read-only roots

mod file_store;
mod memory;

pub use file_store::FileStore;
pub use memory::MemoryCache;
