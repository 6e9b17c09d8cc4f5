//! Local audio cache
//!
//! Storage abstraction only: a SQLite index (track id → payload path +
//! probed metadata) next to the payload files themselves. No network access
//! happens here; the downloader writes through after a successful fetch.

mod store;

pub use store::{AudioMetadata, CacheEntry, CacheStore};

use serde::Serialize;

/// Cache lifecycle state of a track
///
/// `Cached` is backed by an index row; `Downloading` and `Unavailable` are
/// runtime marks owned by the store on behalf of the downloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Uncached,
    Downloading,
    Cached,
    Unavailable,
}
