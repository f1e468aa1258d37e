//! Shared building blocks for kiln: content fingerprints, cache keys and the
//! generic TTL/LRU [`ArtifactCache`].

pub mod error;
pub mod hash;
pub mod key;
pub mod store;

pub use error::CacheError;
pub use hash::{ContentFingerprint, ContentHasher, TreeFilter};
pub use key::{CacheKey, CacheKind};
pub use store::{ArtifactCache, CacheCounters, CacheEntry, CacheStats, Invalidation, Lookup};
