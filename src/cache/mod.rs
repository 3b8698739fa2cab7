//! Local binary-cache store and the cache-fill engine.
//!
//! Provides the [`CacheStore`] path layout, the [`CacheService`] that fills
//! it from upstream binary caches, the [`guard::FetchGuard`] that coordinates
//! concurrent fills, and the diagnostic ticker.
//!
//! Entries are never evicted: retention is unbounded and disk usage grows
//! with the set of distinct keys requested.

pub mod fetch;
pub mod guard;
pub mod key;
pub mod store;
pub mod ticker;

pub use fetch::{CacheService, FetchError};
pub use key::{Category, ContentHash};
pub use store::CacheStore;
