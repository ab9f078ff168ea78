//! Core engine - caches, request coordination, workers
//!
//! Everything here is independent of where chunks and metadata come from;
//! collaborators are reached through the traits in `entities::traits`.

pub mod cache_stats;
pub mod context_cache;
pub mod error;
pub mod flight;
pub mod frame_cache;
pub mod meta_cache;
pub mod prefetch;
pub mod workers;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use cache_stats::{CacheStats, CacheStatsSnapshot};
pub use context_cache::{ContextImageCache, ContextImageLoader};
pub use error::{FrameError, Result};
pub use flight::{Flight, FlightGuard, FlightRole, FlightSlot};
pub use frame_cache::{
    FindFilters, FrameCacheRegistry, FrameDataHandle, FrameQuery, JobCache, JobMode, PendingFrame,
};
pub use meta_cache::{MetaCache, SharedMeta, merge_meta_data};
pub use prefetch::PrefetchAnalyzer;
pub use workers::Workers;
