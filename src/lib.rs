//! framecache - frame data cache and prefetch pipeline for annotation jobs
//!
//! Serves decoded frames of a job from chunked server data: fetches each
//! chunk once, keeps a bounded ring of decoded chunks, prefetches ahead of
//! forward scanning or playback, drops requests superseded by newer ones,
//! and keeps local deleted-frame edits across metadata reloads.

// Core engine (caches, request coordination, workers)
pub mod core;

pub mod cli;
pub mod config;
pub mod decoder;
pub mod entities;
pub mod local;

// Re-export commonly used types
pub use config::CacheConfig;
pub use core::{FindFilters, FrameCacheRegistry, FrameDataHandle, FrameError, FrameQuery, Workers};
pub use entities::{Bitmap, FrameImage, FramesMetaData, SessionType};
