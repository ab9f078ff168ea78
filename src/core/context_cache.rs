//! Context (related) image cache
//!
//! **Why**: Frames may carry side images (extra camera views). They are
//! fetched on demand and kept per job, bounded by total byte size.
//!
//! # Eviction
//!
//! Entries are kept in insertion order (`IndexMap`). Before inserting, the
//! oldest-inserted entries are evicted while the cached total exceeds the
//! budget, so the cache never holds more than `budget + newest entry` bytes.
//! Reads do not refresh an entry's position.
//!
//! # Fetch discipline
//!
//! `ContextImageLoader` allows one network fetch per job at a time. A request
//! arriving while another frame's fetch is running waits for it to settle,
//! then either finds its frame cached, gets rejected as stale (a newer
//! request for a different frame was made meanwhile) or fetches itself.
//! Images fetched across a `clear` are dropped, not cached.

use indexmap::IndexMap;
use log::{debug, trace};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::error::{FrameError, Result};
use super::flight::{FlightRole, FlightSlot};
use crate::entities::{ContextImageSource, ContextImages};

/// Default per-job budget: 512 MiB
pub const DEFAULT_CONTEXT_BUDGET: usize = 512 * 1024 * 1024;

#[derive(Debug, Clone)]
struct ContextEntry {
    data: ContextImages,
    /// Insertion sequence number
    timestamp: u64,
    inserted_at: Instant,
    size: usize,
}

/// Size-bounded cache of context images of one job
#[derive(Debug)]
pub struct ContextImageCache {
    entries: IndexMap<i64, ContextEntry>,
    budget: usize,
    total_size: usize,
    next_timestamp: u64,
}

/// Total byte size of a set of context images (`width * height * 4` each)
pub fn images_size(images: &ContextImages) -> usize {
    images.values().map(|bitmap| bitmap.mem()).sum()
}

impl ContextImageCache {
    pub fn new(budget: usize) -> Self {
        Self {
            entries: IndexMap::new(),
            budget,
            total_size: 0,
            next_timestamp: 0,
        }
    }

    pub fn get(&self, frame: i64) -> Option<ContextImages> {
        self.entries.get(&frame).map(|entry| entry.data.clone())
    }

    pub fn contains(&self, frame: i64) -> bool {
        self.entries.contains_key(&frame)
    }

    /// Insert images of `frame`, returning frames evicted to make room
    pub fn insert(&mut self, frame: i64, data: ContextImages) -> Vec<i64> {
        if let Some(old) = self.entries.shift_remove(&frame) {
            self.total_size -= old.size;
        }

        let mut evicted = Vec::new();
        while self.total_size > self.budget {
            let Some((oldest_frame, oldest)) = self.entries.shift_remove_index(0) else {
                break;
            };
            debug_assert!(self.entries.values().all(|e| e.timestamp > oldest.timestamp));
            self.total_size -= oldest.size;
            debug!(
                "Context images of frame {} evicted ({} MB freed, cached {:.1}s)",
                oldest_frame,
                oldest.size / 1024 / 1024,
                oldest.inserted_at.elapsed().as_secs_f64()
            );
            evicted.push(oldest_frame);
        }

        let size = images_size(&data);
        let timestamp = self.next_timestamp;
        self.next_timestamp += 1;
        self.entries.insert(
            frame,
            ContextEntry {
                data,
                timestamp,
                inserted_at: Instant::now(),
                size,
            },
        );
        self.total_size += size;
        trace!("Context images of frame {} cached ({} bytes)", frame, size);
        evicted
    }

    /// Release every cached image
    pub fn clear(&mut self) {
        let count = self.entries.len();
        self.entries.clear();
        self.total_size = 0;
        if count > 0 {
            debug!("Context image cache cleared ({} frames)", count);
        }
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached frames, oldest first
    pub fn frames(&self) -> Vec<i64> {
        self.entries.keys().copied().collect()
    }
}

/// Context image cache plus its single-fetch coordination
#[derive(Debug)]
pub struct ContextImageLoader {
    cache: Mutex<ContextImageCache>,
    slot: FlightSlot<i64>,
    latest: Mutex<Option<i64>>,
    /// Bumped by `clear`, under the cache lock
    generation: AtomicU64,
}

impl ContextImageLoader {
    pub fn new(budget: usize) -> Self {
        Self {
            cache: Mutex::new(ContextImageCache::new(budget)),
            slot: FlightSlot::new(),
            latest: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    fn cached(&self, frame: i64) -> Option<ContextImages> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(frame)
    }

    fn is_latest(&self, frame: i64) -> bool {
        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) == Some(frame)
    }

    /// Context images of `frame`, fetching them through `source` if needed
    pub fn get(
        &self,
        job_id: u64,
        frame: i64,
        related_files: usize,
        source: &dyn ContextImageSource,
    ) -> Result<ContextImages> {
        if related_files == 0 {
            return Ok(ContextImages::new());
        }
        if let Some(images) = self.cached(frame) {
            return Ok(images);
        }

        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(frame);

        loop {
            self.slot.wait_idle();

            if !self.is_latest(frame) {
                trace!("Context request for frame {} superseded", frame);
                return Err(FrameError::Stale(frame));
            }
            if let Some(images) = self.cached(frame) {
                return Ok(images);
            }

            let guard = match self.slot.try_begin(frame) {
                FlightRole::Fetcher(guard) => guard,
                FlightRole::Waiter(..) => continue,
            };

            let generation = self.generation.load(Ordering::Acquire);
            debug!("Fetching {} context images of job {} frame {}", related_files, job_id, frame);
            let images = source
                .fetch_context_images(job_id, frame)
                .and_then(|encoded| source.decode_context_images(encoded, related_files))
                .map_err(|e| FrameError::fetch("context image fetch", e))?;

            {
                let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                if self.generation.load(Ordering::Acquire) != generation {
                    debug!("Context images of job {} frame {} were invalidated while loading", job_id, frame);
                    return Err(FrameError::Stale(frame));
                }
                cache.insert(frame, images.clone());
            }
            guard.finish();

            // cached for later, but a newer frame is wanted now
            if !self.is_latest(frame) {
                return Err(FrameError::Stale(frame));
            }
            return Ok(images);
        }
    }

    pub fn contains(&self, frame: i64) -> bool {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).contains(frame)
    }

    pub fn total_size(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).total_size()
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached image; fetches running now will not be cached
    pub fn clear(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        self.generation.fetch_add(1, Ordering::AcqRel);
        cache.clear();
    }
}
