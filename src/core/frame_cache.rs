//! Frame cache orchestrator
//!
//! `FrameCacheRegistry` owns one `JobCache` per open job. A job cache holds
//! the decoder with its ring of decoded chunks, the prefetch analyzer, the
//! context image cache and the single chunk-request slot.
//!
//! # Request flow
//!
//! `FrameDataHandle::request` answers from the decoder when the frame is
//! already decoded. Otherwise it takes a fresh request token, making it the
//! job's latest request, and queues a load on the worker pool:
//!
//! ```text
//! loop:
//!     wait until no chunk request is active
//!     job closed              -> JobClosed
//!     frame decoded           -> done
//!     not the latest request  -> Stale
//!     claim the slot and fetch + decode the owning chunk
//! ```
//!
//! A load that loses the race for the slot waits for the winner and checks
//! the decoder again, so concurrent requests into one chunk fetch it once.
//! Outside playback a frame resolves as soon as the decoder reports it;
//! during playback (`decode_forward`) only after the whole chunk is decoded.
//!
//! Prefetch is attempted on decoder hits. It claims the same slot, so a
//! user request never races a speculative fetch for the network.
//!
//! # Decoding and redefined chunks
//!
//! The codec runs without the decoder lock; the lock is taken only to store
//! the finished block, so lookups and new requests proceed while a chunk
//! decodes. Every fetch remembers the job epoch it started in. Invalidation
//! bumps the epoch, and a block whose epoch is no longer current is dropped
//! instead of stored, failing its request with `Stale`.

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::cache_stats::{CacheStats, CacheStatsSnapshot};
use super::context_cache::ContextImageLoader;
use super::error::{FrameError, Result};
use super::flight::{FlightRole, FlightSlot};
use super::meta_cache::{MetaCache, SharedMeta};
use super::prefetch::PrefetchAnalyzer;
use crate::config::CacheConfig;
use crate::entities::{
    Bitmap, ChunkQuality, ChunkSource, ChunkType, ContextImageSource, ContextImages, DecoderFactory,
    Dimension, FrameDecoder, FrameImage, FrameInfo, FramesMetaData, MetadataSource, SessionType,
    WorkerPool,
};

/// Annotation mode of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    #[default]
    Annotation,
    Interpolation,
}

/// Parameters of a frame request
#[derive(Debug, Clone)]
pub struct FrameQuery {
    pub job_id: u64,
    /// Frames per chunk; 0 takes the value from the job metadata
    pub chunk_size: usize,
    pub chunk_type: ChunkType,
    pub mode: JobMode,
    /// Job frame number
    pub frame: i64,
    pub job_start_frame: i64,
    pub is_playing: bool,
    /// Playback step, used to find the next chunk to prefetch
    pub step: usize,
    pub dimension: Dimension,
}

impl FrameQuery {
    pub fn new(job_id: u64, frame: i64) -> Self {
        Self {
            job_id,
            chunk_size: 0,
            chunk_type: ChunkType::Imageset,
            mode: JobMode::default(),
            frame,
            job_start_frame: 0,
            is_playing: false,
            step: 1,
            dimension: Dimension::default(),
        }
    }
}

/// Options of `FrameCacheRegistry::find_frame`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindFilters {
    /// Return the n-th matching frame (1-based)
    pub offset: usize,
    pub not_deleted: bool,
}

impl Default for FindFilters {
    fn default() -> Self {
        Self {
            offset: 1,
            not_deleted: false,
        }
    }
}

/// Number of decoded chunks a job may keep in memory
///
/// Sized by the mean plus one standard deviation of the frame areas.
pub fn decoded_blocks_cache_size(
    frames: &[FrameInfo],
    chunk_size: usize,
    budget: usize,
    max_blocks: usize,
) -> usize {
    let max_blocks = max_blocks.max(1);
    if frames.is_empty() {
        return 1;
    }
    let areas: Vec<f64> = frames.iter().map(|f| f.width as f64 * f.height as f64).collect();
    let n = areas.len() as f64;
    let mean = areas.iter().sum::<f64>() / n;
    let variance = areas.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n;
    let block_bytes = (mean + variance.sqrt()) * Bitmap::byte_size(1, 1) as f64 * chunk_size as f64;
    if block_bytes <= 0.0 {
        return max_blocks;
    }
    ((budget as f64 / block_bytes).floor() as usize).clamp(1, max_blocks)
}

/// Sends the outcome of a request exactly once
struct Responder {
    tx: Sender<Result<FrameImage>>,
    resolved: bool,
}

impl Responder {
    fn new(tx: Sender<Result<FrameImage>>) -> Self {
        Self { tx, resolved: false }
    }

    fn resolve(&mut self, outcome: Result<FrameImage>) {
        if !self.resolved {
            self.resolved = true;
            // receiver may be gone; nobody is waiting then
            let _ = self.tx.send(outcome);
        }
    }
}

struct LoadRequest {
    frame: i64,
    chunk: usize,
    decode_forward: bool,
}

/// Cache state of one job
pub struct JobCache {
    job_id: u64,
    chunk_size: usize,
    start_frame: i64,
    segment_frames: Vec<i64>,
    decoded_blocks_cache_size: usize,
    decoder: Mutex<Box<dyn FrameDecoder>>,
    prefetch: Mutex<PrefetchAnalyzer>,
    chunk_slot: FlightSlot<usize>,
    request_ids: Arc<AtomicU64>,
    latest_request: AtomicU64,
    epoch: Arc<AtomicU64>,
    closed: AtomicBool,
    context: ContextImageLoader,
    get_chunk: Arc<dyn ChunkSource>,
    chunks_updated_date: Mutex<DateTime<Utc>>,
    meta_fetched_at: Mutex<Instant>,
    stats: CacheStats,
}

impl JobCache {
    fn new(
        query: &FrameQuery,
        meta: &FramesMetaData,
        get_chunk: Arc<dyn ChunkSource>,
        config: &CacheConfig,
        decoders: &dyn DecoderFactory,
        request_ids: Arc<AtomicU64>,
    ) -> Self {
        let chunk_size = if query.chunk_size == 0 { meta.chunk_size() } else { query.chunk_size };
        if chunk_size != meta.chunk_size() {
            warn!(
                "Job {}: requested chunk size {} differs from metadata chunk size {}",
                query.job_id,
                chunk_size,
                meta.chunk_size()
            );
        }
        let blocks = decoded_blocks_cache_size(
            meta.frames(),
            chunk_size,
            config.decoded_budget(),
            config.max_decoded_blocks,
        );
        info!(
            "Opening job {} ({:?}, {:?}, {:?}): {} frames, chunk size {}, {} decoded blocks",
            query.job_id,
            query.mode,
            query.chunk_type,
            query.dimension,
            meta.frame_count(),
            chunk_size,
            blocks
        );

        Self {
            job_id: query.job_id,
            chunk_size,
            start_frame: query.job_start_frame,
            segment_frames: meta.segment_frame_numbers(query.job_start_frame),
            decoded_blocks_cache_size: blocks,
            decoder: Mutex::new(decoders.create(query.chunk_type.into(), blocks, query.dimension)),
            prefetch: Mutex::new(PrefetchAnalyzer::new(chunk_size)),
            chunk_slot: FlightSlot::new(),
            request_ids,
            latest_request: AtomicU64::new(0),
            epoch: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
            context: ContextImageLoader::new(config.context_budget()),
            get_chunk,
            chunks_updated_date: Mutex::new(meta.chunks_updated_date()),
            meta_fetched_at: Mutex::new(Instant::now()),
            stats: CacheStats::new(),
        }
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn start_frame(&self) -> i64 {
        self.start_frame
    }

    /// Job frame numbers in chunk layout order
    pub fn segment_frames(&self) -> &[i64] {
        &self.segment_frames
    }

    pub fn decoded_blocks_cache_size(&self) -> usize {
        self.decoded_blocks_cache_size
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn cached_chunks(&self) -> Vec<usize> {
        self.decoder().cached_chunks()
    }

    pub fn context_images_cached(&self) -> usize {
        self.context.len()
    }

    pub fn context_images_size(&self) -> usize {
        self.context.total_size()
    }

    fn decoder(&self) -> MutexGuard<'_, Box<dyn FrameDecoder>> {
        self.decoder.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn decoded(&self, frame: i64) -> Option<FrameImage> {
        let decoder = self.decoder();
        let image = decoder.frame(frame)?;
        let (render_width, render_height) = decoder.render_size();
        Some(FrameImage {
            render_width,
            render_height,
            image,
        })
    }

    fn chunk_frames(&self, chunk: usize) -> &[i64] {
        let first = (chunk * self.chunk_size).min(self.segment_frames.len());
        let last = (first + self.chunk_size).min(self.segment_frames.len());
        &self.segment_frames[first..last]
    }

    /// Make the next request the latest one of this job
    fn begin_request(&self) -> u64 {
        let token = self.request_ids.fetch_add(1, Ordering::SeqCst) + 1;
        self.latest_request.store(token, Ordering::SeqCst);
        token
    }

    fn is_latest(&self, token: u64) -> bool {
        self.latest_request.load(Ordering::SeqCst) == token
    }

    fn record_request(&self, index: usize) {
        self.prefetch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add_requested(index);
    }

    fn load_frame(&self, req: &LoadRequest, token: u64, responder: &mut Responder) -> Result<FrameImage> {
        loop {
            self.chunk_slot.wait_idle();

            if self.is_closed() {
                return Err(FrameError::JobClosed(self.job_id));
            }
            if let Some(image) = self.decoded(req.frame) {
                return Ok(image);
            }
            if !self.is_latest(token) {
                return Err(FrameError::Stale(req.frame));
            }

            let guard = match self.chunk_slot.try_begin(req.chunk) {
                FlightRole::Fetcher(guard) => guard,
                FlightRole::Waiter(chunk, _) => {
                    trace!("Frame {} waits for chunk {} request", req.frame, chunk);
                    continue;
                }
            };

            let epoch = self.epoch.load(Ordering::Acquire);
            debug!("Job {}: fetching chunk {} for frame {}", self.job_id, req.chunk, req.frame);
            self.stats.record_chunk_fetch();
            let data = self
                .get_chunk
                .fetch_chunk(req.chunk, ChunkQuality::Compressed)
                .map_err(|e| FrameError::fetch("chunk fetch", e))?;

            let render_size = self.decoder().render_size();
            let (render_width, render_height) = render_size;
            let mut on_frame = |frame: i64, bitmap: &Bitmap| {
                if !req.decode_forward
                    && frame == req.frame
                    && self.is_latest(token)
                    && self.epoch.load(Ordering::Acquire) == epoch
                {
                    responder.resolve(Ok(FrameImage {
                        render_width,
                        render_height,
                        image: bitmap.clone(),
                    }));
                }
            };
            let decoded = self.decode_chunk(&data, req.chunk, req.frame, render_size, epoch, &mut on_frame);
            guard.finish();
            decoded?;

            if !self.is_latest(token) {
                return Err(FrameError::Stale(req.frame));
            }
            return self.decoded(req.frame).ok_or(FrameError::Stale(req.frame));
        }
    }

    /// Decode a fetched chunk outside the decoder lock, then store it unless
    /// the job was closed or invalidated since `epoch`
    fn decode_chunk(
        &self,
        data: &[u8],
        chunk: usize,
        frame: i64,
        render_size: (u32, u32),
        epoch: u64,
        on_frame: &mut dyn FnMut(i64, &Bitmap),
    ) -> Result<()> {
        let codec = self.decoder().codec();
        let frames = codec
            .decode_frames(data, chunk, self.chunk_frames(chunk), render_size, on_frame)
            .map_err(|e| FrameError::from_decode(e, chunk, frame))?;

        let mut decoder = self.decoder();
        if self.is_closed() {
            return Err(FrameError::JobClosed(self.job_id));
        }
        if self.epoch.load(Ordering::Acquire) != epoch {
            debug!("Job {}: chunk {} was redefined while loading, dropped", self.job_id, chunk);
            return Err(FrameError::Stale(frame));
        }
        decoder
            .insert_block(chunk, frames)
            .map_err(|e| FrameError::from_decode(e, chunk, frame))
    }

    fn maybe_prefetch(self: &Arc<Self>, index: usize, is_playing: bool, step: usize, workers: &dyn WorkerPool) {
        let should_prefetch = {
            let decoder = self.decoder();
            let mut analyzer = self.prefetch.lock().unwrap_or_else(|e| e.into_inner());
            let should = analyzer.should_prefetch_next(index, is_playing, |chunk| decoder.is_chunk_cached(chunk));
            analyzer.add_requested(index);
            should
        };
        if !should_prefetch || self.decoded_blocks_cache_size <= 1 || !self.chunk_slot.is_idle() {
            return;
        }
        let Some(chunk) = self.next_not_decoded_chunk(index, step) else {
            return;
        };

        debug!("Job {}: prefetching chunk {}", self.job_id, chunk);
        let epoch = self.epoch.load(Ordering::Acquire);
        let job = Arc::clone(self);
        workers.execute_with_epoch(
            Arc::clone(&self.epoch),
            epoch,
            Box::new(move || job.prefetch_chunk(chunk)),
        );
    }

    /// First chunk after the current one, walking by `step`, that is not decoded
    fn next_not_decoded_chunk(&self, index: usize, step: usize) -> Option<usize> {
        let step = step.max(1);
        let current = index / self.chunk_size;
        let decoder = self.decoder();
        let mut next = index;
        loop {
            next += step;
            if next >= self.segment_frames.len() {
                return None;
            }
            let chunk = next / self.chunk_size;
            if chunk != current && !decoder.is_chunk_cached(chunk) {
                return Some(chunk);
            }
        }
    }

    /// Runs on a worker. The slot is claimed here, not at submit time, so a
    /// queued prefetch never blocks loads waiting for the slot.
    fn prefetch_chunk(&self, chunk: usize) {
        if self.decoder().is_chunk_cached(chunk) {
            return;
        }
        let guard = match self.chunk_slot.try_begin(chunk) {
            FlightRole::Fetcher(guard) => guard,
            FlightRole::Waiter(active, _) => {
                trace!("Job {}: prefetch of chunk {} skipped, chunk {} in flight", self.job_id, chunk, active);
                return;
            }
        };

        let epoch = self.epoch.load(Ordering::Acquire);
        self.stats.record_prefetch();
        self.stats.record_chunk_fetch();
        let first = self.chunk_frames(chunk).first().copied().unwrap_or_default();
        let render_size = self.decoder().render_size();
        let outcome = self
            .get_chunk
            .fetch_chunk(chunk, ChunkQuality::Compressed)
            .map_err(|e| FrameError::fetch("chunk fetch", e))
            .and_then(|data| self.decode_chunk(&data, chunk, first, render_size, epoch, &mut |_, _| {}));
        guard.finish();
        match outcome {
            Ok(()) => {}
            Err(err @ (FrameError::Stale(_) | FrameError::JobClosed(_))) => {
                debug!("Job {}: prefetch of chunk {} dropped: {}", self.job_id, chunk, err)
            }
            Err(err) => warn!("Job {}: prefetch of chunk {} failed: {}", self.job_id, chunk, err),
        }
    }

    /// Claim the metadata refresh if the last one is older than `period`.
    /// Returns the previous refresh time so a failed refresh can be undone.
    fn claim_refresh(&self, period: Duration) -> Option<Instant> {
        let mut fetched_at = self.meta_fetched_at.lock().unwrap_or_else(|e| e.into_inner());
        if fetched_at.elapsed() < period {
            return None;
        }
        Some(std::mem::replace(&mut *fetched_at, Instant::now()))
    }

    fn cancel_refresh(&self, previous: Instant) {
        *self.meta_fetched_at.lock().unwrap_or_else(|e| e.into_inner()) = previous;
    }

    /// Returns true if decoded data was dropped
    fn on_meta_refreshed(&self, chunks_updated: DateTime<Utc>) -> bool {
        {
            let mut current = self.chunks_updated_date.lock().unwrap_or_else(|e| e.into_inner());
            if chunks_updated <= *current {
                return false;
            }
            *current = chunks_updated;
        }
        self.invalidate();
        true
    }

    /// Drop decoded chunks and context images, cancel queued prefetch
    fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.decoder().cleanup(usize::MAX);
        self.context.clear();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.decoder().close();
        self.context.clear();
    }
}

/// A requested frame; pixel data is loaded on demand
pub struct FrameDataHandle {
    pub number: i64,
    pub width: u32,
    pub height: u32,
    pub name: String,
    pub related_files: usize,
    pub deleted: bool,
    index: usize,
    is_playing: bool,
    forward_step: usize,
    job: Arc<JobCache>,
    workers: Arc<dyn WorkerPool>,
}

impl std::fmt::Debug for FrameDataHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDataHandle")
            .field("job", &self.job.job_id)
            .field("number", &self.number)
            .field("size", &(self.width, self.height))
            .field("name", &self.name)
            .field("deleted", &self.deleted)
            .finish()
    }
}

impl FrameDataHandle {
    /// Load the frame, blocking until it is available.
    /// `on_server_request` runs if the frame has to be fetched.
    pub fn data(&self, on_server_request: impl FnOnce()) -> Result<FrameImage> {
        self.request(on_server_request).wait()
    }

    /// Start loading the frame without blocking
    pub fn request(&self, on_server_request: impl FnOnce()) -> PendingFrame {
        let (tx, rx) = bounded(1);
        let pending = PendingFrame {
            job_id: self.job.job_id,
            frame: self.number,
            rx,
        };
        let mut responder = Responder::new(tx);

        if self.job.is_closed() {
            responder.resolve(Err(FrameError::JobClosed(self.job.job_id)));
            return pending;
        }

        if let Some(image) = self.job.decoded(self.number) {
            self.job.stats.record_hit();
            self.job
                .maybe_prefetch(self.index, self.is_playing, self.forward_step, self.workers.as_ref());
            responder.resolve(Ok(image));
            return pending;
        }

        self.job.stats.record_miss();
        self.job.record_request(self.index);
        on_server_request();

        let token = self.job.begin_request();
        let load = LoadRequest {
            frame: self.number,
            chunk: self.index / self.job.chunk_size,
            decode_forward: self.is_playing,
        };
        let job = Arc::clone(&self.job);
        self.workers.execute(Box::new(move || {
            let outcome = job.load_frame(&load, token, &mut responder);
            match &outcome {
                Err(err) if err.is_stale() => {
                    job.stats.record_stale();
                    trace!("Job {}: {}", job.job_id, err);
                }
                Err(err) => warn!("Job {}: frame {} failed: {}", job.job_id, load.frame, err),
                Ok(_) => {}
            }
            responder.resolve(outcome);
        }));
        pending
    }
}

/// Outcome of a frame request, delivered once
pub struct PendingFrame {
    job_id: u64,
    frame: i64,
    rx: Receiver<Result<FrameImage>>,
}

impl PendingFrame {
    pub fn frame(&self) -> i64 {
        self.frame
    }

    pub fn wait(self) -> Result<FrameImage> {
        // sender dropped without an answer: the load never ran
        self.rx.recv().unwrap_or(Err(FrameError::JobClosed(self.job_id)))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<FrameImage>> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(FrameError::JobClosed(self.job_id))),
        }
    }

    pub fn try_get(&self) -> Option<Result<FrameImage>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(FrameError::JobClosed(self.job_id))),
        }
    }
}

/// Frame caches of all open jobs
pub struct FrameCacheRegistry {
    config: CacheConfig,
    meta: MetaCache,
    context_source: Arc<dyn ContextImageSource>,
    decoders: Arc<dyn DecoderFactory>,
    workers: Arc<dyn WorkerPool>,
    jobs: Mutex<HashMap<u64, Arc<JobCache>>>,
    request_ids: Arc<AtomicU64>,
}

impl FrameCacheRegistry {
    pub fn new(
        config: CacheConfig,
        meta_source: Arc<dyn MetadataSource>,
        context_source: Arc<dyn ContextImageSource>,
        decoders: Arc<dyn DecoderFactory>,
        workers: Arc<dyn WorkerPool>,
    ) -> Self {
        Self {
            config,
            meta: MetaCache::new(meta_source),
            context_source,
            decoders,
            workers,
            jobs: Mutex::new(HashMap::new()),
            request_ids: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<u64, Arc<JobCache>>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cache of an open job
    pub fn job(&self, job_id: u64) -> Result<Arc<JobCache>> {
        self.jobs()
            .get(&job_id)
            .cloned()
            .ok_or(FrameError::NotInitialized(job_id))
    }

    fn open(&self, query: &FrameQuery, get_chunk: Arc<dyn ChunkSource>) -> Result<Arc<JobCache>> {
        if let Some(job) = self.jobs().get(&query.job_id) {
            return Ok(Arc::clone(job));
        }
        let meta = self.meta.get(SessionType::Job, query.job_id, false)?;
        let job = JobCache::new(
            query,
            &meta.read(),
            get_chunk,
            &self.config,
            self.decoders.as_ref(),
            Arc::clone(&self.request_ids),
        );
        let mut jobs = self.jobs();
        Ok(Arc::clone(jobs.entry(query.job_id).or_insert_with(|| Arc::new(job))))
    }

    /// Handle of a job frame. Opens the job on first use.
    pub fn get_frame(&self, query: &FrameQuery, get_chunk: Arc<dyn ChunkSource>) -> Result<FrameDataHandle> {
        let job = self.open(query, get_chunk)?;
        self.refresh_if_outdated(query.job_id)?;

        let meta = self.meta.get(SessionType::Job, query.job_id, false)?;
        let meta = meta.read();
        let data_frame = meta.data_frame_number(query.frame - job.start_frame);
        let index = meta.frame_index(data_frame)?;
        let info = meta.frame_info(data_frame)?;
        job.decoder().set_render_size(info.width, info.height);

        Ok(FrameDataHandle {
            number: query.frame,
            width: info.width,
            height: info.height,
            name: info.name.clone(),
            related_files: info.related_files,
            deleted: meta.is_deleted(query.frame),
            index,
            is_playing: query.is_playing,
            forward_step: query.step.max(1),
            job,
            workers: Arc::clone(&self.workers),
        })
    }

    /// Reload metadata of an open job if it is older than the configured
    /// period. Returns true if the job's decoded data was dropped because
    /// its chunks changed on the server.
    pub fn refresh_if_outdated(&self, job_id: u64) -> Result<bool> {
        let job = self.job(job_id)?;
        let Some(previous) = job.claim_refresh(self.config.meta_reload_period()) else {
            return Ok(false);
        };

        debug!("Job {}: metadata outdated, reloading", job_id);
        let meta = match self.meta.get(SessionType::Job, job_id, true) {
            Ok(meta) => meta,
            Err(err) => {
                job.cancel_refresh(previous);
                return Err(err);
            }
        };
        let chunks_updated = meta.read().chunks_updated_date();
        let invalidated = job.on_meta_refreshed(chunks_updated);
        if invalidated {
            info!("Job {}: chunks were updated on the server, decoded data dropped", job_id);
        }
        Ok(invalidated)
    }

    /// Context images of a job frame, keyed by related file index
    pub fn get_context_image(&self, job_id: u64, frame: i64) -> Result<ContextImages> {
        let job = self.job(job_id)?;
        let related_files = {
            let meta = self.meta.get_sync(job_id)?;
            let meta = meta.read();
            let data_frame = meta.data_frame_number(frame - job.start_frame);
            meta.frame_info(data_frame)?.related_files
        };
        job.context
            .get(job_id, frame, related_files, self.context_source.as_ref())
    }

    pub fn get_frames_meta(&self, session: SessionType, id: u64, force_reload: bool) -> Result<SharedMeta> {
        self.meta.get(session, id, force_reload)
    }

    pub fn get_job_frames_meta_sync(&self, job_id: u64) -> Result<SharedMeta> {
        self.meta.get_sync(job_id)
    }

    pub fn delete_frame(&self, job_id: u64, frame: i64) -> Result<()> {
        self.meta.get_sync(job_id)?.write().deleted_frames_mut().set(frame, true);
        Ok(())
    }

    pub fn restore_frame(&self, job_id: u64, frame: i64) -> Result<()> {
        self.meta.get_sync(job_id)?.write().deleted_frames_mut().unset(frame);
        Ok(())
    }

    /// Persist pending deleted-frame edits
    pub fn patch_meta(&self, job_id: u64) -> Result<SharedMeta> {
        self.meta.patch(job_id)
    }

    /// Walk from `from` to `to` (either direction) and return the
    /// `offset`-th frame passing the filters, or the last passing frame if
    /// fewer match.
    pub fn find_frame(&self, job_id: u64, from: i64, to: i64, filters: FindFilters) -> Result<Option<i64>> {
        let meta = self.meta.get(SessionType::Job, job_id, false)?;
        let meta = meta.read();
        let job_start = match meta.included_frames() {
            Some(_) => Some(self.job(job_id)?.start_frame),
            None => None,
        };
        let offset = filters.offset.max(1);

        let passes = |frame: i64| {
            if let (Some(included), Some(job_start)) = (meta.included_frames(), job_start) {
                let data_frame = meta.data_frame_number(frame - job_start);
                if included.binary_search(&data_frame).is_err() {
                    return false;
                }
            }
            !filters.not_deleted || !meta.is_deleted(frame)
        };

        let frames: Box<dyn Iterator<Item = i64>> = if to >= from {
            Box::new(from..=to)
        } else {
            Box::new((to..=from).rev())
        };

        let mut found = None;
        let mut count = 0;
        for frame in frames.filter(|&frame| passes(frame)) {
            found = Some(frame);
            count += 1;
            if count == offset {
                break;
            }
        }
        Ok(found)
    }

    /// Decoded chunk indices of a job; empty for jobs that are not open
    pub fn get_cached_chunks(&self, job_id: u64) -> Vec<usize> {
        self.job(job_id)
            .map(|job| job.cached_chunks())
            .unwrap_or_default()
    }

    pub fn get_job_frame_numbers(&self, job_id: u64) -> Result<Vec<i64>> {
        Ok(self.job(job_id)?.segment_frames.clone())
    }

    pub fn stats(&self, job_id: u64) -> Result<CacheStatsSnapshot> {
        Ok(self.job(job_id)?.stats())
    }

    /// Close a job: release decoded data and forget its metadata
    pub fn clear(&self, job_id: u64) {
        let job = self.jobs().remove(&job_id);
        if let Some(job) = job {
            job.close();
            info!("Job {}: frame cache cleared", job_id);
        }
        self.meta.remove(job_id);
    }
}
