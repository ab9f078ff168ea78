//! In-memory collaborators for unit tests

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::decoder::{BlockDecoder, RawRgbaCodec};
use crate::entities::{
    Bitmap, BlockType, ChunkQuality, ChunkSource, ContextImageSource, ContextImages, Dimension,
    FrameDecoder, FrameInfo, MetadataSource, RawMetadata, SessionType,
};

/// Barrier a collaborator call blocks on until the test opens it
#[derive(Clone)]
pub struct Gate {
    state: Arc<(Mutex<(bool, usize)>, Condvar)>,
}

impl Gate {
    pub fn closed() -> Self {
        Self {
            state: Arc::new((Mutex::new((false, 0)), Condvar::new())),
        }
    }

    /// Called by the collaborator: count the arrival, block while closed
    pub fn pass(&self) {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock().unwrap();
        state.1 += 1;
        cvar.notify_all();
        while !state.0 {
            state = cvar.wait(state).unwrap();
        }
    }

    pub fn open(&self) {
        let (lock, cvar) = &*self.state;
        lock.lock().unwrap().0 = true;
        cvar.notify_all();
    }

    /// Block until `count` calls reached the gate
    pub fn wait_entered(&self, count: usize) {
        let (lock, cvar) = &*self.state;
        let state = lock.lock().unwrap();
        let (state, timeout) = cvar
            .wait_timeout_while(state, Duration::from_secs(5), |s| s.1 < count)
            .unwrap();
        assert!(!timeout.timed_out(), "gate reached {} of {} times", state.1, count);
    }
}

pub fn frame_infos(count: usize, width: u32, height: u32, related_files: usize) -> Vec<FrameInfo> {
    (0..count)
        .map(|i| FrameInfo {
            width,
            height,
            name: format!("frame_{i:06}.png"),
            related_files,
        })
        .collect()
}

/// Metadata of `count` 2x2 frames starting at data frame 0
pub fn raw_meta(count: i64, chunk_size: usize) -> RawMetadata {
    RawMetadata {
        chunk_size,
        size: count as usize,
        image_quality: 70,
        start_frame: 0,
        stop_frame: count - 1,
        frame_filter: String::new(),
        included_frames: None,
        deleted_frames: Vec::new(),
        frames: frame_infos(count as usize, 2, 2, 0),
        chunks_updated_date: DateTime::<Utc>::default(),
    }
}

pub fn raw_decoder_factory() -> impl Fn(BlockType, usize, Dimension) -> Box<dyn FrameDecoder> + Send + Sync {
    |block_type, blocks, dimension| {
        Box::new(BlockDecoder::new(RawRgbaCodec, block_type, blocks, dimension)) as Box<dyn FrameDecoder>
    }
}

/// Serves raw 2x2 RGBA chunks; every pixel byte is the frame's segment index
pub struct CountingChunkSource {
    chunk_size: usize,
    total_frames: usize,
    fetches: AtomicUsize,
    per_chunk: Mutex<HashMap<usize, usize>>,
    gate: Option<Gate>,
    failing: Mutex<Option<usize>>,
}

impl CountingChunkSource {
    pub fn new(chunk_size: usize, total_frames: usize) -> Self {
        Self {
            chunk_size,
            total_frames,
            fetches: AtomicUsize::new(0),
            per_chunk: Mutex::new(HashMap::new()),
            gate: None,
            failing: Mutex::new(None),
        }
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn fail_chunk(&self, chunk: Option<usize>) {
        *self.failing.lock().unwrap() = chunk;
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn fetches_of(&self, chunk: usize) -> usize {
        self.per_chunk.lock().unwrap().get(&chunk).copied().unwrap_or(0)
    }

    /// Wait until `count` fetches were issued
    pub fn wait_fetches(&self, count: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.fetches() < count {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl ChunkSource for CountingChunkSource {
    fn fetch_chunk(&self, chunk: usize, _quality: ChunkQuality) -> anyhow::Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        *self.per_chunk.lock().unwrap().entry(chunk).or_default() += 1;
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        if *self.failing.lock().unwrap() == Some(chunk) {
            anyhow::bail!("chunk {chunk} unavailable");
        }
        let first = chunk * self.chunk_size;
        let last = (first + self.chunk_size).min(self.total_frames);
        Ok((first..last)
            .flat_map(|index| std::iter::repeat_n(index as u8, Bitmap::byte_size(2, 2)))
            .collect())
    }
}

/// Metadata server keeping one payload per id
pub struct MemoryMetaSource {
    payloads: Mutex<HashMap<(SessionType, u64), RawMetadata>>,
    fetches: AtomicUsize,
    saves: AtomicUsize,
    fail_fetch: AtomicBool,
    panic_fetch: AtomicBool,
    gate: Mutex<Option<Gate>>,
}

impl MemoryMetaSource {
    pub fn new() -> Self {
        Self {
            payloads: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
            fail_fetch: AtomicBool::new(false),
            panic_fetch: AtomicBool::new(false),
            gate: Mutex::new(None),
        }
    }

    pub fn with_job(self, id: u64, raw: RawMetadata) -> Self {
        self.set(SessionType::Job, id, raw);
        self
    }

    pub fn set(&self, session: SessionType, id: u64, raw: RawMetadata) {
        self.payloads.lock().unwrap().insert((session, id), raw);
    }

    pub fn get(&self, session: SessionType, id: u64) -> Option<RawMetadata> {
        self.payloads.lock().unwrap().get(&(session, id)).cloned()
    }

    pub fn set_gate(&self, gate: Option<Gate>) {
        *self.gate.lock().unwrap() = gate;
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_fetch.store(failing, Ordering::SeqCst);
    }

    /// Make the next fetches panic inside the collaborator
    pub fn set_panicking(&self, panicking: bool) {
        self.panic_fetch.store(panicking, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl MetadataSource for MemoryMetaSource {
    fn fetch_meta(&self, session: SessionType, id: u64) -> anyhow::Result<RawMetadata> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.pass();
        }
        if self.panic_fetch.load(Ordering::SeqCst) {
            panic!("metadata service crashed");
        }
        if self.fail_fetch.load(Ordering::SeqCst) {
            anyhow::bail!("metadata service unavailable");
        }
        self.get(session, id)
            .ok_or_else(|| anyhow::anyhow!("{session} {id} not found"))
    }

    fn save_meta(
        &self,
        session: SessionType,
        id: u64,
        deleted_frames: &[i64],
    ) -> anyhow::Result<RawMetadata> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let mut payloads = self.payloads.lock().unwrap();
        let raw = payloads
            .get_mut(&(session, id))
            .ok_or_else(|| anyhow::anyhow!("{session} {id} not found"))?;
        raw.deleted_frames = deleted_frames.to_vec();
        Ok(raw.clone())
    }
}

/// Context images: `count` solid images per frame
pub struct MemoryContextSource {
    width: u32,
    height: u32,
    fetches: AtomicUsize,
    gate: Option<Gate>,
    failing_frame: Option<i64>,
}

impl MemoryContextSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            fetches: AtomicUsize::new(0),
            gate: None,
            failing_frame: None,
        }
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn failing_frame(mut self, frame: i64) -> Self {
        self.failing_frame = Some(frame);
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ContextImageSource for MemoryContextSource {
    fn fetch_context_images(&self, _job_id: u64, frame: i64) -> anyhow::Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        if self.failing_frame == Some(frame) {
            anyhow::bail!("no context images for frame {frame}");
        }
        Ok(frame.to_le_bytes().to_vec())
    }

    fn decode_context_images(&self, encoded: Vec<u8>, count: usize) -> anyhow::Result<ContextImages> {
        let marker = encoded.first().copied().unwrap_or_default();
        Ok((0..count)
            .map(|i| (i, Bitmap::filled(self.width, self.height, [marker, i as u8, 0, 255])))
            .collect())
    }
}
