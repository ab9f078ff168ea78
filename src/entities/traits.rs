//! Interfaces of the external collaborators the cache consumes.
//!
//! Network access (chunks, metadata, context images) and pixel decoding live
//! outside this crate. `core` depends only on these traits; concrete
//! implementations are injected into `FrameCacheRegistry`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use thiserror::Error;

use super::frame::Bitmap;
use super::meta::{RawMetadata, SessionType};

/// Requested chunk quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkQuality {
    Original,
    Compressed,
}

/// Chunk container reported for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Video,
    Imageset,
}

/// Block layout the decoder has to handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Mp4Video,
    Archive,
}

impl From<ChunkType> for BlockType {
    fn from(chunk_type: ChunkType) -> Self {
        match chunk_type {
            ChunkType::Video => BlockType::Mp4Video,
            ChunkType::Imageset => BlockType::Archive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Dimension {
    #[default]
    #[serde(rename = "2d")]
    D2,
    #[serde(rename = "3d")]
    D3,
}

/// Decoder failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Decoder dropped the block because a newer one was requested
    #[error("decode request is outdated")]
    Outdated,
    #[error("{0}")]
    Failed(String),
}

/// Context images of one frame, keyed by related-file index
pub type ContextImages = BTreeMap<usize, Bitmap>;

/// Fetches compressed chunks of one job
pub trait ChunkSource: Send + Sync {
    fn fetch_chunk(&self, chunk: usize, quality: ChunkQuality) -> anyhow::Result<Vec<u8>>;
}

impl<F> ChunkSource for F
where
    F: Fn(usize, ChunkQuality) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    fn fetch_chunk(&self, chunk: usize, quality: ChunkQuality) -> anyhow::Result<Vec<u8>> {
        self(chunk, quality)
    }
}

/// Fetches and persists frame metadata
pub trait MetadataSource: Send + Sync {
    fn fetch_meta(&self, session: SessionType, id: u64) -> anyhow::Result<RawMetadata>;

    /// Persist the full deleted-frame list, returning authoritative metadata
    fn save_meta(
        &self,
        session: SessionType,
        id: u64,
        deleted_frames: &[i64],
    ) -> anyhow::Result<RawMetadata>;
}

/// Fetches and decodes related (context) images
pub trait ContextImageSource: Send + Sync {
    fn fetch_context_images(&self, job_id: u64, frame: i64) -> anyhow::Result<Vec<u8>>;

    fn decode_context_images(&self, encoded: Vec<u8>, count: usize) -> anyhow::Result<ContextImages>;
}

/// Turns one compressed chunk into its frames. Holds no decoded state, so
/// it can run while the owning decoder keeps serving lookups.
pub trait BlockCodec: Send + Sync {
    /// Decode `frame_count` frames at `render_size`. `on_frame` fires with
    /// the position of each frame in the chunk as soon as it is ready.
    fn decode(
        &self,
        data: &[u8],
        frame_count: usize,
        render_size: (u32, u32),
        on_frame: &mut dyn FnMut(usize, &Bitmap),
    ) -> Result<Vec<Bitmap>, DecodeError>;

    /// Decode a chunk holding `frames` and pair every frame number with its
    /// bitmap
    fn decode_frames(
        &self,
        data: &[u8],
        chunk: usize,
        frames: &[i64],
        render_size: (u32, u32),
        on_frame: &mut dyn FnMut(i64, &Bitmap),
    ) -> Result<Vec<(i64, Bitmap)>, DecodeError> {
        if frames.is_empty() {
            return Err(DecodeError::Failed(format!("chunk {chunk} has no frames")));
        }
        let bitmaps = self.decode(data, frames.len(), render_size, &mut |position, bitmap| {
            if let Some(&frame) = frames.get(position) {
                on_frame(frame, bitmap);
            }
        })?;
        if bitmaps.len() != frames.len() {
            return Err(DecodeError::Failed(format!(
                "chunk {} decoded into {} frames, expected {}",
                chunk,
                bitmaps.len(),
                frames.len()
            )));
        }
        Ok(frames.iter().copied().zip(bitmaps).collect())
    }
}

/// Chunk decoder owning a bounded ring of decoded blocks.
///
/// Frames are addressed by job frame number. Decoding is split in two: the
/// `codec` unpacks a chunk without access to the ring, `insert_block` stores
/// the result.
pub trait FrameDecoder: Send {
    /// Decoded bitmap of a frame, if its block is cached
    fn frame(&self, frame: i64) -> Option<Bitmap>;

    fn is_chunk_cached(&self, chunk: usize) -> bool;

    fn codec(&self) -> Arc<dyn BlockCodec>;

    /// Store a decoded block. Fails once the decoder is closed.
    fn insert_block(&mut self, chunk: usize, frames: Vec<(i64, Bitmap)>) -> Result<(), DecodeError>;

    /// Decode a chunk holding `frames` and store it. `on_frame` fires as each
    /// frame becomes available; returning means the whole block is cached.
    fn decode_block(
        &mut self,
        data: Vec<u8>,
        chunk: usize,
        frames: &[i64],
        on_frame: &mut dyn FnMut(i64, &Bitmap),
    ) -> Result<(), DecodeError> {
        let decoded = self
            .codec()
            .decode_frames(&data, chunk, frames, self.render_size(), on_frame)?;
        self.insert_block(chunk, decoded)
    }

    /// Drop up to `count` decoded blocks, oldest first
    fn cleanup(&mut self, count: usize);

    /// Release every decoded block; the decoder is unusable afterwards
    fn close(&mut self);

    fn set_render_size(&mut self, width: u32, height: u32);

    fn render_size(&self) -> (u32, u32);

    fn cached_chunks(&self) -> Vec<usize>;
}

/// Builds one decoder per opened job
pub trait DecoderFactory: Send + Sync {
    fn create(
        &self,
        block_type: BlockType,
        blocks_cache_size: usize,
        dimension: Dimension,
    ) -> Box<dyn FrameDecoder>;
}

impl<F> DecoderFactory for F
where
    F: Fn(BlockType, usize, Dimension) -> Box<dyn FrameDecoder> + Send + Sync,
{
    fn create(
        &self,
        block_type: BlockType,
        blocks_cache_size: usize,
        dimension: Dimension,
    ) -> Box<dyn FrameDecoder> {
        self(block_type, blocks_cache_size, dimension)
    }
}

/// Background worker pool interface.
pub trait WorkerPool: Send + Sync {
    fn execute(&self, f: Box<dyn FnOnce() + Send + 'static>);

    /// Run `f` only if `current` still equals `epoch` when a worker picks it up
    fn execute_with_epoch(
        &self,
        current: Arc<AtomicU64>,
        epoch: u64,
        f: Box<dyn FnOnce() + Send + 'static>,
    );
}

impl<T: MetadataSource + ?Sized> MetadataSource for Arc<T> {
    fn fetch_meta(&self, session: SessionType, id: u64) -> anyhow::Result<RawMetadata> {
        (**self).fetch_meta(session, id)
    }

    fn save_meta(
        &self,
        session: SessionType,
        id: u64,
        deleted_frames: &[i64],
    ) -> anyhow::Result<RawMetadata> {
        (**self).save_meta(session, id, deleted_frames)
    }
}

impl<T: ContextImageSource + ?Sized> ContextImageSource for Arc<T> {
    fn fetch_context_images(&self, job_id: u64, frame: i64) -> anyhow::Result<Vec<u8>> {
        (**self).fetch_context_images(job_id, frame)
    }

    fn decode_context_images(&self, encoded: Vec<u8>, count: usize) -> anyhow::Result<ContextImages> {
        (**self).decode_context_images(encoded, count)
    }
}

impl<T: WorkerPool + ?Sized> WorkerPool for Arc<T> {
    fn execute(&self, f: Box<dyn FnOnce() + Send + 'static>) {
        (**self).execute(f)
    }

    fn execute_with_epoch(
        &self,
        current: Arc<AtomicU64>,
        epoch: u64,
        f: Box<dyn FnOnce() + Send + 'static>,
    ) {
        (**self).execute_with_epoch(current, epoch, f)
    }
}
