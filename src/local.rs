//! Filesystem-backed collaborators
//!
//! A store directory holds metadata, chunks and context images per job:
//!
//! ```text
//! <root>/job/<id>/meta.json
//! <root>/job/<id>/chunks/compressed/<index>.bin
//! <root>/job/<id>/chunks/original/<index>.bin
//! <root>/job/<id>/context/<frame>.bin
//! <root>/task/<id>/meta.json
//! ```
//!
//! Chunks are raw RGBA frames back to back (see `RawRgbaCodec`). A context
//! file is a little-endian `u32` image count followed by `width`, `height`
//! and RGBA pixels of each image.

use anyhow::{Context, Result, anyhow, bail, ensure};
use chrono::Utc;
use log::{debug, info, trace};
use std::path::{Path, PathBuf};

use crate::entities::{
    Bitmap, ChunkQuality, ChunkSource, ContextImageSource, ContextImages, FrameInfo, MetadataSource,
    RawMetadata, SessionType,
};

const META_FILE: &str = "meta.json";

#[derive(Debug, Clone)]
pub struct LocalJobStore {
    root: PathBuf,
}

impl LocalJobStore {
    /// Open an existing store directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        ensure!(root.is_dir(), "store directory not found: {}", root.display());
        Ok(Self { root })
    }

    /// Open a store directory, creating it if needed
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create store directory: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session: SessionType, id: u64) -> PathBuf {
        self.root.join(session.to_string()).join(id.to_string())
    }

    fn meta_path(&self, session: SessionType, id: u64) -> PathBuf {
        self.session_dir(session, id).join(META_FILE)
    }

    fn chunk_path(&self, job_id: u64, chunk: usize, quality: ChunkQuality) -> PathBuf {
        let quality = match quality {
            ChunkQuality::Original => "original",
            ChunkQuality::Compressed => "compressed",
        };
        self.session_dir(SessionType::Job, job_id)
            .join("chunks")
            .join(quality)
            .join(format!("{chunk}.bin"))
    }

    fn context_path(&self, job_id: u64, frame: i64) -> PathBuf {
        self.session_dir(SessionType::Job, job_id)
            .join("context")
            .join(format!("{frame}.bin"))
    }

    pub fn read_meta(&self, session: SessionType, id: u64) -> Result<RawMetadata> {
        let path = self.meta_path(session, id);
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read metadata: {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("Failed to parse metadata: {}", path.display()))
    }

    pub fn write_meta(&self, session: SessionType, id: u64, meta: &RawMetadata) -> Result<()> {
        let json = serde_json::to_string_pretty(meta).context("Failed to serialize metadata")?;
        write_atomic(&self.meta_path(session, id), json.as_bytes())
    }

    pub fn write_chunk(&self, job_id: u64, chunk: usize, quality: ChunkQuality, data: &[u8]) -> Result<()> {
        write_atomic(&self.chunk_path(job_id, chunk, quality), data)
    }

    pub fn write_context_images(&self, job_id: u64, frame: i64, images: &[Bitmap]) -> Result<()> {
        write_atomic(&self.context_path(job_id, frame), &encode_context_images(images))
    }

    /// Write a job of `frames` solid-colored frames, chunked by `chunk_size`.
    /// Frame `i` is filled with `synthetic_color(i)`.
    pub fn write_synthetic_job(
        &self,
        job_id: u64,
        frames: usize,
        chunk_size: usize,
        (width, height): (u32, u32),
        related_files: usize,
    ) -> Result<RawMetadata> {
        ensure!(frames > 0, "a job needs at least one frame");
        ensure!(chunk_size > 0, "chunk size must be positive");

        let bitmaps: Vec<Bitmap> = (0..frames)
            .map(|i| Bitmap::filled(width, height, synthetic_color(i)))
            .collect();
        for (chunk, block) in bitmaps.chunks(chunk_size).enumerate() {
            let data: Vec<u8> = block.iter().flat_map(|b| b.pixels().iter().copied()).collect();
            self.write_chunk(job_id, chunk, ChunkQuality::Compressed, &data)?;
            self.write_chunk(job_id, chunk, ChunkQuality::Original, &data)?;
        }
        if related_files > 0 {
            for frame in 0..frames {
                let images: Vec<Bitmap> = (0..related_files)
                    .map(|i| Bitmap::filled(width / 2 + 1, height / 2 + 1, [i as u8, frame as u8, 0, 255]))
                    .collect();
                self.write_context_images(job_id, frame as i64, &images)?;
            }
        }

        let meta = RawMetadata {
            chunk_size,
            size: frames,
            image_quality: 70,
            start_frame: 0,
            stop_frame: frames as i64 - 1,
            frame_filter: String::new(),
            included_frames: None,
            deleted_frames: Vec::new(),
            frames: (0..frames)
                .map(|i| FrameInfo {
                    width,
                    height,
                    name: format!("frame_{i:06}.png"),
                    related_files,
                })
                .collect(),
            chunks_updated_date: Utc::now(),
        };
        self.write_meta(SessionType::Job, job_id, &meta)?;
        info!("Generated job {} with {} frames in {}", job_id, frames, self.root.display());
        Ok(meta)
    }

    /// Chunk source of one job
    pub fn chunks(&self, job_id: u64) -> LocalChunks {
        LocalChunks {
            store: self.clone(),
            job_id,
        }
    }
}

impl MetadataSource for LocalJobStore {
    fn fetch_meta(&self, session: SessionType, id: u64) -> Result<RawMetadata> {
        debug!("Reading {} {} metadata from {}", session, id, self.root.display());
        self.read_meta(session, id)
    }

    fn save_meta(&self, session: SessionType, id: u64, deleted_frames: &[i64]) -> Result<RawMetadata> {
        let mut meta = self.read_meta(session, id)?;
        meta.deleted_frames = deleted_frames.to_vec();
        meta.deleted_frames.sort_unstable();
        meta.deleted_frames.dedup();
        self.write_meta(session, id, &meta)?;
        debug!("Saved {} deleted frames of {} {}", meta.deleted_frames.len(), session, id);
        Ok(meta)
    }
}

impl ContextImageSource for LocalJobStore {
    fn fetch_context_images(&self, job_id: u64, frame: i64) -> Result<Vec<u8>> {
        let path = self.context_path(job_id, frame);
        std::fs::read(&path).with_context(|| format!("Failed to read context images: {}", path.display()))
    }

    fn decode_context_images(&self, encoded: Vec<u8>, count: usize) -> Result<ContextImages> {
        let images = decode_context_images(&encoded)?;
        ensure!(
            images.len() >= count,
            "expected {} context images, found {}",
            count,
            images.len()
        );
        Ok(images.into_iter().take(count).enumerate().collect())
    }
}

/// Chunks of one job in a `LocalJobStore`
#[derive(Debug, Clone)]
pub struct LocalChunks {
    store: LocalJobStore,
    job_id: u64,
}

impl ChunkSource for LocalChunks {
    fn fetch_chunk(&self, chunk: usize, quality: ChunkQuality) -> Result<Vec<u8>> {
        let path = self.store.chunk_path(self.job_id, chunk, quality);
        trace!("Reading chunk {}", path.display());
        std::fs::read(&path).with_context(|| format!("Failed to read chunk: {}", path.display()))
    }
}

/// Fill color of synthetic frame `index`
pub fn synthetic_color(index: usize) -> [u8; 4] {
    [index as u8, (index * 7) as u8, (index * 13) as u8, 255]
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("no parent directory: {}", path.display()))?;
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, data)
        .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;
    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e).with_context(|| format!("Failed to rename into place: {}", path.display()));
    }
    Ok(())
}

pub fn encode_context_images(images: &[Bitmap]) -> Vec<u8> {
    let body: usize = images.iter().map(|image| 8 + image.mem()).sum();
    let mut out = Vec::with_capacity(4 + body);
    out.extend_from_slice(&(images.len() as u32).to_le_bytes());
    for image in images {
        out.extend_from_slice(&image.width().to_le_bytes());
        out.extend_from_slice(&image.height().to_le_bytes());
        out.extend_from_slice(image.pixels());
    }
    out
}

pub fn decode_context_images(data: &[u8]) -> Result<Vec<Bitmap>> {
    let mut cursor = data;
    let count = read_u32(&mut cursor)? as usize;
    let mut images = Vec::with_capacity(count);
    for index in 0..count {
        let width = read_u32(&mut cursor)?;
        let height = read_u32(&mut cursor)?;
        let size = Bitmap::byte_size(width, height);
        if cursor.len() < size {
            bail!("context image {} truncated: {} of {} bytes", index, cursor.len(), size);
        }
        let (pixels, rest) = cursor.split_at(size);
        let image = Bitmap::from_rgba(width, height, pixels.to_vec())
            .ok_or_else(|| anyhow!("context image {index} has invalid size {width}x{height}"))?;
        images.push(image);
        cursor = rest;
    }
    Ok(images)
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32> {
    if cursor.len() < 4 {
        bail!("unexpected end of context image data");
    }
    let (head, rest) = cursor.split_at(4);
    *cursor = rest;
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(head);
    Ok(u32::from_le_bytes(bytes))
}
