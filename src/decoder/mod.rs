//! Reference chunk decoder
//!
//! `BlockDecoder` implements `FrameDecoder` on top of a pluggable
//! `BlockCodec` that turns one chunk buffer into per-frame bitmaps. Decoded
//! blocks live in an LRU ring sized by the cache (`blocks_cache_size`), so
//! memory stays bounded no matter how far the user scrubs. The codec is
//! shared out through `codec()` so chunks decode without locking the ring.
//!
//! Codecs shipped here:
//! - `RawRgbaCodec`: chunk is the concatenation of equally sized RGBA8 frames
//!   at the current render size

use log::{debug, trace};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;

pub use crate::entities::BlockCodec;
use crate::entities::{Bitmap, BlockType, DecodeError, Dimension, FrameDecoder};

/// Chunk = `frame_count` RGBA8 frames back to back, each `w * h * 4` bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct RawRgbaCodec;

impl BlockCodec for RawRgbaCodec {
    fn decode(
        &self,
        data: &[u8],
        frame_count: usize,
        (width, height): (u32, u32),
        on_frame: &mut dyn FnMut(usize, &Bitmap),
    ) -> Result<Vec<Bitmap>, DecodeError> {
        let frame_size = Bitmap::byte_size(width, height);
        if frame_size == 0 {
            return Err(DecodeError::Failed("render size is not set".into()));
        }
        if data.len() != frame_size * frame_count {
            return Err(DecodeError::Failed(format!(
                "chunk holds {} bytes, expected {} frames of {}x{}",
                data.len(),
                frame_count,
                width,
                height
            )));
        }
        let mut bitmaps = Vec::with_capacity(frame_count);
        for (position, pixels) in data.chunks_exact(frame_size).enumerate() {
            let bitmap = Bitmap::from_rgba(width, height, pixels.to_vec())
                .ok_or_else(|| DecodeError::Failed(format!("frame {position} has a bad pixel buffer")))?;
            on_frame(position, &bitmap);
            bitmaps.push(bitmap);
        }
        Ok(bitmaps)
    }
}

/// Frames of one decoded chunk
#[derive(Debug)]
struct DecodedBlock {
    frames: Vec<(i64, Bitmap)>,
}

/// `FrameDecoder` keeping the most recent decoded blocks in an LRU ring
pub struct BlockDecoder<C: BlockCodec> {
    codec: Arc<C>,
    block_type: BlockType,
    dimension: Dimension,
    blocks: LruCache<usize, DecodedBlock>,
    render_size: (u32, u32),
    closed: bool,
}

impl<C: BlockCodec> BlockDecoder<C> {
    pub fn new(codec: C, block_type: BlockType, blocks_cache_size: usize, dimension: Dimension) -> Self {
        let capacity = NonZeroUsize::new(blocks_cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        debug!(
            "BlockDecoder created: {:?} {:?}, {} decoded blocks",
            block_type, dimension, capacity
        );
        Self {
            codec: Arc::new(codec),
            block_type,
            dimension,
            blocks: LruCache::new(capacity),
            render_size: (0, 0),
            closed: false,
        }
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn dimension(&self) -> Dimension {
        self.dimension
    }

    pub fn capacity(&self) -> usize {
        self.blocks.cap().get()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<C: BlockCodec + 'static> FrameDecoder for BlockDecoder<C> {
    fn frame(&self, frame: i64) -> Option<Bitmap> {
        self.blocks.iter().find_map(|(_, block)| {
            block
                .frames
                .iter()
                .find(|(number, _)| *number == frame)
                .map(|(_, bitmap)| bitmap.clone())
        })
    }

    fn is_chunk_cached(&self, chunk: usize) -> bool {
        self.blocks.contains(&chunk)
    }

    fn codec(&self) -> Arc<dyn BlockCodec> {
        Arc::clone(&self.codec) as Arc<dyn BlockCodec>
    }

    fn insert_block(&mut self, chunk: usize, frames: Vec<(i64, Bitmap)>) -> Result<(), DecodeError> {
        if self.closed {
            return Err(DecodeError::Failed("decoder is closed".into()));
        }
        let count = frames.len();
        if let Some((evicted, _)) = self.blocks.push(chunk, DecodedBlock { frames }) {
            if evicted != chunk {
                trace!("Decoded block {} evicted", evicted);
            }
        }
        trace!("Chunk {} decoded ({} frames)", chunk, count);
        Ok(())
    }

    fn cleanup(&mut self, count: usize) {
        let mut removed = 0;
        while removed < count && self.blocks.pop_lru().is_some() {
            removed += 1;
        }
        if removed > 0 {
            debug!("Released {} decoded blocks", removed);
        }
    }

    fn close(&mut self) {
        self.blocks.clear();
        self.closed = true;
    }

    fn set_render_size(&mut self, width: u32, height: u32) {
        self.render_size = (width, height);
    }

    fn render_size(&self) -> (u32, u32) {
        self.render_size
    }

    fn cached_chunks(&self) -> Vec<usize> {
        let mut chunks: Vec<usize> = self.blocks.iter().map(|(chunk, _)| *chunk).collect();
        chunks.sort_unstable();
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Chunk of `frames.len()` 2x2 frames, each filled with its frame number
    fn raw_chunk(frames: &[i64]) -> Vec<u8> {
        frames
            .iter()
            .flat_map(|f| std::iter::repeat_n(*f as u8, 16))
            .collect()
    }

    fn decoder(blocks: usize) -> BlockDecoder<RawRgbaCodec> {
        let mut decoder = BlockDecoder::new(RawRgbaCodec, BlockType::Archive, blocks, Dimension::D2);
        decoder.set_render_size(2, 2);
        decoder
    }

    #[test]
    fn test_decode_and_lookup() {
        let mut dec = decoder(2);
        let frames = [4, 5, 6];
        let mut seen = Vec::new();
        dec.decode_block(raw_chunk(&frames), 1, &frames, &mut |f, _| seen.push(f))
            .unwrap();

        assert_eq!(seen, vec![4, 5, 6]);
        assert!(dec.is_chunk_cached(1));
        assert_eq!(dec.frame(5).unwrap().pixels()[0], 5);
        assert!(dec.frame(7).is_none());
    }

    #[test]
    fn test_ring_evicts_least_recent_block() {
        let mut dec = decoder(2);
        for chunk in 0..3usize {
            let frames = [chunk as i64 * 2, chunk as i64 * 2 + 1];
            dec.decode_block(raw_chunk(&frames), chunk, &frames, &mut |_, _| {})
                .unwrap();
        }
        assert_eq!(dec.cached_chunks(), vec![1, 2]);
        assert!(dec.frame(0).is_none());
    }

    #[test]
    fn test_size_mismatch_fails() {
        let mut dec = decoder(2);
        let err = dec
            .decode_block(vec![0; 10], 0, &[0, 1], &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(err, DecodeError::Failed(_)));
        assert!(dec.cached_chunks().is_empty());
    }

    #[test]
    fn test_cleanup_and_close() {
        let mut dec = decoder(4);
        for chunk in 0..3usize {
            let frames = [chunk as i64];
            dec.decode_block(raw_chunk(&frames), chunk, &frames, &mut |_, _| {})
                .unwrap();
        }
        dec.cleanup(1);
        assert_eq!(dec.cached_chunks(), vec![1, 2]);
        dec.cleanup(usize::MAX);
        assert!(dec.cached_chunks().is_empty());

        dec.close();
        assert!(dec.is_closed());
        let frames = [0];
        assert!(dec.decode_block(raw_chunk(&frames), 0, &frames, &mut |_, _| {}).is_err());
    }

    #[test]
    fn test_codec_decodes_apart_from_ring() {
        let mut dec = decoder(2);
        let codec = dec.codec();
        let frames = [8, 9];
        let mut ready = Vec::new();
        let decoded = codec
            .decode_frames(&raw_chunk(&frames), 4, &frames, dec.render_size(), &mut |f, _| ready.push(f))
            .unwrap();
        assert_eq!(ready, vec![8, 9]);
        assert!(!dec.is_chunk_cached(4));

        dec.insert_block(4, decoded).unwrap();
        assert_eq!(dec.frame(9).unwrap().pixels()[0], 9);

        dec.close();
        assert!(dec.insert_block(5, Vec::new()).is_err());
    }
}
