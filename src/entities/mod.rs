//! Entities - plain data types and collaborator interfaces
//!
//! Nothing here knows about threads or caching policy; `core` builds the
//! cache on top of these types.

pub mod frame;
pub mod meta;
pub mod traits;

pub use frame::{Bitmap, FrameImage};
pub use meta::{DeletedFrames, FrameEdit, FrameInfo, FramesMetaData, RawMetadata, SessionType};
pub use traits::{
    BlockCodec, BlockType, ChunkQuality, ChunkSource, ChunkType, ContextImageSource, ContextImages,
    DecodeError, DecoderFactory, Dimension, FrameDecoder, MetadataSource, WorkerPool,
};
