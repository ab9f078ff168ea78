//! Decoded pixel data handed out by the cache
//!
//! `Bitmap` is an immutable RGBA8 image. Pixels live behind an `Arc`, so a
//! bitmap can sit in the decoder's block ring, in the context-image cache and
//! in a caller's hands at the same time without copying. Dropping the last
//! clone releases the buffer.

use std::fmt;
use std::sync::Arc;

/// Bytes per RGBA8 pixel
pub const BYTES_PER_PIXEL: usize = 4;

/// Immutable RGBA8 image
#[derive(Clone)]
pub struct Bitmap {
    width: u32,
    height: u32,
    pixels: Arc<Vec<u8>>,
}

impl Bitmap {
    /// Wrap an RGBA8 buffer. Returns None if the buffer length does not
    /// match `width * height * 4`.
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        if pixels.len() != Self::byte_size(width, height) {
            return None;
        }
        Some(Self {
            width,
            height,
            pixels: Arc::new(pixels),
        })
    }

    /// Solid color bitmap (placeholders, tests)
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let mut pixels = vec![0u8; Self::byte_size(width, height)];
        for px in pixels.chunks_mut(BYTES_PER_PIXEL) {
            px.copy_from_slice(&rgba);
        }
        Self {
            width,
            height,
            pixels: Arc::new(pixels),
        }
    }

    /// Size in bytes of an RGBA8 image with the given dimensions
    pub fn byte_size(width: u32, height: u32) -> usize {
        width as usize * height as usize * BYTES_PER_PIXEL
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Memory footprint used for cache accounting (`width * height * 4`)
    pub fn mem(&self) -> usize {
        Self::byte_size(self.width, self.height)
    }

    /// True if both handles share the same pixel buffer
    pub fn ptr_eq(&self, other: &Bitmap) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// Resolved frame request
#[derive(Debug, Clone)]
pub struct FrameImage {
    pub render_width: u32,
    pub render_height: u32,
    pub image: Bitmap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rgba_checks_length() {
        assert!(Bitmap::from_rgba(2, 2, vec![0; 16]).is_some());
        assert!(Bitmap::from_rgba(2, 2, vec![0; 15]).is_none());
    }

    #[test]
    fn test_filled_and_mem() {
        let bmp = Bitmap::filled(3, 2, [1, 2, 3, 4]);
        assert_eq!(bmp.mem(), 24);
        assert_eq!(&bmp.pixels()[..4], &[1, 2, 3, 4]);
        assert_eq!(&bmp.pixels()[20..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_clone_shares_buffer() {
        let a = Bitmap::filled(1, 1, [0, 0, 0, 255]);
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&Bitmap::filled(1, 1, [0, 0, 0, 255])));
    }
}
