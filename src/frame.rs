//! Captured frames.
//!
//! A `Frame` is the decoded image plus the sequence number assigned by the
//! stream reader and the wall-clock capture time. Exactly one frame is in
//! flight per camera worker; nothing in the pipeline buffers frames.

use std::io::Cursor;
use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

/// Default JPEG quality used when persisting violation frames.
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

pub struct Frame {
    /// Monotonic sequence number, counted from pipeline start (first frame is 1).
    /// Not reset on reconnect.
    pub seq: u64,
    pub captured_at: SystemTime,
    image: RgbImage,
}

impl Frame {
    pub fn new(seq: u64, captured_at: SystemTime, image: RgbImage) -> Self {
        Self {
            seq,
            captured_at,
            image,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Packed RGB8 pixels, row-major.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// Encode the frame as JPEG.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        if self.image.width() == 0 || self.image.height() == 0 {
            return Err(anyhow!("cannot encode an empty frame"));
        }
        let mut out = Cursor::new(Vec::new());
        let encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        self.image
            .write_with_encoder(encoder)
            .context("encode frame as jpeg")?;
        Ok(out.into_inner())
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Pixels are deliberately omitted.
        f.debug_struct("Frame")
            .field("seq", &self.seq)
            .field("captured_at", &self.captured_at)
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_frame(seq: u64) -> Frame {
        let image = RgbImage::from_fn(32, 24, |x, y| image::Rgb([x as u8 * 8, y as u8 * 10, 128]));
        Frame::new(seq, SystemTime::UNIX_EPOCH, image)
    }

    #[test]
    fn frame_exposes_dimensions_and_pixels() {
        let frame = make_test_frame(7);
        assert_eq!(frame.seq, 7);
        assert_eq!(frame.width(), 32);
        assert_eq!(frame.height(), 24);
        assert_eq!(frame.pixels().len(), 32 * 24 * 3);
    }

    #[test]
    fn frame_encodes_to_jpeg() -> Result<()> {
        let frame = make_test_frame(1);
        let jpeg = frame.encode_jpeg(DEFAULT_JPEG_QUALITY)?;
        // SOI marker
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg)?;
        assert_eq!(decoded.width(), 32);
        assert_eq!(decoded.height(), 24);
        Ok(())
    }

    #[test]
    fn empty_frame_does_not_encode() {
        let frame = Frame::new(1, SystemTime::UNIX_EPOCH, RgbImage::new(0, 0));
        assert!(frame.encode_jpeg(DEFAULT_JPEG_QUALITY).is_err());
    }
}
