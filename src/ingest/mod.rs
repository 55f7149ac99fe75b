//! Frame ingestion.
//!
//! - `FrameSource`: one connection to a camera stream (connect/read/disconnect)
//! - `RtspSource`: RTSP cameras via GStreamer (feature `rtsp-gstreamer`), or
//!   synthetic frames for `stub://` locators
//! - `StreamReader`: owns a source and turns read failures into
//!   reconnect-with-backoff, so the worker never sees a transient stream error
//!
//! End of stream is treated the same as a failed read.

pub mod rtsp;
pub mod stream;

pub use rtsp::{RtspConfig, RtspSource};
pub use stream::{StreamReader, StreamState, StreamStats, DEFAULT_RECONNECT_BACKOFF};

use anyhow::Result;
use image::RgbImage;

/// A single camera connection.
pub trait FrameSource: Send {
    /// Open (or re-open) the stream. Called again after every failure.
    fn connect(&mut self) -> Result<()>;

    /// Block until the next decoded frame. `Ok(None)` means end of stream.
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;

    /// Release the connection. Must be safe to call when not connected.
    fn disconnect(&mut self);

    fn is_healthy(&self) -> bool {
        true
    }

    /// Stream locator, for logs.
    fn locator(&self) -> &str;
}
