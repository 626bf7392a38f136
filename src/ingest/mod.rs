//! Frame ingestion sources.
//!
//! A `FrameSource` wraps one camera's raw feed:
//! - RTSP streams (feature: rtsp-gstreamer)
//! - Synthetic `stub://` streams (tests, demos)
//!
//! Sources are driven by a single `VideoStream` thread. They never retry on their own:
//! a failed `connect` or `next_frame` is reported to the stream loop, which releases the
//! source, waits and tries again.

use anyhow::Result;

use crate::frame::Frame;

pub mod rtsp;

pub use rtsp::{RtspConfig, RtspSource, RtspStats};

/// One camera feed.
pub trait FrameSource: Send {
    /// Open the underlying capture. Called again after every `release`.
    fn connect(&mut self) -> Result<()>;

    /// True between a successful `connect` and the next `release`.
    fn is_connected(&self) -> bool;

    /// Block until the next decoded frame is available.
    fn next_frame(&mut self) -> Result<Frame>;

    /// Frame size of the open capture, once known.
    fn dimensions(&self) -> Option<(u32, u32)>;

    /// Drop the capture handle. Must be safe to call when not connected.
    fn release(&mut self);

    /// Human readable description for logs. Must not contain credentials.
    fn describe(&self) -> String;
}
