mod stats;

pub use stats::{StatsHandle, StatsSink, StatsSummary};

use crate::capture::CaptureError;
use image::RgbaImage;
use std::time::Duration;

/// A frame ready for the consumer: packed RGBA with even dimensions
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub image: RgbaImage,
    /// Capture time relative to the start of the session
    pub timestamp: Duration,
    /// Index of the frame within the session, starting at 0
    pub sequence: u64,
}

impl VideoFrame {
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.image.as_raw()
    }
}

/// Receiver of captured frames for one session.
///
/// Callbacks run on the device's execution context. They must return
/// quickly and must not call back into the device that invokes them.
pub trait FrameConsumer: Send {
    /// Deliver a captured frame
    fn on_frame(&mut self, frame: VideoFrame);

    /// Report that the session ended because of a capture failure.
    /// Called at most once per session.
    fn on_error(&mut self, error: &CaptureError);
}
