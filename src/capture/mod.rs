mod synthetic;

pub use synthetic::{SyntheticDesktop, SyntheticWindow};

use std::fmt;
use thiserror::Error;

pub type ScreenId = u32;
pub type WindowId = u64;

/// What a device captures. Fixed for the lifetime of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureTarget {
    Screen(ScreenId),
    Window(WindowId),
}

impl CaptureTarget {
    pub fn is_window(&self) -> bool {
        matches!(self, CaptureTarget::Window(_))
    }
}

impl fmt::Display for CaptureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureTarget::Screen(id) => write!(f, "screen {}", id),
            CaptureTarget::Window(id) => write!(f, "window {:#x}", id),
        }
    }
}

/// Raw pixels of one captured frame, 32-bit BGRA rows of `stride` bytes
#[derive(Debug, Clone)]
pub struct DesktopFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: usize,
}

impl DesktopFrame {
    pub const BYTES_PER_PIXEL: usize = 4;

    /// Allocate a black, tightly packed frame
    pub fn new(width: u32, height: u32) -> Self {
        let stride = width as usize * Self::BYTES_PER_PIXEL;
        Self {
            data: vec![0; stride * height as usize],
            width,
            height,
            stride,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Check that the buffer actually holds `height` rows of `width` pixels
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::InvalidFrame(format!(
                "empty frame {}x{}",
                self.width, self.height
            )));
        }

        let row_bytes = self.width as usize * Self::BYTES_PER_PIXEL;
        if self.stride < row_bytes {
            return Err(CaptureError::InvalidFrame(format!(
                "stride {} shorter than row of {} bytes",
                self.stride, row_bytes
            )));
        }

        let needed = self.stride * (self.height as usize - 1) + row_bytes;
        if self.data.len() < needed {
            return Err(CaptureError::InvalidFrame(format!(
                "buffer holds {} bytes, {}x{} needs {}",
                self.data.len(),
                self.width,
                self.height,
                needed
            )));
        }

        Ok(())
    }

    /// Pixel bytes of row `y`, without stride padding
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.data[start..start + self.width as usize * Self::BYTES_PER_PIXEL]
    }

    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.stride;
        let len = self.width as usize * Self::BYTES_PER_PIXEL;
        &mut self.data[start..start + len]
    }
}

/// Failures raised by capturers and reported to consumers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// The window was closed or the screen disconnected
    #[error("capture target {0} no longer exists")]
    TargetLost(CaptureTarget),

    /// A single capture call failed but the target is still there
    #[error("transient capture failure: {0}")]
    Temporary(String),

    /// The platform capturer could not be instantiated
    #[error("failed to initialize capturer for {target}: {reason}")]
    InitFailed { target: CaptureTarget, reason: String },

    /// The capturer returned a buffer that does not match its dimensions
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Too many transient failures in a row
    #[error("{target} failed {failures} consecutive captures, last error: {last}")]
    RepeatedFailures {
        target: CaptureTarget,
        failures: u32,
        last: String,
    },
}

impl CaptureError {
    /// Whether the error ends the capture session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CaptureError::TargetLost(_)
                | CaptureError::InitFailed { .. }
                | CaptureError::RepeatedFailures { .. }
        )
    }
}

/// Platform grabber for one screen or window.
///
/// Every method is called from the device's execution context only, and
/// `capture_frame` is allowed to block.
pub trait DesktopCapturer: Send {
    fn target(&self) -> CaptureTarget;

    /// Capture a single frame
    fn capture_frame(&mut self) -> Result<DesktopFrame, CaptureError>;

    /// Leave this window out of subsequent frames
    fn set_excluded_window(&mut self, _window: WindowId) {
        // Default implementation: window capturers have nothing to exclude
    }
}

/// Builds platform capturers for targets
pub trait CapturerFactory: Send + Sync {
    /// Cheap existence check, run on the caller's thread when a device is created
    fn resolve(&self, target: CaptureTarget) -> Result<(), CaptureError>;

    /// Instantiate the capturer. Runs on the execution context.
    fn create(&self, target: CaptureTarget) -> Result<Box<dyn DesktopCapturer>, CaptureError>;
}
