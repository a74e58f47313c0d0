//! Desktop and window capture devices.
//!
//! A [`DesktopCaptureDevice`] wraps a platform [`DesktopCapturer`] and turns
//! it into a video source: once started it grabs frames at the requested
//! cadence on its own execution context, normalizes them and hands them to
//! a single [`FrameConsumer`].

pub mod capture;
pub mod capture_core;
pub mod convert;
pub mod device;
pub mod error;
pub mod output;
pub mod params;
pub mod runner;
pub mod scheduler;

pub use capture::{
    CaptureError, CaptureTarget, CapturerFactory, DesktopCapturer, DesktopFrame, ScreenId,
    SyntheticDesktop, SyntheticWindow, WindowId,
};
pub use capture_core::{CaptureCore, CoreState, MAX_CONSECUTIVE_FAILURES};
pub use convert::FrameConverter;
pub use device::{DesktopCaptureDevice, DeviceOptions};
pub use error::DeviceError;
pub use output::{FrameConsumer, StatsHandle, StatsSink, StatsSummary, VideoFrame};
pub use params::{CaptureParams, ResolutionPolicy};
pub use runner::{CaptureThread, ExecutionContext, TaskRunner};
pub use scheduler::FrameScheduler;
