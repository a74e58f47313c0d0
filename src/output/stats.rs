use super::{FrameConsumer, VideoFrame};
use crate::capture::CaptureError;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Frames between cadence log lines
const LOG_EVERY: u64 = 30;

#[derive(Debug, Clone, Default)]
pub struct StatsSummary {
    pub frames: u64,
    pub last_size: Option<(u32, u32)>,
    pub last_timestamp: Duration,
    pub snapshots: u32,
    pub error: Option<CaptureError>,
}

impl StatsSummary {
    /// Average delivered frame rate over the session so far
    pub fn average_fps(&self) -> f64 {
        if self.frames < 2 || self.last_timestamp.is_zero() {
            return 0.0;
        }
        (self.frames - 1) as f64 / self.last_timestamp.as_secs_f64()
    }
}

/// Read side of a `StatsSink`, usable from any thread
#[derive(Debug, Clone, Default)]
pub struct StatsHandle {
    summary: Arc<Mutex<StatsSummary>>,
}

impl StatsHandle {
    fn lock(&self) -> MutexGuard<'_, StatsSummary> {
        self.summary.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn summary(&self) -> StatsSummary {
        self.lock().clone()
    }

    pub fn failed(&self) -> bool {
        self.lock().error.is_some()
    }
}

/// Consumer that logs delivery cadence and optionally writes PNG snapshots
pub struct StatsSink {
    handle: StatsHandle,
    snapshot_dir: Option<PathBuf>,
    snapshot_every: u64,
    window_start: Duration,
}

impl StatsSink {
    pub fn new() -> (Self, StatsHandle) {
        let handle = StatsHandle::default();
        let sink = Self {
            handle: handle.clone(),
            snapshot_dir: None,
            snapshot_every: 0,
            window_start: Duration::ZERO,
        };
        (sink, handle)
    }

    /// Save every `every`th frame to `dir` as `frame-NNNNNN.png`
    pub fn with_snapshots(mut self, dir: impl Into<PathBuf>, every: u64) -> Self {
        self.snapshot_dir = Some(dir.into());
        self.snapshot_every = every.max(1);
        self
    }

    fn save_snapshot(&self, frame: &VideoFrame) -> bool {
        let Some(dir) = &self.snapshot_dir else {
            return false;
        };
        if frame.sequence % self.snapshot_every != 0 {
            return false;
        }

        let path = dir.join(format!("frame-{:06}.png", frame.sequence));
        match frame.image.save(&path) {
            Ok(()) => {
                tracing::debug!("Saved snapshot {}", path.display());
                true
            }
            Err(e) => {
                tracing::warn!("Failed to save snapshot {}: {}", path.display(), e);
                false
            }
        }
    }
}

impl FrameConsumer for StatsSink {
    fn on_frame(&mut self, frame: VideoFrame) {
        let saved = self.save_snapshot(&frame);

        let frames = {
            let mut summary = self.handle.lock();
            summary.frames += 1;
            summary.last_size = Some(frame.dimensions());
            summary.last_timestamp = frame.timestamp;
            if saved {
                summary.snapshots += 1;
            }
            summary.frames
        };

        if frames % LOG_EVERY == 0 {
            let elapsed = frame.timestamp.saturating_sub(self.window_start);
            let fps = if elapsed.is_zero() {
                0.0
            } else {
                LOG_EVERY as f64 / elapsed.as_secs_f64()
            };
            let (width, height) = frame.dimensions();
            tracing::info!(
                "Frame {}: {}x{}, t={:.3}s, fps={:.1}",
                frames,
                width,
                height,
                frame.timestamp.as_secs_f64(),
                fps
            );
            self.window_start = frame.timestamp;
        }
    }

    fn on_error(&mut self, error: &CaptureError) {
        tracing::error!("Capture session ended: {}", error);
        self.handle.lock().error = Some(error.clone());
    }
}
