//! Scripted capturers and a recording consumer for device tests.

#![allow(dead_code)]

use deskcap::{
    CaptureError, CaptureTarget, CapturerFactory, DesktopCapturer, DesktopFrame, FrameConsumer,
    VideoFrame,
};
use image::RgbaImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type Outcome = dyn Fn(u64) -> Result<(), CaptureError> + Send + Sync;

/// Factory whose capturers follow a per-capture script.
///
/// `outcome` receives the 0-based index of each capture call.
#[derive(Clone)]
pub struct ScriptedFactory {
    target_exists: bool,
    init_error: Option<CaptureError>,
    capture_delay: Duration,
    frame_size: (u32, u32),
    outcome: Arc<Outcome>,
    captures: Arc<AtomicU64>,
    created: Arc<AtomicU64>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self {
            target_exists: true,
            init_error: None,
            capture_delay: Duration::ZERO,
            frame_size: (64, 48),
            outcome: Arc::new(|_: u64| -> Result<(), CaptureError> { Ok(()) }),
            captures: Arc::new(AtomicU64::new(0)),
            created: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn missing_target() -> Self {
        Self {
            target_exists: false,
            ..Self::new()
        }
    }

    pub fn failing_init(error: CaptureError) -> Self {
        Self {
            init_error: Some(error),
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = delay;
        self
    }

    pub fn with_outcome<F>(mut self, outcome: F) -> Self
    where
        F: Fn(u64) -> Result<(), CaptureError> + Send + Sync + 'static,
    {
        self.outcome = Arc::new(outcome);
        self
    }

    /// Capture calls started so far
    pub fn captures(&self) -> u64 {
        self.captures.load(Ordering::SeqCst)
    }

    /// Capturers instantiated so far
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }
}

impl CapturerFactory for ScriptedFactory {
    fn resolve(&self, target: CaptureTarget) -> Result<(), CaptureError> {
        if self.target_exists {
            Ok(())
        } else {
            Err(CaptureError::TargetLost(target))
        }
    }

    fn create(&self, target: CaptureTarget) -> Result<Box<dyn DesktopCapturer>, CaptureError> {
        if let Some(error) = &self.init_error {
            return Err(error.clone());
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedCapturer {
            target,
            script: self.clone(),
        }))
    }
}

struct ScriptedCapturer {
    target: CaptureTarget,
    script: ScriptedFactory,
}

impl DesktopCapturer for ScriptedCapturer {
    fn target(&self) -> CaptureTarget {
        self.target
    }

    fn capture_frame(&mut self) -> Result<DesktopFrame, CaptureError> {
        let index = self.script.captures.fetch_add(1, Ordering::SeqCst);
        if !self.script.capture_delay.is_zero() {
            thread::sleep(self.script.capture_delay);
        }
        (self.script.outcome)(index)?;

        let (width, height) = self.script.frame_size;
        Ok(DesktopFrame::new(width, height))
    }
}

#[derive(Default)]
pub struct Record {
    pub frames: Vec<(u64, Duration)>,
    pub errors: Vec<CaptureError>,
    pub last_image: Option<RgbaImage>,
}

/// Consumer that records everything it is given
pub struct RecordingConsumer {
    record: Arc<Mutex<Record>>,
}

#[derive(Clone, Default)]
pub struct Recorder {
    record: Arc<Mutex<Record>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consumer(&self) -> Box<dyn FrameConsumer> {
        Box::new(RecordingConsumer {
            record: Arc::clone(&self.record),
        })
    }

    pub fn frame_count(&self) -> usize {
        self.record.lock().unwrap().frames.len()
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.record
            .lock()
            .unwrap()
            .frames
            .iter()
            .map(|(sequence, _)| *sequence)
            .collect()
    }

    pub fn timestamps(&self) -> Vec<Duration> {
        self.record
            .lock()
            .unwrap()
            .frames
            .iter()
            .map(|(_, t)| *t)
            .collect()
    }

    pub fn errors(&self) -> Vec<CaptureError> {
        self.record.lock().unwrap().errors.clone()
    }

    pub fn last_image(&self) -> Option<RgbaImage> {
        self.record.lock().unwrap().last_image.clone()
    }

    pub fn wait_for_frames(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.frame_count() >= count)
    }

    pub fn wait_for_error(&self, timeout: Duration) -> bool {
        wait_until(timeout, || !self.errors().is_empty())
    }
}

impl FrameConsumer for RecordingConsumer {
    fn on_frame(&mut self, frame: VideoFrame) {
        let mut record = self.record.lock().unwrap();
        record.frames.push((frame.sequence, frame.timestamp));
        record.last_image = Some(frame.image);
    }

    fn on_error(&mut self, error: &CaptureError) {
        self.record.lock().unwrap().errors.push(error.clone());
    }
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}
