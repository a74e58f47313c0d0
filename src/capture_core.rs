//! Capture state machine shared between a device and its execution context.
//!
//! Requests from the device are posted to the execution context as tasks
//! holding a strong handle on the core, so they run even if the device is
//! dropped right after posting. Ticks only hold a weak handle.
//!
//! ```text
//! Idle -> Starting -> Running -> Stopping -> Idle
//!                        |
//!                        +-> Error -> Idle
//! ```

use crate::capture::{CaptureError, CaptureTarget, CapturerFactory, DesktopCapturer, WindowId};
use crate::convert::FrameConverter;
use crate::output::{FrameConsumer, VideoFrame};
use crate::params::CaptureParams;
use crate::runner::TaskRunner;
use crate::scheduler::FrameScheduler;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

/// Transient failures in a row before a session is treated as lost
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoreState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Error = 4,
}

impl CoreState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CoreState::Starting,
            2 => CoreState::Running,
            3 => CoreState::Stopping,
            4 => CoreState::Error,
            _ => CoreState::Idle,
        }
    }
}

/// Consumer registration for one session, plus its pending-stop flag.
///
/// Every delivery holds the slot lock and checks the flag, and a stop request
/// sets the flag under the same lock. Once `request_stop` returns, no
/// callback can reach the consumer.
pub struct ConsumerSlot {
    inner: Mutex<SlotInner>,
}

struct SlotInner {
    consumer: Option<Box<dyn FrameConsumer>>,
    stop_pending: bool,
}

impl ConsumerSlot {
    fn new(consumer: Box<dyn FrameConsumer>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SlotInner {
                consumer: Some(consumer),
                stop_pending: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called from the device side. Waits at most for a delivery that is
    /// already inside the consumer, never for a capture.
    pub fn request_stop(&self) {
        self.lock().stop_pending = true;
    }

    pub fn is_stop_pending(&self) -> bool {
        self.lock().stop_pending
    }

    /// True once the session ended and its consumer was dropped, whether
    /// through a stop or a fatal error.
    pub fn is_released(&self) -> bool {
        self.lock().consumer.is_none()
    }

    fn deliver_frame(&self, frame: VideoFrame) -> bool {
        let mut inner = self.lock();
        if inner.stop_pending {
            return false;
        }
        match inner.consumer.as_mut() {
            Some(consumer) => {
                consumer.on_frame(frame);
                true
            }
            None => false,
        }
    }

    fn deliver_error(&self, error: &CaptureError) -> bool {
        let mut inner = self.lock();
        if inner.stop_pending {
            return false;
        }
        match inner.consumer.as_mut() {
            Some(consumer) => {
                consumer.on_error(error);
                true
            }
            None => false,
        }
    }

    /// Drop the consumer. Only the execution context releases slots.
    fn release(&self) {
        let consumer = self.lock().consumer.take();
        drop(consumer);
    }
}

struct Session {
    slot: Arc<ConsumerSlot>,
    params: CaptureParams,
    converter: FrameConverter,
    started_at: Instant,
    frames: u64,
    consecutive_failures: u32,
}

impl Session {
    fn new(params: CaptureParams, slot: Arc<ConsumerSlot>) -> Self {
        Self {
            converter: FrameConverter::new(&params),
            slot,
            params,
            started_at: Instant::now(),
            frames: 0,
            consecutive_failures: 0,
        }
    }

    fn log_summary(&self, reason: &str) {
        tracing::info!(
            "Capture session {}: {} frames in {:.2}s (requested {:.1} fps)",
            reason,
            self.frames,
            self.started_at.elapsed().as_secs_f64(),
            self.params.frame_rate()
        );
    }
}

struct CoreInner {
    state: CoreState,
    capturer: Option<Box<dyn DesktopCapturer>>,
    scheduler: FrameScheduler,
    session: Option<Session>,
    excluded_window: Option<WindowId>,
}

pub struct CaptureCore {
    target: CaptureTarget,
    factory: Arc<dyn CapturerFactory>,
    runner: TaskRunner,
    /// Last state set on the execution context, readable from any thread
    published: AtomicU8,
    inner: Mutex<CoreInner>,
}

impl CaptureCore {
    pub fn new(
        target: CaptureTarget,
        factory: Arc<dyn CapturerFactory>,
        runner: TaskRunner,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<CaptureCore>| {
            let weak = weak.clone();
            let scheduler = FrameScheduler::new(runner.clone(), move || {
                if let Some(core) = weak.upgrade() {
                    core.tick();
                }
            });

            Self {
                target,
                factory,
                runner,
                published: AtomicU8::new(CoreState::Idle as u8),
                inner: Mutex::new(CoreInner {
                    state: CoreState::Idle,
                    capturer: None,
                    scheduler,
                    session: None,
                    excluded_window: None,
                }),
            }
        })
    }

    pub fn target(&self) -> CaptureTarget {
        self.target
    }

    pub fn state(&self) -> CoreState {
        CoreState::from_u8(self.published.load(Ordering::SeqCst))
    }

    // Device side: these only post work to the execution context.

    /// Register `consumer` and post the start request. The returned slot
    /// identifies the session when stopping it.
    pub fn allocate_and_start(
        self: &Arc<Self>,
        params: CaptureParams,
        consumer: Box<dyn FrameConsumer>,
    ) -> Arc<ConsumerSlot> {
        let slot = ConsumerSlot::new(consumer);
        let core = Arc::clone(self);
        let session_slot = Arc::clone(&slot);

        if !self.runner.post(move || core.do_start(params, session_slot)) {
            tracing::error!("Execution context for {} is gone, start dropped", self.target);
        }
        slot
    }

    /// Flag the session as stopping, then post the teardown.
    pub fn stop_and_deallocate(self: &Arc<Self>, slot: Arc<ConsumerSlot>) {
        slot.request_stop();

        let core = Arc::clone(self);
        if !self.runner.post(move || core.do_stop(slot)) {
            tracing::warn!("Execution context for {} is gone, stop dropped", self.target);
        }
    }

    pub fn set_excluded_window(self: &Arc<Self>, window: WindowId) {
        let core = Arc::clone(self);
        self.runner.post(move || core.do_set_excluded_window(window));
    }

    // Execution context side.

    fn lock(&self) -> MutexGuard<'_, CoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut CoreInner, state: CoreState) {
        tracing::debug!("{}: {:?} -> {:?}", self.target, inner.state, state);
        inner.state = state;
        self.published.store(state as u8, Ordering::SeqCst);
    }

    fn do_start(&self, params: CaptureParams, slot: Arc<ConsumerSlot>) {
        let mut inner = self.lock();

        if inner.state != CoreState::Idle {
            tracing::warn!(
                "Start ignored for {}: core is {:?}",
                self.target,
                inner.state
            );
            slot.release();
            return;
        }
        if slot.is_stop_pending() {
            tracing::debug!("Start for {} cancelled before it ran", self.target);
            slot.release();
            return;
        }

        self.set_state(&mut inner, CoreState::Starting);

        if inner.capturer.is_none() {
            match self.factory.create(self.target) {
                Ok(mut capturer) => {
                    if let Some(window) = inner.excluded_window {
                        capturer.set_excluded_window(window);
                    }
                    tracing::info!("Capturer ready for {}", self.target);
                    inner.capturer = Some(capturer);
                }
                Err(e) => {
                    tracing::error!("Failed to create capturer for {}: {}", self.target, e);
                    slot.deliver_error(&e);
                    slot.release();
                    self.set_state(&mut inner, CoreState::Idle);
                    return;
                }
            }
        }

        tracing::info!(
            "Starting capture of {} at {:.1} fps, up to {}x{}",
            self.target,
            params.frame_rate(),
            params.max_width,
            params.max_height
        );

        inner.session = Some(Session::new(params, slot));
        self.set_state(&mut inner, CoreState::Running);
        inner.scheduler.schedule_first(params.frame_interval);
    }

    fn tick(&self) {
        let tick_started = Instant::now();
        let mut guard = self.lock();
        let inner = &mut *guard;

        if inner.state != CoreState::Running {
            return;
        }
        let (Some(session), Some(capturer)) = (inner.session.as_mut(), inner.capturer.as_mut())
        else {
            return;
        };
        // The stop task is already queued behind this tick
        if session.slot.is_stop_pending() {
            return;
        }

        let result = capturer
            .capture_frame()
            .and_then(|frame| session.converter.convert(&frame));

        match result {
            Ok(image) => {
                session.consecutive_failures = 0;
                let frame = VideoFrame {
                    image,
                    timestamp: tick_started.duration_since(session.started_at),
                    sequence: session.frames,
                };
                if session.slot.deliver_frame(frame) {
                    session.frames += 1;
                }
            }
            Err(e) if e.is_fatal() => {
                self.fail(inner, e);
                return;
            }
            Err(e) => {
                session.consecutive_failures += 1;
                tracing::warn!(
                    "Capture of {} failed ({}/{}): {}",
                    self.target,
                    session.consecutive_failures,
                    MAX_CONSECUTIVE_FAILURES,
                    e
                );
                if session.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    let escalated = CaptureError::RepeatedFailures {
                        target: self.target,
                        failures: session.consecutive_failures,
                        last: e.to_string(),
                    };
                    self.fail(inner, escalated);
                    return;
                }
            }
        }

        if session.slot.is_stop_pending() {
            return;
        }
        inner.scheduler.reschedule_next(tick_started);
    }

    /// End the session after a fatal capture error. The consumer hears
    /// about it once, unless a stop got there first.
    fn fail(&self, inner: &mut CoreInner, error: CaptureError) {
        tracing::error!("Capture of {} failed: {}", self.target, error);
        self.set_state(inner, CoreState::Error);

        inner.scheduler.cancel_all();
        // A lost target will not come back, recreate on the next start
        inner.capturer = None;

        if let Some(session) = inner.session.take() {
            session.slot.deliver_error(&error);
            session.slot.release();
            session.log_summary("failed");
        }

        self.set_state(inner, CoreState::Idle);
    }

    fn do_stop(&self, slot: Arc<ConsumerSlot>) {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let current = matches!(&inner.session, Some(session) if Arc::ptr_eq(&session.slot, &slot));
        if !current {
            // Session already ended through an error, or never started
            tracing::debug!("Stop for {} is a no-op in state {:?}", self.target, inner.state);
            slot.release();
            return;
        }

        self.set_state(inner, CoreState::Stopping);
        inner.scheduler.cancel_all();
        inner.capturer = None;

        if let Some(session) = inner.session.take() {
            session.log_summary("stopped");
            session.slot.release();
        }

        self.set_state(inner, CoreState::Idle);
    }

    fn do_set_excluded_window(&self, window: WindowId) {
        let mut inner = self.lock();
        inner.excluded_window = Some(window);
        if let Some(capturer) = inner.capturer.as_mut() {
            capturer.set_excluded_window(window);
        }
    }
}
