use crate::capture::{CaptureTarget, CapturerFactory, WindowId};
use crate::capture_core::{CaptureCore, ConsumerSlot, CoreState};
use crate::error::DeviceError;
use crate::output::FrameConsumer;
use crate::params::CaptureParams;
use crate::runner::{CaptureThread, ExecutionContext, TaskRunner};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Construction-time settings for a device
#[derive(Debug, Clone, Default)]
pub struct DeviceOptions {
    /// Window the capturer must leave out, e.g. a "you are being captured" indicator
    pub notification_window: Option<WindowId>,
    /// Runtime to borrow for window capture. Falls back to the ambient
    /// runtime, then to a dedicated thread.
    pub shared_runtime: Option<Handle>,
}

/// Video source for one screen or window.
///
/// All methods return without waiting for the execution context. Frames
/// and errors reach the consumer passed to `allocate_and_start`, never after
/// `stop_and_deallocate` has returned.
pub struct DesktopCaptureDevice {
    core: Arc<CaptureCore>,
    session: Option<Arc<ConsumerSlot>>,
    // Declared last so the owned thread is joined after everything else let go
    context: ExecutionContext,
}

impl DesktopCaptureDevice {
    /// Create a device for `target`, picking the execution context from the
    /// target kind. Fails if the target does not exist.
    pub fn create(
        target: CaptureTarget,
        factory: Arc<dyn CapturerFactory>,
        options: DeviceOptions,
    ) -> Result<Self, DeviceError> {
        factory
            .resolve(target)
            .map_err(|source| DeviceError::InvalidTarget { target, source })?;

        let context = select_context(target, options.shared_runtime.as_ref())?;
        let device = Self::with_context(target, factory, context);

        if let Some(window) = options.notification_window {
            device.core.set_excluded_window(window);
        }
        Ok(device)
    }

    /// Build a device on an explicit execution context, skipping target resolution
    pub fn with_context(
        target: CaptureTarget,
        factory: Arc<dyn CapturerFactory>,
        context: ExecutionContext,
    ) -> Self {
        tracing::info!(
            "Created capture device for {} on {} ({})",
            target,
            context.runner().name(),
            if context.owns_thread() {
                "dedicated thread"
            } else {
                "shared runtime"
            }
        );

        let core = CaptureCore::new(target, factory, context.runner().clone());
        Self {
            core,
            session: None,
            context,
        }
    }

    pub fn allocate_and_start(
        &mut self,
        params: CaptureParams,
        consumer: Box<dyn FrameConsumer>,
    ) -> Result<(), DeviceError> {
        params.validate()?;

        if self.is_started() {
            tracing::warn!("allocate_and_start called twice for {}", self.core.target());
            return Err(DeviceError::AlreadyStarted);
        }
        // A session that ended on a capture error needs no explicit stop
        self.session = None;

        self.session = Some(self.core.allocate_and_start(params, consumer));
        Ok(())
    }

    /// Stop the session if there is one. Safe to call at any time.
    pub fn stop_and_deallocate(&mut self) {
        match self.session.take() {
            Some(slot) => {
                tracing::info!("Stopping capture of {}", self.core.target());
                self.core.stop_and_deallocate(slot);
            }
            None => tracing::debug!("No capture session to stop for {}", self.core.target()),
        }
    }

    pub fn set_notification_window_id(&mut self, window: WindowId) {
        self.core.set_excluded_window(window);
    }

    pub fn target(&self) -> CaptureTarget {
        self.core.target()
    }

    /// Whether a consumer is registered: started, not stopped, and not
    /// ended by a capture error
    pub fn is_started(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|slot| !slot.is_released())
    }

    /// Last state published by the capture core
    pub fn state(&self) -> CoreState {
        self.core.state()
    }

    pub fn owns_thread(&self) -> bool {
        self.context.owns_thread()
    }
}

impl Drop for DesktopCaptureDevice {
    fn drop(&mut self) {
        self.stop_and_deallocate();
    }
}

/// Window capture shares a runtime when one is available; screen capture
/// gets its own thread.
fn select_context(
    target: CaptureTarget,
    shared: Option<&Handle>,
) -> Result<ExecutionContext, DeviceError> {
    let name = match target {
        CaptureTarget::Screen(id) => format!("desktop-capture-screen-{}", id),
        CaptureTarget::Window(id) => format!("desktop-capture-window-{:x}", id),
    };

    if target.is_window() {
        let handle = shared.cloned().or_else(|| Handle::try_current().ok());
        if let Some(handle) = handle {
            return Ok(ExecutionContext::Borrowed(TaskRunner::sequenced(&name, &handle)));
        }
        tracing::debug!("No runtime for {}, using a dedicated thread", target);
    }

    Ok(ExecutionContext::OwnedThread(CaptureThread::spawn(&name)?))
}
