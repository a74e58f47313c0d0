use crate::capture::CaptureTarget;
use thiserror::Error;

pub use crate::capture::CaptureError;

/// Errors returned synchronously to the code driving a device.
///
/// Runtime capture failures never show up here; they reach the consumer
/// through `FrameConsumer::on_error`.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The target could not be resolved when the device was created
    #[error("cannot capture {target}: {source}")]
    InvalidTarget {
        target: CaptureTarget,
        #[source]
        source: CaptureError,
    },

    /// The dedicated capture thread could not be spawned
    #[error("failed to start execution context: {0}")]
    ContextUnavailable(#[from] std::io::Error),

    #[error("invalid capture parameters: {0}")]
    InvalidParams(String),

    #[error("device is already started, stop it first")]
    AlreadyStarted,
}
