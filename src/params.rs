use crate::error::DeviceError;
use std::time::Duration;

/// How delivered frame dimensions relate to the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolutionPolicy {
    /// Always deliver the requested size, letterboxing the source into it
    #[default]
    Fixed,
    /// Follow the source size, scaled down to fit the requested maximum
    WithinLimit,
}

/// Session parameters, fixed between start and stop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureParams {
    pub frame_interval: Duration,
    pub max_width: u32,
    pub max_height: u32,
    pub resolution_policy: ResolutionPolicy,
}

impl CaptureParams {
    /// Build params from a frame rate. A rate that is not positive yields a
    /// zero interval, which `validate` rejects.
    pub fn from_frame_rate(fps: f32, max_width: u32, max_height: u32) -> Self {
        let frame_interval = if fps.is_finite() && fps > 0.0 {
            Duration::from_secs_f64(1.0 / fps as f64)
        } else {
            Duration::ZERO
        };

        Self {
            frame_interval,
            max_width,
            max_height,
            resolution_policy: ResolutionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ResolutionPolicy) -> Self {
        self.resolution_policy = policy;
        self
    }

    pub fn frame_rate(&self) -> f32 {
        if self.frame_interval.is_zero() {
            0.0
        } else {
            1.0 / self.frame_interval.as_secs_f32()
        }
    }

    pub fn validate(&self) -> Result<(), DeviceError> {
        if self.frame_interval.is_zero() {
            return Err(DeviceError::InvalidParams(
                "frame interval must be greater than zero".to_string(),
            ));
        }
        if self.max_width < 2 || self.max_height < 2 {
            return Err(DeviceError::InvalidParams(format!(
                "resolution {}x{} is too small",
                self.max_width, self.max_height
            )));
        }
        Ok(())
    }
}

impl Default for CaptureParams {
    fn default() -> Self {
        Self::from_frame_rate(30.0, 1920, 1080)
    }
}
