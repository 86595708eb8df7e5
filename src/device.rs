//! Graphics device creation parameters and device-loss translation.

use tracing::warn;

use crate::env_config::define_env_flag;
use crate::error::CaptureError;

define_env_flag!(enabled_when(hardware_only_requested, "DUPL_CAPTURE_HARDWARE_ONLY"));

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverType {
    Hardware,
    Warp,
    Reference,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FeatureLevel {
    Level9_1,
    Level9_2,
    Level9_3,
    Level10_0,
    Level10_1,
    Level11_0,
    Level11_1,
}

/// Ordered candidate lists tried when creating the graphics device.
///
/// The adapter that owns the selected output is tried first. When that
/// fails, each driver type is tried in order. A driver that rejects
/// `feature_levels` as invalid is retried once with `fallback_feature_levels`
/// (runtimes that predate 11.1 reject the whole list).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceCreationParams {
    pub driver_types: Vec<DriverType>,
    pub feature_levels: Vec<FeatureLevel>,
    pub fallback_feature_levels: Vec<FeatureLevel>,
    pub video_support: bool,
}

impl Default for DeviceCreationParams {
    fn default() -> Self {
        Self {
            driver_types: vec![DriverType::Hardware, DriverType::Warp, DriverType::Reference],
            feature_levels: vec![
                FeatureLevel::Level11_1,
                FeatureLevel::Level11_0,
                FeatureLevel::Level10_1,
                FeatureLevel::Level10_0,
                FeatureLevel::Level9_3,
                FeatureLevel::Level9_2,
                FeatureLevel::Level9_1,
            ],
            fallback_feature_levels: vec![
                FeatureLevel::Level11_0,
                FeatureLevel::Level10_1,
                FeatureLevel::Level10_0,
                FeatureLevel::Level9_1,
            ],
            video_support: true,
        }
    }
}

impl DeviceCreationParams {
    /// Defaults, restricted to hardware drivers when
    /// `DUPL_CAPTURE_HARDWARE_ONLY` is truthy.
    pub fn from_env() -> Self {
        let mut params = Self::default();
        if hardware_only_requested() {
            params.driver_types = vec![DriverType::Hardware];
        }
        params
    }

    pub fn hardware_only(mut self) -> Self {
        self.driver_types.retain(|driver| *driver == DriverType::Hardware);
        self
    }
}

/// Why the device stopped responding, as reported after a failed call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RemovedReason {
    /// The device is healthy; the failure was unrelated to device loss.
    #[default]
    None,
    Removed,
    Reset,
    OutOfMemory,
    /// Any other removal code, kept raw for diagnostics.
    Other(i32),
}

/// Translate a failed graphics call into the error the caller should see.
pub fn translate_failure(reason: RemovedReason, err: CaptureError) -> CaptureError {
    match reason {
        RemovedReason::None => err,
        RemovedReason::Removed | RemovedReason::Reset | RemovedReason::OutOfMemory => {
            warn!(?reason, error = %err, "graphics device lost");
            CaptureError::DeviceRemoved
        }
        RemovedReason::Other(code) => CaptureError::Platform(anyhow::anyhow!(
            "{err} (device removed reason {code:#010x})"
        )),
    }
}
