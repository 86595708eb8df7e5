pub mod backend;
pub mod bitmap;
pub mod bmp;
pub mod device;
pub mod encode;
pub(crate) mod env_config;
pub mod error;
pub mod frame;
pub mod frame_cache;
pub mod frame_source;
pub mod manager;
pub mod monitor;
pub mod parallel;
pub mod platform;
pub mod pointer;
pub mod reconcile;
pub mod region;
pub mod streaming;

#[cfg(test)]
mod testing;

use error::CaptureResult;

pub use backend::{CaptureBackend, DuplicationOutput, GraphicsDevice, MappedRegion, Rotation};
pub use bitmap::BitmapImage;
pub use device::{DeviceCreationParams, DriverType, FeatureLevel, RemovedReason};
pub use encode::{EncodeFeeder, EncoderSample, EncoderSampleBuilder, SampleClock};
pub use error::{CaptureError, CaptureErrorClass};
pub use frame::{FrameInfo, FrameMetadata};
pub use frame_cache::FrameBufferCache;
pub use manager::{CaptureDeviceManager, CaptureStep, CapturedFrame, ManagerState};
pub use monitor::MonitorDescriptor;
pub use platform::{platform_backend, PlatformBackend};
pub use pointer::PointerInfo;
pub use reconcile::{reconcile, ChangedRegionSet, RegionReconciler};
pub use region::{MoveRect, Point, Rect};
pub use streaming::{CaptureEvent, StreamConfig, StreamHandle, StreamStats, StreamStatsSnapshot};

#[cfg(feature = "tokio-stream")]
pub use streaming::AsyncStreamHandle;

/// Capture one frame of output `index` with the platform backend.
///
/// Makes at most `attempts` acquires of `timeout_ms` each and returns the
/// first frame that arrives.
pub fn capture_once(
    index: usize,
    timeout_ms: u32,
    attempts: usize,
) -> CaptureResult<CapturedFrame> {
    let mut manager = CaptureDeviceManager::new(platform_backend());
    manager.select_and_initialize(index)?;
    for _ in 0..attempts.max(1) {
        if let CaptureStep::Frame(frame) = manager.capture_frame(timeout_ms, None)? {
            return Ok(frame);
        }
    }
    Err(CaptureError::NoFrame)
}
