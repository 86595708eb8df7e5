//! Platform backend selection.

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(target_os = "windows")]
pub type PlatformBackend = windows::WindowsBackend;

#[cfg(not(target_os = "windows"))]
pub type PlatformBackend = unsupported::UnsupportedBackend;

/// The backend for the current platform.
pub fn platform_backend() -> PlatformBackend {
    PlatformBackend::default()
}

#[cfg(not(target_os = "windows"))]
pub mod unsupported {
    use crate::backend::{
        CaptureBackend, DuplicationOutput, GraphicsDevice, MappedRegion, OutputEntry,
        PointerShapeInfo, RawAcquire, Rotation,
    };
    use crate::device::{DeviceCreationParams, RemovedReason};
    use crate::error::{CaptureError, CaptureResult};
    use crate::region::{MoveRect, Rect};

    fn unsupported_error() -> CaptureError {
        CaptureError::BackendUnavailable("screen capture is only supported on Windows".to_string())
    }

    /// Backend that fails every call. Its device and duplication types
    /// cannot be constructed.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct UnsupportedBackend;

    #[derive(Clone, Copy, Debug)]
    pub enum Never {}

    impl GraphicsDevice for Never {
        type Surface = Never;

        fn read_region(
            &mut self,
            _surface: &Never,
            _rect: Rect,
            _sink: &mut dyn FnMut(MappedRegion<'_>) -> CaptureResult<()>,
        ) -> CaptureResult<()> {
            match *self {}
        }

        fn removed_reason(&self) -> RemovedReason {
            match *self {}
        }
    }

    impl DuplicationOutput for Never {
        type Surface = Never;

        fn rotation(&self) -> Rotation {
            match *self {}
        }

        fn acquire_next_frame(&mut self, _timeout_ms: u32) -> CaptureResult<RawAcquire<Never>> {
            match *self {}
        }

        fn frame_move_rects(
            &mut self,
            _budget_bytes: u32,
            _out: &mut Vec<MoveRect>,
        ) -> CaptureResult<()> {
            match *self {}
        }

        fn frame_dirty_rects(
            &mut self,
            _budget_bytes: u32,
            _out: &mut Vec<Rect>,
        ) -> CaptureResult<()> {
            match *self {}
        }

        fn frame_pointer_shape(&mut self, _out: &mut [u8]) -> CaptureResult<PointerShapeInfo> {
            match *self {}
        }

        fn release_frame(&mut self) -> CaptureResult<()> {
            match *self {}
        }

        fn removed_reason(&self) -> RemovedReason {
            match *self {}
        }
    }

    impl CaptureBackend for UnsupportedBackend {
        type Adapter = Never;
        type Output = Never;
        type Device = Never;
        type Duplication = Never;

        fn enumerate_outputs(&self) -> CaptureResult<Vec<OutputEntry<Never, Never>>> {
            Err(unsupported_error())
        }

        fn create_device(
            &self,
            adapter: &Never,
            _params: &DeviceCreationParams,
        ) -> CaptureResult<Never> {
            match *adapter {}
        }

        fn duplicate_output(&self, device: &Never, _output: &Never) -> CaptureResult<Never> {
            match *device {}
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::error::CaptureErrorClass;
        use crate::manager::CaptureDeviceManager;

        #[test]
        fn every_entry_point_reports_unavailable_backend() {
            let mut manager = CaptureDeviceManager::with_params(
                UnsupportedBackend,
                DeviceCreationParams::default(),
            );
            let err = manager.select_and_initialize(0).err();
            assert_eq!(
                err.map(|err| err.class()),
                Some(CaptureErrorClass::Unsupported)
            );
            assert!(!manager.is_ready());
        }
    }
}
