pub(crate) mod d3d11;
pub(crate) mod duplication;
pub(crate) mod monitor;
pub(crate) mod surface;

use windows::Win32::Foundation::E_OUTOFMEMORY;
use windows::Win32::Graphics::Dxgi::{DXGI_ERROR_DEVICE_REMOVED, DXGI_ERROR_DEVICE_RESET};

use crate::backend::{CaptureBackend, OutputEntry};
use crate::device::{DeviceCreationParams, RemovedReason};
use crate::error::CaptureResult;

pub use d3d11::WindowsDevice;
pub use duplication::WindowsDuplication;
pub use monitor::{DxgiAdapter, DxgiOutput};
pub use surface::DuplicatedSurface;

/// DXGI desktop duplication on Direct3D 11.
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowsBackend;

impl WindowsBackend {
    pub fn new() -> Self {
        Self
    }
}

/// Map the result of `GetDeviceRemovedReason`.
pub(crate) fn removed_reason(result: windows::core::Result<()>) -> RemovedReason {
    let Err(error) = result else {
        return RemovedReason::None;
    };
    match error.code() {
        DXGI_ERROR_DEVICE_REMOVED => RemovedReason::Removed,
        DXGI_ERROR_DEVICE_RESET => RemovedReason::Reset,
        E_OUTOFMEMORY => RemovedReason::OutOfMemory,
        code if code.is_ok() => RemovedReason::None,
        code => RemovedReason::Other(code.0),
    }
}

impl CaptureBackend for WindowsBackend {
    type Adapter = DxgiAdapter;
    type Output = DxgiOutput;
    type Device = WindowsDevice;
    type Duplication = WindowsDuplication;

    fn enumerate_outputs(&self) -> CaptureResult<Vec<OutputEntry<DxgiAdapter, DxgiOutput>>> {
        monitor::enumerate_outputs()
    }

    fn create_device(
        &self,
        adapter: &DxgiAdapter,
        params: &DeviceCreationParams,
    ) -> CaptureResult<WindowsDevice> {
        d3d11::create_device(&adapter.0, params)
    }

    fn duplicate_output(
        &self,
        device: &WindowsDevice,
        output: &DxgiOutput,
    ) -> CaptureResult<WindowsDuplication> {
        WindowsDuplication::new(device, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use windows::Win32::Graphics::Dxgi::DXGI_ERROR_DEVICE_HUNG;

    #[test]
    fn removed_reason_maps_known_codes() {
        assert_eq!(removed_reason(Ok(())), RemovedReason::None);
        assert_eq!(
            removed_reason(Err(DXGI_ERROR_DEVICE_REMOVED.into())),
            RemovedReason::Removed
        );
        assert_eq!(
            removed_reason(Err(DXGI_ERROR_DEVICE_RESET.into())),
            RemovedReason::Reset
        );
        assert_eq!(removed_reason(Err(E_OUTOFMEMORY.into())), RemovedReason::OutOfMemory);
        assert_eq!(
            removed_reason(Err(DXGI_ERROR_DEVICE_HUNG.into())),
            RemovedReason::Other(DXGI_ERROR_DEVICE_HUNG.0)
        );
    }
}
