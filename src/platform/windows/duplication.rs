use std::mem::size_of;

use anyhow::Context;
use tracing::debug;
use windows::Win32::Foundation::{E_ACCESSDENIED, RECT};
use windows::Win32::Graphics::Direct3D11::{ID3D11Device, ID3D11Texture2D};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_MODE_ROTATION, DXGI_MODE_ROTATION_IDENTITY, DXGI_MODE_ROTATION_ROTATE180,
    DXGI_MODE_ROTATION_ROTATE270, DXGI_MODE_ROTATION_ROTATE90,
};
use windows::Win32::Graphics::Dxgi::{
    DXGI_ERROR_ACCESS_LOST, DXGI_ERROR_INVALID_CALL, DXGI_ERROR_MORE_DATA,
    DXGI_ERROR_NOT_CURRENTLY_AVAILABLE, DXGI_ERROR_SESSION_DISCONNECTED, DXGI_ERROR_UNSUPPORTED,
    DXGI_ERROR_WAIT_TIMEOUT, DXGI_OUTDUPL_DESC, DXGI_OUTDUPL_FRAME_INFO, DXGI_OUTDUPL_MOVE_RECT,
    DXGI_OUTDUPL_POINTER_SHAPE_INFO, IDXGIOutput1, IDXGIOutputDuplication, IDXGIResource,
};
use windows::core::Interface;

use crate::backend::{DuplicationOutput, PointerShapeInfo, RawAcquire, Rotation};
use crate::device::RemovedReason;
use crate::error::{CaptureError, CaptureResult};
use crate::frame::FrameInfo;
use crate::region::{MoveRect, Point, Rect};

use super::d3d11::WindowsDevice;
use super::monitor::DxgiOutput;
use super::surface::DuplicatedSurface;

fn rotation(value: DXGI_MODE_ROTATION) -> Rotation {
    match value {
        DXGI_MODE_ROTATION_IDENTITY => Rotation::Identity,
        DXGI_MODE_ROTATION_ROTATE90 => Rotation::Rotate90,
        DXGI_MODE_ROTATION_ROTATE180 => Rotation::Rotate180,
        DXGI_MODE_ROTATION_ROTATE270 => Rotation::Rotate270,
        _ => Rotation::Unspecified,
    }
}

fn frame_info(info: &DXGI_OUTDUPL_FRAME_INFO) -> FrameInfo {
    FrameInfo {
        last_present_time: info.LastPresentTime,
        last_mouse_update_time: info.LastMouseUpdateTime,
        accumulated_frames: info.AccumulatedFrames,
        rects_coalesced: info.RectsCoalesced.as_bool(),
        protected_content_masked_out: info.ProtectedContentMaskedOut.as_bool(),
        pointer_position: Point::new(
            info.PointerPosition.Position.x,
            info.PointerPosition.Position.y,
        ),
        pointer_visible: info.PointerPosition.Visible.as_bool(),
        total_metadata_size: info.TotalMetadataBufferSize,
        pointer_shape_buffer_size: info.PointerShapeBufferSize,
    }
}

fn rect(value: &RECT) -> Rect {
    Rect::new(value.left, value.top, value.right, value.bottom)
}

/// Errors from calls on a held frame.
fn frame_error(error: windows::core::Error, what: &'static str) -> CaptureError {
    match error.code() {
        DXGI_ERROR_ACCESS_LOST => CaptureError::AccessLost,
        DXGI_ERROR_MORE_DATA => CaptureError::BufferOverflow,
        DXGI_ERROR_INVALID_CALL => CaptureError::NoFrame,
        _ => CaptureError::Platform(anyhow::Error::from(error).context(what)),
    }
}

/// `IDXGIOutputDuplication` for one output, bound to the device that
/// created it.
pub struct WindowsDuplication {
    duplication: IDXGIOutputDuplication,
    device: ID3D11Device,
    rotation: Rotation,
    move_scratch: Vec<DXGI_OUTDUPL_MOVE_RECT>,
    dirty_scratch: Vec<RECT>,
}

// SAFETY: same single-owner rule as `WindowsDevice`.
unsafe impl Send for WindowsDuplication {}

impl WindowsDuplication {
    pub(crate) fn new(device: &WindowsDevice, output: &DxgiOutput) -> CaptureResult<Self> {
        let output1: IDXGIOutput1 = output
            .0
            .cast()
            .context("failed to query IDXGIOutput1")
            .map_err(CaptureError::Platform)?;

        let duplication = unsafe { output1.DuplicateOutput(&device.device) }.map_err(|e| {
            match e.code() {
                // The output is held by the secure desktop or another duplication.
                E_ACCESSDENIED
                | DXGI_ERROR_SESSION_DISCONNECTED
                | DXGI_ERROR_NOT_CURRENTLY_AVAILABLE => CaptureError::AccessLost,
                DXGI_ERROR_UNSUPPORTED => CaptureError::BackendUnavailable(
                    "desktop duplication is not supported on this adapter".to_string(),
                ),
                _ => CaptureError::Platform(anyhow::Error::from(e).context("DuplicateOutput failed")),
            }
        })?;

        let mut desc = DXGI_OUTDUPL_DESC::default();
        unsafe { duplication.GetDesc(&mut desc) };
        debug!(
            width = desc.ModeDesc.Width,
            height = desc.ModeDesc.Height,
            system_memory = desc.DesktopImageInSystemMemory.as_bool(),
            "output duplicated"
        );

        Ok(Self {
            duplication,
            device: device.device.clone(),
            rotation: rotation(desc.Rotation),
            move_scratch: Vec::new(),
            dirty_scratch: Vec::new(),
        })
    }
}

impl DuplicationOutput for WindowsDuplication {
    type Surface = DuplicatedSurface;

    fn rotation(&self) -> Rotation {
        self.rotation
    }

    fn acquire_next_frame(
        &mut self,
        timeout_ms: u32,
    ) -> CaptureResult<RawAcquire<DuplicatedSurface>> {
        let mut info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;
        let acquired =
            unsafe { self.duplication.AcquireNextFrame(timeout_ms, &mut info, &mut resource) };
        if let Err(error) = acquired {
            return match error.code() {
                DXGI_ERROR_WAIT_TIMEOUT => Ok(RawAcquire::TimedOut),
                DXGI_ERROR_ACCESS_LOST => Err(CaptureError::AccessLost),
                _ => Err(CaptureError::Platform(
                    anyhow::Error::from(error).context("AcquireNextFrame failed"),
                )),
            };
        }

        let info = frame_info(&info);
        let Some(resource) = resource else {
            return Ok(RawAcquire::Acquired {
                surface: None,
                info,
            });
        };
        match resource.cast::<ID3D11Texture2D>() {
            Ok(texture) => Ok(RawAcquire::Acquired {
                surface: Some(DuplicatedSurface(texture)),
                info,
            }),
            Err(error) => {
                unsafe { self.duplication.ReleaseFrame() }.ok();
                Err(CaptureError::Platform(
                    anyhow::Error::from(error)
                        .context("failed to cast acquired IDXGIResource to ID3D11Texture2D"),
                ))
            }
        }
    }

    fn frame_move_rects(
        &mut self,
        budget_bytes: u32,
        out: &mut Vec<MoveRect>,
    ) -> CaptureResult<()> {
        out.clear();
        let capacity = budget_bytes as usize / size_of::<DXGI_OUTDUPL_MOVE_RECT>();
        if capacity == 0 {
            return Ok(());
        }
        self.move_scratch.clear();
        self.move_scratch
            .resize(capacity, DXGI_OUTDUPL_MOVE_RECT::default());

        let mut required = 0u32;
        unsafe {
            self.duplication.GetFrameMoveRects(
                budget_bytes,
                self.move_scratch.as_mut_ptr(),
                &mut required,
            )
        }
        .map_err(|e| frame_error(e, "GetFrameMoveRects failed"))?;

        let count = (required as usize / size_of::<DXGI_OUTDUPL_MOVE_RECT>()).min(capacity);
        out.extend(self.move_scratch[..count].iter().map(|entry| {
            MoveRect::new(
                Point::new(entry.SourcePoint.x, entry.SourcePoint.y),
                rect(&entry.DestinationRect),
            )
        }));
        Ok(())
    }

    fn frame_dirty_rects(&mut self, budget_bytes: u32, out: &mut Vec<Rect>) -> CaptureResult<()> {
        out.clear();
        let capacity = budget_bytes as usize / size_of::<RECT>();
        if capacity == 0 {
            return Ok(());
        }
        self.dirty_scratch.clear();
        self.dirty_scratch.resize(capacity, RECT::default());

        let mut required = 0u32;
        unsafe {
            self.duplication.GetFrameDirtyRects(
                budget_bytes,
                self.dirty_scratch.as_mut_ptr(),
                &mut required,
            )
        }
        .map_err(|e| frame_error(e, "GetFrameDirtyRects failed"))?;

        let count = (required as usize / size_of::<RECT>()).min(capacity);
        out.extend(self.dirty_scratch[..count].iter().map(rect));
        Ok(())
    }

    fn frame_pointer_shape(&mut self, out: &mut [u8]) -> CaptureResult<PointerShapeInfo> {
        let len = u32::try_from(out.len()).map_err(|_| CaptureError::BufferOverflow)?;
        let mut shape_info = DXGI_OUTDUPL_POINTER_SHAPE_INFO::default();
        let mut required = 0u32;
        unsafe {
            self.duplication.GetFramePointerShape(
                len,
                out.as_mut_ptr().cast(),
                &mut required,
                &mut shape_info,
            )
        }
        .map_err(|e| frame_error(e, "GetFramePointerShape failed"))?;

        Ok(PointerShapeInfo {
            shape_type: shape_info.Type,
            width: shape_info.Width,
            height: shape_info.Height,
            pitch: shape_info.Pitch,
            hotspot: Point::new(shape_info.HotSpot.x, shape_info.HotSpot.y),
        })
    }

    fn release_frame(&mut self) -> CaptureResult<()> {
        unsafe { self.duplication.ReleaseFrame() }.map_err(|e| match e.code() {
            DXGI_ERROR_ACCESS_LOST => CaptureError::AccessLost,
            DXGI_ERROR_INVALID_CALL => CaptureError::InvalidState("no frame to release"),
            _ => CaptureError::Platform(anyhow::Error::from(e).context("ReleaseFrame failed")),
        })
    }

    fn removed_reason(&self) -> RemovedReason {
        super::removed_reason(unsafe { self.device.GetDeviceRemovedReason() })
    }
}
