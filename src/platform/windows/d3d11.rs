use anyhow::Context;
use tracing::{debug, info};
use windows::Win32::Foundation::{E_FAIL, E_INVALIDARG};
use windows::Win32::Graphics::Direct3D::{
    D3D_DRIVER_TYPE, D3D_DRIVER_TYPE_HARDWARE, D3D_DRIVER_TYPE_REFERENCE, D3D_DRIVER_TYPE_UNKNOWN,
    D3D_DRIVER_TYPE_WARP, D3D_FEATURE_LEVEL, D3D_FEATURE_LEVEL_10_0, D3D_FEATURE_LEVEL_10_1,
    D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_11_1, D3D_FEATURE_LEVEL_9_1, D3D_FEATURE_LEVEL_9_2,
    D3D_FEATURE_LEVEL_9_3,
};
use windows::Win32::Graphics::Direct3D11::{
    D3D11_BOX, D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_CREATE_DEVICE_FLAG,
    D3D11_CREATE_DEVICE_SINGLETHREADED, D3D11_CREATE_DEVICE_VIDEO_SUPPORT, D3D11_SDK_VERSION,
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Resource, ID3D11Texture2D,
};
use windows::Win32::Graphics::Dxgi::IDXGIAdapter;
use windows::core::Interface;

use crate::backend::{GraphicsDevice, MappedRegion};
use crate::device::{
    translate_failure, DeviceCreationParams, DriverType, FeatureLevel, RemovedReason,
};
use crate::error::{CaptureError, CaptureResult};
use crate::region::Rect;

use super::surface::{self, DuplicatedSurface};

fn driver_type(driver: DriverType) -> D3D_DRIVER_TYPE {
    match driver {
        DriverType::Hardware => D3D_DRIVER_TYPE_HARDWARE,
        DriverType::Warp => D3D_DRIVER_TYPE_WARP,
        DriverType::Reference => D3D_DRIVER_TYPE_REFERENCE,
    }
}

fn feature_level(level: FeatureLevel) -> D3D_FEATURE_LEVEL {
    match level {
        FeatureLevel::Level9_1 => D3D_FEATURE_LEVEL_9_1,
        FeatureLevel::Level9_2 => D3D_FEATURE_LEVEL_9_2,
        FeatureLevel::Level9_3 => D3D_FEATURE_LEVEL_9_3,
        FeatureLevel::Level10_0 => D3D_FEATURE_LEVEL_10_0,
        FeatureLevel::Level10_1 => D3D_FEATURE_LEVEL_10_1,
        FeatureLevel::Level11_0 => D3D_FEATURE_LEVEL_11_0,
        FeatureLevel::Level11_1 => D3D_FEATURE_LEVEL_11_1,
    }
}

fn creation_flags(params: &DeviceCreationParams) -> D3D11_CREATE_DEVICE_FLAG {
    // The device is only used from the thread that owns the manager.
    let mut flags = D3D11_CREATE_DEVICE_BGRA_SUPPORT | D3D11_CREATE_DEVICE_SINGLETHREADED;
    if params.video_support {
        flags |= D3D11_CREATE_DEVICE_VIDEO_SUPPORT;
    }
    flags
}

/// D3D11 device plus the staging texture region copies go through.
pub struct WindowsDevice {
    pub(crate) device: ID3D11Device,
    context: ID3D11DeviceContext,
    feature_level: D3D_FEATURE_LEVEL,
    staging: Option<ID3D11Texture2D>,
}

// SAFETY: the device is created single-threaded and every call goes
// through the manager that owns it.
unsafe impl Send for WindowsDevice {}

fn try_create(
    adapter: Option<&IDXGIAdapter>,
    driver: D3D_DRIVER_TYPE,
    flags: D3D11_CREATE_DEVICE_FLAG,
    levels: &[D3D_FEATURE_LEVEL],
) -> windows::core::Result<WindowsDevice> {
    let mut device: Option<ID3D11Device> = None;
    let mut context: Option<ID3D11DeviceContext> = None;
    let mut selected = D3D_FEATURE_LEVEL::default();

    unsafe {
        D3D11CreateDevice(
            adapter,
            driver,
            None,
            flags,
            Some(levels),
            D3D11_SDK_VERSION,
            Some(&mut device),
            Some(&mut selected),
            Some(&mut context),
        )
    }?;

    match (device, context) {
        (Some(device), Some(context)) => Ok(WindowsDevice {
            device,
            context,
            feature_level: selected,
            staging: None,
        }),
        _ => Err(windows::core::Error::from(E_FAIL)),
    }
}

/// Try `levels`, then `fallback` when the runtime rejects the list itself.
fn try_create_with_fallback(
    adapter: Option<&IDXGIAdapter>,
    driver: D3D_DRIVER_TYPE,
    flags: D3D11_CREATE_DEVICE_FLAG,
    levels: &[D3D_FEATURE_LEVEL],
    fallback: &[D3D_FEATURE_LEVEL],
) -> windows::core::Result<WindowsDevice> {
    match try_create(adapter, driver, flags, levels) {
        Err(e) if e.code() == E_INVALIDARG && !fallback.is_empty() => {
            debug!(?driver, "feature level list rejected, retrying with fallback levels");
            try_create(adapter, driver, flags, fallback)
        }
        other => other,
    }
}

/// Create a device for `adapter`, falling back to the configured driver
/// types on the default adapter.
pub(crate) fn create_device(
    adapter: &IDXGIAdapter,
    params: &DeviceCreationParams,
) -> CaptureResult<WindowsDevice> {
    if params.feature_levels.is_empty() {
        return Err(CaptureError::InvalidConfig(
            "at least one feature level is required".to_string(),
        ));
    }
    let flags = creation_flags(params);
    let levels: Vec<_> = params.feature_levels.iter().copied().map(feature_level).collect();
    let fallback: Vec<_> = params
        .fallback_feature_levels
        .iter()
        .copied()
        .map(feature_level)
        .collect();

    let on_adapter = try_create_with_fallback(
        Some(adapter),
        D3D_DRIVER_TYPE_UNKNOWN,
        flags,
        &levels,
        &fallback,
    );
    let mut last_error = match on_adapter {
        Ok(device) => {
            info!(feature_level = device.feature_level.0, "created device on output adapter");
            return Ok(device);
        }
        Err(e) => {
            debug!(error = %e, "device creation on output adapter failed");
            e
        }
    };

    for driver in &params.driver_types {
        match try_create_with_fallback(None, driver_type(*driver), flags, &levels, &fallback) {
            Ok(device) => {
                info!(
                    ?driver,
                    feature_level = device.feature_level.0,
                    "created device on default adapter"
                );
                return Ok(device);
            }
            Err(e) => {
                debug!(?driver, error = %e, "device creation failed");
                last_error = e;
            }
        }
    }

    Err(CaptureError::Platform(
        anyhow::Error::from(last_error).context("D3D11CreateDevice failed for every driver type"),
    ))
}

impl WindowsDevice {
    fn copy_and_map(
        &mut self,
        surface: &DuplicatedSurface,
        rect: Rect,
        sink: &mut dyn FnMut(MappedRegion<'_>) -> CaptureResult<()>,
    ) -> CaptureResult<()> {
        let desc = surface.desc();
        surface::check_source_format(desc.Format)?;
        let bounds = Rect::from_origin_size(0, 0, desc.Width, desc.Height)?;
        if rect.is_empty() || !bounds.contains_rect(&rect) {
            return Err(CaptureError::InvalidConfig(format!(
                "region {rect:?} is outside the {bounds:?} desktop surface"
            )));
        }
        let (width, height) = rect.extent()?;

        let staging = surface::ensure_staging_texture(
            &self.device,
            &mut self.staging,
            desc.Format,
            width,
            height,
        )?;
        let source: ID3D11Resource = surface
            .0
            .cast()
            .context("failed to cast desktop texture to ID3D11Resource")
            .map_err(CaptureError::Platform)?;
        let destination: ID3D11Resource = staging
            .cast()
            .context("failed to cast staging texture to ID3D11Resource")
            .map_err(CaptureError::Platform)?;

        let source_box = D3D11_BOX {
            left: rect.left as u32,
            top: rect.top as u32,
            front: 0,
            right: rect.right as u32,
            bottom: rect.bottom as u32,
            back: 1,
        };
        unsafe {
            self.context.CopySubresourceRegion(
                &destination,
                0,
                0,
                0,
                0,
                &source,
                0,
                Some(&source_box),
            );
        }

        surface::with_mapped_staging(&self.context, staging, width, height, sink)
    }
}

impl GraphicsDevice for WindowsDevice {
    type Surface = DuplicatedSurface;

    fn read_region(
        &mut self,
        surface: &DuplicatedSurface,
        rect: Rect,
        sink: &mut dyn FnMut(MappedRegion<'_>) -> CaptureResult<()>,
    ) -> CaptureResult<()> {
        self.copy_and_map(surface, rect, sink)
            .map_err(|err| translate_failure(self.removed_reason(), err))
    }

    fn removed_reason(&self) -> RemovedReason {
        super::removed_reason(unsafe { self.device.GetDeviceRemovedReason() })
    }
}
