use anyhow::Context;
use windows::Win32::Graphics::Direct3D11::{
    D3D11_CPU_ACCESS_READ, D3D11_MAP_READ, D3D11_MAPPED_SUBRESOURCE, D3D11_TEXTURE2D_DESC,
    D3D11_USAGE_STAGING, ID3D11Device, ID3D11DeviceContext, ID3D11Resource, ID3D11Texture2D,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT, DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_FORMAT_B8G8R8A8_UNORM_SRGB, DXGI_SAMPLE_DESC,
};
use windows::core::Interface;

use crate::backend::MappedRegion;
use crate::bitmap::BYTES_PER_PIXEL;
use crate::error::{CaptureError, CaptureResult};
use crate::parallel::pitched_len;

/// Desktop image handed out by `AcquireNextFrame`. Valid until the frame
/// is released.
pub struct DuplicatedSurface(pub(crate) ID3D11Texture2D);

// SAFETY: the texture is only used by the thread that owns the manager,
// between acquire and release.
unsafe impl Send for DuplicatedSurface {}

impl DuplicatedSurface {
    pub(crate) fn desc(&self) -> D3D11_TEXTURE2D_DESC {
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { self.0.GetDesc(&mut desc) };
        desc
    }
}

pub(crate) fn check_source_format(format: DXGI_FORMAT) -> CaptureResult<()> {
    match format {
        DXGI_FORMAT_B8G8R8A8_UNORM | DXGI_FORMAT_B8G8R8A8_UNORM_SRGB => Ok(()),
        other => Err(CaptureError::Platform(anyhow::anyhow!(
            "desktop surface format {other:?} is not 32-bit BGRA"
        ))),
    }
}

/// Return a CPU-readable staging texture of `width` x `height`, recreating
/// the cached one when its size or format differs.
pub(crate) fn ensure_staging_texture<'a>(
    device: &ID3D11Device,
    staging: &'a mut Option<ID3D11Texture2D>,
    format: DXGI_FORMAT,
    width: u32,
    height: u32,
) -> CaptureResult<&'a ID3D11Texture2D> {
    let needs_new_staging = match staging.as_ref() {
        Some(existing) => {
            let mut desc = D3D11_TEXTURE2D_DESC::default();
            unsafe { existing.GetDesc(&mut desc) };
            desc.Width != width || desc.Height != height || desc.Format != format
        }
        None => true,
    };

    if needs_new_staging {
        *staging = None;
        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: format,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: Default::default(),
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: Default::default(),
        };

        let mut texture: Option<ID3D11Texture2D> = None;
        unsafe { device.CreateTexture2D(&desc, None, Some(&mut texture)) }
            .with_context(|| format!("failed to create {width}x{height} staging texture"))
            .map_err(CaptureError::Platform)?;
        *staging = texture;
    }

    staging.as_ref().ok_or_else(|| {
        CaptureError::Platform(anyhow::anyhow!("CreateTexture2D did not return a texture"))
    })
}

/// Map a populated staging texture and hand its rows to `sink`. The
/// texture is unmapped before returning, whatever `sink` returns.
pub(crate) fn with_mapped_staging(
    context: &ID3D11DeviceContext,
    staging: &ID3D11Texture2D,
    width: u32,
    height: u32,
    sink: &mut dyn FnMut(MappedRegion<'_>) -> CaptureResult<()>,
) -> CaptureResult<()> {
    let resource = staging
        .cast::<ID3D11Resource>()
        .context("failed to cast staging texture to ID3D11Resource")
        .map_err(CaptureError::Platform)?;

    let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
    // D3D11_MAP_FLAG_DO_NOT_WAIT = 0x100000
    const DO_NOT_WAIT: u32 = 0x100000;
    let non_blocking =
        unsafe { context.Map(&resource, 0, D3D11_MAP_READ, DO_NOT_WAIT, Some(&mut mapped)) };
    if non_blocking.is_err() {
        mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe { context.Map(&resource, 0, D3D11_MAP_READ, 0, Some(&mut mapped)) }
            .context("failed to map staging texture")
            .map_err(CaptureError::Platform)?;
    }

    let result = (|| {
        let row_bytes = (width as usize)
            .checked_mul(BYTES_PER_PIXEL as usize)
            .ok_or(CaptureError::BufferOverflow)?;
        let len = pitched_len(mapped.RowPitch as usize, row_bytes, height as usize)?;
        if mapped.pData.is_null() {
            return Err(CaptureError::Platform(anyhow::anyhow!(
                "mapped staging texture has no data pointer"
            )));
        }
        // SAFETY: a mapped subresource spans `RowPitch` bytes per row for
        // every row, and stays valid until `Unmap` below.
        let data = unsafe { std::slice::from_raw_parts(mapped.pData as *const u8, len) };
        sink(MappedRegion {
            data,
            row_pitch: mapped.RowPitch,
            width,
            height,
        })
    })();

    unsafe {
        context.Unmap(&resource, 0);
    }
    result
}
