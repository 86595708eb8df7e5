use anyhow::Context;
use tracing::debug;
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory1, DXGI_ERROR_NOT_FOUND, IDXGIAdapter, IDXGIFactory1, IDXGIOutput,
};
use windows::core::Interface;

use crate::backend::OutputEntry;
use crate::error::{CaptureError, CaptureResult};
use crate::region::Rect;

/// Adapter handle kept alive by a monitor descriptor.
#[derive(Clone)]
pub struct DxgiAdapter(pub(crate) IDXGIAdapter);

/// Output handle kept alive by a monitor descriptor.
#[derive(Clone)]
pub struct DxgiOutput(pub(crate) IDXGIOutput);

// SAFETY: DXGI objects are free-threaded. The manager only touches them
// from the thread that owns it.
unsafe impl Send for DxgiAdapter {}
unsafe impl Send for DxgiOutput {}

fn utf16z_to_string(input: &[u16]) -> String {
    let len = input.iter().position(|&ch| ch == 0).unwrap_or(input.len());
    String::from_utf16_lossy(&input[..len])
}

/// Every output attached to the desktop, in adapter-major order.
pub(crate) fn enumerate_outputs() -> CaptureResult<Vec<OutputEntry<DxgiAdapter, DxgiOutput>>> {
    let factory: IDXGIFactory1 = unsafe { CreateDXGIFactory1() }
        .context("CreateDXGIFactory1 failed")
        .map_err(CaptureError::Platform)?;

    let mut outputs = Vec::new();
    let mut adapter_index = 0u32;
    loop {
        let adapter1 = match unsafe { factory.EnumAdapters1(adapter_index) } {
            Ok(adapter) => adapter,
            Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
            Err(e) => {
                return Err(CaptureError::Platform(
                    anyhow::Error::from(e).context(format!("EnumAdapters1({adapter_index}) failed")),
                ));
            }
        };
        let adapter: IDXGIAdapter = adapter1
            .cast()
            .context("failed to cast IDXGIAdapter1 to IDXGIAdapter")
            .map_err(CaptureError::Platform)?;

        let mut output_index = 0u32;
        loop {
            let output = match unsafe { adapter.EnumOutputs(output_index) } {
                Ok(output) => output,
                Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
                Err(e) => {
                    return Err(CaptureError::Platform(anyhow::Error::from(e).context(
                        format!("EnumOutputs({output_index}) on adapter {adapter_index} failed"),
                    )));
                }
            };

            let desc = unsafe { output.GetDesc() }
                .context("IDXGIOutput::GetDesc failed")
                .map_err(CaptureError::Platform)?;

            let name = utf16z_to_string(&desc.DeviceName);
            if desc.AttachedToDesktop.as_bool() {
                let coords = desc.DesktopCoordinates;
                outputs.push(OutputEntry {
                    adapter_index,
                    output_index,
                    desktop_rect: Rect::new(coords.left, coords.top, coords.right, coords.bottom),
                    name,
                    adapter: DxgiAdapter(adapter.clone()),
                    output: DxgiOutput(output),
                });
            } else {
                debug!(adapter_index, output_index, %name, "skipping detached output");
            }

            output_index += 1;
        }

        adapter_index += 1;
    }

    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::utf16z_to_string;

    #[test]
    fn device_name_stops_at_nul() {
        let mut raw = [0u16; 32];
        for (slot, ch) in raw.iter_mut().zip(r"\\.\DISPLAY1".encode_utf16()) {
            *slot = ch;
        }
        assert_eq!(utf16z_to_string(&raw), r"\\.\DISPLAY1");
    }
}
