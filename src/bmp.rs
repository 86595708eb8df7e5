//! Minimal BMP writer for dumping captured images while debugging.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;

use crate::bitmap::BitmapImage;
use crate::error::{CaptureError, CaptureResult};

const FILE_HEADER_LEN: u32 = 14;
const INFO_HEADER_LEN: u32 = 40;
const PIXEL_OFFSET: u32 = FILE_HEADER_LEN + INFO_HEADER_LEN;
const BI_RGB: u32 = 0;
const PIXELS_PER_METER: i32 = 2400;

/// Encode `data` as a BMP file. Rows are stored top-down (negative height)
/// so `data` can be written in capture order.
pub fn encode_bitmap(
    width: u32,
    height: u32,
    bits_per_pixel: u16,
    data: &[u8],
) -> CaptureResult<Vec<u8>> {
    let image_size = u64::from(width) * u64::from(height) * u64::from(bits_per_pixel) / 8;
    let image_size = u32::try_from(image_size).map_err(|_| CaptureError::BufferOverflow)?;
    if (data.len() as u64) < u64::from(image_size) {
        return Err(CaptureError::InvalidConfig(format!(
            "bitmap payload is {} bytes, {width}x{height}x{bits_per_pixel} needs {image_size}",
            data.len()
        )));
    }
    let file_size = PIXEL_OFFSET
        .checked_add(image_size)
        .ok_or(CaptureError::BufferOverflow)?;
    let width = i32::try_from(width).map_err(|_| CaptureError::BufferOverflow)?;
    let height = i32::try_from(height).map_err(|_| CaptureError::BufferOverflow)?;

    let mut out = Vec::with_capacity(file_size as usize);
    // BITMAPFILEHEADER
    out.extend_from_slice(b"BM");
    out.extend_from_slice(&file_size.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&PIXEL_OFFSET.to_le_bytes());
    // BITMAPINFOHEADER
    out.extend_from_slice(&INFO_HEADER_LEN.to_le_bytes());
    out.extend_from_slice(&width.to_le_bytes());
    out.extend_from_slice(&(-height).to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&bits_per_pixel.to_le_bytes());
    out.extend_from_slice(&BI_RGB.to_le_bytes());
    out.extend_from_slice(&image_size.to_le_bytes());
    out.extend_from_slice(&PIXELS_PER_METER.to_le_bytes());
    out.extend_from_slice(&PIXELS_PER_METER.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());

    out.extend_from_slice(&data[..image_size as usize]);
    Ok(out)
}

pub fn write_bitmap(
    path: impl AsRef<Path>,
    width: u32,
    height: u32,
    bits_per_pixel: u16,
    data: &[u8],
) -> CaptureResult<()> {
    let path = path.as_ref();
    let encoded = encode_bitmap(width, height, bits_per_pixel, data)?;
    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))
        .map_err(CaptureError::Platform)?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(&encoded)
        .and_then(|()| writer.flush())
        .with_context(|| format!("failed to write {}", path.display()))
        .map_err(CaptureError::Platform)
}

/// Write a captured image, dropping the row pitch padding.
pub fn write_image(path: impl AsRef<Path>, image: &BitmapImage) -> CaptureResult<()> {
    let packed = pack_rows(image)?;
    let bits_per_pixel =
        u16::try_from(image.bits_per_pixel).map_err(|_| CaptureError::BufferOverflow)?;
    write_bitmap(path, image.width, image.height, bits_per_pixel, &packed)
}

fn pack_rows(image: &BitmapImage) -> CaptureResult<Vec<u8>> {
    let mut packed = Vec::new();
    for y in 0..image.height {
        let row = image.row(y).ok_or(CaptureError::BufferOverflow)?;
        packed.extend_from_slice(row);
    }
    Ok(packed)
}
