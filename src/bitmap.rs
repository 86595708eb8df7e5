use crate::backend::MappedRegion;
use crate::error::{CaptureError, CaptureResult};
use crate::parallel::{copy_rows, pitched_len};

pub const BITS_PER_PIXEL: u32 = 32;
pub const BYTES_PER_PIXEL: u32 = BITS_PER_PIXEL / 8;

/// A CPU copy of a captured BGRA region.
///
/// `data.len()` is the allocated size and only grows; `size` is the number
/// of bytes the current contents use (`row_pitch * height`).
#[derive(Clone, Debug, Default)]
pub struct BitmapImage {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    pub bytes_per_pixel: u32,
    pub row_pitch: u32,
    data: Vec<u8>,
    pub size: usize,
}

impl BitmapImage {
    pub fn new() -> Self {
        Self {
            bits_per_pixel: BITS_PER_PIXEL,
            bytes_per_pixel: BYTES_PER_PIXEL,
            ..Self::default()
        }
    }

    /// An empty image with `capacity` bytes already allocated.
    pub fn with_capacity(capacity: usize) -> CaptureResult<Self> {
        let mut image = Self::new();
        image.grow_to(capacity)?;
        Ok(image)
    }

    /// Bytes in use, row padding included.
    pub fn pixels(&self) -> &[u8] {
        &self.data[..self.size]
    }

    pub fn allocated_len(&self) -> usize {
        self.data.len()
    }

    /// One row without its pitch padding.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let start = y as usize * self.row_pitch as usize;
        let len = self.width as usize * self.bytes_per_pixel as usize;
        self.data.get(start..start + len)
    }

    /// Independent copy whose buffer shares nothing with `self`.
    pub fn deep_copy(&self) -> CaptureResult<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(self.data.len())
            .map_err(|_| CaptureError::OutOfMemory("bitmap copy"))?;
        data.extend_from_slice(&self.data);
        Ok(Self {
            data,
            ..*self
        })
    }

    fn grow_to(&mut self, len: usize) -> CaptureResult<()> {
        if len <= self.data.len() {
            return Ok(());
        }
        self.data
            .try_reserve_exact(len - self.data.len())
            .map_err(|_| CaptureError::OutOfMemory("bitmap buffer"))?;
        tracing::debug!(from = self.data.len(), to = len, "grew bitmap buffer");
        self.data.resize(len, 0);
        Ok(())
    }

    /// Copy a mapped region into this image, keeping the source pitch.
    pub fn transcribe(&mut self, mapped: MappedRegion<'_>) -> CaptureResult<()> {
        let row_bytes = usize::try_from(mapped.width)
            .ok()
            .and_then(|w| w.checked_mul(BYTES_PER_PIXEL as usize))
            .ok_or(CaptureError::BufferOverflow)?;
        let pitch = mapped.row_pitch as usize;
        let rows = mapped.height as usize;
        let needed = pitch.checked_mul(rows).ok_or(CaptureError::BufferOverflow)?;
        if row_bytes > pitch || mapped.data.len() < pitched_len(pitch, row_bytes, rows)? {
            return Err(CaptureError::BufferOverflow);
        }

        self.grow_to(needed)?;
        copy_rows(mapped.data, pitch, &mut self.data, pitch, row_bytes, rows)?;

        self.width = mapped.width;
        self.height = mapped.height;
        self.row_pitch = mapped.row_pitch;
        self.bits_per_pixel = BITS_PER_PIXEL;
        self.bytes_per_pixel = BYTES_PER_PIXEL;
        self.size = needed;
        Ok(())
    }
}
