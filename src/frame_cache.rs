//! Double-buffered CPU copies of captured regions.
//!
//! The cache owns up to two images: `current`, the target of the next
//! copy, and `previous`, the last image handed to consumers. Images are
//! shared out as `Arc`s. A copy into `current` while a consumer still holds
//! it goes into a fresh (or recycled) buffer instead, so snapshots never
//! change underneath their holders.

use std::sync::Arc;

use tracing::debug;

use crate::backend::{GraphicsDevice, MappedRegion};
use crate::bitmap::BitmapImage;
use crate::error::{CaptureError, CaptureResult};
use crate::region::Rect;

/// Anything that can expose a rectangle of the current desktop image as
/// mapped CPU memory.
pub trait RegionReader {
    fn read_region(
        &mut self,
        rect: Rect,
        sink: &mut dyn FnMut(MappedRegion<'_>) -> CaptureResult<()>,
    ) -> CaptureResult<()>;
}

/// Reads regions of one acquired surface through its graphics device.
pub struct SurfaceReader<'a, G: GraphicsDevice> {
    pub device: &'a mut G,
    pub surface: &'a G::Surface,
}

impl<G: GraphicsDevice> RegionReader for SurfaceReader<'_, G> {
    fn read_region(
        &mut self,
        rect: Rect,
        sink: &mut dyn FnMut(MappedRegion<'_>) -> CaptureResult<()>,
    ) -> CaptureResult<()> {
        self.device.read_region(self.surface, rect, sink)
    }
}

#[derive(Debug, Default)]
pub struct FrameBufferCache {
    current: Option<Arc<BitmapImage>>,
    previous: Option<Arc<BitmapImage>>,
    /// An unshared buffer retired from `previous`, reused by the next copy.
    spare: Option<BitmapImage>,
    /// The rectangle `current` was copied from. `None` once a copy fails.
    current_source: Option<Rect>,
}

impl FrameBufferCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<BitmapImage>> {
        self.current.clone()
    }

    pub fn previous(&self) -> Option<Arc<BitmapImage>> {
        self.previous.clone()
    }

    /// `current`, if it was fully copied from `rect`.
    pub fn current_from(&self, rect: Rect) -> Option<Arc<BitmapImage>> {
        match self.current_source {
            Some(source) if source == rect => self.current.clone(),
            _ => None,
        }
    }

    /// Copy `rect` into `current` and return it.
    pub fn capture_region(
        &mut self,
        reader: &mut dyn RegionReader,
        rect: Rect,
    ) -> CaptureResult<Arc<BitmapImage>> {
        let (mut target, stepped_away) = self.take_writable_current()?;
        self.current_source = None;
        let read = reader.read_region(rect, &mut |mapped| target.transcribe(mapped));
        match read {
            Ok(()) => {
                let image = Arc::new(target);
                self.current = Some(Arc::clone(&image));
                self.current_source = Some(rect);
                Ok(image)
            }
            Err(err) => {
                match stepped_away {
                    Some(shared) => {
                        self.current = Some(shared);
                        self.spare = Some(target);
                    }
                    None if target.size > 0 => self.current = Some(Arc::new(target)),
                    None => self.spare = Some(target),
                }
                Err(err)
            }
        }
    }

    /// Pull `current` out for writing. A shared image is left to its
    /// holders and returned alongside a buffer at least as large.
    fn take_writable_current(
        &mut self,
    ) -> CaptureResult<(BitmapImage, Option<Arc<BitmapImage>>)> {
        let Some(current) = self.current.take() else {
            return Ok((self.spare.take().unwrap_or_else(BitmapImage::new), None));
        };
        let shared = match Arc::try_unwrap(current) {
            Ok(unique) => return Ok((unique, None)),
            Err(shared) => shared,
        };

        let capacity = shared.allocated_len();
        if let Some(spare) = self.spare.take() {
            if spare.allocated_len() >= capacity {
                return Ok((spare, Some(shared)));
            }
        }
        debug!(capacity, "current image is shared, allocating a new buffer");
        match BitmapImage::with_capacity(capacity) {
            Ok(fresh) => Ok((fresh, Some(shared))),
            Err(err) => {
                self.current = Some(shared);
                Err(err)
            }
        }
    }

    /// The previous image. When none exists and `copy_if_absent` is set,
    /// a deep copy of `current` becomes the previous image.
    pub fn rotate_to_previous(
        &mut self,
        copy_if_absent: bool,
    ) -> CaptureResult<Option<Arc<BitmapImage>>> {
        if self.previous.is_none() && copy_if_absent {
            if let Some(current) = self.current.as_ref() {
                self.previous = Some(Arc::new(current.deep_copy()?));
            }
        }
        Ok(self.previous.clone())
    }

    /// Make `current` the previous image. `current` stays readable until
    /// the next copy, which writes into a separate buffer.
    pub fn retire_current(&mut self) {
        let Some(current) = self.current.as_ref() else {
            return;
        };
        let replaced = self.previous.replace(Arc::clone(current));
        if let Some(old) = replaced.and_then(|old| Arc::try_unwrap(old).ok()) {
            self.spare = Some(old);
        }
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.previous = None;
        self.spare = None;
        self.current_source = None;
    }
}
