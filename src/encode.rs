//! Boundary between captured images and a video encoder.
//!
//! The encoder is external. It receives raw BGRA rows through
//! [`EncodeFeeder`] together with a timestamp and duration in 100 ns units.

use crate::bitmap::BitmapImage;
use crate::error::{CaptureError, CaptureResult};
use crate::parallel::copy_rows;
use crate::region::Rect;

/// Duration of one sample at 60 fps, in 100 ns units.
pub const VIDEO_FRAME_DURATION: i64 = 10_000_000 / 60;

const HUNDRED_NS_PER_SECOND: i64 = 10_000_000;

/// One frame's worth of pixel data handed to the encoder.
#[derive(Clone, Copy, Debug)]
pub struct EncoderSample<'a> {
    pub pixels: &'a [u8],
    pub row_pitch: u32,
    pub width: u32,
    pub height: u32,
    /// Presentation time in 100 ns units.
    pub timestamp: i64,
    pub duration: i64,
}

pub trait EncodeFeeder {
    fn feed(&mut self, sample: EncoderSample<'_>) -> CaptureResult<()>;
}

impl<F: EncodeFeeder + ?Sized> EncodeFeeder for &mut F {
    fn feed(&mut self, sample: EncoderSample<'_>) -> CaptureResult<()> {
        (**self).feed(sample)
    }
}

/// Monotonic sample clock advancing by a fixed frame duration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleClock {
    next: i64,
    frame_duration: i64,
}

impl Default for SampleClock {
    fn default() -> Self {
        Self {
            next: 0,
            frame_duration: VIDEO_FRAME_DURATION,
        }
    }
}

impl SampleClock {
    pub fn new(frame_duration: i64) -> CaptureResult<Self> {
        if frame_duration <= 0 {
            return Err(CaptureError::InvalidConfig(format!(
                "frame duration must be positive, got {frame_duration}"
            )));
        }
        Ok(Self {
            next: 0,
            frame_duration,
        })
    }

    pub fn for_fps(fps: u32) -> CaptureResult<Self> {
        if fps == 0 {
            return Err(CaptureError::InvalidConfig("fps must be positive".into()));
        }
        Self::new(HUNDRED_NS_PER_SECOND / i64::from(fps))
    }

    pub fn frame_duration(&self) -> i64 {
        self.frame_duration
    }

    /// Timestamp for the next sample. Advances the clock.
    pub fn tick(&mut self) -> i64 {
        let timestamp = self.next;
        self.next += self.frame_duration;
        timestamp
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }
}

/// Builds encoder samples from captured images.
///
/// Whole images are referenced in place. A crop is copied into a scratch
/// buffer owned by the builder and reused across samples.
#[derive(Debug, Default)]
pub struct EncoderSampleBuilder {
    clock: SampleClock,
    scratch: Vec<u8>,
}

impl EncoderSampleBuilder {
    pub fn new(clock: SampleClock) -> Self {
        Self {
            clock,
            scratch: Vec::new(),
        }
    }

    pub fn clock(&self) -> &SampleClock {
        &self.clock
    }

    /// `region` is in image coordinates and is clipped to the image.
    pub fn build<'a>(
        &'a mut self,
        image: &'a BitmapImage,
        region: Option<Rect>,
    ) -> CaptureResult<EncoderSample<'a>> {
        let bounds = Rect::from_origin_size(0, 0, image.width, image.height)?;
        let crop = match region {
            Some(rect) if rect != bounds => Some(rect.intersect(&bounds).ok_or_else(|| {
                CaptureError::InvalidConfig(format!("crop {rect:?} lies outside {bounds:?}"))
            })?),
            _ => None,
        };

        let duration = self.clock.frame_duration();
        let Some(crop) = crop else {
            if image.size == 0 {
                return Err(CaptureError::NoFrame);
            }
            return Ok(EncoderSample {
                pixels: image.pixels(),
                row_pitch: image.row_pitch,
                width: image.width,
                height: image.height,
                timestamp: self.clock.tick(),
                duration,
            });
        };

        let (width, height) = crop.extent()?;
        let bytes_per_pixel = image.bytes_per_pixel as usize;
        let row_bytes = width as usize * bytes_per_pixel;
        let len = row_bytes
            .checked_mul(height as usize)
            .ok_or(CaptureError::BufferOverflow)?;
        if self.scratch.len() < len {
            self.scratch
                .try_reserve(len - self.scratch.len())
                .map_err(|_| CaptureError::OutOfMemory("encoder crop buffer"))?;
            self.scratch.resize(len, 0);
        }

        let src_pitch = image.row_pitch as usize;
        let offset = crop.top as usize * src_pitch + crop.left as usize * bytes_per_pixel;
        let src = image.pixels().get(offset..).ok_or(CaptureError::BufferOverflow)?;
        copy_rows(
            src,
            src_pitch,
            &mut self.scratch[..len],
            row_bytes,
            row_bytes,
            height as usize,
        )?;

        Ok(EncoderSample {
            pixels: &self.scratch[..len],
            row_pitch: u32::try_from(row_bytes).map_err(|_| CaptureError::BufferOverflow)?,
            width,
            height,
            timestamp: self.clock.tick(),
            duration,
        })
    }

    /// Build a sample and hand it to `feeder`.
    pub fn feed(
        &mut self,
        feeder: &mut dyn EncodeFeeder,
        image: &BitmapImage,
        region: Option<Rect>,
    ) -> CaptureResult<()> {
        let sample = self.build(image, region)?;
        feeder.feed(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MappedRegion;

    #[derive(Default)]
    struct RecordingFeeder {
        samples: Vec<(i64, u32, u32, Vec<u8>)>,
    }

    impl EncodeFeeder for RecordingFeeder {
        fn feed(&mut self, sample: EncoderSample<'_>) -> CaptureResult<()> {
            self.samples
                .push((sample.timestamp, sample.width, sample.height, sample.pixels.to_vec()));
            Ok(())
        }
    }

    /// 4x3 image, pitch 20, pixel = [x, y, 0, 0].
    fn image() -> CaptureResult<BitmapImage> {
        let mut data = vec![0xEEu8; 20 * 3];
        for y in 0..3u8 {
            for x in 0..4u8 {
                let at = y as usize * 20 + x as usize * 4;
                data[at..at + 4].copy_from_slice(&[x, y, 0, 0]);
            }
        }
        let mut image = BitmapImage::new();
        image.transcribe(MappedRegion {
            data: &data,
            row_pitch: 20,
            width: 4,
            height: 3,
        })?;
        Ok(image)
    }

    #[test]
    fn timestamps_advance_by_frame_duration() -> CaptureResult<()> {
        let image = image()?;
        let mut builder = EncoderSampleBuilder::default();
        let mut feeder = RecordingFeeder::default();
        for _ in 0..3 {
            builder.feed(&mut feeder, &image, None)?;
        }
        let stamps: Vec<_> = feeder.samples.iter().map(|s| s.0).collect();
        assert_eq!(stamps, vec![0, 166_666, 333_332]);
        Ok(())
    }

    #[test]
    fn whole_image_is_referenced_with_its_pitch() -> CaptureResult<()> {
        let image = image()?;
        let mut builder = EncoderSampleBuilder::default();
        let sample = builder.build(&image, None)?;
        assert_eq!(sample.row_pitch, 20);
        assert_eq!(sample.pixels.as_ptr(), image.pixels().as_ptr());
        assert_eq!(sample.duration, VIDEO_FRAME_DURATION);
        Ok(())
    }

    #[test]
    fn crop_is_packed_without_padding() -> CaptureResult<()> {
        let image = image()?;
        let mut builder = EncoderSampleBuilder::default();
        let sample = builder.build(&image, Some(Rect::new(1, 1, 3, 3)))?;
        assert_eq!((sample.width, sample.height, sample.row_pitch), (2, 2, 8));
        assert_eq!(
            sample.pixels,
            &[1, 1, 0, 0, 2, 1, 0, 0, 1, 2, 0, 0, 2, 2, 0, 0]
        );
        Ok(())
    }

    #[test]
    fn crop_outside_image_is_rejected() -> CaptureResult<()> {
        let image = image()?;
        let mut builder = EncoderSampleBuilder::default();
        assert!(matches!(
            builder.build(&image, Some(Rect::new(10, 10, 12, 12))),
            Err(CaptureError::InvalidConfig(_))
        ));
        Ok(())
    }

    #[test]
    fn fps_clock_rejects_zero() {
        assert!(SampleClock::for_fps(0).is_err());
        assert_eq!(SampleClock::for_fps(30).map(|c| c.frame_duration()).ok(), Some(333_333));
    }
}
