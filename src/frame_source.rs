use tracing::{debug, info};

use crate::backend::{CaptureBackend, DuplicationOutput, RawAcquire, Rotation};
use crate::device::translate_failure;
use crate::error::{CaptureError, CaptureResult};
use crate::frame::{AcquireOutcome, Frame, FrameInfo, MetadataBuffer};
use crate::monitor::MonitorDescriptor;
use crate::pointer::PointerInfo;
use crate::region::{Point, Rect, MOVE_RECT_BYTES};

struct HeldFrame<S> {
    surface: S,
    info: FrameInfo,
    sequence: u64,
}

/// One output's duplication stream.
///
/// At most one frame is outstanding at a time. Acquiring a new frame
/// releases the previous one, and dropping the source releases whatever
/// is still held.
pub struct FrameSource<D: DuplicationOutput> {
    duplication: D,
    output_index: usize,
    desktop_rect: Rect,
    rotation: Rotation,
    metadata: MetadataBuffer,
    held: Option<HeldFrame<D::Surface>>,
    sequence: u64,
}

impl<D: DuplicationOutput> FrameSource<D> {
    /// Duplicate the output described by `descriptor` on `device`.
    pub fn initialize<B>(
        backend: &B,
        device: &B::Device,
        descriptor: &MonitorDescriptor<B::Adapter, B::Output>,
    ) -> CaptureResult<Self>
    where
        B: CaptureBackend<Duplication = D>,
    {
        let duplication = backend.duplicate_output(device, &descriptor.output)?;
        Self::from_duplication(duplication, descriptor.index, descriptor.desktop_rect)
    }

    pub fn from_duplication(
        duplication: D,
        output_index: usize,
        desktop_rect: Rect,
    ) -> CaptureResult<Self> {
        let rotation = duplication.rotation();
        if rotation.is_rotated() {
            return Err(CaptureError::UnsupportedRotation(rotation));
        }
        info!(output_index, ?desktop_rect, ?rotation, "frame source ready");
        Ok(Self {
            duplication,
            output_index,
            desktop_rect,
            rotation,
            metadata: MetadataBuffer::new(),
            held: None,
            sequence: 0,
        })
    }

    pub fn output_index(&self) -> usize {
        self.output_index
    }

    pub fn desktop_rect(&self) -> Rect {
        self.desktop_rect
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn metadata_capacity(&self) -> u32 {
        self.metadata.capacity_bytes()
    }

    /// Wait up to `timeout_ms` for the next desktop image.
    pub fn acquire_frame(&mut self, timeout_ms: u32) -> CaptureResult<AcquireOutcome<'_, D::Surface>> {
        self.release_frame()?;

        let acquired = self
            .duplication
            .acquire_next_frame(timeout_ms)
            .map_err(|err| translate_failure(self.duplication.removed_reason(), err))?;

        let (surface, info) = match acquired {
            RawAcquire::TimedOut => return Ok(AcquireOutcome::TimedOut),
            RawAcquire::Acquired {
                surface: Some(surface),
                info,
            } => (surface, info),
            RawAcquire::Acquired { surface: None, .. } => {
                // Nothing to read back; hand the frame straight back.
                self.duplication
                    .release_frame()
                    .map_err(|err| translate_failure(self.duplication.removed_reason(), err))?;
                return Ok(AcquireOutcome::TimedOut);
            }
        };

        self.sequence += 1;
        self.held = Some(HeldFrame {
            surface,
            info,
            sequence: self.sequence,
        });

        if info.total_metadata_size > 0 {
            self.fetch_metadata(info.total_metadata_size)?;
        }

        match self.held_frame() {
            Some(frame) => Ok(AcquireOutcome::Frame(frame)),
            None => Err(CaptureError::NoFrame),
        }
    }

    fn fetch_metadata(&mut self, total_size: u32) -> CaptureResult<()> {
        self.metadata.ensure_capacity(total_size)?;

        let Self {
            duplication,
            metadata,
            ..
        } = self;
        let (moves, dirty) = metadata.parts_mut();

        if let Err(err) = duplication.frame_move_rects(total_size, moves) {
            metadata.clear();
            return Err(translate_failure(duplication.removed_reason(), err));
        }

        let move_bytes = u32::try_from(moves.len() * MOVE_RECT_BYTES).unwrap_or(u32::MAX);
        let remaining = total_size.saturating_sub(move_bytes);
        if let Err(err) = duplication.frame_dirty_rects(remaining, dirty) {
            metadata.clear();
            return Err(translate_failure(duplication.removed_reason(), err));
        }

        debug!(
            moves = metadata.move_count(),
            dirty = metadata.dirty_count(),
            total_size,
            "fetched frame metadata"
        );
        metadata.mark_populated();
        Ok(())
    }

    /// Re-view the outstanding frame, if any.
    pub fn held_frame(&self) -> Option<Frame<'_, D::Surface>> {
        self.held.as_ref().map(|held| Frame {
            surface: &held.surface,
            info: held.info,
            sequence: held.sequence,
            metadata: self.metadata.view(held.info.total_metadata_size),
        })
    }

    /// Hand the outstanding frame back to the duplication. No-op when
    /// nothing is held.
    pub fn release_frame(&mut self) -> CaptureResult<()> {
        if self.held.take().is_none() {
            return Ok(());
        }
        self.metadata.clear();
        self.duplication
            .release_frame()
            .map_err(|err| translate_failure(self.duplication.removed_reason(), err))
    }

    /// Fold the held frame's pointer update into `pointer`. `offset` is
    /// subtracted from desktop coordinates, so callers composing several
    /// outputs pass the virtual desktop origin.
    pub fn update_pointer(&mut self, pointer: &mut PointerInfo, offset: Point) -> CaptureResult<()> {
        let Some(info) = self.held.as_ref().map(|held| held.info) else {
            return Err(CaptureError::NoFrame);
        };
        if info.last_mouse_update_time == 0 {
            return Ok(());
        }

        pointer.apply_position(&info, self.output_index, self.desktop_rect.top_left(), offset);

        if info.pointer_shape_buffer_size == 0 {
            return Ok(());
        }
        let buffer = pointer.shape_buffer(info.pointer_shape_buffer_size)?;
        match self.duplication.frame_pointer_shape(buffer) {
            Ok(shape_info) => {
                pointer.shape_info = shape_info;
                Ok(())
            }
            Err(err) => {
                pointer.discard_shape();
                Err(translate_failure(self.duplication.removed_reason(), err))
            }
        }
    }
}

impl<D: DuplicationOutput> Drop for FrameSource<D> {
    fn drop(&mut self) {
        if self.held.take().is_some() {
            let _ = self.duplication.release_frame();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RemovedReason;
    use crate::region::MoveRect;
    use crate::testing::{MockBackend, MockFailure, MockFrame, MockStep};

    fn source(backend: &MockBackend) -> CaptureResult<FrameSource<crate::testing::MockDuplication>> {
        let duplication = backend.duplication()?;
        FrameSource::from_duplication(duplication, 0, Rect::new(0, 0, 64, 32))
    }

    #[test]
    fn timeout_is_not_an_error() -> CaptureResult<()> {
        let backend = MockBackend::single_output(64, 32);
        backend.script([MockStep::Timeout]);
        let mut source = source(&backend)?;
        assert!(matches!(source.acquire_frame(5)?, AcquireOutcome::TimedOut));
        assert!(source.held_frame().is_none());
        Ok(())
    }

    #[test]
    fn second_acquire_releases_first_frame() -> CaptureResult<()> {
        let backend = MockBackend::single_output(64, 32);
        backend.script([
            MockStep::Frame(MockFrame::solid(64, 32, 1)),
            MockStep::Frame(MockFrame::solid(64, 32, 2)),
        ]);
        let mut source = source(&backend)?;
        let first = source.acquire_frame(5)?.into_frame().map(|frame| frame.sequence);
        let second = source.acquire_frame(5)?.into_frame().map(|frame| frame.sequence);
        assert_eq!((first, second), (Some(1), Some(2)));
        assert_eq!(backend.counters().releases, 1);
        Ok(())
    }

    #[test]
    fn release_without_held_frame_is_noop() -> CaptureResult<()> {
        let backend = MockBackend::single_output(64, 32);
        let mut source = source(&backend)?;
        source.release_frame()?;
        source.release_frame()?;
        assert_eq!(backend.counters().releases, 0);
        Ok(())
    }

    #[test]
    fn rotated_output_is_rejected() {
        let backend = MockBackend::single_output(64, 32);
        backend.set_rotation(Rotation::Rotate90);
        let result = backend
            .duplication()
            .and_then(|dup| FrameSource::from_duplication(dup, 0, Rect::new(0, 0, 64, 32)));
        assert!(matches!(
            result,
            Err(CaptureError::UnsupportedRotation(Rotation::Rotate90))
        ));
    }

    #[test]
    fn identity_and_unspecified_rotations_are_accepted() -> CaptureResult<()> {
        for rotation in [Rotation::Identity, Rotation::Unspecified] {
            let backend = MockBackend::single_output(64, 32);
            backend.set_rotation(rotation);
            assert_eq!(source(&backend)?.rotation(), rotation);
        }
        Ok(())
    }

    #[test]
    fn metadata_is_fetched_with_total_size_budget() -> CaptureResult<()> {
        let backend = MockBackend::single_output(64, 32);
        let moves = vec![MoveRect::new(Point::new(0, 0), Rect::new(0, 8, 64, 16))];
        let dirty = vec![Rect::new(0, 0, 64, 8), Rect::new(10, 20, 20, 30)];
        backend.script([MockStep::Frame(
            MockFrame::solid(64, 32, 3).with_moves(moves.clone()).with_dirty(dirty.clone()),
        )]);
        let mut source = source(&backend)?;
        let frame = source.acquire_frame(5)?.into_frame().ok_or(CaptureError::NoFrame)?;
        assert_eq!(frame.metadata.total_size, 24 + 2 * 16);
        assert_eq!(frame.metadata.move_rects, Some(moves.as_slice()));
        assert_eq!(frame.metadata.dirty_rects, Some(dirty.as_slice()));
        assert_eq!(backend.counters().move_budgets, vec![24 + 2 * 16]);
        assert_eq!(backend.counters().dirty_budgets, vec![2 * 16]);
        Ok(())
    }

    #[test]
    fn failed_metadata_fetch_resets_counts_and_keeps_capacity() -> CaptureResult<()> {
        let backend = MockBackend::single_output(64, 32);
        backend.script([
            MockStep::Frame(MockFrame::solid(64, 32, 1).with_dirty(vec![Rect::new(0, 0, 8, 8); 8])),
            MockStep::Frame(
                MockFrame::solid(64, 32, 2)
                    .with_dirty(vec![Rect::new(0, 0, 4, 4)])
                    .failing_metadata(MockFailure::Platform),
            ),
        ]);
        let mut source = source(&backend)?;
        source.acquire_frame(5)?;
        let grown = source.metadata_capacity();
        assert_eq!(grown, 8 * 16);

        assert!(matches!(source.acquire_frame(5), Err(CaptureError::Platform(_))));
        assert_eq!(source.metadata_capacity(), grown);
        let held = source.held_frame().ok_or(CaptureError::NoFrame)?;
        assert!(held.metadata.move_rects.is_none());
        assert!(held.metadata.dirty_rects.is_none());
        Ok(())
    }

    #[test]
    fn device_removed_during_acquire_is_translated() -> CaptureResult<()> {
        let backend = MockBackend::single_output(64, 32);
        backend.script([MockStep::Fail(MockFailure::DeviceRemoved(RemovedReason::Reset))]);
        let mut source = source(&backend)?;
        assert!(matches!(source.acquire_frame(5), Err(CaptureError::DeviceRemoved)));
        Ok(())
    }

    #[test]
    fn surfaceless_frame_is_released_and_reported_as_timeout() -> CaptureResult<()> {
        let backend = MockBackend::single_output(64, 32);
        backend.script([MockStep::EmptyFrame]);
        let mut source = source(&backend)?;
        assert!(matches!(source.acquire_frame(5)?, AcquireOutcome::TimedOut));
        assert_eq!(backend.counters().releases, 1);
        Ok(())
    }

    #[test]
    fn dropping_source_releases_held_frame() -> CaptureResult<()> {
        let backend = MockBackend::single_output(64, 32);
        backend.script([MockStep::Frame(MockFrame::solid(64, 32, 1))]);
        let mut source = source(&backend)?;
        source.acquire_frame(5)?;
        drop(source);
        assert_eq!(backend.counters().releases, 1);
        Ok(())
    }

    #[test]
    fn pointer_shape_is_fetched_into_shared_info() -> CaptureResult<()> {
        let backend = MockBackend::single_output(64, 32);
        backend.script([MockStep::Frame(
            MockFrame::solid(64, 32, 1).with_pointer(Point::new(3, 4), vec![0xAB; 32]),
        )]);
        let mut source = FrameSource::from_duplication(
            backend.duplication()?,
            2,
            Rect::new(100, 50, 164, 82),
        )?;
        source.acquire_frame(5)?;
        let mut pointer = PointerInfo::new();
        source.update_pointer(&mut pointer, Point::default())?;
        assert_eq!(pointer.position, Point::new(103, 54));
        assert_eq!(pointer.last_updated_by, Some(2));
        assert_eq!(pointer.shape, vec![0xAB; 32]);
        Ok(())
    }

    #[test]
    fn failed_shape_fetch_discards_buffer() -> CaptureResult<()> {
        let backend = MockBackend::single_output(64, 32);
        backend.script([MockStep::Frame(
            MockFrame::solid(64, 32, 1)
                .with_pointer(Point::new(1, 1), vec![1; 16])
                .failing_pointer_shape(),
        )]);
        let mut source = source(&backend)?;
        source.acquire_frame(5)?;
        let mut pointer = PointerInfo::new();
        assert!(source.update_pointer(&mut pointer, Point::default()).is_err());
        assert!(pointer.shape.is_empty());
        // Position still moved before the shape fetch failed.
        assert_eq!(pointer.position, Point::new(1, 1));
        Ok(())
    }
}
