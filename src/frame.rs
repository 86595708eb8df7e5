use crate::error::{CaptureError, CaptureResult};
use crate::region::{MoveRect, Point, Rect, DIRTY_RECT_BYTES, MOVE_RECT_BYTES};

/// Per-frame information reported by the duplication source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameInfo {
    /// QPC time of the last desktop present. Zero when only the pointer
    /// changed.
    pub last_present_time: i64,
    /// QPC time of the last pointer update. Zero when the pointer did not
    /// move or change shape.
    pub last_mouse_update_time: i64,
    /// Desktop presents folded into this frame since the previous acquire.
    pub accumulated_frames: u32,
    pub rects_coalesced: bool,
    pub protected_content_masked_out: bool,
    /// Pointer position relative to the output's top-left corner.
    pub pointer_position: Point,
    pub pointer_visible: bool,
    /// Bytes of move plus dirty metadata available for this frame.
    pub total_metadata_size: u32,
    /// Bytes needed to fetch the new pointer shape, zero when unchanged.
    pub pointer_shape_buffer_size: u32,
}

/// Move/dirty rectangles of one frame as seen by the reconciler.
///
/// A slice is `None` when the source never populated it. Non-zero
/// `total_size` with a missing slice means the metadata is unusable.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameMetadata<'a> {
    pub total_size: u32,
    pub move_rects: Option<&'a [MoveRect]>,
    pub dirty_rects: Option<&'a [Rect]>,
}

impl FrameMetadata<'_> {
    pub fn has_changes(&self) -> bool {
        self.move_rects.is_some_and(|moves| !moves.is_empty())
            || self.dirty_rects.is_some_and(|dirty| !dirty.is_empty())
    }
}

/// Reusable storage for move and dirty rectangles.
///
/// `capacity_bytes` only ever grows. A failed grow keeps the previous
/// capacity and empties both lists.
#[derive(Debug, Default)]
pub struct MetadataBuffer {
    moves: Vec<MoveRect>,
    dirty: Vec<Rect>,
    capacity_bytes: u32,
    populated: bool,
}

impl MetadataBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity_bytes(&self) -> u32 {
        self.capacity_bytes
    }

    pub fn move_count(&self) -> usize {
        self.moves.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Empty both lists and forget whether they were fetched.
    pub fn clear(&mut self) {
        self.moves.clear();
        self.dirty.clear();
        self.populated = false;
    }

    /// Make room for `required_bytes` of metadata.
    pub fn ensure_capacity(&mut self, required_bytes: u32) -> CaptureResult<()> {
        if required_bytes <= self.capacity_bytes {
            return Ok(());
        }
        let bytes = usize::try_from(required_bytes).map_err(|_| CaptureError::BufferOverflow)?;
        let grown = self
            .moves
            .try_reserve(bytes.div_ceil(MOVE_RECT_BYTES))
            .and_then(|()| self.dirty.try_reserve(bytes.div_ceil(DIRTY_RECT_BYTES)));
        if grown.is_err() {
            self.clear();
            return Err(CaptureError::OutOfMemory("frame metadata"));
        }
        tracing::debug!(
            from = self.capacity_bytes,
            to = required_bytes,
            "grew frame metadata buffer"
        );
        self.capacity_bytes = required_bytes;
        Ok(())
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut Vec<MoveRect>, &mut Vec<Rect>) {
        (&mut self.moves, &mut self.dirty)
    }

    pub(crate) fn mark_populated(&mut self) {
        self.populated = true;
    }

    pub fn view(&self, total_size: u32) -> FrameMetadata<'_> {
        let (move_rects, dirty_rects) = if self.populated {
            (Some(self.moves.as_slice()), Some(self.dirty.as_slice()))
        } else {
            (None, None)
        };
        FrameMetadata {
            total_size,
            move_rects,
            dirty_rects,
        }
    }
}

/// A desktop image held by a frame source until released.
#[derive(Debug)]
pub struct Frame<'a, S> {
    pub surface: &'a S,
    pub info: FrameInfo,
    /// Per-source counter, starting at 1 for the first acquired frame.
    pub sequence: u64,
    pub metadata: FrameMetadata<'a>,
}

#[derive(Debug)]
pub enum AcquireOutcome<'a, S> {
    Frame(Frame<'a, S>),
    /// No new desktop image arrived within the timeout.
    TimedOut,
}

impl<'a, S> AcquireOutcome<'a, S> {
    pub fn into_frame(self) -> Option<Frame<'a, S>> {
        match self {
            Self::Frame(frame) => Some(frame),
            Self::TimedOut => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_never_decreases() -> CaptureResult<()> {
        let mut buffer = MetadataBuffer::new();
        let mut observed = Vec::new();
        for required in [96, 48, 240, 64] {
            buffer.ensure_capacity(required)?;
            observed.push(buffer.capacity_bytes());
        }
        assert_eq!(observed, vec![96, 96, 240, 240]);
        Ok(())
    }

    #[test]
    fn unpopulated_buffer_yields_absent_slices() {
        let mut buffer = MetadataBuffer::new();
        let view = buffer.view(64);
        assert!(view.move_rects.is_none());
        assert!(view.dirty_rects.is_none());

        buffer.parts_mut().1.push(Rect::new(0, 0, 4, 4));
        buffer.mark_populated();
        let view = buffer.view(16);
        assert_eq!(view.move_rects.map(<[_]>::len), Some(0));
        assert_eq!(view.dirty_rects.map(<[_]>::len), Some(1));
        assert!(view.has_changes());
    }

    #[test]
    fn clear_resets_counts_but_keeps_capacity() -> CaptureResult<()> {
        let mut buffer = MetadataBuffer::new();
        buffer.ensure_capacity(128)?;
        buffer.parts_mut().0.push(MoveRect::default());
        buffer.mark_populated();
        buffer.clear();
        assert_eq!(buffer.move_count(), 0);
        assert_eq!(buffer.capacity_bytes(), 128);
        assert!(buffer.view(128).move_rects.is_none());
        Ok(())
    }
}
