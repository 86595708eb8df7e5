use crate::device::{DeviceCreationParams, RemovedReason};
use crate::error::CaptureResult;
use crate::frame::FrameInfo;
use crate::region::{MoveRect, Point, Rect};

/// Output rotation reported by the duplication description.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    Unspecified,
    Identity,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Rotation {
    /// Rotated outputs deliver surfaces in panel orientation and are not
    /// captured.
    pub const fn is_rotated(self) -> bool {
        matches!(self, Self::Rotate90 | Self::Rotate180 | Self::Rotate270)
    }
}

/// CPU view of a GPU region copy. `data` holds at least
/// `row_pitch * (height - 1) + width * 4` bytes.
#[derive(Clone, Copy, Debug)]
pub struct MappedRegion<'a> {
    pub data: &'a [u8],
    pub row_pitch: u32,
    pub width: u32,
    pub height: u32,
}

/// One attached output as reported by the enumeration collaborator.
#[derive(Clone, Debug)]
pub struct OutputEntry<A, O> {
    pub adapter_index: u32,
    pub output_index: u32,
    /// Output bounds in virtual desktop coordinates.
    pub desktop_rect: Rect,
    pub name: String,
    pub adapter: A,
    pub output: O,
}

#[derive(Debug)]
pub enum RawAcquire<S> {
    Acquired { surface: Option<S>, info: FrameInfo },
    TimedOut,
}

/// Shape header returned with a pointer shape fetch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PointerShapeInfo {
    pub shape_type: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub hotspot: Point,
}

pub trait GraphicsDevice: Send {
    type Surface: Send;

    /// Copy `rect` of `surface` to CPU-readable memory and hand the mapped
    /// bytes to `sink`. The mapping is only valid for the duration of the
    /// callback.
    fn read_region(
        &mut self,
        surface: &Self::Surface,
        rect: Rect,
        sink: &mut dyn FnMut(MappedRegion<'_>) -> CaptureResult<()>,
    ) -> CaptureResult<()>;

    fn removed_reason(&self) -> RemovedReason;
}

pub trait DuplicationOutput: Send {
    type Surface: Send;

    fn rotation(&self) -> Rotation;

    /// Block for at most `timeout_ms` waiting for the next desktop image.
    fn acquire_next_frame(&mut self, timeout_ms: u32) -> CaptureResult<RawAcquire<Self::Surface>>;

    /// Fill `out` with the move rectangles of the held frame, reading at
    /// most `budget_bytes` of metadata.
    fn frame_move_rects(&mut self, budget_bytes: u32, out: &mut Vec<MoveRect>)
        -> CaptureResult<()>;

    fn frame_dirty_rects(&mut self, budget_bytes: u32, out: &mut Vec<Rect>) -> CaptureResult<()>;

    fn frame_pointer_shape(&mut self, out: &mut [u8]) -> CaptureResult<PointerShapeInfo>;

    fn release_frame(&mut self) -> CaptureResult<()>;

    fn removed_reason(&self) -> RemovedReason;
}

/// Platform seam: output enumeration, device creation, and duplication.
pub trait CaptureBackend: Send {
    type Adapter: Clone + Send;
    type Output: Clone + Send;
    type Device: GraphicsDevice;
    type Duplication: DuplicationOutput<Surface = <Self::Device as GraphicsDevice>::Surface>;

    /// Attached outputs in adapter-major order.
    fn enumerate_outputs(&self) -> CaptureResult<Vec<OutputEntry<Self::Adapter, Self::Output>>>;

    fn create_device(
        &self,
        adapter: &Self::Adapter,
        params: &DeviceCreationParams,
    ) -> CaptureResult<Self::Device>;

    fn duplicate_output(
        &self,
        device: &Self::Device,
        output: &Self::Output,
    ) -> CaptureResult<Self::Duplication>;
}

#[cfg(test)]
mod tests {
    use super::Rotation;

    #[test]
    fn only_quarter_turns_count_as_rotated() {
        assert!(!Rotation::Unspecified.is_rotated());
        assert!(!Rotation::Identity.is_rotated());
        assert!(Rotation::Rotate90.is_rotated());
        assert!(Rotation::Rotate180.is_rotated());
        assert!(Rotation::Rotate270.is_rotated());
    }
}
