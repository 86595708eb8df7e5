//! Pointer position and shape tracking across one or more outputs.
//!
//! Several frame sources (one per output) may feed the same
//! [`PointerInfo`]. The output that last moved the pointer owns the
//! position until another output reports a newer visible pointer.

use crate::backend::PointerShapeInfo;
use crate::error::{CaptureError, CaptureResult};
use crate::frame::FrameInfo;
use crate::region::Point;

#[derive(Clone, Debug, Default)]
pub struct PointerInfo {
    /// Position in the caller's coordinate space (desktop minus offset).
    pub position: Point,
    pub visible: bool,
    /// Output index whose frame last moved the pointer.
    pub last_updated_by: Option<usize>,
    /// `last_mouse_update_time` of the update that set `position`.
    pub last_timestamp: i64,
    /// Raw shape bytes as returned by the duplication source.
    pub shape: Vec<u8>,
    pub shape_info: PointerShapeInfo,
}

impl PointerInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a frame from `output_index` may overwrite the stored
    /// position.
    pub fn should_update_position(&self, info: &FrameInfo, output_index: usize) -> bool {
        let owned_elsewhere = self.last_updated_by != Some(output_index);
        if !info.pointer_visible && owned_elsewhere {
            return false;
        }
        if info.pointer_visible
            && self.visible
            && owned_elsewhere
            && self.last_timestamp > info.last_mouse_update_time
        {
            return false;
        }
        true
    }

    /// Apply the position part of a frame update. Returns whether the
    /// stored position changed owner or value.
    pub fn apply_position(
        &mut self,
        info: &FrameInfo,
        output_index: usize,
        output_origin: Point,
        offset: Point,
    ) -> bool {
        if info.last_mouse_update_time == 0 || !self.should_update_position(info, output_index) {
            return false;
        }
        self.position = Point::new(
            info.pointer_position.x + output_origin.x - offset.x,
            info.pointer_position.y + output_origin.y - offset.y,
        );
        self.last_updated_by = Some(output_index);
        self.last_timestamp = info.last_mouse_update_time;
        self.visible = info.pointer_visible;
        true
    }

    /// Grow the shape buffer to hold `required` bytes and return it.
    pub(crate) fn shape_buffer(&mut self, required: u32) -> CaptureResult<&mut [u8]> {
        let required = usize::try_from(required).map_err(|_| CaptureError::BufferOverflow)?;
        if required > self.shape.len() {
            let additional = required - self.shape.len();
            if self.shape.try_reserve_exact(additional).is_err() {
                self.discard_shape();
                return Err(CaptureError::OutOfMemory("pointer shape"));
            }
            self.shape.resize(required, 0);
        }
        Ok(&mut self.shape[..required])
    }

    pub(crate) fn discard_shape(&mut self) {
        self.shape = Vec::new();
        self.shape_info = PointerShapeInfo::default();
    }
}
