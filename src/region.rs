//! Screen-space geometry shared by the duplication metadata, the region
//! reconciler, and the frame buffer cache.
//!
//! [`Rect`] uses the same edge convention as the desktop duplication API:
//! `left`/`top` inclusive, `right`/`bottom` exclusive, all in output pixel
//! coordinates. The types are `repr(C)` so platform code can convert the
//! native structures field by field without reinterpretation surprises.

use crate::error::{CaptureError, CaptureResult};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Build a rectangle from an origin and a size.
    pub fn from_origin_size(x: i32, y: i32, width: u32, height: u32) -> CaptureResult<Self> {
        let width = i32::try_from(width).map_err(|_| CaptureError::BufferOverflow)?;
        let height = i32::try_from(height).map_err(|_| CaptureError::BufferOverflow)?;
        Ok(Self {
            left: x,
            top: y,
            right: x.checked_add(width).ok_or(CaptureError::BufferOverflow)?,
            bottom: y.checked_add(height).ok_or(CaptureError::BufferOverflow)?,
        })
    }

    #[inline]
    pub const fn top_left(&self) -> Point {
        Point {
            x: self.left,
            y: self.top,
        }
    }

    /// Signed width. Negative for inverted rectangles reported by drivers.
    #[inline]
    pub fn width(&self) -> i64 {
        i64::from(self.right) - i64::from(self.left)
    }

    #[inline]
    pub fn height(&self) -> i64 {
        i64::from(self.bottom) - i64::from(self.top)
    }

    /// Absolute area, `|(right-left) * (bottom-top)|`.
    #[inline]
    pub fn area(&self) -> u64 {
        (self.width() * self.height()).unsigned_abs()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }

    /// Intersection, or `None` when the rectangles do not overlap.
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let clipped = Rect {
            left: self.left.max(other.left),
            top: self.top.max(other.top),
            right: self.right.min(other.right),
            bottom: self.bottom.min(other.bottom),
        };
        (!clipped.is_empty()).then_some(clipped)
    }

    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.left >= self.left
            && other.top >= self.top
            && other.right <= self.right
            && other.bottom <= self.bottom
    }

    /// Translate so that `origin` becomes (0, 0).
    pub fn relative_to(&self, origin: Point) -> Rect {
        Rect {
            left: self.left - origin.x,
            top: self.top - origin.y,
            right: self.right - origin.x,
            bottom: self.bottom - origin.y,
        }
    }

    /// Width/height as unsigned pixel counts, rejecting empty rectangles.
    pub fn extent(&self) -> CaptureResult<(u32, u32)> {
        if self.is_empty() {
            return Err(CaptureError::InvalidConfig(format!(
                "region {self:?} must have positive width and height"
            )));
        }
        let width = u32::try_from(self.width()).map_err(|_| CaptureError::BufferOverflow)?;
        let height = u32::try_from(self.height()).map_err(|_| CaptureError::BufferOverflow)?;
        Ok((width, height))
    }
}

/// A region whose content shifted from `source` to `destination`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MoveRect {
    /// Top-left of the content before the move.
    pub source: Point,
    pub destination: Rect,
}

impl MoveRect {
    pub const fn new(source: Point, destination: Rect) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// A move whose source equals its destination origin did not actually
    /// shift anything.
    #[inline]
    pub fn is_noop(&self) -> bool {
        self.source == self.destination.top_left()
    }
}

/// Bytes a single move entry occupies in duplication metadata.
pub const MOVE_RECT_BYTES: usize = std::mem::size_of::<MoveRect>();
/// Bytes a single dirty entry occupies in duplication metadata.
pub const DIRTY_RECT_BYTES: usize = std::mem::size_of::<Rect>();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_entry_sizes_match_native_layout() {
        assert_eq!(MOVE_RECT_BYTES, 24);
        assert_eq!(DIRTY_RECT_BYTES, 16);
    }

    #[test]
    fn area_is_absolute_for_inverted_rects() {
        let inverted = Rect::new(10, 10, 0, 5);
        assert_eq!(inverted.area(), 50);
        assert!(inverted.is_empty());
        assert!(inverted.extent().is_err());
    }

    #[test]
    fn intersect_returns_none_for_disjoint_rects() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(10, 0, 20, 10);
        assert_eq!(a.intersect(&b), None);
        assert_eq!(
            a.intersect(&Rect::new(5, 5, 15, 15)),
            Some(Rect::new(5, 5, 10, 10))
        );
    }

    #[test]
    fn noop_move_detects_identical_anchor() {
        let noop = MoveRect::new(Point::new(4, 8), Rect::new(4, 8, 20, 20));
        let shifted = MoveRect::new(Point::new(4, 0), Rect::new(4, 8, 20, 20));
        assert!(noop.is_noop());
        assert!(!shifted.is_noop());
    }

    #[test]
    fn from_origin_size_rejects_overflow() {
        assert!(Rect::from_origin_size(i32::MAX, 0, 10, 10).is_err());
        assert_eq!(
            Rect::from_origin_size(-100, 20, 50, 30).ok(),
            Some(Rect::new(-100, 20, -50, 50))
        );
    }
}
