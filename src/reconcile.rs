//! Folding move/dirty metadata into a single changed-region set.

use crate::error::{CaptureError, CaptureResult};
use crate::frame::FrameMetadata;
use crate::region::{MoveRect, Rect};

/// Regions that changed since the previous frame.
///
/// Moved regions come first (in source order, no-ops removed), followed by
/// every dirty rectangle. `total_area` sums each entry's area without
/// merging overlaps.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangedRegionSet {
    pub moved: Vec<MoveRect>,
    pub dirty: Vec<Rect>,
    pub total_area: u64,
}

impl ChangedRegionSet {
    pub fn is_empty(&self) -> bool {
        self.moved.is_empty() && self.dirty.is_empty()
    }

    pub fn len(&self) -> usize {
        self.moved.len() + self.dirty.len()
    }

    /// Destination rectangles of the moves, then the dirty rectangles.
    pub fn iter(&self) -> impl Iterator<Item = Rect> + '_ {
        self.moved
            .iter()
            .map(|mv| mv.destination)
            .chain(self.dirty.iter().copied())
    }

    pub fn bounding_rect(&self) -> Option<Rect> {
        self.iter()
            .filter(|rect| !rect.is_empty())
            .reduce(|acc, rect| acc.union(&rect))
    }

    /// Destination rectangles clipped to `bounds`, dropping those that fall
    /// outside entirely.
    pub fn clipped_to(&self, bounds: Rect) -> Vec<Rect> {
        self.iter().filter_map(|rect| rect.intersect(&bounds)).collect()
    }

    fn clear(&mut self) {
        self.moved.clear();
        self.dirty.clear();
        self.total_area = 0;
    }

    fn extend_from(&mut self, moves: &[MoveRect], dirty: &[Rect]) {
        for mv in moves.iter().filter(|mv| !mv.is_noop()) {
            self.total_area += mv.destination.area();
            self.moved.push(*mv);
        }
        for rect in dirty {
            self.total_area += rect.area();
            self.dirty.push(*rect);
        }
    }
}

pub fn reconcile(moves: &[MoveRect], dirty: &[Rect]) -> ChangedRegionSet {
    let mut set = ChangedRegionSet::default();
    set.extend_from(moves, dirty);
    set
}

/// Reconcile a frame's metadata, rejecting frames that report metadata
/// without the rectangles to back it.
pub fn reconcile_metadata(metadata: &FrameMetadata<'_>) -> CaptureResult<ChangedRegionSet> {
    let mut set = ChangedRegionSet::default();
    fill(&mut set, metadata)?;
    Ok(set)
}

fn fill(set: &mut ChangedRegionSet, metadata: &FrameMetadata<'_>) -> CaptureResult<()> {
    set.clear();
    if metadata.total_size == 0 {
        return Ok(());
    }
    let (Some(moves), Some(dirty)) = (metadata.move_rects, metadata.dirty_rects) else {
        return Err(CaptureError::CorruptedMetadata);
    };
    set.extend_from(moves, dirty);
    Ok(())
}

/// Reuses one [`ChangedRegionSet`] allocation across frames.
#[derive(Debug, Default)]
pub struct RegionReconciler {
    set: ChangedRegionSet,
}

impl RegionReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reconcile_into(&mut self, metadata: &FrameMetadata<'_>) -> CaptureResult<&ChangedRegionSet> {
        if let Err(err) = fill(&mut self.set, metadata) {
            self.set.clear();
            return Err(err);
        }
        Ok(&self.set)
    }

    pub fn last(&self) -> &ChangedRegionSet {
        &self.set
    }
}
