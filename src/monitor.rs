use std::fmt;

use crate::backend::OutputEntry;
use crate::region::Rect;

/// One enumerated output, addressable by its flat `index`.
///
/// `adapter` and `output` are the backend's owned handles. They are
/// released when the descriptor is dropped, which happens when a new
/// enumeration replaces the list.
#[derive(Clone, Debug)]
pub struct MonitorDescriptor<A, O> {
    pub index: usize,
    pub adapter_index: u32,
    pub output_index: u32,
    pub desktop_rect: Rect,
    pub name: String,
    pub adapter: A,
    pub output: O,
}

impl<A, O> MonitorDescriptor<A, O> {
    pub fn width(&self) -> u32 {
        u32::try_from(self.desktop_rect.width()).unwrap_or(0)
    }

    pub fn height(&self) -> u32 {
        u32::try_from(self.desktop_rect.height()).unwrap_or(0)
    }

    /// Output-local rectangle covering the whole output.
    pub fn local_bounds(&self) -> Rect {
        self.desktop_rect.relative_to(self.desktop_rect.top_left())
    }
}

impl<A, O> fmt::Display for MonitorDescriptor<A, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} (adapter {}, output {}, {}x{} at {},{})",
            self.index,
            self.name,
            self.adapter_index,
            self.output_index,
            self.width(),
            self.height(),
            self.desktop_rect.left,
            self.desktop_rect.top
        )
    }
}

/// Flatten backend entries into descriptors numbered in enumeration order.
pub fn flatten_outputs<A, O>(entries: Vec<OutputEntry<A, O>>) -> Vec<MonitorDescriptor<A, O>> {
    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| MonitorDescriptor {
            index,
            adapter_index: entry.adapter_index,
            output_index: entry.output_index,
            desktop_rect: entry.desktop_rect,
            name: entry.name,
            adapter: entry.adapter,
            output: entry.output,
        })
        .collect()
}
