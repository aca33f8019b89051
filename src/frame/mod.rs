// Frame state - slot table and cursor
//
// Owned by the renderer as one explicit context object and threaded through
// the protocol steps. Nothing here is global.

pub mod cursor;
pub mod signal;
pub mod slots;

pub use cursor::FrameCursor;
pub use signal::{CountingSignal, OneShotSignal};
pub use slots::{FrameSlot, FrameSlotTable};

use anyhow::Result;

use crate::backend::Gpu;

/// Cursor plus the slots it points into
pub struct FrameContext<G: Gpu> {
    pub cursor: FrameCursor,
    pub slots: FrameSlotTable<G>,
}

impl<G: Gpu> FrameContext<G> {
    pub fn new(gpu: &mut G, depth: usize, staging_size: u64) -> Result<Self> {
        Ok(Self {
            cursor: FrameCursor::new(depth),
            slots: FrameSlotTable::new(gpu, depth, staging_size)?,
        })
    }

    pub fn depth(&self) -> usize {
        self.cursor.depth()
    }

    /// Slot the cursor currently points at
    pub fn current(&self) -> &FrameSlot<G> {
        &self.slots[self.cursor.frame_index()]
    }

    pub fn current_mut(&mut self) -> &mut FrameSlot<G> {
        let index = self.cursor.frame_index();
        &mut self.slots[index]
    }

    /// Slot used one presentation ago
    pub fn previous(&self) -> &FrameSlot<G> {
        &self.slots[self.cursor.previous_frame()]
    }
}
