// Frame slot table
//
// One slot per presentation-depth index. A slot owns the signals of the frame
// occupying it plus that frame's scratch state: the upload staging buffer and
// its cursor, transfer command lists waiting for submission, and the bank of
// resources retired while the cursor pointed at it.

use anyhow::{Context, Result};
use std::ops::{Index, IndexMut};

use super::signal::{CountingSignal, OneShotSignal};
use crate::backend::{BufferUsage, Gpu};
use crate::destruction::DestructionQueues;
use crate::upload::StagingCursor;

pub struct FrameSlot<G: Gpu> {
    pub image_acquired: OneShotSignal<G::Semaphore>,
    pub present_ready: OneShotSignal<G::Semaphore>,
    pub transfer_finished: CountingSignal<G::Semaphore>,
    pub render_finished: CountingSignal<G::Semaphore>,
    pub staging: G::Buffer,
    pub staging_cursor: StagingCursor,
    /// Finished transfer command lists, submitted together at step 5
    pub transfers: Vec<G::CommandList>,
    pub retired: DestructionQueues<G>,
}

impl<G: Gpu> FrameSlot<G> {
    fn new(gpu: &mut G, index: usize, staging_size: u64) -> Result<Self> {
        let image_acquired = gpu
            .create_one_shot(&format!("slot {index} image acquired"))
            .context("Failed to create image-acquired signal")?;
        let present_ready = gpu
            .create_one_shot(&format!("slot {index} present ready"))
            .context("Failed to create present-ready signal")?;
        let transfer_finished = gpu
            .create_counting(&format!("slot {index} transfer finished"))
            .context("Failed to create transfer-finished signal")?;
        let render_finished = gpu
            .create_counting(&format!("slot {index} render finished"))
            .context("Failed to create render-finished signal")?;
        let staging = gpu
            .create_buffer(BufferUsage::Staging, staging_size, &format!("slot {index} staging"))
            .context("Failed to create staging buffer")?;

        Ok(Self {
            image_acquired: OneShotSignal::new(image_acquired),
            present_ready: OneShotSignal::new(present_ready),
            transfer_finished: CountingSignal::new(transfer_finished),
            render_finished: CountingSignal::new(render_finished),
            staging,
            staging_cursor: StagingCursor::new(staging_size),
            transfers: Vec::new(),
            retired: DestructionQueues::new(),
        })
    }

    /// Counting-signal values proving everything submitted from this slot has finished
    pub fn completion_points(&self) -> [(G::Semaphore, u64); 2] {
        [self.render_finished.wait_point(), self.transfer_finished.wait_point()]
    }

    fn destroy(self, gpu: &mut G) {
        let mut retired = self.retired;
        retired.drain(gpu);
        gpu.release_buffer(self.staging);
        gpu.destroy_semaphore(self.image_acquired.handle());
        gpu.destroy_semaphore(self.present_ready.handle());
        gpu.destroy_semaphore(self.transfer_finished.handle());
        gpu.destroy_semaphore(self.render_finished.handle());
    }
}

/// Fixed-capacity table of `N` slots
pub struct FrameSlotTable<G: Gpu> {
    slots: Vec<FrameSlot<G>>,
}

impl<G: Gpu> FrameSlotTable<G> {
    pub fn new(gpu: &mut G, depth: usize, staging_size: u64) -> Result<Self> {
        let slots = (0..depth)
            .map(|index| FrameSlot::new(gpu, index, staging_size))
            .collect::<Result<Vec<_>>>()?;

        log::info!("Created {} frame slots ({} KiB staging each)", depth, staging_size / 1024);
        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameSlot<G>> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FrameSlot<G>> {
        self.slots.iter_mut()
    }

    /// Retired entries still waiting across every slot's bank
    pub fn pending_destruction(&self) -> usize {
        self.slots.iter().map(|slot| slot.retired.len()).sum()
    }

    /// Release every slot. Only valid once the device is idle.
    pub fn destroy(&mut self, gpu: &mut G) {
        for slot in self.slots.drain(..) {
            slot.destroy(gpu);
        }
    }
}

impl<G: Gpu> Index<usize> for FrameSlotTable<G> {
    type Output = FrameSlot<G>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.slots[index]
    }
}

impl<G: Gpu> IndexMut<usize> for FrameSlotTable<G> {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.slots[index]
    }
}
