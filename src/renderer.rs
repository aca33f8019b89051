// =============================================================================
// RENDERER - Synchronization protocol and resource lifecycle entry points
// =============================================================================
//
// Runs the per-frame state machine over a `Gpu` backend:
//
// ┌──────────────────────────────────────────────────────────────────────────┐
// │ acquire ─> wait(previous) ─> reclaim ─> record ─> submit transfer        │
// │         ─> submit render ─> present ─> advance cursor                    │
// └──────────────────────────────────────────────────────────────────────────┘
//
// The back-pressure wait is the only blocking point of a frame. Resources
// retired during frame k sit in slot (k % N)'s bank and are released at the
// Reclaim step of frame k + N. Surface sets replaced by a recreation follow
// the same rule: recreation only runs once the frame's slot has been
// reclaimed, or after present and before the cursor moves.
//
// A failing participant does not abandon the frame. The acquired image is
// still submitted and presented, then the participant's error is returned.
// Any other failure leaves the renderer unusable.
//
// =============================================================================

use anyhow::{anyhow, bail, Context, Error, Result};
use glam::UVec2;

use crate::backend::{
    AcquireOutcome, Gpu, PresentMode, SemaphoreSignal, SemaphoreWait, SurfaceInfo, WaitStage,
};
use crate::destruction::{ImageRelease, Retired};
use crate::frame::FrameContext;
use crate::surface::{SurfaceManager, SurfacePreferences, SurfaceState, MAX_PRESENTATION_DEPTH};
use crate::upload::{plan_texture_upload, BufferCopy, SamplerConfig, Texture, TextureDesc};

/// Backend-neutral startup settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSettings {
    /// Frame slots kept in flight, clamped to `2..=MAX_PRESENTATION_DEPTH`
    pub presentation_depth: usize,
    pub present_mode: PresentMode,
    /// Size of each slot's upload scratch buffer
    pub staging_buffer_size: u64,
    /// Used when the surface leaves the size up to the swapchain
    pub window_extent: UVec2,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            presentation_depth: 2,
            present_mode: PresentMode::Fifo,
            staging_buffer_size: 16 * 1024 * 1024,
            window_extent: UVec2::new(1280, 720),
        }
    }
}

/// Upstream system taking part in every frame (scene, UI, overlays)
pub trait FrameParticipant<G: Gpu> {
    /// Resource lifecycle hook, runs after Reclaim and before transfer submission.
    /// Uploads made here are visible to this frame's render work.
    fn update(&mut self, renderer: &mut Renderer<G>) -> Result<()> {
        let _ = renderer;
        Ok(())
    }

    /// Record render work into the frame's open render command list
    fn render(&mut self, renderer: &Renderer<G>, commands: G::CommandList) -> Result<()>;
}

pub struct Renderer<G: Gpu> {
    gpu: G,
    frame: FrameContext<G>,
    surface: SurfaceManager<G>,
    /// Set by `notify_resized`, consumed at the start of the next frame
    resize_pending: bool,
    /// Absolute frame whose slot was last waited for and reclaimed
    reclaimed_frame: Option<u64>,
    /// A frame failed outside a participant; only `shutdown` remains valid
    failed: bool,
    shut_down: bool,
}

impl<G: Gpu> Renderer<G> {
    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    /// Allocate the frame slots and build the first surface set
    pub fn new(mut gpu: G, settings: FrameSettings) -> Result<Self> {
        let depth = settings.presentation_depth.clamp(2, MAX_PRESENTATION_DEPTH);
        if depth != settings.presentation_depth {
            log::warn!(
                "Presentation depth {} out of range, using {}",
                settings.presentation_depth,
                depth
            );
        }

        let frame = FrameContext::new(&mut gpu, depth, settings.staging_buffer_size)
            .context("Failed to create frame slots")
            .inspect_err(|e| log::error!("{e:#}"))?;

        let surface = SurfaceManager::new(SurfacePreferences {
            present_mode: settings.present_mode,
            presentation_depth: depth,
            requested_extent: settings.window_extent,
        });

        let mut renderer = Self {
            gpu,
            frame,
            surface,
            resize_pending: false,
            reclaimed_frame: None,
            failed: false,
            shut_down: false,
        };
        renderer.recreate_surface(0, true)?;

        log::info!("Renderer ready ({} frames in flight)", depth);
        Ok(renderer)
    }

    // =========================================================================
    // FRAME PROTOCOL
    // =========================================================================

    /// Run one frame of the synchronization protocol.
    ///
    /// Returns `Ok(true)` when a frame was presented and `Ok(false)` when it
    /// was skipped (minimized window, surface still stale after one retry).
    /// A participant error is returned after the frame has been presented.
    pub fn render_frame(&mut self, participants: &mut [&mut dyn FrameParticipant<G>]) -> Result<bool> {
        if self.shut_down {
            bail!("Renderer used after shutdown");
        }
        if self.failed {
            bail!("Renderer used after a failed frame");
        }

        let mut participant_error = None;
        let presented = match self.run_frame(participants, &mut participant_error) {
            Ok(presented) => presented,
            Err(e) => {
                self.failed = true;
                log::error!("Frame {} failed: {e:#}", self.frame.cursor.absolute_frame());
                return Err(e);
            }
        };

        match participant_error {
            Some(e) => Err(e.context("Frame participant failed")),
            None => Ok(presented),
        }
    }

    fn run_frame(
        &mut self,
        participants: &mut [&mut dyn FrameParticipant<G>],
        participant_error: &mut Option<Error>,
    ) -> Result<bool> {
        let slot = self.frame.cursor.frame_index();
        debug_assert_eq!(slot, self.frame.cursor.acquire_slot());

        // The outgoing set of a resize lands in this slot's bank, so the
        // slot is reclaimed first
        if self.resize_pending || self.surface.is_minimized() {
            self.resize_pending = false;
            self.prepare_slot(slot)?;
            self.recreate_surface(slot, false)?;
            if self.surface.is_minimized() {
                return Ok(false);
            }
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1-3: Acquire, back-pressure wait, reclaim
        // ─────────────────────────────────────────────────────────────────────
        // A stale acquire still runs the wait and the reclaim before the
        // surface is rebuilt, then the acquire is retried exactly once.
        let image_index = match self.acquire(slot)? {
            Some(image_index) => {
                self.prepare_slot(slot)?;
                image_index
            }
            None => {
                log::debug!("Acquire reported a stale surface, rebuilding");
                self.prepare_slot(slot)?;
                self.recreate_surface(slot, true)?;
                match self.acquire(slot)? {
                    Some(image_index) => image_index,
                    None => {
                        log::warn!("Surface still stale after rebuild, skipping frame");
                        return Ok(false);
                    }
                }
            }
        };

        self.frame.cursor.set_image_index(image_index);
        self.gpu
            .reset_commands(image_index, slot)
            .context("Failed to reset command recording state")?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Record
        // ─────────────────────────────────────────────────────────────────────
        let updated = participants
            .iter_mut()
            .try_for_each(|participant| participant.update(self));

        let commands = self
            .gpu
            .begin_render(self.surface.surface_set()?, image_index)
            .context("Failed to begin render commands")?;
        let recorded = updated.and_then(|()| {
            participants
                .iter_mut()
                .try_for_each(|participant| participant.render(self, commands))
        });
        self.gpu.end_render(commands).context("Failed to end render commands")?;

        // The image is acquired, so the frame goes on with whatever was recorded
        if let Err(e) = recorded {
            log::error!("Frame participant failed: {e:#}");
            *participant_error = Some(e);
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 5: Submit transfer
        // ─────────────────────────────────────────────────────────────────────
        let transfer_value = self.submit_transfers(slot)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 6: Submit render
        // ─────────────────────────────────────────────────────────────────────
        // Waiting on a transfer value nobody will signal would deadlock, so
        // the transfer wait only exists when step 5 submitted something.
        let current = &mut self.frame.slots[slot];
        let mut waits = Vec::with_capacity(2);
        if let Some(value) = transfer_value {
            waits.push(SemaphoreWait::counting(
                current.transfer_finished.handle(),
                value,
                WaitStage::VertexInput,
            ));
        }
        waits.push(SemaphoreWait::one_shot(
            current.image_acquired.consume(),
            WaitStage::ColorAttachmentOutput,
        ));

        let render_value = current.render_finished.target() + 1;
        let signals = [
            SemaphoreSignal::counting(current.render_finished.handle(), render_value),
            SemaphoreSignal::one_shot(current.present_ready.signal()),
        ];
        self.gpu
            .submit_render(commands, &waits, &signals)
            .context("Failed to submit render commands")?;
        current.render_finished.advance();

        // ─────────────────────────────────────────────────────────────────────
        // STEP 7: Present
        // ─────────────────────────────────────────────────────────────────────
        let present_ready = current.present_ready.consume();
        let outcome = self
            .gpu
            .present(self.surface.surface_set()?, image_index, present_ready)
            .context("Failed to present")?;

        // Presentation is not retried. The stale set goes into the bank of the
        // slot that just presented from it, the next frame uses the rebuilt set.
        if outcome.is_stale() {
            log::debug!("Present reported {:?}, rebuilding surface", outcome);
            self.recreate_surface(slot, false)?;
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 8: Advance cursor
        // ─────────────────────────────────────────────────────────────────────
        self.frame.cursor.advance();

        Ok(true)
    }

    /// Submit the current slot's recorded transfers, then block until the
    /// device is idle. For startup uploads before any frame is in flight.
    pub fn first_transfer(&mut self) -> Result<()> {
        let slot = self.frame.cursor.frame_index();
        if let Some(value) = self.submit_transfers(slot)? {
            log::debug!("First transfer submitted (slot {}, value {})", slot, value);
        }
        self.gpu
            .wait_idle()
            .context("Failed to wait for first transfer")
    }

    /// Request Surface Recreation at the start of the next frame
    pub fn notify_resized(&mut self, extent: UVec2) {
        self.surface.set_requested_extent(extent);
        self.resize_pending = true;
    }

    /// Step 1: acquire the next presentable image into `slot`'s image-acquired signal
    fn acquire(&mut self, slot: usize) -> Result<Option<u32>> {
        let set = self.surface.surface_set()?;
        let signal = &mut self.frame.slots[slot].image_acquired;

        match self.gpu.acquire_next_image(set, signal.signal()) {
            Ok(AcquireOutcome::Acquired { image_index, suboptimal }) => {
                if suboptimal {
                    log::debug!("Acquired image {} from a suboptimal surface", image_index);
                }
                Ok(Some(image_index))
            }
            Ok(AcquireOutcome::OutOfDate) => {
                signal.cancel();
                Ok(None)
            }
            Err(e) => {
                signal.cancel();
                Err(e.context("Failed to acquire presentable image"))
            }
        }
    }

    /// Steps 2-3, at most once per frame. A frame retried after a stale
    /// surface or a skipped frame must not drain the bank a second time.
    fn prepare_slot(&mut self, slot: usize) -> Result<()> {
        let frame = self.frame.cursor.absolute_frame();
        if self.reclaimed_frame == Some(frame) {
            return Ok(());
        }
        self.wait_for_previous_frame()?;
        self.reclaim(slot);
        self.reclaimed_frame = Some(frame);
        Ok(())
    }

    /// Step 2: block until the previous frame's submissions reached their targets
    fn wait_for_previous_frame(&mut self) -> Result<()> {
        let waits = self.frame.previous().completion_points();
        self.gpu
            .wait_for_values(&waits)
            .context("Failed waiting for previous frame")
    }

    /// Step 3: release whatever was retired the last time `slot` was current
    fn reclaim(&mut self, slot: usize) {
        let released = self.frame.slots[slot].retired.drain(&mut self.gpu);
        if released > 0 {
            log::debug!(
                "Frame {}: reclaimed {} resources from slot {}",
                self.frame.cursor.absolute_frame(),
                released,
                slot
            );
        }
    }

    /// Step 5: returns the transfer-finished value signaled, if anything was submitted
    fn submit_transfers(&mut self, slot: usize) -> Result<Option<u64>> {
        let current = &mut self.frame.slots[slot];
        if current.transfers.is_empty() {
            return Ok(None);
        }

        let value = current.transfer_finished.target() + 1;
        self.gpu
            .submit_transfer(
                &current.transfers,
                SemaphoreSignal::counting(current.transfer_finished.handle(), value),
            )
            .context("Failed to submit transfer commands")?;
        current.transfer_finished.advance();

        log::debug!("Submitted {} transfer command lists from slot {}", current.transfers.len(), slot);
        current.transfers.clear();
        current.staging_cursor.reset();
        Ok(Some(value))
    }

    /// Outgoing attachments and surface set are retired into `slot`'s bank
    fn recreate_surface(&mut self, slot: usize, force: bool) -> Result<bool> {
        self.surface
            .recreate(&mut self.gpu, &mut self.frame.slots[slot].retired, force)
    }

    // =========================================================================
    // RESOURCE LIFECYCLE
    // =========================================================================

    /// Hand a resource to the deferred destruction queues. Never blocks, never fails.
    pub fn schedule_destruction(&mut self, resource: impl Into<Retired<G>>) {
        self.frame.current_mut().retired.schedule(resource);
    }

    /// Stage `pixels` and record the upload of `desc` into the current slot's
    /// transfer list. The returned texture is live immediately; its contents
    /// are ready for render work of the frame that submits the transfer.
    pub fn upload_texture(
        &mut self,
        desc: &TextureDesc,
        pixels: &[u8],
        sampler: &SamplerConfig,
    ) -> Result<Texture<G>> {
        let size = desc.byte_size();
        if pixels.len() as u64 != size {
            bail!(
                "Texture data is {} bytes, a {}x{} {:?} texture needs {}",
                pixels.len(),
                desc.width,
                desc.height,
                desc.format,
                size
            );
        }

        let mark = self.frame.current().staging_cursor.offset();
        let offset = self.reserve_staging(size)?;

        let texture = match self.create_texture(desc, sampler) {
            Ok(texture) => texture,
            Err(e) => {
                self.frame.current_mut().staging_cursor.rewind(mark);
                return Err(e);
            }
        };

        if let Err(e) = self.record_texture_upload(&texture, pixels, offset) {
            self.frame.current_mut().staging_cursor.rewind(mark);
            self.schedule_destruction(texture);
            return Err(e);
        }
        Ok(texture)
    }

    /// Whatever was created before a failure is retired, never dropped
    fn create_texture(&mut self, desc: &TextureDesc, sampler: &SamplerConfig) -> Result<Texture<G>> {
        let image = self
            .gpu
            .create_texture_image(desc)
            .context("Failed to create texture image")?;

        let view = match self.gpu.create_texture_view(&image, desc) {
            Ok(view) => view,
            Err(e) => {
                self.schedule_destruction(ImageRelease::<G> { image, view: None, sampler: None });
                return Err(e.context("Failed to create texture view"));
            }
        };

        let sampler = match self.gpu.create_sampler(sampler, desc.mip_levels) {
            Ok(sampler) => sampler,
            Err(e) => {
                self.schedule_destruction(ImageRelease::<G> { image, view: Some(view), sampler: None });
                return Err(e.context("Failed to create texture sampler"));
            }
        };

        Ok(Texture { image, view, sampler, desc: *desc })
    }

    fn record_texture_upload(&mut self, texture: &Texture<G>, pixels: &[u8], offset: u64) -> Result<()> {
        let slot = self.frame.cursor.frame_index();
        let current = &mut self.frame.slots[slot];

        self.gpu
            .write_buffer(&current.staging, offset, pixels)
            .context("Failed to write staging buffer")?;

        let ops = plan_texture_upload(&texture.desc, offset);
        let commands = self
            .gpu
            .record_image_upload(slot, &current.staging, &texture.image, &ops)
            .context("Failed to record texture upload")?;
        current.transfers.push(commands);
        Ok(())
    }

    /// Stage `data` and record a copy into `destination` at `dst_offset`
    pub fn upload_buffer(&mut self, destination: &G::Buffer, dst_offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let size = data.len() as u64;
        let src_offset = self.reserve_staging(size)?;
        let slot = self.frame.cursor.frame_index();
        let current = &mut self.frame.slots[slot];

        self.gpu
            .write_buffer(&current.staging, src_offset, data)
            .context("Failed to write staging buffer")?;

        let copy = BufferCopy { src_offset, dst_offset, size };
        let commands = self
            .gpu
            .record_buffer_upload(slot, &current.staging, destination, copy)
            .context("Failed to record buffer upload")?;
        current.transfers.push(commands);
        Ok(())
    }

    fn reserve_staging(&mut self, size: u64) -> Result<u64> {
        let slot = self.frame.cursor.frame_index();
        let cursor = &mut self.frame.slots[slot].staging_cursor;
        cursor.reserve(size).ok_or_else(|| {
            anyhow!(
                "Staging buffer of slot {} cannot fit {} more bytes ({} of {} used)",
                slot,
                size,
                cursor.offset(),
                cursor.capacity()
            )
        })
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    /// Wait for the device to go idle, then release everything.
    /// Called automatically on drop.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        self.gpu
            .wait_idle()
            .context("Failed to wait for device idle at shutdown")?;

        let pending = self.frame.slots.pending_destruction();
        self.frame.slots.destroy(&mut self.gpu);
        self.surface.destroy(&mut self.gpu);

        log::info!("Renderer shut down ({} retired resources released)", pending);
        Ok(())
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Valid between acquire and present of the current frame
    pub fn acquired_image_index(&self) -> u32 {
        self.frame.cursor.image_index()
    }

    pub fn current_frame_slot(&self) -> usize {
        self.frame.cursor.frame_index()
    }

    pub fn previous_frame_slot(&self) -> usize {
        self.frame.cursor.previous_frame()
    }

    pub fn absolute_frame_count(&self) -> u64 {
        self.frame.cursor.absolute_frame()
    }

    pub fn presentation_depth(&self) -> usize {
        self.frame.depth()
    }

    pub fn presentable_area_size(&self) -> UVec2 {
        self.surface.extent()
    }

    pub fn surface_state(&self) -> SurfaceState {
        self.surface.state()
    }

    pub fn surface_info(&self) -> Option<SurfaceInfo> {
        self.surface.info()
    }

    /// Retired resources not yet released, across all slots
    pub fn pending_destruction_count(&self) -> usize {
        self.frame.slots.pending_destruction()
    }

    pub fn frame_context(&self) -> &FrameContext<G> {
        &self.frame
    }

    pub fn gpu(&self) -> &G {
        &self.gpu
    }

    pub fn gpu_mut(&mut self) -> &mut G {
        &mut self.gpu
    }
}

impl<G: Gpu> Drop for Renderer<G> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Renderer shutdown failed: {e:#}");
        }
    }
}
