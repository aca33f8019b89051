// Backend module - the seam between the frame protocol and a GPU
//
// The protocol in `renderer` only talks to the `Gpu` trait. Two backends exist:
// - `vulkan`: ash + gpu-allocator, timeline semaphores for counting signals
// - `simulated`: a deterministic GPU-signal clock used by the tests

pub mod simulated;
pub mod vulkan;

use anyhow::Result;
use glam::UVec2;
use std::fmt;

use crate::material::DrawCall;
use crate::upload::{BufferCopy, SamplerConfig, TextureDesc, TransferOp};

/// How frames are handed to the display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentMode {
    /// No vsync, lowest latency, may tear
    Immediate,
    /// No vsync, no tearing, needs at least three images
    Mailbox,
    /// Vsync, guaranteed to be available
    Fifo,
    FifoRelaxed,
}

/// What the platform reports about the presentable surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceCapabilities {
    /// `None` when the surface lets the swapchain decide its size
    pub current_extent: Option<UVec2>,
    pub min_extent: UVec2,
    pub max_extent: UVec2,
    pub min_image_count: u32,
    /// Zero means "no upper limit"
    pub max_image_count: u32,
    pub present_modes: Vec<PresentMode>,
}

/// The surface configuration currently in use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceInfo {
    pub extent: UVec2,
    pub image_count: u32,
    pub present_mode: PresentMode,
}

/// Result of asking for the next presentable image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    /// Surface no longer matches the swap surface set, nothing was signaled
    OutOfDate,
}

/// Result of a presentation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

impl PresentOutcome {
    /// Stale or sub-optimal surfaces trigger surface recreation
    pub fn is_stale(self) -> bool {
        matches!(self, PresentOutcome::Suboptimal | PresentOutcome::OutOfDate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentKind {
    Color,
    Depth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Host-visible upload scratch, source of transfer copies
    Staging,
    /// Device-local, filled through the transfer queue
    Vertex,
    /// Device-local, filled through the transfer queue
    Index,
    /// Host-visible, rewritten by the CPU every frame
    Instance,
}

/// Pipeline stage a semaphore wait gates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitStage {
    VertexInput,
    ColorAttachmentOutput,
}

/// A submission-side wait. `value` is `Some` for counting signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreWait<S> {
    pub semaphore: S,
    pub value: Option<u64>,
    pub stage: WaitStage,
}

impl<S> SemaphoreWait<S> {
    pub fn counting(semaphore: S, value: u64, stage: WaitStage) -> Self {
        Self { semaphore, value: Some(value), stage }
    }

    pub fn one_shot(semaphore: S, stage: WaitStage) -> Self {
        Self { semaphore, value: None, stage }
    }
}

/// A submission-side signal. `value` is `Some` for counting signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreSignal<S> {
    pub semaphore: S,
    pub value: Option<u64>,
}

impl<S> SemaphoreSignal<S> {
    pub fn counting(semaphore: S, value: u64) -> Self {
        Self { semaphore, value: Some(value) }
    }

    pub fn one_shot(semaphore: S) -> Self {
        Self { semaphore, value: None }
    }
}

/// Everything the frame protocol needs from a GPU.
///
/// Handles are plain values; ownership of anything that must be released is
/// expressed by moving the handle into one of the `release_*` calls. The
/// protocol guarantees release only happens once the GPU can no longer
/// reference the resource.
pub trait Gpu: Sized {
    type Semaphore: Copy + fmt::Debug;
    type CommandList: Copy + fmt::Debug;
    type Image: fmt::Debug;
    type ImageView: Copy + fmt::Debug;
    type Sampler: Copy + fmt::Debug;
    type Buffer: fmt::Debug;
    type Pipeline: Copy + fmt::Debug;
    type DescriptorSetLayout: Copy + fmt::Debug;
    type DescriptorSet: Copy + fmt::Debug;
    type SurfaceSet: fmt::Debug;

    // ─────────────────────────────────────────────────────────────────────────
    // SYNCHRONIZATION
    // ─────────────────────────────────────────────────────────────────────────
    fn create_one_shot(&mut self, name: &str) -> Result<Self::Semaphore>;
    fn create_counting(&mut self, name: &str) -> Result<Self::Semaphore>;
    fn destroy_semaphore(&mut self, semaphore: Self::Semaphore);
    /// Block until every counting signal has reached its value
    fn wait_for_values(&mut self, waits: &[(Self::Semaphore, u64)]) -> Result<()>;
    /// Block until all queues are idle
    fn wait_idle(&mut self) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // SURFACE
    // ─────────────────────────────────────────────────────────────────────────
    fn surface_capabilities(&mut self) -> Result<SurfaceCapabilities>;
    fn create_attachment(
        &mut self,
        kind: AttachmentKind,
        extent: UVec2,
    ) -> Result<(Self::Image, Self::ImageView)>;
    /// Build a new swap surface set. `previous` is still alive and will be
    /// retired by the caller afterwards.
    fn create_surface_set(
        &mut self,
        info: &SurfaceInfo,
        color: &[Self::ImageView],
        depth: &[Self::ImageView],
        previous: Option<&Self::SurfaceSet>,
    ) -> Result<Self::SurfaceSet>;
    fn acquire_next_image(
        &mut self,
        set: &Self::SurfaceSet,
        signal: Self::Semaphore,
    ) -> Result<AcquireOutcome>;
    fn present(
        &mut self,
        set: &Self::SurfaceSet,
        image_index: u32,
        wait: Self::Semaphore,
    ) -> Result<PresentOutcome>;

    // ─────────────────────────────────────────────────────────────────────────
    // COMMANDS
    // ─────────────────────────────────────────────────────────────────────────
    /// Recycle the render commands of `image_index` and the transfer commands of `slot`
    fn reset_commands(&mut self, image_index: u32, slot: usize) -> Result<()>;
    /// Begin the render command list for `image_index` inside the frame's render pass
    fn begin_render(&mut self, set: &Self::SurfaceSet, image_index: u32) -> Result<Self::CommandList>;
    fn end_render(&mut self, commands: Self::CommandList) -> Result<()>;
    /// Bind a material's state and record its draw into an open render list
    fn record_draw(&self, commands: Self::CommandList, draw: &DrawCall<'_, Self>) -> Result<()>;
    /// Record a finished transfer command list for a texture upload
    fn record_image_upload(
        &mut self,
        slot: usize,
        staging: &Self::Buffer,
        image: &Self::Image,
        ops: &[TransferOp],
    ) -> Result<Self::CommandList>;
    /// Record a finished transfer command list for a buffer upload
    fn record_buffer_upload(
        &mut self,
        slot: usize,
        staging: &Self::Buffer,
        destination: &Self::Buffer,
        copy: BufferCopy,
    ) -> Result<Self::CommandList>;
    fn submit_transfer(
        &mut self,
        commands: &[Self::CommandList],
        signal: SemaphoreSignal<Self::Semaphore>,
    ) -> Result<()>;
    fn submit_render(
        &mut self,
        commands: Self::CommandList,
        waits: &[SemaphoreWait<Self::Semaphore>],
        signals: &[SemaphoreSignal<Self::Semaphore>],
    ) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // RESOURCES
    // ─────────────────────────────────────────────────────────────────────────
    fn create_buffer(&mut self, usage: BufferUsage, size: u64, name: &str) -> Result<Self::Buffer>;
    /// Write into a host-visible buffer
    fn write_buffer(&mut self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> Result<()>;
    fn create_texture_image(&mut self, desc: &TextureDesc) -> Result<Self::Image>;
    fn create_texture_view(&mut self, image: &Self::Image, desc: &TextureDesc) -> Result<Self::ImageView>;
    fn create_sampler(&mut self, config: &SamplerConfig, mip_levels: u32) -> Result<Self::Sampler>;

    // ─────────────────────────────────────────────────────────────────────────
    // RELEASE (only ever called once the GPU is done with the handle)
    // ─────────────────────────────────────────────────────────────────────────
    /// Framebuffers, views, then the presentable surface handle
    fn release_surface_set(&mut self, set: Self::SurfaceSet);
    fn release_sampler(&mut self, sampler: Self::Sampler);
    fn release_image_view(&mut self, view: Self::ImageView);
    fn release_image(&mut self, image: Self::Image);
    fn release_buffer(&mut self, buffer: Self::Buffer);
    fn release_pipeline(&mut self, pipeline: Self::Pipeline);
    /// Return a set to the regular descriptor pool
    fn release_descriptor_set(&mut self, set: Self::DescriptorSet);
    fn release_descriptor_set_layout(&mut self, layout: Self::DescriptorSetLayout);
}
