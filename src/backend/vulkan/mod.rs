// Vulkan backend - ash + gpu-allocator implementation of `Gpu`
//
// Design: thin layer over ash, one module per concern
// - device:      instance, surface, physical/logical device, allocator
// - swapchain:   surface sets, acquire/present outcomes
// - commands:    per-image render buffers, per-slot transfer rings, submission
// - sync:        binary (one-shot) and timeline (counting) semaphores
// - buffer:      gpu-allocator backed buffers, images, samplers
// - pipeline:    MSAA render pass and framebuffers
// - descriptors: regular and bindless descriptor pools

pub mod buffer;
pub mod commands;
pub mod descriptors;
pub mod device;
pub mod pipeline;
pub mod platform;
pub mod swapchain;
pub mod sync;

pub use buffer::{VulkanBuffer, VulkanImage};
pub use device::VulkanDevice;
pub use swapchain::SurfaceSet;

use anyhow::{anyhow, Context, Result};
use ash::extensions::khr;
use ash::vk;
use glam::UVec2;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

use self::commands::CommandRecorder;
use self::descriptors::DescriptorPools;
use self::swapchain::SurfaceSetDesc;
use super::{
    AcquireOutcome, AttachmentKind, BufferUsage, Gpu, PresentOutcome, SemaphoreSignal, SemaphoreWait,
    SurfaceCapabilities, SurfaceInfo,
};
use crate::material::DrawCall;
use crate::upload::{BufferCopy, SamplerConfig, TextureDesc, TransferOp};

/// Startup options of the Vulkan backend
#[derive(Debug, Clone, PartialEq)]
pub struct VulkanSettings {
    pub app_name: String,
    pub enable_validation: bool,
    /// Requested MSAA sample count, lowered to what the GPU supports
    pub msaa_samples: u32,
    pub clear_color: [f32; 4],
}

impl Default for VulkanSettings {
    fn default() -> Self {
        Self {
            app_name: "Frame Pipeline".to_string(),
            enable_validation: cfg!(debug_assertions),
            msaa_samples: 4,
            clear_color: [0.1, 0.1, 0.15, 1.0],
        }
    }
}

/// A pipeline built outside this crate. Releasing it destroys the pipeline
/// only; the layout belongs to whoever built it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VulkanPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

pub struct VulkanGpu {
    device: Arc<VulkanDevice>,
    swapchain_loader: khr::Swapchain,
    surface_format: vk::SurfaceFormatKHR,
    samples: vk::SampleCountFlags,
    render_pass: vk::RenderPass,
    commands: CommandRecorder,
    descriptors: DescriptorPools,
    clear_color: [f32; 4],
}

impl VulkanGpu {
    /// Bring up the device and everything that outlives surface sets
    pub fn new<W>(settings: &VulkanSettings, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| anyhow!("Window has no display handle: {e}"))?
            .as_raw();
        let window = window
            .window_handle()
            .map_err(|e| anyhow!("Window has no window handle: {e}"))?
            .as_raw();

        let device =
            VulkanDevice::new(&settings.app_name, settings.enable_validation, display, window)?;
        let swapchain_loader = khr::Swapchain::new(&device.instance, &device.device);

        let surface_format = swapchain::choose_surface_format(&device)?;
        let samples = pipeline::choose_sample_count(&device, settings.msaa_samples)?;
        log::info!("MSAA: {:?}", samples);

        let render_pass = pipeline::create_render_pass(&device, surface_format.format, samples)?;
        let commands = CommandRecorder::new(&device)?;
        let descriptors = DescriptorPools::new(&device)?;

        Ok(Self {
            device,
            swapchain_loader,
            surface_format,
            samples,
            render_pass,
            commands,
            descriptors,
            clear_color: settings.clear_color,
        })
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    /// Pipelines drawn in the frame must be built against this pass
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn sample_count(&self) -> vk::SampleCountFlags {
        self.samples
    }

    pub fn set_clear_color(&mut self, clear_color: [f32; 4]) {
        self.clear_color = clear_color;
    }

    /// Allocate a descriptor set from the regular or the bindless pool
    pub fn allocate_descriptor_set(
        &mut self,
        layout: vk::DescriptorSetLayout,
        bindless: bool,
    ) -> Result<vk::DescriptorSet> {
        self.descriptors.allocate(&self.device, layout, bindless)
    }
}

impl Drop for VulkanGpu {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        self.commands.destroy(&self.device);
        self.descriptors.destroy(&self.device);
        unsafe { self.device.device.destroy_render_pass(self.render_pass, None) };
    }
}

impl Gpu for VulkanGpu {
    type Semaphore = vk::Semaphore;
    type CommandList = vk::CommandBuffer;
    type Image = VulkanImage;
    type ImageView = vk::ImageView;
    type Sampler = vk::Sampler;
    type Buffer = VulkanBuffer;
    type Pipeline = VulkanPipeline;
    type DescriptorSetLayout = vk::DescriptorSetLayout;
    type DescriptorSet = vk::DescriptorSet;
    type SurfaceSet = SurfaceSet;

    // ─────────────────────────────────────────────────────────────────────────
    // SYNCHRONIZATION
    // ─────────────────────────────────────────────────────────────────────────
    fn create_one_shot(&mut self, name: &str) -> Result<vk::Semaphore> {
        sync::create_binary_semaphore(&self.device, name)
    }

    fn create_counting(&mut self, name: &str) -> Result<vk::Semaphore> {
        sync::create_timeline_semaphore(&self.device, name)
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        unsafe { self.device.device.destroy_semaphore(semaphore, None) };
    }

    fn wait_for_values(&mut self, waits: &[(vk::Semaphore, u64)]) -> Result<()> {
        sync::wait_for_values(&self.device, waits)
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.device.wait_idle()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // SURFACE
    // ─────────────────────────────────────────────────────────────────────────
    fn surface_capabilities(&mut self) -> Result<SurfaceCapabilities> {
        swapchain::query_capabilities(&self.device)
    }

    fn create_attachment(&mut self, kind: AttachmentKind, extent: UVec2) -> Result<(VulkanImage, vk::ImageView)> {
        let (format, usage, aspect, name) = match kind {
            AttachmentKind::Color => (
                self.surface_format.format,
                vk::ImageUsageFlags::COLOR_ATTACHMENT,
                vk::ImageAspectFlags::COLOR,
                "color attachment",
            ),
            AttachmentKind::Depth => (
                pipeline::DEPTH_FORMAT,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                vk::ImageAspectFlags::DEPTH,
                "depth attachment",
            ),
        };
        let extent = vk::Extent2D {
            width: extent.x,
            height: extent.y,
        };

        let image = buffer::create_attachment_image(&self.device, format, usage, self.samples, extent, name)?;
        match buffer::create_image_view(&self.device, image.image, format, aspect, 1) {
            Ok(view) => Ok((image, view)),
            Err(e) => {
                buffer::destroy_image(&self.device, image);
                Err(e)
            }
        }
    }

    fn create_surface_set(
        &mut self,
        info: &SurfaceInfo,
        color: &[vk::ImageView],
        depth: &[vk::ImageView],
        previous: Option<&SurfaceSet>,
    ) -> Result<SurfaceSet> {
        let desc = SurfaceSetDesc {
            format: self.surface_format,
            render_pass: self.render_pass,
            color,
            depth,
            previous,
        };
        let set = swapchain::create_surface_set(&self.device, &self.swapchain_loader, info, &desc)?;
        if let Err(e) = self.commands.ensure_render_buffers(&self.device, set.images.len()) {
            swapchain::destroy_surface_set(&self.device, &self.swapchain_loader, set);
            return Err(e);
        }
        Ok(set)
    }

    fn acquire_next_image(&mut self, set: &SurfaceSet, signal: vk::Semaphore) -> Result<AcquireOutcome> {
        swapchain::acquire_next_image(&self.swapchain_loader, set, signal)
    }

    fn present(&mut self, set: &SurfaceSet, image_index: u32, wait: vk::Semaphore) -> Result<PresentOutcome> {
        swapchain::present(
            &self.swapchain_loader,
            self.device.graphics_queue,
            set,
            image_index,
            wait,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // COMMANDS
    // ─────────────────────────────────────────────────────────────────────────
    fn reset_commands(&mut self, image_index: u32, slot: usize) -> Result<()> {
        self.commands.reset(&self.device, image_index, slot)
    }

    fn begin_render(&mut self, set: &SurfaceSet, image_index: u32) -> Result<vk::CommandBuffer> {
        let framebuffer = *set
            .framebuffers
            .get(image_index as usize)
            .with_context(|| format!("No framebuffer for image {image_index}"))?;
        self.commands.begin_render(
            &self.device,
            self.render_pass,
            framebuffer,
            set.extent,
            image_index,
            self.clear_color,
        )
    }

    fn end_render(&mut self, commands: vk::CommandBuffer) -> Result<()> {
        self.commands.end_render(&self.device, commands)
    }

    fn record_draw(&self, commands: vk::CommandBuffer, draw: &DrawCall<'_, Self>) -> Result<()> {
        CommandRecorder::record_draw(&self.device, commands, draw);
        Ok(())
    }

    fn record_image_upload(
        &mut self,
        slot: usize,
        staging: &VulkanBuffer,
        image: &VulkanImage,
        ops: &[TransferOp],
    ) -> Result<vk::CommandBuffer> {
        self.commands
            .record_image_upload(&self.device, slot, staging, image, ops)
    }

    fn record_buffer_upload(
        &mut self,
        slot: usize,
        staging: &VulkanBuffer,
        destination: &VulkanBuffer,
        copy: BufferCopy,
    ) -> Result<vk::CommandBuffer> {
        self.commands
            .record_buffer_upload(&self.device, slot, staging, destination, copy)
    }

    fn submit_transfer(&mut self, commands: &[vk::CommandBuffer], signal: SemaphoreSignal<vk::Semaphore>) -> Result<()> {
        self.commands.submit_transfer(&self.device, commands, signal)
    }

    fn submit_render(
        &mut self,
        commands: vk::CommandBuffer,
        waits: &[SemaphoreWait<vk::Semaphore>],
        signals: &[SemaphoreSignal<vk::Semaphore>],
    ) -> Result<()> {
        self.commands.submit_render(&self.device, commands, waits, signals)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // RESOURCES
    // ─────────────────────────────────────────────────────────────────────────
    fn create_buffer(&mut self, usage: BufferUsage, size: u64, name: &str) -> Result<VulkanBuffer> {
        buffer::create_buffer(&self.device, usage, size, name)
    }

    fn write_buffer(&mut self, buffer: &VulkanBuffer, offset: u64, data: &[u8]) -> Result<()> {
        buffer::write_buffer(buffer, offset, data)
    }

    fn create_texture_image(&mut self, desc: &TextureDesc) -> Result<VulkanImage> {
        let extent = vk::Extent2D {
            width: desc.width,
            height: desc.height,
        };
        buffer::create_texture_image(
            &self.device,
            buffer::texture_format(desc.format),
            extent,
            desc.mip_levels,
        )
    }

    fn create_texture_view(&mut self, image: &VulkanImage, desc: &TextureDesc) -> Result<vk::ImageView> {
        buffer::create_image_view(
            &self.device,
            image.image,
            buffer::texture_format(desc.format),
            vk::ImageAspectFlags::COLOR,
            desc.mip_levels,
        )
    }

    fn create_sampler(&mut self, config: &SamplerConfig, mip_levels: u32) -> Result<vk::Sampler> {
        buffer::create_sampler(&self.device, config, mip_levels)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // RELEASE
    // ─────────────────────────────────────────────────────────────────────────
    fn release_surface_set(&mut self, set: SurfaceSet) {
        swapchain::destroy_surface_set(&self.device, &self.swapchain_loader, set);
    }

    fn release_sampler(&mut self, sampler: vk::Sampler) {
        unsafe { self.device.device.destroy_sampler(sampler, None) };
    }

    fn release_image_view(&mut self, view: vk::ImageView) {
        unsafe { self.device.device.destroy_image_view(view, None) };
    }

    fn release_image(&mut self, image: VulkanImage) {
        buffer::destroy_image(&self.device, image);
    }

    fn release_buffer(&mut self, buffer: VulkanBuffer) {
        buffer::destroy_buffer(&self.device, buffer);
    }

    fn release_pipeline(&mut self, pipeline: VulkanPipeline) {
        unsafe { self.device.device.destroy_pipeline(pipeline.pipeline, None) };
    }

    fn release_descriptor_set(&mut self, set: vk::DescriptorSet) {
        self.descriptors.free(&self.device, set);
    }

    fn release_descriptor_set_layout(&mut self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.device.destroy_descriptor_set_layout(layout, None) };
    }
}
