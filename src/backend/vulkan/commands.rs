// Command recording and submission
//
// Render command buffers are indexed by presentable image, transfer command
// buffers live in one ring per frame slot:
//
//   free ──record──> recorded ──submit──> submitted ──reset──> free
//
// A ring is only reset once the protocol has waited for the slot's previous
// occupant, so submitted buffers are never reset while executing.

use anyhow::{bail, Context, Result};
use ash::vk;

use super::buffer::{VulkanBuffer, VulkanImage};
use super::{sync, VulkanDevice, VulkanPipeline};
use crate::backend::{SemaphoreSignal, SemaphoreWait};
use crate::material::{DrawCall, DrawKind};
use crate::upload::{BufferCopy, ImageBarrier, ImageLayout, TransferOp};

#[derive(Default)]
struct TransferRing {
    free: Vec<vk::CommandBuffer>,
    recorded: Vec<vk::CommandBuffer>,
    submitted: Vec<vk::CommandBuffer>,
}

pub struct CommandRecorder {
    pool: vk::CommandPool,
    render: Vec<vk::CommandBuffer>,
    transfer: Vec<TransferRing>,
}

impl CommandRecorder {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.graphics_queue_family);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self {
            pool,
            render: Vec::new(),
            transfer: Vec::new(),
        })
    }

    fn allocate(&self, device: &VulkanDevice, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")
    }

    /// Make sure every presentable image has a render command buffer.
    /// Never shrinks: buffers of an outgoing surface set may still be executing.
    pub fn ensure_render_buffers(&mut self, device: &VulkanDevice, image_count: usize) -> Result<()> {
        if image_count <= self.render.len() {
            return Ok(());
        }
        let missing = (image_count - self.render.len()) as u32;
        let buffers = self.allocate(device, missing)?;
        for (i, &buffer) in buffers.iter().enumerate() {
            device.set_object_name(buffer, &format!("render commands {}", self.render.len() + i));
        }
        self.render.extend(buffers);
        Ok(())
    }

    fn ring(&mut self, slot: usize) -> &mut TransferRing {
        if slot >= self.transfer.len() {
            self.transfer.resize_with(slot + 1, TransferRing::default);
        }
        &mut self.transfer[slot]
    }

    pub fn reset(&mut self, device: &VulkanDevice, image_index: u32, slot: usize) -> Result<()> {
        let render = self.render_buffer(image_index)?;
        unsafe {
            device
                .device
                .reset_command_buffer(render, vk::CommandBufferResetFlags::empty())
        }
        .context("Failed to reset render command buffer")?;

        // Recorded but unsubmitted uploads belong to the frame being built
        let ring = self.ring(slot);
        for &buffer in &ring.submitted {
            unsafe {
                device
                    .device
                    .reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())
            }
            .context("Failed to reset transfer command buffer")?;
        }
        let submitted = std::mem::take(&mut ring.submitted);
        ring.free.extend(submitted);
        Ok(())
    }

    fn render_buffer(&self, image_index: u32) -> Result<vk::CommandBuffer> {
        match self.render.get(image_index as usize) {
            Some(&buffer) => Ok(buffer),
            None => bail!("No render command buffer for image {}", image_index),
        }
    }

    // =========================================================================
    // RENDER
    // =========================================================================

    pub fn begin_render(
        &self,
        device: &VulkanDevice,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        image_index: u32,
        clear_color: [f32; 4],
    ) -> Result<vk::CommandBuffer> {
        let commands = self.render_buffer(image_index)?;
        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue { float32: clear_color },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            },
            vk::ClearValue {
                color: vk::ClearColorValue { float32: clear_color },
            },
        ];

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        unsafe {
            device
                .device
                .begin_command_buffer(commands, &begin_info)
                .context("Failed to begin render command buffer")?;
            device
                .device
                .cmd_begin_render_pass(commands, &render_pass_info, vk::SubpassContents::INLINE);
            device.device.cmd_set_viewport(commands, 0, &[viewport]);
            device.device.cmd_set_scissor(commands, 0, &[scissor]);
        }
        Ok(commands)
    }

    pub fn end_render(&self, device: &VulkanDevice, commands: vk::CommandBuffer) -> Result<()> {
        unsafe {
            device.device.cmd_end_render_pass(commands);
            device
                .device
                .end_command_buffer(commands)
                .context("Failed to end render command buffer")
        }
    }

    pub fn record_draw(
        device: &VulkanDevice,
        commands: vk::CommandBuffer,
        draw: &DrawCall<'_, super::VulkanGpu>,
    ) {
        let pipeline: VulkanPipeline = draw.pipeline;
        unsafe {
            device
                .device
                .cmd_bind_pipeline(commands, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);

            if let Some(set) = draw.descriptor_set {
                device.device.cmd_bind_descriptor_sets(
                    commands,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout,
                    0,
                    &[set],
                    &[],
                );
            }

            if !draw.vertex_buffers.is_empty() {
                let buffers: Vec<vk::Buffer> =
                    draw.vertex_buffers.iter().map(|(buffer, _)| buffer.buffer).collect();
                let offsets: Vec<vk::DeviceSize> =
                    draw.vertex_buffers.iter().map(|&(_, offset)| offset).collect();
                device.device.cmd_bind_vertex_buffers(commands, 0, &buffers, &offsets);
            }

            if let Some((buffer, offset)) = draw.index_buffer {
                device
                    .device
                    .cmd_bind_index_buffer(commands, buffer.buffer, offset, vk::IndexType::UINT32);
            }

            match draw.kind {
                DrawKind::Indexed { index_count, instance_count } => {
                    device.device.cmd_draw_indexed(commands, index_count, instance_count, 0, 0, 0);
                }
                DrawKind::Direct { vertex_count, instance_count } => {
                    device.device.cmd_draw(commands, vertex_count, instance_count, 0, 0);
                }
            }
        }
    }

    // =========================================================================
    // TRANSFER
    // =========================================================================

    fn begin_transfer(&mut self, device: &VulkanDevice, slot: usize) -> Result<vk::CommandBuffer> {
        let commands = match self.ring(slot).free.pop() {
            Some(commands) => commands,
            None => {
                let mut allocated = self.allocate(device, 1)?;
                let commands = allocated
                    .pop()
                    .context("Driver returned no command buffer")?;
                device.set_object_name(commands, &format!("transfer commands (slot {slot})"));
                commands
            }
        };

        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.device.begin_command_buffer(commands, &begin_info) }
            .context("Failed to begin transfer command buffer")?;
        Ok(commands)
    }

    fn finish_transfer(
        &mut self,
        device: &VulkanDevice,
        slot: usize,
        commands: vk::CommandBuffer,
    ) -> Result<vk::CommandBuffer> {
        unsafe { device.device.end_command_buffer(commands) }
            .context("Failed to end transfer command buffer")?;
        self.ring(slot).recorded.push(commands);
        Ok(commands)
    }

    pub fn record_image_upload(
        &mut self,
        device: &VulkanDevice,
        slot: usize,
        staging: &VulkanBuffer,
        image: &VulkanImage,
        ops: &[TransferOp],
    ) -> Result<vk::CommandBuffer> {
        let commands = self.begin_transfer(device, slot)?;

        for op in ops {
            match *op {
                TransferOp::Barrier(barrier) => {
                    image_barrier(device, commands, image.image, barrier);
                }
                TransferOp::CopyBufferToImage { buffer_offset, extent } => {
                    let region = vk::BufferImageCopy::builder()
                        .buffer_offset(buffer_offset)
                        .buffer_row_length(0)
                        .buffer_image_height(0)
                        .image_subresource(color_layers(0))
                        .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                        .image_extent(vk::Extent3D {
                            width: extent.x,
                            height: extent.y,
                            depth: 1,
                        })
                        .build();
                    unsafe {
                        device.device.cmd_copy_buffer_to_image(
                            commands,
                            staging.buffer,
                            image.image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &[region],
                        );
                    }
                }
                TransferOp::Blit { src_level, src_extent, dst_level, dst_extent } => {
                    let blit = vk::ImageBlit::builder()
                        .src_subresource(color_layers(src_level))
                        .src_offsets([
                            vk::Offset3D { x: 0, y: 0, z: 0 },
                            vk::Offset3D {
                                x: src_extent.x as i32,
                                y: src_extent.y as i32,
                                z: 1,
                            },
                        ])
                        .dst_subresource(color_layers(dst_level))
                        .dst_offsets([
                            vk::Offset3D { x: 0, y: 0, z: 0 },
                            vk::Offset3D {
                                x: dst_extent.x as i32,
                                y: dst_extent.y as i32,
                                z: 1,
                            },
                        ])
                        .build();
                    unsafe {
                        device.device.cmd_blit_image(
                            commands,
                            image.image,
                            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            image.image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &[blit],
                            vk::Filter::LINEAR,
                        );
                    }
                }
            }
        }

        self.finish_transfer(device, slot, commands)
    }

    pub fn record_buffer_upload(
        &mut self,
        device: &VulkanDevice,
        slot: usize,
        staging: &VulkanBuffer,
        destination: &VulkanBuffer,
        copy: BufferCopy,
    ) -> Result<vk::CommandBuffer> {
        if copy.dst_offset + copy.size > destination.size {
            bail!(
                "Copy of {} bytes at offset {} overflows a {} byte buffer",
                copy.size,
                copy.dst_offset,
                destination.size
            );
        }

        let commands = self.begin_transfer(device, slot)?;
        let region = vk::BufferCopy {
            src_offset: copy.src_offset,
            dst_offset: copy.dst_offset,
            size: copy.size,
        };
        unsafe {
            device
                .device
                .cmd_copy_buffer(commands, staging.buffer, destination.buffer, &[region]);
        }
        self.finish_transfer(device, slot, commands)
    }

    /// Move submitted transfer buffers out of the recorded lists
    fn mark_submitted(&mut self, commands: &[vk::CommandBuffer]) {
        for ring in &mut self.transfer {
            let (submitted, kept): (Vec<_>, Vec<_>) =
                ring.recorded.drain(..).partition(|buffer| commands.contains(buffer));
            ring.recorded = kept;
            ring.submitted.extend(submitted);
        }
    }

    pub fn submit_transfer(
        &mut self,
        device: &VulkanDevice,
        commands: &[vk::CommandBuffer],
        signal: SemaphoreSignal<vk::Semaphore>,
    ) -> Result<()> {
        let command_infos: Vec<vk::CommandBufferSubmitInfo> = commands
            .iter()
            .map(|&commands| {
                vk::CommandBufferSubmitInfo::builder()
                    .command_buffer(commands)
                    .build()
            })
            .collect();
        let signal_infos = [signal_info(signal)];

        let submit = vk::SubmitInfo2::builder()
            .command_buffer_infos(&command_infos)
            .signal_semaphore_infos(&signal_infos)
            .build();

        unsafe {
            device
                .device
                .queue_submit2(device.transfer_queue, &[submit], vk::Fence::null())
        }
        .context("Failed to submit transfer queue")?;

        self.mark_submitted(commands);
        Ok(())
    }

    pub fn submit_render(
        &self,
        device: &VulkanDevice,
        commands: vk::CommandBuffer,
        waits: &[SemaphoreWait<vk::Semaphore>],
        signals: &[SemaphoreSignal<vk::Semaphore>],
    ) -> Result<()> {
        let command_infos = [vk::CommandBufferSubmitInfo::builder()
            .command_buffer(commands)
            .build()];
        let wait_infos: Vec<vk::SemaphoreSubmitInfo> = waits
            .iter()
            .map(|wait| {
                vk::SemaphoreSubmitInfo::builder()
                    .semaphore(wait.semaphore)
                    .value(wait.value.unwrap_or(0))
                    .stage_mask(sync::wait_stage(wait.stage))
                    .build()
            })
            .collect();
        let signal_infos: Vec<vk::SemaphoreSubmitInfo> =
            signals.iter().copied().map(signal_info).collect();

        let submit = vk::SubmitInfo2::builder()
            .wait_semaphore_infos(&wait_infos)
            .command_buffer_infos(&command_infos)
            .signal_semaphore_infos(&signal_infos)
            .build();

        unsafe {
            device
                .device
                .queue_submit2(device.graphics_queue, &[submit], vk::Fence::null())
        }
        .context("Failed to submit render queue")
    }

    /// Only valid once the device is idle
    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe { device.device.destroy_command_pool(self.pool, None) };
        self.render.clear();
        self.transfer.clear();
    }
}

fn signal_info(signal: SemaphoreSignal<vk::Semaphore>) -> vk::SemaphoreSubmitInfo {
    vk::SemaphoreSubmitInfo::builder()
        .semaphore(signal.semaphore)
        .value(signal.value.unwrap_or(0))
        .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .build()
}

fn color_layers(mip_level: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Vulkan layout plus the stage and access that touch an image in it
fn layout_scope(layout: ImageLayout) -> (vk::ImageLayout, vk::PipelineStageFlags2, vk::AccessFlags2) {
    match layout {
        ImageLayout::Undefined => (
            vk::ImageLayout::UNDEFINED,
            vk::PipelineStageFlags2::NONE,
            vk::AccessFlags2::NONE,
        ),
        ImageLayout::TransferDst => (
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        ),
        ImageLayout::TransferSrc => (
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
        ),
        ImageLayout::ShaderReadOnly => (
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_READ,
        ),
    }
}

fn image_barrier(device: &VulkanDevice, commands: vk::CommandBuffer, image: vk::Image, barrier: ImageBarrier) {
    let (old_layout, src_stage, src_access) = layout_scope(barrier.old_layout);
    let (new_layout, dst_stage, dst_access) = layout_scope(barrier.new_layout);

    let image_barrier = vk::ImageMemoryBarrier2::builder()
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: barrier.base_mip_level,
            level_count: barrier.level_count,
            base_array_layer: 0,
            layer_count: 1,
        })
        .build();

    let barriers = [image_barrier];
    let dependency = vk::DependencyInfo::builder().image_memory_barriers(&barriers);
    unsafe { device.device.cmd_pipeline_barrier2(commands, &dependency) };
}
