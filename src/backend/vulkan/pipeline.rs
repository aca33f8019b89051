// Render pass and framebuffers
//
// One multisampled subpass: color + depth attachments rendered at the
// configured sample count, resolved into the presentable image.

use anyhow::{bail, Context, Result};
use ash::vk;

use super::VulkanDevice;

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Highest supported sample count not above `requested`.
/// The pass always resolves, so at least two samples are used.
pub fn choose_sample_count(device: &VulkanDevice, requested: u32) -> Result<vk::SampleCountFlags> {
    let requested = requested.max(2);
    let limits = &device.properties.limits;
    let supported = limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts;

    let samples = [
        (8, vk::SampleCountFlags::TYPE_8),
        (4, vk::SampleCountFlags::TYPE_4),
        (2, vk::SampleCountFlags::TYPE_2),
    ]
    .into_iter()
    .find(|&(count, flag)| count <= requested && supported.contains(flag))
    .map(|(_, flag)| flag);

    match samples {
        Some(samples) => {
            if samples.as_raw() != requested {
                log::warn!("MSAA x{} not supported, using {:?}", requested, samples);
            }
            Ok(samples)
        }
        None => bail!("GPU supports no multisampled framebuffers (requested x{})", requested),
    }
}

/// Create the frame's render pass: MSAA color, MSAA depth, resolve to swapchain
pub fn create_render_pass(
    device: &VulkanDevice,
    format: vk::Format,
    samples: vk::SampleCountFlags,
) -> Result<vk::RenderPass> {
    // Multisampled color, only its resolve survives the pass
    let color_attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    // Depth attachment
    let depth_attachment = vk::AttachmentDescription::builder()
        .format(DEPTH_FORMAT)
        .samples(samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    // Resolve target (the swapchain image)
    let resolve_attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::DONT_CARE)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();
    let depth_attachment_ref = vk::AttachmentReference::builder()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();
    let resolve_attachment_ref = vk::AttachmentReference::builder()
        .attachment(2)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = &[color_attachment_ref];
    let resolve_attachments = &[resolve_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(color_attachments)
        .resolve_attachments(resolve_attachments)
        .depth_stencil_attachment(&depth_attachment_ref)
        .build();

    // Attachments may be shared by consecutive frames, order their writes
    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        )
        .src_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .build();

    let attachments = &[color_attachment, depth_attachment, resolve_attachment];
    let subpasses = &[subpass];
    let dependencies = &[dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(attachments)
        .subpasses(subpasses)
        .dependencies(dependencies);

    let render_pass = unsafe { device.device.create_render_pass(&render_pass_info, None) }
        .context("Failed to create render pass")?;
    device.set_object_name(render_pass, "frame render pass");
    Ok(render_pass)
}

/// One framebuffer per presentable image.
///
/// The swapchain may hold more images than attachments were built for, in
/// which case image `i` renders through attachment `i % len`.
pub fn create_framebuffers(
    device: &VulkanDevice,
    render_pass: vk::RenderPass,
    image_views: &[vk::ImageView],
    color: &[vk::ImageView],
    depth: &[vk::ImageView],
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>> {
    if color.is_empty() || depth.len() != color.len() {
        bail!(
            "Surface set needs matching color and depth attachments ({} color, {} depth)",
            color.len(),
            depth.len()
        );
    }

    let mut framebuffers = Vec::with_capacity(image_views.len());
    for (i, &image_view) in image_views.iter().enumerate() {
        let attachments = &[color[i % color.len()], depth[i % depth.len()], image_view];
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        match unsafe { device.device.create_framebuffer(&framebuffer_info, None) } {
            Ok(framebuffer) => framebuffers.push(framebuffer),
            Err(e) => {
                for framebuffer in framebuffers {
                    unsafe { device.device.destroy_framebuffer(framebuffer, None) };
                }
                return Err(e).context("Failed to create framebuffer");
            }
        }
    }
    Ok(framebuffers)
}
