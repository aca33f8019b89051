// Swapchain - Window presentation
//
// Builds the swap surface set (swapchain, its image views and one
// framebuffer per presentable image) and maps acquire/present results onto
// the backend-neutral outcomes. Stale surfaces are never errors here.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use glam::UVec2;

use super::{pipeline, VulkanDevice};
use crate::backend::{AcquireOutcome, PresentMode, PresentOutcome, SurfaceCapabilities, SurfaceInfo};

/// One generation of presentable images and everything built on them
#[derive(Debug)]
pub struct SurfaceSet {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub extent: vk::Extent2D,
}

pub fn present_mode_to_vk(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
    }
}

fn present_mode_from_vk(mode: vk::PresentModeKHR) -> Option<PresentMode> {
    match mode {
        vk::PresentModeKHR::IMMEDIATE => Some(PresentMode::Immediate),
        vk::PresentModeKHR::MAILBOX => Some(PresentMode::Mailbox),
        vk::PresentModeKHR::FIFO => Some(PresentMode::Fifo),
        vk::PresentModeKHR::FIFO_RELAXED => Some(PresentMode::FifoRelaxed),
        _ => None,
    }
}

/// Prefer an sRGB 8-bit format, otherwise whatever the surface lists first
pub fn choose_surface_format(device: &VulkanDevice) -> Result<vk::SurfaceFormatKHR> {
    let formats = unsafe {
        device
            .surface_loader
            .get_physical_device_surface_formats(device.physical_device, device.surface)
    }
    .context("Failed to query surface formats")?;

    let format = formats
        .iter()
        .find(|f| {
            matches!(f.format, vk::Format::B8G8R8A8_SRGB | vk::Format::R8G8B8A8_SRGB)
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
        .context("No suitable surface format")?;

    log::info!("Surface format: {:?} / {:?}", format.format, format.color_space);
    Ok(format)
}

pub fn query_capabilities(device: &VulkanDevice) -> Result<SurfaceCapabilities> {
    let caps = unsafe {
        device
            .surface_loader
            .get_physical_device_surface_capabilities(device.physical_device, device.surface)
    }
    .context("Failed to query surface capabilities")?;

    let present_modes = unsafe {
        device
            .surface_loader
            .get_physical_device_surface_present_modes(device.physical_device, device.surface)
    }
    .context("Failed to query present modes")?;

    // u32::MAX means the swapchain decides the size
    let current_extent = (caps.current_extent.width != u32::MAX)
        .then(|| UVec2::new(caps.current_extent.width, caps.current_extent.height));

    Ok(SurfaceCapabilities {
        current_extent,
        min_extent: UVec2::new(caps.min_image_extent.width, caps.min_image_extent.height),
        max_extent: UVec2::new(caps.max_image_extent.width, caps.max_image_extent.height),
        min_image_count: caps.min_image_count,
        max_image_count: caps.max_image_count,
        present_modes: present_modes.into_iter().filter_map(present_mode_from_vk).collect(),
    })
}

/// Everything a surface set build needs besides the target configuration
pub struct SurfaceSetDesc<'a> {
    pub format: vk::SurfaceFormatKHR,
    pub render_pass: vk::RenderPass,
    pub color: &'a [vk::ImageView],
    pub depth: &'a [vk::ImageView],
    /// Handed to the driver so in-flight presentation can finish on it
    pub previous: Option<&'a SurfaceSet>,
}

pub fn create_surface_set(
    device: &VulkanDevice,
    loader: &khr::Swapchain,
    info: &SurfaceInfo,
    desc: &SurfaceSetDesc<'_>,
) -> Result<SurfaceSet> {
    log::info!("Creating swapchain: {}x{}", info.extent.x, info.extent.y);

    let caps = unsafe {
        device
            .surface_loader
            .get_physical_device_surface_capabilities(device.physical_device, device.surface)
    }
    .context("Failed to query surface capabilities")?;

    let composite_alpha = [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::INHERIT,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    ]
    .into_iter()
    .find(|&flag| caps.supported_composite_alpha.contains(flag))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE);

    let extent = vk::Extent2D {
        width: info.extent.x,
        height: info.extent.y,
    };
    let old_swapchain = desc
        .previous
        .map_or(vk::SwapchainKHR::null(), |previous| previous.swapchain);

    let create_info = vk::SwapchainCreateInfoKHR::builder()
        .surface(device.surface)
        .min_image_count(info.image_count)
        .image_format(desc.format.format)
        .image_color_space(desc.format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(caps.current_transform)
        .composite_alpha(composite_alpha)
        .present_mode(present_mode_to_vk(info.present_mode))
        .clipped(true)
        .old_swapchain(old_swapchain);

    let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
        .context("Failed to create swapchain")?;

    let mut set = SurfaceSet {
        swapchain,
        images: Vec::new(),
        views: Vec::new(),
        framebuffers: Vec::new(),
        extent,
    };
    // A partially built set is torn down before the error propagates
    if let Err(e) = populate(device, loader, &mut set, desc) {
        destroy_surface_set(device, loader, set);
        return Err(e);
    }

    log::info!("Created swapchain with {} images", set.images.len());
    Ok(set)
}

fn populate(
    device: &VulkanDevice,
    loader: &khr::Swapchain,
    set: &mut SurfaceSet,
    desc: &SurfaceSetDesc<'_>,
) -> Result<()> {
    set.images = unsafe { loader.get_swapchain_images(set.swapchain) }
        .context("Failed to get swapchain images")?;

    for &image in &set.images {
        let view = super::buffer::create_image_view(
            device,
            image,
            desc.format.format,
            vk::ImageAspectFlags::COLOR,
            1,
        )?;
        set.views.push(view);
    }

    set.framebuffers = pipeline::create_framebuffers(
        device,
        desc.render_pass,
        &set.views,
        desc.color,
        desc.depth,
        set.extent,
    )?;
    Ok(())
}

/// Framebuffers, views, then the swapchain itself
pub fn destroy_surface_set(device: &VulkanDevice, loader: &khr::Swapchain, set: SurfaceSet) {
    unsafe {
        for framebuffer in set.framebuffers {
            device.device.destroy_framebuffer(framebuffer, None);
        }
        for view in set.views {
            device.device.destroy_image_view(view, None);
        }
        loader.destroy_swapchain(set.swapchain, None);
    }
}

/// Acquire next image for rendering, untimed
pub fn acquire_next_image(
    loader: &khr::Swapchain,
    set: &SurfaceSet,
    semaphore: vk::Semaphore,
) -> Result<AcquireOutcome> {
    let result = unsafe {
        loader.acquire_next_image(set.swapchain, u64::MAX, semaphore, vk::Fence::null())
    };

    match result {
        Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired { image_index, suboptimal }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
        Err(e) => Err(e).context("Failed to acquire swapchain image"),
    }
}

/// Present rendered image to screen
pub fn present(
    loader: &khr::Swapchain,
    queue: vk::Queue,
    set: &SurfaceSet,
    image_index: u32,
    wait: vk::Semaphore,
) -> Result<PresentOutcome> {
    let swapchains = [set.swapchain];
    let image_indices = [image_index];
    let wait_semaphores = [wait];

    let present_info = vk::PresentInfoKHR::builder()
        .wait_semaphores(&wait_semaphores)
        .swapchains(&swapchains)
        .image_indices(&image_indices);

    let result = unsafe { loader.queue_present(queue, &present_info) };

    match result {
        Ok(false) => Ok(PresentOutcome::Presented),
        Ok(true) => Ok(PresentOutcome::Suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
        Err(e) => Err(e).context("Failed to present swapchain image"),
    }
}
