// Memory-backed resources
//
// Buffers, images, views and samplers. Memory comes from gpu-allocator;
// host-visible allocations stay persistently mapped.

use anyhow::{bail, Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::VulkanDevice;
use crate::backend::BufferUsage;
use crate::upload::{EdgeMode, FilterMode, MipmapMode, SamplerConfig, TextureFormat};

#[derive(Debug)]
pub struct VulkanBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Allocation,
}

#[derive(Debug)]
pub struct VulkanImage {
    pub image: vk::Image,
    allocation: Allocation,
}

/// Usage flags and memory location for each buffer role
fn buffer_usage(usage: BufferUsage) -> (vk::BufferUsageFlags, MemoryLocation) {
    match usage {
        BufferUsage::Staging => (vk::BufferUsageFlags::TRANSFER_SRC, MemoryLocation::CpuToGpu),
        BufferUsage::Vertex => (
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        ),
        BufferUsage::Index => (
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        ),
        BufferUsage::Instance => (vk::BufferUsageFlags::VERTEX_BUFFER, MemoryLocation::CpuToGpu),
    }
}

pub fn texture_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        TextureFormat::R8Unorm => vk::Format::R8_UNORM,
    }
}

// =============================================================================
// BUFFERS
// =============================================================================

pub fn create_buffer(
    device: &VulkanDevice,
    usage: BufferUsage,
    size: vk::DeviceSize,
    name: &str,
) -> Result<VulkanBuffer> {
    if size == 0 {
        bail!("Buffer '{}' must not be empty", name);
    }
    let (usage_flags, location) = buffer_usage(usage);

    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage_flags)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
        .with_context(|| format!("Failed to create buffer '{name}'"))?;

    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

    let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
        name,
        requirements,
        location,
        linear: true,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    });
    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e).with_context(|| format!("Failed to allocate memory for buffer '{name}'"));
        }
    };

    unsafe {
        device
            .device
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
    }
    .with_context(|| format!("Failed to bind memory of buffer '{name}'"))?;

    device.set_object_name(buffer, name);
    log::debug!("Created buffer '{}' ({} bytes, {:?})", name, size, usage);

    Ok(VulkanBuffer { buffer, size, allocation })
}

/// Copy `data` into a persistently mapped buffer
pub fn write_buffer(buffer: &VulkanBuffer, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
    let end = offset
        .checked_add(data.len() as vk::DeviceSize)
        .context("Buffer write range overflows")?;
    if end > buffer.size {
        bail!(
            "Write of {} bytes at offset {} exceeds buffer size {}",
            data.len(),
            offset,
            buffer.size
        );
    }

    let mapped = buffer
        .allocation
        .mapped_ptr()
        .context("Buffer memory is not host visible")?;

    unsafe {
        let dst = mapped.as_ptr().cast::<u8>().add(offset as usize);
        std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
    }
    Ok(())
}

pub fn destroy_buffer(device: &VulkanDevice, buffer: VulkanBuffer) {
    unsafe { device.device.destroy_buffer(buffer.buffer, None) };
    if let Err(e) = device.allocator.lock().free(buffer.allocation) {
        log::error!("Failed to free buffer memory: {}", e);
    }
}

// =============================================================================
// IMAGES
// =============================================================================

/// Create a device-local 2D image and bind memory to it
pub fn create_image(
    device: &VulkanDevice,
    info: &vk::ImageCreateInfo,
    name: &str,
) -> Result<VulkanImage> {
    let image = unsafe { device.device.create_image(info, None) }
        .with_context(|| format!("Failed to create image '{name}'"))?;

    let requirements = unsafe { device.device.get_image_memory_requirements(image) };

    let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
        name,
        requirements,
        location: MemoryLocation::GpuOnly,
        linear: false,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    });
    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.device.destroy_image(image, None) };
            return Err(e).with_context(|| format!("Failed to allocate memory for image '{name}'"));
        }
    };

    unsafe {
        device
            .device
            .bind_image_memory(image, allocation.memory(), allocation.offset())
    }
    .with_context(|| format!("Failed to bind memory of image '{name}'"))?;

    device.set_object_name(image, name);
    Ok(VulkanImage { image, allocation })
}

pub fn create_image_view(
    device: &VulkanDevice,
    image: vk::Image,
    format: vk::Format,
    aspect_mask: vk::ImageAspectFlags,
    level_count: u32,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe { device.device.create_image_view(&view_info, None) }
        .context("Failed to create image view")
}

pub fn destroy_image(device: &VulkanDevice, image: VulkanImage) {
    unsafe { device.device.destroy_image(image.image, None) };
    if let Err(e) = device.allocator.lock().free(image.allocation) {
        log::error!("Failed to free image memory: {}", e);
    }
}

/// Multisampled color or depth render target
pub fn create_attachment_image(
    device: &VulkanDevice,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    samples: vk::SampleCountFlags,
    extent: vk::Extent2D,
    name: &str,
) -> Result<VulkanImage> {
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .format(format)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(usage | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT)
        .samples(samples)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    create_image(device, &image_info, name)
}

/// Sampled texture that is the destination of an upload (and of mip blits)
pub fn create_texture_image(
    device: &VulkanDevice,
    format: vk::Format,
    extent: vk::Extent2D,
    mip_levels: u32,
) -> Result<VulkanImage> {
    let mut usage = vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED;

    if mip_levels > 1 {
        // Mip levels are generated with linear blits
        let props = unsafe {
            device
                .instance
                .get_physical_device_format_properties(device.physical_device, format)
        };
        if !props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
        {
            bail!("Format {:?} does not support linear blits for mip generation", format);
        }
        usage |= vk::ImageUsageFlags::TRANSFER_SRC;
    }

    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(mip_levels)
        .array_layers(1)
        .format(format)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(usage)
        .samples(vk::SampleCountFlags::TYPE_1)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    create_image(device, &image_info, "texture")
}

// =============================================================================
// SAMPLERS
// =============================================================================

pub fn create_sampler(device: &VulkanDevice, config: &SamplerConfig, mip_levels: u32) -> Result<vk::Sampler> {
    let filter = match config.filter {
        FilterMode::Nearest => vk::Filter::NEAREST,
        FilterMode::Linear => vk::Filter::LINEAR,
    };
    let mipmap_mode = match config.mipmap_mode {
        MipmapMode::Nearest => vk::SamplerMipmapMode::NEAREST,
        MipmapMode::Linear => vk::SamplerMipmapMode::LINEAR,
    };
    let address_mode = match config.edge {
        EdgeMode::Repeat => vk::SamplerAddressMode::REPEAT,
        EdgeMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        EdgeMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        EdgeMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    };

    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(filter)
        .min_filter(filter)
        .mipmap_mode(mipmap_mode)
        .address_mode_u(address_mode)
        .address_mode_v(address_mode)
        .address_mode_w(address_mode)
        .anisotropy_enable(true)
        .max_anisotropy(device.properties.limits.max_sampler_anisotropy)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .compare_enable(false)
        .min_lod(0.0)
        .max_lod(mip_levels as f32)
        .mip_lod_bias(0.0);

    unsafe { device.device.create_sampler(&sampler_info, None) }.context("Failed to create sampler")
}
