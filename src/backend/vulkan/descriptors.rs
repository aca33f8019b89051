// Descriptor pools
//
// Two pools: a regular one whose sets are freed one by one, and a bindless
// one whose sets live as long as the pool.

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanDevice;

const MAX_SETS: u32 = 512;

pub struct DescriptorPools {
    regular: vk::DescriptorPool,
    bindless: vk::DescriptorPool,
}

fn create_pool(device: &VulkanDevice, flags: vk::DescriptorPoolCreateFlags, name: &str) -> Result<vk::DescriptorPool> {
    let pool_sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: MAX_SETS * 4,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: MAX_SETS,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: MAX_SETS,
        },
    ];

    let pool_info = vk::DescriptorPoolCreateInfo::builder()
        .flags(flags)
        .max_sets(MAX_SETS)
        .pool_sizes(&pool_sizes);

    let pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
        .with_context(|| format!("Failed to create {name} descriptor pool"))?;
    device.set_object_name(pool, name);
    Ok(pool)
}

impl DescriptorPools {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let regular = create_pool(
            device,
            vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
            "regular",
        )?;
        let bindless = match create_pool(device, vk::DescriptorPoolCreateFlags::empty(), "bindless") {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.device.destroy_descriptor_pool(regular, None) };
                return Err(e);
            }
        };
        Ok(Self { regular, bindless })
    }

    pub fn allocate(
        &self,
        device: &VulkanDevice,
        layout: vk::DescriptorSetLayout,
        bindless: bool,
    ) -> Result<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(if bindless { self.bindless } else { self.regular })
            .set_layouts(&layouts);

        let sets = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor set")?;
        sets.first().copied().context("Driver returned no descriptor set")
    }

    pub fn free(&self, device: &VulkanDevice, set: vk::DescriptorSet) {
        if let Err(e) = unsafe { device.device.free_descriptor_sets(self.regular, &[set]) } {
            log::error!("Failed to free descriptor set: {:?}", e);
        }
    }

    /// Only valid once the device is idle
    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_descriptor_pool(self.regular, None);
            device.device.destroy_descriptor_pool(self.bindless, None);
        }
    }
}
