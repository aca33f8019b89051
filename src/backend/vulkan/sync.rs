// Synchronization primitives
//
// One-shot signals are binary semaphores (acquire and present only accept
// those), counting signals are timeline semaphores starting at zero.
// There are no fences: the host waits on timeline values instead.

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanDevice;
use crate::backend::WaitStage;

pub fn create_binary_semaphore(device: &VulkanDevice, name: &str) -> Result<vk::Semaphore> {
    let info = vk::SemaphoreCreateInfo::builder();
    let semaphore = unsafe { device.device.create_semaphore(&info, None) }
        .with_context(|| format!("Failed to create semaphore '{name}'"))?;
    device.set_object_name(semaphore, name);
    Ok(semaphore)
}

pub fn create_timeline_semaphore(device: &VulkanDevice, name: &str) -> Result<vk::Semaphore> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(0);
    let info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
    let semaphore = unsafe { device.device.create_semaphore(&info, None) }
        .with_context(|| format!("Failed to create timeline semaphore '{name}'"))?;
    device.set_object_name(semaphore, name);
    Ok(semaphore)
}

/// Untimed host wait until every timeline semaphore reached its value
pub fn wait_for_values(device: &VulkanDevice, waits: &[(vk::Semaphore, u64)]) -> Result<()> {
    // Value zero is the initial value, nothing to wait for
    let (semaphores, values): (Vec<vk::Semaphore>, Vec<u64>) =
        waits.iter().copied().filter(|&(_, value)| value > 0).unzip();
    if semaphores.is_empty() {
        return Ok(());
    }

    let info = vk::SemaphoreWaitInfo::builder()
        .semaphores(&semaphores)
        .values(&values);
    unsafe { device.device.wait_semaphores(&info, u64::MAX) }
        .context("Failed to wait for timeline semaphores")
}

pub fn wait_stage(stage: WaitStage) -> vk::PipelineStageFlags2 {
    match stage {
        WaitStage::VertexInput => vk::PipelineStageFlags2::VERTEX_INPUT,
        WaitStage::ColorAttachmentOutput => vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
    }
}
