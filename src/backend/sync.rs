// Synchronization primitives
//
// Fences for GPU-CPU sync, semaphores for GPU-GPU sync within a frame

use anyhow::{Context, Result};
use ash::vk;
use std::time::Duration;

use super::deletion::GpuResource;

/// Per-slot synchronization - one per frame in flight
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    /// Signaled by acquire, waited on by the frame's submission
    pub swapchain_semaphore: vk::Semaphore,
    /// Signaled by the submission, waited on by present
    pub render_semaphore: vk::Semaphore,
    /// Signaled when the slot's commands finish executing
    pub render_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let swapchain_semaphore = create_semaphore(device)?;
        let render_semaphore = match create_semaphore(device) {
            Ok(semaphore) => semaphore,
            Err(e) => {
                unsafe { device.destroy_semaphore(swapchain_semaphore, None) };
                return Err(e);
            }
        };
        // Start signaled so the first wait on a fresh slot returns at once
        let render_fence = match create_fence(device, true) {
            Ok(fence) => fence,
            Err(e) => {
                unsafe {
                    device.destroy_semaphore(render_semaphore, None);
                    device.destroy_semaphore(swapchain_semaphore, None);
                }
                return Err(e);
            }
        };

        Ok(Self {
            swapchain_semaphore,
            render_semaphore,
            render_fence,
        })
    }

    /// Handles for the deletion queue, in creation order.
    pub fn resources(&self) -> [GpuResource; 3] {
        [
            GpuResource::Semaphore(self.swapchain_semaphore),
            GpuResource::Semaphore(self.render_semaphore),
            GpuResource::Fence(self.render_fence),
        ]
    }
}

pub fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let info = vk::SemaphoreCreateInfo::default();
    unsafe { device.create_semaphore(&info, None) }.context("Failed to create semaphore")
}

pub fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };
    let info = vk::FenceCreateInfo::default().flags(flags);
    unsafe { device.create_fence(&info, None) }.context("Failed to create fence")
}

/// Block until `fence` signals. Exceeding `timeout` is an error: the GPU is
/// considered hung.
pub fn wait_for_fence(device: &ash::Device, fence: vk::Fence, timeout: Duration) -> Result<()> {
    let nanos = timeout_nanos(timeout);
    match unsafe { device.wait_for_fences(&[fence], true, nanos) } {
        Ok(()) => Ok(()),
        Err(vk::Result::TIMEOUT) => {
            anyhow::bail!("GPU did not signal fence within {:?}", timeout)
        }
        Err(e) => Err(e).context("vkWaitForFences failed"),
    }
}

pub fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    unsafe { device.reset_fences(&[fence]) }.context("Failed to reset fence")
}

/// Command pool whose buffers can be reset individually.
pub fn create_command_pool(device: &ash::Device, queue_family: u32) -> Result<vk::CommandPool> {
    let info = vk::CommandPoolCreateInfo::default()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(queue_family);
    unsafe { device.create_command_pool(&info, None) }.context("Failed to create command pool")
}

pub fn allocate_primary_command_buffer(
    device: &ash::Device,
    pool: vk::CommandPool,
) -> Result<vk::CommandBuffer> {
    let info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let buffers = unsafe { device.allocate_command_buffers(&info) }
        .context("Failed to allocate command buffer")?;
    buffers
        .into_iter()
        .next()
        .context("Driver returned no command buffer")
}

/// Reset `cmd` and begin a one-time-submit recording.
pub fn begin_one_time(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    unsafe {
        device
            .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
            .context("Failed to reset command buffer")?;
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device
            .begin_command_buffer(cmd, &info)
            .context("Failed to begin command buffer")?;
    }
    Ok(())
}

/// A semaphore and the stage it gates or is signaled from.
#[derive(Debug, Clone, Copy)]
pub struct SemaphoreStage {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags2,
}

/// Submit one command buffer through vkQueueSubmit2.
pub fn submit(
    device: &ash::Device,
    queue: vk::Queue,
    cmd: vk::CommandBuffer,
    wait: Option<SemaphoreStage>,
    signal: Option<SemaphoreStage>,
    fence: vk::Fence,
) -> Result<()> {
    let semaphore_info = |s: SemaphoreStage| {
        vk::SemaphoreSubmitInfo::default()
            .semaphore(s.semaphore)
            .stage_mask(s.stage)
            .value(1)
    };
    let wait_infos: Vec<_> = wait.into_iter().map(semaphore_info).collect();
    let signal_infos: Vec<_> = signal.into_iter().map(semaphore_info).collect();
    let cmd_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];

    let submit_info = vk::SubmitInfo2::default()
        .wait_semaphore_infos(&wait_infos)
        .signal_semaphore_infos(&signal_infos)
        .command_buffer_infos(&cmd_infos);

    unsafe { device.queue_submit2(queue, &[submit_info], fence) }
        .context("vkQueueSubmit2 failed")
}

fn timeout_nanos(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_convert_to_nanoseconds() {
        assert_eq!(timeout_nanos(Duration::from_secs(1)), 1_000_000_000);
        assert_eq!(timeout_nanos(Duration::from_secs(10)), 10_000_000_000);
    }

    #[test]
    fn huge_timeouts_saturate() {
        assert_eq!(timeout_nanos(Duration::MAX), u64::MAX);
    }
}
