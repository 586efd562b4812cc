// Immediate submission
//
// One command buffer + fence outside the frame ring for blocking one-off GPU
// work (uploads, image priming). Each submit waits for the GPU to finish, so
// keep it out of the per-frame path.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::deletion::{DeletionQueue, GpuResource};
use super::sync;
use super::GraphicsContext;

pub struct ImmediateExecutor {
    context: Arc<GraphicsContext>,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    timeout: Duration,
}

impl ImmediateExecutor {
    /// Handles are registered in `global` as they are created.
    pub fn new(
        context: Arc<GraphicsContext>,
        global: &mut DeletionQueue<GpuResource>,
        timeout: Duration,
    ) -> Result<Self> {
        let device = &context.device;

        let pool = sync::create_command_pool(device, context.graphics_queue_family)?;
        global.defer(GpuResource::CommandPool(pool));

        let command_buffer = sync::allocate_primary_command_buffer(device, pool)?;

        let fence = sync::create_fence(device, true)?;
        global.defer(GpuResource::Fence(fence));

        Ok(Self {
            context,
            command_buffer,
            fence,
            timeout,
        })
    }

    /// Record with `record`, submit, and block until the GPU has executed it.
    pub fn submit<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = &self.context.device;
        let cmd = self.command_buffer;

        sync::reset_fence(device, self.fence)?;
        sync::begin_one_time(device, cmd)?;

        record(device, cmd);

        unsafe { device.end_command_buffer(cmd) }
            .context("Failed to end immediate command buffer")?;

        sync::submit(device, self.context.graphics_queue, cmd, None, None, self.fence)?;
        sync::wait_for_fence(device, self.fence, self.timeout)
            .context("Immediate submission did not complete")
    }
}
