// Frames in flight
//
// The CPU records frame i+1 while the GPU still executes frame i. Each ring
// slot owns its command buffer, semaphores, fence and deletion queue; a slot
// is only reused once its fence says the GPU is done with it.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::allocator::ResourceAllocator;
use super::deletion::{DeletionQueue, GpuResource};
use super::swapchain::SwapchainManager;
use super::sync::{self, FrameSync, SemaphoreStage};
use super::GraphicsContext;

pub const FRAMES_IN_FLIGHT: usize = 2;

/// Lifecycle of one ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Recording,
    /// Submitted; the GPU may still be executing it.
    Submitted,
}

/// Fixed ring of per-frame data indexed by `frame_number % FRAMES_IN_FLIGHT`.
#[derive(Debug)]
pub struct FrameRing<T> {
    slots: [T; FRAMES_IN_FLIGHT],
    states: [SlotState; FRAMES_IN_FLIGHT],
    frame_number: u64,
}

impl<T> FrameRing<T> {
    pub fn new(slots: [T; FRAMES_IN_FLIGHT]) -> Self {
        Self {
            slots,
            states: [SlotState::Idle; FRAMES_IN_FLIGHT],
            frame_number: 0,
        }
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn current_index(&self) -> usize {
        (self.frame_number % FRAMES_IN_FLIGHT as u64) as usize
    }

    pub fn current(&self) -> &T {
        &self.slots[self.current_index()]
    }

    pub fn current_mut(&mut self) -> &mut T {
        let index = self.current_index();
        &mut self.slots[index]
    }

    pub fn state(&self) -> SlotState {
        self.states[self.current_index()]
    }

    /// Slot holding the newest GPU work: the current slot while it records,
    /// otherwise the one submitted last.
    pub fn latest_mut(&mut self) -> &mut T {
        let current = self.current_index();
        let index = match self.states[current] {
            SlotState::Recording => current,
            _ => (current + FRAMES_IN_FLIGHT - 1) % FRAMES_IN_FLIGHT,
        };
        &mut self.slots[index]
    }

    /// Visit every slot, starting with the one due for reuse next.
    pub fn for_each_oldest_first<F>(&mut self, mut visit: F)
    where
        F: FnMut(&mut T),
    {
        let start = self.current_index();
        for offset in 0..FRAMES_IN_FLIGHT {
            visit(&mut self.slots[(start + offset) % FRAMES_IN_FLIGHT]);
        }
    }

    /// Make the current slot reusable. `wait` runs only when the slot has
    /// outstanding GPU work and must block until that work completes.
    pub fn retire<F>(&mut self, wait: F) -> Result<()>
    where
        F: FnOnce(&mut T) -> Result<()>,
    {
        let index = self.current_index();
        match self.states[index] {
            SlotState::Submitted => {
                wait(&mut self.slots[index])?;
                self.states[index] = SlotState::Idle;
                Ok(())
            }
            SlotState::Idle => Ok(()),
            SlotState::Recording => {
                anyhow::bail!("Frame slot {} is still recording", index)
            }
        }
    }

    pub fn start_recording(&mut self) -> Result<()> {
        let index = self.current_index();
        match self.states[index] {
            SlotState::Idle => {
                self.states[index] = SlotState::Recording;
                Ok(())
            }
            state => anyhow::bail!("Cannot record into frame slot {} while {:?}", index, state),
        }
    }

    pub fn mark_submitted(&mut self) -> Result<()> {
        let index = self.current_index();
        match self.states[index] {
            SlotState::Recording => {
                self.states[index] = SlotState::Submitted;
                Ok(())
            }
            state => anyhow::bail!("Cannot submit frame slot {} while {:?}", index, state),
        }
    }

    /// Move to the next frame. The counter only ever grows.
    pub fn advance(&mut self) {
        self.frame_number += 1;
    }
}

// =============================================================================
// GPU FRAME SLOTS
// =============================================================================

pub struct FrameSlot {
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub sync: FrameSync,
    /// Resources whose last use was recorded in this slot.
    pub deletion_queue: DeletionQueue<GpuResource>,
}

impl FrameSlot {
    /// Create a slot, registering every handle in `global` as soon as it exists.
    fn new(
        device: &ash::Device,
        queue_family: u32,
        global: &mut DeletionQueue<GpuResource>,
    ) -> Result<Self> {
        let command_pool = sync::create_command_pool(device, queue_family)?;
        global.defer(GpuResource::CommandPool(command_pool));

        // Freed together with its pool
        let command_buffer = sync::allocate_primary_command_buffer(device, command_pool)?;

        let sync = FrameSync::new(device)?;
        for resource in sync.resources() {
            global.defer(resource);
        }

        Ok(Self {
            command_pool,
            command_buffer,
            sync,
            deletion_queue: DeletionQueue::new(),
        })
    }
}

/// The frame being recorded, returned by `begin_frame`.
#[derive(Debug)]
pub struct FrameHandle {
    pub command_buffer: vk::CommandBuffer,
    pub image_index: u32,
    pub swapchain_image: vk::Image,
    pub swapchain_view: vk::ImageView,
    pub swapchain_extent: vk::Extent2D,
    pub swapchain_format: vk::Format,
    frame_number: u64,
}

/// Drives begin / end / present over the frame ring.
pub struct FrameScheduler {
    context: Arc<GraphicsContext>,
    ring: FrameRing<FrameSlot>,
    frame_timeout: Duration,
}

impl FrameScheduler {
    pub fn new(
        context: Arc<GraphicsContext>,
        global: &mut DeletionQueue<GpuResource>,
        frame_timeout: Duration,
    ) -> Result<Self> {
        let device = &context.device;
        let family = context.graphics_queue_family;
        let slots = (0..FRAMES_IN_FLIGHT)
            .map(|_| FrameSlot::new(device, family, global))
            .collect::<Result<Vec<_>>>()?;
        let slots: [FrameSlot; FRAMES_IN_FLIGHT] = slots
            .try_into()
            .map_err(|_| anyhow::anyhow!("Frame slot count mismatch"))?;

        log::info!("Created {} frames in flight", FRAMES_IN_FLIGHT);

        Ok(Self {
            context,
            ring: FrameRing::new(slots),
            frame_timeout,
        })
    }

    pub fn frame_number(&self) -> u64 {
        self.ring.frame_number()
    }

    /// Wait for the current slot, flush its deletions, acquire an image and
    /// start recording.
    ///
    /// Returns `None` when the swapchain turned out to be stale; it is marked
    /// dirty and the frame is skipped.
    pub fn begin_frame(
        &mut self,
        swapchain: &mut SwapchainManager,
        allocator: &mut ResourceAllocator,
    ) -> Result<Option<FrameHandle>> {
        let device = &self.context.device;
        let timeout = self.frame_timeout;

        self.ring
            .retire(|slot| sync::wait_for_fence(device, slot.sync.render_fence, timeout))
            .context("Waiting for frame slot")?;

        let slot = self.ring.current_mut();
        slot.deletion_queue.flush_gpu(device, Some(allocator));

        let chain = swapchain.chain()?;
        let Some((image_index, suboptimal)) =
            chain.acquire_next_image(slot.sync.swapchain_semaphore, timeout)?
        else {
            // Fence stays signaled; nothing was submitted for this slot
            swapchain.mark_dirty();
            return Ok(None);
        };
        let (swapchain_image, swapchain_view) = chain.image(image_index)?;
        let swapchain_extent = chain.extent;
        let swapchain_format = chain.format;

        if suboptimal {
            swapchain.mark_dirty();
        }

        // Only reset once work is certain to be submitted
        sync::reset_fence(device, slot.sync.render_fence)?;
        sync::begin_one_time(device, slot.command_buffer)?;
        let command_buffer = slot.command_buffer;

        self.ring.start_recording()?;

        Ok(Some(FrameHandle {
            command_buffer,
            image_index,
            swapchain_image,
            swapchain_view,
            swapchain_extent,
            swapchain_format,
            frame_number: self.ring.frame_number(),
        }))
    }

    /// Finish recording and submit. Waits for the acquired image before
    /// writing color output and signals render completion plus the slot fence.
    pub fn end_frame(&mut self, frame: &FrameHandle) -> Result<()> {
        self.check_current(frame)?;
        let device = &self.context.device;
        let slot = self.ring.current();

        unsafe { device.end_command_buffer(frame.command_buffer) }
            .context("Failed to end frame command buffer")?;

        sync::submit(
            device,
            self.context.graphics_queue,
            frame.command_buffer,
            Some(SemaphoreStage {
                semaphore: slot.sync.swapchain_semaphore,
                stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            }),
            Some(SemaphoreStage {
                semaphore: slot.sync.render_semaphore,
                stage: vk::PipelineStageFlags2::ALL_GRAPHICS,
            }),
            slot.sync.render_fence,
        )?;

        self.ring.mark_submitted()
    }

    /// Present once rendering completes. A stale swapchain is marked dirty
    /// instead of failing. The frame counter advances either way.
    pub fn present(&mut self, frame: FrameHandle, swapchain: &mut SwapchainManager) -> Result<()> {
        self.check_current(&frame)?;
        let render_semaphore = self.ring.current().sync.render_semaphore;

        let result = swapchain.chain().and_then(|chain| {
            chain.present(self.context.graphics_queue, frame.image_index, render_semaphore)
        });
        self.ring.advance();

        if result? {
            swapchain.mark_dirty();
        }
        Ok(())
    }

    /// Destroy `resource` once the newest recorded or submitted frame has
    /// completed on the GPU.
    pub fn defer(&mut self, resource: GpuResource) {
        self.ring.latest_mut().deletion_queue.defer(resource);
    }

    /// Flush every slot's deletion queue. Only valid once the device is idle.
    pub fn flush_all(&mut self, allocator: Option<&mut ResourceAllocator>) {
        let device = &self.context.device;
        let mut allocator = allocator;
        self.ring.for_each_oldest_first(|slot| {
            slot.deletion_queue.flush_gpu(device, allocator.as_deref_mut());
        });
    }

    fn check_current(&self, frame: &FrameHandle) -> Result<()> {
        if frame.frame_number != self.ring.frame_number() {
            anyhow::bail!(
                "Frame {} used after frame {} started",
                frame.frame_number,
                self.ring.frame_number()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Stand-in for a slot with a fence: remembers which frame it last carried.
    #[derive(Default)]
    struct FakeSlot {
        in_flight: Option<u64>,
    }

    #[derive(Default)]
    struct TrackedSlot {
        in_flight: Option<u64>,
        pending: Vec<&'static str>,
    }

    #[test]
    fn resource_deferred_between_frames_outlives_the_frame_that_used_it() {
        let mut ring = FrameRing::new([TrackedSlot::default(), TrackedSlot::default()]);
        let mut completed: Vec<u64> = Vec::new();
        let mut destroyed: Vec<(&str, Vec<u64>)> = Vec::new();

        for frame in 0..4u64 {
            ring.retire(|slot| {
                if let Some(previous) = slot.in_flight.take() {
                    completed.push(previous);
                }
                Ok(())
            })
            .unwrap();
            for name in ring.current_mut().pending.drain(..) {
                destroyed.push((name, completed.clone()));
            }

            ring.start_recording().unwrap();
            ring.mark_submitted().unwrap();
            ring.current_mut().in_flight = Some(frame);
            ring.advance();

            // Frame 0 was the last to use the texture
            if frame == 0 {
                ring.latest_mut().pending.push("texture");
            }
        }

        assert_eq!(destroyed.len(), 1);
        let (name, completed_at_destroy) = &destroyed[0];
        assert_eq!(*name, "texture");
        assert!(completed_at_destroy.contains(&0));
    }

    #[test]
    fn latest_slot_is_current_while_recording() {
        let mut ring = FrameRing::new([0u32, 1]);
        ring.advance();
        assert_eq!(*ring.latest_mut(), 0);

        ring.start_recording().unwrap();
        assert_eq!(*ring.latest_mut(), 1);
    }

    #[test]
    fn shutdown_flush_drains_every_queue_once() {
        let mut ring = FrameRing::new([DeletionQueue::new(), DeletionQueue::new()]);
        let mut global = DeletionQueue::new();
        global.defer("pool");
        global.defer("layout");

        ring.current_mut().defer("a1");
        ring.current_mut().defer("a2");
        ring.advance();
        ring.current_mut().defer("b1");
        ring.advance();
        ring.current_mut().defer("a3");
        ring.advance();

        let mut order = Vec::new();
        ring.for_each_oldest_first(|queue| queue.flush(|name| order.push(name)));
        global.flush(|name| order.push(name));

        assert_eq!(order, vec!["b1", "a3", "a2", "a1", "layout", "pool"]);

        let mut queues_empty = true;
        ring.for_each_oldest_first(|queue| queues_empty &= queue.is_empty());
        assert!(queues_empty);
        assert!(global.is_empty());

        let mut calls = 0;
        ring.for_each_oldest_first(|queue| queue.flush(|_| calls += 1));
        global.flush(|_| calls += 1);
        assert_eq!(calls, 0);
    }

    #[test]
    fn slots_cycle_modulo_frames_in_flight() {
        let mut ring = FrameRing::new([0u32, 1]);
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(*ring.current());
            ring.advance();
        }
        assert_eq!(seen, vec![0, 1, 0, 1, 0]);
        assert_eq!(ring.frame_number(), 5);
    }

    #[test]
    fn slot_is_not_reused_before_its_previous_frame_completes() {
        let mut ring = FrameRing::new([FakeSlot::default(), FakeSlot::default()]);
        let mut completed: Vec<u64> = Vec::new();

        for frame in 0..8u64 {
            ring.retire(|slot| {
                // Fence wait: the GPU finishes whatever this slot carried
                if let Some(previous) = slot.in_flight.take() {
                    completed.push(previous);
                }
                Ok(())
            })
            .unwrap();

            // Frame i + N may only start once frame i is complete
            if frame >= FRAMES_IN_FLIGHT as u64 {
                assert!(completed.contains(&(frame - FRAMES_IN_FLIGHT as u64)));
            }
            assert!(ring.current().in_flight.is_none());

            ring.start_recording().unwrap();
            ring.mark_submitted().unwrap();
            ring.current_mut().in_flight = Some(frame);
            ring.advance();
        }

        assert_eq!(completed, (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn fresh_slots_do_not_wait() {
        let mut ring = FrameRing::new([(), ()]);
        let mut waits = 0;
        for _ in 0..FRAMES_IN_FLIGHT {
            ring.retire(|_| {
                waits += 1;
                Ok(())
            })
            .unwrap();
            ring.advance();
        }
        assert_eq!(waits, 0);
    }

    #[test]
    fn skipped_frame_leaves_slot_idle_and_counter_unchanged() {
        let mut ring = FrameRing::new([(), ()]);
        ring.retire(|_| Ok(())).unwrap();
        // Acquire reported out-of-date: nothing recorded, nothing advanced
        assert_eq!(ring.state(), SlotState::Idle);
        assert_eq!(ring.frame_number(), 0);

        ring.start_recording().unwrap();
        assert_eq!(ring.state(), SlotState::Recording);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut ring = FrameRing::new([(), ()]);
        assert!(ring.mark_submitted().is_err());

        ring.start_recording().unwrap();
        assert!(ring.start_recording().is_err());
        assert!(ring.retire(|_| Ok(())).is_err());

        ring.mark_submitted().unwrap();
        assert!(ring.start_recording().is_err());
        assert_eq!(ring.state(), SlotState::Submitted);
    }

    #[test]
    fn failed_wait_keeps_slot_submitted() {
        let mut ring = FrameRing::new([(), ()]);
        ring.start_recording().unwrap();
        ring.mark_submitted().unwrap();
        ring.advance();
        ring.advance();

        assert!(ring.retire(|_| anyhow::bail!("GPU hung")).is_err());
        assert_eq!(ring.state(), SlotState::Submitted);
    }
}
