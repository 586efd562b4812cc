// =============================================================================
// RENDERER - Owns the GPU context and drives one frame at a time
// =============================================================================
//
// FRAME FLOW:
// 1. Recreate swapchain + draw image if dirty (resize / vsync change)
// 2. Wait for this slot's fence, flush its deletion queue, acquire an image
// 3. Compute gradient into the draw image
// 4. Blit draw image -> swapchain image, run overlay, transition to present
// 5. Submit, present, advance
//
// SHUTDOWN: wait idle -> flush deletion queues -> swapchain -> allocator -> device

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

use crate::backend::barrier;
use crate::backend::pipeline::GradientPush;
use crate::backend::{
    AllocatedImage, ContextDesc, DeletionQueue, DescriptorTable, FrameScheduler, GpuResource,
    GradientPipeline, GraphicsContext, ImmediateExecutor, ResourceAllocator, SwapchainManager,
};
use crate::config::Config;

/// The acquired presentable image, handed to overlays in
/// COLOR_ATTACHMENT_OPTIMAL layout.
#[derive(Debug, Clone, Copy)]
pub struct OverlayTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

/// Extra draw commands recorded on top of the frame before present.
pub trait OverlayPass {
    fn record(&mut self, device: &ash::Device, cmd: vk::CommandBuffer, target: &OverlayTarget);
}

pub struct Renderer {
    overlay: Option<Box<dyn OverlayPass>>,
    gradient: Option<GradientPipeline>,
    descriptors: Option<DescriptorTable>,
    immediate: Option<ImmediateExecutor>,
    frames: Option<FrameScheduler>,
    swapchain: Option<SwapchainManager>,
    /// Objects living as long as the renderer, destroyed at shutdown
    global_deletion: DeletionQueue<GpuResource>,
    allocator: Option<ResourceAllocator>,
    context: Option<Arc<GraphicsContext>>,

    gradient_push: GradientPush,
    clear_color: [f32; 4],
}

impl Renderer {
    fn unconnected(config: &Config) -> Self {
        let graphics = &config.graphics;
        Self {
            overlay: None,
            gradient: None,
            descriptors: None,
            immediate: None,
            frames: None,
            swapchain: None,
            global_deletion: DeletionQueue::new(),
            allocator: None,
            context: None,
            gradient_push: GradientPush::new(graphics.gradient_top, graphics.gradient_bottom),
            clear_color: graphics.clear_color,
        }
    }

    /// Bring up everything needed to render into `window`.
    ///
    /// On failure whatever was already created is torn down before the error
    /// is returned.
    pub fn new<W>(window: &W, width: u32, height: u32, config: &Config) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let mut renderer = Self::unconnected(config);
        renderer.init(window, width, height, config)?;
        Ok(renderer)
    }

    fn init<W>(&mut self, window: &W, width: u32, height: u32, config: &Config) -> Result<()>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        log::info!("Initializing renderer...");

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Context + allocator
        // ─────────────────────────────────────────────────────────────────────
        let context = GraphicsContext::new(
            window,
            &ContextDesc {
                app_name: &config.window.title,
                app_version: vk::make_api_version(0, 0, 1, 0),
                enable_validation: config.debug.validation_layers,
                fatal_validation_errors: config.debug.fatal_validation_errors,
                gpu_override: config.graphics.gpu_override,
            },
        )?;
        self.context = Some(Arc::clone(&context));

        let allocator = self
            .allocator
            .insert(ResourceAllocator::new(Arc::clone(&context), cfg!(debug_assertions))?);

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Swapchain + draw image
        // ─────────────────────────────────────────────────────────────────────
        let swapchain = self.swapchain.insert(SwapchainManager::new(
            Arc::clone(&context),
            width,
            height,
            config.window.vsync,
        ));
        if width > 0 && height > 0 {
            swapchain.create(allocator, width, height)?;
        } else {
            // Built on the first frame with a real size
            swapchain.mark_dirty();
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Frame ring + immediate submission
        // ─────────────────────────────────────────────────────────────────────
        let graphics = &config.graphics;
        self.frames = Some(FrameScheduler::new(
            Arc::clone(&context),
            &mut self.global_deletion,
            graphics.frame_timeout(),
        )?);
        let immediate = self.immediate.insert(ImmediateExecutor::new(
            Arc::clone(&context),
            &mut self.global_deletion,
            graphics.immediate_timeout(),
        )?);

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Descriptors + gradient pipeline
        // ─────────────────────────────────────────────────────────────────────
        let device = &context.device;
        let descriptors = self
            .descriptors
            .insert(DescriptorTable::new(device, &mut self.global_deletion)?);
        self.gradient = Some(GradientPipeline::new(
            device,
            &graphics.gradient_shader,
            descriptors.draw_image_layout,
            &mut self.global_deletion,
        )?);

        if let Ok(image) = swapchain.draw_image() {
            prime_draw_image(device, immediate, descriptors, image, self.clear_color)?;
        }

        log::info!("Renderer initialized");
        Ok(())
    }

    /// Render and present one frame.
    ///
    /// Returns false when nothing was presented (window has no area, or the
    /// swapchain went stale during acquire). Errors are fatal.
    pub fn render(&mut self) -> Result<bool> {
        let Self {
            context: Some(context),
            allocator: Some(allocator),
            swapchain: Some(swapchain),
            frames: Some(frames),
            immediate: Some(immediate),
            descriptors: Some(descriptors),
            gradient: Some(gradient),
            overlay,
            gradient_push,
            clear_color,
            ..
        } = self
        else {
            anyhow::bail!("Renderer used after shutdown");
        };
        let device = &context.device;
        let clear_color = *clear_color;

        // Stale chain is rebuilt here, before any command is recorded
        let proceed = swapchain.prepare_frame(allocator, |image| {
            prime_draw_image(device, immediate, descriptors, image, clear_color)
        })?;
        if !proceed {
            return Ok(false);
        }

        let Some(frame) = frames.begin_frame(swapchain, allocator)? else {
            return Ok(false);
        };
        let cmd = frame.command_buffer;

        let draw = swapchain.draw_image()?;
        let draw_image = draw.image;
        let draw_extent = draw.extent_2d();

        // Draw image lives in GENERAL between frames
        gradient.record(
            device,
            cmd,
            descriptors.draw_image_set,
            gradient_push,
            draw_extent,
        );

        barrier::transition_image(
            device,
            cmd,
            draw_image,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        barrier::transition_image(
            device,
            cmd,
            frame.swapchain_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        barrier::blit_image(
            device,
            cmd,
            draw_image,
            frame.swapchain_image,
            draw_extent,
            frame.swapchain_extent,
        );

        match overlay.as_mut() {
            Some(overlay) => {
                barrier::transition_image(
                    device,
                    cmd,
                    frame.swapchain_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                );
                let target = OverlayTarget {
                    image: frame.swapchain_image,
                    view: frame.swapchain_view,
                    extent: frame.swapchain_extent,
                    format: frame.swapchain_format,
                };
                overlay.record(device, cmd, &target);
                barrier::transition_image(
                    device,
                    cmd,
                    frame.swapchain_image,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                );
            }
            None => barrier::transition_image(
                device,
                cmd,
                frame.swapchain_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            ),
        }

        barrier::transition_image(
            device,
            cmd,
            draw_image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::GENERAL,
        );

        frames.end_frame(&frame)?;
        frames.present(frame, swapchain)?;

        Ok(true)
    }

    /// Window client area changed.
    pub fn notify_resize(&mut self, width: u32, height: u32) {
        if let Some(swapchain) = self.swapchain.as_mut() {
            swapchain.notify_resize(width, height);
        }
    }

    /// Change vsync; takes effect when the swapchain is rebuilt next frame.
    pub fn set_vsync(&mut self, vsync: bool) {
        if let Some(swapchain) = self.swapchain.as_mut() {
            swapchain.set_vsync(vsync);
        }
    }

    pub fn vsync(&self) -> bool {
        self.swapchain
            .as_ref()
            .map_or(false, |swapchain| swapchain.status().vsync())
    }

    pub fn set_overlay(&mut self, overlay: Box<dyn OverlayPass>) {
        self.overlay = Some(overlay);
    }

    /// Names of all enumerated GPUs, for a device picker.
    pub fn device_names(&self) -> &[String] {
        match self.context.as_deref() {
            Some(context) => context.device_names(),
            None => &[],
        }
    }

    pub fn selected_device_index(&self) -> Option<usize> {
        self.context.as_ref().map(|context| context.selected_device_index())
    }

    pub fn validation_error_count(&self) -> u32 {
        self.context
            .as_ref()
            .map_or(0, |context| context.validation_error_count())
    }

    pub fn frame_number(&self) -> u64 {
        self.frames.as_ref().map_or(0, |frames| frames.frame_number())
    }

    /// Run blocking one-off GPU work. Not for the per-frame path.
    pub fn immediate_submit<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        self.immediate
            .as_ref()
            .context("Renderer used after shutdown")?
            .submit(record)
    }

    /// Destroy `resource` once every frame recorded so far has finished on the GPU.
    pub fn defer_destroy(&mut self, resource: GpuResource) {
        match self.frames.as_mut() {
            Some(frames) => frames.defer(resource),
            None => self.global_deletion.defer(resource),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.context.is_none()
    }

    /// Wait for the GPU, then release everything in reverse creation order.
    /// Calling it again does nothing.
    pub fn shutdown(&mut self) {
        let Some(context) = self.context.take() else {
            return;
        };
        log::info!("Shutting down renderer...");

        // Unbounded: whatever is outstanding must finish
        if let Err(e) = context.wait_idle() {
            log::error!("Device wait before shutdown failed: {:#}", e);
        }

        if let Some(frames) = self.frames.as_mut() {
            frames.flush_all(self.allocator.as_mut());
        }
        self.global_deletion
            .flush_gpu(&context.device, self.allocator.as_mut());

        if let (Some(swapchain), Some(allocator)) = (self.swapchain.as_mut(), self.allocator.as_mut()) {
            swapchain.destroy(allocator);
        }

        self.overlay = None;
        self.gradient = None;
        self.descriptors = None;
        self.immediate = None;
        self.frames = None;
        self.swapchain = None;
        if let Some(mut allocator) = self.allocator.take() {
            allocator.shutdown();
        }

        if Arc::strong_count(&context) > 1 {
            log::warn!("Graphics context still referenced at shutdown");
        }
        drop(context);

        log::info!("Renderer shut down");
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Point the descriptor at a fresh draw image and clear it, leaving it in GENERAL.
fn prime_draw_image(
    device: &ash::Device,
    immediate: &ImmediateExecutor,
    descriptors: &DescriptorTable,
    image: &AllocatedImage,
    clear_color: [f32; 4],
) -> Result<()> {
    descriptors.bind_draw_image(device, image.view);

    let handle = image.image;
    immediate
        .submit(|device, cmd| {
            barrier::transition_image(
                device,
                cmd,
                handle,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
            );
            barrier::clear_color_image(device, cmd, handle, vk::ImageLayout::GENERAL, clear_color);
        })
        .context("Failed to prime draw image")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_is_idempotent() {
        let mut renderer = Renderer::unconnected(&Config::default());
        renderer.shutdown();
        renderer.shutdown();

        assert!(renderer.is_shut_down());
        assert!(renderer.global_deletion.is_empty());
    }

    #[test]
    fn unconnected_renderer_refuses_to_render() {
        let mut renderer = Renderer::unconnected(&Config::default());
        assert!(renderer.render().is_err());
        assert!(renderer.immediate_submit(|_, _| {}).is_err());
        assert!(renderer.device_names().is_empty());
        assert_eq!(renderer.selected_device_index(), None);
    }

    #[test]
    fn gradient_colors_come_from_config() {
        let mut config = Config::default();
        config.graphics.gradient_top = [0.5, 0.5, 0.5, 1.0];
        let renderer = Renderer::unconnected(&config);
        assert_eq!(renderer.gradient_push.top.to_array(), [0.5, 0.5, 0.5, 1.0]);
    }
}
