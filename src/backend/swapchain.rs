// Swapchain - Window presentation
//
// PresentChain: the presentable images (RAII, destroyed with their views)
// SwapchainStatus: dirty tracking for resize / vsync changes
// SwapchainManager: present chain + off-screen draw image, create/destroy/recreate

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::allocator::{AllocatedImage, ResourceAllocator};
use super::GraphicsContext;

/// Format of the off-screen image every frame renders into.
pub const DRAW_IMAGE_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

// =============================================================================
// SURFACE CHOICES
// =============================================================================

/// Prefer 8-bit UNORM BGRA/RGBA in sRGB-nonlinear space, else whatever comes first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    const PREFERRED: [vk::Format; 2] = [vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM];

    PREFERRED
        .iter()
        .find_map(|&wanted| {
            formats.iter().copied().find(|f| {
                f.format == wanted && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .or_else(|| formats.first().copied())
        .context("Surface reports no supported formats")
}

/// FIFO blocks on vblank and is always available. Without vsync prefer
/// MAILBOX (no tearing), then IMMEDIATE.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }

    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| modes.contains(mode))
        .unwrap_or_else(|| {
            log::warn!("No non-blocking present mode available, falling back to FIFO");
            vk::PresentModeKHR::FIFO
        })
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    // u32::MAX means the surface size is decided by the swapchain
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

// =============================================================================
// PRESENT CHAIN
// =============================================================================

/// Swapchain and one view per image. Dropping it destroys both.
pub struct PresentChain {
    loader: ash::khr::swapchain::Device,
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    context: Arc<GraphicsContext>,
}

impl PresentChain {
    pub fn new(context: Arc<GraphicsContext>, width: u32, height: u32, vsync: bool) -> Result<Self> {
        let surface_loader = context.surface_loader();
        let surface = context.surface();
        let physical_device = context.physical_device;

        let caps = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)
        }
        .context("Failed to query surface capabilities")?;
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)
        }
        .context("Failed to query surface formats")?;
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)
        }
        .context("Failed to query present modes")?;

        let surface_format = choose_surface_format(&formats)?;
        let present_mode = choose_present_mode(&present_modes, vsync);
        let extent = choose_extent(&caps, width, height);
        let image_count = choose_image_count(&caps);

        log::info!(
            "Creating swapchain: {}x{} {:?} {:?}",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode
        );

        let loader = ash::khr::swapchain::Device::new(context.instance(), &context.device);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        // From here on Drop cleans up whatever has been created
        let mut chain = Self {
            loader,
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            format: surface_format.format,
            extent,
            present_mode,
            context,
        };

        chain.images = unsafe { chain.loader.get_swapchain_images(swapchain) }
            .context("Failed to get swapchain images")?;

        for &image in &chain.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(chain.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe { chain.context.device.create_image_view(&view_info, None) }
                .context("Failed to create swapchain image view")?;
            chain.image_views.push(view);
        }

        log::info!("Created swapchain with {} images", chain.images.len());

        Ok(chain)
    }

    /// Acquire the next image, signaling `semaphore` when it is ready.
    ///
    /// Returns `None` when the chain is out of date and must be recreated.
    pub fn acquire_next_image(
        &self,
        semaphore: vk::Semaphore,
        timeout: Duration,
    ) -> Result<Option<(u32, bool)>> {
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, nanos, semaphore, vk::Fence::null())
        };

        match result {
            Ok((index, suboptimal)) => Ok(Some((index, suboptimal))),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(None),
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => {
                anyhow::bail!("Swapchain image not available within {:?}", timeout)
            }
            Err(e) => Err(e).context("vkAcquireNextImageKHR failed"),
        }
    }

    /// Present `image_index` once `wait_semaphore` signals.
    ///
    /// Returns true when the chain is stale and should be recreated.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e).context("vkQueuePresentKHR failed"),
        }
    }

    pub fn image(&self, index: u32) -> Result<(vk::Image, vk::ImageView)> {
        let i = index as usize;
        match (self.images.get(i), self.image_views.get(i)) {
            (Some(&image), Some(&view)) => Ok((image, view)),
            _ => anyhow::bail!("Swapchain image index {} out of range", index),
        }
    }
}

impl Drop for PresentChain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.context.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

// =============================================================================
// DIRTY TRACKING
// =============================================================================

/// What the next frame has to do before recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameGate {
    /// Window has no area; do not render this tick.
    Skip,
    /// Swapchain is stale; rebuild at this extent first.
    Recreate(vk::Extent2D),
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainStatus {
    dirty: bool,
    window_extent: vk::Extent2D,
    vsync: bool,
}

impl SwapchainStatus {
    pub fn new(width: u32, height: u32, vsync: bool) -> Self {
        Self {
            dirty: false,
            window_extent: vk::Extent2D { width, height },
            vsync,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn vsync(&self) -> bool {
        self.vsync
    }

    pub fn window_extent(&self) -> vk::Extent2D {
        self.window_extent
    }

    pub fn notify_resize(&mut self, width: u32, height: u32) {
        let extent = vk::Extent2D { width, height };
        if extent != self.window_extent {
            self.window_extent = extent;
            self.dirty = true;
        }
    }

    pub fn set_vsync(&mut self, vsync: bool) {
        if vsync != self.vsync {
            self.vsync = vsync;
            self.dirty = true;
        }
    }

    pub fn gate(&self) -> FrameGate {
        if self.window_extent.width == 0 || self.window_extent.height == 0 {
            FrameGate::Skip
        } else if self.dirty {
            FrameGate::Recreate(self.window_extent)
        } else {
            FrameGate::Ready
        }
    }

    /// Run the start-of-frame check. A stale chain is rebuilt through
    /// `recreate(extent, vsync)` exactly once and the flag cleared on success.
    ///
    /// Returns whether the frame may be recorded.
    pub fn resolve<F>(&mut self, recreate: F) -> Result<bool>
    where
        F: FnOnce(vk::Extent2D, bool) -> Result<()>,
    {
        match self.gate() {
            FrameGate::Skip => Ok(false),
            FrameGate::Ready => Ok(true),
            FrameGate::Recreate(extent) => {
                recreate(extent, self.vsync)?;
                self.dirty = false;
                Ok(true)
            }
        }
    }
}

// =============================================================================
// SWAPCHAIN MANAGER
// =============================================================================

/// Present chain plus the draw image frames render into.
pub struct SwapchainManager {
    context: Arc<GraphicsContext>,
    chain: Option<PresentChain>,
    draw_image: Option<AllocatedImage>,
    status: SwapchainStatus,
}

impl SwapchainManager {
    /// An empty manager; call `create` to build the chain.
    pub fn new(context: Arc<GraphicsContext>, width: u32, height: u32, vsync: bool) -> Self {
        Self {
            context,
            chain: None,
            draw_image: None,
            status: SwapchainStatus::new(width, height, vsync),
        }
    }

    /// Build the present chain and a draw image of the same extent.
    pub fn create(&mut self, allocator: &mut ResourceAllocator, width: u32, height: u32) -> Result<()> {
        build(
            &self.context,
            &mut self.chain,
            &mut self.draw_image,
            allocator,
            vk::Extent2D { width, height },
            self.status.vsync,
        )
    }

    /// Destroy the draw image, then the chain. Does nothing when already empty.
    pub fn destroy(&mut self, allocator: &mut ResourceAllocator) {
        teardown(&mut self.chain, &mut self.draw_image, allocator);
    }

    /// Wait for the GPU, then destroy and rebuild at the new size.
    ///
    /// Descriptors pointing at the old draw image are stale afterwards; the
    /// caller rebinds them.
    pub fn recreate(&mut self, allocator: &mut ResourceAllocator, width: u32, height: u32) -> Result<()> {
        log::info!("Recreating swapchain at {}x{}", width, height);
        self.context.wait_idle()?;
        self.destroy(allocator);
        self.create(allocator, width, height)
    }

    /// Start-of-frame check. Rebuilds a dirty chain and hands the new draw
    /// image to `on_recreated` before any command is recorded.
    ///
    /// Returns false when nothing should be rendered this tick.
    pub fn prepare_frame<F>(&mut self, allocator: &mut ResourceAllocator, on_recreated: F) -> Result<bool>
    where
        F: FnOnce(&AllocatedImage) -> Result<()>,
    {
        // Resolved on a copy so the rebuild can borrow self
        let mut status = self.status;
        let result = status.resolve(|extent, _| {
            self.recreate(allocator, extent.width, extent.height)?;
            on_recreated(self.draw_image()?)
        });
        self.status = status;
        result
    }

    pub fn mark_dirty(&mut self) {
        self.status.mark_dirty();
    }

    pub fn is_dirty(&self) -> bool {
        self.status.is_dirty()
    }

    pub fn notify_resize(&mut self, width: u32, height: u32) {
        self.status.notify_resize(width, height);
    }

    pub fn set_vsync(&mut self, vsync: bool) {
        self.status.set_vsync(vsync);
    }

    pub fn status(&self) -> &SwapchainStatus {
        &self.status
    }

    pub fn chain(&self) -> Result<&PresentChain> {
        self.chain.as_ref().context("Swapchain has not been created")
    }

    pub fn draw_image(&self) -> Result<&AllocatedImage> {
        self.draw_image.as_ref().context("Draw image has not been created")
    }
}

impl Drop for SwapchainManager {
    fn drop(&mut self) {
        if let Some(image) = self.draw_image.take() {
            log::warn!("Swapchain manager dropped without destroy; draw image memory returns with the allocator");
            unsafe { image.destroy_handles(&self.context.device) };
        }
    }
}

fn build(
    context: &Arc<GraphicsContext>,
    chain: &mut Option<PresentChain>,
    draw_image: &mut Option<AllocatedImage>,
    allocator: &mut ResourceAllocator,
    extent: vk::Extent2D,
    vsync: bool,
) -> Result<()> {
    let new_chain = PresentChain::new(Arc::clone(context), extent.width, extent.height, vsync)?;
    let chain_extent = new_chain.extent;
    *chain = Some(new_chain);

    let usage = vk::ImageUsageFlags::TRANSFER_SRC
        | vk::ImageUsageFlags::TRANSFER_DST
        | vk::ImageUsageFlags::STORAGE
        | vk::ImageUsageFlags::COLOR_ATTACHMENT;
    let image = allocator.create_image(
        "draw image",
        DRAW_IMAGE_FORMAT,
        usage,
        vk::Extent3D {
            width: chain_extent.width,
            height: chain_extent.height,
            depth: 1,
        },
    )?;
    *draw_image = Some(image);

    Ok(())
}

fn teardown(
    chain: &mut Option<PresentChain>,
    draw_image: &mut Option<AllocatedImage>,
    allocator: &mut ResourceAllocator,
) {
    if let Some(image) = draw_image.take() {
        allocator.destroy_image(image);
    }
    // PresentChain::drop destroys the swapchain and its views
    chain.take();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn bgra_unorm_is_preferred() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM),
            format(vk::Format::B8G8R8A8_UNORM),
        ];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::B8G8R8A8_UNORM
        );
    }

    #[test]
    fn unknown_formats_fall_back_to_first() {
        let formats = [format(vk::Format::A2B10G10R10_UNORM_PACK32)];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::A2B10G10R10_UNORM_PACK32
        );
        assert!(choose_surface_format(&[]).is_err());
    }

    #[test]
    fn vsync_selects_fifo() {
        let modes = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn no_vsync_prefers_mailbox_then_immediate() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(choose_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);

        let no_mailbox = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(choose_present_mode(&no_mailbox, false), vk::PresentModeKHR::IMMEDIATE);

        let fifo_only = [vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&fifo_only, false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_follows_surface_or_clamps_window_size() {
        assert_eq!(
            choose_extent(&caps((800, 600)), 1280, 720),
            vk::Extent2D { width: 800, height: 600 }
        );
        assert_eq!(
            choose_extent(&caps((u32::MAX, u32::MAX)), 9000, 720),
            vk::Extent2D { width: 4096, height: 720 }
        );
    }

    #[test]
    fn image_count_is_one_above_minimum_within_maximum() {
        assert_eq!(choose_image_count(&caps((1, 1))), 3);

        let mut tight = caps((1, 1));
        tight.max_image_count = 2;
        assert_eq!(choose_image_count(&tight), 2);

        let mut unbounded = caps((1, 1));
        unbounded.max_image_count = 0;
        assert_eq!(choose_image_count(&unbounded), 3);
    }

    #[test]
    fn resize_marks_dirty_and_next_frame_recreates_once() {
        let mut status = SwapchainStatus::new(1280, 720, true);
        assert!(!status.is_dirty());

        status.notify_resize(640, 480);
        assert!(status.is_dirty());

        let mut rebuilt = Vec::new();
        let proceed = status
            .resolve(|extent, _| {
                rebuilt.push(extent);
                Ok(())
            })
            .unwrap();

        assert!(proceed);
        assert_eq!(rebuilt, vec![vk::Extent2D { width: 640, height: 480 }]);
        assert!(!status.is_dirty());

        // Clean chain: no further rebuilds
        let mut calls = 0;
        status
            .resolve(|_, _| {
                calls += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(calls, 0);
    }

    #[test]
    fn failed_recreate_stays_dirty() {
        let mut status = SwapchainStatus::new(1280, 720, true);
        status.mark_dirty();
        assert!(status.resolve(|_, _| anyhow::bail!("no surface")).is_err());
        assert!(status.is_dirty());
    }

    #[test]
    fn zero_sized_window_skips_without_recreating() {
        let mut status = SwapchainStatus::new(1280, 720, true);
        status.notify_resize(0, 720);
        assert_eq!(status.gate(), FrameGate::Skip);

        let proceed = status.resolve(|_, _| anyhow::bail!("must not rebuild")).unwrap();
        assert!(!proceed);
        assert!(status.is_dirty());

        status.notify_resize(1024, 768);
        assert_eq!(
            status.gate(),
            FrameGate::Recreate(vk::Extent2D { width: 1024, height: 768 })
        );
    }

    #[test]
    fn vsync_change_marks_dirty_only_when_changed() {
        let mut status = SwapchainStatus::new(1280, 720, true);
        status.set_vsync(true);
        assert!(!status.is_dirty());

        status.set_vsync(false);
        assert!(status.is_dirty());
        assert!(!status.vsync());

        let mut seen_vsync = None;
        status
            .resolve(|_, vsync| {
                seen_vsync = Some(vsync);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen_vsync, Some(false));
    }

    #[test]
    fn same_size_resize_is_not_dirty() {
        let mut status = SwapchainStatus::new(1280, 720, true);
        status.notify_resize(1280, 720);
        assert!(!status.is_dirty());
    }
}
