// GPU memory allocation for images
//
// Wraps gpu-allocator so image creation is one call: create the image,
// allocate device-local memory for it, bind, and create a full view.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocationSizes, AllocatorDebugSettings, MemoryLocation};
use std::sync::Arc;

use super::GraphicsContext;

/// An image, its default view and the memory backing it.
#[derive(Debug)]
pub struct AllocatedImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Option<Allocation>,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
}

impl AllocatedImage {
    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.extent.width,
            height: self.extent.height,
        }
    }

    /// Destroy view and image without returning the memory.
    ///
    /// # Safety
    /// The image must no longer be in use by the GPU.
    pub(super) unsafe fn destroy_handles(&self, device: &ash::Device) {
        if self.view != vk::ImageView::null() {
            device.destroy_image_view(self.view, None);
        }
        if self.image != vk::Image::null() {
            device.destroy_image(self.image, None);
        }
    }
}

/// Aspect mask covering every plane of `format`.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Device memory allocator shared by everything that creates images.
pub struct ResourceAllocator {
    context: Arc<GraphicsContext>,
    allocator: Option<Allocator>,
}

impl ResourceAllocator {
    pub fn new(context: Arc<GraphicsContext>, log_leaks: bool) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: context.instance().clone(),
            device: context.device.clone(),
            physical_device: context.physical_device,
            debug_settings: AllocatorDebugSettings {
                log_leaks_on_shutdown: log_leaks,
                ..Default::default()
            },
            buffer_device_address: true,
            allocation_sizes: AllocationSizes::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        log::info!("GPU memory allocator ready");

        Ok(Self {
            context,
            allocator: Some(allocator),
        })
    }

    /// Create a 2D, single-mip, device-local image with a view over all of it.
    pub fn create_image(
        &mut self,
        name: &str,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        extent: vk::Extent3D,
    ) -> Result<AllocatedImage> {
        let allocator = self
            .allocator
            .as_mut()
            .context("Allocator used after shutdown")?;
        let device = &self.context.device;

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create image '{}'", name))?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e).with_context(|| format!("Failed to allocate memory for '{}'", name));
            }
        };

        let mut allocated = AllocatedImage {
            image,
            view: vk::ImageView::null(),
            allocation: Some(allocation),
            extent,
            format,
        };

        let bind = allocated.allocation.as_ref().map(|allocation| unsafe {
            device.bind_image_memory(image, allocation.memory(), allocation.offset())
        });
        if let Some(Err(e)) = bind {
            self.destroy_image(allocated);
            return Err(e).with_context(|| format!("Failed to bind memory for '{}'", name));
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_for_format(format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        match unsafe { device.create_image_view(&view_info, None) } {
            Ok(view) => allocated.view = view,
            Err(e) => {
                self.destroy_image(allocated);
                return Err(e).with_context(|| format!("Failed to create view for '{}'", name));
            }
        }

        log::debug!(
            "Created image '{}' {}x{} {:?}",
            name,
            extent.width,
            extent.height,
            format
        );

        Ok(allocated)
    }

    /// Destroy the image and return its memory.
    pub fn destroy_image(&mut self, mut image: AllocatedImage) {
        unsafe { image.destroy_handles(&self.context.device) };

        if let Some(allocation) = image.allocation.take() {
            match self.allocator.as_mut() {
                Some(allocator) => {
                    if let Err(e) = allocator.free(allocation) {
                        log::error!("Failed to free image memory: {}", e);
                    }
                }
                None => log::warn!("Image destroyed after allocator shutdown"),
            }
        }
    }

    /// Release the allocator. Must run after every allocation has been freed
    /// and before the device is destroyed. Safe to call twice.
    pub fn shutdown(&mut self) {
        if self.allocator.take().is_some() {
            log::info!("GPU memory allocator destroyed");
        }
    }
}

impl Drop for ResourceAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colour_formats_use_colour_aspect() {
        assert_eq!(
            aspect_for_format(vk::Format::R16G16B16A16_SFLOAT),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            aspect_for_format(vk::Format::B8G8R8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn depth_stencil_formats_cover_both_planes() {
        assert_eq!(aspect_for_format(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
