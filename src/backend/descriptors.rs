// Descriptor sets - shader-visible resource bindings
//
// Layout builder, a ratio-sized pool allocator, and the table holding the
// draw image's storage binding for the compute pass.

use anyhow::{Context, Result};
use ash::vk;

use super::deletion::{DeletionQueue, GpuResource};

#[derive(Default)]
pub struct DescriptorLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
}

impl DescriptorLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_binding(mut self, binding: u32, ty: vk::DescriptorType) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(ty)
                .descriptor_count(1),
        );
        self
    }

    /// Create the layout with every binding visible to `stages`.
    pub fn build(
        mut self,
        device: &ash::Device,
        stages: vk::ShaderStageFlags,
    ) -> Result<vk::DescriptorSetLayout> {
        for binding in &mut self.bindings {
            binding.stage_flags |= stages;
        }

        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);
        unsafe { device.create_descriptor_set_layout(&info, None) }
            .context("Failed to create descriptor set layout")
    }
}

/// Descriptors of one type per set the pool should hold.
#[derive(Debug, Clone, Copy)]
pub struct PoolSizeRatio {
    pub ty: vk::DescriptorType,
    pub ratio: f32,
}

/// Pool sizes for `max_sets` sets. Every listed type gets at least one descriptor.
pub fn pool_sizes(max_sets: u32, ratios: &[PoolSizeRatio]) -> Vec<vk::DescriptorPoolSize> {
    ratios
        .iter()
        .map(|r| vk::DescriptorPoolSize {
            ty: r.ty,
            descriptor_count: ((r.ratio * max_sets as f32) as u32).max(1),
        })
        .collect()
}

/// A single descriptor pool handing out sets.
pub struct DescriptorAllocator {
    pub pool: vk::DescriptorPool,
}

impl DescriptorAllocator {
    pub fn allocate_pool(
        device: &ash::Device,
        max_sets: u32,
        ratios: &[PoolSizeRatio],
    ) -> Result<Self> {
        let sizes = pool_sizes(max_sets, ratios);
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(&sizes);

        let pool = unsafe { device.create_descriptor_pool(&info, None) }
            .context("Failed to create descriptor pool")?;
        Ok(Self { pool })
    }

    pub fn allocate_set(
        &self,
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let sets = unsafe { device.allocate_descriptor_sets(&info) }
            .context("Failed to allocate descriptor set")?;
        sets.into_iter().next().context("Driver returned no descriptor set")
    }
}

/// Point `binding` of `set` at an image view. Reissue whenever the view is replaced.
pub fn write_image_binding(
    device: &ash::Device,
    set: vk::DescriptorSet,
    binding: u32,
    view: vk::ImageView,
    layout: vk::ImageLayout,
    ty: vk::DescriptorType,
) {
    let image_info = [vk::DescriptorImageInfo::default()
        .image_view(view)
        .image_layout(layout)];

    let write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .descriptor_type(ty)
        .image_info(&image_info);

    unsafe { device.update_descriptor_sets(&[write], &[]) };
}

/// Descriptor state for the draw image: one storage-image binding read and
/// written by compute shaders.
pub struct DescriptorTable {
    pub allocator: DescriptorAllocator,
    pub draw_image_layout: vk::DescriptorSetLayout,
    pub draw_image_set: vk::DescriptorSet,
}

impl DescriptorTable {
    pub const DRAW_IMAGE_BINDING: u32 = 0;
    const MAX_SETS: u32 = 10;

    /// Pool and layout are registered in `global` as soon as they exist.
    pub fn new(device: &ash::Device, global: &mut DeletionQueue<GpuResource>) -> Result<Self> {
        let ratios = [PoolSizeRatio {
            ty: vk::DescriptorType::STORAGE_IMAGE,
            ratio: 1.0,
        }];
        let allocator = DescriptorAllocator::allocate_pool(device, Self::MAX_SETS, &ratios)?;
        global.defer(GpuResource::DescriptorPool(allocator.pool));

        let draw_image_layout = DescriptorLayoutBuilder::new()
            .add_binding(Self::DRAW_IMAGE_BINDING, vk::DescriptorType::STORAGE_IMAGE)
            .build(device, vk::ShaderStageFlags::COMPUTE)?;
        global.defer(GpuResource::DescriptorSetLayout(draw_image_layout));

        let draw_image_set = allocator.allocate_set(device, draw_image_layout)?;

        Ok(Self {
            allocator,
            draw_image_layout,
            draw_image_set,
        })
    }

    /// Rebind the draw image view, e.g. after swapchain recreation.
    pub fn bind_draw_image(&self, device: &ash::Device, view: vk::ImageView) {
        write_image_binding(
            device,
            self.draw_image_set,
            Self::DRAW_IMAGE_BINDING,
            view,
            vk::ImageLayout::GENERAL,
            vk::DescriptorType::STORAGE_IMAGE,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_sizes_scale_with_set_count() {
        let ratios = [
            PoolSizeRatio {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                ratio: 1.0,
            },
            PoolSizeRatio {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                ratio: 2.5,
            },
        ];
        let sizes = pool_sizes(10, &ratios);

        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::STORAGE_IMAGE);
        assert_eq!(sizes[0].descriptor_count, 10);
        assert_eq!(sizes[1].descriptor_count, 25);
    }

    #[test]
    fn tiny_ratios_still_reserve_one_descriptor() {
        let ratios = [PoolSizeRatio {
            ty: vk::DescriptorType::SAMPLER,
            ratio: 0.01,
        }];
        assert_eq!(pool_sizes(4, &ratios)[0].descriptor_count, 1);
    }

    #[test]
    fn builder_collects_bindings_in_order() {
        let builder = DescriptorLayoutBuilder::new()
            .add_binding(0, vk::DescriptorType::STORAGE_IMAGE)
            .add_binding(1, vk::DescriptorType::UNIFORM_BUFFER);

        let bindings: Vec<_> = builder.bindings.iter().map(|b| (b.binding, b.descriptor_type)).collect();
        assert_eq!(
            bindings,
            vec![
                (0, vk::DescriptorType::STORAGE_IMAGE),
                (1, vk::DescriptorType::UNIFORM_BUFFER)
            ]
        );
        assert!(builder.bindings.iter().all(|b| b.descriptor_count == 1));
    }
}
