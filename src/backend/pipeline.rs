// Compute pipeline for the background gradient
//
// The shader writes the draw image through a storage-image descriptor; the
// two colors arrive as push constants.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec4;
use std::path::Path;

use super::deletion::{DeletionQueue, GpuResource};
use super::shader;

/// Workgroup size declared in gradient.comp.
pub const WORKGROUP_SIZE: u32 = 16;

/// Push constant block, laid out as in the shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GradientPush {
    pub top: Vec4,
    pub bottom: Vec4,
}

impl GradientPush {
    pub fn new(top: [f32; 4], bottom: [f32; 4]) -> Self {
        Self {
            top: Vec4::from_array(top),
            bottom: Vec4::from_array(bottom),
        }
    }
}

/// Workgroups needed to cover `extent`, rounding up.
pub fn dispatch_groups(extent: vk::Extent2D) -> (u32, u32) {
    (
        extent.width.div_ceil(WORKGROUP_SIZE),
        extent.height.div_ceil(WORKGROUP_SIZE),
    )
}

pub struct GradientPipeline {
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
}

impl GradientPipeline {
    /// Build the pipeline from the SPIR-V at `shader_path`. Layout and
    /// pipeline are registered in `global`; the shader module is destroyed
    /// once the pipeline exists.
    pub fn new(
        device: &ash::Device,
        shader_path: &Path,
        set_layout: vk::DescriptorSetLayout,
        global: &mut DeletionQueue<GpuResource>,
    ) -> Result<Self> {
        let push_constant_ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(std::mem::size_of::<GradientPush>() as u32)];
        let set_layouts = [set_layout];

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);

        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create gradient pipeline layout")?;
        global.defer(GpuResource::PipelineLayout(layout));

        let module = shader::load_shader_module(device, shader_path)?;

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(c"main");

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .layout(layout)
            .stage(stage);

        let result = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        unsafe { device.destroy_shader_module(module, None) };

        let pipeline = result
            .map_err(|(_, e)| e)
            .context("Failed to create gradient pipeline")?
            .into_iter()
            .next()
            .context("Driver returned no pipeline")?;
        global.defer(GpuResource::Pipeline(pipeline));

        log::info!("Gradient pipeline ready ({:?})", shader_path);

        Ok(Self { layout, pipeline })
    }

    /// Record the gradient into the draw image, which must be in GENERAL.
    pub fn record(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        descriptor_set: vk::DescriptorSet,
        push: &GradientPush,
        extent: vk::Extent2D,
    ) {
        let (groups_x, groups_y) = dispatch_groups(extent);

        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.layout,
                0,
                &[descriptor_set],
                &[],
            );
            device.cmd_push_constants(
                cmd,
                self.layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(push),
            );
            device.cmd_dispatch(cmd, groups_x, groups_y, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_rounds_partial_tiles_up() {
        assert_eq!(
            dispatch_groups(vk::Extent2D { width: 1280, height: 720 }),
            (80, 45)
        );
        assert_eq!(
            dispatch_groups(vk::Extent2D { width: 641, height: 1 }),
            (41, 1)
        );
    }

    #[test]
    fn push_block_matches_shader_layout() {
        assert_eq!(std::mem::size_of::<GradientPush>(), 32);

        let push = GradientPush::new([1.0, 0.0, 0.0, 1.0], [0.0, 0.0, 1.0, 1.0]);
        let floats: &[f32] = bytemuck::cast_slice(bytemuck::bytes_of(&push));
        assert_eq!(floats, &[1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0]);
    }
}
