// Image layout transitions and copies (synchronization2)

use ash::vk;

pub fn full_subresource_range(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: vk::REMAINING_MIP_LEVELS,
        base_array_layer: 0,
        layer_count: vk::REMAINING_ARRAY_LAYERS,
    }
}

fn aspect_for_layout(layout: vk::ImageLayout) -> vk::ImageAspectFlags {
    if layout == vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Move `image` from `old_layout` to `new_layout`, ordering it after all
/// prior work and before all later work.
pub fn transition_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let barrier = vk::ImageMemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .dst_access_mask(vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .subresource_range(full_subresource_range(aspect_for_layout(new_layout)))
        .image(image);

    let barriers = [barrier];
    let dependency_info = vk::DependencyInfo::default().image_memory_barriers(&barriers);

    unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };
}

fn corner(extent: vk::Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    }
}

/// Scaled copy of the whole of `src` (TRANSFER_SRC) onto the whole of `dst`
/// (TRANSFER_DST) with linear filtering.
pub fn blit_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src: vk::Image,
    dst: vk::Image,
    src_extent: vk::Extent2D,
    dst_extent: vk::Extent2D,
) {
    let layers = vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    };

    let region = vk::ImageBlit2::default()
        .src_offsets([vk::Offset3D::default(), corner(src_extent)])
        .dst_offsets([vk::Offset3D::default(), corner(dst_extent)])
        .src_subresource(layers)
        .dst_subresource(layers);
    let regions = [region];

    let blit_info = vk::BlitImageInfo2::default()
        .src_image(src)
        .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        .dst_image(dst)
        .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .filter(vk::Filter::LINEAR)
        .regions(&regions);

    unsafe { device.cmd_blit_image2(cmd, &blit_info) };
}

/// Clear a color image in GENERAL or TRANSFER_DST layout.
pub fn clear_color_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    layout: vk::ImageLayout,
    color: [f32; 4],
) {
    let clear = vk::ClearColorValue { float32: color };
    let ranges = [full_subresource_range(vk::ImageAspectFlags::COLOR)];
    unsafe { device.cmd_clear_color_image(cmd, image, layout, &clear, &ranges) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_layouts_use_depth_aspect() {
        assert_eq!(
            aspect_for_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_for_layout(vk::ImageLayout::GENERAL),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn blit_corner_spans_the_extent() {
        let offset = corner(vk::Extent2D { width: 640, height: 480 });
        assert_eq!((offset.x, offset.y, offset.z), (640, 480, 1));
    }
}
