// Synchronization primitives
//
// Semaphores for acquire/present, the recorder fence, and image layout
// transitions.

use anyhow::{Context, Result};
use ash::vk;

/// Per swap chain presentation sync: one acquire semaphore, plus one
/// render-finished semaphore per image so a semaphore is only reused once
/// its image comes back.
pub struct PresentSync {
    pub image_available: vk::Semaphore,
    pub render_finished: Vec<vk::Semaphore>,
}

impl PresentSync {
    pub fn new(device: &ash::Device, image_count: usize) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();

        let mut sync = Self {
            image_available: vk::Semaphore::null(),
            render_finished: Vec::with_capacity(image_count),
        };
        let created = (|| -> Result<()> {
            sync.image_available = unsafe { device.create_semaphore(&semaphore_info, None) }?;
            for _ in 0..image_count {
                sync.render_finished
                    .push(unsafe { device.create_semaphore(&semaphore_info, None) }?);
            }
            Ok(())
        })();

        if let Err(e) = created {
            sync.destroy(device);
            return Err(e.context("Failed to create presentation semaphores"));
        }
        Ok(sync)
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            if self.image_available != vk::Semaphore::null() {
                device.destroy_semaphore(self.image_available, None);
            }
            for semaphore in self.render_finished.drain(..) {
                device.destroy_semaphore(semaphore, None);
            }
        }
        self.image_available = vk::Semaphore::null();
    }
}

/// Fence created signaled, so the first wait returns at once
pub fn create_signaled_fence(device: &ash::Device) -> Result<vk::Fence> {
    let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
    unsafe { device.create_fence(&fence_info, None) }.context("Failed to create fence")
}

fn layout_scope(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
            (vk::AccessFlags::SHADER_READ, vk::PipelineStageFlags::FRAGMENT_SHADER)
        }
        // UNDEFINED, PRESENT_SRC_KHR: ordered by the acquire/present semaphores
        _ => (vk::AccessFlags::empty(), vk::PipelineStageFlags::ALL_COMMANDS),
    }
}

/// Record a full-image color layout transition.
pub fn transition_image(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let (src_access, src_stage) = layout_scope(old_layout);
    let (dst_access, dst_stage) = layout_scope(new_layout);

    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_range())
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// Every mip and layer of a color image
pub fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: vk::REMAINING_MIP_LEVELS,
        base_array_layer: 0,
        layer_count: vk::REMAINING_ARRAY_LAYERS,
    }
}
