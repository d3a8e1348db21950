// Textures and render target views
//
// A texture is either an image this backend allocated or an alias for the
// current image of a swap chain. Render target views cover every image the
// texture can resolve to; the command recorder picks one at record time.

use anyhow::{Context, Result};
use ash::vk;
use ash::vk::Handle;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use super::buffer::BufferResource;
use super::convert;
use super::swapchain::SwapChainImages;
use super::sync::{color_range, transition_image};
use super::VulkanDevice;
use crate::rhi::{BufferUsage, NativeResource, TextureDesc};

pub enum ImageSource {
    Owned {
        image: vk::Image,
        allocation: Option<Allocation>,
        layout: Cell<vk::ImageLayout>,
    },
    SwapChain(Rc<SwapChainImages>),
}

pub struct ImageResource {
    pub id: u64,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub source: ImageSource,
    device: Arc<VulkanDevice>,
}

impl ImageResource {
    pub fn create(
        device: &Arc<VulkanDevice>,
        desc: &TextureDesc,
        initial_data: Option<&[u8]>,
    ) -> Result<Self> {
        let format = convert::format(desc.format);
        let extent = vk::Extent2D {
            width: desc.width,
            height: desc.height,
        };

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_size)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(convert::image_usage(desc.bind_flags))
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .context("Failed to create image")?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = device
            .allocator
            .lock()
            .as_mut()
            .context("Allocator already destroyed")
            .and_then(|allocator| {
                allocator
                    .allocate(&AllocationCreateDesc {
                        name: "texture",
                        requirements,
                        location: gpu_allocator::MemoryLocation::GpuOnly,
                        linear: false,
                        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                    })
                    .context("Failed to allocate image memory")
            });

        // From here on Drop owns the cleanup
        let mut resource = Self {
            id: device.next_object_id(),
            format,
            extent,
            source: ImageSource::Owned {
                image,
                allocation: None,
                layout: Cell::new(vk::ImageLayout::UNDEFINED),
            },
            device: device.clone(),
        };
        let allocation = allocation?;
        unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }
        .context("Failed to bind image memory")?;

        if let ImageSource::Owned { allocation: slot, .. } = &mut resource.source {
            *slot = Some(allocation);
        }

        if let Some(data) = initial_data {
            resource.upload(data)?;
        }
        Ok(resource)
    }

    /// Copy `data` into mip 0, layer 0 and leave the image shader-readable.
    fn upload(&self, data: &[u8]) -> Result<()> {
        let ImageSource::Owned { image, layout, .. } = &self.source else {
            anyhow::bail!("Swap chain images cannot be uploaded to");
        };
        let staging = BufferResource::create(
            &self.device,
            data.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            BufferUsage::Staging,
            "texture staging",
        )?;
        staging.write(data)?;

        let device = &self.device.device;
        let image = *image;
        let extent = self.extent;
        self.device.one_time_submit(|cb| {
            transition_image(
                device,
                cb,
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            let region = vk::BufferImageCopy::builder()
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                })
                .build();
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cb,
                    staging.buffer,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            transition_image(
                device,
                cb,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        })?;

        layout.set(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        Ok(())
    }

    pub fn from_swap_chain(device: &Arc<VulkanDevice>, images: Rc<SwapChainImages>) -> Self {
        Self {
            id: device.next_object_id(),
            format: images.format,
            extent: images.extent,
            source: ImageSource::SwapChain(images),
            device: device.clone(),
        }
    }

    /// Number of distinct images this resource can resolve to
    pub fn image_count(&self) -> usize {
        match &self.source {
            ImageSource::Owned { .. } => 1,
            ImageSource::SwapChain(images) => images.images.len(),
        }
    }

    pub fn image(&self, index: usize) -> vk::Image {
        match &self.source {
            ImageSource::Owned { image, .. } => *image,
            ImageSource::SwapChain(images) => images.images[index],
        }
    }

    pub fn layout(&self, index: usize) -> &Cell<vk::ImageLayout> {
        match &self.source {
            ImageSource::Owned { layout, .. } => layout,
            ImageSource::SwapChain(images) => &images.layouts[index],
        }
    }

    fn raw_image(&self) -> u64 {
        match &self.source {
            ImageSource::Owned { image, .. } => image.as_raw(),
            ImageSource::SwapChain(images) => images.swapchain.as_raw(),
        }
    }
}

impl Drop for ImageResource {
    fn drop(&mut self) {
        if let ImageSource::Owned {
            image, allocation, ..
        } = &mut self.source
        {
            unsafe { self.device.device.destroy_image(*image, None) };
            if let (Some(allocation), Some(allocator)) =
                (allocation.take(), self.device.allocator.lock().as_mut())
            {
                if let Err(e) = allocator.free(allocation) {
                    log::warn!("Failed to free image memory: {}", e);
                }
            }
        }
    }
}

/// Native behind a Texture2D handle
pub struct VulkanTexture {
    pub image: Rc<ImageResource>,
}

impl NativeResource for VulkanTexture {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn raw_handle(&self) -> u64 {
        self.image.raw_image()
    }
}

/// Color attachment views, one per image the texture resolves to
pub struct RenderTargetViews {
    pub id: u64,
    pub image: Rc<ImageResource>,
    pub views: Vec<vk::ImageView>,
    device: Arc<VulkanDevice>,
}

impl RenderTargetViews {
    pub fn create(device: &Arc<VulkanDevice>, image: Rc<ImageResource>) -> Result<Self> {
        let mut target = Self {
            id: device.next_object_id(),
            views: Vec::with_capacity(image.image_count()),
            image,
            device: device.clone(),
        };

        for index in 0..target.image.image_count() {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(target.image.image(index))
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(target.image.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    level_count: 1,
                    layer_count: 1,
                    ..color_range()
                });

            let view = unsafe { device.device.create_image_view(&create_info, None) }
                .context("Failed to create render target view")?;
            target.views.push(view);
        }

        Ok(target)
    }
}

impl Drop for RenderTargetViews {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.views {
                self.device.device.destroy_image_view(view, None);
            }
        }
    }
}

/// Native behind a RenderTarget handle
pub struct VulkanRenderTarget {
    pub views: Rc<RenderTargetViews>,
}

impl NativeResource for VulkanRenderTarget {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn raw_handle(&self) -> u64 {
        self.views.views.first().map_or(0, |view| view.as_raw())
    }
}
