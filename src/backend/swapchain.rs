// Swapchain - Window presentation
//
// VulkanSwapChain owns the window surface and rebuilds its images on
// resize. The images, their layouts and presentation semaphores live in a
// shared SwapChainImages so back buffer textures and the command recorder
// can refer to them without borrowing the swap chain.

use anyhow::{Context, Result};
use ash::vk;
use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use super::convert;
use super::surface;
use super::sync::PresentSync;
use super::texture::{ImageResource, VulkanTexture};
use super::VulkanDevice;
use crate::rhi::backend::SwapChainBackend;
use crate::rhi::{
    BindFlags, BufferUsage, NativeResource, RenderFormat, RhiError, RhiResult, SwapChainParams,
    TextureDesc,
};

/// Used when the window system leaves the extent to the swap chain and the
/// caller asked for "window size"
const FALLBACK_EXTENT: vk::Extent2D = vk::Extent2D {
    width: 1280,
    height: 720,
};

pub struct SwapChainImages {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub layouts: Vec<Cell<vk::ImageLayout>>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    sync: PresentSync,
    acquired: Cell<Option<u32>>,
    device: Arc<VulkanDevice>,
}

impl SwapChainImages {
    /// Image acquired for the frame being recorded, if any
    pub fn acquired(&self) -> Option<u32> {
        self.acquired.get()
    }

    /// Acquire the next image. Returns its index and the semaphore the
    /// first submission touching it must wait on.
    pub fn acquire(&self) -> Result<(u32, vk::Semaphore)> {
        if let Some(index) = self.acquired.get() {
            return Ok((index, vk::Semaphore::null()));
        }

        let result = unsafe {
            self.device.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.sync.image_available,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Swapchain suboptimal on acquire");
                }
                self.acquired.set(Some(index));
                Ok((index, self.sync.image_available))
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                anyhow::bail!("Swapchain out of date")
            }
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    pub fn render_finished(&self, index: u32) -> vk::Semaphore {
        self.sync.render_finished[index as usize]
    }

    /// Queue the acquired image for display once `wait` is signaled.
    pub fn present(&self, queue: vk::Queue, wait: vk::Semaphore) -> Result<()> {
        let index = self
            .acquired
            .take()
            .context("Present without an acquired image")?;

        let swapchains = [self.swapchain];
        let image_indices = [index];
        let wait_semaphores = [wait];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.device
                .swapchain_loader
                .queue_present(queue, &present_info)
        };

        match result {
            Ok(false) => Ok(()),
            Ok(true) => {
                log::debug!("Swapchain suboptimal on present");
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                anyhow::bail!("Swapchain out of date")
            }
            Err(e) => Err(e).context("Failed to present"),
        }
    }
}

impl Drop for SwapChainImages {
    fn drop(&mut self) {
        unsafe {
            self.sync.destroy(&self.device.device);
            self.device
                .swapchain_loader
                .destroy_swapchain(self.swapchain, None);
        }
    }
}

/// Native swap chain: window surface plus the current image set
pub struct VulkanSwapChain {
    images: Option<Rc<SwapChainImages>>,
    surface: vk::SurfaceKHR,
    requested_buffers: u32,
    vsync: bool,
    render_format: RenderFormat,
    device: Arc<VulkanDevice>,
}

impl VulkanSwapChain {
    pub fn new(device: &Arc<VulkanDevice>, params: &SwapChainParams) -> RhiResult<Self> {
        let window = params.output_window.ok_or_else(|| {
            RhiError::InvalidDescriptor("Vulkan swap chains need an output window".into())
        })?;
        let surface = surface::create_surface(device, &window)?;

        let mut swap_chain = Self {
            images: None,
            surface,
            requested_buffers: params.buffer_count,
            vsync: params.sync_interval > 0,
            render_format: RenderFormat::B8G8R8A8Unorm,
            device: device.clone(),
        };

        let supported = unsafe {
            device.surface_loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface,
            )
        }
        .context("Failed to query surface support")?;
        if !supported {
            return Err(anyhow::anyhow!("Graphics queue cannot present to this window").into());
        }

        swap_chain.build(params.width, params.height)?;
        Ok(swap_chain)
    }

    pub fn images(&self) -> Option<&Rc<SwapChainImages>> {
        self.images.as_ref()
    }

    fn build(&mut self, width: u32, height: u32) -> Result<()> {
        let device = &self.device;
        let surface_caps = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_capabilities(device.physical_device, self.surface)
        }?;
        let formats = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_formats(device.physical_device, self.surface)
        }?;
        let present_modes = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_present_modes(device.physical_device, self.surface)
        }?;

        // Choose surface format (prefer BGRA8 UNORM, the classic back buffer)
        let surface_format = formats
            .iter()
            .find(|f| f.format == vk::Format::B8G8R8A8_UNORM)
            .or_else(|| {
                formats
                    .iter()
                    .find(|f| convert::surface_format(f.format).is_some())
            })
            .context("No supported surface format")?;

        // IMMEDIATE: No vsync, lowest latency, may tear
        // MAILBOX: No vsync, no tearing
        // FIFO: Vsync enabled, guaranteed available
        let present_mode = if self.vsync {
            vk::PresentModeKHR::FIFO
        } else {
            [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX]
                .into_iter()
                .find(|mode| present_modes.contains(mode))
                .unwrap_or(vk::PresentModeKHR::FIFO)
        };

        let requested = vk::Extent2D {
            width: if width == 0 { FALLBACK_EXTENT.width } else { width },
            height: if height == 0 { FALLBACK_EXTENT.height } else { height },
        };
        let extent = if surface_caps.current_extent.width != u32::MAX
            && (width == 0 || height == 0)
        {
            surface_caps.current_extent
        } else {
            vk::Extent2D {
                width: requested.width.clamp(
                    surface_caps.min_image_extent.width,
                    surface_caps.max_image_extent.width,
                ),
                height: requested.height.clamp(
                    surface_caps.min_image_extent.height,
                    surface_caps.max_image_extent.height,
                ),
            }
        };
        anyhow::ensure!(
            extent.width > 0 && extent.height > 0,
            "Window surface has zero area"
        );

        let mut image_count = self.requested_buffers.max(surface_caps.min_image_count);
        if surface_caps.max_image_count > 0 {
            image_count = image_count.min(surface_caps.max_image_count);
        }

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { device.swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let images = match unsafe { device.swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { device.swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e).context("Failed to get swapchain images");
            }
        };
        let sync = match PresentSync::new(&device.device, images.len()) {
            Ok(sync) => sync,
            Err(e) => {
                unsafe { device.swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e);
            }
        };

        log::info!(
            "Created swapchain: {}x{}, {} images, {:?}",
            extent.width,
            extent.height,
            images.len(),
            present_mode
        );

        self.render_format = convert::surface_format(surface_format.format)
            .context("Surface format has no RHI equivalent")?;
        self.images = Some(Rc::new(SwapChainImages {
            swapchain,
            layouts: images
                .iter()
                .map(|_| Cell::new(vk::ImageLayout::UNDEFINED))
                .collect(),
            images,
            format: surface_format.format,
            extent,
            sync,
            acquired: Cell::new(None),
            device: device.clone(),
        }));
        Ok(())
    }

    fn current(&self) -> RhiResult<&Rc<SwapChainImages>> {
        self.images.as_ref().ok_or(RhiError::BackBufferUnavailable)
    }
}

impl SwapChainBackend for VulkanSwapChain {
    fn back_buffer(&mut self) -> RhiResult<(Box<dyn NativeResource>, TextureDesc)> {
        let images = self.current()?.clone();
        let desc = TextureDesc {
            width: images.extent.width,
            height: images.extent.height,
            array_size: 1,
            mip_levels: 1,
            format: self.render_format,
            usage: BufferUsage::Default,
            bind_flags: BindFlags::RENDER_TARGET,
        };
        let texture = VulkanTexture {
            image: Rc::new(ImageResource::from_swap_chain(&self.device, images)),
        };
        Ok((Box::new(texture), desc))
    }

    fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        self.device.wait_idle()?;

        if let Some(old) = self.images.take() {
            if Rc::strong_count(&old) > 1 {
                log::warn!(
                    "Swapchain images still referenced ({} holders) while resizing",
                    Rc::strong_count(&old) - 1
                );
            }
        }
        self.build(width, height)?;
        Ok(())
    }

    fn set_vsync(&mut self, vsync: bool) {
        if self.vsync != vsync {
            log::info!("Vsync {}", if vsync { "on" } else { "off" });
            self.vsync = vsync;
        }
    }

    fn extent(&self) -> (u32, u32) {
        self.images
            .as_ref()
            .map_or((0, 0), |images| (images.extent.width, images.extent.height))
    }

    fn buffer_count(&self) -> u32 {
        self.images
            .as_ref()
            .map_or(self.requested_buffers, |images| images.images.len() as u32)
    }

    fn format(&self) -> RenderFormat {
        self.render_format
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for VulkanSwapChain {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        self.images = None;
        unsafe {
            self.device
                .surface_loader
                .destroy_surface(self.surface, None)
        };
    }
}
