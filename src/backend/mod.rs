// Backend module - Vulkan implementation of the RHI adapter contract
//
// Ownership: every native object holds an Arc<VulkanDevice>, so the device
// outlives whatever was created from it. Natives wrap Rc'd inner objects the
// command recorder can keep alive until the GPU is done with them.

pub mod buffer;
pub mod context;
pub mod convert;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use device::VulkanDevice;

use anyhow::Context;
use std::rc::Rc;
use std::sync::Arc;

use crate::rhi::backend::{ContextBackend, DeviceBackend, SwapChainBackend};
use crate::rhi::{
    BufferDesc, GraphicsApi, InputLayoutDesc, NativeResource, RenderDeviceParams, RhiError,
    RhiResult, ShaderBytecode, SwapChainParams, TextureDesc,
};

use buffer::VulkanBuffer;
use context::CommandRecorder;
use shader::{InputLayoutResource, ShaderModule, VulkanInputLayout, VulkanShader};
use swapchain::VulkanSwapChain;
use texture::{ImageResource, RenderTargetViews, VulkanRenderTarget, VulkanTexture};

const APP_NAME: &str = "render-rhi";

/// Backend factory registered for [`GraphicsApi::Vulkan`].
pub fn create_backend(params: &RenderDeviceParams) -> RhiResult<Box<dyn DeviceBackend>> {
    let backend = VulkanBackend::new(params)?;
    Ok(Box::new(backend))
}

pub struct VulkanBackend {
    recorder: CommandRecorder,
    device: Arc<VulkanDevice>,
    /// Device references held by the backend itself
    baseline: usize,
    shut_down: bool,
}

impl VulkanBackend {
    pub fn new(params: &RenderDeviceParams) -> RhiResult<Self> {
        let device = VulkanDevice::new(APP_NAME, params.enable_debugging)?;
        let recorder = CommandRecorder::new(&device)?;
        let baseline = Arc::strong_count(&device);

        Ok(Self {
            recorder,
            device,
            baseline,
            shut_down: false,
        })
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }
}

fn native_as<'a, T: 'static>(native: &'a dyn NativeResource, what: &str) -> RhiResult<&'a T> {
    native.as_any().downcast_ref::<T>().ok_or_else(|| {
        RhiError::Backend(anyhow::anyhow!(
            "Native 0x{:x} is not a Vulkan {}",
            native.raw_handle(),
            what
        ))
    })
}

impl DeviceBackend for VulkanBackend {
    fn api(&self) -> GraphicsApi {
        GraphicsApi::Vulkan
    }

    fn create_buffer(
        &mut self,
        desc: &BufferDesc,
        initial_data: Option<&[u8]>,
    ) -> RhiResult<Box<dyn NativeResource>> {
        let buffer = VulkanBuffer::create(&self.device, desc, initial_data)?;
        Ok(Box::new(buffer))
    }

    fn create_texture_2d(
        &mut self,
        desc: &TextureDesc,
        initial_data: Option<&[u8]>,
    ) -> RhiResult<Box<dyn NativeResource>> {
        let image = ImageResource::create(&self.device, desc, initial_data)?;
        Ok(Box::new(VulkanTexture {
            image: Rc::new(image),
        }))
    }

    fn create_render_target(
        &mut self,
        texture: &dyn NativeResource,
        _desc: &TextureDesc,
    ) -> RhiResult<Box<dyn NativeResource>> {
        let texture = native_as::<VulkanTexture>(texture, "texture")?;
        let views = RenderTargetViews::create(&self.device, texture.image.clone())?;
        Ok(Box::new(VulkanRenderTarget {
            views: Rc::new(views),
        }))
    }

    fn create_shader(&mut self, bytecode: &ShaderBytecode) -> RhiResult<Box<dyn NativeResource>> {
        let module = ShaderModule::create(&self.device, bytecode)?;
        log::debug!(
            "Created {:?} shader '{}' ({} bytes)",
            bytecode.stage(),
            bytecode.name(),
            bytecode.size()
        );
        Ok(Box::new(VulkanShader {
            module: Rc::new(module),
        }))
    }

    fn create_input_layout(
        &mut self,
        layout: &InputLayoutDesc,
        _vertex_shader: &ShaderBytecode,
    ) -> RhiResult<Box<dyn NativeResource>> {
        Ok(Box::new(VulkanInputLayout {
            layout: Rc::new(InputLayoutResource {
                id: self.device.next_object_id(),
                desc: layout.clone(),
            }),
        }))
    }

    fn create_swap_chain(
        &mut self,
        params: &SwapChainParams,
    ) -> RhiResult<Box<dyn SwapChainBackend>> {
        if params.is_fullscreen {
            log::debug!("Exclusive fullscreen is left to the window system");
        }
        let swap_chain = VulkanSwapChain::new(&self.device, params)?;
        Ok(Box::new(swap_chain))
    }

    fn context(&mut self) -> &mut dyn ContextBackend {
        &mut self.recorder
    }

    fn present(
        &mut self,
        swap_chain: &mut dyn SwapChainBackend,
        sync_interval: u32,
    ) -> RhiResult<()> {
        let swap_chain = swap_chain
            .as_any_mut()
            .downcast_mut::<VulkanSwapChain>()
            .context("Swap chain was not created by the Vulkan backend")?;
        if sync_interval > 1 {
            log::trace!("Sync interval {} presents as FIFO", sync_interval);
        }

        let images = swap_chain
            .images()
            .cloned()
            .ok_or(RhiError::BackBufferUnavailable)?;
        self.recorder.present(&images)
    }

    fn wait_idle(&mut self) -> RhiResult<()> {
        self.recorder.wait_idle()?;
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.recorder.shutdown();
        if let Err(e) = self.device.wait_idle() {
            log::warn!("Device did not go idle during shutdown: {:#}", e);
        }
        log::info!("Vulkan backend shut down");
    }

    fn report_live_objects(&self) -> usize {
        let live = Arc::strong_count(&self.device).saturating_sub(self.baseline);
        if live > 0 {
            log::warn!("{} Vulkan object(s) still hold the device", live);
        } else {
            log::info!("No live Vulkan objects");
        }
        live
    }
}
