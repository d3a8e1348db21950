// RHI - backend-agnostic render hardware interface
//
// Rhi ──creates──> RenderDevice ──creates──> resources / swap chains
//                        │
//                        └──> RenderContext (immediate command interface)
//
// The concrete graphics API sits behind the traits in `backend`; the
// backend is picked once when the Rhi is constructed.

pub mod backend;
pub mod context;
pub mod debug;
pub mod device;
pub mod error;
pub mod registry;
pub mod resource;
pub mod shader;
pub mod swapchain;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::BackendFactory;
pub use context::{PipelineState, RenderContext};
pub use device::RenderDevice;
pub use error::{RhiError, RhiResult};
pub use resource::{
    Buffer, InputLayout, NativeResource, PixelShader, RenderResource, RenderTarget, ResourceKind,
    Texture2D, VertexShader,
};
pub use shader::{ShaderBytecode, ShaderCompiler};
pub use swapchain::{SwapChain, SwapChainId, SwapChainMut};
pub use types::*;

/// Native graphics API behind every device an `Rhi` creates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphicsApi {
    Vulkan,
}

/// Top-level factory owning every render device
pub struct Rhi {
    api: GraphicsApi,
    factory: BackendFactory,
    devices: Vec<RenderDevice>,
}

impl Rhi {
    pub fn new(api: GraphicsApi) -> Self {
        let factory: BackendFactory = match api {
            GraphicsApi::Vulkan => Box::new(crate::backend::create_backend),
        };
        Self::with_factory(api, factory)
    }

    /// Rhi over a caller-provided backend
    pub fn with_factory(api: GraphicsApi, factory: BackendFactory) -> Self {
        log::info!("RHI created for {:?}", api);
        Self {
            api,
            factory,
            devices: Vec::new(),
        }
    }

    pub fn api(&self) -> GraphicsApi {
        self.api
    }

    /// Create and initialize a device. Nothing is kept on failure.
    pub fn create_render_device(&mut self, params: &RenderDeviceParams) -> RhiResult<DeviceId> {
        match RenderDevice::initialize(params, &self.factory) {
            Ok(device) => {
                let id = device.id();
                log::info!("Render device {} ready ({:?})", id, device.api());
                self.devices.push(device);
                Ok(id)
            }
            Err(e) => {
                log::error!("Failed to create render device: {}", e);
                Err(e)
            }
        }
    }

    pub fn device(&self, id: DeviceId) -> Option<&RenderDevice> {
        self.devices.iter().find(|device| device.id() == id)
    }

    pub fn device_mut(&mut self, id: DeviceId) -> Option<&mut RenderDevice> {
        self.devices.iter_mut().find(|device| device.id() == id)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Shut the device down, report what it leaked when debugging, and free
    /// it. The device must have been created by this Rhi.
    pub fn remove_render_device(&mut self, id: DeviceId) {
        let Some(index) = self.devices.iter().position(|device| device.id() == id) else {
            log::error!("Render device {} is not owned by this RHI", id);
            debug_assert!(false, "render device {id} is not owned by this RHI");
            return;
        };

        let mut device = self.devices.remove(index);
        device.shutdown();
        if device.params().enable_debugging {
            let leaked = device.report_live_objects();
            if leaked > 0 {
                log::warn!("Render device {} left {} live object(s)", id, leaked);
            }
            debug_assert_eq!(leaked, 0, "render device {id} left live objects");
        }
        drop(device);
        log::info!("Render device {} removed", id);
    }
}

impl Drop for Rhi {
    fn drop(&mut self) {
        let ids: Vec<_> = self.devices.iter().map(|device| device.id()).collect();
        for id in ids {
            self.remove_render_device(id);
        }
    }
}
