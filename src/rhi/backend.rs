// Backend adapter contract
//
// One concrete backend implements these three traits against a native
// graphics API. The core hands natives back to the backend as
// `&dyn NativeResource`; a backend downcasts them to its own types and may
// assume every native it receives was created by itself.

use std::any::Any;

use super::error::RhiResult;
use super::resource::NativeResource;
use super::shader::ShaderBytecode;
use super::types::{
    BufferDesc, InputLayoutDesc, PrimitiveTopology, RenderDeviceParams, RenderFormat,
    ShaderStage, SwapChainParams, TextureDesc, Viewport,
};
use super::GraphicsApi;

/// Creates the backend device for a render device. Chosen once per `Rhi`.
pub type BackendFactory = Box<dyn Fn(&RenderDeviceParams) -> RhiResult<Box<dyn DeviceBackend>>>;

pub trait DeviceBackend {
    fn api(&self) -> GraphicsApi;

    fn create_buffer(
        &mut self,
        desc: &BufferDesc,
        initial_data: Option<&[u8]>,
    ) -> RhiResult<Box<dyn NativeResource>>;

    fn create_texture_2d(
        &mut self,
        desc: &TextureDesc,
        initial_data: Option<&[u8]>,
    ) -> RhiResult<Box<dyn NativeResource>>;

    /// Color attachment view over `texture`, which has description `desc`.
    fn create_render_target(
        &mut self,
        texture: &dyn NativeResource,
        desc: &TextureDesc,
    ) -> RhiResult<Box<dyn NativeResource>>;

    fn create_shader(&mut self, bytecode: &ShaderBytecode) -> RhiResult<Box<dyn NativeResource>>;

    fn create_input_layout(
        &mut self,
        layout: &InputLayoutDesc,
        vertex_shader: &ShaderBytecode,
    ) -> RhiResult<Box<dyn NativeResource>>;

    fn create_swap_chain(&mut self, params: &SwapChainParams)
        -> RhiResult<Box<dyn SwapChainBackend>>;

    /// The immediate context
    fn context(&mut self) -> &mut dyn ContextBackend;

    /// Submit the frame recorded so far and queue `swap_chain`'s current
    /// image for display.
    fn present(&mut self, swap_chain: &mut dyn SwapChainBackend, sync_interval: u32)
        -> RhiResult<()>;

    fn wait_idle(&mut self) -> RhiResult<()>;

    /// Release the native device. Called once, after every resource is gone.
    fn shutdown(&mut self);

    /// Log native objects still alive. Returns how many were found.
    fn report_live_objects(&self) -> usize;
}

/// Native presentation surface plus its images
pub trait SwapChainBackend: Any {
    /// Native texture aliasing the current back buffer, with its description.
    fn back_buffer(&mut self) -> RhiResult<(Box<dyn NativeResource>, TextureDesc)>;

    /// Resize keeping buffer count and format. 0 = size of the output window.
    /// Every native obtained from `back_buffer` must be gone by now.
    fn resize(&mut self, width: u32, height: u32) -> RhiResult<()>;

    /// Wait for vertical blank from the next `resize` on.
    fn set_vsync(&mut self, vsync: bool);

    fn extent(&self) -> (u32, u32);
    fn buffer_count(&self) -> u32;
    fn format(&self) -> RenderFormat;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Immediate command interface
///
/// Setters never fail; a native recording error is kept and returned by the
/// next `flush` or present.
pub trait ContextBackend {
    fn set_viewports(&mut self, viewports: &[Viewport]);
    fn set_shader(&mut self, stage: ShaderStage, shader: Option<&dyn NativeResource>);
    fn set_constant_buffers(
        &mut self,
        stage: ShaderStage,
        start_slot: u32,
        buffers: &[&dyn NativeResource],
    );
    fn set_render_targets(&mut self, targets: &[&dyn NativeResource]);
    fn set_primitive_topology(&mut self, topology: PrimitiveTopology);
    fn set_input_layout(&mut self, layout: Option<&dyn NativeResource>);
    fn set_vertex_buffer(&mut self, buffer: Option<&dyn NativeResource>, stride: u32, offset: u32);

    fn clear_render_target(&mut self, target: &dyn NativeResource, color: [f32; 4]);
    fn draw(&mut self, vertex_count: u32, start_vertex: u32);

    /// CPU-writable view of a dynamic or staging buffer. May wait for the
    /// GPU to finish using it.
    fn map<'a>(&mut self, buffer: &'a mut dyn NativeResource) -> RhiResult<&'a mut [u8]>;
    fn unmap(&mut self, buffer: &mut dyn NativeResource);

    /// Submit recorded work and wait for it.
    fn flush(&mut self) -> RhiResult<()>;

    /// Unbind everything.
    fn clear_state(&mut self);
}
