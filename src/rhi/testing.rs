// Recording backend - drives the core without a GPU
//
// Every native it hands out bumps a shared live counter that its Drop
// decrements, and every context/present call lands in a command log the
// tests inspect.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::anyhow;

use super::backend::{BackendFactory, ContextBackend, DeviceBackend, SwapChainBackend};
use super::device::RenderDevice;
use super::error::{RhiError, RhiResult};
use super::resource::NativeResource;
use super::shader::ShaderBytecode;
use super::types::{
    BufferDesc, InputLayoutDesc, PrimitiveTopology, RenderDeviceParams, RenderFormat,
    ShaderStage, SwapChainParams, TextureDesc, Viewport,
};
use super::GraphicsApi;

/// Extent reported for a swap chain asked to size itself to its window
pub const DEFAULT_WINDOW_EXTENT: (u32, u32) = (800, 600);

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetViewports(Vec<Viewport>),
    SetShader {
        stage: ShaderStage,
        shader: Option<u64>,
    },
    SetConstantBuffers {
        stage: ShaderStage,
        start_slot: u32,
        buffers: Vec<u64>,
    },
    SetRenderTargets(Vec<u64>),
    SetPrimitiveTopology(PrimitiveTopology),
    SetInputLayout(Option<u64>),
    SetVertexBuffer {
        buffer: Option<u64>,
        stride: u32,
        offset: u32,
    },
    ClearRenderTarget {
        target: u64,
        color: [f32; 4],
    },
    Draw {
        vertex_count: u32,
        start_vertex: u32,
    },
    Map(u64),
    Unmap(u64),
    Flush,
    ClearState,
    SetVsync(bool),
    Resize {
        width: u32,
        height: u32,
    },
    Present {
        sync_interval: u32,
    },
    WaitIdle,
    Shutdown,
}

/// Shared view of everything the recording backend did
#[derive(Clone, Default)]
pub struct Recorder {
    commands: Rc<RefCell<Vec<Command>>>,
    live: Rc<Cell<usize>>,
    next_id: Rc<Cell<u64>>,
    fail_resize: Rc<Cell<bool>>,
    native_leaks: Rc<Cell<usize>>,
}

impl Recorder {
    fn test_native(&self, size: usize) -> TestNative {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        self.live.set(self.live.get() + 1);
        TestNative {
            id,
            data: vec![0; size],
            live: self.live.clone(),
        }
    }

    /// Fresh native with `size` bytes of mappable storage
    pub fn native(&self, size: usize) -> Box<dyn NativeResource> {
        Box::new(self.test_native(size))
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.borrow().clone()
    }

    pub fn clear_commands(&self) {
        self.commands.borrow_mut().clear();
    }

    /// Natives created and not yet dropped
    pub fn live_natives(&self) -> usize {
        self.live.get()
    }

    /// Make the next swap chain resize fail.
    pub fn fail_next_resize(&self) {
        self.fail_resize.set(true);
    }

    /// Make the backend report `count` native objects it failed to free.
    pub fn leak_native_objects(&self, count: usize) {
        self.native_leaks.set(count);
    }

    fn record(&self, command: Command) {
        self.commands.borrow_mut().push(command);
    }
}

pub struct TestNative {
    id: u64,
    data: Vec<u8>,
    live: Rc<Cell<usize>>,
}

impl NativeResource for TestNative {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn raw_handle(&self) -> u64 {
        self.id
    }
}

impl Drop for TestNative {
    fn drop(&mut self) {
        self.live.set(self.live.get() - 1);
    }
}

fn ids(natives: &[&dyn NativeResource]) -> Vec<u64> {
    natives.iter().map(|native| native.raw_handle()).collect()
}

pub struct RecordingContext {
    recorder: Recorder,
}

impl ContextBackend for RecordingContext {
    fn set_viewports(&mut self, viewports: &[Viewport]) {
        self.recorder.record(Command::SetViewports(viewports.to_vec()));
    }

    fn set_shader(&mut self, stage: ShaderStage, shader: Option<&dyn NativeResource>) {
        self.recorder.record(Command::SetShader {
            stage,
            shader: shader.map(|s| s.raw_handle()),
        });
    }

    fn set_constant_buffers(
        &mut self,
        stage: ShaderStage,
        start_slot: u32,
        buffers: &[&dyn NativeResource],
    ) {
        self.recorder.record(Command::SetConstantBuffers {
            stage,
            start_slot,
            buffers: ids(buffers),
        });
    }

    fn set_render_targets(&mut self, targets: &[&dyn NativeResource]) {
        self.recorder.record(Command::SetRenderTargets(ids(targets)));
    }

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.recorder.record(Command::SetPrimitiveTopology(topology));
    }

    fn set_input_layout(&mut self, layout: Option<&dyn NativeResource>) {
        self.recorder
            .record(Command::SetInputLayout(layout.map(|l| l.raw_handle())));
    }

    fn set_vertex_buffer(&mut self, buffer: Option<&dyn NativeResource>, stride: u32, offset: u32) {
        self.recorder.record(Command::SetVertexBuffer {
            buffer: buffer.map(|b| b.raw_handle()),
            stride,
            offset,
        });
    }

    fn clear_render_target(&mut self, target: &dyn NativeResource, color: [f32; 4]) {
        self.recorder.record(Command::ClearRenderTarget {
            target: target.raw_handle(),
            color,
        });
    }

    fn draw(&mut self, vertex_count: u32, start_vertex: u32) {
        self.recorder.record(Command::Draw {
            vertex_count,
            start_vertex,
        });
    }

    fn map<'a>(&mut self, buffer: &'a mut dyn NativeResource) -> RhiResult<&'a mut [u8]> {
        self.recorder.record(Command::Map(buffer.raw_handle()));
        buffer
            .as_any_mut()
            .downcast_mut::<TestNative>()
            .map(|native| native.data.as_mut_slice())
            .ok_or_else(|| RhiError::Backend(anyhow!("foreign native mapped")))
    }

    fn unmap(&mut self, buffer: &mut dyn NativeResource) {
        self.recorder.record(Command::Unmap(buffer.raw_handle()));
    }

    fn flush(&mut self) -> RhiResult<()> {
        self.recorder.record(Command::Flush);
        Ok(())
    }

    fn clear_state(&mut self) {
        self.recorder.record(Command::ClearState);
    }
}

pub struct TestSwapChain {
    recorder: Recorder,
    _surface: TestNative,
    extent: (u32, u32),
    buffer_count: u32,
}

fn window_extent(width: u32, height: u32) -> (u32, u32) {
    (
        if width == 0 { DEFAULT_WINDOW_EXTENT.0 } else { width },
        if height == 0 { DEFAULT_WINDOW_EXTENT.1 } else { height },
    )
}

impl SwapChainBackend for TestSwapChain {
    fn back_buffer(&mut self) -> RhiResult<(Box<dyn NativeResource>, TextureDesc)> {
        let (width, height) = self.extent;
        Ok((
            self.recorder.native(0),
            TextureDesc::render_target(width, height, RenderFormat::B8G8R8A8Unorm),
        ))
    }

    fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        if self.recorder.fail_resize.replace(false) {
            return Err(RhiError::Backend(anyhow!("surface lost")));
        }
        self.recorder.record(Command::Resize { width, height });
        self.extent = window_extent(width, height);
        Ok(())
    }

    fn set_vsync(&mut self, vsync: bool) {
        self.recorder.record(Command::SetVsync(vsync));
    }

    fn extent(&self) -> (u32, u32) {
        self.extent
    }

    fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    fn format(&self) -> RenderFormat {
        RenderFormat::B8G8R8A8Unorm
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct RecordingBackend {
    recorder: Recorder,
    context: RecordingContext,
}

impl RecordingBackend {
    pub fn new(recorder: Recorder) -> Self {
        Self {
            context: RecordingContext {
                recorder: recorder.clone(),
            },
            recorder,
        }
    }
}

impl DeviceBackend for RecordingBackend {
    fn api(&self) -> GraphicsApi {
        GraphicsApi::Vulkan
    }

    fn create_buffer(
        &mut self,
        desc: &BufferDesc,
        initial_data: Option<&[u8]>,
    ) -> RhiResult<Box<dyn NativeResource>> {
        let mut native = self.recorder.test_native(desc.size_in_bytes as usize);
        if let Some(data) = initial_data {
            native.data[..data.len()].copy_from_slice(data);
        }
        Ok(Box::new(native))
    }

    fn create_texture_2d(
        &mut self,
        _desc: &TextureDesc,
        _initial_data: Option<&[u8]>,
    ) -> RhiResult<Box<dyn NativeResource>> {
        Ok(self.recorder.native(0))
    }

    fn create_render_target(
        &mut self,
        _texture: &dyn NativeResource,
        _desc: &TextureDesc,
    ) -> RhiResult<Box<dyn NativeResource>> {
        Ok(self.recorder.native(0))
    }

    fn create_shader(&mut self, _bytecode: &ShaderBytecode) -> RhiResult<Box<dyn NativeResource>> {
        Ok(self.recorder.native(0))
    }

    fn create_input_layout(
        &mut self,
        _layout: &InputLayoutDesc,
        _vertex_shader: &ShaderBytecode,
    ) -> RhiResult<Box<dyn NativeResource>> {
        Ok(self.recorder.native(0))
    }

    fn create_swap_chain(
        &mut self,
        params: &SwapChainParams,
    ) -> RhiResult<Box<dyn SwapChainBackend>> {
        Ok(Box::new(TestSwapChain {
            recorder: self.recorder.clone(),
            _surface: self.recorder.test_native(0),
            extent: window_extent(params.width, params.height),
            buffer_count: params.buffer_count,
        }))
    }

    fn context(&mut self) -> &mut dyn ContextBackend {
        &mut self.context
    }

    fn present(
        &mut self,
        _swap_chain: &mut dyn SwapChainBackend,
        sync_interval: u32,
    ) -> RhiResult<()> {
        self.recorder.record(Command::Present { sync_interval });
        Ok(())
    }

    fn wait_idle(&mut self) -> RhiResult<()> {
        self.recorder.record(Command::WaitIdle);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.recorder.record(Command::Shutdown);
    }

    fn report_live_objects(&self) -> usize {
        self.recorder.native_leaks.get()
    }
}

pub fn recording_factory(recorder: Recorder) -> BackendFactory {
    Box::new(move |_params| {
        Ok(Box::new(RecordingBackend::new(recorder.clone())) as Box<dyn DeviceBackend>)
    })
}

pub fn failing_factory() -> BackendFactory {
    Box::new(|_params| Err(RhiError::Backend(anyhow!("no suitable adapter"))))
}

pub fn test_device() -> (RenderDevice, Recorder) {
    test_device_with(&RenderDeviceParams::default())
}

pub fn test_device_with(params: &RenderDeviceParams) -> (RenderDevice, Recorder) {
    let recorder = Recorder::default();
    let device = RenderDevice::initialize(params, &recording_factory(recorder.clone()))
        .expect("recording backend never fails");
    (device, recorder)
}
