// Render context - immediate command interface
//
// Keeps the pipeline-state cursor the client sees and forwards every change
// to the backend context. Bound resources are not referenced; they must
// outlive the draw that uses them.

use super::backend::ContextBackend;
use super::error::{RhiError, RhiResult};
use super::resource::{
    Buffer, InputLayout, PixelShader, RenderResource, RenderTarget, ResourceDesc, ResourceKind,
    ResourceRegistry, VertexShader,
};
use super::types::{PrimitiveTopology, ShaderStage, Viewport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferBinding {
    pub buffer: Buffer,
    pub stride: u32,
    pub offset: u32,
}

/// Currently bound pipeline configuration
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    pub viewports: Vec<Viewport>,
    pub vertex_shader: Option<VertexShader>,
    pub pixel_shader: Option<PixelShader>,
    pub vertex_constant_buffers: Vec<Option<Buffer>>,
    pub pixel_constant_buffers: Vec<Option<Buffer>>,
    pub render_targets: Vec<RenderTarget>,
    pub topology: PrimitiveTopology,
    pub input_layout: Option<InputLayout>,
    pub vertex_buffer: Option<VertexBufferBinding>,
}

impl PipelineState {
    pub fn constant_buffers(&self, stage: ShaderStage) -> &[Option<Buffer>] {
        match stage {
            ShaderStage::Vertex => &self.vertex_constant_buffers,
            ShaderStage::Pixel => &self.pixel_constant_buffers,
        }
    }

    pub(crate) fn is_render_target_bound(&self, target: RenderTarget) -> bool {
        self.render_targets.contains(&target)
    }
}

pub struct RenderContext<'a> {
    resources: &'a mut ResourceRegistry,
    backend: &'a mut dyn ContextBackend,
    state: &'a mut PipelineState,
}

impl<'a> RenderContext<'a> {
    pub(crate) fn new(
        resources: &'a mut ResourceRegistry,
        backend: &'a mut dyn ContextBackend,
        state: &'a mut PipelineState,
    ) -> Self {
        Self {
            resources,
            backend,
            state,
        }
    }

    pub fn state(&self) -> &PipelineState {
        self.state
    }

    pub fn set_viewports(&mut self, viewports: &[Viewport]) {
        self.backend.set_viewports(viewports);
        self.state.viewports = viewports.to_vec();
    }

    pub fn set_vertex_shader(&mut self, shader: Option<VertexShader>) {
        let native = match shader {
            Some(shader) => match self.resources.native_of(shader) {
                Some(native) => Some(native),
                None => return,
            },
            None => None,
        };
        self.backend.set_shader(ShaderStage::Vertex, native);
        self.state.vertex_shader = shader;
    }

    pub fn set_pixel_shader(&mut self, shader: Option<PixelShader>) {
        let native = match shader {
            Some(shader) => match self.resources.native_of(shader) {
                Some(native) => Some(native),
                None => return,
            },
            None => None,
        };
        self.backend.set_shader(ShaderStage::Pixel, native);
        self.state.pixel_shader = shader;
    }

    /// Bind `buffers` to consecutive slots of `stage` starting at `start_slot`.
    pub fn set_constant_buffers(
        &mut self,
        stage: ShaderStage,
        start_slot: u32,
        buffers: &[Buffer],
    ) {
        let mut natives = Vec::with_capacity(buffers.len());
        for &buffer in buffers {
            match self.resources.native_of(buffer) {
                Some(native) => natives.push(native),
                None => return,
            }
        }
        self.backend.set_constant_buffers(stage, start_slot, &natives);

        let slots = match stage {
            ShaderStage::Vertex => &mut self.state.vertex_constant_buffers,
            ShaderStage::Pixel => &mut self.state.pixel_constant_buffers,
        };
        for (offset, &buffer) in buffers.iter().enumerate() {
            let slot = start_slot as usize + offset;
            if slots.len() <= slot {
                slots.resize(slot + 1, None);
            }
            slots[slot] = Some(buffer);
        }
    }

    pub fn set_render_targets(&mut self, targets: &[RenderTarget]) {
        let mut natives = Vec::with_capacity(targets.len());
        for &target in targets {
            match self.resources.native_of(target) {
                Some(native) => natives.push(native),
                None => return,
            }
        }
        self.backend.set_render_targets(&natives);
        self.state.render_targets = targets.to_vec();
    }

    pub fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.backend.set_primitive_topology(topology);
        self.state.topology = topology;
    }

    pub fn set_input_layout(&mut self, layout: Option<InputLayout>) {
        let native = match layout {
            Some(layout) => match self.resources.native_of(layout) {
                Some(native) => Some(native),
                None => return,
            },
            None => None,
        };
        self.backend.set_input_layout(native);
        self.state.input_layout = layout;
    }

    /// Bind `buffer` to the vertex input with the stride it was created with.
    pub fn set_vertex_buffer(&mut self, buffer: Option<Buffer>) {
        let Some(buffer) = buffer else {
            self.backend.set_vertex_buffer(None, 0, 0);
            self.state.vertex_buffer = None;
            return;
        };
        let Some(native) = self.resources.native_of(buffer) else {
            return;
        };
        let stride = match self.resources.desc(buffer.handle()) {
            Some(ResourceDesc::Buffer(desc)) => desc.stride_in_bytes,
            _ => 0,
        };

        self.backend.set_vertex_buffer(Some(native), stride, 0);
        self.state.vertex_buffer = Some(VertexBufferBinding {
            buffer,
            stride,
            offset: 0,
        });
    }

    pub fn clear_render_target(&mut self, target: RenderTarget, color: [f32; 4]) {
        if let Some(native) = self.resources.native_of(target) {
            self.backend.clear_render_target(native, color);
        }
    }

    /// Non-indexed draw with whatever is currently bound.
    pub fn draw(&mut self, vertex_count: u32, start_vertex: u32) {
        self.backend.draw(vertex_count, start_vertex);
    }

    /// Open a CPU write window into a dynamic or staging buffer.
    pub fn map(&mut self, buffer: Buffer) -> RhiResult<&mut [u8]> {
        let (native, desc) = self
            .resources
            .native_of_mut(buffer)
            .ok_or(RhiError::InvalidHandle(ResourceKind::Buffer))?;
        let usage = match desc {
            ResourceDesc::Buffer(desc) => desc.usage,
            _ => return Err(RhiError::InvalidHandle(ResourceKind::Buffer)),
        };
        if !usage.is_cpu_writable() {
            log::error!("Map called on a buffer with {:?} usage", usage);
            return Err(RhiError::NotMappable(usage));
        }

        self.backend.map(native)
    }

    pub fn unmap(&mut self, buffer: Buffer) {
        if let Some((native, _)) = self.resources.native_of_mut(buffer) {
            self.backend.unmap(native);
        }
    }

    /// Map, copy `data` to the start of the buffer, unmap.
    pub fn write_buffer(&mut self, buffer: Buffer, data: &[u8]) -> RhiResult<()> {
        let mapped = self.map(buffer)?;
        if data.len() > mapped.len() {
            let len = mapped.len();
            self.unmap(buffer);
            return Err(RhiError::InvalidDescriptor(format!(
                "{} bytes written into a {} byte buffer",
                data.len(),
                len
            )));
        }
        mapped[..data.len()].copy_from_slice(data);
        self.unmap(buffer);
        Ok(())
    }

    pub fn flush(&mut self) -> RhiResult<()> {
        self.backend.flush()
    }

    pub fn clear_state(&mut self) {
        self.backend.clear_state();
        *self.state = PipelineState::default();
    }
}
