// Render device - resource factory and registry owner
//
// Responsibilities:
// - Create every backend object and register it in the tracking list
// - Enforce the reference-counted release protocol
// - Own the swap chains, the immediate context and the shader compiler
// - Tear everything down in dependency order on shutdown

use super::backend::{BackendFactory, DeviceBackend};
use super::context::{PipelineState, RenderContext};
use super::debug;
use super::error::{RhiError, RhiResult};
use super::resource::{
    Buffer, InputLayout, PixelShader, RenderResource, RenderTarget, ResourceDesc, ResourceHandle,
    ResourceKind, ResourceRegistry, Texture2D, VertexShader,
};
use super::shader::{ShaderBytecode, ShaderCompiler};
use super::swapchain::{SwapChain, SwapChainId, SwapChainMut};
use super::types::{
    BindFlags, BufferDesc, BufferUsage, CpuAccessFlags, DeviceId, InputElement, InputLayoutDesc,
    RenderDeviceParams, ShaderStage, SwapChainParams, TextureDesc,
};
use super::GraphicsApi;

/// Constant buffer sizes are rounded up to this
const CONSTANT_BUFFER_ALIGNMENT: u32 = 16;

pub struct RenderDevice {
    id: DeviceId,
    params: RenderDeviceParams,
    swap_chains: Vec<(SwapChainId, SwapChain)>,
    next_swap_chain: u32,
    context_state: PipelineState,
    resources: ResourceRegistry,
    shader_compiler: ShaderCompiler,
    backend: Box<dyn DeviceBackend>,
    shut_down: bool,
}

impl RenderDevice {
    /// Create the backend device and everything the render device owns.
    pub(crate) fn initialize(
        params: &RenderDeviceParams,
        factory: &BackendFactory,
    ) -> RhiResult<Self> {
        let id = DeviceId::next();
        log::info!(
            "Initializing render device {} (debugging: {})",
            id,
            params.enable_debugging
        );

        let backend = factory(params)?;
        if params.enable_debugging {
            debug::attach(id);
        }

        Ok(Self {
            id,
            params: params.clone(),
            swap_chains: Vec::new(),
            next_swap_chain: 0,
            context_state: PipelineState::default(),
            resources: ResourceRegistry::new(id, params.enable_debugging),
            shader_compiler: ShaderCompiler::default(),
            backend,
            shut_down: false,
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn params(&self) -> &RenderDeviceParams {
        &self.params
    }

    pub fn api(&self) -> GraphicsApi {
        self.backend.api()
    }

    pub fn shader_compiler(&self) -> &ShaderCompiler {
        &self.shader_compiler
    }

    // =========================================================================
    // RESOURCE CREATION
    // =========================================================================

    pub fn create_buffer(
        &mut self,
        desc: &BufferDesc,
        initial_data: Option<&[u8]>,
    ) -> RhiResult<Buffer> {
        self.ensure_active()?;

        if desc.size_in_bytes == 0 {
            return Err(RhiError::InvalidDescriptor("buffer size must be non-zero".into()));
        }
        check_initial_data(desc.usage, desc.size_in_bytes as usize, initial_data)?;

        let mut desc = desc.clone();
        if desc.cpu_access.is_empty() {
            desc.cpu_access = CpuAccessFlags::for_usage(desc.usage);
        }

        let native = self.backend.create_buffer(&desc, initial_data)?;
        log::debug!(
            "Created {:?} buffer: {} bytes, {:?}",
            desc.usage,
            desc.size_in_bytes,
            desc.bind_flags
        );
        let handle = self.resources.register(native, ResourceDesc::Buffer(desc), None);
        Ok(Buffer::from_handle(handle))
    }

    /// Vertex buffer of `vertex_count` vertices, `stride` bytes each.
    pub fn create_vertex_buffer(
        &mut self,
        vertex_count: u32,
        stride: u32,
        usage: BufferUsage,
        initial_data: Option<&[u8]>,
    ) -> RhiResult<Buffer> {
        let size = vertex_count.checked_mul(stride).ok_or_else(|| {
            RhiError::InvalidDescriptor(format!(
                "{vertex_count} vertices of {stride} bytes overflow a buffer"
            ))
        })?;

        self.create_buffer(
            &BufferDesc {
                size_in_bytes: size,
                stride_in_bytes: stride,
                usage,
                bind_flags: BindFlags::VERTEX_BUFFER,
                cpu_access: CpuAccessFlags::empty(),
            },
            initial_data,
        )
    }

    pub fn create_constant_buffer(
        &mut self,
        size_in_bytes: u32,
        usage: BufferUsage,
        initial_data: Option<&[u8]>,
    ) -> RhiResult<Buffer> {
        let size = size_in_bytes
            .checked_next_multiple_of(CONSTANT_BUFFER_ALIGNMENT)
            .ok_or_else(|| {
                RhiError::InvalidDescriptor(format!(
                    "{size_in_bytes} byte constant buffer overflows once aligned"
                ))
            })?;

        self.create_buffer(
            &BufferDesc {
                size_in_bytes: size,
                stride_in_bytes: 0,
                usage,
                bind_flags: BindFlags::CONSTANT_BUFFER,
                cpu_access: CpuAccessFlags::empty(),
            },
            initial_data,
        )
    }

    pub fn create_texture_2d(
        &mut self,
        desc: &TextureDesc,
        initial_data: Option<&[u8]>,
    ) -> RhiResult<Texture2D> {
        self.ensure_active()?;

        if desc.width == 0 || desc.height == 0 || desc.array_size == 0 || desc.mip_levels == 0 {
            return Err(RhiError::InvalidDescriptor(format!(
                "texture {}x{} with {} layer(s) and {} mip(s)",
                desc.width, desc.height, desc.array_size, desc.mip_levels
            )));
        }
        let top_level =
            desc.width as usize * desc.height as usize * desc.format.size_in_bytes() as usize;
        check_initial_data(desc.usage, top_level, initial_data)?;

        let native = self.backend.create_texture_2d(desc, initial_data)?;
        log::debug!(
            "Created texture: {}x{} {:?}",
            desc.width,
            desc.height,
            desc.format
        );
        let handle = self
            .resources
            .register(native, ResourceDesc::Texture2D(desc.clone()), None);
        Ok(Texture2D::from_handle(handle))
    }

    /// Render target view of `texture`. The view keeps a reference on the
    /// texture until it is released itself.
    pub fn create_render_target(&mut self, texture: Texture2D) -> RhiResult<RenderTarget> {
        self.ensure_active()?;

        let desc = match self.resources.desc(texture.handle()) {
            Some(ResourceDesc::Texture2D(desc)) => desc.clone(),
            _ => return Err(RhiError::InvalidHandle(ResourceKind::Texture2D)),
        };
        if !desc.bind_flags.contains(BindFlags::RENDER_TARGET) {
            return Err(RhiError::InvalidDescriptor(
                "texture was not created with the RENDER_TARGET bind flag".into(),
            ));
        }

        let native = {
            let texture_native = self
                .resources
                .native_of(texture)
                .ok_or(RhiError::InvalidHandle(ResourceKind::Texture2D))?;
            self.backend.create_render_target(texture_native, &desc)?
        };

        self.resources.add_ref(texture.handle());
        let handle = self.resources.register(
            native,
            ResourceDesc::RenderTarget(desc),
            Some(texture.handle()),
        );
        Ok(RenderTarget::from_handle(handle))
    }

    pub fn create_vertex_shader(&mut self, bytecode: &ShaderBytecode) -> RhiResult<VertexShader> {
        let handle = self.create_shader(bytecode, ShaderStage::Vertex)?;
        Ok(VertexShader::from_handle(handle))
    }

    pub fn create_pixel_shader(&mut self, bytecode: &ShaderBytecode) -> RhiResult<PixelShader> {
        let handle = self.create_shader(bytecode, ShaderStage::Pixel)?;
        Ok(PixelShader::from_handle(handle))
    }

    fn create_shader(
        &mut self,
        bytecode: &ShaderBytecode,
        stage: ShaderStage,
    ) -> RhiResult<ResourceHandle> {
        self.ensure_active()?;

        if bytecode.stage() != stage {
            return Err(RhiError::InvalidDescriptor(format!(
                "'{}' was compiled for the {:?} stage, not {:?}",
                bytecode.name(),
                bytecode.stage(),
                stage
            )));
        }

        let native = self.backend.create_shader(bytecode)?;
        log::debug!("Created {:?} shader '{}'", stage, bytecode.name());
        Ok(self.resources.register(
            native,
            ResourceDesc::Shader {
                stage,
                name: bytecode.name().to_string(),
            },
            None,
        ))
    }

    /// Input layout for `elements`, checked against the inputs the vertex
    /// shader actually reads.
    pub fn create_input_layout(
        &mut self,
        elements: &[InputElement],
        vertex_shader: &ShaderBytecode,
    ) -> RhiResult<InputLayout> {
        self.ensure_active()?;

        if elements.is_empty() {
            return Err(RhiError::InvalidDescriptor("input layout has no elements".into()));
        }
        if vertex_shader.stage() != ShaderStage::Vertex {
            return Err(RhiError::InvalidDescriptor(format!(
                "input layout validated against non-vertex shader '{}'",
                vertex_shader.name()
            )));
        }
        if let Some(missing) = vertex_shader
            .input_locations()
            .iter()
            .find(|&&location| location as usize >= elements.len())
        {
            return Err(RhiError::InvalidDescriptor(format!(
                "vertex shader '{}' reads location {} which no input element provides",
                vertex_shader.name(),
                missing
            )));
        }

        let layout = InputLayoutDesc::from_elements(elements)?;
        let native = self.backend.create_input_layout(&layout, vertex_shader)?;
        log::debug!(
            "Created input layout: {} element(s), {} byte stride",
            layout.attributes.len(),
            layout.stride
        );
        let handle = self
            .resources
            .register(native, ResourceDesc::InputLayout(layout), None);
        Ok(InputLayout::from_handle(handle))
    }

    // =========================================================================
    // REFERENCE COUNTING
    // =========================================================================

    /// Drop one reference; at zero the resource is destroyed. Returns the
    /// remaining count.
    pub fn release_resource<R: RenderResource>(&mut self, resource: R) -> u32 {
        match self.resources.release(resource.handle()) {
            Some(count) => count,
            None => {
                log::error!(
                    "Release of untracked {:?} on device {}",
                    R::KIND,
                    self.id
                );
                debug_assert!(false, "release of untracked {:?}", R::KIND);
                0
            }
        }
    }

    /// Take an additional reference. Returns the new count.
    pub fn add_ref<R: RenderResource>(&mut self, resource: R) -> Option<u32> {
        self.resources.add_ref(resource.handle())
    }

    pub fn ref_count<R: RenderResource>(&self, resource: R) -> Option<u32> {
        self.resources.ref_count(resource.handle())
    }

    pub fn is_tracked<R: RenderResource>(&self, resource: R) -> bool {
        self.resources.contains(resource.handle())
    }

    pub fn live_resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn buffer_desc(&self, buffer: Buffer) -> Option<&BufferDesc> {
        match self.resources.desc(buffer.handle()) {
            Some(ResourceDesc::Buffer(desc)) => Some(desc),
            _ => None,
        }
    }

    pub fn texture_desc(&self, texture: Texture2D) -> Option<&TextureDesc> {
        match self.resources.desc(texture.handle()) {
            Some(ResourceDesc::Texture2D(desc)) => Some(desc),
            _ => None,
        }
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    // =========================================================================
    // CONTEXT & SWAP CHAINS
    // =========================================================================

    pub fn immediate_context(&mut self) -> RenderContext<'_> {
        RenderContext::new(
            &mut self.resources,
            self.backend.context(),
            &mut self.context_state,
        )
    }

    pub fn create_swap_chain(&mut self, params: &SwapChainParams) -> RhiResult<SwapChainId> {
        self.ensure_active()?;

        if params.buffer_count == 0 {
            return Err(RhiError::InvalidDescriptor("swap chain needs at least one buffer".into()));
        }

        let native = self.backend.create_swap_chain(params)?;
        let mut chain = SwapChain::new(native, params.clone());
        chain.acquire_back_buffer(&mut self.resources, self.backend.as_mut())?;

        let id = SwapChainId(self.next_swap_chain);
        self.next_swap_chain += 1;
        let (width, height) = chain.extent();
        log::info!(
            "Created swap chain {:?}: {}x{}, {} buffer(s){}",
            id,
            width,
            height,
            chain.buffer_count(),
            if params.is_fullscreen { ", fullscreen" } else { "" }
        );

        self.swap_chains.push((id, chain));
        Ok(id)
    }

    pub fn swap_chain(&self, id: SwapChainId) -> Option<&SwapChain> {
        self.swap_chains
            .iter()
            .find(|(chain_id, _)| *chain_id == id)
            .map(|(_, chain)| chain)
    }

    /// Swap chain with access to the device state resize and present need
    pub fn swap_chain_mut(&mut self, id: SwapChainId) -> Option<SwapChainMut<'_>> {
        let chain = self
            .swap_chains
            .iter_mut()
            .find(|(chain_id, _)| *chain_id == id)
            .map(|(_, chain)| chain)?;

        Some(SwapChainMut::new(
            chain,
            &mut self.resources,
            self.backend.as_mut(),
            &mut self.context_state,
        ))
    }

    /// Release the back buffer pair, then the presentation surface.
    pub fn remove_swap_chain(&mut self, id: SwapChainId) -> bool {
        let Some(index) = self.swap_chains.iter().position(|(chain_id, _)| *chain_id == id) else {
            return false;
        };
        let (_, mut chain) = self.swap_chains.remove(index);

        if let Err(e) = self.backend.context().flush() {
            log::warn!("Flush before swap chain removal failed: {}", e);
        }
        chain.release_back_buffer(
            &mut self.resources,
            self.backend.context(),
            &mut self.context_state,
        );
        log::info!("Removed swap chain {:?}", id);
        true
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    /// Release swap chains, the context and every tracked resource, then the
    /// backend device itself. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        log::info!("Shutting down render device {}...", self.id);

        if let Err(e) = self.backend.wait_idle() {
            log::warn!("Wait for idle failed during shutdown: {}", e);
        }

        // 1. Swap chains (back buffer pairs, then surfaces)
        for (_, mut chain) in self.swap_chains.drain(..) {
            chain.release_back_buffer(
                &mut self.resources,
                self.backend.context(),
                &mut self.context_state,
            );
        }

        // 2. Immediate context
        self.backend.context().clear_state();
        self.context_state = PipelineState::default();

        // 3. Everything still tracked, whatever its count
        let swept = self.resources.force_release_all();
        if swept > 0 {
            log::info!("Force-released {} outstanding resource(s)", swept);
        }
        self.resources.clear();

        // 4. The native device
        self.backend.shutdown();
        log::info!("Render device {} shut down", self.id);
    }

    /// Log objects still alive on this device and in the backend.
    pub fn report_live_objects(&self) -> usize {
        let mut live = 0;
        if self.params.enable_debugging {
            live += debug::report_live_objects(self.id);
        }
        live + self.backend.report_live_objects()
    }

    fn ensure_active(&self) -> RhiResult<()> {
        if self.shut_down {
            Err(RhiError::DeviceShutDown)
        } else {
            Ok(())
        }
    }
}

impl Drop for RenderDevice {
    fn drop(&mut self) {
        self.shutdown();
        if self.params.enable_debugging {
            debug::detach(self.id);
        }
    }
}

fn check_initial_data(usage: BufferUsage, capacity: usize, data: Option<&[u8]>) -> RhiResult<()> {
    match data {
        None if usage == BufferUsage::Immutable => Err(RhiError::InvalidDescriptor(
            "immutable resources need initial data".into(),
        )),
        Some([]) if usage == BufferUsage::Immutable => Err(RhiError::InvalidDescriptor(
            "immutable resources need non-empty initial data".into(),
        )),
        Some(data) if data.len() > capacity => Err(RhiError::InvalidDescriptor(format!(
            "{} bytes of initial data for a {} byte resource",
            data.len(),
            capacity
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::testing::{test_device, Command};
    use crate::rhi::types::{RenderFormat, APPEND_ALIGNED_ELEMENT};

    fn vertex_shader() -> ShaderBytecode {
        ShaderBytecode::new("test", ShaderStage::Vertex, "main", vec![0x0723_0203], vec![0, 1])
    }

    fn elements() -> Vec<InputElement> {
        vec![
            InputElement::new("POSITION", 0, RenderFormat::R32G32Float, APPEND_ALIGNED_ELEMENT),
            InputElement::new("COLOR", 0, RenderFormat::R32G32B32Float, APPEND_ALIGNED_ELEMENT),
        ]
    }

    #[test]
    fn create_and_release_leaves_registry_empty() {
        let (mut device, recorder) = test_device();
        let vb = device
            .create_vertex_buffer(3, 20, BufferUsage::Dynamic, None)
            .unwrap();
        let cb = device
            .create_constant_buffer(64, BufferUsage::Dynamic, None)
            .unwrap();
        let vs = device.create_vertex_shader(&vertex_shader()).unwrap();
        let layout = device.create_input_layout(&elements(), &vertex_shader()).unwrap();
        device.add_ref(cb);

        assert_eq!(device.live_resource_count(), 4);
        assert_eq!(device.release_resource(vb), 0);
        assert_eq!(device.release_resource(cb), 1);
        assert_eq!(device.release_resource(cb), 0);
        assert_eq!(device.release_resource(vs), 0);
        assert_eq!(device.release_resource(layout), 0);

        assert_eq!(device.live_resource_count(), 0);
        assert!(device.resources().list().head().is_none());
        assert!(device.resources().list().tail().is_none());
        assert_eq!(recorder.live_natives(), 0);
    }

    #[test]
    fn shutdown_forces_every_count_to_zero() {
        let (mut device, recorder) = test_device();
        let texture = device
            .create_texture_2d(
                &TextureDesc::render_target(64, 64, RenderFormat::R8G8B8A8Unorm),
                None,
            )
            .unwrap();
        let target = device.create_render_target(texture).unwrap();
        let cb = device
            .create_constant_buffer(16, BufferUsage::Dynamic, None)
            .unwrap();
        for _ in 0..5 {
            device.add_ref(cb);
        }
        device.add_ref(target);
        device.create_swap_chain(&SwapChainParams::default()).unwrap();

        device.shutdown();

        assert_eq!(device.live_resource_count(), 0);
        assert_eq!(device.ref_count(cb), None);
        assert_eq!(device.ref_count(texture), None);
        assert_eq!(recorder.live_natives(), 0);
        assert!(recorder.commands().contains(&Command::Shutdown));
    }

    #[test]
    fn shutdown_is_idempotent_and_blocks_creation() {
        let (mut device, recorder) = test_device();
        device.shutdown();
        device.shutdown();

        let shutdowns = recorder
            .commands()
            .iter()
            .filter(|c| **c == Command::Shutdown)
            .count();
        assert_eq!(shutdowns, 1);
        assert!(matches!(
            device.create_constant_buffer(16, BufferUsage::Dynamic, None),
            Err(RhiError::DeviceShutDown)
        ));
    }

    #[test]
    fn render_target_holds_texture_reference() {
        let (mut device, _recorder) = test_device();
        let texture = device
            .create_texture_2d(&TextureDesc::render_target(8, 8, RenderFormat::R8G8B8A8Unorm), None)
            .unwrap();
        let target = device.create_render_target(texture).unwrap();

        assert_eq!(device.ref_count(texture), Some(2));
        assert_eq!(device.release_resource(texture), 1);
        assert!(device.is_tracked(texture));
        assert_eq!(device.release_resource(target), 0);
        assert!(!device.is_tracked(texture));
    }

    #[test]
    fn render_target_needs_bind_flag() {
        let (mut device, _recorder) = test_device();
        let mut desc = TextureDesc::render_target(8, 8, RenderFormat::R8G8B8A8Unorm);
        desc.bind_flags = BindFlags::SHADER_RESOURCE;
        let texture = device.create_texture_2d(&desc, None).unwrap();

        assert!(matches!(
            device.create_render_target(texture),
            Err(RhiError::InvalidDescriptor(_))
        ));
        assert_eq!(device.ref_count(texture), Some(1));
    }

    #[test]
    fn immutable_buffers_need_initial_data() {
        let (mut device, _recorder) = test_device();
        assert!(device
            .create_vertex_buffer(3, 12, BufferUsage::Immutable, None)
            .is_err());
        assert!(device
            .create_vertex_buffer(3, 12, BufferUsage::Immutable, Some(&[0u8; 37]))
            .is_err());
        let err = device
            .create_vertex_buffer(3, 12, BufferUsage::Immutable, Some(&[]))
            .unwrap_err();
        assert!(err.to_string().contains("non-empty"));
        assert_eq!(device.live_resource_count(), 0);

        assert!(device
            .create_vertex_buffer(3, 12, BufferUsage::Default, Some(&[]))
            .is_ok());
    }

    #[test]
    fn oversized_constant_buffer_is_rejected() {
        let (mut device, recorder) = test_device();
        let err = device
            .create_constant_buffer(u32::MAX - 3, BufferUsage::Dynamic, None)
            .unwrap_err();
        assert!(matches!(err, RhiError::InvalidDescriptor(_)));
        assert_eq!(recorder.live_natives(), 0);
        assert_eq!(device.live_resource_count(), 0);
    }

    #[test]
    fn buffer_descriptors_are_completed() {
        let (mut device, _recorder) = test_device();
        let cb = device
            .create_constant_buffer(20, BufferUsage::Dynamic, None)
            .unwrap();
        let vb = device
            .create_vertex_buffer(4, 12, BufferUsage::Default, None)
            .unwrap();

        let cb_desc = device.buffer_desc(cb).unwrap();
        assert_eq!(cb_desc.size_in_bytes, 32);
        assert_eq!(cb_desc.cpu_access, CpuAccessFlags::WRITE);
        assert_eq!(cb_desc.bind_flags, BindFlags::CONSTANT_BUFFER);

        let vb_desc = device.buffer_desc(vb).unwrap();
        assert_eq!(vb_desc.size_in_bytes, 48);
        assert_eq!(vb_desc.stride_in_bytes, 12);
        assert!(vb_desc.cpu_access.is_empty());
    }

    #[test]
    fn input_layout_must_cover_shader_inputs() {
        let (mut device, _recorder) = test_device();
        let short = vec![InputElement::new(
            "POSITION",
            0,
            RenderFormat::R32G32Float,
            APPEND_ALIGNED_ELEMENT,
        )];

        let err = device.create_input_layout(&short, &vertex_shader()).unwrap_err();
        assert!(err.to_string().contains("location 1"));
        assert!(device.create_input_layout(&elements(), &vertex_shader()).is_ok());
    }

    #[test]
    fn input_layout_offset_overflow_is_an_error() {
        let (mut device, recorder) = test_device();
        let natives = recorder.live_natives();
        let elements = vec![
            InputElement::new("POSITION", 0, RenderFormat::R32G32B32A32Float, u32::MAX - 4),
            InputElement::new("COLOR", 0, RenderFormat::R32G32B32Float, APPEND_ALIGNED_ELEMENT),
        ];

        let err = device
            .create_input_layout(&elements, &vertex_shader())
            .unwrap_err();
        assert!(matches!(err, RhiError::InvalidDescriptor(_)));
        assert_eq!(recorder.live_natives(), natives);
    }

    #[test]
    fn shader_stage_must_match() {
        let (mut device, _recorder) = test_device();
        assert!(device.create_pixel_shader(&vertex_shader()).is_err());
        assert!(device.create_vertex_shader(&vertex_shader()).is_ok());
    }

    #[test]
    fn swap_chain_needs_a_buffer() {
        let (mut device, _recorder) = test_device();
        let params = SwapChainParams {
            buffer_count: 0,
            ..Default::default()
        };
        assert!(device.create_swap_chain(&params).is_err());
    }
}
