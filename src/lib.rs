// =============================================================================
// RENDER RHI - Render hardware interface over a single Vulkan backend
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Rhi (backend selected once at startup)                         │
// │    └── RenderDevice (resource registry + shader compiler)       │
// │          ├── SwapChain (back buffer / render target pair)       │
// │          └── RenderContext (immediate pipeline-state cursor)    │
// │                └── DeviceBackend / ContextBackend (Vulkan)      │
// └─────────────────────────────────────────────────────────────────┘
//
// Every GPU object created through a device lives in that device's tracking
// list until its reference count reaches zero. Shutdown force-releases
// whatever is still tracked before the native device goes away.
//
// =============================================================================

pub mod backend;
pub mod config;
pub mod rhi;

pub use rhi::{
    BindFlags, Buffer, BufferDesc, BufferUsage, CpuAccessFlags, DeviceId, GraphicsApi, InputElement,
    InputLayout, PixelShader, PrimitiveTopology, RenderContext, RenderDevice, RenderDeviceParams,
    RenderFormat, RenderResource, RenderTarget, Rhi, RhiError, RhiResult, ShaderBytecode,
    ShaderStage, SwapChain, SwapChainId, SwapChainParams, Texture2D, TextureDesc, VertexShader,
    Viewport, WindowHandle, APPEND_ALIGNED_ELEMENT,
};
