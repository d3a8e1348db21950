// Resource & format vocabulary
//
// Closed enums shared by every layer of the RHI. The core never sees
// backend-native constants; backends translate these at creation time.

use bitflags::bitflags;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use super::error::{RhiError, RhiResult};

/// Byte offset sentinel: place the element right after the previous one.
pub const APPEND_ALIGNED_ELEMENT: u32 = u32::MAX;

/// Pixel / vertex attribute formats understood by every backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderFormat {
    R8G8B8A8Unorm,
    B8G8R8A8Unorm,
    R32Float,
    R32G32Float,
    R32G32B32Float,
    R32G32B32A32Float,
}

impl RenderFormat {
    pub const fn size_in_bytes(self) -> u32 {
        match self {
            RenderFormat::R8G8B8A8Unorm | RenderFormat::B8G8R8A8Unorm | RenderFormat::R32Float => 4,
            RenderFormat::R32G32Float => 8,
            RenderFormat::R32G32B32Float => 12,
            RenderFormat::R32G32B32A32Float => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

/// How a resource is expected to be accessed by the GPU and CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferUsage {
    /// GPU read/write, no CPU access
    #[default]
    Default,
    /// GPU read only, contents fixed at creation
    Immutable,
    /// GPU read, CPU write through Map/Unmap
    Dynamic,
    /// CPU readable and writable copy source/destination
    Staging,
}

impl BufferUsage {
    /// Only dynamic and staging resources may be mapped for writing.
    pub const fn is_cpu_writable(self) -> bool {
        matches!(self, BufferUsage::Dynamic | BufferUsage::Staging)
    }
}

bitflags! {
    /// Pipeline stages a resource may be bound to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BindFlags: u32 {
        const VERTEX_BUFFER = 1 << 0;
        const INDEX_BUFFER = 1 << 1;
        const CONSTANT_BUFFER = 1 << 2;
        const DEPTH_STENCIL = 1 << 3;
        const RENDER_TARGET = 1 << 4;
        const SHADER_RESOURCE = 1 << 5;
        const UNORDERED_ACCESS = 1 << 6;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CpuAccessFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl CpuAccessFlags {
    /// CPU access implied by a usage when the caller leaves it empty
    pub fn for_usage(usage: BufferUsage) -> Self {
        match usage {
            BufferUsage::Dynamic => CpuAccessFlags::WRITE,
            BufferUsage::Staging => CpuAccessFlags::READ | CpuAccessFlags::WRITE,
            BufferUsage::Default | BufferUsage::Immutable => CpuAccessFlags::empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// One vertex attribute slot of an input layout
#[derive(Debug, Clone, PartialEq)]
pub struct InputElement {
    pub semantic_name: String,
    pub semantic_index: u32,
    pub format: RenderFormat,
    /// Offset inside the vertex, or [`APPEND_ALIGNED_ELEMENT`]
    pub byte_offset: u32,
}

impl InputElement {
    pub fn new(
        semantic_name: impl Into<String>,
        semantic_index: u32,
        format: RenderFormat,
        byte_offset: u32,
    ) -> Self {
        Self {
            semantic_name: semantic_name.into(),
            semantic_index,
            format,
            byte_offset,
        }
    }
}

/// Input layout with every append offset resolved
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputLayoutDesc {
    pub attributes: Vec<VertexAttribute>,
    /// Smallest vertex size covering every attribute
    pub stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    /// Shader input location; equal to the element's index in the layout
    pub location: u32,
    pub format: RenderFormat,
    pub offset: u32,
}

impl InputLayoutDesc {
    /// Fails when an element would end past `u32::MAX` bytes.
    pub fn from_elements(elements: &[InputElement]) -> RhiResult<Self> {
        let mut cursor = 0u32;
        let mut stride = 0u32;
        let mut attributes = Vec::with_capacity(elements.len());

        for (location, element) in elements.iter().enumerate() {
            let offset = if element.byte_offset == APPEND_ALIGNED_ELEMENT {
                cursor
            } else {
                element.byte_offset
            };
            cursor = offset
                .checked_add(element.format.size_in_bytes())
                .ok_or_else(|| {
                    RhiError::InvalidDescriptor(format!(
                        "input element '{}' at offset {} overflows the vertex",
                        element.semantic_name, offset
                    ))
                })?;
            stride = stride.max(cursor);
            attributes.push(VertexAttribute {
                location: location as u32,
                format: element.format,
                offset,
            });
        }

        Ok(Self { attributes, stride })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    pub size_in_bytes: u32,
    /// Element size for structured/vertex buffers, 0 otherwise
    pub stride_in_bytes: u32,
    pub usage: BufferUsage,
    pub bind_flags: BindFlags,
    /// Derived from `usage` when left empty
    pub cpu_access: CpuAccessFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub array_size: u32,
    pub mip_levels: u32,
    pub format: RenderFormat,
    pub usage: BufferUsage,
    pub bind_flags: BindFlags,
}

impl TextureDesc {
    /// Single-mip 2D texture that can be rendered to
    pub fn render_target(width: u32, height: u32, format: RenderFormat) -> Self {
        Self {
            width,
            height,
            array_size: 1,
            mip_levels: 1,
            format,
            usage: BufferUsage::Default,
            bind_flags: BindFlags::RENDER_TARGET | BindFlags::SHADER_RESOURCE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RenderDeviceParams {
    /// Enables the backend validation layer and live-object reporting
    pub enable_debugging: bool,
}

/// Platform window a swap chain presents into
#[derive(Debug, Clone, Copy)]
pub struct WindowHandle {
    pub window: RawWindowHandle,
    pub display: RawDisplayHandle,
}

#[derive(Debug, Clone)]
pub struct SwapChainParams {
    pub output_window: Option<WindowHandle>,
    pub buffer_count: u32,
    /// 0 = size of the output window
    pub width: u32,
    /// 0 = size of the output window
    pub height: u32,
    pub is_fullscreen: bool,
    /// Vertical blanks to wait for on present; 0 presents immediately
    pub sync_interval: u32,
}

impl Default for SwapChainParams {
    fn default() -> Self {
        Self {
            output_window: None,
            buffer_count: 2,
            width: 0,
            height: 0,
            is_fullscreen: false,
            sync_interval: 1,
        }
    }
}

/// Process-unique identity of a render device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u32);

impl DeviceId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_offsets_follow_previous_element() {
        let layout = InputLayoutDesc::from_elements(&[
            InputElement::new("POSITION", 0, RenderFormat::R32G32Float, APPEND_ALIGNED_ELEMENT),
            InputElement::new("COLOR", 0, RenderFormat::R32G32B32Float, APPEND_ALIGNED_ELEMENT),
            InputElement::new("TEXCOORD", 0, RenderFormat::R32G32Float, APPEND_ALIGNED_ELEMENT),
        ])
        .unwrap();

        let offsets: Vec<_> = layout.attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 8, 20]);
        assert_eq!(layout.stride, 28);
        assert_eq!(layout.attributes[2].location, 2);
    }

    #[test]
    fn explicit_offsets_are_kept() {
        let layout = InputLayoutDesc::from_elements(&[
            InputElement::new("COLOR", 0, RenderFormat::R8G8B8A8Unorm, 16),
            InputElement::new("POSITION", 0, RenderFormat::R32G32B32A32Float, 0),
        ])
        .unwrap();

        assert_eq!(layout.attributes[0].offset, 16);
        assert_eq!(layout.attributes[1].offset, 0);
        assert_eq!(layout.stride, 20);
    }

    #[test]
    fn offsets_past_u32_max_are_rejected() {
        let err = InputLayoutDesc::from_elements(&[InputElement::new(
            "POSITION",
            0,
            RenderFormat::R32G32B32A32Float,
            u32::MAX - 4,
        )])
        .unwrap_err();
        assert!(matches!(err, RhiError::InvalidDescriptor(_)));

        // the append cursor overflows on the element after the last one that fits
        let err = InputLayoutDesc::from_elements(&[
            InputElement::new("COLOR", 0, RenderFormat::R8G8B8A8Unorm, u32::MAX - 8),
            InputElement::new("TEXCOORD", 0, RenderFormat::R32G32Float, APPEND_ALIGNED_ELEMENT),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("TEXCOORD"));
    }

    #[test]
    fn only_dynamic_and_staging_are_writable() {
        assert!(BufferUsage::Dynamic.is_cpu_writable());
        assert!(BufferUsage::Staging.is_cpu_writable());
        assert!(!BufferUsage::Immutable.is_cpu_writable());
        assert!(!BufferUsage::Default.is_cpu_writable());
        assert_eq!(CpuAccessFlags::for_usage(BufferUsage::Dynamic), CpuAccessFlags::WRITE);
        assert!(CpuAccessFlags::for_usage(BufferUsage::Immutable).is_empty());
    }

    #[test]
    fn viewport_defaults_to_full_depth_range() {
        let viewport = Viewport::new(1280.0, 720.0);
        assert_eq!(viewport.min_depth, 0.0);
        assert_eq!(viewport.max_depth, 1.0);
        assert_eq!((viewport.x, viewport.y), (0.0, 0.0));
    }

    #[test]
    fn device_ids_are_unique() {
        let a = DeviceId::next();
        let b = DeviceId::next();
        assert_ne!(a, b);
    }
}
