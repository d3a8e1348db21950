// Vocabulary -> Vulkan translation
//
// Pure mappings from RHI enums and flags to ash types. Everything the
// backend creates goes through here, so unsupported combinations are
// rejected in one place.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::rhi::{BindFlags, BufferUsage, PrimitiveTopology, RenderFormat};

pub fn format(format: RenderFormat) -> vk::Format {
    match format {
        RenderFormat::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        RenderFormat::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
        RenderFormat::R32Float => vk::Format::R32_SFLOAT,
        RenderFormat::R32G32Float => vk::Format::R32G32_SFLOAT,
        RenderFormat::R32G32B32Float => vk::Format::R32G32B32_SFLOAT,
        RenderFormat::R32G32B32A32Float => vk::Format::R32G32B32A32_SFLOAT,
    }
}

/// Surface formats a swap chain can expose as a back buffer
pub fn surface_format(format: vk::Format) -> Option<RenderFormat> {
    match format {
        vk::Format::B8G8R8A8_UNORM => Some(RenderFormat::B8G8R8A8Unorm),
        vk::Format::R8G8B8A8_UNORM => Some(RenderFormat::R8G8B8A8Unorm),
        _ => None,
    }
}

pub fn topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
    }
}

/// Buffer usage for the given bind flags. Every buffer can be a copy
/// source and destination so uploads never need a second buffer kind.
pub fn buffer_usage(bind_flags: BindFlags) -> vk::BufferUsageFlags {
    let mut usage = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    if bind_flags.contains(BindFlags::VERTEX_BUFFER) {
        usage |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if bind_flags.contains(BindFlags::INDEX_BUFFER) {
        usage |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if bind_flags.contains(BindFlags::CONSTANT_BUFFER) {
        usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if bind_flags.intersects(BindFlags::SHADER_RESOURCE | BindFlags::UNORDERED_ACCESS) {
        usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    usage
}

pub fn image_usage(bind_flags: BindFlags) -> vk::ImageUsageFlags {
    // Clears are copies into the image
    let mut usage = vk::ImageUsageFlags::TRANSFER_DST;
    if bind_flags.contains(BindFlags::RENDER_TARGET) {
        usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if bind_flags.contains(BindFlags::DEPTH_STENCIL) {
        usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if bind_flags.contains(BindFlags::SHADER_RESOURCE) {
        usage |= vk::ImageUsageFlags::SAMPLED;
    }
    if bind_flags.contains(BindFlags::UNORDERED_ACCESS) {
        usage |= vk::ImageUsageFlags::STORAGE;
    }
    usage
}

pub fn memory_location(usage: BufferUsage) -> MemoryLocation {
    match usage {
        BufferUsage::Dynamic | BufferUsage::Staging => MemoryLocation::CpuToGpu,
        BufferUsage::Default | BufferUsage::Immutable => MemoryLocation::GpuOnly,
    }
}

pub fn viewport(viewport: &crate::rhi::Viewport) -> vk::Viewport {
    vk::Viewport {
        x: viewport.x,
        y: viewport.y,
        width: viewport.width,
        height: viewport.height,
        min_depth: viewport.min_depth,
        max_depth: viewport.max_depth,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_buffers_are_uniform_buffers() {
        let usage = buffer_usage(BindFlags::CONSTANT_BUFFER);
        assert!(usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER));
        assert!(usage.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(!usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
    }

    #[test]
    fn render_targets_can_be_cleared() {
        let usage = image_usage(BindFlags::RENDER_TARGET);
        assert!(usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
        assert!(usage.contains(vk::ImageUsageFlags::TRANSFER_DST));
        assert!(!usage.contains(vk::ImageUsageFlags::SAMPLED));
    }

    #[test]
    fn cpu_writable_usages_live_in_host_memory() {
        assert_eq!(memory_location(BufferUsage::Dynamic), MemoryLocation::CpuToGpu);
        assert_eq!(memory_location(BufferUsage::Staging), MemoryLocation::CpuToGpu);
        assert_eq!(memory_location(BufferUsage::Immutable), MemoryLocation::GpuOnly);
    }

    #[test]
    fn only_eight_bit_color_surfaces_are_exposed() {
        assert_eq!(
            surface_format(format(RenderFormat::B8G8R8A8Unorm)),
            Some(RenderFormat::B8G8R8A8Unorm)
        );
        assert_eq!(surface_format(vk::Format::R16G16B16A16_SFLOAT), None);
    }
}
