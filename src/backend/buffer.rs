// GPU buffers for vertex, constant and staging data
//
// CPU-writable usages live in persistently mapped host memory; the rest are
// device local and filled through a staging copy at creation.

use anyhow::{Context, Result};
use ash::vk;
use ash::vk::Handle;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use std::any::Any;
use std::rc::Rc;
use std::sync::Arc;

use super::convert;
use super::VulkanDevice;
use crate::rhi::{BufferDesc, BufferUsage, NativeResource};

pub struct BufferResource {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl BufferResource {
    pub fn create(
        device: &Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory: BufferUsage,
        name: &str,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        let mut resource = Self {
            buffer,
            size,
            allocation: None,
            device: device.clone(),
        };

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
        let allocation = match device.allocator.lock().as_mut() {
            Some(allocator) => allocator
                .allocate(&AllocationCreateDesc {
                    name,
                    requirements,
                    location: convert::memory_location(memory),
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .context("Failed to allocate buffer memory"),
            None => Err(anyhow::anyhow!("Allocator already destroyed")),
        };
        let allocation = allocation?;

        unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        }
        .context("Failed to bind buffer memory")?;
        resource.allocation = Some(allocation);

        Ok(resource)
    }

    /// Host view of a CPU-visible buffer
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()?
            .mapped_ptr()
            .map(|ptr| ptr.as_ptr().cast::<u8>())
    }

    /// Copy `data` to the start of a CPU-visible buffer.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        anyhow::ensure!(
            data.len() as vk::DeviceSize <= self.size,
            "{} bytes written to a {} byte buffer",
            data.len(),
            self.size
        );
        let ptr = self.mapped_ptr().context("Buffer is not host visible")?;
        unsafe { ptr.copy_from_nonoverlapping(data.as_ptr(), data.len()) };
        Ok(())
    }
}

impl Drop for BufferResource {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
        if let (Some(allocation), Some(allocator)) =
            (self.allocation.take(), self.device.allocator.lock().as_mut())
        {
            if let Err(e) = allocator.free(allocation) {
                log::warn!("Failed to free buffer memory: {}", e);
            }
        }
    }
}

/// Native behind a Buffer handle
pub struct VulkanBuffer {
    pub resource: Rc<BufferResource>,
    pub usage: BufferUsage,
}

impl VulkanBuffer {
    pub fn create(
        device: &Arc<VulkanDevice>,
        desc: &BufferDesc,
        initial_data: Option<&[u8]>,
    ) -> Result<Self> {
        let size = desc.size_in_bytes as vk::DeviceSize;
        let resource = BufferResource::create(
            device,
            size,
            convert::buffer_usage(desc.bind_flags),
            desc.usage,
            "buffer",
        )?;

        match initial_data {
            Some(data) if desc.usage.is_cpu_writable() => resource.write(data)?,
            Some(data) => {
                let staging = BufferResource::create(
                    device,
                    data.len() as vk::DeviceSize,
                    vk::BufferUsageFlags::TRANSFER_SRC,
                    BufferUsage::Staging,
                    "buffer staging",
                )?;
                staging.write(data)?;

                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: data.len() as vk::DeviceSize,
                };
                device.one_time_submit(|cb| unsafe {
                    device
                        .device
                        .cmd_copy_buffer(cb, staging.buffer, resource.buffer, &[region]);
                })?;
            }
            None => {}
        }

        Ok(Self {
            resource: Rc::new(resource),
            usage: desc.usage,
        })
    }

    /// Whole buffer as a byte slice. `None` unless the buffer is host visible.
    pub fn mapped_mut(&mut self) -> Option<&mut [u8]> {
        let ptr = self.mapped_ptr_checked()?;
        // SAFETY: the mapping is persistent and `size` bytes long; the
        // exclusive borrow of this native is the only CPU path to it.
        Some(unsafe { std::slice::from_raw_parts_mut(ptr, self.resource.size as usize) })
    }

    fn mapped_ptr_checked(&self) -> Option<*mut u8> {
        if self.usage.is_cpu_writable() {
            self.resource.mapped_ptr()
        } else {
            None
        }
    }
}

impl NativeResource for VulkanBuffer {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn raw_handle(&self) -> u64 {
        self.resource.buffer.as_raw()
    }
}
