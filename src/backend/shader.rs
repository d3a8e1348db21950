// Shader modules and input layouts
//
// Vulkan takes the SPIR-V words the shader compiler produced as-is. Input
// layouts have no Vulkan object of their own; they are folded into the
// graphics pipeline at draw time.

use anyhow::{Context, Result};
use ash::vk;
use ash::vk::Handle;
use std::any::Any;
use std::ffi::CString;
use std::rc::Rc;
use std::sync::Arc;

use super::VulkanDevice;
use crate::rhi::{InputLayoutDesc, NativeResource, ShaderBytecode, ShaderStage};

pub struct ShaderModule {
    pub id: u64,
    pub module: vk::ShaderModule,
    pub stage: ShaderStage,
    pub entry_point: CString,
    device: Arc<VulkanDevice>,
}

impl ShaderModule {
    pub fn create(device: &Arc<VulkanDevice>, bytecode: &ShaderBytecode) -> Result<Self> {
        let entry_point = CString::new(bytecode.entry_point())
            .context("Shader entry point contains a NUL byte")?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(bytecode.words());
        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .with_context(|| format!("Failed to create shader module '{}'", bytecode.name()))?;

        Ok(Self {
            id: device.next_object_id(),
            module,
            stage: bytecode.stage(),
            entry_point,
            device: device.clone(),
        })
    }

    pub fn stage_flags(&self) -> vk::ShaderStageFlags {
        match self.stage {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Pixel => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_shader_module(self.module, None) };
    }
}

/// Native behind VertexShader and PixelShader handles
pub struct VulkanShader {
    pub module: Rc<ShaderModule>,
}

impl NativeResource for VulkanShader {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn raw_handle(&self) -> u64 {
        self.module.module.as_raw()
    }
}

pub struct InputLayoutResource {
    pub id: u64,
    pub desc: InputLayoutDesc,
}

/// Native behind an InputLayout handle
pub struct VulkanInputLayout {
    pub layout: Rc<InputLayoutResource>,
}

impl NativeResource for VulkanInputLayout {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn raw_handle(&self) -> u64 {
        self.layout.id
    }
}
