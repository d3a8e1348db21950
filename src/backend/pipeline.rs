// Graphics pipeline creation and caching
//
// The RHI binds shaders, input layout and topology separately; Vulkan
// bakes them into one pipeline object. Pipelines are built on first draw
// with a given combination and cached by the ids of the objects involved.
// Object ids are never reused, so an entry whose shaders are gone can never
// be hit again and is destroyed once the GPU is idle.
//
// Resource binding: one push-descriptor set of uniform buffers.
//   binding 0..8  -> vertex constant buffer slots
//   binding 8..16 -> pixel constant buffer slots

use anyhow::{Context, Result};
use ash::vk;
use std::collections::HashMap;
use std::hash::Hash;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use super::convert;
use super::shader::{InputLayoutResource, ShaderModule};
use super::VulkanDevice;

/// Constant buffer slots per shader stage
pub const CONSTANT_BUFFER_SLOTS: u32 = 8;

/// Descriptor binding of a pixel-stage constant buffer slot 0
pub const PIXEL_BINDING_BASE: u32 = CONSTANT_BUFFER_SLOTS;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub vertex_shader: u64,
    pub pixel_shader: u64,
    /// 0 when drawing without vertex input
    pub input_layout: u64,
    pub vertex_stride: u32,
    pub topology: vk::PrimitiveTopology,
    pub color_formats: Vec<vk::Format>,
}

struct CachedPipeline<S = ShaderModule> {
    pipeline: vk::Pipeline,
    shaders: [Weak<S>; 2],
}

impl<S> CachedPipeline<S> {
    fn new(pipeline: vk::Pipeline, vertex_shader: &Rc<S>, pixel_shader: &Rc<S>) -> Self {
        Self {
            pipeline,
            shaders: [Rc::downgrade(vertex_shader), Rc::downgrade(pixel_shader)],
        }
    }

    fn shaders_alive(&self) -> bool {
        self.shaders.iter().all(|shader| shader.strong_count() > 0)
    }
}

/// Remove the entries that lost a shader and hand back their pipelines.
fn take_orphaned<K: Eq + Hash, S>(
    pipelines: &mut HashMap<K, CachedPipeline<S>>,
) -> Vec<vk::Pipeline> {
    let mut orphaned = Vec::new();
    pipelines.retain(|_, cached| {
        let alive = cached.shaders_alive();
        if !alive {
            orphaned.push(cached.pipeline);
        }
        alive
    });
    orphaned
}

pub struct PipelineCache {
    pub layout: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
    pipelines: HashMap<PipelineKey, CachedPipeline>,
    device: Arc<VulkanDevice>,
}

impl PipelineCache {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let bindings: Vec<_> = (0..CONSTANT_BUFFER_SLOTS * 2)
            .map(|binding| {
                let stage = if binding < PIXEL_BINDING_BASE {
                    vk::ShaderStageFlags::VERTEX
                } else {
                    vk::ShaderStageFlags::FRAGMENT
                };
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(stage)
                    .build()
            })
            .collect();

        let set_layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR)
            .bindings(&bindings);
        let set_layout =
            unsafe { device.device.create_descriptor_set_layout(&set_layout_info, None) }
                .context("Failed to create descriptor set layout")?;

        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        let layout = match unsafe { device.device.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(e).context("Failed to create pipeline layout");
            }
        };

        Ok(Self {
            layout,
            set_layout,
            pipelines: HashMap::new(),
            device: device.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn get_or_create(
        &mut self,
        key: PipelineKey,
        vertex_shader: &Rc<ShaderModule>,
        pixel_shader: &Rc<ShaderModule>,
        input_layout: Option<&InputLayoutResource>,
    ) -> Result<vk::Pipeline> {
        if let Some(cached) = self.pipelines.get(&key) {
            return Ok(cached.pipeline);
        }

        let pipeline = self.create(&key, vertex_shader, pixel_shader, input_layout)?;
        log::debug!(
            "Created pipeline #{} (vs {}, ps {}, {:?})",
            self.pipelines.len() + 1,
            key.vertex_shader,
            key.pixel_shader,
            key.topology
        );
        self.pipelines
            .insert(key, CachedPipeline::new(pipeline, vertex_shader, pixel_shader));
        Ok(pipeline)
    }

    /// Destroy pipelines built from shaders that have since been released.
    /// The GPU must be done with every submitted command buffer.
    pub fn evict_released(&mut self) -> usize {
        let orphaned = take_orphaned(&mut self.pipelines);
        for &pipeline in &orphaned {
            unsafe { self.device.device.destroy_pipeline(pipeline, None) };
        }
        if !orphaned.is_empty() {
            log::debug!(
                "Evicted {} pipeline(s), {} cached",
                orphaned.len(),
                self.pipelines.len()
            );
        }
        orphaned.len()
    }

    fn create(
        &self,
        key: &PipelineKey,
        vertex_shader: &ShaderModule,
        pixel_shader: &ShaderModule,
        input_layout: Option<&InputLayoutResource>,
    ) -> Result<vk::Pipeline> {
        let shader_stages = [vertex_shader, pixel_shader].map(|shader| {
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(shader.stage_flags())
                .module(shader.module)
                .name(&shader.entry_point)
                .build()
        });

        // Vertex input: one interleaved binding, stride set by the bound buffer
        let bindings = [vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(key.vertex_stride)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()];
        let attributes: Vec<_> = input_layout
            .map(|layout| {
                layout
                    .desc
                    .attributes
                    .iter()
                    .map(|attribute| {
                        vk::VertexInputAttributeDescription::builder()
                            .binding(0)
                            .location(attribute.location)
                            .format(convert::format(attribute.format))
                            .offset(attribute.offset)
                            .build()
                    })
                    .collect()
            })
            .unwrap_or_default();
        let vertex_input_info = if attributes.is_empty() {
            vk::PipelineVertexInputStateCreateInfo::builder()
        } else {
            vk::PipelineVertexInputStateCreateInfo::builder()
                .vertex_binding_descriptions(&bindings)
                .vertex_attribute_descriptions(&attributes)
        };

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(key.topology)
            .primitive_restart_enable(false);

        // Viewport and scissor are set per draw
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        // Color blending (no blending, opaque)
        let color_blend_attachments: Vec<_> = key
            .color_formats
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::builder()
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
                    .blend_enable(false)
                    .build()
            })
            .collect();
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        // Dynamic rendering: attachment formats instead of a render pass
        let mut rendering_info =
            vk::PipelineRenderingCreateInfo::builder().color_attachment_formats(&key.color_formats);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(self.layout)
            .push_next(&mut rendering_info)
            .build();

        let pipelines = unsafe {
            self.device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| e)
                .context("Failed to create graphics pipeline")?
        };

        Ok(pipelines[0])
    }

    /// Destroy every cached pipeline; the layouts stay valid.
    pub fn clear(&mut self) {
        for (_, cached) in self.pipelines.drain() {
            unsafe { self.device.device.destroy_pipeline(cached.pipeline, None) };
        }
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        self.clear();
        unsafe {
            self.device.device.destroy_pipeline_layout(self.layout, None);
            self.device
                .device
                .destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn entries_losing_a_shader_are_orphaned() {
        let vertex = Rc::new("vs");
        let pixel = Rc::new("ps");
        let reloaded = Rc::new("ps reloaded");
        let mut pipelines = HashMap::new();
        pipelines.insert(1, CachedPipeline::new(vk::Pipeline::from_raw(1), &vertex, &pixel));
        pipelines.insert(2, CachedPipeline::new(vk::Pipeline::from_raw(2), &vertex, &reloaded));

        assert!(take_orphaned(&mut pipelines).is_empty());
        assert_eq!(pipelines.len(), 2);

        drop(pixel);
        assert_eq!(take_orphaned(&mut pipelines), vec![vk::Pipeline::from_raw(1)]);
        assert!(pipelines.contains_key(&2));

        drop(vertex);
        assert_eq!(take_orphaned(&mut pipelines), vec![vk::Pipeline::from_raw(2)]);
        assert!(pipelines.is_empty());
    }
}
