// Command recorder - the immediate context on Vulkan
//
// Flow per frame:
//   begin (wait fence) -> [acquire] -> clears / draws -> present (submit + queue)
//
// One primary command buffer and one fence. Recording starts lazily on the
// first command that needs it; everything referenced by recorded commands is
// kept alive until the fence says the GPU is done with it. Setters only
// update state, draws resolve it into a cached pipeline.

use anyhow::{Context, Result};
use ash::vk;
use std::any::Any;
use std::rc::Rc;
use std::sync::Arc;

use super::buffer::{BufferResource, VulkanBuffer};
use super::convert;
use super::pipeline::{PipelineCache, PipelineKey, CONSTANT_BUFFER_SLOTS, PIXEL_BINDING_BASE};
use super::shader::{InputLayoutResource, ShaderModule, VulkanInputLayout, VulkanShader};
use super::swapchain::SwapChainImages;
use super::sync::{create_signaled_fence, transition_image};
use super::texture::{ImageSource, RenderTargetViews, VulkanRenderTarget};
use super::VulkanDevice;
use crate::rhi::backend::ContextBackend;
use crate::rhi::{NativeResource, PrimitiveTopology, RhiError, RhiResult, ShaderStage, Viewport};

#[derive(Default)]
struct BoundState {
    viewports: Vec<Viewport>,
    vertex_shader: Option<Rc<ShaderModule>>,
    pixel_shader: Option<Rc<ShaderModule>>,
    vertex_constants: Vec<Option<Rc<BufferResource>>>,
    pixel_constants: Vec<Option<Rc<BufferResource>>>,
    render_targets: Vec<Rc<RenderTargetViews>>,
    topology: PrimitiveTopology,
    input_layout: Option<Rc<InputLayoutResource>>,
    vertex_buffer: Option<(Rc<BufferResource>, u32, u32)>,
}

impl BoundState {
    fn constants_mut(&mut self, stage: ShaderStage) -> &mut Vec<Option<Rc<BufferResource>>> {
        match stage {
            ShaderStage::Vertex => &mut self.vertex_constants,
            ShaderStage::Pixel => &mut self.pixel_constants,
        }
    }
}

/// Attachments of the dynamic rendering scope currently open
struct ActiveRendering {
    views: Vec<vk::ImageView>,
    extent: vk::Extent2D,
}

pub struct CommandRecorder {
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    recording: bool,
    rendering: Option<ActiveRendering>,
    /// Semaphores the next submission waits on (swap chain acquires)
    pending_waits: Vec<vk::Semaphore>,
    /// Objects referenced by recorded or in-flight commands
    in_flight: Vec<Rc<dyn Any>>,
    state: BoundState,
    pipelines: PipelineCache,
    /// First recording failure since the last flush or present
    error: Option<anyhow::Error>,
    device: Arc<VulkanDevice>,
}

impl CommandRecorder {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { device.device.destroy_command_pool(pool, None) };
                return Err(e).context("Failed to allocate command buffer");
            }
        };

        let fence = match create_signaled_fence(&device.device) {
            Ok(fence) => fence,
            Err(e) => {
                unsafe { device.device.destroy_command_pool(pool, None) };
                return Err(e);
            }
        };

        let pipelines = match PipelineCache::new(device) {
            Ok(pipelines) => pipelines,
            Err(e) => {
                unsafe {
                    device.device.destroy_fence(fence, None);
                    device.device.destroy_command_pool(pool, None);
                }
                return Err(e);
            }
        };

        Ok(Self {
            pool,
            command_buffer,
            fence,
            recording: false,
            rendering: None,
            pending_waits: Vec::new(),
            in_flight: Vec::new(),
            state: BoundState::default(),
            pipelines,
            error: None,
            device: device.clone(),
        })
    }

    // =========================================================================
    // SUBMISSION
    // =========================================================================

    fn wait_fence(&mut self) -> Result<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.fence], true, u64::MAX)
        }
        .context("Failed to wait for command fence")?;
        self.in_flight.clear();
        self.pipelines.evict_released();
        Ok(())
    }

    /// Start recording if not already.
    fn begin(&mut self) -> Result<()> {
        if self.recording {
            return Ok(());
        }
        self.wait_fence()?;

        let device = &self.device.device;
        unsafe {
            device.reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(self.command_buffer, &begin_info)?;
        }
        self.recording = true;
        Ok(())
    }

    fn end_rendering(&mut self) {
        if self.rendering.take().is_some() {
            unsafe { self.device.device.cmd_end_rendering(self.command_buffer) };
        }
    }

    fn submit(&mut self, signal: &[vk::Semaphore]) -> Result<()> {
        if !self.recording {
            return Ok(());
        }
        self.end_rendering();
        self.recording = false;

        let device = &self.device.device;
        unsafe { device.end_command_buffer(self.command_buffer) }
            .context("Failed to end command buffer")?;

        let waits: Vec<_> = self.pending_waits.drain(..).collect();
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; waits.len()];
        let command_buffers = [self.command_buffer];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(signal)
            .build();

        unsafe {
            device.reset_fences(&[self.fence])?;
            device
                .queue_submit(self.device.graphics_queue, &[submit], self.fence)
                .context("Failed to submit command buffer")?;
        }
        Ok(())
    }

    fn record_error(&mut self, error: anyhow::Error) {
        log::error!("Command recording failed: {:#}", error);
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn take_error(&mut self) -> RhiResult<()> {
        match self.error.take() {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    // =========================================================================
    // PRESENTATION
    // =========================================================================

    /// Finish the frame for `images`: make sure an image is acquired, move it
    /// to the present layout, submit, and queue it for display.
    pub fn present(&mut self, images: &Rc<SwapChainImages>) -> RhiResult<()> {
        let result = self.present_image(images);
        let recorded = self.take_error();
        result?;
        recorded
    }

    fn present_image(&mut self, images: &Rc<SwapChainImages>) -> Result<()> {
        let index = self.acquire(images)?;

        self.begin()?;
        self.end_rendering();
        let layout = &images.layouts[index as usize];
        transition_image(
            &self.device.device,
            self.command_buffer,
            images.images[index as usize],
            layout.get(),
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        layout.set(vk::ImageLayout::PRESENT_SRC_KHR);

        let render_finished = images.render_finished(index);
        self.in_flight.push(images.clone());
        self.submit(&[render_finished])?;
        images.present(self.device.graphics_queue, render_finished)
    }

    /// Index of the swap chain image this frame renders to, acquiring one
    /// on first use.
    fn acquire(&mut self, images: &Rc<SwapChainImages>) -> Result<u32> {
        if let Some(index) = images.acquired() {
            return Ok(index);
        }
        // The acquire semaphore is only free once the last submit finished
        self.begin()?;
        let (index, semaphore) = images.acquire()?;
        self.pending_waits.push(semaphore);
        self.in_flight.push(images.clone());
        Ok(index)
    }

    // =========================================================================
    // RENDERING
    // =========================================================================

    /// Image index `target` resolves to for this frame
    fn resolve(&mut self, target: &Rc<RenderTargetViews>) -> Result<usize> {
        match &target.image.source {
            ImageSource::Owned { .. } => Ok(0),
            ImageSource::SwapChain(images) => {
                let images = images.clone();
                Ok(self.acquire(&images)? as usize)
            }
        }
    }

    fn transition(&mut self, target: &RenderTargetViews, index: usize, layout: vk::ImageLayout) {
        let current = target.image.layout(index);
        if current.get() != layout {
            transition_image(
                &self.device.device,
                self.command_buffer,
                target.image.image(index),
                current.get(),
                layout,
            );
            current.set(layout);
        }
    }

    fn clear(&mut self, target: Rc<RenderTargetViews>, color: [f32; 4]) -> Result<()> {
        self.begin()?;
        let index = self.resolve(&target)?;
        self.end_rendering();
        self.transition(&target, index, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        let clear_value = vk::ClearColorValue { float32: color };
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe {
            self.device.device.cmd_clear_color_image(
                self.command_buffer,
                target.image.image(index),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear_value,
                &[range],
            );
        }
        self.in_flight.push(target);
        Ok(())
    }

    /// Open a rendering scope over the bound targets unless one is already
    /// open over the same views.
    fn begin_rendering(&mut self) -> Result<vk::Extent2D> {
        let targets = self.state.render_targets.clone();
        let mut views = Vec::with_capacity(targets.len());
        let mut indices = Vec::with_capacity(targets.len());
        for target in &targets {
            let index = self.resolve(target)?;
            views.push(target.views[index]);
            indices.push(index);
        }

        if let Some(active) = &self.rendering {
            if active.views == views {
                return Ok(active.extent);
            }
        }
        self.end_rendering();

        let extent = targets
            .iter()
            .map(|target| target.image.extent)
            .reduce(|a, b| vk::Extent2D {
                width: a.width.min(b.width),
                height: a.height.min(b.height),
            })
            .context("Draw without a render target")?;

        for (target, &index) in targets.iter().zip(&indices) {
            self.transition(target, index, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        }

        let attachments: Vec<_> = views
            .iter()
            .map(|&view| {
                vk::RenderingAttachmentInfo::builder()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .build()
            })
            .collect();
        let rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .layer_count(1)
            .color_attachments(&attachments);

        unsafe {
            self.device
                .device
                .cmd_begin_rendering(self.command_buffer, &rendering_info)
        };
        self.in_flight
            .extend(targets.into_iter().map(|target| target as Rc<dyn Any>));
        self.rendering = Some(ActiveRendering { views, extent });
        Ok(extent)
    }

    fn draw_vertices(&mut self, vertex_count: u32, start_vertex: u32) -> Result<()> {
        let (Some(vertex_shader), Some(pixel_shader)) =
            (self.state.vertex_shader.clone(), self.state.pixel_shader.clone())
        else {
            anyhow::bail!("Draw without both a vertex and a pixel shader bound");
        };

        self.begin()?;
        let extent = self.begin_rendering()?;

        let input_layout = self.state.input_layout.clone();
        let vertex_buffer = self.state.vertex_buffer.clone();
        let key = PipelineKey {
            vertex_shader: vertex_shader.id,
            pixel_shader: pixel_shader.id,
            input_layout: input_layout.as_ref().map_or(0, |layout| layout.id),
            vertex_stride: vertex_buffer.as_ref().map_or(0, |(_, stride, _)| *stride),
            topology: convert::topology(self.state.topology),
            color_formats: self
                .state
                .render_targets
                .iter()
                .map(|target| target.image.format)
                .collect(),
        };
        let pipeline = self.pipelines.get_or_create(
            key,
            &vertex_shader,
            &pixel_shader,
            input_layout.as_deref(),
        )?;

        let viewport = self.state.viewports.first().map_or(
            vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
            convert::viewport,
        );
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        let device = &self.device.device;
        let cb = self.command_buffer;
        unsafe {
            device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, pipeline);
            device.cmd_set_viewport(cb, 0, &[viewport]);
            device.cmd_set_scissor(cb, 0, &[scissor]);
        }

        // Constant buffers via push descriptors
        let bound: Vec<(u32, Rc<BufferResource>)> = self
            .state
            .vertex_constants
            .iter()
            .enumerate()
            .map(|(slot, buffer)| (slot as u32, buffer))
            .chain(
                self.state
                    .pixel_constants
                    .iter()
                    .enumerate()
                    .map(|(slot, buffer)| (PIXEL_BINDING_BASE + slot as u32, buffer)),
            )
            .filter_map(|(binding, buffer)| buffer.clone().map(|buffer| (binding, buffer)))
            .collect();
        if !bound.is_empty() {
            let infos: Vec<_> = bound
                .iter()
                .map(|(_, buffer)| vk::DescriptorBufferInfo {
                    buffer: buffer.buffer,
                    offset: 0,
                    range: buffer.size,
                })
                .collect();
            let writes: Vec<_> = bound
                .iter()
                .zip(&infos)
                .map(|((binding, _), info)| {
                    vk::WriteDescriptorSet::builder()
                        .dst_binding(*binding)
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(std::slice::from_ref(info))
                        .build()
                })
                .collect();
            unsafe {
                self.device.push_descriptor.cmd_push_descriptor_set(
                    cb,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipelines.layout,
                    0,
                    &writes,
                );
            }
        }

        if let Some((buffer, _, offset)) = &vertex_buffer {
            unsafe {
                device.cmd_bind_vertex_buffers(cb, 0, &[buffer.buffer], &[*offset as u64]);
            }
        }

        unsafe { device.cmd_draw(cb, vertex_count, 1, start_vertex, 0) };

        self.in_flight.push(vertex_shader);
        self.in_flight.push(pixel_shader);
        self.in_flight
            .extend(bound.into_iter().map(|(_, buffer)| buffer as Rc<dyn Any>));
        if let Some(layout) = input_layout {
            self.in_flight.push(layout);
        }
        if let Some((buffer, _, _)) = vertex_buffer {
            self.in_flight.push(buffer);
        }
        Ok(())
    }

    /// Submit whatever is recorded and wait for the GPU.
    fn submit_and_wait(&mut self) -> Result<()> {
        self.submit(&[])?;
        self.wait_fence()
    }

    /// Submit pending work and wait until the device is idle. Drops every
    /// in-flight reference.
    pub fn wait_idle(&mut self) -> Result<()> {
        self.submit_and_wait()?;
        self.device.wait_idle()
    }

    /// Release every pipeline and binding ahead of device destruction.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.submit_and_wait() {
            log::warn!("Final submission failed: {:#}", e);
        }
        self.state = BoundState::default();
        self.in_flight.clear();
        log::info!("Releasing {} cached pipeline(s)", self.pipelines.len());
        self.pipelines.clear();
    }
}

fn downcast<T: 'static>(native: &dyn NativeResource) -> Option<&T> {
    let downcast = native.as_any().downcast_ref::<T>();
    if downcast.is_none() {
        log::error!(
            "Native 0x{:x} is not a {}",
            native.raw_handle(),
            std::any::type_name::<T>()
        );
    }
    downcast
}

impl ContextBackend for CommandRecorder {
    fn set_viewports(&mut self, viewports: &[Viewport]) {
        if viewports.len() > 1 {
            log::debug!("{} viewports bound, drawing with the first", viewports.len());
        }
        self.state.viewports = viewports.to_vec();
    }

    fn set_shader(&mut self, stage: ShaderStage, shader: Option<&dyn NativeResource>) {
        let module = shader
            .and_then(downcast::<VulkanShader>)
            .map(|shader| shader.module.clone());
        match stage {
            ShaderStage::Vertex => self.state.vertex_shader = module,
            ShaderStage::Pixel => self.state.pixel_shader = module,
        }
    }

    fn set_constant_buffers(
        &mut self,
        stage: ShaderStage,
        start_slot: u32,
        buffers: &[&dyn NativeResource],
    ) {
        let slots = self.state.constants_mut(stage);
        for (i, native) in buffers.iter().enumerate() {
            let slot = start_slot + i as u32;
            if slot >= CONSTANT_BUFFER_SLOTS {
                log::warn!("Constant buffer slot {} out of range, ignored", slot);
                continue;
            }
            let slot = slot as usize;
            if slots.len() <= slot {
                slots.resize(slot + 1, None);
            }
            slots[slot] = downcast::<VulkanBuffer>(*native).map(|buffer| buffer.resource.clone());
        }
    }

    fn set_render_targets(&mut self, targets: &[&dyn NativeResource]) {
        self.state.render_targets = targets
            .iter()
            .filter_map(|native| downcast::<VulkanRenderTarget>(*native))
            .map(|target| target.views.clone())
            .collect();
    }

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.state.topology = topology;
    }

    fn set_input_layout(&mut self, layout: Option<&dyn NativeResource>) {
        self.state.input_layout = layout
            .and_then(downcast::<VulkanInputLayout>)
            .map(|layout| layout.layout.clone());
    }

    fn set_vertex_buffer(&mut self, buffer: Option<&dyn NativeResource>, stride: u32, offset: u32) {
        self.state.vertex_buffer = buffer
            .and_then(downcast::<VulkanBuffer>)
            .map(|buffer| (buffer.resource.clone(), stride, offset));
    }

    fn clear_render_target(&mut self, target: &dyn NativeResource, color: [f32; 4]) {
        let Some(target) = downcast::<VulkanRenderTarget>(target) else {
            return;
        };
        let views = target.views.clone();
        if let Err(e) = self.clear(views, color) {
            self.record_error(e);
        }
    }

    fn draw(&mut self, vertex_count: u32, start_vertex: u32) {
        if let Err(e) = self.draw_vertices(vertex_count, start_vertex) {
            self.record_error(e);
        }
    }

    fn map<'a>(&mut self, buffer: &'a mut dyn NativeResource) -> RhiResult<&'a mut [u8]> {
        let raw = buffer.raw_handle();
        let buffer = buffer
            .as_any_mut()
            .downcast_mut::<VulkanBuffer>()
            .ok_or_else(|| anyhow::anyhow!("Native 0x{:x} is not a buffer", raw))?;

        // The GPU may still read the old contents
        if self.recording {
            self.submit_and_wait()?;
        } else {
            self.wait_fence()?;
        }

        let usage = buffer.usage;
        buffer.mapped_mut().ok_or(RhiError::NotMappable(usage))
    }

    fn unmap(&mut self, _buffer: &mut dyn NativeResource) {
        // Persistently mapped, host-coherent memory
    }

    fn flush(&mut self) -> RhiResult<()> {
        let result = self.submit_and_wait();
        let recorded = self.take_error();
        result?;
        recorded
    }

    fn clear_state(&mut self) {
        self.state = BoundState::default();
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        self.in_flight.clear();
        unsafe {
            self.device.device.destroy_fence(self.fence, None);
            self.device.device.destroy_command_pool(self.pool, None);
        }
    }
}
