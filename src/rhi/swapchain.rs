// Swap chain - presentation surface and back buffer pair
//
// Lifecycle:
//   create_swap_chain ──> Ready ──(resize_buffers)*──> Ready ──> removed
//
// The back buffer Texture2D and its RenderTarget are tracked resources and
// always exist together or not at all. The texture carries two references
// while the pair exists: its own and the one its render target holds.

use std::ops::{Deref, DerefMut};

use super::backend::{ContextBackend, DeviceBackend, SwapChainBackend};
use super::context::PipelineState;
use super::error::{RhiError, RhiResult};
use super::resource::{RenderResource, RenderTarget, ResourceDesc, ResourceRegistry, Texture2D};
use super::types::{RenderFormat, SwapChainParams};

/// Identity of a swap chain within its device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapChainId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BackBuffer {
    texture: Texture2D,
    target: RenderTarget,
}

pub struct SwapChain {
    params: SwapChainParams,
    sync_interval: u32,
    /// Whether the native images were built to wait for vertical blank
    built_with_vsync: bool,
    back_buffer: Option<BackBuffer>,
    native: Box<dyn SwapChainBackend>,
}

impl SwapChain {
    pub(crate) fn new(native: Box<dyn SwapChainBackend>, params: SwapChainParams) -> Self {
        Self {
            sync_interval: params.sync_interval,
            built_with_vsync: params.sync_interval > 0,
            params,
            back_buffer: None,
            native,
        }
    }

    pub fn params(&self) -> &SwapChainParams {
        &self.params
    }

    /// Vertical blanks to wait for on present; 0 presents immediately.
    pub fn sync_interval(&self) -> u32 {
        self.sync_interval
    }

    /// Switching between 0 and a non-zero interval rebuilds the back
    /// buffers on the next present.
    pub fn set_sync_interval(&mut self, sync_interval: u32) {
        self.sync_interval = sync_interval;
        self.params.sync_interval = sync_interval;
    }

    pub fn buffer_count(&self) -> u32 {
        self.native.buffer_count()
    }

    pub fn extent(&self) -> (u32, u32) {
        self.native.extent()
    }

    pub fn format(&self) -> RenderFormat {
        self.native.format()
    }

    /// Both halves of the back buffer pair exist.
    pub fn is_ready(&self) -> bool {
        self.back_buffer.is_some()
    }

    pub fn back_buffer(&self) -> Option<Texture2D> {
        self.back_buffer.map(|pair| pair.texture)
    }

    /// Render target of the current back buffer. Changes identity on every
    /// resize, so don't hold on to it across one.
    pub fn back_buffer_target(&self) -> Option<RenderTarget> {
        self.back_buffer.map(|pair| pair.target)
    }

    pub(crate) fn acquire_back_buffer(
        &mut self,
        resources: &mut ResourceRegistry,
        device: &mut dyn DeviceBackend,
    ) -> RhiResult<()> {
        debug_assert!(self.back_buffer.is_none(), "back buffer acquired twice");

        let (native, desc) = self.native.back_buffer()?;
        let texture = Texture2D::from_handle(resources.register(
            native,
            ResourceDesc::Texture2D(desc.clone()),
            None,
        ));

        let target_native = {
            let texture_native = resources
                .native_of(texture)
                .ok_or(RhiError::BackBufferUnavailable)?;
            device.create_render_target(texture_native, &desc)
        };
        let target_native = match target_native {
            Ok(native) => native,
            Err(e) => {
                resources.release(texture.handle());
                return Err(e);
            }
        };

        resources.add_ref(texture.handle());
        let target = RenderTarget::from_handle(resources.register(
            target_native,
            ResourceDesc::RenderTarget(desc),
            Some(texture.handle()),
        ));

        self.back_buffer = Some(BackBuffer { texture, target });
        Ok(())
    }

    /// Release the pair, unbinding it from the context first. Returns the
    /// final counts of (render target, texture), both 0 unless someone else
    /// still holds a reference.
    pub(crate) fn release_back_buffer(
        &mut self,
        resources: &mut ResourceRegistry,
        context: &mut dyn ContextBackend,
        state: &mut PipelineState,
    ) -> Option<(u32, u32)> {
        let pair = self.back_buffer.take()?;

        if state.is_render_target_bound(pair.target) {
            context.set_render_targets(&[]);
            state.render_targets.clear();
        }

        let target = resources.release(pair.target.handle()).unwrap_or(0);
        let texture = resources.release(pair.texture.handle()).unwrap_or(0);
        Some((target, texture))
    }
}

/// Swap chain together with the device state its operations touch
pub struct SwapChainMut<'a> {
    chain: &'a mut SwapChain,
    resources: &'a mut ResourceRegistry,
    device: &'a mut dyn DeviceBackend,
    state: &'a mut PipelineState,
}

impl<'a> SwapChainMut<'a> {
    pub(crate) fn new(
        chain: &'a mut SwapChain,
        resources: &'a mut ResourceRegistry,
        device: &'a mut dyn DeviceBackend,
        state: &'a mut PipelineState,
    ) -> Self {
        Self {
            chain,
            resources,
            device,
            state,
        }
    }

    /// Rebuild the back buffer pair at a new size; 0 means the size of the
    /// output window. Buffer count and format are preserved.
    pub fn resize_buffers(&mut self, width: u32, height: u32) -> RhiResult<()> {
        self.device.context().flush()?;

        if let Some((target, texture)) =
            self.chain
                .release_back_buffer(self.resources, self.device.context(), self.state)
        {
            if target != 0 || texture != 0 {
                log::error!(
                    "Back buffer still referenced after release (render target: {}, texture: {})",
                    target,
                    texture
                );
            }
            debug_assert_eq!(target, 0, "back buffer render target leaked");
            debug_assert_eq!(texture, 0, "back buffer texture leaked");
        }

        let vsync = self.chain.sync_interval > 0;
        self.chain.native.set_vsync(vsync);
        self.chain.native.resize(width, height)?;
        self.chain.built_with_vsync = vsync;
        self.chain.params.width = width;
        self.chain.params.height = height;
        self.chain.acquire_back_buffer(self.resources, self.device)?;

        let (width, height) = self.chain.extent();
        log::info!("Swap chain resized to {}x{}", width, height);
        Ok(())
    }

    /// Submit the frame and display the back buffer.
    pub fn present(&mut self) -> RhiResult<()> {
        if !self.chain.is_ready() {
            return Err(RhiError::BackBufferUnavailable);
        }

        if (self.chain.sync_interval > 0) != self.chain.built_with_vsync {
            let (width, height) = (self.chain.params.width, self.chain.params.height);
            self.resize_buffers(width, height)?;
        }

        self.device
            .present(self.chain.native.as_mut(), self.chain.sync_interval)
    }
}

impl Deref for SwapChainMut<'_> {
    type Target = SwapChain;

    fn deref(&self) -> &SwapChain {
        self.chain
    }
}

impl DerefMut for SwapChainMut<'_> {
    fn deref_mut(&mut self) -> &mut SwapChain {
        self.chain
    }
}

#[cfg(test)]
mod tests {
    use crate::rhi::testing::{test_device, Command, DEFAULT_WINDOW_EXTENT};
    use crate::rhi::types::{BufferUsage, ShaderStage, SwapChainParams, Viewport};

    #[test]
    fn create_then_present_succeeds() {
        let (mut device, recorder) = test_device();
        let id = device
            .create_swap_chain(&SwapChainParams {
                buffer_count: 2,
                width: 0,
                height: 0,
                ..Default::default()
            })
            .unwrap();

        let chain = device.swap_chain(id).unwrap();
        assert!(chain.back_buffer_target().is_some());
        assert_eq!(chain.extent(), DEFAULT_WINDOW_EXTENT);
        assert_eq!(chain.buffer_count(), 2);

        device.swap_chain_mut(id).unwrap().present().unwrap();
        assert!(recorder
            .commands()
            .contains(&Command::Present { sync_interval: 1 }));
    }

    #[test]
    fn back_buffer_pair_counts() {
        let (mut device, _recorder) = test_device();
        let id = device.create_swap_chain(&SwapChainParams::default()).unwrap();
        let chain = device.swap_chain(id).unwrap();
        let texture = chain.back_buffer().unwrap();
        let target = chain.back_buffer_target().unwrap();

        assert_eq!(device.ref_count(texture), Some(2));
        assert_eq!(device.ref_count(target), Some(1));
        assert_eq!(device.live_resource_count(), 2);
    }

    #[test]
    fn repeated_resizes_keep_exactly_one_pair() {
        let (mut device, recorder) = test_device();
        let id = device.create_swap_chain(&SwapChainParams::default()).unwrap();
        let first_target = device.swap_chain(id).unwrap().back_buffer_target().unwrap();

        for _ in 0..4 {
            device
                .swap_chain_mut(id)
                .unwrap()
                .resize_buffers(1024, 768)
                .unwrap();
        }

        let chain = device.swap_chain(id).unwrap();
        let target = chain.back_buffer_target().unwrap();
        assert_ne!(target, first_target);
        assert_eq!(chain.extent(), (1024, 768));
        assert_eq!(device.live_resource_count(), 2);
        assert!(!device.is_tracked(first_target));
        // swap chain surface + texture + render target
        assert_eq!(recorder.live_natives(), 3);

        let mut context = device.immediate_context();
        context.set_render_targets(&[target]);
        context.set_viewports(&[Viewport::new(1024.0, 768.0)]);
        context.clear_render_target(target, [1.0, 0.0, 0.0, 1.0]);
        context.draw(3, 0);
        device.swap_chain_mut(id).unwrap().present().unwrap();
    }

    #[test]
    fn resize_unbinds_the_old_target() {
        let (mut device, recorder) = test_device();
        let id = device.create_swap_chain(&SwapChainParams::default()).unwrap();
        let target = device.swap_chain(id).unwrap().back_buffer_target().unwrap();
        device.immediate_context().set_render_targets(&[target]);
        recorder.clear_commands();

        device.swap_chain_mut(id).unwrap().resize_buffers(0, 0).unwrap();

        let commands = recorder.commands();
        assert_eq!(commands[0], Command::Flush);
        assert_eq!(commands[1], Command::SetRenderTargets(vec![]));
        assert!(device.immediate_context().state().render_targets.is_empty());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "back buffer texture leaked")]
    fn resize_with_outside_back_buffer_reference_asserts() {
        let (mut device, _recorder) = test_device();
        let id = device.create_swap_chain(&SwapChainParams::default()).unwrap();
        let texture = device.swap_chain(id).unwrap().back_buffer().unwrap();
        device.add_ref(texture);

        let _ = device.swap_chain_mut(id).unwrap().resize_buffers(640, 480);
    }

    #[test]
    fn resize_failure_leaves_no_pair() {
        let (mut device, recorder) = test_device();
        let id = device.create_swap_chain(&SwapChainParams::default()).unwrap();
        recorder.fail_next_resize();

        let mut chain = device.swap_chain_mut(id).unwrap();
        assert!(chain.resize_buffers(640, 480).is_err());
        assert!(!chain.is_ready());
        assert!(chain.back_buffer_target().is_none());
        assert!(chain.present().is_err());
    }

    #[test]
    fn sync_interval_reaches_present() {
        let (mut device, recorder) = test_device();
        let id = device.create_swap_chain(&SwapChainParams::default()).unwrap();

        let mut chain = device.swap_chain_mut(id).unwrap();
        assert_eq!(chain.sync_interval(), 1);
        chain.set_sync_interval(0);
        chain.present().unwrap();

        assert!(recorder
            .commands()
            .contains(&Command::Present { sync_interval: 0 }));
    }

    #[test]
    fn switching_vsync_off_rebuilds_before_present() {
        let (mut device, recorder) = test_device();
        let id = device.create_swap_chain(&SwapChainParams::default()).unwrap();
        let old_target = device.swap_chain(id).unwrap().back_buffer_target().unwrap();
        recorder.clear_commands();

        let mut chain = device.swap_chain_mut(id).unwrap();
        chain.set_sync_interval(0);
        chain.present().unwrap();
        chain.present().unwrap();

        let commands = recorder.commands();
        let set_vsync = commands
            .iter()
            .position(|c| *c == Command::SetVsync(false))
            .unwrap();
        let resize = commands
            .iter()
            .position(|c| matches!(c, Command::Resize { .. }))
            .unwrap();
        let present = commands
            .iter()
            .position(|c| *c == Command::Present { sync_interval: 0 })
            .unwrap();
        assert!(set_vsync < resize && resize < present);
        assert_eq!(
            commands
                .iter()
                .filter(|c| matches!(c, Command::Resize { .. }))
                .count(),
            1
        );

        let chain = device.swap_chain(id).unwrap();
        assert_ne!(chain.back_buffer_target().unwrap(), old_target);
        assert_eq!(chain.extent(), DEFAULT_WINDOW_EXTENT);
        assert_eq!(device.live_resource_count(), 2);
    }

    #[test]
    fn interval_from_params_needs_no_rebuild() {
        let (mut device, recorder) = test_device();
        let id = device
            .create_swap_chain(&SwapChainParams {
                sync_interval: 0,
                ..Default::default()
            })
            .unwrap();

        let mut chain = device.swap_chain_mut(id).unwrap();
        assert_eq!(chain.sync_interval(), 0);
        chain.present().unwrap();
        // 1 and 2 both wait for vertical blank
        chain.set_sync_interval(1);
        chain.present().unwrap();
        chain.set_sync_interval(2);
        chain.present().unwrap();

        let resizes: Vec<_> = recorder
            .commands()
            .into_iter()
            .filter(|c| matches!(c, Command::Resize { .. } | Command::SetVsync(_)))
            .collect();
        assert_eq!(
            resizes,
            vec![
                Command::SetVsync(true),
                Command::Resize {
                    width: 0,
                    height: 0
                }
            ]
        );
    }

    #[test]
    fn removing_swap_chain_releases_pair() {
        let (mut device, recorder) = test_device();
        let cb = device
            .create_constant_buffer(16, BufferUsage::Dynamic, None)
            .unwrap();
        let id = device.create_swap_chain(&SwapChainParams::default()).unwrap();
        device
            .immediate_context()
            .set_constant_buffers(ShaderStage::Vertex, 0, &[cb]);

        assert!(device.remove_swap_chain(id));
        assert!(device.swap_chain(id).is_none());
        assert_eq!(device.live_resource_count(), 1);
        assert_eq!(recorder.live_natives(), 1);
        assert!(device.is_tracked(cb));
    }
}
