// =============================================================================
// RENDER RHI DEMO - Spinning triangle through the render hardware interface
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit App (window, input, frame pacing)                        │
// │    └── Rhi (Vulkan backend)                                     │
// │          └── RenderDevice + SwapChain                           │
// │                └── Scene (shaders, vertex/constant buffers)     │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Resize the swap chain if the window changed
// 2. Recompile shaders if the shader directory changed
// 3. Write the rotation into the constant buffer (Map/Unmap)
// 4. Viewport, clear, bind, draw
// 5. Present
//
// =============================================================================

use anyhow::{Context, Result};
use glam::{Mat4, Vec3};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use render_rhi::config::Config;
use render_rhi::{
    Buffer, BufferUsage, DeviceId, GraphicsApi, InputElement, InputLayout, PixelShader,
    PrimitiveTopology, RenderDevice, RenderFormat, Rhi, RhiResult, ShaderStage, SwapChainId,
    VertexShader, Viewport, APPEND_ALIGNED_ELEMENT,
};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

const SHADER_FILE: &str = "triangle.wgsl";

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting render RHI demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!(
        "Swap chain: {} buffers, sync interval {}",
        config.graphics.buffer_count,
        config.graphics.sync_interval
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging with an optional log file header
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();
    builder.init();

    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== Render RHI Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

// =============================================================================
// SCENE
// =============================================================================

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 2],
    color: [f32; 3],
}

const VERTICES: [Vertex; 3] = [
    Vertex {
        position: [0.0, 0.6],
        color: [1.0, 0.0, 0.0],
    },
    Vertex {
        position: [0.6, -0.6],
        color: [0.0, 1.0, 0.0],
    },
    Vertex {
        position: [-0.6, -0.6],
        color: [0.0, 0.0, 1.0],
    },
];

/// GPU objects the triangle is drawn with
struct Scene {
    vertex_shader: VertexShader,
    pixel_shader: PixelShader,
    input_layout: InputLayout,
    vertex_buffer: Buffer,
    constants: Buffer,
}

struct ShaderSet {
    vertex_shader: VertexShader,
    pixel_shader: PixelShader,
    input_layout: InputLayout,
}

impl Scene {
    fn create(device: &mut RenderDevice) -> RhiResult<Self> {
        let shaders = Self::create_shaders(device)?;

        let vertex_buffer = device.create_vertex_buffer(
            VERTICES.len() as u32,
            std::mem::size_of::<Vertex>() as u32,
            BufferUsage::Immutable,
            Some(bytemuck::cast_slice(&VERTICES)),
        )?;
        let constants = device.create_constant_buffer(
            std::mem::size_of::<Mat4>() as u32,
            BufferUsage::Dynamic,
            None,
        )?;

        Ok(Self {
            vertex_shader: shaders.vertex_shader,
            pixel_shader: shaders.pixel_shader,
            input_layout: shaders.input_layout,
            vertex_buffer,
            constants,
        })
    }

    fn create_shaders(device: &mut RenderDevice) -> RhiResult<ShaderSet> {
        let vs_bytecode = device
            .shader_compiler()
            .compile_file(SHADER_FILE, ShaderStage::Vertex)?;
        let ps_bytecode = device
            .shader_compiler()
            .compile_file(SHADER_FILE, ShaderStage::Pixel)?;

        let elements = [
            InputElement::new("POSITION", 0, RenderFormat::R32G32Float, APPEND_ALIGNED_ELEMENT),
            InputElement::new("COLOR", 0, RenderFormat::R32G32B32Float, APPEND_ALIGNED_ELEMENT),
        ];

        let vertex_shader = device.create_vertex_shader(&vs_bytecode)?;
        let pixel_shader = match device.create_pixel_shader(&ps_bytecode) {
            Ok(shader) => shader,
            Err(e) => {
                device.release_resource(vertex_shader);
                return Err(e);
            }
        };
        let input_layout = match device.create_input_layout(&elements, &vs_bytecode) {
            Ok(layout) => layout,
            Err(e) => {
                device.release_resource(vertex_shader);
                device.release_resource(pixel_shader);
                return Err(e);
            }
        };

        Ok(ShaderSet {
            vertex_shader,
            pixel_shader,
            input_layout,
        })
    }

    /// Swap in freshly compiled shaders. On failure the old ones stay bound.
    fn reload_shaders(&mut self, device: &mut RenderDevice) {
        match Self::create_shaders(device) {
            Ok(shaders) => {
                device.release_resource(self.vertex_shader);
                device.release_resource(self.pixel_shader);
                device.release_resource(self.input_layout);
                self.vertex_shader = shaders.vertex_shader;
                self.pixel_shader = shaders.pixel_shader;
                self.input_layout = shaders.input_layout;
                log::info!("Shaders reloaded");
            }
            Err(e) => log::warn!("Shader reload failed, keeping previous shaders: {}", e),
        }
    }

    fn release(self, device: &mut RenderDevice) {
        device.release_resource(self.vertex_shader);
        device.release_resource(self.pixel_shader);
        device.release_resource(self.input_layout);
        device.release_resource(self.vertex_buffer);
        device.release_resource(self.constants);
    }
}

// =============================================================================
// SHADER HOT RELOAD
// =============================================================================

struct ShaderWatcher {
    /// Kept alive for the lifetime of the watch
    _watcher: RecommendedWatcher,
    events: mpsc::Receiver<notify::Event>,
}

impl ShaderWatcher {
    fn new(dir: &Path) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {:?}", dir))?;
        log::info!("Watching {:?} for shader changes", dir);

        Ok(Self {
            _watcher: watcher,
            events: rx,
        })
    }

    /// Drain pending events; true if any shader file was written.
    fn changed(&self) -> bool {
        let mut changed = false;
        while let Ok(event) = self.events.try_recv() {
            if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                changed = true;
            }
        }
        changed
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,
    rhi: Rhi,
    device: Option<DeviceId>,
    swap_chain: Option<SwapChainId>,
    scene: Option<Scene>,
    shader_watcher: Option<ShaderWatcher>,

    // Declared after the RHI objects; the surface must go first
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    /// Set when the window is resized - the swap chain is rebuilt next frame
    needs_resize: bool,
    /// Set while the window has zero area - skip rendering
    is_minimized: bool,

    start_time: Instant,
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            rhi: Rhi::new(GraphicsApi::Vulkan),
            device: None,
            swap_chain: None,
            scene: None,
            shader_watcher: None,
            window: None,
            is_fullscreen,
            needs_resize: false,
            is_minimized: false,
            start_time: now,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_rhi(&mut self, window: &Window) -> Result<()> {
        use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

        log::info!("Initializing RHI...");
        let device_id = self.rhi.create_render_device(&self.config.device_params())?;
        self.device = Some(device_id);
        let device = self
            .rhi
            .device_mut(device_id)
            .context("Render device missing right after creation")?;

        let output_window = render_rhi::WindowHandle {
            window: window
                .window_handle()
                .context("Failed to get window handle")?
                .as_raw(),
            display: window
                .display_handle()
                .context("Failed to get display handle")?
                .as_raw(),
        };
        let size = window.inner_size();
        let mut params = self.config.swap_chain_params();
        params.output_window = Some(output_window);
        params.width = size.width;
        params.height = size.height;

        let swap_chain_id = device.create_swap_chain(&params)?;
        self.swap_chain = Some(swap_chain_id);

        self.scene = Some(Scene::create(device)?);

        if self.config.debug.hot_reload_shaders {
            let dir = device.shader_compiler().source_dir().to_path_buf();
            match ShaderWatcher::new(&dir) {
                Ok(watcher) => self.shader_watcher = Some(watcher),
                Err(e) => log::warn!("Shader hot reload disabled: {:#}", e),
            }
        }

        log::info!("RHI initialized successfully!");
        Ok(())
    }

    // =========================================================================
    // RENDERING
    // =========================================================================

    /// Record and present one frame. Returns false when nothing was drawn.
    fn render_frame(&mut self) -> Result<bool> {
        let (Some(device_id), Some(swap_chain_id), Some(window)) =
            (self.device, self.swap_chain, self.window.as_ref())
        else {
            return Ok(false);
        };
        if self.is_minimized {
            return Ok(false);
        }

        let device = self
            .rhi
            .device_mut(device_id)
            .context("Render device missing")?;
        let scene = self.scene.as_mut().context("Scene not created")?;

        if self.needs_resize {
            let size = window.inner_size();
            device
                .swap_chain_mut(swap_chain_id)
                .context("Swap chain missing")?
                .resize_buffers(size.width, size.height)?;
            self.needs_resize = false;
        }

        if self
            .shader_watcher
            .as_ref()
            .is_some_and(ShaderWatcher::changed)
        {
            scene.reload_shaders(device);
        }

        let (target, (width, height)) = {
            let swap_chain = device
                .swap_chain(swap_chain_id)
                .context("Swap chain missing")?;
            (
                swap_chain
                    .back_buffer_target()
                    .context("Back buffer not available")?,
                swap_chain.extent(),
            )
        };

        // Rotate around Z, corrected for the window aspect ratio
        let aspect = height as f32 / width.max(1) as f32;
        let transform = Mat4::from_scale(Vec3::new(aspect, 1.0, 1.0))
            * Mat4::from_rotation_z(self.start_time.elapsed().as_secs_f32());
        let transform_bytes = bytemuck::bytes_of(&transform);

        let mut context = device.immediate_context();
        {
            let mapped = context.map(scene.constants)?;
            mapped[..transform_bytes.len()].copy_from_slice(transform_bytes);
        }
        context.unmap(scene.constants);

        context.set_viewports(&[Viewport::new(width as f32, height as f32)]);
        context.set_render_targets(&[target]);
        context.clear_render_target(target, self.config.graphics.clear_color);

        context.set_primitive_topology(PrimitiveTopology::TriangleList);
        context.set_input_layout(Some(scene.input_layout));
        context.set_vertex_buffer(Some(scene.vertex_buffer));
        context.set_vertex_shader(Some(scene.vertex_shader));
        context.set_pixel_shader(Some(scene.pixel_shader));
        context.set_constant_buffers(ShaderStage::Vertex, 0, &[scene.constants]);
        context.draw(VERTICES.len() as u32, 0);

        device
            .swap_chain_mut(swap_chain_id)
            .context("Swap chain missing")?
            .present()?;

        Ok(true)
    }

    /// Release the scene and remove the device (shutdown + live report).
    fn shutdown(&mut self) {
        let Some(device_id) = self.device.take() else {
            return;
        };
        log::info!("Shutting down RHI...");

        if let Some(device) = self.rhi.device_mut(device_id) {
            if let Some(scene) = self.scene.take() {
                scene.release(device);
            }
            if let Some(swap_chain_id) = self.swap_chain.take() {
                device.remove_swap_chain(swap_chain_id);
            }
        }
        self.rhi.remove_render_device(device_id);
        self.shader_watcher = None;
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            self.needs_resize = true;
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_rhi(&window) {
            log::error!("Failed to initialize RHI: {:#}", e);
            self.shutdown();
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    self.needs_resize = true;
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => {
                    // Usually an out-of-date swap chain; rebuild and carry on
                    log::error!("Render error: {:#}", e);
                    self.needs_resize = true;
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.shutdown();
                                event_loop.exit();
                            }
                            KeyCode::F11 => {
                                self.toggle_fullscreen();
                            }
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown();
        log::info!("Cleanup complete");
    }
}
