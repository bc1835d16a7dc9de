//! Field Play
//!
//! Particles advected through a vector field written as a short WGSL snippet.
//!
//! Usage: `field-play [FIELD_FILE]`. The file holds the body of the velocity function, e.g.
//! `v.x = -p.y; v.y = p.x;`, and is reloaded with `F`.

use field_core::{CanvasRect, Transform, DEFAULT_TIME_STEP};
use field_renderer::ParticlePainter;
use field_simulation::{
    EngineError, FrameOutcome, JsonFileSettings, MemorySettings, Scene, SceneBus, SceneConfig,
    SceneEvent, SettingsStore, Subscription, VectorLinesRequest, WgpuDevice,
};
use glam::Vec2;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::*,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

const SETTINGS_FILE: &str = "field-play.json";
const DROP_PROBABILITIES: [f32; 4] = [0.0, 0.003, 0.009, 0.03];
const SAMPLE_RESOLUTION: u32 = 16;
const ZOOM_STEP: f32 = 1.1;
const MAX_SPEED: f32 = 64.0;
const FPS_WINDOW: usize = 100;

fn read_field(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(source) => Some(source),
        Err(err) => {
            log::error!("Could not read {}: {err}", path.display());
            None
        }
    }
}

fn open_settings() -> Box<dyn SettingsStore> {
    match JsonFileSettings::open(SETTINGS_FILE) {
        Ok(settings) => Box::new(settings),
        Err(err) => {
            log::warn!("Settings not persisted ({SETTINGS_FILE}: {err})");
            Box::new(MemorySettings::new())
        }
    }
}

/// Sample points on a regular grid over the visible region.
fn sample_grid(scene: &Scene<WgpuDevice>) -> VectorLinesRequest {
    let bbox = scene.bbox();
    let n = SAMPLE_RESOLUTION;
    let cell = |i: u32| (i as f32 + 0.5) / n as f32;

    let mut x = Vec::with_capacity((n * n) as usize);
    let mut y = Vec::with_capacity((n * n) as usize);
    for row in 0..n {
        for col in 0..n {
            x.push(bbox.min_x + cell(col) * bbox.width());
            y.push(bbox.min_y + cell(row) * bbox.height());
        }
    }
    VectorLinesRequest {
        resolution: n,
        x,
        y,
    }
}

struct GpuState {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,

    scene: Scene<WgpuDevice>,
    painter: ParticlePainter,
    bus: SceneBus,
    events: Subscription<SceneEvent>,

    canvas: CanvasRect,
    transform: Transform,
    speed: f32,
    field_file: Option<PathBuf>,

    frame_times: VecDeque<f32>,
    last_frame_time: Instant,
}

impl GpuState {
    async fn new(window: Arc<Window>, field_file: Option<PathBuf>) -> Result<Self, EngineError> {
        let size = window.inner_size();

        let instance = wgpu::Instance::default();
        let surface = instance
            .create_surface(window.clone())
            .map_err(|e| EngineError::Adapter(e.to_string()))?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| EngineError::Adapter(e.to_string()))?;

        log::info!("Using GPU: {}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::default(),
                experimental_features: wgpu::ExperimentalFeatures::default(),
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| EngineError::Adapter(e.to_string()))?;

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .or(surface_caps.formats.first())
            .copied()
            .ok_or_else(|| EngineError::Adapter("surface has no formats".into()))?;

        // One simulation step per displayed frame
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: surface_caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        let canvas = CanvasRect::padded(config.width as f32, config.height as f32, 1.0);
        let mut painter = ParticlePainter::new(
            &device,
            config.format,
            canvas.width as u32,
            canvas.height as u32,
        );
        painter.set_present_offset(-canvas.left, -canvas.top);

        let bus = SceneBus::new();
        let events = bus.events.subscribe();
        let scene_config = SceneConfig {
            canvas,
            ..Default::default()
        };
        let mut scene = Scene::new(
            WgpuDevice::new(device, queue),
            scene_config,
            open_settings(),
            &bus,
        )?;

        // A field file on the command line wins over the saved field
        if let Some(source) = field_file.as_deref().and_then(read_field) {
            if let Err(err) = scene.set_vector_field(&source) {
                log::error!("{err}");
            }
        }

        let transform = scene.transform();
        let speed = scene.context().integration_time_step / DEFAULT_TIME_STEP;

        Ok(Self {
            surface,
            config,
            scene,
            painter,
            bus,
            events,
            canvas,
            transform,
            speed,
            field_file,
            frame_times: VecDeque::with_capacity(FPS_WINDOW),
            last_frame_time: Instant::now(),
        })
    }

    fn resize(&mut self, new_size: winit::dpi::PhysicalSize<u32>) {
        if new_size.width == 0 || new_size.height == 0 {
            return;
        }
        self.config.width = new_size.width;
        self.config.height = new_size.height;
        let device = self.scene.device().device();
        self.surface.configure(device, &self.config);

        self.canvas = CanvasRect::padded(new_size.width as f32, new_size.height as f32, 1.0);
        self.painter.resize(
            device,
            self.canvas.width as u32,
            self.canvas.height as u32,
        );
        self.painter
            .set_present_offset(-self.canvas.left, -self.canvas.top);
        self.scene.set_canvas(self.canvas);
    }

    /// Window pixel to simulation space.
    fn to_simulation(&self, x: f64, y: f64) -> Vec2 {
        self.scene.canvas_to_simulation(
            x as f32 - self.canvas.left,
            y as f32 - self.canvas.top,
        )
    }

    fn publish_transform(&mut self, transform: Transform) {
        self.transform = transform;
        self.bus.transforms.publish(transform);
        self.painter.clear();
    }

    fn pan(&mut self, dx: f32, dy: f32) {
        self.publish_transform(Transform {
            scale: self.transform.scale,
            x: self.transform.x + dx,
            y: self.transform.y + dy,
        });
    }

    /// Zoom by `factor`, keeping the point under the window pixel in place.
    fn zoom(&mut self, factor: f32, x: f64, y: f64) {
        let cx = x as f32 - self.canvas.left - self.canvas.width * 0.5;
        let cy = y as f32 - self.canvas.top - self.canvas.height * 0.5;
        let t = self.transform;
        self.publish_transform(Transform {
            scale: t.scale * factor,
            x: cx - (cx - t.x) * factor,
            y: cy - (cy - t.y) * factor,
        });
    }

    fn handle_key(&mut self, key: KeyCode) {
        let scene = &mut self.scene;
        match key {
            KeyCode::Space => {
                let paused = !scene.is_paused();
                scene.set_paused(paused);
                log::info!("{}", if paused { "Paused" } else { "Resumed" });
            }
            KeyCode::ArrowUp | KeyCode::ArrowDown => {
                let count = scene.particle_count();
                let count = if key == KeyCode::ArrowUp {
                    count.saturating_mul(2)
                } else {
                    (count / 2).max(1)
                };
                match scene.set_particle_count(count) {
                    Ok(true) => log::info!("{} particles", scene.particle_count()),
                    Ok(false) => {}
                    Err(err) => log::error!("Particle count unchanged: {err}"),
                }
            }
            KeyCode::Equal | KeyCode::NumpadAdd | KeyCode::Minus | KeyCode::NumpadSubtract => {
                let faster = matches!(key, KeyCode::Equal | KeyCode::NumpadAdd);
                let speed = if faster { self.speed * 2.0 } else { self.speed * 0.5 };
                if speed.abs() <= MAX_SPEED && scene.set_integration_speed(speed) {
                    self.speed = speed;
                }
            }
            KeyCode::KeyD => {
                let current = scene.context().drop_probability;
                let next = DROP_PROBABILITIES
                    .iter()
                    .position(|p| *p > current)
                    .map_or(DROP_PROBABILITIES[0], |i| DROP_PROBABILITIES[i]);
                scene.set_drop_probability(next);
                log::info!("Drop probability {next}");
            }
            KeyCode::KeyC => {
                let mode = scene.context().color_mode.next();
                match scene.set_color_mode(mode) {
                    Ok(()) => log::info!("Color mode {mode:?}"),
                    Err(err) => log::error!("{err}"),
                }
            }
            KeyCode::KeyV => {
                let request = sample_grid(scene);
                scene.request_vector_lines(request);
            }
            KeyCode::KeyF => {
                let Some(path) = self.field_file.as_deref() else {
                    log::info!("No field file given");
                    return;
                };
                if let Some(source) = read_field(path) {
                    match scene.set_vector_field(&source) {
                        Ok(()) => {
                            log::info!("Reloaded {}", path.display());
                            self.painter.clear();
                        }
                        Err(err) => log::error!("{err}"),
                    }
                }
            }
            _ => {}
        }
    }

    fn drain_events(&mut self) {
        for event in self.events.drain() {
            match event {
                SceneEvent::VectorLineReady(result) => log::info!(
                    "Vector sample {0}x{0}: vx [{1:.3}, {2:.3}] mean {3:.3}, vy [{4:.3}, {5:.3}] mean {6:.3}",
                    result.resolution,
                    result.x_stats.min,
                    result.x_stats.max,
                    result.x_stats.mean,
                    result.y_stats.min,
                    result.y_stats.max,
                    result.y_stats.mean,
                ),
                SceneEvent::BboxChange(bbox) => log::debug!("View {:?}", bbox.to_array()),
                SceneEvent::IntegrationTimestepChanged(step) => log::info!("Time step {step}"),
                SceneEvent::SceneReady(snapshot) => log::debug!("Scene ready: {snapshot:?}"),
            }
        }
    }

    fn render(&mut self) -> Result<Option<f32>, wgpu::SurfaceError> {
        let outcome = match self.scene.frame() {
            Ok(outcome) => outcome,
            Err(err) => {
                log::warn!("Frame abandoned: {err}");
                FrameOutcome::Skipped
            }
        };
        self.drain_events();

        let (FrameOutcome::Stepped, Some(state)) = (outcome, self.scene.current_state()) else {
            return Ok(None);
        };

        let output = self.surface.get_current_texture()?;
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        if let Err(err) = self.painter.paint(
            self.scene.device(),
            state,
            self.scene.context(),
            self.scene.particle_count(),
            &view,
        ) {
            log::error!("Paint failed: {err}");
        }
        output.present();

        let now = Instant::now();
        let frame_time = (now - self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        if self.frame_times.len() >= FPS_WINDOW {
            self.frame_times.pop_front();
        }
        self.frame_times.push_back(frame_time);

        let average = self.frame_times.iter().sum::<f32>() / self.frame_times.len() as f32;
        Ok(Some(if average > 0.0 { 1.0 / average } else { 0.0 }))
    }
}

struct App {
    window: Option<Arc<Window>>,
    gpu_state: Option<GpuState>,
    field_file: Option<PathBuf>,
    mouse_pressed: bool,
    last_cursor_pos: Option<(f64, f64)>,
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = Window::default_attributes()
            .with_title("Field Play")
            .with_inner_size(winit::dpi::LogicalSize::new(1280, 800));
        let window = match event_loop.create_window(window_attributes) {
            Ok(window) => Arc::new(window),
            Err(err) => {
                log::error!("Could not create window: {err}");
                event_loop.exit();
                return;
            }
        };

        match pollster::block_on(GpuState::new(window.clone(), self.field_file.clone())) {
            Ok(state) => {
                self.gpu_state = Some(state);
                window.request_redraw();
            }
            Err(err) => {
                log::error!("Could not start: {err}");
                event_loop.exit();
            }
        }
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        let (Some(window), Some(gpu_state)) = (&self.window, &mut self.gpu_state) else {
            if matches!(event, WindowEvent::CloseRequested) {
                event_loop.exit();
            }
            return;
        };

        match event {
            WindowEvent::CloseRequested
            | WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(KeyCode::Escape),
                        ..
                    },
                ..
            } => event_loop.exit(),

            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(key_code),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => gpu_state.handle_key(key_code),

            WindowEvent::Resized(new_size) => gpu_state.resize(new_size),

            WindowEvent::MouseInput {
                state,
                button: MouseButton::Left,
                ..
            } => {
                self.mouse_pressed = state == ElementState::Pressed;
                if let (true, Some((x, y))) = (self.mouse_pressed, self.last_cursor_pos) {
                    let point = gpu_state.to_simulation(x, y);
                    gpu_state.scene.set_cursor_click(point);
                }
            }

            WindowEvent::CursorMoved { position, .. } => {
                if let (true, Some(last)) = (self.mouse_pressed, self.last_cursor_pos) {
                    gpu_state.pan((position.x - last.0) as f32, (position.y - last.1) as f32);
                }
                self.last_cursor_pos = Some((position.x, position.y));
                let point = gpu_state.to_simulation(position.x, position.y);
                gpu_state.scene.set_cursor_hover(point);
            }

            WindowEvent::MouseWheel { delta, .. } => {
                let scroll = match delta {
                    MouseScrollDelta::LineDelta(_x, y) => y,
                    MouseScrollDelta::PixelDelta(pos) => pos.y as f32 * 0.05,
                };
                let (x, y) = self.last_cursor_pos.unwrap_or_else(|| {
                    let size = window.inner_size();
                    (size.width as f64 * 0.5, size.height as f64 * 0.5)
                });
                gpu_state.zoom(ZOOM_STEP.powf(scroll), x, y);
            }

            WindowEvent::RedrawRequested => match gpu_state.render() {
                Ok(Some(fps)) => window.set_title(&format!(
                    "Field Play - {:.0} FPS - {} particles",
                    fps,
                    gpu_state.scene.particle_count()
                )),
                Ok(None) => {}
                Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                    gpu_state.resize(window.inner_size())
                }
                Err(wgpu::SurfaceError::OutOfMemory) => event_loop.exit(),
                Err(e) => log::warn!("Render error: {e:?}"),
            },

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let (Some(window), Some(gpu_state)) = (&self.window, &self.gpu_state) {
            if gpu_state.scene.wants_frame() {
                window.request_redraw();
            }
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(gpu_state) = self.gpu_state.as_mut() {
            gpu_state.scene.dispose();
        }
    }
}

fn main() {
    // Initialize logger (RUST_LOG=debug for verbose output)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("Starting field play...");

    let event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(err) => {
            log::error!("Could not create event loop: {err}");
            return;
        }
    };
    event_loop.set_control_flow(ControlFlow::Wait);

    let mut app = App {
        window: None,
        gpu_state: None,
        field_file: std::env::args_os().nth(1).map(PathBuf::from),
        mouse_pressed: false,
        last_cursor_pos: None,
    };

    if let Err(err) = event_loop.run_app(&mut app) {
        log::error!("Event loop error: {err}");
    }
}
