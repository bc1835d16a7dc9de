//! Scene orchestration
//!
//! A [`Scene`] owns the device, the compiled update program, the particle state, and the
//! per-frame loop. Hosts drive it by calling [`Scene::frame`] whenever [`Scene::wants_frame`]
//! says so, push view changes through the [`SceneBus`], and change settings with the setters.
//!
//! Setters that receive invalid values leave the scene untouched and return `false`.
//! Accepted values are written to the settings store.

use crate::context::{Cursor, Rgba, SimulationContext};
use crate::device::{RenderDevice, TextureHandle};
use crate::driver::{DriverState, IntegrationDriver};
use crate::error::{CompileError, DeviceError, EngineError};
use crate::events::{Broadcast, SceneBus, SceneEvent, Subscription};
use crate::program::{CompiledUpdateProgram, ProgramSynthesizer};
use crate::sampler::{SampleMailbox, VectorLinesRequest, VectorSampler};
use crate::scheduler::{FrameScheduler, TimeStepCompensator};
use crate::settings::{self, keys, SettingsStore};
use crate::textures::{fit_values, state_resolution, ParticleStatePair, TextureSet};
use field_core::codec;
use field_core::{
    BoundingBox, BoundingBoxMapper, CanvasRect, ColorMode, Integrator, ListenerId, Transform,
    DEFAULT_COLOR_AUX, DEFAULT_DROP_PROBABILITY, DEFAULT_FADE_OUT, DEFAULT_PARTICLE_COUNT,
    DEFAULT_TIME_STEP, MAX_PARTICLE_COUNT, MAX_TIME_STEP,
};
use glam::Vec2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Expression used when neither the host nor the settings provide one
pub const DEFAULT_VECTOR_FIELD: &str = "v.x = -p.y;\nv.y = p.x - 0.2 * p.y;";

/// Initial scene configuration; persisted settings take precedence where valid
#[derive(Debug, Clone)]
pub struct SceneConfig {
    pub particle_count: u32,
    pub integration_time_step: f32,
    pub drop_probability: f32,
    pub fade_out: f32,
    pub color_mode: ColorMode,
    pub color_aux: f32,
    pub background: Rgba,
    pub vector_field: String,
    pub integrator: Integrator,
    pub canvas: CanvasRect,
    /// Initial visible region; defaults to [`BoundingBox::default`]
    pub bbox: Option<BoundingBox>,
    /// Scale the time step by frame duration
    pub compensate_time_step: bool,
    /// Seed for initial positions and per-frame seeds; random when `None`
    pub seed: Option<u64>,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            particle_count: DEFAULT_PARTICLE_COUNT,
            integration_time_step: DEFAULT_TIME_STEP,
            drop_probability: DEFAULT_DROP_PROBABILITY,
            fade_out: DEFAULT_FADE_OUT,
            color_mode: ColorMode::default(),
            color_aux: DEFAULT_COLOR_AUX,
            background: Rgba::default(),
            vector_field: DEFAULT_VECTOR_FIELD.to_string(),
            integrator: Integrator::default(),
            canvas: CanvasRect::new(800.0, 600.0),
            bbox: None,
            compensate_time_step: true,
            seed: None,
        }
    }
}

fn valid_particle_count(count: u32) -> bool {
    (1..=MAX_PARTICLE_COUNT).contains(&count)
}

fn valid_fraction(value: f32) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

fn valid_time_step(value: f32) -> bool {
    value.is_finite() && value.abs() <= MAX_TIME_STEP
}

impl SceneConfig {
    /// Overlay valid persisted values. Returns the saved vector field separately so a broken
    /// saved expression can fall back to the configured one.
    fn merge_settings(mut self, store: &dyn SettingsStore) -> (Self, Option<String>) {
        if let Some(count) = settings::load::<u32>(store, keys::PARTICLE_COUNT) {
            if valid_particle_count(count) {
                self.particle_count = count;
            }
        }
        if let Some(fade_out) = settings::load::<f32>(store, keys::FADE_OUT) {
            if valid_fraction(fade_out) {
                self.fade_out = fade_out;
            }
        }
        if let Some(drop) = settings::load::<f32>(store, keys::DROP_PROBABILITY) {
            if valid_fraction(drop) {
                self.drop_probability = drop;
            }
        }
        if let Some(step) = settings::load::<f32>(store, keys::TIME_STEP) {
            if valid_time_step(step) {
                self.integration_time_step = step;
            }
        }
        if let Some(mode) = settings::load::<i64>(store, keys::COLOR_MODE).and_then(ColorMode::from_index)
        {
            self.color_mode = mode;
        }
        if let Some(bbox) = settings::load::<BoundingBox>(store, keys::BBOX) {
            if bbox.is_valid() {
                self.bbox = Some(bbox);
            }
        }
        let saved_field = settings::load::<String>(store, keys::VECTOR_FIELD);
        (self, saved_field)
    }
}

/// Summary of the scene's settings, published with `SceneReady`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneSnapshot {
    pub particle_count: u32,
    pub particle_state_resolution: u32,
    pub integration_time_step: f32,
    pub drop_probability: f32,
    pub fade_out: f32,
    pub color_mode: u32,
    pub color_aux: f32,
    pub background: Rgba,
    pub bbox: BoundingBox,
    pub vector_field: String,
    pub paused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// No frame was requested, or the scene is disposed
    Skipped,
    /// The particles advanced one step
    Stepped,
}

pub struct Scene<D: RenderDevice> {
    device: D,
    context: SimulationContext,
    synthesizer: ProgramSynthesizer,
    program: Option<CompiledUpdateProgram>,
    vector_field: String,
    pair: Option<ParticleStatePair>,
    particle_count: u32,
    aux_signal: Option<TextureHandle>,

    driver: IntegrationDriver,
    sampler: VectorSampler,
    scheduler: FrameScheduler,
    compensator: Option<TimeStepCompensator>,

    mapper: BoundingBoxMapper,
    bbox_listener: ListenerId,
    events: Broadcast<SceneEvent>,
    transforms: Option<Subscription<Transform>>,
    settings: Box<dyn SettingsStore>,

    rng: StdRng,
    disposed: bool,
}

impl<D: RenderDevice> Scene<D> {
    /// Build the program, allocate particle state, and schedule the first frame.
    pub fn new(
        mut device: D,
        config: SceneConfig,
        settings: Box<dyn SettingsStore>,
        bus: &SceneBus,
    ) -> Result<Self, EngineError> {
        log::info!("Creating scene...");
        let (config, saved_field) = config.merge_settings(settings.as_ref());
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let view = config.bbox.unwrap_or_default();
        let transform =
            BoundingBoxMapper::transform_for(&view, &config.canvas).unwrap_or_default();
        let mut mapper = BoundingBoxMapper::new(transform, config.canvas);
        let events = bus.events.clone();
        let bbox_listener = mapper.subscribe(move |bbox| {
            events.publish(SceneEvent::BboxChange(*bbox));
        });

        let synthesizer = ProgramSynthesizer::new(config.integrator);
        let mut candidates: Vec<String> = saved_field.into_iter().collect();
        candidates.push(config.vector_field.clone());
        let mut built = None;
        let mut last_error = None;
        for source in candidates {
            match synthesizer.build(&mut device, &source, config.color_mode) {
                Ok(program) => {
                    built = Some((program, source));
                    break;
                }
                Err(err) => {
                    log::warn!("Vector field does not compile: {err}");
                    last_error = Some(err);
                }
            }
        }
        let (program, vector_field) = match (built, last_error) {
            (Some(built), _) => built,
            (None, Some(err)) => return Err(err.into()),
            (None, None) => return Err(CompileError::new("Update Program", "no source").into()),
        };

        let bbox = mapper.current();
        let pair =
            match ParticleStatePair::allocate(&mut device, config.particle_count, &bbox, &mut rng) {
                Ok(pair) => pair,
                Err(err) => {
                    program.dispose(&mut device);
                    return Err(err.into());
                }
            };

        let context = SimulationContext {
            bbox,
            cursor: Cursor::default(),
            integration_time_step: config.integration_time_step,
            drop_probability: config.drop_probability,
            fade_out: config.fade_out,
            color_mode: config.color_mode,
            color_aux: if config.color_aux.is_finite() && config.color_aux > 0.0 {
                config.color_aux
            } else {
                DEFAULT_COLOR_AUX
            },
            background: if config.background.is_valid() {
                config.background
            } else {
                Rgba::default()
            },
            particle_state_resolution: pair.resolution(),
            frame: 0,
            frame_seed: 1.0,
            aux_signal_len: 0,
        };

        let mut scheduler = FrameScheduler::new();
        scheduler.request();

        let scene = Self {
            device,
            context,
            synthesizer,
            program: Some(program),
            vector_field,
            particle_count: config.particle_count,
            pair: Some(pair),
            aux_signal: None,
            driver: IntegrationDriver::new(),
            sampler: VectorSampler::new(bus.samples.clone()),
            scheduler,
            compensator: config
                .compensate_time_step
                .then(TimeStepCompensator::new),
            mapper,
            bbox_listener,
            events: bus.events.clone(),
            transforms: Some(bus.transforms.subscribe()),
            settings,
            rng,
            disposed: false,
        };

        scene
            .events
            .publish(SceneEvent::SceneReady(scene.snapshot()));
        log::info!(
            "Scene ready: {} particles, {}",
            scene.particle_count,
            scene.context.bbox.to_array().map(|v| v.to_string()).join(" ")
        );
        Ok(scene)
    }

    /// Run one frame if one was requested.
    pub fn frame(&mut self) -> Result<FrameOutcome, DeviceError> {
        self.frame_at(Instant::now())
    }

    /// [`frame`](Self::frame) with an explicit timestamp for time-step compensation.
    pub fn frame_at(&mut self, now: Instant) -> Result<FrameOutcome, DeviceError> {
        if self.disposed || !self.scheduler.begin() {
            return Ok(FrameOutcome::Skipped);
        }
        // Whatever happens below, keep the loop going unless paused.
        self.scheduler.request();

        self.drain_transforms();

        let (Some(program), Some(pair)) = (self.program.as_mut(), self.pair.as_mut()) else {
            return Err(DeviceError::NoParticleState);
        };

        self.context.frame_seed = 1.0 + self.rng.random::<f32>();
        let time_step = match self.compensator.as_mut() {
            Some(compensator) => compensator.corrected(self.context.integration_time_step, now),
            None => self.context.integration_time_step,
        };

        self.driver.step(
            &mut self.device,
            program,
            pair,
            &self.context,
            time_step,
            self.aux_signal,
        )?;

        match self.sampler.process_one(&mut self.device, program) {
            Ok(Some(result)) => {
                self.events
                    .publish(SceneEvent::VectorLineReady(Arc::new(result)));
            }
            Ok(None) => {}
            Err(err) => log::warn!("Vector sample request dropped: {err}"),
        }

        self.context.frame = self.context.frame.wrapping_add(1);
        Ok(FrameOutcome::Stepped)
    }

    /// Whether the host should schedule another display frame.
    pub fn wants_frame(&self) -> bool {
        !self.disposed && self.scheduler.is_pending()
    }

    fn drain_transforms(&mut self) {
        let pending = match &self.transforms {
            Some(subscription) => subscription.drain(),
            None => return,
        };
        for transform in pending {
            self.apply_transform(transform);
        }
    }

    /// Recompute the visible region from a pan-zoom transform.
    pub fn apply_transform(&mut self, transform: Transform) -> BoundingBox {
        let bbox = self.mapper.update_transform(transform);
        self.set_bbox(bbox);
        bbox
    }

    /// Resize the canvas, keeping the current transform.
    pub fn set_canvas(&mut self, canvas: CanvasRect) -> BoundingBox {
        let bbox = self.mapper.update_canvas(canvas);
        self.set_bbox(bbox);
        bbox
    }

    fn set_bbox(&mut self, bbox: BoundingBox) {
        if self.context.bbox != bbox {
            self.context.bbox = bbox;
            settings::save(self.settings.as_mut(), keys::BBOX, &bbox);
        }
    }

    /// Simulation-space point under a canvas pixel.
    pub fn canvas_to_simulation(&self, pixel_x: f32, pixel_y: f32) -> Vec2 {
        self.mapper.to_simulation(pixel_x, pixel_y)
    }

    /// Reallocate particle state for `count` particles.
    ///
    /// The old state is released before the new one is allocated. If allocation fails the
    /// previous count is restored when possible and the error is returned.
    pub fn set_particle_count(&mut self, count: u32) -> Result<bool, DeviceError> {
        if !valid_particle_count(count) {
            log::debug!("Ignoring particle count {count}");
            return Ok(false);
        }
        if count == self.particle_count && self.pair.is_some() {
            return Ok(true);
        }

        if let Some(old) = self.pair.take() {
            old.release(&mut self.device);
        }

        match ParticleStatePair::allocate(&mut self.device, count, &self.context.bbox, &mut self.rng)
        {
            Ok(pair) => {
                self.install_pair(pair);
                settings::save(self.settings.as_mut(), keys::PARTICLE_COUNT, &count);
                Ok(true)
            }
            Err(err) => {
                log::error!("Could not allocate state for {count} particles: {err}");
                match ParticleStatePair::allocate(
                    &mut self.device,
                    self.particle_count,
                    &self.context.bbox,
                    &mut self.rng,
                ) {
                    Ok(pair) => self.install_pair(pair),
                    Err(err) => log::error!("Particle state lost: {err}"),
                }
                Err(err)
            }
        }
    }

    fn install_pair(&mut self, pair: ParticleStatePair) {
        self.particle_count = pair.particle_count();
        self.context.particle_state_resolution = pair.resolution();
        self.pair = Some(pair);
    }

    pub fn set_fade_out(&mut self, fade_out: f32) -> bool {
        if !valid_fraction(fade_out) {
            log::debug!("Ignoring fade out {fade_out}");
            return false;
        }
        self.context.fade_out = fade_out;
        settings::save(self.settings.as_mut(), keys::FADE_OUT, &fade_out);
        true
    }

    pub fn set_drop_probability(&mut self, drop_probability: f32) -> bool {
        if !valid_fraction(drop_probability) {
            log::debug!("Ignoring drop probability {drop_probability}");
            return false;
        }
        self.context.drop_probability = drop_probability;
        settings::save(
            self.settings.as_mut(),
            keys::DROP_PROBABILITY,
            &drop_probability,
        );
        true
    }

    pub fn set_integration_time_step(&mut self, time_step: f32) -> bool {
        if !valid_time_step(time_step) {
            log::debug!("Ignoring time step {time_step}");
            return false;
        }
        self.context.integration_time_step = time_step;
        settings::save(self.settings.as_mut(), keys::TIME_STEP, &time_step);
        self.events
            .publish(SceneEvent::IntegrationTimestepChanged(time_step));
        true
    }

    /// Set the time step as a multiple of the default one.
    pub fn set_integration_speed(&mut self, speed: f32) -> bool {
        self.set_integration_time_step(DEFAULT_TIME_STEP * speed)
    }

    pub fn set_color_aux(&mut self, aux: f32) -> bool {
        if !aux.is_finite() || aux <= 0.0 {
            log::debug!("Ignoring color aux {aux}");
            return false;
        }
        self.context.color_aux = aux;
        true
    }

    pub fn set_background_color(&mut self, color: Rgba) -> bool {
        if !color.is_valid() {
            log::debug!("Ignoring background {color:?}");
            return false;
        }
        self.context.background = color;
        true
    }

    /// Rebuild the program for a new color mode.
    pub fn set_color_mode(&mut self, mode: ColorMode) -> Result<(), CompileError> {
        if mode == self.context.color_mode {
            return Ok(());
        }
        let source = self.vector_field.clone();
        self.install_program(&source, mode)?;
        self.context.color_mode = mode;
        settings::save(self.settings.as_mut(), keys::COLOR_MODE, &mode.index());
        Ok(())
    }

    /// [`set_color_mode`](Self::set_color_mode) from a persisted index; unknown indices are
    /// ignored.
    pub fn set_color_mode_index(&mut self, index: i64) -> Result<bool, CompileError> {
        match ColorMode::from_index(index) {
            Some(mode) => self.set_color_mode(mode).map(|()| true),
            None => {
                log::debug!("Ignoring color mode {index}");
                Ok(false)
            }
        }
    }

    /// Compile a new vector field expression.
    ///
    /// On failure the previous program keeps running and the diagnostic is returned.
    pub fn set_vector_field(&mut self, source: &str) -> Result<(), CompileError> {
        self.install_program(source, self.context.color_mode)?;
        self.vector_field = source.to_string();
        settings::save(self.settings.as_mut(), keys::VECTOR_FIELD, &self.vector_field);
        Ok(())
    }

    fn install_program(&mut self, source: &str, mode: ColorMode) -> Result<(), CompileError> {
        let mut program = self.synthesizer.build(&mut self.device, source, mode)?;
        if let Some(old) = self.program.take() {
            program.inherit_uniforms(&old);
            old.dispose(&mut self.device);
        }
        self.program = Some(program);
        self.context.frame = 0;
        Ok(())
    }

    /// Set a uniform read by the vector field expression.
    ///
    /// `h`, `drop_rate`, and `aux` go through the matching setters; `frame` and `rand_seed`
    /// are owned by the scene and cannot be set.
    pub fn set_uniform(&mut self, name: &str, value: f32) -> bool {
        match name.strip_prefix("u_").unwrap_or(name) {
            "h" => self.set_integration_time_step(value),
            "drop_rate" => self.set_drop_probability(value),
            "aux" => self.set_color_aux(value),
            "frame" | "rand_seed" => false,
            other => self
                .program
                .as_mut()
                .is_some_and(|program| program.set_uniform_scalar(other, value)),
        }
    }

    pub fn set_cursor_click(&mut self, point: Vec2) {
        self.context.cursor.click = point;
    }

    pub fn set_cursor_hover(&mut self, point: Vec2) {
        self.context.cursor.hover = point;
    }

    /// Replace the aux signal readable through `aux_signal(i)`. An empty slice removes it.
    pub fn set_aux_signal(&mut self, values: &[f32]) -> Result<(), DeviceError> {
        if let Some(old) = self.aux_signal.take() {
            self.device.release_texture(old);
        }
        self.context.aux_signal_len = 0;
        if values.is_empty() {
            return Ok(());
        }

        let len = values.len().min(MAX_PARTICLE_COUNT as usize);
        let resolution = state_resolution(len as u32);
        let texels = resolution as usize * resolution as usize;
        let packed = codec::encode_all(&fit_values(&values[..len], texels));
        let handle = self
            .device
            .create_state_texture("Aux Signal", resolution, &packed)?;

        self.aux_signal = Some(handle);
        self.context.aux_signal_len = len as u32;
        Ok(())
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.scheduler.set_paused(paused);
        if !paused {
            if let Some(compensator) = self.compensator.as_mut() {
                compensator.reset();
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.scheduler.is_paused()
    }

    /// Queue a vector sample request; it is served after the next integration step.
    pub fn request_vector_lines(&self, request: VectorLinesRequest) -> bool {
        self.sampler.enqueue(request)
    }

    pub fn sample_mailbox(&self) -> &SampleMailbox {
        self.sampler.mailbox()
    }

    pub fn subscribe(&self) -> Subscription<SceneEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> SceneSnapshot {
        SceneSnapshot {
            particle_count: self.particle_count,
            particle_state_resolution: self.context.particle_state_resolution,
            integration_time_step: self.context.integration_time_step,
            drop_probability: self.context.drop_probability,
            fade_out: self.context.fade_out,
            color_mode: self.context.color_mode.index(),
            color_aux: self.context.color_aux,
            background: self.context.background,
            bbox: self.context.bbox,
            vector_field: self.vector_field.clone(),
            paused: self.is_paused(),
        }
    }

    pub fn context(&self) -> &SimulationContext {
        &self.context
    }

    pub fn particle_count(&self) -> u32 {
        self.particle_count
    }

    pub fn bbox(&self) -> BoundingBox {
        self.context.bbox
    }

    pub fn transform(&self) -> Transform {
        self.mapper.transform()
    }

    pub fn vector_field(&self) -> &str {
        &self.vector_field
    }

    pub fn program(&self) -> Option<&CompiledUpdateProgram> {
        self.program.as_ref()
    }

    /// Texture set holding the latest complete particle state.
    pub fn current_state(&self) -> Option<&TextureSet> {
        self.pair.as_ref().map(ParticleStatePair::read)
    }

    pub fn driver_state(&self) -> DriverState {
        self.driver.state()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn settings(&self) -> &dyn SettingsStore {
        self.settings.as_ref()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Release every device resource and detach from the bus. Safe to call more than once.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        if let Some(pair) = self.pair.take() {
            pair.release(&mut self.device);
        }
        if let Some(aux_signal) = self.aux_signal.take() {
            self.device.release_texture(aux_signal);
        }
        if let Some(program) = self.program.take() {
            program.dispose(&mut self.device);
        }
        self.transforms = None;
        self.mapper.unsubscribe(self.bbox_listener);

        if let Err(err) = self.settings.flush() {
            log::warn!("Could not save settings: {err}");
        }
        log::info!("Scene disposed");
    }
}

impl<D: RenderDevice> Drop for Scene<D> {
    fn drop(&mut self) {
        self.dispose();
    }
}
