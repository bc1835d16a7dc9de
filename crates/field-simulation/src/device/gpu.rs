//! wgpu implementation of [`RenderDevice`]
//!
//! NOTE: State textures are `Rgba8Uint`, one packed `f32` per texel (see `field_core::codec`).
//! Each draw is submitted on its own because the output channel lives in the single uniform
//! buffer of the program; batching several passes into one encoder would make them all see the
//! last `write_buffer`.

use super::{
    check_texel_count, validate_wgsl, DrawPass, ProgramHandle, ProgramSource, RenderDevice,
    TextureHandle,
};
use crate::error::{CompileError, DeviceError, EngineError};
use crate::params::UpdateUniforms;
use field_core::codec::PackedFloat;
use std::collections::HashMap;
use std::sync::mpsc;
use std::time::Duration;
use wgpu::util::DeviceExt;

/// Texel format of every particle-state texture
pub const STATE_TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Uint;

const DEFAULT_READBACK_TIMEOUT: Duration = Duration::from_secs(5);

struct StateTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    resolution: u32,
}

struct UpdatePipeline {
    pipeline: wgpu::RenderPipeline,
    uniform_buffer: wgpu::Buffer,
}

/// GPU-backed device owning every state texture and update pipeline it hands out
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,

    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,

    // Bound in place of the aux signal when a pass has none
    empty_signal: StateTexture,

    textures: HashMap<TextureHandle, StateTexture>,
    programs: HashMap<ProgramHandle, UpdatePipeline>,
    next_id: u32,
    readback_timeout: Duration,
}

impl WgpuDevice {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        log::info!("Initializing WgpuDevice...");

        let texture_entry = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Uint,
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Update Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                texture_entry(1), // position x
                texture_entry(2), // position y
                texture_entry(3), // aux signal
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Update Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let empty_signal = create_texture(&device, &queue, "Empty Aux Signal", 1, &[[0; 4]]);

        Self {
            device,
            queue,
            bind_group_layout,
            pipeline_layout,
            empty_signal,
            textures: HashMap::new(),
            programs: HashMap::new(),
            next_id: 0,
            readback_timeout: DEFAULT_READBACK_TIMEOUT,
        }
    }

    /// Device on the default adapter without any surface, for offscreen use and tests.
    pub async fn headless() -> Result<Self, EngineError> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::default(),
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| EngineError::Adapter(e.to_string()))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Field Device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::default(),
                experimental_features: wgpu::ExperimentalFeatures::default(),
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| EngineError::Adapter(e.to_string()))?;

        Ok(Self::new(device, queue))
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// View of a state texture, for the painting stage.
    pub fn texture_view(&self, texture: TextureHandle) -> Option<&wgpu::TextureView> {
        self.textures.get(&texture).map(|t| &t.view)
    }

    pub fn set_readback_timeout(&mut self, timeout: Duration) {
        self.readback_timeout = timeout;
    }

    fn texture(&self, handle: TextureHandle) -> Result<&StateTexture, DeviceError> {
        self.textures.get(&handle).ok_or(DeviceError::UnknownTexture)
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Run `f` inside validation and out-of-memory error scopes.
    fn scoped<T>(&self, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        (value, validation.or(out_of_memory))
    }
}

fn create_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    label: &str,
    resolution: u32,
    texels: &[PackedFloat],
) -> StateTexture {
    let texture = device.create_texture_with_data(
        queue,
        &wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: resolution,
                height: resolution,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: STATE_TEXTURE_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        },
        wgpu::util::TextureDataOrder::LayerMajor,
        bytemuck::cast_slice(texels),
    );
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

    StateTexture {
        texture,
        view,
        resolution,
    }
}

impl RenderDevice for WgpuDevice {
    fn create_state_texture(
        &mut self,
        label: &str,
        resolution: u32,
        texels: &[PackedFloat],
    ) -> Result<TextureHandle, DeviceError> {
        check_texel_count(resolution, texels)?;

        let limit = self.device.limits().max_texture_dimension_2d;
        if resolution > limit {
            return Err(DeviceError::Allocation(format!(
                "{resolution} exceeds the device texture limit {limit}"
            )));
        }

        let (texture, error) =
            self.scoped(|| create_texture(&self.device, &self.queue, label, resolution, texels));
        if let Some(error) = error {
            texture.texture.destroy();
            return Err(DeviceError::Allocation(error.to_string()));
        }

        let handle = TextureHandle(self.next_id());
        self.textures.insert(handle, texture);
        log::debug!("Allocated {label} ({resolution}x{resolution})");
        Ok(handle)
    }

    fn release_texture(&mut self, texture: TextureHandle) {
        if let Some(state) = self.textures.remove(&texture) {
            state.texture.destroy();
        }
    }

    fn texture_resolution(&self, texture: TextureHandle) -> Option<u32> {
        self.textures.get(&texture).map(|t| t.resolution)
    }

    fn compile_program(&mut self, source: &ProgramSource) -> Result<ProgramHandle, CompileError> {
        // Catch expression errors with a readable diagnostic before the driver sees them.
        validate_wgsl(&format!("{} (vertex)", source.label), &source.vertex)?;
        validate_wgsl(&format!("{} (fragment)", source.label), &source.fragment)?;

        let (pipeline, error) = self.scoped(|| {
            let vertex = self
                .device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("Update Vertex Shader"),
                    source: wgpu::ShaderSource::Wgsl(source.vertex.as_str().into()),
                });
            let fragment = self
                .device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("Update Kernel Shader"),
                    source: wgpu::ShaderSource::Wgsl(source.fragment.as_str().into()),
                });

            let pipeline = self
                .device
                .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some(&source.label),
                    layout: Some(&self.pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: &vertex,
                        entry_point: Some("vs_quad"),
                        buffers: &[],
                        compilation_options: Default::default(),
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: &fragment,
                        entry_point: Some("fs_update"),
                        targets: &[Some(wgpu::ColorTargetState {
                            format: STATE_TEXTURE_FORMAT,
                            blend: None,
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                        compilation_options: Default::default(),
                    }),
                    primitive: wgpu::PrimitiveState {
                        topology: wgpu::PrimitiveTopology::TriangleList,
                        ..Default::default()
                    },
                    depth_stencil: None,
                    multisample: wgpu::MultisampleState::default(),
                    multiview: None,
                    cache: None,
                });

            let uniform_buffer = self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("Update Uniform Buffer"),
                    contents: bytemuck::bytes_of(&UpdateUniforms::default()),
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                });

            UpdatePipeline {
                pipeline,
                uniform_buffer,
            }
        });

        if let Some(error) = error {
            return Err(CompileError::new(&source.label, error.to_string()));
        }

        let handle = ProgramHandle(self.next_id());
        self.programs.insert(handle, pipeline);
        log::info!("Compiled {}", source.label);
        Ok(handle)
    }

    fn release_program(&mut self, program: ProgramHandle) {
        if let Some(pipeline) = self.programs.remove(&program) {
            pipeline.uniform_buffer.destroy();
        }
    }

    fn draw(&mut self, pass: &DrawPass<'_>) -> Result<(), DeviceError> {
        let program = self
            .programs
            .get(&pass.program)
            .ok_or(DeviceError::UnknownProgram)?;
        let position_x = self.texture(pass.position_x)?;
        let position_y = self.texture(pass.position_y)?;
        let target = self.texture(pass.target)?;
        let aux_signal = match pass.aux_signal {
            Some(handle) => self.texture(handle)?,
            None => &self.empty_signal,
        };

        for source in [position_x, position_y] {
            if source.resolution != target.resolution {
                return Err(DeviceError::ResolutionMismatch {
                    expected: target.resolution,
                    actual: source.resolution,
                });
            }
        }

        let ((), error) = self.scoped(|| {
            self.queue
                .write_buffer(&program.uniform_buffer, 0, bytemuck::bytes_of(pass.uniforms));

            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Update Bind Group"),
                layout: &self.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: program.uniform_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(&position_x.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(&position_y.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: wgpu::BindingResource::TextureView(&aux_signal.view),
                    },
                ],
            });

            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Update Encoder"),
                });

            {
                let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("Update Pass"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &target.view,
                        resolve_target: None,
                        depth_slice: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                render_pass.set_pipeline(&program.pipeline);
                render_pass.set_bind_group(0, &bind_group, &[]);
                render_pass.draw(0..6, 0..1);
            }

            self.queue.submit(std::iter::once(encoder.finish()));
        });

        match error {
            Some(error) => Err(DeviceError::Draw(error.to_string())),
            None => Ok(()),
        }
    }

    fn read_pixels(&mut self, texture: TextureHandle) -> Result<Vec<PackedFloat>, DeviceError> {
        let state = self.texture(texture)?;
        let resolution = state.resolution;

        // `bytes_per_row` must be 256-byte aligned, so rows are padded in the staging buffer.
        let unpadded = resolution * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded = unpadded.div_ceil(align) * align;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("State Readback Buffer"),
            size: padded as u64 * resolution as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &state.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(resolution),
                },
            },
            wgpu::Extent3d {
                width: resolution,
                height: resolution,
                depth_or_array_layers: 1,
            },
        );
        let submission = self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });

        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: Some(submission),
                timeout: Some(self.readback_timeout),
            })
            .map_err(|e| match e {
                wgpu::PollError::Timeout => DeviceError::Timeout,
                other => DeviceError::Readback(other.to_string()),
            })?;

        match receiver.try_recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(DeviceError::Readback(e.to_string())),
            Err(_) => return Err(DeviceError::Timeout),
        }

        let texels = {
            let data = slice.get_mapped_range();
            data.chunks_exact(padded as usize)
                .flat_map(|row| row[..unpadded as usize].chunks_exact(4))
                .map(|px| [px[0], px[1], px[2], px[3]])
                .collect()
        };
        staging.unmap();
        staging.destroy();

        Ok(texels)
    }

    fn live_resources(&self) -> usize {
        self.textures.len() + self.programs.len()
    }
}
