//! Particle painting stage

use crate::palette::{PaintUniforms, ParticlePalette};
use field_simulation::{DeviceError, Dimension, SimulationContext, TextureSet, WgpuDevice};

/// Format of the textures trails accumulate in
pub const TRAIL_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

/// Fades the last frame, draws particles on top, and presents
///
/// Two trail textures alternate as fade source and draw target, so every frame starts from the
/// previous one.
pub struct ParticlePainter {
    fade_pipeline: wgpu::RenderPipeline,
    present_pipeline: wgpu::RenderPipeline,
    points_pipeline: wgpu::RenderPipeline,
    trail_layout: wgpu::BindGroupLayout,
    state_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,

    trails: [wgpu::TextureView; 2],
    current: usize,
    size: (u32, u32),
    present_offset: [f32; 2],
    needs_clear: bool,
    palette: ParticlePalette,
}

fn uniform_entry() -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding: 0,
        visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn texture_entry(
    binding: u32,
    visibility: wgpu::ShaderStages,
    sample_type: wgpu::TextureSampleType,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Texture {
            sample_type,
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn pipeline(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::PipelineLayout,
    shader: &wgpu::ShaderModule,
    entry_points: (&str, &str),
    format: wgpu::TextureFormat,
    blend: Option<wgpu::BlendState>,
    topology: wgpu::PrimitiveTopology,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: shader,
            entry_point: Some(entry_points.0),
            buffers: &[],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: shader,
            entry_point: Some(entry_points.1),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            unclipped_depth: false,
            polygon_mode: wgpu::PolygonMode::Fill,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

fn create_trail(device: &wgpu::Device, width: u32, height: u32) -> wgpu::TextureView {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Trail Texture"),
        size: wgpu::Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TRAIL_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        view_formats: &[],
    });
    texture.create_view(&wgpu::TextureViewDescriptor::default())
}

impl ParticlePainter {
    pub fn new(
        device: &wgpu::Device,
        surface_format: wgpu::TextureFormat,
        width: u32,
        height: u32,
    ) -> Self {
        log::info!("Creating particle painter ({width}x{height}, {surface_format:?})");

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Paint Uniform Buffer"),
            size: std::mem::size_of::<PaintUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let trail_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Trail Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/trail.wgsl").into()),
        });
        let points_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Points Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/points.wgsl").into()),
        });

        let trail_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Trail Bind Group Layout"),
            entries: &[
                uniform_entry(),
                texture_entry(
                    1,
                    wgpu::ShaderStages::FRAGMENT,
                    wgpu::TextureSampleType::Float { filterable: false },
                ),
            ],
        });

        let state_entry =
            |binding| texture_entry(binding, wgpu::ShaderStages::VERTEX, wgpu::TextureSampleType::Uint);
        let state_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Particle State Bind Group Layout"),
            entries: &[
                uniform_entry(),
                state_entry(1), // position x
                state_entry(2), // position y
                state_entry(3), // color
            ],
        });

        let trail_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Trail Pipeline Layout"),
            bind_group_layouts: &[&trail_layout],
            push_constant_ranges: &[],
        });
        let points_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Points Pipeline Layout"),
                bind_group_layouts: &[&state_layout],
                push_constant_ranges: &[],
            });

        let fade_pipeline = pipeline(
            device,
            "Fade Pipeline",
            &trail_pipeline_layout,
            &trail_shader,
            ("vs_fullscreen", "fs_fade"),
            TRAIL_FORMAT,
            None,
            wgpu::PrimitiveTopology::TriangleList,
        );
        let present_pipeline = pipeline(
            device,
            "Present Pipeline",
            &trail_pipeline_layout,
            &trail_shader,
            ("vs_fullscreen", "fs_present"),
            surface_format,
            None,
            wgpu::PrimitiveTopology::TriangleList,
        );
        let points_pipeline = pipeline(
            device,
            "Points Pipeline",
            &points_pipeline_layout,
            &points_shader,
            ("vs_points", "fs_points"),
            TRAIL_FORMAT,
            Some(wgpu::BlendState::ALPHA_BLENDING),
            wgpu::PrimitiveTopology::PointList,
        );

        Self {
            fade_pipeline,
            present_pipeline,
            points_pipeline,
            trail_layout,
            state_layout,
            uniform_buffer,
            trails: [
                create_trail(device, width, height),
                create_trail(device, width, height),
            ],
            current: 0,
            size: (width, height),
            present_offset: [0.0; 2],
            needs_clear: true,
            palette: ParticlePalette::default(),
        }
    }

    /// Match the surface size. Trails restart from the background.
    pub fn resize(&mut self, device: &wgpu::Device, width: u32, height: u32) {
        if self.size == (width, height) {
            return;
        }
        self.trails = [
            create_trail(device, width, height),
            create_trail(device, width, height),
        ];
        self.size = (width, height);
        self.needs_clear = true;
    }

    /// Drop accumulated trails on the next paint, e.g. after the view moved.
    pub fn clear(&mut self) {
        self.needs_clear = true;
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    /// Trail texel that lands on the top-left surface pixel. Used when the trail texture covers
    /// a canvas larger than the surface.
    pub fn set_present_offset(&mut self, x: f32, y: f32) {
        self.present_offset = [x, y];
    }

    pub fn palette(&self) -> &ParticlePalette {
        &self.palette
    }

    pub fn set_palette(&mut self, palette: ParticlePalette) {
        self.palette = palette;
    }

    /// Paint `state` and present it to `target`.
    pub fn paint(
        &mut self,
        device: &WgpuDevice,
        state: &TextureSet,
        context: &SimulationContext,
        particle_count: u32,
        target: &wgpu::TextureView,
    ) -> Result<(), DeviceError> {
        let view = |dimension| {
            state
                .get(dimension)
                .and_then(|handle| device.texture_view(handle))
                .ok_or(DeviceError::UnknownTexture)
        };
        let position_x = view(Dimension::X)?;
        let position_y = view(Dimension::Y)?;
        let color = view(Dimension::Color)?;

        let mut uniforms = PaintUniforms::new(context, particle_count, &self.palette);
        uniforms.present_offset = [self.present_offset[0], self.present_offset[1], 0.0, 0.0];
        device
            .queue()
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));

        let gpu = device.device();
        let previous = &self.trails[self.current];
        let next = &self.trails[1 - self.current];

        let trail_group = |label, view: &wgpu::TextureView| {
            gpu.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &self.trail_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: self.uniform_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(view),
                    },
                ],
            })
        };
        let fade_group = trail_group("Fade Bind Group", previous);
        let present_group = trail_group("Present Bind Group", next);
        let state_group = gpu.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Particle State Bind Group"),
            layout: &self.state_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(position_x),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(position_y),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(color),
                },
            ],
        });

        let mut encoder = gpu.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Paint Encoder"),
        });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Trail Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: next,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(uniforms.clear_color()),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            if !self.needs_clear {
                pass.set_pipeline(&self.fade_pipeline);
                pass.set_bind_group(0, &fade_group, &[]);
                pass.draw(0..6, 0..1);
            }

            pass.set_pipeline(&self.points_pipeline);
            pass.set_bind_group(0, &state_group, &[]);
            pass.draw(0..particle_count, 0..1);
        }

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Present Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(uniforms.clear_color()),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            pass.set_pipeline(&self.present_pipeline);
            pass.set_bind_group(0, &present_group, &[]);
            pass.draw(0..6, 0..1);
        }

        device.queue().submit(std::iter::once(encoder.finish()));

        self.current = 1 - self.current;
        self.needs_clear = false;
        Ok(())
    }
}
