//! wgpu renderer for the particle pipeline.
//!
//! This module owns the device, the queue, the three rotating particle
//! buffers and the simulate/render pipelines. All cross-stage synchronization
//! is CPU-mediated: each tick's two submissions get a completion callback that
//! signals the corresponding gate token, and a dedicated poll thread drives
//! those callbacks so a blocked gate acquire on the submission thread can
//! always make progress.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use wgpu::{
    BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayout, BindGroupLayoutDescriptor,
    BindGroupLayoutEntry, Buffer, BufferDescriptor, BufferUsages, CommandEncoderDescriptor,
    ComputePipeline, Device, FragmentState, Instance, LoadOp, MultisampleState, Operations,
    PipelineLayoutDescriptor, PrimitiveState, Queue, RenderPassColorAttachment,
    RenderPassDescriptor, RenderPipeline, RenderPipelineDescriptor, ShaderStages, StoreOp,
    Surface, SurfaceConfiguration, TextureUsages, TextureViewDescriptor, VertexState,
    util::{BufferInitDescriptor, DeviceExt},
};
use winit::window::Window;

use crate::pacing::{FRAMES_IN_FLIGHT, FramePacer, PopulationMailbox};
use crate::particle::{self, MAX_PARTICLES, Particle, Settings, Viewport};

/// Must match `@workgroup_size` in `simulate.wgsl`.
const WORKGROUP_SIZE: u32 = 64;

/// Per-tick parameters shared by the simulate and render kernels.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct FrameParams {
    viewport: [f32; 2],
    live_count: u32,
    _pad: u32,
}

pub struct Renderer {
    #[allow(dead_code)]
    instance: Instance, // Keep instance alive for the lifetime of the renderer
    device: Arc<Device>,
    queue: Arc<Queue>,
    surface: Surface<'static>,
    surface_config: SurfaceConfiguration,
    simulate_pipeline: ComputePipeline,
    render_pipeline: RenderPipeline,
    particle_buffers: [Buffer; FRAMES_IN_FLIGHT],
    /// `simulate_bind_groups[i]` binds buffer `i` as input and `(i+1)%3` as output.
    simulate_bind_groups: [BindGroup; FRAMES_IN_FLIGHT],
    /// `render_bind_groups[i]` binds buffer `i` as read-only vertex input.
    render_bind_groups: [BindGroup; FRAMES_IN_FLIGHT],
    params_buf: Buffer,
    params_bind_group: BindGroup,
    pacer: FramePacer,
    viewport: Viewport,
    settings: Settings,
    live_count: u32,
    window: Arc<Window>,
    poll_stop: Arc<AtomicBool>,
    poll_thread: Option<thread::JoinHandle<()>>,
    on_applied: Option<Box<dyn Fn(Settings) + Send>>,
}

impl Renderer {
    /// Create the renderer and seed the initial population.
    ///
    /// Failure here is unrecoverable: without a surface-compatible adapter
    /// with compute support there is nothing to run.
    pub async fn new(window: Arc<Window>, settings: Settings) -> Result<Self, anyhow::Error> {
        let instance = Instance::new(&wgpu::InstanceDescriptor::default());
        let surface = instance.create_surface(window.clone())?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: Some(&surface),
            })
            .await?;

        log::info!("Using adapter: {:?}", adapter.get_info());

        let downlevel_caps = adapter.get_downlevel_capabilities();
        if !downlevel_caps
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
        {
            return Err(anyhow::anyhow!("adapter does not support compute shaders"));
        }

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("particles device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::MemoryUsage,
                trace: wgpu::Trace::Off,
            })
            .await?;

        let device = Arc::new(device);
        let queue = Arc::new(queue);

        let size = window.inner_size();
        let viewport = Viewport::new(size.width.max(1), size.height.max(1));

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .copied()
            .unwrap_or(surface_caps.formats[0]);

        let surface_config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: viewport.width,
            height: viewport.height,
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        // One buffer per in-flight frame slot, always at full capacity. wgpu
        // zero-initializes them, so unused capacity reads as zeroed particles
        // rather than garbage.
        let buffer_size = (MAX_PARTICLES * std::mem::size_of::<Particle>()) as u64;
        let particle_buffers: [Buffer; FRAMES_IN_FLIGHT] = std::array::from_fn(|i| {
            let label = format!("simulated particle buffer {}", i + 1);
            device.create_buffer(&BufferDescriptor {
                label: Some(&label),
                size: buffer_size,
                usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });

        let params_buf = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("frame parameters buffer"),
            contents: bytemuck::bytes_of(&FrameParams {
                viewport: [viewport.width as f32, viewport.height as f32],
                live_count: 0,
                _pad: 0,
            }),
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
        });

        let params_bg_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("frame parameters bind group layout"),
            entries: &[BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStages::COMPUTE | ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let params_bind_group = device.create_bind_group(&BindGroupDescriptor {
            label: Some("frame parameters bind group"),
            layout: &params_bg_layout,
            entries: &[BindGroupEntry {
                binding: 0,
                resource: params_buf.as_entire_binding(),
            }],
        });

        let (simulate_pipeline, simulate_bind_groups) =
            Self::create_simulate_pipeline(&device, &particle_buffers, &params_bg_layout);
        let (render_pipeline, render_bind_groups) = Self::create_render_pipeline(
            &device,
            &particle_buffers,
            &params_bg_layout,
            surface_format,
        );

        // Seed the first read slot so there is something to simulate before
        // the first settings apply arrives.
        let initial = particle::spawn(&settings, viewport);
        if !initial.is_empty() {
            queue.write_buffer(&particle_buffers[0], 0, bytemuck::cast_slice(&initial));
        }
        let live_count = initial.len() as u32;
        log::info!(
            "seeded {} particles ({:?}) on a {}x{} viewport",
            live_count,
            settings.coloring,
            viewport.width,
            viewport.height
        );

        let poll_stop = Arc::new(AtomicBool::new(false));
        let poll_thread = Self::spawn_poll_thread(Arc::clone(&device), Arc::clone(&poll_stop));

        Ok(Self {
            instance,
            device,
            queue,
            surface,
            surface_config,
            simulate_pipeline,
            render_pipeline,
            particle_buffers,
            simulate_bind_groups,
            render_bind_groups,
            params_buf,
            params_bind_group,
            pacer: FramePacer::new(),
            viewport,
            settings,
            live_count,
            window,
            poll_stop,
            poll_thread: Some(poll_thread),
            on_applied: None,
        })
    }

    fn create_simulate_pipeline(
        device: &Device,
        particle_buffers: &[Buffer; FRAMES_IN_FLIGHT],
        params_bg_layout: &BindGroupLayout,
    ) -> (ComputePipeline, [BindGroup; FRAMES_IN_FLIGHT]) {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("particle simulation shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("simulate.wgsl").into()),
        });

        let particles_bg_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("simulate particles bind group layout"),
            entries: &[
                BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                BindGroupLayoutEntry {
                    binding: 1,
                    visibility: ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        // One bind group per read slot: slot i feeds slot (i + 1) % 3.
        let bind_groups: [BindGroup; FRAMES_IN_FLIGHT] = std::array::from_fn(|i| {
            let label = format!(
                "simulate bind group (slot {} -> {})",
                i,
                (i + 1) % FRAMES_IN_FLIGHT
            );
            device.create_bind_group(&BindGroupDescriptor {
                label: Some(&label),
                layout: &particles_bg_layout,
                entries: &[
                    BindGroupEntry {
                        binding: 0,
                        resource: particle_buffers[i].as_entire_binding(),
                    },
                    BindGroupEntry {
                        binding: 1,
                        resource: particle_buffers[(i + 1) % FRAMES_IN_FLIGHT]
                            .as_entire_binding(),
                    },
                ],
            })
        });

        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("simulate pipeline layout"),
            bind_group_layouts: &[&particles_bg_layout, params_bg_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("simulate pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: None,
            compilation_options: Default::default(),
            cache: None,
        });

        (pipeline, bind_groups)
    }

    fn create_render_pipeline(
        device: &Device,
        particle_buffers: &[Buffer; FRAMES_IN_FLIGHT],
        params_bg_layout: &BindGroupLayout,
        surface_format: wgpu::TextureFormat,
    ) -> (RenderPipeline, [BindGroup; FRAMES_IN_FLIGHT]) {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("particle render shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("render.wgsl").into()),
        });

        let particles_bg_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("render particles bind group layout"),
            entries: &[BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: true },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let bind_groups: [BindGroup; FRAMES_IN_FLIGHT] = std::array::from_fn(|i| {
            let label = format!("render bind group (slot {i})");
            device.create_bind_group(&BindGroupDescriptor {
                label: Some(&label),
                layout: &particles_bg_layout,
                entries: &[BindGroupEntry {
                    binding: 0,
                    resource: particle_buffers[i].as_entire_binding(),
                }],
            })
        });

        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("render pipeline layout"),
            bind_group_layouts: &[&particles_bg_layout, params_bg_layout],
            push_constant_ranges: &[],
        });

        // Standard source-alpha blending, add on both channels.
        let blend = wgpu::BlendState {
            color: wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::SrcAlpha,
                dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
                operation: wgpu::BlendOperation::Add,
            },
            alpha: wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::SrcAlpha,
                dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
                operation: wgpu::BlendOperation::Add,
            },
        };

        let pipeline = device.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("particle render pipeline"),
            layout: Some(&pipeline_layout),
            vertex: VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_format,
                    blend: Some(blend),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: PrimitiveState {
                topology: wgpu::PrimitiveTopology::PointList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: None,
            multisample: MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
            cache: None,
        });

        (pipeline, bind_groups)
    }

    /// Drive completion callbacks on native. Without this thread,
    /// `on_submitted_work_done` closures would only run while the submission
    /// thread polls, and a blocking gate acquire there would deadlock.
    fn spawn_poll_thread(device: Arc<Device>, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("device-poll".into())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if let Err(e) = device.poll(wgpu::PollType::Wait {
                        submission_index: None,
                        timeout: Some(Duration::from_millis(100)),
                    }) {
                        log::trace!("device poll returned: {e}");
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            })
            .expect("failed to spawn device poll thread")
    }

    /// One tick: install any pending population, then submit one simulation
    /// pass (slot `cur` -> slot `nxt`) and one render pass reading `nxt`.
    ///
    /// A surface error abandons the tick; the gate tokens release on drop so
    /// the next tick can submit fresh without leaked permits.
    pub fn draw(&mut self) -> Result<(), wgpu::SurfaceError> {
        self.install_pending();

        let tick = self.pacer.begin_tick();

        self.queue.write_buffer(
            &self.params_buf,
            0,
            bytemuck::bytes_of(&FrameParams {
                viewport: [self.viewport.width as f32, self.viewport.height as f32],
                live_count: self.live_count,
                _pad: 0,
            }),
        );

        // Simulation submission. With a zero population the pass degenerates
        // to a no-op but the submission and its completion still happen, so
        // pacing stays uniform.
        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("simulate encoder"),
            });
        if self.live_count > 0 {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("particle simulation pass"),
                ..Default::default()
            });
            pass.set_pipeline(&self.simulate_pipeline);
            pass.set_bind_group(0, &self.simulate_bind_groups[tick.read_slot], &[]);
            pass.set_bind_group(1, &self.params_bind_group, &[]);
            pass.dispatch_workgroups(self.live_count.div_ceil(WORKGROUP_SIZE), 1, 1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        let sim_done = tick.sim_done;
        self.queue.on_submitted_work_done(move || sim_done.complete());

        // Render submission, reading the slot the simulation just wrote.
        let output = self.surface.get_current_texture()?;
        let view = output.texture.create_view(&TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("render encoder"),
            });
        {
            let mut render_pass = encoder.begin_render_pass(&RenderPassDescriptor {
                label: Some("particle render pass"),
                color_attachments: &[Some(RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: Operations {
                        load: LoadOp::Clear(wgpu::Color::WHITE),
                        store: StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            render_pass.set_pipeline(&self.render_pipeline);
            render_pass.set_bind_group(0, &self.render_bind_groups[tick.write_slot], &[]);
            render_pass.set_bind_group(1, &self.params_bind_group, &[]);
            render_pass.draw(0..self.live_count, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        let frame_done = tick.frame_done;
        self.queue.on_submitted_work_done(move || frame_done.complete());
        output.present();

        self.pacer.advance();
        Ok(())
    }

    fn install_pending(&mut self) {
        let Self {
            pacer,
            queue,
            particle_buffers,
            ..
        } = self;
        let applied = pacer.apply_pending(|slot, population| {
            if !population.particles.is_empty() {
                queue.write_buffer(
                    &particle_buffers[slot],
                    0,
                    bytemuck::cast_slice(&population.particles),
                );
            }
        });
        if let Some(population) = applied {
            self.live_count = population.particles.len() as u32;
            self.settings = population.settings;
            log::info!(
                "applied settings: {:?}, {} particles (generation {})",
                population.settings.coloring,
                population.particles.len(),
                population.generation
            );
            if let Some(on_applied) = &self.on_applied {
                on_applied(population.settings);
            }
        }
    }

    /// Stage a new population for the current viewport. The swap becomes
    /// visible at the next tick boundary; in-flight reads are unaffected.
    pub fn apply_settings(&self, settings: Settings) {
        let generation = self.pacer.mailbox().publish(settings, self.viewport);
        log::debug!(
            "staged settings: {:?}, {} particles (generation {})",
            settings.coloring,
            settings.particle_count,
            generation
        );
    }

    /// Cloneable publish handle for callers living on other threads.
    pub fn mailbox(&self) -> PopulationMailbox {
        self.pacer.mailbox()
    }

    /// Notification hook fired after a staged population has been installed.
    pub fn set_on_applied(&mut self, callback: impl Fn(Settings) + Send + 'static) {
        self.on_applied = Some(Box::new(callback));
    }

    /// Resize the render surface. The new bounds are picked up by the next
    /// tick; work already submitted keeps the viewport it was encoded with.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.viewport = Viewport::new(width, height);
            self.surface_config.width = width;
            self.surface_config.height = height;
            self.surface.configure(&self.device, &self.surface_config);
        }
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    pub fn live_count(&self) -> u32 {
        self.live_count
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // Wait for every outstanding submission to signal its token before
        // tearing anything down, then stop the poll thread.
        self.pacer.drain();
        self.poll_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.poll_thread.take() {
            let _ = handle.join();
        }
    }
}
