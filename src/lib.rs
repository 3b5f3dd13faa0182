use std::sync::Arc;

use winit::{
    event::WindowEvent,
    event_loop::{EventLoop, EventLoopProxy},
    window::WindowAttributes,
};

use crate::{gpu::Renderer, particle::Settings};

pub mod gate;
pub mod gpu;
pub mod pacing;
pub mod particle;

/// Messages delivered to the application through the event loop proxy.
///
/// `ApplySettings` and the lifecycle signals are the surface exposed to the
/// settings UI collaborator; nothing in this crate sends them itself.
pub enum RendererMessage {
    Initialized(Renderer),
    Error(String),
    ApplySettings(Settings),
    TogglePause,
    Pause,
    Resume,
}

struct Application {
    proxy: Option<EventLoopProxy<RendererMessage>>,
    renderer: Option<Renderer>,
    settings: Settings,
    paused: bool,
}

impl Application {
    fn new(event_loop: &EventLoop<RendererMessage>) -> Self {
        Self {
            proxy: Some(event_loop.create_proxy()),
            renderer: None,
            settings: Settings::default(),
            paused: false,
        }
    }

    fn set_paused(&mut self, paused: bool) {
        if self.paused == paused {
            return;
        }
        self.paused = paused;
        if paused {
            // Outstanding submissions drain through their completion
            // callbacks on their own; we only stop feeding the queue.
            log::info!("paused");
        } else {
            log::info!("resumed");
            if let Some(ref renderer) = self.renderer {
                renderer.request_redraw();
            }
        }
    }
}

impl winit::application::ApplicationHandler<RendererMessage> for Application {
    fn resumed(&mut self, event_loop: &winit::event_loop::ActiveEventLoop) {
        if self.renderer.is_some() {
            return;
        }

        match event_loop.create_window(WindowAttributes::default().with_title("particles")) {
            Ok(window) => {
                if let Some(proxy) = self.proxy.take() {
                    let window = Arc::new(window);
                    let settings = self.settings;
                    let renderer_result = pollster::block_on(Renderer::new(window, settings));
                    match renderer_result {
                        Ok(renderer) => {
                            let _ = proxy.send_event(RendererMessage::Initialized(renderer));
                        }
                        Err(e) => {
                            log::error!("Failed to create renderer: {e}");
                            let _ = proxy.send_event(RendererMessage::Error(e.to_string()));
                        }
                    }
                }
            }
            Err(e) => log::error!("failed to create window: {e}"),
        };
    }

    fn window_event(
        &mut self,
        event_loop: &winit::event_loop::ActiveEventLoop,
        _window_id: winit::window::WindowId,
        event: winit::event::WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => {
                // Dropping the renderer drains both gates before teardown.
                self.renderer = None;
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(ref mut renderer) = self.renderer {
                    renderer.resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                if self.paused {
                    // No tick submission while paused; resume requests the
                    // next redraw, so nothing double-submits.
                    return;
                }
                if let Some(ref mut renderer) = self.renderer {
                    match renderer.draw() {
                        Ok(()) => renderer.request_redraw(),
                        Err(wgpu::SurfaceError::Lost) => {
                            // Reconfigure the surface and try again next frame.
                            let viewport = renderer.viewport();
                            renderer.resize(viewport.width, viewport.height);
                            renderer.request_redraw();
                        }
                        Err(wgpu::SurfaceError::OutOfMemory) => {
                            log::error!("Out of memory!");
                            event_loop.exit();
                        }
                        Err(e) => {
                            // Tick skipped, permits already returned.
                            log::warn!("Surface error: {e:?}");
                            renderer.request_redraw();
                        }
                    }
                }
            }
            _ => (),
        };
    }

    fn user_event(
        &mut self,
        event_loop: &winit::event_loop::ActiveEventLoop,
        event: RendererMessage,
    ) {
        match event {
            RendererMessage::Initialized(mut renderer) => {
                log::info!("renderer initialized");
                renderer.set_on_applied(|settings| {
                    log::info!(
                        "settings in effect: {:?}, {} particles",
                        settings.coloring,
                        settings.particle_count
                    );
                });
                // First redraw kicks off the tick loop.
                renderer.request_redraw();
                self.renderer = Some(renderer);
            }
            RendererMessage::Error(e) => {
                // Cannot run without a GPU target.
                log::error!("renderer initialization error: {e}");
                event_loop.exit();
            }
            RendererMessage::ApplySettings(settings) => {
                self.settings = settings;
                if let Some(ref renderer) = self.renderer {
                    renderer.apply_settings(settings);
                }
            }
            RendererMessage::TogglePause => {
                let paused = self.paused;
                self.set_paused(!paused);
            }
            RendererMessage::Pause => self.set_paused(true),
            RendererMessage::Resume => self.set_paused(false),
        }
    }
}

/// Build the event loop and run the renderer until the window closes.
pub fn start() {
    log::info!("starting particle renderer");

    let event_loop = EventLoop::<RendererMessage>::with_user_event()
        .build()
        .expect("Failed to create event loop");

    let mut app = Application::new(&event_loop);
    event_loop.run_app(&mut app).expect("Event loop error");
}
