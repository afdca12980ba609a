// Application - hosts one demo inside a winit event loop
//
// FRAME FLOW:
// 1. Update the demo with the frame delta
// 2. Pick up shader changes and pending resizes (after a queue flush)
// 3. Acquire a swapchain image and let the demo record its commands
// 4. Submit, present and advance the frame ring

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes},
};

use crate::backend::shader::ShaderWatcher;
use crate::config::Config;
use crate::context::RenderContext;
use crate::demos::Demo;

/// Field order matters for Drop: the demo's GPU resources go before the
/// context that owns the device.
pub struct App {
    demo: Box<dyn Demo>,
    context: Option<RenderContext>,
    window: Option<Arc<Window>>,
    watcher: Option<ShaderWatcher>,
    config: Config,

    is_fullscreen: bool,
    is_minimized: bool,
    needs_resize: bool,

    last_frame_time: Instant,
    last_fps_update: Instant,
    frame_count: u32,

    /// First fatal error; stops the event loop and is returned from `run`
    error: Option<anyhow::Error>,
}

impl App {
    pub fn new(config: Config, demo: Box<dyn Demo>) -> Self {
        let now = Instant::now();
        Self {
            demo,
            context: None,
            window: None,
            watcher: None,
            is_fullscreen: config.window.fullscreen,
            is_minimized: false,
            needs_resize: false,
            last_frame_time: now,
            last_fps_update: now,
            frame_count: 0,
            error: None,
            config,
        }
    }

    /// The error that ended the event loop, if any
    pub fn take_error(&mut self) -> Option<anyhow::Error> {
        self.error.take()
    }

    fn base_title(&self) -> String {
        format!("{} - {}", self.config.window.title, self.demo.name())
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let mut window_attributes = WindowAttributes::default()
            .with_title(self.base_title())
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = Arc::new(
            event_loop
                .create_window(window_attributes)
                .context("Failed to create window")?,
        );
        self.window = Some(window.clone());

        if !self.demo.renders() {
            log::info!("{} does not render, idling", self.demo.name());
            event_loop.set_control_flow(ControlFlow::Wait);
            return Ok(());
        }

        let mut context = RenderContext::new(&self.config, &window)?;
        self.demo
            .init(&mut context)
            .with_context(|| format!("Failed to initialise {}", self.demo.name()))?;
        self.context = Some(context);

        if self.config.debug.shader_hot_reload {
            match ShaderWatcher::new(&self.config.demos.shader_dir) {
                Ok(watcher) => self.watcher = Some(watcher),
                Err(e) => log::warn!("Shader hot reload disabled: {:#}", e),
            }
        }

        log::info!("{} initialised", self.demo.name());
        Ok(())
    }

    fn redraw(&mut self) -> Result<()> {
        let now = Instant::now();
        let dt = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;

        self.demo.on_update(dt);

        let Some(context) = self.context.as_mut() else {
            return Ok(());
        };
        if self.is_minimized {
            return Ok(());
        }

        if let Some(watcher) = &self.watcher {
            let changed = watcher.take_changes();
            if !changed.is_empty() {
                log::info!("Shaders changed: {:?}", changed);
                context.frames.wait_for_queue()?;
                // A broken shader keeps the previous pipeline running
                if let Err(e) = self.demo.reload_shaders(context) {
                    log::error!("Shader reload failed: {:#}", e);
                }
            }
        }

        if self.needs_resize {
            let Some(window) = &self.window else {
                return Ok(());
            };
            let size = window.inner_size();
            if size.width == 0 || size.height == 0 {
                return Ok(());
            }
            context.recreate_swapchain(size.width, size.height)?;
            self.demo.on_resize(context)?;
            self.needs_resize = false;
        }

        let Some(target) = context.begin_frame()? else {
            self.needs_resize = true;
            return Ok(());
        };

        self.demo.record(context, &target)?;

        if context.end_frame(target)? {
            self.needs_resize = true;
        }

        self.update_fps();
        Ok(())
    }

    fn wants_redraw(&self) -> bool {
        keeps_redrawing(self.context.is_some(), self.is_minimized)
    }

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

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        self.frame_count += 1;
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();

        // Update title every second
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                let status = self
                    .demo
                    .status()
                    .map(|s| format!(" [{}]", s))
                    .unwrap_or_default();
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]{}",
                    self.base_title(),
                    fps,
                    1000.0 / fps.max(f32::EPSILON),
                    mode,
                    status
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        if self.error.is_none() {
            self.error = Some(error);
        }
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        if let Err(e) = self.init(event_loop) {
            self.fail(event_loop, e);
        }
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

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.redraw() {
                    self.fail(event_loop, e.context("Render error"));
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if !event.state.is_pressed() {
                    return;
                }
                if let PhysicalKey::Code(key) = event.physical_key {
                    match key {
                        KeyCode::Escape => {
                            log::info!("ESC pressed, exiting...");
                            event_loop.exit();
                        }
                        KeyCode::F11 => self.toggle_fullscreen(),
                        other => self.demo.on_key(other),
                    }
                }
            }

            _ => {}
        }
    }

    /// Continuous redraws for demos that render
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if !self.wants_redraw() {
            return;
        }
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        if let Some(context) = self.context.as_mut() {
            log::info!("Cleaning up Vulkan resources...");
            // Nothing may be in flight when the demo's resources are released
            if let Err(e) = context.frames.wait_for_queue() {
                log::error!("Failed to drain GPU before cleanup: {:#}", e);
            }
        }
    }
}

/// Only a live context on a visible window keeps the loop spinning
fn keeps_redrawing(has_context: bool, is_minimized: bool) -> bool {
    has_context && !is_minimized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimised_window_stops_redraw_requests() {
        assert!(keeps_redrawing(true, false));
        assert!(!keeps_redrawing(true, true));
        assert!(!keeps_redrawing(false, false));
    }
}
