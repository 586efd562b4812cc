// =============================================================================
// APPLICATION - winit window + input glue around the Renderer
// =============================================================================
//
// Window events are forwarded through typed event sources so extra behavior
// can be layered on (or vetoed) without touching the event loop:
//   Resized        -> notify renderer (swapchain goes dirty)
//   CloseRequested -> exit unless a subscriber returns Flow::Stop
//   Key pressed    -> Escape quits, F11 toggles fullscreen, V toggles vsync

use ash::vk;
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::ActiveEventLoop,
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes, WindowId},
};

use crate::config::Config;
use crate::events::{EventSource, Flow};
use crate::renderer::{OverlayPass, OverlayTarget, Renderer};

/// Log a fatal error so it is the last thing in the log, and flush.
pub fn report_fatal(title: &str, message: &str) {
    log::error!("{}: {}", title, message);
    log::logger().flush();
}

// =============================================================================
// SESSION
// =============================================================================

/// Everything that exists while the window is open.
///
/// Field order matters for Drop: the renderer goes before the window it
/// presents to.
pub struct Session {
    pub renderer: Renderer,
    pub window: Arc<Window>,
    pub fullscreen: bool,
    /// Read by the status overlay each frame
    pub vsync_indicator: Rc<Cell<bool>>,
    pub exit_requested: bool,
}

impl Session {
    pub fn toggle_fullscreen(&mut self) {
        self.fullscreen = !self.fullscreen;
        if self.fullscreen {
            self.window.set_fullscreen(Some(Fullscreen::Borderless(None)));
            log::info!("Entered fullscreen mode");
        } else {
            self.window.set_fullscreen(None);
            log::info!("Exited fullscreen mode");
        }
        // The Resized event that follows marks the swapchain dirty
    }

    pub fn toggle_vsync(&mut self) {
        let vsync = !self.renderer.vsync();
        self.renderer.set_vsync(vsync);
        self.vsync_indicator.set(vsync);
        log::info!("VSync {}", if vsync { "on" } else { "off" });
    }
}

// =============================================================================
// STATUS OVERLAY
// =============================================================================

const MARKER_SIZE: u32 = 16;
const MARKER_MARGIN: u32 = 8;

/// Top-left marker square clipped to the target; `None` when it doesn't fit.
pub fn marker_rect(extent: vk::Extent2D) -> Option<vk::Rect2D> {
    if extent.width <= MARKER_MARGIN || extent.height <= MARKER_MARGIN {
        return None;
    }
    Some(vk::Rect2D {
        offset: vk::Offset2D {
            x: MARKER_MARGIN as i32,
            y: MARKER_MARGIN as i32,
        },
        extent: vk::Extent2D {
            width: MARKER_SIZE.min(extent.width - MARKER_MARGIN),
            height: MARKER_SIZE.min(extent.height - MARKER_MARGIN),
        },
    })
}

/// Small colored square in the corner: green with vsync, amber without.
pub struct StatusOverlay {
    vsync: Rc<Cell<bool>>,
}

impl StatusOverlay {
    pub fn new(vsync: Rc<Cell<bool>>) -> Self {
        Self { vsync }
    }

    fn color(&self) -> [f32; 4] {
        if self.vsync.get() {
            [0.1, 0.8, 0.2, 1.0]
        } else {
            [1.0, 0.6, 0.0, 1.0]
        }
    }
}

impl OverlayPass for StatusOverlay {
    fn record(&mut self, device: &ash::Device, cmd: vk::CommandBuffer, target: &OverlayTarget) {
        let Some(rect) = marker_rect(target.extent) else {
            return;
        };

        let attachments = [vk::RenderingAttachmentInfo::default()
            .image_view(target.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE)];
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: target.extent,
            })
            .layer_count(1)
            .color_attachments(&attachments);

        let clear = vk::ClearAttachment {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            color_attachment: 0,
            clear_value: vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.color(),
                },
            },
        };
        let clear_rect = vk::ClearRect {
            rect,
            base_array_layer: 0,
            layer_count: 1,
        };

        unsafe {
            device.cmd_begin_rendering(cmd, &rendering_info);
            device.cmd_clear_attachments(cmd, &[clear], &[clear_rect]);
            device.cmd_end_rendering(cmd);
        }
    }
}

// =============================================================================
// FPS TRACKING
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpsSample {
    pub fps: f32,
    pub frame_ms: f32,
}

pub struct FpsCounter {
    frame_count: u32,
    last_update: Instant,
    last_frame: Instant,
}

impl FpsCounter {
    const INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(now: Instant) -> Self {
        Self {
            frame_count: 0,
            last_update: now,
            last_frame: now,
        }
    }

    /// Count a presented frame. Yields a sample once per second.
    pub fn tick(&mut self, now: Instant) -> Option<FpsSample> {
        let frame_time = now.duration_since(self.last_frame);
        self.last_frame = now;
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_update);
        if elapsed < Self::INTERVAL {
            return None;
        }

        let sample = FpsSample {
            fps: self.frame_count as f32 / elapsed.as_secs_f32(),
            frame_ms: frame_time.as_secs_f32() * 1000.0,
        };
        self.frame_count = 0;
        self.last_update = now;
        Some(sample)
    }
}

// =============================================================================
// APPLICATION
// =============================================================================

pub struct App {
    config: Config,
    session: Option<Session>,

    pub resized: EventSource<Session, PhysicalSize<u32>>,
    pub close_requested: EventSource<Session, ()>,
    pub key_pressed: EventSource<Session, KeyCode>,

    fps: FpsCounter,
    exit_code: u8,
}

impl App {
    pub fn new(config: Config) -> Self {
        let mut app = Self {
            config,
            session: None,
            resized: EventSource::new(),
            close_requested: EventSource::new(),
            key_pressed: EventSource::new(),
            fps: FpsCounter::new(Instant::now()),
            exit_code: 0,
        };
        app.install_default_handlers();
        app
    }

    fn install_default_handlers(&mut self) {
        self.resized.subscribe(|session, size| {
            log::debug!("Window resized to {}x{}", size.width, size.height);
            session.renderer.notify_resize(size.width, size.height);
            Flow::Continue
        });

        self.close_requested.subscribe(|_, _| {
            log::info!("Close requested, shutting down...");
            Flow::Continue
        });

        self.key_pressed.subscribe(|session, key| {
            match key {
                KeyCode::Escape => {
                    log::info!("ESC pressed, exiting...");
                    session.exit_requested = true;
                }
                KeyCode::F11 => session.toggle_fullscreen(),
                KeyCode::KeyV => session.toggle_vsync(),
                _ => return Flow::Continue,
            }
            Flow::Stop
        });
    }

    /// Process exit status: non-zero after a fatal error.
    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, title: &str, error: &anyhow::Error) {
        report_fatal(title, &format!("{:#}", error));
        self.end_session();
        self.exit_code = 1;
        event_loop.exit();
    }

    /// Drop the session, which waits for the GPU and flushes every deletion
    /// queue before the window goes away.
    fn end_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        log::info!(
            "Rendered {} frames, {} validation errors",
            session.renderer.frame_number(),
            session.renderer.validation_error_count()
        );
    }

    fn start(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<Session> {
        let window_config = &self.config.window;
        let mut attributes = WindowAttributes::default()
            .with_title(&window_config.title)
            .with_resizable(window_config.resizable)
            .with_inner_size(PhysicalSize::new(window_config.width, window_config.height));
        if window_config.fullscreen {
            attributes = attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = Arc::new(event_loop.create_window(attributes)?);
        let size = window.inner_size();

        let mut renderer = Renderer::new(&*window, size.width, size.height, &self.config)?;

        let names = renderer.device_names();
        if let Some(name) = renderer.selected_device_index().and_then(|i| names.get(i)) {
            log::info!("Rendering on {} ({} GPUs available)", name, names.len());
        }

        let vsync_indicator = Rc::new(Cell::new(renderer.vsync()));
        if self.config.graphics.status_overlay {
            renderer.set_overlay(Box::new(StatusOverlay::new(Rc::clone(&vsync_indicator))));
        }

        Ok(Session {
            renderer,
            window,
            fullscreen: window_config.fullscreen,
            vsync_indicator,
            exit_requested: false,
        })
    }

    fn update_title(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let Some(sample) = self.fps.tick(Instant::now()) else {
            return;
        };
        if !self.config.debug.show_fps {
            return;
        }

        let mode = if session.fullscreen { "fullscreen" } else { "windowed" };
        let vsync = if session.renderer.vsync() { "vsync" } else { "no vsync" };
        session.window.set_title(&format!(
            "{} - {:.0} FPS ({:.2}ms) [{}, {}]",
            self.config.window.title, sample.fps, sample.frame_ms, mode, vsync
        ));
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.session.is_some() {
            return;
        }

        match self.start(event_loop) {
            Ok(session) => self.session = Some(session),
            Err(e) => self.fail(event_loop, "Failed to initialize renderer", &e),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match event {
            WindowEvent::CloseRequested => {
                if self.close_requested.emit(session, &()) == Flow::Continue {
                    session.exit_requested = true;
                }
            }

            WindowEvent::Resized(size) => {
                self.resized.emit(session, &size);
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed() && !event.repeat {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        self.key_pressed.emit(session, &key);
                    }
                }
            }

            WindowEvent::RedrawRequested => match session.renderer.render() {
                Ok(true) => self.update_title(),
                Ok(false) => {}
                Err(e) => {
                    self.fail(event_loop, "Render error", &e);
                    return;
                }
            },

            _ => {}
        }

        if self.session.as_ref().is_some_and(|s| s.exit_requested) {
            self.end_session();
            event_loop.exit();
        }
    }

    /// Continuous redraws for maximum FPS.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(session) = self.session.as_ref() {
            session.window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // Renderer::drop performs the shutdown sequence
        self.end_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_sample_once_per_second() {
        let start = Instant::now();
        let mut fps = FpsCounter::new(start);

        for i in 1..60 {
            assert!(fps.tick(start + Duration::from_millis(i * 16)).is_none());
        }
        let sample = fps.tick(start + Duration::from_millis(1000)).unwrap();
        assert!((sample.fps - 60.0).abs() < 0.01, "{sample:?}");
        assert!((sample.frame_ms - 56.0).abs() < 0.01, "{sample:?}");

        // Counter restarts after reporting
        assert!(fps.tick(start + Duration::from_millis(1016)).is_none());
    }

    #[test]
    fn marker_fits_in_large_targets() {
        let rect = marker_rect(vk::Extent2D { width: 1280, height: 720 }).unwrap();
        assert_eq!((rect.offset.x, rect.offset.y), (8, 8));
        assert_eq!((rect.extent.width, rect.extent.height), (16, 16));
    }

    #[test]
    fn marker_is_clipped_or_skipped_in_tiny_targets() {
        let rect = marker_rect(vk::Extent2D { width: 12, height: 100 }).unwrap();
        assert_eq!(rect.extent.width, 4);

        assert!(marker_rect(vk::Extent2D { width: 8, height: 100 }).is_none());
    }

    #[test]
    fn overlay_color_follows_vsync_state() {
        let vsync = Rc::new(Cell::new(true));
        let overlay = StatusOverlay::new(Rc::clone(&vsync));
        let on = overlay.color();
        vsync.set(false);
        assert_ne!(on, overlay.color());
    }
}
