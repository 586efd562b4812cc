// =============================================================================
// ENTRY POINT
// =============================================================================
//
// Loads config.toml, sets up logging and runs the winit event loop until the
// window closes. Exits with status 1 after a fatal error.

use anyhow::{Context, Result};
use std::fs::File;
use std::process::ExitCode;
use vk_frame_renderer::app::App;
use vk_frame_renderer::Config;
use winit::event_loop::EventLoop;

fn main() -> Result<ExitCode> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config)?;
    log::info!("Starting {} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    log::info!(
        "Window: {}x{} ({}, vsync {})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" },
        if config.window.vsync { "on" } else { "off" }
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    let code = app.exit_code();
    drop(app);
    log::logger().flush();

    Ok(ExitCode::from(code))
}

/// Initialize logging at the configured level; RUST_LOG still overrides.
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};

    let mut builder = Builder::new();
    builder.filter_level(config.debug.level_filter());
    builder.parse_default_env();

    if let Some(path) = &config.debug.log_file {
        let file = File::create(path)
            .with_context(|| format!("Failed to create log file {:?}", path))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}
