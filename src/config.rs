// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section falls back to defaults, so a missing or partial file still
// produces a usable configuration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
    pub resizable: bool,
    pub vsync: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Vulkan Frame Renderer".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
            resizable: true,
            vsync: true,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Index into the enumerated device list; wins over the memory heuristic.
    pub gpu_override: Option<usize>,
    pub gradient_shader: PathBuf,
    pub clear_color: [f32; 4],
    pub gradient_top: [f32; 4],
    pub gradient_bottom: [f32; 4],
    pub frame_timeout_ms: u64,
    pub immediate_timeout_ms: u64,
    pub status_overlay: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            gpu_override: None,
            gradient_shader: PathBuf::from("shaders/gradient.comp.spv"),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            gradient_top: [1.0, 0.0, 0.0, 1.0],
            gradient_bottom: [0.0, 0.0, 1.0, 1.0],
            frame_timeout_ms: 1_000,
            immediate_timeout_ms: 10_000,
            status_overlay: true,
        }
    }
}

impl GraphicsConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn immediate_timeout(&self) -> Duration {
        Duration::from_millis(self.immediate_timeout_ms)
    }
}

/// Debug settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    /// Abort on error-severity validation messages (debug builds only).
    pub fatal_validation_errors: bool,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            fatal_validation_errors: false,
            log_level: "info".to_string(),
            log_file: None,
            show_fps: true,
        }
    }
}

impl DebugConfig {
    pub fn level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or_else(|_| {
            log::warn!("Unknown log level '{}', defaulting to info", self.log_level);
            log::LevelFilter::Info
        })
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.height, 720);
        assert!(config.window.vsync);
        assert_eq!(config.graphics.gpu_override, None);
        assert_eq!(config.graphics.frame_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = Config::parse(
            r#"
            [window]
            width = 640
            vsync = false

            [graphics]
            gpu_override = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 640);
        assert_eq!(config.window.height, 720);
        assert!(!config.window.vsync);
        assert_eq!(config.graphics.gpu_override, Some(1));
        assert_eq!(
            config.graphics.gradient_shader,
            PathBuf::from("shaders/gradient.comp.spv")
        );
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[window\nwidth = ").is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load_from_path("definitely/not/here.toml").unwrap();
        assert_eq!(config.debug.log_level, "info");
    }

    #[test]
    fn log_level_parses_known_names() {
        let debug = DebugConfig {
            log_level: "trace".to_string(),
            ..Default::default()
        };
        assert_eq!(debug.level_filter(), log::LevelFilter::Trace);

        let bogus = DebugConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert_eq!(bogus.level_filter(), log::LevelFilter::Info);
    }
}
