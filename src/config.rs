// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section falls back to defaults, so a missing or partial config.toml
// still runs every demo.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub demos: DemosConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "LearningVulkan".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Which physical device to run on
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AdapterPreference {
    /// Discrete GPU first, then integrated
    Hardware,
    /// CPU implementation (lavapipe / SwiftShader)
    Software,
    Any,
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub vsync: bool,
    pub clear_color: [f32; 4],
    pub frames_in_flight: usize,
    pub adapter: AdapterPreference,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            vsync: false,
            clear_color: [0.0, 0.05, 0.05, 1.0],
            frames_in_flight: 2,
            adapter: AdapterPreference::Hardware,
        }
    }
}

impl GraphicsConfig {
    pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

    /// Length of the frame ring, clamped to what the sync code supports
    pub fn frame_queue_length(&self) -> usize {
        self.frames_in_flight.clamp(1, Self::MAX_FRAMES_IN_FLIGHT)
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
    pub shader_hot_reload: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "raster_demos.log".to_string(),
            show_fps: true,
            shader_hot_reload: false,
        }
    }
}

/// Render path used by the compute rasterizer demo
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RasterPath {
    /// Fixed-function graphics pipeline
    Hardware,
    /// Two compute dispatches into a storage image
    Compute,
    /// Same stages on the CPU, copied into the swapchain image
    Cpu,
}

impl RasterPath {
    pub fn next(self) -> Self {
        match self {
            RasterPath::Hardware => RasterPath::Compute,
            RasterPath::Compute => RasterPath::Cpu,
            RasterPath::Cpu => RasterPath::Hardware,
        }
    }
}

/// Per-demo settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DemosConfig {
    pub shader_dir: PathBuf,
    pub texture_path: PathBuf,
    pub raster_path: RasterPath,
}

impl Default for DemosConfig {
    fn default() -> Self {
        Self {
            shader_dir: PathBuf::from("shaders"),
            texture_path: PathBuf::from("assets/checker.png"),
            raster_path: RasterPath::Compute,
        }
    }
}

impl DemosConfig {
    /// Path of a compiled shader inside the shader directory
    pub fn shader_path(&self, name: &str) -> PathBuf {
        self.shader_dir.join(format!("{}.spv", name))
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults on any error.
    ///
    /// Runs before the logger exists, so the error is handed back for the
    /// caller to report once logging is up.
    pub fn load<P: AsRef<Path>>(path: P) -> (Self, Option<anyhow::Error>) {
        match Self::load_from_path(path) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        }
    }

    /// Load configuration from a specific path; a missing file gives defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_toml(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.graphics.frames_in_flight, 2);
        assert_eq!(config.graphics.clear_color, [0.0, 0.05, 0.05, 1.0]);
        assert_eq!(config.graphics.adapter, AdapterPreference::Hardware);
        assert_eq!(config.demos.raster_path, RasterPath::Compute);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [window]
            width = 640

            [graphics]
            adapter = "software"

            [demos]
            raster_path = "cpu"
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 640);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.graphics.adapter, AdapterPreference::Software);
        assert!(!config.graphics.vsync);
        assert_eq!(config.demos.raster_path, RasterPath::Cpu);
        assert_eq!(config.demos.shader_dir, PathBuf::from("shaders"));
    }

    #[test]
    fn malformed_file_gives_defaults_and_the_error() {
        let path = std::env::temp_dir().join(format!("raster-demos-bad-{}.toml", std::process::id()));
        std::fs::write(&path, "[window\nwidth = ").unwrap();

        let (config, error) = Config::load(&path);
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.window.width, 1280);
        let error = error.expect("parse error is reported");
        assert!(format!("{:#}", error).contains("Failed to parse config file"));
    }

    #[test]
    fn missing_file_gives_defaults_without_error() {
        let (config, error) = Config::load("does/not/exist/config.toml");
        assert!(error.is_none());
        assert_eq!(config.graphics.frames_in_flight, 2);
    }

    #[test]
    fn unknown_enum_value_is_rejected() {
        assert!(Config::from_toml("[graphics]\nadapter = \"warp\"").is_err());
    }

    #[test]
    fn frame_queue_length_is_clamped() {
        let mut graphics = GraphicsConfig::default();
        graphics.frames_in_flight = 0;
        assert_eq!(graphics.frame_queue_length(), 1);
        graphics.frames_in_flight = 16;
        assert_eq!(graphics.frame_queue_length(), GraphicsConfig::MAX_FRAMES_IN_FLIGHT);
    }

    #[test]
    fn raster_path_cycles_through_all_paths() {
        let start = RasterPath::Hardware;
        assert_eq!(start.next(), RasterPath::Compute);
        assert_eq!(start.next().next(), RasterPath::Cpu);
        assert_eq!(start.next().next().next(), start);
    }

    #[test]
    fn shader_path_appends_spv() {
        let demos = DemosConfig::default();
        assert_eq!(demos.shader_path("mesh.vert"), PathBuf::from("shaders/mesh.vert.spv"));
    }
}
