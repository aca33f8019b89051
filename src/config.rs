// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section falls back to its defaults, so a missing file or a partial
// file still yields a complete configuration.

use anyhow::{Context, Result};
use glam::UVec2;
use serde::Deserialize;
use std::path::Path;

use crate::backend::PresentMode;
use crate::renderer::FrameSettings;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
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
            title: "Frame Pipeline".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    /// Presentation depth, clamped to 2..=3
    pub frames_in_flight: usize,
    pub msaa_samples: u32,
    /// Upload scratch space per frame slot
    pub staging_buffer_mib: u64,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            clear_color: [0.1, 0.1, 0.15, 1.0],
            frames_in_flight: 2,
            msaa_samples: 4,
            staging_buffer_mib: 16,
        }
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
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "frame_pipeline.log".to_string(),
            show_fps: true,
        }
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

    /// Preferred present mode; unknown names fall back to FIFO
    pub fn present_mode(&self) -> PresentMode {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => PresentMode::Immediate,
            "mailbox" => PresentMode::Mailbox,
            "fifo" => PresentMode::Fifo,
            "fifo_relaxed" => PresentMode::FifoRelaxed,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                PresentMode::Fifo
            }
        }
    }

    /// Backend-neutral settings for `Renderer::new`
    pub fn frame_settings(&self) -> FrameSettings {
        FrameSettings {
            presentation_depth: self.graphics.frames_in_flight,
            present_mode: self.present_mode(),
            staging_buffer_size: self.graphics.staging_buffer_mib.max(1) * 1024 * 1024,
            window_extent: UVec2::new(self.window.width, self.window.height),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.graphics.frames_in_flight, 2);
        assert_eq!(config.present_mode(), PresentMode::Fifo);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = Config::parse(
            r#"
            [graphics]
            present_mode = "Mailbox"
            frames_in_flight = 3
            staging_buffer_mib = 4
            "#,
        )
        .unwrap();

        let settings = config.frame_settings();
        assert_eq!(settings.present_mode, PresentMode::Mailbox);
        assert_eq!(settings.presentation_depth, 3);
        assert_eq!(settings.staging_buffer_size, 4 * 1024 * 1024);
        assert_eq!(settings.window_extent, UVec2::new(1280, 720));
        assert_eq!(config.graphics.msaa_samples, 4);
    }

    #[test]
    fn unknown_present_mode_falls_back_to_fifo() {
        let config = Config::parse("[graphics]\npresent_mode = \"vsync-ish\"").unwrap();
        assert_eq!(config.present_mode(), PresentMode::Fifo);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let config = Config::load_from_path("definitely/not/here.toml").unwrap();
        assert_eq!(config.debug.log_file, "frame_pipeline.log");
    }
}
