// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Demo settings: window, swap chain and debug switches. Missing files and
// missing keys fall back to defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::rhi::{RenderDeviceParams, SwapChainParams};

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
            title: "Render RHI".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Swap chain and frame settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub buffer_count: u32,
    /// 0 = present immediately, 1+ = wait for vertical blank
    pub sync_interval: u32,
    pub clear_color: [f32; 4],
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            buffer_count: 2,
            sync_interval: 1,
            clear_color: [0.1, 0.2, 0.8, 1.0],
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Validation layer and live-object reports (debug builds only)
    pub enable_debugging: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
    pub hot_reload_shaders: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enable_debugging: true,
            log_to_file: false,
            log_file: "render_rhi.log".to_string(),
            show_fps: true,
            hot_reload_shaders: true,
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

    /// Device parameters; debugging is never enabled in release builds.
    pub fn device_params(&self) -> RenderDeviceParams {
        RenderDeviceParams {
            enable_debugging: cfg!(debug_assertions) && self.debug.enable_debugging,
        }
    }

    /// Swap chain parameters sized to the configured window
    pub fn swap_chain_params(&self) -> SwapChainParams {
        SwapChainParams {
            output_window: None,
            buffer_count: self.graphics.buffer_count,
            width: self.window.width,
            height: self.window.height,
            is_fullscreen: self.window.fullscreen,
            sync_interval: self.graphics.sync_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.graphics.buffer_count, 2);
        assert_eq!(config.graphics.sync_interval, 1);
        assert!(config.debug.hot_reload_shaders);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [window]
            title = "Triangle"

            [graphics]
            sync_interval = 0
            clear_color = [0.0, 0.0, 0.0, 1.0]
            "#,
        )
        .unwrap();

        assert_eq!(config.window.title, "Triangle");
        assert_eq!(config.window.height, 720);
        assert_eq!(config.graphics.sync_interval, 0);
        assert_eq!(config.graphics.buffer_count, 2);
        assert_eq!(config.graphics.clear_color, [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[graphics]\nbuffer_count = \"two\"").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load_from_path("does/not/exist.toml").unwrap();
        assert_eq!(config.window.title, "Render RHI");
    }

    #[test]
    fn swap_chain_params_follow_config() {
        let config = Config::parse("[graphics]\nbuffer_count = 3\nsync_interval = 0").unwrap();
        let params = config.swap_chain_params();
        assert_eq!(params.buffer_count, 3);
        assert_eq!(params.sync_interval, 0);
        assert_eq!((params.width, params.height), (1280, 720));
        assert!(params.output_window.is_none());
    }

    #[test]
    fn debugging_follows_build_profile() {
        let config = Config::default();
        assert_eq!(
            config.device_params().enable_debugging,
            cfg!(debug_assertions)
        );
    }
}
