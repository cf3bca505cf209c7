// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::texture::FallbackKind;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub controls: ControlsConfig,
    pub textures: TexturesConfig,
    pub scene: SceneConfig,
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
            title: "Scene Viewer".to_string(),
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
    pub max_frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            clear_color: [0.05, 0.05, 0.08, 1.0],
            max_frames_in_flight: 2,
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
            log_file: "vulkan_debug.log".to_string(),
            show_fps: true,
        }
    }
}

/// Control key bindings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub fullscreen_key: String,
    pub quit_key: String,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            fullscreen_key: "F11".to_string(),
            quit_key: "Escape".to_string(),
        }
    }
}

/// Texture loading settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TexturesConfig {
    /// Relative texture paths are resolved against this directory
    pub asset_root: PathBuf,
    pub generate_mipmaps: bool,
    /// Clamped to the device limit; 1.0 disables anisotropic filtering
    pub max_anisotropy: f32,
    /// "checkerboard", "magenta" or "black"
    pub fallback: String,
    pub hot_reload: bool,
}

impl Default for TexturesConfig {
    fn default() -> Self {
        Self {
            asset_root: PathBuf::from("assets"),
            generate_mipmaps: true,
            max_anisotropy: 16.0,
            fallback: "checkerboard".to_string(),
            hot_reload: false,
        }
    }
}

impl TexturesConfig {
    pub fn fallback_kind(&self) -> FallbackKind {
        match self.fallback.to_lowercase().as_str() {
            "checkerboard" => FallbackKind::Checkerboard,
            "magenta" => FallbackKind::Magenta,
            "black" => FallbackKind::Black,
            other => {
                log::warn!("Unknown texture fallback '{}', using checkerboard", other);
                FallbackKind::Checkerboard
            }
        }
    }
}

/// Demo scene contents
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    /// Cubemap faces in +X, -X, +Y, -Y, +Z, -Z order
    pub environment: [PathBuf; 6],
    pub albedo: PathBuf,
    pub reflectivity: f32,
    pub shader_dir: PathBuf,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            environment: [
                PathBuf::from("skybox/px.png"),
                PathBuf::from("skybox/nx.png"),
                PathBuf::from("skybox/py.png"),
                PathBuf::from("skybox/ny.png"),
                PathBuf::from("skybox/pz.png"),
                PathBuf::from("skybox/nz.png"),
            ],
            albedo: PathBuf::from("albedo.png"),
            reflectivity: 0.85,
            shader_dir: PathBuf::from("shaders"),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
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

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::FIFO
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert!(config.textures.generate_mipmaps);
        assert_eq!(config.textures.fallback_kind(), FallbackKind::Checkerboard);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::parse(
            r#"
            [graphics]
            present_mode = "mailbox"

            [textures]
            asset_root = "data/tex"
            fallback = "magenta"
            max_anisotropy = 4.0
            "#,
        )
        .unwrap();

        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.textures.fallback_kind(), FallbackKind::Magenta);
        assert_eq!(config.textures.max_anisotropy, 4.0);
        // Untouched fields keep defaults
        assert!(config.textures.generate_mipmaps);
        assert_eq!(config.window.title, "Scene Viewer");
        assert_eq!(config.textures.asset_root, PathBuf::from("data/tex"));
    }

    #[test]
    fn test_unknown_values_fall_back() {
        let config = Config::parse(
            r#"
            [graphics]
            present_mode = "warp-speed"
            [textures]
            fallback = "plaid"
            "#,
        )
        .unwrap();
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::FIFO);
        assert_eq!(config.textures.fallback_kind(), FallbackKind::Checkerboard);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = Config::load_from_path("definitely/not/here.toml").unwrap();
        assert_eq!(config.scene.reflectivity, 0.85);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[window\nwidth = ").unwrap();
        assert!(Config::load_from_path(&path).is_err());
    }
}
