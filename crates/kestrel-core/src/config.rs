// SPDX-License-Identifier: CEPL-1.0
use serde::Deserialize;
use std::{fs, io, path::Path};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub window: WindowCfg,
    #[serde(default)]
    pub render: RenderCfg,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WindowCfg {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RenderCfg {
    #[serde(default = "default_clear")]
    pub clear_color: [f32; 4],
    #[serde(default)]
    pub present_mode: PresentPreference,
    /// Capacity of the dynamic per-instance uniform block, per frame slot.
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    #[serde(default)]
    pub validation: ValidationMode,
    /// 0 keeps fence waits unbounded.
    #[serde(default)]
    pub fence_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresentPreference {
    Fifo,
    #[default]
    Mailbox,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    #[default]
    Auto,
    On,
    Off,
}

impl ValidationMode {
    pub fn enabled(self) -> bool {
        match self {
            ValidationMode::Auto => cfg!(debug_assertions),
            ValidationMode::On => true,
            ValidationMode::Off => false,
        }
    }
}

impl Default for WindowCfg {
    fn default() -> Self {
        WindowCfg {
            title: default_title(),
            width: default_width(),
            height: default_height(),
        }
    }
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
            present_mode: PresentPreference::Mailbox,
            max_instances: default_max_instances(),
            validation: ValidationMode::Auto,
            fence_timeout_ms: 0,
        }
    }
}

fn default_title() -> String {
    "kestrel".to_owned()
}
fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
fn default_clear() -> [f32; 4] {
    [0.0, 0.0, 0.0, 1.0]
}
fn default_max_instances() -> u32 {
    125
}

impl EngineConfig {
    pub fn from_toml(src: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(src)?)
    }

    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(s) => Self::from_toml(&s),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("no config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            warn!("{}: {e}; falling back to defaults", path.display());
            Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_all_defaults() {
        let cfg = EngineConfig::from_toml("").unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.render.max_instances, 125);
        assert_eq!(cfg.render.present_mode, PresentPreference::Mailbox);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = EngineConfig::from_toml(
            r#"
            [render]
            present_mode = "fifo"
            fence_timeout_ms = 2000

            [window]
            width = 256
            "#,
        )
        .unwrap();
        assert_eq!(cfg.render.present_mode, PresentPreference::Fifo);
        assert_eq!(cfg.render.fence_timeout_ms, 2000);
        assert_eq!(cfg.render.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(cfg.window.width, 256);
        assert_eq!(cfg.window.height, 720);
        assert_eq!(cfg.window.title, "kestrel");
    }

    #[test]
    fn unknown_enum_value_is_a_parse_error() {
        let err = EngineConfig::from_toml("[render]\npresent_mode = \"immediate\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let cfg = EngineConfig::load(Path::new("definitely/not/here/kestrel.toml")).unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn explicit_validation_modes() {
        assert!(ValidationMode::On.enabled());
        assert!(!ValidationMode::Off.enabled());
        assert_eq!(ValidationMode::Auto.enabled(), cfg!(debug_assertions));
    }
}
