//! TOML configuration file loading
//!
//! Supports `~/.config/live-session/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct LiveConfigFile {
    /// Remote endpoint and credentials
    #[serde(default)]
    pub endpoint: EndpointFileConfig,

    /// Model/session setup
    #[serde(default)]
    pub model: ModelFileConfig,

    /// Microphone capture
    #[serde(default)]
    pub capture: CaptureFileConfig,

    /// Session resumption
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,

    /// Function declarations advertised to the model
    #[serde(default)]
    pub tools: Vec<ToolFileConfig>,
}

/// Endpoint configuration
#[derive(Debug, Default, Deserialize)]
pub struct EndpointFileConfig {
    /// Live WebSocket endpoint base URL
    pub url: Option<String>,

    /// Short-lived credential issuance endpoint
    pub credential_url: Option<String>,

    /// Long-lived API key (used when no credential endpoint is set)
    pub api_key: Option<String>,
}

/// Model and session setup configuration
#[derive(Debug, Default, Deserialize)]
pub struct ModelFileConfig {
    /// Model identifier (e.g. "models/gemini-2.5-flash-preview-native-audio-dialog")
    pub name: Option<String>,

    /// Prebuilt voice name (e.g. "Zephyr")
    pub voice: Option<String>,

    /// System instruction sent with session setup
    pub system_instruction: Option<String>,

    /// Enable sliding-window context compression
    pub context_compression: Option<bool>,
}

/// Capture configuration
#[derive(Debug, Default, Deserialize)]
pub struct CaptureFileConfig {
    /// Samples per outbound frame at the input rate
    pub frame_samples: Option<usize>,

    /// Request echo cancellation from the device
    pub echo_cancellation: Option<bool>,

    /// Suppress background noise before frames are sent
    pub noise_suppression: Option<bool>,

    /// Normalize microphone level
    pub auto_gain_control: Option<bool>,
}

/// Reconnect configuration
#[derive(Debug, Default, Deserialize)]
pub struct ReconnectFileConfig {
    /// Delay before a resumption attempt, in milliseconds
    pub delay_ms: Option<u64>,

    /// Maximum resumptions per session (unset = unbounded)
    pub max_attempts: Option<u32>,
}

/// A function declaration
#[derive(Debug, Deserialize)]
pub struct ToolFileConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

/// Load the TOML config file from the standard path
///
/// Returns `LiveConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> LiveConfigFile {
    let Some(path) = config_file_path() else {
        return LiveConfigFile::default();
    };

    if !path.exists() {
        return LiveConfigFile::default();
    }

    load_config_file_from(&path)
}

/// Load a TOML config file from an explicit path
///
/// Read or parse failures are logged and fall back to defaults.
pub fn load_config_file_from(path: &Path) -> LiveConfigFile {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                LiveConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            LiveConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/live-session/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("live-session").join("config.toml"))
}
