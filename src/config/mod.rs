//! Configuration management for the live session engine
//!
//! Values resolve in order: environment variable, config file, default.

pub mod file;

use std::time::Duration;

use crate::live::connection::ReconnectPolicy;
use crate::live::protocol::FunctionDeclaration;
use crate::voice::{CaptureConstraints, DEFAULT_FRAME_SAMPLES};
use crate::{Error, Result};

use file::LiveConfigFile;

/// Default live endpoint (Gemini Live API, v1alpha)
pub const DEFAULT_ENDPOINT_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService";

/// Default native-audio model
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-preview-native-audio-dialog";

/// Default prebuilt voice
pub const DEFAULT_VOICE: &str = "Zephyr";

/// Live session configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Live WebSocket endpoint base URL
    pub endpoint_url: String,

    /// Where connect credentials come from
    pub credentials: CredentialSource,

    /// Model identifier sent in session setup
    pub model: String,

    /// Prebuilt voice name
    pub voice_name: String,

    /// Optional system instruction
    pub system_instruction: Option<String>,

    /// Enable sliding-window context compression
    pub context_compression: bool,

    /// Capture configuration
    pub capture: CaptureConfig,

    /// Resumption policy
    pub reconnect: ReconnectPolicy,

    /// Function declarations advertised to the model
    pub tools: Vec<FunctionDeclaration>,
}

/// Source of connect credentials
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Short-lived token from an issuance endpoint (`LIVE_CREDENTIAL_URL`)
    Endpoint(String),
    /// Long-lived API key (`GEMINI_API_KEY`)
    ApiKey(String),
    /// Nothing configured
    Missing,
}

impl std::fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Endpoint(url) => f.debug_tuple("Endpoint").field(url).finish(),
            Self::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Self::Missing => f.write_str("Missing"),
        }
    }
}

/// Microphone capture configuration
#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    /// Samples per outbound frame at the input rate
    pub frame_samples: usize,
    /// Microphone processing requested on every start
    pub processing: CaptureConstraints,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_samples: DEFAULT_FRAME_SAMPLES,
            processing: CaptureConstraints::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint_url: DEFAULT_ENDPOINT_URL.to_string(),
            credentials: CredentialSource::Missing,
            model: DEFAULT_MODEL.to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            system_instruction: None,
            context_compression: true,
            capture: CaptureConfig::default(),
            reconnect: ReconnectPolicy::default(),
            tools: vec![default_tool()],
        }
    }
}

impl Config {
    /// Load configuration from environment and the standard config file
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn load() -> Result<Self> {
        Self::load_with(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn load_with(fc: LiveConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let endpoint_url = env("LIVE_ENDPOINT_URL")
            .or(fc.endpoint.url)
            .unwrap_or(defaults.endpoint_url);

        let credential_url = env("LIVE_CREDENTIAL_URL").or(fc.endpoint.credential_url);
        let api_key = env("GEMINI_API_KEY").or(fc.endpoint.api_key);
        let credentials = match (credential_url, api_key) {
            (Some(url), _) => CredentialSource::Endpoint(url),
            (None, Some(key)) => CredentialSource::ApiKey(key),
            (None, None) => CredentialSource::Missing,
        };

        let model = env("LIVE_MODEL")
            .or(fc.model.name)
            .unwrap_or(defaults.model);
        let voice_name = env("LIVE_VOICE")
            .or(fc.model.voice)
            .unwrap_or(defaults.voice_name);
        let system_instruction = env("LIVE_SYSTEM_INSTRUCTION").or(fc.model.system_instruction);
        let context_compression = fc
            .model
            .context_compression
            .unwrap_or(defaults.context_compression);

        let frame_samples = match env("LIVE_FRAME_SAMPLES") {
            Some(v) => v
                .parse::<usize>()
                .map_err(|e| Error::Config(format!("LIVE_FRAME_SAMPLES: {e}")))?,
            None => fc
                .capture
                .frame_samples
                .unwrap_or(defaults.capture.frame_samples),
        };
        if frame_samples == 0 {
            return Err(Error::Config("capture frame size must be non-zero".to_string()));
        }

        let requested = defaults.capture.processing;
        let processing = CaptureConstraints {
            echo_cancellation: fc
                .capture
                .echo_cancellation
                .unwrap_or(requested.echo_cancellation),
            noise_suppression: fc
                .capture
                .noise_suppression
                .unwrap_or(requested.noise_suppression),
            auto_gain_control: fc
                .capture
                .auto_gain_control
                .unwrap_or(requested.auto_gain_control),
        };

        let delay_ms = match env("LIVE_RECONNECT_DELAY_MS") {
            Some(v) => Some(
                v.parse::<u64>()
                    .map_err(|e| Error::Config(format!("LIVE_RECONNECT_DELAY_MS: {e}")))?,
            ),
            None => fc.reconnect.delay_ms,
        };
        let reconnect = ReconnectPolicy {
            delay: delay_ms.map_or(defaults.reconnect.delay, Duration::from_millis),
            max_attempts: fc.reconnect.max_attempts,
        };

        let tools = if fc.tools.is_empty() {
            defaults.tools
        } else {
            fc.tools
                .into_iter()
                .map(|t| FunctionDeclaration {
                    name: t.name,
                    description: t.description,
                    parameters: t.parameters,
                    behavior: Some("NON_BLOCKING".to_string()),
                })
                .collect()
        };

        Ok(Self {
            endpoint_url,
            credentials,
            model,
            voice_name,
            system_instruction,
            context_compression,
            capture: CaptureConfig {
                frame_samples,
                processing,
            },
            reconnect,
            tools,
        })
    }
}

/// The visual-explanation tool advertised when none are configured
fn default_tool() -> FunctionDeclaration {
    FunctionDeclaration {
        name: "generate_visual_explanation".to_string(),
        description: "Creates an educational explanation and a runnable code snippet \
                      (React, p5.js, or Three.js) that visually illustrates the given concept."
            .to_string(),
        parameters: Some(serde_json::json!({
            "type": "OBJECT",
            "properties": {
                "question": {
                    "type": "STRING",
                    "description": "The student's question or concept to illustrate."
                }
            },
            "required": ["question"]
        })),
        behavior: Some("NON_BLOCKING".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::file::{
        CaptureFileConfig, EndpointFileConfig, ModelFileConfig, ReconnectFileConfig,
    };

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_sources() {
        let config = Config::load_with(LiveConfigFile::default(), env_from(&[])).unwrap();
        assert_eq!(config.endpoint_url, DEFAULT_ENDPOINT_URL);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.voice_name, DEFAULT_VOICE);
        assert_eq!(config.credentials, CredentialSource::Missing);
        assert_eq!(config.reconnect.delay, Duration::from_secs(1));
        assert_eq!(config.reconnect.max_attempts, None);
        assert_eq!(config.tools.len(), 1);
        assert_eq!(config.tools[0].name, "generate_visual_explanation");
    }

    #[test]
    fn env_overrides_file() {
        let fc = LiveConfigFile {
            model: ModelFileConfig {
                voice: Some("Puck".into()),
                name: Some("models/file".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let config = Config::load_with(fc, env_from(&[("LIVE_MODEL", "models/env")])).unwrap();
        assert_eq!(config.model, "models/env");
        assert_eq!(config.voice_name, "Puck");
    }

    #[test]
    fn credential_endpoint_wins_over_api_key() {
        let fc = LiveConfigFile {
            endpoint: EndpointFileConfig {
                api_key: Some("file-key".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let config = Config::load_with(
            fc,
            env_from(&[("LIVE_CREDENTIAL_URL", "http://localhost:3000/api/genai/ephemeral")]),
        )
        .unwrap();
        assert_eq!(
            config.credentials,
            CredentialSource::Endpoint("http://localhost:3000/api/genai/ephemeral".into())
        );
    }

    #[test]
    fn api_key_is_redacted_in_debug() {
        let source = CredentialSource::ApiKey("secret".into());
        assert!(!format!("{source:?}").contains("secret"));
    }

    #[test]
    fn reconnect_policy_from_file_and_env() {
        let fc = LiveConfigFile {
            reconnect: ReconnectFileConfig {
                delay_ms: Some(250),
                max_attempts: Some(3),
            },
            ..Default::default()
        };
        let config = Config::load_with(fc, env_from(&[("LIVE_RECONNECT_DELAY_MS", "2000")])).unwrap();
        assert_eq!(config.reconnect.delay, Duration::from_secs(2));
        assert_eq!(config.reconnect.max_attempts, Some(3));
    }

    #[test]
    fn capture_processing_defaults_on_and_file_can_disable() {
        let config = Config::load_with(LiveConfigFile::default(), env_from(&[])).unwrap();
        assert_eq!(config.capture.processing, CaptureConstraints::default());
        assert!(config.capture.processing.noise_suppression);

        let fc = LiveConfigFile {
            capture: CaptureFileConfig {
                noise_suppression: Some(false),
                ..Default::default()
            },
            ..Default::default()
        };
        let config = Config::load_with(fc, env_from(&[])).unwrap();
        assert!(!config.capture.processing.noise_suppression);
        assert!(config.capture.processing.echo_cancellation);
        assert!(config.capture.processing.auto_gain_control);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(Config::load_with(LiveConfigFile::default(), env_from(&[("LIVE_FRAME_SAMPLES", "abc")])).is_err());
        assert!(Config::load_with(LiveConfigFile::default(), env_from(&[("LIVE_FRAME_SAMPLES", "0")])).is_err());
    }
}
