//! Error types for the live session engine

use thiserror::Error;

/// Result type alias for live session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the live session engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone could not be acquired (denied or unavailable)
    #[error("microphone unavailable: {0}")]
    Permission(String),

    /// Capture processing module failed to load
    #[error("audio processing module failed to load: {0}")]
    ProcessingModule(String),

    /// Capture restarted before the rate guard window elapsed
    #[error("start rejected: {0}")]
    RateLimited(String),

    /// Credential endpoint failure
    #[error("credential error: {0}")]
    Credential(String),

    /// Live transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation requires an open session
    #[error("no active session")]
    NotConnected,

    /// The session engine task has exited
    #[error("session engine stopped")]
    EngineStopped,

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Inbound audio could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WAV recording error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}

impl Error {
    /// Whether this error aborts a start attempt outright
    ///
    /// These are never retried automatically; the session is torn down and
    /// left disconnected.
    #[must_use]
    pub const fn is_fatal_to_attempt(&self) -> bool {
        matches!(
            self,
            Self::Permission(_)
                | Self::ProcessingModule(_)
                | Self::Credential(_)
                | Self::RateLimited(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(Error::Permission("denied".into()).is_fatal_to_attempt());
        assert!(Error::RateLimited("too soon".into()).is_fatal_to_attempt());
        assert!(Error::Credential("500".into()).is_fatal_to_attempt());
        assert!(!Error::Transport("reset".into()).is_fatal_to_attempt());
        assert!(!Error::NotConnected.is_fatal_to_attempt());
    }
}
