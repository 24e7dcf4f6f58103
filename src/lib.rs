//! Live Session - real-time voice conversations with a live AI endpoint
//!
//! This library streams microphone audio to a bidirectional live endpoint
//! and plays the assistant's audio replies back without gaps:
//! - Microphone capture, resampling and PCM16 framing
//! - Connection lifecycle with short-lived credentials and session resumption
//! - Inbound routing of audio, interruptions and tool calls
//! - Gapless playback with a debounced speaking signal
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              LiveSession (handle)                    │
//! │   start │ stop │ send_text │ listeners │ state      │
//! └────────────────────┬────────────────────────────────┘
//!                      │ commands
//! ┌────────────────────▼────────────────────────────────┐
//! │              Session engine (local task)             │
//! │  Capture │ Connection │ Inbound │ Playback │ Tools  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │            Live endpoint (WebSocket)                 │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod live;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result};
pub use live::{ConnectionStatus, LiveSession, LiveSessionBuilder, SessionSnapshot, Viewport};
pub use voice::AnalysisNode;
