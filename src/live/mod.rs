//! Live session with a remote conversational endpoint
//!
//! [`LiveSession`] is the entry point; the remaining modules are the pieces
//! its engine is built from.

pub mod connection;
pub mod credentials;
pub mod inbound;
pub mod protocol;
mod session;
pub mod tools;
pub mod transport;

pub use connection::{
    CloseOutcome, ConnectionManager, ConnectionStatus, ReconnectPolicy, SETUP_TIMEOUT, SessionState,
};
pub use credentials::{Credential, CredentialKind, CredentialProvider};
pub use inbound::{Effect, FLUSH_THRESHOLD, InboundProcessor};
pub use protocol::{InboundMessage, ToolCallRecord};
pub use session::{
    DecodedAudioListener, LiveSession, LiveSessionBuilder, RawMicFrameListener, SessionSnapshot,
    TranscriptListener, Viewport,
};
pub use tools::{ToolCallDispatcher, ToolCallListener};
pub use transport::{ConnectRequest, EventSender, Transport, TransportEvent, TransportSink, WebSocketTransport};
