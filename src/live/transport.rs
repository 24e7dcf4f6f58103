//! WebSocket transport to the live endpoint
//!
//! A transport session writes the setup message first, then pumps outbound
//! frames from an unbounded queue. Inbound frames are parsed and forwarded as
//! [`TransportEvent`]s tagged with the connection generation that opened
//! them, so events from a superseded socket can be told apart.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::credentials::{Credential, CredentialKind};
use super::protocol::{ClientMessage, ServerMessage, SetupMessage};
use crate::{Error, Result};

/// Lifecycle and message events from one transport session
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Setup acknowledged; the session is live
    Open,
    /// A parsed server message
    Message(ServerMessage),
    /// The socket failed
    Error(String),
    /// The socket closed, with the peer's reason if given
    Closed(Option<String>),
}

/// Generation-tagged sender handed to each transport session
#[derive(Debug, Clone)]
pub struct EventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl EventSender {
    #[must_use]
    pub const fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { generation, tx }
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Forward an event; returns `false` once the session engine is gone
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// Everything needed to open one transport session
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub credential: Credential,
    pub setup: SetupMessage,
}

/// Opens transport sessions
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect, send `request.setup`, and start forwarding events to `events`
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be established
    async fn open(
        &self,
        request: ConnectRequest,
        events: EventSender,
    ) -> Result<Box<dyn TransportSink>>;
}

/// Write half of an open transport session
pub trait TransportSink: Send {
    /// Queue a message for sending
    ///
    /// # Errors
    ///
    /// Returns error if the session has already closed
    fn send(&self, message: ClientMessage) -> Result<()>;

    /// Close the session; idempotent
    fn close(&self);
}

enum Outgoing {
    Frame(String),
    Close,
}

/// Live endpoint over `tokio-tungstenite`
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    endpoint_url: String,
}

impl WebSocketTransport {
    #[must_use]
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
        }
    }

    /// Build the connect URL for a credential
    ///
    /// Ephemeral tokens use the constrained method with `access_token`; API
    /// keys use the plain method with `key`.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint URL is invalid
    pub fn connect_url(&self, credential: &Credential) -> Result<Url> {
        let (method, param) = match credential.kind() {
            CredentialKind::Ephemeral => ("BidiGenerateContentConstrained", "access_token"),
            CredentialKind::ApiKey => ("BidiGenerateContent", "key"),
        };
        let base = format!("{}.{method}", self.endpoint_url.trim_end_matches('/'));
        Url::parse_with_params(&base, &[(param, credential.token())])
            .map_err(|e| Error::Config(format!("invalid endpoint url: {e}")))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(
        &self,
        request: ConnectRequest,
        events: EventSender,
    ) -> Result<Box<dyn TransportSink>> {
        let url = self.connect_url(&request.credential)?;
        let generation = events.generation();

        let (stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        tracing::debug!(generation, "websocket connected");

        let (mut write, mut read) = stream.split();

        let setup = serde_json::to_string(&ClientMessage::Setup(request.setup))?;
        write.send(Message::Text(setup)).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();

        let writer_events = events.clone();
        tokio::spawn(async move {
            while let Some(outgoing) = rx.recv().await {
                match outgoing {
                    Outgoing::Frame(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            tracing::warn!(error = %e, "websocket send failed");
                            writer_events.send(TransportEvent::Error(e.to_string()));
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        let _ = write.close().await;
                        break;
                    }
                }
            }
            tracing::trace!(generation, "websocket writer finished");
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let payload = match frame {
                    Ok(Message::Text(text)) => text.into_bytes(),
                    Ok(Message::Binary(bytes)) => bytes,
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty());
                        tracing::debug!(generation, reason = ?reason, "websocket closed by peer");
                        events.send(TransportEvent::Closed(reason));
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!(generation, error = %e, "websocket read failed");
                        events.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                };

                match ServerMessage::from_slice(&payload) {
                    Ok(message) if message.is_setup_complete() => {
                        events.send(TransportEvent::Open);
                    }
                    Ok(message) => {
                        events.send(TransportEvent::Message(message));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "ignoring unparseable server message");
                    }
                }
            }
            events.send(TransportEvent::Closed(None));
        });

        Ok(Box::new(WebSocketSink { tx, reader }))
    }
}

struct WebSocketSink {
    tx: mpsc::UnboundedSender<Outgoing>,
    reader: JoinHandle<()>,
}

impl TransportSink for WebSocketSink {
    fn send(&self, message: ClientMessage) -> Result<()> {
        let text = serde_json::to_string(&message)?;
        self.tx
            .send(Outgoing::Frame(text))
            .map_err(|_| Error::Transport("connection closed".to_string()))
    }

    fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
        // Nothing is read after a local close
        self.reader.abort();
    }
}

impl Drop for WebSocketSink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
