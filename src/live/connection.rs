//! Remote session lifecycle: connect, resume and close
//!
//! All mutable session state lives in one [`SessionState`] value owned here.
//! Reconnection is driven from outside: [`ConnectionManager::on_close`] arms a
//! deadline, and the session engine calls [`ConnectionManager::connect`] again
//! once it passes. At most one resumption is in flight at a time.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::credentials::CredentialProvider;
use super::protocol::{
    Blob, ClientMessage, Content, ContextWindowCompression, FunctionResponse, GenerationConfig,
    PrebuiltVoiceConfig, RealtimeInput, SessionResumptionConfig, SetupMessage, SlidingWindow,
    SpeechConfig, TextPart, ToolDeclarations, ToolResponse, VoiceConfig,
};
use super::transport::{ConnectRequest, EventSender, Transport, TransportEvent, TransportSink};
use crate::config::Config;
use crate::voice::AudioFrame;
use crate::{Error, Result};

/// Longest wait between opening a transport and the remote acknowledging setup
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection status visible to collaborators
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        })
    }
}

/// The logical conversation
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub status: ConnectionStatus,
    /// Opaque token for resuming after a clean close
    pub resumption_handle: Option<String>,
    /// A resumption attempt is scheduled or in flight
    pub resuming: bool,
    /// The current stop was requested by the user
    pub manual_stop: bool,
    /// Bumped on every connect; events from older sessions are ignored
    pub generation: u64,
}

/// When and how often to resume after a clean close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Fixed delay before a resumption attempt
    pub delay: Duration,
    /// Cap on resumptions per session; `None` is unbounded
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            max_attempts: None,
        }
    }
}

/// What a close event means for the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Event from a superseded transport
    Stale,
    /// Closed after a user stop
    Stopped,
    /// Closed with nothing to resume
    Ended,
    /// A resumption is scheduled
    Resuming,
    /// Closed while a resumption was in flight
    ResumeFailed,
    /// Resumption cap reached
    Exhausted,
}

/// Build the setup message advertised on every connect
#[must_use]
pub fn build_setup(config: &Config) -> SetupMessage {
    SetupMessage {
        model: config.model.clone(),
        generation_config: GenerationConfig {
            response_modalities: vec!["AUDIO".to_string()],
            speech_config: SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: config.voice_name.clone(),
                    },
                },
            },
        },
        system_instruction: config.system_instruction.as_ref().map(|text| Content {
            parts: vec![TextPart { text: text.clone() }],
        }),
        tools: if config.tools.is_empty() {
            Vec::new()
        } else {
            vec![ToolDeclarations {
                function_declarations: config.tools.clone(),
            }]
        },
        context_window_compression: config.context_compression.then(|| ContextWindowCompression {
            sliding_window: SlidingWindow::default(),
        }),
        session_resumption: SessionResumptionConfig::default(),
    }
}

/// Owns the remote session and its transport
pub struct ConnectionManager {
    credentials: Box<dyn CredentialProvider>,
    transport: Box<dyn Transport>,
    setup: SetupMessage,
    policy: ReconnectPolicy,
    state: SessionState,
    sink: Option<Box<dyn TransportSink>>,
    reconnect_at: Option<Instant>,
    setup_at: Option<Instant>,
    attempts: u32,
    events: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl ConnectionManager {
    /// Create a manager forwarding transport events into `events`
    #[must_use]
    pub fn new(
        credentials: Box<dyn CredentialProvider>,
        transport: Box<dyn Transport>,
        setup: SetupMessage,
        policy: ReconnectPolicy,
        events: mpsc::UnboundedSender<(u64, TransportEvent)>,
    ) -> Self {
        Self {
            credentials,
            transport,
            setup,
            policy,
            state: SessionState::default(),
            sink: None,
            reconnect_at: None,
            setup_at: None,
            attempts: 0,
            events,
        }
    }

    /// Reset per-session state before a user-initiated start
    pub fn begin_session(&mut self) {
        self.state.manual_stop = false;
        self.state.resuming = false;
        self.state.resumption_handle = None;
        self.reconnect_at = None;
        self.setup_at = None;
        self.attempts = 0;
    }

    /// Fetch a credential and open a transport session
    ///
    /// The stored resumption handle, if any, is attached to the setup.
    ///
    /// # Errors
    ///
    /// Returns error if the credential fetch or transport open fails; the
    /// status is left `Disconnected` and the handle invalidated
    pub async fn connect(&mut self) -> Result<()> {
        if let Some(sink) = self.sink.take() {
            sink.close();
        }
        self.state.generation += 1;
        self.state.status = ConnectionStatus::Connecting;
        let generation = self.state.generation;

        tracing::info!(
            generation,
            resuming = self.state.resuming,
            "connecting to live endpoint"
        );

        match self.open_transport(generation).await {
            Ok(sink) => {
                self.sink = Some(sink);
                self.setup_at = Some(Instant::now() + SETUP_TIMEOUT);
                Ok(())
            }
            Err(e) => {
                tracing::error!(generation, error = %e, "connect failed");
                self.setup_at = None;
                self.state.status = ConnectionStatus::Disconnected;
                self.state.resuming = false;
                self.state.resumption_handle = None;
                Err(e)
            }
        }
    }

    async fn open_transport(&self, generation: u64) -> Result<Box<dyn TransportSink>> {
        let credential = self.credentials.fetch().await?;

        let mut setup = self.setup.clone();
        setup.session_resumption.handle.clone_from(&self.state.resumption_handle);

        self.transport
            .open(
                ConnectRequest { credential, setup },
                EventSender::new(generation, self.events.clone()),
            )
            .await
    }

    /// Whether an event tagged `generation` belongs to the current session
    #[must_use]
    pub const fn is_current(&self, generation: u64) -> bool {
        generation == self.state.generation
    }

    /// Transport acknowledged setup
    pub fn on_open(&mut self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        self.state.status = ConnectionStatus::Connected;
        self.setup_at = None;
        if std::mem::take(&mut self.state.resuming) {
            tracing::info!(generation, "session resumed");
        } else {
            tracing::info!(generation, "session connected");
        }
    }

    /// Transport failed; returns `false` for stale events
    ///
    /// The resumption handle is invalidated. Errors never resume.
    pub fn on_error(&mut self, generation: u64, message: &str) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        tracing::error!(generation, error = %message, "transport error");
        self.state.status = ConnectionStatus::Disconnected;
        self.state.resumption_handle = None;
        self.state.resuming = false;
        self.reconnect_at = None;
        self.setup_at = None;
        true
    }

    /// Transport closed; decides whether to schedule a resumption
    ///
    /// A resumption is scheduled only when a handle is stored, the stop was
    /// not user-initiated, no resumption is already in flight and the caller
    /// is still `streaming`.
    pub fn on_close(&mut self, generation: u64, reason: Option<&str>, streaming: bool) -> CloseOutcome {
        if !self.is_current(generation) {
            return CloseOutcome::Stale;
        }

        // Transport already closed, resumption pending
        if self.state.resuming && self.reconnect_at.is_some() {
            tracing::debug!(generation, reason, "duplicate close while resumption pending");
            return CloseOutcome::Stale;
        }

        self.sink = None;
        self.setup_at = None;
        self.state.status = ConnectionStatus::Disconnected;

        if self.state.manual_stop {
            return CloseOutcome::Stopped;
        }

        if self.state.resuming {
            tracing::warn!(generation, reason, "closed while resuming");
            self.state.resuming = false;
            self.state.resumption_handle = None;
            self.reconnect_at = None;
            return CloseOutcome::ResumeFailed;
        }

        if self.state.resumption_handle.is_none() || !streaming {
            tracing::info!(generation, reason, "session closed");
            return CloseOutcome::Ended;
        }

        if self.policy.max_attempts.is_some_and(|max| self.attempts >= max) {
            tracing::warn!(attempts = self.attempts, "resumption attempts exhausted");
            self.state.resumption_handle = None;
            return CloseOutcome::Exhausted;
        }

        self.attempts += 1;
        self.state.resuming = true;
        self.reconnect_at = Some(Instant::now() + self.policy.delay);
        tracing::info!(
            generation,
            reason,
            attempt = self.attempts,
            delay_ms = u64::try_from(self.policy.delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling session resumption"
        );
        CloseOutcome::Resuming
    }

    /// Deadline of the scheduled resumption, if any
    #[must_use]
    pub const fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Deadline for the remote to acknowledge setup, if a transport is opening
    #[must_use]
    pub const fn setup_deadline(&self) -> Option<Instant> {
        self.setup_at
    }

    /// Abandon a transport that never acknowledged setup
    ///
    /// Returns the error to surface, or `None` if no setup was pending.
    pub fn expire_setup(&mut self) -> Option<Error> {
        self.setup_at.take()?;
        let generation = self.state.generation;
        tracing::error!(generation, resuming = self.state.resuming, "session setup timed out");
        if let Some(sink) = self.sink.take() {
            sink.close();
        }
        self.state.status = ConnectionStatus::Disconnected;
        self.state.resuming = false;
        self.state.resumption_handle = None;
        Some(Error::Transport(format!(
            "session setup not acknowledged within {}s",
            SETUP_TIMEOUT.as_secs()
        )))
    }

    /// Consume the scheduled resumption; `true` if one was pending
    pub fn take_reconnect(&mut self) -> bool {
        self.reconnect_at.take().is_some()
    }

    /// Store a resumption handle (last write wins)
    pub fn store_handle(&mut self, handle: String) {
        tracing::trace!("resumption handle updated");
        self.state.resumption_handle = Some(handle);
    }

    /// User-initiated stop; idempotent
    pub fn stop(&mut self) {
        self.state.manual_stop = true;
        self.state.resuming = false;
        self.state.resumption_handle = None;
        self.reconnect_at = None;
        self.setup_at = None;
        if let Some(sink) = self.sink.take() {
            sink.close();
            tracing::debug!(generation = self.state.generation, "transport closed");
        }
        self.state.status = ConnectionStatus::Disconnected;
    }

    fn send(&self, message: ClientMessage) -> Result<()> {
        match (&self.sink, self.state.status) {
            (Some(sink), ConnectionStatus::Connected) => sink.send(message),
            _ => Err(Error::NotConnected),
        }
    }

    /// Send one captured frame; dropped when not connected
    pub fn send_audio(&self, frame: &AudioFrame) {
        let message = ClientMessage::RealtimeInput(RealtimeInput::Audio(Blob {
            data: frame.data.clone(),
            mime_type: AudioFrame::mime_type(),
        }));
        if let Err(e) = self.send(message) {
            tracing::trace!(error = %e, "audio frame dropped");
        }
    }

    /// Send user text
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without an active session
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send(ClientMessage::RealtimeInput(RealtimeInput::Text(
            text.to_string(),
        )))
    }

    /// Send an image or other media; best-effort
    pub fn send_media(&self, data: String, mime_type: String) {
        let message = ClientMessage::RealtimeInput(RealtimeInput::Media(Blob { data, mime_type }));
        if let Err(e) = self.send(message) {
            tracing::warn!(error = %e, "failed to send media");
        }
    }

    /// Send the display dimensions; best-effort
    pub fn send_viewport(&self, width: u32, height: u32) {
        let message =
            ClientMessage::RealtimeInput(RealtimeInput::Text(format!("[viewport] {width}x{height}")));
        if let Err(e) = self.send(message) {
            tracing::warn!(error = %e, "failed to send viewport");
        }
    }

    /// Acknowledge one tool call; best-effort
    pub fn send_tool_response(&self, response: FunctionResponse) {
        let id = response.id.clone();
        let message = ClientMessage::ToolResponse(ToolResponse {
            function_responses: vec![response],
        });
        if let Err(e) = self.send(message) {
            tracing::warn!(error = %e, id = %id, "failed to send tool response");
        }
    }

    #[must_use]
    pub const fn state(&self) -> &SessionState {
        &self.state
    }

    #[must_use]
    pub const fn status(&self) -> ConnectionStatus {
        self.state.status
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::live::credentials::{Credential, CredentialKind};

    #[derive(Default)]
    struct Recorded {
        handles: Vec<Option<String>>,
        sent: Vec<ClientMessage>,
        closes: usize,
    }

    struct StubCredentials {
        fail: bool,
    }

    #[async_trait]
    impl CredentialProvider for StubCredentials {
        async fn fetch(&self) -> Result<Credential> {
            if self.fail {
                Err(Error::Credential("denied".into()))
            } else {
                Ok(Credential::new("t", CredentialKind::Ephemeral))
            }
        }
    }

    struct StubTransport(Arc<Mutex<Recorded>>);
    struct StubSink(Arc<Mutex<Recorded>>);

    #[async_trait]
    impl Transport for StubTransport {
        async fn open(
            &self,
            request: ConnectRequest,
            _events: EventSender,
        ) -> Result<Box<dyn TransportSink>> {
            self.0
                .lock()
                .unwrap()
                .handles
                .push(request.setup.session_resumption.handle);
            Ok(Box::new(StubSink(Arc::clone(&self.0))))
        }
    }

    impl TransportSink for StubSink {
        fn send(&self, message: ClientMessage) -> Result<()> {
            self.0.lock().unwrap().sent.push(message);
            Ok(())
        }

        fn close(&self) {
            self.0.lock().unwrap().closes += 1;
        }
    }

    fn manager(fail: bool, policy: ReconnectPolicy) -> (ConnectionManager, Arc<Mutex<Recorded>>) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(
            Box::new(StubCredentials { fail }),
            Box::new(StubTransport(Arc::clone(&recorded))),
            build_setup(&Config::default()),
            policy,
            tx,
        );
        (manager, recorded)
    }

    async fn connected(policy: ReconnectPolicy) -> (ConnectionManager, Arc<Mutex<Recorded>>) {
        let (mut manager, recorded) = manager(false, policy);
        manager.begin_session();
        manager.connect().await.unwrap();
        let generation = manager.state().generation;
        manager.on_open(generation);
        (manager, recorded)
    }

    #[tokio::test(start_paused = true)]
    async fn open_sets_connected() {
        let (mut manager, _) = manager(false, ReconnectPolicy::default());
        manager.connect().await.unwrap();
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
        manager.on_open(manager.state().generation);
        assert_eq!(manager.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn credential_failure_leaves_disconnected() {
        let (mut manager, recorded) = manager(true, ReconnectPolicy::default());
        let err = manager.connect().await.unwrap_err();
        assert!(err.is_fatal_to_attempt());
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(recorded.lock().unwrap().handles.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn clean_close_with_handle_resumes_once() {
        let (mut manager, recorded) = connected(ReconnectPolicy::default()).await;
        manager.store_handle("h1".into());
        manager.store_handle("h2".into());

        let generation = manager.state().generation;
        let start = Instant::now();
        assert_eq!(manager.on_close(generation, None, true), CloseOutcome::Resuming);
        assert_eq!(manager.reconnect_deadline().unwrap() - start, Duration::from_secs(1));
        assert!(manager.state().resuming);

        // Second close for the same transport keeps the pending attempt
        assert_eq!(manager.on_close(generation, None, true), CloseOutcome::Stale);
        assert_eq!(manager.reconnect_deadline().unwrap() - start, Duration::from_secs(1));
        assert!(manager.state().resuming);
        assert_eq!(recorded.lock().unwrap().handles.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_transport_closing_before_setup_fails() {
        let (mut manager, _) = connected(ReconnectPolicy::default()).await;
        manager.store_handle("h1".into());
        manager.on_close(manager.state().generation, None, true);

        assert!(manager.take_reconnect());
        manager.connect().await.unwrap();
        assert_eq!(
            manager.on_close(manager.state().generation, Some("bad handle"), true),
            CloseOutcome::ResumeFailed
        );
        assert!(!manager.state().resuming);
        assert!(manager.reconnect_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn setup_deadline_armed_until_open() {
        let (mut manager, recorded) = manager(false, ReconnectPolicy::default());
        assert!(manager.expire_setup().is_none());

        let start = Instant::now();
        manager.connect().await.unwrap();
        assert_eq!(manager.setup_deadline().unwrap() - start, SETUP_TIMEOUT);
        manager.on_open(manager.state().generation);
        assert!(manager.setup_deadline().is_none());

        manager.connect().await.unwrap();
        let err = manager.expire_setup().unwrap();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(manager.setup_deadline().is_none());
        assert_eq!(recorded.lock().unwrap().closes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_attaches_latest_handle() {
        let (mut manager, recorded) = connected(ReconnectPolicy::default()).await;
        manager.store_handle("h1".into());
        manager.store_handle("h2".into());
        manager.on_close(manager.state().generation, Some("going away"), true);

        assert!(manager.take_reconnect());
        assert!(!manager.take_reconnect());
        manager.connect().await.unwrap();
        manager.on_open(manager.state().generation);

        assert!(!manager.state().resuming);
        assert_eq!(manager.status(), ConnectionStatus::Connected);
        assert_eq!(
            recorded.lock().unwrap().handles,
            vec![None, Some("h2".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_resume_after_manual_stop() {
        let (mut manager, recorded) = connected(ReconnectPolicy::default()).await;
        manager.store_handle("h".into());
        let generation = manager.state().generation;

        manager.stop();
        manager.stop();
        assert_eq!(recorded.lock().unwrap().closes, 1);
        assert_eq!(manager.on_close(generation, None, true), CloseOutcome::Stopped);
        assert!(manager.reconnect_deadline().is_none());
        assert!(manager.state().resumption_handle.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn close_without_handle_or_streaming_ends() {
        let (mut manager, _) = connected(ReconnectPolicy::default()).await;
        assert_eq!(manager.on_close(manager.state().generation, None, true), CloseOutcome::Ended);

        let (mut manager, _) = connected(ReconnectPolicy::default()).await;
        manager.store_handle("h".into());
        assert_eq!(manager.on_close(manager.state().generation, None, false), CloseOutcome::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn error_invalidates_handle() {
        let (mut manager, _) = connected(ReconnectPolicy::default()).await;
        manager.store_handle("h".into());
        let generation = manager.state().generation;

        assert!(manager.on_error(generation, "reset"));
        assert!(manager.state().resumption_handle.is_none());
        assert_eq!(manager.on_close(generation, None, true), CloseOutcome::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_events_are_ignored() {
        let (mut manager, _) = connected(ReconnectPolicy::default()).await;
        let old = manager.state().generation;
        manager.connect().await.unwrap();

        assert!(!manager.on_error(old, "late"));
        assert_eq!(manager.on_close(old, None, true), CloseOutcome::Stale);
        manager.on_open(old);
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_cap_is_enforced() {
        let policy = ReconnectPolicy {
            delay: Duration::from_millis(10),
            max_attempts: Some(1),
        };
        let (mut manager, _) = connected(policy).await;
        manager.store_handle("h".into());
        assert_eq!(manager.on_close(manager.state().generation, None, true), CloseOutcome::Resuming);

        manager.take_reconnect();
        manager.connect().await.unwrap();
        manager.on_open(manager.state().generation);
        manager.store_handle("h".into());
        assert_eq!(manager.on_close(manager.state().generation, None, true), CloseOutcome::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn sends_require_connection() {
        let (mut manager, recorded) = manager(false, ReconnectPolicy::default());
        assert!(matches!(manager.send_text("hi"), Err(Error::NotConnected)));
        manager.send_viewport(800, 600);
        manager.send_media("aGk=".into(), "image/png".into());

        manager.connect().await.unwrap();
        manager.on_open(manager.state().generation);
        manager.send_text("hi").unwrap();
        manager.send_viewport(800, 600);

        let recorded = recorded.lock().unwrap();
        let sent = &recorded.sent;
        assert_eq!(sent.len(), 2);
        let viewport = serde_json::to_value(&sent[1]).unwrap();
        assert_eq!(viewport["realtimeInput"]["text"], "[viewport] 800x600");
    }

    #[test]
    fn setup_carries_model_voice_and_tools() {
        let setup = serde_json::to_value(build_setup(&Config::default())).unwrap();
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Zephyr"
        );
        assert_eq!(
            setup["tools"][0]["functionDeclarations"][0]["name"],
            "generate_visual_explanation"
        );
        assert!(setup["contextWindowCompression"]["slidingWindow"].is_object());
        assert!(setup["sessionResumption"].is_object());
        assert!(setup["sessionResumption"].get("handle").is_none());
    }
}
