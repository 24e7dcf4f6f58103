//! Session engine and its public handle
//!
//! The engine owns every component and runs as a single local task: commands
//! from [`LiveSession`] handles, capture frames and transport events are all
//! consumed on one control flow, so no component state is ever shared
//! between call sites. Observable state is published through a
//! [`tokio::sync::watch`] channel.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use base64::Engine as _;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use uuid::Uuid;

use super::connection::{CloseOutcome, ConnectionManager, ConnectionStatus, build_setup};
use super::credentials::{self, CredentialProvider};
use super::inbound::{Effect, InboundProcessor};
use super::tools::{ToolCallDispatcher, ToolCallListener};
use super::transport::{Transport, TransportEvent, WebSocketTransport};
use crate::config::Config;
use crate::voice::{
    AnalysisNode, AudioFrame, AudioInput, CapturePipeline, CpalInput, CpalOutput,
    PLAYBACK_SAMPLE_RATE, PlaybackBackend, PlaybackScheduler, SpeakingDetector, WavRecorder,
};
use crate::{Error, Result};

/// Observable session state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub is_streaming: bool,
    /// Last user-visible error, until cleared
    pub error: Option<String>,
    pub is_speaking: bool,
    pub connection_status: ConnectionStatus,
}

/// Display dimensions reported to the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Receives every captured frame at the input rate
pub type RawMicFrameListener = Arc<dyn Fn(&[f32]) + Send + Sync>;

/// Receives every decoded batch at the playback rate
pub type DecodedAudioListener = Arc<dyn Fn(&[f32]) + Send + Sync>;

/// Receives model text parts
pub type TranscriptListener = Arc<dyn Fn(&str) + Send + Sync>;

enum Command {
    Start(oneshot::Sender<Result<()>>),
    Stop,
    ClearError,
    SendText(String, oneshot::Sender<Result<()>>),
    SendMedia { data: String, mime_type: String },
    SendViewport(Viewport),
    ToolCallListener(ToolCallListener),
    RawMicFrameListener(RawMicFrameListener),
    DecodedAudioListener(DecodedAudioListener),
    TranscriptListener(TranscriptListener),
}

/// Handle to a running session engine
///
/// Cheap to clone. The engine shuts down and releases every resource once
/// all handles are dropped.
#[derive(Clone)]
pub struct LiveSession {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionSnapshot>,
    analyser: Arc<OnceLock<AnalysisNode>>,
}

impl LiveSession {
    /// Start building a session from configuration
    #[must_use]
    pub fn builder(config: Config) -> LiveSessionBuilder {
        LiveSessionBuilder::new(config)
    }

    /// Acquire the microphone and connect
    ///
    /// Any prior session is torn down first.
    ///
    /// # Errors
    ///
    /// Returns error if rejected by the rate guard, the microphone or
    /// processing module is unavailable, or the credential fetch or connect
    /// fails. The session is fully torn down in every case.
    pub async fn start(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Start(tx))?;
        rx.await.map_err(|_| Error::EngineStopped)?
    }

    /// Stop streaming and release every resource; never fails
    pub fn stop(&self) {
        let _ = self.command(Command::Stop);
    }

    /// Clear the surfaced error
    pub fn clear_error(&self) {
        let _ = self.command(Command::ClearError);
    }

    /// Send user text to the model
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without an active session
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::SendText(text.into(), tx))?;
        rx.await.map_err(|_| Error::EngineStopped)?
    }

    /// Send an image or other media; best-effort
    pub fn send_media(&self, bytes: &[u8], mime_type: &str) {
        let _ = self.command(Command::SendMedia {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            mime_type: mime_type.to_string(),
        });
    }

    /// Report display dimensions; best-effort
    pub fn send_viewport(&self, viewport: Viewport) {
        let _ = self.command(Command::SendViewport(viewport));
    }

    /// Register the single tool-call listener, replacing any previous one
    pub fn register_tool_call_listener(&self, listener: impl Fn(&str, &Value) + Send + Sync + 'static) {
        let _ = self.command(Command::ToolCallListener(Arc::new(listener)));
    }

    /// Observe every captured microphone frame
    pub fn register_raw_mic_frame_listener(&self, listener: impl Fn(&[f32]) + Send + Sync + 'static) {
        let _ = self.command(Command::RawMicFrameListener(Arc::new(listener)));
    }

    /// Observe every decoded assistant audio batch
    pub fn register_decoded_audio_frame_listener(
        &self,
        listener: impl Fn(&[f32]) + Send + Sync + 'static,
    ) {
        let _ = self.command(Command::DecodedAudioListener(Arc::new(listener)));
    }

    /// Observe model text
    pub fn register_transcript_listener(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        let _ = self.command(Command::TranscriptListener(Arc::new(listener)));
    }

    /// The playback analysis node, once playback has started
    #[must_use]
    pub fn analysis_node(&self) -> Option<AnalysisNode> {
        self.analyser.get().cloned()
    }

    /// Current observable state
    #[must_use]
    pub fn state(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Subscribe to state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::EngineStopped)
    }
}

/// Builder for [`LiveSession`]
///
/// Devices, credentials and transport default to the system audio devices,
/// the configured credential source and the WebSocket endpoint.
pub struct LiveSessionBuilder {
    config: Config,
    credentials: Option<Box<dyn CredentialProvider>>,
    transport: Option<Box<dyn Transport>>,
    audio_input: Option<Box<dyn AudioInput>>,
    audio_output: Option<Box<dyn PlaybackBackend>>,
    record_path: Option<PathBuf>,
}

impl LiveSessionBuilder {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            credentials: None,
            transport: None,
            audio_input: None,
            audio_output: None,
            record_path: None,
        }
    }

    #[must_use]
    pub fn credentials(mut self, credentials: Box<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn audio_input(mut self, input: Box<dyn AudioInput>) -> Self {
        self.audio_input = Some(input);
        self
    }

    #[must_use]
    pub fn audio_output(mut self, output: Box<dyn PlaybackBackend>) -> Self {
        self.audio_output = Some(output);
        self
    }

    /// Record assistant audio to a WAV file
    #[must_use]
    pub fn record_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.record_path = Some(path.into());
        self
    }

    /// Spawn the engine on the current [`tokio::task::LocalSet`]
    ///
    /// # Errors
    ///
    /// Returns error if no credential source is configured or the recording
    /// file cannot be created
    pub fn spawn_local(self) -> Result<LiveSession> {
        let credentials = match self.credentials {
            Some(credentials) => credentials,
            None => credentials::from_source(&self.config.credentials)?,
        };
        let transport: Box<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Box::new(WebSocketTransport::new(self.config.endpoint_url.clone())),
        };
        let input: Box<dyn AudioInput> = match self.audio_input {
            Some(input) => input,
            None => Box::new(CpalInput),
        };
        let output: Box<dyn PlaybackBackend> = match self.audio_output {
            Some(output) => output,
            None => Box::new(CpalOutput),
        };
        let recorder = self
            .record_path
            .map(|path| WavRecorder::create(path, PLAYBACK_SAMPLE_RATE))
            .transpose()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::default());
        let analyser = Arc::new(OnceLock::new());

        let engine = Engine {
            capture: CapturePipeline::new(input, self.config.capture.frame_samples)
                .with_constraints(self.config.capture.processing),
            connection: ConnectionManager::new(
                credentials,
                transport,
                build_setup(&self.config),
                self.config.reconnect,
                events_tx,
            ),
            inbound: InboundProcessor::new(),
            playback: PlaybackScheduler::with_analyser(output, Arc::clone(&analyser)),
            speaking: SpeakingDetector::new(),
            tools: ToolCallDispatcher::new(),
            recorder,
            raw_mic_listener: None,
            decoded_audio_listener: None,
            transcript_listener: None,
            session_id: None,
            snapshot: SessionSnapshot::default(),
            state_tx,
            frames_tx,
        };

        tokio::task::spawn_local(engine.run(commands_rx, frames_rx, events_rx));
        tracing::debug!(model = %self.config.model, "session engine spawned");

        Ok(LiveSession {
            commands: commands_tx,
            state: state_rx,
            analyser,
        })
    }
}

struct Engine {
    capture: CapturePipeline,
    connection: ConnectionManager,
    inbound: InboundProcessor,
    playback: PlaybackScheduler,
    speaking: SpeakingDetector,
    tools: ToolCallDispatcher,
    recorder: Option<WavRecorder>,
    raw_mic_listener: Option<RawMicFrameListener>,
    decoded_audio_listener: Option<DecodedAudioListener>,
    transcript_listener: Option<TranscriptListener>,
    session_id: Option<Uuid>,
    snapshot: SessionSnapshot,
    state_tx: watch::Sender<SessionSnapshot>,
    frames_tx: mpsc::UnboundedSender<AudioFrame>,
}

impl Engine {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut frames: mpsc::UnboundedReceiver<AudioFrame>,
        mut events: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
    ) {
        loop {
            let reconnect_at = self.connection.reconnect_deadline();
            let setup_at = self.connection.setup_deadline();
            let speaking_at = self.speaking.deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(frame) = frames.recv() => self.handle_frame(&frame),
                Some((generation, event)) = events.recv() => {
                    self.handle_transport_event(generation, event);
                }
                () = sleep_until_opt(reconnect_at) => self.resume().await,
                () = sleep_until_opt(setup_at) => {
                    if let Some(e) = self.connection.expire_setup() {
                        self.fail(&e);
                    }
                }
                () = sleep_until_opt(speaking_at) => self.on_speaking_timer(),
            }
        }

        self.teardown();
        if let Some(recorder) = self.recorder.as_mut()
            && let Err(e) = recorder.finalize()
        {
            tracing::warn!(error = %e, "failed to finalize recording");
        }
        tracing::debug!("session engine stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            Command::Stop => {
                tracing::info!("stopping session");
                self.teardown();
            }
            Command::ClearError => {
                self.snapshot.error = None;
                self.publish();
            }
            Command::SendText(text, reply) => {
                let result = self.connection.send_text(&text);
                if let Err(e) = &result {
                    self.snapshot.error = Some(e.to_string());
                    self.publish();
                }
                let _ = reply.send(result);
            }
            Command::SendMedia { data, mime_type } => self.connection.send_media(data, mime_type),
            Command::SendViewport(viewport) => {
                self.connection.send_viewport(viewport.width, viewport.height);
            }
            Command::ToolCallListener(listener) => self.tools.register(listener),
            Command::RawMicFrameListener(listener) => self.raw_mic_listener = Some(listener),
            Command::DecodedAudioListener(listener) => self.decoded_audio_listener = Some(listener),
            Command::TranscriptListener(listener) => self.transcript_listener = Some(listener),
        }
    }

    async fn start(&mut self) -> Result<()> {
        let session_id = Uuid::new_v4();
        tracing::info!(%session_id, "starting session");

        if let Err(e) = self.capture.start(self.frames_tx.clone()) {
            self.fail(&e);
            return Err(e);
        }

        // Prior session, if any, goes away before connecting
        self.connection.stop();
        self.inbound.reset();
        self.playback.teardown();
        self.speaking.clear();

        self.snapshot.is_streaming = true;
        self.snapshot.is_speaking = false;
        self.snapshot.error = None;
        self.session_id = Some(session_id);
        self.connection.begin_session();

        if let Err(e) = self.connection.connect().await {
            self.fail(&e);
            return Err(e);
        }
        self.publish();
        Ok(())
    }

    async fn resume(&mut self) {
        if !self.connection.take_reconnect() || !self.snapshot.is_streaming {
            return;
        }
        self.publish();
        match self.connection.connect().await {
            Ok(()) => self.publish(),
            Err(e) => self.fail(&e),
        }
    }

    fn handle_frame(&self, frame: &AudioFrame) {
        if !self.snapshot.is_streaming {
            return;
        }
        if let Some(listener) = &self.raw_mic_listener {
            listener(&frame.samples);
        }
        self.connection.send_audio(frame);
    }

    fn handle_transport_event(&mut self, generation: u64, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                self.connection.on_open(generation);
                self.publish();
            }
            TransportEvent::Message(message) => {
                if !self.connection.is_current(generation) {
                    return;
                }
                for inbound in message.into_inbound() {
                    for effect in self.inbound.process(inbound) {
                        self.apply(effect);
                    }
                }
            }
            TransportEvent::Error(message) => {
                if self.connection.on_error(generation, &message) {
                    self.fail(&Error::Transport(message));
                }
            }
            TransportEvent::Closed(reason) => {
                let outcome =
                    self.connection
                        .on_close(generation, reason.as_deref(), self.snapshot.is_streaming);
                match outcome {
                    CloseOutcome::Stale | CloseOutcome::Stopped => {}
                    CloseOutcome::Resuming => self.publish(),
                    CloseOutcome::Ended => self.teardown(),
                    CloseOutcome::ResumeFailed => {
                        self.fail(&Error::Transport("connection closed while resuming".to_string()));
                    }
                    CloseOutcome::Exhausted => {
                        self.fail(&Error::Transport("session resumption attempts exhausted".to_string()));
                    }
                }
            }
        }
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::StoreHandle(handle) => self.connection.store_handle(handle),
            Effect::Interrupt => {
                tracing::debug!("playback interrupted");
                self.playback.teardown();
                if self.speaking.clear() {
                    self.snapshot.is_speaking = false;
                    self.publish();
                }
            }
            Effect::DispatchTools(calls) => {
                for ack in self.tools.dispatch(calls) {
                    self.connection.send_tool_response(ack);
                }
            }
            Effect::Flush(batch) => self.play(&batch),
            Effect::Transcript(text) => match &self.transcript_listener {
                Some(listener) => listener(&text),
                None => tracing::debug!(text = %text, "model text"),
            },
        }
    }

    fn play(&mut self, batch: &[Vec<u8>]) {
        let buffer = match self.playback.schedule(batch) {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::warn!(error = %e, fragments = batch.len(), "skipping audio batch");
                return;
            }
        };

        if let Some(listener) = &self.decoded_audio_listener {
            listener(&buffer.samples);
        }
        if let Some(recorder) = self.recorder.as_mut()
            && let Err(e) = recorder.append(&buffer.samples)
        {
            tracing::warn!(path = %recorder.path().display(), error = %e, "failed to record audio");
        }

        if self.speaking.on_scheduled(buffer.remaining()) {
            self.snapshot.is_speaking = true;
            self.publish();
        }
    }

    fn on_speaking_timer(&mut self) {
        if self.speaking.on_timer_fired(self.playback.remaining()) {
            self.snapshot.is_speaking = false;
            self.publish();
        }
    }

    fn fail(&mut self, error: &Error) {
        tracing::error!(session_id = ?self.session_id, error = %error, "session failed");
        self.teardown();
        self.snapshot.error = Some(error.to_string());
        self.publish();
    }

    /// Release everything; safe from any state
    fn teardown(&mut self) {
        if let Some(session_id) = self.session_id.take() {
            tracing::info!(%session_id, "session torn down");
        }
        self.capture.stop();
        self.connection.stop();
        self.inbound.reset();
        self.playback.teardown();
        self.speaking.clear();

        self.snapshot.is_streaming = false;
        self.snapshot.is_speaking = false;
        self.publish();
    }

    fn publish(&mut self) {
        self.snapshot.connection_status = self.connection.status();
        let snapshot = self.snapshot.clone();
        self.state_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_until_opt_waits_for_deadline() {
        let start = Instant::now();
        sleep_until_opt(Some(start + Duration::from_millis(300))).await;
        assert!(Instant::now() - start >= Duration::from_millis(300));

        let pending = tokio::time::timeout(Duration::from_secs(60), sleep_until_opt(None)).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn handle_reports_engine_stopped() {
        let (commands, rx) = mpsc::unbounded_channel();
        drop(rx);
        let (_tx, state) = watch::channel(SessionSnapshot::default());
        let session = LiveSession {
            commands,
            state,
            analyser: Arc::new(OnceLock::new()),
        };

        assert!(matches!(session.start().await, Err(Error::EngineStopped)));
        assert!(matches!(session.send_text("hi").await, Err(Error::EngineStopped)));
        session.stop();
        assert!(session.analysis_node().is_none());
        assert_eq!(session.state(), SessionSnapshot::default());
    }
}
