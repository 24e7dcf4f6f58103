//! Shared test utilities
//!
//! In-memory stand-ins for the microphone, speakers, credential endpoint and
//! live transport. Each fake hands out a cloneable probe for inspection.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::Instant;

use base64::Engine as _;
use live_session::live::protocol::{ClientMessage, ServerMessage};
use live_session::live::{
    ConnectRequest, Credential, CredentialKind, CredentialProvider, EventSender, LiveSession,
    Transport, TransportEvent, TransportSink,
};
use live_session::voice::{
    AnalysisNode, AudioInput, CaptureConstraints, InputDevice, InputFormat, PLAYBACK_SAMPLE_RATE,
    PlaybackBackend, PlaybackDevice, SAMPLE_RATE, SampleSink,
};
use live_session::{Config, Error, Result};

/// Frame size used by integration tests (10 ms at 16 kHz)
pub const TEST_FRAME_SAMPLES: usize = 160;

/// Let the session engine drain everything queued for it
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

/// Configuration with small frames, no real credentials and frames passed
/// through unprocessed
#[must_use]
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.capture.frame_samples = TEST_FRAME_SAMPLES;
    config.capture.processing = CaptureConstraints::NONE;
    config
}

// -- Microphone ---------------------------------------------------------------

#[derive(Default)]
struct MicState {
    sink: Option<SampleSink>,
    requested: Option<CaptureConstraints>,
    acquired: usize,
    released: usize,
}

/// Microphone fed by the test
#[derive(Clone, Default)]
pub struct FakeMic {
    state: Arc<Mutex<MicState>>,
}

impl FakeMic {
    /// Deliver samples as if from the audio thread; `false` if not capturing
    pub fn push(&self, samples: &[f32]) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.sink.as_mut() {
            Some(sink) => {
                sink(samples);
                true
            }
            None => false,
        }
    }

    pub fn acquired(&self) -> usize {
        self.state.lock().unwrap().acquired
    }

    pub fn released(&self) -> usize {
        self.state.lock().unwrap().released
    }

    pub fn is_capturing(&self) -> bool {
        self.state.lock().unwrap().sink.is_some()
    }

    /// Processing requested on the latest acquisition
    pub fn requested(&self) -> Option<CaptureConstraints> {
        self.state.lock().unwrap().requested
    }
}

impl AudioInput for FakeMic {
    fn acquire(&self, constraints: &CaptureConstraints) -> Result<Box<dyn InputDevice>> {
        let mut state = self.state.lock().unwrap();
        state.requested = Some(*constraints);
        state.acquired += 1;
        Ok(Box::new(FakeMicDevice {
            state: Arc::clone(&self.state),
            released: false,
        }))
    }
}

struct FakeMicDevice {
    state: Arc<Mutex<MicState>>,
    released: bool,
}

impl InputDevice for FakeMicDevice {
    fn format(&self) -> InputFormat {
        InputFormat {
            sample_rate: SAMPLE_RATE,
            channels: 1,
        }
    }

    fn start(&mut self, sink: SampleSink) -> Result<()> {
        self.state.lock().unwrap().sink = Some(sink);
        Ok(())
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            let mut state = self.state.lock().unwrap();
            state.sink = None;
            state.released += 1;
        }
    }
}

// -- Speakers -----------------------------------------------------------------

#[derive(Default)]
struct SpeakerState {
    opened: usize,
    closed: usize,
    /// (start time, sample count) per scheduled buffer
    scheduled: Vec<(f64, usize)>,
}

/// Speakers whose clock follows tokio time
#[derive(Clone, Default)]
pub struct FakeSpeaker {
    state: Arc<Mutex<SpeakerState>>,
}

impl FakeSpeaker {
    pub fn scheduled(&self) -> Vec<(f64, usize)> {
        self.state.lock().unwrap().scheduled.clone()
    }

    pub fn opened(&self) -> usize {
        self.state.lock().unwrap().opened
    }

    pub fn closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }
}

impl PlaybackBackend for FakeSpeaker {
    fn open(&self, sample_rate: u32, _analyser: AnalysisNode) -> Result<Box<dyn PlaybackDevice>> {
        assert_eq!(sample_rate, PLAYBACK_SAMPLE_RATE);
        self.state.lock().unwrap().opened += 1;
        Ok(Box::new(FakeSpeakerDevice {
            state: Arc::clone(&self.state),
            opened_at: Instant::now(),
        }))
    }
}

struct FakeSpeakerDevice {
    state: Arc<Mutex<SpeakerState>>,
    opened_at: Instant,
}

impl PlaybackDevice for FakeSpeakerDevice {
    fn current_time(&self) -> f64 {
        self.opened_at.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, samples: Arc<[f32]>, start_time: f64) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .scheduled
            .push((start_time, samples.len()));
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closed += 1;
    }
}

// -- Credentials --------------------------------------------------------------

/// Credential endpoint that counts fetches
#[derive(Clone, Default)]
pub struct FakeCredentials {
    fetches: Arc<Mutex<usize>>,
    fail: bool,
}

impl FakeCredentials {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn fetches(&self) -> usize {
        *self.fetches.lock().unwrap()
    }
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn fetch(&self) -> Result<Credential> {
        *self.fetches.lock().unwrap() += 1;
        if self.fail {
            return Err(Error::Credential("token endpoint returned 500".into()));
        }
        Ok(Credential::new("auth_tokens/test", CredentialKind::Ephemeral))
    }
}

// -- Transport ----------------------------------------------------------------

#[derive(Default)]
struct TransportState {
    /// Resumption handle attached to each open, in order
    opens: Vec<Option<String>>,
    senders: Vec<EventSender>,
    sent: Vec<Value>,
    closes: usize,
    /// Never answer setup
    silent: bool,
}

/// Live endpoint driven by the test
///
/// Every open is acknowledged immediately with setup-complete, unless the
/// transport was built with [`FakeTransport::silent`].
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
}

impl FakeTransport {
    /// Accepts connections but never acknowledges setup
    pub fn silent() -> Self {
        let transport = Self::default();
        transport.state.lock().unwrap().silent = true;
        transport
    }

    /// Resumption handles attached to each open
    pub fn opens(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().opens.clone()
    }

    /// Everything sent after setup, as JSON
    pub fn sent(&self) -> Vec<Value> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Sent messages carrying realtime audio
    pub fn sent_audio(&self) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|m| m["realtimeInput"]["audio"].is_object())
            .collect()
    }

    /// Sent tool acknowledgements
    pub fn sent_tool_responses(&self) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|m| m["toolResponse"].is_object())
            .collect()
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    fn emit(&self, event: TransportEvent) {
        let state = self.state.lock().unwrap();
        let sender = state.senders.last().expect("transport never opened");
        sender.send(event);
    }

    /// Deliver a server message on the latest session
    pub fn push(&self, message: Value) {
        let message: ServerMessage = serde_json::from_value(message).unwrap();
        self.emit(TransportEvent::Message(message));
    }

    /// Close the latest session from the remote end
    pub fn close_remote(&self, reason: Option<&str>) {
        self.emit(TransportEvent::Closed(reason.map(ToString::to_string)));
    }

    /// Fail the latest session
    pub fn fail(&self, message: &str) {
        self.emit(TransportEvent::Error(message.to_string()));
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(
        &self,
        request: ConnectRequest,
        events: EventSender,
    ) -> Result<Box<dyn TransportSink>> {
        let mut state = self.state.lock().unwrap();
        state.opens.push(request.setup.session_resumption.handle);
        if !state.silent {
            events.send(TransportEvent::Open);
        }
        state.senders.push(events);
        Ok(Box::new(FakeSink {
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeSink {
    state: Arc<Mutex<TransportState>>,
}

impl TransportSink for FakeSink {
    fn send(&self, message: ClientMessage) -> Result<()> {
        let value = serde_json::to_value(&message)?;
        self.state.lock().unwrap().sent.push(value);
        Ok(())
    }

    fn close(&self) {
        self.state.lock().unwrap().closes += 1;
    }
}

// -- Harness ------------------------------------------------------------------

/// A session wired to fakes
pub struct Harness {
    pub session: LiveSession,
    pub mic: FakeMic,
    pub speaker: FakeSpeaker,
    pub credentials: FakeCredentials,
    pub transport: FakeTransport,
}

impl Harness {
    /// Spawn a session on the current local set
    pub fn spawn() -> Self {
        Self::spawn_with(FakeCredentials::default())
    }

    pub fn spawn_with(credentials: FakeCredentials) -> Self {
        Self::spawn_parts(credentials, FakeTransport::default())
    }

    pub fn spawn_parts(credentials: FakeCredentials, transport: FakeTransport) -> Self {
        let mic = FakeMic::default();
        let speaker = FakeSpeaker::default();

        let session = LiveSession::builder(test_config())
            .credentials(Box::new(credentials.clone()))
            .transport(Box::new(transport.clone()))
            .audio_input(Box::new(mic.clone()))
            .audio_output(Box::new(speaker.clone()))
            .spawn_local()
            .unwrap();

        Self {
            session,
            mic,
            speaker,
            credentials,
            transport,
        }
    }

    /// Start and let the connection open
    pub async fn start(&self) {
        self.session.start().await.unwrap();
        settle().await;
    }
}

/// PCM16 bytes for `duration` of a quiet tone at the playback rate
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn tone_bytes(duration: Duration) -> Vec<u8> {
    let count = (duration.as_secs_f64() * f64::from(PLAYBACK_SAMPLE_RATE)) as usize;
    let samples: Vec<f32> = (0..count)
        .map(|i| (i as f32 * 0.05).sin() * 0.2)
        .collect();
    live_session::voice::pcm::encode_pcm16(&samples)
}

/// A server message carrying one inline audio part
pub fn audio_message(bytes: &[u8]) -> Value {
    json!({
        "serverContent": {
            "modelTurn": {
                "parts": [{
                    "inlineData": {
                        "mimeType": "audio/pcm;rate=24000",
                        "data": base64::engine::general_purpose::STANDARD.encode(bytes),
                    }
                }]
            }
        }
    })
}

pub fn turn_complete() -> Value {
    json!({ "serverContent": { "turnComplete": true } })
}

pub fn interrupted() -> Value {
    json!({ "serverContent": { "interrupted": true } })
}

pub fn resumption_update(handle: &str) -> Value {
    json!({ "sessionResumptionUpdate": { "resumable": true, "newHandle": handle } })
}
