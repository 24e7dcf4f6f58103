//! Gapless audio playback to speakers
//!
//! Flushed batches arrive at irregular intervals and sizes. Each one is decoded
//! and placed on a running timeline so buffers never overlap and never leave
//! gaps: `start = max(next_playback_time, now + SCHEDULE_EPSILON)`, after which
//! `next_playback_time = start + duration`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream};

use super::pcm;
use crate::{Error, Result};

/// Sample rate of inbound assistant audio
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Lead time added to the device clock when the timeline has fallen behind
pub const SCHEDULE_EPSILON: f64 = 0.01;

/// Samples retained by the analysis node
pub const ANALYSER_WINDOW: usize = 2048;

/// Tap on everything the playback device renders
///
/// One node exists per scheduler and is reattached whenever the playback
/// device is recreated, so visualizers can hold on to it across interruptions.
#[derive(Clone)]
pub struct AnalysisNode {
    window: Arc<Mutex<VecDeque<f32>>>,
    size: usize,
}

impl AnalysisNode {
    /// Create a node retaining the last `size` samples
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            window: Arc::new(Mutex::new(VecDeque::with_capacity(size))),
            size,
        }
    }

    /// Feed rendered samples through the node
    pub fn write(&self, samples: &[f32]) {
        let Ok(mut window) = self.window.lock() else {
            return;
        };
        let tail = &samples[samples.len().saturating_sub(self.size)..];
        let overflow = (window.len() + tail.len()).saturating_sub(self.size);
        let len = window.len();
        window.drain(..overflow.min(len));
        window.extend(tail.iter().copied());
    }

    /// Most recent time-domain samples, oldest first
    #[must_use]
    pub fn time_domain_data(&self) -> Vec<f32> {
        self.window
            .lock()
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default()
    }

    /// RMS level of the current window
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rms(&self) -> f32 {
        let Ok(window) = self.window.lock() else {
            return 0.0;
        };
        if window.is_empty() {
            return 0.0;
        }
        let sum_squares: f32 = window.iter().map(|s| s * s).sum();
        (sum_squares / window.len() as f32).sqrt()
    }

    /// Peak absolute level of the current window
    #[must_use]
    pub fn peak(&self) -> f32 {
        self.window
            .lock()
            .map(|w| w.iter().map(|s| s.abs()).fold(0.0f32, f32::max))
            .unwrap_or(0.0)
    }
}

impl std::fmt::Debug for AnalysisNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisNode")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Source of playback devices
pub trait PlaybackBackend {
    /// Open a playback context at `sample_rate`, rendering through `analyser`
    ///
    /// # Errors
    ///
    /// Returns error if no output device can be opened
    fn open(&self, sample_rate: u32, analyser: AnalysisNode) -> Result<Box<dyn PlaybackDevice>>;
}

/// An open playback context with its own monotonic clock
pub trait PlaybackDevice {
    /// Seconds of audio rendered since the context opened
    fn current_time(&self) -> f64;

    /// Queue `samples` to begin at `start_time` on the context clock
    ///
    /// # Errors
    ///
    /// Returns error if the device rejects the buffer
    fn schedule(&mut self, samples: Arc<[f32]>, start_time: f64) -> Result<()>;

    /// Stop output and release the context; idempotent
    fn close(&mut self);
}

/// Placement of one scheduled batch on the timeline
#[derive(Debug, Clone)]
pub struct ScheduledBuffer {
    /// Decoded samples at [`PLAYBACK_SAMPLE_RATE`]
    pub samples: Arc<[f32]>,
    /// Start on the device clock
    pub start_time: f64,
    /// Length in seconds
    pub duration: f64,
    /// Device clock when scheduled
    pub clock_time: f64,
}

impl ScheduledBuffer {
    /// End on the device clock
    #[must_use]
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }

    /// Time until this buffer finishes, measured from scheduling
    #[must_use]
    pub fn remaining(&self) -> Duration {
        Duration::from_secs_f64((self.end_time() - self.clock_time).max(0.0))
    }
}

/// Schedules decoded batches for gapless sequential output
pub struct PlaybackScheduler {
    backend: Box<dyn PlaybackBackend>,
    device: Option<Box<dyn PlaybackDevice>>,
    analyser: Arc<OnceLock<AnalysisNode>>,
    next_playback_time: f64,
}

impl PlaybackScheduler {
    /// Create a scheduler; no device is opened until the first batch
    #[must_use]
    pub fn new(backend: Box<dyn PlaybackBackend>) -> Self {
        Self::with_analyser(backend, Arc::new(OnceLock::new()))
    }

    /// Create a scheduler publishing its analysis node into `analyser`
    #[must_use]
    pub fn with_analyser(
        backend: Box<dyn PlaybackBackend>,
        analyser: Arc<OnceLock<AnalysisNode>>,
    ) -> Self {
        Self {
            backend,
            device: None,
            analyser,
            next_playback_time: 0.0,
        }
    }

    /// Decode a batch of PCM16 fragments and place it on the timeline
    ///
    /// # Errors
    ///
    /// Returns error if the batch cannot be decoded or the device cannot be
    /// opened; the timeline is unchanged in that case
    #[allow(clippy::cast_precision_loss)]
    pub fn schedule(&mut self, fragments: &[Vec<u8>]) -> Result<ScheduledBuffer> {
        let samples: Arc<[f32]> = pcm::decode_pcm16(&fragments.concat())?.into();
        if samples.is_empty() {
            return Err(Error::Decode("empty audio batch".to_string()));
        }

        if self.device.is_none() {
            let analyser = self
                .analyser
                .get_or_init(|| AnalysisNode::new(ANALYSER_WINDOW))
                .clone();
            let device = self.backend.open(PLAYBACK_SAMPLE_RATE, analyser)?;
            self.next_playback_time = device.current_time();
            self.device = Some(device);
            tracing::debug!(sample_rate = PLAYBACK_SAMPLE_RATE, "playback context created");
        }
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| Error::Audio("playback context unavailable".to_string()))?;

        let clock_time = device.current_time();
        let start_time = self.next_playback_time.max(clock_time + SCHEDULE_EPSILON);
        let duration = samples.len() as f64 / f64::from(PLAYBACK_SAMPLE_RATE);

        device.schedule(Arc::clone(&samples), start_time)?;
        self.next_playback_time = start_time + duration;

        tracing::trace!(
            samples = samples.len(),
            start_time,
            duration,
            "scheduled playback buffer"
        );

        Ok(ScheduledBuffer {
            samples,
            start_time,
            duration,
            clock_time,
        })
    }

    /// Tear down the playback context, discarding anything queued
    ///
    /// The timeline resets to the clock at teardown; the next batch opens a
    /// fresh context.
    pub fn teardown(&mut self) {
        if let Some(mut device) = self.device.take() {
            self.next_playback_time = device.current_time();
            device.close();
            tracing::debug!("playback context closed");
        }
    }

    /// Time until the last scheduled buffer ends
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.device.as_ref().map_or(Duration::ZERO, |d| {
            Duration::from_secs_f64((self.next_playback_time - d.current_time()).max(0.0))
        })
    }

    /// Earliest time the next buffer may start
    #[must_use]
    pub const fn next_playback_time(&self) -> f64 {
        self.next_playback_time
    }

    /// Whether a playback context is open
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.device.is_some()
    }

    /// The analysis node, once a context has been created
    #[must_use]
    pub fn analysis_node(&self) -> Option<AnalysisNode> {
        self.analyser.get().cloned()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Default system speakers via cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalOutput;

impl PlaybackBackend for CpalOutput {
    fn open(&self, sample_rate: u32, analyser: AnalysisNode) -> Result<Box<dyn PlaybackDevice>> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let covers = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
            c.channels() == channels
                && c.sample_format() == SampleFormat::F32
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        };

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| covers(c, 1))
            .or_else(|| {
                // Fallback: try stereo
                device.supported_output_configs().ok()?.find(|c| covers(c, 2))
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(sample_rate))
            .config();
        let channels = usize::from(config.channels);

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            "audio playback initialized"
        );

        let mixer = Arc::new(Mutex::new(Mixer::default()));
        let render = Arc::clone(&mixer);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let Ok(mut mixer) = render.lock() else {
                        data.fill(0.0);
                        return;
                    };
                    mixer.render(data, channels);
                    analyser.write(&mixer.rendered);
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        Ok(Box::new(CpalOutputDevice {
            stream: Some(stream),
            mixer,
            sample_rate,
        }))
    }
}

struct CpalOutputDevice {
    stream: Option<Stream>,
    mixer: Arc<Mutex<Mixer>>,
    sample_rate: u32,
}

impl PlaybackDevice for CpalOutputDevice {
    #[allow(clippy::cast_precision_loss)]
    fn current_time(&self) -> f64 {
        self.mixer
            .lock()
            .map(|m| m.position as f64 / f64::from(self.sample_rate))
            .unwrap_or(0.0)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn schedule(&mut self, samples: Arc<[f32]>, start_time: f64) -> Result<()> {
        let start_frame = (start_time * f64::from(self.sample_rate)).round().max(0.0) as u64;
        self.mixer
            .lock()
            .map_err(|_| Error::Audio("playback mixer poisoned".to_string()))?
            .push(Voice {
                start_frame,
                samples,
            });
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
        }
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.queue.clear();
        }
    }
}

/// A buffer placed at an absolute frame position
struct Voice {
    start_frame: u64,
    samples: Arc<[f32]>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Renders queued voices against a frame counter that doubles as the clock
#[derive(Default)]
struct Mixer {
    position: u64,
    queue: VecDeque<Voice>,
    rendered: Vec<f32>,
}

impl Mixer {
    fn push(&mut self, voice: Voice) {
        let at = self
            .queue
            .partition_point(|v| v.start_frame <= voice.start_frame);
        self.queue.insert(at, voice);
    }

    fn render(&mut self, out: &mut [f32], channels: usize) {
        self.rendered.clear();
        for frame in out.chunks_mut(channels.max(1)) {
            let sample = self.next_sample();
            frame.fill(sample);
            self.rendered.push(sample);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn next_sample(&mut self) -> f32 {
        let pos = self.position;
        self.position += 1;

        while self.queue.front().is_some_and(|v| pos >= v.end_frame()) {
            self.queue.pop_front();
        }

        match self.queue.front() {
            Some(v) if pos >= v.start_frame => v.samples[(pos - v.start_frame) as usize],
            _ => 0.0,
        }
    }
}
