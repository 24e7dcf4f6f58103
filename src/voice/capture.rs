//! Audio capture from microphone
//!
//! The device delivers interleaved float samples on its own audio thread. The
//! processing module downmixes, suppresses noise, resamples to [`SAMPLE_RATE`],
//! levels the gain, chunks into fixed frames and base64-encodes PCM16 right
//! there, then hands each frame off through an unbounded channel. Nothing in
//! the callback blocks.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, Stream, StreamConfig};
use governor::{Quota, RateLimiter, clock::DefaultClock, state::InMemoryState, state::NotKeyed};
use nnnoiseless::DenoiseState;
use rubato::{FftFixedIn, Resampler};
use tokio::sync::mpsc;

use super::pcm;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per outbound frame
pub const DEFAULT_FRAME_SAMPLES: usize = 2048;

/// Minimum spacing between capture starts
pub const START_GUARD_WINDOW: Duration = Duration::from_millis(2500);

/// Version tag of the frame processing module
pub const PROCESSOR_VERSION: &str = "frame-processor/1";

/// Input chunk size fed to the resampler
const RESAMPLE_CHUNK: usize = 1024;

/// Rate the noise suppression model runs at
const DENOISE_RATE: u32 = 48_000;

const I16_SCALE: f32 = 32_767.0;

const AGC_TARGET_RMS: f32 = 0.1;
const AGC_SILENCE_RMS: f32 = 0.005;
const AGC_MIN_GAIN: f32 = 0.25;
const AGC_MAX_GAIN: f32 = 8.0;
const AGC_SMOOTHING: f32 = 0.1;

/// Microphone processing stages
///
/// Requested on acquisition. A device reports the stages it performs itself;
/// the processing module covers noise suppression and gain control for
/// devices that do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl CaptureConstraints {
    /// No processing
    pub const NONE: Self = Self {
        echo_cancellation: false,
        noise_suppression: false,
        auto_gain_control: false,
    };

    /// Stages present in either set
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            echo_cancellation: self.echo_cancellation || other.echo_cancellation,
            noise_suppression: self.noise_suppression || other.noise_suppression,
            auto_gain_control: self.auto_gain_control || other.auto_gain_control,
        }
    }

    /// Stages requested here that `other` does not provide
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self {
            echo_cancellation: self.echo_cancellation && !other.echo_cancellation,
            noise_suppression: self.noise_suppression && !other.noise_suppression,
            auto_gain_control: self.auto_gain_control && !other.auto_gain_control,
        }
    }
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Native format of an acquired input device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Callback receiving interleaved device samples on the audio thread
pub type SampleSink = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Source of microphone devices
pub trait AudioInput {
    /// Acquire exclusive access to a microphone
    ///
    /// # Errors
    ///
    /// Returns [`Error::Permission`] if no device can be acquired
    fn acquire(&self, constraints: &CaptureConstraints) -> Result<Box<dyn InputDevice>>;
}

/// An acquired microphone
pub trait InputDevice {
    /// Native format of the device
    fn format(&self) -> InputFormat;

    /// Processing the device already applies to its samples
    fn native_processing(&self) -> CaptureConstraints {
        CaptureConstraints::NONE
    }

    /// Begin delivering samples to `sink`
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be started
    fn start(&mut self, sink: SampleSink) -> Result<()>;

    /// Stop all tracks and release the device; idempotent
    fn release(&mut self);
}

/// One outbound capture frame
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Float samples at [`SAMPLE_RATE`]
    pub samples: Arc<[f32]>,
    /// Base64 PCM16 payload
    pub data: String,
}

impl AudioFrame {
    /// Build a frame from float samples
    #[must_use]
    pub fn from_samples(samples: Vec<f32>) -> Self {
        let data = pcm::encode_frame(&samples);
        Self {
            samples: samples.into(),
            data,
        }
    }

    /// Wire mime descriptor
    #[must_use]
    pub fn mime_type() -> String {
        pcm::pcm_mime(SAMPLE_RATE)
    }
}

/// Resample a mono stream between two fixed rates
struct RateConverter {
    resampler: FftFixedIn<f32>,
    pending: Vec<f32>,
}

impl RateConverter {
    fn new(from: u32, to: u32) -> Result<Self> {
        let resampler = FftFixedIn::<f32>::new(from as usize, to as usize, RESAMPLE_CHUNK, 2, 1)
            .map_err(|e| Error::ProcessingModule(format!("resampler init failed: {e}")))?;
        Ok(Self {
            resampler,
            pending: Vec::new(),
        })
    }

    fn push(&mut self, input: &[f32]) -> Vec<f32> {
        self.pending.extend_from_slice(input);
        let mut out = Vec::new();
        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match self.resampler.process(&[chunk], None) {
                Ok(resampled) => {
                    if let Some(channel) = resampled.first() {
                        out.extend_from_slice(channel);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "resample failed, dropping chunk");
                    break;
                }
            }
        }
        out
    }
}

/// RNNoise suppression over 48 kHz blocks
struct Denoiser {
    state: Box<DenoiseState<'static>>,
    pending: Vec<f32>,
}

impl Denoiser {
    fn new() -> Self {
        Self {
            state: DenoiseState::new(),
            pending: Vec::new(),
        }
    }

    fn push(&mut self, input: &[f32]) -> Vec<f32> {
        // The model works on 16-bit sample magnitudes
        self.pending.extend(input.iter().map(|s| s * I16_SCALE));
        let mut out = Vec::with_capacity(self.pending.len());
        let mut block = vec![0.0; DenoiseState::FRAME_SIZE];
        while self.pending.len() >= DenoiseState::FRAME_SIZE {
            let frame: Vec<f32> = self.pending.drain(..DenoiseState::FRAME_SIZE).collect();
            self.state.process_frame(&mut block, &frame);
            out.extend(block.iter().map(|s| s / I16_SCALE));
        }
        out
    }
}

/// Slow gain toward a steady speech level
struct GainControl {
    gain: f32,
}

impl GainControl {
    #[allow(clippy::cast_precision_loss)]
    fn apply(&mut self, frame: &mut [f32]) {
        let rms = (frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32).sqrt();
        // Silence keeps the current gain
        if rms > AGC_SILENCE_RMS {
            let target = (AGC_TARGET_RMS / rms).clamp(AGC_MIN_GAIN, AGC_MAX_GAIN);
            self.gain += (target - self.gain) * AGC_SMOOTHING;
        }
        for sample in frame {
            *sample = (*sample * self.gain).clamp(-1.0, 1.0);
        }
    }
}

/// Downmix, clean up, resample and chunk device audio into fixed frames
pub struct FrameProcessor {
    channels: usize,
    frame_samples: usize,
    to_denoise: Option<RateConverter>,
    denoiser: Option<Denoiser>,
    to_output: Option<RateConverter>,
    gain: Option<GainControl>,
    pending_out: Vec<f32>,
}

impl std::fmt::Debug for FrameProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameProcessor")
            .field("channels", &self.channels)
            .field("frame_samples", &self.frame_samples)
            .field("applied", &self.applied())
            .finish_non_exhaustive()
    }
}

impl FrameProcessor {
    /// Load the processing module without cleanup stages
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProcessingModule`] if the format or frame size is unusable
    pub fn load(format: InputFormat, frame_samples: usize) -> Result<Self> {
        Self::load_with(format, frame_samples, CaptureConstraints::NONE)
    }

    /// Load the processing module for a device format
    ///
    /// Noise suppression and gain control run when requested in `stages`.
    /// Echo cancellation needs the playback signal and is left to the device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProcessingModule`] if the format or frame size is unusable
    pub fn load_with(format: InputFormat, frame_samples: usize, stages: CaptureConstraints) -> Result<Self> {
        if frame_samples == 0 {
            return Err(Error::ProcessingModule("frame size must be non-zero".to_string()));
        }
        if format.channels == 0 || format.sample_rate == 0 {
            return Err(Error::ProcessingModule(format!(
                "unsupported input format: {} Hz, {} channels",
                format.sample_rate, format.channels
            )));
        }

        let (to_denoise, denoiser, to_output) = if stages.noise_suppression {
            let to_denoise = if format.sample_rate == DENOISE_RATE {
                None
            } else {
                Some(RateConverter::new(format.sample_rate, DENOISE_RATE)?)
            };
            (
                to_denoise,
                Some(Denoiser::new()),
                Some(RateConverter::new(DENOISE_RATE, SAMPLE_RATE)?),
            )
        } else if format.sample_rate == SAMPLE_RATE {
            (None, None, None)
        } else {
            (None, None, Some(RateConverter::new(format.sample_rate, SAMPLE_RATE)?))
        };

        let processor = Self {
            channels: usize::from(format.channels),
            frame_samples,
            to_denoise,
            denoiser,
            to_output,
            gain: stages.auto_gain_control.then_some(GainControl { gain: 1.0 }),
            pending_out: Vec::new(),
        };

        tracing::debug!(
            version = PROCESSOR_VERSION,
            input_rate = format.sample_rate,
            channels = format.channels,
            frame_samples,
            noise_suppression = processor.denoiser.is_some(),
            auto_gain_control = processor.gain.is_some(),
            "processing module loaded"
        );

        Ok(processor)
    }

    /// Stages this module applies
    #[must_use]
    pub const fn applied(&self) -> CaptureConstraints {
        CaptureConstraints {
            echo_cancellation: false,
            noise_suppression: self.denoiser.is_some(),
            auto_gain_control: self.gain.is_some(),
        }
    }

    /// Consume interleaved samples, returning every completed frame
    #[allow(clippy::cast_precision_loss)]
    pub fn process(&mut self, interleaved: &[f32]) -> Vec<Vec<f32>> {
        let channels = self.channels;
        let mut stream: Vec<f32> = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();

        if let Some(converter) = &mut self.to_denoise {
            stream = converter.push(&stream);
        }
        if let Some(denoiser) = &mut self.denoiser {
            stream = denoiser.push(&stream);
        }
        if let Some(converter) = &mut self.to_output {
            stream = converter.push(&stream);
        }
        self.pending_out.extend(stream);

        let mut frames = Vec::new();
        while self.pending_out.len() >= self.frame_samples {
            let mut frame: Vec<f32> = self.pending_out.drain(..self.frame_samples).collect();
            if let Some(gain) = &mut self.gain {
                gain.apply(&mut frame);
            }
            frames.push(frame);
        }
        frames
    }
}

/// Rejects a start that follows the previous one too closely
pub struct RateGuard {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    window: Duration,
}

impl RateGuard {
    /// Create a guard allowing one start per `window`
    #[must_use]
    pub fn new(window: Duration) -> Self {
        let quota = Quota::with_period(window)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(quota),
            window,
        }
    }

    /// Record a start attempt
    ///
    /// # Errors
    ///
    /// Returns [`Error::RateLimited`] if the previous start began within the window
    pub fn check(&self) -> Result<()> {
        self.limiter.check().map_err(|_| {
            Error::RateLimited(format!(
                "previous start began less than {:.1}s ago",
                self.window.as_secs_f64()
            ))
        })
    }
}

impl std::fmt::Debug for RateGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGuard")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

/// Microphone capture pipeline
pub struct CapturePipeline {
    input: Box<dyn AudioInput>,
    constraints: CaptureConstraints,
    frame_samples: usize,
    guard: RateGuard,
    device: Option<Box<dyn InputDevice>>,
    applied: Option<CaptureConstraints>,
}

impl CapturePipeline {
    /// Create a pipeline over an input source
    #[must_use]
    pub fn new(input: Box<dyn AudioInput>, frame_samples: usize) -> Self {
        Self {
            input,
            constraints: CaptureConstraints::default(),
            frame_samples,
            guard: RateGuard::new(START_GUARD_WINDOW),
            device: None,
            applied: None,
        }
    }

    /// Request different microphone processing on later starts
    #[must_use]
    pub const fn with_constraints(mut self, constraints: CaptureConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Acquire the microphone and start emitting frames into `frames`
    ///
    /// Rate-guard rejection happens before any acquisition. Any later failure
    /// releases whatever was acquired.
    ///
    /// # Errors
    ///
    /// Returns error if rejected by the rate guard, the microphone cannot be
    /// acquired, or the processing module fails to load
    pub fn start(&mut self, frames: mpsc::UnboundedSender<AudioFrame>) -> Result<()> {
        self.guard.check()?;
        self.stop();

        let device = self.device.insert(self.input.acquire(&self.constraints)?);
        let format = device.format();
        let native = device.native_processing();
        let software = self.constraints.without(native);

        let started = FrameProcessor::load_with(format, self.frame_samples, software)
            .and_then(|mut processor| {
                let applied = native.union(processor.applied());
                device.start(Box::new(move |data: &[f32]| {
                    for samples in processor.process(data) {
                        // Receiver gone means the session is shutting down
                        let _ = frames.send(AudioFrame::from_samples(samples));
                    }
                }))?;
                Ok(applied)
            });

        let applied = match started {
            Ok(applied) => applied,
            Err(e) => {
                self.stop();
                return Err(e);
            }
        };

        let missing = self.constraints.without(applied);
        if missing.echo_cancellation {
            tracing::warn!("echo cancellation unavailable on this device, capturing without it");
        }
        self.applied = Some(applied);

        tracing::info!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            echo_cancellation = applied.echo_cancellation,
            noise_suppression = applied.noise_suppression,
            auto_gain_control = applied.auto_gain_control,
            "audio capture started"
        );
        Ok(())
    }

    /// Release the device and processing module; idempotent
    pub fn stop(&mut self) {
        self.applied = None;
        if let Some(mut device) = self.device.take() {
            device.release();
            tracing::debug!("audio capture stopped");
        }
    }

    /// Check if currently capturing
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.device.is_some()
    }

    /// Processing in effect while capturing, by the device or the module
    #[must_use]
    pub const fn applied(&self) -> Option<CaptureConstraints> {
        self.applied
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Default system microphone via cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalInput;

impl AudioInput for CpalInput {
    fn acquire(&self, constraints: &CaptureConstraints) -> Result<Box<dyn InputDevice>> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Permission("no input device available".to_string()))?;

        let configs: Vec<_> = device
            .supported_input_configs()
            .map_err(|e| Error::Permission(e.to_string()))?
            .filter(|c| c.sample_format() == SampleFormat::F32)
            .collect();

        let covers = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        };

        // Prefer mono at the target rate, then any layout at the target rate,
        // then whatever the device offers and resample
        let config: StreamConfig = configs
            .iter()
            .find(|c| c.channels() == 1 && covers(c))
            .or_else(|| configs.iter().find(|c| covers(c)))
            .map(|c| c.clone().with_sample_rate(SampleRate(SAMPLE_RATE)).config())
            .or_else(|| configs.first().map(|c| c.clone().with_max_sample_rate().config()))
            .ok_or_else(|| Error::Permission("no suitable audio config found".to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            echo_cancellation = constraints.echo_cancellation,
            noise_suppression = constraints.noise_suppression,
            auto_gain_control = constraints.auto_gain_control,
            "microphone acquired"
        );

        Ok(Box::new(CpalInputDevice {
            device,
            config,
            stream: None,
        }))
    }
}

struct CpalInputDevice {
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
}

impl InputDevice for CpalInputDevice {
    fn format(&self) -> InputFormat {
        InputFormat {
            sample_rate: self.config.sample_rate.0,
            channels: self.config.channels,
        }
    }

    fn start(&mut self, mut sink: SampleSink) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| sink(data),
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::Permission(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
        }
    }
}
