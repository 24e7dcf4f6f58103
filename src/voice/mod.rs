//! Local audio: microphone capture, speaker playback and speaking state
//!
//! Capture produces 16 kHz PCM16 frames; playback consumes 24 kHz PCM16 from
//! the live endpoint.

mod capture;
pub mod pcm;
mod playback;
mod recorder;
mod speaking;

pub use capture::{
    AudioFrame, AudioInput, CaptureConstraints, CapturePipeline, CpalInput, DEFAULT_FRAME_SAMPLES,
    FrameProcessor, InputDevice, InputFormat, PROCESSOR_VERSION, RateGuard, SAMPLE_RATE,
    START_GUARD_WINDOW, SampleSink,
};
pub use playback::{
    ANALYSER_WINDOW, AnalysisNode, CpalOutput, PLAYBACK_SAMPLE_RATE, PlaybackBackend,
    PlaybackDevice, PlaybackScheduler, SCHEDULE_EPSILON, ScheduledBuffer,
};
pub use recorder::WavRecorder;
pub use speaking::{DebounceTimer, SPEAKING_TAIL, SpeakingDetector};
