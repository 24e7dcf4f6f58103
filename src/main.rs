use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use live_session::live::FLUSH_THRESHOLD;
use live_session::voice::{
    AnalysisNode, CapturePipeline, CpalInput, CpalOutput, PLAYBACK_SAMPLE_RATE, PlaybackScheduler,
    SAMPLE_RATE, pcm,
};
use live_session::{Config, ConnectionStatus, LiveSession, Viewport};

/// Live Session - talk to a live AI endpoint from the terminal
#[derive(Parser)]
#[command(name = "live-session", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a live voice session (default)
    Run {
        /// Text sent once the session is connected
        #[arg(long)]
        prompt: Option<String>,

        /// Viewport reported to the model, as WIDTHxHEIGHT
        #[arg(long, value_parser = parse_viewport)]
        viewport: Option<Viewport>,

        /// Record assistant audio to a WAV file
        #[arg(long, env = "LIVE_RECORD")]
        record: Option<PathBuf>,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output through the playback scheduler
    TestSpeaker,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,live_session=info",
        1 => "info,live_session=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let local = tokio::task::LocalSet::new();
    match local.run_until(run(cli)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Command::Run {
        prompt: None,
        viewport: None,
        record: None,
    }) {
        Command::Run {
            prompt,
            viewport,
            record,
        } => run_session(prompt, viewport, record).await,
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
    }
}

fn parse_viewport(s: &str) -> Result<Viewport, String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
    Ok(Viewport {
        width: w.trim().parse().map_err(|e| format!("width: {e}"))?,
        height: h.trim().parse().map_err(|e| format!("height: {e}"))?,
    })
}

/// Run a session until Ctrl-C or the session ends
#[allow(clippy::future_not_send)]
async fn run_session(
    prompt: Option<String>,
    viewport: Option<Viewport>,
    record: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    let mut builder = LiveSession::builder(config);
    if let Some(path) = record {
        builder = builder.record_to(path);
    }
    let session = builder.spawn_local()?;

    session.register_tool_call_listener(|name, args| {
        tracing::info!(name, %args, "tool call");
    });
    session.register_transcript_listener(|text| {
        println!("assistant: {text}");
    });

    session.start().await?;
    tracing::info!("live session started - speak into your microphone (Ctrl-C to stop)");

    let mut state = session.subscribe();
    let mut prompt = prompt;
    let mut connected_once = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = state.borrow_and_update().clone();
                tracing::debug!(?snapshot, "session state");

                if snapshot.connection_status == ConnectionStatus::Connected && !connected_once {
                    connected_once = true;
                    if let Some(viewport) = viewport {
                        session.send_viewport(viewport);
                    }
                    if let Some(text) = prompt.take() {
                        session.send_text(text).await?;
                    }
                }

                if let Some(error) = &snapshot.error {
                    anyhow::bail!("session failed: {error}");
                }
                if !snapshot.is_streaming {
                    tracing::info!("session ended");
                    break;
                }
            }
        }
    }

    session.stop();
    // Let the engine release devices before the runtime shuts down
    tokio::task::yield_now().await;
    Ok(())
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let config = Config::load()?;
    let mut capture = CapturePipeline::new(Box::new(CpalInput), config.capture.frame_samples)
        .with_constraints(config.capture.processing);
    let (tx, mut rx) = mpsc::unbounded_channel();
    capture.start(tx)?;

    println!("Sample rate: {SAMPLE_RATE} Hz");
    if let Some(applied) = capture.applied() {
        println!(
            "Echo cancellation: {} | Noise suppression: {} | Gain control: {}",
            on_off(applied.echo_cancellation),
            on_off(applied.noise_suppression),
            on_off(applied.auto_gain_control)
        );
    }
    println!("---");

    let meter = AnalysisNode::new(usize::try_from(SAMPLE_RATE).unwrap_or(16_000));
    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut frames = 0usize;
        while let Ok(frame) = rx.try_recv() {
            meter.write(&frame.samples);
            frames += 1;
        }
        let energy = meter.rms();
        let peak = meter.peak();

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let bar: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] frames: {frames:3} | RMS: {energy:.4} | Peak: {peak:.4} | [{bar}]",
            i + 1
        );
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

const fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}

/// Test speaker output with a sine wave split into irregular batches
#[allow(clippy::future_not_send)]
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear an unbroken 440Hz tone for 2 seconds\n");

    let frequency = 440.0_f32;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..PLAYBACK_SAMPLE_RATE * 2)
        .map(|i| {
            let t = i as f32 / PLAYBACK_SAMPLE_RATE as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    // 100 ms fragments, flushed the way inbound audio is
    let fragments: Vec<Vec<u8>> = samples
        .chunks(PLAYBACK_SAMPLE_RATE as usize / 10)
        .map(pcm::encode_pcm16)
        .collect();

    let mut playback = PlaybackScheduler::new(Box::new(CpalOutput));
    for batch in fragments.chunks(FLUSH_THRESHOLD) {
        let scheduled = playback.schedule(batch)?;
        println!(
            "scheduled {:.2}s at {:.3}s",
            scheduled.duration, scheduled.start_time
        );
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    tokio::time::sleep(playback.remaining()).await;
    playback.teardown();

    println!("\n---");
    println!("If you heard the tone without clicks or gaps, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}
