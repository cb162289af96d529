use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vigil::audio::{CaptureHandle, CaptureSource, CpalSink, SAMPLE_RATE, samples_to_wav};
use vigil::playback::{AudioClip, AudioSink, PlaybackSequencer};
use vigil::remote::HttpVoiceClient;
use vigil::speech::{EngineStreamHook, HttpSpeechEngine, Transcriber};
use vigil::spotter::{KeywordSpotter, SpotterControl, SpotterStreamHook, WakeVerifier};
use vigil::supervisor::{LivenessSupervisor, NullInhibitor, SleepInhibitor};
use vigil::{Config, MicArbiter, MicOwner, SessionCoordinator, registry};

/// Vigil - Always-listening voice assistant client
#[derive(Parser)]
#[command(name = "vigil", version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    /// Assistant server address (overrides config)
    #[arg(long, env = "VIGIL_SERVER")]
    server: Option<String>,

    /// Disable wake phrase spotting (manual turns only)
    #[arg(long, env = "VIGIL_NO_WAKE_WORD")]
    no_wake_word: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,vigil=info",
        1 => "info,vigil=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestSpeaker => test_speaker().await,
        };
    }

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(server) = cli.server {
        config.server_address = server;
    }
    if cli.no_wake_word {
        config.wake_word_enabled = false;
    }
    config.validate()?;
    tracing::debug!(server = %config.server_address, "loaded configuration");

    let capture: Arc<dyn CaptureSource> = Arc::new(CaptureHandle::spawn()?);

    let (events_tx, events_rx) = SessionCoordinator::event_channel();

    let transcriber = Arc::new(Transcriber::new(
        config.stt_url()?,
        config.stt_model.clone(),
        config.api_key.clone(),
    ));

    let arbiter = Arc::new(MicArbiter::new());

    let spotter = Arc::new(KeywordSpotter::new(
        Arc::clone(&capture),
        Arc::clone(&arbiter),
        events_tx.clone(),
        &config.wake_phrase,
        config.spotting_sensitivity,
        Some(Arc::clone(&transcriber) as Arc<dyn WakeVerifier>),
    ));
    let engine = Arc::new(HttpSpeechEngine::new(
        Arc::clone(&capture),
        events_tx,
        Arc::clone(&transcriber),
    ));

    arbiter.register(
        MicOwner::KeywordSpotter,
        Arc::new(SpotterStreamHook(Arc::clone(&spotter) as Arc<dyn SpotterControl>)),
    );
    arbiter.register(
        MicOwner::Dictation,
        Arc::new(EngineStreamHook(Arc::clone(&engine) as _)),
    );

    let sequencer = PlaybackSequencer::spawn(Arc::new(CpalSink::new()));
    let backend = Arc::new(HttpVoiceClient::new(config.server_url()?));

    let inhibitor: Arc<dyn SleepInhibitor> = Arc::new(NullInhibitor);
    let supervisor = LivenessSupervisor::spawn(
        Arc::clone(&spotter) as Arc<dyn SpotterControl>,
        inhibitor,
    );

    let wake_phrase = config.wake_phrase.clone();
    let wake_word_enabled = config.wake_word_enabled;

    let (coordinator, handle) = SessionCoordinator::new(
        config,
        arbiter,
        spotter,
        engine,
        backend,
        sequencer,
        supervisor,
        events_rx,
    );

    registry::global().install(handle.clone())?;

    // Log session events for operators watching the journal
    let mut session_events = handle.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = session_events.recv().await {
            tracing::info!(%event, "session");
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            handle.shutdown().await;
        }
    });

    if wake_word_enabled {
        tracing::info!("vigil ready - say \"{wake_phrase}\"");
    } else {
        tracing::info!("vigil ready (manual turns only, wake word disabled)");
    }

    coordinator.run().await?;

    Ok(())
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let capture = CaptureHandle::spawn()?;
    capture.start()?;

    println!("Sample rate: {SAMPLE_RATE} Hz");
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = capture.take_buffer();
        let energy = calculate_rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    capture.stop()?;

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let frequency = 440.0_f32;
    #[allow(clippy::cast_possible_truncation)]
    let num_samples = (SAMPLE_RATE * 2) as usize;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    let wav = samples_to_wav(&samples, SAMPLE_RATE)?;
    println!("Playing {} samples at {SAMPLE_RATE} Hz...", samples.len());

    let sink = CpalSink::new();
    sink.play(AudioClip { bytes: wav }).await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}
