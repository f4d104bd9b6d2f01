use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

use beacon_live::config::file::config_file_path;
use beacon_live::voice::{
    CaptureSettings, CpalInput, CpalOutput, InputDevice, OutputDevice, PlaybackScheduler,
    WireFormat, f32_to_i16, rms, samples_to_wav,
};
use beacon_live::{Backends, Config, Session, SessionState, Speaker};

/// Beacon Live - Real-time voice conversations with an AI assistant
#[derive(Parser)]
#[command(name = "beacon-live", version, about)]
struct Cli {
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

        /// Write the captured audio to a 16-bit WAV file
        #[arg(long)]
        record: Option<PathBuf>,
    },
    /// Test speaker output through the playback scheduler
    TestSpeaker,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_live=info",
        1 => "info,beacon_live=debug",
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
            Command::TestMic { duration, record } => test_mic(duration, record).await,
            Command::TestSpeaker => test_speaker().await,
            Command::Config => show_config(),
        };
    }

    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    converse(config).await
}

/// Run one conversation until Ctrl-C, a remote close, or a fatal error
async fn converse(config: Config) -> anyhow::Result<()> {
    let backends = Backends::system(&config);
    let session = Session::spawn(config, backends);
    let mut status = session.subscribe();
    let mut transcripts = session.transcripts();

    session.start().await?;
    println!("Listening... press Ctrl-C to stop.\n");

    let mut was_connected = false;
    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                break Ok(());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let current = status.borrow_and_update().clone();
                match current.state {
                    SessionState::Connected if !was_connected => {
                        was_connected = true;
                        println!("[connected]");
                    }
                    SessionState::Error if current.reconnecting => {
                        println!("[reconnecting]");
                    }
                    SessionState::Error => {
                        let message = current
                            .last_error
                            .unwrap_or_else(|| "session failed".to_string());
                        break Err(anyhow::anyhow!(message));
                    }
                    SessionState::Disconnected if was_connected => {
                        println!("[conversation ended]");
                        break Ok(());
                    }
                    _ => {}
                }
            }
            entry = transcripts.recv() => match entry {
                Ok(entry) => {
                    let who = match entry.speaker {
                        Speaker::User => "you",
                        Speaker::Assistant => "assistant",
                    };
                    println!("{who}: {}", entry.text);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "transcript output lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
        }
    };

    session.stop().await?;
    session.shutdown().await;
    outcome
}

async fn test_mic(duration: u64, record: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let config = Config::load()?;
    let settings = CaptureSettings::from_config(&config.audio);

    let window = Arc::new(Mutex::new(Vec::<f32>::new()));
    let recording = Arc::new(Mutex::new(Vec::<f32>::new()));
    let keep_recording = record.is_some();

    let sink_window = Arc::clone(&window);
    let sink_recording = Arc::clone(&recording);
    let mut stream = CpalInput.open(
        &settings,
        Box::new(move |samples| {
            if let Ok(mut w) = sink_window.lock() {
                w.extend_from_slice(samples);
            }
            if keep_recording && let Ok(mut r) = sink_recording.lock() {
                r.extend_from_slice(samples);
            }
        }),
    )?;

    println!("Sample rate: {} Hz", settings.sample_rate);
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = window
            .lock()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default();
        let energy = rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        let speaking = if energy > config.audio.speech_threshold {
            "speech"
        } else {
            "quiet"
        };
        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | {:6} | [{}]",
            i + 1,
            energy,
            peak,
            speaking,
            meter
        );
    }

    stream.close();

    if let Some(path) = record {
        let samples = recording
            .lock()
            .map(|mut r| std::mem::take(&mut *r))
            .unwrap_or_default();
        let wav = samples_to_wav(&samples, settings.sample_rate)?;
        std::fs::write(&path, wav)?;
        println!("\nRecorded {} samples to {}", samples.len(), path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Play a tone as back-to-back fragments, the way response audio arrives
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a steady 440Hz tone for 2 seconds\n");

    let config = Config::load()?;
    let format = WireFormat::mono(config.audio.output_sample_rate);

    let (finished_tx, mut finished_rx) = mpsc::unbounded_channel();
    let output = CpalOutput.open(
        format,
        Arc::new(move |unit| {
            let _ = finished_tx.send(unit);
        }),
    )?;
    let mut scheduler = PlaybackScheduler::new(output, format);

    let frequency = 440.0_f32;
    #[allow(clippy::cast_precision_loss)]
    let rate = format.sample_rate as f32;
    let fragment_len = (format.sample_rate / 5) as usize;

    // Ten 200ms fragments; any gap between them is audible as a click
    for fragment in 0..10 {
        #[allow(clippy::cast_precision_loss)]
        let bytes: Vec<u8> = (0..fragment_len)
            .map(|i| {
                let t = (fragment * fragment_len + i) as f32 / rate;
                f32_to_i16((2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3)
            })
            .flat_map(i16::to_le_bytes)
            .collect();
        scheduler.enqueue(&bytes)?;
    }

    println!(
        "Scheduled {} units ending at frame {}",
        scheduler.active_units().len(),
        scheduler.next_start()
    );

    while scheduler.is_playing() {
        match tokio::time::timeout(Duration::from_secs(5), finished_rx.recv()).await {
            Ok(Some(unit)) => {
                scheduler.complete(unit);
            }
            Ok(None) | Err(_) => break,
        }
    }
    scheduler.close();

    println!("Done! Did you hear the tone without clicks?");
    Ok(())
}

fn show_config() -> anyhow::Result<()> {
    let config = Config::load()?;

    match config_file_path() {
        Some(path) if path.exists() => println!("# config file: {}", path.display()),
        Some(path) => println!("# config file: {} (not present)", path.display()),
        None => println!("# config file: unavailable"),
    }

    let live = &config.live;
    println!("[live]");
    println!("url = {:?}", live.url);
    println!(
        "api_key = {}",
        if live.api_key.is_some() {
            "\"<redacted>\""
        } else {
            "<unset>"
        }
    );
    println!("model = {:?}", live.model);
    println!("voice = {:?}", live.voice);
    println!("system_instruction = {:?}", live.system_instruction);
    println!("input_transcription = {}", live.input_transcription);
    println!("output_transcription = {}", live.output_transcription);
    println!("outbound_frames = {}", live.outbound_frames);

    let audio = &config.audio;
    println!("\n[audio]");
    println!("input_sample_rate = {}", audio.input_sample_rate);
    println!("output_sample_rate = {}", audio.output_sample_rate);
    println!("frame_size = {}", audio.frame_size);
    println!("speech_threshold = {}", audio.speech_threshold);
    println!("speech_release_ms = {}", audio.speech_release.as_millis());
    println!("noise_suppression = {}", audio.noise_suppression);
    println!("echo_cancellation = {}", audio.echo_cancellation);
    println!("auto_gain = {}", audio.auto_gain);

    let retry = &config.retry;
    println!("\n[retry]");
    println!("max_attempts = {}", retry.max_attempts);
    println!("base_delay_ms = {}", retry.base_delay.as_millis());
    println!("multiplier = {}", retry.multiplier);
    println!("max_delay_ms = {}", retry.max_delay.as_millis());

    Ok(())
}
