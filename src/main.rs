//! # Live Voice Client - Main Application Entry Point
//!
//! A terminal client for a realtime voice assistant: it streams the microphone
//! to the service, plays the spoken reply back without gaps, cuts playback
//! when the user talks over it, and can draw both voices as a radial spectrum.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The session, status printer and draw loop are tokio tasks
//! - **Threads**: Audio devices and the blocking stdin reader get their own threads
//! - **Channels**: Every source reports into one session event queue
//! - **static**: A global shutdown flag set by the signal handlers
//!
//! ## Application Architecture:
//! - **config**: Configuration (defaults + config file + environment variables)
//! - **state**: Run id and session metrics
//! - **audio**: Codec, capture, playback scheduling, devices, analysers
//! - **channel**: WebSocket link to the realtime service
//! - **session**: State machine that ties it all together
//! - **visualizer**: Spectrum rings drawn from the signal taps
//! - **error**: Error taxonomy and user-facing status text

mod audio;        // Audio pipeline (audio/ directory)
mod channel;      // Realtime WebSocket channel (channel.rs)
mod config;       // Configuration management (config.rs)
mod error;        // Error handling types (error.rs)
mod events;       // Session event queue (events.rs)
mod instructions; // System instruction loading (instructions.rs)
mod session;      // Session orchestrator (session.rs)
mod state;        // Application state and metrics (state.rs)
mod visualizer;   // Spectrum visualizer (visualizer.rs)

use anyhow::Result;
use crate::audio::analyser::SpectralAnalyser;
use crate::audio::capture::CapturePipeline;
use crate::audio::microphone::CpalMicrophone;
use crate::audio::output::OutputEngine;
use crate::audio::scheduler::{CompletionNotifier, PlaybackScheduler};
use crate::audio::tap::SignalTap;
use crate::channel::{SessionRequest, WebSocketConnector};
use crate::config::AppConfig;
use crate::events::{event_queue, EventSender, SessionEvent, UserCommand};
use crate::session::{LiveSession, StatusReport};
use crate::state::AppState;
use crate::visualizer::{LogRenderer, Renderer, TerminalRenderer, Viewport, Visualizer};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal, set from the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** and the optional system instructions
/// 2. **Opens the output device** and builds the playback scheduler on it
/// 3. **Builds the session** with the microphone and the WebSocket connector
/// 4. **Spawns the front end**: status printer, command reader, visualizer
/// 5. **Runs the session** until the user quits or a signal arrives
/// 6. **Cleans up** and logs what the session did
///
/// ## Error Handling:
/// Only setup failures (bad config, no credential, no output device) end the
/// program with an error. Everything after that is reported on the status line.
#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;
    config.require_credentials()?;

    let app_state = AppState::new(config.clone());
    info!("Starting live-voice-client v{}", env!("CARGO_PKG_VERSION"));
    info!(
        run_id = %app_state.run_id,
        model = %config.channel.model,
        voice = %config.channel.voice,
        "Configuration loaded"
    );

    // Missing instructions are reported, never fatal
    let system_instruction = match instructions::load_system_instruction(&config.instructions.path).await {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "System instructions unavailable");
            println!("[uninitialized] {}", e.status_message());
            None
        }
    };

    // Audio graph: both taps, the output device and the scheduler on top of it
    let input_tap = SignalTap::new("input", config.audio.fft_size);
    let output_tap = SignalTap::new("output", config.audio.fft_size);
    let output = OutputEngine::spawn(output_tap.clone())?;

    let (events_tx, events_rx) = event_queue();
    let ended_tx = events_tx.clone();
    let notify: CompletionNotifier = Arc::new(move |unit| {
        let _ = ended_tx.send(SessionEvent::PlaybackEnded(unit));
    });
    let scheduler = PlaybackScheduler::new(Arc::new(output.sink()), notify);
    let capture = CapturePipeline::new(
        Box::new(CpalMicrophone::new(config.audio.input_sample_rate)),
        input_tap.clone(),
        config.audio.frame_size,
    )
    .with_sample_rate(config.audio.input_sample_rate);

    let connector = WebSocketConnector::new(&config.channel.endpoint, &config.channel.api_key);
    let request = SessionRequest {
        model: config.channel.model.clone(),
        response_modality: config.channel.response_modality.clone(),
        voice: config.channel.voice.clone(),
        system_instruction,
    };
    let mut session = LiveSession::new(
        app_state.clone(),
        request,
        Box::new(connector),
        capture,
        scheduler,
        events_tx.clone(),
    );

    // Front end
    let status_task = tokio::spawn(print_status(session.subscribe()));
    let (viewport_tx, viewport_rx) = watch::channel(Viewport {
        width: config.visualizer.width,
        height: config.visualizer.height,
    });
    let visual_task = spawn_visualizer(&config, input_tap, output_tap, viewport_rx);
    spawn_command_reader(events_tx.clone(), viewport_tx);

    setup_signal_handlers();
    let quit_tx = events_tx.clone();
    let signal_task = tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("Shutdown signal received");
        let _ = quit_tx.send(SessionEvent::Command(UserCommand::Quit));
    });
    drop(events_tx);

    print_help();
    session.run(events_rx).await;

    // Session is closed: stop the front end, then the devices
    signal_task.abort();
    if let Some(task) = visual_task {
        task.abort();
    }
    drop(session);
    drop(output);
    if let Err(e) = status_task.await {
        error!("Status task error: {}", e);
    }

    log_metrics_summary(&app_state);
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "live_voice_client=debug")
/// - If not set, defaults to "live_voice_client=info"
///
/// Logs go to stderr so they never interleave with the terminal visualizer
/// on stdout.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_voice_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

fn print_help() {
    println!("Commands: start (s), stop (x), reset (r), quit (q), size WIDTHxHEIGHT");
}

/// Print every status change as `[state] message` until the session is gone.
async fn print_status(status: watch::Receiver<StatusReport>) {
    let mut updates = WatchStream::new(status);
    while let Some(report) = updates.next().await {
        println!("{}", report);
    }
}

/// Start the draw loop for the configured visualizer mode, if any.
fn spawn_visualizer(
    config: &AppConfig,
    input_tap: SignalTap,
    output_tap: SignalTap,
    viewport: watch::Receiver<Viewport>,
) -> Option<JoinHandle<()>> {
    let renderer: Box<dyn Renderer> = match config.visualizer.mode.as_str() {
        "log" => Box::new(LogRenderer),
        "terminal" => Box::new(TerminalRenderer::new(std::io::stdout())),
        _ => return None,
    };

    let visualizer = Visualizer::new(
        SpectralAnalyser::with_fft_size(input_tap, config.audio.fft_size),
        SpectralAnalyser::with_fft_size(output_tap, config.audio.fft_size),
        *viewport.borrow(),
    );
    info!(mode = %config.visualizer.mode, fps = config.visualizer.fps, "Visualizer started");
    Some(tokio::spawn(crate::visualizer::run(
        visualizer,
        renderer,
        config.visualizer.fps,
        viewport,
    )))
}

/// Read commands from stdin on a plain thread.
///
/// A blocking read cannot be cancelled, so it stays off the runtime; the
/// thread simply dies with the process. End of input counts as `quit`.
fn spawn_command_reader(events: EventSender, viewport: watch::Sender<Viewport>) {
    let spawned = std::thread::Builder::new()
        .name("live-voice-stdin".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                if let Some(size) = line.strip_prefix("size ") {
                    match size.parse::<Viewport>() {
                        Ok(size) => {
                            viewport.send_replace(size);
                        }
                        Err(e) => println!("{}", e),
                    }
                    continue;
                }

                match line.parse::<UserCommand>() {
                    Ok(command) => {
                        if events.send(SessionEvent::Command(command)).is_err() {
                            return;
                        }
                    }
                    Err(e) => println!("{}", e),
                }
            }
            let _ = events.send(SessionEvent::Command(UserCommand::Quit));
        });

    if let Err(e) = spawned {
        error!("Failed to start command reader: {}", e);
    }
}

/// Set up signal handlers for graceful shutdown.
///
/// ## What this does:
/// - Listens for SIGTERM and SIGINT (Ctrl+C)
/// - When either arrives, sets the global shutdown flag
fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set, polling every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}

/// Log what the session did over its lifetime.
fn log_metrics_summary(app_state: &AppState) {
    let metrics = app_state.metrics_snapshot();
    info!(
        run_id = %app_state.run_id,
        started_at = %app_state.started_at.to_rfc3339(),
        uptime_secs = app_state.uptime_seconds(),
        frames_sent = metrics.frames_sent,
        frames_dropped = metrics.frames_dropped,
        drop_rate = metrics.drop_rate(),
        chunks_scheduled = metrics.chunks_scheduled,
        reply_seconds = metrics.reply_seconds,
        decode_errors = metrics.decode_errors,
        interruptions = metrics.interruptions,
        connections = metrics.connections,
        resets = metrics.resets,
        errors = metrics.errors,
        "Session summary"
    );
    match serde_json::to_string(&metrics) {
        Ok(json) => info!("Session metrics: {}", json),
        Err(e) => warn!("Could not serialize session metrics: {}", e),
    }
}
