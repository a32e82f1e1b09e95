//! alicia-daemon: State controller for the Alicia voice assistant
//!
//! This daemon drives one conversational session and provides:
//! - An explicit state controller (idle, listening, processing, speaking,
//!   error, confirming_order) with timed fallbacks and retry backoff
//! - Worker adapters for speech recognition, response generation and
//!   speech synthesis, started and stopped with their states
//! - IPC server for status queries, transition requests and notifications
//!
//! Speech is typed on standard input; responses and playback are simulated.

mod config;
mod events;
mod ipc;
mod lifecycle;
mod state;
mod workers;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::events::StateEvent;
use crate::ipc::Server;
use crate::lifecycle::ShutdownSignal;
use crate::state::context::keys;
use crate::state::{ControllerHandle, StateController, TransitionTable};
use crate::workers::{
    ConsoleRecognizer, EchoResponder, RemoteWorker, SimulatedSynthesizer, WorkerKind,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "alicia-daemon starting");

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(?config.socket_path, "configuration loaded");

    // Create shutdown signal handler
    let shutdown = ShutdownSignal::new();

    // Create channels for inter-component communication
    // Workers -> State controller
    let (signal_tx, signal_rx) = mpsc::channel(32);
    // State controller -> async observers
    let (event_tx, mut event_rx) = broadcast::channel::<StateEvent>(64);
    // IPC -> State controller
    let (handle, command_rx) = ControllerHandle::channel(32);

    // Create the state controller
    let table = TransitionTable::canonical()?;
    let mut controller = StateController::new(config.controller.clone(), table, event_tx);
    info!(state = %controller.current_state(), "state controller created");

    // Speech recognizer reads stdin on a dedicated thread
    let recognizer = ConsoleRecognizer::new(signal_tx.clone())
        .with_no_speech_retries(config.no_speech_retries);
    if let Err(e) = recognizer.spawn_stdin_reader() {
        error!(?e, "failed to start console recognizer");
        warn!("continuing without speech input");
    }
    controller.attach_worker(Box::new(recognizer));

    controller.attach_worker(Box::new(RemoteWorker::spawn(
        WorkerKind::Responder,
        keys::USER_UTTERANCE,
        EchoResponder::default(),
        signal_tx.clone(),
    )));
    controller.attach_worker(Box::new(RemoteWorker::spawn(
        WorkerKind::Synthesizer,
        keys::AI_RESPONSE,
        SimulatedSynthesizer::new(config.speech_cache_size),
        signal_tx,
    )));

    controller.initialize();

    // Create IPC server
    let server = Server::new(&config.socket_path, handle)?;

    info!("daemon initialized, entering main loop");

    // Log state events as they are broadcast
    let event_logger = tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => info!(%event, "state event"),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Main event loop
    tokio::select! {
        // Run the state controller (worker signals, commands, timers)
        _ = controller.run(signal_rx, command_rx) => {
            info!("state controller exited");
        }

        // Run the IPC server (accepts client connections)
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        // Wait for shutdown signal
        result = shutdown.wait() => {
            match result {
                Ok(()) => info!("shutdown signal received"),
                Err(e) => error!(?e, "failed to register signal handlers"),
            }
        }
    }

    // Cleanup
    info!("shutting down...");

    controller.stop_workers();
    server.shutdown().await;
    event_logger.abort();

    info!("alicia-daemon stopped");

    Ok(())
}
