//! synapse-daemon: authoritative session daemon for clutch-driven control
//!
//! Routes physical hardware control events (clutch ring, dials, keypad)
//! through one canonical session state machine and fans the resulting
//! snapshots out to every attached client:
//! - deterministic phase transitions with a priority-0 clutch release
//! - capability adapters for compute routing, speech, and input ownership
//! - Unix socket gateway with controller/observer roles
//! - dead-man switch: control reverts to the operator when the last
//!   client disconnects mid-session

mod capabilities;
mod config;
mod events;
mod ipc;
mod lifecycle;
mod session;
mod state;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::capabilities::{LocalComputeRouter, LocalInputOwnership, LocalSpeechPipeline};
use crate::config::Config;
use crate::events::MachineEvent;
use crate::ipc::protocol::ServerMessage;
use crate::ipc::{ConnectionRegistry, DeadManSupervisor, Gateway};
use crate::lifecycle::ShutdownSignal;
use crate::session::EventProcessor;
use crate::state::StateMachine;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "synapse-daemon starting"
    );

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(?config.socket_path, controller_auth = config.controller_token.is_some(), "configuration loaded");

    let shutdown = ShutdownSignal::new();

    // Capability adapters
    let compute = LocalComputeRouter::new(
        config.default_mix_weight,
        &config.local_model,
        &config.cloud_model,
    );
    let (speech, mut transcription_rx) = LocalSpeechPipeline::new();
    let input = LocalInputOwnership::new();

    // The event processor is the single serialization point for all
    // session mutation; everything reaches it through this mutex.
    let processor = Arc::new(Mutex::new(EventProcessor::new(
        StateMachine::new(config.default_mix_weight),
        Box::new(compute),
        Box::new(speech),
        Box::new(input),
    )));

    let registry = Arc::new(Mutex::new(ConnectionRegistry::new(
        config.controller_token.clone(),
    )));

    let supervisor = Arc::new(DeadManSupervisor::new(processor.clone(), registry.clone()));
    let gateway = Gateway::new(
        &config.socket_path,
        processor.clone(),
        registry.clone(),
        supervisor.clone(),
    )?;

    info!("daemon initialized, entering main loop");

    tokio::select! {
        // Accept and serve client connections
        result = gateway.run() => {
            if let Err(e) = result {
                error!(?e, "session gateway error");
            }
        }

        // Forward transcriptions from the speech pipeline into the
        // session and broadcast the updated snapshot
        _ = async {
            while let Some(transcription) = transcription_rx.recv().await {
                info!(
                    transcript = %transcription.transcript,
                    is_final = transcription.is_final,
                    "transcription received"
                );
                let snapshot = {
                    let mut proc = processor.lock().await;
                    let is_final = transcription.is_final;
                    proc.set_transcription(transcription);
                    if is_final {
                        // A final transcript moves the session from
                        // listening to processing.
                        proc.advance(MachineEvent::VoiceReady).await.snapshot
                    } else {
                        proc.snapshot().await
                    }
                };
                supervisor.broadcast(&ServerMessage::StateUpdate(snapshot)).await;
            }
        } => {
            info!("transcription stream closed");
        }

        // Wait for shutdown signal
        _ = shutdown.wait() => {}
    }

    info!("shutting down...");
    gateway.shutdown().await;
    info!("synapse-daemon stopped");

    Ok(())
}
