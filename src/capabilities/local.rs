//! In-process default adapters
//!
//! These own their collaborator state directly and stand in for the
//! real backends; each logs the calls the way the production adapters
//! do so the dispatch order stays observable in traces.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::state::Persona;

use super::{
    epoch_ms, ComputeRouter, ControlOwner, InputOwnership, KernelMixConfig, OsControlState,
    SpeechCapability, Transcription, CONTEXT_TOKENS_DEFAULT, CONTEXT_TOKENS_MAX,
    CONTEXT_TOKENS_MIN, LOCAL_MODEL_THRESHOLD,
};

/// Compute router holding the kernel mix configuration in process
pub struct LocalComputeRouter {
    config: KernelMixConfig,
    local_model: String,
    cloud_model: String,
}

impl LocalComputeRouter {
    pub fn new(default_mix_weight: f64, local_model: &str, cloud_model: &str) -> Self {
        let weight = default_mix_weight.clamp(0.0, 1.0);
        Self {
            config: KernelMixConfig {
                compute_mix_weight: weight,
                context_window_tokens: CONTEXT_TOKENS_DEFAULT,
                primary_model: primary_model(weight, local_model, cloud_model),
            },
            local_model: local_model.to_owned(),
            cloud_model: cloud_model.to_owned(),
        }
    }
}

fn primary_model(weight: f64, local_model: &str, cloud_model: &str) -> String {
    if weight < LOCAL_MODEL_THRESHOLD {
        local_model.to_owned()
    } else {
        cloud_model.to_owned()
    }
}

#[async_trait]
impl ComputeRouter for LocalComputeRouter {
    async fn set_compute_mix(&mut self, weight: f64) -> anyhow::Result<()> {
        let weight = weight.clamp(0.0, 1.0);
        self.config.compute_mix_weight = weight;
        self.config.primary_model = primary_model(weight, &self.local_model, &self.cloud_model);
        debug!(
            weight,
            primary_model = %self.config.primary_model,
            "compute mix updated"
        );
        Ok(())
    }

    async fn set_context_window(&mut self, tokens: i64) -> anyhow::Result<()> {
        self.config.context_window_tokens = tokens.clamp(CONTEXT_TOKENS_MIN, CONTEXT_TOKENS_MAX);
        debug!(tokens = self.config.context_window_tokens, "context window updated");
        Ok(())
    }

    async fn config(&self) -> KernelMixConfig {
        self.config.clone()
    }
}

/// Speech pipeline stub; pushes transcriptions into the channel handed
/// out at construction
pub struct LocalSpeechPipeline {
    engaged: bool,
    transcription_tx: mpsc::Sender<Transcription>,
}

impl LocalSpeechPipeline {
    /// Returns the pipeline and the receiver end of its transcription stream
    pub fn new() -> (Self, mpsc::Receiver<Transcription>) {
        let (transcription_tx, transcription_rx) = mpsc::channel(16);
        (
            Self {
                engaged: false,
                transcription_tx,
            },
            transcription_rx,
        )
    }

    /// Push a transcription result to the daemon, as the real pipeline
    /// would from its recognition thread.
    pub fn emit(&self, transcription: Transcription) {
        let _ = self.transcription_tx.try_send(transcription);
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged
    }
}

#[async_trait]
impl SpeechCapability for LocalSpeechPipeline {
    async fn engage(&mut self) -> anyhow::Result<()> {
        self.engaged = true;
        info!("speech pipeline engaged");
        Ok(())
    }

    async fn release(&mut self) -> anyhow::Result<()> {
        self.engaged = false;
        info!("speech pipeline released");
        Ok(())
    }
}

/// Input-ownership backend holding the OS control state in process
pub struct LocalInputOwnership {
    state: OsControlState,
}

impl LocalInputOwnership {
    pub fn new() -> Self {
        Self {
            state: OsControlState {
                owner: ControlOwner::Physical,
                handed_off_at: None,
                active_persona: Persona::default(),
            },
        }
    }
}

impl Default for LocalInputOwnership {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InputOwnership for LocalInputOwnership {
    async fn engage(&mut self, persona: Persona) -> anyhow::Result<()> {
        if self.state.owner == ControlOwner::Physical {
            self.state.owner = ControlOwner::Agent;
            self.state.handed_off_at = Some(epoch_ms());
            info!(%persona, "input ownership handed to agent");
        }
        self.state.active_persona = persona;
        Ok(())
    }

    async fn release(&mut self) -> anyhow::Result<()> {
        if self.state.owner == ControlOwner::Agent {
            info!("input ownership returned to operator");
        }
        self.state.owner = ControlOwner::Physical;
        self.state.handed_off_at = None;
        Ok(())
    }

    async fn switch_persona(&mut self, persona: Persona) -> anyhow::Result<()> {
        self.state.active_persona = persona;
        debug!(%persona, "active persona switched");
        Ok(())
    }

    async fn control_state(&self) -> OsControlState {
        self.state.clone()
    }
}
