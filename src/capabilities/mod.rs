//! Capability adapter seams
//!
//! The daemon reaches its three external collaborators only through
//! these narrow interfaces: compute routing, the speech pipeline, and
//! OS input ownership. Adapter failures are logged by the caller and
//! never roll back a state-machine transition.

mod local;

pub use local::{LocalComputeRouter, LocalInputOwnership, LocalSpeechPipeline};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::state::Persona;

/// Context-window change per dial detent, in tokens.
pub const TOKEN_STEP: i64 = 6_000;
pub const CONTEXT_TOKENS_MIN: i64 = 8_000;
pub const CONTEXT_TOKENS_MAX: i64 = 128_000;
pub const CONTEXT_TOKENS_DEFAULT: i64 = 32_000;

/// Mix weight below which the local model is primary.
pub const LOCAL_MODEL_THRESHOLD: f64 = 0.5;

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Compute-routing configuration, owned by the compute router and
/// mirrored read-only into broadcast snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelMixConfig {
    /// 0.0 = fully local, 1.0 = fully remote
    pub compute_mix_weight: f64,
    /// Clamped to [8000, 128000]
    pub context_window_tokens: i64,
    /// Model label selected deterministically from the mix weight
    pub primary_model: String,
}

/// Who owns real-time OS input right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlOwner {
    Physical,
    Agent,
}

/// OS input-ownership state, owned by the input-ownership capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsControlState {
    pub owner: ControlOwner,
    /// Set once on the PHYSICAL -> AGENT handoff; repeated engage calls
    /// while AGENT-owned leave it unchanged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handed_off_at: Option<u64>,
    pub active_persona: Persona,
}

/// One transcription result pushed by the speech pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcription {
    pub transcript: String,
    pub is_final: bool,
    pub confidence: f64,
    pub duration_ms: u64,
    pub timestamp: u64,
}

/// Compute-routing backend: balances local vs. remote inference
#[async_trait]
pub trait ComputeRouter: Send + Sync {
    async fn set_compute_mix(&mut self, weight: f64) -> anyhow::Result<()>;
    async fn set_context_window(&mut self, tokens: i64) -> anyhow::Result<()>;
    async fn config(&self) -> KernelMixConfig;
}

/// Speech-to-text pipeline; transcriptions arrive on the channel
/// handed out at construction
#[async_trait]
pub trait SpeechCapability: Send + Sync {
    async fn engage(&mut self) -> anyhow::Result<()>;
    async fn release(&mut self) -> anyhow::Result<()>;
}

/// OS input-ownership backend: hands the machine's input devices
/// between the physical operator and the agent
#[async_trait]
pub trait InputOwnership: Send + Sync {
    async fn engage(&mut self, persona: Persona) -> anyhow::Result<()>;
    async fn release(&mut self) -> anyhow::Result<()>;
    async fn switch_persona(&mut self, persona: Persona) -> anyhow::Result<()>;
    async fn control_state(&self) -> OsControlState;
}
