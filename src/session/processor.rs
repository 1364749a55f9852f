//! Event processor: raw hardware event in, broadcast snapshot out
//!
//! Maps the event onto a machine event, drives the state machine,
//! invokes the capability adapters in a fixed per-event order, and
//! measures processing latency. Adapter failures are logged and never
//! block the snapshot: the state-machine view is authoritative for
//! clients even when a downstream handoff failed.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capabilities::{
    epoch_ms, ComputeRouter, InputOwnership, KernelMixConfig, OsControlState, SpeechCapability,
    Transcription, CONTEXT_TOKENS_MAX, CONTEXT_TOKENS_MIN, TOKEN_STEP,
};
use crate::events::{map_hardware_event, ComponentId, DeviceId, EventType, HardwareEvent, MachineEvent};
use crate::state::{Persona, Phase, SessionState, StateMachine, VoiceStatus};

/// The session-state portion of a broadcast snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub is_clutch_engaged: bool,
    pub active_agent_context: Persona,
    pub compute_mix_weight: f64,
    pub voice_pipeline_status: VoiceStatus,
}

impl From<SessionState> for SessionView {
    fn from(state: SessionState) -> Self {
        Self {
            is_clutch_engaged: state.clutch_engaged,
            active_agent_context: state.active_persona,
            compute_mix_weight: state.compute_mix_weight,
            voice_pipeline_status: state.voice_status,
        }
    }
}

/// Full state snapshot broadcast to every client after each processed event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub machine_state: Phase,
    pub state: SessionView,
    pub kernel_config: KernelMixConfig,
    pub os_control_state: OsControlState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription: Option<Transcription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    pub timestamp: u64,
}

/// Result of processing one hardware event
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub snapshot: StateSnapshot,
    pub latency_ms: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// No mapping-table entry for the event. Expected hardware noise:
    /// logged and dropped, never surfaced to the sender.
    #[error("no machine event mapping for {device_id:?}/{component_id:?}/{event_type:?}")]
    Unroutable {
        device_id: DeviceId,
        component_id: ComponentId,
        event_type: EventType,
    },
}

/// One adapter invocation in a dispatch plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdapterCall {
    SpeechEngage,
    SpeechRelease,
    InputEngage,
    InputRelease,
    ComputeMix,
    ContextWindow,
    PersonaSwitch,
}

/// Fixed, ordered adapter calls per machine event. The order is part of
/// the protocol with the collaborators: speech before input ownership
/// on engage, and the symmetric releases on release even if the prior
/// engage never completed.
fn dispatch_plan(event: MachineEvent) -> &'static [AdapterCall] {
    match event {
        MachineEvent::ClutchEngage { .. } => &[AdapterCall::SpeechEngage, AdapterCall::InputEngage],
        MachineEvent::ClutchRelease => &[AdapterCall::SpeechRelease, AdapterCall::InputRelease],
        MachineEvent::DialCompute { .. } => &[AdapterCall::ComputeMix],
        MachineEvent::DialContext { .. } => &[AdapterCall::ContextWindow],
        MachineEvent::PersonaSwitch { .. } => &[AdapterCall::PersonaSwitch],
        MachineEvent::VoiceReady | MachineEvent::AgentReady => &[],
    }
}

/// Owns the state machine and the three capability adapters.
///
/// All callers reach it through one `Mutex`, which is what serializes
/// session mutations globally across connections.
pub struct EventProcessor {
    machine: StateMachine,
    compute: Box<dyn ComputeRouter>,
    speech: Box<dyn SpeechCapability>,
    input: Box<dyn InputOwnership>,
    last_transcription: Option<Transcription>,
}

impl EventProcessor {
    pub fn new(
        machine: StateMachine,
        compute: Box<dyn ComputeRouter>,
        speech: Box<dyn SpeechCapability>,
        input: Box<dyn InputOwnership>,
    ) -> Self {
        Self {
            machine,
            compute,
            speech,
            input,
            last_transcription: None,
        }
    }

    /// Current canonical session state
    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    /// Process one raw hardware event and produce the broadcast snapshot.
    pub async fn process(&mut self, raw: &HardwareEvent) -> Result<ProcessOutcome, ProcessError> {
        let Some(event) = map_hardware_event(raw) else {
            debug!(
                device_id = ?raw.device_id,
                component_id = ?raw.component_id,
                event_type = ?raw.event_type,
                "hardware event has no mapping, dropping"
            );
            return Err(ProcessError::Unroutable {
                device_id: raw.device_id,
                component_id: raw.component_id,
                event_type: raw.event_type,
            });
        };
        Ok(self.apply(event).await)
    }

    /// Apply an internally synthesized machine event (voice/agent
    /// pipeline progress) through the same path as hardware events.
    pub async fn advance(&mut self, event: MachineEvent) -> ProcessOutcome {
        self.apply(event).await
    }

    async fn apply(&mut self, event: MachineEvent) -> ProcessOutcome {
        let started = Instant::now();

        self.machine.send(event);
        for call in dispatch_plan(event) {
            if let Err(error) = self.invoke(*call, event).await {
                warn!(?call, %error, "capability adapter call failed");
            }
        }

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut snapshot = self.snapshot().await;
        snapshot.latency_ms = Some(latency_ms);
        ProcessOutcome {
            snapshot,
            latency_ms,
        }
    }

    async fn invoke(&mut self, call: AdapterCall, event: MachineEvent) -> anyhow::Result<()> {
        let state = self.machine.state();
        match call {
            AdapterCall::SpeechEngage => self.speech.engage().await,
            AdapterCall::SpeechRelease => self.speech.release().await,
            AdapterCall::InputEngage => self.input.engage(state.active_persona).await,
            AdapterCall::InputRelease => self.input.release().await,
            AdapterCall::ComputeMix => self.compute.set_compute_mix(state.compute_mix_weight).await,
            AdapterCall::ContextWindow => {
                let MachineEvent::DialContext { delta } = event else {
                    return Ok(());
                };
                let current = self.compute.config().await.context_window_tokens;
                // Saturating: the spec bounds the result via clamp, not
                // the delta, so an extreme detent count must not overflow.
                let tokens = current
                    .saturating_add(delta.saturating_mul(TOKEN_STEP))
                    .clamp(CONTEXT_TOKENS_MIN, CONTEXT_TOKENS_MAX);
                self.compute.set_context_window(tokens).await
            }
            AdapterCall::PersonaSwitch => self.input.switch_persona(state.active_persona).await,
        }
    }

    /// Cache the latest transcription pushed by the speech pipeline.
    pub fn set_transcription(&mut self, transcription: Transcription) {
        self.last_transcription = Some(transcription);
    }

    /// Build the full broadcast snapshot from the current state. Also
    /// serves as the synchronous health/introspection read.
    pub async fn snapshot(&self) -> StateSnapshot {
        let state = self.machine.state();
        StateSnapshot {
            machine_state: state.phase,
            state: state.into(),
            kernel_config: self.compute.config().await,
            os_control_state: self.input.control_state().await,
            transcription: self.last_transcription.clone(),
            latency_ms: None,
            timestamp: epoch_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{
        ControlOwner, LocalComputeRouter, LocalInputOwnership, LocalSpeechPipeline,
        CONTEXT_TOKENS_DEFAULT,
    };
    use async_trait::async_trait;

    fn processor() -> EventProcessor {
        let (speech, _rx) = LocalSpeechPipeline::new();
        EventProcessor::new(
            StateMachine::new(0.5),
            Box::new(LocalComputeRouter::new(0.5, "local-slm", "cloud-llm")),
            Box::new(speech),
            Box::new(LocalInputOwnership::new()),
        )
    }

    fn raw(
        device_id: DeviceId,
        component_id: ComponentId,
        event_type: EventType,
        value: Option<serde_json::Value>,
    ) -> HardwareEvent {
        HardwareEvent {
            timestamp: epoch_ms(),
            device_id,
            component_id,
            event_type,
            value,
        }
    }

    fn ring_press() -> HardwareEvent {
        raw(DeviceId::DeviceA, ComponentId::Ring, EventType::Press, None)
    }

    fn ring_release() -> HardwareEvent {
        raw(DeviceId::DeviceA, ComponentId::Ring, EventType::Release, None)
    }

    #[tokio::test]
    async fn test_clutch_engage_updates_snapshot_and_ownership() {
        let mut proc = processor();
        let outcome = proc.process(&ring_press()).await.unwrap();

        let snapshot = &outcome.snapshot;
        assert_eq!(snapshot.machine_state, Phase::ClutchEngaged);
        assert!(snapshot.state.is_clutch_engaged);
        assert_eq!(snapshot.state.voice_pipeline_status, VoiceStatus::Listening);
        assert_eq!(snapshot.os_control_state.owner, ControlOwner::Agent);
        assert!(snapshot.os_control_state.handed_off_at.is_some());
        assert!(snapshot.latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_release_returns_ownership_to_operator() {
        let mut proc = processor();
        proc.process(&ring_press()).await.unwrap();
        let outcome = proc.process(&ring_release()).await.unwrap();

        assert_eq!(outcome.snapshot.machine_state, Phase::Idle);
        assert_eq!(outcome.snapshot.os_control_state.owner, ControlOwner::Physical);
        assert_eq!(outcome.snapshot.os_control_state.handed_off_at, None);
    }

    #[tokio::test]
    async fn test_unroutable_event_is_an_internal_error_only() {
        let mut proc = processor();
        let before = proc.state();
        let result = proc
            .process(&raw(
                DeviceId::DeviceB,
                ComponentId::Ring,
                EventType::Press,
                None,
            ))
            .await;
        assert!(matches!(result, Err(ProcessError::Unroutable { .. })));
        assert_eq!(proc.state(), before);
    }

    #[tokio::test]
    async fn test_context_dial_clamps_per_step() {
        let mut proc = processor();
        let rotate = |delta: i64| {
            raw(
                DeviceId::DeviceB,
                ComponentId::Dial2,
                EventType::Rotate,
                Some(serde_json::json!(delta)),
            )
        };

        let outcome = proc.process(&rotate(1)).await.unwrap();
        assert_eq!(
            outcome.snapshot.kernel_config.context_window_tokens,
            CONTEXT_TOKENS_DEFAULT + TOKEN_STEP
        );

        let outcome = proc.process(&rotate(100)).await.unwrap();
        assert_eq!(
            outcome.snapshot.kernel_config.context_window_tokens,
            CONTEXT_TOKENS_MAX
        );

        let outcome = proc.process(&rotate(-1)).await.unwrap();
        assert_eq!(
            outcome.snapshot.kernel_config.context_window_tokens,
            CONTEXT_TOKENS_MAX - TOKEN_STEP
        );
    }

    #[tokio::test]
    async fn test_context_dial_extreme_delta_clamps_without_overflow() {
        let mut proc = processor();
        let rotate = |delta: i64| {
            raw(
                DeviceId::DeviceB,
                ComponentId::Dial2,
                EventType::Rotate,
                Some(serde_json::json!(delta)),
            )
        };

        let outcome = proc.process(&rotate(i64::MAX)).await.unwrap();
        assert_eq!(
            outcome.snapshot.kernel_config.context_window_tokens,
            CONTEXT_TOKENS_MAX
        );

        let outcome = proc.process(&rotate(i64::MIN)).await.unwrap();
        assert_eq!(
            outcome.snapshot.kernel_config.context_window_tokens,
            CONTEXT_TOKENS_MIN
        );
    }

    #[tokio::test]
    async fn test_compute_dial_keeps_kernel_config_in_sync() {
        let mut proc = processor();
        let outcome = proc
            .process(&raw(
                DeviceId::DeviceB,
                ComponentId::Dial1,
                EventType::Rotate,
                Some(serde_json::json!(2)),
            ))
            .await
            .unwrap();

        assert!((outcome.snapshot.state.compute_mix_weight - 0.6).abs() < 1e-9);
        assert!((outcome.snapshot.kernel_config.compute_mix_weight - 0.6).abs() < 1e-9);
        assert_eq!(outcome.snapshot.kernel_config.primary_model, "cloud-llm");
    }

    #[tokio::test]
    async fn test_keypad_switches_persona_everywhere() {
        let mut proc = processor();
        let outcome = proc
            .process(&raw(
                DeviceId::DeviceB,
                ComponentId::Keypad,
                EventType::Tap,
                Some(serde_json::json!(3)),
            ))
            .await
            .unwrap();

        assert_eq!(outcome.snapshot.state.active_agent_context, Persona::Researcher);
        assert_eq!(
            outcome.snapshot.os_control_state.active_persona,
            Persona::Researcher
        );
    }

    struct FailingSpeech;

    #[async_trait]
    impl SpeechCapability for FailingSpeech {
        async fn engage(&mut self) -> anyhow::Result<()> {
            anyhow::bail!("speech backend unreachable")
        }

        async fn release(&mut self) -> anyhow::Result<()> {
            anyhow::bail!("speech backend unreachable")
        }
    }

    #[tokio::test]
    async fn test_adapter_failure_never_blocks_the_snapshot() {
        let mut proc = EventProcessor::new(
            StateMachine::new(0.5),
            Box::new(LocalComputeRouter::new(0.5, "local-slm", "cloud-llm")),
            Box::new(FailingSpeech),
            Box::new(LocalInputOwnership::new()),
        );

        // The state machine result is broadcast truthfully even though
        // the speech engage failed; state and adapter may diverge.
        let outcome = proc.process(&ring_press()).await.unwrap();
        assert_eq!(outcome.snapshot.machine_state, Phase::ClutchEngaged);
        // The later adapters in the plan still ran.
        assert_eq!(outcome.snapshot.os_control_state.owner, ControlOwner::Agent);

        let outcome = proc.process(&ring_release()).await.unwrap();
        assert_eq!(outcome.snapshot.machine_state, Phase::Idle);
        assert_eq!(outcome.snapshot.os_control_state.owner, ControlOwner::Physical);
    }

    #[tokio::test]
    async fn test_advance_walks_voice_and_agent_phases() {
        let mut proc = processor();
        proc.process(&ring_press()).await.unwrap();

        let outcome = proc.advance(MachineEvent::VoiceReady).await;
        assert_eq!(outcome.snapshot.machine_state, Phase::VoiceActive);

        let outcome = proc.advance(MachineEvent::AgentReady).await;
        assert_eq!(outcome.snapshot.machine_state, Phase::AgentExecuting);
    }

    #[tokio::test]
    async fn test_snapshot_carries_last_transcription() {
        let mut proc = processor();
        proc.set_transcription(Transcription {
            transcript: "summarize the diff".into(),
            is_final: true,
            confidence: 0.9,
            duration_ms: 800,
            timestamp: epoch_ms(),
        });

        let snapshot = proc.snapshot().await;
        assert_eq!(
            snapshot.transcription.as_ref().map(|t| t.transcript.as_str()),
            Some("summarize the diff")
        );
    }
}
