//! Core state machine implementation
//!
//! Handles transitions between Idle, ClutchEngaged, VoiceActive, and
//! AgentExecuting phases based on machine events decoded from hardware
//! input. The machine is pure and synchronous: no I/O, no channels, no
//! awareness of connections. All mutation goes through `send`.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::events::MachineEvent;

/// Weight change per dial detent on the compute-mix dial.
pub const WEIGHT_STEP: f64 = 0.05;

/// The four possible phases of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// No active session, waiting for the clutch
    Idle,
    /// Clutch held, voice pipeline listening
    ClutchEngaged,
    /// Speech captured, voice pipeline processing
    VoiceActive,
    /// Agent running against the captured request
    AgentExecuting,
}

impl Default for Phase {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle => write!(f, "Idle"),
            Phase::ClutchEngaged => write!(f, "ClutchEngaged"),
            Phase::VoiceActive => write!(f, "VoiceActive"),
            Phase::AgentExecuting => write!(f, "AgentExecuting"),
        }
    }
}

impl Phase {
    /// Voice pipeline status implied by this phase.
    ///
    /// `voice_status` is never set independently; it is derived in
    /// lockstep with the phase on every transition.
    pub fn voice_status(&self) -> VoiceStatus {
        match self {
            Phase::Idle => VoiceStatus::Idle,
            Phase::ClutchEngaged => VoiceStatus::Listening,
            Phase::VoiceActive | Phase::AgentExecuting => VoiceStatus::Processing,
        }
    }
}

/// Voice pipeline status, derived from the phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoiceStatus {
    Idle,
    Listening,
    Processing,
}

/// Agent persona selected on the keypad; persists across phase changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Persona {
    Coder,
    Navigator,
    Researcher,
}

impl Default for Persona {
    fn default() -> Self {
        Self::Coder
    }
}

impl std::fmt::Display for Persona {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Persona::Coder => write!(f, "CODER"),
            Persona::Navigator => write!(f, "NAVIGATOR"),
            Persona::Researcher => write!(f, "RESEARCHER"),
        }
    }
}

/// Canonical session state, owned exclusively by [`StateMachine`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionState {
    pub phase: Phase,
    /// True iff phase != Idle
    pub clutch_engaged: bool,
    pub active_persona: Persona,
    pub voice_status: VoiceStatus,
    /// 0.0 = fully local compute, 1.0 = fully remote; clamped per step
    pub compute_mix_weight: f64,
}

impl SessionState {
    fn new(default_mix_weight: f64) -> Self {
        Self {
            phase: Phase::Idle,
            clutch_engaged: false,
            active_persona: Persona::default(),
            voice_status: VoiceStatus::Idle,
            compute_mix_weight: default_mix_weight.clamp(0.0, 1.0),
        }
    }
}

/// The state machine that manages session phase transitions
pub struct StateMachine {
    state: SessionState,
}

impl StateMachine {
    /// Create a new state machine in Idle with the given starting mix weight
    pub fn new(default_mix_weight: f64) -> Self {
        Self {
            state: SessionState::new(default_mix_weight),
        }
    }

    /// Get a copy of the current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Apply one machine event and return the resulting phase.
    ///
    /// CLUTCH_RELEASE is a priority-0 interrupt: legal from every
    /// non-idle phase and always a full reset to Idle, abandoning any
    /// in-flight voice or agent activity. Event/phase combinations not
    /// listed in the transition table are silent no-ops.
    pub fn send(&mut self, event: MachineEvent) -> Phase {
        let old_phase = self.state.phase;

        match (old_phase, event) {
            (Phase::Idle, MachineEvent::ClutchEngage { persona }) => {
                self.state.phase = Phase::ClutchEngaged;
                if let Some(persona) = persona {
                    self.state.active_persona = persona;
                }
            }
            (
                Phase::ClutchEngaged | Phase::VoiceActive | Phase::AgentExecuting,
                MachineEvent::ClutchRelease,
            ) => {
                self.state.phase = Phase::Idle;
            }
            (Phase::ClutchEngaged, MachineEvent::VoiceReady) => {
                self.state.phase = Phase::VoiceActive;
            }
            (Phase::VoiceActive, MachineEvent::AgentReady) => {
                self.state.phase = Phase::AgentExecuting;
            }
            // The compute dial is live in every phase.
            (_, MachineEvent::DialCompute { delta }) => {
                self.state.compute_mix_weight = (self.state.compute_mix_weight
                    + delta as f64 * WEIGHT_STEP)
                    .clamp(0.0, 1.0);
            }
            (Phase::Idle | Phase::ClutchEngaged, MachineEvent::PersonaSwitch { persona }) => {
                self.state.active_persona = persona;
            }
            // The context dial mutates only the kernel config, which the
            // compute router owns; no session state changes here.
            (_, MachineEvent::DialContext { .. }) => {}
            _ => {
                debug!(phase = %old_phase, ?event, "event ignored in current phase");
            }
        }

        self.state.clutch_engaged = self.state.phase != Phase::Idle;
        self.state.voice_status = self.state.phase.voice_status();

        if self.state.phase != old_phase {
            info!(
                from = %old_phase,
                to = %self.state.phase,
                persona = %self.state.active_persona,
                "session phase transition"
            );
        }

        self.state.phase
    }
}
