//! Session state machine
//!
//! Pure, synchronous automaton that owns the canonical session state.

mod machine;

pub use machine::{Persona, Phase, SessionState, StateMachine, VoiceStatus};
