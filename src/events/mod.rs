//! Hardware event decoding and the machine event mapping table
//!
//! The hardware-event source delivers validated discrete events as JSON.
//! A fixed, exhaustive lookup maps them onto machine events; anything
//! without a mapping is expected traffic from unrelated components and
//! is silently dropped, never an error.

use serde::{Deserialize, Serialize};

use crate::state::Persona;

/// Physical device that produced the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceId {
    DeviceA,
    DeviceB,
}

/// Component on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentId {
    Ring,
    #[serde(rename = "DIAL_1")]
    Dial1,
    #[serde(rename = "DIAL_2")]
    Dial2,
    Keypad,
}

/// Kind of interaction reported by the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Press,
    Release,
    Rotate,
    Tap,
}

/// Raw validated event from the hardware-event source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareEvent {
    pub timestamp: u64,
    pub device_id: DeviceId,
    pub component_id: ComponentId,
    pub event_type: EventType,
    /// Dial delta or keypad key; number or string depending on firmware
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// Event understood by the session state machine. Ephemeral; never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MachineEvent {
    ClutchEngage { persona: Option<Persona> },
    ClutchRelease,
    VoiceReady,
    AgentReady,
    DialCompute { delta: i64 },
    DialContext { delta: i64 },
    PersonaSwitch { persona: Persona },
}

/// Map a raw hardware event onto a machine event.
///
/// The table is fixed and exhaustive; `None` means the combination has
/// no mapping and the event is dropped.
pub fn map_hardware_event(event: &HardwareEvent) -> Option<MachineEvent> {
    match (event.device_id, event.component_id, event.event_type) {
        (DeviceId::DeviceA, ComponentId::Ring, EventType::Press) => {
            Some(MachineEvent::ClutchEngage { persona: None })
        }
        (DeviceId::DeviceA, ComponentId::Ring, EventType::Release) => {
            Some(MachineEvent::ClutchRelease)
        }
        (DeviceId::DeviceB, ComponentId::Dial1, EventType::Rotate) => {
            dial_delta(event).map(|delta| MachineEvent::DialCompute { delta })
        }
        (DeviceId::DeviceB, ComponentId::Dial2, EventType::Rotate) => {
            dial_delta(event).map(|delta| MachineEvent::DialContext { delta })
        }
        (DeviceId::DeviceB, ComponentId::Keypad, EventType::Press | EventType::Tap) => {
            keypad_persona(event).map(|persona| MachineEvent::PersonaSwitch { persona })
        }
        _ => None,
    }
}

/// Extract a signed dial delta from the event value.
fn dial_delta(event: &HardwareEvent) -> Option<i64> {
    match event.value.as_ref()? {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Keypad key to persona. Unknown keys drop the event; persona is unchanged.
fn keypad_persona(event: &HardwareEvent) -> Option<Persona> {
    let key = match event.value.as_ref()? {
        serde_json::Value::Number(n) => n.as_i64()?,
        serde_json::Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    match key {
        1 => Some(Persona::Coder),
        2 => Some(Persona::Navigator),
        3 => Some(Persona::Researcher),
        _ => None,
    }
}
