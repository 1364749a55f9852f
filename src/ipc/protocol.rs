//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian
//! length. Clients attach with a role; only controllers may submit
//! hardware events.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::events::HardwareEvent;
use crate::session::StateSnapshot;

/// Upper bound on a single frame body
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Connection role requested at attach time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// May submit hardware events; requires the shared secret when one
    /// is configured
    Controller,
    /// Receive-only
    Observer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Controller => write!(f, "CONTROLLER"),
            Role::Observer => write!(f, "OBSERVER"),
        }
    }
}

/// Messages from client to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// First frame on every connection: role plus optional credential
    Attach {
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// A raw hardware event (controllers only)
    Event { event: HardwareEvent },

    /// Health/introspection read of the current snapshot
    GetSnapshot,

    /// Liveness check
    Ping,
}

/// Messages from daemon to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    /// Full session snapshot, broadcast after every processed event
    StateUpdate(StateSnapshot),

    /// Attach accepted
    Attached { role: Role },

    /// Structured error reported to one connection
    Error { message: String },

    /// Liveness response
    Pong,
}

/// Read one length-prefixed frame. `Ok(None)` on clean EOF.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg).context("failed to serialize message")?;
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ComponentId, DeviceId, EventType};

    #[test]
    fn test_attach_wire_shape() {
        let json = r#"{"type":"ATTACH","role":"CONTROLLER","token":"s3cret"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Attach {
                role: Role::Controller,
                token: Some(_)
            }
        ));

        let json = r#"{"type":"ATTACH","role":"OBSERVER"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Attach {
                role: Role::Observer,
                token: None
            }
        ));
    }

    #[test]
    fn test_event_wire_shape() {
        let json = r#"{
            "type": "EVENT",
            "event": {
                "timestamp": 123,
                "deviceId": "DEVICE_A",
                "componentId": "RING",
                "eventType": "PRESS"
            }
        }"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        let ClientMessage::Event { event } = msg else {
            panic!("expected EVENT");
        };
        assert_eq!(event.device_id, DeviceId::DeviceA);
        assert_eq!(event.component_id, ComponentId::Ring);
        assert_eq!(event.event_type, EventType::Press);
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let json = r#"{"type":"REBOOT"}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }

    #[test]
    fn test_state_update_fields_sit_beside_the_tag() {
        use crate::capabilities::{ControlOwner, KernelMixConfig, OsControlState};
        use crate::session::SessionView;
        use crate::state::{Persona, Phase, VoiceStatus};

        let msg = ServerMessage::StateUpdate(StateSnapshot {
            machine_state: Phase::ClutchEngaged,
            state: SessionView {
                is_clutch_engaged: true,
                active_agent_context: Persona::Navigator,
                compute_mix_weight: 0.6,
                voice_pipeline_status: VoiceStatus::Listening,
            },
            kernel_config: KernelMixConfig {
                compute_mix_weight: 0.6,
                context_window_tokens: 32_000,
                primary_model: "cloud-llm".into(),
            },
            os_control_state: OsControlState {
                owner: ControlOwner::Agent,
                handed_off_at: Some(1_700_000_000_000),
                active_persona: Persona::Navigator,
            },
            transcription: None,
            latency_ms: Some(1.2),
            timestamp: 1_700_000_000_001,
        });

        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "STATE_UPDATE");
        assert_eq!(value["machineState"], "CLUTCH_ENGAGED");
        assert_eq!(value["state"]["isClutchEngaged"], true);
        assert_eq!(value["state"]["activeAgentContext"], "NAVIGATOR");
        assert_eq!(value["state"]["voicePipelineStatus"], "LISTENING");
        assert_eq!(value["kernelConfig"]["contextWindowTokens"], 32_000);
        assert_eq!(value["osControlState"]["owner"], "AGENT");
        assert!(value.get("transcription").is_none());
    }

    #[test]
    fn test_error_serialization() {
        let msg = ServerMessage::Error {
            message: "controller role required".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"ERROR""#));
        assert!(json.contains("controller role required"));
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &ServerMessage::Pong).await.unwrap();

        let mut reader = std::io::Cursor::new(buf);
        let body = read_frame(&mut reader).await.unwrap().unwrap();
        let msg: ServerMessage = serde_json::from_slice(&body).unwrap();
        assert!(matches!(msg, ServerMessage::Pong));

        // Clean EOF after the frame.
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_le_bytes());
        let mut reader = std::io::Cursor::new(buf);
        assert!(read_frame(&mut reader).await.is_err());
    }
}
