//! Dead-man supervisor
//!
//! Runs after every unregister. If the last client is gone while the
//! clutch is still engaged, control must revert to the human operator:
//! a forced release is synthesized through the event processor exactly
//! as if a controller had sent it, and the resulting snapshot is
//! broadcast (a no-op to the now-empty set, kept for uniformity).

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::capabilities::epoch_ms;
use crate::events::{ComponentId, DeviceId, EventType, HardwareEvent};
use crate::session::EventProcessor;

use super::protocol::ServerMessage;
use super::registry::{ConnectionId, ConnectionRegistry};

pub struct DeadManSupervisor {
    processor: Arc<Mutex<EventProcessor>>,
    registry: Arc<Mutex<ConnectionRegistry>>,
}

impl DeadManSupervisor {
    pub fn new(
        processor: Arc<Mutex<EventProcessor>>,
        registry: Arc<Mutex<ConnectionRegistry>>,
    ) -> Self {
        Self {
            processor,
            registry,
        }
    }

    /// Broadcast a message, then run the dead-man check when the send
    /// evicted anyone as an implicit disconnect. Transport failures are
    /// removals too, so they get the same guarantee as a closed socket.
    /// Returns the evicted ids.
    pub async fn broadcast(&self, msg: &ServerMessage) -> Vec<ConnectionId> {
        let evicted = self.registry.lock().await.broadcast(msg);
        if !evicted.is_empty() {
            self.on_unregister().await;
        }
        evicted
    }

    /// Check the dead-man condition and force a release if it holds.
    pub async fn on_unregister(&self) {
        if !self.registry.lock().await.is_empty() {
            return;
        }

        let outcome = {
            let mut processor = self.processor.lock().await;
            if !processor.state().clutch_engaged {
                return;
            }
            warn!("last client gone with clutch engaged, forcing release");
            processor.process(&forced_release()).await
        };

        match outcome {
            Ok(outcome) => {
                self.registry
                    .lock()
                    .await
                    .broadcast(&ServerMessage::StateUpdate(outcome.snapshot));
            }
            Err(error) => warn!(%error, "forced release failed to process"),
        }
    }
}

/// The synthesized clutch-release hardware event.
fn forced_release() -> HardwareEvent {
    HardwareEvent {
        timestamp: epoch_ms(),
        device_id: DeviceId::DeviceA,
        component_id: ComponentId::Ring,
        event_type: EventType::Release,
        value: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{LocalComputeRouter, LocalInputOwnership, LocalSpeechPipeline};
    use crate::ipc::protocol::Role;
    use crate::state::{Phase, StateMachine};
    use tokio::sync::mpsc;

    fn processor() -> EventProcessor {
        let (speech, _rx) = LocalSpeechPipeline::new();
        EventProcessor::new(
            StateMachine::new(0.5),
            Box::new(LocalComputeRouter::new(0.5, "local-slm", "cloud-llm")),
            Box::new(speech),
            Box::new(LocalInputOwnership::new()),
        )
    }

    fn ring_press() -> HardwareEvent {
        HardwareEvent {
            timestamp: epoch_ms(),
            device_id: DeviceId::DeviceA,
            component_id: ComponentId::Ring,
            event_type: EventType::Press,
            value: None,
        }
    }

    #[tokio::test]
    async fn test_forced_release_when_last_client_leaves_engaged() {
        let processor = Arc::new(Mutex::new(processor()));
        let registry = Arc::new(Mutex::new(ConnectionRegistry::new(None)));
        let supervisor = DeadManSupervisor::new(processor.clone(), registry.clone());

        let (tx, _rx) = mpsc::channel(8);
        let id = registry
            .lock()
            .await
            .register(Role::Controller, None, tx)
            .unwrap();

        processor.lock().await.process(&ring_press()).await.unwrap();
        assert!(processor.lock().await.state().clutch_engaged);

        registry.lock().await.unregister(id);
        supervisor.on_unregister().await;

        let state = processor.lock().await.state();
        assert_eq!(state.phase, Phase::Idle);
        assert!(!state.clutch_engaged);
    }

    #[tokio::test]
    async fn test_eviction_during_broadcast_forces_release() {
        let processor = Arc::new(Mutex::new(processor()));
        let registry = Arc::new(Mutex::new(ConnectionRegistry::new(None)));
        let supervisor = DeadManSupervisor::new(processor.clone(), registry.clone());

        // A lone controller whose outbound channel is already dead: its
        // socket never closed, so no explicit disconnect will arrive.
        let (tx, rx) = mpsc::channel(8);
        let id = registry
            .lock()
            .await
            .register(Role::Controller, None, tx)
            .unwrap();
        drop(rx);

        let outcome = processor.lock().await.process(&ring_press()).await.unwrap();
        assert!(processor.lock().await.state().clutch_engaged);

        let evicted = supervisor
            .broadcast(&ServerMessage::StateUpdate(outcome.snapshot))
            .await;
        assert_eq!(evicted, vec![id]);
        assert!(registry.lock().await.is_empty());

        // The implicit disconnect still triggers the forced release.
        let state = processor.lock().await.state();
        assert_eq!(state.phase, Phase::Idle);
        assert!(!state.clutch_engaged);
    }

    #[tokio::test]
    async fn test_no_release_while_clients_remain() {
        let processor = Arc::new(Mutex::new(processor()));
        let registry = Arc::new(Mutex::new(ConnectionRegistry::new(None)));
        let supervisor = DeadManSupervisor::new(processor.clone(), registry.clone());

        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        let first = registry
            .lock()
            .await
            .register(Role::Controller, None, tx1)
            .unwrap();
        registry
            .lock()
            .await
            .register(Role::Observer, None, tx2)
            .unwrap();

        processor.lock().await.process(&ring_press()).await.unwrap();

        registry.lock().await.unregister(first);
        supervisor.on_unregister().await;

        // The observer is still attached, so the session stays live.
        assert!(processor.lock().await.state().clutch_engaged);
    }

    #[tokio::test]
    async fn test_idle_session_needs_no_release() {
        let processor = Arc::new(Mutex::new(processor()));
        let registry = Arc::new(Mutex::new(ConnectionRegistry::new(None)));
        let supervisor = DeadManSupervisor::new(processor.clone(), registry.clone());

        supervisor.on_unregister().await;
        assert_eq!(processor.lock().await.state().phase, Phase::Idle);
    }
}
