//! Connection registry
//!
//! Tracks every attached client with its role and outbound channel,
//! enforces the controller authorization policy, and fans snapshots out
//! with partial-failure isolation: one dead client never blocks
//! delivery to the rest.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::{Role, ServerMessage};

pub type ConnectionId = u64;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// CONTROLLER requested without the configured shared secret
    #[error("controller authorization failed")]
    Unauthorized,
}

struct ConnectionHandle {
    role: Role,
    sender: mpsc::Sender<ServerMessage>,
}

/// Live connection set, keyed by a monotonically assigned id
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    controller_token: Option<String>,
    next_id: ConnectionId,
}

impl ConnectionRegistry {
    pub fn new(controller_token: Option<String>) -> Self {
        Self {
            connections: HashMap::new(),
            controller_token,
            next_id: 1,
        }
    }

    /// Register a connection after checking the authorization policy.
    ///
    /// Controllers must present the configured shared secret when one
    /// is set; observers attach without credentials. An unauthorized
    /// connection is never added and so never becomes a broadcast
    /// recipient.
    pub fn register(
        &mut self,
        role: Role,
        token: Option<&str>,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Result<ConnectionId, RegistryError> {
        if role == Role::Controller {
            if let Some(expected) = self.controller_token.as_deref() {
                if token != Some(expected) {
                    warn!("controller attach rejected: bad or missing token");
                    return Err(RegistryError::Unauthorized);
                }
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        self.connections.insert(id, ConnectionHandle { role, sender });
        info!(id, %role, connections = self.connections.len(), "client attached");
        Ok(id)
    }

    /// Remove a connection. Returns true if it was present.
    pub fn unregister(&mut self, id: ConnectionId) -> bool {
        let removed = self.connections.remove(&id).is_some();
        if removed {
            info!(id, connections = self.connections.len(), "client detached");
        }
        removed
    }

    pub fn role(&self, id: ConnectionId) -> Option<Role> {
        self.connections.get(&id).map(|c| c.role)
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Send to every live connection. A failed send means the client is
    /// gone (or hopelessly backed up) and is removed as an implicit
    /// disconnect; delivery to the others proceeds. Returns the evicted
    /// ids so the caller can run the dead-man check on them.
    pub fn broadcast(&mut self, msg: &ServerMessage) -> Vec<ConnectionId> {
        let mut evicted = Vec::new();
        for (id, conn) in &self.connections {
            if conn.sender.try_send(msg.clone()).is_err() {
                evicted.push(*id);
            }
        }
        for id in &evicted {
            debug!(id, "dropping dead connection during broadcast");
            self.connections.remove(id);
        }
        evicted
    }

    /// Send to one connection. Returns false if the connection is gone;
    /// it is then removed from the set.
    pub fn unicast(&mut self, id: ConnectionId, msg: ServerMessage) -> bool {
        let Some(conn) = self.connections.get(&id) else {
            return false;
        };
        if conn.sender.try_send(msg).is_err() {
            debug!(id, "dropping dead connection during unicast");
            self.connections.remove(&id);
            return false;
        }
        true
    }
}
