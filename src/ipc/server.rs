//! Session gateway: Unix domain socket server
//!
//! Accepts client connections, authorizes the controller role, feeds
//! controller events through the event processor, and pushes snapshots
//! to every attached client. Each connection gets a dedicated writer
//! task fed by an outbound channel, so a slow client never holds up
//! the others; inbound frames are handled sequentially per connection,
//! which preserves arrival order within one client's stream.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::session::{EventProcessor, ProcessError};

use super::protocol::{read_frame, write_frame, ClientMessage, Role, ServerMessage};
use super::registry::{ConnectionId, ConnectionRegistry};
use super::supervisor::DeadManSupervisor;

/// Outbound channel depth per connection; a client this far behind is
/// treated as dead by the registry.
const OUTBOUND_BUFFER: usize = 64;

/// The gateway server owning the listening socket
pub struct Gateway {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    processor: Arc<Mutex<EventProcessor>>,
    registry: Arc<Mutex<ConnectionRegistry>>,
    supervisor: Arc<DeadManSupervisor>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Gateway {
    /// Bind the gateway socket.
    pub fn new(
        socket_path: &Path,
        processor: Arc<Mutex<EventProcessor>>,
        registry: Arc<Mutex<ConnectionRegistry>>,
        supervisor: Arc<DeadManSupervisor>,
    ) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Owner-only: the socket carries control of the operator's machine
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(?socket_path, "session gateway listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener: Some(listener),
            processor,
            registry,
            supervisor,
            shutdown_tx,
        })
    }

    /// Run the gateway, accepting connections until shutdown.
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("gateway not initialized")?;

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let processor = Arc::clone(&self.processor);
                    let registry = Arc::clone(&self.registry);
                    let supervisor = Arc::clone(&self.supervisor);
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = handle_client(stream, processor, registry, supervisor) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Gracefully shut down the gateway.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("session gateway shutdown complete");
    }
}

/// Handle one client from attach to disconnect.
async fn handle_client(
    stream: UnixStream,
    processor: Arc<Mutex<EventProcessor>>,
    registry: Arc<Mutex<ConnectionRegistry>>,
    supervisor: Arc<DeadManSupervisor>,
) -> Result<()> {
    let (mut reader, writer) = stream.into_split();

    // The first frame must attach a role; nothing is registered before
    // authorization succeeds.
    let Some((id, role, write_task)) =
        attach(&mut reader, writer, &processor, &registry).await?
    else {
        return Ok(());
    };

    let result = client_loop(id, role, &mut reader, &processor, &registry, &supervisor).await;

    // Disconnect path: unregister, then the dead-man check.
    registry.lock().await.unregister(id);
    supervisor.on_unregister().await;
    write_task.abort();

    result
}

/// Negotiate the attach frame. Returns `None` when the connection was
/// refused (error already sent, socket closed by drop).
async fn attach(
    reader: &mut OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    processor: &Arc<Mutex<EventProcessor>>,
    registry: &Arc<Mutex<ConnectionRegistry>>,
) -> Result<Option<(ConnectionId, Role, tokio::task::JoinHandle<()>)>> {
    let Some(frame) = read_frame(reader).await? else {
        return Ok(None);
    };

    let (role, token) = match serde_json::from_slice::<ClientMessage>(&frame) {
        Ok(ClientMessage::Attach { role, token }) => (role, token),
        Ok(_) => {
            let msg = ServerMessage::Error {
                message: "first message must be ATTACH".into(),
            };
            write_frame(&mut writer, &msg).await?;
            return Ok(None);
        }
        Err(e) => {
            let msg = ServerMessage::Error {
                message: format!("malformed message: {e}"),
            };
            write_frame(&mut writer, &msg).await?;
            return Ok(None);
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);
    let id = match registry
        .lock()
        .await
        .register(role, token.as_deref(), outbound_tx)
    {
        Ok(id) => id,
        Err(e) => {
            // Forced close: the connection never joins the registry.
            let msg = ServerMessage::Error {
                message: e.to_string(),
            };
            write_frame(&mut writer, &msg).await?;
            return Ok(None);
        }
    };

    // Writer task: outbound channel to socket, one per connection, so
    // broadcast fan-out runs in parallel across clients.
    let write_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &msg).await {
                debug!(?e, "outbound write failed, client gone");
                break;
            }
        }
    });

    // Late joiners see live state immediately, not just future deltas.
    let snapshot = processor.lock().await.snapshot().await;
    {
        let mut reg = registry.lock().await;
        reg.unicast(id, ServerMessage::Attached { role });
        reg.unicast(id, ServerMessage::StateUpdate(snapshot));
    }

    Ok(Some((id, role, write_task)))
}

/// Send to one connection. False means it is gone (or was evicted just
/// now), and the caller should treat it as disconnected.
async fn send_to(
    registry: &Arc<Mutex<ConnectionRegistry>>,
    id: ConnectionId,
    msg: ServerMessage,
) -> bool {
    registry.lock().await.unicast(id, msg)
}

/// Sequential per-connection message loop.
async fn client_loop(
    id: ConnectionId,
    role: Role,
    reader: &mut OwnedReadHalf,
    processor: &Arc<Mutex<EventProcessor>>,
    registry: &Arc<Mutex<ConnectionRegistry>>,
    supervisor: &Arc<DeadManSupervisor>,
) -> Result<()> {
    loop {
        let frame = match read_frame(reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(id, "client disconnected");
                return Ok(());
            }
            Err(e) => {
                debug!(id, ?e, "client read failed");
                return Ok(());
            }
        };

        let msg = match serde_json::from_slice::<ClientMessage>(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                // Malformed input: reported to this connection only, no
                // state mutation, no disconnect.
                let delivered = send_to(
                    registry,
                    id,
                    ServerMessage::Error {
                        message: format!("malformed message: {e}"),
                    },
                )
                .await;
                if !delivered {
                    return Ok(());
                }
                continue;
            }
        };

        match msg {
            ClientMessage::Attach { .. } => {
                let delivered = send_to(
                    registry,
                    id,
                    ServerMessage::Error {
                        message: "already attached".into(),
                    },
                )
                .await;
                if !delivered {
                    return Ok(());
                }
            }
            ClientMessage::Ping => {
                if !send_to(registry, id, ServerMessage::Pong).await {
                    return Ok(());
                }
            }
            ClientMessage::GetSnapshot => {
                let snapshot = processor.lock().await.snapshot().await;
                if !send_to(registry, id, ServerMessage::StateUpdate(snapshot)).await {
                    return Ok(());
                }
            }
            ClientMessage::Event { event } => {
                if role != Role::Controller {
                    // Unauthorized role: reported and ignored, the
                    // connection stays open as observer.
                    let delivered = send_to(
                        registry,
                        id,
                        ServerMessage::Error {
                            message: "controller role required to submit events".into(),
                        },
                    )
                    .await;
                    if !delivered {
                        return Ok(());
                    }
                    continue;
                }

                // Global serialization point: the processor mutex
                // orders mutations across all controller connections.
                let outcome = processor.lock().await.process(&event).await;
                match outcome {
                    Ok(outcome) => {
                        debug!(id, latency_ms = outcome.latency_ms, "event processed");
                        // The supervisor broadcast runs the dead-man
                        // check for anyone evicted along the way.
                        let evicted = supervisor
                            .broadcast(&ServerMessage::StateUpdate(outcome.snapshot))
                            .await;
                        if evicted.contains(&id) {
                            return Ok(());
                        }
                    }
                    // Unroutable events are expected hardware noise:
                    // already logged, nothing sent back.
                    Err(ProcessError::Unroutable { .. }) => {}
                }
            }
        }
    }
}
