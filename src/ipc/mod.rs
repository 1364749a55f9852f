//! IPC module: wire protocol, connection registry, dead-man supervisor,
//! and the session gateway server

pub mod protocol;
pub mod registry;
pub mod server;
pub mod supervisor;

pub use registry::ConnectionRegistry;
pub use server::Gateway;
pub use supervisor::DeadManSupervisor;
