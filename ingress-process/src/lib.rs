//! Managed proxy process: PID resolution, lifecycle supervisor, server-state
//! snapshots and the runtime control channel.

mod error;
pub mod ops;
pub mod pid;
pub mod runtime;
pub mod snapshot;
pub mod supervisor;

pub use error::ProcessError;
pub use ops::{OsProcessOps, ProcessOps, ProxySignal};
pub use pid::{resolve, Liveness};
pub use runtime::{RuntimeApi, SocketRuntime, SHOW_SERVERS_STATE};
pub use snapshot::StateSnapshotter;
pub use supervisor::{ServiceAction, ServiceControl, ServiceOutcome, Supervisor};
