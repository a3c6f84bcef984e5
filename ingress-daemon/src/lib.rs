//! Controller runtime: manifest source + event loop + control socket.

mod error;
pub mod protocol;
mod runtime;
pub mod source;

pub use error::DaemonError;
pub use protocol::{
    request_status, request_stop, request_sync, send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{run, start_blocking, CycleSummary};
pub use source::{ManifestSource, DEBOUNCE_WINDOW};
