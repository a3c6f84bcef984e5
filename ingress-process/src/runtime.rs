//! Runtime control channel client.
//!
//! The proxy exposes a line-oriented command interface on a Unix socket: one
//! command per connection, newline terminated; the reply is everything read
//! until the proxy closes the connection.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use crate::error::ProcessError;

pub const SHOW_SERVERS_STATE: &str = "show servers state";

pub trait RuntimeApi: Send + Sync {
    /// Execute one raw command and return the proxy's verbatim reply.
    fn execute_raw(&self, command: &str) -> Result<String, ProcessError>;
}

#[derive(Debug, Clone)]
pub struct SocketRuntime {
    socket: PathBuf,
}

impl SocketRuntime {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn runtime_err(&self, source: std::io::Error) -> ProcessError {
        ProcessError::Runtime {
            socket: self.socket.clone(),
            source,
        }
    }
}

impl RuntimeApi for SocketRuntime {
    fn execute_raw(&self, command: &str) -> Result<String, ProcessError> {
        let mut stream = UnixStream::connect(&self.socket).map_err(|e| self.runtime_err(e))?;

        stream
            .write_all(command.as_bytes())
            .map_err(|e| self.runtime_err(e))?;
        stream.write_all(b"\n").map_err(|e| self.runtime_err(e))?;
        stream.flush().map_err(|e| self.runtime_err(e))?;
        // Half-close so the proxy sees the end of the request.
        stream
            .shutdown(Shutdown::Write)
            .map_err(|e| self.runtime_err(e))?;

        let mut reply = String::new();
        stream
            .read_to_string(&mut reply)
            .map_err(|e| self.runtime_err(e))?;
        if reply.is_empty() {
            return Err(ProcessError::EmptyRuntimeResponse(command.to_string()));
        }
        Ok(reply)
    }
}
