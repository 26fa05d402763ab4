//! Windows named pipe endpoints.
//!
//! Security levels are not translated into pipe ACLs here; the pipe uses
//! the default descriptor of the creating process.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions};

use pipeauth_core::{Destination, SecurityLevel};

use super::{PeerInfo, sanitize_pipe_name};
use crate::error::TransportError;

/// Stream accepted by a listener.
pub type ServerStream = NamedPipeServer;

/// Stream opened by [`connect`].
pub type ClientStream = NamedPipeClient;

// ERROR_PIPE_BUSY
const PIPE_BUSY: i32 = 231;

/// Full pipe path for a destination.
#[must_use]
pub fn pipe_name(destination: &Destination) -> String {
    let host = if destination.is_local() { "." } else { destination.host.as_str() };
    format!(r"\\{host}\pipe\pipeauth.{}", sanitize_pipe_name(&destination.pipe))
}

/// A bound endpoint holding the next server instance.
#[derive(Debug)]
pub struct PipeListener {
    name: String,
    next: NamedPipeServer,
}

impl PipeListener {
    /// Create the first instance of the named pipe `pipe`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::EndpointInUse` if another process owns the
    /// name.
    pub async fn bind(_runtime_dir: &Path, pipe: &str, security: SecurityLevel) -> Result<Self, TransportError> {
        let name = pipe_name(&Destination::local(pipe));
        let next = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&name)
            .map_err(|e| match e.kind() {
                ErrorKind::PermissionDenied => TransportError::EndpointInUse(pipe.to_string()),
                _ => TransportError::Io(e),
            })?;
        tracing::debug!(pipe = %name, security = %security, "endpoint bound");
        Ok(Self { name, next })
    }

    /// Wait for the next connection.
    ///
    /// # Errors
    ///
    /// Returns the connect error; the listener stays usable.
    pub async fn accept(&mut self) -> Result<(ServerStream, PeerInfo), TransportError> {
        self.next.connect().await?;
        let fresh = ServerOptions::new().create(&self.name)?;
        let connected = std::mem::replace(&mut self.next, fresh);
        Ok((connected, PeerInfo::default()))
    }
}

/// Open a connection to `destination`.
///
/// # Errors
///
/// Returns `TransportError::EndpointUnavailable` when the pipe does not
/// exist or stays busy.
pub async fn connect(_runtime_dir: &Path, destination: &Destination) -> Result<ClientStream, TransportError> {
    let name = pipe_name(destination);
    for _ in 0..5 {
        match ClientOptions::new().open(&name) {
            Ok(client) => return Ok(client),
            Err(e) if e.raw_os_error() == Some(PIPE_BUSY) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TransportError::EndpointUnavailable(destination.to_string()));
            }
            Err(e) => return Err(TransportError::Io(e)),
        }
    }
    Err(TransportError::EndpointUnavailable(destination.to_string()))
}
