//! Unix domain socket endpoints.

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};

use pipeauth_core::{Destination, SecurityLevel};

use super::{PeerInfo, sanitize_pipe_name};
use crate::error::TransportError;

/// Stream accepted by a listener.
pub type ServerStream = UnixStream;

/// Stream opened by [`connect`].
pub type ClientStream = UnixStream;

/// Socket file for a pipe name.
#[must_use]
pub fn endpoint_path(runtime_dir: &Path, pipe: &str) -> PathBuf {
    runtime_dir.join(format!("{}.sock", sanitize_pipe_name(pipe)))
}

/// A bound endpoint. The socket file is removed on drop.
#[derive(Debug)]
pub struct PipeListener {
    listener: UnixListener,
    path: PathBuf,
}

impl PipeListener {
    /// Bind the endpoint `pipe` with permissions derived from `security`.
    ///
    /// A stale socket file left by a dead process is replaced; a live one
    /// is reported as in use.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::EndpointInUse` or an I/O error.
    pub async fn bind(runtime_dir: &Path, pipe: &str, security: SecurityLevel) -> Result<Self, TransportError> {
        std::fs::create_dir_all(runtime_dir)?;
        let path = endpoint_path(runtime_dir, pipe);

        if path.exists() {
            if UnixStream::connect(&path).await.is_ok() {
                return Err(TransportError::EndpointInUse(pipe.to_string()));
            }
            tracing::debug!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(security.unix_mode()))?;
        tracing::debug!(
            path = %path.display(),
            security = %security,
            mode = %format!("{:o}", security.unix_mode()),
            "endpoint bound"
        );

        Ok(Self { listener, path })
    }

    /// Wait for the next connection.
    ///
    /// # Errors
    ///
    /// Returns the accept error; the listener stays usable.
    pub async fn accept(&mut self) -> Result<(ServerStream, PeerInfo), TransportError> {
        let (stream, _) = self.listener.accept().await?;
        let peer = stream
            .peer_cred()
            .map(|cred| PeerInfo {
                uid: Some(cred.uid()),
                gid: Some(cred.gid()),
                pid: cred.pid(),
            })
            .unwrap_or_default();
        Ok((stream, peer))
    }

    /// Socket file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove socket");
            }
        }
    }
}

/// Open a connection to `destination`.
///
/// # Errors
///
/// Returns `TransportError::EndpointUnavailable` when nothing listens yet,
/// `TransportError::UnsupportedHost` for remote hosts.
pub async fn connect(runtime_dir: &Path, destination: &Destination) -> Result<ClientStream, TransportError> {
    if !destination.is_local() {
        return Err(TransportError::UnsupportedHost(destination.host.clone()));
    }
    let path = endpoint_path(runtime_dir, &destination.pipe);
    UnixStream::connect(&path).await.map_err(|e| match e.kind() {
        ErrorKind::NotFound | ErrorKind::ConnectionRefused => {
            TransportError::EndpointUnavailable(destination.to_string())
        }
        _ => TransportError::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_bind_sets_mode_and_cleans_up() {
        let dir = tempdir().unwrap();
        let listener = PipeListener::bind(dir.path(), "auth", SecurityLevel::INTERNAL).await.unwrap();
        let path = listener.path().to_path_buf();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_live_endpoint_in_use_and_stale_replaced() {
        let dir = tempdir().unwrap();
        let first = PipeListener::bind(dir.path(), "auth", SecurityLevel::LOCAL).await.unwrap();
        assert!(matches!(
            PipeListener::bind(dir.path(), "auth", SecurityLevel::LOCAL).await,
            Err(TransportError::EndpointInUse(_))
        ));
        drop(first);

        // A leftover file nobody listens on.
        std::fs::write(endpoint_path(dir.path(), "auth"), b"").unwrap();
        assert!(PipeListener::bind(dir.path(), "auth", SecurityLevel::LOCAL).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_missing_is_unavailable() {
        let dir = tempdir().unwrap();
        let err = connect(dir.path(), &Destination::local("nobody")).await.unwrap_err();
        assert!(err.is_retryable());

        let err = connect(dir.path(), &Destination::new("remote-host", "auth")).await.unwrap_err();
        assert!(matches!(err, TransportError::UnsupportedHost(_)));
    }

    #[tokio::test]
    async fn test_accept_reports_peer_uid() {
        let dir = tempdir().unwrap();
        let mut listener = PipeListener::bind(dir.path(), "p", SecurityLevel::INTERNAL).await.unwrap();
        let dest = Destination::local("p");
        let client = connect(dir.path(), &dest);
        let (accepted, client) = tokio::join!(listener.accept(), client);
        let (_stream, peer) = accepted.unwrap();
        assert!(client.is_ok());
        assert!(peer.uid.is_some());
    }
}
