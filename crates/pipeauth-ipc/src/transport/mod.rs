//! Pipe transport and framing.
//!
//! Endpoints are Unix domain sockets under the runtime directory on Unix
//! and named pipes on Windows. Every message travels in one frame:
//!
//! ```text
//! [u32 LE payload length][u8 kind][payload]
//! ```
//!
//! A `Duplex` frame always receives exactly one `Answer` frame on the same
//! connection; a `OneWay` frame never does.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::{ClientStream, PipeListener, ServerStream, connect, endpoint_path};
#[cfg(windows)]
pub use windows::{ClientStream, PipeListener, ServerStream, connect, pipe_name};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use pipeauth_core::Query;

use crate::error::TransportError;

/// Largest accepted frame payload.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Request without an answer.
    OneWay = 1,
    /// Request expecting exactly one answer.
    Duplex = 2,
    /// Answer to a duplex request, or a pushed message.
    Answer = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::OneWay),
            2 => Ok(Self::Duplex),
            3 => Ok(Self::Answer),
            other => Err(TransportError::UnexpectedFrame(format!("unknown kind {other}"))),
        }
    }
}

/// Peer process identity, where the platform reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerInfo {
    /// Peer user id.
    pub uid: Option<u32>,
    /// Peer group id.
    pub gid: Option<u32>,
    /// Peer process id.
    pub pid: Option<i32>,
}

/// Write one frame.
///
/// # Errors
///
/// Returns `TransportError::FrameTooLarge` or an I/O error.
pub async fn write_frame<W>(writer: &mut W, kind: FrameKind, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    let len = u32::try_from(payload.len()).map_err(|_| TransportError::FrameTooLarge(payload.len()))?;

    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&len.to_le_bytes());
    header[4] = kind as u8;

    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed cleanly between frames.
///
/// # Errors
///
/// Returns error for truncated frames, oversize lengths or unknown kinds.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<(FrameKind, Vec<u8>)>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    if reader.read(&mut header[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..]).await?;

    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    let kind = FrameKind::try_from(header[4])?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some((kind, payload)))
}

/// Encode and write a query.
///
/// # Errors
///
/// Returns error if encoding or the write fails.
pub async fn write_query<W>(writer: &mut W, kind: FrameKind, query: &Query) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = query.encode()?;
    write_frame(writer, kind, &bytes).await
}

/// Read and decode a query.
///
/// # Errors
///
/// Returns `TransportError::MalformedQuery` when the payload does not decode.
pub async fn read_query<R>(reader: &mut R) -> Result<Option<(FrameKind, Query)>, TransportError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some((kind, payload)) => Ok(Some((kind, Query::decode(&payload)?))),
        None => Ok(None),
    }
}

/// Read the single answer frame of a duplex exchange.
///
/// # Errors
///
/// Returns `TransportError::NoAnswer` if the peer closes first, or
/// `TransportError::UnexpectedFrame` for a non-answer frame.
pub async fn read_answer<R>(reader: &mut R) -> Result<Query, TransportError>
where
    R: AsyncRead + Unpin,
{
    match read_query(reader).await? {
        Some((FrameKind::Answer, answer)) => Ok(answer),
        Some((kind, _)) => Err(TransportError::UnexpectedFrame(format!("{kind:?} instead of answer"))),
        None => Err(TransportError::NoAnswer),
    }
}

/// Replace characters outside `[A-Za-z0-9._-]` so a pipe name is safe as
/// a file name or pipe path component.
#[must_use]
pub fn sanitize_pipe_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
