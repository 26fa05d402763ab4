//! # pipeauth IPC
//!
//! Named-pipe transport for pipeauth queries.
//!
//! - [`TransmissionController`]: server side of one endpoint, in receive,
//!   single-answer or broadcast mode
//! - [`TransmissionLine`]: ordered, retrying client queue per destination
//! - Relay dispatch: queries without a local handler are forwarded along
//!   the routing table
//! - [`TransportService`]: registries of endpoints and lines, with
//!   cooperative shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod controller;
pub mod error;
pub mod handler;
pub mod line;
pub mod relay;
mod server;
pub mod service;
pub mod shutdown;
pub mod transport;

#[cfg(all(test, unix))]
mod end_to_end;

pub use controller::{BroadcastProducer, ControllerMode, ControllerState, TransmissionController};
pub use error::TransportError;
pub use handler::{HandlerError, HandlerSet, PingHandler, PublicKeyHandler, QueryHandler, SenderInfo};
pub use line::{AnswerCallback, TransmissionLine};
pub use relay::{MAX_HOPS, pickup_pipe};
pub use service::{TransportService, TransportServiceBuilder};
pub use shutdown::Shutdown;
pub use transport::{FrameKind, MAX_FRAME_LEN, PeerInfo};
