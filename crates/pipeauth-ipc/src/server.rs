//! Server loop: accept, serve, retire.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use pipeauth_core::crypto::handshake;
use pipeauth_core::query::{Query, reasons};
use pipeauth_core::{Destination, EncryptionOperator};

use crate::controller::{ControllerMode, ControllerState, TransmissionController};
use crate::error::TransportError;
use crate::handler::SenderInfo;
use crate::relay::{self, RouteDecision};
use crate::service::{ServiceInner, TransportService};
use crate::transport::{FrameKind, PeerInfo, PipeListener, ServerStream, read_frame, write_query};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Drive `controller` until it is stopped, expires, or shutdown is signalled.
///
/// Connection failures are logged and isolated; the endpoint keeps
/// accepting. Boxed because relayed answers spawn further server loops.
pub(crate) fn run(
    service: TransportService,
    controller: Arc<TransmissionController>,
    listener: PipeListener,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(accept_loop(service, controller, listener))
}

async fn accept_loop(service: TransportService, controller: Arc<TransmissionController>, mut listener: PipeListener) {
    let shutdown = service.inner().shutdown.clone();
    let stop = controller.stop_signal().clone();
    let budget = service.inner().config.endpoint.session_budget();
    let deadline = controller.ttl().map(|ttl| Instant::now() + ttl);

    controller.set_state(ControllerState::WaitingConnection);
    tracing::info!(endpoint = controller.name(), mode = ?controller.mode(), "endpoint accepting");

    loop {
        if controller.is_stopped() || controller.is_expired() {
            break;
        }

        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            () = stop.cancelled() => break,
            () = shutdown.cancelled() => break,
            () = sleep_until(deadline) => {
                tracing::info!(endpoint = controller.name(), "answer not collected in time");
                controller.expire();
                break;
            }
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(endpoint = controller.name(), error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        controller.set_state(ControllerState::Connected);
        tracing::debug!(endpoint = controller.name(), pid = ?peer.pid, uid = ?peer.uid, "client connected");

        let outcome = tokio::select! {
            outcome = tokio::time::timeout(budget, serve_connection(&service, &controller, stream, peer)) => {
                outcome.unwrap_or(Err(TransportError::SessionTimeout(budget)))
            }
            () = shutdown.cancelled() => Err(TransportError::Cancelled),
        };
        controller.record_connection();

        match outcome {
            Ok(()) => tracing::debug!(endpoint = controller.name(), "client disconnected"),
            Err(TransportError::Cancelled) => break,
            Err(e) => tracing::warn!(endpoint = controller.name(), error = %e, "connection dropped"),
        }

        if matches!(controller.mode(), ControllerMode::Answer) && !controller.has_pending_answer() {
            break;
        }
        controller.set_state(ControllerState::WaitingConnection);
    }

    controller.set_state(ControllerState::Retiring);
    drop(listener);
    service.release_endpoint(&controller).await;
    controller.set_state(ControllerState::Closed);
    tracing::info!(
        endpoint = controller.name(),
        connections = controller.connections_served(),
        "endpoint closed"
    );
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn serve_connection(
    service: &TransportService,
    controller: &TransmissionController,
    mut stream: ServerStream,
    peer: PeerInfo,
) -> Result<(), TransportError> {
    match controller.mode() {
        ControllerMode::Receive => serve_requests(service, controller, &mut stream, peer).await,
        ControllerMode::Answer => {
            let Some((answer, reply_key)) = controller.peek_answer() else {
                return Ok(());
            };
            controller.set_state(ControllerState::Serving);
            let answer = seal_answer(service.inner(), answer, reply_key.as_deref());
            write_query(&mut stream, FrameKind::Answer, &answer).await?;
            // A reset here means the client went away without reading.
            read_frame(&mut stream).await?;
            controller.take_answer();
            Ok(())
        }
        ControllerMode::Broadcast(producer) => {
            controller.set_state(ControllerState::Serving);
            write_query(&mut stream, FrameKind::Answer, &producer()).await
        }
    }
}

async fn serve_requests(
    service: &TransportService,
    controller: &TransmissionController,
    stream: &mut ServerStream,
    peer: PeerInfo,
) -> Result<(), TransportError> {
    while let Some((kind, payload)) = read_frame(stream).await? {
        controller.set_state(ControllerState::Serving);
        let query = Query::decode(&payload)?;

        match kind {
            FrameKind::Answer => {
                return Err(TransportError::UnexpectedFrame("answer sent to a receiving endpoint".into()));
            }
            FrameKind::OneWay => {
                let outcome = dispatch(service, controller, peer, query, false).await;
                if outcome.is_error() {
                    tracing::warn!(endpoint = controller.name(), answer = %outcome, "one-way query failed");
                }
            }
            FrameKind::Duplex => {
                let answer = dispatch(service, controller, peer, query, true).await;
                write_query(stream, FrameKind::Answer, &answer).await?;
            }
        }
        controller.set_state(ControllerState::Connected);
    }
    Ok(())
}

/// Open, execute or forward one query and produce its answer.
async fn dispatch(
    service: &TransportService,
    controller: &TransmissionController,
    peer: PeerInfo,
    mut query: Query,
    duplex: bool,
) -> Query {
    let inner = service.inner();
    let encrypted = query.is_sealed();

    if let Err(e) = handshake::open(&mut query, &inner.keyring, &inner.operators) {
        tracing::warn!(endpoint = controller.name(), error = %e, "could not open envelope");
        return Query::error(reasons::HANDSHAKE, e.to_string());
    }
    let reply_key = match handshake::reply_key(&query, &inner.operators) {
        Ok(key) => key,
        Err(e) => {
            tracing::warn!(endpoint = controller.name(), error = %e, "invalid reply key");
            return Query::error(reasons::HANDSHAKE, e.to_string());
        }
    };
    handshake::strip_reply_key(&mut query);

    let sender = SenderInfo {
        endpoint: controller.name().to_string(),
        peer,
        correlation: query.correlation(),
        encrypted,
    };
    tracing::debug!(endpoint = controller.name(), query = %query, encrypted, "received query");

    let answer = respond(service, controller, &sender, query, reply_key.clone(), duplex).await;
    seal_answer(inner, answer, reply_key.as_deref())
}

async fn respond(
    service: &TransportService,
    controller: &TransmissionController,
    sender: &SenderInfo,
    query: Query,
    reply_key: Option<Arc<dyn EncryptionOperator>>,
    duplex: bool,
) -> Query {
    let inner = service.inner();

    if let Some(handler) = inner.handlers.find(&query) {
        tracing::debug!(endpoint = controller.name(), handler = handler.name(), "executing");
        return match handler.execute(sender, &query).await {
            Ok(Some(answer)) => answer,
            Ok(None) => Query::ack(),
            Err(e) => {
                tracing::warn!(handler = handler.name(), error = %e, "handler failed");
                Query::error(reasons::HANDLER, e.to_string())
            }
        };
    }

    let local = Destination::local(controller.name());
    match relay::decide(&inner.routes, &query, &local) {
        RouteDecision::Forward(instruction) => {
            relay::forward(service, instruction.clone(), query, reply_key, duplex).await
        }
        RouteDecision::Local => {
            tracing::debug!(endpoint = controller.name(), query = %query, "no handler");
            Query::error(reasons::NO_HANDLER, "no handler for query")
        }
    }
}

/// Seal an answer for the requester when its reply key is known.
fn seal_answer(inner: &ServiceInner, mut answer: Query, reply_key: Option<&dyn EncryptionOperator>) -> Query {
    let Some(key) = reply_key else {
        return answer;
    };
    let crypto = &inner.config.crypto;
    match handshake::seal(&mut answer, key, &inner.operators, &crypto.symmetric, crypto.symmetric_lifetime_secs) {
        Ok(()) => answer,
        Err(e) => {
            tracing::warn!(error = %e, "could not seal answer");
            Query::error(reasons::HANDSHAKE, e.to_string())
        }
    }
}
