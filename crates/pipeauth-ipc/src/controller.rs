//! Server-side transmission controllers.
//!
//! A controller owns one endpoint's connection lifecycle:
//!
//! ```text
//! Created -> WaitingConnection -> Connected -> Serving -> Retiring -> Closed
//!                  ^                              |
//!                  +------------------------------+  (receive / broadcast)
//! ```
//!
//! Answer controllers are one-shot: once a client has read the answer and
//! hung up they retire. A connection that fails before that leaves the answer
//! queued for the next one.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use pipeauth_core::query::Query;
use pipeauth_core::{EncryptionOperator, SecurityLevel};

use crate::error::TransportError;
use crate::shutdown::Shutdown;

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Built, endpoint not yet accepting.
    Created,
    /// Accepting; no client connected.
    WaitingConnection,
    /// A client is connected.
    Connected,
    /// A message is being read, dispatched or written.
    Serving,
    /// No longer accepting; tearing down.
    Retiring,
    /// Endpoint released.
    Closed,
}

/// Produces the message pushed to each broadcast subscriber.
pub type BroadcastProducer = Arc<dyn Fn() -> Query + Send + Sync>;

/// What a controller does with each connection.
#[derive(Clone)]
pub enum ControllerMode {
    /// Read requests, dispatch them, answer duplex ones.
    Receive,
    /// Write one queued answer until a client reads it, then retire.
    Answer,
    /// Write the producer's message to every client, never reading.
    Broadcast(BroadcastProducer),
}

impl fmt::Debug for ControllerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Receive => "Receive",
            Self::Answer => "Answer",
            Self::Broadcast(_) => "Broadcast",
        })
    }
}

struct QueuedAnswer {
    answer: Query,
    reply_key: Option<Arc<dyn EncryptionOperator>>,
}

/// Owner of one pipe endpoint.
///
/// The same instance serves every successive connection on its endpoint
/// until it is stopped or expires.
pub struct TransmissionController {
    name: String,
    security: SecurityLevel,
    mode: ControllerMode,
    state: watch::Sender<ControllerState>,
    stop: Shutdown,
    expired: AtomicBool,
    connections: AtomicU64,
    ttl: Option<Duration>,
    answer: Mutex<Option<QueuedAnswer>>,
}

impl TransmissionController {
    pub(crate) fn new(name: impl Into<String>, security: SecurityLevel, mode: ControllerMode) -> Self {
        let (state, _) = watch::channel(ControllerState::Created);
        Self {
            name: name.into(),
            security,
            mode,
            state,
            stop: Shutdown::new(),
            expired: AtomicBool::new(false),
            connections: AtomicU64::new(0),
            ttl: None,
            answer: Mutex::new(None),
        }
    }

    pub(crate) fn answering(
        name: impl Into<String>,
        security: SecurityLevel,
        answer: Query,
        reply_key: Option<Arc<dyn EncryptionOperator>>,
        ttl: Duration,
    ) -> Self {
        let mut controller = Self::new(name, security, ControllerMode::Answer);
        controller.ttl = Some(ttl);
        controller.answer = Mutex::new(Some(QueuedAnswer { answer, reply_key }));
        controller
    }

    /// Endpoint pipe name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Security level the endpoint was created with.
    #[must_use]
    pub const fn security(&self) -> SecurityLevel {
        self.security
    }

    /// Operating mode.
    #[must_use]
    pub const fn mode(&self) -> &ControllerMode {
        &self.mode
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Wait until the controller reaches `target`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::NoAnswer` if the state is not reached in time.
    pub async fn wait_for_state(&self, target: ControllerState, timeout: Duration) -> Result<(), TransportError> {
        let mut rx = self.state.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|state| *state == target)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::NoAnswer),
        }
    }

    /// Number of connections served so far.
    #[must_use]
    pub fn connections_served(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Ask the server loop to stop accepting.
    pub fn stop(&self) {
        self.stop.trigger();
    }

    /// Whether [`stop`](Self::stop) was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_triggered()
    }

    /// Mark the controller expired; it retires after the current connection.
    pub fn expire(&self) {
        self.expired.store(true, Ordering::Release);
    }

    /// Whether the controller has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    /// Whether the endpoint is done for good.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self.state(), ControllerState::Retiring | ControllerState::Closed)
    }

    pub(crate) fn set_state(&self, state: ControllerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::trace!(endpoint = %self.name, from = ?previous, to = ?state, "controller state");
        }
    }

    pub(crate) fn stop_signal(&self) -> &Shutdown {
        &self.stop
    }

    pub(crate) const fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub(crate) fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// A copy of the queued answer, left in place.
    pub(crate) fn peek_answer(&self) -> Option<(Query, Option<Arc<dyn EncryptionOperator>>)> {
        let slot = self.answer.lock().ok()?;
        slot.as_ref().map(|queued| (queued.answer.clone(), queued.reply_key.clone()))
    }

    /// Take the queued answer; only the first caller gets it.
    pub(crate) fn take_answer(&self) -> Option<(Query, Option<Arc<dyn EncryptionOperator>>)> {
        let mut slot = self.answer.lock().ok()?;
        slot.take().map(|queued| (queued.answer, queued.reply_key))
    }

    /// Whether an answer is still waiting to be collected.
    #[must_use]
    pub fn has_pending_answer(&self) -> bool {
        self.answer.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }
}

impl fmt::Debug for TransmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransmissionController")
            .field("name", &self.name)
            .field("security", &self.security)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("connections", &self.connections_served())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_transitions_are_observable() {
        let controller = Arc::new(TransmissionController::new(
            "auth",
            SecurityLevel::INTERNAL,
            ControllerMode::Receive,
        ));
        assert_eq!(controller.state(), ControllerState::Created);

        let watcher = controller.clone();
        let waiter = tokio::spawn(async move {
            watcher
                .wait_for_state(ControllerState::Serving, Duration::from_secs(1))
                .await
        });
        controller.set_state(ControllerState::WaitingConnection);
        controller.set_state(ControllerState::Serving);
        waiter.await.unwrap().unwrap();

        assert!(matches!(
            controller
                .wait_for_state(ControllerState::Closed, Duration::from_millis(20))
                .await,
            Err(TransportError::NoAnswer)
        ));
    }

    #[test]
    fn test_answer_peeked_until_taken_once() {
        let controller = TransmissionController::answering(
            "answer.a.1",
            SecurityLevel::INTERNAL,
            Query::ack(),
            None,
            Duration::from_secs(5),
        );
        assert!(controller.has_pending_answer());
        assert!(controller.peek_answer().is_some());
        assert!(controller.has_pending_answer());
        assert!(controller.take_answer().is_some());
        assert!(controller.take_answer().is_none());
        assert!(!controller.has_pending_answer());
    }

    #[test]
    fn test_stop_and_expire_flags() {
        let controller = TransmissionController::new("x", SecurityLevel::LOCAL, ControllerMode::Receive);
        assert!(!controller.is_stopped());
        assert!(!controller.is_expired());
        controller.stop();
        controller.expire();
        assert!(controller.is_stopped());
        assert!(controller.is_expired());
        assert!(format!("{controller:?}").contains("Receive"));
    }
}
