//! Client-side transmission lines.
//!
//! One line per destination. A single worker drains the line's queue in
//! FIFO order, so the destination observes queries in enqueue order. An
//! unavailable endpoint keeps the head of the queue in place and is retried
//! after the configured interval; other failures complete the query with an
//! error and the line moves on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, oneshot};
use tokio::time::{Instant, timeout};

use pipeauth_core::crypto::handshake;
use pipeauth_core::query::{Query, names, new_exchange_id, reasons, verbs};
use pipeauth_core::{Destination, EncryptionOperator, Instruction};

use crate::error::TransportError;
use crate::relay::MAX_HOPS;
use crate::service::{ServiceInner, TransportService};
use crate::transport::{self, FrameKind, read_answer, write_query};

const MAX_KEY_FETCH_BACKOFF: Duration = Duration::from_secs(5);

/// Receives the outcome of a duplex request.
pub type AnswerCallback = Box<dyn FnOnce(Result<Query, TransportError>) + Send>;

pub(crate) enum Reply {
    /// One-way, nobody waits.
    Forget,
    /// One-way, the caller waits for delivery.
    Delivered(oneshot::Sender<Result<(), TransportError>>),
    /// Duplex, the answer goes to the callback.
    Answer(AnswerCallback),
}

impl Reply {
    const fn is_duplex(&self) -> bool {
        matches!(self, Self::Answer(_))
    }

    fn complete(self, result: Result<Option<Query>, TransportError>) {
        match self {
            Self::Forget => {}
            Self::Delivered(tx) => {
                let _ = tx.send(result.map(|_| ()));
            }
            Self::Answer(callback) => callback(result.and_then(|answer| answer.ok_or(TransportError::NoAnswer))),
        }
    }
}

struct Pending {
    query: Query,
    reply: Reply,
    attempts: u32,
}

struct Queue {
    items: VecDeque<Pending>,
    closed: bool,
}

/// Ordered outbound queue to one destination.
pub struct TransmissionLine {
    destination: Destination,
    policy: Option<Instruction>,
    queue: Mutex<Queue>,
    wake: Notify,
    closed: AtomicBool,
    attempts: AtomicU64,
    sent: AtomicU64,
}

impl TransmissionLine {
    pub(crate) fn new(destination: Destination, policy: Option<Instruction>) -> Self {
        Self {
            destination,
            policy,
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
                closed: false,
            }),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            attempts: AtomicU64::new(0),
            sent: AtomicU64::new(0),
        }
    }

    /// Destination served by this line.
    #[must_use]
    pub const fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Instruction supplying encryption and credentials, if any.
    #[must_use]
    pub const fn policy(&self) -> Option<&Instruction> {
        self.policy.as_ref()
    }

    /// Queries waiting to be sent.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().items.len()
    }

    /// Transmission attempts so far, retries included.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Queries delivered so far.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Whether the line stopped accepting queries.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting queries. Queued ones fail with `Closed`.
    pub fn close(&self) {
        let mut queue = self.lock();
        queue.closed = true;
        self.closed.store(true, Ordering::Release);
        drop(queue);
        self.wake.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, query: Query, reply: Reply) {
        let mut queue = self.lock();
        if queue.closed {
            drop(queue);
            reply.complete(Err(TransportError::Closed));
            return;
        }
        queue.items.push_back(Pending {
            query,
            reply,
            attempts: 0,
        });
        drop(queue);
        self.wake.notify_one();
    }

    fn requeue_front(&self, pending: Pending) {
        self.lock().items.push_front(pending);
    }

    fn drain(&self) -> Vec<Pending> {
        self.lock().items.drain(..).collect()
    }

    async fn next(&self) -> Option<Pending> {
        loop {
            let notified = self.wake.notified();
            {
                let mut queue = self.lock();
                if queue.closed {
                    return None;
                }
                if let Some(pending) = queue.items.pop_front() {
                    return Some(pending);
                }
            }
            notified.await;
        }
    }

    /// Worker loop; runs until the line is closed or shutdown is signalled.
    pub(crate) async fn run(self: Arc<Self>, service: TransportService) {
        let shutdown = service.inner().shutdown.clone();
        let client = service.inner().config.client.clone();
        tracing::debug!(destination = %self.destination, "line started");

        loop {
            let next = tokio::select! {
                next = self.next() => next,
                () = shutdown.cancelled() => None,
            };
            let Some(mut pending) = next else { break };

            pending.attempts += 1;
            self.attempts.fetch_add(1, Ordering::Relaxed);

            let outcome = tokio::select! {
                outcome = self.transmit(&service, &pending.query, pending.reply.is_duplex()) => Some(outcome),
                () = shutdown.cancelled() => None,
            };
            let Some(outcome) = outcome else {
                pending.reply.complete(Err(TransportError::Cancelled));
                break;
            };

            match outcome {
                Ok(answer) => {
                    self.sent.fetch_add(1, Ordering::Relaxed);
                    pending.reply.complete(Ok(answer));
                }
                Err(e) if e.is_retryable() && (client.max_attempts == 0 || pending.attempts < client.max_attempts) => {
                    tracing::debug!(
                        destination = %self.destination,
                        attempt = pending.attempts,
                        "endpoint unavailable, retrying"
                    );
                    self.requeue_front(pending);
                    tokio::select! {
                        () = tokio::time::sleep(client.retry_interval()) => {}
                        () = shutdown.cancelled() => break,
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        destination = %self.destination,
                        attempts = pending.attempts,
                        error = %e,
                        "query failed"
                    );
                    pending.reply.complete(Err(e));
                }
            }
        }

        self.close();
        let cancelled = shutdown.is_triggered();
        let abandoned = self.drain();
        if !abandoned.is_empty() {
            tracing::info!(destination = %self.destination, count = abandoned.len(), "abandoning queued queries");
        }
        for pending in abandoned {
            let err = if cancelled { TransportError::Cancelled } else { TransportError::Closed };
            pending.reply.complete(Err(err));
        }
        tracing::debug!(destination = %self.destination, "line stopped");
    }

    /// One attempt at delivering `query`.
    async fn transmit(
        &self,
        service: &TransportService,
        query: &Query,
        duplex: bool,
    ) -> Result<Option<Query>, TransportError> {
        let inner = service.inner();
        let mut query = query.clone();

        if !query.is_sealed() {
            if duplex {
                query.set(names::FROM, inner.local_name.clone());
                query.set(names::EXCHANGE, new_exchange_id());
            }
            if let Some(policy) = &self.policy {
                policy.apply_credentials(&mut query);
                if policy.encrypt {
                    let peer = self.peer_key(inner).await?;
                    if duplex {
                        let own = inner.keyring.current()?;
                        handshake::attach_reply_key(&mut query, own.as_ref());
                    }
                    let crypto = &inner.config.crypto;
                    handshake::seal(
                        &mut query,
                        peer.as_ref(),
                        &inner.operators,
                        &crypto.symmetric,
                        crypto.symmetric_lifetime_secs,
                    )?;
                }
            }
        }

        let mut stream = transport::connect(&inner.runtime_dir, &self.destination).await?;
        if !duplex {
            write_query(&mut stream, FrameKind::OneWay, &query).await?;
            tracing::trace!(destination = %self.destination, "one-way query sent");
            return Ok(None);
        }

        write_query(&mut stream, FrameKind::Duplex, &query).await?;
        let answer = timeout(inner.config.client.answer_timeout(), read_answer(&mut stream))
            .await
            .map_err(|_| TransportError::NoAnswer)??;
        drop(stream);
        self.settle(inner, answer).await.map(Some)
    }

    /// Open the answer, lift errors and follow relay pickups.
    async fn settle(&self, inner: &ServiceInner, mut answer: Query) -> Result<Query, TransportError> {
        let deadline = Instant::now() + inner.config.client.answer_timeout();

        for _ in 0..=MAX_HOPS {
            handshake::open(&mut answer, &inner.keyring, &inner.operators)?;
            if answer.is_error() {
                let err = TransportError::remote(&answer);
                if answer.value(names::REASON) == Some(reasons::HANDSHAKE) {
                    inner.peer_keys.invalidate(&self.destination.to_string());
                }
                return Err(err);
            }
            if !answer.is_verb(verbs::RELAYED) {
                return Ok(answer);
            }
            let Some(pickup) = answer.value(names::PICKUP) else {
                return Err(TransportError::UnexpectedFrame("relayed answer without pickup".into()));
            };
            let pickup = self.destination.sibling(pickup);
            tracing::debug!(destination = %self.destination, pickup = %pickup, "collecting relayed answer");
            answer = collect(inner, &pickup, deadline).await?;
        }

        Err(TransportError::Remote {
            reason: reasons::HOPS.to_string(),
            detail: format!("answer relayed more than {MAX_HOPS} times"),
        })
    }

    /// The destination's public key, from the cache or fetched.
    async fn peer_key(&self, inner: &ServiceInner) -> Result<Arc<dyn EncryptionOperator>, TransportError> {
        let peer = self.destination.to_string();
        if let Some(key) = inner.peer_keys.get_valid(&peer) {
            return Ok(key);
        }

        let crypto = &inner.config.crypto;
        let retries = crypto.key_fetch_retries.max(1);
        let mut backoff = crypto.key_fetch_backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match fetch_public_key(inner, &self.destination).await {
                Ok(key) => {
                    tracing::debug!(destination = %self.destination, expires = %key.expiry_time(), "fetched public key");
                    inner.peer_keys.insert(peer, key.clone());
                    return Ok(key);
                }
                Err(e @ TransportError::EndpointUnavailable(_)) => return Err(e),
                Err(e) if attempt < retries => {
                    tracing::debug!(destination = %self.destination, attempt, error = %e, "public key fetch failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_KEY_FETCH_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for TransmissionLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmissionLine")
            .field("destination", &self.destination)
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

async fn fetch_public_key(
    inner: &ServiceInner,
    destination: &Destination,
) -> Result<Arc<dyn EncryptionOperator>, TransportError> {
    let mut stream = transport::connect(&inner.runtime_dir, destination).await?;
    write_query(&mut stream, FrameKind::Duplex, &handshake::public_key_request()).await?;
    let answer = timeout(inner.config.client.answer_timeout(), read_answer(&mut stream))
        .await
        .map_err(|_| TransportError::NoAnswer)??;
    if answer.is_error() {
        return Err(TransportError::remote(&answer));
    }
    Ok(handshake::parse_public_key_answer(&answer, &inner.operators)?)
}

/// Read the single answer served at `destination`, waiting for the endpoint
/// to appear until `deadline`.
pub(crate) async fn collect(
    inner: &ServiceInner,
    destination: &Destination,
    deadline: Instant,
) -> Result<Query, TransportError> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match transport::connect(&inner.runtime_dir, destination).await {
            Ok(mut stream) => {
                return timeout(remaining, read_answer(&mut stream))
                    .await
                    .map_err(|_| TransportError::NoAnswer)?;
            }
            Err(e) if e.is_retryable() && !remaining.is_zero() => {
                tokio::time::sleep(inner.config.client.retry_interval().min(remaining)).await;
            }
            Err(TransportError::EndpointUnavailable(_)) => return Err(TransportError::NoAnswer),
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line() -> TransmissionLine {
        TransmissionLine::new(Destination::local("auth"), None)
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let line = line();
        line.push(Query::verb("ONE"), Reply::Forget);
        line.push(Query::verb("TWO"), Reply::Forget);
        assert_eq!(line.pending(), 2);

        assert!(line.next().await.unwrap().query.is_verb("ONE"));
        assert!(line.next().await.unwrap().query.is_verb("TWO"));
        assert_eq!(line.pending(), 0);
    }

    #[tokio::test]
    async fn test_requeue_keeps_head() {
        let line = line();
        line.push(Query::verb("ONE"), Reply::Forget);
        line.push(Query::verb("TWO"), Reply::Forget);

        let head = line.next().await.unwrap();
        line.requeue_front(head);
        assert!(line.next().await.unwrap().query.is_verb("ONE"));
    }

    #[tokio::test]
    async fn test_push_after_close_fails_closed() {
        let line = line();
        line.close();

        let (tx, rx) = oneshot::channel();
        line.push(Query::verb("LATE"), Reply::Delivered(tx));
        assert!(matches!(rx.await.unwrap(), Err(TransportError::Closed)));
        assert!(line.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_worker() {
        let line = Arc::new(line());
        let worker = line.clone();
        let waiting = tokio::spawn(async move { worker.next().await.is_none() });

        tokio::time::sleep(Duration::from_millis(10)).await;
        line.close();
        assert!(tokio::time::timeout(Duration::from_secs(1), waiting).await.unwrap().unwrap());
    }

    #[test]
    fn test_duplex_reply_without_answer_is_no_answer() {
        let (tx, rx) = std::sync::mpsc::channel();
        let reply = Reply::Answer(Box::new(move |result| {
            let _ = tx.send(matches!(result, Err(TransportError::NoAnswer)));
        }));
        assert!(reply.is_duplex());
        reply.complete(Ok(None));
        assert!(rx.recv().unwrap());
    }
}
