//! Services talking to each other over real endpoints.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;

use pipeauth_core::crypto::handshake;
use pipeauth_core::query::{names, verbs};
use pipeauth_core::{Config, Destination, Instruction, Query, RoutingTable, SecurityLevel};

use crate::controller::{BroadcastProducer, ControllerState};
use crate::error::TransportError;
use crate::handler::{HandlerError, QueryHandler, SenderInfo};
use crate::relay::pickup_pipe;
use crate::service::TransportService;
use crate::transport::{self, FrameKind, read_answer, read_frame, write_frame, write_query};

fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.runtime_dir = Some(dir.to_path_buf());
    config.client.retry_interval_ms = 20;
    config.client.answer_timeout_secs = 5;
    config.crypto.key_fetch_backoff_ms = 20;
    config
}

fn service(dir: &Path, name: &str) -> TransportService {
    TransportService::builder(config(dir)).local_name(name).build().unwrap()
}

fn encrypted_routes(name: &str, patterns: &[&str]) -> RoutingTable {
    let mut routes = RoutingTable::new();
    routes
        .push(
            Instruction::new(name, Destination::local(name))
                .with_patterns(patterns.iter().copied())
                .unwrap()
                .with_encryption(true),
        )
        .unwrap();
    routes
}

async fn connect_when_ready(dir: &Path, destination: &Destination) -> transport::ClientStream {
    loop {
        match transport::connect(dir, destination).await {
            Ok(stream) => return stream,
            Err(e) if e.is_retryable() => tokio::time::sleep(Duration::from_millis(20)).await,
            Err(e) => panic!("connect failed: {e}"),
        }
    }
}

/// Records `{q=RECORD, n=..}` as `endpoint:n`.
struct Recorder {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl QueryHandler for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn is_target(&self, query: &Query) -> bool {
        query.is_verb("RECORD")
    }

    async fn execute(&self, sender: &SenderInfo, query: &Query) -> Result<Option<Query>, HandlerError> {
        let n = query
            .value("n")
            .ok_or_else(|| HandlerError::InvalidQuery("missing n".to_string()))?;
        self.seen.lock().unwrap().push(format!("{}:{n}", sender.endpoint));
        Ok(None)
    }
}

/// Answers `{q=ECHO, value=..}` with the value and whether it arrived sealed.
struct Echo;

#[async_trait]
impl QueryHandler for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn is_target(&self, query: &Query) -> bool {
        query.is_verb("ECHO")
    }

    async fn execute(&self, sender: &SenderInfo, query: &Query) -> Result<Option<Query>, HandlerError> {
        Ok(Some(
            Query::verb("ECHOED")
                .with("value", query.value("value").unwrap_or_default())
                .with("encrypted", sender.encrypted.to_string()),
        ))
    }
}

#[tokio::test]
async fn test_same_controller_serves_successive_connections() {
    let dir = tempdir().unwrap();
    let server = service(dir.path(), "server");
    let client = service(dir.path(), "client");
    let auth = server.open_endpoint("auth", SecurityLevel::INTERNAL).await.unwrap();

    let dest = Destination::local("auth");
    for _ in 0..2 {
        let answer = client.request(&dest, Query::verb("PING")).await.unwrap();
        assert!(answer.is_verb("PONG"));
    }

    auth.wait_for_state(ControllerState::WaitingConnection, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(auth.connections_served(), 2);
    assert!(Arc::ptr_eq(&auth, &server.endpoint("auth").await.unwrap()));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_line_delivers_in_enqueue_order() {
    let dir = tempdir().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let server = TransportService::builder(config(dir.path()))
        .handler(Arc::new(Recorder { seen: seen.clone() }))
        .build()
        .unwrap();
    server.open_endpoint("auth", SecurityLevel::INTERNAL).await.unwrap();
    server.open_endpoint("other", SecurityLevel::INTERNAL).await.unwrap();

    let client = service(dir.path(), "client");
    let auth = Destination::local("auth");
    let other = Destination::local("other");
    for n in 0..5 {
        client
            .enqueue_one_way(&auth, Query::verb("RECORD").with("n", n.to_string()))
            .await;
        client
            .enqueue_one_way(&other, Query::verb("RECORD").with("n", n.to_string()))
            .await;
    }
    // A duplex request queued last is answered after everything before it.
    client.request(&auth, Query::verb("PING")).await.unwrap();
    client
        .send_one_way(&other, Query::verb("RECORD").with("n", "last"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let seen = seen.lock().unwrap().clone();
    let on = |endpoint: &str| -> Vec<String> {
        seen.iter()
            .filter_map(|entry| entry.strip_prefix(&format!("{endpoint}:")).map(str::to_string))
            .collect()
    };
    assert_eq!(on("auth"), vec!["0", "1", "2", "3", "4"]);
    assert_eq!(on("other"), vec!["0", "1", "2", "3", "4", "last"]);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_encrypted_request_and_answer() {
    let dir = tempdir().unwrap();
    let server = TransportService::builder(config(dir.path()))
        .handler(Arc::new(Echo))
        .build()
        .unwrap();
    server.open_endpoint("vault", SecurityLevel::INTERNAL).await.unwrap();

    let dest = Destination::local("vault");
    let mut routes = RoutingTable::new();
    routes
        .push(Instruction::new("vault", dest.clone()).with_encryption(true))
        .unwrap();
    let client = TransportService::builder(config(dir.path()))
        .local_name("client")
        .routes(routes)
        .build()
        .unwrap();

    let answer = client
        .request(&dest, Query::verb("ECHO").with("value", "s3cret"))
        .await
        .unwrap();
    assert!(answer.is_verb("ECHOED"));
    assert_eq!(answer.value("value"), Some("s3cret"));
    assert_eq!(answer.value("encrypted"), Some("true"));

    // Second exchange reuses the cached public key.
    let again = client
        .request(&dest, Query::verb("ECHO").with("value", "again"))
        .await
        .unwrap();
    assert_eq!(again.value("value"), Some("again"));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_relay_forwards_and_requester_collects_answer() {
    let dir = tempdir().unwrap();
    let backend = TransportService::builder(config(dir.path()))
        .local_name("sessions")
        .handler(Arc::new(Echo))
        .build()
        .unwrap();
    backend.open_endpoint("sessions", SecurityLevel::INTERNAL).await.unwrap();

    let mut routes = RoutingTable::new();
    routes
        .push(
            Instruction::new("sessions", Destination::local("sessions"))
                .with_patterns(["q=ECHO"])
                .unwrap(),
        )
        .unwrap();
    let front = TransportService::builder(config(dir.path()))
        .local_name("front")
        .routes(routes)
        .build()
        .unwrap();
    front.open_endpoint("front", SecurityLevel::INTERNAL).await.unwrap();

    let client = service(dir.path(), "client");
    let answer = client
        .request(&Destination::local("front"), Query::verb("ECHO").with("value", "hello"))
        .await
        .unwrap();
    assert!(answer.is_verb("ECHOED"));
    assert_eq!(answer.value("value"), Some("hello"));

    // Nothing routes PING away from the relay, so it answers locally.
    let pong = client
        .request(&Destination::local("front"), Query::verb("PING"))
        .await
        .unwrap();
    assert!(pong.is_verb("PONG"));

    client.shutdown().await;
    front.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_pushes_to_every_subscriber() {
    let dir = tempdir().unwrap();
    let server = service(dir.path(), "server");
    let ticks = Arc::new(AtomicU64::new(0));
    let counter = ticks.clone();
    let producer: BroadcastProducer = Arc::new(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Query::verb("TICK").with("n", n.to_string())
    });
    server
        .broadcast("ticker", SecurityLevel::INTERNAL, producer)
        .await
        .unwrap();

    let client = service(dir.path(), "client");
    let dest = Destination::local("ticker");
    let first = client.receive(&dest).await.unwrap();
    let second = client.receive(&dest).await.unwrap();
    assert_eq!(first.value("n"), Some("1"));
    assert_eq!(second.value("n"), Some("2"));
    assert_eq!(ticks.load(Ordering::SeqCst), 2);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_answer_endpoint_serves_once_then_retires() {
    let dir = tempdir().unwrap();
    let server = service(dir.path(), "server");
    let controller = server
        .serve_answer("answer.client.1", Query::verb("DONE"), None)
        .await
        .unwrap();

    let client = service(dir.path(), "client");
    let answer = client.receive(&Destination::local("answer.client.1")).await.unwrap();
    assert!(answer.is_verb("DONE"));

    controller
        .wait_for_state(ControllerState::Closed, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(server.endpoint("answer.client.1").await.is_none());
    assert!(!transport::endpoint_path(dir.path(), "answer.client.1").exists());

    server.shutdown().await;
}

#[tokio::test]
async fn test_uncollected_answer_expires() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path());
    config.endpoint.answer_ttl_secs = 1;
    let server = TransportService::builder(config).build().unwrap();

    let controller = server
        .serve_answer("answer.nobody.1", Query::ack(), None)
        .await
        .unwrap();
    controller
        .wait_for_state(ControllerState::Closed, Duration::from_secs(3))
        .await
        .unwrap();
    assert!(controller.is_expired());
    assert!(controller.has_pending_answer());
}

#[tokio::test]
async fn test_malformed_frame_only_drops_its_connection() {
    let dir = tempdir().unwrap();
    let server = service(dir.path(), "server");
    server.open_endpoint("auth", SecurityLevel::INTERNAL).await.unwrap();
    let dest = Destination::local("auth");

    let mut raw = transport::connect(dir.path(), &dest).await.unwrap();
    write_frame(&mut raw, FrameKind::Duplex, b"definitely not a query")
        .await
        .unwrap();
    assert!(!matches!(read_frame(&mut raw).await, Ok(Some(_))));

    let client = service(dir.path(), "client");
    let answer = client.request(&dest, Query::verb("PING")).await.unwrap();
    assert!(answer.is_verb("PONG"));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_unhandled_query_is_remote_error() {
    let dir = tempdir().unwrap();
    let server = service(dir.path(), "server");
    server.open_endpoint("auth", SecurityLevel::INTERNAL).await.unwrap();
    let client = service(dir.path(), "client");

    let err = client
        .request(&Destination::local("auth"), Query::verb("UNKNOWN"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Remote { reason, .. } if reason == "no-handler"));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_line_waits_for_late_endpoint() {
    let dir = tempdir().unwrap();
    let client = service(dir.path(), "client");
    let dest = Destination::local("late");

    let requester = client.clone();
    let pending = tokio::spawn(async move { requester.request(&dest, Query::verb("PING")).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let server = service(dir.path(), "server");
    server.open_endpoint("late", SecurityLevel::INTERNAL).await.unwrap();

    let answer = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(answer.is_verb("PONG"));
    assert!(client.line(&Destination::local("late")).await.attempts() > 1);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_line_gives_up_after_max_attempts() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path());
    config.client.max_attempts = 3;
    let client = TransportService::builder(config).build().unwrap();
    let dest = Destination::local("nowhere");

    let err = client.request(&dest, Query::verb("PING")).await.unwrap_err();
    assert!(matches!(err, TransportError::EndpointUnavailable(_)));
    assert_eq!(client.line(&dest).await.attempts(), 3);

    client.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_queued_requests() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path());
    config.client.max_attempts = 0;
    let client = TransportService::builder(config).build().unwrap();

    let requester = client.clone();
    let pending = tokio::spawn(async move {
        requester
            .request(&Destination::local("nowhere"), Query::verb("PING"))
            .await
    });
    tokio::time::sleep(Duration::from_millis(60)).await;
    client.shutdown().await;

    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(TransportError::Cancelled)));
    assert!(client.lines().await.is_empty());
}

#[tokio::test]
async fn test_answer_survives_a_dropped_connection() {
    let dir = tempdir().unwrap();
    let server = service(dir.path(), "server");
    let controller = server
        .serve_answer("answer.client.9", Query::verb("DONE"), None)
        .await
        .unwrap();
    let dest = Destination::local("answer.client.9");

    // Connects and hangs up without reading.
    drop(transport::connect(dir.path(), &dest).await.unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(controller.has_pending_answer());
    assert!(!controller.is_finished());

    let client = service(dir.path(), "client");
    let answer = client.receive(&dest).await.unwrap();
    assert!(answer.is_verb("DONE"));

    controller
        .wait_for_state(ControllerState::Closed, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(!controller.has_pending_answer());
    assert!(controller.connections_served() >= 2);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_session_budget_drops_only_the_idle_connection() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path());
    config.endpoint.session_budget_secs = 1;
    let server = TransportService::builder(config).build().unwrap();
    let auth = server.open_endpoint("auth", SecurityLevel::INTERNAL).await.unwrap();
    let dest = Destination::local("auth");

    let mut idle = transport::connect(dir.path(), &dest).await.unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(3), read_frame(&mut idle))
        .await
        .unwrap();
    assert!(!matches!(closed, Ok(Some(_))));

    let client = service(dir.path(), "client");
    let answer = client.request(&dest, Query::verb("PING")).await.unwrap();
    assert!(answer.is_verb("PONG"));

    auth.wait_for_state(ControllerState::WaitingConnection, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(auth.connections_served(), 2);
    assert!(!auth.is_finished());

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_stale_peer_key_is_refetched_after_handshake_failure() {
    let dir = tempdir().unwrap();
    let vault = |dir: &Path| {
        TransportService::builder(config(dir))
            .local_name("vault")
            .handler(Arc::new(Echo))
            .build()
            .unwrap()
    };
    let dest = Destination::local("vault");
    let client = TransportService::builder(config(dir.path()))
        .local_name("client")
        .routes(encrypted_routes("vault", &[]))
        .build()
        .unwrap();

    let first = vault(dir.path());
    first.open_endpoint("vault", SecurityLevel::INTERNAL).await.unwrap();
    let answer = client
        .request(&dest, Query::verb("ECHO").with("value", "one"))
        .await
        .unwrap();
    assert_eq!(answer.value("value"), Some("one"));
    first.shutdown().await;

    // A restarted server holds a fresh key pair; the cached key no longer opens.
    let second = vault(dir.path());
    second.open_endpoint("vault", SecurityLevel::INTERNAL).await.unwrap();
    let err = client
        .request(&dest, Query::verb("ECHO").with("value", "two"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Remote { reason, .. } if reason == "handshake"));
    assert!(client.inner().peer_keys.get_valid(&dest.to_string()).is_none());

    let answer = client
        .request(&dest, Query::verb("ECHO").with("value", "three"))
        .await
        .unwrap();
    assert_eq!(answer.value("value"), Some("three"));
    assert_eq!(answer.value("encrypted"), Some("true"));

    client.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn test_encrypted_relay_seals_both_answers_to_the_requester() {
    let dir = tempdir().unwrap();
    let backend = TransportService::builder(config(dir.path()))
        .local_name("sessions")
        .handler(Arc::new(Echo))
        .build()
        .unwrap();
    backend.open_endpoint("sessions", SecurityLevel::INTERNAL).await.unwrap();
    let front = TransportService::builder(config(dir.path()))
        .local_name("front")
        .routes(encrypted_routes("sessions", &["q=ECHO"]))
        .build()
        .unwrap();
    front.open_endpoint("front", SecurityLevel::INTERNAL).await.unwrap();
    let front_dest = Destination::local("front");

    let client = TransportService::builder(config(dir.path()))
        .local_name("client")
        .routes(encrypted_routes("front", &[]))
        .build()
        .unwrap();
    let answer = client
        .request(&front_dest, Query::verb("ECHO").with("value", "hello"))
        .await
        .unwrap();
    assert!(answer.is_verb("ECHOED"));
    assert_eq!(answer.value("value"), Some("hello"));
    assert_eq!(answer.value("encrypted"), Some("true"));

    // Drive the exchange by hand to look at what travels on the wire.
    let requester = service(dir.path(), "raw");
    let inner = requester.inner();
    let mut stream = transport::connect(dir.path(), &front_dest).await.unwrap();
    write_query(&mut stream, FrameKind::Duplex, &handshake::public_key_request())
        .await
        .unwrap();
    let front_key =
        handshake::parse_public_key_answer(&read_answer(&mut stream).await.unwrap(), &inner.operators).unwrap();
    drop(stream);

    let own = requester.keyring().current().unwrap();
    let mut query = Query::verb("ECHO")
        .with("value", "sealed")
        .with(names::FROM, "raw")
        .with(names::EXCHANGE, "x1");
    handshake::attach_reply_key(&mut query, own.as_ref());
    let crypto = &inner.config.crypto;
    handshake::seal(
        &mut query,
        front_key.as_ref(),
        &inner.operators,
        &crypto.symmetric,
        crypto.symmetric_lifetime_secs,
    )
    .unwrap();

    let mut stream = transport::connect(dir.path(), &front_dest).await.unwrap();
    write_query(&mut stream, FrameKind::Duplex, &query).await.unwrap();
    let mut relayed = read_answer(&mut stream).await.unwrap();
    drop(stream);
    assert!(relayed.is_sealed());
    handshake::open(&mut relayed, requester.keyring(), &inner.operators).unwrap();
    assert!(relayed.is_verb(verbs::RELAYED));
    let pickup = relayed.value(names::PICKUP).unwrap().to_string();
    assert_eq!(pickup, pickup_pipe("raw", "x1"));

    let pickup = Destination::local(pickup);
    let mut stream = tokio::time::timeout(Duration::from_secs(5), connect_when_ready(dir.path(), &pickup))
        .await
        .unwrap();
    let mut collected = read_answer(&mut stream).await.unwrap();
    drop(stream);
    assert!(collected.is_sealed());
    handshake::open(&mut collected, requester.keyring(), &inner.operators).unwrap();
    assert!(collected.is_verb("ECHOED"));
    assert_eq!(collected.value("value"), Some("sealed"));
    assert_eq!(collected.value("encrypted"), Some("true"));

    requester.shutdown().await;
    client.shutdown().await;
    front.shutdown().await;
    backend.shutdown().await;
}
