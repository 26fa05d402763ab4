//! The transport service: endpoint and line registries for one process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;

use pipeauth_core::crypto::{CryptoError, KeyMaterial, handshake};
use pipeauth_core::{
    Config, Destination, EncryptionOperator, Instruction, KeyRing, OperatorRegistry, PeerKeyCache, Query,
    RoutingTable, SecurityLevel,
};

use crate::controller::{BroadcastProducer, ControllerMode, ControllerState, TransmissionController};
use crate::error::TransportError;
use crate::handler::{HandlerSet, PingHandler, PublicKeyHandler, QueryHandler};
use crate::line::{self, Reply, TransmissionLine};
use crate::server;
use crate::shutdown::Shutdown;
use crate::transport::PipeListener;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub(crate) struct ServiceInner {
    pub(crate) config: Config,
    pub(crate) local_name: String,
    pub(crate) runtime_dir: PathBuf,
    pub(crate) security: SecurityLevel,
    pub(crate) operators: OperatorRegistry,
    pub(crate) keyring: KeyRing,
    pub(crate) peer_keys: PeerKeyCache,
    pub(crate) handlers: HandlerSet,
    pub(crate) routes: RoutingTable,
    pub(crate) shutdown: Shutdown,
    endpoints: Mutex<HashMap<String, Arc<TransmissionController>>>,
    lines: Mutex<HashMap<Destination, Arc<TransmissionLine>>>,
}

/// Owns every endpoint this process serves and every line it sends on.
///
/// Cheap to clone; clones share the same registries.
#[derive(Clone)]
pub struct TransportService {
    inner: Arc<ServiceInner>,
}

impl TransportService {
    /// Start building a service from configuration.
    #[must_use]
    pub fn builder(config: Config) -> TransportServiceBuilder {
        TransportServiceBuilder::new(config)
    }

    pub(crate) fn inner(&self) -> &ServiceInner {
        &self.inner
    }

    /// Configuration the service was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Name stamped as `from` on outbound duplex requests.
    #[must_use]
    pub fn local_name(&self) -> &str {
        &self.inner.local_name
    }

    /// Directory holding local endpoints.
    #[must_use]
    pub fn runtime_dir(&self) -> &std::path::Path {
        &self.inner.runtime_dir
    }

    /// The process key ring.
    #[must_use]
    pub fn keyring(&self) -> &KeyRing {
        &self.inner.keyring
    }

    /// Routing table used for relay decisions and line policies.
    #[must_use]
    pub fn routes(&self) -> &RoutingTable {
        &self.inner.routes
    }

    /// Registered handlers.
    #[must_use]
    pub fn handlers(&self) -> &HandlerSet {
        &self.inner.handlers
    }

    /// Shutdown signal shared by every worker of this service.
    #[must_use]
    pub fn shutdown_signal(&self) -> &Shutdown {
        &self.inner.shutdown
    }

    // ---------------------------------------------------------------------
    // Endpoints
    // ---------------------------------------------------------------------

    /// Serve requests on `name`.
    ///
    /// Opening a name this service already receives on returns the running
    /// controller.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::EndpointInUse` if the name is taken by a
    /// different kind of endpoint or by another process.
    pub async fn open_endpoint(
        &self,
        name: &str,
        security: SecurityLevel,
    ) -> Result<Arc<TransmissionController>, TransportError> {
        let controller = TransmissionController::new(name, security, ControllerMode::Receive);
        self.spawn_endpoint(controller, true).await
    }

    /// Serve requests on the configured endpoint name and security.
    ///
    /// # Errors
    ///
    /// See [`open_endpoint`](Self::open_endpoint).
    pub async fn open_default_endpoint(&self) -> Result<Arc<TransmissionController>, TransportError> {
        let name = self.inner.config.endpoint.name.clone();
        self.open_endpoint(&name, self.inner.security).await
    }

    /// Push `producer`'s message to every client connecting to `name`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::EndpointInUse` if the name is taken.
    pub async fn broadcast(
        &self,
        name: &str,
        security: SecurityLevel,
        producer: BroadcastProducer,
    ) -> Result<Arc<TransmissionController>, TransportError> {
        let controller = TransmissionController::new(name, security, ControllerMode::Broadcast(producer));
        self.spawn_endpoint(controller, false).await
    }

    /// Serve `answer` once on `pipe`, sealed with `reply_key` when present.
    ///
    /// The endpoint retires after the answer is collected or the configured
    /// answer TTL elapses.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::EndpointInUse` if the pipe is taken.
    pub async fn serve_answer(
        &self,
        pipe: &str,
        answer: Query,
        reply_key: Option<Arc<dyn EncryptionOperator>>,
    ) -> Result<Arc<TransmissionController>, TransportError> {
        let ttl = self.inner.config.endpoint.answer_ttl();
        let controller = TransmissionController::answering(pipe, self.inner.security, answer, reply_key, ttl);
        self.spawn_endpoint(controller, false).await
    }

    async fn spawn_endpoint(
        &self,
        controller: TransmissionController,
        reuse_receiver: bool,
    ) -> Result<Arc<TransmissionController>, TransportError> {
        let name = controller.name().to_string();
        let mut endpoints = self.inner.endpoints.lock().await;

        if let Some(existing) = endpoints.get(&name).filter(|c| !c.is_finished()) {
            if reuse_receiver && matches!(existing.mode(), ControllerMode::Receive) {
                return Ok(existing.clone());
            }
            return Err(TransportError::EndpointInUse(name));
        }

        let listener = PipeListener::bind(&self.inner.runtime_dir, &name, controller.security()).await?;
        let controller = Arc::new(controller);
        endpoints.insert(name, controller.clone());
        drop(endpoints);

        tokio::spawn(server::run(self.clone(), controller.clone(), listener));
        Ok(controller)
    }

    /// The live controller serving `name`.
    pub async fn endpoint(&self, name: &str) -> Option<Arc<TransmissionController>> {
        self.inner.endpoints.lock().await.get(name).cloned()
    }

    /// Names of all registered endpoints, sorted.
    pub async fn endpoint_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.endpoints.lock().await.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Stop serving `name`. Returns whether such an endpoint existed.
    pub async fn stop_endpoint(&self, name: &str) -> bool {
        let removed = self.inner.endpoints.lock().await.remove(name);
        removed.is_some_and(|controller| {
            tracing::info!(endpoint = name, "stopping endpoint");
            controller.stop();
            true
        })
    }

    /// Drop `controller` from the registry unless it was already replaced.
    pub(crate) async fn release_endpoint(&self, controller: &Arc<TransmissionController>) {
        let mut endpoints = self.inner.endpoints.lock().await;
        if endpoints
            .get(controller.name())
            .is_some_and(|current| Arc::ptr_eq(current, controller))
        {
            endpoints.remove(controller.name());
        }
    }

    // ---------------------------------------------------------------------
    // Lines
    // ---------------------------------------------------------------------

    /// The line to `destination`, created on first use.
    ///
    /// A new line takes its encryption and credential policy from the first
    /// routing instruction naming the destination.
    pub async fn line(&self, destination: &Destination) -> Arc<TransmissionLine> {
        let policy = self.inner.routes.for_destination(destination).cloned();
        self.line_with_policy(destination, policy).await
    }

    async fn line_with_policy(&self, destination: &Destination, policy: Option<Instruction>) -> Arc<TransmissionLine> {
        let mut lines = self.inner.lines.lock().await;
        if let Some(line) = lines.get(destination).filter(|line| !line.is_closed()) {
            return line.clone();
        }

        let line = Arc::new(TransmissionLine::new(destination.clone(), policy));
        lines.insert(destination.clone(), line.clone());
        drop(lines);

        tokio::spawn(line.clone().run(self.clone()));
        line
    }

    /// Queue a one-way query; failures are only logged.
    pub async fn enqueue_one_way(&self, destination: &Destination, query: Query) {
        self.line(destination).await.push(query, Reply::Forget);
    }

    /// Queue a one-way query and wait until it is written.
    ///
    /// # Errors
    ///
    /// Returns the error that made the line give up on the query.
    pub async fn send_one_way(&self, destination: &Destination, query: Query) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.line(destination).await.push(query, Reply::Delivered(tx));
        rx.await.map_err(|_| TransportError::Closed)?
    }

    /// Queue a duplex request; `callback` receives the answer or the error.
    pub async fn enqueue_duplex<F>(&self, destination: &Destination, query: Query, callback: F)
    where
        F: FnOnce(Result<Query, TransportError>) + Send + 'static,
    {
        self.line(destination)
            .await
            .push(query, Reply::Answer(Box::new(callback)));
    }

    /// Send a duplex request and wait for its answer.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Remote` for error answers, or the transport
    /// failure that ended the exchange.
    pub async fn request(&self, destination: &Destination, query: Query) -> Result<Query, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue_duplex(destination, query, move |result| {
            let _ = tx.send(result);
        })
        .await;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    pub(crate) async fn request_via(&self, instruction: &Instruction, query: Query) -> Result<Query, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.line_with_policy(&instruction.destination, Some(instruction.clone()))
            .await
            .push(
                query,
                Reply::Answer(Box::new(move |result| {
                    let _ = tx.send(result);
                })),
            );
        rx.await.map_err(|_| TransportError::Closed)?
    }

    pub(crate) async fn enqueue_via(&self, instruction: &Instruction, query: Query) {
        self.line_with_policy(&instruction.destination, Some(instruction.clone()))
            .await
            .push(query, Reply::Forget);
    }

    /// Collect the message a broadcast or answer endpoint serves.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::NoAnswer` if nothing is served before the
    /// answer timeout.
    pub async fn receive(&self, destination: &Destination) -> Result<Query, TransportError> {
        let deadline = Instant::now() + self.inner.config.client.answer_timeout();
        let mut message = line::collect(&self.inner, destination, deadline).await?;
        handshake::open(&mut message, &self.inner.keyring, &self.inner.operators)?;
        Ok(message)
    }

    /// Close the line to `destination`. Returns whether one existed.
    pub async fn close_line(&self, destination: &Destination) -> bool {
        let removed = self.inner.lines.lock().await.remove(destination);
        removed.is_some_and(|line| {
            line.close();
            true
        })
    }

    /// Destinations with an open line.
    pub async fn lines(&self) -> Vec<Destination> {
        self.inner
            .lines
            .lock()
            .await
            .iter()
            .filter(|(_, line)| !line.is_closed())
            .map(|(destination, _)| destination.clone())
            .collect()
    }

    /// Signal shutdown, stop every endpoint and close every line.
    ///
    /// Waits briefly for endpoints to release their pipes.
    pub async fn shutdown(&self) {
        tracing::info!(service = %self.inner.local_name, "shutting down");
        self.inner.shutdown.trigger();

        let controllers: Vec<Arc<TransmissionController>> =
            self.inner.endpoints.lock().await.values().cloned().collect();
        for controller in &controllers {
            controller.stop();
        }
        for (_, line) in self.inner.lines.lock().await.drain() {
            line.close();
        }

        for controller in controllers {
            if controller
                .wait_for_state(ControllerState::Closed, SHUTDOWN_GRACE)
                .await
                .is_err()
            {
                tracing::warn!(endpoint = controller.name(), "endpoint did not close in time");
            }
        }
    }
}

impl std::fmt::Debug for TransportService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportService")
            .field("local_name", &self.inner.local_name)
            .field("runtime_dir", &self.inner.runtime_dir)
            .field("handlers", &self.inner.handlers.names())
            .field("routes", &self.inner.routes.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`TransportService`].
pub struct TransportServiceBuilder {
    config: Config,
    operators: OperatorRegistry,
    handlers: Vec<Arc<dyn QueryHandler>>,
    routes: Option<RoutingTable>,
    shutdown: Option<Shutdown>,
    local_name: Option<String>,
    builtin_handlers: bool,
}

impl TransportServiceBuilder {
    fn new(config: Config) -> Self {
        Self {
            config,
            operators: OperatorRegistry::with_defaults(),
            handlers: Vec::new(),
            routes: None,
            shutdown: None,
            local_name: None,
            builtin_handlers: true,
        }
    }

    /// Replace the operator registry.
    #[must_use]
    pub fn operators(mut self, operators: OperatorRegistry) -> Self {
        self.operators = operators;
        self
    }

    /// Register an additional operator factory.
    #[must_use]
    pub fn register_operator<F>(mut self, code: &str, factory: F) -> Self
    where
        F: Fn(KeyMaterial<'_>) -> Result<Box<dyn EncryptionOperator>, CryptoError> + Send + Sync + 'static,
    {
        self.operators.register(code, factory);
        self
    }

    /// Register a handler. Handlers are tried in registration order.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn QueryHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Use `routes` instead of the configured ones.
    #[must_use]
    pub fn routes(mut self, routes: RoutingTable) -> Self {
        self.routes = Some(routes);
        self
    }

    /// Share an existing shutdown signal.
    #[must_use]
    pub fn shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Override the name stamped on outbound requests.
    #[must_use]
    pub fn local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    /// Skip the built-in public key and ping handlers.
    #[must_use]
    pub const fn without_builtin_handlers(mut self) -> Self {
        self.builtin_handlers = false;
        self
    }

    /// Validate configuration and build the service.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Config` for invalid configuration or
    /// unregistered operator codes.
    pub fn build(self) -> Result<TransportService, TransportError> {
        let config = self.config;
        config.validate().map_err(|e| TransportError::Config(e.to_string()))?;

        for code in [&config.crypto.asymmetric, &config.crypto.symmetric] {
            if !self.operators.contains(code) {
                return Err(TransportError::Config(format!("operator '{code}' is not registered")));
            }
        }

        let routes = match self.routes {
            Some(routes) => routes,
            None => config
                .routing_table()
                .map_err(|e| TransportError::Config(e.to_string()))?,
        };
        let security = config
            .endpoint
            .security_level()
            .map_err(|e| TransportError::Config(e.to_string()))?;

        let keyring = KeyRing::new(
            self.operators.clone(),
            config.crypto.asymmetric.clone(),
            config.crypto.key_lifetime_secs,
        );

        let mut handlers = HandlerSet::new();
        if self.builtin_handlers {
            handlers.register(Arc::new(PublicKeyHandler::new(keyring.clone())));
            handlers.register(Arc::new(PingHandler));
        }
        for handler in self.handlers {
            handlers.register(handler);
        }

        let local_name = self
            .local_name
            .unwrap_or_else(|| config.endpoint.name.clone());
        let runtime_dir = config.runtime_dir();

        tracing::debug!(
            local_name = %local_name,
            runtime_dir = %runtime_dir.display(),
            routes = routes.len(),
            handlers = handlers.len(),
            "transport service built"
        );

        Ok(TransportService {
            inner: Arc::new(ServiceInner {
                local_name,
                runtime_dir,
                security,
                operators: self.operators,
                keyring,
                peer_keys: PeerKeyCache::new(),
                handlers,
                routes,
                shutdown: self.shutdown.unwrap_or_default(),
                endpoints: Mutex::new(HashMap::new()),
                lines: Mutex::new(HashMap::new()),
                config,
            }),
        })
    }
}
