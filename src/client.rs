//! Language client
//!
//! Orchestrates one server's lifecycle: start the process, open the
//! connection on its streams, run the `initialize`/`initialized` handshake,
//! operate, then `shutdown`/`exit` and close. A client instance is
//! single-use; after shutdown it is terminal and a new instance is created
//! for a new session.

use crate::connection::{Connection, ConnectionError};
use crate::dispatch::{Dispatcher, Handler, HandlerRegistration, RegistryError};
use crate::server::{AdapterError, ChildProcessServer, ServerAdapter};
use lsp_types::{ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, ServerCapabilities};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// Errors
// ============================================================================

/// Language client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("server adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("handler registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("client is not initialized")]
    NotInitialized,

    #[error("client already started")]
    AlreadyStarted,

    #[error("client has shut down")]
    Disposed,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Client lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unstarted,
    Starting,
    Initialized,
    ShuttingDown,
    Shutdown,
}

// ============================================================================
// Server Spec
// ============================================================================

/// How to launch an external language server.
///
/// The spawned process inherits the environment, plus the listed variables.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ServerSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }
}

// ============================================================================
// Signals
// ============================================================================

/// One-shot boolean signal with late-waiter support.
#[derive(Clone)]
struct Signal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Signal {
    fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    fn set(&self) {
        let _ = self.tx.send(true);
    }

    fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    async fn wait(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

// ============================================================================
// Language Client
// ============================================================================

struct ClientShared {
    state: StdMutex<ClientState>,
    connection: Connection,
    server_capabilities: StdMutex<Option<ServerCapabilities>>,
    ready: Signal,
    shutdown_signal: Signal,
}

impl ClientShared {
    fn state(&self) -> ClientState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Client-side orchestration for one language server session.
pub struct LanguageClient {
    shared: Arc<ClientShared>,
    adapter: Mutex<Box<dyn ServerAdapter>>,
    initialization_options: Option<Value>,
}

impl LanguageClient {
    /// Construct against an external server process; does not start it.
    pub fn new(spec: ServerSpec) -> Self {
        let mut server = ChildProcessServer::new(spec.command, spec.args);
        for (name, value) in spec.env {
            server = server.env(name, value);
        }
        Self::from_adapter(Box::new(server))
    }

    /// Construct against an arbitrary adapter (in-process pipes, tests).
    pub fn from_adapter(adapter: Box<dyn ServerAdapter>) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                state: StdMutex::new(ClientState::Unstarted),
                connection: Connection::new(Dispatcher::new()),
                server_capabilities: StdMutex::new(None),
                ready: Signal::new(),
                shutdown_signal: Signal::new(),
            }),
            adapter: Mutex::new(adapter),
            initialization_options: None,
        }
    }

    /// Attach `initializationOptions` for the handshake.
    pub fn with_initialization_options(mut self, options: Value) -> Self {
        self.initialization_options = Some(options);
        self
    }

    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.is_set()
    }

    /// Resolves once the handshake has completed.
    pub async fn ready(&self) {
        self.shared.ready.wait().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown_signal.is_set()
    }

    /// Resolves once the client has fully shut down.
    pub async fn has_shutdown(&self) {
        self.shared.shutdown_signal.wait().await;
    }

    /// Capabilities the server reported during the handshake.
    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.shared
            .server_capabilities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start the server, open the connection, and run the handshake.
    ///
    /// Valid once, from Unstarted. Any failure here transitions the client
    /// to Shutdown and propagates.
    pub async fn initialize(
        &self,
        workspace_root: Option<&Path>,
        cancel: CancellationToken,
    ) -> Result<InitializeResult, ClientError> {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match *state {
                ClientState::Unstarted => *state = ClientState::Starting,
                ClientState::Shutdown => return Err(ClientError::Disposed),
                _ => return Err(ClientError::AlreadyStarted),
            }
        }

        match self.initialize_inner(workspace_root, cancel).await {
            Ok(result) => {
                self.shared.set_state(ClientState::Initialized);
                self.shared.ready.set();
                info!("language client initialized");
                Ok(result)
            }
            Err(e) => {
                warn!("initialize failed: {}", e);
                let _ = self.shared.connection.close(false).await;
                {
                    let mut adapter = self.adapter.lock().await;
                    if adapter.is_running() {
                        let _ = adapter.stop().await;
                    }
                }
                self.shared.set_state(ClientState::Shutdown);
                self.shared.shutdown_signal.set();
                Err(e)
            }
        }
    }

    async fn initialize_inner(
        &self,
        workspace_root: Option<&Path>,
        cancel: CancellationToken,
    ) -> Result<InitializeResult, ClientError> {
        let (streams, exit) = {
            let mut adapter = self.adapter.lock().await;
            if !adapter.is_running() {
                adapter.start().await?;
            }
            (adapter.take_streams()?, adapter.exit_latch())
        };
        self.shared.connection.open(streams)?;

        // Auto-shutdown when the server dies underneath us.
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let exit = exit.wait().await;
            if matches!(
                shared.state(),
                ClientState::ShuttingDown | ClientState::Shutdown
            ) {
                return;
            }
            warn!(
                "server exited unexpectedly (code {:?}), shutting down client",
                exit.code
            );
            let _ = shared.connection.close(false).await;
            shared.connection.closed().await;
            shared.set_state(ClientState::Shutdown);
            shared.shutdown_signal.set();
        });

        let root_uri = workspace_root
            .and_then(|root| format!("file://{}", root.display()).parse().ok());
        #[allow(deprecated)]
        let params = InitializeParams {
            process_id: Some(std::process::id()),
            root_path: workspace_root.map(|root| root.display().to_string()),
            root_uri,
            initialization_options: self.initialization_options.clone(),
            capabilities: ClientCapabilities::default(),
            client_info: Some(ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            ..Default::default()
        };
        let params = serde_json::to_value(params).map_err(ConnectionError::Serialization)?;

        debug!("sending initialize");
        let value = self
            .shared
            .connection
            .send_request("initialize", Some(params), cancel)
            .await?;
        if value.is_null() {
            return Err(ClientError::ProtocolViolation(
                "initialize returned null".to_string(),
            ));
        }
        let result: InitializeResult = serde_json::from_value(value).map_err(|e| {
            ClientError::ProtocolViolation(format!("malformed initialize result: {e}"))
        })?;
        *self
            .shared
            .server_capabilities
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(result.capabilities.clone());

        self.shared.connection.send_notification("initialized", json!({}))?;
        Ok(result)
    }

    /// Orderly shutdown: `shutdown` then `exit` are the last two messages,
    /// then a flushing close, then the process is stopped if still running.
    ///
    /// Idempotent; afterwards every other operation fails with *disposed*.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match *state {
                ClientState::Shutdown | ClientState::ShuttingDown => return Ok(()),
                _ => *state = ClientState::ShuttingDown,
            }
        }
        info!("shutting down language client");

        if self.shared.connection.is_open() {
            if let Err(e) = self.shared.connection.send_empty_notification("shutdown") {
                debug!("could not send shutdown notification: {}", e);
            }
            if let Err(e) = self.shared.connection.send_empty_notification("exit") {
                debug!("could not send exit notification: {}", e);
            }
            self.shared.connection.close(true).await?;
            self.shared.connection.closed().await;
        }

        {
            let mut adapter = self.adapter.lock().await;
            if adapter.is_running() {
                adapter.stop().await?;
            }
        }

        self.shared.set_state(ClientState::Shutdown);
        self.shared.shutdown_signal.set();
        info!("language client shutdown complete");
        Ok(())
    }

    /// Register a handler for server-initiated traffic.
    ///
    /// Allowed before the handshake so handlers are in place for the first
    /// server message.
    pub fn register_handler(
        &self,
        method: impl Into<String>,
        handler: Handler,
    ) -> Result<HandlerRegistration, ClientError> {
        if matches!(
            self.shared.state(),
            ClientState::Shutdown | ClientState::ShuttingDown
        ) {
            return Err(ClientError::Disposed);
        }
        Ok(self.shared.connection.register_handler(method, handler)?)
    }

    pub fn send_empty_notification(&self, method: &str) -> Result<(), ClientError> {
        self.ensure_operational()?;
        Ok(self.shared.connection.send_empty_notification(method)?)
    }

    pub fn send_notification(&self, method: &str, params: Value) -> Result<(), ClientError> {
        self.ensure_operational()?;
        Ok(self.shared.connection.send_notification(method, params)?)
    }

    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Value, ClientError> {
        self.ensure_operational()?;
        Ok(self
            .shared
            .connection
            .send_request(method, params, cancel)
            .await?)
    }

    /// Typed variant of [`send_request`](LanguageClient::send_request).
    pub async fn send_request_as<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<R, ClientError> {
        self.ensure_operational()?;
        Ok(self
            .shared
            .connection
            .send_request_as(method, params, cancel)
            .await?)
    }

    fn ensure_operational(&self) -> Result<(), ClientError> {
        match self.shared.state() {
            ClientState::Initialized => Ok(()),
            ClientState::Shutdown | ClientState::ShuttingDown => Err(ClientError::Disposed),
            ClientState::Unstarted | ClientState::Starting => Err(ClientError::NotInitialized),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::HandlerError;
    use crate::server::{PipeServer, ServerExit, ServerStreams};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(1);

    /// In-process peer standing in for a language server.
    struct TestServer {
        connection: Connection,
        saw_initialized: Arc<AtomicBool>,
        saw_shutdown: Arc<AtomicBool>,
        saw_exit: Arc<AtomicBool>,
        _registrations: Vec<HandlerRegistration>,
    }

    impl TestServer {
        fn start(streams: ServerStreams, initialize_result: Value) -> Self {
            let connection = Connection::new(Dispatcher::new());
            let saw_initialized = Arc::new(AtomicBool::new(false));
            let saw_shutdown = Arc::new(AtomicBool::new(false));
            let saw_exit = Arc::new(AtomicBool::new(false));

            let mut registrations = Vec::new();
            registrations.push(
                connection
                    .register_handler(
                        "initialize",
                        Handler::request(move |_: Value, _cancel| {
                            let result = initialize_result.clone();
                            async move { Ok::<_, HandlerError>(result) }
                        }),
                    )
                    .unwrap(),
            );
            for (method, flag) in [
                ("initialized", Arc::clone(&saw_initialized)),
                ("shutdown", Arc::clone(&saw_shutdown)),
                ("exit", Arc::clone(&saw_exit)),
            ] {
                registrations.push(
                    connection
                        .register_handler(
                            method,
                            Handler::notification(move |_: Value| {
                                flag.store(true, Ordering::SeqCst);
                                Ok(())
                            }),
                        )
                        .unwrap(),
                );
            }

            connection.open(streams).unwrap();
            Self {
                connection,
                saw_initialized,
                saw_shutdown,
                saw_exit,
                _registrations: registrations,
            }
        }
    }

    fn piped_client(initialize_result: Value) -> (LanguageClient, TestServer) {
        let mut adapter = PipeServer::new();
        let server_streams = adapter.take_server_streams().unwrap();
        let server = TestServer::start(server_streams, initialize_result);
        let client = LanguageClient::from_adapter(Box::new(adapter));
        (client, server)
    }

    async fn eventually(what: &str, condition: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !condition() {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn handshake_records_capabilities() {
        let (client, server) = piped_client(json!({"capabilities": {}}));

        let result = timeout(
            WAIT,
            client.initialize(Some(Path::new("/workspace")), CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(result.capabilities, ServerCapabilities::default());
        assert!(client.is_ready());
        assert_eq!(client.state(), ClientState::Initialized);
        assert_eq!(
            client.server_capabilities(),
            Some(ServerCapabilities::default())
        );
        eventually("initialized notification", || {
            server.saw_initialized.load(Ordering::SeqCst)
        })
        .await;
    }

    #[tokio::test]
    async fn initialize_twice_is_rejected() {
        let (client, _server) = piped_client(json!({"capabilities": {}}));
        client
            .initialize(None, CancellationToken::new())
            .await
            .unwrap();
        let again = client.initialize(None, CancellationToken::new()).await;
        assert!(matches!(again, Err(ClientError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn null_initialize_result_is_protocol_violation() {
        let (client, _server) = piped_client(Value::Null);

        let outcome = timeout(
            WAIT,
            client.initialize(None, CancellationToken::new()),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, Err(ClientError::ProtocolViolation(_))));
        assert_eq!(client.state(), ClientState::Shutdown);
        assert!(client.is_shutdown());
    }

    #[tokio::test]
    async fn shutdown_sends_final_notifications() {
        let (client, server) = piped_client(json!({"capabilities": {}}));
        client
            .initialize(None, CancellationToken::new())
            .await
            .unwrap();

        timeout(WAIT, client.shutdown()).await.unwrap().unwrap();
        assert_eq!(client.state(), ClientState::Shutdown);
        assert!(client.is_shutdown());

        eventually("shutdown notification", || {
            server.saw_shutdown.load(Ordering::SeqCst)
        })
        .await;
        eventually("exit notification", || {
            server.saw_exit.load(Ordering::SeqCst)
        })
        .await;

        // Idempotent.
        timeout(WAIT, client.shutdown()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn operations_after_shutdown_are_disposed() {
        let (client, _server) = piped_client(json!({"capabilities": {}}));
        client
            .initialize(None, CancellationToken::new())
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        assert!(matches!(
            client.send_empty_notification("anything"),
            Err(ClientError::Disposed)
        ));
        let outcome = client
            .send_request("anything", None, CancellationToken::new())
            .await;
        assert!(matches!(outcome, Err(ClientError::Disposed)));
        assert!(matches!(
            client.register_handler("m", Handler::empty_notification(|| Ok(()))),
            Err(ClientError::Disposed)
        ));
        let outcome = client.initialize(None, CancellationToken::new()).await;
        assert!(matches!(outcome, Err(ClientError::Disposed)));
    }

    #[tokio::test]
    async fn requests_before_initialize_are_rejected() {
        let (client, _server) = piped_client(json!({"capabilities": {}}));
        let outcome = client
            .send_request("anything", None, CancellationToken::new())
            .await;
        assert!(matches!(outcome, Err(ClientError::NotInitialized)));
    }

    #[tokio::test]
    async fn request_round_trips_through_client() {
        let (client, server) = piped_client(json!({"capabilities": {}}));
        let _echo = server
            .connection
            .register_handler(
                "echo",
                Handler::request(|params: Value, _cancel| async move { Ok(params) }),
            )
            .unwrap();

        client
            .initialize(None, CancellationToken::new())
            .await
            .unwrap();
        let response = timeout(
            WAIT,
            client.send_request("echo", Some(json!({"n": 1})), CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(response, json!({"n": 1}));
    }

    #[tokio::test]
    async fn server_death_triggers_auto_shutdown() {
        let mut adapter = PipeServer::new();
        let server_streams = adapter.take_server_streams().unwrap();
        let _server = TestServer::start(server_streams, json!({"capabilities": {}}));
        let exit = adapter.exit_latch();

        let client = LanguageClient::from_adapter(Box::new(adapter));
        client
            .initialize(None, CancellationToken::new())
            .await
            .unwrap();

        exit.trigger(ServerExit { code: Some(1) });
        timeout(WAIT, client.has_shutdown()).await.unwrap();
        assert_eq!(client.state(), ClientState::Shutdown);
    }
}
