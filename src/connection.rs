//! Connection
//!
//! Owns the framing codec over the server's stream pair and runs three
//! cooperative loops: send (drains the outbound queue onto the wire),
//! receive (decodes frames, resolves pending responses, queues the rest),
//! and dispatch (routes queued requests and notifications through the
//! dispatcher). Correlation state lives in two tables: pending outbound
//! requests keyed by id, and cancellation handles for in-flight inbound
//! requests. One connection-wide cancellation token is the parent of every
//! per-request token, so closing tears the whole tree down.

use crate::dispatch::{Dispatcher, Handler, HandlerRegistration, RegistryError};
use crate::framing::{FrameReader, FrameWriter};
use crate::protocol::{
    InboundMessage, JsonRpcErrorObject, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    OutboundMessage, RequestId,
};
use crate::server::ServerStreams;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Cancellation of in-flight requests, in either direction.
pub const CANCEL_REQUEST_METHOD: &str = "$/cancelRequest";

/// Bounded wait for the outbound queue to drain on a flushing close.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_FLUSH_POLL: Duration = Duration::from_millis(50);

// ============================================================================
// Errors
// ============================================================================

/// Connection errors delivered to callers
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection is not open")]
    NotConnected,

    #[error("connection already opened")]
    AlreadyOpen,

    #[error("transport closed")]
    TransportClosed,

    #[error("request canceled")]
    Canceled,

    #[error("server error ({code}): {message}")]
    Server {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("deserialization error: {0}")]
    Deserialization(serde_json::Error),
}

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Open,
    Closing,
}

// ============================================================================
// Connection
// ============================================================================

type PendingSlot = oneshot::Sender<Result<Value, ConnectionError>>;

/// A bidirectional JSON-RPC connection to one language server.
///
/// Single-use: `open` once, `close` once; after the loops terminate the
/// connection stays closed.
pub struct Connection {
    shared: Arc<Shared>,
}

struct Shared {
    state: StdMutex<ConnectionState>,

    dispatcher: Dispatcher,

    /// Outbound request id counter; goes on the wire as a decimal string
    next_id: AtomicI64,

    /// Pending outbound requests awaiting responses, keyed by id
    pending: Mutex<HashMap<RequestId, PendingSlot>>,

    /// Cancellation handles for in-flight inbound requests, keyed by id
    inbound_cancels: Mutex<HashMap<RequestId, CancellationToken>>,

    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: StdMutex<Option<mpsc::UnboundedReceiver<OutboundMessage>>>,

    /// Messages enqueued but not yet written; drives the close-flush wait
    outbound_depth: AtomicUsize,

    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: StdMutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,

    /// Cleared during a flushing close so no new inbound work is accepted
    accepting_inbound: AtomicBool,

    /// Root of the per-request cancellation tree; canceled on close
    cancel_root: CancellationToken,

    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl Connection {
    pub fn new(dispatcher: Dispatcher) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: StdMutex::new(ConnectionState::Closed),
                dispatcher,
                next_id: AtomicI64::new(1),
                pending: Mutex::new(HashMap::new()),
                inbound_cancels: Mutex::new(HashMap::new()),
                outbound_tx,
                outbound_rx: StdMutex::new(Some(outbound_rx)),
                inbound_tx,
                inbound_rx: StdMutex::new(Some(inbound_rx)),
                outbound_depth: AtomicUsize::new(0),
                accepting_inbound: AtomicBool::new(true),
                cancel_root: CancellationToken::new(),
                closed_tx,
                closed_rx,
            }),
        }
    }

    /// Start the send, receive, and dispatch loops on the given streams.
    ///
    /// Allowed exactly once, from the initial Closed state.
    pub fn open(&self, streams: ServerStreams) -> Result<(), ConnectionError> {
        let outbound_rx = self
            .shared
            .outbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ConnectionError::AlreadyOpen)?;
        let inbound_rx = self
            .shared
            .inbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ConnectionError::AlreadyOpen)?;
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *state != ConnectionState::Closed {
                return Err(ConnectionError::AlreadyOpen);
            }
            *state = ConnectionState::Open;
        }

        info!("opening connection");

        let send = tokio::spawn(send_loop(
            Arc::clone(&self.shared),
            FrameWriter::new(streams.output),
            outbound_rx,
        ));
        let receive = tokio::spawn(receive_loop(
            Arc::clone(&self.shared),
            FrameReader::new(streams.input),
        ));
        let dispatch = tokio::spawn(dispatch_loop(Arc::clone(&self.shared), inbound_rx));

        // Join watcher: Closing -> Closed once all three loops have returned.
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let _ = tokio::join!(send, receive, dispatch);
            *shared.state.lock().unwrap_or_else(PoisonError::into_inner) =
                ConnectionState::Closed;
            let _ = shared.closed_tx.send(true);
            info!("connection closed");
        });

        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Resolves once all three loops have terminated.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Register a handler for server-initiated traffic.
    pub fn register_handler(
        &self,
        method: impl Into<String>,
        handler: Handler,
    ) -> Result<HandlerRegistration, RegistryError> {
        self.shared.dispatcher.register(method, handler)
    }

    /// Fire-and-forget notification without params.
    pub fn send_empty_notification(&self, method: &str) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        debug!("sending notification {}", method);
        self.shared
            .enqueue(OutboundMessage::Notification(JsonRpcNotification {
                jsonrpc: "2.0".to_string(),
                method: method.to_string(),
                params: None,
            }))
    }

    /// Fire-and-forget notification with a payload.
    pub fn send_notification(&self, method: &str, params: Value) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        debug!("sending notification {}", method);
        self.shared
            .enqueue(OutboundMessage::Notification(JsonRpcNotification {
                jsonrpc: "2.0".to_string(),
                method: method.to_string(),
                params: Some(params),
            }))
    }

    /// Send a request and await its response.
    ///
    /// When the caller's token fires, the pending slot fails with
    /// [`ConnectionError::Canceled`] and, best-effort, a `$/cancelRequest`
    /// notification carrying the in-flight id is enqueued.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Value, ConnectionError> {
        self.ensure_open()?;

        let id = RequestId::from_sequence(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let (slot_tx, slot_rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .await
            .insert(id.clone(), slot_tx);

        debug!("sending request {} (id {})", method, id);
        let request = OutboundMessage::Request(JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: id.clone(),
            method: method.to_string(),
            params,
        });
        if let Err(e) = self.shared.enqueue(request) {
            self.shared.pending.lock().await.remove(&id);
            return Err(e);
        }

        tokio::select! {
            outcome = slot_rx => match outcome {
                Ok(outcome) => outcome,
                // Slot dropped without a resolution
                Err(_) => Err(ConnectionError::TransportClosed),
            },
            _ = cancel.cancelled() => {
                self.shared.pending.lock().await.remove(&id);
                debug!("request {} (id {}) canceled by caller", method, id);
                let _ = self.shared.enqueue(OutboundMessage::Notification(JsonRpcNotification {
                    jsonrpc: "2.0".to_string(),
                    method: CANCEL_REQUEST_METHOD.to_string(),
                    params: Some(json!({ "id": id })),
                }));
                Err(ConnectionError::Canceled)
            }
            // A slot inserted while close() was draining would otherwise
            // never resolve.
            _ = self.shared.cancel_root.cancelled() => {
                self.shared.pending.lock().await.remove(&id);
                Err(ConnectionError::TransportClosed)
            }
        }
    }

    /// Typed variant of [`send_request`](Connection::send_request).
    pub async fn send_request_as<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<R, ConnectionError> {
        let value = self.send_request(method, params, cancel).await?;
        serde_json::from_value(value).map_err(ConnectionError::Deserialization)
    }

    /// Initiate shutdown.
    ///
    /// With `flush_outgoing`, inbound intake stops and the outbound queue
    /// gets a bounded drain window before teardown. Every pending request
    /// fails with *transport closed*; the root token then cancels the loops
    /// and any in-flight inbound handlers. Await [`closed`](Connection::closed)
    /// for full termination. Closing an already-closing connection is a
    /// no-op.
    pub async fn close(&self, flush_outgoing: bool) -> Result<(), ConnectionError> {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match *state {
                ConnectionState::Open => *state = ConnectionState::Closing,
                ConnectionState::Closing | ConnectionState::Closed => return Ok(()),
            }
        }
        info!("closing connection (flush_outgoing: {})", flush_outgoing);

        if flush_outgoing {
            self.shared.accepting_inbound.store(false, Ordering::SeqCst);
            let deadline = tokio::time::Instant::now() + CLOSE_FLUSH_TIMEOUT;
            while self.shared.outbound_depth.load(Ordering::SeqCst) > 0
                && tokio::time::Instant::now() < deadline
            {
                tokio::time::sleep(CLOSE_FLUSH_POLL).await;
            }
            let remaining = self.shared.outbound_depth.load(Ordering::SeqCst);
            if remaining > 0 {
                warn!("closing with {} unsent outbound messages", remaining);
            }
        }

        self.shared.fail_pending().await;
        self.shared.cancel_root.cancel();
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected)
        }
    }
}

impl Shared {
    /// Push one envelope onto the outbound queue.
    fn enqueue(&self, message: OutboundMessage) -> Result<(), ConnectionError> {
        self.outbound_depth.fetch_add(1, Ordering::SeqCst);
        if self.outbound_tx.send(message).is_err() {
            self.outbound_depth.fetch_sub(1, Ordering::SeqCst);
            return Err(ConnectionError::TransportClosed);
        }
        Ok(())
    }

    /// Fail every pending outbound request with *transport closed*.
    async fn fail_pending(&self) {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            warn!("failing {} pending requests: transport closed", pending.len());
        }
        for (_, slot) in pending.drain() {
            let _ = slot.send(Err(ConnectionError::TransportClosed));
        }
    }

    /// Teardown initiated from inside a loop (write failure, bad frame).
    async fn begin_close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                ConnectionState::Open => *state = ConnectionState::Closing,
                ConnectionState::Closing | ConnectionState::Closed => return,
            }
        }
        self.fail_pending().await;
        self.cancel_root.cancel();
    }

    /// Route one decoded frame from the receive loop.
    async fn route_inbound(&self, text: String) {
        match InboundMessage::classify(&text) {
            InboundMessage::Response { id, result, error } => {
                let slot = self.pending.lock().await.remove(&id);
                match slot {
                    Some(slot) => {
                        // An error always wins over a missing result.
                        let outcome = match error {
                            Some(err) => Err(ConnectionError::Server {
                                code: err.code,
                                message: err.message,
                                data: err.data,
                            }),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        if slot.send(outcome).is_err() {
                            debug!("response receiver dropped for request {}", id);
                        }
                    }
                    None => debug!("dropping response for unknown request {}", id),
                }
            }
            message @ (InboundMessage::Request { .. } | InboundMessage::Notification { .. }) => {
                if !self.accepting_inbound.load(Ordering::SeqCst) {
                    debug!("dropping inbound message while closing");
                    return;
                }
                if self.inbound_tx.send(message).is_err() {
                    debug!("inbound queue closed, dropping message");
                }
            }
            InboundMessage::Invalid(reason) => {
                warn!("dropping invalid message: {}", reason);
            }
        }
    }

    /// Handle an inbound `$/cancelRequest` (request or notification form).
    async fn cancel_inbound(&self, params: Option<Value>) {
        let id = params
            .as_ref()
            .and_then(|p| p.get("id"))
            .and_then(|v| serde_json::from_value::<RequestId>(v.clone()).ok());
        let Some(id) = id else {
            warn!("{} without a valid id", CANCEL_REQUEST_METHOD);
            return;
        };
        match self.inbound_cancels.lock().await.remove(&id) {
            Some(token) => {
                debug!("canceling inbound request {}", id);
                token.cancel();
            }
            None => debug!("no in-flight inbound request {} to cancel", id),
        }
    }

    /// Dispatch one inbound notification inline.
    ///
    /// Present-but-empty params still routes as a notification; only a
    /// wholly absent params object routes as an empty notification.
    fn dispatch_notification(&self, method: String, params: Option<Value>) {
        let outcome = match params {
            None => self.dispatcher.try_handle_empty_notification(&method),
            Some(params) => self.dispatcher.try_handle_notification(&method, params),
        };
        match outcome {
            Ok(true) => {}
            Ok(false) => debug!("no handler for notification {}", method),
            Err(e) => warn!("notification handler for {} failed: {}", method, e),
        }
    }
}

// ============================================================================
// Loops
// ============================================================================

async fn send_loop<W: AsyncWrite + Unpin>(
    shared: Arc<Shared>,
    mut writer: FrameWriter<W>,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundMessage>,
) {
    let cancel = shared.cancel_root.clone();
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = outbound_rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let json = match item.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("failed to encode outbound message: {}", e);
                shared.outbound_depth.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
        };
        match item.method() {
            Some(method) => trace!("writing {} ({} bytes)", method, json.len()),
            None => trace!("writing response ({} bytes)", json.len()),
        }

        let written = writer.write_frame(&json).await;
        shared.outbound_depth.fetch_sub(1, Ordering::SeqCst);
        if let Err(e) = written {
            error!("write failed, closing connection: {}", e);
            shared.begin_close().await;
            break;
        }
    }
    trace!("send loop finished");
}

async fn receive_loop<R: AsyncRead + Unpin>(shared: Arc<Shared>, mut reader: FrameReader<R>) {
    let cancel = shared.cancel_root.clone();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = reader.read_frame() => frame,
        };
        match frame {
            Ok(Some(text)) => {
                trace!("received frame ({} bytes)", text.len());
                shared.route_inbound(text).await;
            }
            Ok(None) => {
                // Clean end-of-stream ends this loop only; the process-exit
                // observer decides whether the connection dies with it.
                debug!("server output ended");
                break;
            }
            Err(e) => {
                error!("receive failed, closing connection: {}", e);
                shared.begin_close().await;
                break;
            }
        }
    }
    trace!("receive loop finished");
}

/// Dispatch one inbound request off the loop.
async fn dispatch_request(
    shared: &Arc<Shared>,
    id: RequestId,
    method: String,
    params: Option<Value>,
) {
    let token = shared.cancel_root.child_token();
    shared
        .inbound_cancels
        .lock()
        .await
        .insert(id.clone(), token.clone());

    let Some(handler) = shared
        .dispatcher
        .try_handle_request(&method, params, token.clone())
    else {
        debug!("no handler for request {}", method);
        let _ = shared.enqueue(OutboundMessage::Response(JsonRpcResponse::failure(
            id.clone(),
            JsonRpcErrorObject::method_not_found(&method),
        )));
        shared.inbound_cancels.lock().await.remove(&id);
        return;
    };

    // Run the handler as its own task; the loop never blocks on it.
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            outcome = handler => Some(outcome),
        };
        match outcome {
            Some(Ok(result)) => {
                let _ = shared.enqueue(OutboundMessage::Response(JsonRpcResponse::success(
                    id.clone(),
                    result,
                )));
            }
            Some(Err(e)) => {
                warn!("handler for request {} failed: {}", method, e);
                let _ = shared.enqueue(OutboundMessage::Response(JsonRpcResponse::failure(
                    id.clone(),
                    JsonRpcErrorObject::handler_failure(e.message, e.data),
                )));
            }
            // Server-initiated cancellation: respond with silence.
            None => debug!("handler for request {} canceled, not responding", method),
        }
        shared.inbound_cancels.lock().await.remove(&id);
    });
}

async fn dispatch_loop(shared: Arc<Shared>, mut inbound_rx: mpsc::UnboundedReceiver<InboundMessage>) {
    let cancel = shared.cancel_root.clone();
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = inbound_rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        match message {
            InboundMessage::Request { id, method, params } => {
                if method == CANCEL_REQUEST_METHOD {
                    shared.cancel_inbound(params).await;
                    continue;
                }
                debug!("dispatching request {} (id {})", method, id);
                dispatch_request(&shared, id, method, params).await;
            }
            InboundMessage::Notification { method, params } => {
                if method == CANCEL_REQUEST_METHOD {
                    shared.cancel_inbound(params).await;
                    continue;
                }
                debug!("dispatching notification {}", method);
                shared.dispatch_notification(method, params);
            }
            InboundMessage::Response { .. } | InboundMessage::Invalid(_) => {}
        }
    }
    trace!("dispatch loop finished");
}

// ============================================================================
// Tests
// ============================================================================
