//! Inbound message dispatch
//!
//! A registry keyed by method name that routes server-initiated requests and
//! notifications to user-supplied handlers. Handlers are tagged by kind —
//! empty notification, notification, request without a result, request with
//! a result — and the three routing entry points match on the kind. At most
//! one handler per method; the registration guard deregisters on release.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

type Registry = Arc<RwLock<HashMap<String, Arc<Handler>>>>;

// ============================================================================
// Errors
// ============================================================================

/// Registration errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler already registered for method: {0}")]
    DuplicateMethod(String),
}

/// Failure reported by a user-supplied handler.
///
/// For requests this becomes a JSON-RPC error response; for notifications it
/// is logged and dropped.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,

    /// Optional diagnostic payload carried in the error response `data`.
    pub data: Option<Value>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(message: impl Into<String>, data: Value) -> Self {
        Self {
            message: message.into(),
            data: Some(data),
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

type EmptyNotificationFn = Box<dyn Fn() -> Result<(), HandlerError> + Send + Sync>;
type NotificationFn = Box<dyn Fn(Value) -> Result<(), HandlerError> + Send + Sync>;
type RequestNoResultFn =
    Box<dyn Fn(Option<Value>, CancellationToken) -> BoxFuture<Result<(), HandlerError>> + Send + Sync>;
type RequestFn =
    Box<dyn Fn(Option<Value>, CancellationToken) -> BoxFuture<Result<Value, HandlerError>> + Send + Sync>;

/// A handler descriptor, tagged by kind.
pub enum Handler {
    EmptyNotification(EmptyNotificationFn),
    Notification(NotificationFn),
    RequestNoResult(RequestNoResultFn),
    Request(RequestFn),
}

impl Handler {
    /// Notification handler with no payload.
    pub fn empty_notification<F>(f: F) -> Self
    where
        F: Fn() -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self::EmptyNotification(Box::new(f))
    }

    /// Notification handler with a typed payload.
    pub fn notification<P, F>(f: F) -> Self
    where
        P: DeserializeOwned,
        F: Fn(P) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self::Notification(Box::new(move |params| {
            let params: P = serde_json::from_value(params)
                .map_err(|e| HandlerError::new(format!("invalid params: {e}")))?;
            f(params)
        }))
    }

    /// Request handler with a typed payload and no result (responds null).
    pub fn request_no_result<P, F, Fut>(f: F) -> Self
    where
        P: DeserializeOwned,
        F: Fn(P, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self::RequestNoResult(Box::new(
            move |params, token| -> BoxFuture<Result<(), HandlerError>> {
                match serde_json::from_value::<P>(params.unwrap_or(Value::Null)) {
                    Ok(params) => Box::pin(f(params, token)),
                    Err(e) => Box::pin(async move {
                        Err(HandlerError::new(format!("invalid params: {e}")))
                    }),
                }
            },
        ))
    }

    /// Request handler with typed payload and result.
    pub fn request<P, R, F, Fut>(f: F) -> Self
    where
        P: DeserializeOwned,
        R: Serialize + Send + 'static,
        F: Fn(P, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        Self::Request(Box::new(
            move |params, token| -> BoxFuture<Result<Value, HandlerError>> {
                match serde_json::from_value::<P>(params.unwrap_or(Value::Null)) {
                    Ok(params) => {
                        let fut = f(params, token);
                        Box::pin(async move {
                            let result = fut.await?;
                            serde_json::to_value(result)
                                .map_err(|e| HandlerError::new(format!("invalid result: {e}")))
                        })
                    }
                    Err(e) => Box::pin(async move {
                        Err(HandlerError::new(format!("invalid params: {e}")))
                    }),
                }
            },
        ))
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Method-name → handler registry.
///
/// Reads happen on every dispatch and writes only on (de)registration, so
/// the registry sits behind an `RwLock`.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Registry,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a handler for `method`.
    ///
    /// Fails when a handler is already registered; the returned guard
    /// deregisters on release or drop.
    pub fn register(
        &self,
        method: impl Into<String>,
        handler: Handler,
    ) -> Result<HandlerRegistration, RegistryError> {
        let method = method.into();
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if registry.contains_key(&method) {
            return Err(RegistryError::DuplicateMethod(method));
        }
        registry.insert(method.clone(), Arc::new(handler));
        Ok(HandlerRegistration {
            method,
            registry: Arc::downgrade(&self.registry),
        })
    }

    fn lookup(&self, method: &str) -> Option<Arc<Handler>> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
    }

    /// Route a notification that arrived without params.
    ///
    /// Returns whether a handler took it; handler failures propagate to the
    /// caller (the dispatch loop).
    pub fn try_handle_empty_notification(&self, method: &str) -> Result<bool, HandlerError> {
        match self.lookup(method).as_deref() {
            Some(Handler::EmptyNotification(f)) => f().map(|_| true),
            Some(Handler::Notification(f)) => f(Value::Null).map(|_| true),
            Some(_) => {
                debug!("notification {} matched a request handler, ignoring", method);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Route a notification that carried params (possibly an empty object).
    pub fn try_handle_notification(&self, method: &str, params: Value) -> Result<bool, HandlerError> {
        match self.lookup(method).as_deref() {
            Some(Handler::Notification(f)) => f(params).map(|_| true),
            Some(Handler::EmptyNotification(f)) => f().map(|_| true),
            Some(_) => {
                debug!("notification {} matched a request handler, ignoring", method);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Route an inbound request; `None` means no handler is registered.
    ///
    /// The returned future is the handler body; the dispatch loop spawns it
    /// rather than awaiting it inline.
    pub fn try_handle_request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> Option<BoxFuture<Result<Value, HandlerError>>> {
        let handler = self.lookup(method)?;
        match &*handler {
            Handler::Request(f) => Some(f(params, cancel)),
            Handler::RequestNoResult(f) => {
                let fut = f(params, cancel);
                Some(Box::pin(async move { fut.await.map(|_| Value::Null) }))
            }
            Handler::EmptyNotification(_) | Handler::Notification(_) => {
                debug!("request {} matched a notification handler, ignoring", method);
                None
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Registration Guard
// ============================================================================

/// Keeps a handler registered; dropping it (or calling [`release`]) removes
/// the handler from the registry.
///
/// [`release`]: HandlerRegistration::release
pub struct HandlerRegistration {
    method: String,
    registry: Weak<RwLock<HashMap<String, Arc<Handler>>>>,
}

impl HandlerRegistration {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Deregister the handler.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for HandlerRegistration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.method);
        }
    }
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("method", &self.method)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Deserialize)]
    struct EchoParams {
        text: String,
    }

    #[derive(Serialize)]
    struct EchoResult {
        text: String,
    }

    #[test]
    fn duplicate_method_is_rejected() {
        let dispatcher = Dispatcher::new();
        let _keep = dispatcher
            .register("ping", Handler::empty_notification(|| Ok(())))
            .unwrap();

        let second = dispatcher.register("ping", Handler::empty_notification(|| Ok(())));
        assert!(matches!(second, Err(RegistryError::DuplicateMethod(m)) if m == "ping"));
    }

    #[test]
    fn release_then_reregister_succeeds() {
        let dispatcher = Dispatcher::new();
        let registration = dispatcher
            .register("ping", Handler::empty_notification(|| Ok(())))
            .unwrap();
        registration.release();
        assert!(
            dispatcher
                .register("ping", Handler::empty_notification(|| Ok(())))
                .is_ok()
        );
    }

    #[test]
    fn drop_deregisters() {
        let dispatcher = Dispatcher::new();
        {
            let _registration = dispatcher
                .register("ping", Handler::empty_notification(|| Ok(())))
                .unwrap();
        }
        assert!(!dispatcher.try_handle_empty_notification("ping").unwrap());
        assert!(
            dispatcher
                .register("ping", Handler::empty_notification(|| Ok(())))
                .is_ok()
        );
    }

    #[test]
    fn empty_notification_routes() {
        let dispatcher = Dispatcher::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let _keep = dispatcher
            .register(
                "ping",
                Handler::empty_notification(move || {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();

        assert!(dispatcher.try_handle_empty_notification("ping").unwrap());
        assert!(fired.load(Ordering::SeqCst));
        assert!(!dispatcher.try_handle_empty_notification("other").unwrap());
    }

    #[test]
    fn typed_notification_deserializes_params() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let sink = Arc::clone(&seen);
        let _keep = dispatcher
            .register(
                "note",
                Handler::notification(move |params: EchoParams| {
                    *sink.lock().unwrap() = params.text;
                    Ok(())
                }),
            )
            .unwrap();

        assert!(
            dispatcher
                .try_handle_notification("note", json!({"text": "hi"}))
                .unwrap()
        );
        assert_eq!(*seen.lock().unwrap(), "hi");
    }

    #[test]
    fn notification_handler_error_propagates() {
        let dispatcher = Dispatcher::new();
        let _keep = dispatcher
            .register(
                "bad",
                Handler::notification(|_: Value| Err(HandlerError::new("boom"))),
            )
            .unwrap();

        let err = dispatcher
            .try_handle_notification("bad", json!({}))
            .unwrap_err();
        assert_eq!(err.message, "boom");
    }

    #[tokio::test]
    async fn typed_request_round_trips() {
        let dispatcher = Dispatcher::new();
        let _keep = dispatcher
            .register(
                "echo",
                Handler::request(|params: EchoParams, _cancel| async move {
                    Ok(EchoResult {
                        text: format!("{}!", params.text),
                    })
                }),
            )
            .unwrap();

        let fut = dispatcher
            .try_handle_request("echo", Some(json!({"text": "hi"})), CancellationToken::new())
            .expect("handler registered");
        assert_eq!(fut.await.unwrap(), json!({"text": "hi!"}));
    }

    #[tokio::test]
    async fn request_no_result_responds_null() {
        let dispatcher = Dispatcher::new();
        let _keep = dispatcher
            .register(
                "apply",
                Handler::request_no_result(|_: Value, _cancel| async move { Ok(()) }),
            )
            .unwrap();

        let fut = dispatcher
            .try_handle_request("apply", Some(json!({})), CancellationToken::new())
            .expect("handler registered");
        assert_eq!(fut.await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn request_with_bad_params_fails_handler() {
        let dispatcher = Dispatcher::new();
        let _keep = dispatcher
            .register(
                "echo",
                Handler::request(|_params: EchoParams, _cancel| async move {
                    Ok(Value::Null)
                }),
            )
            .unwrap();

        let fut = dispatcher
            .try_handle_request("echo", Some(json!({"wrong": 1})), CancellationToken::new())
            .expect("handler registered");
        let err = fut.await.unwrap_err();
        assert!(err.message.starts_with("invalid params"));
    }

    #[test]
    fn request_routing_misses_notification_handlers() {
        let dispatcher = Dispatcher::new();
        let _keep = dispatcher
            .register("ping", Handler::empty_notification(|| Ok(())))
            .unwrap();

        assert!(
            dispatcher
                .try_handle_request("ping", None, CancellationToken::new())
                .is_none()
        );
    }
}
