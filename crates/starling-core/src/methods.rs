//! Named method handlers with validation, per-call timeout, and metrics.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use starling_wire::{validate_method_name, ErrorCode};
use thiserror::Error;
use tokio::time::Instant;

use crate::context::RequestContext;
use crate::events::{Event, Events};

/// Default per-method handler timeout.
pub const DEFAULT_METHOD_TIMEOUT: Duration = Duration::from_secs(30);

/// Error a handler may return. When `code` is set the reply forwards it
/// verbatim; otherwise the kernel replies METHOD_ERROR with the message.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct MethodError {
    pub code: Option<String>,
    pub message: String,
    pub details: Option<Value>,
}

impl MethodError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<String> for MethodError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for MethodError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Payload validator: `Err(reason)` rejects the call with
/// VALIDATION_ERROR before the handler runs.
pub type PayloadValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

type Handler =
    Arc<dyn Fn(Arc<RequestContext>) -> BoxFuture<'static, Result<(), MethodError>> + Send + Sync>;

/// Registration options for one method.
#[derive(Clone, Default)]
pub struct MethodOptions {
    /// Handler execution ceiling; `None` uses the 30 s default.
    pub timeout: Option<Duration>,
    /// Skip name validation (kernel-internal registrations).
    pub internal: bool,
    pub validate: Option<PayloadValidator>,
    pub metadata: Option<Value>,
}

impl fmt::Debug for MethodOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodOptions")
            .field("timeout", &self.timeout)
            .field("internal", &self.internal)
            .field("validate", &self.validate.is_some())
            .finish()
    }
}

/// Per-method execution counters.
#[derive(Clone, Debug, Default)]
pub struct MethodMetrics {
    pub calls: u64,
    pub errors: u64,
    pub total_execution_time: Duration,
    pub last_execution_time: Duration,
    pub last_error: Option<String>,
}

impl MethodMetrics {
    pub fn average_execution_time(&self) -> Duration {
        if self.calls == 0 {
            Duration::ZERO
        } else {
            self.total_execution_time / self.calls as u32
        }
    }
}

struct Method {
    handler: Handler,
    timeout: Duration,
    validate: Option<PayloadValidator>,
    metrics: Mutex<MethodMetrics>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid method name: {0}")]
    InvalidName(String),

    #[error("method '{0}' is already registered")]
    Duplicate(String),
}

struct MethodsInner {
    methods: RwLock<HashMap<String, Arc<Method>>>,
    events: Events,
}

/// The inbound method dispatcher. Registration is rare and serialized
/// against dispatch; lookups take the read path.
#[derive(Clone)]
pub struct MethodsRegistry {
    inner: Arc<MethodsInner>,
}

impl MethodsRegistry {
    pub fn new(events: Events) -> Self {
        Self {
            inner: Arc::new(MethodsInner {
                methods: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Register a handler under `namespace:action`. Reserved namespaces
    /// and duplicates are rejected; `internal` registrations skip the
    /// name check.
    pub fn register<F, Fut>(
        &self,
        name: impl Into<String>,
        handler: F,
        opts: MethodOptions,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), MethodError>> + Send + 'static,
    {
        let name = name.into();
        if !opts.internal {
            let validation = validate_method_name(&name);
            if !validation.is_valid() {
                return Err(RegistryError::InvalidName(validation.errors.join("; ")));
            }
        }

        let method = Arc::new(Method {
            handler: Arc::new(move |ctx| Box::pin(handler(ctx))),
            timeout: opts.timeout.unwrap_or(DEFAULT_METHOD_TIMEOUT),
            validate: opts.validate,
            metrics: Mutex::new(MethodMetrics::default()),
        });

        {
            let mut methods = self.inner.methods.write();
            if methods.contains_key(&name) {
                return Err(RegistryError::Duplicate(name));
            }
            methods.insert(name.clone(), method);
        }
        self.inner.events.emit(Event::MethodRegistered { name });
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.inner.methods.write().remove(name).is_some();
        if removed {
            self.inner.events.emit(Event::MethodUnregistered {
                name: name.to_string(),
            });
        }
        removed
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.methods.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.methods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.methods.read().keys().cloned().collect()
    }

    /// Snapshot of one method's metrics.
    pub fn metrics(&self, name: &str) -> Option<MethodMetrics> {
        self.inner
            .methods
            .read()
            .get(name)
            .map(|m| m.metrics.lock().clone())
    }

    /// Dispatch one inbound request to its handler.
    ///
    /// The handler races a per-method timeout without being cancelled;
    /// whichever side loses is expected to observe the context's
    /// processed latch before replying. Every exit path is single-shot
    /// thanks to that latch.
    pub async fn dispatch(&self, ctx: Arc<RequestContext>) {
        let method = self.inner.methods.read().get(ctx.method()).cloned();
        let Some(method) = method else {
            let _ = ctx
                .error(
                    ErrorCode::MethodNotFound,
                    format!("Method '{}' not found", ctx.method()),
                    None,
                )
                .await;
            return;
        };

        if let Some(validate) = &method.validate {
            let payload = ctx.payload().cloned().unwrap_or(Value::Null);
            if let Err(reason) = validate(&payload) {
                method.metrics.lock().errors += 1;
                let _ = ctx.error(ErrorCode::ValidationError, reason, None).await;
                return;
            }
        }

        {
            let mut metrics = method.metrics.lock();
            metrics.calls += 1;
        }
        let started = Instant::now();

        // Spawned so a lost race does not cancel the handler.
        let mut task = tokio::spawn((method.handler)(Arc::clone(&ctx)));
        let outcome = tokio::time::timeout(method.timeout, &mut task).await;

        let elapsed = started.elapsed();
        {
            let mut metrics = method.metrics.lock();
            metrics.total_execution_time += elapsed;
            metrics.last_execution_time = elapsed;
        }

        match outcome {
            Err(_) => {
                if !ctx.is_processed() {
                    let _ = ctx
                        .error(
                            ErrorCode::RequestTimeout,
                            format!("Method did not respond within {:?}", method.timeout),
                            None,
                        )
                        .await;
                }
            }
            Ok(Err(join_err)) => {
                let message = format!("method handler panicked: {}", join_err);
                {
                    let mut metrics = method.metrics.lock();
                    metrics.errors += 1;
                    metrics.last_error = Some(message.clone());
                }
                if !ctx.is_processed() {
                    let _ = ctx.error(ErrorCode::MethodError, message, None).await;
                }
            }
            Ok(Ok(Err(err))) => {
                {
                    let mut metrics = method.metrics.lock();
                    metrics.errors += 1;
                    metrics.last_error = Some(err.message.clone());
                }
                if !ctx.is_processed() {
                    let code = err
                        .code
                        .unwrap_or_else(|| ErrorCode::MethodError.as_str().to_string());
                    let _ = ctx.error(code, err.message, err.details).await;
                }
            }
            Ok(Ok(Ok(()))) => {
                if !ctx.is_processed() {
                    let _ = ctx
                        .error(
                            ErrorCode::MethodError,
                            "Method did not provide a response",
                            None,
                        )
                        .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferOptions, SendBuffer};
    use crate::context::Outbound;
    use crate::transport::{Transport, TransportError};
    use serde_json::json;
    use starling_wire::{Message, MessageKind, Peer, RawFrame};
    use tokio::sync::watch;
    use uuid::Uuid;

    struct CaptureTransport {
        sent: Mutex<Vec<String>>,
    }

    impl Transport for CaptureTransport {
        fn is_connected(&self) -> bool {
            true
        }

        fn send_raw(&self, frame: RawFrame) -> BoxFuture<'_, Result<(), TransportError>> {
            Box::pin(async move {
                if let RawFrame::Text(text) = frame {
                    self.sent.lock().push(text);
                }
                Ok(())
            })
        }
    }

    struct Rig {
        registry: MethodsRegistry,
        transport: Arc<CaptureTransport>,
        outbound: Outbound,
        _gate: watch::Sender<bool>,
    }

    fn rig() -> Rig {
        let transport = Arc::new(CaptureTransport {
            sent: Mutex::new(Vec::new()),
        });
        let (gate, rx) = watch::channel(true);
        let events = Events::default();
        let buffer = SendBuffer::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            rx,
            events.clone(),
            BufferOptions {
                batch_window: Duration::from_millis(1),
                ..BufferOptions::default()
            },
        );
        Rig {
            registry: MethodsRegistry::new(events.clone()),
            transport,
            outbound: Outbound::new(buffer, events),
            _gate: gate,
        }
    }

    fn ctx(rig: &Rig, method: &str, payload: Option<Value>) -> Arc<RequestContext> {
        RequestContext::new(
            Uuid::new_v4(),
            method,
            payload,
            Peer::Local,
            None,
            0,
            rig.outbound.clone(),
        )
    }

    async fn first_response(rig: &Rig) -> Message {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let sent = rig.transport.sent.lock();
        serde_json::from_str(sent.first().expect("no response sent")).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn registered_handler_replies() {
        let rig = rig();
        rig.registry
            .register(
                "users:getProfile",
                |ctx: Arc<RequestContext>| async move {
                    ctx.success(Some(json!({"name": "John"}))).await.ok();
                    Ok(())
                },
                MethodOptions::default(),
            )
            .unwrap();

        rig.registry
            .dispatch(ctx(&rig, "users:getProfile", Some(json!({"userId": "123"}))))
            .await;

        let response = first_response(&rig).await;
        match response.kind {
            MessageKind::Response { success, data, .. } => {
                assert!(success);
                assert_eq!(data.unwrap()["name"], "John");
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_method_gets_method_not_found() {
        let rig = rig();
        rig.registry.dispatch(ctx(&rig, "users:missing", None)).await;

        let response = first_response(&rig).await;
        match response.kind {
            MessageKind::Response { success, error, .. } => {
                assert!(!success);
                assert_eq!(error.unwrap().code, "METHOD_NOT_FOUND");
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_handler_yields_method_error() {
        let rig = rig();
        rig.registry
            .register(
                "quiet:op",
                |_ctx: Arc<RequestContext>| async move { Ok(()) },
                MethodOptions::default(),
            )
            .unwrap();

        rig.registry.dispatch(ctx(&rig, "quiet:op", None)).await;
        let response = first_response(&rig).await;
        match response.kind {
            MessageKind::Response { error, .. } => {
                let error = error.unwrap();
                assert_eq!(error.code, "METHOD_ERROR");
                assert_eq!(error.message, "Method did not provide a response");
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_gets_request_timeout() {
        let rig = rig();
        rig.registry
            .register(
                "slow:op",
                |_ctx: Arc<RequestContext>| async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                },
                MethodOptions {
                    timeout: Some(Duration::from_millis(50)),
                    ..MethodOptions::default()
                },
            )
            .unwrap();

        rig.registry.dispatch(ctx(&rig, "slow:op", None)).await;
        let response = first_response(&rig).await;
        match response.kind {
            MessageKind::Response { error, .. } => {
                assert_eq!(error.unwrap().code, "REQUEST_TIMEOUT");
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handler_error_with_taxonomy_shape_is_forwarded() {
        let rig = rig();
        rig.registry
            .register(
                "fail:op",
                |_ctx: Arc<RequestContext>| async move {
                    Err(MethodError::with_code("QUOTA_EXCEEDED", "too many calls")
                        .with_details(json!({"limit": 10})))
                },
                MethodOptions::default(),
            )
            .unwrap();

        rig.registry.dispatch(ctx(&rig, "fail:op", None)).await;
        let response = first_response(&rig).await;
        match response.kind {
            MessageKind::Response { error, .. } => {
                let error = error.unwrap();
                assert_eq!(error.code, "QUOTA_EXCEEDED");
                assert_eq!(error.details.unwrap()["limit"], 10);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn payload_validator_rejects_before_handler() {
        let rig = rig();
        rig.registry
            .register(
                "strict:op",
                |ctx: Arc<RequestContext>| async move {
                    ctx.success(None).await.ok();
                    Ok(())
                },
                MethodOptions {
                    validate: Some(Arc::new(|payload: &Value| {
                        if payload.get("userId").is_some() {
                            Ok(())
                        } else {
                            Err("payload must carry userId".to_string())
                        }
                    })),
                    ..MethodOptions::default()
                },
            )
            .unwrap();

        rig.registry.dispatch(ctx(&rig, "strict:op", None)).await;
        let response = first_response(&rig).await;
        match response.kind {
            MessageKind::Response { error, .. } => {
                assert_eq!(error.unwrap().code, "VALIDATION_ERROR");
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[tokio::test]
    async fn reserved_and_duplicate_registrations_rejected() {
        let rig = rig();
        let ok = |_ctx: Arc<RequestContext>| async move { Ok(()) };

        assert!(matches!(
            rig.registry.register("system:boom", ok, MethodOptions::default()),
            Err(RegistryError::InvalidName(_))
        ));
        assert!(matches!(
            rig.registry.register("nocolon", ok, MethodOptions::default()),
            Err(RegistryError::InvalidName(_))
        ));

        rig.registry
            .register("users:get", ok, MethodOptions::default())
            .unwrap();
        assert!(matches!(
            rig.registry.register("users:get", ok, MethodOptions::default()),
            Err(RegistryError::Duplicate(_))
        ));

        // Internal registrations bypass the grammar.
        rig.registry
            .register(
                "system:ping",
                ok,
                MethodOptions {
                    internal: true,
                    ..MethodOptions::default()
                },
            )
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_track_calls_and_errors() {
        let rig = rig();
        rig.registry
            .register(
                "metered:op",
                |ctx: Arc<RequestContext>| async move {
                    if ctx.payload().is_some() {
                        ctx.success(None).await.ok();
                        Ok(())
                    } else {
                        Err(MethodError::new("no payload"))
                    }
                },
                MethodOptions::default(),
            )
            .unwrap();

        rig.registry
            .dispatch(ctx(&rig, "metered:op", Some(json!({}))))
            .await;
        rig.registry.dispatch(ctx(&rig, "metered:op", None)).await;

        let metrics = rig.registry.metrics("metered:op").unwrap();
        assert_eq!(metrics.calls, 2);
        assert_eq!(metrics.errors, 1);
        assert_eq!(metrics.last_error.as_deref(), Some("no payload"));
        assert!(metrics.average_execution_time() <= metrics.total_execution_time);
    }
}
