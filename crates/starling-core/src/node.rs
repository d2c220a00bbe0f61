//! The node facade: one endpoint of a helios-starling connection.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use starling_wire::{
    unix_ms, validate_method_grammar, validate_topic_name, ErrorCode, Message, MessageKind,
    RawFrame, Severity,
};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::buffer::{BufferError, BufferOptions, SendBuffer};
use crate::config::NodeConfig;
use crate::context::{
    BinaryContext, ErrorMessageContext, JsonContext, NotificationContext, Outbound,
    RequestContext, ResponseContext, TextContext,
};
use crate::events::{Event, Events, StatsSnapshot};
use crate::manager::RequestsManager;
use crate::methods::{MethodError, MethodOptions, MethodsRegistry, RegistryError};
use crate::queue::{QueueError, QueueOptions, RequestQueue};
use crate::request::{Request, RequestFailure, RequestOptions};
use crate::resolver::{resolve, ClassifiedFrame, ResolveOptions};
use crate::retry::{TimerGroup, TimerHandle};
use crate::topics::{SubscribeOptions, SubscriptionHandle, TopicError, TopicsRegistry};
use crate::transport::Transport;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid method name: {0}")]
    InvalidMethod(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Proxy hooks invoked for frames carrying `peer ≠ false`. The kernel
/// only recognizes the fork; relaying itself is the embedder's concern.
#[derive(Clone)]
pub struct ProxyConfiguration {
    pub request: Arc<dyn Fn(Arc<RequestContext>) -> BoxFuture<'static, ()> + Send + Sync>,
    pub response: Arc<dyn Fn(Arc<ResponseContext>) -> BoxFuture<'static, ()> + Send + Sync>,
    pub notification:
        Arc<dyn Fn(Arc<NotificationContext>) -> BoxFuture<'static, ()> + Send + Sync>,
    pub error_message:
        Arc<dyn Fn(Arc<ErrorMessageContext>) -> BoxFuture<'static, ()> + Send + Sync>,
}

type RawHandler<C> = Arc<dyn Fn(&C) + Send + Sync>;

struct NodeInner {
    config: NodeConfig,
    events: Events,
    timers: TimerGroup,
    connected_tx: watch::Sender<bool>,
    buffer: Arc<SendBuffer>,
    queue: RequestQueue,
    manager: RequestsManager,
    methods: MethodsRegistry,
    topics: TopicsRegistry,
    outbound: Outbound,
    proxy: RwLock<Option<ProxyConfiguration>>,
    text_handlers: RwLock<Vec<RawHandler<TextContext>>>,
    json_handlers: RwLock<Vec<RawHandler<JsonContext>>>,
    binary_handlers: RwLock<Vec<RawHandler<BinaryContext>>>,
    error_handlers: RwLock<Vec<RawHandler<ErrorMessageContext>>>,
    disconnect_timer: Mutex<Option<TimerHandle>>,
}

/// One endpoint of a connection running the helios-starling kernel.
///
/// Cheap to clone; all state is shared. Must be constructed within a
/// tokio runtime (the buffer, queue, and manager spawn their tasks).
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(transport: Arc<dyn Transport>, config: NodeConfig) -> Self {
        let events = Events::new(config.events_capacity);
        let topics = TopicsRegistry::new(events.clone());
        Self::build(transport, config, topics, events)
    }

    /// Construct with a shared topics registry (server-side fan-in /
    /// fan-out across connections). The registry is concurrency-safe and
    /// may be held by any number of nodes.
    pub fn with_shared_topics(
        transport: Arc<dyn Transport>,
        config: NodeConfig,
        topics: TopicsRegistry,
    ) -> Self {
        let events = Events::new(config.events_capacity);
        Self::build(transport, config, topics, events)
    }

    fn build(
        transport: Arc<dyn Transport>,
        config: NodeConfig,
        topics: TopicsRegistry,
        events: Events,
    ) -> Self {
        let timers = TimerGroup::new();
        let (connected_tx, connected_rx) = watch::channel(transport.is_connected());
        let buffer = SendBuffer::new(
            transport,
            connected_rx.clone(),
            events.clone(),
            BufferOptions {
                capacity: config.message_buffer_size,
                max_age: config.message_max_age,
                batch_window: config.batch_window,
                on_full: config.on_full,
            },
        );
        let queue = RequestQueue::new(
            Arc::clone(&buffer),
            connected_rx,
            events.clone(),
            timers.clone(),
            QueueOptions {
                max_size: config.queue_max_size,
                max_retries: config.queue_max_retries,
                base_delay: config.queue_base_delay,
                max_concurrent: config.max_concurrent,
                priority_queuing: false,
                on_full: config.on_full,
                drain_timeout: config.drain_timeout,
                retry_delays: config.queue_retry_delays.clone(),
            },
        );
        let manager = RequestsManager::new(events.clone());
        let methods = MethodsRegistry::new(events.clone());
        let outbound = Outbound::new(Arc::clone(&buffer), events.clone());

        Self {
            inner: Arc::new(NodeInner {
                config,
                events,
                timers,
                connected_tx,
                buffer,
                queue,
                manager,
                methods,
                topics,
                outbound,
                proxy: RwLock::new(None),
                text_handlers: RwLock::new(Vec::new()),
                json_handlers: RwLock::new(Vec::new()),
                binary_handlers: RwLock::new(Vec::new()),
                error_handlers: RwLock::new(Vec::new()),
                disconnect_timer: Mutex::new(None),
            }),
        }
    }

    // --- connection state -------------------------------------------------

    pub fn is_connected(&self) -> bool {
        *self.inner.connected_tx.borrow()
    }

    /// The transport reports an established connection: the queue
    /// scheduler resumes and the buffer starts flushing.
    pub fn handle_connected(&self) {
        if let Some(timer) = self.inner.disconnect_timer.lock().take() {
            timer.cancel();
        }
        self.inner.connected_tx.send_replace(true);
        tracing::debug!("node connected");
    }

    /// The transport reports a lost connection: outbound work suspends,
    /// non-persistent subscriptions are discarded, and the disconnection
    /// TTL starts ticking.
    pub fn handle_disconnected(&self) {
        self.inner.connected_tx.send_replace(false);
        self.inner.topics.drop_non_persistent();

        let ttl = self.inner.config.disconnection_ttl;
        let weak = Arc::downgrade(&self.inner);
        let timer = self.inner.timers.schedule(ttl, move || {
            let Some(inner) = weak.upgrade() else { return };
            if !*inner.connected_tx.borrow() {
                let node = Node { inner };
                let cancelled = node.inner.queue.clear("Disconnection TTL exceeded");
                node.inner.manager.cancel_all("Disconnection TTL exceeded");
                tracing::debug!(cancelled, "disconnection TTL expired");
            }
        });
        *self.inner.disconnect_timer.lock() = Some(timer);
        tracing::debug!("node disconnected");
    }

    // --- inbound ----------------------------------------------------------

    /// Feed one raw frame from the transport through the resolver and
    /// into the kernel's dispatchers.
    pub async fn deliver(&self, raw: RawFrame) {
        let opts = ResolveOptions {
            strict: self.inner.config.strict,
            allow_custom_types: self.inner.config.allow_custom_types,
            max_message_size: self.inner.config.max_message_size,
        };
        let resolution = resolve(raw, &opts);

        if resolution.has_violations() {
            let code = resolution.violation_code();
            let violations = resolution.into_parts().violations;
            self.inner.events.emit(Event::MessageProtocolError {
                violations: violations.clone(),
            });
            let report = Message::error(
                Severity::Protocol,
                code,
                "message validation failed",
                Some(json!({ "violations": violations })),
            );
            if let Err(err) = self.inner.buffer.add_message(&report).await {
                tracing::warn!(error = %err, "could not report protocol violation");
            }
            return;
        }

        let Some(frame) = resolution.into_parts().frame else {
            return;
        };
        match frame {
            ClassifiedFrame::Binary(bytes) => {
                self.inner
                    .events
                    .emit(Event::MessageBinary { size: bytes.len() });
                let ctx = BinaryContext::new(bytes, unix_ms(), self.inner.events.clone());
                self.run_raw_handlers(&self.inner.binary_handlers, &ctx);
            }
            ClassifiedFrame::Text(text) => {
                self.inner
                    .events
                    .emit(Event::MessageText { size: text.len() });
                let ctx = TextContext::new(text, unix_ms(), self.inner.events.clone());
                self.run_raw_handlers(&self.inner.text_handlers, &ctx);
            }
            ClassifiedFrame::Json(value) => {
                self.inner.events.emit(Event::MessageJson);
                let ctx = JsonContext::new(value, unix_ms(), self.inner.events.clone());
                self.run_raw_handlers(&self.inner.json_handlers, &ctx);
            }
            ClassifiedFrame::Protocol(message) => self.dispatch_protocol(message).await,
        }
    }

    fn run_raw_handlers<C>(&self, handlers: &RwLock<Vec<RawHandler<C>>>, ctx: &C) {
        let handlers: Vec<RawHandler<C>> = handlers.read().clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(ctx))).is_err() {
                tracing::warn!("raw frame handler panicked");
            }
        }
    }

    async fn dispatch_protocol(&self, message: Message) {
        let peer = message.peer.clone();
        let metadata = message.metadata.clone();
        let timestamp = message.timestamp;

        match message.kind {
            MessageKind::Request {
                request_id,
                method,
                payload,
            } => {
                let ctx = RequestContext::new(
                    request_id,
                    method,
                    payload,
                    peer,
                    metadata,
                    timestamp,
                    self.inner.outbound.clone(),
                );
                if ctx.peer().is_relayed() {
                    let hook = self.inner.proxy.read().as_ref().map(|p| Arc::clone(&p.request));
                    match hook {
                        Some(hook) => {
                            tokio::spawn(hook(ctx));
                        }
                        None => {
                            let _ = ctx
                                .error(
                                    ErrorCode::ProxyForbidden,
                                    "node does not relay requests",
                                    None,
                                )
                                .await;
                        }
                    }
                    return;
                }
                let methods = self.inner.methods.clone();
                let node = self.clone();
                tokio::spawn(async move {
                    use futures_util::FutureExt;
                    if AssertUnwindSafe(methods.dispatch(ctx))
                        .catch_unwind()
                        .await
                        .is_err()
                    {
                        node.report_internal_error("request dispatcher panicked").await;
                    }
                });
            }

            MessageKind::Response {
                request_id,
                success,
                data,
                error,
            } => {
                if peer.is_relayed() {
                    let hook = self.inner.proxy.read().as_ref().map(|p| Arc::clone(&p.response));
                    if let Some(hook) = hook {
                        let ctx = ResponseContext::new(
                            request_id,
                            success,
                            data,
                            error,
                            peer,
                            metadata,
                            timestamp,
                            self.inner.events.clone(),
                        );
                        tokio::spawn(hook(ctx));
                    }
                    return;
                }
                let manager = &self.inner.manager;
                let dispatched = catch_unwind(AssertUnwindSafe(|| {
                    manager.handle_response(request_id, success, data, error)
                }));
                if dispatched.is_err() {
                    self.report_internal_error("response dispatcher panicked").await;
                }
            }

            MessageKind::Notification {
                notification,
                request_id,
            } => {
                if peer.is_relayed() {
                    let hook = self
                        .inner
                        .proxy
                        .read()
                        .as_ref()
                        .map(|p| Arc::clone(&p.notification));
                    if let Some(hook) = hook {
                        let ctx = NotificationContext::new(
                            notification.topic,
                            notification.data,
                            request_id,
                            peer,
                            metadata,
                            timestamp,
                            self.inner.events.clone(),
                        );
                        tokio::spawn(hook(ctx));
                    }
                    return;
                }
                match request_id {
                    Some(id) => self.inner.manager.handle_notification(id, &notification),
                    None if notification.topic.is_none() => {
                        self.inner.events.emit(Event::NotificationError {
                            error: "notification carries neither topic nor requestId"
                                .to_string(),
                        });
                    }
                    None => {
                        let ctx = NotificationContext::new(
                            notification.topic,
                            notification.data,
                            None,
                            peer,
                            metadata,
                            timestamp,
                            self.inner.events.clone(),
                        );
                        self.inner.topics.dispatch(&ctx);
                        ctx.mark_processed();
                    }
                }
            }

            MessageKind::Error { error } => {
                self.inner.events.emit(Event::MessageError {
                    severity: error.severity,
                    code: error.code.clone(),
                    message: error.message.clone(),
                });
                let ctx = ErrorMessageContext::new(
                    error.severity,
                    error.code,
                    error.message,
                    error.details,
                    peer,
                    timestamp,
                    self.inner.events.clone(),
                );
                if ctx.peer.is_relayed() {
                    let hook = self
                        .inner
                        .proxy
                        .read()
                        .as_ref()
                        .map(|p| Arc::clone(&p.error_message));
                    if let Some(hook) = hook {
                        tokio::spawn(hook(ctx));
                    }
                    return;
                }
                self.run_raw_handlers(&self.inner.error_handlers, &ctx);
                ctx.mark_processed();
            }

            MessageKind::Ack { message_id } => {
                tracing::debug!(%message_id, "ack received");
            }

            MessageKind::Ping => {
                tracing::trace!("ping received");
            }
        }
    }

    /// A kernel-side dispatcher failed after a frame parsed cleanly:
    /// report it as an application-severity INTERNAL_ERROR.
    async fn report_internal_error(&self, detail: &str) {
        self.inner.events.emit(Event::MessageInternalError {
            error: detail.to_string(),
        });
        let report = Message::error(
            Severity::Application,
            ErrorCode::InternalError,
            detail,
            None,
        );
        if self.inner.buffer.add_message(&report).await.is_err() {
            tracing::warn!(detail, "could not report internal error");
        }
    }

    // --- outbound ---------------------------------------------------------

    /// Invoke a remote method. The returned [`Request`] completes on
    /// response, timeout, cancellation, or queue failure.
    pub async fn request(
        &self,
        method: &str,
        payload: Option<Value>,
        opts: RequestOptions,
    ) -> Result<Request, NodeError> {
        let validation = validate_method_grammar(method);
        if !validation.is_valid() {
            return Err(NodeError::InvalidMethod(validation.errors.join("; ")));
        }
        let request = Request::new(method, payload, opts);
        self.inner.manager.register(&request);
        let admitted = self.inner.queue.enqueue(request.clone()).await?;
        if !admitted && !request.is_terminal() {
            request.reject(RequestFailure::kernel(
                ErrorCode::RequestCancelled,
                "dropped: request queue is full",
            ));
        }
        Ok(request)
    }

    /// Publish a notification. A `Some` request id correlates it to the
    /// peer's outstanding request (streaming); correlated notifications
    /// may use request-scoped channel names.
    pub async fn notify(
        &self,
        topic: &str,
        data: Option<Value>,
        request_id: Option<Uuid>,
    ) -> Result<(), NodeError> {
        if request_id.is_none() {
            let validation = validate_topic_name(topic);
            if !validation.is_valid() {
                return Err(NodeError::InvalidTopic(validation.errors.join("; ")));
            }
        }
        let message = Message::notification(Some(topic.to_string()), data, request_id);
        self.inner.buffer.add_message(&message).await?;
        Ok(())
    }

    /// Send a top-level application error to the peer.
    pub async fn send_error(
        &self,
        code: impl Into<String>,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> Result<(), NodeError> {
        let message = Message::error(Severity::Application, code, message, details);
        self.inner.buffer.add_message(&message).await?;
        Ok(())
    }

    /// Send a pre-built protocol message.
    pub async fn send(&self, message: &Message) -> Result<(), NodeError> {
        self.inner.buffer.add_message(message).await?;
        Ok(())
    }

    // --- registries -------------------------------------------------------

    pub fn register_method<F, Fut>(
        &self,
        name: impl Into<String>,
        handler: F,
        opts: MethodOptions,
    ) -> Result<(), NodeError>
    where
        F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), MethodError>> + Send + 'static,
    {
        self.inner.methods.register(name, handler, opts)?;
        Ok(())
    }

    pub fn unregister_method(&self, name: &str) -> bool {
        self.inner.methods.unregister(name)
    }

    pub fn method_metrics(&self, name: &str) -> Option<crate::methods::MethodMetrics> {
        self.inner.methods.metrics(name)
    }

    pub fn subscribe(
        &self,
        pattern: &str,
        handler: impl Fn(&NotificationContext) + Send + Sync + 'static,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionHandle, NodeError> {
        Ok(self.inner.topics.subscribe(pattern, handler, opts)?)
    }

    // --- non-protocol hooks ----------------------------------------------

    pub fn on_text(&self, handler: impl Fn(&TextContext) + Send + Sync + 'static) {
        self.inner.text_handlers.write().push(Arc::new(handler));
    }

    pub fn on_json(&self, handler: impl Fn(&JsonContext) + Send + Sync + 'static) {
        self.inner.json_handlers.write().push(Arc::new(handler));
    }

    pub fn on_binary(&self, handler: impl Fn(&BinaryContext) + Send + Sync + 'static) {
        self.inner.binary_handlers.write().push(Arc::new(handler));
    }

    pub fn on_error(&self, handler: impl Fn(&ErrorMessageContext) + Send + Sync + 'static) {
        self.inner.error_handlers.write().push(Arc::new(handler));
    }

    pub fn set_proxy(&self, proxy: ProxyConfiguration) {
        *self.inner.proxy.write() = Some(proxy);
    }

    // --- observability ----------------------------------------------------

    pub fn events(&self) -> &Events {
        &self.inner.events
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            queue_size: self.inner.queue.len(),
            active_requests: self.inner.manager.active_count(),
            expired_requests: self.inner.manager.expired_count(),
            buffered_messages: self.inner.buffer.len(),
            registered_methods: self.inner.methods.len(),
            topic_subscriptions: self.inner.topics.len(),
        }
    }

    pub fn emit_stats(&self) {
        self.inner.events.emit(Event::SystemStats(self.stats()));
    }

    // --- lifecycle --------------------------------------------------------

    /// Tear the node down: cancel every pending request, stop the
    /// background tasks, release every timer.
    pub fn shutdown(&self) {
        self.inner.queue.clear("Manager disposed");
        self.inner.manager.cancel_all("Manager disposed");
        self.inner.queue.shutdown();
        self.inner.manager.shutdown();
        self.inner.buffer.shutdown();
        self.inner.timers.cancel_all();
    }
}
