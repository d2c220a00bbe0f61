//! Handler-facing context objects, one per inbound frame class.
//!
//! Every context is single-use: its `processed` latch flips on the first
//! terminal reply (or acknowledgment) and any reply after that is a
//! usage error. On the flip, a `message:processed` event reports the
//! processing duration and streaming stats.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use starling_wire::{ErrorDetail, Message, Peer, Severity};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::buffer::{BufferError, SendBuffer};
use crate::events::{Event, Events};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("context already processed")]
    AlreadyProcessed,

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Outbound path handed to contexts: the node's send buffer plus its
/// event bus.
#[derive(Clone)]
pub struct Outbound {
    buffer: Arc<SendBuffer>,
    events: Events,
}

impl Outbound {
    pub fn new(buffer: Arc<SendBuffer>, events: Events) -> Self {
        Self { buffer, events }
    }

    pub(crate) async fn send(&self, message: &Message) -> Result<(), BufferError> {
        self.buffer.add_message(message).await.map(|_| ())
    }

    pub(crate) fn events(&self) -> &Events {
        &self.events
    }
}

/// Shared processed-latch plumbing.
struct Latch {
    received_at: Instant,
    processed: AtomicBool,
}

impl Latch {
    fn new() -> Self {
        Self {
            received_at: Instant::now(),
            processed: AtomicBool::new(false),
        }
    }

    fn is_processed(&self) -> bool {
        self.processed.load(Ordering::SeqCst)
    }

    /// Flip the latch; the winner gets the processing duration.
    fn flip(&self) -> Result<Duration, ContextError> {
        if self
            .processed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Ok(self.received_at.elapsed())
        } else {
            Err(ContextError::AlreadyProcessed)
        }
    }
}

/// Context for one inbound request; carries the reply surface.
pub struct RequestContext {
    request_id: Uuid,
    method: String,
    payload: Option<Value>,
    peer: Peer,
    metadata: Option<Value>,
    timestamp: u64,
    latch: Latch,
    streaming: AtomicBool,
    stream_notifications: AtomicU32,
    outbound: Outbound,
}

impl RequestContext {
    pub fn new(
        request_id: Uuid,
        method: impl Into<String>,
        payload: Option<Value>,
        peer: Peer,
        metadata: Option<Value>,
        timestamp: u64,
        outbound: Outbound,
    ) -> Arc<Self> {
        Arc::new(Self {
            request_id,
            method: method.into(),
            payload,
            peer,
            metadata,
            timestamp,
            latch: Latch::new(),
            streaming: AtomicBool::new(false),
            stream_notifications: AtomicU32::new(0),
            outbound,
        })
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.metadata.as_ref()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn is_processed(&self) -> bool {
        self.latch.is_processed()
    }

    fn emit_processed(&self, duration: Duration) {
        self.outbound.events().emit(Event::MessageProcessed {
            duration,
            request_id: Some(self.request_id),
            streaming: self.streaming.load(Ordering::SeqCst),
            notifications: self.stream_notifications.load(Ordering::SeqCst),
        });
    }

    /// Reply with a successful response. Single-shot.
    pub async fn success(&self, data: Option<Value>) -> Result<(), ContextError> {
        let duration = self.latch.flip()?;
        let message = Message::response_success(self.request_id, data);
        self.outbound.send(&message).await?;
        self.emit_processed(duration);
        Ok(())
    }

    /// Reply with a failure response. Single-shot.
    pub async fn error(
        &self,
        code: impl Into<String>,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> Result<(), ContextError> {
        let duration = self.latch.flip()?;
        let mut detail = ErrorDetail::new(code, message);
        detail.details = details;
        let message = Message::response_failure(self.request_id, detail);
        self.outbound.send(&message).await?;
        self.emit_processed(duration);
        Ok(())
    }

    /// Send an intermediate notification correlated to this request.
    /// Marks the request as streaming. Not allowed once processed:
    /// notifications may precede the response but never follow it.
    pub async fn notify(
        &self,
        topic: impl Into<String>,
        data: Option<Value>,
    ) -> Result<(), ContextError> {
        if self.is_processed() {
            return Err(ContextError::AlreadyProcessed);
        }
        self.streaming.store(true, Ordering::SeqCst);
        self.stream_notifications.fetch_add(1, Ordering::SeqCst);
        let message = Message::notification(Some(topic.into()), data, Some(self.request_id));
        self.outbound.send(&message).await?;
        Ok(())
    }

    /// Send a progress notification (`type: "progress"`) on the
    /// request-scoped `{requestId}:progress` channel.
    pub async fn progress(
        &self,
        pct: u8,
        status: Option<&str>,
        details: Option<Value>,
    ) -> Result<(), ContextError> {
        let mut data = json!({ "type": "progress", "progress": pct });
        if let Some(status) = status {
            data["status"] = json!(status);
        }
        if let Some(details) = details {
            data["details"] = details;
        }
        let topic = format!("{}:progress", self.request_id);
        self.notify(topic, Some(data)).await
    }
}

/// Read-only carrier for an inbound response, handed to the requests
/// manager (or the proxy hook for relayed frames).
pub struct ResponseContext {
    pub request_id: Uuid,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<ErrorDetail>,
    pub peer: Peer,
    pub metadata: Option<Value>,
    pub timestamp: u64,
    latch: Latch,
    events: Events,
}

impl ResponseContext {
    pub fn new(
        request_id: Uuid,
        success: bool,
        data: Option<Value>,
        error: Option<ErrorDetail>,
        peer: Peer,
        metadata: Option<Value>,
        timestamp: u64,
        events: Events,
    ) -> Arc<Self> {
        Arc::new(Self {
            request_id,
            success,
            data,
            error,
            peer,
            metadata,
            timestamp,
            latch: Latch::new(),
            events,
        })
    }

    pub fn is_processed(&self) -> bool {
        self.latch.is_processed()
    }

    pub(crate) fn mark_processed(&self) {
        if let Ok(duration) = self.latch.flip() {
            self.events.emit(Event::MessageProcessed {
                duration,
                request_id: Some(self.request_id),
                streaming: false,
                notifications: 0,
            });
        }
    }
}

/// Read-only carrier for an inbound notification.
pub struct NotificationContext {
    pub topic: Option<String>,
    pub data: Option<Value>,
    pub request_id: Option<Uuid>,
    pub peer: Peer,
    pub metadata: Option<Value>,
    pub timestamp: u64,
    latch: Latch,
    events: Events,
}

impl NotificationContext {
    pub fn new(
        topic: Option<String>,
        data: Option<Value>,
        request_id: Option<Uuid>,
        peer: Peer,
        metadata: Option<Value>,
        timestamp: u64,
        events: Events,
    ) -> Arc<Self> {
        Arc::new(Self {
            topic,
            data,
            request_id,
            peer,
            metadata,
            timestamp,
            latch: Latch::new(),
            events,
        })
    }

    /// The `type` discriminator inside the notification data.
    pub fn kind(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.get("type"))
            .and_then(Value::as_str)
    }

    pub fn is_progress(&self) -> bool {
        self.kind() == Some("progress")
    }

    pub fn is_processed(&self) -> bool {
        self.latch.is_processed()
    }

    pub(crate) fn mark_processed(&self) {
        if let Ok(duration) = self.latch.flip() {
            self.events.emit(Event::MessageProcessed {
                duration,
                request_id: self.request_id,
                streaming: false,
                notifications: 0,
            });
        }
    }
}

/// Read-only carrier for an inbound top-level error message.
pub struct ErrorMessageContext {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
    pub peer: Peer,
    pub timestamp: u64,
    latch: Latch,
    events: Events,
}

impl ErrorMessageContext {
    pub fn new(
        severity: Severity,
        code: String,
        message: String,
        details: Option<Value>,
        peer: Peer,
        timestamp: u64,
        events: Events,
    ) -> Arc<Self> {
        Arc::new(Self {
            severity,
            code,
            message,
            details,
            peer,
            timestamp,
            latch: Latch::new(),
            events,
        })
    }

    pub fn is_processed(&self) -> bool {
        self.latch.is_processed()
    }

    pub(crate) fn mark_processed(&self) {
        if let Ok(duration) = self.latch.flip() {
            self.events.emit(Event::MessageProcessed {
                duration,
                request_id: None,
                streaming: false,
                notifications: 0,
            });
        }
    }
}

macro_rules! raw_context {
    ($(#[$doc:meta])* $name:ident, $field:ident: $ty:ty) => {
        $(#[$doc])*
        pub struct $name {
            pub $field: $ty,
            pub timestamp: u64,
            latch: Latch,
            events: Events,
        }

        impl $name {
            pub fn new($field: $ty, timestamp: u64, events: Events) -> Arc<Self> {
                Arc::new(Self {
                    $field,
                    timestamp,
                    latch: Latch::new(),
                    events,
                })
            }

            pub fn is_processed(&self) -> bool {
                self.latch.is_processed()
            }

            /// Flip the processed latch and emit the processing metric.
            pub fn acknowledge(&self) -> Result<(), ContextError> {
                let duration = self.latch.flip()?;
                self.events.emit(Event::MessageProcessed {
                    duration,
                    request_id: None,
                    streaming: false,
                    notifications: 0,
                });
                Ok(())
            }
        }
    };
}

raw_context!(
    /// Carrier for a non-JSON text frame.
    TextContext,
    content: String
);
raw_context!(
    /// Carrier for a parsed but foreign (non-protocol) JSON frame.
    JsonContext,
    value: Value
);
raw_context!(
    /// Carrier for an opaque binary frame.
    BinaryContext,
    data: Bytes
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferOptions;
    use crate::transport::{Transport, TransportError};
    use futures_util::future::BoxFuture;
    use parking_lot::Mutex;
    use starling_wire::{MessageKind, RawFrame};
    use tokio::sync::watch;

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
            transport,
            outbound: Outbound::new(buffer, events),
            _gate: gate,
        }
    }

    async fn sent_messages(rig: &Rig) -> Vec<Message> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        rig.transport
            .sent
            .lock()
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }

    fn request_ctx(rig: &Rig) -> Arc<RequestContext> {
        RequestContext::new(
            Uuid::new_v4(),
            "users:getProfile",
            Some(json!({"userId": "1"})),
            Peer::Local,
            None,
            0,
            rig.outbound.clone(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn success_reply_is_single_shot() {
        let rig = rig();
        let ctx = request_ctx(&rig);

        ctx.success(Some(json!({"name": "John"}))).await.unwrap();
        assert!(ctx.is_processed());
        assert!(matches!(
            ctx.success(None).await,
            Err(ContextError::AlreadyProcessed)
        ));
        assert!(matches!(
            ctx.error("X", "y", None).await,
            Err(ContextError::AlreadyProcessed)
        ));

        let sent = sent_messages(&rig).await;
        assert_eq!(sent.len(), 1);
        match &sent[0].kind {
            MessageKind::Response {
                request_id,
                success,
                data,
                ..
            } => {
                assert_eq!(*request_id, ctx.request_id());
                assert!(*success);
                assert_eq!(data.as_ref().unwrap()["name"], "John");
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn error_reply_carries_detail() {
        let rig = rig();
        let ctx = request_ctx(&rig);
        ctx.error("METHOD_NOT_FOUND", "Method 'users:missing' not found", None)
            .await
            .unwrap();

        let sent = sent_messages(&rig).await;
        match &sent[0].kind {
            MessageKind::Response { success, error, .. } => {
                assert!(!*success);
                assert_eq!(error.as_ref().unwrap().code, "METHOD_NOT_FOUND");
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn progress_goes_to_request_scoped_topic() {
        let rig = rig();
        let ctx = request_ctx(&rig);
        ctx.progress(25, Some("working"), None).await.unwrap();
        ctx.success(Some(json!({"done": true}))).await.unwrap();

        let sent = sent_messages(&rig).await;
        assert_eq!(sent.len(), 2);
        match &sent[0].kind {
            MessageKind::Notification {
                notification,
                request_id,
            } => {
                assert_eq!(*request_id, Some(ctx.request_id()));
                assert_eq!(
                    notification.topic.as_deref(),
                    Some(format!("{}:progress", ctx.request_id()).as_str())
                );
                let data = notification.data.as_ref().unwrap();
                assert_eq!(data["type"], "progress");
                assert_eq!(data["progress"], 25);
                assert_eq!(data["status"], "working");
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn notify_after_reply_is_rejected() {
        let rig = rig();
        let ctx = request_ctx(&rig);
        ctx.success(None).await.unwrap();
        assert!(matches!(
            ctx.notify("job:log", None).await,
            Err(ContextError::AlreadyProcessed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn processed_event_reports_streaming_stats() {
        let rig = rig();
        let mut bus = rig.outbound.events().subscribe();
        let ctx = request_ctx(&rig);
        ctx.notify("job:log", Some(json!({"line": 1}))).await.unwrap();
        ctx.notify("job:log", Some(json!({"line": 2}))).await.unwrap();
        ctx.success(None).await.unwrap();

        loop {
            let event = bus.recv().await.unwrap();
            if let Event::MessageProcessed {
                streaming,
                notifications,
                request_id,
                ..
            } = event
            {
                assert!(streaming);
                assert_eq!(notifications, 2);
                assert_eq!(request_id, Some(ctx.request_id()));
                break;
            }
        }
    }

    #[tokio::test]
    async fn acknowledge_is_single_shot() {
        let events = Events::default();
        let ctx = TextContext::new("hello".to_string(), 0, events);
        ctx.acknowledge().unwrap();
        assert!(ctx.is_processed());
        assert!(matches!(
            ctx.acknowledge(),
            Err(ContextError::AlreadyProcessed)
        ));
    }
}
