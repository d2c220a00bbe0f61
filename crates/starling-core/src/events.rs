//! Observability event bus.
//!
//! Every component reports through a shared [`Events`] handle backed by a
//! `tokio::sync::broadcast` channel. Event names are the observability
//! contract; payloads are structural. Emission never blocks and never
//! fails: with no subscribers the event is simply dropped (after being
//! traced).

use std::time::Duration;

use starling_wire::Severity;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Counters reported by `system:stats`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub queue_size: usize,
    pub active_requests: usize,
    pub expired_requests: usize,
    pub buffered_messages: usize,
    pub registered_methods: usize,
    pub topic_subscriptions: usize,
}

/// One observability event. [`Event::name`] returns the wire-contract
/// name (`message:send:success`, `queue:added`, ...).
#[derive(Clone, Debug)]
pub enum Event {
    MessageSendSuccess { size: usize },
    MessageSendFailed { error: String },
    MessageText { size: usize },
    MessageJson,
    MessageBinary { size: usize },
    MessageProtocolError { violations: Vec<String> },
    MessageInternalError { error: String },
    MessageError { severity: Severity, code: String, message: String },
    MessageBuffered { depth: usize },
    MessageProcessed {
        duration: Duration,
        request_id: Option<Uuid>,
        streaming: bool,
        notifications: u32,
    },
    QueueAdded { request_id: Uuid, size: usize },
    QueueRemoved { request_id: Uuid, size: usize },
    QueueSizeChanged { size: usize },
    RequestQueued { request_id: Uuid, method: String },
    RequestCompleted { request_id: Uuid, success: bool },
    RequestNotification { request_id: Uuid, delivered: bool },
    RequestLateResponse { request_id: Uuid, response_delay: Duration },
    RequestUnknownResponse { request_id: Uuid },
    RequestsCancelled { count: usize, reason: String },
    ResponseReceived { request_id: Uuid },
    ResponseError { request_id: Uuid, code: String },
    RequestError { request_id: Uuid, error: String },
    MethodRegistered { name: String },
    MethodUnregistered { name: String },
    TopicHandled { topic: String, handlers: usize },
    TopicError { topic: String, error: String },
    NotificationError { error: String },
    SystemStats(StatsSnapshot),
}

impl Event {
    /// The contract name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            Event::MessageSendSuccess { .. } => "message:send:success",
            Event::MessageSendFailed { .. } => "message:send:failed",
            Event::MessageText { .. } => "message:text",
            Event::MessageJson => "message:json",
            Event::MessageBinary { .. } => "message:binary",
            Event::MessageProtocolError { .. } => "message:protocol_error",
            Event::MessageInternalError { .. } => "message:internal_error",
            Event::MessageError { .. } => "message:error",
            Event::MessageBuffered { .. } => "message:buffered",
            Event::MessageProcessed { .. } => "message:processed",
            Event::QueueAdded { .. } => "queue:added",
            Event::QueueRemoved { .. } => "queue:removed",
            Event::QueueSizeChanged { .. } => "queue:size_changed",
            Event::RequestQueued { .. } => "request:queued",
            Event::RequestCompleted { .. } => "request:completed",
            Event::RequestNotification { .. } => "request:notification",
            Event::RequestLateResponse { .. } => "request:late_response",
            Event::RequestUnknownResponse { .. } => "request:unknown_response",
            Event::RequestsCancelled { .. } => "requests:cancelled",
            Event::ResponseReceived { .. } => "response:received",
            Event::ResponseError { .. } => "response:error",
            Event::RequestError { .. } => "request:error",
            Event::MethodRegistered { .. } => "method:registered",
            Event::MethodUnregistered { .. } => "method:unregistered",
            Event::TopicHandled { .. } => "topic:handled",
            Event::TopicError { .. } => "topic:error",
            Event::NotificationError { .. } => "notification:error",
            Event::SystemStats(_) => "system:stats",
        }
    }
}

/// Cloneable handle to the node's event bus.
#[derive(Clone)]
pub struct Events {
    tx: broadcast::Sender<Event>,
}

impl Events {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Emit one event. Fire-and-forget; subscribers that lag are handled
    /// by the broadcast channel's ring semantics.
    pub fn emit(&self, event: Event) {
        tracing::trace!(event = event.name(), "emit");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_match_contract() {
        assert_eq!(
            Event::MessageSendSuccess { size: 0 }.name(),
            "message:send:success"
        );
        assert_eq!(
            Event::RequestLateResponse {
                request_id: Uuid::new_v4(),
                response_delay: Duration::from_millis(200),
            }
            .name(),
            "request:late_response"
        );
        assert_eq!(Event::SystemStats(StatsSnapshot::default()).name(), "system:stats");
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_fine() {
        let events = Events::default();
        events.emit(Event::MessageJson);

        let mut rx = events.subscribe();
        events.emit(Event::MessageJson);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.name(), "message:json");
    }
}
