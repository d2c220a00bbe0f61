//! Ownership of outstanding requests and routing of inbound responses.
//!
//! The manager keeps two tables: *active* (id → request) and *expired*
//! (id → when it terminated, and with what timeout). The expired table
//! exists purely to attribute late responses: a response for a request
//! that already timed out is observably "late" rather than "unknown".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use starling_wire::{ErrorDetail, NotificationBody};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::events::{Event, Events};
use crate::request::{Request, RequestFailure};

/// How long a terminated request id is retained for late-response
/// attribution.
pub const EXPIRED_RETENTION: Duration = Duration::from_secs(3600);

/// Cadence of the expired-table sweep.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

struct ExpiredEntry {
    expired_at: Instant,
    #[allow(dead_code)]
    timeout: Duration,
}

struct ManagerInner {
    active: Mutex<HashMap<Uuid, Request>>,
    expired: Mutex<HashMap<Uuid, ExpiredEntry>>,
    events: Events,
}

/// Owns the active and expired request tables.
#[derive(Clone)]
pub struct RequestsManager {
    inner: Arc<ManagerInner>,
    cleanup: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RequestsManager {
    /// Create the manager and spawn its periodic cleanup. Must be called
    /// within a tokio runtime.
    pub fn new(events: Events) -> Self {
        let inner = Arc::new(ManagerInner {
            active: Mutex::new(HashMap::new()),
            expired: Mutex::new(HashMap::new()),
            events,
        });
        let sweep = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(CLEANUP_INTERVAL).await;
                    inner
                        .expired
                        .lock()
                        .retain(|_, e| e.expired_at.elapsed() <= EXPIRED_RETENTION);
                }
            })
        };
        Self {
            inner,
            cleanup: Arc::new(Mutex::new(Some(sweep))),
        }
    }

    /// Take ownership of a request: track it as active and, on its
    /// terminal transition, move its id into the expired table.
    pub fn register(&self, request: &Request) {
        let id = request.id();
        let timeout = request.options().timeout;
        self.inner.active.lock().insert(id, request.clone());

        let weak = Arc::downgrade(&self.inner);
        request.on_terminal(move |outcome| {
            let Some(inner) = weak.upgrade() else { return };
            inner.active.lock().remove(&id);
            inner.expired.lock().insert(
                id,
                ExpiredEntry {
                    expired_at: Instant::now(),
                    timeout,
                },
            );
            inner.events.emit(Event::RequestCompleted {
                request_id: id,
                success: outcome.is_fulfilled(),
            });
        });
    }

    /// Route an inbound response to its request. Orphan responses are
    /// classified as late (id still in the expired table) or unknown,
    /// and never produce outbound traffic.
    pub fn handle_response(
        &self,
        request_id: Uuid,
        success: bool,
        data: Option<Value>,
        error: Option<ErrorDetail>,
    ) {
        let request = self.inner.active.lock().get(&request_id).cloned();
        match request {
            Some(request) => {
                self.inner
                    .events
                    .emit(Event::ResponseReceived { request_id });
                if success {
                    request.resolve(data);
                } else {
                    let failure = match error {
                        Some(detail) => RequestFailure::from(detail),
                        None => RequestFailure {
                            code: "UNKNOWN".to_string(),
                            message: "failure response without error body".to_string(),
                            details: None,
                        },
                    };
                    self.inner.events.emit(Event::ResponseError {
                        request_id,
                        code: failure.code.clone(),
                    });
                    request.reject(failure);
                }
            }
            None => {
                let delay = self
                    .inner
                    .expired
                    .lock()
                    .get(&request_id)
                    .map(|e| e.expired_at.elapsed());
                match delay {
                    Some(response_delay) => {
                        tracing::debug!(%request_id, ?response_delay, "late response");
                        self.inner.events.emit(Event::RequestLateResponse {
                            request_id,
                            response_delay,
                        });
                    }
                    None => {
                        self.inner
                            .events
                            .emit(Event::RequestUnknownResponse { request_id });
                    }
                }
            }
        }
    }

    /// Route a correlated notification to its request's listeners. Drops
    /// silently (with an observability event) when the id is unknown.
    pub fn handle_notification(&self, request_id: Uuid, body: &NotificationBody) {
        let request = self.inner.active.lock().get(&request_id).cloned();
        let delivered = match request {
            Some(request) => request.deliver_notification(body),
            None => false,
        };
        self.inner.events.emit(Event::RequestNotification {
            request_id,
            delivered,
        });
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    pub fn expired_count(&self) -> usize {
        self.inner.expired.lock().len()
    }

    /// Cancel every active request.
    pub fn cancel_all(&self, reason: &str) {
        let requests: Vec<Request> = self.inner.active.lock().values().cloned().collect();
        let count = requests.len();
        for request in requests {
            request.cancel(reason);
        }
        if count > 0 {
            self.inner.events.emit(Event::RequestsCancelled {
                count,
                reason: reason.to_string(),
            });
        }
    }

    /// Stop the cleanup sweep.
    pub fn shutdown(&self) {
        if let Some(handle) = self.cleanup.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestOptions;
    use serde_json::json;
    use tokio::sync::broadcast::Receiver;

    async fn next_named(rx: &mut Receiver<Event>, name: &str) -> Event {
        loop {
            let event = rx.recv().await.unwrap();
            if event.name() == name {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn response_resolves_active_request() {
        let events = Events::default();
        let manager = RequestsManager::new(events);
        let request = Request::new("users:get", None, RequestOptions::default());
        manager.register(&request);
        assert_eq!(manager.active_count(), 1);

        manager.handle_response(request.id(), true, Some(json!({"ok": true})), None);
        assert!(request.wait().await.is_fulfilled());
        assert_eq!(manager.active_count(), 0);
        assert_eq!(manager.expired_count(), 1);
    }

    #[tokio::test]
    async fn failure_response_rejects_with_application_code() {
        let events = Events::default();
        let manager = RequestsManager::new(events);
        let request = Request::new("users:get", None, RequestOptions::default());
        manager.register(&request);

        manager.handle_response(
            request.id(),
            false,
            None,
            Some(ErrorDetail::new("USER_MISSING", "no such user")),
        );
        let failure = request.result().await.unwrap_err();
        assert_eq!(failure.code, "USER_MISSING");
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_is_attributed() {
        let events = Events::default();
        let mut bus = events.subscribe();
        let manager = RequestsManager::new(events);
        let request = Request::new("slow:op", None, RequestOptions::default());
        manager.register(&request);

        // Terminate (as the timeout timer would), then answer late.
        request.cancel("timed out in test");
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.handle_response(request.id(), true, None, None);

        let event = next_named(&mut bus, "request:late_response").await;
        match event {
            Event::RequestLateResponse { response_delay, .. } => {
                assert!(response_delay >= Duration::from_millis(200));
            }
            other => panic!("unexpected event {:?}", other),
        }
        // The terminated request is untouched.
        assert!(request.result().await.is_err());
    }

    #[tokio::test]
    async fn unknown_response_is_flagged() {
        let events = Events::default();
        let mut bus = events.subscribe();
        let manager = RequestsManager::new(events);

        manager.handle_response(Uuid::new_v4(), true, None, None);
        next_named(&mut bus, "request:unknown_response").await;
    }

    #[tokio::test]
    async fn correlated_notifications_reach_listeners() {
        let events = Events::default();
        let manager = RequestsManager::new(events);
        let request = Request::new("job:run", None, RequestOptions::default());
        manager.register(&request);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        request.on_progress(move |data| {
            sink.lock().push(data["progress"].as_u64().unwrap());
        });

        for pct in [25u64, 50, 75] {
            manager.handle_notification(
                request.id(),
                &NotificationBody {
                    topic: None,
                    data: Some(json!({"type": "progress", "progress": pct})),
                },
            );
        }
        assert_eq!(*seen.lock(), vec![25, 50, 75]);
    }

    #[tokio::test]
    async fn cancel_all_rejects_everything() {
        let events = Events::default();
        let manager = RequestsManager::new(events);
        let a = Request::new("a:a", None, RequestOptions::default());
        let b = Request::new("a:b", None, RequestOptions::default());
        manager.register(&a);
        manager.register(&b);

        manager.cancel_all("Manager disposed");
        assert_eq!(manager.active_count(), 0);
        let failure = a.result().await.unwrap_err();
        assert_eq!(failure.code, "REQUEST_CANCELLED");
        assert!(b.result().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_drops_old_expired_entries() {
        let events = Events::default();
        let manager = RequestsManager::new(events);
        let request = Request::new("a:a", None, RequestOptions::default());
        manager.register(&request);
        request.cancel("done");
        tokio::task::yield_now().await;
        assert_eq!(manager.expired_count(), 1);

        tokio::time::sleep(EXPIRED_RETENTION + CLEANUP_INTERVAL).await;
        assert_eq!(manager.expired_count(), 0);
    }
}
