//! One pending outbound call.
//!
//! A [`Request`] is a cheap clone-able handle around shared state. It is
//! created by the application (via the node), owned by the requests
//! manager from enqueue until terminal, and mutated only by the queue
//! (execution/retry), the manager (response delivery), its own timeout
//! timer, and explicit cancellation. The terminal transition is atomic,
//! idempotent, and sticky.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use starling_wire::{unix_ms, ErrorCode, ErrorDetail, NotificationBody};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::retry::{TimerGroup, TimerHandle};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Options attached to one outbound request.
#[derive(Clone, Debug)]
pub struct RequestOptions {
    /// How long to wait for the response once executed. Zero disables
    /// the timer.
    pub timeout: Duration,
    /// Fire-and-forget: resolve as soon as the frame is on the wire.
    pub no_response: bool,
    /// Scheduling priority (only consulted when the queue runs in
    /// priority mode).
    pub priority: i32,
    /// Free-form metadata stamped on the outbound envelope.
    pub metadata: Option<Value>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            no_response: false,
            priority: 0,
            metadata: None,
        }
    }
}

/// Why a request was rejected. Kernel rejections use the closed
/// [`ErrorCode`] taxonomy; rejections relayed from a failure response
/// carry the application's opaque code.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("{code}: {message}")]
pub struct RequestFailure {
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
}

impl RequestFailure {
    pub fn kernel(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<ErrorDetail> for RequestFailure {
    fn from(detail: ErrorDetail) -> Self {
        Self {
            code: detail.code,
            message: detail.message,
            details: detail.details,
        }
    }
}

/// Terminal state of a request.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestOutcome {
    Fulfilled(Option<Value>),
    Rejected(RequestFailure),
}

impl RequestOutcome {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, RequestOutcome::Fulfilled(_))
    }

    pub fn into_result(self) -> Result<Option<Value>, RequestFailure> {
        match self {
            RequestOutcome::Fulfilled(data) => Ok(data),
            RequestOutcome::Rejected(failure) => Err(failure),
        }
    }
}

type Listener = Arc<dyn Fn(&Value) + Send + Sync>;
type TerminalHook = Box<dyn FnOnce(&RequestOutcome) + Send>;

#[derive(Default)]
struct RequestState {
    terminal: bool,
    progress: Vec<Listener>,
    notifications: Vec<Listener>,
    hooks: Vec<TerminalHook>,
    timeout_timer: Option<TimerHandle>,
    timer_armed: bool,
}

struct RequestShared {
    id: Uuid,
    method: String,
    payload: Option<Value>,
    options: RequestOptions,
    created_at: u64,
    state: Mutex<RequestState>,
    outcome_tx: watch::Sender<Option<RequestOutcome>>,
    // Kept so send_replace always has a live receiver.
    _outcome_rx: watch::Receiver<Option<RequestOutcome>>,
}

/// Handle to one pending outbound call.
#[derive(Clone)]
pub struct Request {
    shared: Arc<RequestShared>,
}

impl Request {
    pub fn new(method: impl Into<String>, payload: Option<Value>, options: RequestOptions) -> Self {
        Self::with_id(Uuid::new_v4(), method, payload, options)
    }

    /// Construct with an explicit id (deterministic tests, relayed
    /// requests).
    pub fn with_id(
        id: Uuid,
        method: impl Into<String>,
        payload: Option<Value>,
        options: RequestOptions,
    ) -> Self {
        let (outcome_tx, outcome_rx) = watch::channel(None);
        Self {
            shared: Arc::new(RequestShared {
                id,
                method: method.into(),
                payload,
                options,
                created_at: unix_ms(),
                state: Mutex::new(RequestState::default()),
                outcome_tx,
                _outcome_rx: outcome_rx,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn method(&self) -> &str {
        &self.shared.method
    }

    pub fn payload(&self) -> Option<&Value> {
        self.shared.payload.as_ref()
    }

    pub fn options(&self) -> &RequestOptions {
        &self.shared.options
    }

    pub fn created_at(&self) -> u64 {
        self.shared.created_at
    }

    pub fn is_terminal(&self) -> bool {
        self.shared.state.lock().terminal
    }

    /// Current outcome, if terminal.
    pub fn outcome(&self) -> Option<RequestOutcome> {
        self.shared.outcome_tx.borrow().clone()
    }

    /// Fulfill with response data. Returns false if already terminal.
    pub fn resolve(&self, data: Option<Value>) -> bool {
        self.finish(RequestOutcome::Fulfilled(data))
    }

    /// Reject with a failure. Returns false if already terminal.
    pub fn reject(&self, failure: RequestFailure) -> bool {
        self.finish(RequestOutcome::Rejected(failure))
    }

    /// Reject with REQUEST_CANCELLED.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.reject(RequestFailure::kernel(ErrorCode::RequestCancelled, reason))
    }

    fn finish(&self, outcome: RequestOutcome) -> bool {
        let (hooks, timer) = {
            let mut state = self.shared.state.lock();
            if state.terminal {
                return false;
            }
            state.terminal = true;
            state.progress.clear();
            state.notifications.clear();
            (
                std::mem::take(&mut state.hooks),
                state.timeout_timer.take(),
            )
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
        self.shared.outcome_tx.send_replace(Some(outcome.clone()));
        for hook in hooks {
            hook(&outcome);
        }
        true
    }

    /// Register a listener for correlated progress notifications
    /// (notification data `type == "progress"`).
    pub fn on_progress(&self, listener: impl Fn(&Value) + Send + Sync + 'static) {
        let mut state = self.shared.state.lock();
        if !state.terminal {
            state.progress.push(Arc::new(listener));
        }
    }

    /// Register a listener for all other correlated notifications.
    pub fn on_notification(&self, listener: impl Fn(&Value) + Send + Sync + 'static) {
        let mut state = self.shared.state.lock();
        if !state.terminal {
            state.notifications.push(Arc::new(listener));
        }
    }

    /// Register a hook invoked exactly once on the terminal transition.
    /// Runs immediately when the request is already terminal.
    pub fn on_terminal(&self, hook: impl FnOnce(&RequestOutcome) + Send + 'static) {
        let run_now = {
            let mut state = self.shared.state.lock();
            if state.terminal {
                true
            } else {
                state.hooks.push(Box::new(hook));
                return;
            }
        };
        if run_now {
            if let Some(outcome) = self.outcome() {
                hook(&outcome);
            }
        }
    }

    /// Deliver a correlated notification, selecting the listener set by
    /// the notification's `type` discriminator. Ignored once terminal.
    /// Listener panics are caught and logged.
    pub fn deliver_notification(&self, body: &NotificationBody) -> bool {
        let listeners: Vec<Listener> = {
            let state = self.shared.state.lock();
            if state.terminal {
                return false;
            }
            if body.is_progress() {
                state.progress.clone()
            } else {
                state.notifications.clone()
            }
        };
        let data = body.data.clone().unwrap_or(Value::Null);
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&data))).is_err() {
                tracing::warn!(request_id = %self.shared.id, "request listener panicked");
            }
        }
        true
    }

    /// Arm the response timeout. Called by the queue on first execution;
    /// no-op for zero timeouts, `no_response` requests, and re-executions
    /// (retries keep the original deadline).
    pub(crate) fn arm_timeout(&self, timers: &TimerGroup) {
        let timeout = self.shared.options.timeout;
        let mut state = self.shared.state.lock();
        if state.terminal || state.timer_armed {
            return;
        }
        state.timer_armed = true;
        if timeout.is_zero() || self.shared.options.no_response {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        let handle = timers.schedule(timeout, move || {
            if let Some(shared) = weak.upgrade() {
                let request = Request { shared };
                request.reject(RequestFailure::kernel(
                    ErrorCode::RequestTimeout,
                    format!("no response within {:?}", timeout),
                ));
            }
        });
        state.timeout_timer = Some(handle);
    }

    /// Await the terminal outcome.
    pub async fn wait(&self) -> RequestOutcome {
        let mut rx = self.shared.outcome_tx.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            // The sender lives in our shared state, so this cannot fail
            // while `self` exists.
            if rx.changed().await.is_err() {
                unreachable!("outcome sender dropped while request alive");
            }
        }
    }

    /// Await the terminal outcome as a `Result`.
    pub async fn result(&self) -> Result<Option<Value>, RequestFailure> {
        self.wait().await.into_result()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.shared.id)
            .field("method", &self.shared.method)
            .field("terminal", &self.is_terminal())
            .finish()
    }
}
