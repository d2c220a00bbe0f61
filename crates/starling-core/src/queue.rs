//! Flow control over outbound requests.
//!
//! The queue admits requests up to `max_size`, executes them with
//! bounded concurrency while the node is connected, retries transient
//! send failures with jittered exponential backoff, and fails anything
//! that sits queued longer than the drain timeout. An executed item
//! stays in the queue (occupying its concurrency slot) until its request
//! reaches a terminal state; the terminal hook frees the slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use starling_wire::{ErrorCode, Message};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::buffer::SendBuffer;
use crate::config::OnFull;
use crate::events::{Event, Events};
use crate::request::{Request, RequestFailure};
use crate::retry::{Backoff, TimerGroup};

#[derive(Clone, Debug)]
pub struct QueueOptions {
    pub max_size: usize,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_concurrent: usize,
    pub priority_queuing: bool,
    pub on_full: OnFull,
    pub drain_timeout: Duration,
    /// Absolute per-attempt retry delays; overrides the backoff curve.
    pub retry_delays: Option<Vec<Duration>>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_concurrent: 10,
            priority_queuing: false,
            on_full: OnFull::Block,
            drain_timeout: Duration::from_secs(30),
            retry_delays: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("request queue is full ({size}/{max})")]
    Full { size: usize, max: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryState {
    /// Eligible for selection.
    Pending,
    /// Waiting out a retry backoff.
    Delayed,
    /// Executed; holds a concurrency slot until terminal.
    InFlight,
}

struct QueueEntry {
    request: Request,
    retry_count: u32,
    added_at: Instant,
    priority: i32,
    seq: u64,
    state: EntryState,
}

struct QueueInner {
    opts: QueueOptions,
    entries: Mutex<Vec<QueueEntry>>,
    seq: AtomicU64,
    connected: watch::Receiver<bool>,
    wake: Notify,
    space: Notify,
    buffer: Arc<SendBuffer>,
    backoff: Backoff,
    timers: TimerGroup,
    events: Events,
}

/// Bounded FIFO (optionally priority-ordered) of pending requests.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RequestQueue {
    /// Create the queue and spawn its scheduler and drain monitor. Must
    /// be called within a tokio runtime.
    pub fn new(
        buffer: Arc<SendBuffer>,
        connected: watch::Receiver<bool>,
        events: Events,
        timers: TimerGroup,
        opts: QueueOptions,
    ) -> Self {
        let backoff = match &opts.retry_delays {
            Some(delays) => Backoff::with_schedule(delays.clone()),
            None => Backoff::new(opts.base_delay),
        };
        let inner = Arc::new(QueueInner {
            opts,
            entries: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            connected,
            wake: Notify::new(),
            space: Notify::new(),
            buffer,
            backoff,
            timers,
            events,
        });
        let scheduler = tokio::spawn(run_scheduler(Arc::clone(&inner)));
        let drain = tokio::spawn(run_drain_monitor(Arc::clone(&inner)));
        Self {
            inner,
            tasks: Arc::new(Mutex::new(vec![scheduler, drain])),
        }
    }

    /// Admit a request. Returns `Ok(false)` when the `Drop` policy
    /// rejected it, or when a `Block` wait outlived the drain timeout
    /// (in which case the request is already rejected with
    /// QUEUE_DRAIN_TIMEOUT).
    pub async fn enqueue(&self, request: Request) -> Result<bool, QueueError> {
        let inner = &self.inner;
        loop {
            let admitted = {
                let mut entries = inner.entries.lock();
                if entries.len() < inner.opts.max_size {
                    let seq = inner.seq.fetch_add(1, Ordering::Relaxed);
                    entries.push(QueueEntry {
                        request: request.clone(),
                        retry_count: 0,
                        added_at: Instant::now(),
                        priority: request.options().priority,
                        seq,
                        state: EntryState::Pending,
                    });
                    Some(entries.len())
                } else {
                    None
                }
            };

            if let Some(size) = admitted {
                let id = request.id();
                // Whatever terminates the request frees its slot.
                let weak = Arc::downgrade(inner);
                request.on_terminal(move |_| {
                    if let Some(inner) = weak.upgrade() {
                        remove_entry(&inner, id);
                    }
                });
                inner.events.emit(Event::QueueAdded {
                    request_id: id,
                    size,
                });
                inner.events.emit(Event::QueueSizeChanged { size });
                inner.events.emit(Event::RequestQueued {
                    request_id: id,
                    method: request.method().to_string(),
                });
                inner.wake.notify_one();
                return Ok(true);
            }

            match inner.opts.on_full {
                OnFull::Drop => return Ok(false),
                OnFull::Error => {
                    return Err(QueueError::Full {
                        size: inner.opts.max_size,
                        max: inner.opts.max_size,
                    })
                }
                OnFull::Block => {
                    let waited =
                        tokio::time::timeout(inner.opts.drain_timeout, inner.space.notified())
                            .await;
                    if waited.is_err() {
                        request.reject(RequestFailure::kernel(
                            ErrorCode::QueueDrainTimeout,
                            "queue remained full past the drain timeout",
                        ));
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Cancel every queued request and empty the queue.
    pub fn clear(&self, reason: &str) -> usize {
        let requests: Vec<Request> = {
            let mut entries = self.inner.entries.lock();
            entries.drain(..).map(|e| e.request).collect()
        };
        for request in &requests {
            request.cancel(reason);
        }
        let count = requests.len();
        if count > 0 {
            self.inner.events.emit(Event::RequestsCancelled {
                count,
                reason: reason.to_string(),
            });
            self.inner.events.emit(Event::QueueSizeChanged { size: 0 });
        }
        self.inner.space.notify_one();
        self.inner.wake.notify_one();
        count
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Executed items currently holding a concurrency slot.
    pub fn in_flight(&self) -> usize {
        self.inner
            .entries
            .lock()
            .iter()
            .filter(|e| e.state == EntryState::InFlight)
            .count()
    }

    /// Stop the scheduler and drain monitor.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn remove_entry(inner: &Arc<QueueInner>, id: uuid::Uuid) {
    let size = {
        let mut entries = inner.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.request.id() != id);
        if entries.len() == before {
            return;
        }
        entries.len()
    };
    inner.events.emit(Event::QueueRemoved {
        request_id: id,
        size,
    });
    inner.events.emit(Event::QueueSizeChanged { size });
    inner.space.notify_one();
    inner.wake.notify_one();
}

async fn run_scheduler(inner: Arc<QueueInner>) {
    let mut connected = inner.connected.clone();
    loop {
        // Suspend while disconnected; items stay pending.
        while !*connected.borrow_and_update() {
            if connected.changed().await.is_err() {
                return;
            }
        }

        let picked = {
            let mut entries = inner.entries.lock();
            let in_flight = entries
                .iter()
                .filter(|e| e.state == EntryState::InFlight)
                .count();
            if in_flight >= inner.opts.max_concurrent {
                None
            } else {
                let idx = if inner.opts.priority_queuing {
                    entries
                        .iter()
                        .enumerate()
                        .filter(|(_, e)| e.state == EntryState::Pending)
                        .max_by_key(|(_, e)| (e.priority, std::cmp::Reverse(e.seq)))
                        .map(|(i, _)| i)
                } else {
                    entries
                        .iter()
                        .enumerate()
                        .filter(|(_, e)| e.state == EntryState::Pending)
                        .min_by_key(|(_, e)| e.seq)
                        .map(|(i, _)| i)
                };
                idx.map(|i| {
                    entries[i].state = EntryState::InFlight;
                    (entries[i].request.clone(), entries[i].retry_count)
                })
            }
        };

        match picked {
            Some((request, retry_count)) => {
                tokio::spawn(execute_entry(Arc::clone(&inner), request, retry_count));
            }
            None => {
                let notified = inner.wake.notified();
                tokio::select! {
                    _ = notified => {}
                    changed = connected.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn execute_entry(inner: Arc<QueueInner>, request: Request, retry_count: u32) {
    if request.is_terminal() {
        return;
    }
    // The response deadline starts at first execution; retries keep it.
    request.arm_timeout(&inner.timers);

    let mut message = Message::request(request.id(), request.method(), request.payload().cloned());
    message.metadata = request.options().metadata.clone();

    let sent: Result<(), String> = match inner.buffer.add_message_with_receipt(&message).await {
        Ok(receipt) => match receipt.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err("send buffer dropped the frame".to_string()),
        },
        Err(err) => Err(err.to_string()),
    };

    match sent {
        Ok(()) => {
            if request.options().no_response {
                request.resolve(None);
            }
            // Otherwise the entry stays in flight until the response,
            // timeout, or cancellation terminates the request.
        }
        Err(cause) => schedule_retry(inner, request, retry_count, cause),
    }
}

fn schedule_retry(inner: Arc<QueueInner>, request: Request, retry_count: u32, cause: String) {
    if request.is_terminal() {
        return;
    }
    let next = retry_count + 1;
    if next > inner.opts.max_retries {
        inner.events.emit(Event::RequestError {
            request_id: request.id(),
            error: cause.clone(),
        });
        request.reject(
            RequestFailure::kernel(
                ErrorCode::QueueRetryExceeded,
                format!("gave up after {} retries", inner.opts.max_retries),
            )
            .with_details(json!({ "cause": cause })),
        );
        return;
    }

    let id = request.id();
    {
        let mut entries = inner.entries.lock();
        let Some(entry) = entries.iter_mut().find(|e| e.request.id() == id) else {
            return;
        };
        entry.retry_count = next;
        entry.state = EntryState::Delayed;
    }

    let delay = inner.backoff.delay(next);
    tracing::debug!(request_id = %id, attempt = next, ?delay, %cause, "retrying request");
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        {
            let mut entries = inner.entries.lock();
            if let Some(entry) = entries.iter_mut().find(|e| e.request.id() == id) {
                if entry.state == EntryState::Delayed {
                    entry.state = EntryState::Pending;
                }
            }
        }
        inner.wake.notify_one();
    });
}

async fn run_drain_monitor(inner: Arc<QueueInner>) {
    let period = (inner.opts.drain_timeout / 4)
        .clamp(Duration::from_millis(50), Duration::from_secs(5));
    loop {
        tokio::time::sleep(period).await;
        let stale: Vec<Request> = {
            let entries = inner.entries.lock();
            entries
                .iter()
                .filter(|e| e.added_at.elapsed() > inner.opts.drain_timeout)
                .map(|e| e.request.clone())
                .collect()
        };
        for request in stale {
            request.reject(RequestFailure::kernel(
                ErrorCode::QueueDrainTimeout,
                format!(
                    "request exceeded the {:?} drain timeout",
                    inner.opts.drain_timeout
                ),
            ));
        }
    }
}
