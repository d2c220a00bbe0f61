//! Connection-gated outbound send buffer.
//!
//! Outbound frames accumulate here while the node is disconnected and are
//! flushed by a single task once it reconnects, preserving insertion
//! order. The buffer never retries: transport failures are reported
//! through the per-item receipt (for requests, the queue recovers) and
//! the `message:send:failed` event (for everything else, delivery is
//! at-most-once).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use starling_wire::{encode, Message, RawFrame, WireError};
use thiserror::Error;
use tokio::sync::{oneshot, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::OnFull;
use crate::events::{Event, Events};
use crate::transport::{Transport, TransportError};

/// Resolves once the buffered frame has been written to the transport
/// (or failed to be).
pub type SendReceipt = oneshot::Receiver<Result<(), TransportError>>;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("send buffer is full")]
    Full,

    #[error("send buffer is shut down")]
    Closed,

    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Clone, Debug)]
pub struct BufferOptions {
    pub capacity: usize,
    pub max_age: Duration,
    pub batch_window: Duration,
    pub on_full: OnFull,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            capacity: 1000,
            max_age: Duration::from_secs(300),
            batch_window: Duration::from_millis(100),
            on_full: OnFull::Block,
        }
    }
}

struct BufferedItem {
    frame: RawFrame,
    buffered_at: Instant,
    receipt: Option<oneshot::Sender<Result<(), TransportError>>>,
    _permit: OwnedSemaphorePermit,
}

struct BufferInner {
    opts: BufferOptions,
    transport: Arc<dyn Transport>,
    connected: watch::Receiver<bool>,
    items: Mutex<VecDeque<BufferedItem>>,
    capacity: Arc<Semaphore>,
    pending: Notify,
    events: Events,
}

/// The outbound buffer. One per node; shared as `Arc<SendBuffer>`.
pub struct SendBuffer {
    inner: Arc<BufferInner>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl SendBuffer {
    /// Create the buffer and spawn its flusher. Must be called within a
    /// tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        connected: watch::Receiver<bool>,
        events: Events,
        opts: BufferOptions,
    ) -> Arc<Self> {
        let inner = Arc::new(BufferInner {
            capacity: Arc::new(Semaphore::new(opts.capacity.max(1))),
            opts,
            transport,
            connected,
            items: Mutex::new(VecDeque::new()),
            pending: Notify::new(),
            events,
        });
        let flusher = tokio::spawn(run_flusher(Arc::clone(&inner)));
        Arc::new(Self {
            inner,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /// Accept one outbound frame. Returns `Ok(false)` when the `Drop`
    /// policy rejected it.
    pub async fn add(&self, frame: RawFrame) -> Result<bool, BufferError> {
        self.push(frame, None).await
    }

    /// Accept one outbound frame and report its eventual transport
    /// outcome through the returned receipt.
    pub async fn add_with_receipt(&self, frame: RawFrame) -> Result<SendReceipt, BufferError> {
        let (tx, rx) = oneshot::channel();
        match self.push(frame, Some(tx)).await? {
            true => Ok(rx),
            false => Err(BufferError::Full),
        }
    }

    /// Serialize a protocol message and buffer it.
    pub async fn add_message(&self, message: &Message) -> Result<bool, BufferError> {
        let frame = RawFrame::Text(encode(message)?);
        self.add(frame).await
    }

    /// Serialize a protocol message and buffer it with a receipt.
    pub async fn add_message_with_receipt(
        &self,
        message: &Message,
    ) -> Result<SendReceipt, BufferError> {
        let frame = RawFrame::Text(encode(message)?);
        self.add_with_receipt(frame).await
    }

    async fn push(
        &self,
        frame: RawFrame,
        receipt: Option<oneshot::Sender<Result<(), TransportError>>>,
    ) -> Result<bool, BufferError> {
        let inner = &self.inner;
        let permit = match inner.opts.on_full {
            OnFull::Block => match Arc::clone(&inner.capacity).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Err(BufferError::Closed),
            },
            OnFull::Drop => match Arc::clone(&inner.capacity).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return Ok(false),
            },
            OnFull::Error => match Arc::clone(&inner.capacity).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return Err(BufferError::Full),
            },
        };

        let depth = {
            let mut items = inner.items.lock();
            items.push_back(BufferedItem {
                frame,
                buffered_at: Instant::now(),
                receipt,
                _permit: permit,
            });
            items.len()
        };
        if !*inner.connected.borrow() {
            inner.events.emit(Event::MessageBuffered { depth });
        }
        inner.pending.notify_one();
        Ok(true)
    }

    /// Frames currently held.
    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the flusher and drop everything still buffered. Pending
    /// receipts resolve as failed (their senders are dropped).
    pub fn shutdown(&self) {
        if let Some(handle) = self.flusher.lock().take() {
            handle.abort();
        }
        self.inner.capacity.close();
        self.inner.items.lock().clear();
    }
}

async fn run_flusher(inner: Arc<BufferInner>) {
    let mut connected = inner.connected.clone();
    loop {
        // Gate on connection state.
        while !*connected.borrow_and_update() {
            if connected.changed().await.is_err() {
                return;
            }
        }

        // Wait for work. notify_one stores a permit, so an add racing
        // with the emptiness check is not lost.
        if inner.items.lock().is_empty() {
            let notified = inner.pending.notified();
            if inner.items.lock().is_empty() {
                tokio::select! {
                    _ = notified => {}
                    changed = connected.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                }
            }
        }

        // Let one batching window's worth of adds coalesce.
        tokio::time::sleep(inner.opts.batch_window).await;

        // Flush in insertion order until empty or disconnected.
        loop {
            if !*connected.borrow() {
                break;
            }
            let item = inner.items.lock().pop_front();
            let Some(item) = item else { break };

            if item.buffered_at.elapsed() > inner.opts.max_age {
                tracing::debug!("dropping buffered frame older than max age");
                if let Some(receipt) = item.receipt {
                    let _ = receipt.send(Err(TransportError::SendFailed(
                        "frame expired in send buffer".to_string(),
                    )));
                }
                continue;
            }

            let size = item.frame.len();
            match inner.transport.send_raw(item.frame).await {
                Ok(()) => {
                    inner.events.emit(Event::MessageSendSuccess { size });
                    if let Some(receipt) = item.receipt {
                        let _ = receipt.send(Ok(()));
                    }
                }
                Err(err) => {
                    inner.events.emit(Event::MessageSendFailed {
                        error: err.to_string(),
                    });
                    if let Some(receipt) = item.receipt {
                        let _ = receipt.send(Err(err));
                    }
                }
            }
        }
    }
}
