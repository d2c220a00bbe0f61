//! Test collaborators for the helios-starling kernel.
//!
//! [`MockTransport`] records outbound frames and scripts failures;
//! [`NodePair`] wires two nodes back to back so end-to-end request /
//! response / notification flows can be exercised without a socket.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use starling_core::{Node, NodeConfig, Transport, TransportError};
use starling_wire::{Message, RawFrame};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A transport that records everything the node sends.
pub struct MockTransport {
    connected: AtomicBool,
    sent: Mutex<Vec<RawFrame>>,
    fail_remaining: AtomicUsize,
}

impl MockTransport {
    pub fn connected() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            fail_remaining: AtomicUsize::new(0),
        })
    }

    pub fn disconnected() -> Arc<Self> {
        let transport = Self::connected();
        transport.connected.store(false, Ordering::SeqCst);
        transport
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make the next `n` sends fail with a transport error.
    pub fn fail_next_sends(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Everything sent so far.
    pub fn sent(&self) -> Vec<RawFrame> {
        self.sent.lock().clone()
    }

    /// Sent frames parsed as protocol messages (panics on non-protocol
    /// frames; tests that send raw text should use [`MockTransport::sent`]).
    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent()
            .into_iter()
            .map(|frame| match frame {
                RawFrame::Text(text) => {
                    serde_json::from_str(&text).expect("sent frame is not a protocol message")
                }
                RawFrame::Binary(_) => panic!("sent frame is binary"),
            })
            .collect()
    }

    /// Drain the record.
    pub fn take_sent(&self) -> Vec<RawFrame> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Wait until at least `n` frames have been sent.
    pub async fn wait_for_frames(&self, n: usize) -> Vec<RawFrame> {
        let deadline = Duration::from_secs(10);
        tokio::time::timeout(deadline, async {
            loop {
                if self.sent.lock().len() >= n {
                    return self.sent();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("fewer than {} frames sent within {:?}", n, deadline))
    }
}

impl Transport for MockTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send_raw(&self, frame: RawFrame) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let remaining = self.fail_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(TransportError::SendFailed(
                    "scripted send failure".to_string(),
                ));
            }
            if !self.is_connected() {
                return Err(TransportError::NotConnected);
            }
            self.sent.lock().push(frame);
            Ok(())
        })
    }
}

/// One side of a linked pair: sends go into a channel pumped into the
/// other node's `deliver`.
struct LinkedTransport {
    outbound: mpsc::UnboundedSender<RawFrame>,
    connected: AtomicBool,
}

impl Transport for LinkedTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send_raw(&self, frame: RawFrame) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(TransportError::NotConnected);
            }
            self.outbound
                .send(frame)
                .map_err(|_| TransportError::Closed)
        })
    }
}

/// Two nodes wired back to back over in-memory channels.
pub struct NodePair {
    pub left: Node,
    pub right: Node,
    pumps: Vec<JoinHandle<()>>,
}

impl NodePair {
    /// Build a connected pair. Must be called within a tokio runtime.
    pub fn connected(left_config: NodeConfig, right_config: NodeConfig) -> Self {
        let (to_right, from_left) = mpsc::unbounded_channel();
        let (to_left, from_right) = mpsc::unbounded_channel();

        let left_transport = Arc::new(LinkedTransport {
            outbound: to_right,
            connected: AtomicBool::new(true),
        });
        let right_transport = Arc::new(LinkedTransport {
            outbound: to_left,
            connected: AtomicBool::new(true),
        });

        let left = Node::new(left_transport, left_config);
        let right = Node::new(right_transport, right_config);

        let pumps = vec![
            Self::pump(from_left, right.clone()),
            Self::pump(from_right, left.clone()),
        ];
        Self { left, right, pumps }
    }

    fn pump(mut rx: mpsc::UnboundedReceiver<RawFrame>, node: Node) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                node.deliver(frame).await;
            }
        })
    }

    pub fn shutdown(self) {
        self.left.shutdown();
        self.right.shutdown();
        for pump in self.pumps {
            pump.abort();
        }
    }
}
