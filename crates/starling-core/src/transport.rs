//! The transport collaborator interface.
//!
//! The kernel never opens sockets. A transport implementation feeds
//! inbound frames to [`Node::deliver`](crate::Node::deliver), reports
//! connection state through
//! [`Node::handle_connected`](crate::Node::handle_connected) /
//! [`Node::handle_disconnected`](crate::Node::handle_disconnected), and
//! exposes the outbound primitive below.

use futures_util::future::BoxFuture;
use starling_wire::RawFrame;
use thiserror::Error;

/// Failures surfaced by a transport's outbound primitive.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("transport send failed: {0}")]
    SendFailed(String),

    #[error("transport is closed")]
    Closed,
}

/// Outbound side of the transport collaborator.
///
/// `send_raw` is boxed so implementations stay object-safe; the kernel
/// holds transports as `Arc<dyn Transport>`.
pub trait Transport: Send + Sync {
    /// Whether the underlying connection is currently usable.
    fn is_connected(&self) -> bool;

    /// Write one frame to the wire.
    fn send_raw(&self, frame: RawFrame) -> BoxFuture<'_, Result<(), TransportError>>;
}
