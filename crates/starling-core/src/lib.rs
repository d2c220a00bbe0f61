//! Runtime kernel for the helios-starling protocol.
//!
//! A [`Node`] is one endpoint of a bidirectional, symmetric
//! RPC-over-WebSocket connection. It can concurrently invoke remote
//! methods, serve remote invocations, publish and subscribe to
//! topic-scoped notifications, and relay frames on behalf of a peer.
//!
//! The kernel owns:
//! - the [`resolver`](crate::resolve) that classifies inbound frames,
//! - the connection-gated [`SendBuffer`],
//! - the outbound [`Request`] lifecycle ([`RequestQueue`] +
//!   [`RequestsManager`]),
//! - the inbound dispatchers ([`MethodsRegistry`], [`TopicsRegistry`]),
//! - the handler-facing [contexts](crate::RequestContext), and
//! - the [`Backoff`]/[`TimerGroup`] retry plumbing.
//!
//! The transport itself (connect/accept loops, TLS) is a collaborator
//! behind the [`Transport`] trait; `starling-testkit` provides in-memory
//! implementations for tests.

mod buffer;
mod config;
mod context;
mod events;
mod manager;
mod methods;
mod node;
mod queue;
mod request;
mod resolver;
mod retry;
mod topics;
mod transport;

pub use buffer::*;
pub use config::*;
pub use context::*;
pub use events::*;
pub use manager::*;
pub use methods::*;
pub use node::*;
pub use queue::*;
pub use request::*;
pub use resolver::*;
pub use retry::*;
pub use topics::*;
pub use transport::*;

// Wire types are part of the kernel's public surface.
pub use starling_wire as wire;
pub use starling_wire::{
    ErrorCode, ErrorDetail, Message, MessageKind, NotificationBody, Peer, RawFrame, Severity,
};
