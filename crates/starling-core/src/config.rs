//! Node configuration.

use std::time::Duration;

use starling_wire::DEFAULT_MAX_MESSAGE_SIZE;

/// Back-pressure policy applied when a bounded structure is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnFull {
    /// Suspend the caller until space frees up (bounded by the drain
    /// timer for the request queue).
    #[default]
    Block,
    /// Reject the item; the call reports `false`.
    Drop,
    /// Fail the call with an error.
    Error,
}

/// Tunables for one node. Every field has the documented default;
/// construct with struct-update syntax over `NodeConfig::default()`.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Capacity of the outbound send buffer.
    pub message_buffer_size: usize,
    /// Buffered outbound frames older than this are discarded at flush.
    pub message_max_age: Duration,
    /// Batching window for the send buffer flusher.
    pub batch_window: Duration,
    /// Capacity of the outbound request queue.
    pub queue_max_size: usize,
    /// Retries per request before QUEUE_RETRY_EXCEEDED.
    pub queue_max_retries: u32,
    /// Absolute retry delays; when `None` the exponential backoff curve
    /// applies.
    pub queue_retry_delays: Option<Vec<Duration>>,
    /// Base delay of the backoff curve.
    pub queue_base_delay: Duration,
    /// Concurrent in-flight requests.
    pub max_concurrent: usize,
    /// Back-pressure policy for buffer and queue.
    pub on_full: OnFull,
    /// Age at which a queued request fails with QUEUE_DRAIN_TIMEOUT.
    pub drain_timeout: Duration,
    /// Inbound frame size ceiling.
    pub max_message_size: usize,
    /// How long a disconnected node keeps its pending work before
    /// cancelling it.
    pub disconnection_ttl: Duration,
    /// Strict inbound validation (version mismatches are violations).
    pub strict: bool,
    /// Route protocol frames with unknown `type` values to the JSON hook
    /// instead of rejecting them.
    pub allow_custom_types: bool,
    /// Capacity of the observability broadcast channel.
    pub events_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            message_buffer_size: 1000,
            message_max_age: Duration::from_secs(300),
            batch_window: Duration::from_millis(100),
            queue_max_size: 1000,
            queue_max_retries: 3,
            queue_retry_delays: None,
            queue_base_delay: Duration::from_secs(1),
            max_concurrent: 10,
            on_full: OnFull::Block,
            drain_timeout: Duration::from_secs(30),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            disconnection_ttl: Duration::from_secs(300),
            strict: true,
            allow_custom_types: false,
            events_capacity: 256,
        }
    }
}
