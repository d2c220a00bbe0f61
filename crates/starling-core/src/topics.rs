//! Pattern-subscribed notification dispatch.
//!
//! Subscriptions address topics exactly or through `*` segment
//! wildcards. A `*` matches exactly one segment, never more: `user:*`
//! matches `user:presence` but not `user:a:b`. The matcher is the
//! pattern compiled to `^...$` with each `*` replaced by `[^:]+`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use starling_wire::MAX_NAME_LENGTH;
use thiserror::Error;

use crate::context::NotificationContext;
use crate::events::{Event, Events};

#[derive(Debug, Error)]
pub enum TopicError {
    #[error("invalid topic pattern: {0}")]
    InvalidPattern(String),
}

/// A compiled topic pattern.
#[derive(Clone, Debug)]
pub struct TopicPattern {
    raw: String,
    regex: Regex,
}

impl TopicPattern {
    /// Compile a pattern. Segments are `[a-zA-Z][a-zA-Z0-9_]*` or `*`.
    pub fn new(pattern: &str) -> Result<Self, TopicError> {
        if pattern.is_empty() || pattern.len() > MAX_NAME_LENGTH {
            return Err(TopicError::InvalidPattern(pattern.to_string()));
        }
        let mut regex = String::from("^");
        for (i, segment) in pattern.split(':').enumerate() {
            if i > 0 {
                regex.push(':');
            }
            if segment == "*" {
                regex.push_str("[^:]+");
            } else if is_plain_segment(segment) {
                regex.push_str(segment);
            } else {
                return Err(TopicError::InvalidPattern(pattern.to_string()));
            }
        }
        regex.push('$');
        let regex = Regex::new(&regex)
            .map_err(|_| TopicError::InvalidPattern(pattern.to_string()))?;
        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.regex.is_match(topic)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn is_plain_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Handlers run synchronously, in priority-then-registration order.
pub type TopicHandler = Arc<dyn Fn(&NotificationContext) + Send + Sync>;

/// Delivery filter: `false` skips this subscription for the frame.
pub type TopicFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct SubscribeOptions {
    /// Whether the subscription survives disconnects. Non-persistent
    /// subscriptions are discarded when the node loses its connection.
    pub persistent: bool,
    pub priority: i32,
    pub filter: Option<TopicFilter>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            priority: 0,
            filter: None,
        }
    }
}

struct Subscription {
    id: u64,
    pattern: TopicPattern,
    handler: TopicHandler,
    priority: i32,
    persistent: bool,
    filter: Option<TopicFilter>,
}

struct TopicsInner {
    subs: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    events: Events,
}

/// Topic subscription registry; shareable across nodes as a hub.
#[derive(Clone)]
pub struct TopicsRegistry {
    inner: Arc<TopicsInner>,
}

impl TopicsRegistry {
    pub fn new(events: Events) -> Self {
        Self {
            inner: Arc::new(TopicsInner {
                subs: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                events,
            }),
        }
    }

    /// Subscribe a handler to a topic or pattern. The returned handle
    /// unsubscribes on [`SubscriptionHandle::off`].
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: impl Fn(&NotificationContext) + Send + Sync + 'static,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionHandle, TopicError> {
        let pattern = TopicPattern::new(pattern)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subs.write().push(Subscription {
            id,
            pattern,
            handler: Arc::new(handler),
            priority: opts.priority,
            persistent: opts.persistent,
            filter: opts.filter,
        });
        Ok(SubscriptionHandle {
            id,
            registry: Arc::downgrade(&self.inner),
        })
    }

    /// Deliver one topic-routed notification.
    ///
    /// Matching handlers run in descending priority order; equal
    /// priorities run in registration order. A panicking handler is
    /// surfaced as `topic:error` and never prevents its siblings.
    pub fn dispatch(&self, ctx: &NotificationContext) {
        let Some(topic) = ctx.topic.as_deref() else {
            return;
        };
        let data = ctx.data.clone().unwrap_or(Value::Null);

        let mut matching: Vec<(i32, u64, TopicHandler)> = {
            let subs = self.inner.subs.read();
            subs.iter()
                .filter(|s| s.pattern.matches(topic))
                .filter(|s| s.filter.as_ref().map(|f| f(&data)).unwrap_or(true))
                .map(|s| (s.priority, s.id, Arc::clone(&s.handler)))
                .collect()
        };
        matching.sort_by_key(|(priority, id, _)| (std::cmp::Reverse(*priority), *id));

        let handlers = matching.len();
        for (_, _, handler) in matching {
            if catch_unwind(AssertUnwindSafe(|| handler(ctx))).is_err() {
                tracing::warn!(topic, "topic handler panicked");
                self.inner.events.emit(Event::TopicError {
                    topic: topic.to_string(),
                    error: "handler panicked".to_string(),
                });
            }
        }
        self.inner.events.emit(Event::TopicHandled {
            topic: topic.to_string(),
            handlers,
        });
    }

    /// Discard non-persistent subscriptions (called on disconnect).
    pub fn drop_non_persistent(&self) {
        self.inner.subs.write().retain(|s| s.persistent);
    }

    pub fn len(&self) -> usize {
        self.inner.subs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opaque unsubscribe handle.
pub struct SubscriptionHandle {
    id: u64,
    registry: Weak<TopicsInner>,
}

impl SubscriptionHandle {
    /// Remove the subscription. Returns false if it is already gone.
    pub fn off(&self) -> bool {
        let Some(inner) = self.registry.upgrade() else {
            return false;
        };
        let mut subs = inner.subs.write();
        let before = subs.len();
        subs.retain(|s| s.id != self.id);
        subs.len() != before
    }
}
