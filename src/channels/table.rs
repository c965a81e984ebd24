//! Channel → subscription index.

use super::routing_keys;
use crate::query::{MatchEvaluator, ProjectionEvaluator};
use crate::subscriptions::Subscription;
use crate::types::{Document, SubscriptionId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Subscriptions bound to one channel name.
#[derive(Default)]
struct ChannelEntry {
    members: RwLock<HashMap<SubscriptionId, Arc<Subscription>>>,
}

/// Secondary index from channel names to bound subscriptions.
///
/// Each channel has its own lock; the outer map is only write-locked to add
/// or drop a channel entry.
pub struct ChannelTable {
    channels: RwLock<HashMap<String, Arc<ChannelEntry>>>,
    matcher: Arc<dyn MatchEvaluator>,
    projector: Arc<dyn ProjectionEvaluator>,
    delivered: AtomicU64,
}

impl ChannelTable {
    pub fn new(matcher: Arc<dyn MatchEvaluator>, projector: Arc<dyn ProjectionEvaluator>) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            matcher,
            projector,
            delivered: AtomicU64::new(0),
        }
    }

    pub fn matcher(&self) -> &dyn MatchEvaluator {
        self.matcher.as_ref()
    }

    pub fn projector(&self) -> &dyn ProjectionEvaluator {
        self.projector.as_ref()
    }

    /// Bind a subscription under its channel.
    pub fn bind(&self, subscription: Arc<Subscription>) {
        let channel = subscription.channel().to_string();
        {
            // Insert while holding the outer read lock so `unbind` cannot
            // drop the entry between lookup and insert.
            let channels = self.channels.read();
            if let Some(entry) = channels.get(&channel) {
                entry.members.write().insert(subscription.id(), subscription);
                return;
            }
        }
        let mut channels = self.channels.write();
        channels
            .entry(channel)
            .or_default()
            .members
            .write()
            .insert(subscription.id(), subscription);
    }

    /// Remove a binding. Empty channel entries are dropped.
    pub fn unbind(&self, channel: &str, id: SubscriptionId) -> bool {
        let (removed, now_empty) = {
            let channels = self.channels.read();
            let Some(entry) = channels.get(channel) else {
                return false;
            };
            let mut members = entry.members.write();
            let removed = members.remove(&id).is_some();
            (removed, members.is_empty())
        };

        if now_empty {
            let mut channels = self.channels.write();
            let still_empty = channels
                .get(channel)
                .map(|entry| entry.members.read().is_empty())
                .unwrap_or(false);
            if still_empty {
                channels.remove(channel);
            }
        }
        removed
    }

    /// Subscriptions that would receive a publish to `channel`.
    fn candidates(&self, channel: &str) -> Vec<Arc<Subscription>> {
        let channels = self.channels.read();
        let mut out = Vec::new();
        for key in routing_keys(channel) {
            if let Some(entry) = channels.get(key) {
                out.extend(entry.members.read().values().cloned());
            }
        }
        out
    }

    /// Whether any local subscription listens on `channel`.
    pub fn has_subscribers(&self, channel: &str) -> bool {
        let channels = self.channels.read();
        routing_keys(channel)
            .into_iter()
            .any(|key| channels.contains_key(key))
    }

    /// Deliver `message` to every matching subscription of `channel`.
    ///
    /// Each subscription is evaluated on its own: the message is enqueued if
    /// the filter matches, projected when a projection is set. Returns the
    /// ids that received a copy.
    pub fn route(&self, channel: &str, message: &Document) -> Vec<SubscriptionId> {
        let mut delivered = Vec::new();
        for subscription in self.candidates(channel) {
            if let Some(filter) = subscription.filter() {
                if !self.matcher.matches(filter, message) {
                    continue;
                }
            }
            let view = match subscription.projection() {
                Some(spec) => self.projector.project(spec, message),
                None => message.clone(),
            };
            if subscription.deliver(channel, view) {
                delivered.push(subscription.id());
            }
        }
        self.delivered
            .fetch_add(delivered.len() as u64, Ordering::Relaxed);
        trace!(channel, recipients = delivered.len(), "routed message");
        delivered
    }

    /// Number of channels with at least one binding.
    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Number of subscriptions bound directly under `channel`.
    pub fn member_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .get(channel)
            .map(|entry| entry.members.read().len())
            .unwrap_or(0)
    }

    /// Total messages enqueued by `route`.
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{DocumentMatcher, FieldProjector};
    use serde_json::{json, Value};

    fn table() -> ChannelTable {
        ChannelTable::new(Arc::new(DocumentMatcher), Arc::new(FieldProjector))
    }

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    fn sub(n: u32, channel: &str, filter: Option<Value>, projection: Option<Value>) -> Arc<Subscription> {
        Arc::new(Subscription::new(
            SubscriptionId::from_parts(0, 0, n),
            channel.to_string(),
            filter.map(doc),
            projection.map(doc),
        ))
    }

    #[test]
    fn test_route_respects_filters_independently() {
        let t = table();
        let all = sub(1, "A", None, None);
        let big = sub(2, "A", Some(json!({"count": {"$gt": 3}})), None);
        t.bind(all.clone());
        t.bind(big.clone());

        for i in 0..6 {
            t.route("A", &doc(json!({"count": i})));
        }

        assert_eq!(all.drain().len(), 6);
        let got: Vec<_> = big.drain().into_iter().map(|m| m.message["count"].clone()).collect();
        assert_eq!(got, vec![json!(4), json!(5)]);
        assert_eq!(t.delivered_count(), 8);
    }

    #[test]
    fn test_route_applies_projection() {
        let t = table();
        let s = sub(1, "A", None, Some(json!({"count": 1})));
        t.bind(s.clone());
        t.route("A", &doc(json!({"body": "hello", "count": 1})));
        let m = s.drain().remove(0);
        assert_eq!(Value::Object(m.message), json!({"count": 1}));
    }

    #[test]
    fn test_literal_channels_do_not_cross() {
        let t = table();
        let a = sub(1, "A", None, None);
        let b = sub(2, "B", None, None);
        t.bind(a.clone());
        t.bind(b.clone());
        t.route("B", &doc(json!({"x": 1})));
        assert!(!a.has_pending());
        assert!(b.has_pending());
        assert!(t.route("C", &doc(json!({}))).is_empty());
    }

    #[test]
    fn test_event_prefix_subscription() {
        let t = table();
        let s = sub(1, "$event.test.pubsub.", None, None);
        t.bind(s.clone());
        t.route("$event.test.pubsub.insert", &doc(json!({"text": "hello"})));
        t.route("$event.test.other.insert", &doc(json!({"text": "nope"})));
        let got = s.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].channel, "$event.test.pubsub.insert");
    }

    #[test]
    fn test_unbind_drops_empty_channels() {
        let t = table();
        let s = sub(1, "A", None, None);
        t.bind(s.clone());
        assert_eq!(t.channel_count(), 1);
        assert!(t.has_subscribers("A"));
        assert!(t.unbind("A", s.id()));
        assert!(!t.unbind("A", s.id()));
        assert_eq!(t.channel_count(), 0);
        assert!(!t.has_subscribers("A"));
    }
}
