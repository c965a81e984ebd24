//! Per-node broker façade.

use crate::channels::{is_event_channel, ChannelTable};
use crate::config::{duration_ms, BrokerConfig, ServerParameters};
use crate::error::{BrokerError, ErrorCode, Result};
use crate::query::{DocumentMatcher, FieldProjector, MatchEvaluator, ProjectionEvaluator};
use crate::relay::{ClusterRelay, RelayTopology};
use crate::subscriptions::{IdleSweeper, SubscriptionRegistry, SubscriptionSnapshot};
use crate::types::{default_node_name, BrokerStats, Document, IdGenerator, NodeId, SubscriptionId};
use crossbeam_channel::bounded;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Messages drained for one subscription, grouped by the channel they were
/// published on.
pub type ChannelMessages = BTreeMap<String, Vec<Document>>;

/// Result of one poll call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PollOutcome {
    /// Only subscriptions that had messages appear here.
    pub messages: BTreeMap<SubscriptionId, ChannelMessages>,
    /// Per-id failures; other ids in the batch are unaffected.
    pub errors: BTreeMap<SubscriptionId, ErrorCode>,
    /// The server cut the requested wait short; poll again to keep waiting.
    pub poll_again: bool,
    pub millis_polled: u64,
}

impl PollOutcome {
    /// Every message drained for `id`, across channels.
    pub fn documents(&self, id: SubscriptionId) -> Vec<Document> {
        self.messages
            .get(&id)
            .map(|by_channel| by_channel.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of messages in the outcome.
    pub fn message_count(&self) -> usize {
        self.messages
            .values()
            .flat_map(|by_channel| by_channel.values())
            .map(Vec::len)
            .sum()
    }

    pub fn error(&self, id: SubscriptionId) -> Option<ErrorCode> {
        self.errors.get(&id).copied()
    }
}

/// In-process publish/subscribe broker for one node.
///
/// Owns the subscription registry, the channel index, the idle sweeper, and
/// optionally a relay connecting it to other nodes.
pub struct Broker {
    config: BrokerConfig,
    node: NodeId,
    parameters: Arc<ServerParameters>,
    channels: Arc<ChannelTable>,
    registry: Arc<SubscriptionRegistry>,
    relay: Option<ClusterRelay>,
    _sweeper: IdleSweeper,
    published: AtomicU64,
}

impl Broker {
    /// Standalone broker with the built-in evaluators.
    pub fn new(config: BrokerConfig) -> Self {
        Self::build(config, None, Arc::new(DocumentMatcher), Arc::new(FieldProjector))
    }

    /// Broker that relays publishes through `topology`.
    pub fn with_relay(config: BrokerConfig, topology: &dyn RelayTopology) -> Self {
        Self::build(
            config,
            Some(topology),
            Arc::new(DocumentMatcher),
            Arc::new(FieldProjector),
        )
    }

    /// Standalone broker with host-provided filter and projection evaluators.
    pub fn with_evaluators(
        config: BrokerConfig,
        matcher: Arc<dyn MatchEvaluator>,
        projector: Arc<dyn ProjectionEvaluator>,
    ) -> Self {
        Self::build(config, None, matcher, projector)
    }

    fn build(
        config: BrokerConfig,
        topology: Option<&dyn RelayTopology>,
        matcher: Arc<dyn MatchEvaluator>,
        projector: Arc<dyn ProjectionEvaluator>,
    ) -> Self {
        let node_name = config.node_name.clone().unwrap_or_else(default_node_name);
        let node = NodeId::from_name(&node_name);
        let parameters = Arc::new(ServerParameters::from_config(&config));
        let channels = Arc::new(ChannelTable::new(matcher, projector));
        let registry = Arc::new(SubscriptionRegistry::new(
            channels.clone(),
            IdGenerator::new(node),
        ));
        let sweeper = IdleSweeper::spawn(registry.clone(), parameters.clone());
        let relay = topology.map(|topology| {
            ClusterRelay::start(
                node,
                topology.connect(node),
                channels.clone(),
                config.relay_dedup_capacity,
            )
        });

        info!(
            %node,
            name = %node_name,
            relayed = relay.is_some(),
            idle_timeout_ms = duration_ms(parameters.idle_timeout()),
            "broker started"
        );
        Self {
            config,
            node,
            parameters,
            channels,
            registry,
            relay,
            _sweeper: sweeper,
            published: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn parameters(&self) -> &ServerParameters {
        &self.parameters
    }

    /// Publish `message` on `channel`.
    ///
    /// Matching local subscriptions receive a copy before this returns;
    /// subscriptions on peer nodes receive one eventually.
    pub fn publish(&self, channel: &str, message: Document) -> Result<()> {
        let recipients = self.channels.route(channel, &message);
        self.published.fetch_add(1, Ordering::Relaxed);
        trace!(channel, local = recipients.len(), "published");

        if let Some(ref relay) = self.relay {
            relay.forward(channel, &message);
        }
        Ok(())
    }

    /// Subscribe to `channel`. Only messages published after this returns are
    /// delivered.
    pub fn subscribe(
        &self,
        channel: &str,
        filter: Option<Document>,
        projection: Option<Document>,
    ) -> Result<SubscriptionId> {
        if is_event_channel(channel) && !self.parameters.publish_data_events() {
            return Err(BrokerError::EventsDisabled);
        }
        if let Some(ref filter) = filter {
            self.channels.matcher().validate(filter)?;
        }
        if let Some(ref projection) = projection {
            self.channels.projector().validate(projection)?;
        }
        Ok(self.registry.create(channel, filter, projection).id())
    }

    /// Drain messages for `ids`, waiting up to `timeout` if none are buffered.
    ///
    /// No timeout means return immediately. The wait ends at the first
    /// message for any id, or when any id is unsubscribed or expires. Waits
    /// longer than the server cap are cut short with `poll_again` set.
    pub fn poll(&self, ids: &[SubscriptionId], timeout: Option<Duration>) -> PollOutcome {
        let started = Instant::now();
        let requested = timeout.unwrap_or(Duration::ZERO);
        let cap = self.parameters.poll_cap();
        let capped = requested > cap;
        let deadline = started + requested.min(cap);

        let (waker, signal) = bounded::<()>(1);
        let (leases, mut errors) = self.registry.checkout(ids, &waker);

        let mut timed_out = false;
        if !leases.is_empty() {
            loop {
                let ready = leases.iter().any(|lease| {
                    let sub = lease.subscription();
                    sub.has_pending() || !sub.is_active()
                });
                if ready {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    timed_out = true;
                    break;
                }
                let cycle = (deadline - now).min(self.config.poll_interval);
                let _ = signal.recv_timeout(cycle);
            }
        }

        let mut messages = BTreeMap::new();
        for lease in &leases {
            let sub = lease.subscription();
            if !sub.is_active() {
                debug!(id = %lease.id(), "poll interrupted by removal");
                errors.insert(lease.id(), ErrorCode::InvalidSubscriptionId);
                continue;
            }
            let mut by_channel = ChannelMessages::new();
            for queued in sub.drain() {
                by_channel
                    .entry(queued.channel)
                    .or_insert_with(Vec::new)
                    .push(queued.message);
            }
            if !by_channel.is_empty() {
                messages.insert(lease.id(), by_channel);
            }
        }
        drop(leases);

        PollOutcome {
            messages,
            errors,
            poll_again: capped && timed_out,
            millis_polled: duration_ms(started.elapsed()),
        }
    }

    /// Remove each id, interrupting any poll blocked on it. Returns the ids
    /// that were unknown or already gone.
    pub fn unsubscribe(&self, ids: &[SubscriptionId]) -> BTreeMap<SubscriptionId, ErrorCode> {
        self.registry.remove_many(ids)
    }

    pub fn view_subscriptions(&self) -> Vec<SubscriptionSnapshot> {
        self.registry.snapshot()
    }

    /// Run one idle-expiry pass now instead of waiting for the sweeper.
    pub fn expire_idle(&self) -> Vec<SubscriptionId> {
        self.registry.sweep(self.parameters.idle_timeout())
    }

    /// Set a runtime parameter by name. Returns the previous value.
    pub fn set_parameter(&self, name: &str, value: &Value) -> Result<Value> {
        let previous = self.parameters.set(name, value)?;
        info!(name, %value, %previous, "parameter changed");
        Ok(previous)
    }

    pub fn get_parameter(&self, name: &str) -> Result<Value> {
        self.parameters.get(name)
    }

    pub fn stats(&self) -> BrokerStats {
        let (relayed_out, relayed_in, relay_dropped) = self
            .relay
            .as_ref()
            .map(|r| (r.sent(), r.received(), r.dropped()))
            .unwrap_or_default();
        BrokerStats {
            subscriptions: self.registry.len(),
            channels: self.channels.channel_count(),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.channels.delivered_count(),
            relayed_out,
            relayed_in,
            relay_dropped,
            expired: self.registry.expired_count(),
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("node", &self.node)
            .field("subscriptions", &self.registry.len())
            .field("relayed", &self.relay.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_poll_without_timeout_returns_immediately() {
        let broker = Broker::new(BrokerConfig::default());
        let id = broker.subscribe("A", None, None).unwrap();
        let outcome = broker.poll(&[id], None);
        assert!(outcome.messages.is_empty());
        assert!(outcome.errors.is_empty());
        assert!(!outcome.poll_again);
    }

    #[test]
    fn test_poll_drains_buffered_messages() {
        let broker = Broker::new(BrokerConfig::default());
        let id = broker.subscribe("A", None, None).unwrap();
        broker.publish("A", doc(json!({"n": 1}))).unwrap();
        broker.publish("A", doc(json!({"n": 2}))).unwrap();

        let outcome = broker.poll(&[id], Some(Duration::from_secs(5)));
        assert_eq!(outcome.documents(id), vec![doc(json!({"n": 1})), doc(json!({"n": 2}))]);
        assert!(outcome.millis_polled < 5000);

        let outcome = broker.poll(&[id], None);
        assert_eq!(outcome.message_count(), 0);
    }

    #[test]
    fn test_blocked_poll_wakes_on_publish() {
        let broker = Arc::new(Broker::new(BrokerConfig::default()));
        let id = broker.subscribe("A", None, None).unwrap();

        let publisher = broker.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            publisher.publish("A", doc(json!({"n": 1}))).unwrap();
        });

        let outcome = broker.poll(&[id], Some(Duration::from_secs(10)));
        handle.join().unwrap();
        assert_eq!(outcome.message_count(), 1);
        assert!(outcome.millis_polled < 10_000);
    }

    #[test]
    fn test_capped_wait_sets_poll_again() {
        let broker = Broker::new(BrokerConfig::quick());
        let id = broker.subscribe("A", None, None).unwrap();
        let outcome = broker.poll(&[id], Some(Duration::from_secs(60)));
        assert!(outcome.poll_again);
        assert!(outcome.messages.is_empty());

        let outcome = broker.poll(&[id], Some(Duration::from_millis(10)));
        assert!(!outcome.poll_again);
    }

    #[test]
    fn test_event_channels_require_toggle() {
        let broker = Broker::new(BrokerConfig::default());
        assert!(matches!(
            broker.subscribe("$event.test.pubsub.", None, None),
            Err(BrokerError::EventsDisabled)
        ));
        broker
            .set_parameter(crate::config::PUBLISH_DATA_EVENTS, &json!(true))
            .unwrap();
        assert!(broker.subscribe("$event.test.pubsub.", None, None).is_ok());
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let broker = Broker::new(BrokerConfig::default());
        let bad = doc(json!({"count": {"$bogus": 1}}));
        assert!(matches!(
            broker.subscribe("A", Some(bad), None),
            Err(BrokerError::BadFilter(_))
        ));
        assert_eq!(broker.stats().subscriptions, 0);
    }

    #[test]
    fn test_stats() {
        let broker = Broker::new(BrokerConfig::default());
        let a = broker.subscribe("A", None, None).unwrap();
        broker.subscribe("B", None, None).unwrap();
        broker.publish("A", doc(json!({}))).unwrap();
        broker.publish("C", doc(json!({}))).unwrap();
        broker.unsubscribe(&[a]);

        let stats = broker.stats();
        assert_eq!(stats.subscriptions, 1);
        assert_eq!(stats.channels, 1);
        assert_eq!(stats.published, 2);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.relayed_out, 0);
    }
}
