//! # channelcast
//!
//! An in-process, channel-addressed publish/subscribe broker with long-poll
//! delivery, built to sit inside a database server node.
//!
//! ## Core Concepts
//!
//! - **Channels**: Plain string names; `$event.`-prefixed channels carry
//!   change events and support prefix subscription
//! - **Subscriptions**: Per-consumer queues with optional filter and projection
//! - **Polls**: Drain a batch of subscriptions, blocking until data arrives,
//!   the subscription goes away, or the timeout elapses
//! - **Relay**: Publishes on one node reach subscriptions on its peers
//!
//! ## Example
//!
//! ```ignore
//! use channelcast::{Broker, BrokerConfig};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let broker = Broker::new(BrokerConfig::default());
//! let id = broker.subscribe("A", None, None)?;
//!
//! let message = json!({"body": "hello", "count": 1});
//! broker.publish("A", message.as_object().cloned().unwrap())?;
//!
//! let outcome = broker.poll(&[id], Some(Duration::from_secs(1)));
//! assert_eq!(outcome.documents(id).len(), 1);
//!
//! broker.unsubscribe(&[id]);
//! ```

pub mod broker;
pub mod channels;
pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod query;
pub mod relay;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use broker::{Broker, ChannelMessages, PollOutcome};
pub use channels::{is_event_channel, ChannelTable, EVENT_CHANNEL_PREFIX};
pub use client::{ClientSubscription, CommandRunner, PubSubClient};
pub use config::{BrokerConfig, ServerParameters};
pub use error::{BrokerError, ErrorCode, Result};
pub use events::{
    collection_event_channel, event_channel, ChangeEventPublisher, MutationKind, MutationObserver,
};
pub use query::{DocumentMatcher, FieldProjector, MatchEvaluator, ProjectionEvaluator};
pub use relay::{
    ClusterRelay, RelayFrame, RelayLink, RelayTopology, RelayTransport, ReplicaSetMesh, RouterHub,
};
pub use subscriptions::{
    PollLease, QueuedMessage, Subscription, SubscriptionRegistry, SubscriptionSnapshot,
    SubscriptionState,
};
pub use types::*;
