//! Change events: data mutations republished on reserved channels.
//!
//! With `publishDataEvents` on, every observed insert, update, and remove is
//! published on `$event.<db>.<collection>.<op>`. Subscribing to
//! `$event.<db>.<collection>.` receives all three operations for that
//! collection. Updates carry `{old, new}`.

use crate::broker::Broker;
use crate::channels::EVENT_CHANNEL_PREFIX;
use crate::types::Document;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{info, trace, warn};

/// Kind of data mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Insert,
    Update,
    Remove,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Insert => "insert",
            MutationKind::Update => "update",
            MutationKind::Remove => "remove",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel carrying `kind` events for `db.collection`.
pub fn event_channel(db: &str, collection: &str, kind: MutationKind) -> String {
    format!("{EVENT_CHANNEL_PREFIX}.{db}.{collection}.{kind}")
}

/// Prefix channel receiving every event kind for `db.collection`.
///
/// Matching is by prefix at `.` boundaries, so the channel for collection
/// `foo` also receives events of dotted sub-collections such as `foo.bar`.
/// Subscribe to [`event_channel`] names to select one collection exactly.
pub fn collection_event_channel(db: &str, collection: &str) -> String {
    format!("{EVENT_CHANNEL_PREFIX}.{db}.{collection}.")
}

/// Hook the host storage layer calls after each successful mutation.
pub trait MutationObserver: Send + Sync {
    fn on_insert(&self, db: &str, collection: &str, document: &Document);
    fn on_update(&self, db: &str, collection: &str, old: &Document, new: &Document);
    fn on_remove(&self, db: &str, collection: &str, document: &Document);
}

/// Publishes observed mutations through a broker.
pub struct ChangeEventPublisher {
    broker: Arc<Broker>,
    /// `None` observes every namespace.
    namespaces: Option<HashSet<String>>,
}

impl ChangeEventPublisher {
    /// Observe every (non-system) namespace.
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            namespaces: None,
        }
    }

    /// Observe only the listed `db.collection` namespaces.
    pub fn with_namespaces<I, S>(broker: Arc<Broker>, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            broker,
            namespaces: Some(namespaces.into_iter().map(Into::into).collect()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.broker.parameters().publish_data_events()
    }

    /// Turn event generation on or off. Returns the previous setting.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        let previous = self.broker.parameters().set_publish_data_events(enabled);
        if previous != enabled {
            info!(enabled, "data event publishing toggled");
        }
        previous
    }

    /// Whether mutations of `db.collection` generate events.
    pub fn observes(&self, db: &str, collection: &str) -> bool {
        if collection.starts_with("system.") {
            return false;
        }
        match self.namespaces {
            None => true,
            Some(ref allowed) => allowed.contains(&format!("{db}.{collection}")),
        }
    }

    fn emit(&self, db: &str, collection: &str, kind: MutationKind, event: Document) {
        if !self.is_enabled() || !self.observes(db, collection) {
            return;
        }
        let channel = event_channel(db, collection, kind);
        match self.broker.publish(&channel, event) {
            Ok(()) => trace!(%channel, "change event published"),
            Err(e) => warn!(%channel, error = %e, "change event publish failed"),
        }
    }
}

impl MutationObserver for ChangeEventPublisher {
    fn on_insert(&self, db: &str, collection: &str, document: &Document) {
        self.emit(db, collection, MutationKind::Insert, document.clone());
    }

    fn on_update(&self, db: &str, collection: &str, old: &Document, new: &Document) {
        let mut event = Document::new();
        event.insert("old".into(), Value::Object(old.clone()));
        event.insert("new".into(), Value::Object(new.clone()));
        self.emit(db, collection, MutationKind::Update, event);
    }

    fn on_remove(&self, db: &str, collection: &str, document: &Document) {
        self.emit(db, collection, MutationKind::Remove, document.clone());
    }
}
