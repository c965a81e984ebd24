//! Typed client over the command protocol.

use crate::broker::{Broker, PollOutcome};
use crate::command::{
    parse_errors, parse_poll_reply, CHANNEL_FIELD, FILTER_FIELD, MESSAGE_FIELD, POLL,
    PROJECTION_FIELD, PUBLISH, SUBSCRIBE, SUBSCRIPTION_ID_FIELD, TIMEOUT_FIELD, UNSUBSCRIBE,
};
use crate::error::{BrokerError, ErrorCode, Result};
use crate::events::collection_event_channel;
use crate::types::{Document, SubscriptionId};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Something that executes command documents: a local broker or a connection
/// to a remote one.
pub trait CommandRunner {
    fn run_command(&self, command: &Document) -> Result<Document>;
}

impl CommandRunner for Broker {
    fn run_command(&self, command: &Document) -> Result<Document> {
        Ok(Broker::run_command(self, command))
    }
}

impl<R: CommandRunner + ?Sized> CommandRunner for Arc<R> {
    fn run_command(&self, command: &Document) -> Result<Document> {
        (**self).run_command(command)
    }
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run_command(&self, command: &Document) -> Result<Document> {
        (**self).run_command(command)
    }
}

/// Publish/subscribe client bound to one connection.
///
/// Remembers the ids it issued so they can be polled or released together.
pub struct PubSubClient<R: CommandRunner> {
    runner: R,
    issued: Mutex<Vec<SubscriptionId>>,
}

impl<R: CommandRunner> PubSubClient<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            issued: Mutex::new(Vec::new()),
        }
    }

    fn run(&self, command: Value) -> Result<Document> {
        let command = match command {
            Value::Object(command) => command,
            _ => return Err(BrokerError::Serialization("command must be a document".into())),
        };
        let reply = self.runner.run_command(&command)?;
        if reply.get("ok").and_then(Value::as_f64) == Some(1.0) {
            return Ok(reply);
        }
        Err(BrokerError::CommandFailed {
            code: reply
                .get("code")
                .and_then(Value::as_i64)
                .map(|c| c as i32)
                .unwrap_or(0),
            message: reply
                .get("errmsg")
                .and_then(Value::as_str)
                .unwrap_or("command failed")
                .to_string(),
        })
    }

    pub fn publish(&self, channel: &str, message: Document) -> Result<()> {
        self.run(json!({ PUBLISH: 1, CHANNEL_FIELD: channel, MESSAGE_FIELD: message }))?;
        Ok(())
    }

    pub fn subscribe(&self, channel: &str) -> Result<SubscriptionId> {
        self.subscribe_with(channel, None, None)
    }

    pub fn subscribe_with(
        &self,
        channel: &str,
        filter: Option<Document>,
        projection: Option<Document>,
    ) -> Result<SubscriptionId> {
        let mut command = json!({ SUBSCRIBE: 1, CHANNEL_FIELD: channel });
        if let Some(filter) = filter {
            command[FILTER_FIELD] = Value::Object(filter);
        }
        if let Some(projection) = projection {
            command[PROJECTION_FIELD] = Value::Object(projection);
        }
        let reply = self.run(command)?;
        let id = reply
            .get(SUBSCRIPTION_ID_FIELD)
            .and_then(SubscriptionId::from_value)
            .ok_or_else(|| BrokerError::Deserialization("subscribe reply without id".into()))?;
        self.issued.lock().push(id);
        Ok(id)
    }

    /// Subscribe to every change event of `db.collection`.
    pub fn subscribe_to_changes(&self, db: &str, collection: &str) -> Result<SubscriptionId> {
        self.subscribe(&collection_event_channel(db, collection))
    }

    /// One poll round trip.
    pub fn poll(&self, ids: &[SubscriptionId], timeout: Option<Duration>) -> Result<PollOutcome> {
        let ids: Vec<Value> = ids.iter().map(SubscriptionId::to_value).collect();
        let mut command = json!({ POLL: 1, SUBSCRIPTION_ID_FIELD: ids });
        if let Some(timeout) = timeout {
            command[TIMEOUT_FIELD] = json!(timeout.as_millis().min(u128::from(u64::MAX)) as u64);
        }
        parse_poll_reply(&self.run(command)?)
    }

    /// Poll, re-issuing while the server asks to poll again, until messages or
    /// errors arrive or `timeout` elapses.
    pub fn poll_until(&self, ids: &[SubscriptionId], timeout: Duration) -> Result<PollOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = self.poll(ids, Some(remaining))?;
            if !outcome.poll_again || remaining.is_zero() {
                return Ok(outcome);
            }
        }
    }

    /// Poll every id issued through this client.
    pub fn poll_all(&self, timeout: Option<Duration>) -> Result<PollOutcome> {
        let ids = self.issued();
        self.poll(&ids, timeout)
    }

    pub fn unsubscribe(&self, ids: &[SubscriptionId]) -> Result<BTreeMap<SubscriptionId, ErrorCode>> {
        let values: Vec<Value> = ids.iter().map(SubscriptionId::to_value).collect();
        let reply = self.run(json!({ UNSUBSCRIBE: 1, SUBSCRIPTION_ID_FIELD: values }))?;
        self.issued.lock().retain(|id| !ids.contains(id));
        parse_errors(&reply)
    }

    /// Unsubscribe every id issued through this client.
    pub fn unsubscribe_all(&self) -> Result<BTreeMap<SubscriptionId, ErrorCode>> {
        let ids = self.issued();
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        self.unsubscribe(&ids)
    }

    /// Ids issued through this client and not yet unsubscribed by it.
    pub fn issued(&self) -> Vec<SubscriptionId> {
        self.issued.lock().clone()
    }

    /// Handle for one subscription.
    pub fn handle(&self, id: SubscriptionId) -> ClientSubscription<'_, R> {
        ClientSubscription { client: self, id }
    }

    /// Subscribe and wrap the id in a handle.
    pub fn subscription(&self, channel: &str) -> Result<ClientSubscription<'_, R>> {
        let id = self.subscribe(channel)?;
        Ok(self.handle(id))
    }
}

/// One subscription seen through its client.
pub struct ClientSubscription<'a, R: CommandRunner> {
    client: &'a PubSubClient<R>,
    id: SubscriptionId,
}

impl<R: CommandRunner> ClientSubscription<'_, R> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Drain this subscription's messages, failing if the id is no longer valid.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<Vec<Document>> {
        let outcome = self.client.poll(&[self.id], timeout)?;
        match outcome.error(self.id) {
            Some(ErrorCode::InvalidSubscriptionId) => {
                Err(BrokerError::InvalidSubscriptionId(self.id))
            }
            Some(ErrorCode::PollActive) => Err(BrokerError::PollActive(self.id)),
            None => Ok(outcome.documents(self.id)),
        }
    }

    pub fn unsubscribe(self) -> Result<()> {
        let errors = self.client.unsubscribe(&[self.id])?;
        match errors.get(&self.id) {
            Some(_) => Err(BrokerError::InvalidSubscriptionId(self.id)),
            None => Ok(()),
        }
    }
}
