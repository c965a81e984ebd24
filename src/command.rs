//! Document command protocol.
//!
//! Commands are documents naming the operation by key, in the shape
//! `{ publish: 1, channel: "A", message: {...} }`. Replies carry `ok: 1` on
//! success or `ok: 0, errmsg, code` when the whole command is rejected.
//! Subscription ids travel as `{"$oid": "<24 hex>"}`; `subscriptionId` may be
//! one id or an array of ids.

use crate::broker::{Broker, ChannelMessages, PollOutcome};
use crate::error::{BrokerError, ErrorCode, Result};
use crate::types::{type_name, Document, SubscriptionId};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

pub const PUBLISH: &str = "publish";
pub const SUBSCRIBE: &str = "subscribe";
pub const POLL: &str = "poll";
pub const UNSUBSCRIBE: &str = "unsubscribe";
pub const VIEW_SUBSCRIPTIONS: &str = "viewSubscriptions";
pub const SET_PARAMETER: &str = "setParameter";
pub const GET_PARAMETER: &str = "getParameter";

const COMMANDS: [&str; 7] = [
    PUBLISH,
    SUBSCRIBE,
    POLL,
    UNSUBSCRIBE,
    VIEW_SUBSCRIPTIONS,
    SET_PARAMETER,
    GET_PARAMETER,
];

pub const CHANNEL_FIELD: &str = "channel";
pub const MESSAGE_FIELD: &str = "message";
pub const FILTER_FIELD: &str = "filter";
pub const PROJECTION_FIELD: &str = "projection";
pub const SUBSCRIPTION_ID_FIELD: &str = "subscriptionId";
pub const TIMEOUT_FIELD: &str = "timeout";

impl Broker {
    /// Execute one command document and build its reply.
    pub fn run_command(&self, command: &Document) -> Document {
        let Some(name) = COMMANDS.iter().copied().find(|c| command.contains_key(*c)) else {
            let found = command.keys().next().cloned().unwrap_or_default();
            return error_reply(&BrokerError::UnknownCommand(found), None);
        };

        let result = match name {
            PUBLISH => self.publish_command(command),
            SUBSCRIBE => self.subscribe_command(command),
            POLL => self.poll_command(command),
            UNSUBSCRIBE => self.unsubscribe_command(command),
            VIEW_SUBSCRIPTIONS => Ok(self.view_subscriptions_command()),
            SET_PARAMETER => self.set_parameter_command(command),
            _ => self.get_parameter_command(command),
        };

        match result {
            Ok(mut reply) => {
                reply.insert("ok".into(), json!(1));
                reply
            }
            Err(e) => {
                debug!(command = name, error = %e, "command rejected");
                error_reply(&e, Some(name))
            }
        }
    }

    fn publish_command(&self, command: &Document) -> Result<Document> {
        let channel = channel_arg(command)?;
        let message = match command.get(MESSAGE_FIELD) {
            None => return Err(BrokerError::NoMessage),
            Some(Value::Object(message)) => message.clone(),
            Some(other) => {
                return Err(BrokerError::BadMessage {
                    found: type_name(other),
                })
            }
        };
        self.publish(channel, message)?;
        Ok(Document::new())
    }

    fn subscribe_command(&self, command: &Document) -> Result<Document> {
        let channel = channel_arg(command)?;
        let filter = optional_document(command, FILTER_FIELD)
            .map_err(|found| BrokerError::BadFilterType { found })?;
        let projection = optional_document(command, PROJECTION_FIELD)
            .map_err(|found| BrokerError::BadProjectionType { found })?;

        let id = self.subscribe(channel, filter, projection)?;
        let mut reply = Document::new();
        reply.insert(SUBSCRIPTION_ID_FIELD.into(), id.to_value());
        Ok(reply)
    }

    fn poll_command(&self, command: &Document) -> Result<Document> {
        let ids = subscription_ids(command)?;
        let timeout = match command.get(TIMEOUT_FIELD) {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => {
                let ms = n.as_f64().unwrap_or(0.0);
                // Negative waits mean "as long as the server allows".
                Some(if ms < 0.0 {
                    Duration::MAX
                } else {
                    Duration::from_millis(ms as u64)
                })
            }
            Some(other) => {
                return Err(BrokerError::BadTimeout {
                    found: type_name(other),
                })
            }
        };
        Ok(poll_reply(&self.poll(&ids, timeout)))
    }

    fn unsubscribe_command(&self, command: &Document) -> Result<Document> {
        let ids = subscription_ids(command)?;
        let errors = self.unsubscribe(&ids);
        let mut reply = Document::new();
        if !errors.is_empty() {
            reply.insert("errors".into(), errors_value(&errors));
        }
        Ok(reply)
    }

    fn view_subscriptions_command(&self) -> Document {
        let subs: Document = self
            .view_subscriptions()
            .into_iter()
            .map(|s| {
                let view = json!({
                    "channel": s.channel,
                    "activePoll": s.active_poll,
                    "state": s.state,
                    "queued": s.queued,
                    "idleMillis": s.idle_ms,
                });
                (s.id.to_hex(), view)
            })
            .collect();
        let mut reply = Document::new();
        reply.insert("subs".into(), Value::Object(subs));
        reply
    }

    fn set_parameter_command(&self, command: &Document) -> Result<Document> {
        let mut params = command.iter().filter(|(k, _)| k.as_str() != SET_PARAMETER);
        let (name, value) = params
            .next()
            .ok_or_else(|| BrokerError::UnknownParameter("no parameter given".into()))?;
        let previous = self.set_parameter(name, value)?;
        let mut reply = Document::new();
        reply.insert("was".into(), previous);
        Ok(reply)
    }

    fn get_parameter_command(&self, command: &Document) -> Result<Document> {
        command
            .keys()
            .filter(|k| k.as_str() != GET_PARAMETER)
            .map(|name| Ok((name.clone(), self.get_parameter(name)?)))
            .collect()
    }
}

fn error_reply(error: &BrokerError, command: Option<&str>) -> Document {
    let mut reply = Document::new();
    reply.insert("ok".into(), json!(0));
    reply.insert("errmsg".into(), json!(error.to_string()));
    reply.insert("code".into(), json!(code_for(command, error)));
    reply
}

/// Numeric code for a rejected command. Subscribe and unsubscribe report
/// argument errors under their own codes.
pub fn code_for(command: Option<&str>, error: &BrokerError) -> i32 {
    match (command, error) {
        (Some(SUBSCRIBE), BrokerError::NoChannel) => 18553,
        (Some(SUBSCRIBE), BrokerError::BadChannel { .. }) => 18531,
        (Some(UNSUBSCRIBE), BrokerError::NoSubscriptionId) => 18554,
        (Some(UNSUBSCRIBE), BrokerError::BadSubscriptionIdType { .. }) => 18532,
        (Some(UNSUBSCRIBE), BrokerError::BadSubscriptionIdArrayType { .. }) => 18545,
        _ => error.code(),
    }
}

fn channel_arg(command: &Document) -> Result<&str> {
    match command.get(CHANNEL_FIELD) {
        None => Err(BrokerError::NoChannel),
        Some(Value::String(channel)) => Ok(channel),
        Some(other) => Err(BrokerError::BadChannel {
            found: type_name(other),
        }),
    }
}

/// `Err` carries the type name of a present, non-document value.
fn optional_document(
    command: &Document,
    field: &str,
) -> std::result::Result<Option<Document>, &'static str> {
    match command.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(obj)) => Ok(Some(obj.clone())),
        Some(other) => Err(type_name(other)),
    }
}

/// Normalize a single id or an array of ids into a list.
pub fn subscription_ids(command: &Document) -> Result<Vec<SubscriptionId>> {
    let value = command
        .get(SUBSCRIPTION_ID_FIELD)
        .ok_or(BrokerError::NoSubscriptionId)?;
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| {
                SubscriptionId::from_value(item).ok_or(BrokerError::BadSubscriptionIdArrayType {
                    found: type_name(item),
                })
            })
            .collect(),
        other => SubscriptionId::from_value(other)
            .map(|id| vec![id])
            .ok_or(BrokerError::BadSubscriptionIdType {
                found: type_name(other),
            }),
    }
}

fn errors_value(errors: &BTreeMap<SubscriptionId, ErrorCode>) -> Value {
    Value::Object(
        errors
            .iter()
            .map(|(id, code)| (id.to_hex(), json!(code.as_str())))
            .collect(),
    )
}

/// Reply body for a poll: `messages` always, `errors` when non-empty,
/// `pollAgain` only when set.
pub fn poll_reply(outcome: &PollOutcome) -> Document {
    let messages: Document = outcome
        .messages
        .iter()
        .map(|(id, by_channel)| {
            let channels: Document = by_channel
                .iter()
                .map(|(channel, docs)| {
                    let docs = docs.iter().cloned().map(Value::Object).collect();
                    (channel.clone(), Value::Array(docs))
                })
                .collect();
            (id.to_hex(), Value::Object(channels))
        })
        .collect();

    let mut reply = Document::new();
    reply.insert("messages".into(), Value::Object(messages));
    if !outcome.errors.is_empty() {
        reply.insert("errors".into(), errors_value(&outcome.errors));
    }
    reply.insert("millisPolled".into(), json!(outcome.millis_polled));
    if outcome.poll_again {
        reply.insert("pollAgain".into(), json!(true));
    }
    reply
}

fn malformed(what: &str) -> BrokerError {
    BrokerError::Deserialization(format!("malformed poll reply: {what}"))
}

/// Rebuild a [`PollOutcome`] from a poll reply.
pub fn parse_poll_reply(reply: &Document) -> Result<PollOutcome> {
    let mut outcome = PollOutcome::default();

    if let Some(messages) = reply.get("messages") {
        let messages = messages.as_object().ok_or_else(|| malformed("messages"))?;
        for (hex, by_channel) in messages {
            let id = SubscriptionId::from_hex(hex).map_err(|_| malformed("message id"))?;
            let by_channel = by_channel.as_object().ok_or_else(|| malformed("channel map"))?;
            let mut parsed = ChannelMessages::new();
            for (channel, docs) in by_channel {
                let docs = docs
                    .as_array()
                    .ok_or_else(|| malformed("message list"))?
                    .iter()
                    .map(|d| d.as_object().cloned().ok_or_else(|| malformed("message")))
                    .collect::<Result<Vec<_>>>()?;
                parsed.insert(channel.clone(), docs);
            }
            outcome.messages.insert(id, parsed);
        }
    }

    if let Some(errors) = reply.get("errors") {
        let errors = errors.as_object().ok_or_else(|| malformed("errors"))?;
        for (hex, code) in errors {
            let id = SubscriptionId::from_hex(hex).map_err(|_| malformed("error id"))?;
            let code = code
                .as_str()
                .and_then(ErrorCode::parse)
                .ok_or_else(|| malformed("error code"))?;
            outcome.errors.insert(id, code);
        }
    }

    outcome.poll_again = reply.get("pollAgain").and_then(Value::as_bool).unwrap_or(false);
    outcome.millis_polled = reply.get("millisPolled").and_then(Value::as_u64).unwrap_or(0);
    Ok(outcome)
}

/// Rebuild a per-id error map from an unsubscribe reply.
pub fn parse_errors(reply: &Document) -> Result<BTreeMap<SubscriptionId, ErrorCode>> {
    let mut out = BTreeMap::new();
    if let Some(errors) = reply.get("errors").and_then(Value::as_object) {
        for (hex, code) in errors {
            let id = SubscriptionId::from_hex(hex).map_err(|_| malformed("error id"))?;
            let code = code
                .as_str()
                .and_then(ErrorCode::parse)
                .ok_or_else(|| malformed("error code"))?;
            out.insert(id, code);
        }
    }
    Ok(out)
}
