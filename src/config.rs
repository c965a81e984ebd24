//! Broker configuration and runtime parameters.

use crate::error::{BrokerError, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Idle threshold and poll cap used when `quick_timeout` is set.
pub const QUICK_TIMEOUT: Duration = Duration::from_millis(100);

/// Parameter name for the change-event toggle.
pub const PUBLISH_DATA_EVENTS: &str = "publishDataEvents";

/// Parameter name for the idle-expiry threshold, in milliseconds.
pub const SUBSCRIPTION_IDLE_TIMEOUT_MS: &str = "pubsubIdleTimeoutMillis";

/// Parameter name for the test override shrinking every long timeout.
pub const QUICK_PUBSUB_TIMEOUT: &str = "quickPubsubTimeout";

/// Broker configuration.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Name used to derive this node's id (None = generated).
    pub node_name: Option<String>,

    /// Subscriptions not polled for this long are expired.
    /// Default: 10 minutes
    pub idle_timeout: Duration,

    /// Length of one internal wait cycle inside a blocking poll.
    /// Default: 100ms
    pub poll_interval: Duration,

    /// Longest time a single poll call blocks before answering `pollAgain`.
    /// Default: 10 minutes
    pub max_poll_duration: Duration,

    /// Whether data-mutation events are published at startup.
    pub publish_data_events: bool,

    /// Shrink the idle threshold and poll cap to [`QUICK_TIMEOUT`].
    pub quick_timeout: bool,

    /// Number of recent relay frames remembered for duplicate suppression.
    pub relay_dedup_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            node_name: None,
            idle_timeout: Duration::from_secs(10 * 60),
            poll_interval: Duration::from_millis(100),
            max_poll_duration: Duration::from_secs(10 * 60),
            publish_data_events: false,
            quick_timeout: false,
            relay_dedup_capacity: 4096,
        }
    }
}

impl BrokerConfig {
    /// Configuration with every long timeout shortened, for tests.
    pub fn quick() -> Self {
        Self {
            quick_timeout: true,
            ..Default::default()
        }
    }
}

/// Runtime-adjustable parameters shared by the broker's components.
#[derive(Debug)]
pub struct ServerParameters {
    publish_data_events: AtomicBool,
    idle_timeout_ms: AtomicU64,
    max_poll_ms: AtomicU64,
    quick_timeout: AtomicBool,
    /// Thresholds restored when the quick override is switched off.
    configured_idle_ms: u64,
    configured_max_poll_ms: u64,
}

impl ServerParameters {
    pub fn from_config(config: &BrokerConfig) -> Self {
        let params = Self {
            publish_data_events: AtomicBool::new(config.publish_data_events),
            idle_timeout_ms: AtomicU64::new(duration_ms(config.idle_timeout).max(1)),
            max_poll_ms: AtomicU64::new(duration_ms(config.max_poll_duration)),
            quick_timeout: AtomicBool::new(false),
            configured_idle_ms: duration_ms(config.idle_timeout).max(1),
            configured_max_poll_ms: duration_ms(config.max_poll_duration),
        };
        params.set_quick_timeout(config.quick_timeout);
        params
    }

    pub fn publish_data_events(&self) -> bool {
        self.publish_data_events.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn set_publish_data_events(&self, enabled: bool) -> bool {
        self.publish_data_events.swap(enabled, Ordering::SeqCst)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.load(Ordering::SeqCst))
    }

    pub fn set_idle_timeout(&self, timeout: Duration) {
        self.idle_timeout_ms
            .store(duration_ms(timeout).max(1), Ordering::SeqCst);
    }

    /// Cap on a single blocking poll: never longer than the idle threshold.
    pub fn poll_cap(&self) -> Duration {
        self.idle_timeout()
            .min(Duration::from_millis(self.max_poll_ms.load(Ordering::SeqCst)))
    }

    pub fn quick_timeout(&self) -> bool {
        self.quick_timeout.load(Ordering::SeqCst)
    }

    /// Shrink the idle threshold and poll cap to [`QUICK_TIMEOUT`], or restore
    /// the configured values. Returns the previous setting.
    pub fn set_quick_timeout(&self, quick: bool) -> bool {
        let (idle, max_poll) = if quick {
            (duration_ms(QUICK_TIMEOUT), duration_ms(QUICK_TIMEOUT))
        } else {
            (self.configured_idle_ms, self.configured_max_poll_ms)
        };
        self.idle_timeout_ms.store(idle, Ordering::SeqCst);
        self.max_poll_ms.store(max_poll, Ordering::SeqCst);
        self.quick_timeout.swap(quick, Ordering::SeqCst)
    }

    /// Apply a named parameter. Returns the previous value.
    pub fn set(&self, name: &str, value: &Value) -> Result<Value> {
        match name {
            PUBLISH_DATA_EVENTS => {
                let enabled = as_bool(value).ok_or_else(|| {
                    BrokerError::UnknownParameter(format!("{name} expects a bool"))
                })?;
                Ok(Value::Bool(self.set_publish_data_events(enabled)))
            }
            SUBSCRIPTION_IDLE_TIMEOUT_MS => {
                let ms = value.as_u64().ok_or_else(|| {
                    BrokerError::UnknownParameter(format!("{name} expects a positive integer"))
                })?;
                let previous = self.get(name)?;
                self.set_idle_timeout(Duration::from_millis(ms));
                Ok(previous)
            }
            QUICK_PUBSUB_TIMEOUT => {
                let quick = as_bool(value).ok_or_else(|| {
                    BrokerError::UnknownParameter(format!("{name} expects a bool"))
                })?;
                Ok(Value::Bool(self.set_quick_timeout(quick)))
            }
            other => Err(BrokerError::UnknownParameter(other.to_string())),
        }
    }

    /// Read a named parameter.
    pub fn get(&self, name: &str) -> Result<Value> {
        match name {
            PUBLISH_DATA_EVENTS => Ok(Value::Bool(self.publish_data_events())),
            SUBSCRIPTION_IDLE_TIMEOUT_MS => Ok(Value::from(duration_ms(self.idle_timeout()))),
            QUICK_PUBSUB_TIMEOUT => Ok(Value::Bool(self.quick_timeout())),
            other => Err(BrokerError::UnknownParameter(other.to_string())),
        }
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        _ => None,
    }
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let params = ServerParameters::from_config(&BrokerConfig::default());
        assert!(!params.publish_data_events());
        assert_eq!(params.idle_timeout(), Duration::from_secs(600));
        assert_eq!(params.poll_cap(), Duration::from_secs(600));
    }

    #[test]
    fn test_quick_timeout_shrinks_idle_and_cap() {
        let params = ServerParameters::from_config(&BrokerConfig::quick());
        assert_eq!(params.idle_timeout(), QUICK_TIMEOUT);
        assert_eq!(params.poll_cap(), QUICK_TIMEOUT);
    }

    #[test]
    fn test_poll_cap_never_exceeds_idle_timeout() {
        let params = ServerParameters::from_config(&BrokerConfig::default());
        params.set_idle_timeout(Duration::from_millis(250));
        assert_eq!(params.poll_cap(), Duration::from_millis(250));
    }

    #[test]
    fn test_set_and_get_by_name() {
        let params = ServerParameters::from_config(&BrokerConfig::default());
        let prev = params.set(PUBLISH_DATA_EVENTS, &json!(true)).unwrap();
        assert_eq!(prev, json!(false));
        assert_eq!(params.get(PUBLISH_DATA_EVENTS).unwrap(), json!(true));

        params.set(SUBSCRIPTION_IDLE_TIMEOUT_MS, &json!(500)).unwrap();
        assert_eq!(params.idle_timeout(), Duration::from_millis(500));

        params.set(QUICK_PUBSUB_TIMEOUT, &json!(1)).unwrap();
        assert_eq!(params.idle_timeout(), QUICK_TIMEOUT);

        assert!(matches!(
            params.set("bogus", &json!(1)),
            Err(BrokerError::UnknownParameter(_))
        ));
        assert!(params.set(PUBLISH_DATA_EVENTS, &json!("yes")).is_err());
    }

    #[test]
    fn test_quick_timeout_can_be_switched_off() {
        let params = ServerParameters::from_config(&BrokerConfig::default());
        assert_eq!(params.get(QUICK_PUBSUB_TIMEOUT).unwrap(), json!(false));

        assert_eq!(params.set(QUICK_PUBSUB_TIMEOUT, &json!(true)).unwrap(), json!(false));
        assert_eq!(params.get(QUICK_PUBSUB_TIMEOUT).unwrap(), json!(true));
        assert_eq!(params.poll_cap(), QUICK_TIMEOUT);

        assert_eq!(params.set(QUICK_PUBSUB_TIMEOUT, &json!(false)).unwrap(), json!(true));
        assert_eq!(params.get(QUICK_PUBSUB_TIMEOUT).unwrap(), json!(false));
        assert_eq!(params.idle_timeout(), Duration::from_secs(600));
        assert_eq!(params.poll_cap(), Duration::from_secs(600));
    }

    #[test]
    fn test_quick_config_restores_configured_thresholds() {
        let params = ServerParameters::from_config(&BrokerConfig {
            idle_timeout: Duration::from_secs(30),
            quick_timeout: true,
            ..Default::default()
        });
        assert!(params.quick_timeout());
        assert_eq!(params.idle_timeout(), QUICK_TIMEOUT);

        assert!(params.set_quick_timeout(false));
        assert_eq!(params.idle_timeout(), Duration::from_secs(30));
        assert_eq!(params.poll_cap(), Duration::from_secs(30));
    }
}
