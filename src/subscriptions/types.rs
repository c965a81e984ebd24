//! Subscription state and snapshots.

use crate::error::ErrorCode;
use crate::types::{Document, SubscriptionId, Timestamp};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Lifecycle state of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Active,
    /// Removed by the idle sweep.
    Expired,
    /// Removed by unsubscribe.
    Removed,
}

/// A message waiting in a subscription queue.
#[derive(Clone, Debug, PartialEq)]
pub struct QueuedMessage {
    /// Channel the message was published on (may be longer than the
    /// subscribed channel for event prefix subscriptions).
    pub channel: String,
    /// Filtered and projected message body.
    pub message: Document,
}

/// Point-in-time view of a subscription, for diagnostics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub id: SubscriptionId,
    pub channel: String,
    pub state: SubscriptionState,
    pub active_poll: bool,
    pub queued: usize,
    pub created: Timestamp,
    /// Milliseconds since the last poll (or creation).
    pub idle_ms: u64,
}

struct SubscriptionInner {
    state: SubscriptionState,
    queue: VecDeque<QueuedMessage>,
    last_activity: Instant,
    active_poll: bool,
    /// Wake signal installed by the poll currently holding this subscription.
    waker: Option<Sender<()>>,
}

impl SubscriptionInner {
    fn wake(&self) {
        if let Some(ref waker) = self.waker {
            // A full slot already means "wake up"; nothing to add.
            let _ = waker.try_send(());
        }
    }
}

/// One consumer's registration to a channel.
pub struct Subscription {
    id: SubscriptionId,
    channel: String,
    filter: Option<Document>,
    projection: Option<Document>,
    created: Timestamp,
    inner: Mutex<SubscriptionInner>,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        channel: String,
        filter: Option<Document>,
        projection: Option<Document>,
    ) -> Self {
        Self {
            id,
            channel,
            filter,
            projection,
            created: Timestamp::now(),
            inner: Mutex::new(SubscriptionInner {
                state: SubscriptionState::Active,
                queue: VecDeque::new(),
                last_activity: Instant::now(),
                active_poll: false,
                waker: None,
            }),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn filter(&self) -> Option<&Document> {
        self.filter.as_ref()
    }

    pub fn projection(&self) -> Option<&Document> {
        self.projection.as_ref()
    }

    pub fn state(&self) -> SubscriptionState {
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == SubscriptionState::Active
    }

    /// Append a message. Returns false if the subscription is no longer active.
    pub(crate) fn deliver(&self, channel: &str, message: Document) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SubscriptionState::Active {
            return false;
        }
        inner.queue.push_back(QueuedMessage {
            channel: channel.to_string(),
            message,
        });
        inner.wake();
        true
    }

    /// Claim the subscription for one poll call.
    pub(crate) fn check_out(&self, waker: Sender<()>) -> Result<(), ErrorCode> {
        let mut inner = self.inner.lock();
        if inner.state != SubscriptionState::Active {
            return Err(ErrorCode::InvalidSubscriptionId);
        }
        if inner.active_poll {
            return Err(ErrorCode::PollActive);
        }
        inner.active_poll = true;
        inner.last_activity = Instant::now();
        inner.waker = Some(waker);
        Ok(())
    }

    /// Release the poll claim and record the activity.
    pub(crate) fn check_in(&self) {
        let mut inner = self.inner.lock();
        inner.active_poll = false;
        inner.waker = None;
        inner.last_activity = Instant::now();
    }

    pub(crate) fn touch(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SubscriptionState::Active {
            return false;
        }
        inner.last_activity = Instant::now();
        true
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.inner.lock().queue.is_empty()
    }

    /// Take every queued message, oldest first.
    pub(crate) fn drain(&self) -> Vec<QueuedMessage> {
        self.inner.lock().queue.drain(..).collect()
    }

    /// Move out of `Active`. Only the first caller succeeds; a blocked poll
    /// holding this subscription is woken.
    pub(crate) fn terminate(&self, state: SubscriptionState) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SubscriptionState::Active {
            return false;
        }
        inner.state = state;
        inner.queue.clear();
        inner.wake();
        true
    }

    /// Expire if idle for longer than `idle_timeout` and not being polled.
    pub(crate) fn expire_if_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SubscriptionState::Active || inner.active_poll {
            return false;
        }
        if now.saturating_duration_since(inner.last_activity) <= idle_timeout {
            return false;
        }
        inner.state = SubscriptionState::Expired;
        inner.queue.clear();
        true
    }

    pub fn snapshot(&self) -> SubscriptionSnapshot {
        let inner = self.inner.lock();
        SubscriptionSnapshot {
            id: self.id,
            channel: self.channel.clone(),
            state: inner.state,
            active_poll: inner.active_poll,
            queued: inner.queue.len(),
            created: self.created,
            idle_ms: inner.last_activity.elapsed().as_millis() as u64,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use serde_json::json;

    fn sub() -> Subscription {
        Subscription::new(SubscriptionId::from_parts(1, 1, 1), "A".into(), None, None)
    }

    fn msg(v: i64) -> Document {
        json!({ "a": v }).as_object().cloned().unwrap()
    }

    #[test]
    fn test_deliver_and_drain_in_order() {
        let s = sub();
        assert!(s.deliver("A", msg(1)));
        assert!(s.deliver("A", msg(2)));
        let drained = s.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].message, msg(1));
        assert_eq!(drained[1].message, msg(2));
        assert!(!s.has_pending());
    }

    #[test]
    fn test_single_checkout() {
        let s = sub();
        let (tx, _rx) = bounded(1);
        assert!(s.check_out(tx.clone()).is_ok());
        assert_eq!(s.check_out(tx.clone()), Err(ErrorCode::PollActive));
        s.check_in();
        assert!(s.check_out(tx).is_ok());
    }

    #[test]
    fn test_deliver_wakes_poller() {
        let s = sub();
        let (tx, rx) = bounded(1);
        s.check_out(tx).unwrap();
        s.deliver("A", msg(1));
        s.deliver("A", msg(2));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_terminate_once() {
        let s = sub();
        let (tx, rx) = bounded(1);
        s.check_out(tx).unwrap();
        s.deliver("A", msg(1));
        let _ = rx.try_recv();

        assert!(s.terminate(SubscriptionState::Removed));
        assert!(!s.terminate(SubscriptionState::Expired));
        assert_eq!(s.state(), SubscriptionState::Removed);
        assert!(rx.try_recv().is_ok());
        assert!(!s.has_pending());
        assert!(!s.deliver("A", msg(3)));
        let (tx, _rx) = bounded(1);
        assert_eq!(s.check_out(tx), Err(ErrorCode::InvalidSubscriptionId));
    }

    #[test]
    fn test_active_poll_blocks_expiry() {
        let s = sub();
        let (tx, _rx) = bounded(1);
        s.check_out(tx).unwrap();
        let later = Instant::now() + Duration::from_secs(60);
        assert!(!s.expire_if_idle(later, Duration::from_millis(1)));
        s.check_in();
        assert!(s.expire_if_idle(later, Duration::from_millis(1)));
        assert_eq!(s.state(), SubscriptionState::Expired);
    }

    #[test]
    fn test_recent_activity_prevents_expiry() {
        let s = sub();
        assert!(!s.expire_if_idle(Instant::now(), Duration::from_secs(60)));
        assert!(s.is_active());
    }
}
