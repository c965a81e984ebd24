//! Subscription registry: owns every live subscription by id.

use crate::channels::ChannelTable;
use crate::error::{BrokerError, ErrorCode, Result};
use crate::types::{Document, IdGenerator, SubscriptionId};
use crossbeam_channel::Sender;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::types::{Subscription, SubscriptionSnapshot, SubscriptionState};

/// Owns all live subscriptions and keeps the channel index in step with them.
pub struct SubscriptionRegistry {
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<Subscription>>>,
    channels: Arc<ChannelTable>,
    ids: IdGenerator,
    expired: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new(channels: Arc<ChannelTable>, ids: IdGenerator) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            channels,
            ids,
            expired: AtomicU64::new(0),
        }
    }

    /// Register a new active subscription and bind it to its channel.
    pub fn create(
        &self,
        channel: &str,
        filter: Option<Document>,
        projection: Option<Document>,
    ) -> Arc<Subscription> {
        let id = self.ids.next();
        let subscription = Arc::new(Subscription::new(
            id,
            channel.to_string(),
            filter,
            projection,
        ));

        self.subscriptions.write().insert(id, subscription.clone());
        self.channels.bind(subscription.clone());

        debug!(%id, channel, "subscription created");
        subscription
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        self.subscriptions.read().get(&id).cloned()
    }

    /// Remove a subscription, releasing any poll blocked on it.
    ///
    /// Fails with `InvalidSubscriptionId` if the id is unknown or another
    /// removal (unsubscribe or expiry) got there first.
    pub fn remove(&self, id: SubscriptionId) -> Result<()> {
        let subscription = self
            .get(id)
            .ok_or(BrokerError::InvalidSubscriptionId(id))?;
        if !subscription.terminate(SubscriptionState::Removed) {
            return Err(BrokerError::InvalidSubscriptionId(id));
        }
        self.detach(&subscription);
        debug!(%id, channel = subscription.channel(), "subscription removed");
        Ok(())
    }

    /// Remove each id independently. Returns the ids that failed.
    pub fn remove_many(&self, ids: &[SubscriptionId]) -> BTreeMap<SubscriptionId, ErrorCode> {
        let mut errors = BTreeMap::new();
        for &id in ids {
            if let Err(e) = self.remove(id) {
                if let Some(code) = e.per_id_code() {
                    errors.insert(id, code);
                }
            }
        }
        errors
    }

    /// Refresh the idle clock of a subscription.
    pub fn touch(&self, id: SubscriptionId) -> Result<()> {
        match self.get(id) {
            Some(sub) if sub.touch() => Ok(()),
            _ => Err(BrokerError::InvalidSubscriptionId(id)),
        }
    }

    /// Claim every id for one poll call.
    ///
    /// Ids that are unknown or already being polled are reported in the error
    /// map; the rest are returned as leases that release on drop. Repeated ids
    /// are claimed once.
    pub fn checkout(
        &self,
        ids: &[SubscriptionId],
        waker: &Sender<()>,
    ) -> (Vec<PollLease>, BTreeMap<SubscriptionId, ErrorCode>) {
        let mut leases = Vec::with_capacity(ids.len());
        let mut errors = BTreeMap::new();
        let mut seen = HashSet::with_capacity(ids.len());

        for &id in ids {
            if !seen.insert(id) {
                continue;
            }
            let Some(subscription) = self.get(id) else {
                errors.insert(id, ErrorCode::InvalidSubscriptionId);
                continue;
            };
            match subscription.check_out(waker.clone()) {
                Ok(()) => leases.push(PollLease { subscription }),
                Err(code) => {
                    errors.insert(id, code);
                }
            }
        }
        (leases, errors)
    }

    /// Expire every subscription idle for longer than `idle_timeout`.
    ///
    /// Subscriptions with a poll in progress are skipped.
    pub fn sweep(&self, idle_timeout: Duration) -> Vec<SubscriptionId> {
        let candidates: Vec<Arc<Subscription>> =
            self.subscriptions.read().values().cloned().collect();
        let now = Instant::now();

        let mut expired = Vec::new();
        for subscription in candidates {
            if subscription.expire_if_idle(now, idle_timeout) {
                self.detach(&subscription);
                info!(
                    id = %subscription.id(),
                    channel = subscription.channel(),
                    "subscription expired after idle timeout"
                );
                expired.push(subscription.id());
            }
        }
        self.expired
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired
    }

    fn detach(&self, subscription: &Subscription) {
        self.subscriptions.write().remove(&subscription.id());
        self.channels
            .unbind(subscription.channel(), subscription.id());
    }

    /// Diagnostic view of every live subscription, ordered by id.
    pub fn snapshot(&self) -> Vec<SubscriptionSnapshot> {
        let subs: Vec<Arc<Subscription>> = self.subscriptions.read().values().cloned().collect();
        let mut out: Vec<SubscriptionSnapshot> = subs.iter().map(|s| s.snapshot()).collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of subscriptions expired since startup.
    pub fn expired_count(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }
}

/// Exclusive claim on a subscription for the duration of a poll.
///
/// Dropping the lease clears the active-poll flag and refreshes the idle
/// clock, even if the poll unwinds.
pub struct PollLease {
    subscription: Arc<Subscription>,
}

impl PollLease {
    pub fn id(&self) -> SubscriptionId {
        self.subscription.id()
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

impl Drop for PollLease {
    fn drop(&mut self) {
        self.subscription.check_in();
    }
}
