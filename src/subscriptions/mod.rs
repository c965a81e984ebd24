//! Subscriptions and their lifecycle.
//!
//! A subscription is created `Active` with an empty queue, receives copies of
//! matching publishes on its channel, and is drained by polls. It leaves the
//! `Active` state exactly once: `Removed` through unsubscribe or `Expired`
//! through the idle sweep. Its id is never valid again after that.
//!
//! Polls claim subscriptions through [`PollLease`]s, which enforce a single
//! active poll per subscription and keep it safe from expiry:
//!
//! ```ignore
//! let (waker, signal) = crossbeam_channel::bounded(1);
//! let (leases, errors) = registry.checkout(&ids, &waker);
//! for lease in &leases {
//!     for queued in lease.subscription().drain() {
//!         println!("{}: {:?}", queued.channel, queued.message);
//!     }
//! }
//! // leases drop here: activePoll cleared, idle clock refreshed
//! ```

mod manager;
mod sweeper;
mod types;

pub use manager::{PollLease, SubscriptionRegistry};
pub use sweeper::IdleSweeper;
pub use types::{QueuedMessage, Subscription, SubscriptionSnapshot, SubscriptionState};
