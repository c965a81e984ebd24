//! Channel index and message routing.
//!
//! Literal channel names match publishes to exactly that name. Channels under
//! the reserved [`EVENT_CHANNEL_PREFIX`] are matched by prefix at `.` segment
//! boundaries, so a subscription to `$event.test.pubsub.` sees
//! `$event.test.pubsub.insert`, `.update`, and `.remove`.

mod table;

pub use table::ChannelTable;

/// Reserved prefix for system-generated change-event channels.
pub const EVENT_CHANNEL_PREFIX: &str = "$event";

/// Whether `channel` lives in the reserved change-event namespace.
pub fn is_event_channel(channel: &str) -> bool {
    channel.starts_with(EVENT_CHANNEL_PREFIX)
}

/// Channel names whose subscribers receive a publish to `channel`.
pub(crate) fn routing_keys(channel: &str) -> Vec<&str> {
    let mut keys = vec![channel];
    if is_event_channel(channel) {
        for (i, _) in channel.match_indices('.') {
            keys.push(&channel[..i]);
            keys.push(&channel[..=i]);
        }
        keys.sort_unstable();
        keys.dedup();
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_channels_route_to_themselves() {
        assert_eq!(routing_keys("A"), vec!["A"]);
        assert_eq!(routing_keys("a.b"), vec!["a.b"]);
    }

    #[test]
    fn test_event_channels_route_to_segment_prefixes() {
        let keys = routing_keys("$event.test.pubsub.insert");
        for expected in [
            "$event",
            "$event.",
            "$event.test",
            "$event.test.",
            "$event.test.pubsub",
            "$event.test.pubsub.",
            "$event.test.pubsub.insert",
        ] {
            assert!(keys.contains(&expected), "missing {expected}");
        }
        assert!(!keys.contains(&"$event.te"));
    }
}
