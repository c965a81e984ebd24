//! Property tests for delivery, filtering, and projection.

use channelcast::{Broker, BrokerConfig, Document};
use proptest::prelude::*;
use serde_json::{json, Value};

fn doc(v: Value) -> Document {
    v.as_object().cloned().unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A subscriber receives exactly the published messages its filter accepts,
    /// in publish order.
    #[test]
    fn filter_soundness(counts in prop::collection::vec(-50i64..50, 0..40), threshold in -50i64..50) {
        let broker = Broker::new(BrokerConfig::default());
        let all = broker.subscribe("A", None, None).unwrap();
        let filtered = broker
            .subscribe("A", Some(doc(json!({"count": {"$gt": threshold}}))), None)
            .unwrap();

        for count in &counts {
            broker.publish("A", doc(json!({"count": count}))).unwrap();
        }

        let outcome = broker.poll(&[all, filtered], None);
        let seen: Vec<i64> = outcome
            .documents(all)
            .iter()
            .map(|m| m["count"].as_i64().unwrap())
            .collect();
        prop_assert_eq!(&seen, &counts);

        let expected: Vec<i64> = counts.iter().copied().filter(|c| *c > threshold).collect();
        let got: Vec<i64> = outcome
            .documents(filtered)
            .iter()
            .map(|m| m["count"].as_i64().unwrap())
            .collect();
        prop_assert_eq!(got, expected);
    }

    /// Excluded fields never appear in delivered messages.
    #[test]
    fn projection_exactness(
        fields in prop::collection::btree_map("[a-e]", any::<i32>(), 1..5),
        excluded in "[a-e]",
    ) {
        let broker = Broker::new(BrokerConfig::default());
        let mut projection = Document::new();
        projection.insert(excluded.clone(), json!(0));
        let id = broker.subscribe("A", None, Some(projection)).unwrap();

        let message: Document = fields
            .iter()
            .map(|(k, v)| (k.clone(), json!(v)))
            .collect();
        broker.publish("A", message.clone()).unwrap();

        let delivered = broker.poll(&[id], None).documents(id);
        prop_assert_eq!(delivered.len(), 1);
        prop_assert!(!delivered[0].contains_key(&excluded));
        for (k, v) in &message {
            if *k != excluded {
                prop_assert_eq!(delivered[0].get(k), Some(v));
            }
        }
    }

    /// Subscriptions created after a publish never see it.
    #[test]
    fn late_subscribers_see_nothing(before in 0usize..10, after in 0usize..10) {
        let broker = Broker::new(BrokerConfig::default());
        for i in 0..before {
            broker.publish("A", doc(json!({"i": i}))).unwrap();
        }
        let id = broker.subscribe("A", None, None).unwrap();
        for i in 0..after {
            broker.publish("A", doc(json!({"i": i}))).unwrap();
        }
        prop_assert_eq!(broker.poll(&[id], None).documents(id).len(), after);
    }
}
