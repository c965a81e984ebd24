//! Core types for the broker.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A message, filter, or projection document.
pub type Document = serde_json::Map<String, Value>;

/// Name of the JSON type of a value, as reported in argument errors.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "double",
        Value::Number(_) => "long",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(obj) if obj.contains_key(OID_KEY) => "objectId",
        Value::Object(_) => "object",
    }
}

/// Extended-JSON key used to carry subscription ids on the wire.
const OID_KEY: &str = "$oid";

/// Identifier of a broker node inside a relay group.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Derive a node id from a node name.
    pub fn from_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        NodeId(u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:08x})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Process-unique default node name.
pub(crate) fn default_node_name() -> String {
    static NEXT_NODE: AtomicU64 = AtomicU64::new(1);
    format!(
        "node-{}-{}-{}",
        std::process::id(),
        NEXT_NODE.fetch_add(1, Ordering::Relaxed),
        Timestamp::now().0
    )
}

/// Opaque subscription identifier.
///
/// Twelve bytes laid out like an ObjectId: creation seconds, node id, and a
/// per-node counter, all big-endian. Rendered as 24 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub [u8; 12]);

impl SubscriptionId {
    pub fn from_parts(seconds: u32, node: u32, counter: u32) -> Self {
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&seconds.to_be_bytes());
        bytes[4..8].copy_from_slice(&node.to_be_bytes());
        bytes[8..12].copy_from_slice(&counter.to_be_bytes());
        SubscriptionId(bytes)
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 12] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(SubscriptionId(arr))
    }

    /// Wire form: `{"$oid": "<hex>"}`.
    pub fn to_value(&self) -> Value {
        let mut doc = Document::new();
        doc.insert(OID_KEY.to_string(), Value::String(self.to_hex()));
        Value::Object(doc)
    }

    /// Read the wire form. Returns `None` for anything that is not an id.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        obj.get(OID_KEY)?.as_str().and_then(|s| Self::from_hex(s).ok())
    }

    /// Node that allocated this id.
    pub fn node(&self) -> NodeId {
        NodeId(u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]]))
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.to_hex())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for SubscriptionId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

#[derive(Serialize, Deserialize)]
struct OidRepr {
    #[serde(rename = "$oid")]
    oid: String,
}

impl Serialize for SubscriptionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        OidRepr { oid: self.to_hex() }.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SubscriptionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = OidRepr::deserialize(deserializer)?;
        SubscriptionId::from_hex(&repr.oid).map_err(serde::de::Error::custom)
    }
}

/// Process-unique value telling successive instances of the same node apart.
///
/// Hashes the current time, the process id, and a per-process counter, so two
/// calls never agree even within one clock tick.
pub fn incarnation() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let mut hasher = Sha256::new();
    hasher.update(Timestamp::now().0.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(NEXT.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Allocates subscription ids for one node. Ids are never reused.
///
/// Like an ObjectId counter, the counter starts at a per-instance value, so a
/// node restarted under the same name within the same second does not hand
/// out ids from its previous life.
#[derive(Debug)]
pub struct IdGenerator {
    node: NodeId,
    counter: AtomicU32,
}

impl IdGenerator {
    pub fn new(node: NodeId) -> Self {
        Self::with_seed(node, incarnation() as u32)
    }

    /// Generator whose counter starts at `seed`.
    pub fn with_seed(node: NodeId, seed: u32) -> Self {
        Self {
            node,
            counter: AtomicU32::new(seed),
        }
    }

    pub fn next(&self) -> SubscriptionId {
        let seconds = (Timestamp::now().0 / 1_000_000) as u32;
        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        SubscriptionId::from_parts(seconds, self.node.0, counter)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Broker statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    /// Live subscriptions on this node.
    pub subscriptions: usize,
    /// Channels with at least one bound subscription.
    pub channels: usize,
    /// Messages published through this node.
    pub published: u64,
    /// Messages enqueued into subscription queues on this node.
    pub delivered: u64,
    /// Frames handed to the relay transport.
    pub relayed_out: u64,
    /// Frames received from peers and routed locally.
    pub relayed_in: u64,
    /// Frames dropped (corrupt, duplicate, or send failure).
    pub relay_dropped: u64,
    /// Subscriptions removed by idle expiry.
    pub expired: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscription_id_hex() {
        let id = SubscriptionId::from_parts(0x01020304, 0xaabbccdd, 7);
        assert_eq!(id.to_hex(), "01020304aabbccdd00000007");
        assert_eq!(SubscriptionId::from_hex(&id.to_hex()).unwrap(), id);
        assert_eq!(id.node(), NodeId(0xaabbccdd));
        assert!(SubscriptionId::from_hex("abc").is_err());
    }

    #[test]
    fn test_subscription_id_wire_form() {
        let id = SubscriptionId::from_parts(1, 2, 3);
        let value = serde_json::to_value(id).unwrap();
        assert_eq!(value, json!({"$oid": "000000010000000200000003"}));
        assert_eq!(SubscriptionId::from_value(&value), Some(id));
        assert_eq!(serde_json::from_value::<SubscriptionId>(value).unwrap(), id);

        assert_eq!(SubscriptionId::from_value(&json!("000000010000000200000003")), None);
        assert_eq!(SubscriptionId::from_value(&json!({"$oid": "zz"})), None);
    }

    #[test]
    fn test_generator_never_repeats() {
        let gen = IdGenerator::new(NodeId::from_name("a"));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(gen.next()));
        }
    }

    #[test]
    fn test_restarted_generator_does_not_reissue_ids() {
        let node = NodeId::from_name("rs0-primary");
        let before: std::collections::HashSet<_> = {
            let gen = IdGenerator::new(node);
            (0..100).map(|_| gen.next()).collect()
        };
        let restarted = IdGenerator::new(node);
        for _ in 0..100 {
            assert!(!before.contains(&restarted.next()));
        }
    }

    #[test]
    fn test_seeded_generator_counts_from_seed() {
        let gen = IdGenerator::with_seed(NodeId(9), u32::MAX);
        let first = gen.next();
        let second = gen.next();
        assert_eq!(&first.0[8..], &u32::MAX.to_be_bytes());
        assert_eq!(&second.0[8..], &0u32.to_be_bytes());
        assert_eq!(first.node(), NodeId(9));
    }

    #[test]
    fn test_incarnations_differ() {
        assert_ne!(incarnation(), incarnation());
    }

    #[test]
    fn test_node_id_from_name_is_stable() {
        assert_eq!(NodeId::from_name("router-1"), NodeId::from_name("router-1"));
        assert_ne!(NodeId::from_name("router-1"), NodeId::from_name("router-2"));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(type_name(&json!("a")), "string");
        assert_eq!(type_name(&json!({"a": 1})), "object");
        assert_eq!(type_name(&json!([1])), "array");
        assert_eq!(type_name(&json!(1)), "long");
        assert_eq!(type_name(&json!(1.5)), "double");
        assert_eq!(type_name(&SubscriptionId::from_parts(1, 1, 1).to_value()), "objectId");
    }
}
