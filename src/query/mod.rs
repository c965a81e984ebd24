//! Filter and projection evaluation for subscriptions.
//!
//! The broker treats both evaluators as collaborators behind traits, so a host
//! with its own query engine can plug it in. [`DocumentMatcher`] and
//! [`FieldProjector`] are the built-in implementations:
//!
//! - Filters: field equality, `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`,
//!   `$in`, `$nin`, `$exists`, and the `$and` / `$or` / `$nor` combinators,
//!   with dotted paths into nested documents.
//! - Projections: inclusion (`{field: 1}`) or exclusion (`{field: 0}`) of
//!   dotted paths, with `_id` kept unless explicitly excluded.

mod matcher;
mod projection;

pub use matcher::DocumentMatcher;
pub use projection::FieldProjector;

use crate::error::Result;
use crate::types::Document;
use serde_json::Value;

/// Evaluates subscription filters against message documents.
pub trait MatchEvaluator: Send + Sync {
    /// Reject malformed predicates before a subscription stores them.
    fn validate(&self, predicate: &Document) -> Result<()>;

    /// Whether `document` satisfies `predicate`.
    fn matches(&self, predicate: &Document, document: &Document) -> bool;
}

/// Derives the delivered view of a message from a projection spec.
pub trait ProjectionEvaluator: Send + Sync {
    /// Reject malformed projection specs before a subscription stores them.
    fn validate(&self, spec: &Document) -> Result<()>;

    /// Reduced view of `document`. Excluded fields are absent from the result.
    fn project(&self, spec: &Document, document: &Document) -> Document;
}

/// Resolve a dotted path inside a document.
pub(crate) fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(obj) => obj.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_lookup_nested_paths() {
        let d = doc(json!({"a": {"b": {"c": 3}}, "list": [10, 20]}));
        assert_eq!(lookup(&d, "a.b.c"), Some(&json!(3)));
        assert_eq!(lookup(&d, "list.1"), Some(&json!(20)));
        assert_eq!(lookup(&d, "a.x"), None);
        assert_eq!(lookup(&d, "list.9"), None);
    }
}
