//! Built-in projection evaluator.

use super::ProjectionEvaluator;
use crate::error::{BrokerError, Result};
use crate::types::{type_name, Document};
use serde_json::Value;

const ID_FIELD: &str = "_id";

/// Selects fields by inclusion or exclusion.
#[derive(Clone, Copy, Debug, Default)]
pub struct FieldProjector;

impl FieldProjector {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Include,
    Exclude,
}

fn flag(field: &str, value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        other => Err(BrokerError::BadProjection(format!(
            "value for '{field}' must be a number or bool but was a {}",
            type_name(other)
        ))),
    }
}

fn mode(spec: &Document) -> Result<Mode> {
    let mut mode = None;
    for (field, value) in spec {
        let included = flag(field, value)?;
        if field == ID_FIELD {
            continue;
        }
        let this = if included { Mode::Include } else { Mode::Exclude };
        match mode {
            None => mode = Some(this),
            Some(m) if m != this => {
                return Err(BrokerError::BadProjection(
                    "cannot mix inclusion and exclusion".to_string(),
                ))
            }
            Some(_) => {}
        }
    }
    // A spec that only mentions `_id` follows that flag.
    Ok(mode.unwrap_or_else(|| match spec.get(ID_FIELD) {
        Some(v) if !flag(ID_FIELD, v).unwrap_or(true) => Mode::Exclude,
        Some(_) => Mode::Include,
        None => Mode::Exclude,
    }))
}

impl ProjectionEvaluator for FieldProjector {
    fn validate(&self, spec: &Document) -> Result<()> {
        mode(spec).map(|_| ())
    }

    fn project(&self, spec: &Document, document: &Document) -> Document {
        let Ok(mode) = mode(spec) else {
            return document.clone();
        };
        let id_wanted = spec
            .get(ID_FIELD)
            .map(|v| flag(ID_FIELD, v).unwrap_or(true))
            .unwrap_or(true);

        match mode {
            Mode::Include => {
                let mut out = Document::new();
                if id_wanted {
                    if let Some(id) = document.get(ID_FIELD) {
                        out.insert(ID_FIELD.to_string(), id.clone());
                    }
                }
                for (path, value) in spec {
                    if path != ID_FIELD && flag(path, value).unwrap_or(false) {
                        let segments: Vec<&str> = path.split('.').collect();
                        include_path(document, &mut out, &segments);
                    }
                }
                out
            }
            Mode::Exclude => {
                let mut out = document.clone();
                for (path, value) in spec {
                    if !flag(path, value).unwrap_or(true) {
                        let segments: Vec<&str> = path.split('.').collect();
                        exclude_path(&mut out, &segments);
                    }
                }
                out
            }
        }
    }
}

fn include_path(src: &Document, dst: &mut Document, segments: &[&str]) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    let Some(value) = src.get(*head) else {
        return;
    };
    if rest.is_empty() {
        dst.insert(head.to_string(), value.clone());
        return;
    }
    if let Value::Object(child) = value {
        let slot = dst
            .entry(head.to_string())
            .or_insert_with(|| Value::Object(Document::new()));
        if let Value::Object(child_dst) = slot {
            include_path(child, child_dst, rest);
        }
    }
}

fn exclude_path(doc: &mut Document, segments: &[&str]) {
    match segments {
        [] => {}
        [last] => {
            doc.remove(*last);
        }
        [head, rest @ ..] => {
            if let Some(Value::Object(child)) = doc.get_mut(*head) {
                exclude_path(child, rest);
            }
        }
    }
}
