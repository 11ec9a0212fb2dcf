//! # Context module
//!
//! This module provides the per-event evaluation context read by templates
//! and expressions and mutated by the pipeline

use serde_json::{Map, Value};

// -----------------------------------------------------------------------------
// Constants

pub const ADAPTER_KEY: &str = "adapter";
pub const RESOURCES_KEY: &str = "resources";

pub const EXECUTION_STATUS_KEY: &str = "executionStatus";
pub const EXECUTION_ERROR_KEY: &str = "executionError";
pub const ERROR_REASON_KEY: &str = "errorReason";
pub const ERROR_MESSAGE_KEY: &str = "errorMessage";
pub const RESOURCES_SKIPPED_KEY: &str = "resourcesSkipped";
pub const SKIP_REASON_KEY: &str = "skipReason";

// -----------------------------------------------------------------------------
// EvaluationContext structure

/// Mutable key to value store scoped to a single event. Values are
/// heterogeneous json trees, navigation through them never fails, a missing
/// or null segment yields an absent result.
#[derive(Clone, Debug, Default)]
pub struct EvaluationContext {
    values: Map<String, Value>,
}

impl From<Map<String, Value>> for EvaluationContext {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// returns the top-level entries of the context
    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// returns the whole context as a single json object
    pub fn to_value(&self) -> Value {
        Value::Object(self.values.to_owned())
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_owned(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// stores the value under the given dotted path, creating intermediate
    /// objects along the way. A non-object intermediate is replaced.
    pub fn set_nested(&mut self, path: &str, value: Value) {
        let mut segments = path.split('.').collect::<Vec<_>>();
        let last = match segments.pop() {
            Some(last) => last,
            None => return,
        };

        if segments.is_empty() {
            self.values.insert(last.to_owned(), value);
            return;
        }

        let mut cursor = self
            .values
            .entry(segments.remove(0).to_owned())
            .or_insert_with(|| Value::Object(Map::new()));

        for segment in segments {
            if !cursor.is_object() {
                *cursor = Value::Object(Map::new());
            }

            cursor = cursor
                .as_object_mut()
                .expect("cursor to be an object, it was just replaced otherwise")
                .entry(segment.to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
        }

        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }

        cursor
            .as_object_mut()
            .expect("cursor to be an object, it was just replaced otherwise")
            .insert(last.to_owned(), value);
    }

    /// walks the given dotted path through maps and lists. A missing or null
    /// segment short-circuits to `None`, indexing through a list requires a
    /// numeric segment.
    pub fn get_nested(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut cursor = self.values.get(segments.next()?)?;

        for segment in segments {
            cursor = navigate(cursor, segment)?;
        }

        Some(cursor)
    }

    pub fn get_or_default<'a>(&'a self, path: &str, default: &'a Value) -> &'a Value {
        self.get_nested(path).unwrap_or(default)
    }

    /// returns whether the path resolves to a present, non-null value
    pub fn has(&self, path: &str) -> bool {
        matches!(self.get_nested(path), Some(value) if !value.is_null())
    }

    /// last-writer-wins shallow merge of the other context into this one
    pub fn merge(&mut self, other: &EvaluationContext) {
        for (key, value) in &other.values {
            self.values.insert(key.to_owned(), value.to_owned());
        }
    }
}

// -----------------------------------------------------------------------------
// Reserved 'adapter' sub-object helpers, used by the orchestrator only

impl EvaluationContext {
    fn adapter_mut(&mut self) -> &mut Map<String, Value> {
        let entry = self
            .values
            .entry(ADAPTER_KEY.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));

        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }

        entry
            .as_object_mut()
            .expect("adapter entry to be an object, it was just replaced otherwise")
    }

    pub fn set_execution_status(&mut self, status: &str) {
        self.adapter_mut()
            .insert(EXECUTION_STATUS_KEY.to_owned(), Value::from(status));
    }

    /// records the first execution error of the pipeline. Later calls are
    /// ignored, the first error wins.
    pub fn record_execution_error(&mut self, phase: &str, step: &str, reason: &str, message: &str) {
        let adapter = self.adapter_mut();

        if matches!(adapter.get(EXECUTION_ERROR_KEY), Some(value) if !value.is_null()) {
            return;
        }

        adapter.insert(
            EXECUTION_ERROR_KEY.to_owned(),
            serde_json::json!({
                "phase": phase,
                "step": step,
                "message": message,
            }),
        );

        adapter.insert(ERROR_REASON_KEY.to_owned(), Value::from(reason));
        adapter.insert(ERROR_MESSAGE_KEY.to_owned(), Value::from(message));
    }

    pub fn execution_error(&self) -> Option<&Value> {
        self.get_nested(&format!("{ADAPTER_KEY}.{EXECUTION_ERROR_KEY}"))
            .filter(|value| !value.is_null())
    }

    pub fn set_resources_skipped(&mut self, skipped: bool, reason: &str) {
        let adapter = self.adapter_mut();

        adapter.insert(RESOURCES_SKIPPED_KEY.to_owned(), Value::from(skipped));
        adapter.insert(SKIP_REASON_KEY.to_owned(), Value::from(reason));
    }

    /// registers a reconciled manifest under `resources.<resource>.<manifest>`
    /// and, for the first manifest of the resource, under
    /// `resources.<resource>` as well
    pub fn insert_resource(&mut self, resource: &str, manifest: &str, first: bool, object: Value) {
        if first {
            self.set_nested(&format!("{RESOURCES_KEY}.{resource}"), object.to_owned());
        }

        self.set_nested(
            &format!("{RESOURCES_KEY}.{resource}.{manifest}"),
            object,
        );
    }
}

// -----------------------------------------------------------------------------
// Navigation helper

/// resolves one path segment against a value. Lists are indexed by numeric
/// segments, scalars and null yield `None`, which makes navigation through
/// a null or missing segment short-circuit to absent.
pub fn navigate<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|idx| items.get(idx)),
        _ => None,
    }
}

// -----------------------------------------------------------------------------
// Emptiness helper

/// returns whether the value counts as present and non-empty for the
/// `exists` operator. Empty string, empty list, empty map and null are all
/// considered empty.
pub fn is_non_empty(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{is_non_empty, EvaluationContext};

    fn context() -> EvaluationContext {
        let mut ctx = EvaluationContext::new();

        ctx.set(
            "cluster",
            json!({
                "id": "c1",
                "spec": {"region": "us-east-1"},
                "status": {
                    "phase": null,
                    "conditions": [
                        {"type": "Ready", "status": "True"},
                        {"type": "Degraded", "status": "False"},
                    ],
                },
            }),
        );

        ctx
    }

    #[test]
    fn nested_lookup_walks_maps_and_lists() {
        let ctx = context();

        assert_eq!(
            ctx.get_nested("cluster.spec.region"),
            Some(&Value::from("us-east-1"))
        );
        assert_eq!(
            ctx.get_nested("cluster.status.conditions.1.status"),
            Some(&Value::from("False"))
        );
    }

    #[test]
    fn nested_lookup_is_null_safe() {
        let ctx = context();

        assert_eq!(ctx.get_nested("cluster.status.phase.name"), None);
        assert_eq!(ctx.get_nested("cluster.missing.deeper"), None);
        assert_eq!(ctx.get_nested("cluster.status.conditions.9"), None);
        assert_eq!(ctx.get_nested("cluster.id.0"), None);
        assert_eq!(ctx.get_nested("cluster.status.phase"), Some(&Value::Null));
    }

    #[test]
    fn has_treats_null_as_absent() {
        let ctx = context();

        assert!(ctx.has("cluster.spec.region"));
        assert!(!ctx.has("cluster.status.phase"));
        assert!(!ctx.has("cluster.nothing"));
    }

    #[test]
    fn default_fills_in_for_absent_paths() {
        let ctx = context();
        let fallback = Value::from("eu-west-1");

        assert_eq!(
            ctx.get_or_default("cluster.spec.region", &fallback),
            &Value::from("us-east-1")
        );
        assert_eq!(ctx.get_or_default("cluster.spec.zone", &fallback), &fallback);
    }

    #[test]
    fn set_nested_creates_intermediate_objects() {
        let mut ctx = EvaluationContext::new();

        ctx.set_nested("conditions.health.status", Value::from(true));

        assert_eq!(
            ctx.get_nested("conditions.health.status"),
            Some(&Value::from(true))
        );
    }

    #[test]
    fn merge_is_last_writer_wins() {
        let mut left = EvaluationContext::new();
        let mut right = EvaluationContext::new();

        left.set("a", Value::from(1));
        left.set("b", Value::from(1));
        right.set("b", Value::from(2));
        right.set("c", Value::from(3));

        left.merge(&right);

        assert_eq!(left.get("a"), Some(&Value::from(1)));
        assert_eq!(left.get("b"), Some(&Value::from(2)));
        assert_eq!(left.get("c"), Some(&Value::from(3)));
    }

    #[test]
    fn execution_error_is_first_wins() {
        let mut ctx = EvaluationContext::new();

        ctx.record_execution_error("preconditions", "0", "HTTP", "status 404");
        ctx.record_execution_error("resources", "1", "ResourceApply", "conflict");

        assert_eq!(
            ctx.get_nested("adapter.executionError.phase"),
            Some(&Value::from("preconditions"))
        );
        assert_eq!(
            ctx.get_nested("adapter.errorReason"),
            Some(&Value::from("HTTP"))
        );
    }

    #[test]
    fn resources_are_addressable_by_both_keys() {
        let mut ctx = EvaluationContext::new();
        let object = json!({"kind": "ConfigMap", "metadata": {"name": "cm"}});

        ctx.insert_resource("primary", "configmap", true, object.to_owned());

        assert_eq!(
            ctx.get_nested("resources.primary.kind"),
            Some(&Value::from("ConfigMap"))
        );
        assert_eq!(
            ctx.get_nested("resources.primary.configmap.kind"),
            Some(&Value::from("ConfigMap"))
        );
    }

    #[test]
    fn emptiness_follows_exists_semantics() {
        assert!(!is_non_empty(&Value::Null));
        assert!(!is_non_empty(&json!("")));
        assert!(!is_non_empty(&json!([])));
        assert!(!is_non_empty(&json!({})));
        assert!(is_non_empty(&json!(0)));
        assert!(is_non_empty(&json!(false)));
        assert!(is_non_empty(&json!("x")));
    }
}
