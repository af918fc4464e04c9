//! The per-execution `Context`: the runtime-visible, append-only mapping
//! available to templates and conditions (`spec.md` §3 "Context").
//!
//! Context is a tree of JSON values keyed by namespace (`variables`, `spec`,
//! `steps`, `tasks`, `branches`, `router`, `nodes`, `workers`, `rounds`,
//! `iteration`, `iterations`, `last_response`, `hitl_response`). Every
//! pattern executor writes into its own namespaces only; nothing is ever
//! overwritten once set, which is what makes checkpoint replay and template
//! references stable (`spec.md` §8 "Context monotonicity").

use serde_json::Value;
use std::collections::BTreeMap;

/// Append-only namespaced context. Internally a `serde_json::Map` so it can
/// be serialized wholesale into a checkpoint and restored byte-for-byte.
#[derive(Debug, Clone, Default)]
pub struct Context {
    root: serde_json::Map<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self { root: serde_json::Map::new() }
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self { root: map },
            _ => Self::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.root.clone())
    }

    pub fn set_variables(&mut self, variables: Value) {
        self.root.insert("variables".to_string(), variables);
    }

    pub fn set_spec_meta(&mut self, name: &str) {
        self.root.insert(
            "spec".to_string(),
            serde_json::json!({ "name": name }),
        );
    }

    pub fn set_last_response(&mut self, response: &str) {
        self.root.insert("last_response".to_string(), Value::String(response.to_string()));
    }

    pub fn set_hitl_response(&mut self, response: &str) {
        self.root.insert("hitl_response".to_string(), Value::String(response.to_string()));
    }

    /// Monotonic append into a namespace's array, e.g. `steps[i]`.
    /// `spec.md` §4.9.1: "steps[i] = {response, tokens, status} (0-indexed, dense)".
    pub fn push_indexed(&mut self, namespace: &str, entry: Value) -> usize {
        let arr = self
            .root
            .entry(namespace.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        let arr = arr.as_array_mut().expect("namespace reserved for dense arrays");
        arr.push(entry);
        arr.len() - 1
    }

    /// Monotonic insert into a namespace's object, keyed by id, e.g.
    /// `tasks[id]`, `branches[id]`, `nodes[id]`. Inserting over an existing
    /// key is allowed only for dense re-entry namespaces (graph nodes);
    /// callers decide which.
    pub fn set_keyed(&mut self, namespace: &str, key: &str, entry: Value) {
        let obj = self
            .root
            .entry(namespace.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        let obj = obj.as_object_mut().expect("namespace reserved for keyed maps");
        obj.insert(key.to_string(), entry);
    }

    pub fn get(&self, namespace: &str) -> Option<&Value> {
        self.root.get(namespace)
    }

    pub fn get_indexed(&self, namespace: &str, index: usize) -> Option<&Value> {
        self.root.get(namespace)?.as_array()?.get(index)
    }

    pub fn get_keyed(&self, namespace: &str, key: &str) -> Option<&Value> {
        self.root.get(namespace)?.as_object()?.get(key)
    }

    pub fn len_indexed(&self, namespace: &str) -> usize {
        self.root.get(namespace).and_then(|v| v.as_array()).map(|a| a.len()).unwrap_or(0)
    }

    /// Clones this context and shallow-merges `overlay` into the
    /// `variables` namespace, for rendering a single stage's templates
    /// without permanently mutating the run's append-only context (used
    /// for `Stage::AgentStep::per_step_vars`).
    pub fn with_variables_overlay(&self, overlay: Option<&Value>) -> Context {
        let mut clone = self.clone();
        let Some(Value::Object(extra)) = overlay else { return clone };
        let mut merged = clone.root.get("variables").and_then(|v| v.as_object()).cloned().unwrap_or_default();
        for (k, v) in extra {
            merged.insert(k.clone(), v.clone());
        }
        clone.root.insert("variables".to_string(), Value::Object(merged));
        clone
    }

    /// Flatten everything into a single dotted-key map for the template
    /// renderer's variable lookups (`{{ steps[0].response }}`,
    /// `{{ tasks.analysis.response }}`, ...). Values are cloned; this is
    /// called once per render, which is cheap relative to an LLM call.
    pub fn flatten(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for (k, v) in &self.root {
            out.insert(k.clone(), v.clone());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn push_indexed_is_dense_and_ordered() {
        let mut ctx = Context::new();
        let i0 = ctx.push_indexed("steps", json!({"response": "a"}));
        let i1 = ctx.push_indexed("steps", json!({"response": "b"}));
        assert_eq!(i0, 0);
        assert_eq!(i1, 1);
        assert_eq!(ctx.get_indexed("steps", 0).unwrap()["response"], "a");
        assert_eq!(ctx.get_indexed("steps", 1).unwrap()["response"], "b");
    }

    #[test]
    fn set_keyed_addresses_by_id() {
        let mut ctx = Context::new();
        ctx.set_keyed("tasks", "A", json!({"response": "a-out"}));
        ctx.set_keyed("tasks", "B", json!({"response": "b-out"}));
        assert_eq!(ctx.get_keyed("tasks", "A").unwrap()["response"], "a-out");
        assert_eq!(ctx.get_keyed("tasks", "B").unwrap()["response"], "b-out");
        assert!(ctx.get_keyed("tasks", "C").is_none());
    }

    #[test]
    fn variables_overlay_does_not_mutate_original() {
        let mut ctx = Context::new();
        ctx.set_variables(json!({"topic": "x", "tone": "formal"}));
        let overlaid = ctx.with_variables_overlay(Some(&json!({"tone": "casual"})));
        assert_eq!(overlaid.get("variables").unwrap()["tone"], "casual");
        assert_eq!(overlaid.get("variables").unwrap()["topic"], "x");
        assert_eq!(ctx.get("variables").unwrap()["tone"], "formal");
    }

    #[test]
    fn round_trips_through_value() {
        let mut ctx = Context::new();
        ctx.set_variables(json!({"topic": "x"}));
        ctx.push_indexed("steps", json!({"response": "A X"}));
        let value = ctx.to_value();
        let restored = Context::from_value(value);
        assert_eq!(restored.get("variables").unwrap()["topic"], "x");
        assert_eq!(restored.get_indexed("steps", 0).unwrap()["response"], "A X");
    }
}
