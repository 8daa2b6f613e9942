//! Shared evaluation context and the long-lived `global` store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

/// The per-invocation namespace of bindings visible to every engine of one
/// [`super::set::EngineSet`]. Values are plain JSON data — that is the
/// common denominator every engine can represent, so a binding written by
/// one language is readable from the others. Engine-native values that
/// cannot cross the boundary (functions, userdata) stay local to their
/// engine and are simply not mirrored here.
#[derive(Clone, Default)]
pub struct SharedContext {
    inner: Arc<Mutex<HashMap<String, Value>>>,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: Value) {
        self.inner.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().unwrap().contains_key(key)
    }

    /// A point-in-time copy of all bindings, for syncing into an engine.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// An independent copy of the current bindings. Method invocations run
    /// against a fork: the method sees the caller's bindings but its own
    /// assignments do not leak back into the calling invocation.
    pub fn fork(&self) -> SharedContext {
        let copy = self.inner.lock().unwrap().clone();
        SharedContext {
            inner: Arc::new(Mutex::new(copy)),
        }
    }
}

/// The one deliberately cross-invocation piece of state: a process-lifetime
/// key/value store scripts use to keep data between separate command
/// executions. The platform serializes individual get/set operations and
/// nothing more; scripts coordinate any richer invariants themselves.
#[derive(Default)]
pub struct GlobalStore {
    inner: Mutex<HashMap<String, Value>>,
}

impl GlobalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: Value) {
        self.inner.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Value {
        self.inner
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_set_get() {
        let ctx = SharedContext::new();
        ctx.set("args", json!("1 2 3"));
        assert_eq!(ctx.get("args"), Some(json!("1 2 3")));
        assert!(ctx.get("missing").is_none());
    }

    #[test]
    fn test_fork_is_isolated() {
        let ctx = SharedContext::new();
        ctx.set("x", json!(1));

        let fork = ctx.fork();
        assert_eq!(fork.get("x"), Some(json!(1)));

        fork.set("x", json!(2));
        fork.set("y", json!(3));
        assert_eq!(ctx.get("x"), Some(json!(1)));
        assert!(ctx.get("y").is_none());
    }

    #[test]
    fn test_global_store_defaults_to_null() {
        let global = GlobalStore::new();
        assert_eq!(global.get("counter"), Value::Null);
        global.set("counter", json!(41));
        assert_eq!(global.get("counter"), json!(41));
    }
}
