//! Per-invocation engine instance set.
//!
//! One live interpreter per capability, all observing the same shared
//! evaluation context. Sets are single-use: built when a trigger fires,
//! dropped when the pipeline run ends. Reusing one would leak a previous
//! invocation's bindings into the next.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use serde_json::Value;

use super::context::{GlobalStore, SharedContext};
use super::interpreter::Interpreter;
use super::lua::LuaInterpreter;
use super::rhai::RhaiInterpreter;
use super::{Capability, EvalError};

pub struct EngineSet {
    engines: Arc<HashMap<Capability, Arc<dyn Interpreter>>>,
    ctx: SharedContext,
}

impl EngineSet {
    /// Builds one interpreter per capability and wires the cross-engine
    /// handles: `engine_eval` for live access to a sibling engine,
    /// `ctx_get`/`ctx_set` for the shared context, and
    /// `global_get`/`global_set` for the cross-invocation store.
    pub fn new(ctx: SharedContext, global: Arc<GlobalStore>) -> Result<Self, EvalError> {
        let mut map: HashMap<Capability, Arc<dyn Interpreter>> = HashMap::new();
        for capability in Capability::ALL {
            map.insert(capability, new_interpreter(capability, ctx.clone())?);
        }
        let engines = Arc::new(map);

        for (capability, interpreter) in engines.iter() {
            bind_engine_handle(interpreter, *capability, Arc::downgrade(&engines))?;
            bind_store_helpers(interpreter, ctx.clone(), global.clone())?;
        }

        Ok(Self { engines, ctx })
    }

    /// Never fails for a known capability.
    pub fn get(&self, capability: Capability) -> Arc<dyn Interpreter> {
        self.engines
            .get(&capability)
            .expect("engine set covers every capability")
            .clone()
    }

    pub fn context(&self) -> &SharedContext {
        &self.ctx
    }
}

/// Builds a fresh interpreter of the given capability against a context.
/// Also used for the brand-new instances backing method invocations.
pub fn new_interpreter(
    capability: Capability,
    ctx: SharedContext,
) -> Result<Arc<dyn Interpreter>, EvalError> {
    Ok(match capability {
        Capability::Lua => Arc::new(LuaInterpreter::new(ctx)?),
        Capability::Rhai => Arc::new(RhaiInterpreter::new(ctx)?),
    })
}

/// Exposes `engine_eval(name, code)`: evaluate text in the named sibling
/// engine and return its result. Re-entering the calling engine is refused
/// (its lock is held for the duration of the current evaluation).
fn bind_engine_handle(
    interpreter: &Arc<dyn Interpreter>,
    own: Capability,
    engines: Weak<HashMap<Capability, Arc<dyn Interpreter>>>,
) -> Result<(), EvalError> {
    interpreter.bind_callable(
        "engine_eval",
        Arc::new(move |args: Vec<Value>| {
            let name = string_arg(&args, 0, "engine_eval: engine name")?;
            let code = string_arg(&args, 1, "engine_eval: code")?;
            let target = Capability::from_name(&name)?;
            if target == own {
                return Err(EvalError::Script(
                    "engine_eval: cannot re-enter the running engine".into(),
                ));
            }
            let engines = engines
                .upgrade()
                .ok_or_else(|| EvalError::Script("engine set no longer alive".into()))?;
            engines[&target].eval(&code)
        }),
    )
}

/// Exposes the shared context and the long-lived global store as host
/// functions in the given interpreter.
pub fn bind_store_helpers(
    interpreter: &Arc<dyn Interpreter>,
    ctx: SharedContext,
    global: Arc<GlobalStore>,
) -> Result<(), EvalError> {
    {
        let ctx = ctx.clone();
        interpreter.bind_callable(
            "ctx_get",
            Arc::new(move |args| {
                let key = string_arg(&args, 0, "ctx_get: key")?;
                Ok(ctx.get(&key).unwrap_or(Value::Null))
            }),
        )?;
    }
    {
        let ctx = ctx.clone();
        interpreter.bind_callable(
            "ctx_set",
            Arc::new(move |args| {
                let key = string_arg(&args, 0, "ctx_set: key")?;
                ctx.set(&key, args.get(1).cloned().unwrap_or(Value::Null));
                Ok(Value::Null)
            }),
        )?;
    }
    {
        let global = global.clone();
        interpreter.bind_callable(
            "global_get",
            Arc::new(move |args| {
                let key = string_arg(&args, 0, "global_get: key")?;
                Ok(global.get(&key))
            }),
        )?;
    }
    interpreter.bind_callable(
        "global_set",
        Arc::new(move |args| {
            let key = string_arg(&args, 0, "global_set: key")?;
            global.set(&key, args.get(1).cloned().unwrap_or(Value::Null));
            Ok(Value::Null)
        }),
    )
}

fn string_arg(args: &[Value], index: usize, what: &str) -> Result<String, EvalError> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EvalError::Value(format!("{what} must be a string")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine_set() -> (EngineSet, SharedContext, Arc<GlobalStore>) {
        let ctx = SharedContext::new();
        let global = Arc::new(GlobalStore::new());
        let set = EngineSet::new(ctx.clone(), global.clone()).unwrap();
        (set, ctx, global)
    }

    #[test]
    fn test_every_capability_has_an_engine() {
        let (set, _, _) = engine_set();
        for capability in Capability::ALL {
            assert_eq!(set.get(capability).capability(), capability);
        }
    }

    #[test]
    fn test_context_is_shared_across_engines() {
        let (set, _, _) = engine_set();
        set.get(Capability::Lua).eval("shared = 41").unwrap();
        let seen = set.get(Capability::Rhai).eval("shared + 1").unwrap();
        assert_eq!(seen, json!(42));
    }

    #[test]
    fn test_engine_eval_reaches_sibling() {
        let (set, _, _) = engine_set();
        let result = set
            .get(Capability::Lua)
            .eval("return engine_eval(\"rhai\", \"2 + 2\")")
            .unwrap();
        assert_eq!(result, json!(4));
    }

    #[test]
    fn test_engine_eval_refuses_reentry() {
        let (set, _, _) = engine_set();
        let err = set
            .get(Capability::Lua)
            .eval("return engine_eval(\"lua\", \"1\")")
            .unwrap_err();
        assert!(matches!(err, EvalError::Script(_)));
    }

    #[test]
    fn test_global_store_survives_sets() {
        let global = Arc::new(GlobalStore::new());

        let set = EngineSet::new(SharedContext::new(), global.clone()).unwrap();
        set.get(Capability::Lua)
            .eval("global_set(\"count\", 7)")
            .unwrap();
        drop(set);

        let set = EngineSet::new(SharedContext::new(), global).unwrap();
        let seen = set
            .get(Capability::Rhai)
            .eval("global_get(\"count\")")
            .unwrap();
        assert_eq!(seen, json!(7));
    }

    #[test]
    fn test_ctx_helpers() {
        let (set, ctx, _) = engine_set();
        set.get(Capability::Rhai)
            .eval("ctx_set(\"from_rhai\", 1)")
            .unwrap();
        assert_eq!(ctx.get("from_rhai"), Some(json!(1)));
    }
}
