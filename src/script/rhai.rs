//! Rhai engine instance.
//!
//! The shared context is rebuilt into a fresh `Scope` before every
//! evaluation and convertible scope entries are mirrored back afterwards.
//! Script-defined functions do not survive an evaluation in rhai, so
//! generated proxies are kept in a prelude that is prepended to every
//! subsequent script. The cancel flag is observed from the engine's
//! progress callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Scope};
use serde_json::Value;
use tracing::trace;

use super::interpreter::{HostFn, Interpreter};
use super::{Capability, EvalError};
use crate::script::context::SharedContext;

pub struct RhaiInterpreter {
    state: Mutex<RhaiState>,
    ctx: SharedContext,
    cancel: Arc<AtomicBool>,
    /// Invocation hooks reachable from generated proxies via `__invoke`.
    hooks: Arc<Mutex<HashMap<String, HostFn>>>,
}

struct RhaiState {
    engine: Engine,
    /// Generated proxy definitions, prepended to every evaluation.
    prelude: String,
    /// Engine-local bindings re-applied on every evaluation.
    pinned: Vec<(String, Value)>,
}

impl RhaiInterpreter {
    pub fn new(ctx: SharedContext) -> Result<Self, EvalError> {
        let mut engine = Engine::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let hooks: Arc<Mutex<HashMap<String, HostFn>>> = Arc::new(Mutex::new(HashMap::new()));

        let flag = cancel.clone();
        engine.on_progress(move |_ops| {
            if flag.load(Ordering::Relaxed) {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });

        // Generic forwarding target for generated proxies.
        let invoke_hooks = hooks.clone();
        engine.register_fn(
            "__invoke",
            move |name: ImmutableString, args: Array| -> Result<Dynamic, Box<EvalAltResult>> {
                let hook = invoke_hooks
                    .lock()
                    .unwrap()
                    .get(name.as_str())
                    .cloned()
                    .ok_or_else(|| -> Box<EvalAltResult> {
                        format!("no such method: {name}").into()
                    })?;
                let json_args: Vec<Value> = args
                    .iter()
                    .map(|d| from_dynamic::<Value>(d).unwrap_or(Value::Null))
                    .collect();
                call_hook(&hook, json_args)
            },
        );

        Ok(Self {
            state: Mutex::new(RhaiState {
                engine,
                prelude: String::new(),
                pinned: Vec::new(),
            }),
            ctx,
            cancel,
            hooks,
        })
    }

    fn build_scope(&self, state: &RhaiState) -> Result<Scope<'static>, EvalError> {
        let mut scope = Scope::new();
        for (key, value) in self.ctx.snapshot() {
            scope.push_dynamic(key, json_to_dynamic(&value)?);
        }
        for (key, value) in &state.pinned {
            scope.push_dynamic(key.clone(), json_to_dynamic(value)?);
        }
        Ok(scope)
    }

    fn sync_out(&self, scope: &Scope) {
        for (name, _constant, value) in scope.iter() {
            match from_dynamic::<Value>(&value) {
                Ok(json) => self.ctx.set(name, json),
                Err(e) => trace!("Not mirroring rhai binding {name}: {e}"),
            }
        }
    }
}

impl Interpreter for RhaiInterpreter {
    fn capability(&self) -> Capability {
        Capability::Rhai
    }

    fn eval(&self, script: &str) -> Result<Value, EvalError> {
        let state = self.state.lock().unwrap();
        // An interrupt raised while this evaluation was still queued
        // cancels it before it starts.
        if self.cancel.swap(false, Ordering::Relaxed) {
            return Err(EvalError::Cancelled);
        }

        let mut scope = self.build_scope(&state)?;
        let script = if state.prelude.is_empty() {
            script.to_string()
        } else {
            format!("{}\n{script}", state.prelude)
        };

        let evaluated = state.engine.eval_with_scope::<Dynamic>(&mut scope, &script);
        let result = match evaluated {
            Ok(value) => from_dynamic::<Value>(&value).unwrap_or(Value::Null),
            Err(e) => {
                if self.cancel.swap(false, Ordering::Relaxed) {
                    return Err(EvalError::Cancelled);
                }
                return Err(EvalError::Script(e.to_string()));
            }
        };
        self.cancel.store(false, Ordering::Relaxed);
        self.sync_out(&scope);
        Ok(result)
    }

    fn define(&self, source: &str) -> Result<(), EvalError> {
        let mut state = self.state.lock().unwrap();
        // Surface syntax errors at registration time, not on first call.
        state
            .engine
            .compile(source)
            .map_err(|e| EvalError::Script(e.to_string()))?;
        state.prelude.push_str(source);
        state.prelude.push('\n');
        Ok(())
    }

    fn bind(&self, name: &str, value: Value) {
        let mut state = self.state.lock().unwrap();
        state.pinned.push((name.to_string(), value));
    }

    /// Registers the hook for `__invoke` and as native overloads for
    /// arities 0 to 4, so host functions are directly callable even
    /// without a generated proxy.
    fn bind_callable(&self, name: &str, hook: HostFn) -> Result<(), EvalError> {
        self.hooks
            .lock()
            .unwrap()
            .insert(name.to_string(), hook.clone());

        let mut state = self.state.lock().unwrap();
        let engine = &mut state.engine;

        let h = hook.clone();
        engine.register_fn(name, move || -> Result<Dynamic, Box<EvalAltResult>> {
            call_hook(&h, vec![])
        });
        let h = hook.clone();
        engine.register_fn(
            name,
            move |a: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
                call_hook(&h, dynamics_to_json(&[a]))
            },
        );
        let h = hook.clone();
        engine.register_fn(
            name,
            move |a: Dynamic, b: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
                call_hook(&h, dynamics_to_json(&[a, b]))
            },
        );
        let h = hook.clone();
        engine.register_fn(
            name,
            move |a: Dynamic, b: Dynamic, c: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
                call_hook(&h, dynamics_to_json(&[a, b, c]))
            },
        );
        let h = hook;
        engine.register_fn(
            name,
            move |a: Dynamic,
                  b: Dynamic,
                  c: Dynamic,
                  d: Dynamic|
                  -> Result<Dynamic, Box<EvalAltResult>> {
                call_hook(&h, dynamics_to_json(&[a, b, c, d]))
            },
        );
        Ok(())
    }

    fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }
}

fn call_hook(hook: &HostFn, args: Vec<Value>) -> Result<Dynamic, Box<EvalAltResult>> {
    match hook(args) {
        Ok(value) => to_dynamic(&value),
        Err(e) => Err(e.to_string().into()),
    }
}

fn dynamics_to_json(args: &[Dynamic]) -> Vec<Value> {
    args.iter()
        .map(|d| from_dynamic::<Value>(d).unwrap_or(Value::Null))
        .collect()
}

fn json_to_dynamic(value: &Value) -> Result<Dynamic, EvalError> {
    to_dynamic(value).map_err(|e| EvalError::Value(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn interpreter() -> (RhaiInterpreter, SharedContext) {
        let ctx = SharedContext::new();
        let interp = RhaiInterpreter::new(ctx.clone()).unwrap();
        (interp, ctx)
    }

    #[test]
    fn test_eval_expression() {
        let (interp, _ctx) = interpreter();
        assert_eq!(interp.eval("\"pong\"").unwrap(), json!("pong"));
        assert_eq!(interp.eval("1 + 2").unwrap(), json!(3));
    }

    #[test]
    fn test_context_roundtrip() {
        let (interp, ctx) = interpreter();
        ctx.set("args", json!("7"));

        let result = interp
            .eval("let doubled = args.parse_int() * 2; doubled")
            .unwrap();
        assert_eq!(result, json!(14));
        assert_eq!(ctx.get("doubled"), Some(json!(14)));
    }

    #[test]
    fn test_script_error_is_a_value() {
        let (interp, _ctx) = interpreter();
        let err = interp.eval("throw \"nope\"").unwrap_err();
        assert!(matches!(err, EvalError::Script(_)));
    }

    #[test]
    fn test_defined_proxy_survives_evaluations() {
        let (interp, _ctx) = interpreter();
        interp
            .bind_callable(
                "add",
                Arc::new(|args| {
                    let total: i64 = args.iter().filter_map(|v| v.as_i64()).sum();
                    Ok(json!(total))
                }),
            )
            .unwrap();
        interp
            .define("fn add(a, b) { __invoke(\"add\", [a, b]) }")
            .unwrap();

        assert_eq!(interp.eval("add(2, 3)").unwrap(), json!(5));
        // A second evaluation still sees the proxy.
        assert_eq!(interp.eval("add(10, 20)").unwrap(), json!(30));
    }

    #[test]
    fn test_define_rejects_bad_syntax() {
        let (interp, _ctx) = interpreter();
        assert!(interp.define("fn broken(").is_err());
    }

    #[test]
    fn test_callable_without_proxy() {
        let (interp, _ctx) = interpreter();
        interp
            .bind_callable("answer", Arc::new(|_| Ok(json!(42))))
            .unwrap();
        assert_eq!(interp.eval("answer()").unwrap(), json!(42));
    }

    #[test]
    fn test_cancel_interrupts_busy_loop() {
        let (interp, _ctx) = interpreter();
        let flag = interp.cancel_flag();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            flag.store(true, Ordering::Relaxed);
        });
        let err = interp.eval("loop { }").unwrap_err();
        assert!(matches!(err, EvalError::Cancelled));
        handle.join().unwrap();
    }
}
