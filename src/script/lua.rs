//! Lua engine instance (mlua, Lua 5.4).
//!
//! Bindings cross the engine boundary as JSON values via mlua's serde
//! support. The shared context is written into the Lua globals before each
//! evaluation; afterwards, globals that are new (not part of the pristine
//! state captured at construction) or that shadow a context key are read
//! back. The cancel flag is observed from an instruction-count hook.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use mlua::{Lua, LuaSerdeExt, MultiValue};
use serde_json::Value;
use tracing::trace;

use super::interpreter::{HostFn, Interpreter};
use super::{Capability, EvalError};
use crate::script::context::SharedContext;

/// How many VM instructions run between interrupt checks.
const INTERRUPT_CHECK_INSTRUCTIONS: u32 = 10_000;

pub struct LuaInterpreter {
    state: Mutex<LuaState>,
    ctx: SharedContext,
    cancel: Arc<AtomicBool>,
}

struct LuaState {
    lua: Lua,
    /// Global names present before any user script ran (the stdlib).
    baseline: HashSet<String>,
    /// Engine-local bindings re-applied on every evaluation.
    pinned: Vec<(String, Value)>,
}

impl LuaInterpreter {
    pub fn new(ctx: SharedContext) -> Result<Self, EvalError> {
        let lua = Lua::new();
        let cancel = Arc::new(AtomicBool::new(false));

        let flag = cancel.clone();
        lua.set_hook(
            mlua::HookTriggers {
                every_nth_instruction: Some(INTERRUPT_CHECK_INSTRUCTIONS),
                ..Default::default()
            },
            move |_lua, _debug| {
                if flag.load(Ordering::Relaxed) {
                    Err(mlua::Error::external(EvalError::Cancelled))
                } else {
                    Ok(())
                }
            },
        );

        let mut baseline = HashSet::new();
        for pair in lua.globals().pairs::<mlua::Value, mlua::Value>() {
            let (key, _) = pair.map_err(lua_err)?;
            if let mlua::Value::String(s) = key {
                baseline.insert(s.to_str().map_err(lua_err)?.to_string());
            }
        }

        Ok(Self {
            state: Mutex::new(LuaState {
                lua,
                baseline,
                pinned: Vec::new(),
            }),
            ctx,
            cancel,
        })
    }

    fn sync_in(&self, state: &LuaState) -> Result<(), EvalError> {
        for (key, value) in self.ctx.snapshot() {
            let lua_value = state.lua.to_value(&value).map_err(lua_err)?;
            state
                .lua
                .globals()
                .set(key.as_str(), lua_value)
                .map_err(lua_err)?;
        }
        for (key, value) in &state.pinned {
            let lua_value = state.lua.to_value(value).map_err(lua_err)?;
            state
                .lua
                .globals()
                .set(key.as_str(), lua_value)
                .map_err(lua_err)?;
        }
        Ok(())
    }

    fn sync_out(&self, state: &LuaState) {
        for pair in state.lua.globals().pairs::<mlua::Value, mlua::Value>() {
            let Ok((key, value)) = pair else { continue };
            let mlua::Value::String(key) = key else { continue };
            let Ok(key) = key.to_str() else { continue };

            // Untouched stdlib entries stay out of the shared context.
            if state.baseline.contains(key) && !self.ctx.contains(key) {
                continue;
            }
            match state.lua.from_value::<Value>(value) {
                Ok(json) => self.ctx.set(key, json),
                // Functions, userdata, recursive tables: engine-local.
                Err(e) => trace!("Not mirroring lua global {key}: {e}"),
            }
        }
    }
}

impl Interpreter for LuaInterpreter {
    fn capability(&self) -> Capability {
        Capability::Lua
    }

    fn eval(&self, script: &str) -> Result<Value, EvalError> {
        let state = self.state.lock().unwrap();
        // An interrupt raised while this evaluation was still queued
        // cancels it before it starts.
        if self.cancel.swap(false, Ordering::Relaxed) {
            return Err(EvalError::Cancelled);
        }

        self.sync_in(&state)?;
        let evaluated = state.lua.load(script).eval::<mlua::Value>();
        let result = match evaluated {
            Ok(value) => state.lua.from_value::<Value>(value).unwrap_or(Value::Null),
            Err(e) => {
                // The context may be partially mutated at this point; that
                // matches the semantics of an aborted script.
                if self.cancel.swap(false, Ordering::Relaxed) {
                    return Err(EvalError::Cancelled);
                }
                return Err(EvalError::Script(e.to_string()));
            }
        };
        self.cancel.store(false, Ordering::Relaxed);
        self.sync_out(&state);
        Ok(result)
    }

    fn define(&self, source: &str) -> Result<(), EvalError> {
        let state = self.state.lock().unwrap();
        state
            .lua
            .load(source)
            .exec()
            .map_err(|e| EvalError::Script(e.to_string()))
    }

    fn bind(&self, name: &str, value: Value) {
        let mut state = self.state.lock().unwrap();
        state.pinned.push((name.to_string(), value));
    }

    fn bind_callable(&self, name: &str, hook: HostFn) -> Result<(), EvalError> {
        let state = self.state.lock().unwrap();
        let function = state
            .lua
            .create_function(move |lua, args: MultiValue| {
                let mut json_args = Vec::with_capacity(args.len());
                for arg in args {
                    json_args.push(lua.from_value::<Value>(arg).unwrap_or(Value::Null));
                }
                match hook(json_args) {
                    Ok(value) => lua.to_value(&value),
                    Err(e) => Err(mlua::Error::external(e)),
                }
            })
            .map_err(lua_err)?;
        let result = state.lua.globals().set(name, function).map_err(lua_err);
        result
    }

    fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }
}

fn lua_err(e: mlua::Error) -> EvalError {
    EvalError::Script(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn interpreter() -> (LuaInterpreter, SharedContext) {
        let ctx = SharedContext::new();
        let interp = LuaInterpreter::new(ctx.clone()).unwrap();
        (interp, ctx)
    }

    #[test]
    fn test_eval_expression() {
        let (interp, _ctx) = interpreter();
        assert_eq!(interp.eval("\"pong\"").unwrap(), json!("pong"));
        assert_eq!(interp.eval("1 + 2").unwrap(), json!(3));
    }

    #[test]
    fn test_context_is_visible_and_written_back() {
        let (interp, ctx) = interpreter();
        ctx.set("args", json!("7"));

        let result = interp.eval("doubled = tonumber(args) * 2\nreturn doubled").unwrap();
        assert_eq!(result, json!(14));
        assert_eq!(ctx.get("doubled"), Some(json!(14)));
    }

    #[test]
    fn test_stdlib_globals_stay_out_of_context() {
        let (interp, ctx) = interpreter();
        interp.eval("x = 1").unwrap();
        assert!(ctx.get("print").is_none());
        assert_eq!(ctx.get("x"), Some(json!(1)));
    }

    #[test]
    fn test_script_error_is_a_value() {
        let (interp, _ctx) = interpreter();
        let err = interp.eval("error('nope')").unwrap_err();
        assert!(matches!(err, EvalError::Script(_)));
    }

    #[test]
    fn test_callable_receives_json_args() {
        let (interp, _ctx) = interpreter();
        interp
            .bind_callable(
                "sum",
                Arc::new(|args| {
                    let total: i64 = args.iter().filter_map(|v| v.as_i64()).sum();
                    Ok(json!(total))
                }),
            )
            .unwrap();
        assert_eq!(interp.eval("sum(1, 2, 3)").unwrap(), json!(6));
    }

    #[test]
    fn test_callable_error_propagates_as_script_error() {
        let (interp, _ctx) = interpreter();
        interp
            .bind_callable(
                "boom",
                Arc::new(|_| Err(EvalError::Method("boom".into(), "broken".into()))),
            )
            .unwrap();
        assert!(interp.eval("boom()").is_err());
        // ...and is catchable from the script.
        let caught = interp.eval("local ok = pcall(boom)\nreturn ok").unwrap();
        assert_eq!(caught, json!(false));
    }

    #[test]
    fn test_pinned_bindings_apply_each_eval() {
        let (interp, _ctx) = interpreter();
        interp.bind("a", json!(2));
        interp.bind("b", json!(3));
        assert_eq!(interp.eval("a + b").unwrap(), json!(5));
    }

    #[test]
    fn test_cancel_interrupts_busy_loop() {
        let (interp, _ctx) = interpreter();
        let flag = interp.cancel_flag();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            flag.store(true, Ordering::Relaxed);
        });
        let err = interp.eval("while true do end").unwrap_err();
        assert!(matches!(err, EvalError::Cancelled));
        handle.join().unwrap();
    }
}
