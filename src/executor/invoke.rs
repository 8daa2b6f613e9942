//! The generic method invocation hook.
//!
//! Bound under each method's name in every engine of an invocation, the
//! hook lets a script in any language call a method declared in any other:
//! it spins up a brand-new interpreter of the method's declaring
//! capability, copies the current shared-context bindings into it, binds
//! the declared parameters positionally, and evaluates the method body on
//! the worker pool under the method's own timeout. Failures propagate to
//! the calling script as catchable evaluation errors.

use std::sync::Arc;

use serde_json::Value;
use tokio::runtime::Handle;

use crate::registry::definition::Method;
use crate::script::context::{GlobalStore, SharedContext};
use crate::script::interpreter::{effective_timeout, run_bounded, HostFn};
use crate::script::set::{bind_store_helpers, new_interpreter};
use crate::script::EvalError;

use super::outcome::bind_output_helpers;

/// Nested invocations consume worker-pool slots from inside other worker
/// tasks; the depth bound keeps a recursive method from exhausting the
/// pool before anything useful happens.
pub const MAX_INVOKE_DEPTH: usize = 16;

#[derive(Clone)]
pub struct MethodInvoker {
    method: Arc<Method>,
    /// Every registered method, rebound into the fresh interpreter so
    /// methods can call methods.
    methods: Arc<Vec<Arc<Method>>>,
    ctx: SharedContext,
    global: Arc<GlobalStore>,
    default_timeout: u64,
    handle: Handle,
    depth: usize,
}

impl MethodInvoker {
    pub fn new(
        method: Arc<Method>,
        methods: Arc<Vec<Arc<Method>>>,
        ctx: SharedContext,
        global: Arc<GlobalStore>,
        default_timeout: u64,
        handle: Handle,
    ) -> Self {
        Self {
            method,
            methods,
            ctx,
            global,
            default_timeout,
            handle,
            depth: 0,
        }
    }

    /// The hook as a host function callable from any engine.
    pub fn host_fn(self) -> HostFn {
        Arc::new(move |args| self.invoke(args))
    }

    fn at_depth(&self, method: Arc<Method>) -> Self {
        Self {
            method,
            methods: self.methods.clone(),
            ctx: self.ctx.clone(),
            global: self.global.clone(),
            default_timeout: self.default_timeout,
            handle: self.handle.clone(),
            depth: self.depth + 1,
        }
    }

    fn invoke(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        if self.depth >= MAX_INVOKE_DEPTH {
            return Err(EvalError::DepthExceeded(MAX_INVOKE_DEPTH));
        }

        // The method runs against a copy of the caller's bindings; its own
        // assignments stay local to the invocation.
        let fork = self.ctx.fork();
        let interpreter = new_interpreter(self.method.capability(), fork.clone())?;
        bind_store_helpers(&interpreter, fork.clone(), self.global.clone())?;
        bind_output_helpers(&interpreter)?;

        for sibling in self.methods.iter() {
            let forked = Self {
                ctx: fork.clone(),
                ..self.at_depth(sibling.clone())
            };
            interpreter.bind_callable(sibling.name(), forked.host_fn())?;
            if let Some(proxy) = sibling.proxy(self.method.capability()) {
                // A broken proxy skips that method here, like at step 3.
                let _ = interpreter.define(&proxy);
            }
        }

        for (index, (name, _token)) in self.method.params().iter().enumerate() {
            interpreter.bind(name, args.get(index).cloned().unwrap_or(Value::Null));
        }

        let timeout = effective_timeout(self.method.config().timeout(), self.default_timeout);
        let script = self.method.wrapped().to_string();
        let result = self
            .handle
            .block_on(run_bounded(interpreter, script, timeout))
            .map_err(|e| EvalError::Method(self.method.name().to_string(), e.to_string()))?;

        if self.method.return_type() == "void" {
            Ok(Value::Null)
        } else {
            Ok(result)
        }
    }
}
