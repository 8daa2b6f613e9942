//! The interpreter seam and the time-boxed evaluation wrapper.
//!
//! Concrete language runtimes sit behind [`Interpreter`]; the pipeline only
//! ever talks to this trait. Every evaluation is submitted to the blocking
//! worker pool and bounded by a timeout; on expiry the interpreter's cancel
//! flag is raised, which the backends observe from inside the running
//! script (best-effort interrupt).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use super::EvalError;
use crate::script::Capability;

/// A host function callable from any engine: positional JSON arguments in,
/// JSON value out. Used for the method invocation hook and the context /
/// global / output helpers.
pub type HostFn = Arc<dyn Fn(Vec<Value>) -> Result<Value, EvalError> + Send + Sync>;

/// One live engine instance. Implementations are internally locked: a
/// single instance never runs two evaluations concurrently.
pub trait Interpreter: Send + Sync {
    fn capability(&self) -> Capability;

    /// Evaluates script text against this instance. The shared context is
    /// synced into the engine before the script runs and convertible
    /// bindings are synced back afterwards.
    fn eval(&self, script: &str) -> Result<Value, EvalError>;

    /// Makes a definition text (a generated proxy) available to all
    /// subsequent evaluations on this instance.
    fn define(&self, source: &str) -> Result<(), EvalError>;

    /// Pins an engine-local value binding, re-applied on every evaluation
    /// after the context sync (used for method parameters).
    fn bind(&self, name: &str, value: Value);

    /// Binds a host function under `name`, natively callable from scripts.
    fn bind_callable(&self, name: &str, hook: HostFn) -> Result<(), EvalError>;

    /// The flag raised to interrupt a runaway evaluation.
    fn cancel_flag(&self) -> Arc<AtomicBool>;
}

/// Requests a best-effort interrupt of whatever the interpreter is
/// currently evaluating.
pub fn cancel(interpreter: &dyn Interpreter) {
    interpreter.cancel_flag().store(true, Ordering::Relaxed);
}

/// Runs one evaluation on the blocking pool, bounded by `timeout`.
///
/// On expiry the underlying task keeps its thread until the backend notices
/// the cancel flag; the caller gets `EvalError::Timeout` immediately and
/// the late result is discarded.
pub async fn run_bounded(
    interpreter: Arc<dyn Interpreter>,
    script: String,
    timeout: Duration,
) -> Result<Value, EvalError> {
    // A cancel left over from a previous run must not abort this one.
    interpreter.cancel_flag().store(false, Ordering::Relaxed);
    let worker = {
        let interpreter = interpreter.clone();
        tokio::task::spawn_blocking(move || interpreter.eval(&script))
    };

    match tokio::time::timeout(timeout, worker).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(EvalError::Panicked(join_error.to_string())),
        Err(_elapsed) => {
            debug!(
                "Evaluation exceeded {}s on {}, raising interrupt",
                timeout.as_secs(),
                interpreter.capability()
            );
            cancel(interpreter.as_ref());
            Err(EvalError::Timeout(timeout))
        }
    }
}

/// The effective evaluation bound for a definition: its configured timeout
/// capped at the global default, or the default when unconfigured.
pub fn effective_timeout(configured: Option<u64>, default_secs: u64) -> Duration {
    Duration::from_secs(configured.map_or(default_secs, |t| t.min(default_secs)))
}
