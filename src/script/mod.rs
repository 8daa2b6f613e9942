//! Script engine capabilities and the interpreter seam.
//!
//! A [`Capability`] describes everything the runtime knows about one
//! embedded scripting language: its name, how to wrap a raw definition body
//! into the exact text to evaluate, how to strip a fenced code block, and
//! how to generate the proxy source that exposes a cross-language method as
//! a native function. Capabilities form a small closed set; nothing outside
//! this module special-cases a language by name.

pub mod context;
pub mod interpreter;
pub mod lua;
pub mod rhai;
pub mod set;

use std::collections::BTreeSet;
use std::time::Duration;

/// One supported scripting language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Lua 5.4 via mlua. The default definition language.
    Lua,
    /// Rhai. The second engine; generates forwarding proxies for
    /// cross-language method calls.
    Rhai,
}

impl Capability {
    pub const ALL: [Capability; 2] = [Capability::Lua, Capability::Rhai];

    /// The lowercase engine name used in definition configs.
    pub fn name(self) -> &'static str {
        match self {
            Capability::Lua => "lua",
            Capability::Rhai => "rhai",
        }
    }

    /// Stable index into per-capability arrays.
    pub fn index(self) -> usize {
        match self {
            Capability::Lua => 0,
            Capability::Rhai => 1,
        }
    }

    pub fn from_name(name: &str) -> Result<Capability, EvalError> {
        let lowered = name.to_lowercase();
        Capability::ALL
            .into_iter()
            .find(|c| c.name() == lowered)
            .ok_or_else(|| EvalError::UnknownEngine(name.to_string()))
    }

    /// Produces the exact text to evaluate for a definition body,
    /// prepending the language's import statements.
    pub fn wrap(self, body: &str, imports: &BTreeSet<String>) -> String {
        if imports.is_empty() {
            return body.to_string();
        }
        let header: String = match self {
            Capability::Lua => imports
                .iter()
                .map(|m| format!("local {m} = require(\"{m}\")\n"))
                .collect(),
            Capability::Rhai => imports
                .iter()
                .map(|m| format!("import \"{m}\" as {m};\n"))
                .collect(),
        };
        format!("{header}{body}")
    }

    /// Strips a surrounding fenced code block, with or without this
    /// capability's language tag, if the text carries one.
    pub fn unwrap_code_block(self, text: &str) -> String {
        let Some(rest) = text.strip_prefix("```") else {
            return text.to_string();
        };
        let Some(inner) = rest.strip_suffix("```") else {
            return text.to_string();
        };
        if inner.is_empty() {
            return text.to_string();
        }
        let inner = inner
            .strip_prefix(self.name())
            .and_then(|s| s.strip_prefix('\n'))
            .unwrap_or(inner);
        let inner = inner.strip_suffix('\n').unwrap_or(inner);
        inner.to_string()
    }

    /// Generates the source of a forwarding function that makes a method
    /// natively callable in this language. `None` means this capability
    /// does not use generated proxies: Lua scripts call the invocation
    /// hook directly, since the hook is bound as a real Lua function.
    pub fn proxy(
        self,
        method_name: &str,
        _return_type: &str,
        params: &[(String, String)],
    ) -> Option<String> {
        match self {
            Capability::Lua => None,
            Capability::Rhai => {
                let names: Vec<&str> = params.iter().map(|(n, _)| n.as_str()).collect();
                Some(format!(
                    "fn {method_name}({params}) {{ __invoke(\"{method_name}\", [{args}]) }}",
                    params = names.join(", "),
                    args = names.join(", "),
                ))
            }
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Failure of one script evaluation. These are values, never panics: no
/// script may take down a worker task.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvalError {
    #[error("script evaluation failed: {0}")]
    Script(String),
    #[error("evaluation timed out after {0:?}")]
    Timeout(Duration),
    #[error("evaluation was interrupted")]
    Cancelled,
    #[error("evaluation task died: {0}")]
    Panicked(String),
    #[error("unknown engine \"{0}\"")]
    UnknownEngine(String),
    #[error("method \"{0}\" failed: {1}")]
    Method(String, String),
    #[error("method invocation depth exceeded ({0})")]
    DepthExceeded(usize),
    #[error("value cannot cross the engine boundary: {0}")]
    Value(String),
}

impl EvalError {
    /// Timeouts and interrupts are reported differently in logs, but are
    /// handled like any other evaluation failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, EvalError::Timeout(_) | EvalError::Cancelled)
    }
}
