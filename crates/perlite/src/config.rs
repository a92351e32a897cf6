//! Runtime configuration observed by the execution core.
//!
//! The core reads three boolean-like environment variables, once, at
//! construction. Tests construct a `Config` directly instead of mutating the
//! process environment.

/// Which compilation backend produces an executable artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// The host-compiled emitter (the default execution mode).
    Native,
    /// The register bytecode compiler + interpreter.
    Interpreter,
}

/// Execution-core configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct Config {
    /// `EVAL_USE_INTERPRETER`: route `eval STRING` through the interpreter
    /// backend instead of the native emitter.
    pub eval_use_interpreter: bool,
    /// `EVAL_VERBOSE`: additionally print `eval` compile-time errors to
    /// standard error. Default is silent (`$@` only).
    pub eval_verbose: bool,
    /// `INTERPRETER_ONLY`: route all compilation through the interpreter
    /// backend, not just `eval`.
    pub interpreter_only: bool,
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// The variables are presence-based: any set value counts, absence
    /// means off.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            eval_use_interpreter: env_flag("EVAL_USE_INTERPRETER"),
            eval_verbose: env_flag("EVAL_VERBOSE"),
            interpreter_only: env_flag("INTERPRETER_ONLY"),
        }
    }

    /// The backend used for top-level compilation.
    #[must_use]
    pub fn script_backend(&self) -> Backend {
        if self.interpreter_only {
            Backend::Interpreter
        } else {
            Backend::Native
        }
    }

    /// The backend used for `eval STRING`.
    #[must_use]
    pub fn eval_backend(&self) -> Backend {
        if self.interpreter_only || self.eval_use_interpreter {
            Backend::Interpreter
        } else {
            Backend::Native
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var_os(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backends() {
        let config = Config::default();
        assert_eq!(config.script_backend(), Backend::Native);
        assert_eq!(config.eval_backend(), Backend::Native);
    }

    #[test]
    fn test_interpreter_only_routes_everything() {
        let config = Config {
            interpreter_only: true,
            ..Config::default()
        };
        assert_eq!(config.script_backend(), Backend::Interpreter);
        assert_eq!(config.eval_backend(), Backend::Interpreter);
    }

    #[test]
    fn test_eval_use_interpreter_routes_eval_only() {
        let config = Config {
            eval_use_interpreter: true,
            ..Config::default()
        };
        assert_eq!(config.script_backend(), Backend::Native);
        assert_eq!(config.eval_backend(), Backend::Interpreter);
    }
}
