//! Dynamic string evaluation policy.
//!
//! A string eval may compile through either backend. The native emitter
//! amortizes well when the same string is evaluated repeatedly (the
//! artifact is cached per source string and host-optimized); the
//! interpreter backend wins overwhelmingly on workloads of distinct
//! strings because it skips artifact-construction overhead entirely. The
//! `EVAL_USE_INTERPRETER` and `INTERPRETER_ONLY` switches choose.
//!
//! Interpreter-backed evals integrate through the marker artifact: the
//! call site holds one fixed wrapper sub whose apply resolves a generated
//! id in the process-wide registry and delegates, so the call site is the
//! same regardless of backend.

use std::fmt::Write as _;
use std::sync::Arc;

use ahash::AHashMap;

use crate::bytecode::{self, CompileOptions};
use crate::ast::CompileCtx;
use crate::config::Backend;
use crate::container::ArrayRef;
use crate::error::{ErrorKind, PerlResult};
use crate::function::{CodeRef, Flow, Sub};
use crate::native;
use crate::run::{Interp, flow_to_error};
use crate::tracer::TraceEvent;
use crate::value::{Context, List};

impl Interp {
    /// Evaluates a source string in the current lexical environment.
    ///
    /// Errors — compile-time and runtime — are caught here: `$@` is set,
    /// the result is the empty list, and execution continues. A successful
    /// eval clears `$@`.
    pub fn eval_string(
        &mut self,
        source: &str,
        lexicals: &AHashMap<Arc<str>, Arc<str>>,
        cx: Context,
    ) -> PerlResult<List> {
        match self.eval_uncaught(source, lexicals, cx) {
            Ok(list) => {
                self.env().clear_err_var();
                Ok(list)
            }
            Err(error) if error.catchable() || error.kind() == ErrorKind::Compile => {
                self.env().set_err_var(error.to_err_var());
                if error.kind() == ErrorKind::Compile && self.config().eval_verbose {
                    let mut line = error.to_string();
                    line.push('\n');
                    self.write_err(&line);
                }
                Ok(List::new())
            }
            Err(error) => Err(error),
        }
    }

    fn eval_uncaught(
        &mut self,
        source: &str,
        lexicals: &AHashMap<Arc<str>, Arc<str>>,
        cx: Context,
    ) -> PerlResult<List> {
        let backend = self.config().eval_backend();
        let code = self.eval_artifact(source, lexicals, backend)?;
        match self.apply(&code, ArrayRef::new(), cx)? {
            Flow::Ret(list) => Ok(list),
            marker => Err(flow_to_error(&marker)),
        }
    }

    fn eval_artifact(
        &mut self,
        source: &str,
        lexicals: &AHashMap<Arc<str>, Arc<str>>,
        backend: Backend,
    ) -> PerlResult<CodeRef> {
        let ctx = CompileCtx::new("(eval)");
        let opts = CompileOptions {
            sub_backend: None,
            outer_lexicals: lexicals.clone(),
        };
        match backend {
            Backend::Native => {
                let key = cache_key(source, lexicals);
                if let Some(cached) = self.eval_cache.get(&key) {
                    let cached = cached.clone();
                    self.trace(TraceEvent::EvalCompile {
                        backend,
                        cached: true,
                    });
                    return Ok(cached);
                }
                let body = self.parse_source(source)?;
                let code = native::emit_script(self.env(), &body, &ctx, &opts)?;
                self.eval_cache.insert(key, code.clone());
                self.trace(TraceEvent::EvalCompile {
                    backend,
                    cached: false,
                });
                Ok(code)
            }
            Backend::Interpreter => {
                let body = self.parse_source(source)?;
                let code = bytecode::compile_script(self.env(), &body, &ctx, &opts)?;
                let id = self.env().register_eval(code);
                self.trace(TraceEvent::EvalCompile {
                    backend,
                    cached: false,
                });
                Ok(Arc::new(Sub::eval_marker(id)))
            }
        }
    }
}

/// Native-backend cache key: the source string plus the lexical bindings
/// it closes over, so identical strings in different lexical environments
/// never share an artifact.
fn cache_key(source: &str, lexicals: &AHashMap<Arc<str>, Arc<str>>) -> String {
    let mut entries: Vec<_> = lexicals.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    let mut key = String::with_capacity(source.len() + entries.len() * 16);
    key.push_str(source);
    for (name, persistent) in entries {
        let _ = write!(key, "\0{name}\0{persistent}");
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_distinguishes_lexical_environments() {
        let mut a = AHashMap::new();
        a.insert(Arc::<str>::from("$w"), Arc::<str>::from("Perlite::_BEGIN_0::w"));
        let mut b = AHashMap::new();
        b.insert(Arc::<str>::from("$w"), Arc::<str>::from("Perlite::_BEGIN_1::w"));
        assert_ne!(cache_key("$w * 2", &a), cache_key("$w * 2", &b));
        assert_eq!(cache_key("$w * 2", &a), cache_key("$w * 2", &a));
    }

    #[test]
    fn test_eval_needs_a_parser() {
        let env = crate::env::Environment::new();
        let mut interp = Interp::new(env);
        let result = interp
            .eval_string("1 + 1", &AHashMap::new(), Context::Scalar)
            .unwrap();
        // No parser installed: eval fails quietly, $@ is set.
        assert!(result.is_empty());
        assert!(
            interp
                .env()
                .err_var()
                .plain_message()
                .contains("no parser installed")
        );
    }
}
