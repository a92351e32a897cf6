//! Execution tracing hooks.
//!
//! The interpreter and the emitted runtime report coarse events through an
//! `ExecTracer`. The default is no tracer at all (the hot loop skips the
//! hook entirely); `StderrTracer` gives a quick diagnostic stream and
//! `RecordingTracer` captures events for assertions in tests.

use std::sync::Arc;

use crate::config::Backend;
use crate::value::Context;

/// A single traced event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// An opcode is about to execute at `pc`.
    Op {
        /// Program counter of the instruction.
        pc: usize,
        /// Static opcode name.
        op: &'static str,
    },
    /// A subroutine is being applied.
    Call {
        /// Qualified name, or `__ANON__` for anonymous subs.
        name: Arc<str>,
        /// Calling context for the invocation.
        context: Context,
    },
    /// A subroutine returned; `marker` names a control-flow marker kind
    /// (`last`, `next`, `redo`, `tailcall`) when the return is one.
    Return {
        /// Marker kind if the return value is a control-flow marker.
        marker: Option<&'static str>,
    },
    /// A string eval was compiled.
    EvalCompile {
        /// Which backend compiled the string.
        backend: Backend,
        /// Whether the artifact came from the per-string cache.
        cached: bool,
    },
}

/// Receiver for execution events.
pub trait ExecTracer: Send {
    /// Called for every traced event.
    fn event(&mut self, event: &TraceEvent);
}

/// Tracer that discards all events.
#[derive(Debug, Default)]
pub struct NoopTracer;

impl ExecTracer for NoopTracer {
    fn event(&mut self, _event: &TraceEvent) {}
}

/// Tracer that prints events to standard error, one per line.
#[derive(Debug, Default)]
pub struct StderrTracer;

impl ExecTracer for StderrTracer {
    fn event(&mut self, event: &TraceEvent) {
        eprintln!("trace: {event:?}");
    }
}

/// Tracer that records events for later inspection.
///
/// The event log is shared: clone the tracer before installing it and
/// read `snapshot()` from the clone after the run.
#[derive(Debug, Clone, Default)]
pub struct RecordingTracer {
    events: std::sync::Arc<std::sync::Mutex<Vec<TraceEvent>>>,
}

impl RecordingTracer {
    /// Creates an empty recording tracer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the events recorded so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TraceEvent> {
        self.events.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }
}

impl ExecTracer for RecordingTracer {
    fn event(&mut self, event: &TraceEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event.clone());
    }
}
