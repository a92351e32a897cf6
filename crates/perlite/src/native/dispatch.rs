//! Per-block control-flow dispatchers.
//!
//! A dispatcher is emitted once per distinct set of visible loop labels and
//! shared by every call site within that block; a loop thunk consults it to
//! decode a marker into a local exit/continue/restart or to let the marker
//! keep propagating toward an outer frame.

use std::sync::Arc;

use crate::function::Flow;

/// How a marker resolves against the dispatcher's own (innermost) loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    /// `last`: jump to the loop's exit.
    Exit,
    /// `next`: jump to the loop's continue point.
    Continue,
    /// `redo`: restart the current iteration without advancing.
    Restart,
    /// Not ours: hand the marker to the caller.
    Propagate,
}

/// Shared dispatcher for one visible-loop configuration.
///
/// `loops` lists the labels of every loop visible at the block's scope,
/// outermost first; the dispatcher itself belongs to the innermost entry.
#[derive(Debug)]
pub(crate) struct BlockDispatcher {
    loops: Vec<Option<Arc<str>>>,
}

impl BlockDispatcher {
    /// Builds a dispatcher for the given visible-loop stack.
    #[must_use]
    pub(crate) fn new(loops: Vec<Option<Arc<str>>>) -> Self {
        Self { loops }
    }

    /// The cache key for dispatcher sharing: the label sequence.
    #[must_use]
    pub(crate) fn signature(loops: &[Option<Arc<str>>]) -> String {
        let mut key = String::new();
        for label in loops {
            match label {
                Some(name) => key.push_str(name),
                None => key.push('*'),
            }
            key.push('\0');
        }
        key
    }

    /// Decodes a marker against the innermost loop.
    ///
    /// An unlabeled marker skips the loop scan entirely and targets the
    /// innermost loop. A labeled marker matches the innermost loop's label
    /// or propagates: if the label names an outer visible loop, that loop's
    /// own dispatcher will claim the marker as it threads outward, and if
    /// it names no visible loop at all it keeps unwinding through the
    /// subroutine boundary.
    #[must_use]
    pub(crate) fn route(&self, flow: &Flow) -> Route {
        let (label, route) = match flow {
            Flow::Last { label, .. } => (label, Route::Exit),
            Flow::Next { label, .. } => (label, Route::Continue),
            Flow::Redo { label, .. } => (label, Route::Restart),
            _ => return Route::Propagate,
        };
        match label {
            // Unlabeled fast path: innermost loop, no scan.
            None => route,
            Some(name) => match self.loops.last() {
                Some(Some(own)) if own == name => route,
                _ => Route::Propagate,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn last(label: Option<&str>) -> Flow {
        Flow::Last {
            label: label.map(Arc::from),
            pos: 0,
        }
    }

    #[test]
    fn test_unlabeled_marker_takes_innermost() {
        let dispatcher = BlockDispatcher::new(vec![Some(Arc::from("OUTER")), None]);
        assert_eq!(dispatcher.route(&last(None)), Route::Exit);
    }

    #[test]
    fn test_labeled_marker_matches_own_label() {
        let dispatcher = BlockDispatcher::new(vec![Some(Arc::from("OUTER"))]);
        assert_eq!(dispatcher.route(&last(Some("OUTER"))), Route::Exit);
        assert_eq!(dispatcher.route(&last(Some("MISSING"))), Route::Propagate);
    }

    #[test]
    fn test_outer_label_propagates_to_outer_dispatcher() {
        let inner = BlockDispatcher::new(vec![Some(Arc::from("OUTER")), Some(Arc::from("INNER"))]);
        let outer = BlockDispatcher::new(vec![Some(Arc::from("OUTER"))]);
        let marker = last(Some("OUTER"));
        assert_eq!(inner.route(&marker), Route::Propagate);
        assert_eq!(outer.route(&marker), Route::Exit);
    }

    #[test]
    fn test_return_and_tailcall_always_propagate() {
        let dispatcher = BlockDispatcher::new(vec![None]);
        assert_eq!(dispatcher.route(&Flow::empty()), Route::Propagate);
    }

    #[test]
    fn test_signature_shares_equal_loop_sets() {
        let a = vec![Some(Arc::<str>::from("A")), None];
        let b = vec![Some(Arc::<str>::from("A")), None];
        assert_eq!(BlockDispatcher::signature(&a), BlockDispatcher::signature(&b));
        let c = vec![None, Some(Arc::<str>::from("A"))];
        assert_ne!(BlockDispatcher::signature(&a), BlockDispatcher::signature(&c));
    }
}
