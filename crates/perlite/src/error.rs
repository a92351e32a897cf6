use std::fmt;
use std::sync::Arc;

use strum::{Display, IntoStaticStr};

use crate::ast::Pos;
use crate::value::Scalar;

/// Result type alias for operations that can produce a Perl-level error.
pub type PerlResult<T> = Result<T, PerlError>;

/// Error kinds recognized by the execution core.
///
/// Uses strum derives for automatic `Display` and `Into<&'static str>`.
/// The kind determines catchability: `Compile` is fatal to the compilation
/// unit, `Runtime` and `ControlFlow` are catchable by an enclosing `eval`
/// block, `Recursion` and `Internal` are surfaced loudly and never caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum ErrorKind {
    /// Malformed input reaching the compiler. Fatal to the current unit.
    Compile,
    /// Undefined operation on a value kind, or a `die`. Catchable.
    Runtime,
    /// `last`/`next`/`redo` addressed to a label not found anywhere in the
    /// call chain. Catchable.
    ControlFlow,
    /// The recursion-depth guard tripped. Distinct from Perl-level errors.
    Recursion,
    /// An implementation bug: a missing dispatch case, a register holding
    /// the wrong value kind. Carries opcode number and program counter in
    /// the message where applicable.
    Internal,
}

/// A raised Perl-level error.
///
/// Carries the die value as a scalar so `die $object` round-trips through
/// `$@` unchanged. Plain message errors hold a string scalar. A source
/// position may be attached at raise time and resolved to `file`/`line`
/// when the error crosses an artifact that owns location metadata.
#[derive(Debug, Clone)]
pub struct PerlError {
    kind: ErrorKind,
    value: Scalar,
    pos: Option<Pos>,
    location: Option<(Arc<str>, u32)>,
}

impl PerlError {
    /// Creates a compile error from a message and a token position index.
    pub fn compile(message: impl Into<String>, pos: Pos) -> Self {
        Self {
            kind: ErrorKind::Compile,
            value: Scalar::from_string(message.into()),
            pos: Some(pos),
            location: None,
        }
    }

    /// Creates a catchable runtime error.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Runtime,
            value: Scalar::from_string(message.into()),
            pos: None,
            location: None,
        }
    }

    /// Creates a catchable control-flow error for an unmatched loop label.
    ///
    /// `kind_name` is the operator name (`last`, `next`, `redo`).
    pub fn unmatched_control(kind_name: &str, label: Option<&str>) -> Self {
        let message = match label {
            Some(l) => format!("Label not found for \"{kind_name} {l}\""),
            None => format!("Can't \"{kind_name}\" outside a loop block"),
        };
        Self {
            kind: ErrorKind::ControlFlow,
            value: Scalar::from_string(message),
            pos: None,
            location: None,
        }
    }

    /// Creates a recursion-guard error. Not catchable by `eval`.
    pub fn recursion(depth: usize) -> Self {
        Self {
            kind: ErrorKind::Recursion,
            value: Scalar::from_string(format!("Deep recursion limit exceeded at depth {depth}")),
            pos: None,
            location: None,
        }
    }

    /// Creates an internal error for implementation bugs.
    ///
    /// These must be loud: they are never caught by `eval` frames.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            value: Scalar::from_string(message.into()),
            pos: None,
            location: None,
        }
    }

    /// Creates a runtime error carrying an arbitrary die value.
    ///
    /// Reference values propagate unchanged so `die $object` can be caught
    /// and inspected through `$@`.
    pub fn die_value(value: Scalar) -> Self {
        Self {
            kind: ErrorKind::Runtime,
            value,
            pos: None,
            location: None,
        }
    }

    /// Attaches a resolved file/line location if none is present yet.
    ///
    /// The innermost frame that knows its source location wins; outer
    /// frames leave an already-located error untouched.
    #[must_use]
    pub fn with_location(mut self, file: Arc<str>, line: u32) -> Self {
        if self.location.is_none() {
            self.location = Some((file, line));
        }
        self
    }

    /// The error kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The raw token position attached at raise time, if any.
    #[must_use]
    pub fn pos(&self) -> Option<Pos> {
        self.pos
    }

    /// Whether an enclosing `eval` frame may catch this error.
    #[must_use]
    pub fn catchable(&self) -> bool {
        matches!(self.kind, ErrorKind::Runtime | ErrorKind::ControlFlow)
    }

    /// The die value as raised, without location decoration.
    #[must_use]
    pub fn value(&self) -> &Scalar {
        &self.value
    }

    /// Plain message text, without overload dispatch or location suffix.
    #[must_use]
    pub fn message(&self) -> String {
        self.value.plain_message()
    }

    /// The scalar stored into `$@` when this error is caught.
    ///
    /// String messages gain the conventional ` at FILE line N.` suffix and
    /// trailing newline unless the message already ends with a newline;
    /// non-string die values pass through unchanged.
    #[must_use]
    pub fn to_err_var(&self) -> Scalar {
        if self.value.is_plain_message() {
            let mut message = self.message();
            if !message.ends_with('\n') {
                if let Some((file, line)) = &self.location {
                    message.push_str(&format!(" at {file} line {line}."));
                }
                message.push('\n');
            }
            Scalar::from_string(message)
        } else {
            self.value.clone()
        }
    }
}

impl fmt::Display for PerlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())?;
        if let Some((file, line)) = &self.location {
            write!(f, " at {file} line {line}.")?;
        }
        Ok(())
    }
}

impl std::error::Error for PerlError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_catchable() {
        let err = PerlError::runtime("Illegal division by zero");
        assert!(err.catchable());
        assert_eq!(err.kind(), ErrorKind::Runtime);
    }

    #[test]
    fn test_internal_not_catchable() {
        assert!(!PerlError::internal("missing opcode 0xfe at pc 12").catchable());
        assert!(!PerlError::recursion(100_000).catchable());
    }

    #[test]
    fn test_err_var_gets_location_suffix() {
        let err = PerlError::runtime("boom").with_location("t.pl".into(), 3);
        let var = err.to_err_var();
        assert_eq!(var.plain_message(), "boom at t.pl line 3.\n");
    }

    #[test]
    fn test_err_var_keeps_explicit_newline() {
        let err = PerlError::runtime("quiet\n").with_location("t.pl".into(), 3);
        assert_eq!(err.to_err_var().plain_message(), "quiet\n");
    }

    #[test]
    fn test_first_location_wins() {
        let err = PerlError::runtime("x")
            .with_location("inner.pl".into(), 1)
            .with_location("outer.pl".into(), 9);
        assert_eq!(format!("{err}"), "x at inner.pl line 1.");
    }
}
