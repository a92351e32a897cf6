//! Runtime value model.
//!
//! The scalar is the unit of Perl data: a tagged union over undef, integer,
//! double, string, and the handle kinds (references, globs, code). Scalars
//! live in *slots* (`ScalarRef`) — shared, addressable storage cells.
//! Assignment through a slot mutates the cell in place (`set` semantics) so
//! every alias observes the update; replacing the handle is a distinct
//! operation used only when creating a new binding.
//!
//! Operations in this module are the *plain* (non-overloaded) layer: pure
//! functions over scalar values. Overload-aware dispatch wraps them in the
//! interpreter facade, which falls back here when no overload applies.

use std::cmp::Ordering;
use std::fmt::Write as _;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use smallvec::SmallVec;

use crate::container::{Array, ArrayRef, Hash, HashRef};
use crate::error::{PerlError, PerlResult};
use crate::function::{CodeRef, Sub};
use crate::intern::{ClassId, Interner};

/// Acquires a read guard, ignoring poisoning.
///
/// A poisoned lock means another thread panicked mid-operation; the value is
/// still structurally valid for Perl semantics, so we continue.
pub(crate) fn read_guard<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

/// Acquires a write guard, ignoring poisoning.
pub(crate) fn write_guard<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Calling context accompanying every subroutine call.
///
/// `Runtime` defers to the caller's own context, which every frame keeps in
/// its reserved context register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Context {
    /// Result discarded.
    Void = 0,
    /// A single scalar is wanted.
    Scalar = 1,
    /// A list is wanted.
    List = 2,
    /// Propagate the caller's context.
    Runtime = 3,
}

impl Context {
    /// Decodes a context tag from its bytecode operand byte.
    #[must_use]
    pub fn from_u8(byte: u8) -> Self {
        match byte {
            0 => Self::Void,
            1 => Self::Scalar,
            3 => Self::Runtime,
            _ => Self::List,
        }
    }
}

/// A Perl scalar value.
///
/// Cheap to clone: string payloads and handles are shared `Arc`s. Mutation
/// of shared state happens through slots, never through a `Scalar` value.
#[derive(Debug, Clone, Default)]
pub enum Scalar {
    /// The undefined value.
    #[default]
    Undef,
    /// Integer value.
    Int(i64),
    /// Floating-point value.
    Num(f64),
    /// String value. Always valid UTF-8; see DESIGN.md on the collapsed
    /// byte-string representation.
    Str(Arc<str>),
    /// A strong reference to a container or slot.
    Ref(Ref),
    /// A weak reference: never counts toward reachability, resolves to
    /// `Undef` once the target is dropped.
    Weak(WeakRef),
    /// A glob: the identity of a symbol-table entry.
    Glob(GlobRef),
    /// An invocable subroutine.
    Code(CodeRef),
}

/// A strong reference handle.
#[derive(Debug, Clone)]
pub enum Ref {
    /// Reference to a scalar slot (`\$x`).
    Scalar(ScalarRef),
    /// Reference to an array (`\@a` or `[...]`).
    Array(ArrayRef),
    /// Reference to a hash (`\%h` or `{...}`).
    Hash(HashRef),
    /// Reference to code (`\&f` or `sub {...}`).
    Code(CodeRef),
}

impl Ref {
    /// The `ref()` type string for an unblessed reference.
    #[must_use]
    pub fn type_str(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "SCALAR",
            Self::Array(_) => "ARRAY",
            Self::Hash(_) => "HASH",
            Self::Code(_) => "CODE",
        }
    }

    /// Stable address of the referent, used for identity and stringification.
    #[must_use]
    pub fn addr(&self) -> usize {
        match self {
            Self::Scalar(slot) => Arc::as_ptr(&slot.0) as usize,
            Self::Array(array) => array.addr(),
            Self::Hash(hash) => hash.addr(),
            Self::Code(code) => Arc::as_ptr(code).cast::<()>() as usize,
        }
    }

    /// The bless tag of the referent, if any.
    #[must_use]
    pub fn blessed(&self) -> Option<ClassId> {
        match self {
            Self::Array(array) => array.blessed(),
            Self::Hash(hash) => hash.blessed(),
            Self::Scalar(_) | Self::Code(_) => None,
        }
    }

    /// Whether the referent is blessed into a class with overloads.
    #[must_use]
    pub fn overloaded(&self) -> bool {
        match self {
            Self::Array(array) => array.overloaded(),
            Self::Hash(hash) => hash.overloaded(),
            Self::Scalar(_) | Self::Code(_) => false,
        }
    }

    /// Identity comparison: true when both handles point at the same storage.
    #[must_use]
    pub fn is(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

/// A weak reference handle.
#[derive(Debug, Clone)]
pub enum WeakRef {
    /// Weak handle to a scalar slot.
    Scalar(Weak<RwLock<Scalar>>),
    /// Weak handle to an array.
    Array(Weak<RwLock<Array>>),
    /// Weak handle to a hash.
    Hash(Weak<RwLock<Hash>>),
}

impl WeakRef {
    /// Upgrades to a strong reference, or `Undef` if the target is gone.
    #[must_use]
    pub fn upgrade(&self) -> Scalar {
        match self {
            Self::Scalar(weak) => weak
                .upgrade()
                .map_or(Scalar::Undef, |inner| Scalar::Ref(Ref::Scalar(ScalarRef(inner)))),
            Self::Array(weak) => weak
                .upgrade()
                .map_or(Scalar::Undef, |inner| Scalar::Ref(Ref::Array(ArrayRef::from_arc(inner)))),
            Self::Hash(weak) => weak
                .upgrade()
                .map_or(Scalar::Undef, |inner| Scalar::Ref(Ref::Hash(HashRef::from_arc(inner)))),
        }
    }
}

/// The identity of a symbol-table entry (`*main::foo`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobRef {
    /// Owning package.
    pub package: Arc<str>,
    /// Entry name within the package.
    pub name: Arc<str>,
}

/// A shared, addressable scalar slot.
///
/// This is the storage cell both execution modes bind to; captured lexicals
/// and package globals are slots published in the environment.
#[derive(Debug, Clone)]
pub struct ScalarRef(Arc<RwLock<Scalar>>);

impl Default for ScalarRef {
    fn default() -> Self {
        Self::undef()
    }
}

impl ScalarRef {
    /// Creates a fresh slot holding `value`.
    #[must_use]
    pub fn new(value: Scalar) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    /// Creates a fresh undefined slot.
    #[must_use]
    pub fn undef() -> Self {
        Self::new(Scalar::Undef)
    }

    /// Reads the current value out of the slot.
    #[must_use]
    pub fn get(&self) -> Scalar {
        read_guard(&self.0).clone()
    }

    /// Mutates the slot in place. Every alias observes the new value.
    pub fn set(&self, value: Scalar) {
        *write_guard(&self.0) = value;
    }

    /// True when both handles address the same slot.
    #[must_use]
    pub fn is(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Creates a weak handle to this slot.
    #[must_use]
    pub fn downgrade(&self) -> WeakRef {
        WeakRef::Scalar(Arc::downgrade(&self.0))
    }

    /// Applies `f` to the slot contents under the write lock.
    ///
    /// Used by the in-place superinstructions so increment does not
    /// round-trip through a detached value.
    pub fn update<R>(&self, f: impl FnOnce(&mut Scalar) -> R) -> R {
        f(&mut write_guard(&self.0))
    }
}

/// A numeric coercion result: integers stay integers until forced wider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    /// Integer-valued.
    Int(i64),
    /// Double-valued.
    Num(f64),
}

impl Numeric {
    /// Widens to a double.
    #[must_use]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(value) => value as f64,
            Self::Num(value) => value,
        }
    }

    /// Truncates to an integer.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Int(value) => value,
            Self::Num(value) => {
                if value.is_nan() {
                    0
                } else {
                    value.trunc() as i64
                }
            }
        }
    }

    /// Rewraps as a scalar value.
    #[must_use]
    pub fn into_scalar(self) -> Scalar {
        match self {
            Self::Int(value) => Scalar::Int(value),
            Self::Num(value) => Scalar::Num(value),
        }
    }
}

/// Parses the numeric prefix of a string, Perl-style.
///
/// Leading whitespace is skipped, then an optional sign, digits, fraction,
/// and exponent are consumed; trailing garbage is ignored. A string with no
/// numeric prefix is 0.
#[must_use]
pub fn parse_numeric_prefix(text: &str) -> Numeric {
    let trimmed = text.trim_start();
    let bytes = trimmed.as_bytes();
    let mut end = 0usize;
    let mut seen_digit = false;
    let mut is_float = false;

    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
        seen_digit = true;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        let mut frac = end + 1;
        while frac < bytes.len() && bytes[frac].is_ascii_digit() {
            frac += 1;
            seen_digit = true;
        }
        if frac > end + 1 {
            end = frac;
            is_float = true;
        }
    }
    if seen_digit && end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp = end + 1;
        if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
            exp += 1;
        }
        let digits_start = exp;
        while exp < bytes.len() && bytes[exp].is_ascii_digit() {
            exp += 1;
        }
        if exp > digits_start {
            end = exp;
            is_float = true;
        }
    }

    if !seen_digit {
        return Numeric::Int(0);
    }
    let prefix = &trimmed[..end];
    if is_float {
        Numeric::Num(prefix.parse::<f64>().unwrap_or(0.0))
    } else {
        match prefix.parse::<i64>() {
            Ok(value) => Numeric::Int(value),
            // Integer literal too wide for i64: fall over to a double.
            Err(_) => Numeric::Num(prefix.parse::<f64>().unwrap_or(0.0)),
        }
    }
}

/// Formats a double the way Perl prints numbers.
///
/// Integral doubles print without a fractional part; everything else goes
/// through shortest-representation formatting.
#[must_use]
pub fn format_f64(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Inf".to_string() } else { "-Inf".to_string() };
    }
    if value == value.trunc() && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }
    let mut buffer = ryu::Buffer::new();
    buffer.format(value).to_string()
}

impl Scalar {
    /// Creates a string scalar from an owned string.
    #[must_use]
    pub fn from_string(text: String) -> Self {
        Self::Str(Arc::from(text))
    }

    /// Creates a string scalar from a string slice.
    #[must_use]
    pub fn from_str_slice(text: &str) -> Self {
        Self::Str(Arc::from(text))
    }

    /// The Perl boolean values: 1 for true, the empty string for false.
    #[must_use]
    pub fn from_bool(value: bool) -> Self {
        if value { Self::Int(1) } else { Self::Str(Arc::from("")) }
    }

    /// True unless the value is undef, zero, `""`, or `"0"`.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Self::Undef => false,
            Self::Int(value) => *value != 0,
            Self::Num(value) => *value != 0.0,
            Self::Str(text) => !(text.is_empty() || &**text == "0"),
            Self::Weak(weak) => weak.upgrade().truthy(),
            Self::Ref(_) | Self::Glob(_) | Self::Code(_) => true,
        }
    }

    /// Whether the value is undef.
    #[must_use]
    pub fn is_undef(&self) -> bool {
        matches!(self, Self::Undef)
    }

    /// Coerces to a numeric value. Undef is 0, strings parse by prefix,
    /// references numify to their address.
    #[must_use]
    pub fn numify(&self) -> Numeric {
        match self {
            Self::Undef => Numeric::Int(0),
            Self::Int(value) => Numeric::Int(*value),
            Self::Num(value) => Numeric::Num(*value),
            Self::Str(text) => parse_numeric_prefix(text),
            Self::Ref(handle) => Numeric::Int(handle.addr() as i64),
            Self::Weak(weak) => weak.upgrade().numify(),
            Self::Glob(_) => Numeric::Int(0),
            Self::Code(code) => Numeric::Int(Arc::as_ptr(code).cast::<()>() as i64),
        }
    }

    /// Coerces to an integer.
    #[must_use]
    pub fn as_int(&self) -> i64 {
        self.numify().as_i64()
    }

    /// Coerces to a double.
    #[must_use]
    pub fn as_num(&self) -> f64 {
        self.numify().as_f64()
    }

    /// Plain stringification with class names resolved for blessed refs.
    #[must_use]
    pub fn str_plain(&self, interner: &Interner) -> Arc<str> {
        match self {
            Self::Str(text) => text.clone(),
            Self::Ref(handle) => {
                let mut out = String::new();
                if let Some(class) = handle.blessed() {
                    let _ = write!(out, "{}=", interner.name(class));
                }
                let _ = write!(out, "{}(0x{:x})", handle.type_str(), handle.addr());
                Arc::from(out)
            }
            Self::Code(code) => Arc::from(format!("CODE(0x{:x})", Arc::as_ptr(code).cast::<()>() as usize)),
            Self::Weak(weak) => weak.upgrade().str_plain(interner),
            other => Arc::from(other.plain_message()),
        }
    }

    /// Stringification that needs no interner: used for error messages and
    /// non-reference values. Reference kinds render without a class name.
    #[must_use]
    pub fn plain_message(&self) -> String {
        match self {
            Self::Undef => String::new(),
            Self::Int(value) => value.to_string(),
            Self::Num(value) => format_f64(*value),
            Self::Str(text) => text.to_string(),
            Self::Ref(handle) => format!("{}(0x{:x})", handle.type_str(), handle.addr()),
            Self::Weak(weak) => weak.upgrade().plain_message(),
            Self::Glob(glob) => format!("*{}::{}", glob.package, glob.name),
            Self::Code(code) => format!("CODE(0x{:x})", Arc::as_ptr(code).cast::<()>() as usize),
        }
    }

    /// Whether the die value is a plain message (gets the location suffix)
    /// rather than an object that must pass through `$@` unchanged.
    #[must_use]
    pub fn is_plain_message(&self) -> bool {
        matches!(self, Self::Undef | Self::Int(_) | Self::Num(_) | Self::Str(_))
    }

    /// The blessed class of a reference value, if any.
    #[must_use]
    pub fn blessed(&self) -> Option<ClassId> {
        match self {
            Self::Ref(handle) => handle.blessed(),
            Self::Weak(weak) => weak.upgrade().blessed(),
            _ => None,
        }
    }

    /// Whether overload dispatch should be attempted on this operand.
    #[must_use]
    pub fn overloaded(&self) -> bool {
        match self {
            Self::Ref(handle) => handle.overloaded(),
            Self::Weak(weak) => weak.upgrade().overloaded(),
            _ => false,
        }
    }
}

// ============================================================================
// Plain binary operations
// ============================================================================

/// Binary operations over scalars, shared by both execution modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarBinOp {
    /// `+`
    Add,
    /// `-`
    Subtract,
    /// `*`
    Multiply,
    /// `/`
    Divide,
    /// `%`
    Modulus,
    /// `**`
    Power,
    /// `.`
    Concat,
    /// `x`
    Repeat,
    /// `==`
    NumEq,
    /// `!=`
    NumNe,
    /// `<`
    NumLt,
    /// `<=`
    NumLe,
    /// `>`
    NumGt,
    /// `>=`
    NumGe,
    /// `eq`
    StrEq,
    /// `ne`
    StrNe,
    /// `lt`
    StrLt,
    /// `le`
    StrLe,
    /// `gt`
    StrGt,
    /// `ge`
    StrGe,
    /// `<=>`
    NumCmp,
    /// `cmp`
    StrCmp,
}

impl ScalarBinOp {
    /// The overload-table key for this operator.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Modulus => "%",
            Self::Power => "**",
            Self::Concat => ".",
            Self::Repeat => "x",
            Self::NumEq => "==",
            Self::NumNe => "!=",
            Self::NumLt => "<",
            Self::NumLe => "<=",
            Self::NumGt => ">",
            Self::NumGe => ">=",
            Self::StrEq => "eq",
            Self::StrNe => "ne",
            Self::StrLt => "lt",
            Self::StrLe => "le",
            Self::StrGt => "gt",
            Self::StrGe => "ge",
            Self::NumCmp => "<=>",
            Self::StrCmp => "cmp",
        }
    }

    /// Applies the plain (non-overloaded) semantics.
    pub fn apply_plain(self, a: &Scalar, b: &Scalar, interner: &Interner) -> PerlResult<Scalar> {
        match self {
            Self::Add => add_plain(a, b),
            Self::Subtract => subtract_plain(a, b),
            Self::Multiply => multiply_plain(a, b),
            Self::Divide => divide_plain(a, b),
            Self::Modulus => modulus_plain(a, b),
            Self::Power => power_plain(a, b),
            Self::Concat => Ok(concat_plain(a, b, interner)),
            Self::Repeat => Ok(repeat_plain(a, b, interner)),
            Self::NumEq => Ok(Scalar::from_bool(num_cmp_plain(a, b) == Some(Ordering::Equal))),
            Self::NumNe => Ok(Scalar::from_bool(num_cmp_plain(a, b) != Some(Ordering::Equal))),
            Self::NumLt => Ok(Scalar::from_bool(num_cmp_plain(a, b) == Some(Ordering::Less))),
            Self::NumLe => Ok(Scalar::from_bool(matches!(
                num_cmp_plain(a, b),
                Some(Ordering::Less | Ordering::Equal)
            ))),
            Self::NumGt => Ok(Scalar::from_bool(num_cmp_plain(a, b) == Some(Ordering::Greater))),
            Self::NumGe => Ok(Scalar::from_bool(matches!(
                num_cmp_plain(a, b),
                Some(Ordering::Greater | Ordering::Equal)
            ))),
            Self::StrEq => Ok(Scalar::from_bool(str_cmp_plain(a, b, interner) == Ordering::Equal)),
            Self::StrNe => Ok(Scalar::from_bool(str_cmp_plain(a, b, interner) != Ordering::Equal)),
            Self::StrLt => Ok(Scalar::from_bool(str_cmp_plain(a, b, interner) == Ordering::Less)),
            Self::StrLe => Ok(Scalar::from_bool(str_cmp_plain(a, b, interner) != Ordering::Greater)),
            Self::StrGt => Ok(Scalar::from_bool(str_cmp_plain(a, b, interner) == Ordering::Greater)),
            Self::StrGe => Ok(Scalar::from_bool(str_cmp_plain(a, b, interner) != Ordering::Less)),
            Self::NumCmp => Ok(num_cmp_plain(a, b).map_or(Scalar::Undef, |ordering| Scalar::Int(ordering as i64))),
            Self::StrCmp => Ok(Scalar::Int(str_cmp_plain(a, b, interner) as i64)),
        }
    }
}

/// Addition with integer fast path; overflow promotes to double.
pub fn add_plain(a: &Scalar, b: &Scalar) -> PerlResult<Scalar> {
    Ok(match (a.numify(), b.numify()) {
        (Numeric::Int(x), Numeric::Int(y)) => match x.checked_add(y) {
            Some(sum) => Scalar::Int(sum),
            None => Scalar::Num(x as f64 + y as f64),
        },
        (x, y) => Scalar::Num(x.as_f64() + y.as_f64()),
    })
}

/// Subtraction; overflow promotes to double.
pub fn subtract_plain(a: &Scalar, b: &Scalar) -> PerlResult<Scalar> {
    Ok(match (a.numify(), b.numify()) {
        (Numeric::Int(x), Numeric::Int(y)) => match x.checked_sub(y) {
            Some(diff) => Scalar::Int(diff),
            None => Scalar::Num(x as f64 - y as f64),
        },
        (x, y) => Scalar::Num(x.as_f64() - y.as_f64()),
    })
}

/// Multiplication; overflow promotes to double.
pub fn multiply_plain(a: &Scalar, b: &Scalar) -> PerlResult<Scalar> {
    Ok(match (a.numify(), b.numify()) {
        (Numeric::Int(x), Numeric::Int(y)) => match x.checked_mul(y) {
            Some(product) => Scalar::Int(product),
            None => Scalar::Num(x as f64 * y as f64),
        },
        (x, y) => Scalar::Num(x.as_f64() * y.as_f64()),
    })
}

/// Division always produces a double; division by zero raises.
pub fn divide_plain(a: &Scalar, b: &Scalar) -> PerlResult<Scalar> {
    let divisor = b.as_num();
    if divisor == 0.0 {
        return Err(PerlError::runtime("Illegal division by zero"));
    }
    Ok(Scalar::Num(a.as_num() / divisor))
}

/// Integer modulus with the sign of the right operand, as Perl defines it.
pub fn modulus_plain(a: &Scalar, b: &Scalar) -> PerlResult<Scalar> {
    let rhs = b.as_int();
    if rhs == 0 {
        return Err(PerlError::runtime("Illegal modulus zero"));
    }
    let lhs = a.as_int();
    let rem = lhs.wrapping_rem(rhs);
    let result = if rem != 0 && (rem < 0) != (rhs < 0) { rem + rhs } else { rem };
    Ok(Scalar::Int(result))
}

/// Exponentiation: integer when exact and in range, otherwise double.
pub fn power_plain(a: &Scalar, b: &Scalar) -> PerlResult<Scalar> {
    if let (Numeric::Int(base), Numeric::Int(exp)) = (a.numify(), b.numify())
        && let Ok(exp) = u32::try_from(exp)
        && let Some(result) = base.checked_pow(exp)
    {
        return Ok(Scalar::Int(result));
    }
    Ok(Scalar::Num(a.as_num().powf(b.as_num())))
}

/// Numeric negation.
pub fn negate_plain(a: &Scalar) -> PerlResult<Scalar> {
    Ok(match a.numify() {
        Numeric::Int(value) => match value.checked_neg() {
            Some(negated) => Scalar::Int(negated),
            None => Scalar::Num(-(value as f64)),
        },
        Numeric::Num(value) => Scalar::Num(-value),
    })
}

/// String concatenation of the plain stringifications.
#[must_use]
pub fn concat_plain(a: &Scalar, b: &Scalar, interner: &Interner) -> Scalar {
    let left = a.str_plain(interner);
    let right = b.str_plain(interner);
    let mut out = String::with_capacity(left.len() + right.len());
    out.push_str(&left);
    out.push_str(&right);
    Scalar::from_string(out)
}

/// String repetition (`x`). A negative or zero count yields the empty string.
#[must_use]
pub fn repeat_plain(a: &Scalar, count: &Scalar, interner: &Interner) -> Scalar {
    let times = count.as_int();
    if times <= 0 {
        return Scalar::from_str_slice("");
    }
    Scalar::from_string(a.str_plain(interner).repeat(times as usize))
}

/// `substr` with Perl's negative-offset rules. `len` of `None` means "to
/// the end"; a negative length trims from the end.
pub fn substr_plain(s: &Scalar, offset: i64, len: Option<i64>, interner: &Interner) -> PerlResult<Scalar> {
    let text = s.str_plain(interner);
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len() as i64;
    let start = if offset < 0 { (total + offset).max(0) } else { offset };
    if start > total {
        return Err(PerlError::runtime("substr outside of string"));
    }
    let end = match len {
        None => total,
        Some(length) if length < 0 => (total + length).max(start),
        Some(length) => (start + length).min(total),
    };
    let slice: String = chars[start as usize..end.max(start) as usize].iter().collect();
    Ok(Scalar::from_string(slice))
}

/// Character length of the stringification.
#[must_use]
pub fn length_plain(s: &Scalar, interner: &Interner) -> Scalar {
    if s.is_undef() {
        return Scalar::Undef;
    }
    Scalar::Int(s.str_plain(interner).chars().count() as i64)
}

/// Numeric comparison; `None` when either side is NaN.
#[must_use]
pub fn num_cmp_plain(a: &Scalar, b: &Scalar) -> Option<Ordering> {
    match (a.numify(), b.numify()) {
        (Numeric::Int(x), Numeric::Int(y)) => Some(x.cmp(&y)),
        (x, y) => x.as_f64().partial_cmp(&y.as_f64()),
    }
}

/// Lexical comparison of the plain stringifications.
#[must_use]
pub fn str_cmp_plain(a: &Scalar, b: &Scalar, interner: &Interner) -> Ordering {
    a.str_plain(interner).as_bytes().cmp(b.str_plain(interner).as_bytes())
}

// ============================================================================
// Plain unary operations
// ============================================================================

/// Unary operations over scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarUnOp {
    /// Numeric negation (`-`). Overloadable as `neg`.
    Negate,
    /// Boolean negation (`!`).
    Not,
    /// `abs`
    Abs,
    /// `int`
    Int,
    /// `sqrt`
    Sqrt,
    /// `log`
    Log,
    /// `exp`
    Exp,
    /// `chr`
    Chr,
    /// `ord`
    Ord,
    /// `uc`
    Uc,
    /// `lc`
    Lc,
    /// `length`
    Length,
}

impl ScalarUnOp {
    /// The overload-table key, for the operators Perl lets classes overload.
    #[must_use]
    pub fn symbol(self) -> Option<&'static str> {
        match self {
            Self::Negate => Some("neg"),
            Self::Not => Some("!"),
            Self::Abs => Some("abs"),
            Self::Int => Some("int"),
            Self::Sqrt => Some("sqrt"),
            Self::Log => Some("log"),
            Self::Exp => Some("exp"),
            Self::Chr | Self::Ord | Self::Uc | Self::Lc | Self::Length => None,
        }
    }

    /// Applies the plain semantics.
    pub fn apply_plain(self, a: &Scalar, interner: &Interner) -> PerlResult<Scalar> {
        match self {
            Self::Negate => negate_plain(a),
            Self::Not => Ok(Scalar::from_bool(!a.truthy())),
            Self::Abs => Ok(match a.numify() {
                Numeric::Int(value) => Scalar::Int(value.wrapping_abs()),
                Numeric::Num(value) => Scalar::Num(value.abs()),
            }),
            Self::Int => Ok(Scalar::Int(a.as_int())),
            Self::Sqrt => {
                let value = a.as_num();
                if value < 0.0 {
                    return Err(PerlError::runtime(format!("Can't take sqrt of {}", format_f64(value))));
                }
                Ok(Scalar::Num(value.sqrt()))
            }
            Self::Log => {
                let value = a.as_num();
                if value <= 0.0 {
                    return Err(PerlError::runtime(format!("Can't take log of {}", format_f64(value))));
                }
                Ok(Scalar::Num(value.ln()))
            }
            Self::Exp => Ok(Scalar::Num(a.as_num().exp())),
            Self::Chr => {
                let code = a.as_int();
                let ch = u32::try_from(code)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| PerlError::runtime(format!("Invalid character code {code}")))?;
                Ok(Scalar::from_string(ch.to_string()))
            }
            Self::Ord => {
                let text = a.str_plain(interner);
                Ok(Scalar::Int(text.chars().next().map_or(0, |ch| i64::from(u32::from(ch)))))
            }
            Self::Uc => Ok(Scalar::from_string(a.str_plain(interner).to_uppercase())),
            Self::Lc => Ok(Scalar::from_string(a.str_plain(interner).to_lowercase())),
            Self::Length => Ok(length_plain(a, interner)),
        }
    }
}

// ============================================================================
// Lists and register values
// ============================================================================

/// A transient ordered sequence of scalar values.
///
/// Unlike an `Array` this is not owned storage: it is what an operation
/// returns. Small lists stay inline.
#[derive(Debug, Clone, Default)]
pub struct List(SmallVec<[Scalar; 4]>);

impl List {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a one-element list.
    #[must_use]
    pub fn of(value: Scalar) -> Self {
        let mut list = Self::new();
        list.push(value);
        list
    }

    /// Appends a value.
    pub fn push(&mut self, value: Scalar) {
        self.0.push(value);
    }

    /// Appends every value from `other`.
    pub fn extend_from(&mut self, other: &Self) {
        self.0.extend(other.0.iter().cloned());
    }

    /// The values.
    #[must_use]
    pub fn values(&self) -> &[Scalar] {
        &self.0
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The list's value in scalar context: its last element (comma-operator
    /// semantics; see DESIGN.md).
    #[must_use]
    pub fn scalar_value(&self) -> Scalar {
        self.0.last().cloned().unwrap_or(Scalar::Undef)
    }
}

impl FromIterator<Scalar> for List {
    fn from_iter<I: IntoIterator<Item = Scalar>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for List {
    type Item = Scalar;
    type IntoIter = smallvec::IntoIter<[Scalar; 4]>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A register (or native local-slot) value: any runtime entity kind.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Empty register.
    #[default]
    None,
    /// A scalar slot. Lexicals and temporaries live here; holding the slot
    /// (not the value) is what makes aliasing work.
    Scalar(ScalarRef),
    /// An array handle.
    Array(ArrayRef),
    /// A hash handle.
    Hash(HashRef),
    /// A code handle.
    Code(CodeRef),
    /// A transient list, e.g. a call result.
    List(List),
    /// A calling-context tag (reserved register 2).
    Ctx(Context),
}

impl Value {
    /// Short kind name for diagnostics.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::None => "empty",
            Self::Scalar(_) => "scalar",
            Self::Array(_) => "array",
            Self::Hash(_) => "hash",
            Self::Code(_) => "code",
            Self::List(_) => "list",
            Self::Ctx(_) => "context",
        }
    }

    /// Expects a scalar slot.
    pub fn expect_scalar(&self) -> PerlResult<&ScalarRef> {
        match self {
            Self::Scalar(slot) => Ok(slot),
            other => Err(PerlError::internal(format!(
                "register holds {} where a scalar was expected",
                other.kind_name()
            ))),
        }
    }

    /// Expects an array handle.
    pub fn expect_array(&self) -> PerlResult<&ArrayRef> {
        match self {
            Self::Array(array) => Ok(array),
            other => Err(PerlError::internal(format!(
                "register holds {} where an array was expected",
                other.kind_name()
            ))),
        }
    }

    /// Expects a hash handle.
    pub fn expect_hash(&self) -> PerlResult<&HashRef> {
        match self {
            Self::Hash(hash) => Ok(hash),
            other => Err(PerlError::internal(format!(
                "register holds {} where a hash was expected",
                other.kind_name()
            ))),
        }
    }

    /// The scalar value of this register without context conversion of
    /// containers beyond the standard rules (array length, list tail).
    #[must_use]
    pub fn scalar_value(&self) -> Scalar {
        match self {
            Self::None | Self::Ctx(_) => Scalar::Undef,
            Self::Scalar(slot) => slot.get(),
            Self::Array(array) => Scalar::Int(array.len() as i64),
            Self::Hash(hash) => Scalar::from_bool(hash.len() > 0),
            Self::Code(code) => Scalar::Code(code.clone()),
            Self::List(list) => list.scalar_value(),
        }
    }

    /// The list value of this register: scalars become one-element lists,
    /// containers flatten to their values.
    #[must_use]
    pub fn list_value(&self) -> List {
        match self {
            Self::None | Self::Ctx(_) => List::new(),
            Self::Scalar(slot) => List::of(slot.get()),
            Self::Array(array) => array.to_list(),
            Self::Hash(hash) => hash.to_list(),
            Self::Code(code) => List::of(Scalar::Code(code.clone())),
            Self::List(list) => list.clone(),
        }
    }
}

/// Resolves a register value to a callable code handle.
///
/// Accepts a direct code value, a scalar holding code, or a code reference.
pub fn resolve_code(value: &Value) -> PerlResult<CodeRef> {
    match value {
        Value::Code(code) => Ok(code.clone()),
        Value::Scalar(slot) => match slot.get() {
            Scalar::Code(code) => Ok(code),
            Scalar::Ref(Ref::Code(code)) => Ok(code),
            Scalar::Undef => Err(PerlError::runtime("Can't use an undefined value as a subroutine reference")),
            other => Err(PerlError::runtime(format!(
                "Not a CODE reference: {}",
                other.plain_message()
            ))),
        },
        other => Err(PerlError::internal(format!(
            "register holds {} where code was expected",
            other.kind_name()
        ))),
    }
}

/// Convenience constructor for host subs used by the runtime registry.
pub(crate) fn host_code(name: &str, package: &str, f: crate::function::HostFn) -> CodeRef {
    Arc::new(Sub::host(name, package, f))
}

/// Dereferences a scalar to the reference handle it carries, upgrading
/// weak handles.
pub(crate) fn deref_handle(value: &Scalar) -> PerlResult<Ref> {
    match value {
        Scalar::Ref(handle) => Ok(handle.clone()),
        Scalar::Weak(weak) => match weak.upgrade() {
            Scalar::Ref(handle) => Ok(handle),
            _ => Err(PerlError::runtime("Can't use an undefined value as a reference")),
        },
        Scalar::Undef => Err(PerlError::runtime("Can't use an undefined value as a reference")),
        other => Err(PerlError::runtime(format!(
            "Can't use string (\"{}\") as a reference",
            other.plain_message()
        ))),
    }
}

/// Dereferences to a scalar slot (`$$ref`).
pub(crate) fn deref_scalar_slot(value: &Scalar) -> PerlResult<ScalarRef> {
    match deref_handle(value)? {
        Ref::Scalar(slot) => Ok(slot),
        other => Err(PerlError::runtime(format!(
            "Not a SCALAR reference: {} reference",
            other.type_str()
        ))),
    }
}

/// Dereferences to an array (`@$ref`).
pub(crate) fn deref_array(value: &Scalar) -> PerlResult<ArrayRef> {
    match deref_handle(value)? {
        Ref::Array(array) => Ok(array),
        other => Err(PerlError::runtime(format!(
            "Not an ARRAY reference: {} reference",
            other.type_str()
        ))),
    }
}

/// Dereferences to a hash (`%$ref`).
pub(crate) fn deref_hash(value: &Scalar) -> PerlResult<HashRef> {
    match deref_handle(value)? {
        Ref::Hash(hash) => Ok(hash),
        other => Err(PerlError::runtime(format!(
            "Not a HASH reference: {} reference",
            other.type_str()
        ))),
    }
}

/// Dereferences to code (`&$ref`).
pub(crate) fn deref_code(value: &Scalar) -> PerlResult<CodeRef> {
    match value {
        Scalar::Code(code) => Ok(code.clone()),
        Scalar::Ref(Ref::Code(code)) => Ok(code.clone()),
        other => Err(PerlError::runtime(format!(
            "Not a CODE reference: {}",
            other.plain_message()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interner() -> Interner {
        Interner::new()
    }

    #[test]
    fn test_add_commutative() {
        let cases = [
            (Scalar::Int(2), Scalar::Int(40)),
            (Scalar::Num(1.5), Scalar::Int(2)),
            (Scalar::from_str_slice("3"), Scalar::Num(0.25)),
            (Scalar::Undef, Scalar::Int(7)),
        ];
        for (a, b) in cases {
            let ab = add_plain(&a, &b).unwrap();
            let ba = add_plain(&b, &a).unwrap();
            assert_eq!(ab.as_num(), ba.as_num());
        }
    }

    #[test]
    fn test_sub_negate_antisymmetry() {
        let a = Scalar::Int(10);
        let b = Scalar::Int(42);
        let ab = subtract_plain(&a, &b).unwrap();
        let ba = negate_plain(&subtract_plain(&b, &a).unwrap()).unwrap();
        assert_eq!(ab.as_int(), ba.as_int());
    }

    #[test]
    fn test_concat_length_additive() {
        let itn = interner();
        let a = Scalar::from_str_slice("héllo");
        let b = Scalar::Int(123);
        let joined = concat_plain(&a, &b, &itn);
        let len = length_plain(&joined, &itn).as_int();
        assert_eq!(
            len,
            length_plain(&a, &itn).as_int() + length_plain(&b, &itn).as_int()
        );
    }

    #[test]
    fn test_int_overflow_promotes() {
        let result = add_plain(&Scalar::Int(i64::MAX), &Scalar::Int(1)).unwrap();
        assert!(matches!(result, Scalar::Num(_)));
        assert!(result.as_num() > i64::MAX as f64 - 2.0);
    }

    #[test]
    fn test_division_by_zero_raises() {
        let err = divide_plain(&Scalar::Int(1), &Scalar::Int(0)).unwrap_err();
        assert!(err.catchable());
        assert_eq!(err.message(), "Illegal division by zero");
        assert!(modulus_plain(&Scalar::Int(1), &Scalar::from_str_slice("0")).is_err());
    }

    #[test]
    fn test_modulus_sign_follows_right_operand() {
        assert_eq!(modulus_plain(&Scalar::Int(-7), &Scalar::Int(3)).unwrap().as_int(), 2);
        assert_eq!(modulus_plain(&Scalar::Int(7), &Scalar::Int(-3)).unwrap().as_int(), -2);
    }

    #[test]
    fn test_string_numeric_prefix() {
        assert_eq!(parse_numeric_prefix("  42abc"), Numeric::Int(42));
        assert_eq!(parse_numeric_prefix("-3.5e2xyz"), Numeric::Num(-350.0));
        assert_eq!(parse_numeric_prefix("abc"), Numeric::Int(0));
        assert_eq!(parse_numeric_prefix("12."), Numeric::Int(12));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Scalar::Undef.truthy());
        assert!(!Scalar::from_str_slice("").truthy());
        assert!(!Scalar::from_str_slice("0").truthy());
        assert!(!Scalar::Int(0).truthy());
        assert!(Scalar::from_str_slice("0.0").truthy());
        assert!(Scalar::from_str_slice("00").truthy());
    }

    #[test]
    fn test_slot_aliasing() {
        let slot = ScalarRef::new(Scalar::Int(20));
        let alias = slot.clone();
        slot.set(Scalar::Int(30));
        assert_eq!(alias.get().as_int(), 30);
        assert!(slot.is(&alias));
    }

    #[test]
    fn test_weak_ref_resolves_to_undef_after_drop() {
        let slot = ScalarRef::new(Scalar::Int(1));
        let weak = slot.downgrade();
        assert!(matches!(weak.upgrade(), Scalar::Ref(_)));
        drop(slot);
        assert!(weak.upgrade().is_undef());
    }

    #[test]
    fn test_format_f64_integral() {
        assert_eq!(format_f64(5.0), "5");
        assert_eq!(format_f64(-2.5), "-2.5");
        assert_eq!(format_f64(f64::INFINITY), "Inf");
    }

    #[test]
    fn test_substr_negative_offset() {
        let itn = interner();
        let s = Scalar::from_str_slice("hello world");
        assert_eq!(
            substr_plain(&s, -5, None, &itn).unwrap().plain_message(),
            "world"
        );
        assert_eq!(
            substr_plain(&s, 0, Some(5), &itn).unwrap().plain_message(),
            "hello"
        );
        assert_eq!(
            substr_plain(&s, 6, Some(-1), &itn).unwrap().plain_message(),
            "worl"
        );
    }

    #[test]
    fn test_spaceship_nan_is_undef() {
        let itn = interner();
        let result = ScalarBinOp::NumCmp
            .apply_plain(&Scalar::Num(f64::NAN), &Scalar::Int(1), &itn)
            .unwrap();
        assert!(result.is_undef());
    }
}
