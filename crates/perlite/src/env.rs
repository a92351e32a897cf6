//! The global and lexical environment.
//!
//! Three package-keyed stores (scalars, arrays, hashes) plus a code store,
//! all create-on-demand and process-wide. Reads outnumber writes by orders
//! of magnitude — lookups take the read lock; a miss upgrades to the write
//! lock and defines the slot.
//!
//! The persistent-slot API is how lexicals cross the compiler/emitter
//! boundary: a promoted lexical's storage is published under a stable
//! `Perlite::_BEGIN_<id>::<name>` address, and every artifact that captures
//! it binds the same slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use ahash::AHashMap;

use crate::container::{ArrayRef, HashRef};
use crate::function::CodeRef;
use crate::intern::{ClassId, Interner};
use crate::overload::ClassRegistry;
use crate::value::{Scalar, ScalarRef, read_guard, write_guard};

/// Names that always normalize into `main`, regardless of the default
/// package: the punctuation variables and the conventional globals.
#[must_use]
pub fn forces_main(name: &str) -> bool {
    match name {
        "_" | "0" | "ENV" | "ARGV" | "ARGVOUT" | "INC" | "SIG" | "STDIN" | "STDOUT" | "STDERR" => true,
        _ => name
            .chars()
            .next()
            .is_some_and(|first| !(first.is_ascii_alphabetic() || first == '_')),
    }
}

/// The package namespace prefix used for persistent slots.
const BEGIN_PREFIX: &str = "Perlite::_BEGIN_";

/// Process-wide execution environment.
///
/// Shared by every interpreter instance and both execution modes; safe to
/// share across threads running independent evaluation contexts.
#[derive(Debug, Default)]
pub struct Environment {
    interner: Interner,
    classes: ClassRegistry,
    scalars: RwLock<AHashMap<Arc<str>, ScalarRef>>,
    arrays: RwLock<AHashMap<Arc<str>, ArrayRef>>,
    hashes: RwLock<AHashMap<Arc<str>, HashRef>>,
    codes: RwLock<AHashMap<Arc<str>, CodeRef>>,
    norm_cache: RwLock<AHashMap<(Arc<str>, Arc<str>), Arc<str>>>,
    evals: RwLock<AHashMap<u64, CodeRef>>,
    next_eval: AtomicU64,
    next_begin: AtomicU64,
}

impl Environment {
    /// Creates an empty environment.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The package-name interner.
    #[must_use]
    pub fn interner(&self) -> &Interner {
        &self.interner
    }

    /// The class registry (`@ISA`, overloads).
    #[must_use]
    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    /// Qualifies `name` against `default_package`.
    ///
    /// Already-qualified names pass through; the special names qualify into
    /// `main`. Pure in its arguments and cached.
    #[must_use]
    pub fn normalize(&self, name: &str, default_package: &str) -> Arc<str> {
        if name.contains("::") {
            return Arc::from(name);
        }
        let key = (Arc::<str>::from(name), Arc::<str>::from(default_package));
        if let Some(cached) = read_guard(&self.norm_cache).get(&key) {
            return cached.clone();
        }
        let package = if forces_main(name) { "main" } else { default_package };
        let qualified: Arc<str> = Arc::from(format!("{package}::{name}"));
        write_guard(&self.norm_cache).insert(key, qualified.clone());
        qualified
    }

    /// The scalar slot under a qualified name, created undef on demand.
    ///
    /// The returned handle is stable: every caller binds the same storage.
    #[must_use]
    pub fn get_scalar(&self, qualified: &str) -> ScalarRef {
        if let Some(slot) = read_guard(&self.scalars).get(qualified) {
            return slot.clone();
        }
        let mut scalars = write_guard(&self.scalars);
        scalars.entry(Arc::from(qualified)).or_insert_with(ScalarRef::undef).clone()
    }

    /// The array under a qualified name, created empty on demand.
    #[must_use]
    pub fn get_array(&self, qualified: &str) -> ArrayRef {
        if let Some(array) = read_guard(&self.arrays).get(qualified) {
            return array.clone();
        }
        let mut arrays = write_guard(&self.arrays);
        arrays.entry(Arc::from(qualified)).or_default().clone()
    }

    /// The hash under a qualified name, created empty on demand.
    #[must_use]
    pub fn get_hash(&self, qualified: &str) -> HashRef {
        if let Some(hash) = read_guard(&self.hashes).get(qualified) {
            return hash.clone();
        }
        let mut hashes = write_guard(&self.hashes);
        hashes.entry(Arc::from(qualified)).or_default().clone()
    }

    /// Looks up a code entry. Unlike the data stores this does not create.
    #[must_use]
    pub fn get_code(&self, qualified: &str) -> Option<CodeRef> {
        read_guard(&self.codes).get(qualified).cloned()
    }

    /// Defines (or redefines) a code entry.
    pub fn set_code(&self, qualified: &str, code: CodeRef) {
        write_guard(&self.codes).insert(Arc::from(qualified), code);
    }

    /// Resolves a function name, falling back to the `CORE::` registry of
    /// runtime-provided functions when the package holds no definition.
    #[must_use]
    pub fn resolve_function(&self, qualified: &str) -> Option<CodeRef> {
        if let Some(code) = self.get_code(qualified) {
            return Some(code);
        }
        let bare = qualified.rsplit("::").next().unwrap_or(qualified);
        self.get_code(&format!("CORE::{bare}"))
    }

    // ------------------------------------------------------------------
    // Persistent slots
    // ------------------------------------------------------------------

    /// Allocates a fresh persistent-namespace id for a compilation unit.
    #[must_use]
    pub fn fresh_begin_id(&self) -> u64 {
        self.next_begin.fetch_add(1, Ordering::Relaxed)
    }

    /// Builds the stable persistent-slot name for a promoted lexical.
    #[must_use]
    pub fn persistent_name(begin_id: u64, name: &str) -> String {
        format!("{BEGIN_PREFIX}{begin_id}::{name}")
    }

    /// The persistent scalar slot under a stable name.
    ///
    /// Stable for the life of the process; both execution modes bind their
    /// shared lexicals through this.
    #[must_use]
    pub fn get_persistent_scalar(&self, name: &str) -> ScalarRef {
        self.get_scalar(name)
    }

    /// The persistent array under a stable name.
    #[must_use]
    pub fn get_persistent_array(&self, name: &str) -> ArrayRef {
        self.get_array(name)
    }

    /// The persistent hash under a stable name.
    #[must_use]
    pub fn get_persistent_hash(&self, name: &str) -> HashRef {
        self.get_hash(name)
    }

    // ------------------------------------------------------------------
    // Error variable
    // ------------------------------------------------------------------

    /// Sets `$@`.
    pub fn set_err_var(&self, value: Scalar) {
        self.get_scalar("main::@").set(value);
    }

    /// Clears `$@` to the empty string.
    pub fn clear_err_var(&self) {
        self.set_err_var(Scalar::from_str_slice(""));
    }

    /// Reads `$@`.
    #[must_use]
    pub fn err_var(&self) -> Scalar {
        self.get_scalar("main::@").get()
    }

    // ------------------------------------------------------------------
    // Classes and methods
    // ------------------------------------------------------------------

    /// Interns a package name as a class id.
    #[must_use]
    pub fn class_id(&self, name: &str) -> ClassId {
        self.interner.intern(name)
    }

    /// Resolves a method along the class's linearized resolution order.
    #[must_use]
    pub fn resolve_method(&self, class: ClassId, method: &str) -> Option<CodeRef> {
        for c in self.classes.mro(class).iter() {
            let qualified = format!("{}::{method}", self.interner.name(*c));
            if let Some(code) = self.get_code(&qualified) {
                return Some(code);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Eval-marker registry
    // ------------------------------------------------------------------

    /// Registers an interpreter-compiled eval artifact, returning its id.
    #[must_use]
    pub fn register_eval(&self, code: CodeRef) -> u64 {
        let id = self.next_eval.fetch_add(1, Ordering::Relaxed);
        write_guard(&self.evals).insert(id, code);
        id
    }

    /// Looks up an eval artifact by id.
    #[must_use]
    pub fn lookup_eval(&self, id: u64) -> Option<CodeRef> {
        read_guard(&self.evals).get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_qualifies_against_default_package() {
        let env = Environment::new();
        assert_eq!(&*env.normalize("x", "Foo"), "Foo::x");
        assert_eq!(&*env.normalize("Foo::x", "Bar"), "Foo::x");
    }

    #[test]
    fn test_specials_force_main() {
        let env = Environment::new();
        assert_eq!(&*env.normalize("_", "Foo"), "main::_");
        assert_eq!(&*env.normalize("@", "Foo"), "main::@");
        assert_eq!(&*env.normalize("ENV", "Foo"), "main::ENV");
        assert_eq!(&*env.normalize("1", "Foo"), "main::1");
        assert_eq!(&*env.normalize("STDOUT", "Foo"), "main::STDOUT");
    }

    #[test]
    fn test_normalization_is_cached_and_stable() {
        let env = Environment::new();
        let first = env.normalize("counter", "main");
        let second = env.normalize("counter", "main");
        assert_eq!(first, second);
    }

    #[test]
    fn test_create_on_demand_returns_stable_slot() {
        let env = Environment::new();
        let slot = env.get_scalar("main::w");
        slot.set(Scalar::Int(20));
        let again = env.get_scalar("main::w");
        assert!(slot.is(&again));
        assert_eq!(again.get().as_int(), 20);
    }

    #[test]
    fn test_persistent_slot_shared_between_lookups() {
        let env = Environment::new();
        let id = env.fresh_begin_id();
        let name = Environment::persistent_name(id, "w");
        let a = env.get_persistent_scalar(&name);
        let b = env.get_persistent_scalar(&name);
        assert!(a.is(&b));
        a.set(Scalar::Int(30));
        assert_eq!(b.get().as_int(), 30);
    }

    #[test]
    fn test_err_var_roundtrip() {
        let env = Environment::new();
        env.set_err_var(Scalar::from_str_slice("boom\n"));
        assert_eq!(env.err_var().plain_message(), "boom\n");
        env.clear_err_var();
        assert_eq!(env.err_var().plain_message(), "");
    }
}
