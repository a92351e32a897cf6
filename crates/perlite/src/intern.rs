//! Interning for package (class) names.
//!
//! Bless tags are stored on containers as compact integer ids; the interner
//! maps them back to package names for method resolution and diagnostics.
//! The table is process-wide and append-only: ids stay valid for the life of
//! the process.

use std::sync::{Arc, RwLock};

use ahash::AHashMap;

use crate::value::read_guard;

/// Identifier of an interned package name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(u32);

impl ClassId {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Default)]
struct InternerState {
    ids: AHashMap<Arc<str>, ClassId>,
    names: Vec<Arc<str>>,
}

/// Append-only package-name table.
///
/// Reads vastly outnumber writes (a class is interned once, looked up on
/// every blessed-value operation), so the table sits behind a read/write
/// lock and lookups take the read side only.
#[derive(Debug, Default)]
pub struct Interner {
    state: RwLock<InternerState>,
}

impl Interner {
    /// Creates an empty interner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a package name, returning its stable id.
    pub fn intern(&self, name: &str) -> ClassId {
        if let Some(id) = read_guard(&self.state).ids.get(name) {
            return *id;
        }
        let mut state = self.state.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(id) = state.ids.get(name) {
            return *id;
        }
        let id = ClassId(u32::try_from(state.names.len()).expect("class table exceeds u32"));
        let name: Arc<str> = Arc::from(name);
        state.names.push(name.clone());
        state.ids.insert(name, id);
        id
    }

    /// Returns the package name for an id.
    ///
    /// # Panics
    /// Panics if the id did not come from this interner.
    #[must_use]
    pub fn name(&self, id: ClassId) -> Arc<str> {
        read_guard(&self.state).names[id.index()].clone()
    }

    /// Returns the id for a name if it has been interned.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<ClassId> {
        read_guard(&self.state).ids.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_stable() {
        let interner = Interner::new();
        let a = interner.intern("Foo");
        let b = interner.intern("Bar");
        assert_ne!(a, b);
        assert_eq!(interner.intern("Foo"), a);
        assert_eq!(&*interner.name(a), "Foo");
        assert_eq!(interner.lookup("Bar"), Some(b));
        assert_eq!(interner.lookup("Baz"), None);
    }
}
