//! Class registry: `@ISA` linearization and operator overloads.
//!
//! Method resolution order is the classic depth-first, pre-order walk with
//! duplicates removed. Linearizations are cached per class and invalidated
//! by a registry-wide version counter bumped on any class mutation.
//!
//! Overloads are registered per class under the operator's symbol
//! (`"+"`, `"\"\""`, `"0+"`, `"bool"`, `"()"` for the nomethod fallback).
//! The overload bit on containers is sampled from this registry at bless
//! time, so classes set up their overloads before blessing instances.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use ahash::AHashMap;

use crate::function::CodeRef;
use crate::intern::ClassId;
use crate::value::{read_guard, write_guard};

#[derive(Debug, Default)]
struct ClassData {
    isa: Vec<ClassId>,
    overloads: AHashMap<Arc<str>, CodeRef>,
    /// Cached linearization, tagged with the registry version it was
    /// computed at.
    mro: Option<(u64, Arc<[ClassId]>)>,
}

/// Process-wide class registry.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: RwLock<AHashMap<ClassId, ClassData>>,
    version: AtomicU64,
}

impl ClassRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces a class's `@ISA`, invalidating cached linearizations.
    pub fn set_isa(&self, class: ClassId, parents: Vec<ClassId>) {
        let mut classes = write_guard(&self.classes);
        classes.entry(class).or_default().isa = parents;
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Registers an operator overload on a class.
    pub fn register_overload(&self, class: ClassId, op: &str, code: CodeRef) {
        let mut classes = write_guard(&self.classes);
        classes.entry(class).or_default().overloads.insert(Arc::from(op), code);
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Whether any class in the resolution chain declares overloads.
    ///
    /// Sampled at bless time to set the container's overload bit.
    #[must_use]
    pub fn has_overloads(&self, class: ClassId) -> bool {
        let mro = self.mro(class);
        let classes = read_guard(&self.classes);
        mro.iter()
            .any(|c| classes.get(c).is_some_and(|data| !data.overloads.is_empty()))
    }

    /// Finds the overload handler for `op` along the resolution chain.
    #[must_use]
    pub fn find_overload(&self, class: ClassId, op: &str) -> Option<CodeRef> {
        let mro = self.mro(class);
        let classes = read_guard(&self.classes);
        for c in mro.iter() {
            if let Some(code) = classes.get(c).and_then(|data| data.overloads.get(op)) {
                return Some(code.clone());
            }
        }
        None
    }

    /// The linearized method-resolution order for a class, cached until the
    /// next class mutation.
    #[must_use]
    pub fn mro(&self, class: ClassId) -> Arc<[ClassId]> {
        let version = self.version.load(Ordering::Acquire);
        {
            let classes = read_guard(&self.classes);
            if let Some((cached_at, mro)) = classes.get(&class).and_then(|data| data.mro.as_ref())
                && *cached_at == version
            {
                return mro.clone();
            }
        }
        let mut order = Vec::new();
        {
            let classes = read_guard(&self.classes);
            linearize(&classes, class, &mut order);
        }
        let mro: Arc<[ClassId]> = Arc::from(order);
        let mut classes = write_guard(&self.classes);
        classes.entry(class).or_default().mro = Some((version, mro.clone()));
        mro
    }
}

fn linearize(classes: &AHashMap<ClassId, ClassData>, class: ClassId, order: &mut Vec<ClassId>) {
    if order.contains(&class) {
        return;
    }
    order.push(class);
    if let Some(data) = classes.get(&class) {
        for parent in &data.isa {
            linearize(classes, *parent, order);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{Flow, Sub};
    use crate::intern::Interner;

    fn dummy_code(name: &str) -> CodeRef {
        fn noop(
            _interp: &mut crate::run::Interp,
            _args: &crate::container::ArrayRef,
            _cx: crate::value::Context,
        ) -> crate::error::PerlResult<Flow> {
            Ok(Flow::empty())
        }
        Arc::new(Sub::host(name, "main", noop))
    }

    #[test]
    fn test_mro_is_depth_first_preorder() {
        let interner = Interner::new();
        let registry = ClassRegistry::new();
        let (a, b, c, d) = (
            interner.intern("A"),
            interner.intern("B"),
            interner.intern("C"),
            interner.intern("D"),
        );
        // D -> (B, C), B -> A, C -> A: classic diamond.
        registry.set_isa(d, vec![b, c]);
        registry.set_isa(b, vec![a]);
        registry.set_isa(c, vec![a]);
        let mro = registry.mro(d);
        assert_eq!(&*mro, &[d, b, a, c]);
    }

    #[test]
    fn test_mro_cache_invalidated_on_mutation() {
        let interner = Interner::new();
        let registry = ClassRegistry::new();
        let (x, y) = (interner.intern("X"), interner.intern("Y"));
        assert_eq!(&*registry.mro(x), &[x]);
        registry.set_isa(x, vec![y]);
        assert_eq!(&*registry.mro(x), &[x, y]);
    }

    #[test]
    fn test_overload_found_through_parent() {
        let interner = Interner::new();
        let registry = ClassRegistry::new();
        let (base, child) = (interner.intern("Base"), interner.intern("Child"));
        registry.register_overload(base, "\"\"", dummy_code("stringify"));
        registry.set_isa(child, vec![base]);
        assert!(registry.has_overloads(child));
        assert!(registry.find_overload(child, "\"\"").is_some());
        assert!(registry.find_overload(child, "+").is_none());
    }

    #[test]
    fn test_cycle_in_isa_terminates() {
        let interner = Interner::new();
        let registry = ClassRegistry::new();
        let (p, q) = (interner.intern("P"), interner.intern("Q"));
        registry.set_isa(p, vec![q]);
        registry.set_isa(q, vec![p]);
        assert_eq!(&*registry.mro(p), &[p, q]);
    }
}
