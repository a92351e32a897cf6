//! Owned containers: arrays and hashes.
//!
//! Containers own their element *slots*, not bare values: `foreach` loop
//! variables and `@_` alias container elements by holding the same slot, so
//! writes through either side are visible to both. Both container kinds
//! carry an optional bless tag and an overload bit.

use std::sync::{Arc, RwLock};

use ahash::RandomState;
use indexmap::IndexMap;

use crate::intern::{ClassId, Interner};
use crate::value::{List, Scalar, ScalarRef, WeakRef, read_guard, write_guard};

/// Array storage: an ordered sequence of scalar slots.
#[derive(Debug, Default)]
pub struct Array {
    elems: Vec<ScalarRef>,
    blessed: Option<ClassId>,
    overloaded: bool,
}

/// Shared handle to an array.
#[derive(Debug, Clone)]
pub struct ArrayRef(Arc<RwLock<Array>>);

impl Default for ArrayRef {
    fn default() -> Self {
        Self::new()
    }
}

impl ArrayRef {
    /// Creates a new empty array.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(Array::default())))
    }

    /// Wraps existing shared storage (weak-handle upgrade path).
    #[must_use]
    pub(crate) fn from_arc(inner: Arc<RwLock<Array>>) -> Self {
        Self(inner)
    }

    /// Builds an array of fresh slots from list values.
    #[must_use]
    pub fn from_list(list: &List) -> Self {
        let array = Self::new();
        for value in list.values() {
            array.push_value(value.clone());
        }
        array
    }

    /// Stable storage address, for identity and stringification.
    #[must_use]
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// True when both handles share storage.
    #[must_use]
    pub fn is(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Creates a weak handle.
    #[must_use]
    pub fn downgrade(&self) -> WeakRef {
        WeakRef::Array(Arc::downgrade(&self.0))
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        read_guard(&self.0).elems.len()
    }

    /// Whether the array is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a value in a fresh slot.
    pub fn push_value(&self, value: Scalar) {
        write_guard(&self.0).elems.push(ScalarRef::new(value));
    }

    /// Appends an existing slot, preserving aliasing.
    pub fn push_slot(&self, slot: ScalarRef) {
        write_guard(&self.0).elems.push(slot);
    }

    /// Removes and returns the last element's value.
    #[must_use]
    pub fn pop(&self) -> Scalar {
        write_guard(&self.0).elems.pop().map_or(Scalar::Undef, |slot| slot.get())
    }

    /// Removes and returns the first element's value.
    #[must_use]
    pub fn shift(&self) -> Scalar {
        let mut inner = write_guard(&self.0);
        if inner.elems.is_empty() {
            Scalar::Undef
        } else {
            inner.elems.remove(0).get()
        }
    }

    /// Prepends a value in a fresh slot.
    pub fn unshift_value(&self, value: Scalar) {
        write_guard(&self.0).elems.insert(0, ScalarRef::new(value));
    }

    /// Prepends existing slots, keeping their given order at the front.
    pub fn unshift_slots(&self, slots: Vec<ScalarRef>) {
        let mut inner = write_guard(&self.0);
        inner.elems.splice(0..0, slots);
    }

    /// Reads the element value at `index` (negative counts from the end).
    /// Out-of-range reads yield `Undef` without extending the array.
    #[must_use]
    pub fn get(&self, index: i64) -> Scalar {
        let inner = read_guard(&self.0);
        resolve_index(index, inner.elems.len())
            .and_then(|i| inner.elems.get(i))
            .map_or(Scalar::Undef, ScalarRef::get)
    }

    /// Returns the slot at `index`, extending the array with undef slots as
    /// needed (lvalue autovivification). Negative indices resolve from the
    /// end and must land in range.
    #[must_use]
    pub fn slot(&self, index: i64) -> ScalarRef {
        let mut inner = write_guard(&self.0);
        let len = inner.elems.len();
        let resolved = if index < 0 {
            resolve_index(index, len).unwrap_or(0)
        } else {
            index as usize
        };
        if resolved >= inner.elems.len() {
            inner.elems.resize_with(resolved + 1, ScalarRef::undef);
        }
        inner.elems[resolved].clone()
    }

    /// Sets the element at `index`, autovivifying as needed.
    pub fn set(&self, index: i64, value: Scalar) {
        self.slot(index).set(value);
    }

    /// Replaces the entire contents with fresh slots for `list`.
    pub fn assign_list(&self, list: &List) {
        let mut inner = write_guard(&self.0);
        inner.elems.clear();
        inner.elems.extend(list.values().iter().cloned().map(ScalarRef::new));
    }

    /// Clones out the element values.
    #[must_use]
    pub fn to_list(&self) -> List {
        read_guard(&self.0).elems.iter().map(ScalarRef::get).collect()
    }

    /// Clones out the element slots (aliasing iteration, argument flattening).
    #[must_use]
    pub fn slots(&self) -> Vec<ScalarRef> {
        read_guard(&self.0).elems.clone()
    }

    /// `splice`: removes `len` elements at `offset`, inserting `replacement`
    /// values, and returns the removed values. Negative offset counts from
    /// the end; a negative length leaves that many trailing elements.
    pub fn splice(&self, offset: i64, len: Option<i64>, replacement: &List) -> List {
        let mut inner = write_guard(&self.0);
        let total = inner.elems.len() as i64;
        let start = if offset < 0 { (total + offset).max(0) } else { offset.min(total) };
        let remove = match len {
            None => total - start,
            Some(length) if length < 0 => (total - start + length).max(0),
            Some(length) => length.min(total - start),
        };
        let start = start as usize;
        let end = start + remove as usize;
        let removed: List = inner.elems.splice(start..end, replacement.values().iter().cloned().map(ScalarRef::new))
            .map(|slot| slot.get())
            .collect();
        removed
    }

    /// Array slice: element values at each index in `indices`.
    #[must_use]
    pub fn slice(&self, indices: &List) -> List {
        indices.values().iter().map(|index| self.get(index.as_int())).collect()
    }

    /// Applies a bless tag. The overload bit is sampled from the class
    /// registry at bless time.
    pub fn bless(&self, class: ClassId, overloaded: bool) {
        let mut inner = write_guard(&self.0);
        inner.blessed = Some(class);
        inner.overloaded = overloaded;
    }

    /// The bless tag, if any.
    #[must_use]
    pub fn blessed(&self) -> Option<ClassId> {
        read_guard(&self.0).blessed
    }

    /// Whether the overload bit is set.
    #[must_use]
    pub fn overloaded(&self) -> bool {
        read_guard(&self.0).overloaded
    }
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    if index < 0 {
        let resolved = len as i64 + index;
        if resolved < 0 { None } else { Some(resolved as usize) }
    } else if (index as usize) < len {
        Some(index as usize)
    } else {
        None
    }
}

/// Hash storage: string keys mapping to scalar slots.
///
/// Insertion order is irrelevant for semantics but preserved so iteration
/// order is stable.
#[derive(Debug, Default)]
pub struct Hash {
    map: IndexMap<Arc<str>, ScalarRef, RandomState>,
    blessed: Option<ClassId>,
    overloaded: bool,
}

/// Shared handle to a hash.
#[derive(Debug, Clone)]
pub struct HashRef(Arc<RwLock<Hash>>);

impl Default for HashRef {
    fn default() -> Self {
        Self::new()
    }
}

impl HashRef {
    /// Creates a new empty hash.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(Hash::default())))
    }

    /// Wraps existing shared storage (weak-handle upgrade path).
    #[must_use]
    pub(crate) fn from_arc(inner: Arc<RwLock<Hash>>) -> Self {
        Self(inner)
    }

    /// Stable storage address.
    #[must_use]
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// True when both handles share storage.
    #[must_use]
    pub fn is(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Creates a weak handle.
    #[must_use]
    pub fn downgrade(&self) -> WeakRef {
        WeakRef::Hash(Arc::downgrade(&self.0))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        read_guard(&self.0).map.len()
    }

    /// Whether the hash is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the value under `key`; missing keys yield `Undef`.
    #[must_use]
    pub fn get(&self, key: &str) -> Scalar {
        read_guard(&self.0).map.get(key).map_or(Scalar::Undef, ScalarRef::get)
    }

    /// Returns the slot under `key`, creating an undef slot if absent
    /// (lvalue autovivification).
    #[must_use]
    pub fn slot(&self, key: &str) -> ScalarRef {
        let mut inner = write_guard(&self.0);
        if let Some(slot) = inner.map.get(key) {
            return slot.clone();
        }
        let slot = ScalarRef::undef();
        inner.map.insert(Arc::from(key), slot.clone());
        slot
    }

    /// Sets the value under `key`.
    pub fn set(&self, key: &str, value: Scalar) {
        self.slot(key).set(value);
    }

    /// Deletes `key`, returning the removed value.
    #[must_use]
    pub fn delete(&self, key: &str) -> Scalar {
        write_guard(&self.0)
            .map
            .shift_remove(key)
            .map_or(Scalar::Undef, |slot| slot.get())
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn exists(&self, key: &str) -> bool {
        read_guard(&self.0).map.contains_key(key)
    }

    /// The keys, in insertion order.
    #[must_use]
    pub fn keys(&self) -> List {
        read_guard(&self.0)
            .map
            .keys()
            .map(|key| Scalar::Str(key.clone()))
            .collect()
    }

    /// The values, in insertion order.
    #[must_use]
    pub fn values(&self) -> List {
        read_guard(&self.0).map.values().map(ScalarRef::get).collect()
    }

    /// Replaces the contents from a flat key/value list. An odd trailing
    /// key gets an undef value.
    pub fn assign_list(&self, list: &List, interner: &Interner) {
        let mut inner = write_guard(&self.0);
        inner.map.clear();
        let values = list.values();
        let mut index = 0;
        while index < values.len() {
            let key = values[index].str_plain(interner);
            let value = values.get(index + 1).cloned().unwrap_or(Scalar::Undef);
            inner.map.insert(key, ScalarRef::new(value));
            index += 2;
        }
    }

    /// Flattens to an alternating key/value list, in insertion order.
    #[must_use]
    pub fn to_list(&self) -> List {
        let inner = read_guard(&self.0);
        let mut list = List::new();
        for (key, slot) in &inner.map {
            list.push(Scalar::Str(key.clone()));
            list.push(slot.get());
        }
        list
    }

    /// Hash slice: values under each key in `keys`.
    #[must_use]
    pub fn slice(&self, keys: &List, interner: &Interner) -> List {
        keys.values()
            .iter()
            .map(|key| self.get(&key.str_plain(interner)))
            .collect()
    }

    /// Applies a bless tag (see `ArrayRef::bless`).
    pub fn bless(&self, class: ClassId, overloaded: bool) {
        let mut inner = write_guard(&self.0);
        inner.blessed = Some(class);
        inner.overloaded = overloaded;
    }

    /// The bless tag, if any.
    #[must_use]
    pub fn blessed(&self) -> Option<ClassId> {
        read_guard(&self.0).blessed
    }

    /// Whether the overload bit is set.
    #[must_use]
    pub fn overloaded(&self) -> bool {
        read_guard(&self.0).overloaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_shift_unshift() {
        let array = ArrayRef::new();
        array.push_value(Scalar::Int(1));
        array.push_value(Scalar::Int(2));
        array.unshift_value(Scalar::Int(0));
        assert_eq!(array.len(), 3);
        assert_eq!(array.pop().as_int(), 2);
        assert_eq!(array.shift().as_int(), 0);
        assert_eq!(array.len(), 1);
        assert!(array.pop().as_int() == 1 && array.pop().is_undef());
    }

    #[test]
    fn test_element_aliasing_through_slots() {
        let array = ArrayRef::new();
        array.push_value(Scalar::Int(10));
        let slot = array.slot(0);
        slot.set(Scalar::Int(99));
        assert_eq!(array.get(0).as_int(), 99);
    }

    #[test]
    fn test_negative_indices() {
        let array = ArrayRef::new();
        for i in 0..3 {
            array.push_value(Scalar::Int(i));
        }
        assert_eq!(array.get(-1).as_int(), 2);
        assert_eq!(array.get(-3).as_int(), 0);
        assert!(array.get(-4).is_undef());
        assert!(array.get(7).is_undef());
        assert_eq!(array.len(), 3);
    }

    #[test]
    fn test_autovivify_on_slot() {
        let array = ArrayRef::new();
        array.set(3, Scalar::Int(7));
        assert_eq!(array.len(), 4);
        assert!(array.get(0).is_undef());
        assert_eq!(array.get(3).as_int(), 7);
    }

    #[test]
    fn test_splice() {
        let array = ArrayRef::new();
        for i in 1..=5 {
            array.push_value(Scalar::Int(i));
        }
        let mut replacement = List::new();
        replacement.push(Scalar::Int(9));
        let removed = array.splice(1, Some(2), &replacement);
        assert_eq!(removed.len(), 2);
        assert_eq!(removed.values()[0].as_int(), 2);
        let left: Vec<i64> = array.to_list().into_iter().map(|v| v.as_int()).collect();
        assert_eq!(left, vec![1, 9, 4, 5]);
    }

    #[test]
    fn test_hash_basics() {
        let itn = Interner::new();
        let hash = HashRef::new();
        hash.set("a", Scalar::Int(1));
        hash.set("b", Scalar::Int(2));
        assert!(hash.exists("a"));
        assert_eq!(hash.get("b").as_int(), 2);
        assert_eq!(hash.delete("a").as_int(), 1);
        assert!(!hash.exists("a"));
        assert!(hash.get("missing").is_undef());

        let mut flat = List::new();
        for v in [Scalar::from_str_slice("x"), Scalar::Int(10), Scalar::from_str_slice("y"), Scalar::Int(20)] {
            flat.push(v);
        }
        hash.assign_list(&flat, &itn);
        let keys: Vec<String> = hash.keys().into_iter().map(|k| k.plain_message()).collect();
        assert_eq!(keys, vec!["x", "y"]);
    }

    #[test]
    fn test_hash_iteration_order_is_insertion_order() {
        let hash = HashRef::new();
        for key in ["zebra", "apple", "mango"] {
            hash.set(key, Scalar::Int(1));
        }
        let keys: Vec<String> = hash.keys().into_iter().map(|k| k.plain_message()).collect();
        assert_eq!(keys, vec!["zebra", "apple", "mango"]);
    }
}
