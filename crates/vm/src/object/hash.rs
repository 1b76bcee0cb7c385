use std::hash::Hasher;

use fnv::FnvHasher;
use hashbrown::HashTable;

use crate::gc::{Heap, Trace, Tracer};
use crate::value::Value;

#[derive(Debug, Clone)]
struct Entry {
    hash: u64,
    key: Value,
    value: Value,
}

/// An insertion-ordered hash map from values to values.
///
/// Keys compare like `eql?`: immediates by value (`1` and `1.0` are distinct),
/// strings by content and every other object by identity. String contents are
/// read from the heap, so operations take it as a parameter and the map is
/// moved out of its object while it is being modified.
#[derive(Debug, Clone, Default)]
pub struct RHash {
    table: HashTable<usize>,
    /// Entries in insertion order; removed entries leave a tombstone
    entries: Vec<Option<Entry>>,
    len: usize,
}

pub(crate) fn hash_key(heap: &Heap, key: Value) -> u64 {
    let mut h = FnvHasher::default();
    match key {
        Value::Nil => h.write_u8(0),
        Value::False => h.write_u8(1),
        Value::True => h.write_u8(2),
        Value::Integer(i) => {
            h.write_u8(3);
            h.write_i64(i)
        }
        Value::Float(f) => {
            h.write_u8(4);
            h.write_u64(f.to_bits())
        }
        Value::Symbol(s) => {
            h.write_u8(5);
            h.write_u32(s.id())
        }
        Value::Object(r) => match heap.get(r).as_string() {
            Some(bytes) => {
                h.write_u8(6);
                h.write(bytes)
            }
            None => {
                h.write_u8(7);
                h.write_u64(slotmap::Key::data(&r).as_ffi())
            }
        },
    }
    h.finish()
}

pub(crate) fn key_eql(heap: &Heap, a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Object(x), Value::Object(y)) if x != y => {
            match (heap.get(x).as_string(), heap.get(y).as_string()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        // distinct from `==`: NaN is a key equal to itself
        (Value::Float(x), Value::Float(y)) => x.to_bits() == y.to_bits(),
        _ => a == b,
    }
}

impl RHash {
    pub fn new() -> RHash {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    fn find(&self, heap: &Heap, hash: u64, key: Value) -> Option<usize> {
        let entries = &self.entries;
        self.table
            .find(hash, |&i| {
                entries[i]
                    .as_ref()
                    .map_or(false, |e| e.hash == hash && key_eql(heap, e.key, key))
            })
            .copied()
    }

    pub fn get(&self, heap: &Heap, key: Value) -> Option<Value> {
        let hash = hash_key(heap, key);
        let idx = self.find(heap, hash, key)?;
        self.entries[idx].as_ref().map(|e| e.value)
    }

    pub fn contains_key(&self, heap: &Heap, key: Value) -> bool {
        self.get(heap, key).is_some()
    }

    /// Insert or overwrite. An existing key keeps its position.
    pub fn insert(&mut self, heap: &Heap, key: Value, value: Value) -> Option<Value> {
        let hash = hash_key(heap, key);
        if let Some(idx) = self.find(heap, hash, key) {
            let entry = self.entries[idx].as_mut().expect("table points at a live entry");
            return Some(std::mem::replace(&mut entry.value, value));
        }
        let idx = self.entries.len();
        self.entries.push(Some(Entry { hash, key, value }));
        let entries = &self.entries;
        self.table.insert_unique(hash, idx, |&i| {
            entries[i].as_ref().map_or(0, |e| e.hash)
        });
        self.len += 1;
        None
    }

    pub fn remove(&mut self, heap: &Heap, key: Value) -> Option<Value> {
        let hash = hash_key(heap, key);
        let entries = &self.entries;
        let found = self.table.find_entry(hash, |&i| {
            entries[i]
                .as_ref()
                .map_or(false, |e| e.hash == hash && key_eql(heap, e.key, key))
        });
        let idx = match found {
            Ok(entry) => entry.remove().0,
            Err(_) => return None,
        };
        let removed = self.entries[idx].take().map(|e| e.value);
        self.len -= 1;
        if self.entries.len() > 8 && self.len * 2 < self.entries.len() {
            self.compact();
        }
        removed
    }

    /// Drop tombstones and rebuild the index.
    fn compact(&mut self) {
        self.entries.retain(Option::is_some);
        self.table.clear();
        for (idx, e) in self.entries.iter().enumerate() {
            let hash = e.as_ref().map_or(0, |e| e.hash);
            let entries = &self.entries;
            self.table.insert_unique(hash, idx, |&i| {
                entries[i].as_ref().map_or(0, |e| e.hash)
            });
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.as_ref().map(|e| (e.key, e.value)))
    }

    pub fn keys(&self) -> impl Iterator<Item = Value> + '_ {
        self.iter().map(|(k, _)| k)
    }

    pub fn first_key(&self) -> Option<Value> {
        self.keys().next()
    }
}

impl Trace for RHash {
    fn trace(&self, tracer: &mut Tracer) {
        for (k, v) in self.iter() {
            tracer.mark_value(k);
            tracer.mark_value(v);
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use test_env_log::test;

    use super::*;
    use crate::config::GcConfig;
    use crate::object::{ObjectKind, RObject};

    fn string(heap: &mut Heap, s: &str) -> Value {
        let class = slotmap::KeyData::from_ffi(0).into();
        Value::Object(heap.alloc(RObject::new(class, ObjectKind::String(s.into()))))
    }

    #[test]
    fn keys_keep_insertion_order() {
        let heap = Heap::new(GcConfig::default());
        let mut h = RHash::new();
        for i in (0..20).rev() {
            h.insert(&heap, Value::Integer(i), Value::Integer(i * 10));
        }
        h.insert(&heap, Value::Integer(5), Value::Nil);
        let keys: Vec<_> = h.keys().filter_map(Value::as_int).collect();
        assert_eq!(keys, (0..20).rev().collect::<Vec<_>>());
        assert_eq!(h.get(&heap, Value::Integer(5)), Some(Value::Nil));
    }

    #[test]
    fn strings_compare_by_content() {
        let mut heap = Heap::new(GcConfig::default());
        let a = string(&mut heap, "key");
        let b = string(&mut heap, "key");
        let mut h = RHash::new();
        h.insert(&heap, a, Value::Integer(1));
        assert_eq!(h.get(&heap, b), Some(Value::Integer(1)));
        assert_eq!(h.insert(&heap, b, Value::Integer(2)), Some(Value::Integer(1)));
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn integer_and_float_keys_differ() {
        let heap = Heap::new(GcConfig::default());
        let mut h = RHash::new();
        h.insert(&heap, Value::Integer(1), Value::True);
        assert_eq!(h.get(&heap, Value::Float(1.0)), None);
    }

    #[test]
    fn removal_survives_compaction() {
        let heap = Heap::new(GcConfig::default());
        let mut h = RHash::new();
        for i in 0..32 {
            h.insert(&heap, Value::Integer(i), Value::Integer(i));
        }
        for i in 0..28 {
            assert_eq!(h.remove(&heap, Value::Integer(i)), Some(Value::Integer(i)));
        }
        assert_eq!(h.remove(&heap, Value::Integer(0)), None);
        assert_eq!(h.len(), 4);
        let rest: Vec<_> = h.iter().map(|(k, _)| k).collect();
        assert_eq!(
            rest,
            vec![Value::Integer(28), Value::Integer(29), Value::Integer(30), Value::Integer(31)]
        );
        assert_eq!(h.get(&heap, Value::Integer(30)), Some(Value::Integer(30)));
    }
}
