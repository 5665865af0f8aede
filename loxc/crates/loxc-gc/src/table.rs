//! Open-addressed hash table keyed by interned strings (spec.md §3.4).
//!
//! Used for VM globals, class methods, and instance fields. Linear
//! probing, capacity always a power of two, grown at a 0.75 load factor,
//! deletion via tombstones. Key equality is [`GcRef`] equality: because
//! strings are interned (spec.md §3.3), two keys with the same bytes are
//! the *same* `GcRef`, so the table never needs to dereference the heap to
//! compare key contents — only to learn a new key's hash when inserting,
//! which the caller already has cached on the `LoxString` itself.

use crate::object::GcRef;
use crate::value::Value;

const INITIAL_CAPACITY: usize = 8;
const MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
enum Entry {
    Empty,
    Tombstone,
    Occupied { key: GcRef, hash: u32, value: Value },
}

#[derive(Default)]
pub struct Table {
    entries: Vec<Entry>,
    count: usize, // occupied + tombstones
    live: usize,  // occupied only
}

impl Table {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            count: 0,
            live: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity_bytes(&self) -> usize {
        self.entries.len() * std::mem::size_of::<Entry>()
    }

    pub fn get(&self, key: GcRef, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = self.find_entry(key, hash);
        match self.entries[idx] {
            Entry::Occupied { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Returns `true` if this inserted a brand-new key (mirrors clox's
    /// `tableSet` return value, used by `DEFINE_GLOBAL` vs. `SET_GLOBAL`).
    pub fn set(&mut self, key: GcRef, hash: u32, value: Value) -> bool {
        if self.count + 1 > (self.entries.len() as f64 * MAX_LOAD) as usize {
            self.grow();
        }

        let idx = self.find_entry(key, hash);
        let is_new = !matches!(self.entries[idx], Entry::Occupied { .. });
        if is_new && matches!(self.entries[idx], Entry::Empty) {
            self.count += 1;
        }
        if is_new {
            self.live += 1;
        }
        self.entries[idx] = Entry::Occupied { key, hash, value };
        is_new
    }

    /// Tombstone deletion: key becomes absent, slot stays "occupied" for
    /// probing purposes (spec.md §3.4: "key-null, value=Bool(true)").
    pub fn delete(&mut self, key: GcRef, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let idx = self.find_entry(key, hash);
        if matches!(self.entries[idx], Entry::Occupied { .. }) {
            self.entries[idx] = Entry::Tombstone;
            self.live -= 1;
            true
        } else {
            false
        }
    }

    pub fn contains(&self, key: GcRef, hash: u32) -> bool {
        self.get(key, hash).is_some()
    }

    /// All live (key, value) pairs, for GC marking and `INHERIT`.
    pub fn iter(&self) -> impl Iterator<Item = (GcRef, Value)> + '_ {
        self.entries.iter().filter_map(|e| match e {
            Entry::Occupied { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }

    /// Copies every entry of `other` into `self`, used by `OP_INHERIT`.
    pub fn copy_from(&mut self, other: &Table) {
        for entry in &other.entries {
            if let Entry::Occupied { key, hash, value } = entry {
                self.set(*key, *hash, *value);
            }
        }
    }

    fn find_entry(&self, key: GcRef, hash: u32) -> usize {
        let cap = self.entries.len();
        let mask = cap - 1;
        let mut idx = hash as usize & mask;
        let mut first_tombstone: Option<usize> = None;
        loop {
            match self.entries[idx] {
                Entry::Empty => return first_tombstone.unwrap_or(idx),
                Entry::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                }
                Entry::Occupied { key: k, .. } if k == key => return idx,
                Entry::Occupied { .. } => {}
            }
            idx = (idx + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let new_cap = if self.entries.is_empty() {
            INITIAL_CAPACITY
        } else {
            self.entries.len() * 2
        };
        let old_entries = std::mem::replace(&mut self.entries, vec![Entry::Empty; new_cap]);
        self.count = 0;
        self.live = 0;
        for entry in old_entries {
            if let Entry::Occupied { key, hash, value } = entry {
                let idx = self.find_entry(key, hash);
                self.entries[idx] = Entry::Occupied { key, hash, value };
                self.count += 1;
                self.live += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::GcRef;

    fn key(n: u32) -> GcRef {
        GcRef::from_raw(n)
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut t = Table::new();
        assert!(t.set(key(1), 0xDEAD, Value::Number(42.0)));
        assert_eq!(t.get(key(1), 0xDEAD), Some(Value::Number(42.0)));
    }

    #[test]
    fn set_on_existing_key_returns_false_and_overwrites() {
        let mut t = Table::new();
        assert!(t.set(key(1), 1, Value::Number(1.0)));
        assert!(!t.set(key(1), 1, Value::Number(2.0)));
        assert_eq!(t.get(key(1), 1), Some(Value::Number(2.0)));
    }

    #[test]
    fn delete_then_get_is_none_but_reuses_the_tombstone_slot() {
        let mut t = Table::new();
        t.set(key(1), 1, Value::Bool(true));
        assert!(t.delete(key(1), 1));
        assert_eq!(t.get(key(1), 1), None);
        assert!(t.set(key(2), 1, Value::Nil));
        assert_eq!(t.get(key(2), 1), Some(Value::Nil));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut t = Table::new();
        for i in 0..100u32 {
            t.set(key(i), i, Value::Number(i as f64));
        }
        assert_eq!(t.len(), 100);
        for i in 0..100u32 {
            assert_eq!(t.get(key(i), i), Some(Value::Number(i as f64)));
        }
    }
}
