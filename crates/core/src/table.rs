//! Open-addressed, linear-probed string-keyed hash table.
//!
//! One implementation backs globals, instance properties, class methods,
//! module exports and the VM's string-intern table (spec.md §4.6). Capacity
//! is always a power of two so the bucket index is a cheap `hash & (cap-1)`.

use std::ptr::NonNull;

use crate::object::ObjString;
use crate::value::Value;

const LOAD_FACTOR_MAX: f64 = 0.75;
const INITIAL_CAPACITY: usize = 8;

#[derive(Clone, Copy)]
enum Slot {
    Empty,
    Tombstone,
    Occupied(NonNull<ObjString>, Value),
}

pub struct Table {
    entries: Vec<Slot>,
    count: usize, // occupied + tombstones
    len: usize,   // occupied only
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table {
            entries: Vec::new(),
            count: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_slot(entries: &[Slot], key: NonNull<ObjString>) -> usize {
        let cap = entries.len();
        let hash = unsafe { key.as_ref() }.data.hash;
        let mut index = (hash as usize) & (cap - 1);
        let mut first_tombstone: Option<usize> = None;
        loop {
            match entries[index] {
                Slot::Empty => return first_tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                Slot::Occupied(k, _) => {
                    if same_key(k, key) {
                        return index;
                    }
                }
            }
            index = (index + 1) & (cap - 1);
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let mut new_entries = vec![Slot::Empty; new_capacity];
        let mut new_len = 0;
        for slot in &self.entries {
            if let Slot::Occupied(k, v) = *slot {
                let idx = Table::find_slot(&new_entries, k);
                new_entries[idx] = Slot::Occupied(k, v);
                new_len += 1;
            }
        }
        self.entries = new_entries;
        self.count = new_len;
        self.len = new_len;
    }

    pub fn get(&self, key: NonNull<ObjString>) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        match self.entries[Table::find_slot(&self.entries, key)] {
            Slot::Occupied(_, v) => Some(v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<Value> {
        self.entries.iter().find_map(|slot| match slot {
            Slot::Occupied(k, v) if unsafe { k.as_ref() }.as_str() == name => Some(*v),
            _ => None,
        })
    }

    /// Insert or overwrite. Returns `true` if this created a new key.
    pub fn set(&mut self, key: NonNull<ObjString>, value: Value) -> bool {
        if self.count + 1 > ((self.capacity() as f64 * LOAD_FACTOR_MAX) as usize) {
            let new_cap = if self.capacity() == 0 {
                INITIAL_CAPACITY
            } else {
                self.capacity() * 2
            };
            self.grow(new_cap);
        }
        let idx = Table::find_slot(&self.entries, key);
        let is_new = !matches!(self.entries[idx], Slot::Occupied(..));
        let was_tombstone = matches!(self.entries[idx], Slot::Tombstone);
        self.entries[idx] = Slot::Occupied(key, value);
        if is_new {
            self.len += 1;
            if !was_tombstone {
                self.count += 1;
            }
        }
        is_new
    }

    /// Delete via tombstone so probe chains past this slot stay valid.
    pub fn delete(&mut self, key: NonNull<ObjString>) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let idx = Table::find_slot(&self.entries, key);
        if matches!(self.entries[idx], Slot::Occupied(..)) {
            self.entries[idx] = Slot::Tombstone;
            self.len -= 1;
            true
        } else {
            false
        }
    }

    /// Look up an interned string by raw bytes/hash, comparing length, hash
    /// then bytes, as spec.md §4.6 requires for the intern-table invariant.
    pub fn find_string(&self, bytes: &str, hash: u32) -> Option<NonNull<ObjString>> {
        if self.entries.is_empty() {
            return None;
        }
        let cap = self.capacity();
        let mut index = (hash as usize) & (cap - 1);
        loop {
            match self.entries[index] {
                Slot::Empty => return None,
                Slot::Occupied(k, _) => {
                    let s = unsafe { k.as_ref() };
                    if s.len() == bytes.len() && s.data.hash == hash && s.as_str() == bytes {
                        return Some(k);
                    }
                }
                Slot::Tombstone => {}
            }
            index = (index + 1) & (cap - 1);
        }
    }

    /// Remove every entry whose string key is not marked, per the weak
    /// intern-table sweep (spec.md §3 Lifecycle, §4.5 Sweep).
    pub fn remove_unmarked_keys(&mut self) {
        for slot in &mut self.entries {
            if let Slot::Occupied(k, _) = *slot {
                if !unsafe { k.as_ref() }.header.is_marked.get() {
                    *slot = Slot::Tombstone;
                    self.len -= 1;
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (NonNull<ObjString>, Value)> + '_ {
        self.entries.iter().filter_map(|slot| match slot {
            Slot::Occupied(k, v) => Some((*k, *v)),
            _ => None,
        })
    }

    /// Copy another table's entries wholesale, used when a class inherits a
    /// superclass's methods table onto its own (spec.md §4.6: subclasses get
    /// *fresh* OverloadedMethod objects, which the caller is responsible for
    /// deep-copying before calling this — this just copies key/value pairs).
    pub fn add_all_from(&mut self, other: &Table) {
        for (k, v) in other.iter() {
            self.set(k, v);
        }
    }
}

fn same_key(a: NonNull<ObjString>, b: NonNull<ObjString>) -> bool {
    a == b
}
