//! Module scope table
//!
//! Open addressing with linear probing over a power-of-two slot array.
//! Entries are never removed, only overwritten, so probing needs no
//! tombstones.

use crate::value::Value;

/// Initial slot count
pub const INITIAL_CAPACITY: usize = 16;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// FNV-1a hash of a symbol name
pub fn hash_name(name: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in name.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Debug, Clone)]
struct Entry {
    name: Box<str>,
    hash: u32,
    value: Value,
    exported: bool,
}

/// Name → (value, visibility) table
#[derive(Debug, Clone)]
pub struct SymbolTable {
    slots: Vec<Option<Entry>>,
    count: usize,
}

impl SymbolTable {
    /// Create an empty table with the initial capacity
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    /// Create an empty table with room for at least `capacity` slots
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(INITIAL_CAPACITY).next_power_of_two();
        Self {
            slots: vec![None; capacity],
            count: 0,
        }
    }

    /// Number of defined symbols
    pub fn len(&self) -> usize {
        self.count
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slot holding `name`, or the empty slot where it would go
    fn find_slot(&self, name: &str, hash: u32) -> usize {
        let mask = self.slots.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            match &self.slots[index] {
                None => return index,
                Some(entry) if entry.hash == hash && &*entry.name == name => return index,
                Some(_) => index = (index + 1) & mask,
            }
        }
    }

    fn grow(&mut self) {
        let new_capacity = self.slots.len() * 2;
        let old = std::mem::replace(&mut self.slots, vec![None; new_capacity]);
        let mask = new_capacity - 1;
        for entry in old.into_iter().flatten() {
            let mut index = entry.hash as usize & mask;
            while self.slots[index].is_some() {
                index = (index + 1) & mask;
            }
            self.slots[index] = Some(entry);
        }
    }

    /// Define or overwrite a symbol
    ///
    /// Redefining an existing name replaces its value and visibility in place.
    pub fn define(&mut self, name: &str, value: Value, exported: bool) {
        let hash = hash_name(name);
        let index = self.find_slot(name, hash);
        if let Some(entry) = &mut self.slots[index] {
            entry.value = value;
            entry.exported = exported;
            return;
        }

        let index = if (self.count + 1) * 4 > self.slots.len() * 3 {
            self.grow();
            self.find_slot(name, hash)
        } else {
            index
        };

        self.slots[index] = Some(Entry {
            name: name.into(),
            hash,
            value,
            exported,
        });
        self.count += 1;
    }

    fn entry(&self, name: &str) -> Option<&Entry> {
        let hash = hash_name(name);
        self.slots[self.find_slot(name, hash)].as_ref()
    }

    /// Look up a symbol's value
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entry(name).map(|entry| &entry.value)
    }

    /// Look up a symbol's value, yielding nil when absent
    pub fn get_or_nil(&self, name: &str) -> Value {
        self.get(name).cloned().unwrap_or(Value::Nil)
    }

    /// Check whether a symbol is defined
    pub fn has(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    /// Check whether a symbol is defined and exported
    pub fn is_exported(&self, name: &str) -> bool {
        self.entry(name).map(|entry| entry.exported).unwrap_or(false)
    }

    /// Iterate over `(name, value, exported)` in slot order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value, bool)> {
        self.slots
            .iter()
            .flatten()
            .map(|entry| (&*entry.name, &entry.value, entry.exported))
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}
