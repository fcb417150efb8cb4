//! Value map storage
//!
//! [`ValueMap`] backs the script map object. Keys are compared by byte
//! equality when they are strings (of any encoding) and by value-bit
//! equality otherwise, so `m["ab"]` hits regardless of which string object
//! carries the bytes.
//!
//! The table is an index map: a SwissTable (`FxHashMap`) from hashed keys to
//! entry indices plus an insertion-ordered entry vector with tombstones.
//! Map iterators step through entry indices, which keeps iteration stable
//! under concurrent removal.
//!
//! The map does no reference counting itself; the VM retains keys/values on
//! insert and releases whatever [`ValueMap::remove`] and the map destructor
//! hand back.

use std::hash::{Hash, Hasher};

use rustc_hash::{FxHashMap, FxHasher};

use crate::value::Value;

/// Hashed map key: string bytes, or raw value bits
#[derive(Debug, Clone, PartialEq, Eq)]
struct MapKey {
    /// Owned copy of the key's bytes for string keys, `None` otherwise
    bytes: Option<Box<[u8]>>,
    /// Raw bits for non-string keys
    bits: u64,
}

impl Hash for MapKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.bytes {
            Some(b) => {
                state.write_u8(1);
                state.write(b);
            }
            None => {
                state.write_u8(0);
                state.write_u64(self.bits);
            }
        }
    }
}

impl MapKey {
    fn new(key: Value, key_bytes: Option<&[u8]>) -> Self {
        match key_bytes {
            Some(b) => Self {
                bytes: Some(b.into()),
                bits: 0,
            },
            None => Self {
                bytes: None,
                bits: key.raw(),
            },
        }
    }
}

/// Map storage with byte-equality string keys and stable iteration order
#[derive(Debug, Default)]
pub struct ValueMap {
    index: FxHashMap<MapKey, usize>,
    entries: Vec<Option<(Value, Value)>>,
    len: usize,
}

impl ValueMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the map has no live entries
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert or overwrite
    ///
    /// `key_bytes` must be the key's bytes when the key is any string kind.
    /// Returns the prior value if the key already existed; in that case the
    /// originally stored key object is kept and `key` is not stored.
    pub fn insert(&mut self, key: Value, key_bytes: Option<&[u8]>, val: Value) -> Option<Value> {
        let mk = MapKey::new(key, key_bytes);
        if let Some(&i) = self.index.get(&mk) {
            let entry = self.entries[i].as_mut().expect("index points at tombstone");
            let old = entry.1;
            entry.1 = val;
            return Some(old);
        }
        self.entries.push(Some((key, val)));
        self.index.insert(mk, self.entries.len() - 1);
        self.len += 1;
        None
    }

    /// Look up a value
    pub fn get(&self, key: Value, key_bytes: Option<&[u8]>) -> Option<Value> {
        let mk = MapKey::new(key, key_bytes);
        self.index
            .get(&mk)
            .map(|&i| self.entries[i].expect("index points at tombstone").1)
    }

    /// Remove an entry, returning the stored key and value for the caller to
    /// release
    pub fn remove(&mut self, key: Value, key_bytes: Option<&[u8]>) -> Option<(Value, Value)> {
        let mk = MapKey::new(key, key_bytes);
        let i = self.index.remove(&mk)?;
        let entry = self.entries[i].take().expect("index points at tombstone");
        self.len -= 1;
        Some(entry)
    }

    /// Next live entry at or after `idx`, advancing `idx` past it
    ///
    /// Drives map iterator objects; tombstones are skipped.
    pub fn next_entry(&self, idx: &mut u32) -> Option<(Value, Value)> {
        while (*idx as usize) < self.entries.len() {
            let i = *idx as usize;
            *idx += 1;
            if let Some(entry) = self.entries[i] {
                return Some(entry);
            }
        }
        None
    }

    /// Iterate live entries, for teardown and heap walks
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().filter_map(|e| *e)
    }

    /// Hash the byte content the way string map keys are hashed
    pub fn hash_bytes(bytes: &[u8]) -> u64 {
        let mut h = FxHasher::default();
        h.write_u8(1);
        h.write(bytes);
        h.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_bits() {
        let mut m = ValueMap::new();
        assert!(m.insert(Value::number(1.0), None, Value::integer(10)).is_none());
        assert!(m.insert(Value::number(2.0), None, Value::integer(20)).is_none());
        assert_eq!(m.get(Value::number(1.0), None), Some(Value::integer(10)));
        assert_eq!(m.get(Value::number(3.0), None), None);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn test_string_keys_by_bytes() {
        let mut m = ValueMap::new();
        // two distinct key values with the same bytes must collide
        let k1 = Value::static_astring(0, 2);
        let k2 = Value::static_astring(10, 12);
        m.insert(k1, Some(b"ab"), Value::integer(1));
        let prior = m.insert(k2, Some(b"ab"), Value::integer(2));
        assert_eq!(prior, Some(Value::integer(1)));
        assert_eq!(m.len(), 1);
        assert_eq!(m.get(k2, Some(b"ab")), Some(Value::integer(2)));
    }

    #[test]
    fn test_overwrite_keeps_original_key() {
        let mut m = ValueMap::new();
        let k1 = Value::static_astring(0, 1);
        let k2 = Value::static_astring(5, 6);
        m.insert(k1, Some(b"x"), Value::integer(1));
        m.insert(k2, Some(b"x"), Value::integer(2));
        let (stored_key, _) = m.remove(k2, Some(b"x")).unwrap();
        assert_eq!(stored_key, k1);
    }

    #[test]
    fn test_remove() {
        let mut m = ValueMap::new();
        m.insert(Value::integer(1), None, Value::integer(10));
        let (k, v) = m.remove(Value::integer(1), None).unwrap();
        assert_eq!(k, Value::integer(1));
        assert_eq!(v, Value::integer(10));
        assert!(m.remove(Value::integer(1), None).is_none());
        assert!(m.is_empty());
    }

    #[test]
    fn test_iteration_stable_under_removal() {
        let mut m = ValueMap::new();
        for i in 0..5 {
            m.insert(Value::integer(i), None, Value::integer(i * 10));
        }
        let mut idx = 0u32;
        assert_eq!(m.next_entry(&mut idx).unwrap().0, Value::integer(0));
        m.remove(Value::integer(1), None);
        // removal of an entry the cursor has not reached is simply skipped
        assert_eq!(m.next_entry(&mut idx).unwrap().0, Value::integer(2));
        assert_eq!(m.next_entry(&mut idx).unwrap().0, Value::integer(3));
        assert_eq!(m.next_entry(&mut idx).unwrap().0, Value::integer(4));
        assert!(m.next_entry(&mut idx).is_none());
    }

    #[test]
    fn test_number_and_int_keys_are_distinct() {
        // 1.0 and integer(1) have different bit patterns and are distinct keys
        let mut m = ValueMap::new();
        m.insert(Value::number(1.0), None, Value::integer(1));
        m.insert(Value::integer(1), None, Value::integer(2));
        assert_eq!(m.len(), 2);
    }
}
