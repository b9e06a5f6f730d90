//! The typed payload map: a self-describing string-to-value mapping.
//!
//! `VarMap` is the message body of every control-channel frame. A `VarMap`
//! is a cheap-to-clone handle onto shared state, so the same map can sit in
//! a pending-RPC table while a nested reference to it travels through path
//! lookups. The deep copy of the wire contract is [`VarMap::deep_clone`].
//!
//! Nesting is validated at insert time: `set` rejects any value that would
//! make the map graph reach itself. Path-based sets skip that scan (they
//! create intermediates on the fly); serialization re-checks and refuses to
//! emit a cyclic graph.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::{FromValue, MapError, Value};

/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = 128;

/// Maximum string or byte-array value length in bytes.
pub const MAX_VALUE_LEN: usize = 4096;

/// Default separator for path addressing.
pub const PATH_SEPARATOR: char = '.';

bitflags! {
    /// Map behavior flags; the low three bits travel on the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MapFlags: u8 {
        const CASE_INSENSITIVE = 0b0000_0001;
        const READ_ONLY = 0b0000_0010;
        const CONCURRENT = 0b0000_0100;
    }
}

struct Shared {
    case_insensitive: bool,
    concurrent: bool,
    read_only: AtomicBool,
    entries: Mutex<Vec<(String, Value)>>,
}

/// A shared handle to a typed payload map.
#[derive(Clone)]
pub struct VarMap {
    shared: Arc<Shared>,
}

impl Default for VarMap {
    fn default() -> Self {
        Self::new()
    }
}

impl VarMap {
    /// Create an empty, case-sensitive map.
    pub fn new() -> Self {
        Self::with_flags(MapFlags::empty())
    }

    /// Create an empty map with the given flags.
    ///
    /// A map constructed with `READ_ONLY` starts locked.
    pub fn with_flags(flags: MapFlags) -> Self {
        Self {
            shared: Arc::new(Shared {
                case_insensitive: flags.contains(MapFlags::CASE_INSENSITIVE),
                concurrent: flags.contains(MapFlags::CONCURRENT),
                read_only: AtomicBool::new(flags.contains(MapFlags::READ_ONLY)),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create an empty map with case-insensitive key comparison.
    pub fn case_insensitive() -> Self {
        Self::with_flags(MapFlags::CASE_INSENSITIVE)
    }

    /// Current flags, including the read-only latch.
    pub fn flags(&self) -> MapFlags {
        let mut flags = MapFlags::empty();
        flags.set(MapFlags::CASE_INSENSITIVE, self.shared.case_insensitive);
        flags.set(MapFlags::CONCURRENT, self.shared.concurrent);
        flags.set(MapFlags::READ_ONLY, self.is_read_only());
        flags
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.shared.case_insensitive
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.read_only.load(Ordering::Acquire)
    }

    /// Latch the map read-only. Irreversible; only this map, not nested ones.
    pub fn lock(&self) {
        self.shared.read_only.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.shared
            .entries
            .lock()
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn key_eq(&self, a: &str, b: &str) -> bool {
        if self.shared.case_insensitive {
            a.eq_ignore_ascii_case(b)
        } else {
            a == b
        }
    }

    fn ensure_writable(&self) -> Result<(), MapError> {
        if self.is_read_only() {
            Err(MapError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn validate_key(key: &str) -> Result<(), MapError> {
        if key.len() > MAX_KEY_LEN {
            return Err(MapError::BoundsExceeded {
                what: "key",
                len: key.len(),
                max: MAX_KEY_LEN,
            });
        }
        if key.contains('\0') {
            return Err(MapError::InvalidKey("key contains NUL"));
        }
        Ok(())
    }

    fn validate_value(value: &Value) -> Result<(), MapError> {
        match value {
            Value::Str(s) if s.len() > MAX_VALUE_LEN => Err(MapError::BoundsExceeded {
                what: "string value",
                len: s.len(),
                max: MAX_VALUE_LEN,
            }),
            Value::Bytes(b) if b.len() > MAX_VALUE_LEN => Err(MapError::BoundsExceeded {
                what: "byte array value",
                len: b.len(),
                max: MAX_VALUE_LEN,
            }),
            _ => Ok(()),
        }
    }

    /// Insert or replace a value under `key`.
    ///
    /// Nesting a map checks that the candidate graph does not reach this
    /// map; a would-be cycle fails with [`MapError::CycleDetected`].
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<(), MapError> {
        let value = value.into();
        if let Value::Map(nested) = &value {
            if nested.reaches(self) {
                return Err(MapError::CycleDetected);
            }
        }
        self.set_unchecked(key, value)
    }

    /// Insert without the nesting cycle scan. Used by path sets and the
    /// deserializer; cycles that slip in here are caught at serialize time.
    pub(crate) fn set_unchecked(&self, key: &str, value: Value) -> Result<(), MapError> {
        self.ensure_writable()?;
        Self::validate_key(key)?;
        Self::validate_value(&value)?;

        let mut entries = self.shared.entries.lock();
        if let Some(slot) = entries.iter_mut().find(|(k, _)| self.key_eq(k, key)) {
            // Keep the first-seen key spelling under case-insensitive compare.
            slot.1 = value;
        } else {
            entries.push((key.to_owned(), value));
        }
        Ok(())
    }

    /// True if `self` or any map reachable from it is `target`.
    fn reaches(&self, target: &VarMap) -> bool {
        fn walk(map: &VarMap, target: &VarMap, visited: &mut Vec<*const ()>) -> bool {
            let ptr = Arc::as_ptr(&map.shared) as *const ();
            if visited.contains(&ptr) {
                return false;
            }
            visited.push(ptr);
            if Arc::ptr_eq(&map.shared, &target.shared) {
                return true;
            }
            let entries = map.shared.entries.lock();
            for (_, v) in entries.iter() {
                if let Value::Map(nested) = v {
                    if walk(nested, target, visited) {
                        return true;
                    }
                }
            }
            false
        }
        let mut visited = Vec::new();
        walk(self, target, &mut visited)
    }

    /// Fetch a value by key.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.shared
            .entries
            .lock()
            .iter()
            .find(|(k, _)| self.key_eq(k, key))
            .map(|(_, v)| v.clone())
    }

    /// Typed fetch with best-effort string↔scalar coercion.
    pub fn get<T: FromValue>(&self, key: &str) -> Option<T> {
        self.get_value(key).and_then(|v| T::from_value(&v))
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&self, key: &str) -> Result<bool, MapError> {
        self.ensure_writable()?;
        let mut entries = self.shared.entries.lock();
        match entries.iter().position(|(k, _)| self.key_eq(k, key)) {
            Some(idx) => {
                entries.remove(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Set through a `.`-separated path, creating intermediate maps.
    pub fn set_path(&self, path: &str, value: impl Into<Value>) -> Result<(), MapError> {
        self.set_path_sep(path, PATH_SEPARATOR, value)
    }

    /// Set through a path with a custom separator.
    ///
    /// Intermediate maps inherit this map's case and concurrency flags. An
    /// intermediate key holding a non-map value is replaced by a fresh map.
    /// No cycle scan runs here; serialization is the backstop.
    pub fn set_path_sep(
        &self,
        path: &str,
        sep: char,
        value: impl Into<Value>,
    ) -> Result<(), MapError> {
        let segments: Vec<&str> = path.split(sep).collect();
        let (last, parents) = segments.split_last().expect("split yields at least one");

        let mut cur = self.clone();
        for seg in parents {
            let next = match cur.get_value(seg) {
                Some(Value::Map(m)) => m,
                _ => {
                    let child_flags = cur.flags() & (MapFlags::CASE_INSENSITIVE | MapFlags::CONCURRENT);
                    let m = VarMap::with_flags(child_flags);
                    cur.set_unchecked(seg, Value::Map(m.clone()))?;
                    m
                }
            };
            cur = next;
        }
        cur.set_unchecked(last, value.into())
    }

    /// Fetch a value through a `.`-separated path.
    pub fn get_path_value(&self, path: &str) -> Option<Value> {
        self.get_path_value_sep(path, PATH_SEPARATOR)
    }

    pub fn get_path_value_sep(&self, path: &str, sep: char) -> Option<Value> {
        let segments: Vec<&str> = path.split(sep).collect();
        let (last, parents) = segments.split_last()?;

        let mut cur = self.clone();
        for seg in parents {
            cur = match cur.get_value(seg) {
                Some(Value::Map(m)) => m,
                _ => return None,
            };
        }
        cur.get_value(last)
    }

    /// Typed path fetch.
    pub fn get_path<T: FromValue>(&self, path: &str) -> Option<T> {
        self.get_path_value(path).and_then(|v| T::from_value(&v))
    }

    /// Remove a key through a path. Missing intermediates are not an error.
    pub fn delete_path(&self, path: &str) -> Result<bool, MapError> {
        self.delete_path_sep(path, PATH_SEPARATOR)
    }

    pub fn delete_path_sep(&self, path: &str, sep: char) -> Result<bool, MapError> {
        self.ensure_writable()?;
        let segments: Vec<&str> = path.split(sep).collect();
        let (last, parents) = segments.split_last().expect("split yields at least one");

        let mut cur = self.clone();
        for seg in parents {
            cur = match cur.get_value(seg) {
                Some(Value::Map(m)) => m,
                _ => return Ok(false),
            };
        }
        cur.delete(last)
    }

    /// Recursively copy this map into an independent graph.
    ///
    /// Flags are preserved, including the read-only latch. Fails on a
    /// cyclic graph (only reachable through path-based sets).
    pub fn deep_clone(&self) -> Result<VarMap, MapError> {
        fn clone_map(map: &VarMap, stack: &mut Vec<*const ()>) -> Result<VarMap, MapError> {
            let ptr = Arc::as_ptr(&map.shared) as *const ();
            if stack.contains(&ptr) {
                return Err(MapError::CycleDetected);
            }
            stack.push(ptr);

            let flags = map.flags() & (MapFlags::CASE_INSENSITIVE | MapFlags::CONCURRENT);
            let out = VarMap::with_flags(flags);
            for (k, v) in map.snapshot_entries() {
                let v = match v {
                    Value::Map(nested) => Value::Map(clone_map(&nested, stack)?),
                    other => other,
                };
                out.set_unchecked(&k, v)?;
            }
            if map.is_read_only() {
                out.lock();
            }
            stack.pop();
            Ok(out)
        }
        let mut stack = Vec::new();
        clone_map(self, &mut stack)
    }

    /// Snapshot of the entries, in insertion order.
    pub(crate) fn snapshot_entries(&self) -> Vec<(String, Value)> {
        self.shared.entries.lock().clone()
    }

    /// Identity of the shared state, for cycle bookkeeping.
    pub(crate) fn shared_ptr(&self) -> *const () {
        Arc::as_ptr(&self.shared) as *const ()
    }

    /// The wire flags byte.
    pub(crate) fn flags_byte(&self) -> u8 {
        self.flags().bits()
    }
}

impl PartialEq for VarMap {
    /// Entry-set equality: same flags and, for every key, an equal value.
    /// Insertion order is not significant.
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.shared, &other.shared) {
            return true;
        }
        if self.flags() != other.flags() || self.len() != other.len() {
            return false;
        }
        let entries = self.snapshot_entries();
        entries
            .iter()
            .all(|(k, v)| other.get_value(k).is_some_and(|ov| ov == *v))
    }
}

impl fmt::Debug for VarMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.shared.entries.lock();
        let mut map = f.debug_map();
        for (k, v) in entries.iter() {
            map.entry(k, v);
        }
        map.finish()
    }
}
