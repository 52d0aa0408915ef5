use std::collections::HashMap;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    #[error("table has no free keys")]
    Full,
    #[error("value not present")]
    NotPresent,
}

/// Maps opaque `u32` handles to resources owned by a background worker.
///
/// Front-end objects only ever hold the handle; every message sent to the
/// worker names the handle and the worker looks the resource up here. Keys
/// are handed out from a monotonically increasing counter so that a stale
/// handle from a disposed resource does not alias a fresh one until the
/// counter wraps around.
#[derive(Debug)]
pub struct ResourceTable<T> {
    map: HashMap<u32, T>,
    next_key: u32,
}

impl<T> Default for ResourceTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResourceTable<T> {
    /// Create an empty table
    pub fn new() -> Self {
        ResourceTable {
            map: HashMap::new(),
            // Zero is never handed out so it can be used as a sentinel by
            // callers.
            next_key: 1,
        }
    }

    /// Insert a resource at the next available index.
    pub fn push(&mut self, entry: T) -> Result<u32, TableError> {
        // NOTE: The performance of this new key calculation could be very bad once keys wrap
        // around.
        if self.map.len() == u32::MAX as usize - 1 {
            return Err(TableError::Full);
        }
        loop {
            let key = self.next_key;
            self.next_key = self.next_key.wrapping_add(1);
            if key == 0 || self.map.contains_key(&key) {
                continue;
            }
            self.map.insert(key, entry);
            return Ok(key);
        }
    }

    /// Check if the table has a resource at the given index.
    pub fn contains_key(&self, key: u32) -> bool {
        self.map.contains_key(&key)
    }

    pub fn get(&self, key: u32) -> Result<&T, TableError> {
        self.map.get(&key).ok_or(TableError::NotPresent)
    }

    pub fn get_mut(&mut self, key: u32) -> Result<&mut T, TableError> {
        self.map.get_mut(&key).ok_or(TableError::NotPresent)
    }

    /// Remove a resource at a given index from the table.
    pub fn delete(&mut self, key: u32) -> Result<T, TableError> {
        self.map.remove(&key).ok_or(TableError::NotPresent)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_not_reused_after_delete() {
        let mut table = ResourceTable::new();
        let a = table.push("a").unwrap();
        let b = table.push("b").unwrap();
        assert_ne!(a, b);
        assert_eq!(table.delete(a).unwrap(), "a");
        let c = table.push("c").unwrap();
        assert_ne!(c, a);
        assert_eq!(table.get(a), Err(TableError::NotPresent));
        assert_eq!(*table.get(c).unwrap(), "c");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn zero_is_never_a_key() {
        let mut table = ResourceTable::new();
        table.next_key = u32::MAX;
        let a = table.push(()).unwrap();
        let b = table.push(()).unwrap();
        assert_eq!(a, u32::MAX);
        assert_eq!(b, 1);
    }
}
