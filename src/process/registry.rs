// src/process/registry.rs — Live process table

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::handle::ProcessHandle;

/// Session id (or `pending-…` placeholder) to live process. Every operation
/// takes the single table lock, so a rekey is never observed half-done.
#[derive(Default)]
pub struct ProcessRegistry {
    entries: Mutex<HashMap<String, ProcessHandle>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, ProcessHandle>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, key: &str, handle: ProcessHandle) {
        handle.set_key(key);
        self.entries().insert(key.to_string(), handle);
    }

    pub fn get(&self, key: &str) -> Option<ProcessHandle> {
        self.entries().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }

    pub fn delete(&self, key: &str) -> Option<ProcessHandle> {
        self.entries().remove(key)
    }

    /// Remove `handle` under whatever key it is filed as now. Leaves the
    /// entry alone if the key has since been taken by a different process.
    pub fn remove_handle(&self, handle: &ProcessHandle) -> bool {
        let mut entries = self.entries();
        let key = handle.key();
        match entries.get(&key) {
            Some(existing) if existing.same_process(handle) => {
                entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Move the entry at `old_key` to `new_key` and update the handle's key.
    /// Returns false, changing nothing, when `old_key` is absent or `new_key`
    /// is held by another process.
    pub fn rekey(&self, old_key: &str, new_key: &str) -> bool {
        let mut entries = self.entries();
        if old_key == new_key {
            return entries.contains_key(old_key);
        }
        if entries.contains_key(new_key) {
            return false;
        }
        match entries.remove(old_key) {
            Some(handle) => {
                handle.set_key(new_key);
                entries.insert(new_key.to_string(), handle);
                true
            }
            None => false,
        }
    }

    /// Run `make` and file its handle under `key`, but only if `key` is free.
    /// The check and the insert happen under one lock, so two callers can
    /// never both start a process for the same key. Returns `Ok(None)` when
    /// the key is taken (and `make` is not called).
    pub fn insert_with<T, E>(
        &self,
        key: &str,
        make: impl FnOnce() -> Result<(ProcessHandle, T), E>,
    ) -> Result<Option<(ProcessHandle, T)>, E> {
        let mut entries = self.entries();
        if entries.contains_key(key) {
            return Ok(None);
        }
        let (handle, extra) = make()?;
        handle.set_key(key);
        entries.insert(key.to_string(), handle.clone());
        Ok(Some((handle, extra)))
    }

    /// Snapshot of the current keys.
    pub fn keys(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }

    pub fn size(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(key: &str) -> ProcessHandle {
        ProcessHandle::new(None, key).0
    }

    #[test]
    fn test_set_get_delete() {
        let reg = ProcessRegistry::new();
        reg.set("a", handle("a"));
        assert!(reg.get("a").is_some());
        assert_eq!(reg.size(), 1);
        assert!(reg.delete("a").is_some());
        assert!(reg.get("a").is_none());
        assert!(reg.delete("a").is_none());
    }

    #[test]
    fn test_rekey_moves_single_entry() {
        let reg = ProcessRegistry::new();
        let h = handle("pending-1");
        reg.set("pending-1", h.clone());

        assert!(reg.rekey("pending-1", "S1"));
        assert_eq!(reg.keys(), vec!["S1".to_string()]);
        assert_eq!(reg.size(), 1);
        assert_eq!(h.key(), "S1");
        assert!(reg.get("S1").unwrap().same_process(&h));
    }

    #[test]
    fn test_rekey_missing_or_taken() {
        let reg = ProcessRegistry::new();
        assert!(!reg.rekey("nope", "S1"));

        reg.set("a", handle("a"));
        reg.set("b", handle("b"));
        assert!(!reg.rekey("a", "b"));
        assert_eq!(reg.size(), 2);
        assert!(reg.rekey("a", "a"));
    }

    #[test]
    fn test_remove_handle_ignores_replacement() {
        let reg = ProcessRegistry::new();
        let old = handle("s");
        reg.set("s", old.clone());
        reg.delete("s");

        let new = handle("s");
        reg.set("s", new.clone());
        assert!(!reg.remove_handle(&old));
        assert!(reg.contains("s"));
        assert!(reg.remove_handle(&new));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_insert_with_refuses_taken_key() {
        let reg = ProcessRegistry::new();
        let first: Result<_, ()> = reg.insert_with("s", || Ok((handle("x"), 1)));
        assert!(first.unwrap().is_some());
        assert_eq!(reg.get("s").unwrap().key(), "s");

        let mut called = false;
        let second: Result<_, ()> = reg.insert_with("s", || {
            called = true;
            Ok((handle("y"), 2))
        });
        assert!(second.unwrap().is_none());
        assert!(!called);
        assert_eq!(reg.size(), 1);
    }
}
