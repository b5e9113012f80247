//! Ordered collection of registered device contexts.
//!
//! Entries are unique by key and keep registration order. Removal takes the
//! entry out of the collection before the caller gets to drop it, so a
//! session is never reachable once it has been unregistered.

use std::fmt;

/// Anything stored in a [`DeviceRegistry`] exposes the key it is unique by
pub trait RegistryEntry {
    type Key: PartialEq + Clone + fmt::Debug;

    fn key(&self) -> &Self::Key;
}

pub struct DeviceRegistry<T: RegistryEntry> {
    entries: Vec<T>,
}

impl<T: RegistryEntry> Default for DeviceRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T: RegistryEntry> DeviceRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `entry`; hands it back when its key is already present
    pub fn add(&mut self, entry: T) -> Result<(), T> {
        if self.contains(entry.key()) {
            return Err(entry);
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn contains(&self, key: &T::Key) -> bool {
        self.entries.iter().any(|e| e.key() == key)
    }

    pub fn find(&self, key: &T::Key) -> Option<&T> {
        self.entries.iter().find(|e| e.key() == key)
    }

    pub fn find_mut(&mut self, key: &T::Key) -> Option<&mut T> {
        self.entries.iter_mut().find(|e| e.key() == key)
    }

    pub fn find_by<P>(&self, predicate: P) -> Option<&T>
    where
        P: Fn(&T) -> bool,
    {
        self.entries.iter().find(|e| predicate(e))
    }

    pub fn find_mut_by<P>(&mut self, predicate: P) -> Option<&mut T>
    where
        P: Fn(&T) -> bool,
    {
        self.entries.iter_mut().find(|e| predicate(e))
    }

    pub fn remove(&mut self, key: &T::Key) -> Option<T> {
        self.remove_by(|e| e.key() == key)
    }

    pub fn remove_by<P>(&mut self, predicate: P) -> Option<T>
    where
        P: Fn(&T) -> bool,
    {
        let index = self.entries.iter().position(|e| predicate(e))?;
        Some(self.entries.remove(index))
    }

    /// Remove every entry, oldest first
    pub fn drain(&mut self) -> Vec<T> {
        std::mem::take(&mut self.entries)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.iter_mut()
    }

    /// Snapshot of the keys, safe to iterate while entries are removed
    pub fn keys(&self) -> Vec<T::Key> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn first(&self) -> Option<&T> {
        self.entries.first()
    }

    pub fn first_mut(&mut self) -> Option<&mut T> {
        self.entries.first_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: RegistryEntry> fmt::Debug for DeviceRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| e.key()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Entry {
        id: u32,
        label: &'static str,
    }

    impl RegistryEntry for Entry {
        type Key = u32;

        fn key(&self) -> &u32 {
            &self.id
        }
    }

    fn entry(id: u32, label: &'static str) -> Entry {
        Entry { id, label }
    }

    #[test]
    fn test_add_rejects_duplicate_key() {
        let mut registry = DeviceRegistry::new();
        registry.add(entry(1, "a")).unwrap();

        let rejected = registry.add(entry(1, "b")).unwrap_err();

        assert_eq!(rejected.label, "b");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find(&1).map(|e| e.label), Some("a"));
    }

    #[test]
    fn test_iteration_keeps_registration_order() {
        let mut registry = DeviceRegistry::new();
        for id in [3, 1, 2] {
            registry.add(entry(id, "x")).unwrap();
        }
        assert_eq!(registry.keys(), vec![3, 1, 2]);
    }

    #[test]
    fn test_remove_while_iterating_snapshot() {
        let mut registry = DeviceRegistry::new();
        for id in 0..5 {
            registry.add(entry(id, "x")).unwrap();
        }

        for key in registry.keys() {
            if key % 2 == 0 {
                registry.remove(&key);
            }
        }

        assert_eq!(registry.keys(), vec![1, 3]);
        assert!(registry.remove(&0).is_none());
    }

    #[test]
    fn test_find_by_predicate() {
        let mut registry = DeviceRegistry::new();
        registry.add(entry(1, "a")).unwrap();
        registry.add(entry(2, "b")).unwrap();
        assert_eq!(registry.find_by(|e| e.label == "b").map(|e| e.id), Some(2));
    }
}
