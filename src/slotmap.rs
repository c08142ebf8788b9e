//! Generational handles for live runs.
//!
//! The engine stores every run in a [`SlotMap`] and hands out its key as the run handle.
//! Removing an entry bumps the generation of its slot, so a stale handle held by a due continuation
//! or an external stop request never resolves to a newer run that reused the slot.

use std::marker::PhantomData;

/// A key that can be used with a [`SlotMap`].
///
/// Use the [`new_key`](crate::new_key) macro rather than implementing this by hand.
pub trait Key: Copy + Eq + Ord + 'static {
    fn new(slot: usize, generation: u32) -> Self;
    fn slot(&self) -> usize;
    fn generation(&self) -> u32;
}

/// Defines a new key type for use in [`SlotMap`].
#[macro_export]
macro_rules! new_key {
    ($($(#[doc = $doc:expr])? $vis:vis struct $name:ident;)*) => {$(
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        $(#[doc = $doc])?
        $vis struct $name(usize, u32);
        impl $crate::slotmap::Key for $name {
            fn new(slot: usize, generation: u32) -> Self { Self(slot, generation) }
            fn slot(&self) -> usize { self.0 }
            fn generation(&self) -> u32 { self.1 }
        }
    )*}
}

enum Entry<T> {
    Occupied { value: T, generation: u32 },
    /// `next_free` links the vacant slots into a stack.
    Vacant { generation: u32, next_free: Option<usize> },
}

/// A dense array of values addressed by generational keys.
pub struct SlotMap<K: Key, T> {
    entries: Vec<Entry<T>>,
    free_head: Option<usize>,
    len: usize,
    _key: PhantomData<K>,
}
impl<K: Key, T> Default for SlotMap<K, T> {
    fn default() -> Self {
        Self { entries: vec![], free_head: None, len: 0, _key: PhantomData }
    }
}
impl<K: Key, T> SlotMap<K, T> {
    pub fn new() -> Self {
        Self::default()
    }
    /// Stores a value and returns a fresh key for it. Vacant slots are reused most-recent first.
    pub fn insert(&mut self, value: T) -> K {
        self.len += 1;
        if let Some(slot) = self.free_head {
            if let Entry::Vacant { generation, next_free } = self.entries[slot] {
                self.free_head = next_free;
                self.entries[slot] = Entry::Occupied { value, generation };
                return K::new(slot, generation);
            }
        }
        self.entries.push(Entry::Occupied { value, generation: 0 });
        K::new(self.entries.len() - 1, 0)
    }
    /// Removes and returns the value of a live key. Every later access through that key yields [`None`].
    pub fn remove(&mut self, key: K) -> Option<T> {
        match self.entries.get(key.slot()) {
            Some(Entry::Occupied { generation, .. }) if *generation == key.generation() => (),
            _ => return None,
        }
        let vacant = Entry::Vacant { generation: key.generation().wrapping_add(1), next_free: self.free_head };
        self.free_head = Some(key.slot());
        self.len -= 1;
        match std::mem::replace(&mut self.entries[key.slot()], vacant) {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Vacant { .. } => None,
        }
    }
    pub fn get(&self, key: K) -> Option<&T> {
        match self.entries.get(key.slot())? {
            Entry::Occupied { value, generation } if *generation == key.generation() => Some(value),
            _ => None,
        }
    }
    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        match self.entries.get_mut(key.slot())? {
            Entry::Occupied { value, generation } if *generation == key.generation() => Some(value),
            _ => None,
        }
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    /// Iterates over the live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> + '_ {
        self.entries.iter().enumerate().filter_map(|(slot, entry)| match entry {
            Entry::Occupied { value, generation } => Some((K::new(slot, *generation), value)),
            Entry::Vacant { .. } => None,
        })
    }
    /// Collects the keys of all values matching the predicate, so the caller can then mutate the map.
    pub fn keys_where<F: FnMut(&T) -> bool>(&self, mut f: F) -> Vec<K> {
        self.iter().filter(|(_, v)| f(v)).map(|(k, _)| k).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    new_key! {
        struct TestKey;
    }

    #[test]
    fn test_stale_keys() {
        let mut map: SlotMap<TestKey, &'static str> = SlotMap::new();
        let a = map.insert("a");
        let b = map.insert("b");
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(a).copied(), Some("a"));

        assert_eq!(map.remove(a), Some("a"));
        assert_eq!(map.remove(a), None);
        assert_eq!(map.get(a), None);

        let c = map.insert("c");
        assert_eq!(c.slot(), a.slot());
        assert_eq!(c.generation(), a.generation() + 1);
        assert_eq!(map.get(a), None);
        assert_eq!(map.get(c).copied(), Some("c"));
        if let Some(x) = map.get_mut(b) {
            *x = "bb";
        }
        assert_eq!(map.iter().map(|(k, v)| (k, *v)).collect::<Vec<_>>(), [(c, "c"), (b, "bb")]);
        assert_eq!(map.keys_where(|v| v.starts_with('b')), [b]);
    }

    #[test]
    fn test_churn() {
        let mut map: SlotMap<TestKey, usize> = SlotMap::new();
        let mut live = vec![];
        for round in 0..8 {
            for i in 0..32 {
                live.push((map.insert(round * 100 + i), round * 100 + i));
            }
            live.reverse();
            for (key, value) in live.drain(..16) {
                assert_eq!(map.remove(key), Some(value));
                assert_eq!(map.get(key), None);
            }
            for (key, value) in live.iter() {
                assert_eq!(map.get(*key), Some(value));
            }
            assert_eq!(map.len(), live.len());
        }
        assert!(map.entries.len() <= 32 + 16 * 7);
    }
}
