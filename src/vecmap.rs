//! A map type implemented as a list of key/value pairs.
//!
//! Node parameters, map values and symbol tables hold only a handful of entries,
//! so a flat vector beats the tree and hash based maps both in lookup time and in memory.
//! The insertion-ordered flavor is used wherever source order is observable (e.g., node parameters).

use std::borrow::Borrow;
use std::marker::PhantomData;
use std::fmt;

use serde::{Serialize, Serializer, Deserialize, Deserializer};
use serde::de::{MapAccess, Visitor};

#[derive(Debug, Clone, PartialEq)]
struct Entry<K, V> {
    key: K,
    value: V,
}

/// A map type implemented as a list of key/value pairs.
///
/// With `SORTED` set, keys are kept in ascending order and found by binary search.
/// Otherwise keys stay in insertion order and are found by a linear scan.
///
/// Equality is order-sensitive for unsorted maps, which matches how parameter lists are compared structurally.
#[derive(Debug, Clone, PartialEq)]
pub struct VecMap<K, V, const SORTED: bool> {
    entries: Vec<Entry<K, V>>,
}
impl<K: Ord, V, const SORTED: bool> VecMap<K, V, SORTED> {
    pub fn new() -> Self {
        Self { entries: vec![] }
    }
    pub fn with_capacity(cap: usize) -> Self {
        Self { entries: Vec::with_capacity(cap) }
    }
    /// Finds the index of `key`, or the index it would be inserted at.
    fn find<Q: ?Sized + Ord>(&self, key: &Q) -> Result<usize, usize> where K: Borrow<Q> {
        if SORTED {
            self.entries.binary_search_by(|x| x.key.borrow().cmp(key))
        } else {
            self.entries.iter().position(|x| x.key.borrow() == key).ok_or(self.entries.len())
        }
    }
    pub fn get<Q: ?Sized + Ord>(&self, key: &Q) -> Option<&V> where K: Borrow<Q> {
        let i = self.find(key).ok()?;
        Some(&self.entries[i].value)
    }
    pub fn get_mut<Q: ?Sized + Ord>(&mut self, key: &Q) -> Option<&mut V> where K: Borrow<Q> {
        let i = self.find(key).ok()?;
        Some(&mut self.entries[i].value)
    }
    pub fn contains_key<Q: ?Sized + Ord>(&self, key: &Q) -> bool where K: Borrow<Q> {
        self.find(key).is_ok()
    }
    /// Inserts or replaces a value, returning the replaced one.
    /// A replaced entry keeps its position in an unsorted map.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        match self.find(&key) {
            Ok(i) => Some(std::mem::replace(&mut self.entries[i].value, value)),
            Err(i) => {
                self.entries.insert(i, Entry { key, value });
                None
            }
        }
    }
    pub fn remove<Q: ?Sized + Ord>(&mut self, key: &Q) -> Option<V> where K: Borrow<Q> {
        let i = self.find(key).ok()?;
        Some(self.entries.remove(i).value)
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    /// Iterates over the entries in map order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter(self.entries.iter())
    }
    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.entries.iter().map(|x| &x.key)
    }
}

impl<K: Ord, V, const SORTED: bool> Default for VecMap<K, V, SORTED> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'a, K, V>(std::slice::Iter<'a, Entry<K, V>>);
impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);
    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|x| (&x.key, &x.value))
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

impl<K, V, const SORTED: bool> IntoIterator for VecMap<K, V, SORTED> {
    type Item = (K, V);
    type IntoIter = IntoIter<K, V>;
    fn into_iter(self) -> Self::IntoIter {
        IntoIter(self.entries.into_iter())
    }
}

pub struct IntoIter<K, V>(std::vec::IntoIter<Entry<K, V>>);
impl<K, V> Iterator for IntoIter<K, V> {
    type Item = (K, V);
    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|x| (x.key, x.value))
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

impl<K: Ord, V, const SORTED: bool> FromIterator<(K, V)> for VecMap<K, V, SORTED> {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut res = Self::new();
        for (k, v) in iter {
            res.insert(k, v);
        }
        res
    }
}

// serialized as a plain map so that catalogue files and persisted values read naturally as json objects

impl<K: Ord + Serialize, V: Serialize, const SORTED: bool> Serialize for VecMap<K, V, SORTED> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}
impl<'de, K: Ord + Deserialize<'de>, V: Deserialize<'de>, const SORTED: bool> Deserialize<'de> for VecMap<K, V, SORTED> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MapVisitor<K, V, const SORTED: bool>(PhantomData<(K, V)>);
        impl<'de, K: Ord + Deserialize<'de>, V: Deserialize<'de>, const SORTED: bool> Visitor<'de> for MapVisitor<K, V, SORTED> {
            type Value = VecMap<K, V, SORTED>;
            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map")
            }
            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut res = VecMap::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((k, v)) = access.next_entry()? {
                    res.insert(k, v);
                }
                Ok(res)
            }
        }
        deserializer.deserialize_map(MapVisitor(PhantomData))
    }
}

#[test]
fn test_vecmap_sorted() {
    let mut v = VecMap::<usize, usize, true>::new();
    assert!(v.is_empty());
    assert_eq!(v.insert(45, 12), None);
    assert_eq!(v.insert(56, 6), None);
    assert_eq!(v.insert(2, 654), None);
    assert_eq!(v.iter().map(|x| (*x.0, *x.1)).collect::<Vec<_>>(), [(2, 654), (45, 12), (56, 6)]);

    assert_eq!(v.insert(56, 98), Some(6));
    assert_eq!(v.len(), 3);
    *v.get_mut(&45).unwrap() = 444;
    assert_eq!(v.get(&45).copied(), Some(444));
    assert_eq!(v.get(&46).copied(), None);
    assert!(v.contains_key(&2));

    assert_eq!(v.remove(&2), Some(654));
    assert_eq!(v.remove(&2), None);
    assert_eq!(v.iter().map(|x| (*x.0, *x.1)).collect::<Vec<_>>(), [(45, 444), (56, 98)]);
    assert_eq!(v.insert(50, 3), None);
    assert_eq!(v.keys().copied().collect::<Vec<_>>(), [45, 50, 56]);
}

#[test]
fn test_vecmap_unsorted() {
    let mut v = VecMap::<usize, usize, false>::new();
    assert_eq!(v.insert(45, 12), None);
    assert_eq!(v.insert(56, 6), None);
    assert_eq!(v.insert(2, 654), None);
    assert_eq!(v.iter().map(|x| (*x.0, *x.1)).collect::<Vec<_>>(), [(45, 12), (56, 6), (2, 654)]);

    assert_eq!(v.insert(56, 98), Some(6));
    assert_eq!(v.iter().map(|x| (*x.0, *x.1)).collect::<Vec<_>>(), [(45, 12), (56, 98), (2, 654)]);

    assert_eq!(v.remove(&45), Some(12));
    assert_eq!(v.insert(45, 1), None);
    assert_eq!(v.keys().copied().collect::<Vec<_>>(), [56, 2, 45]);
    assert_eq!(v.get_mut(&81), None);
    assert_eq!(v.into_iter().collect::<Vec<_>>(), [(56, 98), (2, 654), (45, 1)]);
}

#[test]
fn test_vecmap_serde() {
    let mut v = VecMap::<compact_str::CompactString, i32, false>::new();
    v.insert("zeta".into(), 1);
    v.insert("alpha".into(), 2);
    let js = serde_json::to_string(&v).unwrap();
    assert_eq!(js, r#"{"zeta":1,"alpha":2}"#);
    let back: VecMap<compact_str::CompactString, i32, false> = serde_json::from_str(&js).unwrap();
    assert_eq!(back, v);

    let sorted: VecMap<compact_str::CompactString, i32, true> = serde_json::from_str(&js).unwrap();
    assert_eq!(sorted.keys().map(|x| x.as_str()).collect::<Vec<_>>(), ["alpha", "zeta"]);
}
