//! An array of 256 [`SortedSet`]s partitioned by the last byte of the
//! hash, so that a cryptographic hash's natural uniformity spreads load
//! evenly. The in-memory analogue of [`crate::subset::Subset`].

use crate::hash::Hash;
use crate::sorted_set::{Ordered, SortedSet};

const PARTITION_COUNT: usize = 256;

/// A value that can be looked up by an embedded [`Hash`].
pub trait HashKeyed {
    fn hash(&self) -> &Hash;
}

/// Wraps a `T: HashKeyed` so it satisfies `Ordered` by comparing hashes.
struct ByHash<T>(T);

impl<T: HashKeyed> Ordered for ByHash<T> {
    fn compare(&self, other: &Self) -> std::cmp::Ordering {
        self.0.hash().cmp(other.0.hash())
    }
}

pub struct HashSet<T> {
    partitions: Vec<SortedSet<ByHash<T>>>,
    size: usize,
}

impl<T: HashKeyed> Default for HashSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: HashKeyed> HashSet<T> {
    pub fn new() -> Self {
        HashSet {
            partitions: (0..PARTITION_COUNT).map(|_| SortedSet::new()).collect(),
            size: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn reserve(&mut self, size: usize) {
        let per = size / PARTITION_COUNT;
        for p in &mut self.partitions {
            p.reserve(per);
        }
    }

    fn partition_for(&self, hash: &Hash) -> usize {
        if hash.is_empty() {
            0
        } else {
            hash.as_bytes()[hash.size() - 1] as usize
        }
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.find(hash).is_some()
    }

    /// Returns `true` if the item was inserted.
    pub fn insert(&mut self, object: T, allow_duplicates: bool) -> bool {
        let part = self.partition_for(object.hash());
        let inserted = self.partitions[part].insert(ByHash(object), allow_duplicates);
        if inserted {
            self.size += 1;
        }
        inserted
    }

    /// Returns `true` if the item was removed.
    pub fn remove(&mut self, hash: &Hash) -> bool {
        self.get_and_remove(hash).is_some()
    }

    /// Locates the first entry under `hash`, if any, without removing it.
    pub fn find(&self, hash: &Hash) -> Option<&T> {
        let part = self.partition_for(hash);
        self.partitions[part]
            .find_with(|candidate| hash.cmp(candidate.0.hash()))
            .map(move |i| &self.partitions[part].iter().nth(i).unwrap().0)
    }

    pub fn get(&self, hash: &Hash) -> Option<&T> {
        self.find(hash)
    }

    pub fn get_and_remove(&mut self, hash: &Hash) -> Option<T> {
        let part = self.partition_for(hash);
        let index = self.partitions[part].find_with(|candidate| hash.cmp(candidate.0.hash()))?;
        let removed = self.partitions[part].erase(index);
        self.size -= 1;
        Some(removed.0)
    }

    pub fn clear(&mut self) {
        for p in &mut self.partitions {
            p.clear();
        }
        self.size = 0;
    }

    /// Walks partitions in order, skipping empty ones.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.partitions.iter().flat_map(|p| p.iter()).map(|w| &w.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Item {
        h: Hash,
        v: i32,
    }

    impl HashKeyed for Item {
        fn hash(&self) -> &Hash {
            &self.h
        }
    }

    fn h(bytes: &[u8]) -> Hash {
        Hash::from_bytes(bytes.to_vec()).unwrap()
    }

    #[test]
    fn insert_and_find_round_trips() {
        let mut set: HashSet<Item> = HashSet::new();
        set.insert(
            Item {
                h: h(&[1, 2, 3]),
                v: 42,
            },
            false,
        );
        set.insert(
            Item {
                h: h(&[9, 9, 9]),
                v: 7,
            },
            false,
        );
        assert_eq!(set.size(), 2);
        assert_eq!(set.get(&h(&[1, 2, 3])).map(|i| i.v), Some(42));
        assert_eq!(set.get(&h(&[9, 9, 9])).map(|i| i.v), Some(7));
        assert!(set.get(&h(&[0, 0, 0])).is_none());
    }

    #[test]
    fn remove_drops_item() {
        let mut set: HashSet<Item> = HashSet::new();
        set.insert(Item { h: h(&[5]), v: 1 }, false);
        assert!(set.remove(&h(&[5])));
        assert_eq!(set.size(), 0);
        assert!(!set.remove(&h(&[5])));
    }

    #[test]
    fn duplicate_hash_keeps_both_when_allowed() {
        let mut set: HashSet<Item> = HashSet::new();
        assert!(set.insert(Item { h: h(&[3]), v: 1 }, true));
        assert!(set.insert(Item { h: h(&[3]), v: 2 }, true));
        assert_eq!(set.size(), 2);
        assert!(!set.insert(Item { h: h(&[3]), v: 3 }, false));
    }
}
