//! An ordered (by hash) vector of `(Hash, T)` cells allowing duplicate
//! hashes, with binary search for lookup and FIFO-preserving insert.

use crate::hash::Hash;

/// A position within a [`ContainerList`]. `ContainerList::end()` is the
/// list's length.
pub type Index = usize;

pub struct ContainerList<T> {
    entries: Vec<(Hash, T)>,
}

impl<T> Default for ContainerList<T> {
    fn default() -> Self {
        ContainerList { entries: Vec::new() }
    }
}

impl<T> ContainerList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn begin(&self) -> Index {
        0
    }

    pub fn end(&self) -> Index {
        self.entries.len()
    }

    pub fn hash_at(&self, index: Index) -> &Hash {
        &self.entries[index].0
    }

    pub fn get_at(&self, index: Index) -> &T {
        &self.entries[index].1
    }

    pub fn get_at_mut(&mut self, index: Index) -> &mut T {
        &mut self.entries[index].1
    }

    pub fn front(&self) -> Option<&T> {
        self.entries.first().map(|(_, v)| v)
    }

    pub fn back(&self) -> Option<&T> {
        self.entries.last().map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Hash, &T)> {
        self.entries.iter().map(|(h, v)| (h, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Hash, &mut T)> {
        self.entries.iter_mut().map(|(h, v)| (&*h, v))
    }

    /// Returns the index to insert a new entry before, so that a fresh
    /// insert under an equal key lands after every existing equal-hash
    /// run (FIFO-on-equal-key), and whether a match already exists.
    ///
    /// Checks front/back before falling into full binary search.
    pub fn find_insert_before(&self, hash: &Hash) -> (Index, bool) {
        if self.entries.is_empty() {
            return (0, false);
        }

        let first_cmp = self.entries[0].0.cmp(hash);
        if first_cmp == std::cmp::Ordering::Greater {
            return (0, false);
        }
        if first_cmp == std::cmp::Ordering::Equal {
            let mut i = 0;
            while i < self.entries.len() && &self.entries[i].0 == hash {
                i += 1;
            }
            return (i, true);
        }
        if self.entries.len() == 1 {
            return (self.entries.len(), false);
        }

        let last_cmp = self.entries[self.entries.len() - 1].0.cmp(hash);
        if last_cmp == std::cmp::Ordering::Less {
            return (self.entries.len(), false);
        }
        if last_cmp == std::cmp::Ordering::Equal {
            return (self.entries.len(), true);
        }

        // Binary-partition between (0, len-1) -- both ends already ruled out.
        let mut bottom = 0usize;
        let mut top = self.entries.len() - 1;
        while top - bottom > 1 {
            let mid = bottom + (top - bottom) / 2;
            match self.entries[mid].0.cmp(hash) {
                std::cmp::Ordering::Less => bottom = mid,
                std::cmp::Ordering::Greater => top = mid,
                std::cmp::Ordering::Equal => {
                    let mut i = mid + 1;
                    while i < self.entries.len() && &self.entries[i].0 == hash {
                        i += 1;
                    }
                    return (i, true);
                }
            }
        }
        (top, false)
    }

    /// Inserts unconditionally, never rejecting.
    pub fn insert(&mut self, hash: Hash, value: T) -> Index {
        let (before, _) = self.find_insert_before(&hash);
        self.entries.insert(before, (hash, value));
        before
    }

    /// Returns the index of the first entry with `hash`, if any.
    pub fn get(&self, hash: &Hash) -> Option<Index> {
        if self.entries.is_empty() {
            return None;
        }
        if &self.entries[0].0 == hash {
            return Some(0);
        }
        let last = self.entries.len() - 1;
        if &self.entries[last].0 == hash {
            return Some(self.backup_to_first_match(last));
        }

        let mut bottom = 0usize;
        let mut top = last;
        while bottom <= top {
            let mid = bottom + (top - bottom) / 2;
            match self.entries[mid].0.cmp(hash) {
                std::cmp::Ordering::Equal => return Some(self.backup_to_first_match(mid)),
                std::cmp::Ordering::Less => bottom = mid + 1,
                std::cmp::Ordering::Greater => {
                    if mid == 0 {
                        break;
                    }
                    top = mid - 1;
                }
            }
        }
        None
    }

    fn backup_to_first_match(&self, mut index: Index) -> Index {
        let hash = &self.entries[index].0;
        while index > 0 && &self.entries[index - 1].0 == hash {
            index -= 1;
        }
        index
    }

    pub fn remove(&mut self, hash: &Hash) -> bool {
        match self.get(hash) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn erase(&mut self, index: Index) -> Index {
        self.entries.remove(index);
        index
    }
}

impl<T> ContainerList<T> {
    /// Insert `value` under `hash` unless an existing value within the
    /// equal-hash run already satisfies `values_match`. Returns `true`
    /// if the insert happened.
    pub fn insert_if_not_matching(
        &mut self,
        hash: Hash,
        value: T,
        values_match: impl Fn(&T, &T) -> bool,
    ) -> bool {
        let (before, match_found) = self.find_insert_before(&hash);
        if match_found {
            // Walk backward through the contiguous equal-hash run.
            let mut i = before;
            while i > 0 && self.entries[i - 1].0 == hash {
                i -= 1;
                if values_match(&self.entries[i].1, &value) {
                    return false;
                }
            }
        }
        self.entries.insert(before, (hash, value));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(b: u8) -> Hash {
        Hash::from_bytes(vec![b]).unwrap()
    }

    #[test]
    fn insert_keeps_sorted_order() {
        let mut list: ContainerList<i32> = ContainerList::new();
        list.insert(h(5), 5);
        list.insert(h(1), 1);
        list.insert(h(3), 3);
        let hashes: Vec<u8> = list.iter().map(|(hh, _)| hh.as_bytes()[0]).collect();
        assert_eq!(hashes, vec![1, 3, 5]);
    }

    #[test]
    fn duplicate_hashes_preserve_fifo_order() {
        let mut list: ContainerList<i32> = ContainerList::new();
        list.insert(h(2), 1);
        list.insert(h(2), 2);
        let idx = list.get(&h(2)).unwrap();
        assert_eq!(*list.get_at(idx), 1);
        let idx2 = idx + 1;
        assert_eq!(*list.get_at(idx2), 2);
    }

    #[test]
    fn insert_if_not_matching_rejects_equal_values() {
        let mut list: ContainerList<i32> = ContainerList::new();
        assert!(list.insert_if_not_matching(h(9), 42, |a, b| a == b));
        assert!(!list.insert_if_not_matching(h(9), 42, |a, b| a == b));
        assert!(list.insert_if_not_matching(h(9), 43, |a, b| a == b));
        assert_eq!(list.size(), 2);
    }

    #[test]
    fn get_on_single_entry_list_works() {
        let mut list: ContainerList<i32> = ContainerList::new();
        list.insert(h(7), 77);
        assert_eq!(list.get(&h(7)), Some(0));
        assert_eq!(list.get(&h(8)), None);
    }
}
