//! The record contract stored under each hash, and the cache-entry
//! bookkeeping (lifecycle flags, data offset) wrapped around it.

use std::cmp::Ordering;
use std::io::{self, Read, Write};

/// Sentinel meaning "never written to the data file".
pub const INVALID_OFFSET: u64 = u64::MAX;

/// The behavioural contract every value stored in a [`crate::store::Store`]
/// must satisfy.
///
/// Implementers must not let `write` change the serialized length of an
/// already-written record across calls -- the subset rewrites records in
/// place at their original data offset.
pub trait Record: Sized + Send + Sync {
    /// Serialize this record's payload (not including its hash) to `writer`.
    fn write(&self, writer: &mut dyn Write) -> io::Result<()>;

    /// Deserialize a record's payload from `reader`.
    fn read(reader: &mut dyn Read) -> io::Result<Self>;

    /// In-memory footprint in bytes, used for cache-budget accounting.
    fn size(&self) -> usize;

    /// Relative age versus `other`; used only to pick eviction order.
    fn compare_age(&self, other: &Self) -> Ordering;

    /// Value equality, used to reject duplicate inserts under one hash.
    fn values_match(&self, other: &Self) -> bool;
}

/// A tiny hand-rolled bitset: plain numeric flags on a header byte
/// rather than pulling in a flags crate for four bits.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(
                $(#[$field_meta:meta])*
                const $field:ident = $value:expr;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($repr);

        impl $name {
            $(
                $(#[$field_meta])*
                pub const $field: $name = $name($value);
            )*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub fn contains(self, other: $name) -> bool {
                (self.0 & other.0) == other.0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }
        }
    };
}

bitflags_like! {
    /// Lifecycle flags tracked per cache entry.
    pub struct Flags: u8 {
        /// Not yet referenced by the on-disk index.
        const NEW = 0x01;
        /// Differs from the durable copy; needs (re)writing on save.
        const MODIFIED = 0x02;
        /// Tombstoned; apply removal on next save.
        const REMOVE = 0x04;
        /// Safe to drop from the cache; the data file remains the source
        /// of truth.
        const OLD = 0x08;
    }
}

/// A cache entry: an owned record plus the bookkeeping the subset needs
/// to reconcile it against the on-disk index during save.
///
/// This lives outside the `Record` trait (rather than, say, requiring
/// `Record` itself to carry flags) because the cache, not the payload
/// type, owns this bookkeeping.
#[derive(Debug)]
pub struct CacheSlot<R> {
    pub record: R,
    flags: Flags,
    data_offset: u64,
}

impl<R: Record> CacheSlot<R> {
    /// Wrap a freshly inserted record: not yet written, flagged `NEW`.
    pub fn new_inserted(record: R) -> Self {
        CacheSlot {
            record,
            flags: Flags::NEW,
            data_offset: INVALID_OFFSET,
        }
    }

    /// Wrap a record loaded from the data file: clean, no flags set.
    pub fn from_data_file(record: R, data_offset: u64) -> Self {
        CacheSlot {
            record,
            flags: Flags::empty(),
            data_offset,
        }
    }

    /// Wrap a record loaded from the cache snapshot file, which persists
    /// the data offset it had when the snapshot was written.
    pub fn from_cache_file(record: R, data_offset: u64) -> Self {
        CacheSlot {
            record,
            flags: Flags::empty(),
            data_offset,
        }
    }

    pub fn marked_remove(&self) -> bool {
        self.flags.contains(Flags::REMOVE)
    }

    pub fn is_modified(&self) -> bool {
        self.flags.contains(Flags::MODIFIED)
    }

    pub fn is_new(&self) -> bool {
        self.flags.contains(Flags::NEW)
    }

    pub fn is_old(&self) -> bool {
        self.flags.contains(Flags::OLD)
    }

    pub fn set_remove(&mut self) {
        self.flags.insert(Flags::REMOVE);
    }

    pub fn set_modified(&mut self) {
        self.flags.insert(Flags::MODIFIED);
    }

    pub fn set_new(&mut self) {
        self.flags.insert(Flags::NEW);
    }

    pub fn set_old(&mut self) {
        self.flags.insert(Flags::OLD);
    }

    pub fn clear_new(&mut self) {
        self.flags.remove(Flags::NEW);
    }

    pub fn clear_modified(&mut self) {
        self.flags.remove(Flags::MODIFIED);
    }

    pub fn was_written(&self) -> bool {
        self.data_offset != INVALID_OFFSET
    }

    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    pub fn set_data_offset(&mut self, offset: u64) {
        self.data_offset = offset;
    }

    pub fn clear_data_offset(&mut self) {
        self.data_offset = INVALID_OFFSET;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Dummy(u32);

    impl Record for Dummy {
        fn write(&self, w: &mut dyn Write) -> io::Result<()> {
            w.write_all(&self.0.to_le_bytes())
        }
        fn read(r: &mut dyn Read) -> io::Result<Self> {
            let mut buf = [0u8; 4];
            r.read_exact(&mut buf)?;
            Ok(Dummy(u32::from_le_bytes(buf)))
        }
        fn size(&self) -> usize {
            4
        }
        fn compare_age(&self, other: &Self) -> Ordering {
            self.0.cmp(&other.0)
        }
        fn values_match(&self, other: &Self) -> bool {
            self.0 == other.0
        }
    }

    #[test]
    fn new_slot_is_new_and_unwritten() {
        let slot = CacheSlot::new_inserted(Dummy(1));
        assert!(slot.is_new());
        assert!(!slot.was_written());
        assert!(!slot.marked_remove());
    }

    #[test]
    fn flags_are_independent() {
        let mut slot = CacheSlot::new_inserted(Dummy(1));
        slot.set_old();
        slot.set_remove();
        assert!(slot.is_new());
        assert!(slot.is_old());
        assert!(slot.marked_remove());
        slot.clear_new();
        assert!(!slot.is_new());
        assert!(slot.is_old());
    }
}
