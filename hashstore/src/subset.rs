//! One on-disk partition of a [`crate::store::Store`]: the heart of the
//! engine. Owns a `.data` file (each record stored as its hash
//! immediately followed by its body, append-only), an `.index` file (a
//! sorted, duplicate-hash-aware array of data-file offsets used for
//! binary search, with the hash at each position read back out of the
//! data file rather than duplicated into the index), and a `.cache`
//! file (a snapshot of whatever is still resident in memory, so reload
//! doesn't have to replay the data file).

use std::collections::HashSet as StdHashSet;
use std::sync::Arc;

use tracing::{debug, instrument, trace, warn};

use crate::container_list::ContainerList;
use crate::distributed_vec::{Cursor, DistributedVec};
use crate::error::StoreError;
use crate::fs::{subset_file_name, FileSystem, Handle};
use crate::hash::Hash;
use crate::record::{CacheSlot, Record};
use crate::sync::NamedMutex;

/// Default spacing, in index entries, between sparse samples kept in
/// memory so a lookup only has to read a bounded slice of the index
/// file rather than the whole thing. Overridable per [`Subset`] via
/// [`Subset::load_with_sample_interval`].
const SAMPLE_INTERVAL: usize = 256;

/// Bucket count for the [`DistributedVec`] used while rebuilding the
/// index during `save`.
const INDEX_REBUILD_BUCKETS: usize = 64;

/// How far over `max_cache_data_size` a save is willing to leave the
/// cache after its first (cheap, age-sorted) eviction pass before
/// falling back to coarser "mark every other entry" passes.
const TRIM_OVERSHOOT: f64 = 1.25;

/// Width of one `.index` entry: a single little-endian data-file offset.
/// The hash at that offset lives in `.data`, not duplicated here.
const INDEX_ENTRY_SIZE: u64 = 8;

#[derive(Clone)]
struct IndexEntry {
    hash: Hash,
    offset: u64,
}

/// A lazily-materialized entry in the in-memory sparse index. `hash` is
/// only read from the index file the first time a search needs it, per
/// the "lazy sample materialization" design note.
struct SampleEntry {
    index_position: usize,
    hash: Option<Hash>,
}

struct Inner<R> {
    data: Handle,
    index: Handle,
    cache_file: Handle,
    cache: ContainerList<CacheSlot<R>>,
    /// Hashes already known to be fully represented in `cache`, so a
    /// repeated `pull` for the same key doesn't re-scan the index.
    pulled: StdHashSet<Hash>,
    samples: Vec<SampleEntry>,
    index_len: usize,
}

pub struct Subset<R> {
    id: u16,
    hash_size: u8,
    sample_interval: usize,
    fs: Arc<dyn FileSystem>,
    inner: NamedMutex<Inner<R>>,
}

impl<R: Record> Subset<R> {
    pub fn load(id: u16, fs: Arc<dyn FileSystem>, hash_size: u8) -> Result<Self, StoreError> {
        Self::load_with_sample_interval(id, fs, hash_size, SAMPLE_INTERVAL)
    }

    /// Like [`Self::load`], but with an explicit spacing between sparse
    /// index samples instead of the [`SAMPLE_INTERVAL`] default --
    /// plumbed through from [`crate::config::Config::sample_interval`].
    #[instrument(skip(fs), fields(subset = id))]
    pub fn load_with_sample_interval(
        id: u16,
        fs: Arc<dyn FileSystem>,
        hash_size: u8,
        sample_interval: usize,
    ) -> Result<Self, StoreError> {
        let data = fs.open(&subset_file_name(id, "data"))?;
        let index = fs.open(&subset_file_name(id, "index"))?;
        let cache_file = fs.open(&subset_file_name(id, "cache"))?;

        let index_len = (fs.file_size(index)? / INDEX_ENTRY_SIZE) as usize;

        let subset = Subset {
            id,
            hash_size,
            sample_interval: sample_interval.max(1),
            fs,
            inner: NamedMutex::new(
                "subset",
                Inner {
                    data,
                    index,
                    cache_file,
                    cache: ContainerList::new(),
                    pulled: StdHashSet::new(),
                    samples: Vec::new(),
                    index_len,
                },
            ),
        };

        {
            let mut inner = subset.inner.lock();
            subset.load_samples(&mut inner)?;
            subset.load_cache_snapshot(&mut inner)?;
        }

        debug!(subset = id, entries = index_len, "subset loaded");
        Ok(subset)
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn on_disk_len(&self) -> usize {
        self.inner.lock().index_len
    }

    pub fn cache_len(&self) -> usize {
        self.inner.lock().cache.size()
    }

    /// Fixed per-entry bookkeeping overhead counted on top of
    /// [`Record::size`] when accounting for cache budget: the hash
    /// itself plus a pointer-sized slot for the owned record, the same
    /// way every cache entry carries a `Hash` and a boxed value.
    fn static_cache_item_overhead(&self) -> usize {
        self.hash_size as usize + std::mem::size_of::<usize>()
    }

    /// In-memory footprint of the cache: each record's own `size()` plus
    /// [`Self::static_cache_item_overhead`] per entry, so a cache of
    /// many small records isn't accounted as free just because their
    /// payloads are tiny.
    pub fn cache_data_size(&self) -> usize {
        let inner = self.inner.lock();
        let raw: usize = inner.cache.iter().map(|(_, slot)| slot.record.size()).sum();
        raw + inner.cache.size() * self.static_cache_item_overhead()
    }

    pub fn contains(&self, hash: &Hash) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        self.ensure_pulled(&mut inner, hash)?;
        Ok(inner.cache.get(hash).is_some())
    }

    /// Locates the first live record under `hash` and hands it to `f`,
    /// keeping the borrow inside the subset's lock.
    pub fn get_with<T>(&self, hash: &Hash, f: impl FnOnce(Option<&R>) -> T) -> Result<T, StoreError> {
        let mut inner = self.inner.lock();
        self.ensure_pulled(&mut inner, hash)?;
        let value = inner.cache.get(hash).map(|idx| &inner.cache.get_at(idx).record);
        Ok(f(value))
    }

    /// Locates the first live record under `hash` and hands mutable
    /// access to its cache slot to `f`. A caller that edits
    /// [`CacheSlot::record`] through the returned slot is responsible for
    /// calling [`CacheSlot::set_modified`] itself, the same way callers
    /// of [`Self::remove_if_matching`] don't need to -- but a caller
    /// mutating through this lower-level accessor does.
    pub fn get_mut_with<T>(&self, hash: &Hash, f: impl FnOnce(Option<&mut CacheSlot<R>>) -> T) -> Result<T, StoreError> {
        let mut inner = self.inner.lock();
        self.ensure_pulled(&mut inner, hash)?;
        let value = inner.cache.get(hash).map(|idx| inner.cache.get_at_mut(idx));
        Ok(f(value))
    }

    /// Inserts `record` under `hash`. If `reject_if_matching` is set,
    /// an existing entry under `hash` with an equal value (per
    /// [`Record::values_match`]) blocks the insert and this returns
    /// `false`; duplicates with distinct values are always allowed.
    pub fn insert(&self, hash: Hash, record: R, reject_if_matching: bool) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        self.ensure_pulled(&mut inner, &hash)?;
        if reject_if_matching {
            Ok(inner
                .cache
                .insert_if_not_matching(hash, CacheSlot::new_inserted(record), |a, b| {
                    a.record.values_match(&b.record)
                }))
        } else {
            inner.cache.insert(hash, CacheSlot::new_inserted(record));
            Ok(true)
        }
    }

    /// Removes the first entry under `hash` whose value matches
    /// `record`. Entries never written to disk are dropped outright;
    /// durable ones are tombstoned for the next `save`.
    pub fn remove_if_matching(&self, hash: &Hash, record: &R) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        self.ensure_pulled(&mut inner, hash)?;
        let Some(mut idx) = inner.cache.get(hash) else {
            return Ok(false);
        };
        loop {
            if inner.cache.hash_at(idx) != hash {
                return Ok(false);
            }
            if inner.cache.get_at(idx).record.values_match(record) {
                if inner.cache.get_at(idx).was_written() {
                    inner.cache.get_at_mut(idx).set_remove();
                } else {
                    inner.cache.erase(idx);
                }
                return Ok(true);
            }
            idx += 1;
            if idx >= inner.cache.end() {
                return Ok(false);
            }
        }
    }

    /// Always fails: defragmentation (compacting the data file to drop
    /// space held by tombstoned records) isn't implemented.
    pub fn defragment(&self) -> Result<bool, StoreError> {
        Err(StoreError::Unimplemented("subset defragmentation"))
    }

    /// Makes sure every on-disk entry under `hash` has a corresponding
    /// in-memory [`CacheSlot`], so lookups and duplicate-aware inserts
    /// can work purely off the cache afterwards.
    fn ensure_pulled(&self, inner: &mut Inner<R>, hash: &Hash) -> Result<(), StoreError> {
        if hash.is_empty() || inner.pulled.contains(hash) {
            return Ok(());
        }
        let matches = self.scan_index_for_hash(inner, hash)?;
        for entry in matches {
            let mut already = false;
            if let Some(mut i) = inner.cache.get(&entry.hash) {
                loop {
                    if inner.cache.hash_at(i) != &entry.hash {
                        break;
                    }
                    if inner.cache.get_at(i).data_offset() == entry.offset {
                        already = true;
                        break;
                    }
                    i += 1;
                    if i >= inner.cache.end() {
                        break;
                    }
                }
            }
            if already {
                continue;
            }
            let record = self.read_record_at(inner, entry.offset)?;
            inner.cache.insert(entry.hash, CacheSlot::from_data_file(record, entry.offset));
        }
        inner.pulled.insert(hash.clone());
        Ok(())
    }

    fn scan_index_for_hash(&self, inner: &mut Inner<R>, hash: &Hash) -> Result<Vec<IndexEntry>, StoreError> {
        if inner.index_len == 0 {
            return Ok(Vec::new());
        }
        let (start, end) = self.sample_bracket(inner, hash)?;
        let mut out = Vec::new();
        for pos in start..end {
            let entry = self.read_index_entry(inner, pos)?;
            if &entry.hash == hash {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Binary searches the sparse samples for the `[start, end)` run of
    /// index positions that might hold `hash`.
    fn sample_bracket(&self, inner: &mut Inner<R>, hash: &Hash) -> Result<(usize, usize), StoreError> {
        if inner.samples.is_empty() {
            return Ok((0, inner.index_len));
        }
        let mut lo = 0usize;
        let mut hi = inner.samples.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let sample = self.sample_hash(inner, mid)?;
            if &sample <= hash {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let start = if lo == 0 { 0 } else { inner.samples[lo - 1].index_position };
        let end = if lo < inner.samples.len() {
            inner.samples[lo].index_position
        } else {
            inner.index_len
        };
        Ok((start, end))
    }

    fn sample_hash(&self, inner: &mut Inner<R>, sample_idx: usize) -> Result<Hash, StoreError> {
        if let Some(hash) = &inner.samples[sample_idx].hash {
            return Ok(hash.clone());
        }
        let pos = inner.samples[sample_idx].index_position;
        let entry = self.read_index_entry(inner, pos)?;
        inner.samples[sample_idx].hash = Some(entry.hash.clone());
        Ok(entry.hash)
    }

    fn load_samples(&self, inner: &mut Inner<R>) -> Result<(), StoreError> {
        let mut samples = Vec::new();
        let mut pos = 0;
        while pos < inner.index_len {
            samples.push(SampleEntry {
                index_position: pos,
                hash: None,
            });
            pos += self.sample_interval;
        }
        trace!(subset = self.id, samples = samples.len(), "loaded index samples");
        inner.samples = samples;
        Ok(())
    }

    /// Reads the offset stored at index position `pos`, then derives the
    /// hash living at that position in the data file -- the index never
    /// stores the hash itself.
    fn read_index_entry(&self, inner: &Inner<R>, pos: usize) -> Result<IndexEntry, StoreError> {
        let mut buf = [0u8; 8];
        self.fs.read_exact_at(inner.index, &mut buf, pos as u64 * INDEX_ENTRY_SIZE)?;
        let offset = u64::from_le_bytes(buf);
        let hash = self.read_hash_at(inner, offset)?;
        Ok(IndexEntry { hash, offset })
    }

    /// Reads the `hash_size`-byte hash stored at the start of the
    /// record at `offset` in the data file.
    fn read_hash_at(&self, inner: &Inner<R>, offset: u64) -> Result<Hash, StoreError> {
        let mut buf = vec![0u8; self.hash_size as usize];
        self.fs.read_exact_at(inner.data, &mut buf, offset)?;
        Ok(Hash::from_bytes(buf)?)
    }

    /// Reads the record body stored after the hash at `offset`. Bodies
    /// carry no length prefix -- `R::read` is trusted to consume
    /// exactly its own bytes from the tail of the file starting past
    /// the hash, leaving any following record's bytes untouched.
    fn read_record_at(&self, inner: &Inner<R>, offset: u64) -> Result<R, StoreError> {
        let body_offset = offset + self.hash_size as u64;
        let file_size = self.fs.file_size(inner.data)?;
        let mut buf = vec![0u8; (file_size - body_offset) as usize];
        self.fs.read_exact_at(inner.data, &mut buf, body_offset)?;
        R::read(&mut &buf[..]).map_err(StoreError::Deserialize)
    }

    /// Appends `hash` followed by `record`'s body to the end of the
    /// data file, returning the offset where the hash begins.
    fn append_record(&self, inner: &Inner<R>, hash: &Hash, record: &R) -> Result<u64, StoreError> {
        let offset = self.fs.file_size(inner.data)?;
        let mut buf = Vec::from(hash.as_bytes());
        record.write(&mut buf).map_err(StoreError::Deserialize)?;
        self.fs.write_all_at(inner.data, &buf, offset)?;
        Ok(offset)
    }

    /// Rewrites an already-durable record body in place, leaving its
    /// hash and offset untouched: the record's serialized length must
    /// not have changed since it was first written, so no other
    /// record's offset ever has to move.
    fn write_record_at(&self, inner: &Inner<R>, offset: u64, record: &R) -> Result<(), StoreError> {
        let mut payload = Vec::new();
        record.write(&mut payload).map_err(StoreError::Deserialize)?;
        self.fs.write_all_at(inner.data, &payload, offset + self.hash_size as u64)?;
        Ok(())
    }

    /// Replays the `.cache` file's `<offset> || <hash> || <body>` entries
    /// back into memory. A corrupt or truncated snapshot is never fatal
    /// to loading the subset -- it's logged and replay simply stops, since
    /// the `.data`/`.index` files remain the authoritative copy of
    /// anything the snapshot would have saved a re-pull for.
    fn load_cache_snapshot(&self, inner: &mut Inner<R>) -> Result<(), StoreError> {
        let buf = match self.fs.file_size(inner.cache_file).and_then(|size| {
            let mut buf = vec![0u8; size as usize];
            self.fs.read_exact_at(inner.cache_file, &mut buf, 0)?;
            Ok(buf)
        }) {
            Ok(buf) => buf,
            Err(error) => {
                warn!(subset = self.id, %error, "failed to read cache snapshot, skipping replay");
                return Ok(());
            }
        };

        let header_len = 8 + self.hash_size as usize;
        let mut remaining: &[u8] = &buf;
        while !remaining.is_empty() {
            if remaining.len() < header_len {
                warn!(subset = self.id, "cache snapshot truncated mid-entry, stopping replay");
                break;
            }
            let offset = u64::from_le_bytes(remaining[..8].try_into().unwrap());
            let hash = match Hash::from_bytes(remaining[8..header_len].to_vec()) {
                Ok(hash) => hash,
                Err(error) => {
                    warn!(subset = self.id, %error, "cache snapshot entry has an invalid hash, stopping replay");
                    break;
                }
            };
            remaining = &remaining[header_len..];
            let record = match R::read(&mut remaining) {
                Ok(record) => record,
                Err(error) => {
                    warn!(subset = self.id, %error, "cache snapshot entry failed to deserialize, stopping replay");
                    break;
                }
            };
            inner.cache.insert(hash, CacheSlot::from_cache_file(record, offset));
        }
        Ok(())
    }

    fn persist_cache_snapshot(&self, inner: &Inner<R>) -> Result<(), StoreError> {
        let mut buf = Vec::new();
        for (hash, slot) in inner.cache.iter() {
            buf.extend_from_slice(&slot.data_offset().to_le_bytes());
            buf.extend_from_slice(hash.as_bytes());
            slot.record.write(&mut buf).map_err(StoreError::Deserialize)?;
        }
        self.fs.write_all_at(inner.cache_file, &buf, 0)?;
        self.fs.truncate(inner.cache_file, buf.len() as u64)?;
        Ok(())
    }

    fn find_in_distributed_vec(dv: &DistributedVec<IndexEntry>, hash: &Hash, offset: u64) -> Option<Cursor> {
        let mut c = dv.begin();
        while c != dv.end() {
            let entry = dv.get(c).unwrap();
            if &entry.hash == hash && entry.offset == offset {
                return Some(c);
            }
            c = dv.increment(c);
        }
        None
    }

    /// First position after any existing equal-hash run, so a freshly
    /// written entry lands last among duplicates (FIFO), matching
    /// [`ContainerList::find_insert_before`]'s contract.
    fn find_insert_cursor(dv: &DistributedVec<IndexEntry>, hash: &Hash) -> Cursor {
        let mut c = dv.begin();
        while c != dv.end() {
            let entry = dv.get(c).unwrap();
            if &entry.hash > hash {
                break;
            }
            c = dv.increment(c);
        }
        c
    }

    /// Persists the subset: writes new/modified record bodies, rebuilds
    /// the sorted index against that plus any tombstones, then trims
    /// the in-memory cache back down to `max_cache_data_size`. Returns
    /// whether every step succeeded -- a save that hits a missing
    /// index entry during tombstone removal still finishes the rest of
    /// the work, but reports `false`.
    #[instrument(skip(self), fields(subset = self.id))]
    pub fn save(&self, max_cache_data_size: usize) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let mut success = true;

        // Phase 1: persist bodies.
        let mut written_entries = Vec::new();
        let mut removed_entries = Vec::new();
        let mut to_drop = Vec::new();

        let mut idx = inner.cache.begin();
        while idx < inner.cache.end() {
            let marked_remove = inner.cache.get_at(idx).marked_remove();
            if marked_remove {
                if inner.cache.get_at(idx).was_written() {
                    removed_entries.push((inner.cache.hash_at(idx).clone(), inner.cache.get_at(idx).data_offset()));
                }
                to_drop.push(idx);
            } else if inner.cache.get_at(idx).is_new() || inner.cache.get_at(idx).is_modified() {
                if inner.cache.get_at(idx).was_written() {
                    // Already durable and MODIFIED: rewrite the body in
                    // place at its existing offset. The index already
                    // points at this offset, so it needs no update.
                    let offset = inner.cache.get_at(idx).data_offset();
                    self.write_record_at(&inner, offset, &inner.cache.get_at(idx).record)?;
                    inner.cache.get_at_mut(idx).clear_modified();
                } else {
                    // No data offset yet: first write, so append and
                    // remember it for the index rebuild below.
                    let hash = inner.cache.hash_at(idx).clone();
                    let offset = self.append_record(&inner, &hash, &inner.cache.get_at(idx).record)?;
                    let slot = inner.cache.get_at_mut(idx);
                    slot.set_data_offset(offset);
                    slot.clear_new();
                    slot.clear_modified();
                    written_entries.push((hash, offset));
                }
            }
            idx += 1;
        }
        for idx in to_drop.into_iter().rev() {
            inner.cache.erase(idx);
        }

        // Phase 2: rebuild the index against the existing on-disk
        // entries plus this round's writes and tombstones.
        let bucket_count = INDEX_REBUILD_BUCKETS.min(inner.index_len.max(1)).max(1);
        let mut dv: DistributedVec<IndexEntry> = DistributedVec::new(bucket_count);
        dv.reserve(inner.index_len);
        for pos in 0..inner.index_len {
            dv.push_back(self.read_index_entry(&inner, pos)?);
        }

        for (hash, offset) in removed_entries {
            match Self::find_in_distributed_vec(&dv, &hash, offset) {
                Some(cursor) => {
                    dv.erase(cursor);
                }
                None => {
                    let error = StoreError::IndexOffsetNotFound {
                        subset_id: self.id,
                        offset,
                    };
                    warn!(subset = self.id, hash = %hash, %error, "index entry missing during removal");
                    success = false;
                }
            }
        }
        for (hash, offset) in written_entries {
            let cursor = Self::find_insert_cursor(&dv, &hash);
            dv.insert_before(cursor, IndexEntry { hash, offset });
        }

        let mut out = Vec::with_capacity(dv.len() * INDEX_ENTRY_SIZE as usize);
        let mut cursor = dv.begin();
        while cursor != dv.end() {
            let entry = dv.get(cursor).unwrap();
            out.extend_from_slice(&entry.offset.to_le_bytes());
            cursor = dv.increment(cursor);
        }
        self.fs.write_all_at(inner.index, &out, 0)?;
        self.fs.truncate(inner.index, out.len() as u64)?;
        inner.index_len = dv.len();
        self.load_samples(&mut inner)?;
        inner.pulled.clear();

        // Phase 3: trim the cache back down to budget.
        self.mark_old_and_trim(&mut inner, max_cache_data_size);
        self.persist_cache_snapshot(&inner)?;

        debug!(subset = self.id, success, entries = inner.index_len, "subset saved");
        Ok(success)
    }

    /// Flags the oldest durable cache entries `OLD` until under
    /// `max_cache_data_size` (with `TRIM_OVERSHOOT` slack on the first,
    /// precisely age-sorted pass; two coarser "every other entry"
    /// passes make up the difference if that wasn't enough), then
    /// drops flagged entries from memory -- they remain reachable via
    /// `pull` since the data file is unaffected.
    fn mark_old_and_trim(&self, inner: &mut Inner<R>, max_cache_data_size: usize) {
        let overhead = self.static_cache_item_overhead();
        let item_cost = |inner: &Inner<R>, i: usize| inner.cache.get_at(i).record.size() + overhead;

        let mut current: usize = inner.cache.iter().map(|(_, slot)| slot.record.size()).sum::<usize>()
            + inner.cache.size() * overhead;
        if current <= max_cache_data_size {
            return;
        }

        let soft_target = (max_cache_data_size as f64 * TRIM_OVERSHOOT) as usize;
        let evictable = |inner: &Inner<R>, i: usize| {
            let slot = inner.cache.get_at(i);
            slot.was_written() && !slot.is_old()
        };

        let mut indices: Vec<usize> = (0..inner.cache.size()).filter(|&i| evictable(inner, i)).collect();
        indices.sort_by(|&a, &b| {
            inner
                .cache
                .get_at(a)
                .record
                .compare_age(&inner.cache.get_at(b).record)
        });
        for i in indices {
            if current <= soft_target {
                break;
            }
            let cost = item_cost(inner, i);
            inner.cache.get_at_mut(i).set_old();
            current -= cost;
        }

        for pass in 0..2 {
            if current <= max_cache_data_size {
                break;
            }
            let remaining: Vec<usize> = (0..inner.cache.size()).filter(|&i| evictable(inner, i)).collect();
            for (n, i) in remaining.into_iter().enumerate() {
                if current <= max_cache_data_size {
                    break;
                }
                if n % 2 == pass % 2 {
                    let cost = item_cost(inner, i);
                    inner.cache.get_at_mut(i).set_old();
                    current -= cost;
                }
            }
        }

        let drop_indices: Vec<usize> = (0..inner.cache.size())
            .filter(|&i| {
                let slot = inner.cache.get_at(i);
                slot.is_old() && !slot.is_modified()
            })
            .collect();
        for i in drop_indices.into_iter().rev() {
            inner.cache.erase(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{self, Read, Write};
    use std::sync::Mutex;

    struct MemFs {
        files: Mutex<HashMap<String, Vec<u8>>>,
        by_handle: Mutex<HashMap<Handle, String>>,
        next: Mutex<usize>,
    }

    impl MemFs {
        fn new() -> Arc<Self> {
            Arc::new(MemFs {
                files: Mutex::new(HashMap::new()),
                by_handle: Mutex::new(HashMap::new()),
                next: Mutex::new(1),
            })
        }
    }

    impl FileSystem for MemFs {
        fn open(&self, name: &str) -> Result<Handle, crate::fs::FsError> {
            let mut by_handle = self.by_handle.lock().unwrap();
            if let Some((&h, _)) = by_handle.iter().find(|(_, n)| n.as_str() == name) {
                return Ok(h);
            }
            self.files.lock().unwrap().entry(name.to_string()).or_default();
            let mut next = self.next.lock().unwrap();
            let handle = Handle::from_raw(*next);
            *next += 1;
            by_handle.insert(handle, name.to_string());
            Ok(handle)
        }

        fn remove(&self, name: &str) -> Result<(), crate::fs::FsError> {
            self.files.lock().unwrap().remove(name);
            Ok(())
        }

        fn exists(&self, name: &str) -> bool {
            self.files.lock().unwrap().contains_key(name)
        }

        fn list(&self) -> Result<Vec<String>, crate::fs::FsError> {
            Ok(self.files.lock().unwrap().keys().cloned().collect())
        }

        fn read_exact_at(&self, handle: Handle, buf: &mut [u8], offset: u64) -> Result<(), crate::fs::FsError> {
            let by_handle = self.by_handle.lock().unwrap();
            let name = by_handle.get(&handle).unwrap();
            let files = self.files.lock().unwrap();
            let data = files.get(name).unwrap();
            let start = offset as usize;
            let mut slice = data
                .get(start..start + buf.len())
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))
                .map_err(|e| crate::fs::FsError::io(name.clone(), e))?;
            slice.read_exact(buf).map_err(|e| crate::fs::FsError::io(name.clone(), e))
        }

        fn write_at(&self, handle: Handle, buf: &[u8], offset: u64) -> Result<usize, crate::fs::FsError> {
            let by_handle = self.by_handle.lock().unwrap();
            let name = by_handle.get(&handle).unwrap();
            let mut files = self.files.lock().unwrap();
            let data = files.get_mut(name).unwrap();
            let end = offset as usize + buf.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            (&mut data[offset as usize..end]).write_all(buf).unwrap();
            Ok(buf.len())
        }

        fn file_size(&self, handle: Handle) -> Result<u64, crate::fs::FsError> {
            let by_handle = self.by_handle.lock().unwrap();
            let name = by_handle.get(&handle).unwrap();
            Ok(self.files.lock().unwrap().get(name).unwrap().len() as u64)
        }

        fn truncate(&self, handle: Handle, size: u64) -> Result<(), crate::fs::FsError> {
            let by_handle = self.by_handle.lock().unwrap();
            let name = by_handle.get(&handle).unwrap();
            self.files.lock().unwrap().get_mut(name).unwrap().resize(size as usize, 0);
            Ok(())
        }

        fn flush(&self, _handle: Handle) -> Result<(), crate::fs::FsError> {
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct TestRecord {
        value: u64,
        age: u64,
    }

    impl Record for TestRecord {
        fn write(&self, w: &mut dyn Write) -> io::Result<()> {
            w.write_all(&self.value.to_le_bytes())?;
            w.write_all(&self.age.to_le_bytes())
        }
        fn read(r: &mut dyn Read) -> io::Result<Self> {
            let mut value_buf = [0u8; 8];
            let mut age_buf = [0u8; 8];
            r.read_exact(&mut value_buf)?;
            r.read_exact(&mut age_buf)?;
            Ok(TestRecord {
                value: u64::from_le_bytes(value_buf),
                age: u64::from_le_bytes(age_buf),
            })
        }
        fn size(&self) -> usize {
            16
        }
        fn compare_age(&self, other: &Self) -> std::cmp::Ordering {
            self.age.cmp(&other.age)
        }
        fn values_match(&self, other: &Self) -> bool {
            self.value == other.value
        }
    }

    fn h(byte: u8) -> Hash {
        Hash::from_bytes(vec![byte; 4]).unwrap()
    }

    #[test]
    fn insert_then_get_round_trips_before_save() {
        let fs = MemFs::new();
        let subset: Subset<TestRecord> = Subset::load(0, fs, 4).unwrap();
        subset
            .insert(h(1), TestRecord { value: 42, age: 0 }, false)
            .unwrap();
        let found = subset.get_with(&h(1), |r| r.map(|r| r.value)).unwrap();
        assert_eq!(found, Some(42));
    }

    #[test]
    fn save_then_reload_finds_record_via_index() {
        let fs = MemFs::new();
        {
            let subset: Subset<TestRecord> = Subset::load(0, fs.clone(), 4).unwrap();
            subset
                .insert(h(7), TestRecord { value: 99, age: 0 }, false)
                .unwrap();
            assert!(subset.save(usize::MAX).unwrap());
        }
        let subset: Subset<TestRecord> = Subset::load(0, fs, 4).unwrap();
        assert_eq!(subset.on_disk_len(), 1);
        let found = subset.get_with(&h(7), |r| r.map(|r| r.value)).unwrap();
        assert_eq!(found, Some(99));
    }

    #[test]
    fn reject_if_matching_blocks_equal_value_duplicates() {
        let fs = MemFs::new();
        let subset: Subset<TestRecord> = Subset::load(0, fs, 4).unwrap();
        assert!(subset
            .insert(h(3), TestRecord { value: 5, age: 0 }, true)
            .unwrap());
        assert!(!subset
            .insert(h(3), TestRecord { value: 5, age: 1 }, true)
            .unwrap());
        assert!(subset
            .insert(h(3), TestRecord { value: 6, age: 1 }, true)
            .unwrap());
    }

    #[test]
    fn remove_after_save_tombstones_and_drops_on_next_save() {
        let fs = MemFs::new();
        let subset: Subset<TestRecord> = Subset::load(0, fs, 4).unwrap();
        subset.insert(h(9), TestRecord { value: 1, age: 0 }, false).unwrap();
        subset.save(usize::MAX).unwrap();
        assert!(subset
            .remove_if_matching(&h(9), &TestRecord { value: 1, age: 0 })
            .unwrap());
        assert!(subset.save(usize::MAX).unwrap());
        assert_eq!(subset.on_disk_len(), 0);
        assert_eq!(subset.get_with(&h(9), |r| r.is_some()).unwrap(), false);
    }

    #[test]
    fn save_trims_cache_to_budget_keeping_data_reachable() {
        let fs = MemFs::new();
        let subset: Subset<TestRecord> = Subset::load(0, fs, 4).unwrap();
        for i in 0..20u8 {
            subset
                .insert(h(i), TestRecord { value: i as u64, age: i as u64 }, false)
                .unwrap();
        }
        subset.save(16 * 5).unwrap();
        assert!(subset.cache_data_size() <= 16 * 8);
        // Still reachable by re-pulling from disk even though evicted from cache.
        let found = subset.get_with(&h(0), |r| r.map(|r| r.value)).unwrap();
        assert_eq!(found, Some(0));
    }

    #[test]
    fn modifying_a_durable_record_rewrites_in_place_without_growing_the_index() {
        let fs = MemFs::new();
        let subset: Subset<TestRecord> = Subset::load(0, fs, 4).unwrap();
        subset.insert(h(2), TestRecord { value: 1, age: 0 }, false).unwrap();
        subset.save(usize::MAX).unwrap();
        let offset_before = {
            let mut inner = subset.inner.lock();
            subset.ensure_pulled(&mut inner, &h(2)).unwrap();
            let idx = inner.cache.get(&h(2)).unwrap();
            inner.cache.get_at(idx).data_offset()
        };

        subset
            .get_mut_with(&h(2), |slot| {
                let slot = slot.unwrap();
                slot.record.value = 99;
                slot.set_modified();
            })
            .unwrap();
        assert!(subset.save(usize::MAX).unwrap());
        assert_eq!(subset.on_disk_len(), 1);

        let found = subset.get_with(&h(2), |r| r.map(|r| r.value)).unwrap();
        assert_eq!(found, Some(99));
        let mut inner = subset.inner.lock();
        subset.ensure_pulled(&mut inner, &h(2)).unwrap();
        let idx = inner.cache.get(&h(2)).unwrap();
        assert_eq!(inner.cache.get_at(idx).data_offset(), offset_before);
    }

    #[test]
    fn two_records_in_one_subset_survive_independent_in_place_rewrites() {
        // Rewriting one record in place must not disturb its neighbor's
        // bytes in the data file -- each record's body starts right
        // after the previous one's, with no length field marking where
        // it ends.
        let fs = MemFs::new();
        let subset: Subset<TestRecord> = Subset::load(0, fs, 4).unwrap();
        subset.insert(h(5), TestRecord { value: 1, age: 0 }, false).unwrap();
        subset.insert(h(6), TestRecord { value: 2, age: 0 }, false).unwrap();
        subset.save(usize::MAX).unwrap();

        subset
            .get_mut_with(&h(5), |slot| {
                let slot = slot.unwrap();
                slot.record.value = 99;
                slot.set_modified();
            })
            .unwrap();
        assert!(subset.save(usize::MAX).unwrap());

        let first = subset.get_with(&h(5), |r| r.map(|r| r.value)).unwrap();
        let second = subset.get_with(&h(6), |r| r.map(|r| r.value)).unwrap();
        assert_eq!(first, Some(99));
        assert_eq!(second, Some(2));
    }

    #[test]
    fn corrupt_cache_snapshot_degrades_instead_of_failing_load() {
        let fs = MemFs::new();
        {
            let subset: Subset<TestRecord> = Subset::load(0, fs.clone(), 4).unwrap();
            subset.insert(h(1), TestRecord { value: 42, age: 0 }, false).unwrap();
            subset.save(usize::MAX).unwrap();
        }
        // Truncate the cache snapshot mid-entry; the record is still
        // durable in `.data`/`.index`, so loading must still succeed.
        fs.files
            .lock()
            .unwrap()
            .insert("0000.cache".to_string(), vec![0xaa; 3]);

        let subset: Subset<TestRecord> = Subset::load(0, fs, 4).unwrap();
        let found = subset.get_with(&h(1), |r| r.map(|r| r.value)).unwrap();
        assert_eq!(found, Some(42));
    }

    #[test]
    fn defragment_is_unimplemented() {
        let fs = MemFs::new();
        let subset: Subset<TestRecord> = Subset::load(0, fs, 4).unwrap();
        assert!(subset.defragment().is_err());
    }
}
