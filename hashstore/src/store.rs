//! Top-level content-addressed store: a fixed number of [`Subset`]
//! partitions behind one readers-writer lock, routed by hash so lookups
//! and inserts into different subsets never contend with each other.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::StoreError;
use crate::fs::FileSystem;
use crate::hash::Hash;
use crate::record::Record;
use crate::subset::Subset;
use crate::sync::{ReadersWriterLock, ThreadNameGuard};

/// How often a long-running `load`/`save_multi_threaded` call logs
/// progress.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// How often `save_multi_threaded`'s coordinating thread polls worker
/// progress.
const DISPATCH_POLL_INTERVAL: Duration = Duration::from_millis(500);

struct StoreState<R> {
    subsets: Vec<Subset<R>>,
}

pub struct Store<R> {
    set_count: u16,
    target_cache_data_size: AtomicUsize,
    lock: ReadersWriterLock<StoreState<R>>,
}

impl<R: Record> Store<R> {
    /// Opens (creating if absent) `set_count` subsets under `fs` using
    /// default sampling and cache-trim settings. Hashes route to a
    /// subset by `hash.lookup8() % set_count` when `set_count <= 256`,
    /// else `hash.lookup16() % set_count`. Equivalent to
    /// [`Self::open_with_config`] with [`Config::default`]'s
    /// `sample_interval`/`target_cache_data_size` and the given
    /// `set_count`/`hash_size` overridden.
    pub fn load(fs: Arc<dyn FileSystem>, set_count: u16, hash_size: u8) -> Result<Self, StoreError> {
        Self::open_with_config(
            fs,
            Config {
                set_count,
                hash_size,
                ..Config::default()
            },
        )
    }

    /// Opens (creating if absent) `config.set_count` subsets under `fs`,
    /// applying every knob in `config`.
    #[instrument(skip(fs))]
    pub fn open_with_config(fs: Arc<dyn FileSystem>, config: Config) -> Result<Self, StoreError> {
        let set_count = config.set_count;
        assert!(set_count > 0, "set_count must be positive");
        let mut subsets = Vec::with_capacity(set_count as usize);
        let start = Instant::now();
        let mut last_log = start;
        for id in 0..set_count {
            subsets.push(Subset::load_with_sample_interval(
                id,
                fs.clone(),
                config.hash_size,
                config.sample_interval,
            )?);
            if last_log.elapsed() >= PROGRESS_LOG_INTERVAL {
                info!(loaded = id + 1, total = set_count, "loading store");
                last_log = Instant::now();
            }
        }
        info!(set_count, elapsed_ms = start.elapsed().as_millis() as u64, "store loaded");
        Ok(Store {
            set_count,
            target_cache_data_size: AtomicUsize::new(config.target_cache_data_size),
            lock: ReadersWriterLock::new("store", StoreState { subsets }),
        })
    }

    pub fn set_count(&self) -> u16 {
        self.set_count
    }

    /// Sets the store-wide in-memory cache budget future `save` calls
    /// trim against, split evenly across subsets. Does not itself
    /// trigger a save.
    pub fn set_target_cache_data_size(&self, total_bytes: usize) {
        self.target_cache_data_size.store(total_bytes, Ordering::Relaxed);
    }

    /// The store-wide cache budget divided evenly across subsets, so
    /// each one trims toward its own share rather than the whole total.
    fn per_subset_cache_target(&self) -> usize {
        self.target_cache_data_size.load(Ordering::Relaxed) / self.set_count as usize
    }

    /// Routes by the low byte of the hash when that's enough to address
    /// every subset, falling back to the low two bytes above 256 -- the
    /// same split point `lookup8`/`lookup16` exist for.
    fn subset_index(&self, hash: &Hash) -> usize {
        if self.set_count <= 256 {
            (hash.lookup8() as usize) % self.set_count as usize
        } else {
            (hash.lookup16() as usize) % self.set_count as usize
        }
    }

    /// Total number of durably indexed records across all subsets.
    pub fn size(&self) -> usize {
        let state = self.lock.read();
        let total = state.subsets.iter().map(Subset::on_disk_len).sum();
        drop(state);
        self.lock.note_read_released();
        total
    }

    /// Total number of records currently resident in memory, across all
    /// subsets (a superset of what's durable: includes unsaved inserts).
    pub fn cache_size(&self) -> usize {
        let state = self.lock.read();
        let total = state.subsets.iter().map(Subset::cache_len).sum();
        drop(state);
        self.lock.note_read_released();
        total
    }

    /// Total in-memory footprint of cached records, across all subsets.
    pub fn cache_data_size(&self) -> usize {
        let state = self.lock.read();
        let total = state.subsets.iter().map(Subset::cache_data_size).sum();
        drop(state);
        self.lock.note_read_released();
        total
    }

    pub fn contains(&self, hash: &Hash) -> Result<bool, StoreError> {
        let state = self.lock.read();
        let result = state.subsets[self.subset_index(hash)].contains(hash);
        drop(state);
        self.lock.note_read_released();
        result
    }

    pub fn get_with<T>(&self, hash: &Hash, f: impl FnOnce(Option<&R>) -> T) -> Result<T, StoreError> {
        let state = self.lock.read();
        let result = state.subsets[self.subset_index(hash)].get_with(hash, f);
        drop(state);
        self.lock.note_read_released();
        result
    }

    /// Locates the first live record under `hash` and hands mutable
    /// access to its cache slot to `f`, so a caller can edit the record
    /// in place (and must then call [`crate::record::CacheSlot::set_modified`]
    /// themselves) rather than remove-and-reinsert.
    pub fn get_mut_with<T>(
        &self,
        hash: &Hash,
        f: impl FnOnce(Option<&mut crate::record::CacheSlot<R>>) -> T,
    ) -> Result<T, StoreError> {
        let state = self.lock.read();
        let result = state.subsets[self.subset_index(hash)].get_mut_with(hash, f);
        drop(state);
        self.lock.note_read_released();
        result
    }

    /// Inserts under `hash`. Only takes the store's *read* lock: the
    /// target subset's own mutex serializes the actual mutation, so
    /// concurrent inserts into different subsets never block each
    /// other. `save`/`save_multi_threaded` take the write lock instead,
    /// so a save never races a subset reorganizing its own index.
    pub fn insert(&self, hash: Hash, record: R, reject_if_matching: bool) -> Result<bool, StoreError> {
        let state = self.lock.read();
        let idx = self.subset_index(&hash);
        let result = state.subsets[idx].insert(hash, record, reject_if_matching);
        drop(state);
        self.lock.note_read_released();
        result
    }

    pub fn remove_if_matching(&self, hash: &Hash, record: &R) -> Result<bool, StoreError> {
        let state = self.lock.read();
        let result = state.subsets[self.subset_index(hash)].remove_if_matching(hash, record);
        drop(state);
        self.lock.note_read_released();
        result
    }

    /// Saves every subset serially, in order. Returns whether all of
    /// them reported success -- no subset's failure is allowed to mask
    /// another's.
    #[instrument(skip(self))]
    pub fn save(&self) -> Result<bool, StoreError> {
        let target = self.per_subset_cache_target();
        let state = self.lock.write("save");
        let mut success = true;
        for subset in state.subsets.iter() {
            if !subset.save(target)? {
                success = false;
            }
        }
        debug!(success, "store save complete");
        drop(state);
        self.lock.note_write_released();
        Ok(success)
    }

    /// Saves every subset using up to `thread_count` worker threads
    /// pulling from a shared work queue. The calling thread polls for
    /// completion every [`DISPATCH_POLL_INTERVAL`] and logs progress at
    /// most once per [`PROGRESS_LOG_INTERVAL`].
    #[instrument(skip(self))]
    pub fn save_multi_threaded(&self, thread_count: usize) -> Result<bool, StoreError> {
        let target = self.per_subset_cache_target();
        let state = self.lock.write("save_multi_threaded");
        let subset_count = state.subsets.len();
        let subsets = state.subsets.as_slice();

        // A shared dispatch queue: every worker pulls the next subset
        // index as it frees up, rather than a static pre-split, so a
        // handful of slow subsets don't strand idle workers.
        let (work_tx, work_rx) = unbounded::<usize>();
        for i in 0..subset_count {
            work_tx.send(i).expect("receiver outlives this loop");
        }
        drop(work_tx);

        let success = AtomicBool::new(true);
        let completed = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for worker in 0..thread_count.max(1) {
                let work_rx = work_rx.clone();
                let success = &success;
                let completed = &completed;
                scope.spawn(move || {
                    let _name = ThreadNameGuard::register(format!("store-save-{worker}"));
                    while let Ok(i) = work_rx.recv() {
                        match subsets[i].save(target) {
                            Ok(ok) => {
                                if !ok {
                                    success.store(false, Ordering::Relaxed);
                                }
                            }
                            Err(error) => {
                                warn!(subset = i, %error, "subset save failed");
                                success.store(false, Ordering::Relaxed);
                            }
                        }
                        completed.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }

            let mut last_log = Instant::now();
            loop {
                std::thread::sleep(DISPATCH_POLL_INTERVAL);
                let done = completed.load(Ordering::Relaxed);
                if done >= subset_count {
                    break;
                }
                if last_log.elapsed() >= PROGRESS_LOG_INTERVAL {
                    info!(done, total = subset_count, "save_multi_threaded progress");
                    last_log = Instant::now();
                }
            }
        });

        let success = success.load(Ordering::Relaxed);
        debug!(success, threads = thread_count, "store multi-threaded save complete");
        drop(state);
        self.lock.note_write_released();
        Ok(success)
    }
}
