//! Named synchronization primitives that log when a lock is held long
//! enough to suggest contention, plus a small thread registry so those
//! log lines can name the thread holding a lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use tracing::warn;

const STALL_WARN_AFTER: Duration = Duration::from_secs(1);

fn registry() -> &'static Mutex<HashMap<ThreadId, String>> {
    static REGISTRY: OnceLock<Mutex<HashMap<ThreadId, String>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Associates the current thread with `name` for the lifetime of the
/// returned guard, so contention warnings elsewhere can name it.
pub struct ThreadNameGuard {
    id: ThreadId,
}

impl ThreadNameGuard {
    pub fn register(name: impl Into<String>) -> Self {
        let id = std::thread::current().id();
        registry().lock().unwrap().insert(id, name.into());
        ThreadNameGuard { id }
    }
}

impl Drop for ThreadNameGuard {
    fn drop(&mut self) {
        registry().lock().unwrap().remove(&self.id);
    }
}

/// The human-readable name registered for `id`, or a debug fallback.
pub fn thread_name(id: ThreadId) -> String {
    registry()
        .lock()
        .unwrap()
        .get(&id)
        .cloned()
        .unwrap_or_else(|| format!("{id:?}"))
}

/// A `Mutex<T>` that logs a warning if a lock acquisition takes longer
/// than [`STALL_WARN_AFTER`], naming itself and (if known) the holder.
pub struct NamedMutex<T> {
    name: &'static str,
    inner: Mutex<T>,
    holder: Mutex<Option<ThreadId>>,
}

impl<T> NamedMutex<T> {
    pub fn new(name: &'static str, value: T) -> Self {
        NamedMutex {
            name,
            inner: Mutex::new(value),
            holder: Mutex::new(None),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        let start = Instant::now();
        let guard = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                let guard = self.inner.lock().unwrap_or_else(|poison| poison.into_inner());
                let waited = start.elapsed();
                if waited >= STALL_WARN_AFTER {
                    let holder = *self.holder.lock().unwrap();
                    match holder {
                        Some(id) => warn!(
                            lock = self.name,
                            waited_ms = waited.as_millis() as u64,
                            held_by = %thread_name(id),
                            "waited for lock"
                        ),
                        None => warn!(
                            lock = self.name,
                            waited_ms = waited.as_millis() as u64,
                            "waited for lock"
                        ),
                    }
                }
                guard
            }
        };
        *self.holder.lock().unwrap() = Some(std::thread::current().id());
        guard
    }
}

/// A readers-writer lock that allows concurrent readers but exclusive
/// writers: a writer first marks itself waiting (blocking further
/// readers from starting) before draining the existing readers.
pub struct ReadersWriterLock<T> {
    name: &'static str,
    state: Mutex<RwState>,
    data: std::sync::RwLock<T>,
}

struct RwState {
    reader_count: u32,
    writer_waiting: bool,
    writer_locked: bool,
    writer_name: Option<&'static str>,
    writer_thread: Option<ThreadId>,
}

impl<T> ReadersWriterLock<T> {
    pub fn new(name: &'static str, value: T) -> Self {
        ReadersWriterLock {
            name,
            state: Mutex::new(RwState {
                reader_count: 0,
                writer_waiting: false,
                writer_locked: false,
                writer_name: None,
                writer_thread: None,
            }),
            data: std::sync::RwLock::new(value),
        }
    }

    pub fn read(&self) -> std::sync::RwLockReadGuard<'_, T> {
        let start = Instant::now();
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if !state.writer_waiting && !state.writer_locked {
                    state.reader_count += 1;
                    break;
                }
            }
            if start.elapsed() >= STALL_WARN_AFTER {
                let state = self.state.lock().unwrap();
                warn!(
                    lock = self.name,
                    writer = state.writer_name.unwrap_or("<unnamed>"),
                    "waiting for read lock"
                );
            }
            std::thread::yield_now();
        }
        match self.data.read() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }

    pub fn write(&self, request_name: &'static str) -> std::sync::RwLockWriteGuard<'_, T> {
        let start = Instant::now();
        loop {
            let mut state = self.state.lock().unwrap();
            if !state.writer_waiting && !state.writer_locked {
                state.writer_waiting = true;
                break;
            }
            drop(state);
            if start.elapsed() >= STALL_WARN_AFTER {
                warn!(lock = self.name, request = request_name, "waiting to start write lock");
            }
            std::thread::yield_now();
        }

        loop {
            let mut state = self.state.lock().unwrap();
            if state.reader_count == 0 {
                state.writer_waiting = false;
                state.writer_locked = true;
                state.writer_name = Some(request_name);
                state.writer_thread = Some(std::thread::current().id());
                break;
            }
            let readers = state.reader_count;
            drop(state);
            if start.elapsed() >= STALL_WARN_AFTER {
                warn!(lock = self.name, request = request_name, readers, "waiting for readers to drain");
            }
            std::thread::yield_now();
        }

        match self.data.write() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }

    /// Call when a read guard obtained via [`Self::read`] is dropped.
    pub fn note_read_released(&self) {
        let mut state = self.state.lock().unwrap();
        state.reader_count = state.reader_count.saturating_sub(1);
    }

    /// Call when a write guard obtained via [`Self::write`] is dropped.
    pub fn note_write_released(&self) {
        let mut state = self.state.lock().unwrap();
        state.writer_locked = false;
        state.writer_name = None;
        state.writer_thread = None;
    }
}

/// A lightweight monotonically increasing counter used to label worker
/// threads spawned for [`crate::store::Store::save_multi_threaded`].
pub struct ThreadIdAllocator(AtomicU32);

impl ThreadIdAllocator {
    pub const fn new() -> Self {
        ThreadIdAllocator(AtomicU32::new(1))
    }

    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, AtomicOrdering::Relaxed)
    }
}

impl Default for ThreadIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
