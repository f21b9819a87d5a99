use std::cmp::Ordering;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;

use argh::FromArgs;
use tracing::Level;

use hashstore::fs::concrete::ConcreteFileSystem;
use hashstore::{Hash, Record, Store};

#[derive(Debug, FromArgs)]
/// Drives a hashstore with concurrent inserts for testing.
struct Opts {
    #[argh(switch)]
    /// emit trace-level debug info
    debug: bool,

    #[argh(option, default = "4")]
    /// number of inserting threads to spawn
    num_threads: usize,

    #[argh(option, default = "8")]
    /// number of on-disk subsets to partition the store into
    num_subsets: u16,

    #[argh(option, default = "String::from(\"./hashstore-data\")")]
    /// directory to store subset files under
    path: String,
}

/// A minimal demo payload: a UTF-8 string, length-prefixed.
struct TextRecord(String);

impl Record for TextRecord {
    fn write(&self, writer: &mut dyn Write) -> io::Result<()> {
        let bytes = self.0.as_bytes();
        writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
        writer.write_all(bytes)
    }

    fn read(reader: &mut dyn Read) -> io::Result<Self> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let mut buf = vec![0u8; u32::from_le_bytes(len_buf) as usize];
        reader.read_exact(&mut buf)?;
        String::from_utf8(buf)
            .map(TextRecord)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn size(&self) -> usize {
        self.0.len()
    }

    fn compare_age(&self, _other: &Self) -> Ordering {
        Ordering::Equal
    }

    fn values_match(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

fn key_hash(key: &str) -> Hash {
    Hash::from_bytes(blake3_like_digest(key.as_bytes())).expect("digest fits in max hash size")
}

/// A small, dependency-free fold used only so this demo has something
/// deterministic to route on; the store itself is agnostic to how
/// hashes are produced.
fn blake3_like_digest(bytes: &[u8]) -> Vec<u8> {
    let mut state = [0x9e3779b9u32, 0x85ebca6b, 0xc2b2ae35, 0x27d4eb2f];
    for (i, &b) in bytes.iter().enumerate() {
        state[i % 4] = state[i % 4].wrapping_add(b as u32).rotate_left(5);
    }
    state.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn main() {
    let opts: Opts = argh::from_env();

    if opts.debug {
        tracing_subscriber::fmt().with_max_level(Level::TRACE).init();
    } else {
        tracing_subscriber::fmt().with_max_level(Level::INFO).init();
    }

    let fs = Arc::new(ConcreteFileSystem::new(&opts.path).expect("open store directory"));
    let store: Arc<Store<TextRecord>> =
        Arc::new(Store::load(fs, opts.num_subsets, 16).expect("load store"));

    let mut handles = Vec::with_capacity(opts.num_threads);
    for thread_index in 0..opts.num_threads {
        let store = store.clone();
        handles.push(thread::spawn(move || {
            for i in 0..10_000 {
                let key = format!("hello-{thread_index}-{i}");
                let value = format!("world {i}");
                store
                    .insert(key_hash(&key), TextRecord(value), false)
                    .expect("insert");
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    store.save_multi_threaded(opts.num_threads).expect("save");
    println!("stored {} records across {} subsets", store.size(), opts.num_subsets);
}
