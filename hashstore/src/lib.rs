//! A content-addressed, persistent key/value store built out of a
//! fixed number of independently-lockable partitions ([`subset::Subset`]),
//! each backed by an append-only data file, a sorted on-disk index, and
//! an in-memory cache snapshot.
//!
//! # Layout
//!
//! - [`config`] -- [`config::Config`], construction-time knobs for a store.
//! - [`hash`] -- the fixed-width [`hash::Hash`] key type.
//! - [`record`] -- the [`record::Record`] trait values must implement,
//!   plus the per-entry lifecycle bookkeeping ([`record::CacheSlot`]).
//! - [`fs`] -- the [`fs::FileSystem`] abstraction the store is built on,
//!   with a real-filesystem implementation in [`fs::concrete`].
//! - [`sorted_set`], [`container_list`], [`distributed_vec`],
//!   [`hash_set`] -- the in-memory collection primitives [`subset`] is
//!   built from.
//! - [`subset`] -- one on-disk partition: the engine.
//! - [`store`] -- [`store::Store`], the public entry point, routing
//!   hashes across a fixed number of subsets.
//! - [`error`] -- the [`error::StoreError`] taxonomy.
//! - [`sync`] -- contention-aware synchronization primitives shared by
//!   [`subset::Subset`] and [`store::Store`].

pub mod config;
pub mod container_list;
pub mod distributed_vec;
pub mod error;
pub mod fs;
pub mod hash;
pub mod hash_set;
pub mod record;
pub mod sorted_set;
pub mod store;
pub mod subset;
pub mod sync;


pub use config::Config;
pub use error::StoreError;
pub use hash::Hash;
pub use record::{CacheSlot, Record};
pub use store::Store;
