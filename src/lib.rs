//! logkv: an embedded key-value storage engine built on the Bitcask model.
//!
//! Every write is appended to a segmented log and an ordered index maps each
//! key to the position of its live record. Multi-key batches commit
//! atomically, the index is rebuilt from the log on open, and a background
//! merge rewrites live records to reclaim space.
//!
//! # Features
//!
//! * Atomic write batches, recovered all-or-nothing after a crash
//! * Pluggable ordered indexes: BTreeMap, radix trie, skip list and an on-disk B+Tree
//! * Ordered scans, prefix iteration and reverse iteration
//! * Merge with hint files for fast restarts
//! * Optional block cache and memory-mapped startup
//! * Bounded watch queue of committed changes
//!
//! # Basic Usage
//!
//! ```
//! use bytes::Bytes;
//! use logkv::{db::Engine, option::Options};
//!
//! let opts = Options {
//!   dir_path: std::env::temp_dir().join("logkv-doc"),
//!   ..Default::default()
//! };
//! let engine = Engine::open(opts.clone()).expect("failed to open logkv engine");
//!
//! let key = Bytes::from("hello");
//! let value = Bytes::from("world");
//! engine.put(key.clone(), value.clone()).expect("failed to put");
//!
//! let retrieved = engine.get(key.clone()).expect("failed to get");
//! assert_eq!(retrieved, value);
//!
//! engine.delete(key).expect("failed to delete");
//! # drop(engine);
//! # std::fs::remove_dir_all(opts.dir_path).unwrap();
//! ```

mod data;

mod fio;
mod index;
mod wal;

pub mod batch;
pub mod db;
pub mod errors;
pub mod iterator;
pub mod merge;
pub mod option;
pub mod util;
pub mod watch;
