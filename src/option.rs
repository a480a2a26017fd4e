use lazy_static::lazy_static;
use std::path::PathBuf;

use derive_more::Display;

lazy_static! {
  pub static ref DEFAULT_DIR_PATH: PathBuf = std::env::temp_dir().join("logkv");
}

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;
pub const GB: u64 = 1024 * MB;

#[derive(Debug, Clone)]
pub struct Options {
  pub dir_path: PathBuf,

  /// Max size of a single segment file, rotation happens before it is exceeded.
  pub segment_size: u64,

  /// Block cache size in bytes, 0 disables the cache.
  pub block_cache: u64,

  /// Fsync every write.
  pub sync_writes: bool,

  /// Fsync after this many bytes were written, 0 disables it.
  pub bytes_per_sync: u64,

  pub index_type: IndexType,

  /// Only used when `index_type` is `IndexType::BPlusTree`.
  pub bptree_options: BPTreeOptions,

  /// Open the older segments through mmap for faster startup.
  pub mmap_at_startup: bool,

  /// Capacity of the watch event queue, 0 disables watching.
  pub watch_queue_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum IndexType {
  BTree,

  Radix,

  SkipList,

  BPlusTree,
}

impl Default for Options {
  fn default() -> Self {
    Self {
      dir_path: DEFAULT_DIR_PATH.clone(),
      segment_size: GB,
      block_cache: 0,
      sync_writes: false,
      bytes_per_sync: 0,
      index_type: IndexType::BTree,
      bptree_options: BPTreeOptions::default(),
      mmap_at_startup: true,
      watch_queue_size: 0,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BPTreeOptions {
  /// Size of each page in bytes, must be a power of two.
  pub page_size: u32,

  /// Max keys per node before a split, 0 derives it from the page size.
  pub order: usize,

  /// Max number of pages kept in memory.
  pub cache_size: usize,

  pub sync_writes: bool,
}

impl Default for BPTreeOptions {
  fn default() -> Self {
    Self {
      page_size: 4096,
      order: 0,
      cache_size: 1000,
      sync_writes: false,
    }
  }
}

pub struct IteratorOptions {
  pub prefix: Vec<u8>,
  pub reverse: bool,
}

#[allow(clippy::derivable_impls)]
impl Default for IteratorOptions {
  fn default() -> Self {
    Self {
      prefix: Default::default(),
      reverse: false,
    }
  }
}

#[derive(Debug, Clone, Copy)]
pub struct WriteBatchOptions {
  pub max_batch_num: usize,

  /// Fsync the log when the batch commits, unless the engine already syncs every write.
  pub sync_writes: bool,

  /// A read-only batch holds the shared lock and rejects writes.
  pub read_only: bool,
}

impl Default for WriteBatchOptions {
  fn default() -> Self {
    Self {
      max_batch_num: 10000,
      sync_writes: true,
      read_only: false,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IOManagerType {
  StandardFileIO,

  MemoryMap,
}
