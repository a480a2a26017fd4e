use std::{
  fs::{self, File},
  sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
  },
};

use bytes::Bytes;
use fs2::FileExt;
use log::{error, info, warn};
use parking_lot::RwLock;

use crate::{
  batch::{BatchIdGenerator, SnowflakeIdGenerator},
  data::{
    log_record::{LogRecord, LogRecordType},
    replay::replay,
  },
  errors::{Errors, Result},
  index::{new_indexer, Indexer},
  merge::load_merge_files,
  option::{IOManagerType, IndexType, Options, WriteBatchOptions},
  util,
  wal::{ChunkPosition, Wal, WalOptions},
  watch::Watcher,
};

pub const SEGMENT_FILE_EXT: &str = ".SEG";
pub(crate) const FILE_LOCK_NAME: &str = "flock";

/// Bitcask storage engine: an append-only segment log plus an ordered index
/// from key to the position of its live record.
pub struct Engine {
  pub(crate) options: Arc<Options>,
  pub(crate) wal: Wal,
  pub(crate) index: Box<dyn Indexer>,
  /// Held exclusively by writable batches, shared by readers.
  pub(crate) mu: RwLock<()>,
  pub(crate) id_generator: Arc<dyn BatchIdGenerator>,
  pub(crate) merge_running: AtomicBool,
  pub(crate) watcher: Option<Arc<Watcher>>,
  /// Bytes of records no longer referenced by the index.
  reclaim_size: AtomicU64,
  lock_file: File,
  closed: AtomicBool,
}

/// Storage statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
  pub key_num: usize,
  pub data_file_num: usize,
  pub reclaimable_size: u64,
  pub disk_size: u64,
}

impl Engine {
  /// Opens the engine in `opts.dir_path`, rebuilding the index from the log.
  pub fn open(opts: Options) -> Result<Self> {
    Self::open_with_id_generator(opts, Arc::new(SnowflakeIdGenerator::default()))
  }

  pub fn open_with_id_generator(
    options: Options,
    id_generator: Arc<dyn BatchIdGenerator>,
  ) -> Result<Self> {
    check_options(&options)?;

    let dir_path = options.dir_path.clone();
    if !dir_path.is_dir() {
      if let Err(e) = fs::create_dir_all(&dir_path) {
        warn!("create database directory err: {}", e);
        return Err(Errors::FailedToCreateDatabaseDir);
      }
    }

    let lock_file = match fs::OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(dir_path.join(FILE_LOCK_NAME))
    {
      Ok(file) => file,
      Err(e) => {
        error!("failed to open lock file: {}", e);
        return Err(Errors::FailedToLockDatabase);
      }
    };
    if lock_file.try_lock_exclusive().is_err() {
      return Err(Errors::DatabaseIsUsing);
    }

    load_merge_files(&dir_path)?;

    let io_type = if options.mmap_at_startup {
      IOManagerType::MemoryMap
    } else {
      IOManagerType::StandardFileIO
    };
    let wal = Wal::open(WalOptions {
      dir_path: dir_path.clone(),
      segment_size: options.segment_size,
      segment_file_ext: SEGMENT_FILE_EXT.to_string(),
      sync: options.sync_writes,
      bytes_per_sync: options.bytes_per_sync,
      block_cache: options.block_cache,
      io_type,
    })?;

    let index = new_indexer(options.index_type, &dir_path, options.bptree_options)?;
    let watcher = match options.watch_queue_size {
      0 => None,
      size => Some(Arc::new(Watcher::new(size))),
    };

    let engine = Self {
      options: Arc::new(options),
      wal,
      index,
      mu: RwLock::new(()),
      id_generator,
      merge_running: AtomicBool::new(false),
      watcher,
      reclaim_size: AtomicU64::new(0),
      lock_file,
      closed: AtomicBool::new(false),
    };
    engine.load_index()?;

    Ok(engine)
  }

  /// Hint records of the last merge first, then every segment after it.
  fn load_index(&self) -> Result<()> {
    let merged_up_to = self.load_index_from_hint_file()?;
    let reader = match merged_up_to {
      Some(high_water) => self.wal.reader_from(high_water + 1),
      None => self.wal.reader(),
    };

    let stat = replay(reader, self.index.as_ref())?;
    self.reclaim_size.store(stat.reclaimable, Ordering::SeqCst);
    info!(
      "engine opened at {:?}: {} keys, {} records replayed, {} batches, {} unfinished records dropped",
      self.options.dir_path,
      self.index.size(),
      stat.records,
      stat.batches,
      stat.discarded
    );
    Ok(())
  }

  pub fn put(&self, key: Bytes, value: Bytes) -> Result<()> {
    let mut batch = self.new_write_batch(single_op_options())?;
    batch.put(key, value)?;
    batch.commit()
  }

  /// Deleting a key that is not present is a no-op.
  pub fn delete(&self, key: Bytes) -> Result<()> {
    let mut batch = self.new_write_batch(single_op_options())?;
    batch.delete(key)?;
    batch.commit()
  }

  pub fn get(&self, key: Bytes) -> Result<Bytes> {
    if key.is_empty() {
      return Err(Errors::KeyIsEmpty);
    }
    let _guard = self.mu.read_recursive();
    self.check_open()?;

    match self.index.get(&key)? {
      Some(pos) => self.read_value(&pos),
      None => Err(Errors::KeyNotFound),
    }
  }

  pub fn exist(&self, key: Bytes) -> Result<bool> {
    if key.is_empty() {
      return Err(Errors::KeyIsEmpty);
    }
    let _guard = self.mu.read_recursive();
    self.check_open()?;
    Ok(self.index.get(&key)?.is_some())
  }

  /// Calls `handle_fn` with every key and value in ascending key order until
  /// it returns `Ok(false)`. The engine is read locked meanwhile, writes from
  /// inside the handler deadlock.
  pub fn ascend<F>(&self, mut handle_fn: F) -> Result<()>
  where
    F: FnMut(Bytes, Bytes) -> Result<bool>,
  {
    let _guard = self.mu.read_recursive();
    self.check_open()?;
    self.index.ascend(&mut |key, pos| {
      let value = self.read_value(&pos)?;
      handle_fn(Bytes::copy_from_slice(key), value)
    })
  }

  /// Ascending over `[start, end)`.
  pub fn ascend_range<F>(&self, start: Bytes, end: Bytes, mut handle_fn: F) -> Result<()>
  where
    F: FnMut(Bytes, Bytes) -> Result<bool>,
  {
    let _guard = self.mu.read_recursive();
    self.check_open()?;
    self.index.ascend_range(&start, &end, &mut |key, pos| {
      let value = self.read_value(&pos)?;
      handle_fn(Bytes::copy_from_slice(key), value)
    })
  }

  pub fn ascend_greater_or_equal<F>(&self, key: Bytes, mut handle_fn: F) -> Result<()>
  where
    F: FnMut(Bytes, Bytes) -> Result<bool>,
  {
    let _guard = self.mu.read_recursive();
    self.check_open()?;
    self.index.ascend_greater_or_equal(&key, &mut |key, pos| {
      let value = self.read_value(&pos)?;
      handle_fn(Bytes::copy_from_slice(key), value)
    })
  }

  pub fn descend<F>(&self, mut handle_fn: F) -> Result<()>
  where
    F: FnMut(Bytes, Bytes) -> Result<bool>,
  {
    let _guard = self.mu.read_recursive();
    self.check_open()?;
    self.index.descend(&mut |key, pos| {
      let value = self.read_value(&pos)?;
      handle_fn(Bytes::copy_from_slice(key), value)
    })
  }

  /// Descending from `start` (inclusive) down to `end` (exclusive).
  pub fn descend_range<F>(&self, start: Bytes, end: Bytes, mut handle_fn: F) -> Result<()>
  where
    F: FnMut(Bytes, Bytes) -> Result<bool>,
  {
    let _guard = self.mu.read_recursive();
    self.check_open()?;
    self.index.descend_range(&start, &end, &mut |key, pos| {
      let value = self.read_value(&pos)?;
      handle_fn(Bytes::copy_from_slice(key), value)
    })
  }

  pub fn descend_less_or_equal<F>(&self, key: Bytes, mut handle_fn: F) -> Result<()>
  where
    F: FnMut(Bytes, Bytes) -> Result<bool>,
  {
    let _guard = self.mu.read_recursive();
    self.check_open()?;
    self.index.descend_less_or_equal(&key, &mut |key, pos| {
      let value = self.read_value(&pos)?;
      handle_fn(Bytes::copy_from_slice(key), value)
    })
  }

  /// Ascending over the keys starting with `prefix`, values are not read.
  pub fn ascend_keys<F>(&self, prefix: Bytes, mut handle_fn: F) -> Result<()>
  where
    F: FnMut(Bytes) -> Result<bool>,
  {
    let _guard = self.mu.read_recursive();
    self.check_open()?;
    self.index.ascend_greater_or_equal(&prefix, &mut |key, _| {
      if !key.starts_with(&prefix) {
        return Ok(false);
      }
      handle_fn(Bytes::copy_from_slice(key))
    })
  }

  /// Descending over the keys starting with `prefix`, values are not read.
  pub fn descend_keys<F>(&self, prefix: Bytes, mut handle_fn: F) -> Result<()>
  where
    F: FnMut(Bytes) -> Result<bool>,
  {
    let _guard = self.mu.read_recursive();
    self.check_open()?;
    let mut handler = |key: &[u8], _: ChunkPosition| -> Result<bool> {
      if key.starts_with(&prefix) {
        return handle_fn(Bytes::copy_from_slice(key));
      }
      // below the prefix range, nothing left to visit
      Ok(key > prefix.as_ref())
    };
    match prefix_upper_bound(&prefix) {
      Some(upper) => self.index.descend_less_or_equal(&upper, &mut handler),
      None => self.index.descend(&mut handler),
    }
  }

  /// Ascending over the keys in `[start, end)`, values are not read.
  pub fn ascend_keys_range<F>(&self, start: Bytes, end: Bytes, mut handle_fn: F) -> Result<()>
  where
    F: FnMut(Bytes) -> Result<bool>,
  {
    let _guard = self.mu.read_recursive();
    self.check_open()?;
    self.index.ascend_range(&start, &end, &mut |key, _| {
      handle_fn(Bytes::copy_from_slice(key))
    })
  }

  /// Descending from `start` (inclusive) down to `end` (exclusive), values
  /// are not read.
  pub fn descend_keys_range<F>(&self, start: Bytes, end: Bytes, mut handle_fn: F) -> Result<()>
  where
    F: FnMut(Bytes) -> Result<bool>,
  {
    let _guard = self.mu.read_recursive();
    self.check_open()?;
    self.index.descend_range(&start, &end, &mut |key, _| {
      handle_fn(Bytes::copy_from_slice(key))
    })
  }

  pub fn list_keys(&self) -> Result<Vec<Bytes>> {
    let mut keys = Vec::with_capacity(self.index.size());
    self.ascend_keys(Bytes::new(), |key| {
      keys.push(key);
      Ok(true)
    })?;
    Ok(keys)
  }

  /// Visits every key and value in order until `f` returns false.
  pub fn fold<F>(&self, f: F) -> Result<()>
  where
    F: Fn(Bytes, Bytes) -> bool,
  {
    self.ascend(|key, value| Ok(f(key, value)))
  }

  /// Queue of changes committed from now on. Every call returns the same
  /// queue, so concurrent consumers share its events.
  pub fn watch(&self) -> Result<Arc<Watcher>> {
    self.check_open()?;
    self.watcher.clone().ok_or(Errors::WatchDisabled)
  }

  pub fn sync(&self) -> Result<()> {
    self.check_open()?;
    self.wal.sync()?;
    self.index.sync()
  }

  pub fn stat(&self) -> Result<Stat> {
    self.check_open()?;
    Ok(Stat {
      key_num: self.index.size(),
      data_file_num: self.wal.segment_count(),
      reclaimable_size: self.reclaim_size.load(Ordering::SeqCst),
      disk_size: util::file::dir_disk_size(&self.options.dir_path),
    })
  }

  /// Flushes and closes the log and the index, then releases the directory
  /// lock. Calling it again is a no-op.
  pub fn close(&self) -> Result<()> {
    let _guard = self.mu.write();
    if self.closed.swap(true, Ordering::SeqCst) {
      return Ok(());
    }

    if let Some(watcher) = &self.watcher {
      watcher.close();
    }
    // every step runs even if an earlier one failed, the first error wins
    let index_res = self.index.close();
    let wal_res = self.wal.close();
    let unlock_res = self.lock_file.unlock().map_err(|e| {
      error!("failed to unlock the database directory: {}", e);
      Errors::FailedToLockDatabase
    });
    index_res.and(wal_res).and(unlock_res)
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  pub(crate) fn check_open(&self) -> Result<()> {
    if self.is_closed() {
      return Err(Errors::DBClosed);
    }
    Ok(())
  }

  /// Reads the value of the record at `pos`.
  pub(crate) fn read_value(&self, pos: &ChunkPosition) -> Result<Bytes> {
    let data = self.wal.read(pos)?;
    let record = LogRecord::decode(&data)?;
    if record.rec_type == LogRecordType::Deleted {
      return Err(Errors::KeyNotFound);
    }
    Ok(Bytes::from(record.value))
  }

  pub(crate) fn add_reclaim_size(&self, size: u64) {
    self.reclaim_size.fetch_add(size, Ordering::SeqCst);
  }
}

impl Drop for Engine {
  fn drop(&mut self) {
    if let Err(e) = self.close() {
      error!("error while closing engine: {}", e);
    }
  }
}

/// Single key operations rely on the log's own sync setting.
fn single_op_options() -> WriteBatchOptions {
  WriteBatchOptions {
    max_batch_num: 1,
    sync_writes: false,
    read_only: false,
  }
}

/// Smallest key greater than every key starting with `prefix`, `None` when
/// no such key exists.
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
  let mut upper = prefix.to_vec();
  while let Some(last) = upper.pop() {
    if last < u8::MAX {
      upper.push(last + 1);
      return Some(upper);
    }
  }
  None
}

fn check_options(opts: &Options) -> Result<()> {
  if opts.dir_path.as_os_str().is_empty() {
    return Err(Errors::DirPathIsEmpty);
  }

  if opts.segment_size == 0 {
    return Err(Errors::DataFileSizeTooSmall);
  }

  if opts.index_type == IndexType::BPlusTree {
    let page_size = opts.bptree_options.page_size;
    if page_size < crate::index::bptree::MIN_PAGE_SIZE || !page_size.is_power_of_two() {
      return Err(Errors::InvalidPageSize);
    }
  }

  Ok(())
}
