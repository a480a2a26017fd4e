//! Segmented append-only log.
//!
//! Every durable write of the engine ends up here. A log is a directory of
//! segment files `{id:09}{ext}`; only the segment with the largest id is
//! appended to, all the others are sealed. Records are addressed by a
//! [`ChunkPosition`].

pub mod segment;

use std::{
  collections::BTreeMap,
  fs,
  path::PathBuf,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use log::{error, warn};
use parking_lot::RwLock;

use crate::{
  errors::{Errors, Result},
  option::IOManagerType,
};

use self::segment::{BlockCache, Segment, SegmentReader, BLOCK_SIZE, CHUNK_HEADER_SIZE};

pub use self::segment::segment_file_name;

pub const INITIAL_SEGMENT_ID: u32 = 1;

/// Locator of a record inside the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkPosition {
  pub segment_id: u32,
  pub block_number: u32,
  /// Offset of the first chunk inside its block.
  pub chunk_offset: i64,
  /// Total bytes of the record on disk, chunk headers included.
  pub chunk_size: u32,
}

impl ChunkPosition {
  /// Two positions point at the same record, the size is not compared.
  pub fn same_record(&self, other: &ChunkPosition) -> bool {
    self.segment_id == other.segment_id
      && self.block_number == other.block_number
      && self.chunk_offset == other.chunk_offset
  }
}

#[derive(Debug, Clone)]
pub struct WalOptions {
  pub dir_path: PathBuf,
  pub segment_size: u64,
  pub segment_file_ext: String,
  pub sync: bool,
  pub bytes_per_sync: u64,
  pub block_cache: u64,
  /// I/O used for sealed segments found on open.
  pub io_type: IOManagerType,
}

struct WalInner {
  active: Arc<Segment>,
  older: BTreeMap<u32, Arc<Segment>>,
  bytes_write: u64,
}

pub struct Wal {
  options: WalOptions,
  inner: RwLock<WalInner>,
  block_cache: Option<Arc<BlockCache>>,
  closed: AtomicBool,
}

/// Upper bound of the bytes `size` data bytes occupy on disk.
fn max_write_size(size: u64) -> u64 {
  size + (size / BLOCK_SIZE + 2) * CHUNK_HEADER_SIZE + CHUNK_HEADER_SIZE
}

impl Wal {
  pub fn open(options: WalOptions) -> Result<Wal> {
    if let Err(e) = fs::create_dir_all(&options.dir_path) {
      error!("failed to create log directory: {}", e);
      return Err(Errors::FailedToCreateDatabaseDir);
    }

    let dir = match fs::read_dir(&options.dir_path) {
      Ok(dir) => dir,
      Err(e) => {
        error!("failed to read log directory: {}", e);
        return Err(Errors::FailedToReadDatabaseDir);
      }
    };

    let mut segment_ids = Vec::new();
    for entry in dir.flatten() {
      let file_name = entry.file_name();
      let Some(name) = file_name.to_str() else {
        continue;
      };
      if let Some(prefix) = name.strip_suffix(options.segment_file_ext.as_str()) {
        match prefix.parse::<u32>() {
          Ok(id) => segment_ids.push(id),
          Err(_) => warn!("skip unrecognized file {} in log directory", name),
        }
      }
    }
    segment_ids.sort_unstable();

    let block_cache = BlockCache::new(options.block_cache).map(Arc::new);
    let ext = options.segment_file_ext.as_str();
    let mut older = BTreeMap::new();
    let active = match segment_ids.pop() {
      None => Arc::new(Segment::open(
        &options.dir_path,
        ext,
        INITIAL_SEGMENT_ID,
        IOManagerType::StandardFileIO,
        block_cache.clone(),
      )?),
      Some(active_id) => {
        for id in segment_ids {
          let segment = Segment::open(&options.dir_path, ext, id, options.io_type, block_cache.clone())?;
          older.insert(id, Arc::new(segment));
        }
        let active = Arc::new(Segment::open(
          &options.dir_path,
          ext,
          active_id,
          IOManagerType::StandardFileIO,
          block_cache.clone(),
        )?);

        // never append behind a partially written record
        if active.has_torn_tail()? {
          warn!("segment {} has a torn tail, sealing it", active_id);
          let next = Arc::new(Segment::open(
            &options.dir_path,
            ext,
            active_id + 1,
            IOManagerType::StandardFileIO,
            block_cache.clone(),
          )?);
          older.insert(active_id, active);
          next
        } else {
          active
        }
      }
    };

    Ok(Wal {
      options,
      inner: RwLock::new(WalInner {
        active,
        older,
        bytes_write: 0,
      }),
      block_cache,
      closed: AtomicBool::new(false),
    })
  }

  pub fn write(&self, data: &[u8]) -> Result<ChunkPosition> {
    let mut positions = self.write_all(&[data])?;
    positions.pop().ok_or(Errors::FailedToWriteToDataFile)
  }

  /// Writes all items into the same segment with a single file write.
  pub fn write_all<T: AsRef<[u8]>>(&self, items: &[T]) -> Result<Vec<ChunkPosition>> {
    if self.closed.load(Ordering::SeqCst) {
      return Err(Errors::SegmentClosed);
    }

    let total: u64 = items
      .iter()
      .map(|item| max_write_size(item.as_ref().len() as u64))
      .sum();
    if total > self.options.segment_size {
      return Err(Errors::RecordTooLarge);
    }

    let mut inner = self.inner.write();
    if inner.active.size() + total > self.options.segment_size {
      self.rotate(&mut inner)?;
    }

    let positions = inner.active.write_all(items)?;
    inner.bytes_write += positions.iter().map(|p| p.chunk_size as u64).sum::<u64>();

    let need_sync = self.options.sync
      || (self.options.bytes_per_sync > 0 && inner.bytes_write >= self.options.bytes_per_sync);
    if need_sync {
      inner.active.sync()?;
      inner.bytes_write = 0;
    }
    Ok(positions)
  }

  pub fn read(&self, pos: &ChunkPosition) -> Result<Vec<u8>> {
    let segment = {
      let inner = self.inner.read();
      if inner.active.id() == pos.segment_id {
        inner.active.clone()
      } else {
        match inner.older.get(&pos.segment_id) {
          Some(segment) => segment.clone(),
          None => {
            error!("segment {} not found", pos.segment_id);
            return Err(Errors::FailedToReadFromDataFile);
          }
        }
      }
    };
    segment.read(pos.block_number, pos.chunk_offset as u64)
  }

  /// Reader over every segment in write order.
  pub fn reader(&self) -> WalReader {
    self.reader_range(0, u32::MAX)
  }

  /// Reader over the segments whose id is <= `max_segment_id`.
  pub fn reader_with_max(&self, max_segment_id: u32) -> WalReader {
    self.reader_range(0, max_segment_id)
  }

  /// Reader over the segments whose id is >= `min_segment_id`.
  pub fn reader_from(&self, min_segment_id: u32) -> WalReader {
    self.reader_range(min_segment_id, u32::MAX)
  }

  fn reader_range(&self, min: u32, max: u32) -> WalReader {
    let inner = self.inner.read();
    let mut readers: Vec<SegmentReader> = inner
      .older
      .range(min..=max)
      .map(|(_, seg)| SegmentReader::new(seg.clone()))
      .collect();
    let active_id = inner.active.id();
    if active_id >= min && active_id <= max {
      readers.push(SegmentReader::new(inner.active.clone()));
    }
    WalReader {
      readers,
      current: 0,
    }
  }

  pub fn active_segment_id(&self) -> u32 {
    self.inner.read().active.id()
  }

  pub fn segment_count(&self) -> usize {
    self.inner.read().older.len() + 1
  }

  /// Seals the active segment and starts a new one.
  pub fn open_new_active_segment(&self) -> Result<()> {
    let mut inner = self.inner.write();
    self.rotate(&mut inner)
  }

  pub fn is_empty(&self) -> bool {
    let inner = self.inner.read();
    inner.older.is_empty() && inner.active.size() == 0
  }

  pub fn sync(&self) -> Result<()> {
    self.inner.read().active.sync()
  }

  pub fn close(&self) -> Result<()> {
    if self.closed.swap(true, Ordering::SeqCst) {
      return Ok(());
    }
    self.sync()
  }

  fn rotate(&self, inner: &mut WalInner) -> Result<()> {
    inner.active.sync()?;
    let next = Arc::new(Segment::open(
      &self.options.dir_path,
      &self.options.segment_file_ext,
      inner.active.id() + 1,
      IOManagerType::StandardFileIO,
      self.block_cache.clone(),
    )?);
    let sealed = std::mem::replace(&mut inner.active, next);
    inner.older.insert(sealed.id(), sealed);
    inner.bytes_write = 0;
    Ok(())
  }
}

/// Sequential reader over a fixed set of segments, yields records in write order.
pub struct WalReader {
  readers: Vec<SegmentReader>,
  current: usize,
}

impl Iterator for WalReader {
  type Item = Result<(Vec<u8>, ChunkPosition)>;

  fn next(&mut self) -> Option<Self::Item> {
    while let Some(reader) = self.readers.get_mut(self.current) {
      match reader.next() {
        Ok(Some(item)) => return Some(Ok(item)),
        Ok(None) => self.current += 1,
        Err(e) => {
          self.current = self.readers.len();
          return Some(Err(e));
        }
      }
    }
    None
  }
}
