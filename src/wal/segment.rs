use std::{
  num::NonZeroUsize,
  path::{Path, PathBuf},
  sync::Arc,
};

use log::warn;
use lru::LruCache;
use parking_lot::Mutex;

use crate::{
  errors::{Errors, Result},
  fio::{new_io_manager, IOManager},
  option::IOManagerType,
};

use super::ChunkPosition;

pub const BLOCK_SIZE: u64 = 32 * 1024;

/// crc32(4) + length(2) + type(1)
pub const CHUNK_HEADER_SIZE: u64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkType {
  Full = 0,
  First = 1,
  Middle = 2,
  Last = 3,
}

impl ChunkType {
  fn from_u8(v: u8) -> Option<Self> {
    match v {
      0 => Some(ChunkType::Full),
      1 => Some(ChunkType::First),
      2 => Some(ChunkType::Middle),
      3 => Some(ChunkType::Last),
      _ => None,
    }
  }
}

/// LRU of full (immutable) blocks shared by every segment of one log.
pub(crate) struct BlockCache {
  blocks: Mutex<LruCache<u64, Arc<Vec<u8>>>>,
}

impl BlockCache {
  /// Returns `None` when `cache_bytes` is smaller than a single block.
  pub(crate) fn new(cache_bytes: u64) -> Option<Self> {
    let capacity = NonZeroUsize::new((cache_bytes / BLOCK_SIZE) as usize)?;
    Some(Self {
      blocks: Mutex::new(LruCache::new(capacity)),
    })
  }

  fn key(segment_id: u32, block_number: u32) -> u64 {
    ((segment_id as u64) << 32) | block_number as u64
  }

  fn get(&self, segment_id: u32, block_number: u32) -> Option<Arc<Vec<u8>>> {
    self.blocks.lock().get(&Self::key(segment_id, block_number)).cloned()
  }

  fn put(&self, segment_id: u32, block_number: u32, block: Arc<Vec<u8>>) {
    self
      .blocks
      .lock()
      .put(Self::key(segment_id, block_number), block);
  }
}

#[derive(Debug, Clone, Copy, Default)]
struct BlockCursor {
  block_number: u32,
  block_size: u64,
}

impl BlockCursor {
  fn offset(&self) -> u64 {
    self.block_number as u64 * BLOCK_SIZE + self.block_size
  }
}

pub fn segment_file_name<P>(dir_path: P, ext: &str, id: u32) -> PathBuf
where
  P: AsRef<Path>,
{
  dir_path.as_ref().join(format!("{:09}{}", id, ext))
}

/// One append-only segment file, split into fixed size blocks of chunks.
pub struct Segment {
  id: u32,
  io: Box<dyn IOManager>,
  cursor: Mutex<BlockCursor>,
  cache: Option<Arc<BlockCache>>,
}

impl Segment {
  pub(crate) fn open<P>(
    dir_path: P,
    ext: &str,
    id: u32,
    io_type: IOManagerType,
    cache: Option<Arc<BlockCache>>,
  ) -> Result<Segment>
  where
    P: AsRef<Path>,
  {
    let io = new_io_manager(segment_file_name(dir_path, ext, id), io_type)?;
    let size = io.size();
    Ok(Segment {
      id,
      io,
      cursor: Mutex::new(BlockCursor {
        block_number: (size / BLOCK_SIZE) as u32,
        block_size: size % BLOCK_SIZE,
      }),
      cache,
    })
  }

  pub fn id(&self) -> u32 {
    self.id
  }

  /// Bytes written so far.
  pub fn size(&self) -> u64 {
    self.cursor.lock().offset()
  }

  pub fn sync(&self) -> Result<()> {
    self.io.sync()
  }

  pub(crate) fn write(&self, data: &[u8]) -> Result<ChunkPosition> {
    let mut positions = self.write_all(&[data])?;
    positions.pop().ok_or(Errors::FailedToWriteToDataFile)
  }

  /// Encodes every item into one buffer and appends it with a single write,
  /// the cursor only moves forward when the write succeeded.
  pub(crate) fn write_all<T: AsRef<[u8]>>(&self, items: &[T]) -> Result<Vec<ChunkPosition>> {
    let mut cursor = self.cursor.lock();
    let mut next = *cursor;
    let mut buf = Vec::new();
    let mut positions = Vec::with_capacity(items.len());
    for item in items {
      positions.push(encode_chunks(&mut next, self.id, item.as_ref(), &mut buf));
    }
    self.io.write(&buf)?;
    *cursor = next;
    Ok(positions)
  }

  pub(crate) fn read(&self, block_number: u32, chunk_offset: u64) -> Result<Vec<u8>> {
    self
      .read_internal(block_number, chunk_offset)
      .map(|(data, _, _)| data)
  }

  /// Reads the record starting at the given block/offset and returns it with
  /// the block/offset right after it.
  fn read_internal(&self, block_number: u32, chunk_offset: u64) -> Result<(Vec<u8>, u32, u64)> {
    let segment_size = self.io.size();
    let mut result = Vec::new();
    let mut block_number = block_number;
    let mut offset = chunk_offset;

    loop {
      let block = self.read_block(block_number, segment_size)?;
      let block_len = block.len() as u64;
      if offset + CHUNK_HEADER_SIZE > block_len {
        return Err(Errors::ReadDataFileEOF);
      }

      let header = &block[offset as usize..(offset + CHUNK_HEADER_SIZE) as usize];
      let length = u16::from_le_bytes([header[4], header[5]]) as u64;
      let start = offset + CHUNK_HEADER_SIZE;
      let end = start + length;
      if end > block_len {
        return Err(Errors::ReadDataFileEOF);
      }

      let payload = &block[start as usize..end as usize];
      let mut hasher = crc32fast::Hasher::new();
      hasher.update(&header[4..]);
      hasher.update(payload);
      let crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
      if hasher.finalize() != crc {
        return Err(Errors::InvalidLogRecordCrc);
      }
      result.extend_from_slice(payload);

      match ChunkType::from_u8(header[6]) {
        Some(ChunkType::Full) | Some(ChunkType::Last) => return Ok((result, block_number, end)),
        Some(_) => {
          block_number += 1;
          offset = 0;
        }
        None => return Err(Errors::LogRecordCorrupted),
      }
    }
  }

  fn read_block(&self, block_number: u32, segment_size: u64) -> Result<Arc<Vec<u8>>> {
    let offset = block_number as u64 * BLOCK_SIZE;
    if offset >= segment_size {
      return Err(Errors::ReadDataFileEOF);
    }
    let size = (segment_size - offset).min(BLOCK_SIZE);
    let cacheable = size == BLOCK_SIZE;

    if cacheable {
      if let Some(block) = self.cache.as_ref().and_then(|c| c.get(self.id, block_number)) {
        return Ok(block);
      }
    }

    let mut buf = vec![0u8; size as usize];
    self.io.read(&mut buf, offset)?;
    let block = Arc::new(buf);
    if cacheable {
      if let Some(cache) = self.cache.as_ref() {
        cache.put(self.id, block_number, block.clone());
      }
    }
    Ok(block)
  }

  /// True when the file ends with a partially written record.
  pub(crate) fn has_torn_tail(self: &Arc<Self>) -> Result<bool> {
    let mut reader = SegmentReader::new(self.clone());
    while reader.next()?.is_some() {}
    Ok(reader.valid_end < self.io.size())
  }
}

fn append_chunk(buf: &mut Vec<u8>, data: &[u8], chunk_type: ChunkType) {
  let mut header = [0u8; CHUNK_HEADER_SIZE as usize];
  header[4..6].copy_from_slice(&(data.len() as u16).to_le_bytes());
  header[6] = chunk_type as u8;

  let mut hasher = crc32fast::Hasher::new();
  hasher.update(&header[4..]);
  hasher.update(data);
  header[..4].copy_from_slice(&hasher.finalize().to_le_bytes());

  buf.extend_from_slice(&header);
  buf.extend_from_slice(data);
}

fn encode_chunks(cursor: &mut BlockCursor, segment_id: u32, data: &[u8], buf: &mut Vec<u8>) -> ChunkPosition {
  // not enough room left for a header, pad to the next block
  if cursor.block_size + CHUNK_HEADER_SIZE >= BLOCK_SIZE {
    let padding = BLOCK_SIZE - cursor.block_size;
    buf.resize(buf.len() + padding as usize, 0);
    cursor.block_number += 1;
    cursor.block_size = 0;
  }

  let mut pos = ChunkPosition {
    segment_id,
    block_number: cursor.block_number,
    chunk_offset: cursor.block_size as i64,
    chunk_size: 0,
  };

  let data_size = data.len() as u64;
  if cursor.block_size + data_size + CHUNK_HEADER_SIZE <= BLOCK_SIZE {
    append_chunk(buf, data, ChunkType::Full);
    pos.chunk_size = (data_size + CHUNK_HEADER_SIZE) as u32;
  } else {
    let mut left = data_size;
    let mut block_count = 0;
    let mut current_size = cursor.block_size;
    while left > 0 {
      let chunk_size = (BLOCK_SIZE - current_size - CHUNK_HEADER_SIZE).min(left);
      let start = (data_size - left) as usize;
      let end = start + chunk_size as usize;
      let chunk_type = if left == data_size {
        ChunkType::First
      } else if left == chunk_size {
        ChunkType::Last
      } else {
        ChunkType::Middle
      };
      append_chunk(buf, &data[start..end], chunk_type);

      left -= chunk_size;
      block_count += 1;
      current_size = (current_size + chunk_size + CHUNK_HEADER_SIZE) % BLOCK_SIZE;
    }
    pos.chunk_size = (block_count * CHUNK_HEADER_SIZE + data_size) as u32;
  }

  let end = cursor.block_size + pos.chunk_size as u64;
  cursor.block_number += (end / BLOCK_SIZE) as u32;
  cursor.block_size = end % BLOCK_SIZE;
  pos
}

/// Sequential reader over one segment.
pub struct SegmentReader {
  segment: Arc<Segment>,
  block_number: u32,
  chunk_offset: u64,
  valid_end: u64,
}

impl SegmentReader {
  pub(crate) fn new(segment: Arc<Segment>) -> Self {
    Self {
      segment,
      block_number: 0,
      chunk_offset: 0,
      valid_end: 0,
    }
  }

  /// Returns `Ok(None)` at the end of the segment. A torn tail is treated
  /// as the end, a checksum mismatch is an error.
  pub fn next(&mut self) -> Result<Option<(Vec<u8>, ChunkPosition)>> {
    if BLOCK_SIZE - self.chunk_offset <= CHUNK_HEADER_SIZE {
      self.block_number += 1;
      self.chunk_offset = 0;
    }

    let start = self.block_number as u64 * BLOCK_SIZE + self.chunk_offset;
    if start >= self.segment.io.size() {
      return Ok(None);
    }

    match self
      .segment
      .read_internal(self.block_number, self.chunk_offset)
    {
      Ok((data, next_block, next_offset)) => {
        let end = next_block as u64 * BLOCK_SIZE + next_offset;
        let pos = ChunkPosition {
          segment_id: self.segment.id,
          block_number: self.block_number,
          chunk_offset: self.chunk_offset as i64,
          chunk_size: (end - start) as u32,
        };
        self.block_number = next_block;
        self.chunk_offset = next_offset;
        self.valid_end = end;
        Ok(Some((data, pos)))
      }
      Err(Errors::ReadDataFileEOF) => {
        warn!(
          "segment {} ends with a partially written record at offset {}",
          self.segment.id, start
        );
        self.block_number = u32::MAX;
        self.chunk_offset = 0;
        Ok(None)
      }
      Err(e) => Err(e),
    }
  }
}
