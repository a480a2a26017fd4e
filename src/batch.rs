use std::collections::HashMap;

use bytes::Bytes;
use log::debug;
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use time::OffsetDateTime;

use crate::{
  data::{
    log_record::{IndexRecord, LogRecord, LogRecordType},
    replay,
  },
  db::Engine,
  errors::{Errors, Result},
  option::WriteBatchOptions,
  watch::Event,
};

/// Source of batch ids. Ids must never repeat within a log and never be 0,
/// which marks records rewritten by merge.
pub trait BatchIdGenerator: Send + Sync {
  fn next_id(&self) -> u64;
}

/// 2024-01-01T00:00:00Z in milliseconds.
const EPOCH_MILLIS: i128 = 1_704_067_200_000;
const NODE_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// Snowflake style ids: 41 bits of milliseconds, 10 bits of node id and a
/// 12 bit sequence. Ids keep growing even if the clock steps back.
pub struct SnowflakeIdGenerator {
  node_id: u64,
  state: Mutex<SnowflakeState>,
}

#[derive(Default)]
struct SnowflakeState {
  last_millis: u64,
  sequence: u64,
}

impl SnowflakeIdGenerator {
  pub fn new(node_id: u16) -> Self {
    Self {
      node_id: node_id as u64 & ((1 << NODE_BITS) - 1),
      state: Mutex::new(SnowflakeState::default()),
    }
  }

  fn current_millis() -> u64 {
    let now = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    (now - EPOCH_MILLIS).max(1) as u64
  }
}

impl Default for SnowflakeIdGenerator {
  fn default() -> Self {
    Self::new(1)
  }
}

impl BatchIdGenerator for SnowflakeIdGenerator {
  fn next_id(&self) -> u64 {
    let mut state = self.state.lock();
    let mut millis = Self::current_millis().max(state.last_millis);
    if millis == state.last_millis {
      state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
      if state.sequence == 0 {
        millis += 1;
      }
    } else {
      state.sequence = 0;
    }
    state.last_millis = millis;
    (millis << (NODE_BITS + SEQUENCE_BITS)) | (self.node_id << SEQUENCE_BITS) | state.sequence
  }
}

enum BatchGuard<'a> {
  Read(#[allow(dead_code)] RwLockReadGuard<'a, ()>),
  Write(#[allow(dead_code)] RwLockWriteGuard<'a, ()>),
}

/// Buffered writes committed atomically.
///
/// A batch holds the engine lock until it is committed, rolled back or
/// dropped: exclusively for a writable batch, shared for a read-only one.
/// Using the engine's own point operations from the thread that owns a
/// writable batch therefore deadlocks, go through the batch instead.
pub struct WriteBatch<'a> {
  pending_writes: HashMap<Vec<u8>, LogRecord>,
  engine: &'a Engine,
  options: WriteBatchOptions,
  guard: Option<BatchGuard<'a>>,
  committed: bool,
  rollbacked: bool,
}

impl Engine {
  pub fn new_write_batch(&self, options: WriteBatchOptions) -> Result<WriteBatch> {
    let guard = if options.read_only {
      BatchGuard::Read(self.mu.read())
    } else {
      BatchGuard::Write(self.mu.write())
    };
    self.check_open()?;

    Ok(WriteBatch {
      pending_writes: HashMap::new(),
      engine: self,
      options,
      guard: Some(guard),
      committed: false,
      rollbacked: false,
    })
  }
}

impl WriteBatch<'_> {
  pub fn put(&mut self, key: Bytes, value: Bytes) -> Result<()> {
    self.check_writable(&key)?;
    // keys the index cannot hold must never reach the log
    if let Some(max) = self.engine.index.max_key_size() {
      if key.len() > max {
        return Err(Errors::KeyTooLarge);
      }
    }

    if !self.pending_writes.contains_key(key.as_ref())
      && self.pending_writes.len() >= self.options.max_batch_num
    {
      return Err(Errors::ExceedMaxBatchNum);
    }

    let record = LogRecord::normal(key.to_vec(), value.to_vec());
    self.pending_writes.insert(key.to_vec(), record);
    Ok(())
  }

  /// Buffers a tombstone. A key the engine does not hold only loses its
  /// pending write, nothing is logged for it.
  pub fn delete(&mut self, key: Bytes) -> Result<()> {
    self.check_writable(&key)?;

    if self.engine.index.get(&key)?.is_none() {
      self.pending_writes.remove(key.as_ref());
      return Ok(());
    }

    if !self.pending_writes.contains_key(key.as_ref())
      && self.pending_writes.len() >= self.options.max_batch_num
    {
      return Err(Errors::ExceedMaxBatchNum);
    }

    let record = LogRecord::deleted(key.to_vec());
    self.pending_writes.insert(key.to_vec(), record);
    Ok(())
  }

  /// Reads through the pending writes first, then the engine.
  pub fn get(&self, key: Bytes) -> Result<Bytes> {
    if key.is_empty() {
      return Err(Errors::KeyIsEmpty);
    }
    self.engine.check_open()?;

    if let Some(record) = self.pending_writes.get(key.as_ref()) {
      if record.rec_type == LogRecordType::Deleted {
        return Err(Errors::KeyNotFound);
      }
      return Ok(Bytes::from(record.value.clone()));
    }

    match self.engine.index.get(&key)? {
      Some(pos) => self.engine.read_value(&pos),
      None => Err(Errors::KeyNotFound),
    }
  }

  pub fn exist(&self, key: Bytes) -> Result<bool> {
    if key.is_empty() {
      return Err(Errors::KeyIsEmpty);
    }
    self.engine.check_open()?;

    if let Some(record) = self.pending_writes.get(key.as_ref()) {
      return Ok(record.rec_type != LogRecordType::Deleted);
    }
    Ok(self.engine.index.get(&key)?.is_some())
  }

  /// Logs the pending writes followed by a finish marker, then applies them
  /// to the index and releases the engine lock.
  pub fn commit(&mut self) -> Result<()> {
    self.check_finished()?;
    self.engine.check_open()?;

    if self.options.read_only || self.pending_writes.is_empty() {
      self.finish(true);
      return Ok(());
    }

    let batch_id = self.engine.id_generator.next_id();
    let records: Vec<LogRecord> = std::mem::take(&mut self.pending_writes)
      .into_values()
      .map(|mut record| {
        record.batch_id = batch_id;
        record
      })
      .collect();

    let mut encoded: Vec<Vec<u8>> = records.iter().map(|r| r.encode()).collect();
    encoded.push(LogRecord::batch_finished(batch_id).encode());

    let positions = match self.engine.wal.write_all(&encoded) {
      Ok(positions) => positions,
      Err(e) => {
        // keep the writes so the caller can retry or roll back
        self.pending_writes = records.into_iter().map(|r| (r.key.clone(), r)).collect();
        return Err(e);
      }
    };

    if self.options.sync_writes && !self.engine.options.sync_writes {
      self.engine.wal.sync()?;
    }

    let mut events = Vec::new();
    if self.engine.watcher.is_some() {
      events = records.iter().map(Event::from_record).collect();
    }

    let mut reclaimable = positions.last().map_or(0, |p| p.chunk_size as u64);
    for (record, pos) in records.into_iter().zip(positions) {
      let index_record = IndexRecord {
        key: record.key,
        rec_type: record.rec_type,
        pos,
      };
      reclaimable += replay::apply(self.engine.index.as_ref(), index_record)?;
    }
    self.engine.add_reclaim_size(reclaimable);
    if let Some(watcher) = &self.engine.watcher {
      watcher.put_events(events);
    }

    debug!("batch {} committed", batch_id);
    self.finish(true);
    Ok(())
  }

  /// Drops the pending writes and releases the engine lock.
  pub fn rollback(&mut self) -> Result<()> {
    self.check_finished()?;
    self.pending_writes.clear();
    self.finish(false);
    Ok(())
  }

  fn finish(&mut self, committed: bool) {
    if committed {
      self.committed = true;
    } else {
      self.rollbacked = true;
    }
    self.guard = None;
  }

  fn check_finished(&self) -> Result<()> {
    if self.committed {
      return Err(Errors::BatchCommitted);
    }
    if self.rollbacked {
      return Err(Errors::BatchRollbacked);
    }
    Ok(())
  }

  fn check_writable(&self, key: &Bytes) -> Result<()> {
    if key.is_empty() {
      return Err(Errors::KeyIsEmpty);
    }
    self.check_finished()?;
    self.engine.check_open()?;
    if self.options.read_only {
      return Err(Errors::ReadOnlyBatch);
    }
    Ok(())
  }
}
