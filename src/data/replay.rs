use std::collections::HashMap;

use log::debug;

use crate::{
  errors::Result,
  index::Indexer,
  wal::ChunkPosition,
};

use super::log_record::{
  decode_batch_id, IndexRecord, LogRecord, LogRecordType, MERGED_BATCH_ID,
};

/// Outcome of a replay pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStat {
  pub records: usize,
  pub batches: usize,
  /// Records left behind by batches that never finished.
  pub discarded: usize,
  /// Bytes of records that are no longer referenced by the index.
  pub reclaimable: u64,
}

/// Rebuilds `index` from records in write order.
///
/// Normal and deleted records are held back per batch id and applied when
/// the batch's finish marker shows up. Records rewritten by merge carry
/// [`MERGED_BATCH_ID`] and go straight into the index.
pub fn replay<I>(records: I, index: &dyn Indexer) -> Result<ReplayStat>
where
  I: IntoIterator<Item = Result<(Vec<u8>, ChunkPosition)>>,
{
  let mut pending: HashMap<u64, Vec<IndexRecord>> = HashMap::new();
  let mut stat = ReplayStat::default();

  for item in records {
    let (data, pos) = item?;
    let record = LogRecord::decode(&data)?;
    stat.records += 1;

    match record.rec_type {
      LogRecordType::BatchFinished => {
        let batch_id = decode_batch_id(&record.key)?;
        stat.reclaimable += pos.chunk_size as u64;
        if let Some(records) = pending.remove(&batch_id) {
          for rec in records {
            stat.reclaimable += apply(index, rec)?;
          }
        }
        stat.batches += 1;
      }
      LogRecordType::Normal if record.batch_id == MERGED_BATCH_ID => {
        let rec = IndexRecord {
          key: record.key,
          rec_type: record.rec_type,
          pos,
        };
        stat.reclaimable += apply(index, rec)?;
      }
      _ => pending
        .entry(record.batch_id)
        .or_default()
        .push(IndexRecord {
          key: record.key,
          rec_type: record.rec_type,
          pos,
        }),
    }
  }

  stat.discarded = pending.values().map(|v| v.len()).sum();
  if stat.discarded > 0 {
    debug!(
      "replay dropped {} records of {} unfinished batches",
      stat.discarded,
      pending.len()
    );
  }
  Ok(stat)
}

/// Applies one record, returning the bytes it made dead.
pub(crate) fn apply(index: &dyn Indexer, rec: IndexRecord) -> Result<u64> {
  match rec.rec_type {
    LogRecordType::Normal => Ok(
      index
        .put(rec.key, rec.pos)?
        .map_or(0, |old| old.chunk_size as u64),
    ),
    LogRecordType::Deleted => {
      let old = index.delete(&rec.key)?.map_or(0, |old| old.chunk_size as u64);
      Ok(old + rec.pos.chunk_size as u64)
    }
    LogRecordType::BatchFinished => Ok(0),
  }
}
