use bytes::{Buf, BufMut, BytesMut};
use derive_more::Display;
use prost::encoding::{decode_varint, encode_varint};

use crate::{
  errors::{Errors, Result},
  wal::ChunkPosition,
};

/// type(1) + batch id(10) + key size(5) + value size(5)
pub const MAX_LOG_RECORD_HEADER_SIZE: usize = 1 + 10 + 5 + 5;

/// Batch id carried by records rewritten by merge, they need no finish marker.
pub const MERGED_BATCH_ID: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LogRecordType {
  Normal = 0,

  Deleted = 1,

  BatchFinished = 2,
}

impl LogRecordType {
  pub fn from_u8(v: u8) -> Option<Self> {
    match v {
      0 => Some(LogRecordType::Normal),
      1 => Some(LogRecordType::Deleted),
      2 => Some(LogRecordType::BatchFinished),
      _ => None,
    }
  }
}

/// A single entry of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
  pub key: Vec<u8>,
  pub value: Vec<u8>,
  pub rec_type: LogRecordType,
  pub batch_id: u64,
}

/// Key, type and position of a record seen during replay, kept until the
/// batch it belongs to is resolved.
#[derive(Debug, Clone)]
pub struct IndexRecord {
  pub key: Vec<u8>,
  pub rec_type: LogRecordType,
  pub pos: ChunkPosition,
}

impl LogRecord {
  pub fn normal(key: Vec<u8>, value: Vec<u8>) -> Self {
    Self {
      key,
      value,
      rec_type: LogRecordType::Normal,
      batch_id: 0,
    }
  }

  pub fn deleted(key: Vec<u8>) -> Self {
    Self {
      key,
      value: Vec::new(),
      rec_type: LogRecordType::Deleted,
      batch_id: 0,
    }
  }

  /// Terminal record of a batch, keyed by the encoded batch id.
  pub fn batch_finished(batch_id: u64) -> Self {
    Self {
      key: encode_batch_id(batch_id),
      value: Vec::new(),
      rec_type: LogRecordType::BatchFinished,
      batch_id,
    }
  }

  // +--------+-------------+-------------+--------------+--------+--------+
  // |  type  |   batch id  |   key size  |  value size  |  key   | value  |
  // +--------+-------------+-------------+--------------+--------+--------+
  //   1 byte  varint(max 10) varint(max 5) varint(max 5)
  pub fn encode(&self) -> Vec<u8> {
    let mut buf =
      BytesMut::with_capacity(MAX_LOG_RECORD_HEADER_SIZE + self.key.len() + self.value.len());
    buf.put_u8(self.rec_type as u8);
    encode_varint(self.batch_id, &mut buf);
    encode_varint(self.key.len() as u64, &mut buf);
    encode_varint(self.value.len() as u64, &mut buf);
    buf.extend_from_slice(&self.key);
    buf.extend_from_slice(&self.value);
    buf.to_vec()
  }

  pub fn decode(data: &[u8]) -> Result<LogRecord> {
    let mut buf = data;
    if !buf.has_remaining() {
      return Err(Errors::LogRecordCorrupted);
    }
    let rec_type = LogRecordType::from_u8(buf.get_u8()).ok_or(Errors::LogRecordCorrupted)?;
    let batch_id = decode_varint(&mut buf).map_err(|_| Errors::LogRecordCorrupted)?;
    let key_size = decode_size(&mut buf)?;
    let value_size = decode_size(&mut buf)?;

    let total = key_size
      .checked_add(value_size)
      .ok_or(Errors::LogRecordCorrupted)?;
    if buf.remaining() < total {
      return Err(Errors::LogRecordCorrupted);
    }

    Ok(LogRecord {
      key: buf[..key_size].to_vec(),
      value: buf[key_size..total].to_vec(),
      rec_type,
      batch_id,
    })
  }
}

fn decode_size(buf: &mut &[u8]) -> Result<usize> {
  let size = decode_varint(buf).map_err(|_| Errors::LogRecordCorrupted)?;
  usize::try_from(size).map_err(|_| Errors::LogRecordCorrupted)
}

pub fn encode_batch_id(batch_id: u64) -> Vec<u8> {
  batch_id.to_be_bytes().to_vec()
}

pub fn decode_batch_id(buf: &[u8]) -> Result<u64> {
  let bytes: [u8; 8] = buf.try_into().map_err(|_| Errors::LogRecordCorrupted)?;
  Ok(u64::from_be_bytes(bytes))
}

// +------------+--------------+--------------+------------+-------+
// | segment id | block number | chunk offset | chunk size |  key  |
// +------------+--------------+--------------+------------+-------+
//    uvarint       uvarint        uvarint        uvarint
pub fn encode_hint_record(key: &[u8], pos: &ChunkPosition) -> Vec<u8> {
  let mut buf = BytesMut::with_capacity(25 + key.len());
  encode_varint(pos.segment_id as u64, &mut buf);
  encode_varint(pos.block_number as u64, &mut buf);
  encode_varint(pos.chunk_offset as u64, &mut buf);
  encode_varint(pos.chunk_size as u64, &mut buf);
  buf.extend_from_slice(key);
  buf.to_vec()
}

pub fn decode_hint_record(data: &[u8]) -> Result<(Vec<u8>, ChunkPosition)> {
  let mut buf = data;
  let mut next = || decode_varint(&mut buf).map_err(|_| Errors::LogRecordCorrupted);
  let segment_id = next()? as u32;
  let block_number = next()? as u32;
  let chunk_offset = next()? as i64;
  let chunk_size = next()? as u32;
  Ok((
    buf.to_vec(),
    ChunkPosition {
      segment_id,
      block_number,
      chunk_offset,
      chunk_size,
    },
  ))
}

/// `[high water segment id: u32 LE][last merged segment id: u32 LE]`
pub fn encode_merge_fin_record(high_water_segment_id: u32, merged_segment_id: u32) -> Vec<u8> {
  let mut buf = BytesMut::with_capacity(8);
  buf.put_u32_le(high_water_segment_id);
  buf.put_u32_le(merged_segment_id);
  buf.to_vec()
}

pub fn decode_merge_fin_record(data: &[u8]) -> Result<(u32, u32)> {
  let mut buf = data;
  if buf.remaining() < 8 {
    return Err(Errors::LogRecordCorrupted);
  }
  Ok((buf.get_u32_le(), buf.get_u32_le()))
}
