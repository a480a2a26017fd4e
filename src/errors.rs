use std::result;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Errors {
  #[error("the key is empty")]
  KeyIsEmpty,

  #[error("key not found in database")]
  KeyNotFound,

  #[error("the database directory is used by another process")]
  DatabaseIsUsing,

  #[error("the batch is read only")]
  ReadOnlyBatch,

  #[error("the batch is committed")]
  BatchCommitted,

  #[error("the batch is rollbacked")]
  BatchRollbacked,

  #[error("exceed the max batch num")]
  ExceedMaxBatchNum,

  #[error("the database is closed")]
  DBClosed,

  #[error("merge is in progress, try again later")]
  MergeRunning,

  #[error("not enough disk space for merge")]
  MergeNoEnoughSpace,

  #[error("watch is disabled, set a watch queue size")]
  WatchDisabled,

  #[error("invalid magic number")]
  InvalidMagic,

  #[error("unsupported version")]
  InvalidVersion,

  #[error("invalid page")]
  InvalidPage,

  #[error("key is too large")]
  KeyTooLarge,

  #[error("database dir path can not be empty")]
  DirPathIsEmpty,

  #[error("database data file size must be greater than 0")]
  DataFileSizeTooSmall,

  #[error("page size must be a power of two and at least 256 bytes")]
  InvalidPageSize,

  #[error("b+tree order leaves no room for keys in a page")]
  InvalidOrder,

  #[error("failed to create the database directory")]
  FailedToCreateDatabaseDir,

  #[error("failed to read the database directory")]
  FailedToReadDatabaseDir,

  #[error("failed to lock the database directory")]
  FailedToLockDatabase,

  #[error("failed to open data file")]
  FailedToOpenDataFile,

  #[error("failed to read from data file")]
  FailedToReadFromDataFile,

  #[error("failed to write to data file")]
  FailedToWriteToDataFile,

  #[error("failed to sync data file")]
  FailedToSyncDataFile,

  #[error("failed to remove the merge directory")]
  FailedToRemoveMergeDir,

  #[error("failed to move merged files into the database directory")]
  FailedToMoveMergeFile,

  #[error("read data file eof")]
  ReadDataFileEOF,

  #[error("invalid crc value, log record maybe corrupted")]
  InvalidLogRecordCrc,

  #[error("log record is corrupted")]
  LogRecordCorrupted,

  #[error("record is larger than the segment size")]
  RecordTooLarge,

  #[error("the segment log is closed")]
  SegmentClosed,
}

pub type Result<T> = result::Result<T, Errors>;
