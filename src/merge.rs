use std::{
  fs,
  path::{Path, PathBuf},
  sync::atomic::{AtomicBool, Ordering},
};

use log::{error, info, warn};

use crate::{
  data::log_record::{
    decode_hint_record, decode_merge_fin_record, encode_hint_record, encode_merge_fin_record,
    LogRecord, LogRecordType, MERGED_BATCH_ID,
  },
  db::{Engine, SEGMENT_FILE_EXT},
  errors::{Errors, Result},
  option::IOManagerType,
  util,
  wal::{segment_file_name, Wal, WalOptions, INITIAL_SEGMENT_ID},
};

pub const HINT_FILE_EXT: &str = ".HINT";
pub const MERGE_FIN_FILE_EXT: &str = ".MERGEFIN";
const MERGE_DIR_SUFFIX: &str = "merge";

/// Clears the running flag when the merge returns, whatever the outcome.
struct MergeFlag<'a>(&'a AtomicBool);

impl Drop for MergeFlag<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

impl Engine {
  /// Rewrites the live records of every sealed segment into a sibling merge
  /// directory. The result replaces the original segments the next time the
  /// engine is opened; until then the engine keeps serving the originals.
  ///
  /// Writes and reads are only blocked while the active segment is rotated.
  /// Calling it while the same thread holds a writable batch deadlocks.
  pub fn merge(&self) -> Result<()> {
    if self
      .merge_running
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      return Err(Errors::MergeRunning);
    }
    let _flag = MergeFlag(&self.merge_running);

    let high_water = {
      let _guard = self.mu.write();
      self.check_open()?;
      if self.wal.is_empty() {
        return Ok(());
      }

      let stat = self.stat()?;
      let live_size = stat.disk_size.saturating_sub(stat.reclaimable_size);
      if live_size >= util::file::available_disk_space(&self.options.dir_path) {
        return Err(Errors::MergeNoEnoughSpace);
      }

      let high_water = self.wal.active_segment_id();
      self.wal.open_new_active_segment()?;
      high_water
    };
    info!("merge started, compacting segments up to {}", high_water);

    let merge_path = merge_dir_path(&self.options.dir_path);
    remove_merge_dir(&merge_path)?;

    let merged_max = self.rewrite_live_records(&merge_path, high_water)?;

    // the marker makes the merge directory authoritative
    self.check_open()?;
    let fin = Wal::open(satellite_wal_options(&merge_path, MERGE_FIN_FILE_EXT))?;
    fin.write(&encode_merge_fin_record(high_water, merged_max))?;
    fin.close()?;

    info!(
      "merge finished, segments 1..={} compacted into {} segments",
      high_water, merged_max
    );
    Ok(())
  }

  /// Copies every record the index still points at into the merge directory,
  /// returning the id of the last merged segment.
  fn rewrite_live_records(&self, merge_path: &Path, high_water: u32) -> Result<u32> {
    let merged = Wal::open(WalOptions {
      segment_size: self.options.segment_size,
      ..satellite_wal_options(merge_path, SEGMENT_FILE_EXT)
    })?;
    let hint = Wal::open(satellite_wal_options(merge_path, HINT_FILE_EXT))?;

    let (mut scanned, mut kept) = (0u64, 0u64);
    for item in self.wal.reader_with_max(high_water) {
      let (data, pos) = item?;
      scanned += 1;

      let mut record = LogRecord::decode(&data)?;
      if record.rec_type != LogRecordType::Normal {
        continue;
      }
      let live = matches!(self.index.get(&record.key)?, Some(cur) if cur.same_record(&pos));
      if !live {
        continue;
      }

      record.batch_id = MERGED_BATCH_ID;
      let new_pos = merged.write(&record.encode())?;
      hint.write(&encode_hint_record(&record.key, &new_pos))?;
      kept += 1;
    }

    merged.close()?;
    hint.close()?;
    info!("merge kept {} of {} records", kept, scanned);

    let merged_max = merged.active_segment_id();
    if merged_max > high_water {
      error!(
        "merge produced {} segments out of {}, giving up",
        merged_max, high_water
      );
      return Err(Errors::FailedToMoveMergeFile);
    }
    Ok(merged_max)
  }

  /// Loads the hint log left by the last installed merge, returning the last
  /// segment id it covers.
  pub(crate) fn load_index_from_hint_file(&self) -> Result<Option<u32>> {
    let dir_path = &self.options.dir_path;
    let Some((high_water, _)) = read_merge_fin(dir_path)? else {
      return Ok(None);
    };
    if !segment_file_name(dir_path, HINT_FILE_EXT, INITIAL_SEGMENT_ID).is_file() {
      warn!("merge marker found without hint file, replaying every segment");
      return Ok(None);
    }

    let hint = Wal::open(satellite_wal_options(dir_path, HINT_FILE_EXT))?;
    let mut count = 0;
    for item in hint.reader() {
      let (data, _) = item?;
      let (key, pos) = decode_hint_record(&data)?;
      self.index.put(key, pos)?;
      count += 1;
    }
    hint.close()?;

    info!(
      "loaded {} keys from hint file, merged up to segment {}",
      count, high_water
    );
    Ok(Some(high_water))
  }
}

/// Options of the single-segment logs used for hints and the merge marker.
fn satellite_wal_options(dir_path: &Path, ext: &str) -> WalOptions {
  WalOptions {
    dir_path: dir_path.to_path_buf(),
    segment_size: u64::MAX,
    segment_file_ext: ext.to_string(),
    sync: false,
    bytes_per_sync: 0,
    block_cache: 0,
    io_type: IOManagerType::StandardFileIO,
  }
}

fn merge_dir_path(dir_path: &Path) -> PathBuf {
  let name = dir_path
    .file_name()
    .map(|name| name.to_string_lossy().into_owned())
    .unwrap_or_default();
  dir_path.with_file_name(format!("{}-{}", name, MERGE_DIR_SUFFIX))
}

fn remove_merge_dir(merge_path: &Path) -> Result<()> {
  if !merge_path.is_dir() {
    return Ok(());
  }
  if let Err(e) = fs::remove_dir_all(merge_path) {
    error!("failed to remove merge dir {:?}: {}", merge_path, e);
    return Err(Errors::FailedToRemoveMergeDir);
  }
  Ok(())
}

fn move_file(src: &Path, dst: &Path) -> Result<()> {
  if let Err(e) = fs::rename(src, dst) {
    error!("failed to move {:?} to {:?}: {}", src, dst, e);
    return Err(Errors::FailedToMoveMergeFile);
  }
  Ok(())
}

/// Reads the merge marker in `dir_path`, `None` if absent or never completed.
fn read_merge_fin(dir_path: &Path) -> Result<Option<(u32, u32)>> {
  if !segment_file_name(dir_path, MERGE_FIN_FILE_EXT, INITIAL_SEGMENT_ID).is_file() {
    return Ok(None);
  }
  let fin = Wal::open(satellite_wal_options(dir_path, MERGE_FIN_FILE_EXT))?;
  let record = fin.reader().next().transpose()?;
  fin.close()?;
  match record {
    Some((data, _)) => Ok(Some(decode_merge_fin_record(&data)?)),
    None => Ok(None),
  }
}

/// Installs a finished merge found next to `dir_path`, or discards an
/// unfinished one. Safe to run again after a crash half-way through.
pub(crate) fn load_merge_files<P>(dir_path: P) -> Result<()>
where
  P: AsRef<Path>,
{
  let dir_path = dir_path.as_ref();
  let merge_path = merge_dir_path(dir_path);
  if !merge_path.is_dir() {
    return Ok(());
  }

  let Some((high_water, merged_max)) = read_merge_fin(&merge_path)? else {
    info!("discarding unfinished merge in {:?}", merge_path);
    return remove_merge_dir(&merge_path);
  };

  for id in INITIAL_SEGMENT_ID..=high_water {
    let merged = segment_file_name(&merge_path, SEGMENT_FILE_EXT, id);
    let original = segment_file_name(dir_path, SEGMENT_FILE_EXT, id);
    if merged.is_file() {
      move_file(&merged, &original)?;
    } else if id > merged_max && original.is_file() {
      if let Err(e) = fs::remove_file(&original) {
        error!("failed to remove compacted segment {:?}: {}", original, e);
        return Err(Errors::FailedToMoveMergeFile);
      }
    }
  }

  for ext in [HINT_FILE_EXT, MERGE_FIN_FILE_EXT] {
    let src = segment_file_name(&merge_path, ext, INITIAL_SEGMENT_ID);
    if src.is_file() {
      move_file(&src, &segment_file_name(dir_path, ext, INITIAL_SEGMENT_ID))?;
    }
  }

  info!(
    "installed merge of segments 1..={} into {:?}",
    high_water, dir_path
  );
  remove_merge_dir(&merge_path)
}
