use bytes::Bytes;
use log::error;
use parking_lot::RwLockReadGuard;

use crate::{db::Engine, errors::Result, index::IndexIterator, option::IteratorOptions};

/// Cursor over the live keys of an engine, reading values lazily.
///
/// The cursor holds the engine lock shared for its whole lifetime, so writes
/// wait until it is dropped. Writing from the thread that owns a cursor
/// deadlocks.
pub struct Iterator<'a> {
  index_iter: Box<dyn IndexIterator + 'a>,
  engine: &'a Engine,
  options: IteratorOptions,
  _guard: RwLockReadGuard<'a, ()>,
}

impl Engine {
  /// Creates a cursor positioned at the first key matching the options.
  pub fn iter(&self, options: IteratorOptions) -> Result<Iterator<'_>> {
    let guard = self.mu.read_recursive();
    self.check_open()?;
    let mut iter = Iterator {
      index_iter: self.index.iterator(options.reverse),
      engine: self,
      options,
      _guard: guard,
    };
    iter.rewind();
    Ok(iter)
  }
}

impl Iterator<'_> {
  /// Back to the first key, in the direction of travel.
  pub fn rewind(&mut self) {
    self.index_iter.rewind();
    if !self.options.reverse && !self.options.prefix.is_empty() {
      self.index_iter.seek(&self.options.prefix);
    }
    self.skip_to_next();
  }

  /// Forward: first key >= `key`. Reverse: last key <= `key`.
  pub fn seek(&mut self, key: Vec<u8>) {
    self.index_iter.seek(&key);
    self.skip_to_next();
  }

  /// Returns the current key and value and advances the cursor. A value that
  /// cannot be read is returned as an error, the cursor still moves on.
  pub fn next(&mut self) -> Option<Result<(Bytes, Bytes)>> {
    if !self.index_iter.valid() {
      return None;
    }
    let key = Bytes::copy_from_slice(self.index_iter.key());
    let pos = self.index_iter.value();
    self.index_iter.next();
    self.skip_to_next();

    match self.engine.read_value(&pos) {
      Ok(value) => Some(Ok((key, value))),
      Err(e) => {
        error!("failed to read value of {:?}: {}", key, e);
        Some(Err(e))
      }
    }
  }

  fn skip_to_next(&mut self) {
    let prefix = &self.options.prefix;
    if prefix.is_empty() {
      return;
    }
    while self.index_iter.valid() && !self.index_iter.key().starts_with(prefix) {
      self.index_iter.next();
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{fs::OpenOptions, io::Write, sync::Arc, thread, time::Duration};

  use super::*;
  use crate::{
    db::SEGMENT_FILE_EXT,
    errors::Errors,
    option::{Options, KB},
    wal::segment_file_name,
  };
  use tempfile::tempdir;

  fn open_engine(dir: &std::path::Path) -> Engine {
    Engine::open(Options {
      dir_path: dir.to_path_buf(),
      ..Default::default()
    })
    .unwrap()
  }

  fn collect(iter: &mut Iterator<'_>) -> Vec<Bytes> {
    let mut keys = Vec::new();
    while let Some(item) = iter.next() {
      keys.push(item.unwrap().0);
    }
    keys
  }

  #[test]
  fn test_iterator_empty() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path());
    let mut iter = engine.iter(IteratorOptions::default()).unwrap();
    assert!(iter.next().is_none());
    iter.seek(b"a".to_vec());
    assert!(iter.next().is_none());
  }

  #[test]
  fn test_iterator_forward_and_reverse() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path());
    for key in ["ccde", "aefg", "bbed", "ddfe", "bade"] {
      engine
        .put(Bytes::from(key), Bytes::from(format!("v-{}", key)))
        .unwrap();
    }

    let mut iter = engine.iter(IteratorOptions::default()).unwrap();
    let (key, value) = iter.next().unwrap().unwrap();
    assert_eq!(key, Bytes::from("aefg"));
    assert_eq!(value, Bytes::from("v-aefg"));
    iter.rewind();
    assert_eq!(
      collect(&mut iter),
      vec!["aefg", "bade", "bbed", "ccde", "ddfe"]
    );

    let mut iter = engine
      .iter(IteratorOptions {
        reverse: true,
        ..Default::default()
      })
      .unwrap();
    assert_eq!(
      collect(&mut iter),
      vec!["ddfe", "ccde", "bbed", "bade", "aefg"]
    );
  }

  #[test]
  fn test_iterator_seek() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path());
    for key in ["ccde", "aefg", "bbed", "ddfe"] {
      engine.put(Bytes::from(key), Bytes::from("v")).unwrap();
    }

    let mut iter = engine.iter(IteratorOptions::default()).unwrap();
    iter.seek(b"bc".to_vec());
    assert_eq!(collect(&mut iter), vec!["ccde", "ddfe"]);
    iter.seek(b"zz".to_vec());
    assert!(iter.next().is_none());

    let mut iter = engine
      .iter(IteratorOptions {
        reverse: true,
        ..Default::default()
      })
      .unwrap();
    iter.seek(b"cc".to_vec());
    assert_eq!(collect(&mut iter), vec!["bbed", "aefg"]);
  }

  #[test]
  fn test_iterator_prefix() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path());
    for key in ["aaccc", "bbac", "bbdd", "ccc", "bb"] {
      engine.put(Bytes::from(key), Bytes::from("v")).unwrap();
    }
    engine.delete(Bytes::from("bbdd")).unwrap();

    let mut iter = engine
      .iter(IteratorOptions {
        prefix: b"bb".to_vec(),
        reverse: false,
      })
      .unwrap();
    assert_eq!(collect(&mut iter), vec!["bb", "bbac"]);

    let mut iter = engine
      .iter(IteratorOptions {
        prefix: b"bb".to_vec(),
        reverse: true,
      })
      .unwrap();
    assert_eq!(collect(&mut iter), vec!["bbac", "bb"]);
    iter.rewind();
    assert_eq!(collect(&mut iter), vec!["bbac", "bb"]);
  }

  #[test]
  fn test_iterator_on_closed_engine() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path());
    engine.close().unwrap();
    assert_eq!(
      engine.iter(IteratorOptions::default()).err(),
      Some(Errors::DBClosed)
    );
  }

  #[test]
  fn test_iterator_surfaces_read_errors() {
    let dir = tempdir().unwrap();
    let opts = Options {
      dir_path: dir.path().to_path_buf(),
      mmap_at_startup: false,
      segment_size: 64 * KB,
      ..Default::default()
    };
    let engine = Engine::open(opts).unwrap();
    engine.put(Bytes::from("a"), Bytes::from("v")).unwrap();
    engine.put(Bytes::from("b"), Bytes::from("v")).unwrap();
    engine.sync().unwrap();

    // flip the last byte of the value of "b"
    let path = segment_file_name(dir.path(), SEGMENT_FILE_EXT, 1);
    let mut data = std::fs::read(&path).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xff;
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.write_all(&data).unwrap();
    file.sync_all().unwrap();

    let mut iter = engine.iter(IteratorOptions::default()).unwrap();
    assert_eq!(iter.next().unwrap().unwrap().0, Bytes::from("a"));
    assert_eq!(iter.next().unwrap().err(), Some(Errors::InvalidLogRecordCrc));
    assert!(iter.next().is_none());
  }

  #[test]
  fn test_iterator_blocks_writers() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(open_engine(dir.path()));
    engine.put(Bytes::from("a"), Bytes::from("v")).unwrap();

    let iter = engine.iter(IteratorOptions::default()).unwrap();
    let writer = {
      let engine = engine.clone();
      thread::spawn(move || engine.put(Bytes::from("b"), Bytes::from("v")).unwrap())
    };
    thread::sleep(Duration::from_millis(100));
    assert_eq!(engine.get(Bytes::from("b")), Err(Errors::KeyNotFound));
    drop(iter);

    writer.join().unwrap();
    assert!(engine.get(Bytes::from("b")).is_ok());
  }
}
