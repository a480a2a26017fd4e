use std::{ops::Bound, sync::Arc};

use crossbeam_skiplist::SkipMap;

use crate::{errors::Result, wal::ChunkPosition};

use super::{IndexHandler, IndexIterator, Indexer, SnapshotIterator};

/// Lock-free in-memory index on a concurrent skip list.
pub struct SkipList {
  skl: Arc<SkipMap<Vec<u8>, ChunkPosition>>,
}

impl SkipList {
  pub fn new() -> Self {
    Self {
      skl: Arc::new(SkipMap::new()),
    }
  }
}

impl Default for SkipList {
  fn default() -> Self {
    Self::new()
  }
}

impl Indexer for SkipList {
  fn put(&self, key: Vec<u8>, pos: ChunkPosition) -> Result<Option<ChunkPosition>> {
    let mut result = None;
    if let Some(entry) = self.skl.get(&key) {
      result = Some(*entry.value());
    }
    self.skl.insert(key, pos);
    Ok(result)
  }

  fn get(&self, key: &[u8]) -> Result<Option<ChunkPosition>> {
    Ok(self.skl.get(key).map(|entry| *entry.value()))
  }

  fn delete(&self, key: &[u8]) -> Result<Option<ChunkPosition>> {
    Ok(self.skl.remove(key).map(|entry| *entry.value()))
  }

  fn size(&self) -> usize {
    self.skl.len()
  }

  fn ascend(&self, handle_fn: &mut IndexHandler<'_>) -> Result<()> {
    for entry in self.skl.iter() {
      if !handle_fn(entry.key(), *entry.value())? {
        break;
      }
    }
    Ok(())
  }

  fn ascend_range(
    &self,
    start: &[u8],
    end: &[u8],
    handle_fn: &mut IndexHandler<'_>,
  ) -> Result<()> {
    if start >= end {
      return Ok(());
    }
    let range = (Bound::Included(start), Bound::Excluded(end));
    for entry in self.skl.range::<[u8], _>(range) {
      if !handle_fn(entry.key(), *entry.value())? {
        break;
      }
    }
    Ok(())
  }

  fn ascend_greater_or_equal(&self, key: &[u8], handle_fn: &mut IndexHandler<'_>) -> Result<()> {
    let range = (Bound::Included(key), Bound::Unbounded);
    for entry in self.skl.range::<[u8], _>(range) {
      if !handle_fn(entry.key(), *entry.value())? {
        break;
      }
    }
    Ok(())
  }

  fn descend(&self, handle_fn: &mut IndexHandler<'_>) -> Result<()> {
    for entry in self.skl.iter().rev() {
      if !handle_fn(entry.key(), *entry.value())? {
        break;
      }
    }
    Ok(())
  }

  fn descend_range(
    &self,
    start: &[u8],
    end: &[u8],
    handle_fn: &mut IndexHandler<'_>,
  ) -> Result<()> {
    if end >= start {
      return Ok(());
    }
    let range = (Bound::Excluded(end), Bound::Included(start));
    for entry in self.skl.range::<[u8], _>(range).rev() {
      if !handle_fn(entry.key(), *entry.value())? {
        break;
      }
    }
    Ok(())
  }

  fn descend_less_or_equal(&self, key: &[u8], handle_fn: &mut IndexHandler<'_>) -> Result<()> {
    let range = (Bound::Unbounded, Bound::Included(key));
    for entry in self.skl.range::<[u8], _>(range).rev() {
      if !handle_fn(entry.key(), *entry.value())? {
        break;
      }
    }
    Ok(())
  }

  fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator + '_> {
    let items = self
      .skl
      .iter()
      .map(|entry| (entry.key().clone(), *entry.value()))
      .collect();
    Box::new(SnapshotIterator::new(items, reverse))
  }
}
