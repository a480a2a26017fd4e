use std::{collections::BTreeMap, ops::Bound, sync::Arc};

use parking_lot::RwLock;

use crate::{errors::Result, wal::ChunkPosition};

use super::{IndexHandler, IndexIterator, Indexer, SnapshotIterator};

type Entries = Vec<(Vec<u8>, ChunkPosition)>;

/// In-memory ordered index on `BTreeMap`.
///
/// Traversals copy the requested range out under the read lock and call the
/// handler without holding it, so the handler may write to the same index.
pub struct BTree {
  tree: Arc<RwLock<BTreeMap<Vec<u8>, ChunkPosition>>>,
}

impl BTree {
  pub fn new() -> Self {
    Self {
      tree: Arc::new(RwLock::new(BTreeMap::new())),
    }
  }

  fn snapshot(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Entries {
    let read_guard = self.tree.read();
    read_guard
      .range::<[u8], _>((lower, upper))
      .map(|(k, v)| (k.clone(), *v))
      .collect()
  }
}

impl Default for BTree {
  fn default() -> Self {
    Self::new()
  }
}

fn walk<I>(entries: I, handle_fn: &mut IndexHandler<'_>) -> Result<()>
where
  I: Iterator<Item = (Vec<u8>, ChunkPosition)>,
{
  for (key, pos) in entries {
    if !handle_fn(&key, pos)? {
      break;
    }
  }
  Ok(())
}

impl Indexer for BTree {
  fn put(&self, key: Vec<u8>, pos: ChunkPosition) -> Result<Option<ChunkPosition>> {
    let mut write_guard = self.tree.write();
    Ok(write_guard.insert(key, pos))
  }

  fn get(&self, key: &[u8]) -> Result<Option<ChunkPosition>> {
    let read_guard = self.tree.read();
    Ok(read_guard.get(key).copied())
  }

  fn delete(&self, key: &[u8]) -> Result<Option<ChunkPosition>> {
    let mut write_guard = self.tree.write();
    Ok(write_guard.remove(key))
  }

  fn size(&self) -> usize {
    self.tree.read().len()
  }

  fn ascend(&self, handle_fn: &mut IndexHandler<'_>) -> Result<()> {
    walk(
      self.snapshot(Bound::Unbounded, Bound::Unbounded).into_iter(),
      handle_fn,
    )
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
    walk(
      self
        .snapshot(Bound::Included(start), Bound::Excluded(end))
        .into_iter(),
      handle_fn,
    )
  }

  fn ascend_greater_or_equal(&self, key: &[u8], handle_fn: &mut IndexHandler<'_>) -> Result<()> {
    walk(
      self.snapshot(Bound::Included(key), Bound::Unbounded).into_iter(),
      handle_fn,
    )
  }

  fn descend(&self, handle_fn: &mut IndexHandler<'_>) -> Result<()> {
    walk(
      self
        .snapshot(Bound::Unbounded, Bound::Unbounded)
        .into_iter()
        .rev(),
      handle_fn,
    )
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
    walk(
      self
        .snapshot(Bound::Excluded(end), Bound::Included(start))
        .into_iter()
        .rev(),
      handle_fn,
    )
  }

  fn descend_less_or_equal(&self, key: &[u8], handle_fn: &mut IndexHandler<'_>) -> Result<()> {
    walk(
      self
        .snapshot(Bound::Unbounded, Bound::Included(key))
        .into_iter()
        .rev(),
      handle_fn,
    )
  }

  fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator + '_> {
    Box::new(SnapshotIterator::new(
      self.snapshot(Bound::Unbounded, Bound::Unbounded),
      reverse,
    ))
  }
}
