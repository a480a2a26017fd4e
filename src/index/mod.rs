pub mod bptree;
pub mod btree;
pub mod radix;
pub mod skiplist;

use std::path::Path;

use crate::{
  errors::Result,
  option::{BPTreeOptions, IndexType},
  wal::ChunkPosition,
};

/// Callback used by the ordered traversals, returning `Ok(false)` stops the walk.
pub type IndexHandler<'a> = dyn FnMut(&[u8], ChunkPosition) -> Result<bool> + 'a;

/// Ordered map from key to the position of its live record in the log.
pub trait Indexer: Sync + Send {
  /// Stores the position of a key, returning the previous one.
  fn put(&self, key: Vec<u8>, pos: ChunkPosition) -> Result<Option<ChunkPosition>>;

  fn get(&self, key: &[u8]) -> Result<Option<ChunkPosition>>;

  /// Removes a key, returning its position if it was present.
  fn delete(&self, key: &[u8]) -> Result<Option<ChunkPosition>>;

  fn size(&self) -> usize;

  /// Longest key the backend can store, `None` when unbounded.
  fn max_key_size(&self) -> Option<usize> {
    None
  }

  fn ascend(&self, handle_fn: &mut IndexHandler<'_>) -> Result<()>;

  /// Walks `[start, end)` in ascending order.
  fn ascend_range(&self, start: &[u8], end: &[u8], handle_fn: &mut IndexHandler<'_>)
    -> Result<()>;

  fn ascend_greater_or_equal(&self, key: &[u8], handle_fn: &mut IndexHandler<'_>) -> Result<()>;

  fn descend(&self, handle_fn: &mut IndexHandler<'_>) -> Result<()>;

  /// Walks from `start` (inclusive) down to `end` (exclusive).
  fn descend_range(
    &self,
    start: &[u8],
    end: &[u8],
    handle_fn: &mut IndexHandler<'_>,
  ) -> Result<()>;

  fn descend_less_or_equal(&self, key: &[u8], handle_fn: &mut IndexHandler<'_>) -> Result<()>;

  fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator + '_>;

  fn sync(&self) -> Result<()> {
    Ok(())
  }

  fn close(&self) -> Result<()> {
    Ok(())
  }
}

/// Creates the index backend selected by `index_type`.
pub fn new_indexer<P>(
  index_type: IndexType,
  dir_path: P,
  bptree_options: BPTreeOptions,
) -> Result<Box<dyn Indexer>>
where
  P: AsRef<Path>,
{
  Ok(match index_type {
    IndexType::BTree => Box::new(btree::BTree::new()),
    IndexType::Radix => Box::new(radix::RadixTree::new()),
    IndexType::SkipList => Box::new(skiplist::SkipList::new()),
    IndexType::BPlusTree => Box::new(bptree::BPlusTree::create(
      dir_path.as_ref().join(bptree::BPTREE_INDEX_FILE_NAME),
      bptree_options,
    )?),
  })
}

/// Cursor over an index.
pub trait IndexIterator: Send {
  /// Moves back to the first entry.
  fn rewind(&mut self);

  /// Forward: first key >= `key`. Reverse: last key <= `key`.
  fn seek(&mut self, key: &[u8]);

  fn next(&mut self);

  fn valid(&self) -> bool;

  /// Only meaningful while `valid()`.
  fn key(&self) -> &[u8];

  fn value(&self) -> ChunkPosition;
}

/// Iterator over entries copied out of an in-memory index, sorted in the
/// direction of travel.
pub(crate) struct SnapshotIterator {
  items: Vec<(Vec<u8>, ChunkPosition)>,
  curr_index: usize,
  reverse: bool,
}

impl SnapshotIterator {
  /// `items` must be sorted ascending, they are reversed here when needed.
  pub(crate) fn new(mut items: Vec<(Vec<u8>, ChunkPosition)>, reverse: bool) -> Self {
    if reverse {
      items.reverse();
    }
    Self {
      items,
      curr_index: 0,
      reverse,
    }
  }
}

impl IndexIterator for SnapshotIterator {
  fn rewind(&mut self) {
    self.curr_index = 0;
  }

  fn seek(&mut self, key: &[u8]) {
    self.curr_index = if self.reverse {
      self.items.partition_point(|(k, _)| k.as_slice() > key)
    } else {
      self.items.partition_point(|(k, _)| k.as_slice() < key)
    };
  }

  fn next(&mut self) {
    if self.curr_index < self.items.len() {
      self.curr_index += 1;
    }
  }

  fn valid(&self) -> bool {
    self.curr_index < self.items.len()
  }

  fn key(&self) -> &[u8] {
    self
      .items
      .get(self.curr_index)
      .map(|(k, _)| k.as_slice())
      .unwrap_or_default()
  }

  fn value(&self) -> ChunkPosition {
    self
      .items
      .get(self.curr_index)
      .map(|(_, pos)| *pos)
      .unwrap_or_default()
  }
}
