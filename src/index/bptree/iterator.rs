use log::error;

use crate::{errors::Result, wal::ChunkPosition};

use super::{
  page::{Node, INVALID_PAGE_ID},
  search, BPlusTree, TreeState,
};
use crate::index::IndexIterator;

/// Cursor walking the leaf level through the sibling links. The tree lock is
/// taken per step, so writes may interleave between steps.
pub struct BPTreeIterator<'a> {
  tree: &'a BPlusTree,
  current: Option<Node>,
  index: usize,
  reverse: bool,
}

impl<'a> BPTreeIterator<'a> {
  pub(super) fn new(tree: &'a BPlusTree, reverse: bool) -> Self {
    Self {
      tree,
      current: None,
      index: 0,
      reverse,
    }
  }

  pub fn try_rewind(&mut self) -> Result<()> {
    let tree = self.tree;
    let state = tree.state.read();
    self.current = None;

    let mut node = state.get_node(state.meta.root_page_id)?;
    while !node.is_leaf() {
      let child = if self.reverse {
        node.children.last().copied()
      } else {
        node.children.first().copied()
      };
      match child {
        Some(page_id) => node = state.get_node(page_id)?,
        None => return Ok(()),
      }
    }

    if self.reverse {
      let last = node.keys.len().checked_sub(1);
      self.settle_backward(&state, node, last)
    } else {
      self.settle_forward(&state, node, 0)
    }
  }

  pub fn try_seek(&mut self, key: &[u8]) -> Result<()> {
    let tree = self.tree;
    let state = tree.state.read();
    self.current = None;

    let leaf = state.find_leaf(key)?;
    let found = search(&leaf.keys, key);
    if self.reverse {
      let idx = match found {
        Ok(i) => Some(i),
        Err(i) => i.checked_sub(1),
      };
      self.settle_backward(&state, leaf, idx)
    } else {
      let idx = found.unwrap_or_else(|i| i);
      self.settle_forward(&state, leaf, idx)
    }
  }

  pub fn try_next(&mut self) -> Result<()> {
    let Some(node) = self.current.take() else {
      return Ok(());
    };
    let tree = self.tree;
    let state = tree.state.read();
    if self.reverse {
      let idx = self.index.checked_sub(1);
      self.settle_backward(&state, node, idx)
    } else {
      let idx = self.index + 1;
      self.settle_forward(&state, node, idx)
    }
  }

  /// Positions on `idx` of `node`, or the first entry of the following
  /// non-empty leaf.
  fn settle_forward(&mut self, state: &TreeState, mut node: Node, mut idx: usize) -> Result<()> {
    loop {
      if idx < node.keys.len() {
        self.current = Some(node);
        self.index = idx;
        return Ok(());
      }
      if node.next == INVALID_PAGE_ID {
        self.current = None;
        return Ok(());
      }
      node = state.get_node(node.next)?;
      idx = 0;
    }
  }

  fn settle_backward(
    &mut self,
    state: &TreeState,
    mut node: Node,
    mut idx: Option<usize>,
  ) -> Result<()> {
    loop {
      if let Some(i) = idx.filter(|i| *i < node.keys.len()) {
        self.current = Some(node);
        self.index = i;
        return Ok(());
      }
      if node.prev == INVALID_PAGE_ID {
        self.current = None;
        return Ok(());
      }
      node = state.get_node(node.prev)?;
      idx = node.keys.len().checked_sub(1);
    }
  }
}

impl IndexIterator for BPTreeIterator<'_> {
  fn rewind(&mut self) {
    if let Err(e) = self.try_rewind() {
      error!("failed to rewind b+tree iterator: {}", e);
      self.current = None;
    }
  }

  fn seek(&mut self, key: &[u8]) {
    if let Err(e) = self.try_seek(key) {
      error!("failed to seek b+tree iterator: {}", e);
      self.current = None;
    }
  }

  fn next(&mut self) {
    if let Err(e) = self.try_next() {
      error!("failed to advance b+tree iterator: {}", e);
      self.current = None;
    }
  }

  fn valid(&self) -> bool {
    self.current.is_some()
  }

  fn key(&self) -> &[u8] {
    match &self.current {
      Some(node) => &node.keys[self.index],
      None => &[],
    }
  }

  fn value(&self) -> ChunkPosition {
    match &self.current {
      Some(node) => node.values[self.index],
      None => ChunkPosition::default(),
    }
  }
}
