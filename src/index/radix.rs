use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::{errors::Result, wal::ChunkPosition};

use super::{IndexHandler, IndexIterator, Indexer, SnapshotIterator};

/// Immutable trie node, shared between tree versions.
#[derive(Clone, Default)]
struct Node {
  /// Edge label leading into this node, empty only for the root.
  prefix: Vec<u8>,
  value: Option<ChunkPosition>,
  /// Sorted by the first byte of their prefix.
  children: Vec<Arc<Node>>,
}

impl Node {
  fn leaf(prefix: &[u8], pos: ChunkPosition) -> Arc<Node> {
    Arc::new(Node {
      prefix: prefix.to_vec(),
      value: Some(pos),
      children: Vec::new(),
    })
  }

  fn find_child(&self, b: u8) -> std::result::Result<usize, usize> {
    self.children.binary_search_by(|c| c.prefix[0].cmp(&b))
  }
}

#[derive(Clone)]
struct Version {
  root: Arc<Node>,
  size: usize,
}

/// Persistent radix tree. Every write builds a new root by path copying,
/// readers grab the current root and work on it without further locking.
pub struct RadixTree {
  current: RwLock<Version>,
  writer: Mutex<()>,
}

impl RadixTree {
  pub fn new() -> Self {
    Self {
      current: RwLock::new(Version {
        root: Arc::new(Node::default()),
        size: 0,
      }),
      writer: Mutex::new(()),
    }
  }

  fn version(&self) -> Version {
    self.current.read().clone()
  }

  fn entries(&self) -> Vec<(Vec<u8>, ChunkPosition)> {
    let version = self.version();
    let mut items = Vec::with_capacity(version.size);
    let mut path = Vec::new();
    // collecting never fails
    let _ = walk_ascend(&version.root, &mut path, None, &mut |k, p| {
      items.push((k.to_vec(), p));
      Ok(true)
    });
    items
  }
}

impl Default for RadixTree {
  fn default() -> Self {
    Self::new()
  }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
  a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Returns a copy of `node` with `key` (relative to the node) set to `pos`.
fn insert(node: &Node, key: &[u8], pos: ChunkPosition) -> (Arc<Node>, Option<ChunkPosition>) {
  let mut new_node = node.clone();
  if key.is_empty() {
    let old = new_node.value.replace(pos);
    return (Arc::new(new_node), old);
  }

  match node.find_child(key[0]) {
    Ok(idx) => {
      let child = &node.children[idx];
      let common = common_prefix_len(&child.prefix, key);
      if common == child.prefix.len() {
        let (new_child, old) = insert(child, &key[common..], pos);
        new_node.children[idx] = new_child;
        return (Arc::new(new_node), old);
      }

      // the key diverges inside the child's edge, split it
      let mut rest = (**child).clone();
      rest.prefix = child.prefix[common..].to_vec();
      let rest = Arc::new(rest);

      let mut split = Node {
        prefix: key[..common].to_vec(),
        value: None,
        children: Vec::with_capacity(2),
      };
      if common == key.len() {
        split.value = Some(pos);
        split.children.push(rest);
      } else {
        let leaf = Node::leaf(&key[common..], pos);
        if rest.prefix[0] < leaf.prefix[0] {
          split.children.push(rest);
          split.children.push(leaf);
        } else {
          split.children.push(leaf);
          split.children.push(rest);
        }
      }
      new_node.children[idx] = Arc::new(split);
      (Arc::new(new_node), None)
    }
    Err(idx) => {
      new_node.children.insert(idx, Node::leaf(key, pos));
      (Arc::new(new_node), None)
    }
  }
}

/// Returns the replacement for `node` after removing `key`, `None` inside the
/// outer option when the key was absent.
fn remove(
  node: &Node,
  key: &[u8],
  is_root: bool,
) -> Option<(Option<Arc<Node>>, ChunkPosition)> {
  let mut new_node = node.clone();
  let old = if key.is_empty() {
    new_node.value.take()?
  } else {
    let idx = node.find_child(key[0]).ok()?;
    let child = &node.children[idx];
    if !key.starts_with(&child.prefix) {
      return None;
    }
    let (replacement, old) = remove(child, &key[child.prefix.len()..], false)?;
    match replacement {
      Some(c) => new_node.children[idx] = c,
      None => {
        new_node.children.remove(idx);
      }
    }
    old
  };

  if is_root {
    return Some((Some(Arc::new(new_node)), old));
  }
  Some((compact(new_node), old))
}

/// Drops valueless leaves and folds a valueless node into its only child.
fn compact(mut node: Node) -> Option<Arc<Node>> {
  if node.value.is_some() {
    return Some(Arc::new(node));
  }
  match node.children.len() {
    0 => None,
    1 => {
      let child = &node.children[0];
      let mut merged = (**child).clone();
      node.prefix.extend_from_slice(&child.prefix);
      merged.prefix = node.prefix;
      Some(Arc::new(merged))
    }
    _ => Some(Arc::new(node)),
  }
}

fn lookup(root: &Node, key: &[u8]) -> Option<ChunkPosition> {
  let mut node = root;
  let mut rest = key;
  loop {
    if rest.is_empty() {
      return node.value;
    }
    let idx = node.find_child(rest[0]).ok()?;
    let child = &node.children[idx];
    if !rest.starts_with(&child.prefix) {
      return None;
    }
    rest = &rest[child.prefix.len()..];
    node = child;
  }
}

/// In-order walk skipping keys below `lower`. Returns `Ok(false)` once the
/// handler asked to stop.
fn walk_ascend(
  node: &Node,
  path: &mut Vec<u8>,
  lower: Option<&[u8]>,
  handle_fn: &mut IndexHandler<'_>,
) -> Result<bool> {
  let mark = path.len();
  path.extend_from_slice(&node.prefix);

  let mut keep_going = true;
  // every key below this node starts with `path`
  let below = lower.is_some_and(|lo| path.as_slice() < lo && !lo.starts_with(path.as_slice()));
  if !below {
    if let Some(pos) = node.value {
      if lower.map_or(true, |lo| path.as_slice() >= lo) {
        keep_going = handle_fn(path.as_slice(), pos)?;
      }
    }
    if keep_going {
      for child in node.children.iter() {
        if !walk_ascend(child, path, lower, handle_fn)? {
          keep_going = false;
          break;
        }
      }
    }
  }

  path.truncate(mark);
  Ok(keep_going)
}

/// Reverse in-order walk skipping keys above `upper`.
fn walk_descend(
  node: &Node,
  path: &mut Vec<u8>,
  upper: Option<&[u8]>,
  handle_fn: &mut IndexHandler<'_>,
) -> Result<bool> {
  let mark = path.len();
  path.extend_from_slice(&node.prefix);

  let mut keep_going = true;
  let above = upper.is_some_and(|up| path.as_slice() > up);
  if !above {
    for child in node.children.iter().rev() {
      if !walk_descend(child, path, upper, handle_fn)? {
        keep_going = false;
        break;
      }
    }
    if keep_going {
      if let Some(pos) = node.value {
        keep_going = handle_fn(path.as_slice(), pos)?;
      }
    }
  }

  path.truncate(mark);
  Ok(keep_going)
}

impl Indexer for RadixTree {
  fn put(&self, key: Vec<u8>, pos: ChunkPosition) -> Result<Option<ChunkPosition>> {
    let _writer = self.writer.lock();
    let version = self.version();
    let (root, old) = insert(&version.root, &key, pos);
    let size = if old.is_none() {
      version.size + 1
    } else {
      version.size
    };
    *self.current.write() = Version { root, size };
    Ok(old)
  }

  fn get(&self, key: &[u8]) -> Result<Option<ChunkPosition>> {
    let version = self.version();
    Ok(lookup(&version.root, key))
  }

  fn delete(&self, key: &[u8]) -> Result<Option<ChunkPosition>> {
    let _writer = self.writer.lock();
    let version = self.version();
    match remove(&version.root, key, true) {
      Some((Some(root), old)) => {
        *self.current.write() = Version {
          root,
          size: version.size - 1,
        };
        Ok(Some(old))
      }
      _ => Ok(None),
    }
  }

  fn size(&self) -> usize {
    self.current.read().size
  }

  fn ascend(&self, handle_fn: &mut IndexHandler<'_>) -> Result<()> {
    let version = self.version();
    walk_ascend(&version.root, &mut Vec::new(), None, handle_fn).map(|_| ())
  }

  fn ascend_range(
    &self,
    start: &[u8],
    end: &[u8],
    handle_fn: &mut IndexHandler<'_>,
  ) -> Result<()> {
    let version = self.version();
    walk_ascend(&version.root, &mut Vec::new(), Some(start), &mut |k, p| {
      if k >= end {
        return Ok(false);
      }
      handle_fn(k, p)
    })
    .map(|_| ())
  }

  fn ascend_greater_or_equal(&self, key: &[u8], handle_fn: &mut IndexHandler<'_>) -> Result<()> {
    let version = self.version();
    walk_ascend(&version.root, &mut Vec::new(), Some(key), handle_fn).map(|_| ())
  }

  fn descend(&self, handle_fn: &mut IndexHandler<'_>) -> Result<()> {
    let version = self.version();
    walk_descend(&version.root, &mut Vec::new(), None, handle_fn).map(|_| ())
  }

  fn descend_range(
    &self,
    start: &[u8],
    end: &[u8],
    handle_fn: &mut IndexHandler<'_>,
  ) -> Result<()> {
    let version = self.version();
    walk_descend(&version.root, &mut Vec::new(), Some(start), &mut |k, p| {
      if k <= end {
        return Ok(false);
      }
      handle_fn(k, p)
    })
    .map(|_| ())
  }

  fn descend_less_or_equal(&self, key: &[u8], handle_fn: &mut IndexHandler<'_>) -> Result<()> {
    let version = self.version();
    walk_descend(&version.root, &mut Vec::new(), Some(key), handle_fn).map(|_| ())
  }

  fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator + '_> {
    Box::new(SnapshotIterator::new(self.entries(), reverse))
  }
}
