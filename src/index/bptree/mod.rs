//! On-disk B+Tree index.
//!
//! The file is a sequence of fixed size pages: page 0 holds the [`MetaPage`],
//! every other page is a tree node or the free list. Nodes link to each other
//! by page id only, decoded copies live in a [`PageCache`] and modified pages
//! are written back on eviction or flush.
//!
//! Lock order is tree state, then page cache, then the file.

mod cache;
mod freelist;
mod iterator;
mod page;

use std::{
  fs::{self, File, OpenOptions},
  os::unix::fs::FileExt,
  path::Path,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use log::{error, info};
use parking_lot::{Mutex, RwLock};

use crate::{
  errors::{Errors, Result},
  option::BPTreeOptions,
  wal::ChunkPosition,
};

pub use cache::PageCache;
pub use freelist::FreeList;
pub use iterator::BPTreeIterator;
pub use page::{MetaPage, Node, PageType};

use page::{INVALID_PAGE_ID, META_PAGE_ID, META_PAGE_SIZE, NODE_HEADER_SIZE};

use super::{IndexHandler, IndexIterator, Indexer};

pub const BPTREE_INDEX_FILE_NAME: &str = "bptree.index";

pub const MIN_PAGE_SIZE: u32 = 256;

/// Default order for a page size when none is configured.
pub fn calculate_order(page_size: usize) -> usize {
  (page_size.saturating_sub(NODE_HEADER_SIZE) / 100).max(4)
}

/// Largest key for which a full node of `order - 1` entries still fits a page.
fn max_key_size(page_size: usize, order: usize) -> usize {
  let body = page_size.saturating_sub(NODE_HEADER_SIZE);
  let slots = order.saturating_sub(1).max(1);
  let leaf = (body / slots).saturating_sub(2 + page::CHUNK_POSITION_SIZE);
  let internal = (body.saturating_sub(4) / slots).saturating_sub(2 + 4);
  leaf.min(internal).min(u16::MAX as usize)
}

fn check_page_size(page_size: u32) -> Result<()> {
  if page_size < MIN_PAGE_SIZE || !page_size.is_power_of_two() {
    return Err(Errors::InvalidPageSize);
  }
  Ok(())
}

/// Raw page I/O on the tree file.
struct Pager {
  file: Mutex<File>,
  page_size: usize,
}

impl Pager {
  fn read_page(&self, page_id: u32) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; self.page_size];
    let file = self.file.lock();
    if let Err(e) = file.read_exact_at(&mut buf, page_id as u64 * self.page_size as u64) {
      error!("failed to read b+tree page {}: {}", page_id, e);
      if e.kind() == std::io::ErrorKind::UnexpectedEof {
        return Err(Errors::InvalidPage);
      }
      return Err(Errors::FailedToReadFromDataFile);
    }
    Ok(buf)
  }

  fn write_page(&self, page_id: u32, data: &[u8]) -> Result<()> {
    let mut page;
    let data = if data.len() < self.page_size {
      page = data.to_vec();
      page.resize(self.page_size, 0);
      &page[..]
    } else {
      data
    };

    let file = self.file.lock();
    if let Err(e) = file.write_all_at(data, page_id as u64 * self.page_size as u64) {
      error!("failed to write b+tree page {}: {}", page_id, e);
      return Err(Errors::FailedToWriteToDataFile);
    }
    Ok(())
  }

  fn sync(&self) -> Result<()> {
    if let Err(e) = self.file.lock().sync_all() {
      error!("failed to sync b+tree file: {}", e);
      return Err(Errors::FailedToSyncDataFile);
    }
    Ok(())
  }
}

struct TreeState {
  meta: MetaPage,
  freelist: FreeList,
  cache: PageCache,
  pager: Arc<Pager>,
  order: usize,
  max_key_size: usize,
  sync_writes: bool,
}

/// Disk based B+Tree mapping keys to chunk positions.
pub struct BPlusTree {
  state: RwLock<TreeState>,
  closed: AtomicBool,
}

impl BPlusTree {
  /// Opens the tree stored at `path`, initializing an empty file.
  pub fn open<P>(path: P, options: BPTreeOptions) -> Result<Self>
  where
    P: AsRef<Path>,
  {
    check_page_size(options.page_size)?;

    let file = match OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(path.as_ref())
    {
      Ok(f) => f,
      Err(e) => {
        error!("failed to open b+tree file {:?}: {}", path.as_ref(), e);
        return Err(Errors::FailedToOpenDataFile);
      }
    };
    let file_size = match file.metadata() {
      Ok(m) => m.len(),
      Err(e) => {
        error!("failed to stat b+tree file: {}", e);
        return Err(Errors::FailedToOpenDataFile);
      }
    };

    let (meta, fresh) = if file_size == 0 {
      (MetaPage::new(options.page_size), true)
    } else {
      let mut header = [0u8; META_PAGE_SIZE];
      if let Err(e) = file.read_exact_at(&mut header, 0) {
        error!("failed to read b+tree meta page: {}", e);
        return Err(Errors::InvalidPage);
      }
      let meta = MetaPage::deserialize(&header)?;
      check_page_size(meta.page_size)?;
      (meta, false)
    };

    let page_size = meta.page_size as usize;
    let order = match options.order {
      0 => calculate_order(page_size),
      n => n,
    };
    let max_key_size = max_key_size(page_size, order);
    if order < 3 || order > u16::MAX as usize || max_key_size == 0 {
      return Err(Errors::InvalidOrder);
    }

    let pager = Arc::new(Pager {
      file: Mutex::new(file),
      page_size,
    });
    let flush_pager = pager.clone();
    let cache = PageCache::new(
      options.cache_size,
      page_size,
      Box::new(move |page_id, data| flush_pager.write_page(page_id, data)),
    );

    let mut state = TreeState {
      meta,
      freelist: FreeList::new(),
      cache,
      pager,
      order,
      max_key_size,
      sync_writes: options.sync_writes,
    };

    if fresh {
      state.cache.put_dirty(Node::new_leaf(state.meta.root_page_id))?;
      state.flush(options.sync_writes)?;
    } else if state.meta.free_list_page != INVALID_PAGE_ID {
      let data = state.pager.read_page(state.meta.free_list_page)?;
      state.freelist = FreeList::deserialize(&data);
    }

    info!(
      "b+tree opened, {} keys in {} pages, page size {}, order {}",
      state.meta.key_count, state.meta.page_count, page_size, order
    );

    Ok(Self {
      state: RwLock::new(state),
      closed: AtomicBool::new(false),
    })
  }

  /// Opens the tree on a fresh file, discarding whatever `path` held.
  pub fn create<P>(path: P, options: BPTreeOptions) -> Result<Self>
  where
    P: AsRef<Path>,
  {
    if path.as_ref().is_file() {
      if let Err(e) = fs::remove_file(path.as_ref()) {
        error!("failed to remove old b+tree file: {}", e);
        return Err(Errors::FailedToOpenDataFile);
      }
    }
    Self::open(path, options)
  }

  pub fn order(&self) -> usize {
    self.state.read().order
  }

  /// Forward or reverse cursor positioned on the first entry.
  pub fn iter(&self, reverse: bool) -> Result<BPTreeIterator<'_>> {
    let mut it = BPTreeIterator::new(self, reverse);
    it.try_rewind()?;
    Ok(it)
  }

  fn scan(
    &self,
    reverse: bool,
    from: Option<&[u8]>,
    handle_fn: &mut IndexHandler<'_>,
  ) -> Result<()> {
    let mut it = BPTreeIterator::new(self, reverse);
    match from {
      Some(key) => it.try_seek(key)?,
      None => it.try_rewind()?,
    }
    while it.valid() {
      if !handle_fn(it.key(), it.value())? {
        break;
      }
      it.try_next()?;
    }
    Ok(())
  }
}

impl TreeState {
  fn get_node(&self, page_id: u32) -> Result<Node> {
    if let Some(node) = self.cache.get(page_id) {
      return Ok(node);
    }
    if page_id == META_PAGE_ID || page_id >= self.meta.page_count {
      return Err(Errors::InvalidPage);
    }

    let data = self.pager.read_page(page_id)?;
    let node = Node::deserialize(page_id, &data)?;
    self.cache.put(node.clone())?;
    Ok(node)
  }

  /// Descends to the leaf that holds or would hold `key`.
  fn find_leaf(&self, key: &[u8]) -> Result<Node> {
    let mut node = self.get_node(self.meta.root_page_id)?;
    while !node.is_leaf() {
      let idx = find_child_index(&node, key);
      let child = *node.children.get(idx).ok_or(Errors::InvalidPage)?;
      node = self.get_node(child)?;
    }
    Ok(node)
  }

  fn allocate_page(&mut self) -> u32 {
    if let Some(page_id) = self.freelist.allocate() {
      return page_id;
    }
    let page_id = self.meta.page_count;
    self.meta.page_count += 1;
    page_id
  }

  fn insert(&mut self, key: Vec<u8>, pos: ChunkPosition) -> Result<Option<ChunkPosition>> {
    let mut leaf = self.find_leaf(&key)?;
    match search(&leaf.keys, &key) {
      Ok(idx) => {
        let old = std::mem::replace(&mut leaf.values[idx], pos);
        self.cache.put_dirty(leaf)?;
        Ok(Some(old))
      }
      Err(idx) => {
        leaf.keys.insert(idx, key);
        leaf.values.insert(idx, pos);
        self.meta.key_count += 1;
        if leaf.keys.len() >= self.order {
          self.split_leaf(leaf)?;
        } else {
          self.cache.put_dirty(leaf)?;
        }
        Ok(None)
      }
    }
  }

  /// Removes the key in place. Underfull nodes are not rebalanced, a leaf
  /// that becomes empty is unlinked when its parent has another child.
  fn remove(&mut self, key: &[u8]) -> Result<Option<ChunkPosition>> {
    let mut leaf = self.find_leaf(key)?;
    match search(&leaf.keys, key) {
      Ok(idx) => {
        leaf.keys.remove(idx);
        let old = leaf.values.remove(idx);
        self.meta.key_count -= 1;
        if leaf.keys.is_empty() && leaf.parent != INVALID_PAGE_ID {
          self.release_empty_leaf(leaf)?;
        } else {
          self.cache.put_dirty(leaf)?;
        }
        Ok(Some(old))
      }
      Err(_) => Ok(None),
    }
  }

  /// Drops an empty leaf from its parent and the sibling chain and hands its
  /// page to the free list.
  fn release_empty_leaf(&mut self, leaf: Node) -> Result<()> {
    let mut parent = self.get_node(leaf.parent)?;
    let position = parent.children.iter().position(|&c| c == leaf.page_id);
    let Some(idx) = position.filter(|_| parent.children.len() > 1) else {
      return self.cache.put_dirty(leaf);
    };

    // the left neighbour's range absorbs the empty one
    parent.children.remove(idx);
    parent.keys.remove(idx.saturating_sub(1));
    self.cache.put_dirty(parent)?;

    if leaf.prev != INVALID_PAGE_ID {
      let mut prev = self.get_node(leaf.prev)?;
      prev.next = leaf.next;
      self.cache.put_dirty(prev)?;
    }
    if leaf.next != INVALID_PAGE_ID {
      let mut next = self.get_node(leaf.next)?;
      next.prev = leaf.prev;
      self.cache.put_dirty(next)?;
    }

    self.cache.remove(leaf.page_id);
    self.freelist.free(leaf.page_id);
    Ok(())
  }

  fn split_leaf(&mut self, mut leaf: Node) -> Result<()> {
    let mid = leaf.keys.len() / 2;
    let new_page_id = self.allocate_page();

    let mut new_leaf = Node::new_leaf(new_page_id);
    new_leaf.parent = leaf.parent;
    new_leaf.next = leaf.next;
    new_leaf.prev = leaf.page_id;
    new_leaf.keys = leaf.keys.split_off(mid);
    new_leaf.values = leaf.values.split_off(mid);
    leaf.next = new_page_id;

    if new_leaf.next != INVALID_PAGE_ID {
      let mut next = self.get_node(new_leaf.next)?;
      next.prev = new_page_id;
      self.cache.put_dirty(next)?;
    }

    let separator = new_leaf.keys[0].clone();
    self.insert_into_parent(leaf, separator, new_leaf)
  }

  fn split_internal(&mut self, mut node: Node) -> Result<()> {
    let mid = node.keys.len() / 2;
    let new_page_id = self.allocate_page();

    let mut right_keys = node.keys.split_off(mid);
    let promoted = right_keys.remove(0);
    let mut new_node = Node::new_internal(new_page_id);
    new_node.parent = node.parent;
    new_node.keys = right_keys;
    new_node.children = node.children.split_off(mid + 1);

    for child_id in new_node.children.iter() {
      let mut child = self.get_node(*child_id)?;
      child.parent = new_page_id;
      self.cache.put_dirty(child)?;
    }

    self.insert_into_parent(node, promoted, new_node)
  }

  fn insert_into_parent(&mut self, mut left: Node, key: Vec<u8>, mut right: Node) -> Result<()> {
    if left.parent == INVALID_PAGE_ID {
      let root_page_id = self.allocate_page();
      let mut root = Node::new_internal(root_page_id);
      root.keys.push(key);
      root.children.push(left.page_id);
      root.children.push(right.page_id);
      left.parent = root_page_id;
      right.parent = root_page_id;
      self.meta.root_page_id = root_page_id;

      self.cache.put_dirty(left)?;
      self.cache.put_dirty(right)?;
      return self.cache.put_dirty(root);
    }

    let parent_id = left.parent;
    right.parent = parent_id;
    let right_id = right.page_id;
    self.cache.put_dirty(left)?;
    self.cache.put_dirty(right)?;

    let mut parent = self.get_node(parent_id)?;
    let idx = find_child_index(&parent, &key);
    parent.keys.insert(idx, key);
    parent.children.insert(idx + 1, right_id);

    if parent.keys.len() >= self.order {
      self.split_internal(parent)
    } else {
      self.cache.put_dirty(parent)
    }
  }

  /// Writes dirty pages, then the meta page, then the free list.
  fn flush(&mut self, force_sync: bool) -> Result<()> {
    if self.freelist.count() > 0 && self.meta.free_list_page == INVALID_PAGE_ID {
      self.meta.free_list_page = self.meta.page_count;
      self.meta.page_count += 1;
    }

    let page_size = self.pager.page_size;
    for page_id in self.cache.get_dirty_pages() {
      if let Some(node) = self.cache.peek(page_id) {
        self.pager.write_page(page_id, &node.serialize(page_size)?)?;
      }
      self.cache.clear_dirty(page_id);
    }

    self.pager.write_page(META_PAGE_ID, &self.meta.serialize())?;
    if self.meta.free_list_page != INVALID_PAGE_ID {
      let data = self.freelist.serialize(page_size);
      self.pager.write_page(self.meta.free_list_page, &data)?;
    }

    if force_sync || self.sync_writes {
      self.pager.sync()?;
    }
    Ok(())
  }
}

fn search(keys: &[Vec<u8>], key: &[u8]) -> std::result::Result<usize, usize> {
  keys.binary_search_by(|k| k.as_slice().cmp(key))
}

/// Index of the first separator strictly greater than `key`, equal keys go right.
fn find_child_index(node: &Node, key: &[u8]) -> usize {
  node.keys.partition_point(|k| k.as_slice() <= key)
}

impl Indexer for BPlusTree {
  fn put(&self, key: Vec<u8>, pos: ChunkPosition) -> Result<Option<ChunkPosition>> {
    let mut state = self.state.write();
    if key.len() > state.max_key_size {
      return Err(Errors::KeyTooLarge);
    }
    let old = state.insert(key, pos)?;
    if state.sync_writes {
      state.flush(true)?;
    }
    Ok(old)
  }

  fn get(&self, key: &[u8]) -> Result<Option<ChunkPosition>> {
    let state = self.state.read();
    let leaf = state.find_leaf(key)?;
    Ok(search(&leaf.keys, key).ok().map(|idx| leaf.values[idx]))
  }

  fn delete(&self, key: &[u8]) -> Result<Option<ChunkPosition>> {
    let mut state = self.state.write();
    let old = state.remove(key)?;
    if old.is_some() && state.sync_writes {
      state.flush(true)?;
    }
    Ok(old)
  }

  fn size(&self) -> usize {
    self.state.read().meta.key_count as usize
  }

  fn max_key_size(&self) -> Option<usize> {
    Some(self.state.read().max_key_size)
  }

  fn ascend(&self, handle_fn: &mut IndexHandler<'_>) -> Result<()> {
    self.scan(false, None, handle_fn)
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
    self.scan(false, Some(start), &mut |k, p| {
      if k >= end {
        return Ok(false);
      }
      handle_fn(k, p)
    })
  }

  fn ascend_greater_or_equal(&self, key: &[u8], handle_fn: &mut IndexHandler<'_>) -> Result<()> {
    self.scan(false, Some(key), handle_fn)
  }

  fn descend(&self, handle_fn: &mut IndexHandler<'_>) -> Result<()> {
    self.scan(true, None, handle_fn)
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
    self.scan(true, Some(start), &mut |k, p| {
      if k <= end {
        return Ok(false);
      }
      handle_fn(k, p)
    })
  }

  fn descend_less_or_equal(&self, key: &[u8], handle_fn: &mut IndexHandler<'_>) -> Result<()> {
    self.scan(true, Some(key), handle_fn)
  }

  fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator + '_> {
    let mut it = BPTreeIterator::new(self, reverse);
    it.rewind();
    Box::new(it)
  }

  fn sync(&self) -> Result<()> {
    self.state.write().flush(true)
  }

  fn close(&self) -> Result<()> {
    if self.closed.swap(true, Ordering::SeqCst) {
      return Ok(());
    }
    self.state.write().flush(true)
  }
}

impl Drop for BPlusTree {
  fn drop(&mut self) {
    if let Err(e) = self.close() {
      error!("failed to flush b+tree on drop: {}", e);
    }
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use rand::{seq::SliceRandom, Rng};
  use tempfile::tempdir;

  use super::*;

  fn pos(n: u64) -> ChunkPosition {
    ChunkPosition {
      segment_id: (n >> 20) as u32 + 1,
      block_number: (n >> 10) as u32 & 0x3ff,
      chunk_offset: (n & 0x3ff) as i64,
      chunk_size: n as u32,
    }
  }

  fn small_tree(path: &Path) -> BPlusTree {
    let options = BPTreeOptions {
      order: 4,
      cache_size: 8,
      ..Default::default()
    };
    BPlusTree::open(path, options).unwrap()
  }

  /// Walks the leaf level through the sibling links, checking both directions.
  fn leaf_keys(tree: &BPlusTree) -> Vec<Vec<u8>> {
    let state = tree.state.read();
    let mut node = state.get_node(state.meta.root_page_id).unwrap();
    while !node.is_leaf() {
      node = state.get_node(node.children[0]).unwrap();
    }
    assert_eq!(node.prev, INVALID_PAGE_ID);

    let mut keys = Vec::new();
    loop {
      keys.extend(node.keys.iter().cloned());
      if node.next == INVALID_PAGE_ID {
        break;
      }
      let next = state.get_node(node.next).unwrap();
      assert_eq!(next.prev, node.page_id);
      node = next;
    }
    keys
  }

  #[test]
  fn test_bptree_open_validates_options() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("opts.index");
    for page_size in [0, 100, 1000, 4095] {
      let options = BPTreeOptions {
        page_size,
        ..Default::default()
      };
      assert_eq!(
        BPlusTree::open(&path, options).err(),
        Some(Errors::InvalidPageSize)
      );
    }
    let options = BPTreeOptions {
      order: 2,
      ..Default::default()
    };
    assert_eq!(BPlusTree::open(&path, options).err(), Some(Errors::InvalidOrder));

    let options = BPTreeOptions {
      page_size: 256,
      order: 200,
      ..Default::default()
    };
    assert_eq!(BPlusTree::open(&path, options).err(), Some(Errors::InvalidOrder));

    let tree = BPlusTree::open(&path, BPTreeOptions::default()).unwrap();
    assert_eq!(tree.order(), calculate_order(4096));
    assert_eq!(calculate_order(256), 4);
  }

  #[test]
  fn test_bptree_put_get_delete() {
    let dir = tempdir().unwrap();
    let tree = small_tree(&dir.path().join("basic.index"));

    assert!(tree.put(b"b".to_vec(), pos(1)).unwrap().is_none());
    assert!(tree.put(b"a".to_vec(), pos(2)).unwrap().is_none());
    assert_eq!(tree.put(b"b".to_vec(), pos(3)).unwrap(), Some(pos(1)));
    assert_eq!(tree.size(), 2);

    assert_eq!(tree.get(b"a").unwrap(), Some(pos(2)));
    assert_eq!(tree.get(b"b").unwrap(), Some(pos(3)));
    assert_eq!(tree.get(b"c").unwrap(), None);

    assert_eq!(tree.delete(b"a").unwrap(), Some(pos(2)));
    assert_eq!(tree.delete(b"a").unwrap(), None);
    assert_eq!(tree.size(), 1);

    let max_key_size = tree.max_key_size().unwrap();
    let too_large = vec![b'x'; max_key_size + 1];
    assert_eq!(tree.put(too_large, pos(0)).err(), Some(Errors::KeyTooLarge));
    let largest = vec![b'x'; max_key_size];
    assert!(tree.put(largest, pos(0)).is_ok());
  }

  #[test]
  fn test_bptree_order_invariant() {
    let dir = tempdir().unwrap();
    let tree = small_tree(&dir.path().join("order.index"));
    let mut model = BTreeMap::new();
    let mut rng = rand::rng();

    for round in 0..3000u64 {
      let key = format!("{:05}", rng.random_range(0..800)).into_bytes();
      if rng.random_bool(0.3) {
        assert_eq!(tree.delete(&key).unwrap(), model.remove(&key));
      } else {
        assert_eq!(tree.put(key.clone(), pos(round)).unwrap(), model.insert(key, pos(round)));
      }
    }

    let keys = leaf_keys(&tree);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(keys, model.keys().cloned().collect::<Vec<_>>());
    assert_eq!(tree.size(), model.len());

    // every node stays below the order
    let state = tree.state.read();
    for page_id in 1..state.meta.page_count {
      if let Ok(node) = state.get_node(page_id) {
        assert!(node.keys.len() < state.order);
        if !node.is_leaf() {
          assert_eq!(node.children.len(), node.keys.len() + 1);
        }
      }
    }
  }

  #[test]
  fn test_bptree_durability() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("durable.index");
    let mut rng = rand::rng();
    let mut model = BTreeMap::new();

    let tree = BPlusTree::open(&path, BPTreeOptions::default()).unwrap();
    for i in 0..100_000u64 {
      let key = rng.random::<u64>().to_be_bytes().to_vec();
      tree.put(key.clone(), pos(i)).unwrap();
      model.insert(key, pos(i));
    }
    // overwrite a slice of them
    for (i, key) in model.keys().step_by(7).cloned().collect::<Vec<_>>().into_iter().enumerate() {
      let p = pos(1_000_000 + i as u64);
      tree.put(key.clone(), p).unwrap();
      model.insert(key, p);
    }
    tree.close().unwrap();
    drop(tree);

    let tree = BPlusTree::open(&path, BPTreeOptions::default()).unwrap();
    assert_eq!(tree.size(), model.len());
    for (key, p) in model.iter() {
      assert_eq!(tree.get(key).unwrap(), Some(*p));
    }

    let mut count = 0;
    let mut last: Option<Vec<u8>> = None;
    tree
      .ascend(&mut |k, _| {
        if let Some(prev) = &last {
          assert!(prev.as_slice() < k);
        }
        last = Some(k.to_vec());
        count += 1;
        Ok(true)
      })
      .unwrap();
    assert_eq!(count, model.len());
  }

  #[test]
  fn test_bptree_reopen_keeps_page_size() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pagesize.index");
    let options = BPTreeOptions {
      page_size: 1024,
      ..Default::default()
    };
    let tree = BPlusTree::open(&path, options).unwrap();
    for i in 0..500u64 {
      tree.put(format!("k{}", i).into_bytes(), pos(i)).unwrap();
    }
    drop(tree);

    // the page size stored in the file wins
    let tree = BPlusTree::open(&path, BPTreeOptions::default()).unwrap();
    assert_eq!(tree.order(), calculate_order(1024));
    assert_eq!(tree.get(b"k499").unwrap(), Some(pos(499)));
    assert_eq!(tree.size(), 500);
  }

  #[test]
  fn test_bptree_bad_meta() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("meta.index");
    drop(BPlusTree::open(&path, BPTreeOptions::default()).unwrap());
    let original = fs::read(&path).unwrap();

    let mut bad_magic = original.clone();
    bad_magic[0] = 0;
    fs::write(&path, &bad_magic).unwrap();
    assert_eq!(
      BPlusTree::open(&path, BPTreeOptions::default()).err(),
      Some(Errors::InvalidMagic)
    );

    let mut bad_version = original.clone();
    bad_version[4] = 0xee;
    fs::write(&path, &bad_version).unwrap();
    assert_eq!(
      BPlusTree::open(&path, BPTreeOptions::default()).err(),
      Some(Errors::InvalidVersion)
    );

    // create() starts over
    let tree = BPlusTree::create(&path, BPTreeOptions::default()).unwrap();
    assert_eq!(tree.size(), 0);
  }

  #[test]
  fn test_bptree_eviction_writes_dirty_pages() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("evict.index");
    let tree = small_tree(&path);
    for i in 0..200u64 {
      tree.put(format!("key-{:04}", i).into_bytes(), pos(i)).unwrap();
    }

    // pages that fell out of the tiny cache must be readable from disk
    let state = tree.state.read();
    let pager = state.pager.clone();
    let mut on_disk = 0;
    for page_id in 1..state.meta.page_count {
      if state.cache.peek(page_id).is_none() {
        let node = Node::deserialize(page_id, &pager.read_page(page_id).unwrap()).unwrap();
        assert_eq!(node.page_id, page_id);
        on_disk += 1;
      }
    }
    assert!(on_disk > 0);
    drop(state);

    for i in 0..200u64 {
      assert_eq!(tree.get(format!("key-{:04}", i).as_bytes()).unwrap(), Some(pos(i)));
    }
  }

  #[test]
  fn test_bptree_iterator_skips_empty_leaves() {
    let dir = tempdir().unwrap();
    let tree = small_tree(&dir.path().join("sparse.index"));
    let mut keys: Vec<u64> = (0..300).collect();
    keys.shuffle(&mut rand::rng());
    for i in keys.iter() {
      tree.put(format!("{:03}", i).into_bytes(), pos(*i)).unwrap();
    }
    for i in 50..250u64 {
      tree.delete(format!("{:03}", i).as_bytes()).unwrap();
    }

    let mut it = tree.iter(false).unwrap();
    it.try_seek(b"049").unwrap();
    assert_eq!(it.key(), b"049");
    it.try_next().unwrap();
    assert_eq!(it.key(), b"250");

    let mut rit = tree.iter(true).unwrap();
    rit.try_seek(b"249").unwrap();
    assert_eq!(rit.key(), b"049");
    rit.try_seek(b"150").unwrap();
    assert_eq!(rit.key(), b"049");

    let mut count = 0;
    tree
      .descend(&mut |_, _| {
        count += 1;
        Ok(true)
      })
      .unwrap();
    assert_eq!(count, 100);

    for i in (0..50).chain(250..300u64) {
      tree.delete(format!("{:03}", i).as_bytes()).unwrap();
    }
    assert!(!tree.iter(false).unwrap().valid());
    assert!(!tree.iter(true).unwrap().valid());
  }

  #[test]
  fn test_bptree_reuses_free_pages() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("free.index");
    let tree = small_tree(&path);
    {
      let mut state = tree.state.write();
      let page_count = state.meta.page_count;
      state.freelist.free(page_count + 10);
      state.meta.page_count += 11;
      state.flush(false).unwrap();
      assert_ne!(state.meta.free_list_page, INVALID_PAGE_ID);
    }
    drop(tree);

    let tree = small_tree(&path);
    let mut state = tree.state.write();
    assert_eq!(state.freelist.count(), 1);
    let expected = state.meta.page_count - 2;
    assert_eq!(state.allocate_page(), expected);
  }

  #[test]
  fn test_bptree_frees_emptied_leaves() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("release.index");
    let tree = small_tree(&path);
    for i in 0..400u64 {
      tree.put(format!("{:04}", i).into_bytes(), pos(i)).unwrap();
    }
    for i in 100..300u64 {
      tree.delete(format!("{:04}", i).as_bytes()).unwrap();
    }

    let (freed, page_count) = {
      let state = tree.state.read();
      (state.freelist.count(), state.meta.page_count)
    };
    assert!(freed > 0);
    let mut expected: Vec<Vec<u8>> = (0..100u64)
      .chain(300..400)
      .map(|i| format!("{:04}", i).into_bytes())
      .collect();
    assert_eq!(leaf_keys(&tree), expected);
    assert_eq!(tree.get(b"0200").unwrap(), None);
    assert_eq!(tree.get(b"0300").unwrap(), Some(pos(300)));

    // new keys land in recycled pages first
    for i in 100..150u64 {
      tree.put(format!("{:04}", i).into_bytes(), pos(i)).unwrap();
    }
    {
      let state = tree.state.read();
      assert!(state.freelist.count() < freed);
      assert!(state.meta.page_count <= page_count + 1);
    }
    expected.extend((100..150u64).map(|i| format!("{:04}", i).into_bytes()));
    expected.sort();
    assert_eq!(leaf_keys(&tree), expected);

    // the free list survives a reopen
    drop(tree);
    let tree = small_tree(&path);
    assert_eq!(leaf_keys(&tree), expected);
    assert_eq!(tree.size(), expected.len());
  }

  #[test]
  fn test_bptree_sync_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sync.index");
    let options = BPTreeOptions {
      sync_writes: true,
      ..Default::default()
    };
    let tree = BPlusTree::open(&path, options).unwrap();
    tree.put(b"k".to_vec(), pos(7)).unwrap();
    // written through already, reading the raw file sees the key count
    let meta = MetaPage::deserialize(&fs::read(&path).unwrap()[..META_PAGE_SIZE]).unwrap();
    assert_eq!(meta.key_count, 1);
    assert!(!tree.state.read().cache.is_dirty(1));
  }
}
