use std::{collections::HashSet, num::NonZeroUsize};

use lru::LruCache;
use parking_lot::Mutex;

use crate::errors::Result;

use super::page::Node;

/// Writes a serialized page back to the file.
pub type FlushFn = Box<dyn Fn(u32, &[u8]) -> Result<()> + Send + Sync>;

struct CacheState {
  pages: LruCache<u32, Node>,
  dirty: HashSet<u32>,
}

/// LRU of decoded nodes with dirty tracking. A dirty page is written through
/// `flush_fn` before it is evicted, it is never dropped silently.
pub struct PageCache {
  state: Mutex<CacheState>,
  page_size: usize,
  flush_fn: FlushFn,
}

impl PageCache {
  pub fn new(capacity: usize, page_size: usize, flush_fn: FlushFn) -> Self {
    let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
    Self {
      state: Mutex::new(CacheState {
        pages: LruCache::new(capacity),
        dirty: HashSet::new(),
      }),
      page_size,
      flush_fn,
    }
  }

  /// Returns a copy of the cached node and moves it to the front.
  pub fn get(&self, page_id: u32) -> Option<Node> {
    let mut state = self.state.lock();
    state.pages.get(&page_id).cloned()
  }

  /// Like `get` without touching the recency order.
  pub fn peek(&self, page_id: u32) -> Option<Node> {
    let state = self.state.lock();
    state.pages.peek(&page_id).cloned()
  }

  /// Caches a node read from disk. The dirty flag of an entry already present
  /// is kept.
  pub fn put(&self, node: Node) -> Result<()> {
    let mut state = self.state.lock();
    self.make_room(&mut state, node.page_id)?;
    state.pages.put(node.page_id, node);
    Ok(())
  }

  /// Caches a modified node and marks it dirty in one step.
  pub fn put_dirty(&self, node: Node) -> Result<()> {
    let mut state = self.state.lock();
    self.make_room(&mut state, node.page_id)?;
    state.dirty.insert(node.page_id);
    state.pages.put(node.page_id, node);
    Ok(())
  }

  /// Flags a cached page for the next flush, unknown pages are ignored.
  pub fn mark_dirty(&self, page_id: u32) {
    let mut state = self.state.lock();
    if state.pages.contains(&page_id) {
      state.dirty.insert(page_id);
    }
  }

  pub fn clear_dirty(&self, page_id: u32) {
    self.state.lock().dirty.remove(&page_id);
  }

  pub fn is_dirty(&self, page_id: u32) -> bool {
    self.state.lock().dirty.contains(&page_id)
  }

  /// Dirty page ids in ascending order.
  pub fn get_dirty_pages(&self) -> Vec<u32> {
    let state = self.state.lock();
    let mut ids: Vec<u32> = state.dirty.iter().copied().collect();
    ids.sort_unstable();
    ids
  }

  /// Forgets a page without writing it, used when the page is freed.
  pub fn remove(&self, page_id: u32) {
    let mut state = self.state.lock();
    state.pages.pop(&page_id);
    state.dirty.remove(&page_id);
  }

  pub fn len(&self) -> usize {
    self.state.lock().pages.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn make_room(&self, state: &mut CacheState, incoming: u32) -> Result<()> {
    if state.pages.contains(&incoming) || state.pages.len() < state.pages.cap().get() {
      return Ok(());
    }

    if let Some((&victim_id, victim)) = state.pages.peek_lru() {
      if state.dirty.contains(&victim_id) {
        let data = victim.serialize(self.page_size)?;
        (self.flush_fn)(victim_id, &data)?;
        state.dirty.remove(&victim_id);
      }
    }
    state.pages.pop_lru();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;
  use crate::errors::Errors;

  fn leaf(page_id: u32, key: &str) -> Node {
    let mut node = Node::new_leaf(page_id);
    node.keys.push(key.as_bytes().to_vec());
    node.values.push(Default::default());
    node
  }

  fn recording_cache(capacity: usize) -> (PageCache, Arc<Mutex<Vec<(u32, Vec<u8>)>>>) {
    let written = Arc::new(Mutex::new(Vec::new()));
    let sink = written.clone();
    let cache = PageCache::new(
      capacity,
      256,
      Box::new(move |id, data| {
        sink.lock().push((id, data.to_vec()));
        Ok(())
      }),
    );
    (cache, written)
  }

  #[test]
  fn test_cache_lru_order() {
    let (cache, written) = recording_cache(2);
    cache.put(leaf(1, "a")).unwrap();
    cache.put(leaf(2, "b")).unwrap();
    // touch 1 so that 2 becomes the victim
    assert!(cache.get(1).is_some());
    cache.put(leaf(3, "c")).unwrap();

    assert!(cache.peek(2).is_none());
    assert!(cache.peek(1).is_some());
    assert_eq!(cache.len(), 2);
    // clean pages are dropped without a write
    assert!(written.lock().is_empty());
  }

  #[test]
  fn test_cache_flushes_dirty_victim() {
    let (cache, written) = recording_cache(2);
    cache.put_dirty(leaf(1, "a")).unwrap();
    cache.put(leaf(2, "b")).unwrap();
    cache.put(leaf(3, "c")).unwrap();

    let written = written.lock();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].0, 1);
    assert_eq!(Node::deserialize(1, &written[0].1).unwrap(), leaf(1, "a"));
    assert!(!cache.is_dirty(1));
  }

  #[test]
  fn test_cache_dirty_tracking() {
    let (cache, _) = recording_cache(10);
    cache.put(leaf(4, "d")).unwrap();
    cache.put_dirty(leaf(2, "b")).unwrap();
    cache.mark_dirty(4);
    cache.mark_dirty(99);
    assert_eq!(cache.get_dirty_pages(), vec![2, 4]);

    // re-caching a clean copy keeps the flag
    cache.put(leaf(2, "b")).unwrap();
    assert!(cache.is_dirty(2));

    cache.clear_dirty(2);
    assert_eq!(cache.get_dirty_pages(), vec![4]);

    cache.remove(4);
    assert!(cache.peek(4).is_none());
    assert!(cache.get_dirty_pages().is_empty());
  }

  #[test]
  fn test_cache_flush_error_keeps_page() {
    let cache = PageCache::new(1, 256, Box::new(|_, _| Err(Errors::FailedToWriteToDataFile)));
    cache.put_dirty(leaf(1, "a")).unwrap();
    assert_eq!(
      cache.put(leaf(2, "b")).err(),
      Some(Errors::FailedToWriteToDataFile)
    );
    assert!(cache.peek(1).is_some());
    assert!(cache.is_dirty(1));
  }
}
