use bytes::{Buf, BufMut, BytesMut};
use log::warn;

use super::page::PageType;

/// Stack of page ids that can be handed out again.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FreeList {
  page_ids: Vec<u32>,
}

impl FreeList {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn allocate(&mut self) -> Option<u32> {
    self.page_ids.pop()
  }

  pub fn free(&mut self, page_id: u32) {
    self.page_ids.push(page_id);
  }

  pub fn count(&self) -> usize {
    self.page_ids.len()
  }

  /// Max ids a single page of `page_size` can hold.
  pub fn capacity(page_size: usize) -> usize {
    page_size.saturating_sub(5) / 4
  }

  /// `[type u8][count u32][ids u32...]`, padded to the page size. Ids that do
  /// not fit are dropped and their pages leak.
  pub fn serialize(&self, page_size: usize) -> Vec<u8> {
    let cap = Self::capacity(page_size);
    let ids = if self.page_ids.len() > cap {
      warn!(
        "free list holds {} pages, only {} fit into a page",
        self.page_ids.len(),
        cap
      );
      &self.page_ids[self.page_ids.len() - cap..]
    } else {
      &self.page_ids[..]
    };

    let mut buf = BytesMut::with_capacity(page_size);
    buf.put_u8(PageType::FreeList as u8);
    buf.put_u32_le(ids.len() as u32);
    for id in ids {
      buf.put_u32_le(*id);
    }
    buf.resize(page_size, 0);
    buf.to_vec()
  }

  /// Reads as many ids as the page really holds.
  pub fn deserialize(data: &[u8]) -> FreeList {
    let mut buf = data;
    if buf.remaining() < 5 || buf.get_u8() != PageType::FreeList as u8 {
      return FreeList::new();
    }
    let count = (buf.get_u32_le() as usize).min(buf.remaining() / 4);
    let page_ids = (0..count).map(|_| buf.get_u32_le()).collect();
    FreeList { page_ids }
  }
}
