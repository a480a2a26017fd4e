use bytes::{Buf, BufMut, BytesMut};
use derive_more::Display;

use crate::{
  errors::{Errors, Result},
  wal::ChunkPosition,
};

pub const MAGIC_NUMBER: u32 = 0x4250_5449;
pub const VERSION: u16 = 1;

/// Page id 0 always holds the meta page, so it doubles as "no page".
pub const INVALID_PAGE_ID: u32 = 0;
pub const META_PAGE_ID: u32 = 0;

/// magic(4) + version(2) + page size(4) + root(4) + free list(4) + key count(8) + page count(4)
pub const META_PAGE_SIZE: usize = 30;

/// type(1) + key count(2) + parent(4) + next(4) + prev(4)
pub const NODE_HEADER_SIZE: usize = 15;

/// segment id(4) + block number(4) + chunk offset(8) + chunk size(4)
pub const CHUNK_POSITION_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PageType {
  Meta = 0,

  Internal = 1,

  Leaf = 2,

  FreeList = 3,
}

impl PageType {
  fn from_u8(v: u8) -> Option<Self> {
    match v {
      0 => Some(PageType::Meta),
      1 => Some(PageType::Internal),
      2 => Some(PageType::Leaf),
      3 => Some(PageType::FreeList),
      _ => None,
    }
  }
}

/// Page 0 of the tree file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaPage {
  pub magic: u32,
  pub version: u16,
  pub page_size: u32,
  pub root_page_id: u32,
  pub free_list_page: u32,
  pub key_count: u64,
  pub page_count: u32,
}

impl MetaPage {
  /// Meta for a fresh file: page 0 is the meta, page 1 the empty root leaf.
  pub fn new(page_size: u32) -> Self {
    Self {
      magic: MAGIC_NUMBER,
      version: VERSION,
      page_size,
      root_page_id: 1,
      free_list_page: INVALID_PAGE_ID,
      key_count: 0,
      page_count: 2,
    }
  }

  pub fn serialize(&self) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(META_PAGE_SIZE);
    buf.put_u32_le(self.magic);
    buf.put_u16_le(self.version);
    buf.put_u32_le(self.page_size);
    buf.put_u32_le(self.root_page_id);
    buf.put_u32_le(self.free_list_page);
    buf.put_u64_le(self.key_count);
    buf.put_u32_le(self.page_count);
    buf.to_vec()
  }

  pub fn deserialize(data: &[u8]) -> Result<MetaPage> {
    let mut buf = data;
    if buf.remaining() < META_PAGE_SIZE {
      return Err(Errors::InvalidPage);
    }
    let magic = buf.get_u32_le();
    if magic != MAGIC_NUMBER {
      return Err(Errors::InvalidMagic);
    }
    let version = buf.get_u16_le();
    if version != VERSION {
      return Err(Errors::InvalidVersion);
    }
    Ok(MetaPage {
      magic,
      version,
      page_size: buf.get_u32_le(),
      root_page_id: buf.get_u32_le(),
      free_list_page: buf.get_u32_le(),
      key_count: buf.get_u64_le(),
      page_count: buf.get_u32_le(),
    })
  }
}

/// A tree node as held in memory. Leaves carry `values`, internal nodes
/// carry `children` with `children.len() == keys.len() + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
  pub page_id: u32,
  pub page_type: PageType,
  pub parent: u32,
  pub next: u32,
  pub prev: u32,
  pub keys: Vec<Vec<u8>>,
  pub values: Vec<ChunkPosition>,
  pub children: Vec<u32>,
}

impl Node {
  pub fn new_leaf(page_id: u32) -> Self {
    Self {
      page_id,
      page_type: PageType::Leaf,
      parent: INVALID_PAGE_ID,
      next: INVALID_PAGE_ID,
      prev: INVALID_PAGE_ID,
      keys: Vec::new(),
      values: Vec::new(),
      children: Vec::new(),
    }
  }

  pub fn new_internal(page_id: u32) -> Self {
    Self {
      page_type: PageType::Internal,
      ..Self::new_leaf(page_id)
    }
  }

  pub fn is_leaf(&self) -> bool {
    self.page_type == PageType::Leaf
  }

  /// Bytes needed to store the node.
  pub fn encoded_size(&self) -> usize {
    let keys: usize = self.keys.iter().map(|k| 2 + k.len()).sum();
    if self.is_leaf() {
      NODE_HEADER_SIZE + keys + self.values.len() * CHUNK_POSITION_SIZE
    } else {
      NODE_HEADER_SIZE + keys + self.children.len() * 4
    }
  }

  // +------+-----------+--------+------+------+---------------------------------+
  // | type | key count | parent | next | prev | entries                         |
  // +------+-----------+--------+------+------+---------------------------------+
  // leaf entry:     [key len u16][key][chunk position 20 bytes]
  // internal entry: [key len u16][key][child u32], then the last child u32
  pub fn serialize(&self, page_size: usize) -> Result<Vec<u8>> {
    if self.encoded_size() > page_size || self.keys.len() > u16::MAX as usize {
      return Err(Errors::InvalidPage);
    }

    let mut buf = BytesMut::with_capacity(page_size);
    buf.put_u8(self.page_type as u8);
    buf.put_u16_le(self.keys.len() as u16);
    buf.put_u32_le(self.parent);
    buf.put_u32_le(self.next);
    buf.put_u32_le(self.prev);

    for (i, key) in self.keys.iter().enumerate() {
      buf.put_u16_le(key.len() as u16);
      buf.extend_from_slice(key);
      if self.is_leaf() {
        put_chunk_position(&mut buf, &self.values[i]);
      } else {
        buf.put_u32_le(self.children[i]);
      }
    }
    if !self.is_leaf() {
      if let Some(last) = self.children.last() {
        buf.put_u32_le(*last);
      }
    }

    buf.resize(page_size, 0);
    Ok(buf.to_vec())
  }

  pub fn deserialize(page_id: u32, data: &[u8]) -> Result<Node> {
    let mut buf = data;
    if buf.remaining() < NODE_HEADER_SIZE {
      return Err(Errors::InvalidPage);
    }
    let page_type = match PageType::from_u8(buf.get_u8()) {
      Some(t @ (PageType::Leaf | PageType::Internal)) => t,
      _ => return Err(Errors::InvalidPage),
    };
    let key_count = buf.get_u16_le() as usize;
    let mut node = Node {
      page_id,
      page_type,
      parent: buf.get_u32_le(),
      next: buf.get_u32_le(),
      prev: buf.get_u32_le(),
      keys: Vec::with_capacity(key_count),
      values: Vec::new(),
      children: Vec::new(),
    };

    for _ in 0..key_count {
      if buf.remaining() < 2 {
        return Err(Errors::InvalidPage);
      }
      let key_len = buf.get_u16_le() as usize;
      if buf.remaining() < key_len {
        return Err(Errors::InvalidPage);
      }
      node.keys.push(buf[..key_len].to_vec());
      buf.advance(key_len);

      if node.is_leaf() {
        node.values.push(get_chunk_position(&mut buf)?);
      } else {
        if buf.remaining() < 4 {
          return Err(Errors::InvalidPage);
        }
        node.children.push(buf.get_u32_le());
      }
    }
    if !node.is_leaf() {
      if buf.remaining() < 4 {
        return Err(Errors::InvalidPage);
      }
      node.children.push(buf.get_u32_le());
    }

    Ok(node)
  }
}

fn put_chunk_position(buf: &mut BytesMut, pos: &ChunkPosition) {
  buf.put_u32_le(pos.segment_id);
  buf.put_u32_le(pos.block_number);
  buf.put_i64_le(pos.chunk_offset);
  buf.put_u32_le(pos.chunk_size);
}

fn get_chunk_position(buf: &mut &[u8]) -> Result<ChunkPosition> {
  if buf.remaining() < CHUNK_POSITION_SIZE {
    return Err(Errors::InvalidPage);
  }
  Ok(ChunkPosition {
    segment_id: buf.get_u32_le(),
    block_number: buf.get_u32_le(),
    chunk_offset: buf.get_i64_le(),
    chunk_size: buf.get_u32_le(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_meta_page() {
    let meta = MetaPage {
      key_count: 123_456,
      page_count: 77,
      free_list_page: 76,
      ..MetaPage::new(8192)
    };
    let buf = meta.serialize();
    assert_eq!(buf.len(), META_PAGE_SIZE);
    assert_eq!(MetaPage::deserialize(&buf).unwrap(), meta);

    let mut bad_magic = buf.clone();
    bad_magic[0] ^= 0xff;
    assert_eq!(MetaPage::deserialize(&bad_magic).err(), Some(Errors::InvalidMagic));

    let mut bad_version = buf.clone();
    bad_version[4] = 9;
    assert_eq!(MetaPage::deserialize(&bad_version).err(), Some(Errors::InvalidVersion));

    assert_eq!(MetaPage::deserialize(&buf[..10]).err(), Some(Errors::InvalidPage));
  }

  #[test]
  fn test_leaf_node_page() {
    let mut leaf = Node::new_leaf(5);
    leaf.parent = 3;
    leaf.next = 9;
    leaf.prev = 4;
    for i in 0..10u32 {
      leaf.keys.push(format!("key-{}", i).into_bytes());
      leaf.values.push(ChunkPosition {
        segment_id: i,
        block_number: i * 2,
        chunk_offset: -1 + i as i64,
        chunk_size: 1000 + i,
      });
    }

    let page = leaf.serialize(4096).unwrap();
    assert_eq!(page.len(), 4096);
    assert_eq!(page[0], PageType::Leaf as u8);
    assert_eq!(Node::deserialize(5, &page).unwrap(), leaf);
  }

  #[test]
  fn test_internal_node_page() {
    let mut node = Node::new_internal(2);
    node.keys = vec![b"b".to_vec(), b"d".to_vec()];
    node.children = vec![10, 11, 12];
    let page = node.serialize(256).unwrap();
    assert_eq!(Node::deserialize(2, &page).unwrap(), node);
  }

  #[test]
  fn test_node_page_errors() {
    let mut leaf = Node::new_leaf(1);
    leaf.keys.push(vec![b'k'; 300]);
    leaf.values.push(ChunkPosition::default());
    assert_eq!(leaf.serialize(256).err(), Some(Errors::InvalidPage));

    let page = leaf.serialize(512).unwrap();
    assert_eq!(Node::deserialize(1, &page[..100]).err(), Some(Errors::InvalidPage));

    let mut meta_typed = page.clone();
    meta_typed[0] = PageType::Meta as u8;
    assert_eq!(Node::deserialize(1, &meta_typed).err(), Some(Errors::InvalidPage));
  }
}
