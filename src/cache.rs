//! Bounded cache of decoded chunks. Keys combine a page generation key
//! with the anchor's entry index, so reusing (reallocating) a page
//! silently invalidates every entry that pointed into it. Eviction is
//! FIFO on insertion order and the bound is on decoded bytes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, error};
use parking_lot::Mutex;

use crate::chunk::UncompressedChunk;
use crate::constants::DEFAULT_CACHE_LIMIT;

/// (page generation key, entry index)
pub type CacheKey = (u64, u32);

struct CacheInner {
  map: HashMap<CacheKey, Arc<UncompressedChunk>>,
  fifo: VecDeque<(CacheKey, usize)>,
  total_size: usize,
}

pub struct ChunkCache {
  inner: Mutex<CacheInner>,
  size_limit: usize,
}

impl ChunkCache {
  pub fn new(size_limit: usize) -> Self {
    Self {
      inner: Mutex::new(CacheInner {
        map: HashMap::new(),
        fifo: VecDeque::new(),
        total_size: 0,
      }),
      size_limit,
    }
  }

  pub fn contains(&self, key: CacheKey) -> bool {
    self.inner.lock().map.contains_key(&key)
  }

  pub fn get(&self, key: CacheKey) -> Option<Arc<UncompressedChunk>> {
    self.inner.lock().map.get(&key).cloned()
  }

  pub fn put(&self, key: CacheKey, chunk: Arc<UncompressedChunk>) {
    let size = chunk.mem_size();
    if size > self.size_limit {
      return;
    }
    let mut inner = self.inner.lock();
    while inner.total_size + size > self.size_limit {
      match inner.fifo.pop_back() {
        Some((evicted_key, evicted_size)) => {
          if inner.map.remove(&evicted_key).is_none() {
            // The mirror entry must exist; a miss means the two
            // structures diverged.
            error!("chunk cache inconsistent: evicted key has no entry");
            debug_assert!(false, "chunk cache inconsistent");
          }
          inner.total_size -= evicted_size;
          debug!(
            "chunk cache evicted {} bytes for key {:?}",
            evicted_size, evicted_key
          );
        }
        None => break,
      }
    }
    if inner.map.insert(key, chunk).is_none() {
      inner.fifo.push_front((key, size));
      inner.total_size += size;
    }
  }

  pub fn total_size(&self) -> usize {
    self.inner.lock().total_size
  }

  pub fn size_limit(&self) -> usize {
    self.size_limit
  }
}

impl Default for ChunkCache {
  fn default() -> Self {
    Self::new(DEFAULT_CACHE_LIMIT)
  }
}
