//! Append-only, bin-chunked string storage. Bins reserve their full
//! capacity up front and are never resized or moved, so a stored string
//! stays at a stable address for the pool's lifetime. A handle encodes the
//! 1-based bin index and the byte offset in a single u64.

use std::collections::HashMap;

use crate::constants::MAX_BIN_SIZE;

/// `bin_index * MAX_BIN_SIZE + offset`; `0` means "absent".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StringHandle(pub u64);

impl StringHandle {
  pub const NULL: StringHandle = StringHandle(0);

  pub fn is_null(&self) -> bool {
    self.0 == 0
  }
}

#[derive(Default)]
pub struct StringPool {
  bins: Vec<Vec<u8>>,
  count: usize,
}

impl StringPool {
  pub fn new() -> Self {
    Self::default()
  }

  /// Intern a byte string; returns the null handle for empty input.
  /// Strings are NUL-terminated inside the bin, so they must not contain
  /// NUL themselves (the canonicalizer never produces one).
  pub fn add(&mut self, bytes: &[u8]) -> StringHandle {
    if bytes.is_empty() {
      return StringHandle::NULL;
    }
    let needed = bytes.len() as u64 + 1;
    if self
      .bins
      .last()
      .map_or(true, |bin| bin.len() as u64 + needed > MAX_BIN_SIZE)
    {
      self.bins.push(Vec::with_capacity(MAX_BIN_SIZE as usize));
    }
    let bin_index = self.bins.len() as u64; // 1-based
    let bin = self.bins.last_mut().unwrap();
    let offset = bin.len() as u64;
    bin.extend_from_slice(bytes);
    bin.push(0);
    self.count += 1;
    StringHandle(bin_index * MAX_BIN_SIZE + offset)
  }

  /// View of the stored bytes; valid as long as the pool lives.
  pub fn get(&self, handle: StringHandle) -> Option<&[u8]> {
    if handle.is_null() {
      return None;
    }
    let ix = (handle.0 / MAX_BIN_SIZE) as usize;
    let offset = (handle.0 % MAX_BIN_SIZE) as usize;
    let bin = self.bins.get(ix - 1)?;
    if offset >= bin.len() {
      return None;
    }
    let tail = &bin[offset..];
    let len = tail.iter().position(|&b| b == 0)?;
    Some(&tail[..len])
  }

  /// Number of interned strings.
  pub fn len(&self) -> usize {
    self.count
  }

  pub fn is_empty(&self) -> bool {
    self.count == 0
  }

  pub fn mem_used(&self) -> usize {
    self.bins.iter().map(|bin| bin.len()).sum()
  }
}

/// Dan Bernstein's djb2 over the byte view. All pool-keyed tables hash
/// with this and compare byte-wise, never by handle.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
  let mut hash: u64 = 5381;
  for &b in bytes {
    hash = hash
      .wrapping_shl(5)
      .wrapping_add(hash)
      .wrapping_add(b as u64);
  }
  hash
}

/// Hash table from interned strings to u64 payloads. Buckets chain
/// `(handle, value)` pairs and resolve collisions by comparing the pooled
/// bytes, so equality is on content while storage stays handle-based.
#[derive(Default)]
pub struct HandleTable {
  buckets: HashMap<u64, Vec<(StringHandle, u64)>>,
}

impl HandleTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, pool: &StringPool, handle: StringHandle, value: u64) {
    let bytes = pool.get(handle).unwrap_or(b"");
    let hash = hash_bytes(bytes);
    self.buckets.entry(hash).or_default().push((handle, value));
  }

  pub fn get(&self, pool: &StringPool, bytes: &[u8]) -> Option<u64> {
    let hash = hash_bytes(bytes);
    let bucket = self.buckets.get(&hash)?;
    for &(handle, value) in bucket {
      if pool.get(handle) == Some(bytes) {
        return Some(value);
      }
    }
    None
  }

  pub fn len(&self) -> usize {
    self.buckets.values().map(|b| b.len()).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.buckets.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_add_and_get() {
    let mut pool = StringPool::new();
    let a = pool.add(b"cpu host=h1");
    let b = pool.add(b"mem host=h2");
    assert_eq!(pool.get(a), Some(&b"cpu host=h1"[..]));
    assert_eq!(pool.get(b), Some(&b"mem host=h2"[..]));
    assert_eq!(pool.len(), 2);
  }

  #[test]
  fn test_empty_string_returns_null() {
    let mut pool = StringPool::new();
    let h = pool.add(b"");
    assert!(h.is_null());
    assert_eq!(pool.get(h), None);
  }

  #[test]
  fn test_handles_are_stable() {
    let mut pool = StringPool::new();
    let first = pool.add(b"series zero=0");
    let before = pool.get(first).unwrap().to_vec();
    for i in 0..10_000 {
      pool.add(format!("series num={}", i).as_bytes());
    }
    assert_eq!(pool.get(first).unwrap(), &before[..]);
  }

  #[test]
  fn test_handle_encodes_bin_and_offset() {
    let mut pool = StringPool::new();
    let h = pool.add(b"abc");
    // first bin is 1-based, offset 0
    assert_eq!(h.0, MAX_BIN_SIZE);
    let h2 = pool.add(b"de");
    assert_eq!(h2.0, MAX_BIN_SIZE + 4); // "abc\0" occupies 4 bytes
  }

  #[test]
  fn test_djb2_known_values() {
    // djb2("") is the initial basis
    assert_eq!(hash_bytes(b""), 5381);
    assert_eq!(hash_bytes(b"a"), 5381u64.wrapping_mul(33) + 97);
  }

  #[test]
  fn test_handle_table_content_equality() {
    let mut pool = StringPool::new();
    let h = pool.add(b"cpu host=h1");
    let mut table = HandleTable::new();
    table.insert(&pool, h, 7);
    assert_eq!(table.get(&pool, b"cpu host=h1"), Some(7));
    assert_eq!(table.get(&pool, b"cpu host=h2"), None);
  }
}
