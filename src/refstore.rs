//! Summary records for the auxiliary block store. A `SubtreeRef` condenses
//! one stored block (count, time bounds, aggregates, address, checksum)
//! into a compact base128 record; time bounds are delta-coded against
//! `begin` and float aggregates are stored raw.

use crate::errors::{SdbError, SdbResult};
use crate::stream::{base128_len, StreamReader, StreamWriter};
use crate::types::Timestamp;

pub const BLOCK_SIZE: u16 = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum BlockType {
  Leaf = 0,
  Inner = 1,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SubtreeRef {
  pub count: u64,
  pub begin: Timestamp,
  pub end: Timestamp,
  pub min_time: Timestamp,
  pub max_time: Timestamp,
  pub addr: u64,
  pub min: f64,
  pub max: f64,
  pub sum: f64,
  pub first: f64,
  pub last: f64,
  pub block_type: BlockType,
  pub level: u16,
  pub payload_size: u16,
  pub fanout_index: u16,
  pub checksum: u64,
}

fn put_u64(w: &mut StreamWriter, x: u64) -> SdbResult<()> {
  if w.put_base128(x) {
    Ok(())
  } else {
    Err(SdbError::overflow("ref record does not fit"))
  }
}

fn put_f64(w: &mut StreamWriter, x: f64) -> SdbResult<()> {
  if w.put_f64(x) {
    Ok(())
  } else {
    Err(SdbError::overflow("ref record does not fit"))
  }
}

/// Worst-case encoded size, used by callers reserving append space.
pub fn max_encoded_len() -> usize {
  11 * base128_len(u64::MAX) + 5 * 8
}

/// Returns the number of bytes written.
pub fn encode_subtree_ref(dest: &mut [u8], r: &SubtreeRef) -> SdbResult<usize> {
  let mut w = StreamWriter::new(dest);
  put_u64(&mut w, r.count)?;
  put_u64(&mut w, r.begin)?;
  put_u64(&mut w, r.end.wrapping_sub(r.begin))?;
  put_u64(&mut w, r.min_time.wrapping_sub(r.begin))?;
  put_u64(&mut w, r.max_time.wrapping_sub(r.begin))?;
  put_u64(&mut w, r.addr)?;
  put_f64(&mut w, r.min)?;
  put_f64(&mut w, r.max)?;
  put_f64(&mut w, r.sum)?;
  put_f64(&mut w, r.first)?;
  put_f64(&mut w, r.last)?;
  put_u64(&mut w, r.block_type as u64)?;
  put_u64(&mut w, r.level as u64)?;
  // Inner nodes store their element count; leaves store the slack below
  // the block size, which is the smaller number.
  let payload = match r.block_type {
    BlockType::Inner => r.payload_size,
    BlockType::Leaf => BLOCK_SIZE - r.payload_size,
  };
  put_u64(&mut w, payload as u64)?;
  put_u64(&mut w, r.fanout_index as u64)?;
  put_u64(&mut w, r.checksum)?;
  Ok(w.pos())
}

/// Returns the decoded record and the number of bytes consumed.
pub fn decode_subtree_ref(source: &[u8]) -> SdbResult<(SubtreeRef, usize)> {
  let mut r = StreamReader::new(source);
  let count = r.read_base128()?;
  let begin = r.read_base128()?;
  let end = begin.wrapping_add(r.read_base128()?);
  let min_time = begin.wrapping_add(r.read_base128()?);
  let max_time = begin.wrapping_add(r.read_base128()?);
  let addr = r.read_base128()?;
  let min = r.read_f64()?;
  let max = r.read_f64()?;
  let sum = r.read_f64()?;
  let first = r.read_f64()?;
  let last = r.read_f64()?;
  let block_type = match r.read_base128()? {
    0 => BlockType::Leaf,
    1 => BlockType::Inner,
    other => {
      return Err(SdbError::bad_data(format!(
        "unknown block type {}",
        other
      )))
    }
  };
  let level = r.read_base128()? as u16;
  let mut payload_size = r.read_base128()? as u16;
  if block_type != BlockType::Inner {
    payload_size = BLOCK_SIZE - payload_size;
  }
  let fanout_index = r.read_base128()? as u16;
  let checksum = r.read_base128()?;
  let record = SubtreeRef {
    count,
    begin,
    end,
    min_time,
    max_time,
    addr,
    min,
    max,
    sum,
    first,
    last,
    block_type,
    level,
    payload_size,
    fanout_index,
    checksum,
  };
  Ok((record, r.pos()))
}

/// Fan-out bound of one inner node; a level accepts at most this many
/// refs before it must be consolidated upward.
pub const FANOUT: usize = 32;

/// Plain in-memory ref store.
#[derive(Default)]
pub struct RefStorage {
  refs: Vec<SubtreeRef>,
}

impl RefStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn append(&mut self, r: SubtreeRef) {
    self.refs.push(r);
  }

  /// True when the level can accommodate one more ref.
  pub fn has_space(&self, level: u16) -> bool {
    self.nelements(level) < FANOUT
  }

  pub fn nelements(&self, level: u16) -> usize {
    self.refs.iter().filter(|r| r.level == level).count()
  }

  pub fn iter_level(&self, level: u16) -> impl Iterator<Item = &SubtreeRef> {
    self.refs.iter().filter(move |r| r.level == level)
  }

  /// Drop a consolidated level and free its space.
  pub fn remove_level(&mut self, level: u16) {
    self.refs.retain(|r| r.level != level);
  }

  pub fn len(&self) -> usize {
    self.refs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.refs.is_empty()
  }
}

/// Ref store that keeps its records base128-encoded.
#[derive(Default)]
pub struct CompressedRefStorage {
  buffer: Vec<u8>,
  count: usize,
}

impl CompressedRefStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn append(&mut self, r: &SubtreeRef) -> SdbResult<()> {
    let mut scratch = vec![0u8; max_encoded_len()];
    let n = encode_subtree_ref(&mut scratch, r)?;
    self.buffer.extend_from_slice(&scratch[..n]);
    self.count += 1;
    Ok(())
  }

  pub fn len(&self) -> usize {
    self.count
  }

  pub fn is_empty(&self) -> bool {
    self.count == 0
  }

  pub fn size_in_bytes(&self) -> usize {
    self.buffer.len()
  }

  pub fn read_all(&self) -> SdbResult<Vec<SubtreeRef>> {
    let mut out = Vec::with_capacity(self.count);
    let mut pos = 0;
    for _ in 0..self.count {
      let (record, consumed) = decode_subtree_ref(&self.buffer[pos..])?;
      pos += consumed;
      out.push(record);
    }
    Ok(out)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_ref(block_type: BlockType) -> SubtreeRef {
    SubtreeRef {
      count: 1000,
      begin: 1_500_000_000,
      end: 1_500_003_600,
      min_time: 1_500_000_010,
      max_time: 1_500_003_590,
      addr: 0xABCDEF,
      min: -12.75,
      max: 9000.5,
      sum: 123456.789,
      first: -1.0,
      last: 2.0,
      block_type,
      level: 2,
      payload_size: 3900,
      fanout_index: 17,
      checksum: 0x1234_5678_9ABC,
    }
  }

  #[test]
  fn test_subtree_ref_round_trip() {
    for bt in [BlockType::Leaf, BlockType::Inner] {
      let original = sample_ref(bt);
      let mut buf = [0u8; 256];
      let n = encode_subtree_ref(&mut buf, &original).unwrap();
      assert!(n <= max_encoded_len());
      let (decoded, consumed) = decode_subtree_ref(&buf[..n]).unwrap();
      assert_eq!(consumed, n);
      assert_eq!(decoded, original);
    }
  }

  #[test]
  fn test_leaf_payload_stores_slack() {
    // A nearly full leaf encodes the small remainder, not the size.
    let original = sample_ref(BlockType::Leaf);
    let mut buf = [0u8; 256];
    let n = encode_subtree_ref(&mut buf, &original).unwrap();
    let mut shrunk = original;
    shrunk.payload_size = 100;
    let mut buf2 = [0u8; 256];
    let n2 = encode_subtree_ref(&mut buf2, &shrunk).unwrap();
    // slack 196 vs 3996 both fit in two base128 bytes; sizes match
    assert_eq!(n, n2);
  }

  #[test]
  fn test_encode_overflow() {
    let original = sample_ref(BlockType::Inner);
    let mut buf = [0u8; 16];
    let err = encode_subtree_ref(&mut buf, &original).unwrap_err();
    assert_eq!(err.kind, crate::errors::ErrorKind::Overflow);
  }

  #[test]
  fn test_decode_truncated() {
    let original = sample_ref(BlockType::Inner);
    let mut buf = [0u8; 256];
    let n = encode_subtree_ref(&mut buf, &original).unwrap();
    let err = decode_subtree_ref(&buf[..n - 4]).unwrap_err();
    assert_eq!(err.kind, crate::errors::ErrorKind::BadData);
  }

  #[test]
  fn test_ref_storage_levels() {
    let mut store = RefStorage::new();
    for i in 0..FANOUT {
      let mut r = sample_ref(BlockType::Leaf);
      r.fanout_index = i as u16;
      r.level = 0;
      store.append(r);
    }
    assert!(!store.has_space(0));
    assert!(store.has_space(1));
    assert_eq!(store.nelements(0), FANOUT);
    assert_eq!(store.iter_level(0).count(), FANOUT);

    let mut parent = sample_ref(BlockType::Inner);
    parent.level = 1;
    store.append(parent);
    store.remove_level(0);
    assert_eq!(store.len(), 1);
    assert_eq!(store.nelements(1), 1);
  }

  #[test]
  fn test_compressed_ref_storage_round_trip() {
    let mut store = CompressedRefStorage::new();
    let mut expected = Vec::new();
    for i in 0..10u16 {
      let mut r = sample_ref(if i % 2 == 0 {
        BlockType::Leaf
      } else {
        BlockType::Inner
      });
      r.fanout_index = i;
      r.addr = 1000 + i as u64;
      store.append(&r).unwrap();
      expected.push(r);
    }
    assert_eq!(store.len(), 10);
    assert!(store.size_in_bytes() < 10 * max_encoded_len());
    assert_eq!(store.read_all().unwrap(), expected);
  }
}
