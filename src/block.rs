//! Per-series streaming block codec. Samples are buffered into 16-element
//! timestamp/value arrays; every full block is emitted as delta-delta
//! timestamps followed by FCM-coded values, both transactionally. When the
//! remaining space cannot hold a compressed block, writes fall back to raw
//! `(ts, value)` pairs appended to a tail section.

use crate::codecs::{DeltaDeltaDecoder, DeltaDeltaEncoder};
use crate::constants::{BLOCK_HEADER_SIZE, CHUNK_MARGIN, CHUNK_MASK, CHUNK_SIZE, STORAGE_VERSION};
use crate::errors::{SdbError, SdbResult};
use crate::fcm::{FcmDecoder, FcmEncoder};
use crate::stream::{StreamReader, StreamWriter};
use crate::types::{ParamId, Timestamp};

pub struct BlockWriter<'a> {
  stream: StreamWriter<'a>,
  ts_enc: DeltaDeltaEncoder,
  val_enc: FcmEncoder,
  write_index: usize,
  ts_buf: [Timestamp; CHUNK_SIZE],
  val_buf: [f64; CHUNK_SIZE],
  nchunks: u16,
  ntail: u16,
  nchunks_at: usize,
  ntail_at: usize,
}

impl<'a> BlockWriter<'a> {
  /// Lay down the 14-byte header: version, chunk count, tail count,
  /// series id. The counters are patched as data arrives.
  pub fn new(id: ParamId, buf: &'a mut [u8]) -> SdbResult<Self> {
    let mut stream = StreamWriter::new(buf);
    if !stream.put_u16(STORAGE_VERSION) {
      return Err(SdbError::overflow("buffer is too small for a block header"));
    }
    let nchunks_at = stream.pos();
    if !stream.put_u16(0) {
      return Err(SdbError::overflow("buffer is too small for a block header"));
    }
    let ntail_at = stream.pos();
    if !stream.put_u16(0) || !stream.put_u64(id) {
      return Err(SdbError::overflow("buffer is too small for a block header"));
    }
    Ok(Self {
      stream,
      ts_enc: DeltaDeltaEncoder::default(),
      val_enc: FcmEncoder::new(),
      write_index: 0,
      ts_buf: [0; CHUNK_SIZE],
      val_buf: [0.0; CHUNK_SIZE],
      nchunks: 0,
      ntail: 0,
      nchunks_at,
      ntail_at,
    })
  }

  /// True when there is room for one more compressed 16-element chunk in
  /// the worst case.
  fn room_for_chunk(&self) -> bool {
    self.stream.space_left() >= CHUNK_MARGIN
  }

  pub fn put(&mut self, ts: Timestamp, value: f64) -> SdbResult<()> {
    if self.room_for_chunk() {
      // Invariant 1: the number of buffered elements equals
      // write_index % CHUNK_SIZE.
      self.ts_buf[self.write_index & CHUNK_MASK] = ts;
      self.val_buf[self.write_index & CHUNK_MASK] = value;
      self.write_index += 1;
      if self.write_index & CHUNK_MASK == 0 {
        let ok = self.ts_enc.tput(&mut self.stream, &self.ts_buf)
          && self.val_enc.tput(&mut self.stream, &self.val_buf);
        if !ok {
          // Buffer content is lost; only reachable if room_for_chunk
          // under-estimates the worst case.
          debug_assert!(false, "chunk margin under-estimated");
          return Err(SdbError::overflow("block buffer is full"));
        }
        self.nchunks += 1;
        self.stream.patch_u16(self.nchunks_at, self.nchunks);
      }
      Ok(())
    } else {
      // Uncompressed tail writes begin only with an empty write buffer.
      debug_assert_eq!(self.write_index & CHUNK_MASK, 0);
      if self.stream.space_left() < 16 || !self.stream.put_u64(ts) || !self.stream.put_f64(value) {
        return Err(SdbError::overflow("block buffer is full"));
      }
      self.ntail += 1;
      self.stream.patch_u16(self.ntail_at, self.ntail);
      Ok(())
    }
  }

  /// Flush buffered elements to the tail uncompressed and finalize the
  /// header. Returns the encoded size in bytes.
  pub fn commit(&mut self) -> SdbResult<usize> {
    let nchunks = self.write_index / CHUNK_SIZE;
    let buftail = self.write_index % CHUNK_SIZE;
    if buftail > 0 {
      if self.ntail != 0 {
        // Invariant 2: a non-empty write buffer implies no tail writes
        // have happened yet.
        return Err(SdbError::inconsistent(
          "write buffer is not empty but cannot be flushed",
        ));
      }
      for ix in 0..buftail {
        if !self.stream.put_u64(self.ts_buf[ix]) || !self.stream.put_f64(self.val_buf[ix]) {
          return Err(SdbError::overflow("no room to flush the write buffer"));
        }
        self.ntail += 1;
        self.write_index -= 1;
      }
      self.stream.patch_u16(self.ntail_at, self.ntail);
    }
    self.nchunks = nchunks as u16;
    self.stream.patch_u16(self.nchunks_at, self.nchunks);
    Ok(self.stream.pos())
  }

  /// Elements still sitting in the write buffer (not yet in the stream).
  pub fn read_tail_elements(&self, timestamps: &mut Vec<Timestamp>, values: &mut Vec<f64>) {
    let tailsize = self.write_index & CHUNK_MASK;
    for i in 0..tailsize {
      timestamps.push(self.ts_buf[i]);
      values.push(self.val_buf[i]);
    }
  }

  pub fn write_index(&self) -> usize {
    self.ntail as usize + self.write_index
  }
}

pub struct BlockReader<'a> {
  stream: StreamReader<'a>,
  ts_dec: DeltaDeltaDecoder,
  val_dec: FcmDecoder,
  read_buf: [Timestamp; CHUNK_SIZE],
  read_index: usize,
  version: u16,
  nchunks: u16,
  ntail: u16,
  param_id: ParamId,
}

impl<'a> BlockReader<'a> {
  pub fn new(buf: &'a [u8]) -> SdbResult<Self> {
    if buf.len() < BLOCK_HEADER_SIZE {
      return Err(SdbError::bad_data("block is shorter than its header"));
    }
    let mut stream = StreamReader::new(buf);
    let version = stream.read_u16()?;
    let nchunks = stream.read_u16()?;
    let ntail = stream.read_u16()?;
    let param_id = stream.read_u64()?;
    Ok(Self {
      stream,
      ts_dec: DeltaDeltaDecoder::default(),
      val_dec: FcmDecoder::new(),
      read_buf: [0; CHUNK_SIZE],
      read_index: 0,
      version,
      nchunks,
      ntail,
      param_id,
    })
  }

  fn main_size(&self) -> usize {
    self.nchunks as usize * CHUNK_SIZE
  }

  pub fn nelements(&self) -> usize {
    self.main_size() + self.ntail as usize
  }

  pub fn param_id(&self) -> ParamId {
    self.param_id
  }

  pub fn version(&self) -> u16 {
    self.version
  }

  /// `Ok(None)` once the block is exhausted.
  pub fn next(&mut self) -> SdbResult<Option<(Timestamp, f64)>> {
    if self.read_index < self.main_size() {
      let chunk_index = self.read_index & CHUNK_MASK;
      self.read_index += 1;
      if chunk_index == 0 {
        for i in 0..CHUNK_SIZE {
          self.read_buf[i] = self.ts_dec.next(&mut self.stream)?;
        }
      }
      let value = self.val_dec.next(&mut self.stream)?;
      Ok(Some((self.read_buf[chunk_index], value)))
    } else if self.read_index < self.nelements() {
      self.read_index += 1;
      let ts = self.stream.read_u64()?;
      let value = self.stream.read_f64()?;
      Ok(Some((ts, value)))
    } else {
      Ok(None)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn round_trip(points: &[(u64, f64)], bufsize: usize) {
    let mut buf = vec![0u8; bufsize];
    let mut writer = BlockWriter::new(42, &mut buf).unwrap();
    for &(ts, v) in points {
      writer.put(ts, v).unwrap();
    }
    let nbytes = writer.commit().unwrap();
    assert!(nbytes <= bufsize);

    let mut reader = BlockReader::new(&buf[..nbytes]).unwrap();
    assert_eq!(reader.param_id(), 42);
    assert_eq!(reader.version(), STORAGE_VERSION);
    assert_eq!(reader.nelements(), points.len());
    for &(ts, v) in points {
      let (got_ts, got_v) = reader.next().unwrap().unwrap();
      assert_eq!(got_ts, ts);
      assert_eq!(got_v.to_bits(), v.to_bits());
    }
    assert_eq!(reader.next().unwrap(), None);
  }

  #[test]
  fn test_round_trip_aligned() {
    let points: Vec<(u64, f64)> = (0..64).map(|i| (1000 + i * 5, i as f64 * 0.25)).collect();
    round_trip(&points, 4096);
  }

  #[test]
  fn test_round_trip_with_tail() {
    let points: Vec<(u64, f64)> = (0..53).map(|i| (i * 1000 + (i % 3), (i as f64).ln_1p())).collect();
    round_trip(&points, 4096);
  }

  #[test]
  fn test_small_block_goes_to_tail() {
    // A buffer below the chunk margin never compresses anything.
    let points: Vec<(u64, f64)> = (0..10).map(|i| (i, i as f64)).collect();
    let mut buf = vec![0u8; BLOCK_HEADER_SIZE + 200];
    let mut writer = BlockWriter::new(7, &mut buf).unwrap();
    for &(ts, v) in &points {
      writer.put(ts, v).unwrap();
    }
    let nbytes = writer.commit().unwrap();
    let reader = BlockReader::new(&buf[..nbytes]).unwrap();
    assert_eq!(reader.nelements(), 10);
  }

  #[test]
  fn test_overflow_reported() {
    let mut buf = vec![0u8; BLOCK_HEADER_SIZE + 32];
    let mut writer = BlockWriter::new(7, &mut buf).unwrap();
    let mut wrote = 0;
    let mut status = Ok(());
    for i in 0..100u64 {
      status = writer.put(i, i as f64);
      if status.is_err() {
        break;
      }
      wrote += 1;
    }
    assert_eq!(
      status.unwrap_err().kind,
      crate::errors::ErrorKind::Overflow
    );
    assert_eq!(wrote, 2); // 32 bytes of tail room
  }

  #[test]
  fn test_header_too_small() {
    let mut buf = [0u8; 8];
    assert!(BlockWriter::new(1, &mut buf).is_err());
  }

  #[test]
  fn test_read_tail_elements() {
    let mut buf = vec![0u8; 4096];
    let mut writer = BlockWriter::new(1, &mut buf).unwrap();
    for i in 0..CHUNK_SIZE as u64 + 3 {
      writer.put(i, i as f64).unwrap();
    }
    let mut ts = Vec::new();
    let mut vs = Vec::new();
    writer.read_tail_elements(&mut ts, &mut vs);
    assert_eq!(ts, vec![16, 17, 18]);
    assert_eq!(vs, vec![16.0, 17.0, 18.0]);
  }
}
