//! Column coders composed from the stream primitives: delta-delta for
//! timestamps, delta-RLE for series ids, zig-zag for signed residuals.

use crate::constants::CHUNK_SIZE;
use crate::errors::{SdbError, SdbResult};
use crate::stream::{StreamReader, StreamWriter};
use crate::vbyte;
use crate::vbyte::{VBytePairDecoder, VBytePairEncoder};

#[inline]
pub fn zigzag_encode(x: i64) -> u64 {
  ((x << 1) ^ (x >> 63)) as u64
}

#[inline]
pub fn zigzag_decode(x: u64) -> i64 {
  ((x >> 1) as i64) ^ -((x & 1) as i64)
}

/// Delta-delta encoder. Per 16-element block: compute deltas, subtract the
/// block minimum, write the minimum base128 and the residuals through the
/// pair coder. Regular series produce all-zero residual blocks, which
/// collapse to the one-byte shortcut.
#[derive(Default)]
pub struct DeltaDeltaEncoder {
  prev: u64,
  put_calls: u32,
  pair: VBytePairEncoder,
}

impl DeltaDeltaEncoder {
  /// Transactional block write; `false` leaves the stream unchanged.
  pub fn tput(&mut self, w: &mut StreamWriter, block: &[u64; CHUNK_SIZE]) -> bool {
    let oldpos = w.pos();
    let saved_prev = self.prev;
    let mut residuals = [0u64; CHUNK_SIZE];
    let mut min = block[0].wrapping_sub(self.prev);
    for i in 0..CHUNK_SIZE {
      let delta = block[i].wrapping_sub(self.prev);
      residuals[i] = delta;
      self.prev = block[i];
      min = min.min(delta);
    }
    if !w.put_base128(min) {
      self.prev = saved_prev;
      return false;
    }
    for r in residuals.iter_mut() {
      *r = r.wrapping_sub(min);
    }
    if !vbyte::tput_block(w, &residuals) {
      w.rewind(oldpos);
      self.prev = saved_prev;
      return false;
    }
    true
  }

  /// Individual write, used only after the last full block. The first call
  /// emits a zero minimum so the decoder's per-block state lines up.
  pub fn put(&mut self, w: &mut StreamWriter, value: u64) -> bool {
    if self.put_calls == 0 && !w.put_base128(0) {
      return false;
    }
    self.put_calls += 1;
    let delta = value.wrapping_sub(self.prev);
    self.prev = value;
    self.pair.put(w, delta)
  }

  pub fn commit(&mut self, w: &mut StreamWriter) -> bool {
    self.pair.commit(w)
  }
}

#[derive(Default)]
pub struct DeltaDeltaDecoder {
  prev: u64,
  min: u64,
  counter: usize,
  pair: VBytePairDecoder,
}

impl DeltaDeltaDecoder {
  pub fn next(&mut self, r: &mut StreamReader) -> SdbResult<u64> {
    if self.counter % CHUNK_SIZE == 0 {
      self.min = r.read_base128()?;
    }
    self.counter += 1;
    let delta = self.pair.next(r)?;
    let value = self.prev.wrapping_add(delta).wrapping_add(self.min);
    self.prev = value;
    Ok(value)
  }
}

/// Delta then run-length encoding, each run emitted as a base128
/// `(count, delta)` pair. Input must be non-decreasing (chunk order sorts
/// ids before encoding).
#[derive(Default)]
pub struct DeltaRleEncoder {
  prev: u64,
  run_value: u64,
  run_len: u64,
}

impl DeltaRleEncoder {
  pub fn put(&mut self, w: &mut StreamWriter, value: u64) -> bool {
    let delta = value.wrapping_sub(self.prev);
    self.prev = value;
    if delta != self.run_value {
      if self.run_len > 0 && !self.flush(w) {
        return false;
      }
      self.run_value = delta;
      self.run_len = 0;
    }
    self.run_len += 1;
    true
  }

  fn flush(&mut self, w: &mut StreamWriter) -> bool {
    let oldpos = w.pos();
    if !w.put_base128(self.run_len) {
      return false;
    }
    if !w.put_base128(self.run_value) {
      w.rewind(oldpos);
      return false;
    }
    true
  }

  pub fn close(&mut self, w: &mut StreamWriter) -> bool {
    self.flush(w)
  }
}

#[derive(Default)]
pub struct DeltaRleDecoder {
  prev: u64,
  run_value: u64,
  run_remaining: u64,
}

impl DeltaRleDecoder {
  pub fn next(&mut self, r: &mut StreamReader) -> SdbResult<u64> {
    if self.run_remaining == 0 {
      self.run_remaining = r.read_base128()?;
      self.run_value = r.read_base128()?;
      if self.run_remaining == 0 {
        return Err(SdbError::bad_data("zero-length run in id column"));
      }
    }
    self.run_remaining -= 1;
    let value = self.prev.wrapping_add(self.run_value);
    self.prev = value;
    Ok(value)
  }
}
