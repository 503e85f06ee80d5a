//! Column-oriented chunk codec for the page engine. Triples are stored as
//! three length-prefixed columns: series ids as delta-RLE base128,
//! timestamps as delta-delta VByte, values as FCM pair-coded residuals.
//! Bit exactness of this layout is an on-disk compatibility requirement.

use crate::codecs::{DeltaDeltaDecoder, DeltaDeltaEncoder, DeltaRleDecoder, DeltaRleEncoder};
use crate::constants::{CHUNK_DESC_SIZE, CHUNK_SIZE};
use crate::errors::{SdbError, SdbResult};
use crate::fcm::{FcmDecoder, FcmEncoder};
use crate::stream::{StreamReader, StreamWriter};
use crate::types::{ParamId, Timestamp};

/// Decoded chunk columns. In chunk order rows are sorted by
/// `(param_id, timestamp)`; in time order by `timestamp`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UncompressedChunk {
  pub param_ids: Vec<ParamId>,
  pub timestamps: Vec<Timestamp>,
  pub values: Vec<f64>,
}

impl UncompressedChunk {
  pub fn len(&self) -> usize {
    self.timestamps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.timestamps.is_empty()
  }

  pub fn push(&mut self, id: ParamId, ts: Timestamp, value: f64) {
    self.param_ids.push(id);
    self.timestamps.push(ts);
    self.values.push(value);
  }

  pub fn clear(&mut self) {
    self.param_ids.clear();
    self.timestamps.clear();
    self.values.clear();
  }

  /// Decoded footprint in bytes; the buffer cache budget is counted in
  /// these.
  pub fn mem_size(&self) -> usize {
    self.param_ids.len() * 8 + self.timestamps.len() * 8 + self.values.len() * 8
  }
}

/// Locator of a compressed chunk inside a page, stored as the payload of
/// both anchor entries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChunkDesc {
  pub n_elements: u32,
  pub begin_offset: u32,
  pub end_offset: u32,
  pub checksum: u32,
}

impl ChunkDesc {
  pub fn encode(&self) -> [u8; CHUNK_DESC_SIZE] {
    let mut out = [0u8; CHUNK_DESC_SIZE];
    out[0..4].copy_from_slice(&self.n_elements.to_le_bytes());
    out[4..8].copy_from_slice(&self.begin_offset.to_le_bytes());
    out[8..12].copy_from_slice(&self.end_offset.to_le_bytes());
    out[12..16].copy_from_slice(&self.checksum.to_le_bytes());
    out
  }

  pub fn decode(bytes: &[u8]) -> SdbResult<Self> {
    if bytes.len() < CHUNK_DESC_SIZE {
      return Err(SdbError::bad_data("chunk descriptor is truncated"));
    }
    let mut r = StreamReader::new(bytes);
    Ok(Self {
      n_elements: r.read_u32()?,
      begin_offset: r.read_u32()?,
      end_offset: r.read_u32()?,
      checksum: r.read_u32()?,
    })
  }
}

/// Allocator the page hands to the codec: a contiguous free region and a
/// commit that advances the page write pointer.
pub trait ChunkSink {
  fn allocate(&mut self) -> &mut [u8];
  fn commit(&mut self, nbytes: usize) -> SdbResult<()>;
}

#[derive(Clone, Copy, Debug)]
pub struct ChunkStats {
  pub n_elements: u32,
  pub first_ts: Timestamp,
  pub last_ts: Timestamp,
}

/// Encode the chunk columns into the sink's free region. On success the
/// sink has been committed with the exact byte count.
pub fn encode_chunk(sink: &mut dyn ChunkSink, data: &UncompressedChunk) -> SdbResult<ChunkStats> {
  if data.is_empty() {
    return Err(SdbError::bad_arg("cannot encode an empty chunk"));
  }
  debug_assert_eq!(data.param_ids.len(), data.timestamps.len());
  debug_assert_eq!(data.values.len(), data.timestamps.len());

  fn overflow() -> SdbError {
    SdbError::overflow("no room for chunk")
  }
  let region = sink.allocate();
  let mut w = StreamWriter::new(region);

  // id column
  let id_len_at = w.allocate_u32().ok_or_else(overflow)?;
  let id_start = w.pos();
  let mut id_enc = DeltaRleEncoder::default();
  for &id in &data.param_ids {
    if !id_enc.put(&mut w, id) {
      return Err(overflow());
    }
  }
  if !id_enc.close(&mut w) {
    return Err(overflow());
  }
  let id_len = (w.pos() - id_start) as u32;
  w.patch_u32(id_len_at, id_len);

  // ts column
  let ts_len_at = w.allocate_u32().ok_or_else(overflow)?;
  let ts_start = w.pos();
  let mut ts_enc = DeltaDeltaEncoder::default();
  let mut first_ts = Timestamp::MAX;
  let mut last_ts = Timestamp::MIN;
  let mut block = [0u64; CHUNK_SIZE];
  let mut chunks = data.timestamps.chunks_exact(CHUNK_SIZE);
  for full in chunks.by_ref() {
    block.copy_from_slice(full);
    if !ts_enc.tput(&mut w, &block) {
      return Err(overflow());
    }
  }
  for &ts in chunks.remainder() {
    if !ts_enc.put(&mut w, ts) {
      return Err(overflow());
    }
  }
  if !ts_enc.commit(&mut w) {
    return Err(overflow());
  }
  for &ts in &data.timestamps {
    first_ts = first_ts.min(ts);
    last_ts = last_ts.max(ts);
  }
  let ts_len = (w.pos() - ts_start) as u32;
  w.patch_u32(ts_len_at, ts_len);

  // payload: column count, element count, value bytes
  if !w.put_u32(1) {
    return Err(overflow());
  }
  if !w.put_u32(data.values.len() as u32) {
    return Err(overflow());
  }
  let mut val_enc = FcmEncoder::new();
  for &v in &data.values {
    if !val_enc.put(&mut w, v) {
      return Err(overflow());
    }
  }
  if !val_enc.commit(&mut w) {
    return Err(overflow());
  }

  let nbytes = w.pos();
  sink.commit(nbytes)?;
  Ok(ChunkStats {
    n_elements: data.len() as u32,
    first_ts,
    last_ts,
  })
}

pub fn decode_chunk(bytes: &[u8], n_elements: u32) -> SdbResult<UncompressedChunk> {
  let mut r = StreamReader::new(bytes);
  let n = n_elements as usize;
  let mut out = UncompressedChunk::default();

  let id_len = r.read_u32()? as usize;
  let id_start = r.pos();
  let mut id_dec = DeltaRleDecoder::default();
  out.param_ids.reserve(n);
  for _ in 0..n {
    out.param_ids.push(id_dec.next(&mut r)?);
  }
  if r.pos() - id_start != id_len {
    return Err(SdbError::bad_data("id column length mismatch"));
  }

  let ts_len = r.read_u32()? as usize;
  let ts_start = r.pos();
  let mut ts_dec = DeltaDeltaDecoder::default();
  out.timestamps.reserve(n);
  for _ in 0..n {
    out.timestamps.push(ts_dec.next(&mut r)?);
  }
  if r.pos() - ts_start != ts_len {
    return Err(SdbError::bad_data("timestamp column length mismatch"));
  }

  let _ncolumns = r.read_u32()?;
  let nvalues = r.read_u32()? as usize;
  if nvalues != n {
    return Err(SdbError::bad_data("value column count mismatch"));
  }
  let mut val_dec = FcmDecoder::new();
  out.values.reserve(n);
  for _ in 0..n {
    out.values.push(val_dec.next(&mut r)?);
  }
  Ok(out)
}

fn reorder_by_index(data: &UncompressedChunk, index: Vec<usize>) -> UncompressedChunk {
  let mut out = UncompressedChunk::default();
  out.param_ids.reserve(index.len());
  out.timestamps.reserve(index.len());
  out.values.reserve(index.len());
  for ix in index {
    out.param_ids.push(data.param_ids[ix]);
    out.timestamps.push(data.timestamps[ix]);
    out.values.push(data.values[ix]);
  }
  out
}

/// Chunk order -> time order (stable sort on timestamp).
pub fn convert_from_chunk_order(data: &UncompressedChunk) -> UncompressedChunk {
  let mut index: Vec<usize> = (0..data.len()).collect();
  index.sort_by_key(|&ix| data.timestamps[ix]);
  reorder_by_index(data, index)
}

/// Time order -> chunk order (stable sort on series id).
pub fn convert_from_time_order(data: &UncompressedChunk) -> UncompressedChunk {
  let mut index: Vec<usize> = (0..data.len()).collect();
  index.sort_by_key(|&ix| data.param_ids[ix]);
  reorder_by_index(data, index)
}
