//! Fixed-size appendable page. Entries grow from the low end of the
//! payload; `IndexRecord`s (timestamp + entry offset) grow down from the
//! high end. Timestamps in the index are monotonically non-decreasing,
//! which makes the page searchable by interpolation + binary search.
//! Compressed chunks are committed as a pair of anchor entries holding
//! the same `ChunkDesc`: `CHUNK_BWD_ID` at the first timestamp for
//! backward scans, `CHUNK_FWD_ID` at the last for forward scans.

use std::sync::Arc;

use log::{trace, warn};

use crate::cache::{CacheKey, ChunkCache};
use crate::chunk;
use crate::chunk::{ChunkDesc, ChunkSink, UncompressedChunk};
use crate::constants::{
  CHUNK_BWD_ID, CHUNK_DESC_SIZE, CHUNK_FWD_ID, ENTRY_HEADER_SIZE, FS_PAGE_SIZE, INDEX_RECORD_SIZE,
  RESERVED_ID_THRESHOLD,
};
use crate::errors::{SdbError, SdbResult};
use crate::query::{QueryRange, SeriesFilter};
use crate::search;
use crate::search::{SearchRange, SearchStats, TimeOrdered};
use crate::types::{ParamId, Sample, ScanItem, Sink, Timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexRecord {
  pub timestamp: Timestamp,
  pub offset: u32,
}

/// Space accounting, accumulated across pages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageStats {
  pub used_space: u64,
  pub free_space: u64,
  pub n_entries: u64,
  pub n_pages: u64,
}

/// Borrowed view of one entry.
pub struct EntryRef<'a> {
  pub param_id: ParamId,
  pub value: &'a [u8],
}

pub struct Page {
  version: u32,
  count: u32,
  next_offset: u32,
  checkpoint: u32,
  open_count: u32,
  close_count: u32,
  page_id: u32,
  numpages: u32,
  payload: Vec<u8>,
}

impl Page {
  pub fn new(length: usize, page_id: u32, numpages: u32) -> Self {
    Self {
      version: 0,
      count: 0,
      next_offset: 0,
      checkpoint: 0,
      open_count: 0,
      close_count: 0,
      page_id,
      numpages,
      payload: vec![0; length],
    }
  }

  pub fn version(&self) -> u32 {
    self.version
  }

  pub fn page_id(&self) -> u32 {
    self.page_id
  }

  pub fn numpages(&self) -> u32 {
    self.numpages
  }

  pub fn open_count(&self) -> u32 {
    self.open_count
  }

  pub fn close_count(&self) -> u32 {
    self.close_count
  }

  pub fn count(&self) -> u32 {
    self.count
  }

  /// Last committed index slot; readers acquire the page at this count.
  pub fn sync_count(&self) -> u32 {
    self.count
  }

  pub fn checkpoint(&self) -> u32 {
    self.checkpoint
  }

  pub fn next_offset(&self) -> u32 {
    self.next_offset
  }

  /// Bytes between the low-end write pointer and the high-end index
  /// pointer.
  pub fn free_space(&self) -> usize {
    let index_bytes = self.count as usize * INDEX_RECORD_SIZE;
    self
      .payload
      .len()
      .saturating_sub(index_bytes)
      .saturating_sub(self.next_offset as usize)
  }

  fn index_record_at(&self, k: u32) -> usize {
    self.payload.len() - INDEX_RECORD_SIZE * (k as usize + 1)
  }

  pub fn index_record(&self, k: u32) -> IndexRecord {
    debug_assert!(k < self.count);
    let at = self.index_record_at(k);
    let timestamp = u64::from_le_bytes(self.payload[at..at + 8].try_into().unwrap());
    let offset = u32::from_le_bytes(self.payload[at + 8..at + 12].try_into().unwrap());
    IndexRecord { timestamp, offset }
  }

  fn write_index_record(&mut self, k: u32, rec: IndexRecord) {
    let at = self.index_record_at(k);
    self.payload[at..at + 8].copy_from_slice(&rec.timestamp.to_le_bytes());
    self.payload[at + 8..at + 12].copy_from_slice(&rec.offset.to_le_bytes());
  }

  pub fn timestamp_at(&self, k: u32) -> Timestamp {
    self.index_record(k).timestamp
  }

  pub fn read_entry(&self, offset: u32) -> EntryRef<'_> {
    let at = offset as usize;
    let param_id = u64::from_le_bytes(self.payload[at..at + 8].try_into().unwrap());
    let length = u32::from_le_bytes(self.payload[at + 8..at + 12].try_into().unwrap()) as usize;
    EntryRef {
      param_id,
      value: &self.payload[at + ENTRY_HEADER_SIZE..at + ENTRY_HEADER_SIZE + length],
    }
  }

  pub fn read_entry_at(&self, index: u32) -> Option<EntryRef<'_>> {
    if index < self.count {
      Some(self.read_entry(self.index_record(index).offset))
    } else {
      None
    }
  }

  /// Append a regular entry. Timestamps must be non-decreasing across the
  /// whole page.
  pub fn add_entry(&mut self, param: ParamId, timestamp: Timestamp, value: &[u8]) -> SdbResult<()> {
    if self.count > 0 && timestamp < self.index_record(self.count - 1).timestamp {
      return Err(SdbError::bad_arg("timestamp regression on append"));
    }
    if value.is_empty() {
      return Err(SdbError::bad_data("entry value is empty"));
    }
    let space_required = ENTRY_HEADER_SIZE + value.len() + INDEX_RECORD_SIZE;
    if space_required > self.free_space() {
      return Err(SdbError::overflow("page is full"));
    }
    let at = self.next_offset as usize;
    self.payload[at..at + 8].copy_from_slice(&param.to_le_bytes());
    self.payload[at + 8..at + 12].copy_from_slice(&(value.len() as u32).to_le_bytes());
    self.payload[at + ENTRY_HEADER_SIZE..at + ENTRY_HEADER_SIZE + value.len()]
      .copy_from_slice(value);
    self.write_index_record(
      self.count,
      IndexRecord {
        timestamp,
        offset: self.next_offset,
      },
    );
    self.next_offset += (ENTRY_HEADER_SIZE + value.len()) as u32;
    self.count += 1;
    Ok(())
  }

  /// Append raw bytes without touching the index; `reserve` keeps the
  /// caller's follow-up writes from being starved. Returns the payload
  /// offset of the copy.
  pub fn add_chunk(&mut self, bytes: &[u8], reserve: usize) -> SdbResult<u32> {
    if bytes.len() + reserve > self.free_space() {
      return Err(SdbError::overflow("page is full"));
    }
    let offset = self.next_offset;
    let at = offset as usize;
    self.payload[at..at + bytes.len()].copy_from_slice(bytes);
    self.next_offset += bytes.len() as u32;
    Ok(offset)
  }

  /// Encode the chunk into the page's free region and commit it behind a
  /// pair of anchor entries. All-or-nothing: on any error the page is
  /// rolled back to its state at entry.
  pub fn complete_chunk(&mut self, data: &UncompressedChunk) -> SdbResult<()> {
    let saved_count = self.count;
    let saved_offset = self.next_offset;
    let result = self.complete_chunk_inner(data);
    if result.is_err() {
      self.count = saved_count;
      self.next_offset = saved_offset;
    }
    result
  }

  fn complete_chunk_inner(&mut self, data: &UncompressedChunk) -> SdbResult<()> {
    // room for both anchors must survive the chunk encoding
    let anchor_reserve = 2 * (ENTRY_HEADER_SIZE + CHUNK_DESC_SIZE + INDEX_RECORD_SIZE);
    let begin = self.next_offset as usize;
    let stats = {
      let mut sink = PageChunkSink {
        page: self,
        reserve: anchor_reserve,
      };
      chunk::encode_chunk(&mut sink, data)?
    };
    let end = self.next_offset as usize;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&self.payload[begin..end]);
    let desc = ChunkDesc {
      n_elements: stats.n_elements,
      begin_offset: begin as u32,
      end_offset: end as u32,
      checksum: hasher.finalize(),
    };
    let desc_bytes = desc.encode();
    self.add_entry(CHUNK_BWD_ID, stats.first_ts, &desc_bytes)?;
    self.add_entry(CHUNK_FWD_ID, stats.last_ts, &desc_bytes)?;
    Ok(())
  }

  pub fn create_checkpoint(&mut self) {
    self.checkpoint = self.count;
  }

  /// Roll back to the last checkpoint. Returns `false` when there is
  /// nothing to undo. The write pointer rewinds to the end of the last
  /// surviving entry, reclaiming any orphaned chunk bytes.
  pub fn restore(&mut self) -> bool {
    if self.count == self.checkpoint {
      return false;
    }
    self.count = self.checkpoint;
    self.next_offset = if self.count == 0 {
      0
    } else {
      let rec = self.index_record(self.count - 1);
      let at = rec.offset as usize;
      let length = u32::from_le_bytes(self.payload[at + 8..at + 12].try_into().unwrap());
      rec.offset + ENTRY_HEADER_SIZE as u32 + length
    };
    true
  }

  /// Clear the page for a new generation of data. Bumping `open_count`
  /// changes the generation key, invalidating stale cache entries.
  pub fn reuse(&mut self) {
    self.count = 0;
    self.checkpoint = 0;
    self.next_offset = 0;
    self.open_count += 1;
  }

  pub fn close(&mut self) {
    self.close_count += 1;
  }

  fn is_open_for_writing(&self) -> bool {
    self.open_count > self.close_count
  }

  pub fn collect_stats(&self, stats: &mut StorageStats) {
    let free = self.free_space() as u64;
    stats.used_space += self.payload.len() as u64 - free;
    stats.free_space += free;
    stats.n_entries += self.count as u64;
    stats.n_pages += 1;
  }

  fn generation_key(&self) -> u64 {
    self.numpages as u64 * self.open_count as u64 + self.page_id as u64
  }

  /// Search the page and stream matches into `sink`. See `PageSearch`
  /// for the algorithm stages.
  pub fn search(
    &self,
    range: &QueryRange,
    filter: &SeriesFilter,
    sink: &mut dyn Sink,
    cache: Option<&ChunkCache>,
    stats: &mut SearchStats,
  ) -> SdbResult<()> {
    if !range.is_valid() {
      return Err(SdbError::bad_arg("query upper bound is below lower bound"));
    }
    PageSearch {
      page: self,
      range: *range,
      filter,
      cache,
      key: range.key(),
    }
    .run(sink, stats)
  }
}

struct PageChunkSink<'a> {
  page: &'a mut Page,
  reserve: usize,
}

impl<'a> ChunkSink for PageChunkSink<'a> {
  fn allocate(&mut self) -> &mut [u8] {
    let begin = self.page.next_offset as usize;
    let index_bytes = self.page.count as usize * INDEX_RECORD_SIZE;
    let end = self
      .page
      .payload
      .len()
      .saturating_sub(index_bytes)
      .saturating_sub(self.reserve)
      .max(begin);
    &mut self.page.payload[begin..end]
  }

  fn commit(&mut self, nbytes: usize) -> SdbResult<()> {
    self.page.next_offset += nbytes as u32;
    Ok(())
  }
}

/// Index view the interpolation search probes.
struct PageIndexView<'a> {
  page: &'a Page,
}

impl<'a> TimeOrdered for PageIndexView<'a> {
  fn timestamp_at(&self, ix: u32) -> Option<Timestamp> {
    if ix < self.page.count {
      Some(self.page.index_record(ix).timestamp)
    } else {
      None
    }
  }

  fn is_small(&self, range: SearchRange) -> bool {
    let begin = self.page.index_record(range.begin).offset as usize;
    let end = self.page.index_record(range.end).offset as usize;
    begin / FS_PAGE_SIZE == end / FS_PAGE_SIZE
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScanOutcome {
  Overshoot,
  Undershoot,
  InRange,
  Interrupted,
}

struct PageSearch<'a> {
  page: &'a Page,
  range: QueryRange,
  filter: &'a SeriesFilter,
  cache: Option<&'a ChunkCache>,
  key: Timestamp,
}

impl<'a> PageSearch<'a> {
  fn max_index(&self) -> u32 {
    self.page.sync_count()
  }

  fn run(&self, sink: &mut dyn Sink, stats: &mut SearchStats) -> SdbResult<()> {
    let mut search_range = if self.max_index() > 0 {
      SearchRange {
        begin: 0,
        end: self.max_index() - 1,
      }
    } else {
      SearchRange { begin: 0, end: 0 }
    };
    if self.fast_path(&mut search_range, sink) {
      return Ok(());
    }
    let view = PageIndexView { page: self.page };
    search::interpolation_search(&view, self.key, &mut search_range, stats)?;
    self.binary_search(&mut search_range, stats);
    self.scan(search_range, sink)
  }

  /// Corner cases that skip the search entirely. Returns `true` when the
  /// query is already answered.
  fn fast_path(&self, search_range: &mut SearchRange, sink: &mut dyn Sink) -> bool {
    if self.max_index() == 0 {
      if self.range.continuous && self.page.is_open_for_writing() {
        // poll signal for a live query on a still-empty writer page
        sink.put(ScanItem::NoData);
      }
      return true;
    }
    let first_ts = self.page.timestamp_at(search_range.begin);
    let last_ts = self.page.timestamp_at(search_range.end);
    if self.key > last_ts {
      if self.range.is_backward() {
        search_range.begin = search_range.end;
        return false;
      }
      return true;
    }
    if self.key < first_ts {
      if !self.range.is_backward() {
        search_range.end = search_range.begin;
        return false;
      }
      return true;
    }
    false
  }

  /// Collapse the narrowed range onto one probe index.
  fn binary_search(&self, search_range: &mut SearchRange, stats: &mut SearchStats) {
    if search_range.begin == search_range.end {
      return;
    }
    let max_index = self.max_index();
    let mut steps = 0u64;
    let mut begin = search_range.begin;
    let mut end = search_range.end;
    let mut probe_index = begin;
    loop {
      steps += 1;
      probe_index = begin + (end - begin) / 2;
      let probe = self.page.timestamp_at(probe_index);
      if probe == self.key {
        break;
      } else if probe < self.key {
        begin = probe_index + 1;
        if begin >= max_index {
          break;
        }
      } else {
        if probe_index == 0 {
          break;
        }
        end = probe_index - 1;
      }
      if end < begin {
        break;
      }
    }
    search_range.begin = probe_index;
    search_range.end = probe_index;
    stats.binary.n_times += 1;
    stats.binary.n_steps += steps;
  }

  fn check_timestamp(&self, probe_time: Timestamp) -> ScanOutcome {
    if self.range.is_backward() {
      if probe_time > self.range.hi {
        ScanOutcome::Undershoot
      } else if probe_time < self.range.lo {
        ScanOutcome::Overshoot
      } else {
        ScanOutcome::InRange
      }
    } else if probe_time > self.range.hi {
      ScanOutcome::Overshoot
    } else if probe_time < self.range.lo {
      ScanOutcome::Undershoot
    } else {
      ScanOutcome::InRange
    }
  }

  /// Decode the chunk behind an anchor entry (or fetch it from the
  /// cache), convert to time order and emit the matching samples.
  fn scan_chunk(
    &self,
    current_index: u32,
    entry: &EntryRef,
    sink: &mut dyn Sink,
  ) -> SdbResult<ScanOutcome> {
    let cache_key: CacheKey = (self.page.generation_key(), current_index);
    let header: Arc<UncompressedChunk> = match self.cache.and_then(|c| c.get(cache_key)) {
      Some(cached) => cached,
      None => {
        let desc = ChunkDesc::decode(entry.value)?;
        let begin = desc.begin_offset as usize;
        let end = desc.end_offset as usize;
        if end > self.page.payload.len() || begin > end {
          return Err(SdbError::bad_data("chunk descriptor out of bounds"));
        }
        let bytes = &self.page.payload[begin..end];
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(bytes);
        if hasher.finalize() != desc.checksum {
          warn!(
            "chunk checksum mismatch in page {} at entry {}",
            self.page.page_id, current_index
          );
          return Err(SdbError::bad_data("chunk checksum mismatch"));
        }
        let decoded = chunk::decode_chunk(bytes, desc.n_elements)?;
        let ordered = Arc::new(chunk::convert_from_chunk_order(&decoded));
        if let Some(cache) = self.cache {
          cache.put(cache_key, Arc::clone(&ordered));
        }
        ordered
      }
    };

    let mut outcome = ScanOutcome::Undershoot;
    let len = header.len();
    let indexes: Box<dyn Iterator<Item = usize>> = if self.range.is_backward() {
      Box::new((0..len).rev())
    } else {
      Box::new(0..len)
    };
    for i in indexes {
      outcome = self.check_timestamp(header.timestamps[i]);
      if outcome == ScanOutcome::Overshoot {
        break;
      }
      if outcome == ScanOutcome::InRange && self.filter.matches(header.param_ids[i]) {
        let sample = Sample::new(
          header.param_ids[i],
          header.timestamps[i],
          header.values[i],
        );
        if !sink.put(ScanItem::Sample(sample)) {
          outcome = ScanOutcome::Interrupted;
          break;
        }
      }
    }
    Ok(outcome)
  }

  fn scan(&self, search_range: SearchRange, sink: &mut dyn Sink) -> SdbResult<()> {
    if search_range.begin != search_range.end {
      return Err(SdbError::inconsistent("scan expects a collapsed range"));
    }
    if search_range.begin >= self.max_index() {
      return Err(SdbError::not_found("probe index beyond committed entries"));
    }
    let increment: i64 = if self.range.is_backward() { -1 } else { 1 };
    let max_index = self.max_index() as i64;
    let mut probe_index = search_range.begin as i64;
    let mut last_valid_timestamp: Timestamp = 0;
    loop {
      if probe_index >= 0 && probe_index < max_index {
        let rec = self.page.index_record(probe_index as u32);
        let entry = self.page.read_entry(rec.offset);
        last_valid_timestamp = rec.timestamp;
        let outcome = if entry.param_id == CHUNK_FWD_ID && !self.range.is_backward() {
          self.scan_chunk(probe_index as u32, &entry, sink)?
        } else if entry.param_id == CHUNK_BWD_ID && self.range.is_backward() {
          self.scan_chunk(probe_index as u32, &entry, sink)?
        } else if entry.param_id < RESERVED_ID_THRESHOLD {
          let outcome = self.check_timestamp(rec.timestamp);
          if outcome == ScanOutcome::InRange && self.filter.matches(entry.param_id) {
            match decode_value_payload(entry.value) {
              Some(value) => {
                let sample = Sample::new(entry.param_id, rec.timestamp, value);
                if sink.put(ScanItem::Sample(sample)) {
                  outcome
                } else {
                  ScanOutcome::Interrupted
                }
              }
              None => {
                trace!(
                  "skipping undecodable entry payload for series {}",
                  entry.param_id
                );
                outcome
              }
            }
          } else {
            outcome
          }
        } else {
          // anchor for the opposite scan direction
          self.check_timestamp(rec.timestamp)
        };
        match outcome {
          ScanOutcome::Interrupted | ScanOutcome::Overshoot => return Ok(()),
          _ => {}
        }
        probe_index += increment;
      } else if !self.range.continuous || probe_index < 0 {
        return Ok(());
      } else {
        // Live query at the open tail: re-check the last timestamp and
        // yield through the sink until it cancels or the range is done.
        match self.check_timestamp(last_valid_timestamp) {
          ScanOutcome::InRange | ScanOutcome::Undershoot => {
            if self.page.is_open_for_writing() && sink.put(ScanItem::NoData) {
              continue;
            }
            return Ok(());
          }
          _ => return Ok(()),
        }
      }
    }
  }
}

/// Regular entry payloads carry either a raw little-endian f64 or the
/// text form `+<float>` used by the line protocol.
fn decode_value_payload(bytes: &[u8]) -> Option<f64> {
  if bytes.first() == Some(&b'+') {
    let text = std::str::from_utf8(&bytes[1..]).ok()?;
    return text.trim_end_matches(['\r', '\n']).trim().parse().ok();
  }
  if bytes.len() == 8 {
    return Some(f64::from_le_bytes(bytes.try_into().ok()?));
  }
  None
}
