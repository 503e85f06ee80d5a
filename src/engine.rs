//! Top-level engine: a ring of pages, the series matcher, the decoded
//! chunk cache and the ingest buffer. Samples accumulate in arrival
//! order; every 16 samples the buffer is sorted to chunk order and
//! committed to the active page as a compressed chunk. When a page fills
//! up the engine rotates to the next one and reuses it, which bumps the
//! page generation and invalidates its cache entries. Nothing here is a
//! process-wide singleton: the cache and the search statistics are owned
//! by the engine.

use log::debug;
use parking_lot::Mutex;

use crate::cache::ChunkCache;
use crate::chunk;
use crate::chunk::UncompressedChunk;
use crate::constants::{CHUNK_SIZE, DEFAULT_CACHE_LIMIT, DEFAULT_STARTING_ID, NULL_PARAM_ID};
use crate::errors::{ErrorKind, SdbError, SdbResult};
use crate::matcher::SeriesMatcher;
use crate::page::{Page, StorageStats};
use crate::query::{Direction, QueryNode, QueryRange, SeriesFilter};
use crate::search::SearchStats;
use crate::session::{Session, Suggest};
use crate::types::{ParamId, Sample, Sink};

#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
  pub page_size: usize,
  pub num_pages: u32,
  pub cache_limit: usize,
  pub starting_id: ParamId,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      page_size: 8 * 1024 * 1024,
      num_pages: 8,
      cache_limit: DEFAULT_CACHE_LIMIT,
      starting_id: DEFAULT_STARTING_ID,
    }
  }
}

struct Store {
  pages: Vec<Page>,
  active: usize,
  buffer: UncompressedChunk,
}

pub struct Engine {
  matcher: SeriesMatcher,
  cache: ChunkCache,
  store: Mutex<Store>,
  stats: Mutex<SearchStats>,
}

impl Engine {
  pub fn new(config: EngineConfig) -> Self {
    assert!(config.num_pages > 0);
    let pages = (0..config.num_pages)
      .map(|id| {
        let mut page = Page::new(config.page_size, id, config.num_pages);
        if id == 0 {
          page.reuse(); // the first writer page is open from the start
        }
        page
      })
      .collect();
    Self {
      matcher: SeriesMatcher::new(config.starting_id),
      cache: ChunkCache::new(config.cache_limit),
      store: Mutex::new(Store {
        pages,
        active: 0,
        buffer: UncompressedChunk::default(),
      }),
      stats: Mutex::new(SearchStats::default()),
    }
  }

  pub fn matcher(&self) -> &SeriesMatcher {
    &self.matcher
  }

  /// Force-commit a partially filled ingest buffer.
  pub fn flush(&self) -> SdbResult<()> {
    let mut store = self.store.lock();
    self.commit_buffer(&mut store)
  }

  pub fn search_stats(&self, reset: bool) -> SearchStats {
    let mut stats = self.stats.lock();
    let out = *stats;
    if reset {
      *stats = SearchStats::default();
    }
    out
  }

  pub fn storage_stats(&self) -> StorageStats {
    let store = self.store.lock();
    let mut stats = StorageStats::default();
    for page in &store.pages {
      page.collect_stats(&mut stats);
    }
    stats
  }

  fn commit_buffer(&self, store: &mut Store) -> SdbResult<()> {
    if store.buffer.is_empty() {
      return Ok(());
    }
    let data = chunk::convert_from_time_order(&store.buffer);
    let mut rotations = 0;
    loop {
      let active = store.active;
      let page = &mut store.pages[active];
      // complete_chunk is all-or-nothing, so rotation needs no cleanup
      match page.complete_chunk(&data) {
        Ok(()) => {
          store.buffer.clear();
          return Ok(());
        }
        Err(err) if err.kind == ErrorKind::Overflow => {
          page.close();
          if rotations >= store.pages.len() {
            return Err(SdbError::overflow("chunk does not fit in an empty page"));
          }
          rotations += 1;
          store.active = (active + 1) % store.pages.len();
          let next = &mut store.pages[store.active];
          next.reuse();
          debug!("rotated to page {}", store.active);
        }
        Err(err) => return Err(err),
      }
    }
  }

  fn run_query(
    &self,
    range: &QueryRange,
    filter: &SeriesFilter,
    sink: &mut dyn Sink,
  ) -> SdbResult<()> {
    if !range.is_valid() {
      return Err(SdbError::bad_arg("query upper bound is below lower bound"));
    }
    let store = self.store.lock();
    let mut stats = self.stats.lock();
    // pages ordered from oldest data to newest: the slot after the
    // active one is the oldest generation
    let n = store.pages.len();
    let mut order: Vec<usize> = (1..=n).map(|k| (store.active + k) % n).collect();
    if range.direction == Direction::Backward {
      order.reverse();
    }
    for ix in order {
      let page = &store.pages[ix];
      if page.count() == 0 && !(range.continuous && ix == store.active) {
        continue;
      }
      page.search(range, filter, sink, Some(&self.cache), &mut stats)?;
    }
    Ok(())
  }
}

impl Default for Engine {
  fn default() -> Self {
    Self::new(EngineConfig::default())
  }
}

impl Session for Engine {
  fn write(&self, sample: &Sample) -> SdbResult<()> {
    if sample.param_id == NULL_PARAM_ID {
      return Err(SdbError::bad_arg("sample has no series id"));
    }
    let mut store = self.store.lock();
    store
      .buffer
      .push(sample.param_id, sample.timestamp, sample.value);
    if store.buffer.len() >= CHUNK_SIZE {
      self.commit_buffer(&mut store)?;
    }
    Ok(())
  }

  fn query(&self, range: &QueryRange, node: &QueryNode, sink: &mut dyn Sink) -> SdbResult<()> {
    let postings = self.matcher.search_postings(node);
    let filter = SeriesFilter::from_postings(&postings);
    self.run_query(range, &filter, sink)
  }

  fn suggest(&self, request: &Suggest) -> Vec<Vec<u8>> {
    match request {
      Suggest::MetricNames { prefix } => self.matcher.suggest_metric(prefix),
      Suggest::Tags { metric, prefix } => self.matcher.suggest_tags(metric, prefix),
      Suggest::TagValues {
        metric,
        tag,
        prefix,
      } => self.matcher.suggest_tag_values(metric, tag, prefix),
    }
  }

  fn search(&self, node: &QueryNode) -> Vec<(Vec<u8>, ParamId)> {
    self.matcher.search(node)
  }

  fn param_id_to_series(&self, id: ParamId, buf: &mut [u8]) -> isize {
    match self.matcher.id_to_name(id) {
      Some(name) => {
        if name.len() > buf.len() {
          return -(name.len() as isize);
        }
        buf[..name.len()].copy_from_slice(&name);
        name.len() as isize
      }
      None => 0,
    }
  }

  fn series_to_param_id(&self, name: &[u8], sample: &mut Sample) -> SdbResult<()> {
    let id = self.matcher.add(name)?;
    sample.param_id = id;
    Ok(())
  }

  fn name_to_param_id_list(&self, names: &[u8], ids: &mut [ParamId]) -> isize {
    let parts: Vec<&[u8]> = names.split(|&b| b == b':').collect();
    if parts.len() > ids.len() {
      return -(parts.len() as isize);
    }
    for (slot, part) in ids.iter_mut().zip(&parts) {
      *slot = self.matcher.match_name(part);
    }
    parts.len() as isize
  }
}
