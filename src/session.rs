//! The surface a frontend drives. Wire framing is decoded elsewhere; by
//! the time a sample reaches `write` it is already a
//! `(param_id, timestamp, value)` triple.

use crate::errors::SdbResult;
use crate::query::{QueryNode, QueryRange};
use crate::types::{ParamId, Sample, ScanItem, Sink};

/// Suggestion request for interactive clients.
#[derive(Clone, Debug)]
pub enum Suggest {
  MetricNames {
    prefix: Vec<u8>,
  },
  Tags {
    metric: Vec<u8>,
    prefix: Vec<u8>,
  },
  TagValues {
    metric: Vec<u8>,
    tag: Vec<u8>,
    prefix: Vec<u8>,
  },
}

pub trait Session {
  /// Ingest one sample. The sample's `param_id` must have been resolved
  /// through [`Session::series_to_param_id`].
  fn write(&self, sample: &Sample) -> SdbResult<()>;

  /// Run a data query; matches stream into `sink` in timestamp order
  /// (forward or reversed per the range's direction).
  fn query(&self, range: &QueryRange, node: &QueryNode, sink: &mut dyn Sink) -> SdbResult<()>;

  /// Enumerate metric names, tags or tag values by prefix.
  fn suggest(&self, request: &Suggest) -> Vec<Vec<u8>>;

  /// Run a metadata query; returns the matching canonical names and ids.
  fn search(&self, node: &QueryNode) -> Vec<(Vec<u8>, ParamId)>;

  /// Copy the canonical series name for `id` into `buf`. Returns the
  /// name length, negative when `buf` is too small (the needed
  /// capacity), or `0` for an unknown id.
  fn param_id_to_series(&self, id: ParamId, buf: &mut [u8]) -> isize;

  /// Resolve a raw series name, assigning an id on first sight, and
  /// store it into `sample`.
  fn series_to_param_id(&self, name: &[u8], sample: &mut Sample) -> SdbResult<()>;

  /// Resolve a `:`-separated list of series names into `ids`. Returns
  /// the number of ids, or the negated needed capacity when `ids` is too
  /// small.
  fn name_to_param_id_list(&self, names: &[u8], ids: &mut [ParamId]) -> isize;
}

/// Bounded result cursor. Buffers up to `capacity` samples, then applies
/// backpressure by rejecting further puts; a `NoData` poll also stops the
/// scan so the frontend can drain and resume.
pub struct BufferedCursor {
  samples: Vec<Sample>,
  capacity: usize,
  interrupted: bool,
}

impl BufferedCursor {
  pub fn new(capacity: usize) -> Self {
    Self {
      samples: Vec::new(),
      capacity,
      interrupted: false,
    }
  }

  /// True when the scan stopped early (buffer full or live poll); the
  /// caller should drain and issue a follow-up query.
  pub fn interrupted(&self) -> bool {
    self.interrupted
  }

  pub fn len(&self) -> usize {
    self.samples.len()
  }

  pub fn is_empty(&self) -> bool {
    self.samples.is_empty()
  }

  /// Drain the buffered samples, resetting the cursor.
  pub fn take(&mut self) -> Vec<Sample> {
    self.interrupted = false;
    std::mem::take(&mut self.samples)
  }
}

impl Sink for BufferedCursor {
  fn put(&mut self, item: ScanItem) -> bool {
    match item {
      ScanItem::Sample(sample) => {
        if self.samples.len() >= self.capacity {
          self.interrupted = true;
          return false;
        }
        self.samples.push(sample);
        true
      }
      ScanItem::NoData => {
        self.interrupted = true;
        false
      }
    }
  }
}
