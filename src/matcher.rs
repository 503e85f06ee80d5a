//! Bidirectional series matcher: raw names in, stable ids out. Wraps the
//! inverted index behind one mutex and keeps a journal of freshly added
//! names that a downstream consumer drains with an atomic swap.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;

use crate::canonical;
use crate::constants::{DEFAULT_STARTING_ID, MAX_SNAME};
use crate::errors::SdbResult;
use crate::index::Index;
use crate::postings::PostingList;
use crate::query;
use crate::query::QueryNode;
use crate::types::{ParamId, Sample};

/// (canonical name, id)
pub type SeriesName = (Vec<u8>, ParamId);

struct Inner {
  index: Index,
  names: Vec<SeriesName>,
}

pub struct SeriesMatcher {
  inner: Mutex<Inner>,
}

impl SeriesMatcher {
  pub fn new(starting_id: ParamId) -> Self {
    Self {
      inner: Mutex::new(Inner {
        index: Index::new(starting_id),
        names: Vec::new(),
      }),
    }
  }

  /// Intern a raw series name, assigning an id on first sight. Re-adding
  /// an equivalent name (same tags in any order) returns the same id.
  pub fn add(&self, raw: &[u8]) -> SdbResult<ParamId> {
    let mut inner = self.inner.lock();
    let entry = inner.index.append(raw)?;
    if entry.created {
      let name = inner
        .index
        .str_of(entry.id)
        .expect("freshly appended name must resolve")
        .to_vec();
      inner.names.push((name, entry.id));
    }
    Ok(entry.id)
  }

  /// Resolve without inserting; `0` means unknown.
  pub fn match_name(&self, raw: &[u8]) -> ParamId {
    let inner = self.inner.lock();
    inner.index.find(raw).unwrap_or(0)
  }

  /// Canonical name for an id, or `None` for an unknown id.
  pub fn id_to_name(&self, id: ParamId) -> Option<Vec<u8>> {
    let inner = self.inner.lock();
    inner.index.str_of(id).map(|bytes| bytes.to_vec())
  }

  /// Drain the journal of names added since the previous pull.
  pub fn pull_new_names(&self, buffer: &mut Vec<SeriesName>) {
    let mut inner = self.inner.lock();
    std::mem::swap(&mut inner.names, buffer);
  }

  pub fn get_all_ids(&self) -> Vec<ParamId> {
    let inner = self.inner.lock();
    let base = inner.index.starting_id();
    (0..inner.index.cardinality() as u64).map(|ix| base + ix).collect()
  }

  /// Run a query node; every posted id must resolve to a name.
  pub fn search(&self, node: &QueryNode) -> Vec<SeriesName> {
    let inner = self.inner.lock();
    let postings = query::execute(node, &inner.index);
    postings
      .iter()
      .map(|id| {
        let name = inner
          .index
          .str_of(id)
          .expect("invalid index state: posted id has no name");
        (name.to_vec(), id)
      })
      .collect()
  }

  /// Posting list for a query node, for callers that only need ids.
  pub fn search_postings(&self, node: &QueryNode) -> PostingList {
    let inner = self.inner.lock();
    query::execute(node, &inner.index)
  }

  pub fn suggest_metric(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
    let inner = self.inner.lock();
    let mut names = inner.index.list_metric_names();
    names.retain(|name| name.starts_with(prefix));
    names
  }

  pub fn suggest_tags(&self, metric: &[u8], prefix: &[u8]) -> Vec<Vec<u8>> {
    let inner = self.inner.lock();
    let mut tags = inner.index.list_tags(metric);
    tags.retain(|tag| tag.starts_with(prefix));
    tags
  }

  pub fn suggest_tag_values(&self, metric: &[u8], tag: &[u8], prefix: &[u8]) -> Vec<Vec<u8>> {
    let inner = self.inner.lock();
    let mut values = inner.index.list_tag_values(metric, tag);
    values.retain(|value| value.starts_with(prefix));
    values
  }

  pub fn cardinality(&self) -> usize {
    self.inner.lock().index.cardinality()
  }
}

impl Default for SeriesMatcher {
  fn default() -> Self {
    Self::new(DEFAULT_STARTING_ID)
  }
}

/// Rewrites series ids onto a coarser keyspace: series of one metric that
/// carry the listed tags are grouped by the values of those tags alone,
/// every other tag stripped. Samples of grouped series are renumbered to
/// the id of their group name.
pub struct GroupByTag {
  metric: Vec<u8>,
  tags: BTreeSet<Vec<u8>>,
  tag_list: Vec<Vec<u8>>,
  local_matcher: SeriesMatcher,
  mapping: HashMap<ParamId, ParamId>,
  seen: usize,
}

impl GroupByTag {
  pub fn new(matcher: &SeriesMatcher, metric: &[u8], tags: &[Vec<u8>]) -> SdbResult<Self> {
    let mut grouper = Self {
      metric: metric.to_vec(),
      tags: tags.iter().cloned().collect(),
      tag_list: tags.to_vec(),
      local_matcher: SeriesMatcher::new(1),
      mapping: HashMap::new(),
      seen: 0,
    };
    grouper.refresh(matcher)?;
    Ok(grouper)
  }

  /// Re-scan the source matcher for series added since the last refresh.
  pub fn refresh(&mut self, matcher: &SeriesMatcher) -> SdbResult<()> {
    let node = QueryNode::IncludeIfHasTag {
      metric: self.metric.clone(),
      tags: self.tag_list.clone(),
    };
    let mut out = [0u8; MAX_SNAME];
    for (name, id) in matcher.search(&node) {
      if self.mapping.contains_key(&id) {
        continue;
      }
      match canonical::filter_tags(&name, &self.tags, &mut out) {
        Ok(filtered) => {
          let local_id = self.local_matcher.add(filtered)?;
          self.mapping.insert(id, local_id);
        }
        Err(_) => continue,
      }
    }
    self.seen = matcher.cardinality();
    Ok(())
  }

  /// True when new series may have appeared since the last refresh.
  pub fn is_stale(&self, matcher: &SeriesMatcher) -> bool {
    matcher.cardinality() != self.seen
  }

  pub fn mapping(&self) -> &HashMap<ParamId, ParamId> {
    &self.mapping
  }

  pub fn group_name(&self, local_id: ParamId) -> Option<Vec<u8>> {
    self.local_matcher.id_to_name(local_id)
  }

  /// Rewrite the sample's id onto its group; `false` drops the sample.
  pub fn apply(&self, sample: &mut Sample) -> bool {
    match self.mapping.get(&sample.param_id) {
      Some(&local_id) => {
        sample.param_id = local_id;
        true
      }
      None => false,
    }
  }
}
