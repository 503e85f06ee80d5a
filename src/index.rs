//! Inverted series index. Canonical names live in the string pool; two
//! hash-keyed posting maps go from metric hash and tag=value hash to the
//! ids carrying them, and a topology map records which tags and values
//! exist under each metric. Posting lookups may contain hash false
//! positives; the query layer's lexical filter restores exactness.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::canonical;
use crate::constants::{DEFAULT_STARTING_ID, MAX_SNAME, RESERVED_ID_THRESHOLD};
use crate::errors::{SdbError, SdbResult};
use crate::postings::PostingList;
use crate::stringpool::{hash_bytes, HandleTable, StringHandle, StringPool};
use crate::types::ParamId;

type Topology = BTreeMap<Vec<u8>, BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>>;

pub struct Index {
  pool: StringPool,
  name_table: HandleTable,
  id_names: Vec<StringHandle>,
  metric_postings: HashMap<u64, PostingList>,
  tagvalue_postings: HashMap<u64, PostingList>,
  topology: Topology,
  starting_id: ParamId,
}

/// Outcome of an append: the id is stable across repeated appends of the
/// same canonical name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
  pub id: ParamId,
  pub handle: StringHandle,
  pub created: bool,
}

impl Index {
  pub fn new(starting_id: ParamId) -> Self {
    assert!(starting_id > 0, "id 0 is reserved");
    assert!(starting_id < RESERVED_ID_THRESHOLD);
    Self {
      pool: StringPool::new(),
      name_table: HandleTable::new(),
      id_names: Vec::new(),
      metric_postings: HashMap::new(),
      tagvalue_postings: HashMap::new(),
      topology: Topology::new(),
      starting_id,
    }
  }

  pub fn cardinality(&self) -> usize {
    self.id_names.len()
  }

  pub fn starting_id(&self) -> ParamId {
    self.starting_id
  }

  /// Canonicalize and intern a raw series name, assigning the next id to
  /// a name seen for the first time. No side effects on bad input.
  pub fn append(&mut self, raw: &[u8]) -> SdbResult<IndexEntry> {
    let mut scratch = [0u8; MAX_SNAME];
    let canonical = canonical::to_canonical_form(raw, &mut scratch)?;
    let name = &scratch[..canonical.len];

    if let Some(id) = self.name_table.get(&self.pool, name) {
      let handle = self.id_names[(id - self.starting_id) as usize];
      return Ok(IndexEntry {
        id,
        handle,
        created: false,
      });
    }

    let id = self.starting_id + self.id_names.len() as u64;
    if id >= RESERVED_ID_THRESHOLD {
      return Err(SdbError::overflow("series id space is exhausted"));
    }
    let handle = self.pool.add(name);
    if handle.is_null() {
      return Err(SdbError::bad_data("cannot intern an empty name"));
    }
    self.id_names.push(handle);

    let metric = canonical::metric_of(name);
    self
      .metric_postings
      .entry(hash_bytes(metric))
      .or_default()
      .push(id);
    for span in canonical::tag_spans(name) {
      self
        .tagvalue_postings
        .entry(hash_bytes(span))
        .or_default()
        .push(id);
    }
    self.update_topology(name)?;
    self.name_table.insert(&self.pool, handle, id);
    Ok(IndexEntry {
      id,
      handle,
      created: true,
    })
  }

  fn update_topology(&mut self, name: &[u8]) -> SdbResult<()> {
    let metric = canonical::metric_of(name).to_vec();
    let tag_table = self.topology.entry(metric).or_default();
    for span in canonical::tag_spans(name) {
      let (tag, value) =
        canonical::split_pair(span).ok_or_else(|| SdbError::bad_data("malformed tag"))?;
      tag_table
        .entry(tag.to_vec())
        .or_default()
        .insert(value.to_vec());
    }
    Ok(())
  }

  /// Look up a raw name without inserting; `0` means unknown.
  pub fn find(&self, raw: &[u8]) -> SdbResult<ParamId> {
    let mut scratch = [0u8; MAX_SNAME];
    let canonical = canonical::to_canonical_form(raw, &mut scratch)?;
    let name = &scratch[..canonical.len];
    Ok(self.name_table.get(&self.pool, name).unwrap_or(0))
  }

  /// Canonical name bytes for an id assigned by this index.
  pub fn str_of(&self, id: ParamId) -> Option<&[u8]> {
    if id < self.starting_id {
      return None;
    }
    let ix = (id - self.starting_id) as usize;
    self.pool.get(*self.id_names.get(ix)?)
  }

  /// Posting list of ids whose metric hashes like `metric`. May contain
  /// false positives.
  pub fn metric_query(&self, metric: &[u8]) -> PostingList {
    self
      .metric_postings
      .get(&hash_bytes(metric))
      .cloned()
      .unwrap_or_default()
  }

  /// Posting list of ids carrying a tag=value span with this hash. May
  /// contain false positives.
  pub fn tagvalue_query(&self, pair: &[u8]) -> PostingList {
    self
      .tagvalue_postings
      .get(&hash_bytes(pair))
      .cloned()
      .unwrap_or_default()
  }

  pub fn list_metric_names(&self) -> Vec<Vec<u8>> {
    self.topology.keys().cloned().collect()
  }

  pub fn list_tags(&self, metric: &[u8]) -> Vec<Vec<u8>> {
    self
      .topology
      .get(metric)
      .map(|tags| tags.keys().cloned().collect())
      .unwrap_or_default()
  }

  pub fn list_tag_values(&self, metric: &[u8], tag: &[u8]) -> Vec<Vec<u8>> {
    self
      .topology
      .get(metric)
      .and_then(|tags| tags.get(tag))
      .map(|values| values.iter().cloned().collect())
      .unwrap_or_default()
  }

  pub fn pool_memory_use(&self) -> usize {
    self.pool.mem_used()
  }

  pub fn index_memory_use(&self) -> usize {
    let metric: usize = self.metric_postings.values().map(|p| p.size_in_bytes()).sum();
    let tagvalue: usize = self
      .tagvalue_postings
      .values()
      .map(|p| p.size_in_bytes())
      .sum();
    metric + tagvalue
  }
}

impl Default for Index {
  fn default() -> Self {
    Self::new(DEFAULT_STARTING_ID)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_append_assigns_sequential_ids() {
    let mut index = Index::default();
    let a = index.append(b"cpu host=h1").unwrap();
    let b = index.append(b"cpu host=h2").unwrap();
    let c = index.append(b"mem host=h1").unwrap();
    assert_eq!((a.id, b.id, c.id), (1, 2, 3));
    assert!(a.created && b.created && c.created);
  }

  #[test]
  fn test_append_is_stable_across_tag_order() {
    let mut index = Index::default();
    let a = index.append(b"cpu os=linux host=h1").unwrap();
    let b = index.append(b"cpu host=h1 os=linux").unwrap();
    assert_eq!(a.id, b.id);
    assert!(!b.created);
    assert_eq!(index.cardinality(), 1);
  }

  #[test]
  fn test_append_bad_name_has_no_side_effects() {
    let mut index = Index::default();
    assert!(index.append(b"cpu").is_err());
    assert_eq!(index.cardinality(), 0);
    assert!(index.list_metric_names().is_empty());
  }

  #[test]
  fn test_queries_return_posted_ids() {
    let mut index = Index::default();
    index.append(b"cpu host=h1").unwrap();
    index.append(b"cpu host=h2").unwrap();
    index.append(b"mem host=h1").unwrap();
    assert_eq!(index.metric_query(b"cpu").to_vec(), vec![1, 2]);
    assert_eq!(index.metric_query(b"mem").to_vec(), vec![3]);
    assert_eq!(index.tagvalue_query(b"host=h1").to_vec(), vec![1, 3]);
    assert!(index.metric_query(b"disk").is_empty());
  }

  #[test]
  fn test_str_of_round_trips() {
    let mut index = Index::default();
    let e = index.append(b"cpu  os=linux   host=h1").unwrap();
    assert_eq!(
      index.str_of(e.id),
      Some(&b"cpu host=h1 os=linux"[..])
    );
    assert_eq!(index.str_of(999), None);
  }

  #[test]
  fn test_topology_listing() {
    let mut index = Index::default();
    index.append(b"cpu host=h1 os=linux").unwrap();
    index.append(b"cpu host=h2").unwrap();
    assert_eq!(index.list_metric_names(), vec![b"cpu".to_vec()]);
    assert_eq!(
      index.list_tags(b"cpu"),
      vec![b"host".to_vec(), b"os".to_vec()]
    );
    assert_eq!(
      index.list_tag_values(b"cpu", b"host"),
      vec![b"h1".to_vec(), b"h2".to_vec()]
    );
    assert!(index.list_tag_values(b"mem", b"host").is_empty());
  }

  #[test]
  fn test_find_does_not_insert() {
    let mut index = Index::default();
    index.append(b"cpu host=h1").unwrap();
    assert_eq!(index.find(b"cpu host=h1").unwrap(), 1);
    assert_eq!(index.find(b"cpu host=h9").unwrap(), 0);
    assert_eq!(index.cardinality(), 1);
  }
}
