//! Boolean queries over the inverted index. Nodes are a plain enum with a
//! single dispatch function; each variant composes posting-list algebra
//! and then re-checks every candidate against the canonical string, which
//! removes the hash false positives the posting maps may carry.

use std::collections::BTreeMap;

use crate::canonical;
use crate::index::Index;
use crate::postings::PostingList;
use crate::types::{ParamId, Timestamp};

/// Scan direction through a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
  Forward,
  Backward,
}

/// Time range and mode of a scan. A continuous query follows the open
/// tail of the writer page and is paced through the `NoData` sentinel.
#[derive(Clone, Copy, Debug)]
pub struct QueryRange {
  pub lo: Timestamp,
  pub hi: Timestamp,
  pub direction: Direction,
  pub continuous: bool,
}

impl QueryRange {
  pub fn forward(lo: Timestamp, hi: Timestamp) -> Self {
    Self {
      lo,
      hi,
      direction: Direction::Forward,
      continuous: false,
    }
  }

  pub fn backward(lo: Timestamp, hi: Timestamp) -> Self {
    Self {
      lo,
      hi,
      direction: Direction::Backward,
      continuous: false,
    }
  }

  pub fn is_backward(&self) -> bool {
    self.direction == Direction::Backward
  }

  pub fn is_valid(&self) -> bool {
    self.lo <= self.hi
  }

  /// The timestamp the page search starts from.
  pub fn key(&self) -> Timestamp {
    if self.is_backward() {
      self.hi
    } else {
      self.lo
    }
  }
}

/// Id predicate applied while scanning.
#[derive(Clone, Debug)]
pub enum SeriesFilter {
  All,
  Single(ParamId),
  /// Sorted id set.
  Set(Vec<ParamId>),
}

impl SeriesFilter {
  pub fn from_postings(postings: &PostingList) -> Self {
    SeriesFilter::Set(postings.to_vec())
  }

  pub fn matches(&self, id: ParamId) -> bool {
    match self {
      SeriesFilter::All => true,
      SeriesFilter::Single(want) => *want == id,
      SeriesFilter::Set(ids) => ids.binary_search(&id).is_ok(),
    }
  }
}

/// Query AST. Metrics and pairs are canonical byte strings
/// (`metric`, `tag=value`).
#[derive(Clone, Debug)]
pub enum QueryNode {
  /// Series of `metric` carrying every listed `tag=value`.
  IncludeAllTagsMatch {
    metric: Vec<u8>,
    pairs: Vec<Vec<u8>>,
  },
  /// Series of `metric` where each listed tag takes any of its listed
  /// values.
  IncludeAnyValue {
    metric: Vec<u8>,
    tag_values: BTreeMap<Vec<u8>, Vec<Vec<u8>>>,
  },
  /// Series of `metric` that have all the listed tags, whatever the
  /// values.
  IncludeIfHasTag {
    metric: Vec<u8>,
    tags: Vec<Vec<u8>>,
  },
  /// Series of `metric` carrying none of the listed `tag=value` pairs.
  Exclude {
    metric: Vec<u8>,
    pairs: Vec<Vec<u8>>,
  },
  /// Union over several metrics, optionally narrowed to series carrying
  /// one of the listed `tag=value` pairs.
  JoinByMetrics {
    metrics: Vec<Vec<u8>>,
    pairs: Vec<Vec<u8>>,
  },
}

/// True when `name`'s leading token equals `metric`.
pub fn metric_matches(name: &[u8], metric: &[u8]) -> bool {
  canonical::metric_of(name) == metric
}

/// True when `pair` appears in `name` as a whole `tag=value` token.
pub fn tagvalue_matches(name: &[u8], pair: &[u8]) -> bool {
  canonical::tag_spans(name).any(|span| span == pair)
}

fn filter<F: Fn(&[u8]) -> bool>(postings: PostingList, index: &Index, pred: F) -> PostingList {
  let mut out = PostingList::new();
  let mut dropped = false;
  for id in postings.iter() {
    match index.str_of(id) {
      Some(name) if pred(name) => out.push(id),
      _ => dropped = true,
    }
  }
  if dropped {
    out
  } else {
    postings
  }
}

fn any_value_query(
  index: &Index,
  metric: &[u8],
  tag_values: &BTreeMap<Vec<u8>, Vec<Vec<u8>>>,
) -> PostingList {
  let mut queried_pairs: Vec<Vec<u8>> = Vec::new();
  let mut across_tags: Option<PostingList> = None;
  for (tag, values) in tag_values {
    if values.is_empty() {
      continue;
    }
    let mut per_tag: Option<PostingList> = None;
    for value in values {
      let mut pair = tag.clone();
      pair.push(b'=');
      pair.extend_from_slice(value);
      let hits = index.tagvalue_query(&pair);
      queried_pairs.push(pair);
      per_tag = Some(match per_tag {
        Some(acc) => acc.union(&hits).unique(),
        None => hits,
      });
    }
    let per_tag = per_tag.unwrap();
    across_tags = Some(match across_tags {
      Some(acc) => acc.intersection(&per_tag),
      None => per_tag,
    });
  }
  let metric_hits = index.metric_query(metric);
  let combined = match across_tags {
    Some(acc) => acc.intersection(&metric_hits),
    None => metric_hits,
  };
  let combined = filter(combined, index, |name| metric_matches(name, metric));
  if queried_pairs.is_empty() {
    combined
  } else {
    filter(combined, index, |name| {
      queried_pairs.iter().any(|p| tagvalue_matches(name, p))
    })
  }
}

/// Run a query node against the index. Results are sorted ascending and
/// free of hash false positives.
pub fn execute(node: &QueryNode, index: &Index) -> PostingList {
  match node {
    QueryNode::IncludeAllTagsMatch { metric, pairs } => {
      let mut results = index.metric_query(metric);
      for pair in pairs {
        results = results.intersection(&index.tagvalue_query(pair));
      }
      filter(results, index, |name| {
        metric_matches(name, metric) && pairs.iter().all(|p| tagvalue_matches(name, p))
      })
    }
    QueryNode::IncludeAnyValue { metric, tag_values } => any_value_query(index, metric, tag_values),
    QueryNode::IncludeIfHasTag { metric, tags } => {
      let mut tag_values = BTreeMap::new();
      for tag in tags {
        tag_values.insert(tag.clone(), index.list_tag_values(metric, tag));
      }
      any_value_query(index, metric, &tag_values)
    }
    QueryNode::Exclude { metric, pairs } => {
      let mut excluded = PostingList::new();
      for pair in pairs {
        excluded = excluded.union(&index.tagvalue_query(pair));
      }
      let results = index.metric_query(metric).difference(&excluded);
      filter(results, index, |name| metric_matches(name, metric))
    }
    QueryNode::JoinByMetrics { metrics, pairs } => {
      let mut results = PostingList::new();
      for metric in metrics {
        results = results.union(&index.metric_query(metric));
      }
      let results = filter(results, index, |name| {
        metrics.iter().any(|m| metric_matches(name, m))
      });
      if pairs.is_empty() {
        results
      } else {
        filter(results, index, |name| {
          pairs.iter().any(|p| tagvalue_matches(name, p))
        })
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_index() -> Index {
    let mut index = Index::default();
    index.append(b"cpu host=h1").unwrap(); // 1
    index.append(b"cpu host=h2").unwrap(); // 2
    index.append(b"mem host=h1").unwrap(); // 3
    index.append(b"cpu host=h3 os=bsd").unwrap(); // 4
    index
  }

  #[test]
  fn test_include_all_tags_match() {
    let index = sample_index();
    let node = QueryNode::IncludeAllTagsMatch {
      metric: b"cpu".to_vec(),
      pairs: vec![b"host=h1".to_vec()],
    };
    assert_eq!(execute(&node, &index).to_vec(), vec![1]);
  }

  #[test]
  fn test_include_all_requires_every_pair() {
    let index = sample_index();
    let node = QueryNode::IncludeAllTagsMatch {
      metric: b"cpu".to_vec(),
      pairs: vec![b"host=h3".to_vec(), b"os=bsd".to_vec()],
    };
    assert_eq!(execute(&node, &index).to_vec(), vec![4]);
    let node = QueryNode::IncludeAllTagsMatch {
      metric: b"cpu".to_vec(),
      pairs: vec![b"host=h3".to_vec(), b"os=linux".to_vec()],
    };
    assert!(execute(&node, &index).is_empty());
  }

  #[test]
  fn test_exclude() {
    let index = sample_index();
    let node = QueryNode::Exclude {
      metric: b"cpu".to_vec(),
      pairs: vec![b"host=h2".to_vec()],
    };
    assert_eq!(execute(&node, &index).to_vec(), vec![1, 4]);
  }

  #[test]
  fn test_include_any_value() {
    let index = sample_index();
    let mut tag_values = BTreeMap::new();
    tag_values.insert(
      b"host".to_vec(),
      vec![b"h1".to_vec(), b"h2".to_vec()],
    );
    let node = QueryNode::IncludeAnyValue {
      metric: b"cpu".to_vec(),
      tag_values,
    };
    assert_eq!(execute(&node, &index).to_vec(), vec![1, 2]);
  }

  #[test]
  fn test_include_if_has_tag() {
    let index = sample_index();
    let node = QueryNode::IncludeIfHasTag {
      metric: b"cpu".to_vec(),
      tags: vec![b"os".to_vec()],
    };
    assert_eq!(execute(&node, &index).to_vec(), vec![4]);
  }

  #[test]
  fn test_join_by_metrics() {
    let index = sample_index();
    let node = QueryNode::JoinByMetrics {
      metrics: vec![b"cpu".to_vec(), b"mem".to_vec()],
      pairs: Vec::new(),
    };
    assert_eq!(execute(&node, &index).to_vec(), vec![1, 2, 3, 4]);
    let node = QueryNode::JoinByMetrics {
      metrics: vec![b"cpu".to_vec(), b"mem".to_vec()],
      pairs: vec![b"host=h1".to_vec()],
    };
    assert_eq!(execute(&node, &index).to_vec(), vec![1, 3]);
  }

  #[test]
  fn test_lexical_checks() {
    assert!(metric_matches(b"cpu host=h1", b"cpu"));
    assert!(!metric_matches(b"cpux host=h1", b"cpu"));
    assert!(tagvalue_matches(b"cpu host=h1 os=linux", b"os=linux"));
    assert!(!tagvalue_matches(b"cpu host=h12", b"host=h1"));
  }

  #[test]
  fn test_series_filter() {
    let f = SeriesFilter::Set(vec![2, 5, 9]);
    assert!(f.matches(5));
    assert!(!f.matches(4));
    assert!(SeriesFilter::All.matches(123));
    assert!(SeriesFilter::Single(3).matches(3));
  }
}
