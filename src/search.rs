//! Timestamp-keyed interpolation search. Probes are chosen by linear
//! interpolation between the range endpoints with an error-corrected
//! numerator; after a few probes (or once the range collapses into one
//! storage page) the caller refines with a plain binary search.

use crate::constants::INTERPOLATION_QUOTA;
use crate::errors::{SdbError, SdbResult};
use crate::types::Timestamp;

/// Half-open index range under search; `begin == end` means converged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SearchRange {
  pub begin: u32,
  pub end: u32,
}

/// A timestamp-ordered view the search can probe.
pub trait TimeOrdered {
  fn timestamp_at(&self, ix: u32) -> Option<Timestamp>;
  /// True when the whole range lives close enough together that a linear
  /// refinement is cheaper than further interpolation.
  fn is_small(&self, range: SearchRange) -> bool;
}

/// Interpolation search counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InterpolationStats {
  pub n_times: u64,
  pub n_steps: u64,
  pub n_matches: u64,
  pub n_overshoots: u64,
  pub n_undershoots: u64,
  pub n_reduced_to_one_page: u64,
}

/// Binary search counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BinaryStats {
  pub n_times: u64,
  pub n_steps: u64,
}

/// Counters of one engine's search activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SearchStats {
  pub interpolation: InterpolationStats,
  pub binary: BinaryStats,
}

enum ProbeState {
  None,
  Undershoot,
  Overshoot,
}

/// Narrow `range` around `key`. Leaves the range intact enough for a
/// follow-up binary search; fails with `NotFound` only when the view
/// cannot be read.
pub fn interpolation_search<V: TimeOrdered>(
  view: &V,
  key: Timestamp,
  range: &mut SearchRange,
  stats: &mut SearchStats,
) -> SdbResult<()> {
  if range.begin == range.end {
    return Ok(());
  }
  let read_at = |ix: u32| {
    view
      .timestamp_at(ix)
      .ok_or_else(|| SdbError::not_found("interpolation probe out of range"))
  };
  let mut lower_bound = read_at(range.begin)?;
  let mut upper_bound = read_at(range.end)?;

  let mut steps = 0usize;
  let mut small_range_finish = 0u64;
  let mut exact_match = 0u64;
  let mut overshoot = 0u64;
  let mut undershoot = 0u64;
  let mut prev_step_err: u64 = 0;
  let mut state = ProbeState::None;

  while steps < INTERPOLATION_QUOTA {
    steps += 1;
    if view.is_small(*range) || lower_bound == upper_bound {
      small_range_finish = 1;
      break;
    }

    let numerator = match state {
      ProbeState::Undershoot => key.saturating_sub(lower_bound) + (prev_step_err >> steps),
      ProbeState::Overshoot => key.saturating_sub(lower_bound).saturating_sub(prev_step_err >> steps),
      ProbeState::None => key.saturating_sub(lower_bound),
    };

    let span = (range.end - range.begin) as u64;
    let probe_index =
      range.begin as u64 + numerator.saturating_mul(span) / (upper_bound - lower_bound);
    let probe_index = probe_index.min(u32::MAX as u64) as u32;

    if probe_index > range.begin && probe_index < range.end {
      let probe = read_at(probe_index)?;
      if probe < key {
        undershoot += 1;
        state = ProbeState::Undershoot;
        prev_step_err = key - probe;
        range.begin = probe_index;
        lower_bound = read_at(range.begin)?;
      } else if probe > key {
        overshoot += 1;
        state = ProbeState::Overshoot;
        prev_step_err = probe - key;
        range.end = probe_index;
        upper_bound = read_at(range.end)?;
      } else {
        exact_match = 1;
        range.begin = probe_index;
        range.end = probe_index;
        break;
      }
    } else {
      break;
    }
  }

  let istats = &mut stats.interpolation;
  istats.n_times += 1;
  istats.n_steps += steps as u64;
  istats.n_matches += exact_match;
  istats.n_overshoots += overshoot;
  istats.n_undershoots += undershoot;
  istats.n_reduced_to_one_page += small_range_finish;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  struct SliceView<'a> {
    data: &'a [u64],
  }

  impl<'a> TimeOrdered for SliceView<'a> {
    fn timestamp_at(&self, ix: u32) -> Option<Timestamp> {
      self.data.get(ix as usize).copied()
    }

    fn is_small(&self, range: SearchRange) -> bool {
      range.end - range.begin < 8
    }
  }

  fn narrowed(data: &[u64], key: u64) -> SearchRange {
    let view = SliceView { data };
    let mut range = SearchRange {
      begin: 0,
      end: data.len() as u32 - 1,
    };
    let mut stats = SearchStats::default();
    interpolation_search(&view, key, &mut range, &mut stats).unwrap();
    assert!(stats.interpolation.n_times == 1);
    range
  }

  #[test]
  fn test_uniform_data_converges() {
    let data: Vec<u64> = (0..10_000u64).map(|i| i * 10).collect();
    let key = 55_550;
    let range = narrowed(&data, key);
    // the key's true index must stay inside the narrowed range
    assert!(range.begin <= 5555 && 5555 <= range.end);
    // and the range must have shrunk substantially
    assert!(range.end - range.begin < 1000);
  }

  #[test]
  fn test_exact_hit() {
    let data: Vec<u64> = (0..1000u64).map(|i| i * 2).collect();
    let range = narrowed(&data, 500);
    assert!(range.begin <= 250 && 250 <= range.end);
  }

  #[test]
  fn test_skewed_data_stays_bounded() {
    let mut data: Vec<u64> = (0..1000u64).collect();
    for v in data.iter_mut().skip(900) {
      *v *= 1000;
    }
    let key = data[950];
    let range = narrowed(&data, key);
    assert!(range.begin <= 950 && 950 <= range.end);
  }

  #[test]
  fn test_empty_range_is_noop() {
    let data = vec![1u64, 2, 3];
    let view = SliceView { data: &data };
    let mut range = SearchRange { begin: 1, end: 1 };
    let mut stats = SearchStats::default();
    interpolation_search(&view, 2, &mut range, &mut stats).unwrap();
    assert_eq!(range, SearchRange { begin: 1, end: 1 });
    assert_eq!(stats.interpolation.n_times, 0);
  }
}
