// On-disk format version, stored in every block header.
pub const STORAGE_VERSION: u16 = 1;

// chunk geometry
pub const CHUNK_SIZE: usize = 16;
pub const CHUNK_MASK: usize = 15;
pub const BLOCK_HEADER_SIZE: usize = 14; // 2 (version) + 2 (nchunks) + 2 (ntail) + 8 (series id)

// Worst-case bytes needed to emit one compressed 16-element chunk:
// 10 bytes per timestamp residual column entry plus 9 per value pair entry.
pub const CHUNK_MARGIN: usize = 10 * CHUNK_SIZE + 9 * CHUNK_SIZE;

// reserved series ids
pub const NULL_PARAM_ID: u64 = 0;
pub const CHUNK_FWD_ID: u64 = u64::MAX;
pub const CHUNK_BWD_ID: u64 = u64::MAX - 1;
// Ids at or above this value are anchor sentinels, not real series.
pub const RESERVED_ID_THRESHOLD: u64 = CHUNK_BWD_ID;

// on-disk record sizes; changing any of these is an on-disk break
pub const ENTRY_HEADER_SIZE: usize = 12; // u64 param_id + u32 length
pub const INDEX_RECORD_SIZE: usize = 12; // u64 timestamp + u32 offset
pub const CHUNK_DESC_SIZE: usize = 16; // 4 x u32

// series name limits
pub const MAX_SNAME: usize = 4096;
pub const MAX_TAGS: usize = 32;

// string pool bin capacity; handles encode (bin, offset) as bin * MAX_BIN_SIZE + offset
pub const MAX_BIN_SIZE: u64 = 8 * 1024 * 1024;

// value predictor table size; the running hash is 7 bits
pub const PREDICTOR_TABLE_SIZE: usize = 1 << 7;

// search tuning
pub const INTERPOLATION_QUOTA: usize = 4;
pub const FS_PAGE_SIZE: usize = 4096;

// defaults
pub const DEFAULT_CACHE_LIMIT: usize = 500 * 1024 * 1024;
pub const DEFAULT_STARTING_ID: u64 = 1;

#[cfg(test)]
mod tests {
  use crate::constants::*;

  #[test]
  fn test_chunk_mask_matches_size() {
    assert!(CHUNK_SIZE.is_power_of_two());
    assert_eq!(CHUNK_MASK, CHUNK_SIZE - 1);
  }

  #[test]
  fn test_margin_covers_worst_case_pairs() {
    // A 16-element timestamp block is at worst a 10-byte base128 min plus
    // 8 pairs of (1 control + 16 value bytes); values are at worst 8 pairs
    // of (1 control + 16 value bytes).
    let ts_worst = 10 + 8 * 17;
    let val_worst = 8 * 17;
    assert!(CHUNK_MARGIN >= ts_worst + val_worst);
  }

  #[test]
  fn test_sentinels_above_threshold() {
    assert!(CHUNK_FWD_ID >= RESERVED_ID_THRESHOLD);
    assert!(CHUNK_BWD_ID >= RESERVED_ID_THRESHOLD);
    assert!(DEFAULT_STARTING_ID < RESERVED_ID_THRESHOLD);
  }
}
