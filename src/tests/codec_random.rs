//! Randomized recovery tests: whatever goes through the codecs must come
//! back exactly, timestamps and ids intact and values bit-for-bit.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::block::{BlockReader, BlockWriter};
use crate::chunk;
use crate::chunk::{ChunkSink, UncompressedChunk};
use crate::errors::SdbResult;
use crate::postings::PostingList;

struct GrowSink {
  buf: Vec<u8>,
  committed: usize,
}

impl ChunkSink for GrowSink {
  fn allocate(&mut self) -> &mut [u8] {
    &mut self.buf
  }

  fn commit(&mut self, nbytes: usize) -> SdbResult<()> {
    self.committed = nbytes;
    Ok(())
  }
}

fn random_points(rng: &mut StdRng, n: usize, regular: bool) -> Vec<(u64, f64)> {
  let mut ts = rng.gen_range(1_000_000u64..2_000_000);
  let mut points = Vec::with_capacity(n);
  for _ in 0..n {
    ts += if regular {
      1000
    } else {
      rng.gen_range(1u64..10_000)
    };
    let value = match rng.gen_range(0u32..4) {
      0 => rng.gen_range(-1000.0..1000.0),
      1 => rng.gen_range(0u32..100) as f64,
      2 => f64::from_bits(rng.gen()),
      _ => 3.14159265,
    };
    points.push((ts, value));
  }
  points
}

#[test]
fn test_block_codec_random_recovery() {
  let mut rng = StdRng::seed_from_u64(0xB10C);
  for trial in 0..50 {
    let regular = trial % 2 == 0;
    let n = rng.gen_range(1usize..200);
    let points = random_points(&mut rng, n, regular);
    let mut buf = vec![0u8; 64 * 1024];
    let mut writer = BlockWriter::new(trial as u64 + 1, &mut buf).unwrap();
    for &(ts, v) in &points {
      writer.put(ts, v).unwrap();
    }
    let nbytes = writer.commit().unwrap();

    let mut reader = BlockReader::new(&buf[..nbytes]).unwrap();
    assert_eq!(reader.nelements(), n);
    for &(ts, v) in &points {
      let (got_ts, got_v) = reader.next().unwrap().unwrap();
      assert_eq!(got_ts, ts, "trial {}", trial);
      assert_eq!(got_v.to_bits(), v.to_bits(), "trial {}", trial);
    }
    assert_eq!(reader.next().unwrap(), None);
  }
}

#[test]
fn test_chunk_codec_random_recovery() {
  let mut rng = StdRng::seed_from_u64(0x517E);
  for trial in 0..50 {
    let n = rng.gen_range(1usize..128);
    let nseries = rng.gen_range(1u64..6);
    let mut data = UncompressedChunk::default();
    let points = random_points(&mut rng, n, trial % 2 == 0);
    for (i, &(ts, v)) in points.iter().enumerate() {
      data.push(1 + (i as u64 % nseries), ts, v);
    }
    let data = chunk::convert_from_time_order(&data);

    let mut sink = GrowSink {
      buf: vec![0; 64 * 1024],
      committed: 0,
    };
    chunk::encode_chunk(&mut sink, &data).unwrap();
    let decoded = chunk::decode_chunk(&sink.buf[..sink.committed], n as u32).unwrap();
    assert_eq!(decoded.param_ids, data.param_ids, "trial {}", trial);
    assert_eq!(decoded.timestamps, data.timestamps, "trial {}", trial);
    // bit-for-bit on values; NaNs are legal payloads
    let got: Vec<u64> = decoded.values.iter().map(|v| v.to_bits()).collect();
    let want: Vec<u64> = data.values.iter().map(|v| v.to_bits()).collect();
    assert_eq!(got, want, "trial {}", trial);
  }
}

#[test]
fn test_posting_list_random_laws() {
  let mut rng = StdRng::seed_from_u64(0x9057);
  for _ in 0..100 {
    let mut a_ids: Vec<u64> = (0..rng.gen_range(0usize..100))
      .map(|_| rng.gen_range(1u64..500))
      .collect();
    let mut b_ids: Vec<u64> = (0..rng.gen_range(0usize..100))
      .map(|_| rng.gen_range(1u64..500))
      .collect();
    a_ids.sort_unstable();
    a_ids.dedup();
    b_ids.sort_unstable();
    b_ids.dedup();
    let a = PostingList::from_sorted(a_ids.iter().copied());
    let b = PostingList::from_sorted(b_ids.iter().copied());

    assert_eq!(a.intersection(&a).to_vec(), a_ids);
    assert_eq!(a.union(&a).to_vec(), a.unique().to_vec());

    let inter = a.intersection(&b).to_vec();
    for id in &inter {
      assert!(a_ids.contains(id) && b_ids.contains(id));
    }
    let diff = a.difference(&b).to_vec();
    for id in &diff {
      assert!(a_ids.contains(id) && !b_ids.contains(id));
    }
    let uni = a.union(&b).to_vec();
    let mut expected = a_ids.clone();
    expected.extend(&b_ids);
    expected.sort_unstable();
    expected.dedup();
    assert_eq!(uni, expected);
  }
}
