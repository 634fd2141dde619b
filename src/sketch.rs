//! MinHash sketching of nucleotide sequences.
//!
//! Two sketch flavours share one capability set (`add_sequence` +
//! `get_sketch`): K-Hash-Functions (KHF), which keeps one minimum per derived
//! hash function, and K-Minimum-Values (KMV), which keeps the k smallest
//! hash values in a bounded heap. Both consume canonical k-mers produced by a
//! rolling ntHash-style hash; k-mers containing N are skipped.

use anyhow::Result;
use std::collections::BinaryHeap;
use std::str::FromStr;

// per-base hash seeds for the rolling hash
const SEED_A: u64 = 0x3c8b_fbb3_95c6_0474;
const SEED_C: u64 = 0x3193_c185_62a0_2b4c;
const SEED_G: u64 = 0x2032_3ed0_8257_2324;
const SEED_T: u64 = 0x2955_49f5_4be2_4456;

// mixing constants for deriving the second hash in the KHF scheme
const MULTI_SEED: u64 = 0x90b4_5d39_fb6d_a1fa;
const MULTI_SHIFT: u32 = 27;

#[inline]
fn seed(base: u8) -> Option<u64> {
    match base {
        b'A' => Some(SEED_A),
        b'C' => Some(SEED_C),
        b'G' => Some(SEED_G),
        b'T' => Some(SEED_T),
        _ => None,
    }
}

#[inline]
fn seed_rc(base: u8) -> Option<u64> {
    match base {
        b'A' => Some(SEED_T),
        b'C' => Some(SEED_G),
        b'G' => Some(SEED_C),
        b'T' => Some(SEED_A),
        _ => None,
    }
}

/// Rolling canonical hasher over the k-mers of a sequence.
///
/// Yields `min(forward, reverse-complement)` hash values. Windows containing
/// a non-ACGT base are skipped; the hash state is re-seeded at the next fully
/// valid window.
pub struct KmerHasher<'a> {
    seq: &'a [u8],
    k: usize,
    pos: usize,
    fwd: u64,
    rev: u64,
    primed: bool,
}

impl<'a> KmerHasher<'a> {
    pub fn new(seq: &'a [u8], k: usize) -> Self {
        KmerHasher {
            seq,
            k,
            pos: 0,
            fwd: 0,
            rev: 0,
            primed: false,
        }
    }

    // computes both strand hashes from scratch for the window at `start`,
    // returning false if the window contains a non-ACGT base
    fn prime(&mut self, start: usize) -> bool {
        let k = self.k;
        let (mut fwd, mut rev) = (0u64, 0u64);
        for i in 0..k {
            let base = self.seq[start + i];
            match (seed(base), seed_rc(base)) {
                (Some(f), Some(r)) => {
                    fwd ^= f.rotate_left((k - 1 - i) as u32);
                    rev ^= r.rotate_left(i as u32);
                }
                _ => return false,
            }
        }
        self.fwd = fwd;
        self.rev = rev;
        true
    }
}

impl Iterator for KmerHasher<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let k = self.k;
        if k == 0 || self.seq.len() < k {
            return None;
        }
        while self.pos + k <= self.seq.len() {
            if self.primed {
                // roll: remove seq[pos-1], add seq[pos+k-1]
                let out = self.seq[self.pos - 1];
                let inn = self.seq[self.pos + k - 1];
                match (seed(out), seed(inn), seed_rc(out), seed_rc(inn)) {
                    (Some(fo), Some(fi), Some(ro), Some(ri)) => {
                        self.fwd = self.fwd.rotate_left(1) ^ fo.rotate_left(k as u32) ^ fi;
                        self.rev = self.rev.rotate_right(1)
                            ^ ro.rotate_right(1)
                            ^ ri.rotate_left((k - 1) as u32);
                    }
                    _ => {
                        self.primed = false;
                        continue;
                    }
                }
            } else {
                if !self.prime(self.pos) {
                    self.pos += 1;
                    continue;
                }
                self.primed = true;
            }
            self.pos += 1;
            return Some(self.fwd.min(self.rev));
        }
        None
    }
}

/// Derives the second hash used for the KHF multi-hash scheme.
#[inline]
fn derive_h2(h: u64) -> u64 {
    let mut h2 = h.wrapping_mul(MULTI_SEED);
    h2 ^= h2 >> MULTI_SHIFT;
    h2
}

/// Default bit capacity for the k-mer Bloom filter.
const DEFAULT_BLOOM_SIZE: usize = 10000;

/// A plain bit-array Bloom filter over hashed k-mers.
///
/// Used to keep k-mers seen only once out of a read sketch: the first
/// occurrence of a hash is recorded and skipped, so singleton k-mers from
/// sequencing errors never reach the sketch.
pub struct BloomFilter {
    size: u64,
    bits: Vec<u64>,
}

impl BloomFilter {
    pub fn new(size: usize) -> Self {
        let cells = if size > 64 { size / 64 } else { 1 };
        BloomFilter {
            size: 64 * cells as u64,
            bits: vec![0; cells],
        }
    }

    pub fn with_default_size() -> Self {
        Self::new(DEFAULT_BLOOM_SIZE)
    }

    /// Clears all marked bits.
    pub fn reset(&mut self) {
        for cell in &mut self.bits {
            *cell = 0;
        }
    }

    /// Marks a hashed k-mer.
    pub fn add(&mut self, kmer: u64) {
        let h = kmer % self.size;
        self.bits[(h / 64) as usize] |= 1u64 << (h % 64);
    }

    /// Checks whether a hashed k-mer has (probably) been seen.
    pub fn check(&self, kmer: u64) -> bool {
        let h = kmer % self.size;
        self.bits[(h / 64) as usize] & (1u64 << (h % 64)) != 0
    }
}

/// The capability shared by both sketch flavours.
pub trait MinHashSketcher {
    /// Decomposes a sequence into canonical k-mers and folds them into the
    /// sketch.
    fn add_sequence(&mut self, seq: &[u8]) -> Result<()>;

    /// Returns the current sketch as a fixed-length vector of hash values.
    fn get_sketch(&self) -> Vec<u64>;
}

/// K-Hash-Functions MinHash sketch.
///
/// Slot `i` holds the minimum of `h + i·h2` over all k-mers seen, where `h`
/// is the canonical hash and `h2` a second hash of the same k-mer.
pub struct KhfSketch {
    kmer_size: usize,
    sketch: Vec<u64>,
}

impl KhfSketch {
    pub fn new(kmer_size: usize, sketch_size: usize) -> Self {
        KhfSketch {
            kmer_size,
            sketch: vec![u64::MAX; sketch_size],
        }
    }

    /// Folds one canonical k-mer hash into the sketch.
    pub fn add_hash(&mut self, hash: u64) {
        let h2 = derive_h2(hash);
        for (i, slot) in self.sketch.iter_mut().enumerate() {
            let value = hash.wrapping_add((i as u64).wrapping_mul(h2));
            if value < *slot {
                *slot = value;
            }
        }
    }
}

impl MinHashSketcher for KhfSketch {
    fn add_sequence(&mut self, seq: &[u8]) -> Result<()> {
        if seq.len() < self.kmer_size {
            anyhow::bail!(
                "sequence length ({}) is shorter than k-mer length ({})",
                seq.len(),
                self.kmer_size
            );
        }
        for hash in KmerHasher::new(seq, self.kmer_size) {
            self.add_hash(hash);
        }
        Ok(())
    }

    fn get_sketch(&self) -> Vec<u64> {
        self.sketch.clone()
    }
}

/// K-Minimum-Values MinHash sketch.
///
/// Keeps the `s` smallest canonical hash values in a bounded max-heap.
pub struct KmvSketch {
    kmer_size: usize,
    sketch_size: usize,
    heap: BinaryHeap<u64>,
}

impl KmvSketch {
    pub fn new(kmer_size: usize, sketch_size: usize) -> Self {
        KmvSketch {
            kmer_size,
            sketch_size,
            heap: BinaryHeap::with_capacity(sketch_size + 1),
        }
    }

    /// Folds one canonical k-mer hash into the bounded heap.
    pub fn add_hash(&mut self, hash: u64) {
        if self.heap.len() < self.sketch_size {
            self.heap.push(hash);
        } else if let Some(&top) = self.heap.peek() {
            if hash < top {
                self.heap.pop();
                self.heap.push(hash);
            }
        }
    }
}

impl MinHashSketcher for KmvSketch {
    fn add_sequence(&mut self, seq: &[u8]) -> Result<()> {
        if seq.len() < self.kmer_size {
            anyhow::bail!(
                "sequence length ({}) is shorter than k-mer length ({})",
                seq.len(),
                self.kmer_size
            );
        }
        for hash in KmerHasher::new(seq, self.kmer_size) {
            self.add_hash(hash);
        }
        Ok(())
    }

    /// Returns the heap contents sorted largest-first.
    fn get_sketch(&self) -> Vec<u64> {
        let mut sketch: Vec<u64> = self.heap.iter().copied().collect();
        sketch.sort_unstable_by(|a, b| b.cmp(a));
        sketch
    }
}

/// Sketch flavour selected at index time and recorded in the runtime info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SketchAlgo {
    Khf,
    Kmv,
}

impl SketchAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            SketchAlgo::Khf => "khf",
            SketchAlgo::Kmv => "kmv",
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(SketchAlgo::Khf),
            1 => Some(SketchAlgo::Kmv),
            _ => None,
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            SketchAlgo::Khf => 0,
            SketchAlgo::Kmv => 1,
        }
    }
}

impl FromStr for SketchAlgo {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "khf" => Ok(SketchAlgo::Khf),
            "kmv" => Ok(SketchAlgo::Kmv),
            other => Err(format!("unknown sketch algorithm: {}", other)),
        }
    }
}

/// Sketches a sequence in one call with the requested flavour.
pub fn sketch_sequence(
    seq: &[u8],
    kmer_size: usize,
    sketch_size: usize,
    algo: SketchAlgo,
) -> Result<Vec<u64>> {
    sketch_sequence_filtered(seq, kmer_size, sketch_size, algo, None)
}

/// Sketches a sequence, optionally running every hash through a Bloom
/// filter first.
///
/// With a filter, the first occurrence of each k-mer hash is recorded and
/// skipped; only hashes seen before reach the sketch.
pub fn sketch_sequence_filtered(
    seq: &[u8],
    kmer_size: usize,
    sketch_size: usize,
    algo: SketchAlgo,
    mut filter: Option<&mut BloomFilter>,
) -> Result<Vec<u64>> {
    if seq.len() < kmer_size {
        anyhow::bail!(
            "sequence length ({}) is shorter than k-mer length ({})",
            seq.len(),
            kmer_size
        );
    }
    let hashes = KmerHasher::new(seq, kmer_size).filter(|&hash| match filter.as_deref_mut() {
        Some(bloom) => {
            if bloom.check(hash) {
                true
            } else {
                bloom.add(hash);
                false
            }
        }
        None => true,
    });
    match algo {
        SketchAlgo::Khf => {
            let mut sketcher = KhfSketch::new(kmer_size, sketch_size);
            for hash in hashes {
                sketcher.add_hash(hash);
            }
            Ok(sketcher.get_sketch())
        }
        SketchAlgo::Kmv => {
            let mut sketcher = KmvSketch::new(kmer_size, sketch_size);
            for hash in hashes {
                sketcher.add_hash(hash);
            }
            Ok(sketcher.get_sketch())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn revcomp(seq: &[u8]) -> Vec<u8> {
        seq.iter()
            .rev()
            .map(|b| match b {
                b'A' => b'T',
                b'T' => b'A',
                b'C' => b'G',
                b'G' => b'C',
                other => *other,
            })
            .collect()
    }

    #[test]
    fn test_hasher_rolls_consistently() {
        // rolled hashes must equal hashes primed from scratch at each position
        let seq = b"ACGTACGGTCATACGGATTAG";
        let k = 7;
        let rolled: Vec<u64> = KmerHasher::new(seq, k).collect();
        let primed: Vec<u64> = (0..=seq.len() - k)
            .map(|i| KmerHasher::new(&seq[i..i + k], k).next().unwrap())
            .collect();
        assert_eq!(rolled, primed);
        assert_eq!(rolled.len(), seq.len() - k + 1);
    }

    #[test]
    fn test_hasher_is_canonical() {
        let seq = b"ACGTACGGTCATACGGATTAG";
        let rc = revcomp(seq);
        let mut fwd: Vec<u64> = KmerHasher::new(seq, 7).collect();
        let mut rev: Vec<u64> = KmerHasher::new(&rc, 7).collect();
        fwd.sort_unstable();
        rev.sort_unstable();
        assert_eq!(fwd, rev);
    }

    #[test]
    fn test_hasher_skips_n_windows() {
        let clean: Vec<u64> = KmerHasher::new(b"ACGTACG", 3).collect();
        assert_eq!(clean.len(), 5);
        let with_n: Vec<u64> = KmerHasher::new(b"ACGNACG", 3).collect();
        // only the windows avoiding the N survive
        assert_eq!(with_n.len(), 2);
    }

    #[test]
    fn test_khf_monotonic_under_addition() {
        let mut sketcher = KhfSketch::new(5, 24);
        sketcher.add_sequence(b"ACGTACGGTCAT").unwrap();
        let before = sketcher.get_sketch();
        sketcher.add_sequence(b"TTGACCATAGGC").unwrap();
        let after = sketcher.get_sketch();
        for (b, a) in before.iter().zip(after.iter()) {
            assert!(a <= b, "sketch slot increased after adding k-mers");
        }
    }

    #[test]
    fn test_khf_identical_sequences_identical_sketches() {
        let a = sketch_sequence(b"ACGTACGGTCATACGG", 7, 32, SketchAlgo::Khf).unwrap();
        let b = sketch_sequence(b"ACGTACGGTCATACGG", 7, 32, SketchAlgo::Khf).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_khf_strand_independent() {
        let seq = b"ACGTACGGTCATACGGATTAGCC";
        let a = sketch_sequence(seq, 7, 32, SketchAlgo::Khf).unwrap();
        let b = sketch_sequence(&revcomp(seq), 7, 32, SketchAlgo::Khf).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_kmv_keeps_smallest() {
        let seq = b"ACGTACGGTCATACGGATTAGCCGAT";
        let k = 5;
        let mut all: Vec<u64> = KmerHasher::new(seq, k).collect();
        all.sort_unstable();
        let s = 4;
        let mut expected: Vec<u64> = all.into_iter().take(s).collect();
        expected.sort_unstable_by(|a, b| b.cmp(a));
        let sketch = sketch_sequence(seq, k, s, SketchAlgo::Kmv).unwrap();
        assert_eq!(sketch, expected);
    }

    #[test]
    fn test_short_sequence_rejected() {
        let mut sketcher = KhfSketch::new(21, 42);
        assert!(sketcher.add_sequence(b"ACGT").is_err());
    }

    #[test]
    fn test_bloom_filter_marks_and_resets() {
        let mut bloom = BloomFilter::with_default_size();
        assert!(!bloom.check(12345));
        bloom.add(12345);
        assert!(bloom.check(12345));
        bloom.reset();
        assert!(!bloom.check(12345));
    }

    #[test]
    fn test_bloom_filter_blocks_singleton_kmers() {
        // every k-mer is unique: the filter swallows all first occurrences
        let unique = b"ACGTACGGTCATTACGGATTAG";
        let mut bloom = BloomFilter::with_default_size();
        let sketch =
            sketch_sequence_filtered(unique, 7, 8, SketchAlgo::Kmv, Some(&mut bloom)).unwrap();
        assert!(sketch.is_empty());

        // a homopolymer repeats one k-mer: occurrences after the first pass
        let repeated = b"AAAAAAAAAAAA";
        let mut bloom = BloomFilter::with_default_size();
        let sketch =
            sketch_sequence_filtered(repeated, 7, 8, SketchAlgo::Kmv, Some(&mut bloom)).unwrap();
        assert!(!sketch.is_empty());
    }
}
