//! Containment search over graph-window sketches.
//!
//! A partitioned LSH Forest approximating Jaccard containment: windows are
//! split into equi-depth partitions by domain size, each partition holds its
//! own banded LSH Forest, and query-time (K,L) parameters are optimised per
//! partition by minimising the false-positive + false-negative probability
//! integrals. Candidates are confirmed with an exact containment estimate
//! before being returned.

use anyhow::Result;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Mutex;

use crate::error::ArgraphError;

/// Bytes per hash value when serialising sketch bands.
const HASH_VALUE_SIZE: usize = 8;

/// Quantise step for the probability integrals.
const OPTIMISE_PRECISION: f64 = 0.01;

/// Relates a sketch in the index to a specific window of a graph.
#[derive(Debug, Clone, Default)]
pub struct WindowKey {
    /// Identifies the graph.
    pub graph_id: u32,
    /// Identifies the first segment in the graph window.
    pub node: u64,
    /// Offset of the window within the first segment.
    pub offset: u32,
    /// Size of the window that was sketched (prior to merging).
    pub window_size: u32,
    /// The sketch of this graph window.
    pub sketch: Vec<u64>,
    /// Bases contributed by each segment the window spans.
    pub contained_segments: FxHashMap<u64, f64>,
    /// IDs of the reference paths this window is valid for.
    pub path_ids: Vec<u32>,
    /// Number of consecutive identical sketches this window absorbed.
    pub merge_span: u32,
    /// K-mer count received during read mapping.
    pub freq: f64,
}

impl WindowKey {
    /// The window's starting coordinate as a string.
    pub fn coord_string(&self) -> String {
        format!("g{}n{}o{}", self.graph_id, self.node, self.offset)
    }
}

/// Serialises a sketch band into a byte key (little-endian, 8 bytes per
/// value).
fn band_key(band: &[u64]) -> Vec<u8> {
    let mut key = Vec::with_capacity(band.len() * HASH_VALUE_SIZE);
    for value in band {
        key.extend_from_slice(&value.to_le_bytes());
    }
    key
}

/// Estimates the containment of the query k-mer set in the indexed k-mer set
/// from their sketches and set sizes.
pub fn containment(
    query_sketch: &[u64],
    indexed_sketch: &[u64],
    query_size: usize,
    indexed_size: usize,
) -> f64 {
    let slots = query_sketch.len().min(indexed_sketch.len());
    if slots == 0 || query_size == 0 {
        return 0.0;
    }
    let mut intersect = 0usize;
    for i in 0..slots {
        if query_sketch[i] == indexed_sketch[i] {
            intersect += 1;
        }
    }
    let jaccard = intersect as f64 / slots as f64;
    (jaccard * (query_size + indexed_size) as f64) / ((1.0 + jaccard) * query_size as f64)
}

// numeric integration with midpoint quantisation
fn integral(f: impl Fn(f64) -> f64, a: f64, b: f64, precision: f64) -> f64 {
    let mut area = 0.0;
    let mut x = a;
    while x < b {
        area += f(x + 0.5 * precision) * precision;
        x += precision;
    }
    area
}

fn false_positive_containment(x: usize, q: usize, l: usize, k: usize) -> impl Fn(f64) -> f64 {
    let (x, q, l, k) = (x as f64, q as f64, l as f64, k as f64);
    move |t: f64| 1.0 - (1.0 - (t / (1.0 + x / q - t)).powf(k)).powf(l)
}

fn false_negative_containment(x: usize, q: usize, l: usize, k: usize) -> impl Fn(f64) -> f64 {
    let fp = false_positive_containment(x, q, l, k);
    move |t: f64| 1.0 - fp(t)
}

fn prob_false_positive(x: usize, q: usize, l: usize, k: usize, t: f64, precision: f64) -> f64 {
    let fp = false_positive_containment(x, q, l, k);
    let xq = x as f64 / q as f64;
    if xq >= 1.0 || xq >= t {
        integral(fp, 0.0, t, precision)
    } else {
        integral(fp, 0.0, xq, precision)
    }
}

fn prob_false_negative(x: usize, q: usize, l: usize, k: usize, t: f64, precision: f64) -> f64 {
    let fneg = false_negative_containment(x, q, l, k);
    let xq = x as f64 / q as f64;
    if xq >= 1.0 {
        integral(fneg, t, 1.0, precision)
    } else if xq >= t {
        integral(fneg, t, xq, precision)
    } else {
        0.0
    }
}

/// A MinHash LSH Forest with query-time (K,L) parameters.
#[derive(Debug)]
struct LshForest {
    k: usize,
    l: usize,
    init_tables: Vec<FxHashMap<Vec<u8>, Vec<String>>>,
    tables: Vec<Vec<(Vec<u8>, Vec<String>)>>,
}

impl LshForest {
    fn new(k: usize, l: usize) -> Self {
        LshForest {
            k,
            l,
            init_tables: (0..l).map(|_| FxHashMap::default()).collect(),
            tables: Vec::new(),
        }
    }

    /// Adds a key with its sketch. Not searchable until `index` runs.
    fn add(&mut self, key: &str, sketch: &[u64]) {
        for (i, table) in self.init_tables.iter_mut().enumerate() {
            let band = band_key(&sketch[i * self.k..(i + 1) * self.k]);
            table.entry(band).or_default().push(key.to_string());
        }
    }

    /// Sorts each band's buckets to enable prefix search.
    fn index(&mut self) {
        self.tables = self
            .init_tables
            .iter_mut()
            .map(|init| {
                let mut table: Vec<(Vec<u8>, Vec<String>)> = init.drain().collect();
                table.sort_unstable_by(|a, b| a.0.cmp(&b.0));
                table
            })
            .collect();
        self.init_tables.clear();
    }

    /// Collects candidate keys for a query sketch using `query_k` rows from
    /// each of `query_l` bands.
    fn query(&self, sketch: &[u64], query_k: usize, query_l: usize, out: &mut FxHashSet<String>) {
        let query_k = query_k.min(self.k);
        let query_l = query_l.min(self.l);
        let prefix_size = HASH_VALUE_SIZE * query_k;
        for i in 0..query_l {
            let prefix = band_key(&sketch[i * self.k..i * self.k + query_k]);
            let table = &self.tables[i];
            let start = table.partition_point(|(bucket_key, _)| {
                bucket_key[..prefix_size.min(bucket_key.len())] < prefix[..]
            });
            for (bucket_key, keys) in &table[start..] {
                if bucket_key[..prefix_size.min(bucket_key.len())] != prefix[..] {
                    break;
                }
                for key in keys {
                    out.insert(key.clone());
                }
            }
        }
    }

    /// Returns the (K,L) minimising summed false-positive and false-negative
    /// probability for an indexed domain of size `x`, query size `q` and
    /// containment threshold `t`.
    fn optimal_kl(&self, x: usize, q: usize, t: f64) -> (usize, usize) {
        let mut best = (self.k, self.l);
        let mut min_error = f64::MAX;
        for l in 1..=self.l {
            for k in 1..=self.k {
                let fp = prob_false_positive(x, q, l, k, t, OPTIMISE_PRECISION);
                let fneg = prob_false_negative(x, q, l, k, t, OPTIMISE_PRECISION);
                let error = fp + fneg;
                if error < min_error {
                    min_error = error;
                    best = (k, l);
                }
            }
        }
        best
    }
}

/// A domain-size partition in the ensemble.
#[derive(Debug, Clone, Copy, Default)]
struct Partition {
    lower: usize,
    upper: usize,
}

/// The partitioned LSH index rebuilt in memory at load time.
#[derive(Debug)]
pub struct LshEnsemble {
    partitions: Vec<Partition>,
    forests: Vec<LshForest>,
    // cached optimal (k,l) per (indexed size, query size, threshold%) tuple
    param_cache: Mutex<FxHashMap<(usize, usize, u64), (usize, usize)>>,
}

impl LshEnsemble {
    /// Builds the ensemble from domain records using equi-depth partitioning.
    ///
    /// `records` yields (key, domain size, sketch) and must be in a stable
    /// order sorted by size; all graph windows share one size, so records
    /// are ordered by key.
    pub fn bootstrap_equi_depth<'a>(
        num_partitions: usize,
        sketch_size: usize,
        max_k: usize,
        total_records: usize,
        records: impl Iterator<Item = (&'a str, usize, &'a [u64])>,
    ) -> Self {
        let num_partitions = num_partitions.max(1);
        let bands = (sketch_size / max_k).max(1);
        let mut ensemble = LshEnsemble {
            partitions: vec![Partition::default(); num_partitions],
            forests: (0..num_partitions)
                .map(|_| LshForest::new(max_k, bands))
                .collect(),
            param_cache: Mutex::new(FxHashMap::default()),
        };

        let depth = total_records / num_partitions;
        let mut current_depth = 0usize;
        let mut current_partition = 0usize;
        for (key, size, sketch) in records {
            ensemble.forests[current_partition].add(key, sketch);
            current_depth += 1;
            ensemble.partitions[current_partition].upper = size;
            if current_depth >= depth && current_partition < num_partitions - 1 {
                current_partition += 1;
                ensemble.partitions[current_partition].lower = size;
                current_depth = 0;
            }
        }
        for forest in &mut ensemble.forests {
            forest.index();
        }
        ensemble
    }

    /// Returns candidate window keys for the query sketch.
    pub fn query(&self, sketch: &[u64], query_size: usize, threshold: f64) -> FxHashSet<String> {
        let mut candidates = FxHashSet::default();
        for (partition, forest) in self.partitions.iter().zip(&self.forests) {
            if partition.upper == 0 {
                continue;
            }
            let (k, l) = self.params_for(forest, partition.upper, query_size, threshold);
            forest.query(sketch, k, l, &mut candidates);
        }
        candidates
    }

    fn params_for(&self, forest: &LshForest, x: usize, q: usize, t: f64) -> (usize, usize) {
        let cache_key = (x, q, (t * 100.0).round() as u64);
        if let Some(&params) = self.param_cache.lock().unwrap().get(&cache_key) {
            return params;
        }
        let params = forest.optimal_kl(x, q, t);
        self.param_cache.lock().unwrap().insert(cache_key, params);
        params
    }
}

/// The persistent containment index: parameters plus the window lookup.
///
/// The LSH ensemble itself is never serialised; it is rebuilt from the
/// window lookup whenever the index is loaded.
#[derive(Debug)]
pub struct ContainmentIndex {
    /// Number of equi-depth partitions.
    pub num_partitions: usize,
    /// Maximum hash functions per band.
    pub max_k: usize,
    /// Number of k-mers per graph window (all windows share one size).
    pub num_window_kmers: usize,
    /// Sketch length (number of hash functions).
    pub sketch_size: usize,
    /// String-encoded window key to window.
    pub window_lookup: FxHashMap<String, WindowKey>,
    ensemble: Option<LshEnsemble>,
}

impl ContainmentIndex {
    pub fn new(
        num_partitions: usize,
        max_k: usize,
        num_window_kmers: usize,
        sketch_size: usize,
    ) -> Self {
        ContainmentIndex {
            num_partitions,
            max_k,
            num_window_kmers,
            sketch_size,
            window_lookup: FxHashMap::default(),
            ensemble: None,
        }
    }

    /// Adds a window under a unique string key.
    pub fn add_window(&mut self, key: String, window: WindowKey) -> Result<()> {
        if self.window_lookup.contains_key(&key) {
            anyhow::bail!("duplicate window key can't be inserted into index: {}", key);
        }
        self.window_lookup.insert(key, window);
        Ok(())
    }

    /// True once the in-memory LSH ensemble has been built.
    pub fn is_indexed(&self) -> bool {
        self.ensemble.is_some()
    }

    pub fn num_sketches(&self) -> usize {
        self.window_lookup.len()
    }

    /// Rebuilds the LSH ensemble from the window lookup.
    pub fn build_ensemble(&mut self) -> Result<()> {
        if self.window_lookup.is_empty() {
            return Err(ArgraphError::IndexCorrupt("no windows in index".to_string()).into());
        }
        // stable record order for the equi-depth split
        let mut keys: Vec<&String> = self.window_lookup.keys().collect();
        keys.sort_unstable();
        let num_window_kmers = self.num_window_kmers;
        let records = keys.iter().map(|key| {
            let window = &self.window_lookup[*key];
            (key.as_str(), num_window_kmers, window.sketch.as_slice())
        });
        let ensemble = LshEnsemble::bootstrap_equi_depth(
            self.num_partitions,
            self.sketch_size,
            self.max_k,
            self.window_lookup.len(),
            records,
        );
        self.ensemble = Some(ensemble);
        Ok(())
    }

    /// Queries the index with a read sketch.
    ///
    /// `query_size` is the k-mer count of the read. Candidates from the LSH
    /// ensemble are confirmed with an exact containment estimate before
    /// being grouped by graph ID.
    pub fn query(
        &self,
        sketch: &[u64],
        query_size: usize,
        threshold: f64,
    ) -> Result<FxHashMap<u32, Vec<WindowKey>>> {
        if sketch.len() != self.sketch_size {
            return Err(ArgraphError::SketchMismatch(format!(
                "query sketch has {} hash values, index expects {}",
                sketch.len(),
                self.sketch_size
            ))
            .into());
        }
        let ensemble = self.ensemble.as_ref().ok_or_else(|| {
            ArgraphError::IndexCorrupt("containment index queried before load".to_string())
        })?;

        let mut results: FxHashMap<u32, Vec<WindowKey>> = FxHashMap::default();
        for candidate in ensemble.query(sketch, query_size, threshold) {
            let window = self.window_lookup.get(&candidate).ok_or_else(|| {
                ArgraphError::IndexCorrupt(format!("candidate key not in lookup: {}", candidate))
            })?;
            let estimate = containment(sketch, &window.sketch, query_size, self.num_window_kmers);
            if estimate > threshold {
                let mut hit = window.clone();
                hit.freq = query_size as f64;
                results.entry(hit.graph_id).or_default().push(hit);
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sketch::{sketch_sequence, SketchAlgo};

    fn window_with_sketch(graph_id: u32, node: u64, sketch: Vec<u64>) -> WindowKey {
        WindowKey {
            graph_id,
            node,
            offset: 0,
            window_size: 32,
            sketch,
            ..Default::default()
        }
    }

    #[test]
    fn test_forest_prefix_search() {
        let mut forest = LshForest::new(4, 8);
        let sketch_a: Vec<u64> = (0..32).collect();
        let sketch_b: Vec<u64> = (100..132).collect();
        forest.add("a", &sketch_a);
        forest.add("b", &sketch_b);
        forest.index();

        let mut out = FxHashSet::default();
        forest.query(&sketch_a, 4, 8, &mut out);
        assert!(out.contains("a"));
        assert!(!out.contains("b"));

        // shorter prefixes are more permissive, never less
        let mut widened = FxHashSet::default();
        forest.query(&sketch_a, 1, 8, &mut widened);
        assert!(widened.is_superset(&out));
    }

    #[test]
    fn test_optimal_kl_within_bounds() {
        let forest = LshForest::new(4, 10);
        let (k, l) = forest.optimal_kl(80, 80, 0.99);
        assert!(k >= 1 && k <= 4);
        assert!(l >= 1 && l <= 10);
    }

    #[test]
    fn test_probability_integrals_behave() {
        // false-negative probability shrinks as more bands are used
        let one_band = prob_false_negative(80, 80, 1, 2, 0.5, 0.01);
        let many_bands = prob_false_negative(80, 80, 20, 2, 0.5, 0.01);
        assert!(many_bands < one_band);
        // false-positive probability shrinks as rows per band grow
        let one_row = prob_false_positive(80, 80, 4, 1, 0.5, 0.01);
        let many_rows = prob_false_positive(80, 80, 4, 4, 0.5, 0.01);
        assert!(many_rows < one_row);
    }

    #[test]
    fn test_containment_estimate_identical_sketches() {
        let sketch: Vec<u64> = (0..42).collect();
        let estimate = containment(&sketch, &sketch, 80, 80);
        assert!(estimate >= 1.0 - 1e-9);
    }

    #[test]
    fn test_index_query_round_trip() {
        let kmer_size = 7;
        let sketch_size = 42;
        let window_seq = b"ATGAAAGGATTAAAAGGGCTATTGGTTCTGGCTTTAGGCTTTACAGGACTACAGG";
        let other_seq = b"CCCCGGGGTTTTAAAACCCCGGGGTTTTAAAACCCCGGGGTTTTAAAACCCCGGG";

        let mut index = ContainmentIndex::new(4, 4, window_seq.len() - kmer_size + 1, sketch_size);
        let window_sketch =
            sketch_sequence(window_seq, kmer_size, sketch_size, SketchAlgo::Khf).unwrap();
        let other_sketch =
            sketch_sequence(other_seq, kmer_size, sketch_size, SketchAlgo::Khf).unwrap();
        index
            .add_window(
                "g0n1o0".to_string(),
                window_with_sketch(0, 1, window_sketch.clone()),
            )
            .unwrap();
        index
            .add_window("g1n9o0".to_string(), window_with_sketch(1, 9, other_sketch))
            .unwrap();
        index.build_ensemble().unwrap();

        // a read identical to the indexed window must come back, and only it
        let hits = index
            .query(&window_sketch, window_seq.len() - kmer_size + 1, 0.99)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[&0].len(), 1);
        assert_eq!(hits[&0][0].node, 1);
    }

    #[test]
    fn test_query_sketch_size_mismatch() {
        let mut index = ContainmentIndex::new(2, 4, 74, 42);
        index
            .add_window("g0n0o0".to_string(), window_with_sketch(0, 0, vec![0; 42]))
            .unwrap();
        index.build_ensemble().unwrap();
        let err = index.query(&[1u64; 12], 74, 0.99).unwrap_err();
        assert!(err.to_string().contains("sketch mismatch"));
    }

    #[test]
    fn test_duplicate_window_key_rejected() {
        let mut index = ContainmentIndex::new(2, 4, 74, 42);
        index
            .add_window("g0n0o0".to_string(), window_with_sketch(0, 0, vec![0; 42]))
            .unwrap();
        assert!(index
            .add_window("g0n0o0".to_string(), window_with_sketch(0, 0, vec![1; 42]))
            .is_err());
    }
}
