//! The variation graph: a topologically sorted DAG of sequence segments with
//! reference paths threaded through it.
//!
//! Segments live in an arena (`Vec<Segment>`) and are addressed through a
//! segment-ID to arena-index lookup map. The topological sort permutes the
//! arena and atomically rebuilds the lookup, so the two never disagree.

use anyhow::{Context, Result};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::ArgraphError;
use crate::gfa::Gfa;

/// A graph node: one GFA segment plus the path and weight bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct Segment {
    pub id: u64,
    /// Uppercase ACGTN nucleotide sequence.
    pub sequence: Vec<u8>,
    /// Segment IDs this segment links to (unlabelled edges).
    pub out_edges: Vec<u64>,
    /// IDs of the reference paths that traverse this segment.
    pub path_ids: Vec<u32>,
    /// Start offset of this segment's first base in each path's linear
    /// sequence.
    pub position: FxHashMap<u32, usize>,
    /// Accumulated k-mer frequency projected from read sketches.
    pub kmer_freq: f64,
    /// Set when the segment is removed by pruning.
    pub marked: bool,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    pub fn increment_kmer_freq(&mut self, increment: f64) {
        self.kmer_freq += increment;
    }
}

/// A collection of variation graphs keyed by graph ID.
pub type Store = FxHashMap<u32, VariationGraph>;

/// A topologically sorted variation graph built from one reference cluster.
#[derive(Debug, Clone, Default)]
pub struct VariationGraph {
    pub graph_id: u32,
    /// The graph itself: a topologically sorted arena of segments.
    pub segments: Vec<Segment>,
    /// Maps a segment ID to its index in the sorted arena.
    pub node_lookup: FxHashMap<u64, usize>,
    /// Maps a path ID to the path's display name.
    pub paths: FxHashMap<u32, String>,
    /// Maps a path ID to the length of its linear sequence.
    pub lengths: FxHashMap<u32, usize>,
    /// Total number of k-mers projected onto the graph during mapping.
    pub kmer_total: u64,
    /// Flag preventing further use of the graph.
    pub masked: bool,
}

impl VariationGraph {
    /// Builds a graph from a parsed GFA and runs the topological sort.
    ///
    /// Segment names must be integers; sequences are uppercased and must be
    /// ACGTN. A `KC:i:` tag seeds the segment's k-mer frequency (used when
    /// re-loading weighted graphs for haplotyping).
    pub fn from_gfa(gfa: &Gfa, graph_id: u32) -> Result<Self> {
        let mut graph = VariationGraph {
            graph_id,
            ..Default::default()
        };

        for gfa_segment in &gfa.segments {
            let id: u64 = gfa_segment.name.parse().map_err(|_| {
                ArgraphError::InvalidSegment(format!(
                    "segment name is not an integer: {}",
                    gfa_segment.name
                ))
            })?;
            if graph.node_lookup.contains_key(&id) {
                return Err(ArgraphError::DuplicateSegment(id).into());
            }
            let mut sequence = gfa_segment.sequence.as_bytes().to_vec();
            for base in &mut sequence {
                *base = match base.to_ascii_uppercase() {
                    b @ (b'A' | b'C' | b'G' | b'T' | b'N') => b,
                    other => {
                        return Err(ArgraphError::InvalidSegment(format!(
                            "segment {} contains a non-ACGTN base: {}",
                            id, other as char
                        ))
                        .into())
                    }
                };
            }
            if sequence.is_empty() {
                return Err(
                    ArgraphError::InvalidSegment(format!("segment {} has no sequence", id)).into(),
                );
            }
            let kmer_freq = gfa_segment.kmer_count.unwrap_or(0) as f64;
            graph.kmer_total += gfa_segment.kmer_count.unwrap_or(0);
            graph.node_lookup.insert(id, graph.segments.len());
            graph.segments.push(Segment {
                id,
                sequence,
                kmer_freq,
                ..Default::default()
            });
        }

        for link in &gfa.links {
            let from: u64 = link.from.parse().map_err(|_| {
                ArgraphError::InvalidSegment(format!("link from-segment not an integer: {}", link.from))
            })?;
            let to: u64 = link.to.parse().map_err(|_| {
                ArgraphError::InvalidSegment(format!("link to-segment not an integer: {}", link.to))
            })?;
            if !graph.node_lookup.contains_key(&to) {
                return Err(ArgraphError::InvalidSegment(format!(
                    "link references unknown segment: {}",
                    to
                ))
                .into());
            }
            let from_idx = *graph.node_lookup.get(&from).ok_or_else(|| {
                ArgraphError::InvalidSegment(format!("link references unknown segment: {}", from))
            })?;
            graph.segments[from_idx].out_edges.push(to);
        }

        let mut sources = Vec::with_capacity(gfa.paths.len());
        for (path_iterator, path) in gfa.paths.iter().enumerate() {
            let path_id = path_iterator as u32;
            graph.paths.insert(path_id, path.name.clone());
            for (i, seg_name) in path.segments.iter().enumerate() {
                let seg_id: u64 = seg_name.parse().map_err(|_| {
                    ArgraphError::InvalidSegment(format!(
                        "path {} references a non-integer segment: {}",
                        path.name, seg_name
                    ))
                })?;
                let idx = *graph.node_lookup.get(&seg_id).ok_or_else(|| {
                    ArgraphError::InvalidSegment(format!(
                        "path {} references unknown segment: {}",
                        path.name, seg_id
                    ))
                })?;
                graph.segments[idx].path_ids.push(path_id);
                if i == 0 && !sources.contains(&seg_id) {
                    sources.push(seg_id);
                }
            }
        }

        if graph.segments.len() > 1 {
            graph.topo_sort(&sources)?;
        }
        graph.graph_to_sequences()?;
        Ok(graph)
    }

    /// Topologically sorts the segment arena with a multi-source DFS.
    ///
    /// Sources are the first segments of the reference paths. Out-edges are
    /// traversed in descending segment-ID order and nodes are emitted in
    /// reverse finish order, so the result is a deterministic function of the
    /// input IDs. The node lookup is rebuilt to match the new arena order.
    fn topo_sort(&mut self, sources: &[u64]) -> Result<()> {
        const UNVISITED: u8 = 0;
        const ON_STACK: u8 = 1;
        const DONE: u8 = 2;

        let total = self.segments.len();
        let mut finished: Vec<usize> = Vec::with_capacity(total);
        let mut state = vec![UNVISITED; total];

        // out-edges pre-sorted descending per node, as arena indices
        let mut sorted_edges: Vec<Vec<usize>> = Vec::with_capacity(total);
        for segment in &self.segments {
            let mut edges = segment.out_edges.clone();
            edges.sort_unstable_by(|a, b| b.cmp(a));
            let mut edge_indices = Vec::with_capacity(edges.len());
            for edge in edges {
                let idx = *self.node_lookup.get(&edge).ok_or_else(|| {
                    ArgraphError::InvalidSegment(format!(
                        "segment {} links to unknown segment {}",
                        segment.id, edge
                    ))
                })?;
                edge_indices.push(idx);
            }
            sorted_edges.push(edge_indices);
        }

        for source in sources {
            let source_idx = *self.node_lookup.get(source).ok_or_else(|| {
                ArgraphError::InvalidSegment(format!("path source segment {} not in graph", source))
            })?;
            if state[source_idx] != UNVISITED {
                continue;
            }
            // iterative DFS, emitting a node once all its out-edges are done
            state[source_idx] = ON_STACK;
            let mut stack: Vec<(usize, usize)> = vec![(source_idx, 0)];
            while let Some(&mut (idx, ref mut edge_pos)) = stack.last_mut() {
                if *edge_pos < sorted_edges[idx].len() {
                    let target = sorted_edges[idx][*edge_pos];
                    *edge_pos += 1;
                    if state[target] == ON_STACK {
                        // a back edge: the graph contains a cycle
                        return Err(ArgraphError::Unsortable {
                            remaining: total - finished.len(),
                        }
                        .into());
                    }
                    if state[target] == UNVISITED {
                        state[target] = ON_STACK;
                        stack.push((target, 0));
                    }
                } else {
                    state[idx] = DONE;
                    finished.push(idx);
                    stack.pop();
                }
            }
        }

        if finished.len() != total {
            return Err(ArgraphError::Unsortable {
                remaining: total - finished.len(),
            }
            .into());
        }

        let mut old = std::mem::take(&mut self.segments);
        let mut sorted = Vec::with_capacity(total);
        for &idx in finished.iter().rev() {
            sorted.push(std::mem::take(&mut old[idx]));
        }
        self.node_lookup.clear();
        for (pos, segment) in sorted.iter().enumerate() {
            self.node_lookup.insert(segment.id, pos);
        }
        self.segments = sorted;
        Ok(())
    }

    /// Returns the linear sequence for every path.
    ///
    /// Side effect: refreshes each segment's per-path start offset and the
    /// graph's path-length map.
    pub fn graph_to_sequences(&mut self) -> Result<FxHashMap<u32, Vec<u8>>> {
        if self.paths.is_empty() {
            anyhow::bail!("no paths recorded in graph {}", self.graph_id);
        }
        let mut path_ids: Vec<u32> = self.paths.keys().copied().collect();
        path_ids.sort_unstable();

        let mut sequences = FxHashMap::default();
        for path_id in path_ids {
            let mut sequence: Vec<u8> = Vec::new();
            for segment in &mut self.segments {
                if segment.marked {
                    continue;
                }
                if segment.path_ids.contains(&path_id) {
                    segment.position.insert(path_id, sequence.len());
                    sequence.extend_from_slice(&segment.sequence);
                }
            }
            self.lengths.insert(path_id, sequence.len());
            sequences.insert(path_id, sequence);
        }
        Ok(sequences)
    }

    /// Returns the arena index for a segment ID.
    pub fn node_index(&self, segment_id: u64) -> Option<usize> {
        self.node_lookup.get(&segment_id).copied()
    }

    /// Returns a reference to the segment with the given ID.
    pub fn segment(&self, segment_id: u64) -> Option<&Segment> {
        self.node_index(segment_id).map(|idx| &self.segments[idx])
    }

    /// Distributes a sketch's k-mer count across the segments it spans.
    ///
    /// Each segment receives the sketch's k-mers in proportion to the bases
    /// it contributed to the window, so the projected mass equals the sketch
    /// k-mer count exactly. The graph-level k-mer total is bumped as well.
    pub fn increment_subpath(
        &mut self,
        contained_segments: &FxHashMap<u64, f64>,
        num_kmers: f64,
    ) -> Result<()> {
        if contained_segments.is_empty() {
            anyhow::bail!("window with no contained segments projected onto graph");
        }
        if contained_segments.len() == 1 {
            for (&segment_id, _) in contained_segments {
                let idx = self
                    .node_index(segment_id)
                    .with_context(|| format!("segment {} not found during projection", segment_id))?;
                self.segments[idx].increment_kmer_freq(num_kmers);
            }
        } else {
            let total_contained: f64 = contained_segments.values().sum();
            for (&segment_id, &base_count) in contained_segments {
                let idx = self
                    .node_index(segment_id)
                    .with_context(|| format!("segment {} not found during projection", segment_id))?;
                let kmer_share = (base_count / total_contained) * num_kmers;
                self.segments[idx].increment_kmer_freq(kmer_share);
            }
        }
        self.kmer_total += num_kmers as u64;
        Ok(())
    }

    /// Removes segments (and the paths through them) whose per-base coverage
    /// falls below the minimum.
    ///
    /// Returns false iff pruning removes every path through the graph.
    pub fn prune(&mut self, min_kmer_coverage: f64) -> bool {
        let mut remove_paths: FxHashSet<u32> = FxHashSet::default();
        let mut remove_segments: FxHashSet<u64> = FxHashSet::default();

        for segment in &self.segments {
            let per_base_coverage = segment.kmer_freq / segment.len() as f64;
            if per_base_coverage < min_kmer_coverage {
                remove_segments.insert(segment.id);
                for &path_id in &segment.path_ids {
                    remove_paths.insert(path_id);
                }
            }
        }

        if remove_paths.len() == self.paths.len() && !self.paths.is_empty() {
            return false;
        }
        if remove_segments.is_empty() {
            return true;
        }

        for segment in &mut self.segments {
            segment
                .path_ids
                .retain(|path_id| !remove_paths.contains(path_id));
            if remove_segments.contains(&segment.id) {
                segment.marked = true;
            }
            segment
                .out_edges
                .retain(|edge| !remove_segments.contains(edge));
        }
        for segment_id in &remove_segments {
            self.node_lookup.remove(segment_id);
        }
        for path_id in &remove_paths {
            if self.paths.contains_key(path_id) {
                self.lengths.insert(*path_id, 0);
            }
        }
        true
    }

    /// Strips path IDs from segments when the path is no longer registered in
    /// the graph.
    pub fn remove_dead_paths(&mut self) {
        for segment in &mut self.segments {
            if segment.marked {
                continue;
            }
            segment
                .path_ids
                .retain(|path_id| self.paths.contains_key(path_id));
        }
    }

    /// Resets all projected weights, as done when graphs are loaded for a
    /// fresh alignment run.
    pub fn reset_weights(&mut self) {
        for segment in &mut self.segments {
            segment.kmer_freq = 0.0;
        }
        self.kmer_total = 0;
    }

    /// Returns (path ID, name, length) for every path, sorted by path ID.
    pub fn references(&self) -> Vec<(u32, String, usize)> {
        let mut refs: Vec<(u32, String, usize)> = self
            .paths
            .iter()
            .map(|(&id, name)| (id, name.clone(), self.lengths.get(&id).copied().unwrap_or(0)))
            .collect();
        refs.sort_unstable_by_key(|(id, _, _)| *id);
        refs
    }

    /// Builds the EM equivalence classes: each unmarked segment together with
    /// the paths that traverse it, counted as k-mer frequency per base.
    pub fn equivalence_classes(&self) -> Result<(FxHashMap<u64, Vec<u32>>, FxHashMap<u64, f64>)> {
        let mut ec_map: FxHashMap<u64, Vec<u32>> = FxHashMap::default();
        let mut counts: FxHashMap<u64, f64> = FxHashMap::default();
        for segment in &self.segments {
            if segment.marked {
                continue;
            }
            if ec_map.contains_key(&segment.id) {
                return Err(ArgraphError::DuplicateSegment(segment.id).into());
            }
            ec_map.insert(segment.id, segment.path_ids.clone());
            counts.insert(segment.id, segment.kmer_freq / segment.len() as f64);
        }
        Ok((ec_map, counts))
    }

    /// Applies the EM abundance estimates: normalises alpha to rho, converts
    /// to a k-mer share of the whole run, drops paths below the cutoff and
    /// returns the abundances of the survivors.
    pub fn process_em_paths(
        &mut self,
        alpha: &[f64],
        cutoff: f64,
        total_kmers: u64,
    ) -> FxHashMap<u32, f64> {
        let paths_total: f64 = alpha.iter().sum();
        let mut abundances = FxHashMap::default();
        if paths_total <= 0.0 || total_kmers == 0 {
            self.paths.clear();
            return abundances;
        }
        for (path_id, &value) in alpha.iter().enumerate() {
            let path_id = path_id as u32;
            if !self.paths.contains_key(&path_id) {
                continue;
            }
            let rho = value / paths_total;
            let kmer_share = (rho * self.kmer_total as f64) / total_kmers as f64;
            if kmer_share >= cutoff {
                abundances.insert(path_id, kmer_share);
            } else {
                self.paths.remove(&path_id);
            }
        }
        abundances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfa::{msa_to_gfa, MsaEntry};

    pub(crate) fn two_seq_graph() -> VariationGraph {
        let msa = vec![
            MsaEntry {
                name: "reference_A".to_string(),
                aligned: b"AGTGGTCATA".to_vec(),
            },
            MsaEntry {
                name: "reference_B".to_string(),
                aligned: b"A-GGGTCA-A".to_vec(),
            },
        ];
        let gfa = msa_to_gfa(&msa).unwrap();
        VariationGraph::from_gfa(&gfa, 0).unwrap()
    }

    #[test]
    fn test_two_seq_graph_structure() {
        let mut graph = two_seq_graph();

        // shared start node holding 'A'
        let start = &graph.segments[0];
        assert_eq!(start.sequence, b"A");
        assert_eq!(start.path_ids.len(), 2);

        // a shared internal run containing GTCA
        assert!(graph.segments.iter().any(|segment| {
            segment.path_ids.len() == 2
                && segment
                    .sequence
                    .windows(4)
                    .any(|window| window == b"GTCA")
        }));

        // linearization returns the gap-stripped originals
        let seqs = graph.graph_to_sequences().unwrap();
        assert_eq!(seqs[&0], b"AGTGGTCATA");
        assert_eq!(seqs[&1], b"AGGGTCAA");
    }

    #[test]
    fn test_topology_invariant() {
        let graph = two_seq_graph();
        for (i, segment) in graph.segments.iter().enumerate() {
            for edge in &segment.out_edges {
                let j = graph.node_index(*edge).unwrap();
                assert!(j > i, "edge {} -> {} violates topological order", segment.id, edge);
            }
        }
    }

    #[test]
    fn test_path_closure_invariant() {
        let graph = two_seq_graph();
        for segment in &graph.segments {
            for path_id in &segment.path_ids {
                assert!(graph.paths.contains_key(path_id));
            }
        }
    }

    #[test]
    fn test_duplicate_segment_rejected() {
        let gfa_text = "H\tVN:Z:1.0\nS\t1\tACGT\nS\t1\tGGGG\n";
        let gfa = Gfa::parse(gfa_text.as_bytes()).unwrap();
        let err = VariationGraph::from_gfa(&gfa, 0).unwrap_err();
        assert!(err.to_string().contains("duplicate segment"));
    }

    #[test]
    fn test_invalid_segment_rejected() {
        let gfa_text = "H\tVN:Z:1.0\nS\tfoo\tACGT\n";
        let gfa = Gfa::parse(gfa_text.as_bytes()).unwrap();
        assert!(VariationGraph::from_gfa(&gfa, 0).is_err());

        let gfa_text = "H\tVN:Z:1.0\nS\t1\tACXT\n";
        let gfa = Gfa::parse(gfa_text.as_bytes()).unwrap();
        assert!(VariationGraph::from_gfa(&gfa, 0).is_err());
    }

    #[test]
    fn test_cyclic_graph_unsortable() {
        let gfa_text = "H\tVN:Z:1.0\n\
            S\t1\tAC\nS\t2\tGT\nS\t3\tTT\n\
            L\t1\t+\t2\t+\t0M\nL\t2\t+\t3\t+\t0M\nL\t3\t+\t2\t+\t0M\n\
            P\tp1\t1+,2+,3+\t*\n";
        let gfa = Gfa::parse(gfa_text.as_bytes()).unwrap();
        let err = VariationGraph::from_gfa(&gfa, 0).unwrap_err();
        assert!(err.to_string().contains("topological sort failed"));
    }

    #[test]
    fn test_projection_mass_conservation() {
        let mut graph = two_seq_graph();
        let before: f64 = graph.segments.iter().map(|s| s.kmer_freq).sum();

        let mut contained = FxHashMap::default();
        contained.insert(graph.segments[0].id, 1.0);
        contained.insert(graph.segments[1].id, 1.0);
        contained.insert(graph.segments[2].id, 1.0);
        graph.increment_subpath(&contained, 12.0).unwrap();

        let after: f64 = graph.segments.iter().map(|s| s.kmer_freq).sum();
        assert!((after - before - 12.0).abs() < 1e-9);
        assert_eq!(graph.kmer_total, 12);
    }

    #[test]
    fn test_projection_single_segment_gets_all() {
        let mut graph = two_seq_graph();
        let target = graph.segments[0].id;
        let mut contained = FxHashMap::default();
        contained.insert(target, 5.0);
        graph.increment_subpath(&contained, 7.0).unwrap();
        assert!((graph.segment(target).unwrap().kmer_freq - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_prune_removes_uncovered_paths() {
        let mut graph = two_seq_graph();
        // cover every segment on both paths generously, except one
        // reference_B-only segment
        let ids: Vec<u64> = graph.segments.iter().map(|s| s.id).collect();
        let b_only: Vec<u64> = graph
            .segments
            .iter()
            .filter(|s| s.path_ids == vec![1])
            .map(|s| s.id)
            .collect();
        assert!(!b_only.is_empty());
        for id in ids {
            if b_only.contains(&id) {
                continue;
            }
            let idx = graph.node_index(id).unwrap();
            let len = graph.segments[idx].len() as f64;
            graph.segments[idx].kmer_freq = 10.0 * len;
        }
        assert!(graph.prune(1.0));

        // path 1 is dead: its length is zeroed and its segments are masked
        assert_eq!(graph.lengths[&1], 0);
        for id in &b_only {
            assert!(graph.node_index(*id).is_none());
        }
        // surviving segments no longer reference path 1
        for segment in graph.segments.iter().filter(|s| !s.marked) {
            assert!(!segment.path_ids.contains(&1));
            for edge in &segment.out_edges {
                assert!(graph.node_lookup.contains_key(edge));
            }
        }
    }

    #[test]
    fn test_prune_all_paths_gone() {
        let mut graph = two_seq_graph();
        // no coverage anywhere
        assert!(!graph.prune(1.0));
    }
}
