//! Hierarchical exact alignment of reads against a variation graph.
//!
//! A seed (starting segment + offset) comes from the containment index. Up
//! to four escalating attempts are made, stopping at the first that yields a
//! traversal: exact alignment with seed-offset shuffling, hard-clipping the
//! read start, hard-clipping the read end, then giving up (no record is
//! emitted for a miss).
//!
//! Alignment records are rendered as SAM text; CIGARs only ever contain
//! match and hard-clip operations.

use anyhow::Result;
use rustc_hash::FxHashMap;

use crate::error::ArgraphError;
use crate::graph::VariationGraph;
use crate::lshe::WindowKey;
use crate::seqio::SeqRead;

/// Placeholder mapping quality carried on every record.
pub const MAPQ: u8 = 30;

/// SAM flag bits used by the aligner.
pub const FLAG_REVERSE: u16 = 0x10;
pub const FLAG_SECONDARY: u16 = 0x100;

/// Default number of extra seed offsets tried before clipping.
pub const MAX_SHUFFLES: u32 = 15;

/// Default maximum number of hard-clipped bases per read end.
pub const MAX_CLIP: usize = 2;

/// One read-to-path alignment.
#[derive(Debug, Clone)]
pub struct AlignmentRecord {
    pub read_id: String,
    pub flags: u16,
    /// Name of the reference path the read aligned to.
    pub reference: String,
    /// 0-based start position on the reference path.
    pub pos: usize,
    pub mapq: u8,
    pub start_clip: usize,
    pub end_clip: usize,
    /// Read sequence minus any clipped bases.
    pub seq: Vec<u8>,
    /// Read qualities minus any clipped bases (empty for FASTA input).
    pub qual: Vec<u8>,
}

impl AlignmentRecord {
    /// CIGAR of the form `[startClip]H M [endClip]H`.
    pub fn cigar(&self) -> String {
        let mut cigar = String::new();
        if self.start_clip != 0 {
            cigar.push_str(&format!("{}H", self.start_clip));
        }
        cigar.push_str(&format!("{}M", self.seq.len()));
        if self.end_clip != 0 {
            cigar.push_str(&format!("{}H", self.end_clip));
        }
        cigar
    }

    /// Renders the record as one SAM line (POS is 1-based).
    pub fn to_sam_string(&self) -> String {
        let qual = if self.qual.is_empty() {
            "*".to_string()
        } else {
            String::from_utf8_lossy(&self.qual).into_owned()
        };
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t*\t0\t0\t{}\t{}",
            self.read_id,
            self.flags,
            self.reference,
            self.pos + 1,
            self.mapq,
            self.cigar(),
            String::from_utf8_lossy(&self.seq),
            qual
        )
    }
}

/// Runs the hierarchical alignment of a read from a window seed.
///
/// Returns every resolved alignment record, or an empty vector when all
/// escalation stages miss.
pub fn align_read(
    graph: &VariationGraph,
    read: &SeqRead,
    seed: &WindowKey,
    max_clip: usize,
    max_shuffles: u32,
) -> Result<Vec<AlignmentRecord>> {
    let seed_idx = graph.node_index(seed.node).ok_or_else(|| {
        ArgraphError::BadInput(format!(
            "could not look up seed segment {} during alignment",
            seed.node
        ))
    })?;
    let seed_offset = seed.offset as usize;

    let mut ids: Vec<u32> = Vec::new();
    let mut starts: FxHashMap<u32, usize> = FxHashMap::default();
    let mut start_clip = 0usize;
    let mut end_clip = 0usize;

    // 1. exact alignment, shuffling the seed offset forward
    for shuffle in 0..=max_shuffles {
        (ids, starts) = perform_alignment(graph, seed_idx, &read.seq, seed_offset + shuffle as usize);
        if !ids.is_empty() {
            break;
        }
    }

    // 2. hard-clip the read start
    if ids.is_empty() {
        for clip in 1..=max_clip.min(read.seq.len().saturating_sub(1)) {
            (ids, starts) = perform_alignment(graph, seed_idx, &read.seq[clip..], seed_offset);
            if !ids.is_empty() {
                start_clip = clip;
                break;
            }
        }
    }

    // 3. hard-clip the read end
    if ids.is_empty() {
        start_clip = 0;
        for clip in 1..=max_clip.min(read.seq.len().saturating_sub(1)) {
            (ids, starts) = perform_alignment(
                graph,
                seed_idx,
                &read.seq[..read.seq.len() - clip],
                seed_offset,
            );
            if !ids.is_empty() {
                end_clip = clip;
                break;
            }
        }
    }

    // 4. terminal: nothing found, nothing emitted
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let seq_len = read.seq.len() - start_clip - end_clip;
    let mut records = Vec::with_capacity(ids.len());
    for (counter, path_id) in ids.iter().enumerate() {
        let pos = match starts.get(path_id) {
            Some(&pos) => pos,
            None => continue,
        };
        let reference = match graph.paths.get(path_id) {
            Some(name) => name.clone(),
            None => continue,
        };
        let mut flags = 0u16;
        if counter != 0 {
            flags |= FLAG_SECONDARY;
        }
        if read.rc {
            flags |= FLAG_REVERSE;
        }
        let qual = if read.qual.len() == read.seq.len() {
            read.qual[start_clip..start_clip + seq_len].to_vec()
        } else {
            Vec::new()
        };
        records.push(AlignmentRecord {
            read_id: read.id.clone(),
            flags,
            reference,
            pos,
            mapq: MAPQ,
            start_clip,
            end_clip,
            seq: read.seq[start_clip..start_clip + seq_len].to_vec(),
            qual,
        });
    }
    Ok(records)
}

/// One exact-alignment attempt: DFS from the seed segment at `offset`.
fn perform_alignment(
    graph: &VariationGraph,
    seed_idx: usize,
    read: &[u8],
    offset: usize,
) -> (Vec<u32>, FxHashMap<u32, usize>) {
    let mut traversals: Vec<Vec<u64>> = Vec::new();
    let mut current: Vec<u64> = Vec::new();
    dfs(graph, seed_idx, read, 0, offset, &mut current, &mut traversals);
    if traversals.is_empty() {
        return (Vec::new(), FxHashMap::default());
    }
    process_traversals(graph, &traversals, offset)
}

/// Recursive depth-first exact matcher.
///
/// Matches the segment sequence from `offset` against `read[distance..]`.
/// An N in the reference always matches. A traversal is recorded when the
/// whole read is consumed or the graph runs out of out-edges.
fn dfs(
    graph: &VariationGraph,
    node_idx: usize,
    read: &[u8],
    mut distance: usize,
    offset: usize,
    current: &mut Vec<u64>,
    traversals: &mut Vec<Vec<u64>>,
) -> bool {
    let segment = &graph.segments[node_idx];
    if offset >= segment.len() {
        return false;
    }

    for &base in &segment.sequence[offset..] {
        if distance == read.len() {
            break;
        }
        if base == b'N' {
            distance += 1;
            continue;
        }
        if base == read[distance] {
            distance += 1;
        } else {
            return false;
        }
    }

    current.push(segment.id);
    if distance == read.len() || segment.out_edges.is_empty() {
        traversals.push(current.clone());
        current.pop();
        return true;
    }

    let mut aligned = false;
    for &edge in &segment.out_edges {
        if let Some(next_idx) = graph.node_index(edge) {
            if dfs(graph, next_idx, read, distance, 0, current, traversals) {
                aligned = true;
            }
        }
    }
    current.pop();
    aligned
}

/// Resolves DFS traversals into reference assignments.
///
/// A path ID is kept only if it is present in every segment of a traversal;
/// the start position is the first segment's offset on that path plus the
/// seed offset. IDs are reported in ascending order so record emission is
/// deterministic.
fn process_traversals(
    graph: &VariationGraph,
    traversals: &[Vec<u64>],
    offset: usize,
) -> (Vec<u32>, FxHashMap<u32, usize>) {
    let mut ids: Vec<u32> = Vec::new();
    let mut starts: FxHashMap<u32, usize> = FxHashMap::default();

    for traversal in traversals {
        let mut path_counts: FxHashMap<u32, usize> = FxHashMap::default();
        let mut local_starts: FxHashMap<u32, usize> = FxHashMap::default();
        for (i, segment_id) in traversal.iter().enumerate() {
            let segment = match graph.segment(*segment_id) {
                Some(segment) => segment,
                None => continue,
            };
            for &path_id in &segment.path_ids {
                *path_counts.entry(path_id).or_insert(0) += 1;
                if i == 0 {
                    let position = segment.position.get(&path_id).copied().unwrap_or(0);
                    local_starts.insert(path_id, position + offset);
                }
            }
        }
        let mut kept: Vec<u32> = path_counts
            .into_iter()
            .filter(|&(_, count)| count >= traversal.len())
            .map(|(path_id, _)| path_id)
            .collect();
        kept.sort_unstable();
        for path_id in kept {
            if let Some(&start) = local_starts.get(&path_id) {
                starts.entry(path_id).or_insert(start);
            }
            ids.push(path_id);
        }
    }
    (ids, starts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfa::{msa_to_gfa, MsaEntry};

    fn two_seq_graph() -> VariationGraph {
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
        VariationGraph::from_gfa(&msa_to_gfa(&msa).unwrap(), 0).unwrap()
    }

    fn read(seq: &str) -> SeqRead {
        let qual: String = "I".repeat(seq.len());
        SeqRead::from_fastq_lines(&format!("@{}", "test-read"), seq, "+", &qual).unwrap()
    }

    fn seed(graph: &VariationGraph, node_pos: usize, offset: u32) -> WindowKey {
        WindowKey {
            graph_id: graph.graph_id,
            node: graph.segments[node_pos].id,
            offset,
            ..Default::default()
        }
    }

    #[test]
    fn test_exact_alignment_single_path() {
        let graph = two_seq_graph();
        let records = align_read(&graph, &read("AGTG"), &seed(&graph, 0, 0), 2, 15).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reference, "reference_A");
        assert_eq!(records[0].pos, 0);
        assert_eq!(records[0].cigar(), "4M");
        assert_eq!(records[0].flags, 0);
    }

    #[test]
    fn test_shared_node_aligns_to_both_references() {
        let graph = two_seq_graph();
        // the shared internal run holds GGTCA; GTCA starts one base in
        let shared_pos = graph
            .segments
            .iter()
            .position(|s| s.sequence.ends_with(b"GTCA"))
            .unwrap();
        let records = align_read(&graph, &read("GTCA"), &seed(&graph, shared_pos, 0), 2, 15).unwrap();
        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record.cigar(), "4M");
        }
        let mut positions: Vec<(String, usize)> = records
            .iter()
            .map(|r| (r.reference.clone(), r.pos))
            .collect();
        positions.sort();
        assert_eq!(
            positions,
            vec![("reference_A".to_string(), 4), ("reference_B".to_string(), 3)]
        );
        // the second record is flagged secondary
        assert_eq!(records[0].flags & FLAG_SECONDARY, 0);
        assert_ne!(records[1].flags & FLAG_SECONDARY, 0);
    }

    #[test]
    fn test_seed_shuffle_recovers_offset() {
        let graph = two_seq_graph();
        // true start is one base after the seed offset
        let shared_pos = graph
            .segments
            .iter()
            .position(|s| s.sequence.ends_with(b"GTCA"))
            .unwrap();
        let records = align_read(&graph, &read("TCA"), &seed(&graph, shared_pos, 1), 2, 15).unwrap();
        assert!(!records.is_empty());
        assert_eq!(records[0].pos, 5);
    }

    #[test]
    fn test_end_clip_recovers_mismatch() {
        let graph = two_seq_graph();
        // one mismatching base at the read end
        let records = align_read(&graph, &read("AGTGGTCATT"), &seed(&graph, 0, 0), 5, 15).unwrap();
        assert!(!records.is_empty());
        let record = &records[0];
        assert_eq!(record.cigar(), "9M1H");
        assert_eq!(record.seq.len(), 9);
        assert_eq!(record.reference, "reference_A");
    }

    #[test]
    fn test_alignment_miss_is_silent() {
        let graph = two_seq_graph();
        let records = align_read(&graph, &read("CCCCCCCC"), &seed(&graph, 0, 0), 2, 15).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_reverse_flag_carried() {
        let graph = two_seq_graph();
        let mut rc_read = read("CACT");
        rc_read.rev_complement(); // becomes AGTG, flagged rc
        let records = align_read(&graph, &rc_read, &seed(&graph, 0, 0), 2, 15).unwrap();
        assert_eq!(records.len(), 1);
        assert_ne!(records[0].flags & FLAG_REVERSE, 0);
    }

    #[test]
    fn test_sam_rendering() {
        let record = AlignmentRecord {
            read_id: "r1".to_string(),
            flags: FLAG_REVERSE,
            reference: "ref".to_string(),
            pos: 4,
            mapq: MAPQ,
            start_clip: 0,
            end_clip: 1,
            seq: b"ACGT".to_vec(),
            qual: b"IIII".to_vec(),
        };
        assert_eq!(record.to_sam_string(), "r1\t16\tref\t5\t30\t4M1H\t*\t0\t0\tACGT\tIIII");
    }
}
