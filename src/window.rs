//! Sliding-window sketching of graph paths.
//!
//! Every reference path through a graph is expanded to per-base (segment,
//! offset) coordinates, windows of fixed size are sketched along it, and
//! consecutive windows with identical sketches are run-length merged.
//! Windows from different paths that start at the same graph coordinate with
//! the same sketch are deduplicated into one entry carrying both path IDs.
//!
//! Paths are windowed in parallel; collation into the per-coordinate map is
//! single-threaded in the caller.

use anyhow::{Context, Result};
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::error::ArgraphError;
use crate::graph::{Segment, VariationGraph};
use crate::lshe::WindowKey;
use crate::sketch::{sketch_sequence, SketchAlgo};

/// Windowing summary for one graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowStats {
    /// Number of raw windows slid over the graph paths.
    pub num_windows: usize,
    /// Number of distinct sketches after merging and deduplication.
    pub num_distinct_sketches: usize,
    /// Largest run of consecutive identical sketches that was merged.
    pub max_span: u32,
}

/// Windows and sketches every path of a graph.
///
/// Returns the deduplicated windows, each under a unique index key, plus the
/// windowing statistics. Side effect: refreshes the graph's per-path segment
/// offsets via linearization.
pub fn window_graph(
    graph: &mut VariationGraph,
    window_size: usize,
    kmer_size: usize,
    sketch_size: usize,
    algo: SketchAlgo,
    max_sketch_span: u32,
) -> Result<(Vec<(String, WindowKey)>, WindowStats)> {
    let path_sequences = graph.graph_to_sequences()?;

    let mut stats = WindowStats::default();
    for (path_id, sequence) in &path_sequences {
        if sequence.len() < window_size {
            return Err(ArgraphError::ShortGraph {
                path: graph
                    .paths
                    .get(path_id)
                    .cloned()
                    .unwrap_or_else(|| path_id.to_string()),
                length: sequence.len(),
                window_size,
            }
            .into());
        }
        stats.num_windows += sequence.len() - window_size + 1;
    }

    let mut path_ids: Vec<u32> = path_sequences.keys().copied().collect();
    path_ids.sort_unstable();

    let segments = &graph.segments;
    let graph_id = graph.graph_id;
    let per_path: Vec<Vec<WindowKey>> = path_ids
        .par_iter()
        .map(|&path_id| {
            window_path(
                segments,
                graph_id,
                path_id,
                &path_sequences[&path_id],
                window_size,
                kmer_size,
                sketch_size,
                algo,
                max_sketch_span,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    // collate, merging identical sketches that share a start coordinate
    let mut coord_lookup: FxHashMap<String, Vec<WindowKey>> = FxHashMap::default();
    let mut coords: Vec<String> = Vec::new();
    for windows in per_path {
        for window in windows {
            stats.max_span = stats.max_span.max(window.merge_span);
            let coord = window.coord_string();
            let entry = coord_lookup.entry(coord.clone()).or_insert_with(|| {
                coords.push(coord);
                Vec::new()
            });
            match entry.iter_mut().find(|existing| existing.sketch == window.sketch) {
                Some(existing) => {
                    for (segment_id, count) in window.contained_segments {
                        *existing.contained_segments.entry(segment_id).or_insert(0.0) += count;
                    }
                    existing.path_ids.extend(window.path_ids);
                    existing.merge_span = existing.merge_span.max(window.merge_span);
                }
                None => {
                    entry.push(window);
                    stats.num_distinct_sketches += 1;
                }
            }
        }
    }

    if stats.num_distinct_sketches == 0 {
        anyhow::bail!(
            "no sketches produced after windowing graph {} paths",
            graph.graph_id
        );
    }

    coords.sort_unstable();
    let mut keyed = Vec::with_capacity(stats.num_distinct_sketches);
    for coord in coords {
        let windows = coord_lookup
            .remove(&coord)
            .context("window coordinate vanished during collation")?;
        for (variant, window) in windows.into_iter().enumerate() {
            keyed.push((format!("{}s{}", coord, variant), window));
        }
    }
    Ok((keyed, stats))
}

/// Slides windows along one path, sketching and run-length merging.
#[allow(clippy::too_many_arguments)]
fn window_path(
    segments: &[Segment],
    graph_id: u32,
    path_id: u32,
    path_sequence: &[u8],
    window_size: usize,
    kmer_size: usize,
    sketch_size: usize,
    algo: SketchAlgo,
    max_sketch_span: u32,
) -> Result<Vec<WindowKey>> {
    let path_length = path_sequence.len();

    // per-base segment ID and intra-segment offset along the path
    let mut base_segments: Vec<u64> = Vec::with_capacity(path_length);
    let mut base_offsets: Vec<u32> = Vec::with_capacity(path_length);
    for segment in segments {
        if segment.marked || !segment.path_ids.contains(&path_id) {
            continue;
        }
        for offset in 0..segment.len() {
            base_segments.push(segment.id);
            base_offsets.push(offset as u32);
        }
    }
    if base_segments.len() != path_length {
        anyhow::bail!(
            "windowing did not traverse entire path {} of graph {}",
            path_id,
            graph_id
        );
    }

    let num_windows = path_length - window_size + 1;
    let mut windows: Vec<WindowKey> = Vec::new();
    let mut holder: Option<WindowKey> = None;
    for i in 0..num_windows {
        let sketch = sketch_sequence(
            &path_sequence[i..i + window_size],
            kmer_size,
            sketch_size,
            algo,
        )?;

        let merge = matches!(&holder, Some(held) if held.sketch == sketch);
        if !merge {
            if let Some(held) = holder.take() {
                windows.push(held);
            }
            holder = Some(WindowKey {
                graph_id,
                node: base_segments[i],
                offset: base_offsets[i],
                window_size: window_size as u32,
                sketch,
                contained_segments: FxHashMap::default(),
                path_ids: vec![path_id],
                merge_span: 0,
                freq: 0.0,
            });
        }

        if let Some(held) = holder.as_mut() {
            for &segment_id in &base_segments[i..i + window_size] {
                *held.contained_segments.entry(segment_id).or_insert(0.0) += 1.0;
            }
            if merge {
                held.merge_span += 1;
                if held.merge_span > max_sketch_span {
                    return Err(ArgraphError::RunawayMerge {
                        span: held.merge_span,
                        limit: max_sketch_span,
                    }
                    .into());
                }
            }
        }
    }
    if let Some(held) = holder.take() {
        windows.push(held);
    }
    Ok(windows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfa::{msa_to_gfa, MsaEntry};

    fn graph_from_msa(rows: &[(&str, &str)]) -> VariationGraph {
        let msa: Vec<MsaEntry> = rows
            .iter()
            .map(|(name, aligned)| MsaEntry {
                name: name.to_string(),
                aligned: aligned.as_bytes().to_vec(),
            })
            .collect();
        VariationGraph::from_gfa(&msa_to_gfa(&msa).unwrap(), 0).unwrap()
    }

    #[test]
    fn test_window_completeness() {
        let mut graph = graph_from_msa(&[
            ("seq1", "AGTGGTCATA"),
            ("seq2", "A-GGGTCA-A"),
        ]);
        let path_seqs = graph.graph_to_sequences().unwrap();
        let window_size = 4;

        for (&path_id, sequence) in &path_seqs {
            let windows = window_path(
                &graph.segments,
                0,
                path_id,
                sequence,
                window_size,
                3,
                16,
                SketchAlgo::Khf,
                100,
            )
            .unwrap();

            // reconstruct per-base coordinates to map windows back to linear
            // start positions
            let mut coords = Vec::new();
            for segment in &graph.segments {
                if segment.path_ids.contains(&path_id) {
                    for offset in 0..segment.len() {
                        coords.push((segment.id, offset as u32));
                    }
                }
            }
            let mut covered = vec![false; sequence.len() - window_size + 1];
            for window in &windows {
                let start = coords
                    .iter()
                    .position(|&(node, offset)| node == window.node && offset == window.offset)
                    .unwrap();
                for span in 0..=window.merge_span as usize {
                    covered[start + span] = true;
                }
            }
            assert!(
                covered.iter().all(|&c| c),
                "window starts missing for path {}",
                path_id
            );
        }
    }

    #[test]
    fn test_cross_path_dedup_merges_refs() {
        // identical sequences share every window
        let mut graph = graph_from_msa(&[("seq1", "ACGTACGTAC"), ("seq2", "ACGTACGTAC")]);
        let (windows, stats) =
            window_graph(&mut graph, 4, 3, 16, SketchAlgo::Khf, 100).unwrap();
        assert!(stats.num_distinct_sketches >= 1);
        for (_, window) in &windows {
            assert!(window.path_ids.contains(&0));
            assert!(window.path_ids.contains(&1));
        }
    }

    #[test]
    fn test_short_graph_rejected() {
        let mut graph = graph_from_msa(&[("seq1", "ACGTA")]);
        let err = window_graph(&mut graph, 10, 3, 16, SketchAlgo::Khf, 100).unwrap_err();
        assert!(err.to_string().contains("shorter"));
    }

    #[test]
    fn test_runaway_merge_detected() {
        // a homopolymer makes every window sketch identical
        let mut graph = graph_from_msa(&[("seq1", "AAAAAAAAAAAA")]);
        let err = window_graph(&mut graph, 4, 3, 16, SketchAlgo::Khf, 2).unwrap_err();
        assert!(err.to_string().contains("merge span"));
    }

    #[test]
    fn test_merge_spans_counted() {
        let mut graph = graph_from_msa(&[("seq1", "AAAAAAAAAAAA")]);
        let (windows, stats) =
            window_graph(&mut graph, 4, 3, 16, SketchAlgo::Khf, 100).unwrap();
        // 9 raw windows collapse into one merged window spanning them all
        assert_eq!(stats.num_windows, 9);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].1.merge_span, 8);
    }
}
