//! GFA1 reading/writing and MSA to GFA conversion.
//!
//! Only the fields the graphs round-trip are handled: segment lines with an
//! optional `KC:i:` k-mer count tag, link lines, path lines and comments.
//! MSA input is aligned FASTA; the converter collapses alignment columns into
//! shared and variant segments.

use anyhow::{Context, Result};
use rustc_hash::FxHashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::ArgraphError;
use crate::graph::VariationGraph;

/// A GFA segment line.
#[derive(Debug, Clone)]
pub struct GfaSegment {
    pub name: String,
    pub sequence: String,
    pub kmer_count: Option<u64>,
}

/// A GFA link line (orientations are always `+` here).
#[derive(Debug, Clone)]
pub struct GfaLink {
    pub from: String,
    pub to: String,
}

/// A GFA path line.
#[derive(Debug, Clone)]
pub struct GfaPath {
    pub name: String,
    pub segments: Vec<String>,
}

/// An in-memory GFA document.
#[derive(Debug, Clone, Default)]
pub struct Gfa {
    pub comments: Vec<String>,
    pub segments: Vec<GfaSegment>,
    pub links: Vec<GfaLink>,
    pub paths: Vec<GfaPath>,
}

impl Gfa {
    /// Parses GFA1 content from a byte source.
    pub fn parse<R: Read>(reader: R) -> Result<Self> {
        let reader = BufReader::new(reader);
        let mut gfa = Gfa::default();
        for (line_number, line) in reader.lines().enumerate() {
            let line = line.context("failed to read GFA line")?;
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split('\t');
            let record_type = fields.next().unwrap_or("");
            match record_type {
                "H" => {}
                "#" => {
                    gfa.comments.push(line[1..].trim().to_string());
                }
                "S" => {
                    let name = fields
                        .next()
                        .ok_or_else(|| bad_line("segment name", line_number))?
                        .to_string();
                    let sequence = fields
                        .next()
                        .ok_or_else(|| bad_line("segment sequence", line_number))?
                        .to_string();
                    let mut kmer_count = None;
                    for tag in fields {
                        if let Some(value) = tag.strip_prefix("KC:i:") {
                            kmer_count = Some(value.parse().map_err(|_| {
                                ArgraphError::BadInput(format!(
                                    "bad KC tag on GFA line {}",
                                    line_number + 1
                                ))
                            })?);
                        }
                    }
                    gfa.segments.push(GfaSegment {
                        name,
                        sequence,
                        kmer_count,
                    });
                }
                "L" => {
                    let from = fields
                        .next()
                        .ok_or_else(|| bad_line("link from", line_number))?
                        .to_string();
                    let _from_orient = fields.next();
                    let to = fields
                        .next()
                        .ok_or_else(|| bad_line("link to", line_number))?
                        .to_string();
                    gfa.links.push(GfaLink { from, to });
                }
                "P" => {
                    let name = fields
                        .next()
                        .ok_or_else(|| bad_line("path name", line_number))?
                        .to_string();
                    let segment_field = fields
                        .next()
                        .ok_or_else(|| bad_line("path segments", line_number))?;
                    let segments = segment_field
                        .split(',')
                        .map(|s| s.trim_end_matches(['+', '-']).to_string())
                        .collect();
                    gfa.paths.push(GfaPath { name, segments });
                }
                _ => {}
            }
        }
        Ok(gfa)
    }

    /// Loads a GFA file from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("can't read GFA file: {}", path.as_ref().display()))?;
        Self::parse(file)
    }

    /// Writes the document as GFA1.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writeln!(writer, "H\tVN:Z:1.0")?;
        for comment in &self.comments {
            writeln!(writer, "# {}", comment)?;
        }
        for segment in &self.segments {
            match segment.kmer_count {
                Some(kc) => writeln!(
                    writer,
                    "S\t{}\t{}\tKC:i:{}",
                    segment.name, segment.sequence, kc
                )?,
                None => writeln!(writer, "S\t{}\t{}", segment.name, segment.sequence)?,
            }
        }
        for link in &self.links {
            writeln!(writer, "L\t{}\t+\t{}\t+\t0M", link.from, link.to)?;
        }
        for path in &self.paths {
            let segments: Vec<String> = path.segments.iter().map(|s| format!("{}+", s)).collect();
            let overlaps = vec!["0M"; path.segments.len()];
            writeln!(
                writer,
                "P\t{}\t{}\t{}",
                path.name,
                segments.join(","),
                overlaps.join(",")
            )?;
        }
        Ok(())
    }

    /// Saves the document to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path.as_ref()).with_context(|| {
            format!("can't create GFA file: {}", path.as_ref().display())
        })?);
        self.write(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Converts a variation graph back to GFA, carrying accumulated `KC:i:`
    /// weights.
    ///
    /// Returns None when no reads were projected onto the graph (nothing
    /// worth writing). Masked segments and zero-length paths are skipped.
    pub fn from_graph(graph: &VariationGraph, comments: Vec<String>) -> Option<Self> {
        let mut gfa = Gfa {
            comments,
            ..Default::default()
        };
        let mut graph_used = false;
        for segment in &graph.segments {
            if segment.marked {
                continue;
            }
            if segment.kmer_freq > 0.0 {
                graph_used = true;
            }
            gfa.segments.push(GfaSegment {
                name: segment.id.to_string(),
                sequence: String::from_utf8_lossy(&segment.sequence).into_owned(),
                kmer_count: Some(segment.kmer_freq as u64),
            });
            for edge in &segment.out_edges {
                gfa.links.push(GfaLink {
                    from: segment.id.to_string(),
                    to: edge.to_string(),
                });
            }
        }
        if !graph_used {
            return None;
        }
        let mut path_ids: Vec<u32> = graph.paths.keys().copied().collect();
        path_ids.sort_unstable();
        for path_id in path_ids {
            if graph.lengths.get(&path_id).copied().unwrap_or(0) == 0 {
                continue;
            }
            let segments: Vec<String> = graph
                .segments
                .iter()
                .filter(|s| !s.marked && s.path_ids.contains(&path_id))
                .map(|s| s.id.to_string())
                .collect();
            gfa.paths.push(GfaPath {
                name: graph.paths[&path_id].clone(),
                segments,
            });
        }
        Some(gfa)
    }
}

fn bad_line(what: &str, line_number: usize) -> ArgraphError {
    ArgraphError::BadInput(format!("missing {} on GFA line {}", what, line_number + 1))
}

/// The comment carrying the run-wide projected k-mer total, written on
/// weighted GFAs so the haplotype command can recover it.
pub fn total_kmer_comment(total_kmers: u64) -> String {
    format!(
        "this graph is approximately weighted using k-mer frequencies from \
         projected read sketches (total k-mers projected across all graphs: {})",
        total_kmers
    )
}

/// Recovers the run-wide k-mer total from a weighted GFA's comments.
pub fn parse_total_kmer_comment(comments: &[String]) -> Option<u64> {
    for comment in comments {
        if let Some(rest) = comment.split("graphs: ").nth(1) {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(value) = digits.parse() {
                return Some(value);
            }
        }
    }
    None
}

/// One aligned sequence from an MSA file.
#[derive(Debug, Clone)]
pub struct MsaEntry {
    pub name: String,
    pub aligned: Vec<u8>,
}

/// Reads an MSA (aligned FASTA, `-` or `.` gaps) from disk.
pub fn read_msa<P: AsRef<Path>>(path: P) -> Result<Vec<MsaEntry>> {
    let file = File::open(path.as_ref())
        .with_context(|| format!("can't read MSA file: {}", path.as_ref().display()))?;
    let reader = BufReader::new(file);
    let mut entries: Vec<MsaEntry> = Vec::new();
    for line in reader.lines() {
        let line = line.context("failed to read MSA line")?;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix('>') {
            entries.push(MsaEntry {
                name: header.split_whitespace().next().unwrap_or("").to_string(),
                aligned: Vec::new(),
            });
        } else {
            let entry = entries.last_mut().ok_or_else(|| {
                ArgraphError::BadInput(format!(
                    "MSA file does not start with a FASTA header: {}",
                    path.as_ref().display()
                ))
            })?;
            for base in line.bytes() {
                let base = base.to_ascii_uppercase();
                match base {
                    b'A' | b'C' | b'G' | b'T' | b'N' | b'-' | b'.' => entry.aligned.push(base),
                    other => {
                        return Err(ArgraphError::BadInput(format!(
                            "MSA contains a non-ACGTN/gap character: {}",
                            other as char
                        ))
                        .into())
                    }
                }
            }
        }
    }
    if entries.is_empty() {
        return Err(ArgraphError::BadInput(format!(
            "no sequences found in MSA: {}",
            path.as_ref().display()
        ))
        .into());
    }
    let width = entries[0].aligned.len();
    if entries.iter().any(|e| e.aligned.len() != width) {
        return Err(ArgraphError::BadInput(format!(
            "MSA sequences have unequal aligned lengths: {}",
            path.as_ref().display()
        ))
        .into());
    }
    Ok(entries)
}

/// Converts an MSA to a GFA variation graph.
///
/// Alignment columns are grouped by base; sequences sharing a base share a
/// segment, and a segment extends across columns for as long as the grouping
/// of sequences stays the same. Gap columns simply leave a sequence out of
/// the open segments; an edge is added from the last segment a sequence
/// visited whenever it enters a new one.
pub fn msa_to_gfa(msa: &[MsaEntry]) -> Result<Gfa> {
    if msa.is_empty() {
        return Err(ArgraphError::BadInput("empty MSA".to_string()).into());
    }
    let width = msa[0].aligned.len();
    let mut gfa = Gfa::default();
    let mut next_id: u64 = 1;
    let mut open: Vec<(Vec<usize>, Vec<u8>)> = Vec::new();
    let mut last_segment: Vec<Option<u64>> = vec![None; msa.len()];
    let mut paths: Vec<Vec<u64>> = vec![Vec::new(); msa.len()];
    let mut seen_edges: FxHashSet<(u64, u64)> = FxHashSet::default();

    let mut close_open = |open: &mut Vec<(Vec<usize>, Vec<u8>)>,
                          gfa: &mut Gfa,
                          next_id: &mut u64,
                          last_segment: &mut [Option<u64>],
                          paths: &mut [Vec<u64>],
                          seen_edges: &mut FxHashSet<(u64, u64)>| {
        for (members, sequence) in open.drain(..) {
            let id = *next_id;
            *next_id += 1;
            gfa.segments.push(GfaSegment {
                name: id.to_string(),
                sequence: String::from_utf8_lossy(&sequence).into_owned(),
                kmer_count: None,
            });
            for member in members {
                if let Some(previous) = last_segment[member] {
                    if seen_edges.insert((previous, id)) {
                        gfa.links.push(GfaLink {
                            from: previous.to_string(),
                            to: id.to_string(),
                        });
                    }
                }
                last_segment[member] = Some(id);
                paths[member].push(id);
            }
        }
    };

    for col in 0..width {
        // group the sequences active in this column by their base
        let mut groups: Vec<(u8, Vec<usize>)> = Vec::new();
        for (i, entry) in msa.iter().enumerate() {
            let base = entry.aligned[col];
            if base == b'-' || base == b'.' {
                continue;
            }
            match groups.iter_mut().find(|(b, _)| *b == base) {
                Some(group) => group.1.push(i),
                None => groups.push((base, vec![i])),
            }
        }
        if groups.is_empty() {
            continue;
        }

        let same_partition = open.len() == groups.len()
            && groups
                .iter()
                .all(|(_, members)| open.iter().any(|(m, _)| m == members));

        if same_partition {
            for (base, members) in &groups {
                let block = open
                    .iter_mut()
                    .find(|(m, _)| m == members)
                    .expect("partition matched but block missing");
                block.1.push(*base);
            }
        } else {
            close_open(
                &mut open,
                &mut gfa,
                &mut next_id,
                &mut last_segment,
                &mut paths,
                &mut seen_edges,
            );
            for (base, members) in groups {
                open.push((members, vec![base]));
            }
        }
    }
    close_open(
        &mut open,
        &mut gfa,
        &mut next_id,
        &mut last_segment,
        &mut paths,
        &mut seen_edges,
    );

    for (i, entry) in msa.iter().enumerate() {
        if paths[i].is_empty() {
            return Err(ArgraphError::BadInput(format!(
                "MSA sequence {} is all gaps",
                entry.name
            ))
            .into());
        }
        gfa.paths.push(GfaPath {
            name: entry.name.clone(),
            segments: paths[i].iter().map(|id| id.to_string()).collect(),
        });
    }
    Ok(gfa)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msa() -> Vec<MsaEntry> {
        vec![
            MsaEntry {
                name: "seq1".to_string(),
                aligned: b"AGTGGTCATA".to_vec(),
            },
            MsaEntry {
                name: "seq2".to_string(),
                aligned: b"A-GGGTCA-A".to_vec(),
            },
        ]
    }

    #[test]
    fn test_msa_to_gfa_shares_common_runs() {
        let gfa = msa_to_gfa(&msa()).unwrap();
        assert_eq!(gfa.paths.len(), 2);
        // the shared start column becomes segment 1 on both paths
        assert_eq!(gfa.paths[0].segments[0], "1");
        assert_eq!(gfa.paths[1].segments[0], "1");
        assert_eq!(gfa.segments[0].sequence, "A");
        // the shared internal run is a single segment
        assert!(gfa.segments.iter().any(|s| s.sequence.contains("GTCA")));
    }

    #[test]
    fn test_msa_to_gfa_path_reconstruction() {
        let gfa = msa_to_gfa(&msa()).unwrap();
        for (path, expected) in gfa.paths.iter().zip(["AGTGGTCATA", "AGGGTCAA"]) {
            let rebuilt: String = path
                .segments
                .iter()
                .map(|name| {
                    gfa.segments
                        .iter()
                        .find(|s| &s.name == name)
                        .unwrap()
                        .sequence
                        .clone()
                })
                .collect();
            assert_eq!(rebuilt, expected);
        }
    }

    #[test]
    fn test_gfa_round_trip() {
        let gfa = msa_to_gfa(&msa()).unwrap();
        let mut buffer = Vec::new();
        gfa.write(&mut buffer).unwrap();
        let reparsed = Gfa::parse(buffer.as_slice()).unwrap();
        assert_eq!(reparsed.segments.len(), gfa.segments.len());
        assert_eq!(reparsed.links.len(), gfa.links.len());
        assert_eq!(reparsed.paths.len(), gfa.paths.len());
        assert_eq!(reparsed.paths[0].segments, gfa.paths[0].segments);
    }

    #[test]
    fn test_kc_tag_round_trip() {
        let text = "H\tVN:Z:1.0\nS\t1\tACGT\tKC:i:42\n";
        let gfa = Gfa::parse(text.as_bytes()).unwrap();
        assert_eq!(gfa.segments[0].kmer_count, Some(42));
        let mut buffer = Vec::new();
        gfa.write(&mut buffer).unwrap();
        assert!(String::from_utf8(buffer).unwrap().contains("KC:i:42"));
    }

    #[test]
    fn test_total_kmer_comment_round_trip() {
        let comment = total_kmer_comment(123456);
        assert_eq!(parse_total_kmer_comment(&[comment]), Some(123456));
        assert_eq!(parse_total_kmer_comment(&["nothing here".to_string()]), None);
    }
}
