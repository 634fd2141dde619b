//! On-disk persistence for the graph store and the containment index.
//!
//! Two files make up an index directory:
//!
//! - `argraph.gg`: runtime parameters plus the full graph store (segments,
//!   edges, path IDs, positions, k-mer totals).
//! - `argraph.lshe`: containment-index metadata plus the window lookup map.
//!
//! The LSH tables themselves are never written; they are rebuilt from the
//! window lookup at load time. Both files carry an 8-byte magic, the program
//! version, little-endian scalar fields and a zstd-compressed payload block.

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::ArgraphError;
use crate::graph::{Segment, Store, VariationGraph};
use crate::lshe::{ContainmentIndex, WindowKey};
use crate::VERSION;

/// File name of the serialized runtime info + graph store.
pub const GRAPH_STORE_FILE: &str = "argraph.gg";

/// File name of the serialized containment index.
pub const INDEX_FILE: &str = "argraph.lshe";

pub(crate) const GRAPH_STORE_MAGIC: &[u8; 8] = b"ARGGRAPH";
pub(crate) const INDEX_MAGIC: &[u8; 8] = b"ARGLSHE\0";
const ZSTD_LEVEL: i32 = 3;

// ---------------------------------------------------------------------------
// little-endian field codec
// ---------------------------------------------------------------------------

pub(crate) fn write_u8<W: Write>(w: &mut W, v: u8) -> Result<()> {
    w.write_all(&[v])?;
    Ok(())
}

pub(crate) fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub(crate) fn write_u64<W: Write>(w: &mut W, v: u64) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub(crate) fn write_f64<W: Write>(w: &mut W, v: f64) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub(crate) fn write_string<W: Write>(w: &mut W, v: &str) -> Result<()> {
    write_u32(w, v.len() as u32)?;
    w.write_all(v.as_bytes())?;
    Ok(())
}

pub(crate) fn write_bytes<W: Write>(w: &mut W, v: &[u8]) -> Result<()> {
    write_u64(w, v.len() as u64)?;
    w.write_all(v)?;
    Ok(())
}

pub(crate) fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf).context("truncated field (u8)")?;
    Ok(buf[0])
}

pub(crate) fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).context("truncated field (u32)")?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).context("truncated field (u64)")?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn read_f64<R: Read>(r: &mut R) -> Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).context("truncated field (f64)")?;
    Ok(f64::from_le_bytes(buf))
}

pub(crate) fn read_string<R: Read>(r: &mut R) -> Result<String> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).context("truncated field (string)")?;
    String::from_utf8(buf).context("non-UTF8 string field")
}

pub(crate) fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_u64(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).context("truncated field (bytes)")?;
    Ok(buf)
}

pub(crate) fn check_version(index_version: &str) -> Result<()> {
    if index_version != VERSION {
        return Err(ArgraphError::VersionSkew {
            index_version: index_version.to_string(),
            current_version: VERSION.to_string(),
        }
        .into());
    }
    Ok(())
}

fn compress_payload(payload: &[u8]) -> Result<Vec<u8>> {
    let mut compressor = zstd::bulk::Compressor::new(ZSTD_LEVEL)?;
    Ok(compressor.compress(payload)?)
}

fn decompress_payload(compressed: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(compressed).context("failed to decompress payload block")
}

// ---------------------------------------------------------------------------
// graph store
// ---------------------------------------------------------------------------

fn write_segment<W: Write>(w: &mut W, segment: &Segment) -> Result<()> {
    write_u64(w, segment.id)?;
    write_bytes(w, &segment.sequence)?;
    write_u32(w, segment.out_edges.len() as u32)?;
    for edge in &segment.out_edges {
        write_u64(w, *edge)?;
    }
    write_u32(w, segment.path_ids.len() as u32)?;
    for path_id in &segment.path_ids {
        write_u32(w, *path_id)?;
    }
    let mut positions: Vec<(u32, usize)> =
        segment.position.iter().map(|(&k, &v)| (k, v)).collect();
    positions.sort_unstable();
    write_u32(w, positions.len() as u32)?;
    for (path_id, position) in positions {
        write_u32(w, path_id)?;
        write_u64(w, position as u64)?;
    }
    write_f64(w, segment.kmer_freq)?;
    write_u8(w, segment.marked as u8)?;
    Ok(())
}

fn read_segment<R: Read>(r: &mut R) -> Result<Segment> {
    let id = read_u64(r)?;
    let sequence = read_bytes(r)?;
    let edge_count = read_u32(r)? as usize;
    let mut out_edges = Vec::with_capacity(edge_count);
    for _ in 0..edge_count {
        out_edges.push(read_u64(r)?);
    }
    let path_count = read_u32(r)? as usize;
    let mut path_ids = Vec::with_capacity(path_count);
    for _ in 0..path_count {
        path_ids.push(read_u32(r)?);
    }
    let mut position = FxHashMap::default();
    for _ in 0..read_u32(r)? {
        let path_id = read_u32(r)?;
        let pos = read_u64(r)? as usize;
        position.insert(path_id, pos);
    }
    let kmer_freq = read_f64(r)?;
    let marked = read_u8(r)? != 0;
    Ok(Segment {
        id,
        sequence,
        out_edges,
        path_ids,
        position,
        kmer_freq,
        marked,
    })
}

pub(crate) fn write_graph<W: Write>(w: &mut W, graph: &VariationGraph) -> Result<()> {
    write_u32(w, graph.graph_id)?;
    write_u64(w, graph.kmer_total)?;
    write_u8(w, graph.masked as u8)?;

    let mut paths: Vec<(u32, &String)> = graph.paths.iter().map(|(&k, v)| (k, v)).collect();
    paths.sort_unstable_by_key(|(id, _)| *id);
    write_u32(w, paths.len() as u32)?;
    for (path_id, name) in paths {
        write_u32(w, path_id)?;
        write_string(w, name)?;
    }

    let mut lengths: Vec<(u32, usize)> = graph.lengths.iter().map(|(&k, &v)| (k, v)).collect();
    lengths.sort_unstable();
    write_u32(w, lengths.len() as u32)?;
    for (path_id, length) in lengths {
        write_u32(w, path_id)?;
        write_u64(w, length as u64)?;
    }

    write_u32(w, graph.segments.len() as u32)?;
    for segment in &graph.segments {
        write_segment(w, segment)?;
    }
    Ok(())
}

pub(crate) fn read_graph<R: Read>(r: &mut R) -> Result<VariationGraph> {
    let mut graph = VariationGraph {
        graph_id: read_u32(r)?,
        kmer_total: read_u64(r)?,
        masked: read_u8(r)? != 0,
        ..Default::default()
    };
    for _ in 0..read_u32(r)? {
        let path_id = read_u32(r)?;
        let name = read_string(r)?;
        graph.paths.insert(path_id, name);
    }
    for _ in 0..read_u32(r)? {
        let path_id = read_u32(r)?;
        let length = read_u64(r)? as usize;
        graph.lengths.insert(path_id, length);
    }
    let segment_count = read_u32(r)? as usize;
    graph.segments.reserve(segment_count);
    for i in 0..segment_count {
        let segment = read_segment(r)?;
        graph.node_lookup.insert(segment.id, i);
        graph.segments.push(segment);
    }
    Ok(graph)
}

pub(crate) fn write_store<W: Write>(w: &mut W, store: &Store) -> Result<()> {
    let mut graph_ids: Vec<u32> = store.keys().copied().collect();
    graph_ids.sort_unstable();
    write_u32(w, graph_ids.len() as u32)?;
    for graph_id in graph_ids {
        write_graph(w, &store[&graph_id])?;
    }
    Ok(())
}

pub(crate) fn read_store<R: Read>(r: &mut R) -> Result<Store> {
    let mut store = Store::default();
    for _ in 0..read_u32(r)? {
        let graph = read_graph(r)?;
        store.insert(graph.graph_id, graph);
    }
    Ok(store)
}

pub(crate) fn open_magic(path: &Path, expected: &[u8; 8]) -> Result<BufReader<File>> {
    let file = File::open(path)
        .with_context(|| format!("can't open index file: {}", path.display()))?;
    if file
        .metadata()
        .with_context(|| format!("can't stat index file: {}", path.display()))?
        .len()
        == 0
    {
        return Err(ArgraphError::IndexCorrupt(format!("{} is empty", path.display())).into());
    }
    let mut reader = BufReader::new(file);
    let mut magic = [0u8; 8];
    reader
        .read_exact(&mut magic)
        .map_err(|_| ArgraphError::IndexCorrupt(format!("{} is truncated", path.display())))?;
    if &magic != expected {
        return Err(ArgraphError::IndexCorrupt(format!(
            "{} has the wrong magic bytes",
            path.display()
        ))
        .into());
    }
    Ok(reader)
}

/// Writes the version header + compressed payload under the given magic.
pub(crate) fn dump_with_magic(
    path: &Path,
    magic: &[u8; 8],
    version: &str,
    header: impl FnOnce(&mut BufWriter<File>) -> Result<()>,
    payload: &[u8],
) -> Result<()> {
    let mut writer = BufWriter::new(
        File::create(path).with_context(|| format!("can't create index file: {}", path.display()))?,
    );
    writer.write_all(magic)?;
    write_string(&mut writer, version)?;
    header(&mut writer)?;
    write_bytes(&mut writer, &compress_payload(payload)?)?;
    writer.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// containment index
// ---------------------------------------------------------------------------

fn write_window<W: Write>(w: &mut W, key: &str, window: &WindowKey) -> Result<()> {
    write_string(w, key)?;
    write_u32(w, window.graph_id)?;
    write_u64(w, window.node)?;
    write_u32(w, window.offset)?;
    write_u32(w, window.window_size)?;
    write_u32(w, window.merge_span)?;
    write_u32(w, window.sketch.len() as u32)?;
    for value in &window.sketch {
        write_u64(w, *value)?;
    }
    let mut contained: Vec<(u64, f64)> = window
        .contained_segments
        .iter()
        .map(|(&k, &v)| (k, v))
        .collect();
    contained.sort_unstable_by_key(|(id, _)| *id);
    write_u32(w, contained.len() as u32)?;
    for (segment_id, count) in contained {
        write_u64(w, segment_id)?;
        write_f64(w, count)?;
    }
    write_u32(w, window.path_ids.len() as u32)?;
    for path_id in &window.path_ids {
        write_u32(w, *path_id)?;
    }
    Ok(())
}

fn read_window<R: Read>(r: &mut R) -> Result<(String, WindowKey)> {
    let key = read_string(r)?;
    let mut window = WindowKey {
        graph_id: read_u32(r)?,
        node: read_u64(r)?,
        offset: read_u32(r)?,
        window_size: read_u32(r)?,
        merge_span: read_u32(r)?,
        ..Default::default()
    };
    for _ in 0..read_u32(r)? {
        window.sketch.push(read_u64(r)?);
    }
    for _ in 0..read_u32(r)? {
        let segment_id = read_u64(r)?;
        let count = read_f64(r)?;
        window.contained_segments.insert(segment_id, count);
    }
    for _ in 0..read_u32(r)? {
        window.path_ids.push(read_u32(r)?);
    }
    Ok((key, window))
}

/// Writes a containment index to disk (metadata + window lookup only).
///
/// Refuses to dump once the LSH ensemble has been built: a loaded index is
/// read-only.
pub fn dump_index(index: &ContainmentIndex, index_dir: &Path) -> Result<()> {
    dump_index_with_version(index, index_dir, VERSION)
}

pub(crate) fn dump_index_with_version(
    index: &ContainmentIndex,
    index_dir: &Path,
    version: &str,
) -> Result<()> {
    if index.window_lookup.is_empty() {
        anyhow::bail!("refusing to dump an empty containment index");
    }
    if index.is_indexed() {
        anyhow::bail!("this index cannot be dumped after the LSH ensemble has been built");
    }
    let mut payload = Vec::new();
    let mut keys: Vec<&String> = index.window_lookup.keys().collect();
    keys.sort_unstable();
    write_u64(&mut payload, keys.len() as u64)?;
    for key in keys {
        write_window(&mut payload, key, &index.window_lookup[key])?;
    }

    let path = index_dir.join(INDEX_FILE);
    dump_with_magic(
        &path,
        INDEX_MAGIC,
        version,
        |w| {
            write_u32(w, index.num_partitions as u32)?;
            write_u32(w, index.max_k as u32)?;
            write_u32(w, index.num_window_kmers as u32)?;
            write_u32(w, index.sketch_size as u32)?;
            Ok(())
        },
        &payload,
    )
}

/// Loads a containment index from disk and rebuilds the LSH ensemble from
/// the window lookup.
pub fn load_index(index_dir: &Path) -> Result<ContainmentIndex> {
    let path = index_dir.join(INDEX_FILE);
    let mut reader = open_magic(&path, INDEX_MAGIC)?;
    check_version(&read_string(&mut reader)?)?;
    let num_partitions = read_u32(&mut reader)? as usize;
    let max_k = read_u32(&mut reader)? as usize;
    let num_window_kmers = read_u32(&mut reader)? as usize;
    let sketch_size = read_u32(&mut reader)? as usize;

    let compressed = read_bytes(&mut reader)?;
    let payload = decompress_payload(&compressed)?;
    let mut payload = payload.as_slice();

    let mut index = ContainmentIndex::new(num_partitions, max_k, num_window_kmers, sketch_size);
    let window_count = read_u64(&mut payload)?;
    if window_count == 0 {
        return Err(ArgraphError::IndexCorrupt("loaded an empty index file".to_string()).into());
    }
    for _ in 0..window_count {
        let (key, window) = read_window(&mut payload)?;
        index.add_window(key, window)?;
    }
    index.build_ensemble()?;
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfa::{msa_to_gfa, MsaEntry};

    fn sample_store() -> Store {
        let msa = vec![
            MsaEntry {
                name: "refA".to_string(),
                aligned: b"AGTGGTCATA".to_vec(),
            },
            MsaEntry {
                name: "refB".to_string(),
                aligned: b"A-GGGTCA-A".to_vec(),
            },
        ];
        let graph = VariationGraph::from_gfa(&msa_to_gfa(&msa).unwrap(), 3).unwrap();
        let mut store = Store::default();
        store.insert(3, graph);
        store
    }

    #[test]
    fn test_store_round_trip() {
        let store = sample_store();
        let mut buffer = Vec::new();
        write_store(&mut buffer, &store).unwrap();
        let loaded = read_store(&mut buffer.as_slice()).unwrap();

        let original = &store[&3];
        let reloaded = &loaded[&3];
        assert_eq!(reloaded.segments.len(), original.segments.len());
        assert_eq!(reloaded.paths, original.paths);
        assert_eq!(reloaded.lengths, original.lengths);
        for (a, b) in original.segments.iter().zip(&reloaded.segments) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.sequence, b.sequence);
            assert_eq!(a.out_edges, b.out_edges);
            assert_eq!(a.path_ids, b.path_ids);
            assert_eq!(a.position, b.position);
        }
        assert_eq!(reloaded.node_lookup, original.node_lookup);
    }

    #[test]
    fn test_index_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContainmentIndex::new(4, 4, 74, 8);
        index
            .add_window(
                "g0n1o0s0".to_string(),
                WindowKey {
                    graph_id: 0,
                    node: 1,
                    offset: 0,
                    window_size: 80,
                    sketch: (0..8).collect(),
                    path_ids: vec![0, 1],
                    merge_span: 3,
                    ..Default::default()
                },
            )
            .unwrap();
        dump_index(&index, dir.path()).unwrap();

        let loaded = load_index(dir.path()).unwrap();
        assert!(loaded.is_indexed());
        assert_eq!(loaded.num_partitions, 4);
        assert_eq!(loaded.sketch_size, 8);
        let window = &loaded.window_lookup["g0n1o0s0"];
        assert_eq!(window.node, 1);
        assert_eq!(window.merge_span, 3);
        assert_eq!(window.path_ids, vec![0, 1]);
        assert_eq!(window.sketch, (0..8).collect::<Vec<u64>>());
    }

    #[test]
    fn test_loaded_index_cannot_be_dumped() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContainmentIndex::new(2, 4, 74, 8);
        index
            .add_window(
                "g0n0o0s0".to_string(),
                WindowKey {
                    sketch: vec![0; 8],
                    ..Default::default()
                },
            )
            .unwrap();
        dump_index(&index, dir.path()).unwrap();
        let loaded = load_index(dir.path()).unwrap();
        assert!(dump_index(&loaded, dir.path()).is_err());
    }

    #[test]
    fn test_version_skew_detected() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContainmentIndex::new(2, 4, 74, 8);
        index
            .add_window(
                "g0n0o0s0".to_string(),
                WindowKey {
                    sketch: vec![0; 8],
                    ..Default::default()
                },
            )
            .unwrap();
        dump_index_with_version(&index, dir.path(), "0.0.0-old").unwrap();
        let err = load_index(dir.path()).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_empty_index_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(INDEX_FILE), b"").unwrap();
        let err = load_index(dir.path()).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
