//! The three pipeline drivers (index, align, haplotype) and the boss/minion
//! read-mapping pool.
//!
//! Work flows through bounded channels so slow stages exert backpressure on
//! fast ones. During alignment one sketch worker runs per CPU and one minion
//! runs per graph; each minion owns its graph outright, so segment weights
//! are mutated by exactly one thread and handed back when the channels
//! drain.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

use crate::align::{align_read, AlignmentRecord, MAX_CLIP, MAX_SHUFFLES};
use crate::db;
use crate::em::EmRunner;
use crate::error::ArgraphError;
use crate::gfa::{self, Gfa};
use crate::graph::{Store, VariationGraph};
use crate::lshe::{ContainmentIndex, WindowKey};
use crate::seqio::{ReadStream, SeqRead};
use crate::sketch::{sketch_sequence_filtered, BloomFilter, SketchAlgo};
use crate::window::window_graph;
use crate::VERSION;

/// Capacity of the bounded pipeline channels.
pub const CHANNEL_BUFFER: usize = 64;

/// Runtime information shared by all subcommands and persisted with the
/// graph store.
#[derive(Debug, Clone)]
pub struct Info {
    pub version: String,
    pub kmer_size: usize,
    pub sketch_size: usize,
    pub window_size: usize,
    pub num_partitions: usize,
    pub max_k: usize,
    pub max_sketch_span: u32,
    pub containment_threshold: f64,
    pub sketch_algo: SketchAlgo,
    pub store: Store,
}

impl Info {
    /// Persists the runtime info and graph store to `argraph.gg`.
    pub fn dump(&self, index_dir: &Path) -> Result<()> {
        let mut payload = Vec::new();
        db::write_store(&mut payload, &self.store)?;
        db::dump_with_magic(
            &index_dir.join(db::GRAPH_STORE_FILE),
            db::GRAPH_STORE_MAGIC,
            &self.version,
            |w| {
                db::write_u32(w, self.kmer_size as u32)?;
                db::write_u32(w, self.sketch_size as u32)?;
                db::write_u32(w, self.window_size as u32)?;
                db::write_u32(w, self.num_partitions as u32)?;
                db::write_u32(w, self.max_k as u32)?;
                db::write_u32(w, self.max_sketch_span)?;
                db::write_f64(w, self.containment_threshold)?;
                db::write_u8(w, self.sketch_algo.tag())?;
                Ok(())
            },
            &payload,
        )
    }

    /// Loads the runtime info and graph store from `argraph.gg`.
    ///
    /// Fails with a version-skew error when the index was written by a
    /// different program version.
    pub fn load(index_dir: &Path) -> Result<Self> {
        let path = index_dir.join(db::GRAPH_STORE_FILE);
        let mut reader = db::open_magic(&path, db::GRAPH_STORE_MAGIC)?;
        let version = db::read_string(&mut reader)?;
        db::check_version(&version)?;
        let kmer_size = db::read_u32(&mut reader)? as usize;
        let sketch_size = db::read_u32(&mut reader)? as usize;
        let window_size = db::read_u32(&mut reader)? as usize;
        let num_partitions = db::read_u32(&mut reader)? as usize;
        let max_k = db::read_u32(&mut reader)? as usize;
        let max_sketch_span = db::read_u32(&mut reader)?;
        let containment_threshold = db::read_f64(&mut reader)?;
        let sketch_algo = SketchAlgo::from_tag(db::read_u8(&mut reader)?).ok_or_else(|| {
            ArgraphError::IndexCorrupt("unknown sketch algorithm tag".to_string())
        })?;

        let compressed = db::read_bytes(&mut reader)?;
        let payload = zstd::decode_all(compressed.as_slice())
            .context("failed to decompress graph store")?;
        let store = db::read_store(&mut payload.as_slice())?;
        if store.is_empty() {
            return Err(
                ArgraphError::IndexCorrupt("graph store appears empty".to_string()).into(),
            );
        }
        Ok(Info {
            version,
            kmer_size,
            sketch_size,
            window_size,
            num_partitions,
            max_k,
            max_sketch_span,
            containment_threshold,
            sketch_algo,
            store,
        })
    }
}

// ---------------------------------------------------------------------------
// index
// ---------------------------------------------------------------------------

/// Options for the index subcommand.
#[derive(Debug, Clone)]
pub struct IndexOpts {
    pub msa_dir: PathBuf,
    pub index_dir: PathBuf,
    pub kmer_size: usize,
    pub sketch_size: usize,
    pub window_size: usize,
    pub num_partitions: usize,
    pub max_k: usize,
    pub max_sketch_span: u32,
    pub sketch_algo: SketchAlgo,
}

/// Converts a directory of MSAs into sketched, indexed variation graphs.
pub fn run_index(opts: &IndexOpts) -> Result<()> {
    if opts.kmer_size > opts.window_size {
        anyhow::bail!("k-mer size is greater than the window size");
    }
    let mut msa_files: Vec<PathBuf> = std::fs::read_dir(&opts.msa_dir)
        .with_context(|| format!("can't read MSA directory: {}", opts.msa_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("msa"))
        .collect();
    msa_files.sort();
    if msa_files.is_empty() {
        return Err(ArgraphError::BadInput(format!(
            "no MSA files (.msa) found in {}",
            opts.msa_dir.display()
        ))
        .into());
    }
    info!(files = msa_files.len(), "building variation graphs from MSAs");

    let mut graphs: Vec<VariationGraph> = msa_files
        .par_iter()
        .enumerate()
        .map(|(graph_id, msa_file)| {
            let msa = gfa::read_msa(msa_file)?;
            let gfa = gfa::msa_to_gfa(&msa)
                .with_context(|| format!("converting {}", msa_file.display()))?;
            VariationGraph::from_gfa(&gfa, graph_id as u32)
                .with_context(|| format!("building graph from {}", msa_file.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    info!(graphs = graphs.len(), "variation graphs built");

    // window and sketch each graph in parallel, then collate in this thread
    let num_window_kmers = opts.window_size - opts.kmer_size + 1;
    let windowed: Vec<_> = graphs
        .par_iter_mut()
        .map(|graph| {
            window_graph(
                graph,
                opts.window_size,
                opts.kmer_size,
                opts.sketch_size,
                opts.sketch_algo,
                opts.max_sketch_span,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let mut index = ContainmentIndex::new(
        opts.num_partitions,
        opts.max_k,
        num_window_kmers,
        opts.sketch_size,
    );
    let mut total_windows = 0usize;
    let mut max_span = 0u32;
    for (windows, stats) in windowed {
        total_windows += stats.num_windows;
        max_span = max_span.max(stats.max_span);
        for (key, window) in windows {
            index.add_window(key, window)?;
        }
    }
    info!(
        windows = total_windows,
        sketches = index.num_sketches(),
        max_merge_span = max_span,
        "windowed and sketched graph paths"
    );

    std::fs::create_dir_all(&opts.index_dir)
        .with_context(|| format!("can't create index directory: {}", opts.index_dir.display()))?;
    let mut store = Store::default();
    for graph in graphs {
        store.insert(graph.graph_id, graph);
    }
    let runtime_info = Info {
        version: VERSION.to_string(),
        kmer_size: opts.kmer_size,
        sketch_size: opts.sketch_size,
        window_size: opts.window_size,
        num_partitions: opts.num_partitions,
        max_k: opts.max_k,
        max_sketch_span: opts.max_sketch_span,
        containment_threshold: 0.99,
        sketch_algo: opts.sketch_algo,
        store,
    };
    runtime_info.dump(&opts.index_dir)?;
    db::dump_index(&index, &opts.index_dir)?;
    info!(dir = %opts.index_dir.display(), "index saved");
    Ok(())
}

// ---------------------------------------------------------------------------
// align
// ---------------------------------------------------------------------------

/// Options for the align subcommand.
#[derive(Debug, Clone)]
pub struct AlignOpts {
    pub index_dir: PathBuf,
    pub graph_dir: PathBuf,
    pub inputs: Vec<PathBuf>,
    pub fasta: bool,
    pub trim: bool,
    pub min_qual: u8,
    pub min_read_length: usize,
    pub containment_threshold: f64,
    pub min_kmer_coverage: f64,
    pub no_exact_align: bool,
    pub bloom_filter: bool,
    pub sam_out: Option<PathBuf>,
    pub threads: usize,
}

/// Counters accumulated across the sketch workers and the writer.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapStats {
    pub received: usize,
    pub mapped: usize,
    pub multimapped: usize,
    pub alignments: usize,
    pub trimmed_away: usize,
    pub length_total: usize,
}

struct MinionPair {
    mappings: Vec<WindowKey>,
    read: SeqRead,
}

/// Streams reads against the index, projects weights, aligns, prunes and
/// writes the weighted graphs.
pub fn run_align(opts: &AlignOpts) -> Result<MapStats> {
    let mut runtime_info = Info::load(&opts.index_dir)?;
    // weights always start from zero for a fresh alignment run
    for graph in runtime_info.store.values_mut() {
        graph.reset_weights();
    }
    let index = db::load_index(&opts.index_dir)?;
    if index.sketch_size != runtime_info.sketch_size {
        return Err(ArgraphError::SketchMismatch(format!(
            "index files disagree on sketch size ({} vs {})",
            index.sketch_size, runtime_info.sketch_size
        ))
        .into());
    }
    info!(
        graphs = runtime_info.store.len(),
        sketches = index.num_sketches(),
        kmer_size = runtime_info.kmer_size,
        sketch_size = runtime_info.sketch_size,
        "index loaded"
    );

    let stats = map_reads(&mut runtime_info, index, opts)?;
    if stats.received == 0 {
        return Err(ArgraphError::BadInput("no reads received from input".to_string()).into());
    }
    info!(
        received = stats.received,
        mapped = stats.mapped,
        multimapped = stats.multimapped,
        alignments = stats.alignments,
        mean_read_length = stats.length_total / stats.received,
        "read mapping finished"
    );
    if stats.mapped == 0 {
        warn!("no reads could be mapped to the reference graphs");
        return Ok(stats);
    }

    // prune the augmented graphs and keep the survivors
    let total_kmers: u64 = runtime_info.store.values().map(|g| g.kmer_total).sum();
    let min_coverage = opts.min_kmer_coverage;
    let mut kept: Vec<&VariationGraph> = runtime_info
        .store
        .par_iter_mut()
        .filter_map(|(_, graph)| {
            if graph.prune(min_coverage) {
                Some(&*graph)
            } else {
                None
            }
        })
        .collect();
    kept.sort_unstable_by_key(|g| g.graph_id);

    std::fs::create_dir_all(&opts.graph_dir)
        .with_context(|| format!("can't create graph directory: {}", opts.graph_dir.display()))?;
    let mut written = 0usize;
    for graph in kept {
        let comments = vec![
            format!("variation graph weighted by argraph (version {})", VERSION),
            gfa::total_kmer_comment(total_kmers),
        ];
        if let Some(weighted) = Gfa::from_graph(graph, comments) {
            let path = opts
                .graph_dir
                .join(format!("graph-{}.gfa", graph.graph_id));
            weighted.save(&path)?;
            written += 1;
            let survivors: Vec<&String> = graph
                .paths
                .iter()
                .filter(|(id, _)| graph.lengths.get(*id).copied().unwrap_or(0) != 0)
                .map(|(_, name)| name)
                .collect();
            debug!(graph = graph.graph_id, paths = ?survivors, "kept after pruning");
        }
    }
    info!(
        graphs = written,
        total_kmers,
        dir = %opts.graph_dir.display(),
        "weighted graphs written"
    );
    Ok(stats)
}

/// The boss: wires the reader, sketch workers, graph minions and the SAM
/// writer together, then reassembles the store from the minions.
fn map_reads(runtime_info: &mut Info, index: ContainmentIndex, opts: &AlignOpts) -> Result<MapStats> {
    let store = std::mem::take(&mut runtime_info.store);
    let kmer_size = runtime_info.kmer_size;
    let sketch_algo = runtime_info.sketch_algo;
    let sketch_size = runtime_info.sketch_size;
    let threshold = opts.containment_threshold;
    let exact_align = !opts.no_exact_align;

    // SAM header needs every reference path before the graphs move into the
    // minions
    let mut sam_writer: Box<dyn Write + Send> = match &opts.sam_out {
        Some(path) => Box::new(BufWriter::new(File::create(path).with_context(|| {
            format!("could not open file for SAM writing: {}", path.display())
        })?)),
        None => Box::new(BufWriter::new(std::io::stdout())),
    };
    if exact_align {
        write_sam_header(&mut sam_writer, &store)?;
    }

    let (read_tx, read_rx) = bounded::<SeqRead>(CHANNEL_BUFFER);
    let (record_tx, record_rx) = bounded::<AlignmentRecord>(CHANNEL_BUFFER);
    let shared_stats = Arc::new(Mutex::new(MapStats::default()));
    let index = Arc::new(index);

    // reader: streams FASTQ/FASTA records into the bounded read channel
    let inputs = opts.inputs.clone();
    let fasta = opts.fasta;
    let trim = opts.trim;
    let min_qual = opts.min_qual;
    let min_read_length = opts.min_read_length;
    let reader_stats = Arc::clone(&shared_stats);
    let reader_handle = thread::spawn(move || -> Result<()> {
        let mut trimmed_away = 0usize;
        for input in &inputs {
            let mut stream = ReadStream::open(input, fasta)?;
            while let Some(mut read) = stream.read_next()? {
                if trim {
                    read.qual_trim(min_qual);
                    if read.seq.len() < min_read_length {
                        trimmed_away += 1;
                        continue;
                    }
                }
                if read_tx.send(read).is_err() {
                    // downstream hung up, likely a fatal error elsewhere
                    return Ok(());
                }
            }
        }
        reader_stats.lock().unwrap().trimmed_away = trimmed_away;
        Ok(())
    });

    // graph minions: one per graph, each owning its graph's weights
    let mut minion_senders: FxHashMap<u32, Sender<MinionPair>> = FxHashMap::default();
    let mut minion_handles = Vec::with_capacity(store.len());
    for (graph_id, mut graph) in store {
        let (pair_tx, pair_rx) = bounded::<MinionPair>(CHANNEL_BUFFER);
        minion_senders.insert(graph_id, pair_tx);
        let minion_record_tx = record_tx.clone();
        minion_handles.push(thread::spawn(move || -> Result<VariationGraph> {
            while let Ok(mut pair) = pair_rx.recv() {
                pair.mappings
                    .sort_unstable_by_key(|mapping| (mapping.node, mapping.offset));
                let kmer_count = (pair.read.seq.len() - kmer_size + 1) as f64;
                let mut alignment_found = false;
                for mapping in &pair.mappings {
                    graph.increment_subpath(&mapping.contained_segments, kmer_count)?;
                    if !exact_align {
                        continue;
                    }
                    // try the forward then the reverse-complement orientation
                    for _ in 0..2 {
                        let records =
                            align_read(&graph, &pair.read, mapping, MAX_CLIP, MAX_SHUFFLES)?;
                        if !records.is_empty() {
                            for record in records {
                                if minion_record_tx.send(record).is_err() {
                                    return Ok(graph);
                                }
                            }
                            alignment_found = true;
                            break;
                        }
                        pair.read.rev_complement();
                    }
                    if alignment_found {
                        break;
                    }
                }
            }
            Ok(graph)
        }));
    }
    drop(record_tx);

    // sketch workers: one per CPU
    let worker_count = opts.threads.max(1);
    let use_bloom_filter = opts.bloom_filter;
    let minion_senders = Arc::new(minion_senders);
    let mut worker_handles = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let read_rx: Receiver<SeqRead> = read_rx.clone();
        let index = Arc::clone(&index);
        let senders = Arc::clone(&minion_senders);
        let worker_stats = Arc::clone(&shared_stats);
        worker_handles.push(thread::spawn(move || -> Result<()> {
            let mut received = 0usize;
            let mut mapped = 0usize;
            let mut multimapped = 0usize;
            let mut length_total = 0usize;
            let mut bloom = use_bloom_filter.then(BloomFilter::with_default_size);
            while let Ok(read) = read_rx.recv() {
                received += 1;
                length_total += read.seq.len();
                if read.seq.len() < kmer_size {
                    continue;
                }
                let sketch = sketch_sequence_filtered(
                    &read.seq,
                    kmer_size,
                    sketch_size,
                    sketch_algo,
                    bloom.as_mut(),
                )?;
                let kmer_count = read.seq.len() - kmer_size + 1;
                let results = index.query(&sketch, kmer_count, threshold)?;
                if results.is_empty() {
                    continue;
                }
                mapped += 1;
                if results.len() > 1 {
                    multimapped += 1;
                }
                // the read moves into the last recipient; every additional
                // graph gets its own deep copy
                let mut entries: Vec<(u32, Vec<WindowKey>)> = results.into_iter().collect();
                let last = entries.pop();
                let mut dispatch = |graph_id: u32, mappings, read| -> Result<bool> {
                    let sender = senders.get(&graph_id).ok_or_else(|| {
                        ArgraphError::IndexCorrupt(format!(
                            "window references unknown graph {}",
                            graph_id
                        ))
                    })?;
                    Ok(sender.send(MinionPair { mappings, read }).is_ok())
                };
                let mut hung_up = false;
                for (graph_id, mappings) in entries {
                    if !dispatch(graph_id, mappings, read.deep_copy())? {
                        hung_up = true;
                        break;
                    }
                }
                if let Some((graph_id, mappings)) = last {
                    if !hung_up && !dispatch(graph_id, mappings, read)? {
                        hung_up = true;
                    }
                }
                if hung_up {
                    return Ok(());
                }
            }
            let mut stats = worker_stats.lock().unwrap();
            stats.received += received;
            stats.mapped += mapped;
            stats.multimapped += multimapped;
            stats.length_total += length_total;
            Ok(())
        }));
    }
    drop(read_rx);
    drop(minion_senders);

    // the writer runs on the caller and drains until every minion is done
    let mut alignment_count = 0usize;
    while let Ok(record) = record_rx.recv() {
        alignment_count += 1;
        writeln!(sam_writer, "{}", record.to_sam_string())?;
    }
    sam_writer.flush()?;

    reader_handle
        .join()
        .map_err(|_| anyhow::anyhow!("read streaming thread panicked"))??;
    for handle in worker_handles {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("sketch worker panicked"))??;
    }
    for handle in minion_handles {
        let graph = handle
            .join()
            .map_err(|_| anyhow::anyhow!("graph minion panicked"))??;
        runtime_info.store.insert(graph.graph_id, graph);
    }

    let mut stats = *shared_stats.lock().unwrap();
    stats.alignments = alignment_count;
    Ok(stats)
}

/// Writes the SAM header: @HD, one @SQ per reference path across all
/// graphs, one @RG and one @PG record.
fn write_sam_header<W: Write>(writer: &mut W, store: &Store) -> Result<()> {
    writeln!(writer, "@HD\tVN:1.5\tSO:unsorted")?;
    let mut graph_ids: Vec<u32> = store.keys().copied().collect();
    graph_ids.sort_unstable();
    for graph_id in graph_ids {
        for (_, name, length) in store[&graph_id].references() {
            writeln!(writer, "@SQ\tSN:{}\tLN:{}", name, length)?;
        }
    }
    writeln!(writer, "@RG\tID:argraph\tSM:sample")?;
    writeln!(
        writer,
        "@PG\tID:argraph\tPN:argraph\tVN:{}\tCL:argraph align",
        VERSION
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// haplotype
// ---------------------------------------------------------------------------

/// Options for the haplotype subcommand.
#[derive(Debug, Clone)]
pub struct HaplotypeOpts {
    pub index_dir: PathBuf,
    pub graph_dir: PathBuf,
    pub haplo_dir: PathBuf,
    pub cutoff: f64,
    pub min_iterations: usize,
    pub max_iterations: usize,
}

/// One called haplotype.
#[derive(Debug, Clone)]
pub struct Haplotype {
    pub graph_id: u32,
    pub path_name: String,
    pub abundance: f64,
}

/// Runs EM over the weighted graphs and reports the called haplotypes.
pub fn run_haplotype(opts: &HaplotypeOpts) -> Result<Vec<Haplotype>> {
    // loading the runtime info validates the index version
    let _runtime_info = Info::load(&opts.index_dir)?;

    let mut gfa_files: Vec<PathBuf> = std::fs::read_dir(&opts.graph_dir)
        .with_context(|| format!("can't read graph directory: {}", opts.graph_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("gfa"))
        .collect();
    gfa_files.sort();
    if gfa_files.is_empty() {
        return Err(ArgraphError::BadInput(format!(
            "no weighted GFA files found in {}",
            opts.graph_dir.display()
        ))
        .into());
    }

    let documents: Vec<Gfa> = gfa_files
        .par_iter()
        .map(Gfa::load)
        .collect::<Result<Vec<_>>>()?;
    let total_kmers = documents
        .iter()
        .find_map(|doc| gfa::parse_total_kmer_comment(&doc.comments))
        .ok_or_else(|| {
            ArgraphError::BadInput(
                "weighted GFAs are missing the projected k-mer total comment".to_string(),
            )
        })?;
    info!(
        graphs = documents.len(),
        total_kmers,
        min_iterations = opts.min_iterations,
        max_iterations = opts.max_iterations,
        cutoff = opts.cutoff,
        "running EM path calling"
    );

    let results: Vec<(VariationGraph, usize, FxHashMap<u32, f64>)> = documents
        .par_iter()
        .enumerate()
        .map(|(graph_id, doc)| {
            let mut graph = VariationGraph::from_gfa(doc, graph_id as u32)?;
            graph.remove_dead_paths();
            let (ec_map, counts) = graph.equivalence_classes()?;
            let mut em = EmRunner::new(
                opts.max_iterations,
                opts.min_iterations,
                graph.paths.len(),
                ec_map,
                counts,
            )?;
            em.run()?;
            let (iterations, alpha) = em.results()?;
            let alpha = alpha.to_vec();
            let abundances = graph.process_em_paths(&alpha, opts.cutoff, total_kmers);
            graph.remove_dead_paths();
            Ok((graph, iterations, abundances))
        })
        .collect::<Result<Vec<_>>>()?;

    std::fs::create_dir_all(&opts.haplo_dir)
        .with_context(|| format!("can't create output directory: {}", opts.haplo_dir.display()))?;
    let mut haplotypes: Vec<Haplotype> = Vec::new();
    let mut iteration_total = 0usize;
    let mut kept_graphs = 0usize;
    let summary_path = opts.haplo_dir.join("haplotypes.tsv");
    let mut summary = BufWriter::new(
        File::create(&summary_path)
            .with_context(|| format!("can't create summary: {}", summary_path.display()))?,
    );
    writeln!(summary, "graph\thaplotype\tabundance")?;

    for (mut graph, iterations, abundances) in results {
        iteration_total += iterations;
        if graph.paths.is_empty() {
            continue;
        }
        kept_graphs += 1;

        let comments = vec![format!(
            "haplotype calls made by argraph (version {})",
            VERSION
        )];
        if let Some(called) = Gfa::from_graph(&graph, comments) {
            called.save(opts.haplo_dir.join(format!("graph-{}.gfa", graph.graph_id)))?;
        }

        let sequences = graph.graph_to_sequences()?;
        let fasta_path = opts.haplo_dir.join(format!("graph-{}.fasta", graph.graph_id));
        let mut fasta = BufWriter::new(File::create(&fasta_path)?);
        let mut called_paths: Vec<(u32, f64)> = abundances.iter().map(|(&k, &v)| (k, v)).collect();
        called_paths.sort_unstable_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        for (path_id, abundance) in called_paths {
            let name = match graph.paths.get(&path_id) {
                Some(name) => name.clone(),
                None => continue,
            };
            if let Some(sequence) = sequences.get(&path_id) {
                writeln!(fasta, ">{}", name)?;
                fasta.write_all(sequence)?;
                writeln!(fasta)?;
            }
            writeln!(summary, "{}\t{}\t{:.6}", graph.graph_id, name, abundance)?;
            info!(graph = graph.graph_id, haplotype = %name, abundance, "called allele");
            haplotypes.push(Haplotype {
                graph_id: graph.graph_id,
                path_name: name,
                abundance,
            });
        }
        fasta.flush()?;
    }
    summary.flush()?;

    if kept_graphs == 0 {
        warn!("no graphs had viable paths after EM");
    } else {
        info!(
            graphs = kept_graphs,
            haplotypes = haplotypes.len(),
            mean_em_iterations = iteration_total / kept_graphs,
            "haplotype calling finished"
        );
    }
    Ok(haplotypes)
}
