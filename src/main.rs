use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

use argraph::download::{run_get, GetOpts};
use argraph::pipeline::{run_align, run_haplotype, run_index, AlignOpts, HaplotypeOpts, IndexOpts};
use argraph::report::{run_report, ReportOpts};
use argraph::sketch::SketchAlgo;

/// Parse and validate the containment threshold (0 < t <= 1).
fn parse_threshold(s: &str) -> Result<f64, String> {
    let value: f64 = s.parse().map_err(|_| format!("Invalid number: {}", s))?;
    if value <= 0.0 || value > 1.0 {
        Err(format!("Containment threshold must be in (0, 1], got {}", value))
    } else {
        Ok(value)
    }
}

/// Parse the sketch algorithm name.
fn parse_sketch_algo(s: &str) -> Result<SketchAlgo, String> {
    s.parse()
}

#[derive(Parser)]
#[command(name = "argraph")]
#[command(version)]
#[command(about = "Type antibiotic resistance gene alleles in metagenomic samples using variation graphs")]
#[command(long_about = r#"
argraph - Antibiotic Resistance Gene typing with variation graphs

An end-to-end pipeline:
  1. get        Download a pre-clustered ARG database (MSAs)
  2. index      Convert MSAs to variation graphs, sketch and index them
  3. align      Sketch-map reads onto the graphs and weight the segments
  4. haplotype  Run EM over the weighted graphs and call ARG alleles

EXAMPLES:
  argraph get -d arg-annot -o db/
  argraph index -m db/arg-annot.90 -i index/
  argraph align -i index/ -f reads.fastq.gz -o graphs/ --samOut reads.sam
  argraph haplotype -i index/ -g graphs/ -o haplotypes/
"#)]
struct Cli {
    /// Number of threads [0 = auto-detect]
    #[arg(short = 'p', long, global = true, default_value = "0", value_name = "NUM")]
    processors: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a pre-clustered ARG database
    Get {
        /// Database to download (arg-annot/resfinder/card)
        #[arg(short = 'd', long, default_value = "arg-annot", value_name = "NAME")]
        database: String,

        /// Sequence identity used to cluster the database
        #[arg(long, default_value = "90", value_name = "PCT")]
        identity: String,

        /// Directory to save the database to
        #[arg(short = 'o', long = "out", default_value = ".", value_name = "DIR")]
        out_dir: PathBuf,
    },

    /// Convert a set of clustered reference MSAs to variation graphs and index them
    Index {
        /// Directory containing the clustered reference MSA files
        #[arg(short = 'm', long = "msaDir", value_name = "DIR")]
        msa_dir: PathBuf,

        /// Directory to save the index files to
        #[arg(short = 'i', long = "indexDir", value_name = "DIR")]
        index_dir: PathBuf,

        /// Size of k-mer
        #[arg(short = 'k', long = "kmerSize", default_value = "21", value_name = "SIZE")]
        kmer_size: usize,

        /// Size of the MinHash sketch
        #[arg(short = 's', long = "sketchSize", default_value = "42", value_name = "SIZE")]
        sketch_size: usize,

        /// Size of the sketched graph windows (should match read length)
        #[arg(short = 'w', long = "windowSize", default_value = "100", value_name = "SIZE")]
        window_size: usize,

        /// Number of partitions in the LSH Ensemble
        #[arg(short = 'x', long = "numPart", default_value = "8", value_name = "NUM")]
        num_part: usize,

        /// Maximum number of hash functions per band in the LSH Ensemble
        #[arg(short = 'y', long = "maxK", default_value = "4", value_name = "NUM")]
        max_k: usize,

        /// Maximum number of consecutive identical sketches to merge
        #[arg(long = "maxSketchSpan", default_value = "30", value_name = "NUM")]
        max_sketch_span: u32,

        /// Sketching algorithm (khf/kmv)
        #[arg(short = 'a', long = "sketchAlgo", default_value = "khf", value_name = "ALGO",
              value_parser = parse_sketch_algo)]
        sketch_algo: SketchAlgo,
    },

    /// Align a set of FASTQ reads to the indexed variation graphs
    Align {
        /// Directory containing the index files
        #[arg(short = 'i', long = "indexDir", value_name = "DIR")]
        index_dir: PathBuf,

        /// FASTQ file(s) to align (plain or gzipped)
        #[arg(short = 'f', long, value_name = "FILE", value_delimiter = ',', required = true)]
        fastq: Vec<PathBuf>,

        /// Treat the input as FASTA (2-line synthetic reads)
        #[arg(long)]
        fasta: bool,

        /// Containment threshold for seeding reads to graph windows
        #[arg(short = 't', long = "containmentThreshold", default_value = "0.99",
              value_name = "FLOAT", value_parser = parse_threshold)]
        containment_threshold: f64,

        /// Minimum per-base k-mer coverage for a segment to survive pruning
        #[arg(short = 'c', long = "minKmerCoverage", default_value = "1.0", value_name = "FLOAT")]
        min_kmer_coverage: f64,

        /// Directory to write the weighted graphs to
        #[arg(short = 'o', long = "graphDir", default_value = "./argraph-graphs", value_name = "DIR")]
        graph_dir: PathBuf,

        /// File for the SAM alignment stream (default: STDOUT)
        #[arg(long = "samOut", value_name = "FILE")]
        sam_out: Option<PathBuf>,

        /// Skip the exact hierarchical alignment (weight projection only)
        #[arg(long = "noExactAlign")]
        no_exact_align: bool,

        /// Keep singleton k-mers out of read sketches with a Bloom filter
        #[arg(long = "bloomFilter")]
        bloom_filter: bool,

        /// Enable quality-based trimming of reads
        #[arg(long)]
        trim: bool,

        /// Minimum base quality used in trimming
        #[arg(short = 'q', long = "minQual", default_value = "20", value_name = "QUAL")]
        min_qual: u8,

        /// Minimum read length post-trimming
        #[arg(short = 'l', long = "minRL", default_value = "100", value_name = "BP")]
        min_read_length: usize,
    },

    /// Call ARG haplotypes from the weighted variation graphs
    Haplotype {
        /// Directory containing the index files
        #[arg(short = 'i', long = "indexDir", value_name = "DIR")]
        index_dir: PathBuf,

        /// Directory containing the weighted variation graphs
        #[arg(short = 'g', long = "graphDir", value_name = "DIR")]
        graph_dir: PathBuf,

        /// Directory to write haplotype calls to
        #[arg(short = 'o', long = "haploDir", default_value = "./argraph-haplotypes", value_name = "DIR")]
        haplo_dir: PathBuf,

        /// Minimum iterations for EM
        #[arg(long = "minIterations", default_value = "50", value_name = "NUM")]
        min_iterations: usize,

        /// Maximum iterations for EM
        #[arg(long = "maxIterations", default_value = "10000", value_name = "NUM")]
        max_iterations: usize,

        /// Abundance cutoff for calling haplotypes
        #[arg(short = 'z', long = "cutOff", default_value = "0.001", value_name = "FLOAT")]
        cutoff: f64,
    },

    /// Report reference coverage from the SAM alignment stream
    Report {
        /// SAM file to read (default: STDIN)
        #[arg(short = 'f', long = "sam", value_name = "FILE")]
        sam: Option<PathBuf>,

        /// Fraction of reference bases that must be covered
        #[arg(short = 'c', long = "covCutoff", default_value = "0.97", value_name = "FLOAT")]
        cov_cutoff: f64,

        /// Drop references with internal coverage gaps
        #[arg(long = "lowCov")]
        low_cov: bool,
    },
}

fn run(cli: Cli, threads: usize) -> Result<()> {
    match cli.command {
        Commands::Get {
            database,
            identity,
            out_dir,
        } => {
            run_get(&GetOpts {
                database,
                identity,
                out_dir,
            })?;
        }
        Commands::Index {
            msa_dir,
            index_dir,
            kmer_size,
            sketch_size,
            window_size,
            num_part,
            max_k,
            max_sketch_span,
            sketch_algo,
        } => {
            run_index(&IndexOpts {
                msa_dir,
                index_dir,
                kmer_size,
                sketch_size,
                window_size,
                num_partitions: num_part,
                max_k,
                max_sketch_span,
                sketch_algo,
            })?;
        }
        Commands::Align {
            index_dir,
            fastq,
            fasta,
            containment_threshold,
            min_kmer_coverage,
            graph_dir,
            sam_out,
            no_exact_align,
            bloom_filter,
            trim,
            min_qual,
            min_read_length,
        } => {
            run_align(&AlignOpts {
                index_dir,
                graph_dir,
                inputs: fastq,
                fasta,
                trim,
                min_qual,
                min_read_length,
                containment_threshold,
                min_kmer_coverage,
                no_exact_align,
                bloom_filter,
                sam_out,
                threads,
            })?;
        }
        Commands::Haplotype {
            index_dir,
            graph_dir,
            haplo_dir,
            min_iterations,
            max_iterations,
            cutoff,
        } => {
            run_haplotype(&HaplotypeOpts {
                index_dir,
                graph_dir,
                haplo_dir,
                cutoff,
                min_iterations,
                max_iterations,
            })?;
        }
        Commands::Report {
            sam,
            cov_cutoff,
            low_cov,
        } => {
            run_report(&ReportOpts {
                sam_file: sam,
                coverage_cutoff: cov_cutoff,
                low_cov,
            })?;
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut cli = Cli::parse();
    if cli.processors == 0 {
        cli.processors = num_cpus::get();
    }
    let threads = cli.processors;
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();

    if let Err(err) = run(cli, threads) {
        error!("{:#}", err);
        std::process::exit(1);
    }
}
