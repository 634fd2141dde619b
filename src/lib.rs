//! argraph - Antibiotic Resistance Gene typing with variation graphs
//!
//! Types ARG alleles present in a metagenomic short-read sample by aligning
//! reads to variation graphs built from multiple sequence alignments of
//! known ARG clusters.
//!
//! # Modules
//! - `seqio`: FASTQ/FASTA I/O with gzip support, read primitives
//! - `sketch`: canonical rolling hashing and the KHF/KMV MinHash sketchers
//! - `graph`: the topologically sorted variation graph
//! - `gfa`: GFA1 parsing/writing and MSA -> GFA conversion
//! - `window`: sliding-window sketching of graph paths
//! - `lshe`: the LSH-Ensemble containment index
//! - `align`: hierarchical DFS alignment and SAM records
//! - `em`: expectation-maximization over segment equivalence classes
//! - `pipeline`: the index/align/haplotype drivers and boss/minion pool
//! - `report`: coverage-based reporting from the alignment stream
//! - `db`: on-disk index persistence
//! - `download`: pre-clustered database fetching
//! - `error`: the error taxonomy

pub mod align;
pub mod db;
pub mod download;
pub mod em;
pub mod error;
pub mod gfa;
pub mod graph;
pub mod lshe;
pub mod pipeline;
pub mod report;
pub mod seqio;
pub mod sketch;
pub mod window;

/// Program version, embedded in index files for compatibility checks.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
