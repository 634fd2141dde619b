//! Error taxonomy shared across the indexing, alignment and haplotyping
//! stages.
//!
//! Fatal errors surface at the CLI with a logged message. Per-read alignment
//! misses are not errors (they simply produce no records) and per-window
//! sketching failures during indexing are counted rather than raised.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArgraphError {
    /// Unreadable or misformatted file or read.
    #[error("bad input: {0}")]
    BadInput(String),

    /// The index was built with different sketching parameters than the query.
    #[error("sketch mismatch: {0}")]
    SketchMismatch(String),

    /// A graph contains two segments with the same identifier.
    #[error("graph contains duplicate segment ID: {0}")]
    DuplicateSegment(u64),

    /// A segment failed validation (non-numeric name or bad sequence content).
    #[error("invalid segment: {0}")]
    InvalidSegment(String),

    /// Topological sort left unvisited segments, indicating a cycle.
    #[error("topological sort failed: {remaining} segments unreachable from path sources")]
    Unsortable { remaining: usize },

    /// A reference path is shorter than the window size.
    #[error("graph path {path} is shorter ({length}) than the window size ({window_size})")]
    ShortGraph {
        path: String,
        length: usize,
        window_size: usize,
    },

    /// Window compression merged more consecutive sketches than allowed,
    /// indicating a low-complexity repeat.
    #[error("window merge span {span} exceeds limit {limit} (low-complexity repeat?)")]
    RunawayMerge { span: u32, limit: u32 },

    /// An index file was empty or malformed.
    #[error("index corrupt: {0}")]
    IndexCorrupt(String),

    /// The index was created by an incompatible version of the program.
    #[error("index was created by version {index_version}, this is version {current_version}")]
    VersionSkew {
        index_version: String,
        current_version: String,
    },
}
