//! Coverage-based reporting of typed ARGs from the alignment stream.
//!
//! Reads the SAM stream produced by the align subcommand, piles up read
//! coverage per reference path, and reports every reference whose fraction
//! of covered bases reaches the cutoff. Coverage gaps are summarised as a
//! run-length M/D string so partially covered genes are easy to spot.

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::ArgraphError;

/// Options for the report subcommand.
#[derive(Debug, Clone)]
pub struct ReportOpts {
    /// SAM file to read (None = STDIN).
    pub sam_file: Option<PathBuf>,
    /// Fraction of reference bases that must be covered.
    pub coverage_cutoff: f64,
    /// Drop references with internal coverage gaps (uncovered stretches
    /// flanked by covered ones).
    pub low_cov: bool,
}

/// One reported reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgReport {
    pub reference: String,
    pub read_count: usize,
    pub length: usize,
    /// Run-length summary of the pileup, e.g. `61M` or `2D59M`.
    pub coverage_string: String,
}

/// Number of aligned bases a record spans on the reference: the sum of its
/// CIGAR match operations.
fn aligned_length(cigar: &str) -> Result<usize> {
    let mut total = 0usize;
    let mut number = 0usize;
    for c in cigar.chars() {
        if let Some(digit) = c.to_digit(10) {
            number = number * 10 + digit as usize;
        } else {
            match c {
                'M' | '=' | 'X' | 'D' | 'N' => total += number,
                'H' | 'S' | 'I' | 'P' => {}
                other => {
                    return Err(ArgraphError::BadInput(format!(
                        "unsupported CIGAR operation: {}",
                        other
                    ))
                    .into())
                }
            }
            number = 0;
        }
    }
    Ok(total)
}

/// Run-length encodes the pileup as M (covered) / D (uncovered) stretches.
///
/// Also reports whether any uncovered stretch sits between covered ones.
fn coverage_string(pileup: &[usize]) -> (String, bool) {
    let mut runs: Vec<(char, usize)> = Vec::new();
    for &depth in pileup {
        let symbol = if depth == 0 { 'D' } else { 'M' };
        match runs.last_mut() {
            Some((last, count)) if *last == symbol => *count += 1,
            _ => runs.push((symbol, 1)),
        }
    }
    let mut encoded = String::new();
    for (symbol, count) in &runs {
        encoded.push_str(&count.to_string());
        encoded.push(*symbol);
    }
    let internal_gap = runs
        .iter()
        .enumerate()
        .any(|(i, (symbol, _))| *symbol == 'D' && i > 0 && i + 1 < runs.len());
    (encoded, internal_gap)
}

/// Runs the report over a SAM stream, writing one TSV line per reported
/// reference and returning the annotations.
pub fn run_report(opts: &ReportOpts) -> Result<Vec<ArgReport>> {
    let reports = match &opts.sam_file {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("can't open SAM file: {}", path.display()))?;
            report_from_sam(BufReader::new(file), opts)?
        }
        None => report_from_sam(BufReader::new(std::io::stdin()), opts)?,
    };
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for report in &reports {
        writeln!(
            out,
            "{}\t{}\t{}\t{}",
            report.reference, report.read_count, report.length, report.coverage_string
        )?;
    }
    info!(references = reports.len(), "coverage report finished");
    Ok(reports)
}

/// Parses a SAM stream and builds the per-reference coverage reports.
pub fn report_from_sam<R: BufRead>(reader: R, opts: &ReportOpts) -> Result<Vec<ArgReport>> {
    let mut lengths: FxHashMap<String, usize> = FxHashMap::default();
    let mut order: Vec<String> = Vec::new();
    let mut pileups: FxHashMap<String, Vec<usize>> = FxHashMap::default();
    let mut read_counts: FxHashMap<String, usize> = FxHashMap::default();

    for line in reader.lines() {
        let line = line.context("failed to read SAM line")?;
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix('@') {
            if let Some(rest) = header.strip_prefix("SQ\t") {
                let mut name = None;
                let mut length = None;
                for field in rest.split('\t') {
                    if let Some(value) = field.strip_prefix("SN:") {
                        name = Some(value.to_string());
                    } else if let Some(value) = field.strip_prefix("LN:") {
                        length = value.parse::<usize>().ok();
                    }
                }
                if let (Some(name), Some(length)) = (name, length) {
                    order.push(name.clone());
                    pileups.insert(name.clone(), vec![0; length]);
                    lengths.insert(name, length);
                }
            }
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 11 {
            return Err(ArgraphError::BadInput(format!(
                "SAM record with fewer than 11 fields: {}",
                line
            ))
            .into());
        }
        let flags: u16 = fields[1].parse().map_err(|_| {
            ArgraphError::BadInput(format!("bad SAM flag field: {}", fields[1]))
        })?;
        // unmapped records carry no reference position
        if flags & 0x4 != 0 || fields[2] == "*" {
            continue;
        }
        let reference = fields[2];
        let pos: usize = fields[3].parse().map_err(|_| {
            ArgraphError::BadInput(format!("bad SAM position field: {}", fields[3]))
        })?;
        let span = aligned_length(fields[5])?;
        let pileup = match pileups.get_mut(reference) {
            Some(pileup) => pileup,
            None => {
                return Err(ArgraphError::BadInput(format!(
                    "SAM record references a sequence missing from the header: {}",
                    reference
                ))
                .into())
            }
        };
        *read_counts.entry(reference.to_string()).or_insert(0) += 1;
        let start = pos.saturating_sub(1);
        let end = (start + span).min(pileup.len());
        let clamped_start = start.min(pileup.len());
        for depth in &mut pileup[clamped_start..end] {
            *depth += 1;
        }
    }

    let mut reports = Vec::new();
    for reference in order {
        let pileup = &pileups[&reference];
        if pileup.is_empty() {
            continue;
        }
        let covered = pileup.iter().filter(|&&depth| depth > 0).count();
        let fraction = covered as f64 / pileup.len() as f64;
        if fraction < opts.coverage_cutoff {
            continue;
        }
        let (encoded, internal_gap) = coverage_string(pileup);
        if opts.low_cov && internal_gap {
            continue;
        }
        reports.push(ArgReport {
            read_count: read_counts.get(&reference).copied().unwrap_or(0),
            length: lengths.get(&reference).copied().unwrap_or(0),
            reference,
            coverage_string: encoded,
        });
    }
    Ok(reports)
}

/// Convenience wrapper for reporting straight from a SAM file path.
pub fn report_from_path(path: &Path, opts: &ReportOpts) -> Result<Vec<ArgReport>> {
    let file =
        File::open(path).with_context(|| format!("can't open SAM file: {}", path.display()))?;
    report_from_sam(BufReader::new(file), opts)
}
