//! Sequence I/O and read primitives.
//!
//! Provides the in-memory read type used throughout the mapping pipeline and
//! streaming readers for FASTQ/FASTA files, including gzip-compressed files.
//!
//! # Supported Formats
//! - FASTQ: line-delimited 4-line records (plain or gzipped)
//! - FASTA: header + sequence lines, packed into synthetic 2-line reads

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// FASTQ quality encoding offset (Phred+33).
pub const QUAL_ENCODING: u8 = 33;

/// Complement lookup for ACGTN; anything else maps to N.
#[inline]
fn complement(base: u8) -> u8 {
    match base {
        b'A' => b'T',
        b'T' => b'A',
        b'C' => b'G',
        b'G' => b'C',
        _ => b'N',
    }
}

/// A sequencing read held in memory.
///
/// The sequence is uppercased ACGTN after [`SeqRead::base_normalize`]. The
/// quality vector is empty for reads packed from FASTA input and otherwise
/// always the same length as the sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct SeqRead {
    /// Read identifier (without the leading '@').
    pub id: String,
    /// Nucleotide sequence.
    pub seq: Vec<u8>,
    /// Phred+33 quality scores, kept in sync with `seq`.
    pub qual: Vec<u8>,
    /// Set when the read has been reverse complemented.
    pub rc: bool,
}

impl SeqRead {
    /// Builds a read from the four lines of a FASTQ record.
    pub fn from_fastq_lines(l1: &str, l2: &str, l3: &str, l4: &str) -> Result<Self> {
        if !l1.starts_with('@') {
            anyhow::bail!("read ID does not begin with @: {}", l1);
        }
        if !l3.starts_with('+') {
            anyhow::bail!("quality header does not begin with +: {}", l3);
        }
        if l2.len() != l4.len() {
            anyhow::bail!(
                "sequence and quality lines have unequal lengths for read {}",
                l1
            );
        }
        let mut read = SeqRead {
            id: l1[1..].split_whitespace().next().unwrap_or("").to_string(),
            seq: l2.as_bytes().to_vec(),
            qual: l4.as_bytes().to_vec(),
            rc: false,
        };
        read.base_normalize();
        Ok(read)
    }

    /// Builds a synthetic read from a FASTA entry (no quality scores).
    pub fn from_fasta_entry(header: &str, seq: &str) -> Self {
        let mut read = SeqRead {
            id: header
                .trim_start_matches(['>', '@'])
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_string(),
            seq: seq.as_bytes().to_vec(),
            qual: Vec::new(),
            rc: false,
        };
        read.base_normalize();
        read
    }

    /// Uppercases the sequence and coerces any non-ACGTN base to N.
    pub fn base_normalize(&mut self) {
        for base in &mut self.seq {
            *base = match base.to_ascii_uppercase() {
                b @ (b'A' | b'C' | b'G' | b'T' | b'N') => b,
                _ => b'N',
            };
        }
    }

    /// Reverse complements the sequence in place.
    ///
    /// The quality vector is reversed together with the sequence so that
    /// per-base scores stay attached to their bases.
    pub fn rev_complement(&mut self) {
        for base in &mut self.seq {
            *base = complement(*base);
        }
        self.seq.reverse();
        self.qual.reverse();
        self.rc = !self.rc;
    }

    /// Quality trims the read using the BWA/cutadapt running-sum algorithm.
    ///
    /// Walks in from both ends accumulating `minQual - (q - encoding)` and
    /// cuts where the sum is maximal, keeping the longest high-quality
    /// interval. Reads without quality scores are left untouched.
    pub fn qual_trim(&mut self, min_qual: u8) {
        if self.qual.is_empty() {
            return;
        }
        let min_qual = i32::from(min_qual);
        let mut start = 0usize;
        let mut end = self.qual.len();
        let (mut qual_sum, mut qual_max) = (0i32, 0i32);
        for (i, &qual) in self.qual.iter().enumerate() {
            qual_sum += min_qual - (i32::from(qual) - i32::from(QUAL_ENCODING));
            if qual_sum < 0 {
                break;
            }
            if qual_sum > qual_max {
                qual_max = qual_sum;
                start = i + 1;
            }
        }
        qual_sum = 0;
        qual_max = 0;
        for j in (0..self.qual.len()).rev() {
            qual_sum += min_qual - (i32::from(self.qual[j]) - i32::from(QUAL_ENCODING));
            if qual_sum < 0 {
                break;
            }
            if qual_sum > qual_max {
                qual_max = qual_sum;
                end = j;
            }
        }
        if start >= end {
            start = 0;
            end = 0;
        }
        self.seq = self.seq[start..end].to_vec();
        self.qual = self.qual[start..end].to_vec();
    }

    /// Returns an owned, independent copy of this read.
    ///
    /// Used when a read maps to more than one graph and each graph minion
    /// needs its own mutable copy.
    pub fn deep_copy(&self) -> SeqRead {
        SeqRead {
            id: self.id.clone(),
            seq: self.seq.clone(),
            qual: self.qual.clone(),
            rc: self.rc,
        }
    }
}

/// Generic FASTQ reader over any byte source.
pub struct FastqReader<R: Read> {
    reader: BufReader<R>,
    line_bufs: [String; 4],
}

impl FastqReader<File> {
    /// Opens a plain (uncompressed) FASTQ file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("Failed to open FASTQ: {}", path.as_ref().display()))?;
        Ok(Self::new(file))
    }
}

impl FastqReader<MultiGzDecoder<File>> {
    /// Opens a gzip-compressed FASTQ file.
    pub fn open_gz<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("Failed to open FASTQ.gz: {}", path.as_ref().display()))?;
        Ok(Self::new(MultiGzDecoder::new(file)))
    }
}

impl<R: Read> FastqReader<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::with_capacity(1024 * 1024, inner),
            line_bufs: Default::default(),
        }
    }

    /// Reads the next FASTQ record (4 lines per record).
    pub fn read_next(&mut self) -> Result<Option<SeqRead>> {
        for buf in &mut self.line_bufs {
            buf.clear();
        }
        if self.reader.read_line(&mut self.line_bufs[0])? == 0 {
            return Ok(None);
        }
        if self.line_bufs[0].trim_end().is_empty() {
            return Ok(None);
        }
        for buf in &mut self.line_bufs[1..] {
            if self.reader.read_line(buf)? == 0 {
                anyhow::bail!("truncated FASTQ record");
            }
        }
        let read = SeqRead::from_fastq_lines(
            self.line_bufs[0].trim_end(),
            self.line_bufs[1].trim_end(),
            self.line_bufs[2].trim_end(),
            self.line_bufs[3].trim_end(),
        )?;
        Ok(Some(read))
    }
}

/// Generic FASTA reader that packs each entry into a synthetic read.
pub struct FastaReader<R: Read> {
    reader: BufReader<R>,
    line_buf: String,
    current_header: Option<String>,
}

impl FastaReader<File> {
    /// Opens a plain FASTA file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("Failed to open FASTA: {}", path.as_ref().display()))?;
        Self::new(file)
    }
}

impl FastaReader<MultiGzDecoder<File>> {
    /// Opens a gzip-compressed FASTA file.
    pub fn open_gz<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("Failed to open FASTA.gz: {}", path.as_ref().display()))?;
        Self::new(MultiGzDecoder::new(file))
    }
}

impl<R: Read> FastaReader<R> {
    fn new(inner: R) -> Result<Self> {
        let mut reader = Self {
            reader: BufReader::with_capacity(1024 * 1024, inner),
            line_buf: String::with_capacity(256),
            current_header: None,
        };
        if reader.reader.read_line(&mut reader.line_buf)? > 0 && reader.line_buf.starts_with('>') {
            reader.current_header = Some(reader.line_buf.trim_end().to_string());
        }
        Ok(reader)
    }

    /// Reads the next FASTA entry.
    pub fn read_next(&mut self) -> Result<Option<SeqRead>> {
        let header = match self.current_header.take() {
            Some(h) => h,
            None => return Ok(None),
        };
        let mut seq = String::with_capacity(1024);
        loop {
            self.line_buf.clear();
            if self.reader.read_line(&mut self.line_buf)? == 0 {
                break;
            }
            if self.line_buf.starts_with('>') {
                self.current_header = Some(self.line_buf.trim_end().to_string());
                break;
            }
            seq.push_str(self.line_buf.trim_end());
        }
        Ok(Some(SeqRead::from_fasta_entry(&header, &seq)))
    }
}

/// Auto-detecting read stream over FASTQ or FASTA input.
///
/// Files ending in `.gz` are decompressed on the fly.
pub enum ReadStream {
    Fastq(FastqReader<File>),
    FastqGz(FastqReader<MultiGzDecoder<File>>),
    Fasta(FastaReader<File>),
    FastaGz(FastaReader<MultiGzDecoder<File>>),
}

impl ReadStream {
    /// Opens an input file with automatic compression detection.
    pub fn open<P: AsRef<Path>>(path: P, fasta: bool) -> Result<Self> {
        let path = path.as_ref();
        let gz = path.extension().and_then(|e| e.to_str()) == Some("gz");
        Ok(match (fasta, gz) {
            (false, false) => ReadStream::Fastq(FastqReader::open(path)?),
            (false, true) => ReadStream::FastqGz(FastqReader::open_gz(path)?),
            (true, false) => ReadStream::Fasta(FastaReader::open(path)?),
            (true, true) => ReadStream::FastaGz(FastaReader::open_gz(path)?),
        })
    }

    /// Reads the next record from the stream.
    pub fn read_next(&mut self) -> Result<Option<SeqRead>> {
        match self {
            ReadStream::Fastq(r) => r.read_next(),
            ReadStream::FastqGz(r) => r.read_next(),
            ReadStream::Fasta(r) => r.read_next(),
            ReadStream::FastaGz(r) => r.read_next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_read() -> SeqRead {
        SeqRead::from_fastq_lines("@read1", "ACGTN", "+", "IIIII").unwrap()
    }

    #[test]
    fn test_fastq_parsing() {
        let read = test_read();
        assert_eq!(read.id, "read1");
        assert_eq!(read.seq, b"ACGTN");
        assert_eq!(read.qual.len(), read.seq.len());
        assert!(!read.rc);

        assert!(SeqRead::from_fastq_lines("read1", "ACGT", "+", "IIII").is_err());
        assert!(SeqRead::from_fastq_lines("@read1", "ACGT", "+", "III").is_err());
    }

    #[test]
    fn test_base_normalize() {
        let read = SeqRead::from_fastq_lines("@r", "acgtryswkm", "+", "IIIIIIIIII").unwrap();
        assert_eq!(read.seq, b"ACGTNNNNNN");
    }

    #[test]
    fn test_rev_complement_keeps_qual_attached() {
        let mut read = SeqRead::from_fastq_lines("@r", "AACGT", "+", "ABCDE").unwrap();
        read.rev_complement();
        assert_eq!(read.seq, b"ACGTT");
        assert_eq!(read.qual, b"EDCBA");
        assert!(read.rc);
        read.rev_complement();
        assert_eq!(read.seq, b"AACGT");
        assert_eq!(read.qual, b"ABCDE");
        assert!(!read.rc);
    }

    #[test]
    fn test_qual_trim() {
        // high-quality core flanked by low-quality tails ('#' = Q2, 'I' = Q40)
        let mut read = SeqRead::from_fastq_lines("@r", "ACGTACGTAC", "+", "##IIIIII##").unwrap();
        read.qual_trim(20);
        assert_eq!(read.seq, b"GTACGT");
        assert_eq!(read.qual, b"IIIIII");
    }

    #[test]
    fn test_qual_trim_all_low_quality() {
        let mut read = SeqRead::from_fastq_lines("@r", "ACGT", "+", "####").unwrap();
        read.qual_trim(20);
        assert!(read.seq.is_empty());
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let read = test_read();
        let mut copy = read.deep_copy();
        copy.rev_complement();
        assert_eq!(read.seq, b"ACGTN");
        assert_ne!(copy.seq, read.seq);
    }
}
