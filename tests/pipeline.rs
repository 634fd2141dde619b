//! End-to-end pipeline tests: index a pair of clusters, align reads drawn
//! from one allele, and call haplotypes from the weighted graphs.

use std::fs;
use std::io::Write;
use std::path::Path;

use argraph::pipeline::{
    run_align, run_haplotype, run_index, AlignOpts, HaplotypeOpts, IndexOpts,
};
use argraph::report::{report_from_path, ReportOpts};
use argraph::sketch::SketchAlgo;

const ALLELE_A: &str =
    "ATGAAAGGATTAAAAGGGCTATTGGTTCTGGCTTTAGGCTTTACAGGACTACAGGTTTTTG";
const ALLELE_B: &str =
    "ATGAAAGGATTAAAAGGGCTAGTGGTTCTGGCTTTAGGCTTTACAGCACTACAGGTTTTTG";
const OTHER_GENE: &str =
    "TTGACCATAGGCAACCGTTAGCCGATGCATTACGGAATCTTGCAAGCTTACCGGATACCTA";

fn write_msa(path: &Path, entries: &[(&str, &str)]) {
    let mut file = fs::File::create(path).unwrap();
    for (name, seq) in entries {
        writeln!(file, ">{}", name).unwrap();
        writeln!(file, "{}", seq).unwrap();
    }
}

fn write_reads(path: &Path, reference: &str, read_length: usize, step: usize) -> usize {
    let mut file = fs::File::create(path).unwrap();
    let last_start = reference.len() - read_length;
    let mut count = 0;
    let mut start = 0;
    loop {
        writeln!(file, "@read{}", count).unwrap();
        writeln!(file, "{}", &reference[start..start + read_length]).unwrap();
        writeln!(file, "+").unwrap();
        writeln!(file, "{}", "I".repeat(read_length)).unwrap();
        count += 1;
        if start == last_start {
            break;
        }
        start = (start + step).min(last_start);
    }
    count
}

#[test]
fn test_index_align_haplotype() {
    let workspace = tempfile::tempdir().unwrap();
    let msa_dir = workspace.path().join("msas");
    let index_dir = workspace.path().join("index");
    let graph_dir = workspace.path().join("graphs");
    let haplo_dir = workspace.path().join("haplotypes");
    fs::create_dir_all(&msa_dir).unwrap();

    write_msa(
        &msa_dir.join("cluster1.msa"),
        &[("allele_A", ALLELE_A), ("allele_B", ALLELE_B)],
    );
    write_msa(&msa_dir.join("cluster2.msa"), &[("other_gene", OTHER_GENE)]);

    // index
    run_index(&IndexOpts {
        msa_dir: msa_dir.clone(),
        index_dir: index_dir.clone(),
        kmer_size: 7,
        sketch_size: 32,
        window_size: 20,
        num_partitions: 4,
        max_k: 4,
        max_sketch_span: 30,
        sketch_algo: SketchAlgo::Khf,
    })
    .unwrap();
    assert!(index_dir.join("argraph.gg").is_file());
    assert!(index_dir.join("argraph.lshe").is_file());

    // align reads tiled across allele_A only
    let fastq = workspace.path().join("reads.fastq");
    let num_reads = write_reads(&fastq, ALLELE_A, 20, 2);
    assert!(num_reads > 10);
    let sam_out = workspace.path().join("alignments.sam");
    let stats = run_align(&AlignOpts {
        index_dir: index_dir.clone(),
        graph_dir: graph_dir.clone(),
        inputs: vec![fastq],
        fasta: false,
        trim: false,
        min_qual: 20,
        min_read_length: 20,
        containment_threshold: 0.99,
        min_kmer_coverage: 0.3,
        no_exact_align: false,
        bloom_filter: false,
        sam_out: Some(sam_out.clone()),
        threads: 2,
    })
    .unwrap();
    assert_eq!(stats.received, num_reads);
    assert!(stats.mapped > 0, "no reads mapped");
    assert!(stats.alignments > 0, "no alignments emitted");

    // SAM stream: header plus records against allele_A
    let sam = fs::read_to_string(&sam_out).unwrap();
    assert!(sam.starts_with("@HD\tVN:1.5"));
    assert!(sam.contains("@SQ\tSN:allele_A\tLN:61"));
    assert!(sam.lines().any(|line| {
        !line.starts_with('@') && line.split('\t').nth(2) == Some("allele_A")
    }));

    // a coverage report over the SAM stream picks up the tiled allele
    let reports = report_from_path(
        &sam_out,
        &ReportOpts {
            sam_file: None,
            coverage_cutoff: 0.97,
            low_cov: false,
        },
    )
    .unwrap();
    assert!(reports.iter().any(|r| r.reference == "allele_A"));

    // only the cluster that received reads survives pruning
    let weighted = graph_dir.join("graph-0.gfa");
    assert!(weighted.is_file());
    assert!(!graph_dir.join("graph-1.gfa").exists());
    let gfa_text = fs::read_to_string(&weighted).unwrap();
    assert!(gfa_text.contains("KC:i:"));
    assert!(gfa_text.contains("allele_A"));
    assert!(!gfa_text.contains("allele_B"), "unsupported allele kept");

    // haplotype
    let haplotypes = run_haplotype(&HaplotypeOpts {
        index_dir,
        graph_dir,
        haplo_dir: haplo_dir.clone(),
        cutoff: 0.001,
        min_iterations: 5,
        max_iterations: 1000,
    })
    .unwrap();
    assert_eq!(haplotypes.len(), 1);
    assert_eq!(haplotypes[0].path_name, "allele_A");
    assert!(haplotypes[0].abundance > 0.5);

    // the called FASTA reproduces the allele sequence
    let fasta = fs::read_to_string(haplo_dir.join("graph-0.fasta")).unwrap();
    assert!(fasta.contains(">allele_A"));
    assert!(fasta.contains(ALLELE_A));
    let summary = fs::read_to_string(haplo_dir.join("haplotypes.tsv")).unwrap();
    assert!(summary.contains("allele_A"));
}

#[test]
fn test_align_rejects_missing_index() {
    let workspace = tempfile::tempdir().unwrap();
    let result = run_align(&AlignOpts {
        index_dir: workspace.path().join("nope"),
        graph_dir: workspace.path().join("graphs"),
        inputs: vec![],
        fasta: false,
        trim: false,
        min_qual: 20,
        min_read_length: 20,
        containment_threshold: 0.99,
        min_kmer_coverage: 1.0,
        no_exact_align: false,
        bloom_filter: false,
        sam_out: None,
        threads: 1,
    });
    assert!(result.is_err());
}
