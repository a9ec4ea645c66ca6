use std::{
    io::Write,
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{ensure, Context, Result};
use log::{debug, info, warn};
use rayon::prelude::*;

use crate::{
    barcode_table::BarcodeTable,
    demux::{Demultiplex, Demultiplexer},
    matcher::FirstMatchMatcher,
    metrics::{DemuxReport, WorkerResult},
    opts::{Command, IndexOpts, Opts, SplitOpts},
    partition::{partition, partition_paired, ByteRange, PairedRange},
    pooled_sample_writer::SampleWriters,
    record_index::{IndexSampler, PairedRecordIndex, RecordIndex},
    utils::{
        filenames, remove_empty_outputs, remove_existing_outputs, FileRemover, FsRemover,
    },
};

/// A read 1 (or only) FASTQ with its read 2 FASTQ, if any.
type InputPair<'a> = (&'a Path, Option<&'a Path>);

/// The ranges of the inputs handed to the demultiplexing threads, each with the position of its
/// input (or input pair).
enum Ranges {
    Single(Vec<(usize, ByteRange)>),
    Paired(Vec<(usize, PairedRange)>),
}

impl Ranges {
    fn len(&self) -> usize {
        match self {
            Ranges::Single(ranges) => ranges.len(),
            Ranges::Paired(ranges) => ranges.len(),
        }
    }
}

/// Run the requested command, printing the demultiplexing report to stdout.
pub fn run(opts: Opts) -> Result<()> {
    match opts.command {
        Command::Index(index_opts) => run_index(&index_opts),
        Command::Split(split_opts) => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            run_split(&split_opts, &FsRemover, &mut out).map(|_| ())
        }
    }
}

/// Build the record index(es) for the inputs, replacing any existing index.
pub fn run_index(opts: &IndexOpts) -> Result<()> {
    let inputs = input_pairs(&opts.input, &opts.input2)?;
    let mut sampler = IndexSampler::new(opts.index_sample_rate, opts.seed)?;
    for (input, input2) in inputs {
        match input2 {
            None => {
                let index = RecordIndex::build(input, &mut sampler)?;
                let path = index.write(input)?;
                info!("Wrote index with {} offsets to {}", index.len(), path.to_string_lossy());
            }
            Some(input2) => {
                let index = PairedRecordIndex::build(input, input2, &mut sampler)?;
                let r1_path = index.r1.write(input)?;
                let r2_path = index.r2.write(input2)?;
                info!(
                    "Wrote indexes with {} offsets to {} and {}",
                    index.r1.len(),
                    r1_path.to_string_lossy(),
                    r2_path.to_string_lossy()
                );
            }
        }
    }
    Ok(())
}

/// Run demultiplexing, writing the report to `out`.
///
/// Outputs of a previous run are removed with `remover` before any output is created, and the
/// outputs of samples that received no records are removed with `remover` once closed.
pub fn run_split(
    opts: &SplitOpts,
    remover: &dyn FileRemover,
    out: &mut dyn Write,
) -> Result<DemuxReport> {
    let start = Instant::now();

    // Preflight checks
    let inputs = input_pairs(&opts.input, &opts.input2)?;
    ensure!(opts.threads > 0, "At least one demultiplexing thread is required");

    let table = BarcodeTable::from_path(&opts.barcodes, &opts.as_table_opts())?;
    ensure!(
        !table.samples().contains(&opts.undetermined_sample_name),
        "The sample name {} is reserved for undetermined reads",
        opts.undetermined_sample_name
    );
    if table.is_dual_index() && !opts.is_paired() {
        warn!("No read 2 FASTQ was given, the second barcodes will not be used");
    }

    std::fs::create_dir_all(&opts.output_dir).with_context(|| {
        format!("Unable to create output directory: {}", opts.output_dir.to_string_lossy())
    })?;

    let config = opts.as_demux_config();
    let mut names: Vec<&str> = table.samples().iter().map(String::as_str).collect();
    if config.write_unmatched {
        names.push(&opts.undetermined_sample_name);
    }
    let outputs: Vec<Vec<PathBuf>> = names
        .iter()
        .map(|name| filenames(name, &opts.output_dir, opts.is_paired(), opts.output_gzip))
        .collect();
    let stale: Vec<PathBuf> = outputs.iter().flatten().cloned().collect();
    remove_existing_outputs(&stale, remover)?;

    let ranges = load_ranges(opts, &inputs)?;
    debug!("Split {} input(s) into {} range(s)", inputs.len(), ranges.len());

    info!("Creating outputs");
    let writers = SampleWriters::create(
        &outputs,
        opts.output_gzip,
        opts.writer_threads,
        opts.compressor_threads,
    )?;

    let demuxers = inputs
        .iter()
        .map(|(input, input2)| {
            let matcher = FirstMatchMatcher::new(&table, config.max_mismatches);
            Demultiplexer::new(
                input.to_path_buf(),
                input2.map(Path::to_path_buf),
                &table,
                &config,
                &writers,
                matcher,
            )
        })
        .collect::<Result<Vec<_>>>()?;
    let pool = rayon::ThreadPoolBuilder::new().num_threads(opts.threads).build()?;

    info!("Processing data");
    let results: Result<Vec<WorkerResult>> = pool.install(|| match &ranges {
        Ranges::Single(ranges) => ranges
            .par_iter()
            .map(|(i, range)| {
                demuxers[*i].process(*range).with_context(|| {
                    format!(
                        "Failed to demultiplex bytes {} of {}",
                        range,
                        inputs[*i].0.to_string_lossy()
                    )
                })
            })
            .collect(),
        Ranges::Paired(ranges) => ranges
            .par_iter()
            .map(|(i, range)| {
                demuxers[*i].process_pair(*range).with_context(|| {
                    format!(
                        "Failed to demultiplex bytes {} and {} of the pair starting with {}",
                        range.r1,
                        range.r2,
                        inputs[*i].0.to_string_lossy()
                    )
                })
            })
            .collect(),
    });
    drop(demuxers);

    info!("Closing outputs");
    let written = writers.finish();
    let results = results?;
    let written = written?;
    let removed = remove_empty_outputs(&outputs, &written, remover)?;
    debug!("Removed {} output(s) that received no records", removed);

    let report = DemuxReport::combine(results, table.samples(), &opts.undetermined_sample_name)?;
    let written_matched: usize = written.iter().take(table.num_samples()).sum();
    ensure!(
        written_matched == report.matched,
        "Matched {} records but wrote {}",
        report.matched,
        written_matched
    );
    if config.write_unmatched {
        ensure!(
            written[table.num_samples()] == report.unmatched(),
            "Found {} unmatched records but wrote {}",
            report.unmatched(),
            written[table.num_samples()]
        );
    }

    write!(out, "{}", report)?;
    out.flush()?;
    report.write_metrics(&opts.output_dir)?;
    info!(
        "Demultiplexed {} records ({} matched) in {:.2?}",
        report.total,
        report.matched,
        start.elapsed()
    );
    Ok(report)
}

/// Loads (or builds) the index of each input (or input pair) and splits it into ranges.
fn load_ranges(opts: &SplitOpts, inputs: &[InputPair]) -> Result<Ranges> {
    let mut single = vec![];
    let mut paired = vec![];
    for (i, (input, input2)) in inputs.iter().enumerate() {
        match input2 {
            None => {
                let index =
                    RecordIndex::load_or_build(input, opts.index_sample_rate, opts.seed)?;
                let ranges = partition(index.offsets(), opts.threads, opts.fanout);
                single.extend(ranges.into_iter().map(|range| (i, range)));
            }
            Some(input2) => {
                let index = PairedRecordIndex::load_or_build(
                    input,
                    input2,
                    opts.index_sample_rate,
                    opts.seed,
                )?;
                let ranges = partition_paired(&index, opts.threads, opts.fanout);
                paired.extend(ranges.into_iter().map(|range| (i, range)));
            }
        }
    }
    Ok(if opts.is_paired() { Ranges::Paired(paired) } else { Ranges::Single(single) })
}

/// Pairs each read 1 FASTQ with the read 2 FASTQ at the same position, checking that every FASTQ
/// exists.
fn input_pairs<'a>(input: &'a [PathBuf], input2: &'a [PathBuf]) -> Result<Vec<InputPair<'a>>> {
    ensure!(!input.is_empty(), "At least one input FASTQ is required");
    ensure!(
        input2.is_empty() || input2.len() == input.len(),
        "Missing read 1 or read 2 FASTQ: found {} read 1 and {} read 2 FASTQs",
        input.len(),
        input2.len()
    );
    for path in input.iter().chain(input2.iter()) {
        ensure_exists(path)?;
    }
    Ok(input
        .iter()
        .enumerate()
        .map(|(i, r1)| (r1.as_path(), input2.get(i).map(PathBuf::as_path)))
        .collect())
}

fn ensure_exists(path: &Path) -> Result<()> {
    ensure!(path.is_file(), "Input FASTQ does not exist: {}", path.to_string_lossy());
    Ok(())
}

#[cfg(test)]
mod test {
    use std::{
        io,
        num::NonZeroUsize,
        path::{Path, PathBuf},
    };

    use fgoxide::io::DelimFile;
    use matches::assert_matches;
    use parking_lot::Mutex;
    use rstest::rstest;
    use seq_io::fastq::OwnedRecord;
    use tempfile::tempdir;

    use crate::{
        barcode_table::BarcodeMode,
        metrics::{ReportError, SampleCount, METRICS_FILE_NAME},
        opts::{IndexOpts, SplitOpts},
        record_index::RecordIndex,
        utils::{
            test_commons::{
                generate_reads, slurp_fastq, slurp_names, write_barcode_file, write_reads_to_file,
            },
            filenames, FileRemover, FsRemover,
        },
    };

    use super::{run_index, run_split};

    /// Removes files from the file system, recording each removed path.
    #[derive(Default)]
    struct RecordingRemover {
        removed: Mutex<Vec<PathBuf>>,
    }

    impl FileRemover for RecordingRemover {
        fn remove(&self, path: &Path) -> io::Result<()> {
            self.removed.lock().push(path.to_path_buf());
            std::fs::remove_file(path)
        }
    }

    /// Four `AAAA` reads, three `TTTT` reads and three `GGGG` reads.
    fn single_end_reads() -> Vec<OwnedRecord> {
        let mut reads = generate_reads(b"AAAA", "s1", 4);
        reads.extend(generate_reads(b"TTTT", "s2", 3));
        reads.extend(generate_reads(b"GGGG", "none", 3));
        reads
    }

    fn sorted_names(path: impl AsRef<Path>) -> Vec<String> {
        let mut names = slurp_names(path);
        names.sort();
        names
    }

    fn expected_names(name: &str, n: usize) -> Vec<String> {
        let mut names: Vec<String> =
            (1..=n).map(|i| format!("{}_read_{}_of_{}", name, i, n)).collect();
        names.sort();
        names
    }

    #[rstest]
    fn test_run_split_round_trip(
        #[values(1, 3)] threads: usize,
        #[values("r1.fq", "r1.fq.gz")] input_name: &str,
        #[values(true, false)] output_gzip: bool,
    ) {
        let dir = tempdir().unwrap();
        let input = dir.path().join(input_name);
        write_reads_to_file(single_end_reads().into_iter(), &input);
        let output_dir = dir.path().join("output");

        let opts = SplitOpts {
            input: vec![input.clone()],
            barcodes: write_barcode_file(dir.path(), &["S1 AAAA", "S2 TTTT"]),
            output_dir: output_dir.clone(),
            threads,
            output_gzip,
            index_sample_rate: 0.5,
            ..SplitOpts::default()
        };
        let mut out = Vec::new();
        let report = run_split(&opts, &FsRemover, &mut out).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "S1: 4 (40.00%)\nS2: 3 (30.00%)\nUnknown: 3 (30.00%)\n"
        );
        assert_eq!(report.total, 10);
        assert!(RecordIndex::index_path(&input).unwrap().exists());

        let suffix = if output_gzip { "fq.gz" } else { "fq" };
        let s1 = output_dir.join(format!("S1.{}", suffix));
        let s2 = output_dir.join(format!("S2.{}", suffix));
        assert_eq!(sorted_names(s1), expected_names("s1", 4));
        assert_eq!(sorted_names(s2), expected_names("s2", 3));
        assert!(!output_dir.join(format!("Unknown.{}", suffix)).exists());

        let rows: Vec<SampleCount> =
            DelimFile::default().read_tsv(&output_dir.join(METRICS_FILE_NAME)).unwrap();
        assert_eq!(rows, report.rows);
    }

    #[test]
    fn test_run_split_reuses_index() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("r1.fq");
        write_reads_to_file(single_end_reads().into_iter(), &input);

        let index_opts = IndexOpts {
            input: vec![input.clone()],
            input2: vec![],
            index_sample_rate: 1.0,
            seed: None,
        };
        run_index(&index_opts).unwrap();
        let index = RecordIndex::load(&input).unwrap().unwrap();
        assert_eq!(index.len(), 11);

        let opts = SplitOpts {
            input: vec![input.clone()],
            barcodes: write_barcode_file(dir.path(), &["S1 AAAA", "S2 TTTT"]),
            output_dir: dir.path().join("output"),
            index_sample_rate: 0.0,
            ..SplitOpts::default()
        };
        let report = run_split(&opts, &FsRemover, &mut Vec::new()).unwrap();
        assert_eq!(report.matched, 7);
        assert_eq!(RecordIndex::load(&input).unwrap().unwrap(), index);
    }

    #[test]
    fn test_run_split_write_unmatched_and_trim() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("r1.fq");
        write_reads_to_file(single_end_reads().into_iter(), &input);
        let output_dir = dir.path().join("output");

        let opts = SplitOpts {
            input: vec![input],
            barcodes: write_barcode_file(dir.path(), &["S1 AAAA", "S2 TTTT"]),
            output_dir: output_dir.clone(),
            write_unmatched: true,
            trim: true,
            undetermined_sample_name: String::from("Undetermined"),
            ..SplitOpts::default()
        };
        let mut out = Vec::new();
        run_split(&opts, &FsRemover, &mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().ends_with("Undetermined: 3 (30.00%)\n"));

        let s1 = slurp_fastq(output_dir.join("S1.fq"));
        assert_eq!(s1.len(), 4);
        assert!(s1.iter().all(|r| r.seq == vec![b'A'; 20] && r.qual.len() == 20));

        let unmatched = slurp_fastq(output_dir.join("Undetermined.fq"));
        assert_eq!(unmatched.len(), 3);
        assert!(unmatched.iter().all(|r| r.seq.starts_with(b"GGGG") && r.seq.len() == 24));
    }

    #[test]
    fn test_run_split_paired() {
        let dir = tempdir().unwrap();
        let r1 = dir.path().join("r1.fq.gz");
        let r2 = dir.path().join("r2.fq.gz");

        let mut r1_reads = generate_reads(b"AAAA", "s1", 3);
        r1_reads.extend(generate_reads(b"TTTT", "s2", 2));
        r1_reads.extend(generate_reads(b"AAAA", "mixed", 2));
        let mut r2_reads = generate_reads(b"CCCCCC", "s1", 3);
        r2_reads.extend(generate_reads(b"GGGGGG", "s2", 2));
        r2_reads.extend(generate_reads(b"GGGGGG", "mixed", 2));
        write_reads_to_file(r1_reads.into_iter(), &r1);
        write_reads_to_file(r2_reads.into_iter(), &r2);
        let output_dir = dir.path().join("output");

        let opts = SplitOpts {
            input: vec![r1.clone()],
            input2: vec![r2.clone()],
            barcodes: write_barcode_file(dir.path(), &["S1 AAAA CCCCCC", "S2 TTTT GGGGGG"]),
            output_dir: output_dir.clone(),
            mode: BarcodeMode::Paired,
            check_read_names: true,
            index_sample_rate: 0.5,
            ..SplitOpts::default()
        };
        let mut out = Vec::new();
        let report = run_split(&opts, &FsRemover, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "S1: 3 (42.86%)\nS2: 2 (28.57%)\nUnknown: 2 (28.57%)\n"
        );
        assert_eq!(report.unmatched(), 2);

        assert_eq!(sorted_names(output_dir.join("S1.R1.fq")), expected_names("s1", 3));
        assert_eq!(sorted_names(output_dir.join("S1.R2.fq")), expected_names("s1", 3));
        assert_eq!(sorted_names(output_dir.join("S2.R1.fq")), expected_names("s2", 2));
        assert_eq!(sorted_names(output_dir.join("S2.R2.fq")), expected_names("s2", 2));

        let r1_index = RecordIndex::load(&r1).unwrap().unwrap();
        let r2_index = RecordIndex::load(&r2).unwrap().unwrap();
        assert_eq!(r1_index.len(), r2_index.len());
    }

    #[test]
    fn test_run_split_removes_stale_outputs() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("r1.fq");
        write_reads_to_file(single_end_reads().into_iter(), &input);
        let output_dir = dir.path().join("output");
        std::fs::create_dir(&output_dir).unwrap();
        std::fs::write(output_dir.join("S1.fq"), b"stale").unwrap();
        std::fs::write(output_dir.join("other.fq"), b"unrelated").unwrap();

        let opts = SplitOpts {
            input: vec![input],
            barcodes: write_barcode_file(dir.path(), &["S1 AAAA", "S2 TTTT"]),
            output_dir: output_dir.clone(),
            ..SplitOpts::default()
        };
        let remover = RecordingRemover::default();
        run_split(&opts, &remover, &mut Vec::new()).unwrap();

        assert_eq!(remover.removed.lock().clone(), vec![output_dir.join("S1.fq")]);
        assert_eq!(slurp_fastq(output_dir.join("S1.fq")).len(), 4);
        assert_eq!(std::fs::read(output_dir.join("other.fq")).unwrap(), b"unrelated".to_vec());
    }

    #[test]
    fn test_run_split_empty_input() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("r1.fq");
        std::fs::write(&input, b"").unwrap();

        let opts = SplitOpts {
            input: vec![input],
            barcodes: write_barcode_file(dir.path(), &["S1 AAAA"]),
            output_dir: dir.path().join("output"),
            ..SplitOpts::default()
        };
        let err = run_split(&opts, &FsRemover, &mut Vec::new()).unwrap_err();
        assert_matches!(err.downcast_ref::<ReportError>(), Some(ReportError::EmptyInput));
        assert!(!opts.output_dir.join("S1.fq").exists());
    }

    #[rstest]
    fn test_run_split_sample_without_reads_has_no_output(
        #[values(true, false)] output_gzip: bool,
        #[values(true, false)] paired: bool,
    ) {
        let dir = tempdir().unwrap();
        let r1 = dir.path().join("r1.fq");
        let r2 = dir.path().join("r2.fq");
        let mut r1_reads = generate_reads(b"AAAA", "s1", 4);
        r1_reads.extend(generate_reads(b"TTTT", "s2", 3));
        write_reads_to_file(r1_reads.clone().into_iter(), &r1);
        write_reads_to_file(r1_reads.into_iter(), &r2);
        let output_dir = dir.path().join("output");

        let opts = SplitOpts {
            input: vec![r1],
            input2: if paired { vec![r2] } else { vec![] },
            barcodes: write_barcode_file(dir.path(), &["S1 AAAA", "S2 TTTT", "S3 CCCC"]),
            output_dir: output_dir.clone(),
            output_gzip,
            write_unmatched: true,
            mode: BarcodeMode::Single,
            ..SplitOpts::default()
        };
        let remover = RecordingRemover::default();
        let report = run_split(&opts, &remover, &mut Vec::new()).unwrap();
        assert_eq!(report.matched, 7);
        assert_eq!(report.unmatched(), 0);

        let empty: Vec<PathBuf> = ["S3", "Unknown"]
            .iter()
            .flat_map(|name| filenames(name, &output_dir, paired, output_gzip))
            .collect();
        assert_eq!(remover.removed.lock().clone(), empty);
        assert!(empty.iter().all(|path| !path.exists()));
        for path in filenames("S1", &output_dir, paired, output_gzip) {
            assert_eq!(sorted_names(path), expected_names("s1", 4));
        }
        for path in filenames("S2", &output_dir, paired, output_gzip) {
            assert_eq!(sorted_names(path), expected_names("s2", 3));
        }
    }

    #[rstest]
    fn test_run_split_multiple_inputs(#[values(1, 3)] threads: usize) {
        let dir = tempdir().unwrap();
        let first = dir.path().join("first.fq");
        let second = dir.path().join("second.fq.gz");
        write_reads_to_file(single_end_reads().into_iter(), &first);
        let mut more_reads = generate_reads(b"AAAA", "more_s1", 2);
        more_reads.extend(generate_reads(b"CCCC", "more_none", 4));
        write_reads_to_file(more_reads.into_iter(), &second);
        let output_dir = dir.path().join("output");

        let opts = SplitOpts {
            input: vec![first.clone(), second.clone()],
            barcodes: write_barcode_file(dir.path(), &["S1 AAAA", "S2 TTTT"]),
            output_dir: output_dir.clone(),
            threads,
            index_sample_rate: 0.5,
            ..SplitOpts::default()
        };
        let mut out = Vec::new();
        let report = run_split(&opts, &FsRemover, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "S1: 6 (37.50%)\nS2: 3 (18.75%)\nUnknown: 7 (43.75%)\n"
        );
        assert_eq!(report.total, 16);
        assert!(RecordIndex::index_path(&first).unwrap().exists());
        assert!(RecordIndex::index_path(&second).unwrap().exists());

        let mut s1_names = expected_names("s1", 4);
        s1_names.extend(expected_names("more_s1", 2));
        s1_names.sort();
        assert_eq!(sorted_names(output_dir.join("S1.fq")), s1_names);
        assert_eq!(sorted_names(output_dir.join("S2.fq")), expected_names("s2", 3));
    }

    #[test]
    fn test_run_split_multiple_read_pairs() {
        let dir = tempdir().unwrap();
        let mut inputs = vec![];
        let mut inputs2 = vec![];
        for (name, n) in [("a", 3), ("b", 5)] {
            let r1 = dir.path().join(format!("{}.r1.fq", name));
            let r2 = dir.path().join(format!("{}.r2.fq.gz", name));
            write_reads_to_file(generate_reads(b"AAAA", name, n).into_iter(), &r1);
            write_reads_to_file(generate_reads(b"CCCCCC", name, n).into_iter(), &r2);
            inputs.push(r1);
            inputs2.push(r2);
        }
        let output_dir = dir.path().join("output");

        let opts = SplitOpts {
            input: inputs,
            input2: inputs2,
            barcodes: write_barcode_file(dir.path(), &["S1 AAAA CCCCCC"]),
            output_dir: output_dir.clone(),
            check_read_names: true,
            index_sample_rate: 0.5,
            ..SplitOpts::default()
        };
        let report = run_split(&opts, &FsRemover, &mut Vec::new()).unwrap();
        assert_eq!(report.total, 8);
        assert_eq!(report.matched, 8);

        let mut names = expected_names("a", 3);
        names.extend(expected_names("b", 5));
        names.sort();
        assert_eq!(sorted_names(output_dir.join("S1.R1.fq")), names);
        assert_eq!(sorted_names(output_dir.join("S1.R2.fq")), names);
    }

    #[test]
    #[should_panic(expected = "Missing read 1 or read 2 FASTQ")]
    fn test_run_split_unequal_read_1_and_read_2_counts() {
        let dir = tempdir().unwrap();
        let mut paths = vec![];
        for name in ["a.r1.fq", "b.r1.fq", "a.r2.fq"] {
            let path = dir.path().join(name);
            write_reads_to_file(single_end_reads().into_iter(), &path);
            paths.push(path);
        }
        let opts = SplitOpts {
            input: paths[..2].to_vec(),
            input2: paths[2..].to_vec(),
            barcodes: write_barcode_file(dir.path(), &["S1 AAAA"]),
            output_dir: dir.path().join("output"),
            ..SplitOpts::default()
        };
        run_split(&opts, &FsRemover, &mut Vec::new()).unwrap();
    }

    #[rstest]
    fn test_run_split_many_threads_one_sample(#[values(true, false)] output_gzip: bool) {
        let dir = tempdir().unwrap();
        let input = dir.path().join("r1.fq");
        write_reads_to_file(generate_reads(b"AAAA", "s1", 3000).into_iter(), &input);
        let output_dir = dir.path().join("output");

        let opts = SplitOpts {
            input: vec![input],
            barcodes: write_barcode_file(dir.path(), &["S1 AAAA", "S2 TTTT"]),
            output_dir: output_dir.clone(),
            output_gzip,
            threads: 8,
            fanout: 10,
            batch_size: NonZeroUsize::new(1).unwrap(),
            compressor_threads: 2,
            writer_threads: 2,
            index_sample_rate: 0.05,
            ..SplitOpts::default()
        };
        let report = run_split(&opts, &FsRemover, &mut Vec::new()).unwrap();
        assert_eq!(report.matched, 3000);

        let suffix = if output_gzip { "fq.gz" } else { "fq" };
        let records = slurp_fastq(output_dir.join(format!("S1.{}", suffix)));
        assert_eq!(records.len(), 3000);
        assert!(records.iter().all(|r| r.seq.len() == 24 && r.qual.len() == 24));
        let s1 = output_dir.join(format!("S1.{}", suffix));
        assert_eq!(sorted_names(s1), expected_names("s1", 3000));
        assert!(!output_dir.join(format!("S2.{}", suffix)).exists());
    }

    #[rstest]
    #[should_panic(expected = "Input FASTQ does not exist")]
    #[case(false, &["S1 AAAA"])]
    #[should_panic(expected = "reserved for undetermined reads")]
    #[case(true, &["S1 AAAA", "Unknown TTTT"])]
    fn test_run_split_preflight_failures(#[case] input_exists: bool, #[case] barcodes: &[&str]) {
        let dir = tempdir().unwrap();
        let input = dir.path().join("r1.fq");
        if input_exists {
            write_reads_to_file(single_end_reads().into_iter(), &input);
        }
        let opts = SplitOpts {
            input: vec![input],
            barcodes: write_barcode_file(dir.path(), barcodes),
            output_dir: dir.path().join("output"),
            ..SplitOpts::default()
        };
        run_split(&opts, &FsRemover, &mut Vec::new()).unwrap();
    }

    #[test]
    fn test_run_index_paired() {
        let dir = tempdir().unwrap();
        let r1 = dir.path().join("r1.fq");
        let r2 = dir.path().join("r2.fq");
        write_reads_to_file(generate_reads(b"AAAA", "p", 20).into_iter(), &r1);
        write_reads_to_file(generate_reads(b"CCCCCCCC", "p", 20).into_iter(), &r2);

        let opts = IndexOpts {
            input: vec![r1.clone()],
            input2: vec![r2.clone()],
            index_sample_rate: 0.3,
            seed: Some(11),
        };
        run_index(&opts).unwrap();
        let r1_index = RecordIndex::load(&r1).unwrap().unwrap();
        let r2_index = RecordIndex::load(&r2).unwrap().unwrap();
        assert_eq!(r1_index.len(), r2_index.len());
        assert_eq!(r1_index.end(), std::fs::metadata(&r1).unwrap().len());
        assert_eq!(r2_index.end(), std::fs::metadata(&r2).unwrap().len());
    }

    #[test]
    fn test_run_index_multiple_inputs() {
        let dir = tempdir().unwrap();
        let inputs: Vec<PathBuf> =
            ["a.fq", "b.fq.gz"].iter().map(|name| dir.path().join(name)).collect();
        for (i, input) in inputs.iter().enumerate() {
            write_reads_to_file(generate_reads(b"AAAA", "r", 10 + i).into_iter(), input);
        }
        let opts = IndexOpts {
            input: inputs.clone(),
            input2: vec![],
            index_sample_rate: 0.0,
            seed: Some(3),
        };
        run_index(&opts).unwrap();
        for input in &inputs {
            let index = RecordIndex::load(input).unwrap().unwrap();
            assert_eq!(index.len(), 2);
        }
    }

    #[test]
    fn test_run_index_missing_input() {
        let dir = tempdir().unwrap();
        let opts = IndexOpts {
            input: vec![dir.path().join("missing.fq")],
            input2: vec![],
            index_sample_rate: 0.001,
            seed: None,
        };
        assert!(run_index(&opts).is_err());
    }
}
