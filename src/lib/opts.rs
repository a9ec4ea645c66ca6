#![forbid(unsafe_code)]

use std::{num::NonZeroUsize, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use env_logger::Env;

use crate::{
    barcode_table::{BarcodeMode, BarcodeTableOpts},
    demux::DemuxConfig,
    matcher::UNDETERMINED_NAME,
    partition::DEFAULT_FANOUT,
    record_index::DEFAULT_SAMPLE_RATE,
    utils::{built_info, NUM_CPU},
};

pub static TOOL_NAME: &str = "fsplit";

static SHORT_USAGE: &str = "Splits FASTQs into per-sample FASTQs by the barcode starting each read.";

static LONG_USAGE: &str = "
Splits FASTQs into per-sample FASTQs by the barcode starting each read.

The input FASTQs may be plain text or gzip compressed.  Several FASTQs (or several read 1 and read 2
FASTQs, given in the same order) may be given, separated by commas or spaces; their reads are
demultiplexed into the same outputs.  A sparse index of record offsets is stored
next to each input (with the suffix `.fai`) and reused by later runs, so that the input can be
read by many threads at once.  The index may be built ahead of time with `fsplit index`.

The barcode file has one whitespace-separated line per barcode: `sample barcode [barcode2]`.
Blank lines and lines starting with `#` are ignored.  Several lines may name the same sample.
The first barcode (in file order) within the allowed mismatches of the start of a read wins.
When a read 2 FASTQ is given, the second barcode of the matched line (or the first barcode when
the file has no second column) must also match the start of read 2.

Per-sample files named `<sample>.fq` (or `<sample>.R1.fq` and `<sample>.R2.fq` for read pairs)
are written to the output directory, along with `demux_metrics.tsv`.

Example invocation:

fsplit split \\
  --input R1.fq.gz \\
  --input2 R2.fq.gz \\
  --barcodes barcodes.txt \\
  --output-dir demuxed-fastqs/
";

pub static DOC_LINK: &str =
    "Run `fsplit help split` or `fsplit help index` for the description of every option.";

#[derive(Parser, Debug, Clone)]
#[clap(name = TOOL_NAME, version = built_info::VERSION.as_str(), about=SHORT_USAGE, long_about=LONG_USAGE, term_width=0)]
pub struct Opts {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Builds the sparse record index for one FASTQ or a pair of FASTQs.
    Index(IndexOpts),
    /// Demultiplexes FASTQs into per-sample FASTQs.
    Split(SplitOpts),
}

#[derive(Args, Debug, Clone)]
pub struct IndexOpts {
    /// Path(s) to the read 1 (or only) FASTQ(s).
    #[clap(
        long,
        short = 'i',
        display_order = 1,
        required = true,
        multiple_values = true,
        use_value_delimiter = true
    )]
    pub input: Vec<PathBuf>,

    /// Path(s) to the read 2 FASTQ(s), in the same order as the read 1 FASTQs.  The indexes of
    /// each pair are built together so they agree.
    #[clap(
        long,
        short = 'I',
        display_order = 2,
        multiple_values = true,
        use_value_delimiter = true
    )]
    pub input2: Vec<PathBuf>,

    /// The probability that any record after the first is recorded in the index.
    #[clap(long, default_value_t = DEFAULT_SAMPLE_RATE, display_order = 11)]
    pub index_sample_rate: f64,

    /// Seed for sampling the index, for a reproducible index.
    #[clap(long, display_order = 11)]
    pub seed: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct SplitOpts {
    /// Path(s) to the read 1 (or only) FASTQ(s).
    #[clap(
        long,
        short = 'i',
        display_order = 1,
        required = true,
        multiple_values = true,
        use_value_delimiter = true
    )]
    pub input: Vec<PathBuf>,

    /// Path(s) to the read 2 FASTQ(s), matched against the second barcode of each line.  Must be
    /// given in the same order as the read 1 FASTQs.
    #[clap(
        long,
        short = 'I',
        display_order = 1,
        multiple_values = true,
        use_value_delimiter = true
    )]
    pub input2: Vec<PathBuf>,

    /// Path to the barcode file.
    #[clap(long, short = 'b', display_order = 2)]
    pub barcodes: PathBuf,

    /// The directory to write outputs, created if it does not exist.
    ///
    /// This tool will overwrite existing files.
    #[clap(long, short, display_order = 3)]
    pub output_dir: PathBuf,

    /// Number of allowed mismatches between the start of a read and a barcode.
    #[clap(long, short = 'm', default_value = "0", display_order = 11)]
    pub mismatches: usize,

    /// Remove the matched barcode from the start of the output reads.
    #[clap(long, display_order = 11)]
    pub trim: bool,

    /// How to interpret the barcode file.
    ///
    /// `single` uses only the first barcode, `paired` requires a second barcode on every line,
    /// `auto` uses the second barcode only when every line has a usable one.
    #[clap(
        long,
        default_value = "auto",
        possible_values = BarcodeMode::possible_values(),
        display_order = 11
    )]
    pub mode: BarcodeMode,

    /// Reverse complement the first barcode of each line.
    #[clap(long, display_order = 11)]
    pub rc_bc1: bool,

    /// Reverse complement the second barcode of each line.
    #[clap(long, display_order = 11)]
    pub rc_bc2: bool,

    /// Accept barcodes containing characters that are not IUPAC bases.
    #[clap(long, display_order = 11)]
    pub skip_barcode_validation: bool,

    /// Require read 1 and read 2 to have the same name (up to the first space).
    #[clap(long, display_order = 11)]
    pub check_read_names: bool,

    /// Write reads that match no barcode to the undetermined output.
    #[clap(long, display_order = 21)]
    pub write_unmatched: bool,

    /// The sample name for undetermined reads (reads that do not match a barcode).
    #[clap(long, short = 'u', default_value = UNDETERMINED_NAME, display_order = 21)]
    pub undetermined_sample_name: String,

    /// Compress the output FASTQs (BGZF).
    #[clap(long, short = 'z', display_order = 21)]
    pub output_gzip: bool,

    /// Number of threads for demultiplexing.
    #[clap(long, short = 't', default_value = NUM_CPU.as_str(), display_order = 31)]
    pub threads: usize,

    /// The number of ranges of the input to create per demultiplexing thread.
    #[clap(long, default_value_t = DEFAULT_FANOUT, display_order = 31)]
    pub fanout: usize,

    /// The number of reads buffered for a sample before they are written.
    #[clap(long, short = 'c', default_value = "1000", display_order = 31, hide = true)]
    pub batch_size: NonZeroUsize,

    /// Number of threads for compressing the output reads.
    #[clap(long, default_value = "4", display_order = 31)]
    pub compressor_threads: usize,

    /// Number of threads for writing compressed reads to output.
    #[clap(long, default_value = "2", display_order = 31)]
    pub writer_threads: usize,

    /// The probability that any record after the first is recorded when an index is built.
    #[clap(long, default_value_t = DEFAULT_SAMPLE_RATE, display_order = 41)]
    pub index_sample_rate: f64,

    /// Seed for sampling the index, for a reproducible index.
    #[clap(long, display_order = 41)]
    pub seed: Option<u64>,
}

impl SplitOpts {
    /// Extract a [`DemuxConfig`] from the CLI opts.
    pub fn as_demux_config(&self) -> DemuxConfig {
        DemuxConfig {
            max_mismatches: self.mismatches,
            batch_size: self.batch_size,
            write_unmatched: self.write_unmatched,
            check_read_names: self.check_read_names,
        }
    }

    /// Extract the [`BarcodeTableOpts`] from the CLI opts.
    pub fn as_table_opts(&self) -> BarcodeTableOpts {
        BarcodeTableOpts {
            mode: self.mode,
            validate_alphabet: !self.skip_barcode_validation,
            reverse_complement_index1: self.rc_bc1,
            reverse_complement_index2: self.rc_bc2,
            trim: self.trim,
        }
    }

    /// True if read pairs are demultiplexed.
    pub fn is_paired(&self) -> bool {
        !self.input2.is_empty()
    }
}

/// Implement defaults that match the CLI options to allow for easier testing.
///
/// Note that these defaults exist only within test code.
#[cfg(test)]
impl Default for SplitOpts {
    fn default() -> Self {
        Self {
            input: vec![],
            input2: vec![],
            barcodes: PathBuf::default(),
            output_dir: PathBuf::default(),
            mismatches: 0,
            trim: false,
            mode: BarcodeMode::Auto,
            rc_bc1: false,
            rc_bc2: false,
            skip_barcode_validation: false,
            check_read_names: false,
            write_unmatched: false,
            undetermined_sample_name: UNDETERMINED_NAME.to_string(),
            output_gzip: false,
            threads: 2,
            fanout: DEFAULT_FANOUT,
            batch_size: NonZeroUsize::new(1000).unwrap(),
            compressor_threads: 1,
            writer_threads: 1,
            index_sample_rate: DEFAULT_SAMPLE_RATE,
            seed: Some(42),
        }
    }
}

/// Parse args and set up logging / tracing
pub fn setup() -> Opts {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    Opts::parse()
}
