//! Functionality directly related to demultiplexing one [`ByteRange`] of an input FASTQ.

use std::{
    io::Read,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use anyhow::{bail, ensure, Context, Result};
use bstr::ByteSlice;
use gzp::BUFSIZE;
use log::debug;
use seq_io::{
    fastq::{self, OwnedRecord, Record},
    BaseRecord,
};

use crate::{
    barcode_table::BarcodeTable,
    matcher::{MatchResult, Matcher},
    metrics::WorkerResult,
    partition::{ByteRange, PairedRange},
    pooled_sample_writer::SampleWriters,
    utils::{open_input_at, s},
};

/// A reader over the records of one range.
type RangeReader = fastq::Reader<std::io::Take<Box<dyn Read + Send>>>;

/// Helper struct to hold onto the parameters used by the [`Demultiplexer`].
#[derive(Debug, Clone)]
pub struct DemuxConfig {
    /// The maximum number of mismatches between a barcode and the start of a read.
    pub max_mismatches: usize,
    /// The number of records buffered per sample before they are written.
    pub batch_size: NonZeroUsize,
    /// If true, reads that match no barcode are written to the undetermined output.
    pub write_unmatched: bool,
    /// If true, paired reads must have the same read name (up to the first space).
    pub check_read_names: bool,
}

/// Defaults matching the CLI options, for tests only.
#[cfg(test)]
impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            max_mismatches: 0,
            batch_size: NonZeroUsize::new(1000).unwrap(),
            write_unmatched: false,
            check_read_names: false,
        }
    }
}

/// The reads for a single sample, one `Vec` per output FASTQ.
#[derive(Debug, Clone)]
pub struct OutputPerSampleReads {
    /// A vec of vecs to hold reads that go to each output FASTQ file.
    pub per_fastq_reads: Vec<Vec<OwnedRecord>>,
}

impl OutputPerSampleReads {
    /// Create a new [`OutputPerSampleReads`] with space preallocated for each of the fastqs.
    pub fn new(number_of_fastqs_for_sample: usize) -> Self {
        Self { per_fastq_reads: vec![vec![]; number_of_fastqs_for_sample] }
    }

    /// Check if all `per_fastq_reads` are empty.
    pub fn is_empty(&self) -> bool {
        self.per_fastq_reads.iter().all(Vec::is_empty)
    }

    /// Get the number of reads that have been added to the `per_fastq_reads` vec.
    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            self.per_fastq_reads[0].len()
        }
    }
}

/// Demultiplexes ranges of the input into the per-sample outputs.
pub trait Demultiplex: Send + Sync {
    /// Demultiplex the records of a single-end input within `range`.
    fn process(&self, range: ByteRange) -> Result<WorkerResult>;
    /// Demultiplex the read pairs within `range`.
    fn process_pair(&self, range: PairedRange) -> Result<WorkerResult>;
}

/// An implementation of [`Demultiplex`] that is generic over the [`Matcher`] that is used.
pub struct Demultiplexer<'a, M: Matcher> {
    /// The read 1 (or only) input FASTQ.
    input: PathBuf,
    /// The read 2 input FASTQ when paired.
    input2: Option<PathBuf>,
    table: &'a BarcodeTable,
    config: &'a DemuxConfig,
    writers: &'a SampleWriters,
    matcher: M,
    /// The index in `writers` of the undetermined output, if unmatched reads are written.
    undetermined_index: Option<usize>,
    /// The number of output FASTQs per sample.
    num_outputs: usize,
}

impl<'a, M> Demultiplexer<'a, M>
where
    M: Matcher,
{
    /// Create a new [`Demultiplexer`].
    ///
    /// `writers` must hold one output per sample of `table`, followed by the undetermined output
    /// when `config.write_unmatched` is set.
    pub fn new(
        input: PathBuf,
        input2: Option<PathBuf>,
        table: &'a BarcodeTable,
        config: &'a DemuxConfig,
        writers: &'a SampleWriters,
        matcher: M,
    ) -> Result<Self> {
        let undetermined_index =
            if config.write_unmatched { Some(table.num_samples()) } else { None };
        let expected = table.num_samples() + usize::from(config.write_unmatched);
        ensure!(
            writers.len() == expected,
            "Expected outputs for {} samples, found {}",
            expected,
            writers.len()
        );
        let num_outputs = if input2.is_some() { 2 } else { 1 };
        Ok(Self { input, input2, table, config, writers, matcher, undetermined_index, num_outputs })
    }

    /// Opens a FASTQ reader over the bytes of `range`.
    fn open_range(path: &Path, range: ByteRange) -> Result<RangeReader> {
        let reader = open_input_at(path, range.start)?.take(range.len());
        Ok(fastq::Reader::with_capacity(reader, BUFSIZE))
    }

    fn new_buffers(&self) -> Vec<OutputPerSampleReads> {
        let count = self.table.num_samples() + usize::from(self.undetermined_index.is_some());
        (0..count).map(|_| OutputPerSampleReads::new(self.num_outputs)).collect()
    }

    /// Adds a record (or pair) to a sample's buffer, writing the buffer once it is full.
    fn push(
        &self,
        buffers: &mut [OutputPerSampleReads],
        index: usize,
        records: Vec<OwnedRecord>,
    ) -> Result<()> {
        let buffer = &mut buffers[index];
        for (reads, record) in buffer.per_fastq_reads.iter_mut().zip(records) {
            reads.push(record);
        }
        if buffer.len() >= self.config.batch_size.get() {
            let full = std::mem::replace(buffer, OutputPerSampleReads::new(self.num_outputs));
            self.writers.write_batch(index, full)?;
        }
        Ok(())
    }

    /// Writes every non-empty buffer.
    fn flush(&self, buffers: Vec<OutputPerSampleReads>) -> Result<()> {
        for (index, buffer) in buffers.into_iter().enumerate() {
            if !buffer.is_empty() {
                self.writers.write_batch(index, buffer)?;
            }
        }
        Ok(())
    }

    /// The input FASTQ for read 2, an error if the input is single-end.
    fn input2(&self) -> Result<&Path> {
        match &self.input2 {
            Some(input2) => Ok(input2),
            None => bail!("A read 2 FASTQ is required to demultiplex read pairs"),
        }
    }
}

impl<'a, M> Demultiplex for Demultiplexer<'a, M>
where
    M: Matcher + Send + Sync,
{
    fn process(&self, range: ByteRange) -> Result<WorkerResult> {
        let mut result = WorkerResult::new(self.table.num_samples());
        if range.is_empty() {
            return Ok(result);
        }
        let mut reader = Self::open_range(&self.input, range)?;
        let mut buffers = self.new_buffers();

        while let Some(record) = reader.next() {
            let record = record.with_context(|| {
                format!("Failed to read from {} in range {}", self.input.to_string_lossy(), range)
            })?;
            result.records_seen += 1;
            match self.matcher.find(record.seq()) {
                MatchResult::Match { entry_index, sample_index, .. } => {
                    result.sample_counts[sample_index] += 1;
                    let mut owned = record.to_owned_record();
                    trim_record(&mut owned, self.table.entries()[entry_index].trim)?;
                    self.push(&mut buffers, sample_index, vec![owned])?;
                }
                MatchResult::NoMatch => {
                    if let Some(index) = self.undetermined_index {
                        self.push(&mut buffers, index, vec![record.to_owned_record()])?;
                    }
                }
            }
        }

        self.flush(buffers)?;
        debug!("Processed {} records in range {}", result.records_seen, range);
        Ok(result)
    }

    fn process_pair(&self, range: PairedRange) -> Result<WorkerResult> {
        let mut result = WorkerResult::new(self.table.num_samples());
        if range.is_empty() {
            return Ok(result);
        }
        let input2 = self.input2()?;
        let mut r1_reader = Self::open_range(&self.input, range.r1)?;
        let mut r2_reader = Self::open_range(input2, range.r2)?;
        let mut buffers = self.new_buffers();

        loop {
            let (r1, r2) = match (r1_reader.next(), r2_reader.next()) {
                (None, None) => break,
                (Some(r1), Some(r2)) => (
                    r1.with_context(|| {
                        format!(
                            "Failed to read from {} in range {}",
                            self.input.to_string_lossy(),
                            range.r1
                        )
                    })?,
                    r2.with_context(|| {
                        format!(
                            "Failed to read from {} in range {}",
                            input2.to_string_lossy(),
                            range.r2
                        )
                    })?,
                ),
                _ => bail!(
                    "Read 1 and read 2 FASTQs have different numbers of records in {} and {}",
                    range.r1,
                    range.r2
                ),
            };
            result.records_seen += 1;

            if self.config.check_read_names {
                let (name1, name2) = (read_name(r1.head()), read_name(r2.head()));
                ensure!(
                    name1 == name2,
                    "Read names do not match between read 1 and read 2: {} != {}",
                    s(name1),
                    s(name2)
                );
            }

            match self.matcher.find_pair(r1.seq(), r2.seq()) {
                MatchResult::Match { entry_index, sample_index, .. } => {
                    result.sample_counts[sample_index] += 1;
                    let entry = &self.table.entries()[entry_index];
                    let mut owned1 = r1.to_owned_record();
                    let mut owned2 = r2.to_owned_record();
                    trim_record(&mut owned1, entry.trim)?;
                    trim_record(&mut owned2, entry.companion_trim)?;
                    self.push(&mut buffers, sample_index, vec![owned1, owned2])?;
                }
                MatchResult::NoMatch => {
                    if let Some(index) = self.undetermined_index {
                        let records = vec![r1.to_owned_record(), r2.to_owned_record()];
                        self.push(&mut buffers, index, records)?;
                    }
                }
            }
        }

        self.flush(buffers)?;
        debug!(
            "Processed {} read pairs in ranges {} and {}",
            result.records_seen, range.r1, range.r2
        );
        Ok(result)
    }
}

/// The read name, everything in the header before the first space.
fn read_name(head: &[u8]) -> &[u8] {
    match head.find_byte(b' ') {
        Some(i) => &head[..i],
        None => head,
    }
}

/// Removes the first `length` bases and qualities of a record.
pub fn trim_record(record: &mut OwnedRecord, length: usize) -> Result<()> {
    if length == 0 {
        return Ok(());
    }
    ensure!(
        record.seq.len() == record.qual.len(),
        "Sequence and quality lengths differ ({} != {}) for read {}",
        record.seq.len(),
        record.qual.len(),
        s(&record.head)
    );
    let length = length.min(record.seq.len());
    record.seq.drain(..length);
    record.qual.drain(..length);
    Ok(())
}
