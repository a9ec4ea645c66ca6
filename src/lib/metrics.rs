//! Functionality pertaining to the collection of counts during demultiplexing.
//!
//! Each range processed by a worker yields a [`WorkerResult`] holding the number of records seen
//! and the number matched to each sample.  Results are folded together with
//! [`WorkerResult::update_with`] once workers finish, then turned into a [`DemuxReport`] which
//! derives the unmatched count, per-sample percentages, and can be printed or written to file.

use std::{fmt::Display, path::Path};

use anyhow::Result;
use fgoxide::io::DelimFile;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The name of the per-sample metrics file written to the output directory.
pub const METRICS_FILE_NAME: &str = "demux_metrics.tsv";

/// The counts gathered by one worker over one range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerResult {
    /// The number of records (or read pairs) read.
    pub records_seen: usize,
    /// The number of records matched to each sample, indexed by sample.
    pub sample_counts: Vec<usize>,
}

impl WorkerResult {
    /// An empty result for `num_samples` samples.
    pub fn new(num_samples: usize) -> Self {
        Self { records_seen: 0, sample_counts: vec![0; num_samples] }
    }

    /// Adds the counts of `other` to these counts.
    pub fn update_with(&mut self, other: &WorkerResult) {
        self.records_seen += other.records_seen;
        for (count, other_count) in self.sample_counts.iter_mut().zip(other.sample_counts.iter()) {
            *count += other_count;
        }
    }

    /// The number of records matched to any sample.
    pub fn matched(&self) -> usize {
        self.sample_counts.iter().sum()
    }
}

/// The error that may occur when building a [`DemuxReport`].
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("No records were found in the input")]
    EmptyInput,

    #[error("Expected counts for {expected} samples, found {actual}")]
    SampleCountMismatch { expected: usize, actual: usize },

    #[error("{matched} records were matched to samples but only {total} were read")]
    MatchedExceedsTotal { matched: usize, total: usize },
}

/// One line of the report: a sample (or the unknown bucket) with its count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleCount {
    /// The sample name.
    pub sample: String,
    /// The number of records assigned to the sample.
    pub count: usize,
    /// The percentage of all records assigned to the sample, rounded to two decimals.
    pub percentage: f64,
}

impl SampleCount {
    fn new(sample: String, count: usize, total: usize) -> Self {
        let percentage = (count as f64 / total as f64 * 10_000.0).round() / 100.0;
        Self { sample, count, percentage }
    }
}

impl Display for SampleCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({:.2}%)", self.sample, self.count, self.percentage)
    }
}

/// The final counts of a demultiplexing run.
#[derive(Debug, Clone, PartialEq)]
pub struct DemuxReport {
    /// The number of records read.
    pub total: usize,
    /// The number of records matched to a sample.
    pub matched: usize,
    /// The per-sample rows sorted by sample name, then the unknown row last.
    pub rows: Vec<SampleCount>,
}

impl DemuxReport {
    /// Folds the per-worker results into a report.
    ///
    /// `samples` gives the sample names in the order of the counts.  The unmatched count is the
    /// difference between the records read and the records matched, reported as `unknown_name`.
    pub fn combine(
        results: impl IntoIterator<Item = WorkerResult>,
        samples: &[String],
        unknown_name: &str,
    ) -> Result<Self, ReportError> {
        let mut combined = WorkerResult::new(samples.len());
        for result in results {
            if result.sample_counts.len() != samples.len() {
                return Err(ReportError::SampleCountMismatch {
                    expected: samples.len(),
                    actual: result.sample_counts.len(),
                });
            }
            combined.update_with(&result);
        }

        let total = combined.records_seen;
        if total == 0 {
            return Err(ReportError::EmptyInput);
        }
        let matched = combined.matched();
        let unmatched = total
            .checked_sub(matched)
            .ok_or(ReportError::MatchedExceedsTotal { matched, total })?;

        let mut rows: Vec<SampleCount> = samples
            .iter()
            .zip(combined.sample_counts.iter())
            .sorted_by(|a, b| a.0.cmp(b.0))
            .map(|(sample, count)| SampleCount::new(sample.clone(), *count, total))
            .collect();
        rows.push(SampleCount::new(unknown_name.to_string(), unmatched, total));

        Ok(Self { total, matched, rows })
    }

    /// The number of records not matched to any sample.
    pub fn unmatched(&self) -> usize {
        self.total - self.matched
    }

    /// Write the rows to a `demux_metrics.tsv` file in the output directory.
    pub fn write_metrics<P: AsRef<Path>>(&self, output_dir: P) -> Result<()> {
        let output_path = output_dir.as_ref().join(METRICS_FILE_NAME);
        let delim = DelimFile::default();
        delim.write_tsv(&output_path, self.rows.iter())?;
        Ok(())
    }
}

impl Display for DemuxReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for row in &self.rows {
            writeln!(f, "{}", row)?;
        }
        Ok(())
    }
}
