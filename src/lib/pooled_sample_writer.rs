//! Writers for the per-sample output FASTQs.
//!
//! Each sample owns one (single-end) or two (paired) output files held by a
//! [`PooledSampleWriter`].  The [`SampleWriters`] wraps each in a [`Mutex`] so that workers can
//! append whole batches of records without interleaving.  Compressed output is BGZF, produced by
//! a shared pool of compressor threads.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
};

use anyhow::{ensure, Context, Result};
use gzp::BUFSIZE;
use itertools::Itertools;
use log::debug;
use parking_lot::Mutex;
use pooled_writer::{bgzf::BgzfCompressor, Pool, PooledWriter};
use seq_io::BaseRecord;

use crate::demux::OutputPerSampleReads;

/// A single output FASTQ, either compressed through the pool or written as plain text.
#[derive(Debug)]
pub enum SampleWriter {
    Pooled(PooledWriter),
    Plain(BufWriter<File>),
}

impl SampleWriter {
    /// Flushes and closes the underlying file.
    pub fn close(self) -> Result<()> {
        match self {
            Self::Pooled(writer) => writer.close()?,
            Self::Plain(mut writer) => writer.flush()?,
        }
        Ok(())
    }
}

impl Write for SampleWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Pooled(writer) => writer.write(buf),
            Self::Plain(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Pooled(writer) => writer.flush(),
            Self::Plain(writer) => writer.flush(),
        }
    }
}

/// A struct that holds onto the [`SampleWriter`]s for a given sample.
#[derive(Debug)]
pub struct PooledSampleWriter {
    pub writers: Vec<SampleWriter>,
    pub records_written: usize,
}

impl PooledSampleWriter {
    /// Create a new [`PooledSampleWriter`].
    pub fn new(writers: Vec<SampleWriter>) -> Result<Self> {
        ensure!(!writers.is_empty(), "At least one writer must be provided");
        Ok(Self { writers, records_written: 0 })
    }

    /// Write the demultiplexed reads to each of their respective FASTQ files.
    pub fn write_records(&mut self, sample_reads: OutputPerSampleReads) -> Result<()> {
        ensure!(
            sample_reads.per_fastq_reads.len() == self.writers.len(),
            "Expected reads for {} FASTQs, found {}",
            self.writers.len(),
            sample_reads.per_fastq_reads.len()
        );
        let mut seen = 0;
        for (reads, writer) in sample_reads.per_fastq_reads.into_iter().zip(self.writers.iter_mut())
        {
            seen += reads.len();
            for read in reads {
                read.write(&mut *writer)?;
            }
        }

        self.records_written += seen / self.writers.len();
        Ok(())
    }

    /// Consumes [`Self`]. For each held writer, call close to flush all writers.
    pub fn finish(self) -> Result<usize> {
        for writer in self.writers {
            writer.close()?;
        }
        Ok(self.records_written)
    }
}

/// The output FASTQs for every sample, indexed by sample.
pub struct SampleWriters {
    writers: Vec<Mutex<PooledSampleWriter>>,
    pool: Mutex<Option<Pool>>,
}

impl SampleWriters {
    /// Creates (truncating) the output FASTQs.
    ///
    /// `outputs` holds the paths for each sample, every sample having the same number of paths.
    /// When `compress` is set the outputs are BGZF compressed by a pool of `compressor_threads`,
    /// with `writer_threads` writing compressed blocks.
    pub fn create(
        outputs: &[Vec<PathBuf>],
        compress: bool,
        writer_threads: usize,
        compressor_threads: usize,
    ) -> Result<Self> {
        ensure!(!outputs.is_empty(), "At least one output must be provided");
        let group_size = outputs[0].len();
        ensure!(
            outputs.iter().all(|o| o.len() == group_size),
            "Every sample must have the same number of outputs"
        );

        let files: Result<Vec<_>> = outputs
            .iter()
            .flatten()
            .map(|name| {
                File::create(name)
                    .with_context(|| format!("Unable to create file: {}", name.to_string_lossy()))
                    .map(|f| BufWriter::with_capacity(BUFSIZE, f))
            })
            .collect();
        let files = files?;

        let (pool, writers): (Option<Pool>, Vec<SampleWriter>) = if compress {
            let (pool, pooled_writers) = Pool::new::<_, BgzfCompressor>(
                writer_threads,
                compressor_threads,
                2,
                files,
            )?;
            (Some(pool), pooled_writers.into_iter().map(SampleWriter::Pooled).collect())
        } else {
            (None, files.into_iter().map(SampleWriter::Plain).collect())
        };

        let mut grouped = vec![];
        for grouped_writers in &writers.into_iter().chunks(group_size) {
            grouped.push(Mutex::new(PooledSampleWriter::new(grouped_writers.collect())?));
        }
        debug!("Created {} output(s) for {} sample(s)", grouped.len() * group_size, grouped.len());
        Ok(Self { writers: grouped, pool: Mutex::new(pool) })
    }

    /// The number of samples with outputs.
    pub fn len(&self) -> usize {
        self.writers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }

    /// Appends a batch of records to the outputs of the sample at `sample_index`.  The sample's
    /// lock is held for the whole batch.
    pub fn write_batch(&self, sample_index: usize, reads: OutputPerSampleReads) -> Result<()> {
        let writer = self
            .writers
            .get(sample_index)
            .with_context(|| format!("No output for sample number: {}", sample_index))?;
        writer
            .lock()
            .write_records(reads)
            .with_context(|| format!("Failed to write reads to sample number: {}", sample_index))
    }

    /// Flushes and closes every output and stops the compression pool.  Returns the number of
    /// records written for each sample.
    pub fn finish(self) -> Result<Vec<usize>> {
        let mut written = Vec::with_capacity(self.writers.len());
        for writer in self.writers {
            let writer = writer.into_inner();
            written.push(writer.finish().context("Failed to flush and finish writing.")?);
        }
        if let Some(mut pool) = self.pool.into_inner() {
            pool.stop_pool()?;
        }
        Ok(written)
    }
}
