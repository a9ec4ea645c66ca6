//! A sparse index of record start offsets used to split a FASTQ into ranges that can be scanned
//! independently.
//!
//! The index is a strictly increasing list of byte offsets into the (decompressed) FASTQ.  The
//! first offset is always `0` and the last is the size of the stream, so consecutive offsets
//! tile the file.  Offsets in between are a random sample of record starts.  The index is
//! stored next to the FASTQ as `<input>.fai` with one offset per line, followed by a tab and the
//! ordinal of the record starting at that offset.  Read 1 and read 2 indexes whose ordinals agree
//! split the two FASTQs at the same read pairs.
#![forbid(unsafe_code)]

use std::{
    io::{BufRead, ErrorKind},
    path::{Path, PathBuf},
};

use fgoxide::io::Io;
use log::{info, warn};
use path_absolutize::Absolutize;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use thiserror::Error;

use crate::utils::open_input;

/// The fraction of records whose start offset is recorded in the index.
pub const DEFAULT_SAMPLE_RATE: f64 = 0.001;

/// The extension appended to the input path to locate its index.
pub const INDEX_EXTENSION: &str = "fai";

/// The number of fields on each line of a samtools-style FASTQ index.
const LEGACY_FIELDS: usize = 6;

/// The error that may occur when building or loading a [`RecordIndex`].
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Io error occurred")]
    Io(#[from] std::io::Error),

    #[error("Io error occurred")]
    FgError(#[from] fgoxide::FgError),

    #[error("Could not parse line {line} of index {path}: `{content}`")]
    Malformed { path: String, line: usize, content: String },

    #[error("Offsets are not increasing on line {line} of index {path}")]
    NotIncreasing { path: String, line: usize },

    #[error("{path} ends with a partial record: {lines} lines is not a multiple of 4")]
    PartialRecord { path: String, lines: usize },

    #[error("{r1} and {r2} have different numbers of lines, {shorter} ends after line {lines}")]
    UnequalLengths { r1: String, r2: String, shorter: String, lines: usize },

    #[error("The index sample rate must be between 0 and 1, found {0}")]
    InvalidSampleRate(f64),
}

/// Decides which record starts are recorded in the index.
#[derive(Debug)]
pub struct IndexSampler {
    rng: SmallRng,
    rate: f64,
}

impl IndexSampler {
    /// Samples each record with probability `rate`.  A fixed `seed` gives a reproducible index.
    pub fn new(rate: f64, seed: Option<u64>) -> Result<Self, IndexError> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(IndexError::InvalidSampleRate(rate));
        }
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Ok(Self { rng, rate })
    }

    #[inline]
    fn sample(&mut self) -> bool {
        self.rng.gen_bool(self.rate)
    }
}

/// The layout of an index file, decided by its first line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexFormat {
    /// One offset per line.
    Offsets,
    /// An offset and a record ordinal per line.
    OffsetsWithOrdinals,
    /// The six fields of a samtools-style FASTQ index.
    Legacy,
}

/// The sparse list of record start offsets for one FASTQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordIndex {
    offsets: Vec<u64>,
    /// The ordinal of the record at each offset, the last being the number of records.  Absent
    /// for indexes stored without ordinals.
    ordinals: Option<Vec<u64>>,
}

impl RecordIndex {
    /// Wraps offsets that are known to be valid.
    pub fn from_offsets(offsets: Vec<u64>) -> Self {
        Self { offsets, ordinals: None }
    }

    /// Wraps offsets and the ordinals of their records, both known to be valid.
    pub fn from_parts(offsets: Vec<u64>, ordinals: Vec<u64>) -> Self {
        Self { offsets, ordinals: Some(ordinals) }
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    pub fn ordinals(&self) -> Option<&[u64]> {
        self.ordinals.as_deref()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// The size of the (decompressed) FASTQ in bytes.
    pub fn end(&self) -> u64 {
        self.offsets.last().copied().unwrap_or(0)
    }

    /// The path of the index for `input`: the absolute input path with `.fai` appended.
    pub fn index_path<P: AsRef<Path>>(input: P) -> Result<PathBuf, IndexError> {
        let absolute = input.as_ref().absolutize()?;
        let mut path = absolute.as_os_str().to_owned();
        path.push(".");
        path.push(INDEX_EXTENSION);
        Ok(PathBuf::from(path))
    }

    /// Scans `input` once and samples record starts.
    pub fn build<P: AsRef<Path>>(
        input: P,
        sampler: &mut IndexSampler,
    ) -> Result<Self, IndexError> {
        let display = input.as_ref().to_string_lossy().to_string();
        let mut reader = open_input(&input)?;
        let mut offsets = vec![0];
        let mut ordinals = vec![0];
        let mut line = Vec::with_capacity(512);
        let mut offset: u64 = 0;
        let mut lines: usize = 0;
        loop {
            line.clear();
            let bytes = reader.read_until(b'\n', &mut line)?;
            if bytes == 0 {
                break;
            }
            if lines > 0 && lines % 4 == 0 && sampler.sample() {
                offsets.push(offset);
                ordinals.push((lines / 4) as u64);
            }
            offset += bytes as u64;
            lines += 1;
        }
        if lines % 4 != 0 {
            return Err(IndexError::PartialRecord { path: display, lines });
        }
        if offset > 0 {
            offsets.push(offset);
            ordinals.push((lines / 4) as u64);
        }
        Ok(Self::from_parts(offsets, ordinals))
    }

    /// Loads the index stored next to `input`.
    ///
    /// Returns `Ok(None)` when there is no index or its first line is not in a recognized
    /// format.  Once the format is recognized, any line that cannot be parsed is an error.
    pub fn load<P: AsRef<Path>>(input: P) -> Result<Option<Self>, IndexError> {
        let path = Self::index_path(input)?;
        if !path.is_file() {
            return Ok(None);
        }
        let display = path.to_string_lossy().to_string();
        let mut lines = vec![];
        for (i, line) in open_input(&path)?.lines().enumerate() {
            match line {
                Ok(line) => lines.push(line),
                Err(err) if err.kind() == ErrorKind::InvalidData && i == 0 => return Ok(None),
                Err(err) if err.kind() == ErrorKind::InvalidData => {
                    return Err(IndexError::Malformed {
                        path: display,
                        line: i + 1,
                        content: String::from("<not text>"),
                    })
                }
                Err(err) => return Err(err.into()),
            }
        }
        Self::parse(&lines, &display)
    }

    /// Parses the lines of an index in the sparse format, with or without ordinals, or the legacy
    /// six-field format.
    fn parse<S: AsRef<str>>(lines: &[S], path: &str) -> Result<Option<Self>, IndexError> {
        let first = match lines.first() {
            Some(first) => first.as_ref(),
            None => return Ok(None),
        };
        let fields: Vec<&str> = first.split_whitespace().collect();
        let all_numbers = fields.iter().all(|f| f.parse::<u64>().is_ok());
        let format = match fields.len() {
            1 if all_numbers => IndexFormat::Offsets,
            2 if all_numbers => IndexFormat::OffsetsWithOrdinals,
            LEGACY_FIELDS => IndexFormat::Legacy,
            _ => return Ok(None),
        };

        let malformed = |line: usize, content: &str| IndexError::Malformed {
            path: path.to_string(),
            line,
            content: content.to_string(),
        };

        let not_increasing =
            |line: usize| IndexError::NotIncreasing { path: path.to_string(), line };

        let mut offsets: Vec<u64> = if format == IndexFormat::Legacy { vec![0] } else { vec![] };
        let mut ordinals: Vec<u64> = vec![];
        for (i, line) in lines.iter().enumerate() {
            let line_number = i + 1;
            let content = line.as_ref().trim();
            if content.is_empty() {
                continue;
            }
            let fields: Vec<&str> = content.split_whitespace().collect();
            let number =
                |field: &str| field.parse::<u64>().map_err(|_| malformed(line_number, content));
            let (offset, ordinal) = match (format, fields.as_slice()) {
                (IndexFormat::Offsets, &[offset]) => (number(offset)?, None),
                (IndexFormat::OffsetsWithOrdinals, &[offset, ordinal]) => {
                    (number(offset)?, Some(number(ordinal)?))
                }
                (IndexFormat::Legacy, &[_, _, _, _, line_width, qual_offset]) => {
                    (number(qual_offset)? + number(line_width)?, None)
                }
                _ => return Err(malformed(line_number, content)),
            };

            match offsets.last() {
                None if offset != 0 => return Err(malformed(line_number, content)),
                Some(last) if offset <= *last => return Err(not_increasing(line_number)),
                _ => offsets.push(offset),
            }
            if let Some(ordinal) = ordinal {
                match ordinals.last() {
                    None if ordinal != 0 => return Err(malformed(line_number, content)),
                    Some(last) if ordinal <= *last => return Err(not_increasing(line_number)),
                    _ => ordinals.push(ordinal),
                }
            }
        }
        let ordinals =
            if format == IndexFormat::OffsetsWithOrdinals { Some(ordinals) } else { None };
        Ok(Some(Self { offsets, ordinals }))
    }

    /// Writes the index next to `input` in the sparse format, with ordinals when they are known.
    pub fn write<P: AsRef<Path>>(&self, input: P) -> Result<PathBuf, IndexError> {
        let path = Self::index_path(input)?;
        let io = Io::default();
        let lines: Vec<String> = match &self.ordinals {
            Some(ordinals) => self
                .offsets
                .iter()
                .zip(ordinals.iter())
                .map(|(offset, ordinal)| format!("{}\t{}", offset, ordinal))
                .collect(),
            None => self.offsets.iter().map(u64::to_string).collect(),
        };
        io.write_lines(&path, lines)?;
        Ok(path)
    }

    /// Loads the index for `input`, building and storing it when absent or unrecognized.
    pub fn load_or_build<P: AsRef<Path>>(
        input: P,
        sample_rate: f64,
        seed: Option<u64>,
    ) -> Result<Self, IndexError> {
        let display = input.as_ref().to_string_lossy().to_string();
        if let Some(index) = Self::load(&input)? {
            info!("Loaded index with {} offsets for {}", index.len(), display);
            return Ok(index);
        }
        if Self::index_path(&input)?.exists() {
            warn!("Index for {} is not in a recognized format, rebuilding it", display);
        }
        let mut sampler = IndexSampler::new(sample_rate, seed)?;
        let index = Self::build(&input, &mut sampler)?;
        let path = index.write(&input)?;
        info!(
            "Built index with {} offsets over {} bytes, written to {}",
            index.len(),
            index.end(),
            path.to_string_lossy()
        );
        Ok(index)
    }
}

/// Indexes over a read 1 and read 2 FASTQ whose `i`-th offsets start the same read pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedRecordIndex {
    pub r1: RecordIndex,
    pub r2: RecordIndex,
}

impl PairedRecordIndex {
    /// Scans both FASTQs in lockstep, sampling the same record ordinals in each.
    pub fn build<P: AsRef<Path>, Q: AsRef<Path>>(
        r1: P,
        r2: Q,
        sampler: &mut IndexSampler,
    ) -> Result<Self, IndexError> {
        let r1_display = r1.as_ref().to_string_lossy().to_string();
        let r2_display = r2.as_ref().to_string_lossy().to_string();
        let mut readers = [open_input(&r1)?, open_input(&r2)?];
        let mut lines_buf = [Vec::with_capacity(512), Vec::with_capacity(512)];
        let mut offsets = [vec![0], vec![0]];
        let mut ordinals = vec![0];
        let mut offset = [0u64; 2];
        let mut lines: usize = 0;
        loop {
            let mut bytes = [0usize; 2];
            for i in 0..2 {
                lines_buf[i].clear();
                bytes[i] = readers[i].read_until(b'\n', &mut lines_buf[i])?;
            }
            match bytes {
                [0, 0] => break,
                [0, _] | [_, 0] => {
                    let shorter = if bytes[0] == 0 { &r1_display } else { &r2_display };
                    return Err(IndexError::UnequalLengths {
                        r1: r1_display.clone(),
                        r2: r2_display.clone(),
                        shorter: shorter.clone(),
                        lines,
                    });
                }
                _ => (),
            }
            if lines > 0 && lines % 4 == 0 && sampler.sample() {
                offsets[0].push(offset[0]);
                offsets[1].push(offset[1]);
                ordinals.push((lines / 4) as u64);
            }
            offset[0] += bytes[0] as u64;
            offset[1] += bytes[1] as u64;
            lines += 1;
        }
        if lines % 4 != 0 {
            return Err(IndexError::PartialRecord { path: r1_display, lines });
        }
        let [mut r1_offsets, mut r2_offsets] = offsets;
        if lines > 0 {
            r1_offsets.push(offset[0]);
            r2_offsets.push(offset[1]);
            ordinals.push((lines / 4) as u64);
        }
        Ok(Self {
            r1: RecordIndex::from_parts(r1_offsets, ordinals.clone()),
            r2: RecordIndex::from_parts(r2_offsets, ordinals),
        })
    }

    /// Loads both indexes, rebuilding both unless they were sampled at the same record ordinals.
    pub fn load_or_build<P: AsRef<Path>, Q: AsRef<Path>>(
        r1: P,
        r2: Q,
        sample_rate: f64,
        seed: Option<u64>,
    ) -> Result<Self, IndexError> {
        match (RecordIndex::load(&r1)?, RecordIndex::load(&r2)?) {
            (Some(r1_index), Some(r2_index))
                if r1_index.ordinals().is_some() && r1_index.ordinals() == r2_index.ordinals() =>
            {
                info!("Loaded paired indexes with {} offsets", r1_index.len());
                return Ok(Self { r1: r1_index, r2: r2_index });
            }
            (Some(_), Some(_)) => {
                warn!("Indexes for the read 1 and read 2 FASTQs do not agree, rebuilding both");
            }
            _ => (),
        }
        let mut sampler = IndexSampler::new(sample_rate, seed)?;
        let index = Self::build(&r1, &r2, &mut sampler)?;
        index.r1.write(&r1)?;
        index.r2.write(&r2)?;
        info!("Built paired indexes with {} offsets", index.r1.len());
        Ok(index)
    }
}
