//! Parsing of the whitespace-delimited barcode file into an ordered [`BarcodeTable`].
//!
//! Each non-blank, non-comment line holds a sample name, the barcode expected at the start of
//! read 1, and optionally a second barcode expected at the start of read 2.  The order of the
//! lines is significant: the matcher assigns a read to the first entry that matches.
#![forbid(unsafe_code)]

use std::{fmt::Display, path::Path};

use ahash::AHashMap;
use anyhow::anyhow;
use bstr::{BStr, BString, ByteSlice};
use clap::{ArgEnum, PossibleValue};
use fgoxide::io::Io;
use log::{info, warn};
use thiserror::Error;

/// The IUPAC nucleotide codes accepted in a barcode when validation is enabled.
pub const IUPAC_BASES: &[u8] = b"GATCRYWSMKHBVDN";

/// Second barcodes shorter than this cause auto mode to fall back to single-index matching.
pub const MIN_INDEX2_LENGTH: usize = 6;

/// The optional line number from the barcode file where an error occurred.
#[derive(Debug)]
pub struct ErrorLine(pub Option<usize>);

impl Display for ErrorLine {
    /// Writes the line number if present, nothing if it is not None.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(number) => write!(f, "Line {}", number),
            None => Ok(()),
        }
    }
}

/// The reason that a barcode has been deemed invalid.
#[derive(Debug)]
#[non_exhaustive]
pub enum ReasonBarcodeInvalid {
    EmptyString,
    InvalidBase(char),
}

impl Display for ReasonBarcodeInvalid {
    /// Proper error wording for each reason a barcode is invalid.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyString => write!(f, "Barcode is an empty string"),
            Self::InvalidBase(base) => {
                write!(f, "Barcode contains '{}' which is not an IUPAC nucleotide code", base)
            }
        }
    }
}

/// The error that may occur when parsing the [`BarcodeTable`].
#[derive(Error, Debug)]
pub enum BarcodeTableError {
    #[error("Io error occurred")]
    Io(#[from] std::io::Error),

    #[error("Io error occurred")]
    FgError(#[from] fgoxide::FgError),

    #[error("The barcode file contained no barcodes")]
    Empty,

    #[error("Line {line} has {actual} field(s), expected a sample name and at least one barcode")]
    TooFewColumns { line: usize, actual: usize },

    #[error("Invalid barcode sequence for {id} `{barcode}` - {reason}. {line}")]
    InvalidBarcode { barcode: String, id: String, reason: ReasonBarcodeInvalid, line: ErrorLine },

    #[error("Line {line} for sample {id} is missing the read 2 barcode required in paired mode")]
    MissingIndex2 { id: String, line: usize },

    #[error(
        "Illegal barcode file: line {line} has {actual} columns but line {first_line} has {expected}"
    )]
    InconsistentColumns { line: usize, actual: usize, first_line: usize, expected: usize },
}

/// How the second barcode column is treated.
#[derive(ArgEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarcodeMode {
    /// Only the first barcode is used, any second column is ignored.
    Single,
    /// Every line must carry a second barcode, which is matched against read 2.
    Paired,
    /// Use both barcodes when every line has a usable second barcode, otherwise only the first.
    Auto,
}

impl BarcodeMode {
    pub fn possible_values<'a>() -> impl Iterator<Item = PossibleValue<'a>> {
        BarcodeMode::value_variants().iter().filter_map(ArgEnum::to_possible_value)
    }
}

impl std::str::FromStr for BarcodeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for variant in Self::value_variants() {
            if variant.to_possible_value().map_or(false, |v| v.matches(s, false)) {
                return Ok(*variant);
            }
        }
        Err(anyhow!("Invalid variant: {}", s))
    }
}

/// Options controlling how the barcode file is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarcodeTableOpts {
    pub mode: BarcodeMode,
    /// Reject barcodes with characters outside [`IUPAC_BASES`].
    pub validate_alphabet: bool,
    /// Reverse complement the read 1 barcodes before matching.
    pub reverse_complement_index1: bool,
    /// Reverse complement the read 2 barcodes before matching.
    pub reverse_complement_index2: bool,
    /// Remove the barcode from the start of the output records.
    pub trim: bool,
}

impl Default for BarcodeTableOpts {
    fn default() -> Self {
        Self {
            mode: BarcodeMode::Auto,
            validate_alphabet: true,
            reverse_complement_index1: false,
            reverse_complement_index2: false,
            trim: false,
        }
    }
}

/// A single line of the barcode file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarcodeEntry {
    /// The sample the reads are written to.
    pub sample: String,
    /// The index of `sample` in [`BarcodeTable::samples`].
    pub sample_index: usize,
    /// The barcode expected at the start of read 1.
    pub tag: BString,
    /// The barcode expected at the start of read 2, if dual-indexed.
    pub companion: Option<BString>,
    /// The number of bases to remove from the start of read 1.
    pub trim: usize,
    /// The number of bases to remove from the start of read 2.
    pub companion_trim: usize,
    /// The line number in the barcode file, starts at 1.
    pub line_number: usize,
}

impl BarcodeEntry {
    /// The barcode read 2 is compared against.  For single-index tables read 2 is expected to
    /// carry the same barcode as read 1.
    pub fn companion_tag(&self) -> &BStr {
        self.companion.as_ref().unwrap_or(&self.tag).as_bstr()
    }
}

/// One line of the barcode file after splitting, before the mode has been decided.
#[derive(Debug)]
struct RawRow {
    line_number: usize,
    sample: String,
    tag: BString,
    companion: Option<BString>,
}

/// The ordered set of barcode entries and the unique samples they map to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarcodeTable {
    entries: Vec<BarcodeEntry>,
    samples: Vec<String>,
    dual_index: bool,
}

impl BarcodeTable {
    /// Reads the barcode file at `path`.  Gzipped barcode files are supported.
    pub fn from_path<P: AsRef<Path>>(
        path: P,
        opts: &BarcodeTableOpts,
    ) -> Result<Self, BarcodeTableError> {
        let io = Io::default();
        let lines = io.read_lines(&path).map_err(BarcodeTableError::FgError)?;
        let table = Self::from_lines(&lines, opts)?;
        info!(
            "Read {} barcode(s) for {} sample(s) from {} ({} index)",
            table.entries.len(),
            table.samples.len(),
            path.as_ref().to_string_lossy(),
            if table.dual_index { "dual" } else { "single" }
        );
        Ok(table)
    }

    /// Builds the table from the lines of a barcode file.
    ///
    /// Blank lines and lines starting with `#` are skipped.  Fields are separated by any
    /// whitespace and fields beyond the third are ignored.  Barcodes are upper-cased.
    pub fn from_lines<S: AsRef<str>>(
        lines: &[S],
        opts: &BarcodeTableOpts,
    ) -> Result<Self, BarcodeTableError> {
        let mut rows = vec![];
        for (i, line) in lines.iter().enumerate() {
            let line_number = i + 1;
            let line = line.as_ref().trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().take(3).collect();
            if fields.len() < 2 {
                return Err(BarcodeTableError::TooFewColumns {
                    line: line_number,
                    actual: fields.len(),
                });
            }
            let sample = fields[0].to_string();
            let tag = BString::from(fields[1].to_ascii_uppercase());
            validate_barcode(tag.as_bstr(), &sample, Some(line_number), opts.validate_alphabet)?;
            let companion = fields.get(2).map(|f| BString::from(f.to_ascii_uppercase()));
            rows.push(RawRow { line_number, sample, tag, companion });
        }

        if rows.is_empty() {
            return Err(BarcodeTableError::Empty);
        }

        let dual_index = match opts.mode {
            BarcodeMode::Single => false,
            BarcodeMode::Paired => {
                for row in &rows {
                    match &row.companion {
                        None => {
                            return Err(BarcodeTableError::MissingIndex2 {
                                id: row.sample.clone(),
                                line: row.line_number,
                            })
                        }
                        Some(companion) => validate_barcode(
                            companion.as_bstr(),
                            &row.sample,
                            Some(row.line_number),
                            opts.validate_alphabet,
                        )?,
                    }
                }
                true
            }
            BarcodeMode::Auto => Self::infer_dual_index(&rows, opts.validate_alphabet)?,
        };

        let mut sample_indices: AHashMap<String, usize> = AHashMap::new();
        let mut samples = vec![];
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let sample_index = *sample_indices.entry(row.sample.clone()).or_insert_with(|| {
                samples.push(row.sample.clone());
                samples.len() - 1
            });
            let tag = if opts.reverse_complement_index1 {
                reverse_complement(row.tag.as_bstr())
            } else {
                row.tag
            };
            let companion = if dual_index {
                row.companion.map(|c| {
                    if opts.reverse_complement_index2 {
                        reverse_complement(c.as_bstr())
                    } else {
                        c
                    }
                })
            } else {
                None
            };
            let (trim, companion_trim) = if opts.trim {
                (tag.len(), companion.as_ref().map_or(tag.len(), |c| c.len()))
            } else {
                (0, 0)
            };
            entries.push(BarcodeEntry {
                sample: row.sample,
                sample_index,
                tag,
                companion,
                trim,
                companion_trim,
                line_number: row.line_number,
            });
        }

        Ok(Self { entries, samples, dual_index })
    }

    /// Decides whether the second column is used when the mode is [`BarcodeMode::Auto`].
    fn infer_dual_index(rows: &[RawRow], validate: bool) -> Result<bool, BarcodeTableError> {
        let first = &rows[0];
        let columns = |row: &RawRow| if row.companion.is_some() { 3 } else { 2 };
        if let Some(row) = rows.iter().find(|r| columns(r) != columns(first)) {
            return Err(BarcodeTableError::InconsistentColumns {
                line: row.line_number,
                actual: columns(row),
                first_line: first.line_number,
                expected: columns(first),
            });
        }
        if first.companion.is_none() {
            return Ok(false);
        }

        let unusable = rows.iter().find(|row| {
            row.companion.as_ref().map_or(true, |c| {
                c.len() < MIN_INDEX2_LENGTH || (validate && !is_iupac(c.as_bstr()))
            })
        });
        match unusable {
            Some(row) => {
                warn!(
                    "The read 2 barcode for sample {} on line {} is unusable, ignoring the read 2 \
                    barcodes and matching on read 1 only",
                    row.sample, row.line_number
                );
                Ok(false)
            }
            None => Ok(true),
        }
    }

    /// The entries in file order.
    pub fn entries(&self) -> &[BarcodeEntry] {
        &self.entries
    }

    /// The unique sample names in order of first appearance.
    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    /// The sample index of the entry at `entry_index`.
    pub fn sample_index(&self, entry_index: usize) -> usize {
        self.entries[entry_index].sample_index
    }

    /// The number of entries, one per barcode line.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if read 2 is matched against a distinct second barcode.
    pub fn is_dual_index(&self) -> bool {
        self.dual_index
    }
}

/// Run a set of validations on a barcode to ensure that it is well formed.
pub fn validate_barcode(
    barcode: &BStr,
    id: &str,
    line_number: Option<usize>,
    validate_alphabet: bool,
) -> Result<(), BarcodeTableError> {
    let invalid = |reason| BarcodeTableError::InvalidBarcode {
        id: id.to_owned(),
        barcode: barcode.to_string(),
        reason,
        line: ErrorLine(line_number),
    };
    if barcode.is_empty() {
        return Err(invalid(ReasonBarcodeInvalid::EmptyString));
    }
    if validate_alphabet {
        if let Some(base) = barcode.iter().find(|b| !IUPAC_BASES.contains(b)) {
            return Err(invalid(ReasonBarcodeInvalid::InvalidBase(*base as char)));
        }
    }
    Ok(())
}

/// True if every base is an IUPAC nucleotide code.
pub fn is_iupac(barcode: &BStr) -> bool {
    barcode.iter().all(|b| IUPAC_BASES.contains(b))
}

/// Complements each IUPAC code and reverses the order.  Unknown characters are kept as is.
pub fn reverse_complement(barcode: &BStr) -> BString {
    barcode
        .iter()
        .rev()
        .map(|b| match b {
            b'A' => b'T',
            b'T' => b'A',
            b'G' => b'C',
            b'C' => b'G',
            b'R' => b'Y',
            b'Y' => b'R',
            b'M' => b'K',
            b'K' => b'M',
            b'H' => b'D',
            b'D' => b'H',
            b'B' => b'V',
            b'V' => b'B',
            other => *other,
        })
        .collect::<Vec<u8>>()
        .into()
}
