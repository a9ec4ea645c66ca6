//! First-match barcode assignment.
//!
//! A read is assigned to the first entry of the [`BarcodeTable`] whose barcode is within the
//! allowed number of mismatches of the read's leading bases.  Entries are tried in file order,
//! so overlapping barcodes resolve to whichever appears first.

use crate::barcode_table::BarcodeTable;

/// The name given to the "undetermined" sample
pub const UNDETERMINED_NAME: &str = "Unknown";

#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub enum MatchResult {
    Match { entry_index: usize, sample_index: usize, mismatches: usize },
    NoMatch,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match { .. })
    }

    pub fn is_no_match(&self) -> bool {
        !self.is_match()
    }

    /// The index of the matched sample, if any.
    pub fn sample_index(&self) -> Option<usize> {
        match self {
            Self::Match { sample_index, .. } => Some(*sample_index),
            Self::NoMatch => None,
        }
    }
}

/// The base trait for all matching algorithms.
pub trait Matcher {
    /// Assigns a read to a barcode entry using its sequence.
    fn find(&self, seq: &[u8]) -> MatchResult;

    /// Assigns a read pair to a barcode entry.
    fn find_pair(&self, seq1: &[u8], seq2: &[u8]) -> MatchResult;
}

/// Assigns reads to the first barcode entry within `max_mismatches`.
pub struct FirstMatchMatcher<'a> {
    pub table: &'a BarcodeTable,
    pub max_mismatches: usize,
}

impl<'a> FirstMatchMatcher<'a> {
    pub fn new(table: &'a BarcodeTable, max_mismatches: usize) -> Self {
        Self { table, max_mismatches }
    }
}

impl<'a> Matcher for FirstMatchMatcher<'a> {
    fn find(&self, seq: &[u8]) -> MatchResult {
        classify(seq, self.table, self.max_mismatches)
    }

    fn find_pair(&self, seq1: &[u8], seq2: &[u8]) -> MatchResult {
        classify_pair(seq1, seq2, self.table, self.max_mismatches)
    }
}

/// Counts the mismatches between `tag` and the leading bases of `seq`.
///
/// Positions of `tag` beyond the end of `seq` count as mismatches.  Bases are compared
/// literally, so an `N` in either sequence only matches an `N`.  Returns `None` as soon as the
/// count exceeds `max_mismatches`.
#[inline]
pub fn count_mismatches(tag: &[u8], seq: &[u8], max_mismatches: usize) -> Option<usize> {
    let mut mismatches = tag.len().saturating_sub(seq.len());
    if mismatches > max_mismatches {
        return None;
    }
    for (expected, observed) in tag.iter().zip(seq.iter()) {
        if expected != observed {
            mismatches += 1;
            if mismatches > max_mismatches {
                return None;
            }
        }
    }
    Some(mismatches)
}

/// Assigns `seq` to the first entry whose barcode is within `max_mismatches`.
pub fn classify(seq: &[u8], table: &BarcodeTable, max_mismatches: usize) -> MatchResult {
    for (entry_index, entry) in table.entries().iter().enumerate() {
        if let Some(mismatches) = count_mismatches(&entry.tag, seq, max_mismatches) {
            return MatchResult::Match {
                entry_index,
                sample_index: entry.sample_index,
                mismatches,
            };
        }
    }
    MatchResult::NoMatch
}

/// Assigns a read pair.  Read 1 selects the entry with [`classify`], then read 2 must be within
/// `max_mismatches` of that entry's companion barcode.  Later entries are not consulted when read
/// 2 fails.  The reported mismatches are the sum over both reads.
pub fn classify_pair(
    seq1: &[u8],
    seq2: &[u8],
    table: &BarcodeTable,
    max_mismatches: usize,
) -> MatchResult {
    match classify(seq1, table, max_mismatches) {
        MatchResult::Match { entry_index, sample_index, mismatches } => {
            let companion = table.entries()[entry_index].companion_tag();
            match count_mismatches(companion, seq2, max_mismatches) {
                Some(mismatches2) => MatchResult::Match {
                    entry_index,
                    sample_index,
                    mismatches: mismatches + mismatches2,
                },
                None => MatchResult::NoMatch,
            }
        }
        MatchResult::NoMatch => MatchResult::NoMatch,
    }
}
