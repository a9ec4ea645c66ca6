//! A library of functionality for splitting FASTQ files by the barcode starting each read.
//!
//! # Overview
//!
//! The flow of data is as follows:
//!
//! - The [`record_index::RecordIndex`] holds a sparse sample of record offsets into an input
//!   FASTQ, stored next to the input and reused across runs.
//! - The offsets are divided by [`partition::partition`] into contiguous byte ranges.
//! - For each range the [`demux::Demultiplexer`] classifies records against the
//!   [`barcode_table::BarcodeTable`] with a [`matcher::Matcher`], buffering them per sample.
//! - Full buffers are written through the [`pooled_sample_writer::SampleWriters`], which hold
//!   one lock per sample so records from different ranges never interleave.
//! - Each range yields a [`metrics::WorkerResult`], folded into a [`metrics::DemuxReport`] once
//!   every range is done.
#![deny(unsafe_code)]
#![allow(
    clippy::must_use_candidate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions
)]
pub mod barcode_table;
pub mod demux;
pub mod matcher;
pub mod metrics;
pub mod opts;
pub mod partition;
pub mod pooled_sample_writer;
pub mod record_index;
pub mod run;
pub mod utils;
