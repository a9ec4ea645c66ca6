//! Utility functions.
use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use anyhow::{ensure, Context};
use flate2::read::MultiGzDecoder;
use gzp::BUFSIZE;
use lazy_static::lazy_static;
use log::{debug, info};

lazy_static! {
    /// Return the number of cpus as a String
    pub static ref NUM_CPU: String = num_cpus::get().to_string();
}

pub mod built_info {
    use lazy_static::lazy_static;
    include!(concat!(env!("OUT_DIR"), "/built.rs"));

    /// Get a software version string including
    ///   - Git commit hash
    ///   - Git dirty info (whether the repo had uncommitted changes)
    ///   - Cargo package version if no git info found
    fn get_software_version() -> String {
        let prefix = if let Some(s) = GIT_COMMIT_HASH {
            format!("{}-{}", PKG_VERSION, s[0..8].to_owned())
        } else {
            PKG_VERSION.to_string()
        };
        let suffix = match GIT_DIRTY {
            Some(true) => "-dirty",
            _ => "",
        };
        format!("{}{}", prefix, suffix)
    }

    lazy_static! {
        /// Version of the software with git hash
        pub static ref VERSION: String = get_software_version();
    }
}

pub fn s(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).to_string()
}

/// The first two bytes of every gzip member.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Determine the output file names for a sample.
///
/// Single-end output is `<sample>.fq`, paired output is `<sample>.R1.fq` and `<sample>.R2.fq`.
/// A `.gz` suffix is added when the output is compressed.
pub fn filenames<P: AsRef<Path>>(
    sample: &str,
    output_dir: P,
    paired: bool,
    compressed: bool,
) -> Vec<PathBuf> {
    let suffix = if compressed { ".fq.gz" } else { ".fq" };
    let output_dir = output_dir.as_ref();
    if paired {
        vec![
            output_dir.join(format!("{}.R1{}", sample, suffix)),
            output_dir.join(format!("{}.R2{}", sample, suffix)),
        ]
    } else {
        vec![output_dir.join(format!("{}{}", sample, suffix))]
    }
}

/// True if the file starts with the gzip magic bytes.  BGZF files are gzip files.
pub fn is_gzip<P: AsRef<Path>>(path: P) -> io::Result<bool> {
    let mut file = File::open(&path)?;
    let mut magic = [0u8; 2];
    let mut read = 0;
    while read < magic.len() {
        match file.read(&mut magic[read..])? {
            0 => break,
            n => read += n,
        }
    }
    Ok(read == magic.len() && magic == GZIP_MAGIC)
}

/// Opens a FASTQ for reading from the start, transparently decompressing gzip and BGZF input.
pub fn open_input<P: AsRef<Path>>(path: P) -> io::Result<Box<dyn BufRead + Send>> {
    let gzipped = is_gzip(&path)?;
    let file = BufReader::with_capacity(BUFSIZE, File::open(&path)?);
    if gzipped {
        Ok(Box::new(BufReader::with_capacity(BUFSIZE, MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(file))
    }
}

/// Opens a FASTQ positioned at `offset` bytes into its (decompressed) content.
///
/// Plain files are seeked.  Compressed streams cannot be seeked, so the bytes before `offset`
/// are decompressed and discarded.
pub fn open_input_at<P: AsRef<Path>>(
    path: P,
    offset: u64,
) -> anyhow::Result<Box<dyn Read + Send>> {
    let display = path.as_ref().to_string_lossy().to_string();
    let gzipped = is_gzip(&path).with_context(|| format!("Failed to open {}", display))?;
    if gzipped {
        let mut reader = open_input(&path).with_context(|| format!("Failed to open {}", display))?;
        let skipped = io::copy(&mut (&mut reader).take(offset), &mut io::sink())
            .with_context(|| format!("Failed to decompress {}", display))?;
        ensure!(
            skipped == offset,
            "Input {} ended after {} bytes, before offset {}; is the index stale?",
            display,
            skipped,
            offset
        );
        Ok(Box::new(reader))
    } else {
        let mut file = File::open(&path).with_context(|| format!("Failed to open {}", display))?;
        file.seek(SeekFrom::Start(offset))
            .with_context(|| format!("Failed to seek to {} in {}", offset, display))?;
        Ok(Box::new(BufReader::with_capacity(BUFSIZE, file)))
    }
}

/// Removes files.  Abstracted so the removal of stale outputs can be observed in tests.
pub trait FileRemover {
    fn remove(&self, path: &Path) -> io::Result<()>;
}

/// Removes files from the file system.
pub struct FsRemover;

impl FileRemover for FsRemover {
    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }
}

/// Removes any of the given outputs left behind by a previous run, returning how many existed.
pub fn remove_existing_outputs(
    paths: &[PathBuf],
    remover: &dyn FileRemover,
) -> anyhow::Result<usize> {
    let mut removed = 0;
    for path in paths.iter().filter(|p| p.exists()) {
        remover
            .remove(path)
            .with_context(|| format!("Failed to remove stale output {}", path.to_string_lossy()))?;
        info!("Removed stale output {}", path.to_string_lossy());
        removed += 1;
    }
    Ok(removed)
}

/// Removes the outputs of every sample that had no records written, returning how many files
/// were removed.
///
/// `outputs` and `written` are both indexed by sample.
pub fn remove_empty_outputs(
    outputs: &[Vec<PathBuf>],
    written: &[usize],
    remover: &dyn FileRemover,
) -> anyhow::Result<usize> {
    ensure!(
        outputs.len() == written.len(),
        "Expected record counts for {} outputs, found {}",
        outputs.len(),
        written.len()
    );
    let mut removed = 0;
    for path in outputs
        .iter()
        .zip(written.iter())
        .filter(|(_, count)| **count == 0)
        .flat_map(|(paths, _)| paths.iter())
        .filter(|p| p.exists())
    {
        remover
            .remove(path)
            .with_context(|| format!("Failed to remove empty output {}", path.to_string_lossy()))?;
        debug!("Removed empty output {}", path.to_string_lossy());
        removed += 1;
    }
    Ok(removed)
}
