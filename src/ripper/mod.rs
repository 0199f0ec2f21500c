pub mod makemkv;

use crate::disc::{DiscTitle, Drive, ScannedDisc};
use indicatif::ProgressBar;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

pub use makemkv::MakeMkv;

#[derive(Error, Debug)]
pub enum RipError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} not found, is it installed and on PATH?")]
    ToolNotFound(String),
    #[error("{tool} exited with {code:?}: {message}")]
    Failed {
        tool: String,
        code: Option<i32>,
        message: String,
    },
    #[error("No disc in drive {0}")]
    NoDisc(u32),
    #[error("Title {0} produced no output file")]
    MissingOutput(u32),
}

pub type Result<T> = std::result::Result<T, RipError>;

/// A title written to disk by the ripper.
#[derive(Debug, Clone, PartialEq)]
pub struct RippedFile {
    pub title_index: u32,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// The disc-ripping program.
pub trait Ripper {
    /// All drives, with the label of the inserted disc if any.
    fn drives(&self) -> Result<Vec<Drive>>;

    fn scan(&self, drive: &Drive) -> Result<ScannedDisc>;

    /// Rip `titles` into `out_dir`, one file per title, in the order given.
    fn rip(
        &self,
        drive: &Drive,
        titles: &[DiscTitle],
        out_dir: &Path,
        progress: &ProgressBar,
    ) -> Result<Vec<RippedFile>>;

    fn eject(&self, drive: &Drive) -> Result<()>;
}

/// Find the ripped file for each title under `out_dir`. Titles are matched by
/// the output name the ripper announced, then by MakeMKV's `_tNN.mkv`
/// suffix.
pub fn collect_outputs(out_dir: &Path, titles: &[DiscTitle]) -> Result<Vec<RippedFile>> {
    let mut mkv_files: Vec<(PathBuf, u64)> = Vec::new();
    for entry in WalkDir::new(out_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let ext = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        if ext == "mkv" {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            mkv_files.push((entry.into_path(), size));
        }
    }

    let mut out = Vec::with_capacity(titles.len());
    for title in titles {
        let suffix = format!("_t{:02}.mkv", title.index);
        let found = mkv_files.iter().find(|(path, _)| {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            match &title.output_file {
                Some(expected) => name == expected,
                None => name.ends_with(&suffix),
            }
        });
        match found {
            Some((path, size)) => out.push(RippedFile {
                title_index: title.index,
                path: path.clone(),
                size_bytes: *size,
            }),
            None => return Err(RipError::MissingOutput(title.index)),
        }
    }
    Ok(out)
}
