//! Storage collaborator: resolve a logical name to a byte stream.
//! `FsStorage` is the filesystem implementation used by desktop hosts and the C ABI.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

/// An opened source: stream plus what the transfer needs to announce it.
pub struct SourceFile {
    pub reader: Box<dyn Read + Send>,
    pub size: u64,
    pub display_name: String,
    /// Where the bytes came from, reported back on completion.
    pub location: String,
}

/// An opened destination and where it will live once complete.
pub struct DestinationFile {
    pub writer: Box<dyn Write + Send>,
    pub location: String,
}

pub trait Storage: Send + Sync {
    fn open_for_read(&self, locator: &str) -> io::Result<SourceFile>;
    fn open_for_write(&self, display_name: &str) -> io::Result<DestinationFile>;
}

/// Reads any local path; writes into a download directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    download_dir: PathBuf,
}

impl FsStorage {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// First free path for `name` in the download dir: `a.txt`, `a (1).txt`, `a (2).txt`, ...
    fn free_path(&self, name: &str) -> PathBuf {
        let candidate = self.download_dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
        let path = Path::new(name);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
        (1u32..)
            .map(|i| match &ext {
                Some(ext) => self.download_dir.join(format!("{stem} ({i}).{ext}")),
                None => self.download_dir.join(format!("{stem} ({i})")),
            })
            .find(|p| !p.exists())
            .unwrap_or(candidate)
    }
}

/// Reduce a peer-supplied name to a single safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() || c == ':' { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

impl Storage for FsStorage {
    fn open_for_read(&self, locator: &str) -> io::Result<SourceFile> {
        let path = Path::new(locator);
        let file = File::open(path)?;
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "source is not a regular file",
            ));
        }
        let display_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"))?;
        Ok(SourceFile {
            reader: Box::new(file),
            size: meta.len(),
            display_name,
            location: path.to_string_lossy().into_owned(),
        })
    }

    fn open_for_write(&self, display_name: &str) -> io::Result<DestinationFile> {
        fs::create_dir_all(&self.download_dir)?;
        let path = self.free_path(&sanitize_file_name(display_name));
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        debug!(path = %path.display(), "opened download destination");
        Ok(DestinationFile {
            writer: Box::new(file),
            location: path.to_string_lossy().into_owned(),
        })
    }
}
