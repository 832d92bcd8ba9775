//! Storage collaborator used for script discovery and persistence.
//!
//! Paths handed to a [`Storage`] are `/`-separated and relative to the
//! storage's base directory, e.g. `lua/admin/kick.lua`.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Which entries a directory listing returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilter {
    Files,
    Directories,
    All,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name without the directory part.
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// Directory listing and flat file access.
pub trait Storage {
    /// List the entries of `dir`, sorted by name.
    fn list_directory(&self, filter: ListFilter, dir: &str) -> io::Result<Vec<DirEntry>>;

    /// Read a whole file.
    fn read(&self, path: &str) -> io::Result<Vec<u8>>;

    /// Read at most `len` bytes from the start of a file.
    fn read_prefix(&self, path: &str, len: usize) -> io::Result<Vec<u8>>;

    /// Read a text file as lines, without line terminators.
    fn read_lines(&self, path: &str) -> io::Result<Vec<String>>;

    /// Replace a text file with the given lines, one per line.
    fn write_lines(&self, path: &str, lines: &[String]) -> io::Result<()>;
}

/// [`Storage`] backed by the local file system.
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_dir: PathBuf,
}

impl FileStorage {
    /// Create a storage rooted at `base_dir`.
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    /// Resolve a storage path to a file system path.
    pub fn resolve(&self, path: &str) -> PathBuf {
        path.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.base_dir.clone(), |acc, part| acc.join(part))
    }
}

impl Storage for FileStorage {
    fn list_directory(&self, filter: ListFilter, dir: &str) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();

        for entry in fs::read_dir(self.resolve(dir))? {
            let entry = entry?;
            let is_dir = entry.file_type()?.is_dir();

            let wanted = match filter {
                ListFilter::Files => !is_dir,
                ListFilter::Directories => is_dir,
                ListFilter::All => true,
            };
            if wanted {
                entries.push(DirEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    is_dir,
                });
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        fs::read(self.resolve(path))
    }

    fn read_prefix(&self, path: &str, len: usize) -> io::Result<Vec<u8>> {
        let file = File::open(self.resolve(path))?;
        let mut prefix = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut prefix)?;
        Ok(prefix)
    }

    fn read_lines(&self, path: &str) -> io::Result<Vec<String>> {
        let content = fs::read_to_string(self.resolve(path))?;
        Ok(content.lines().map(str::to_owned).collect())
    }

    fn write_lines(&self, path: &str, lines: &[String]) -> io::Result<()> {
        let full_path = self.resolve(path);
        if let Some(parent) = full_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut content = String::new();
        for line in lines {
            content.push_str(line);
            content.push('\n');
        }
        fs::write(full_path, content)
    }
}
