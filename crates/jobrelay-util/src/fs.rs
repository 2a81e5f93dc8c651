//! A thin wrapper around `std::fs` that attaches the path to every error,
//! matching `maelstrom_util::fs::Fs`'s role in the teacher workspace.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

#[derive(Clone, Copy, Default)]
pub struct Fs;

impl Fs {
    pub fn new() -> Self {
        Self
    }

    pub fn open_file(&self, path: impl AsRef<Path>) -> Result<File> {
        let path = path.as_ref();
        File::open(path).with_context(|| format!("opening {}", path.display()))
    }

    pub fn create_file(&self, path: impl AsRef<Path>) -> Result<File> {
        let path = path.as_ref();
        File::create(path).with_context(|| format!("creating {}", path.display()))
    }

    pub fn create_dir_all(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).with_context(|| format!("creating dir {}", path.display()))
    }

    pub fn remove_dir_all(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::remove_dir_all(path).with_context(|| format!("removing dir {}", path.display()))
    }

    pub fn write(&self, path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, contents).with_context(|| format!("writing {}", path.display()))
    }

    pub fn read(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = path.as_ref();
        std::fs::read(path).with_context(|| format!("reading {}", path.display()))
    }

    pub fn read_to_string(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
    }

    pub fn read_to_string_if_exists(&self, path: impl AsRef<Path>) -> Result<Option<String>> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn canonicalize(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        std::fs::canonicalize(path).with_context(|| format!("canonicalizing {}", path.display()))
    }

    pub fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
        let (from, to) = (from.as_ref(), to.as_ref());
        std::fs::rename(from, to)
            .with_context(|| format!("renaming {} to {}", from.display(), to.display()))
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        path.as_ref().exists()
    }
}
