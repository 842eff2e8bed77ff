use anyhow::{bail, Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::Archive;
use tempfile::TempDir;
use tracing::debug;

use super::{is_safe, is_under, open_stream};
use crate::config::Compression;
use crate::constants::archive::INDEX_ENTRY;
use crate::error::Error;
use crate::image::Index;
use crate::part;

/// Read-only access to an archive
pub struct ArchiveReader {
    path: PathBuf,
}

impl ArchiveReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !part::exists(&path) {
            bail!("Archive {} does not exist", path.display());
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn archive(&self) -> Result<Archive<Box<dyn Read>>> {
        let (stream, _) = open_stream(&self.path)
            .with_context(|| format!("Failed to open archive {}", self.path.display()))?;
        Ok(Archive::new(stream))
    }

    /// Compression the archive was written with
    pub fn compression(&self) -> Result<Compression> {
        let (_, compression) = open_stream(&self.path)?;
        Ok(compression)
    }

    /// Raw bytes of the index entry
    pub fn index(&self) -> Result<Vec<u8>> {
        let mut archive = self.archive()?;
        let mut found = None;
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.path()?.as_ref() == Path::new(INDEX_ENTRY) {
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                // a rewritten archive keeps the last copy
                found = Some(data);
            }
        }
        found.ok_or_else(|| Error::MissingIndex(self.path.display().to_string()).into())
    }

    /// Parsed and version-checked index
    pub fn read_index(&self) -> Result<Index> {
        Index::from_slice(&self.index()?)
            .with_context(|| format!("Invalid index in archive {}", self.path.display()))
    }

    /// Names of every stored entry
    pub fn entries(&self) -> Result<Vec<String>> {
        let mut archive = self.archive()?;
        let mut names = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            names.push(entry.path()?.to_string_lossy().into_owned());
        }
        Ok(names)
    }

    /// Extract the entry `name` (a file, or a directory with everything
    /// under it) so that it lands at `destination`.
    pub fn decompress_file(&self, name: &str, destination: &Path) -> Result<()> {
        let name = name.trim_end_matches('/');
        let mut archive = self.archive()?;
        let mut matched = 0usize;
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            if !is_under(&path, name) {
                continue;
            }
            if !is_safe(&path) {
                bail!("Refusing to extract unsafe entry {}", path.display());
            }
            let relative = path.strip_prefix(name)?;
            let target = destination.join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            entry
                .unpack(&target)
                .with_context(|| format!("Failed to extract {}", path.display()))?;
            matched += 1;
        }
        if matched == 0 {
            bail!("{} not found in archive {}", name, self.path.display());
        }
        debug!("Extracted {} ({} entries) to {}", name, matched, destination.display());
        Ok(())
    }

    /// Extract the entry `name` into a fresh temporary directory, removed
    /// when the returned handle drops.
    pub fn decompress_file_tmp(&self, name: &str) -> Result<(TempDir, PathBuf)> {
        let dir = tempfile::Builder::new()
            .prefix("ferry-")
            .tempdir()
            .context("Failed to create temporary directory")?;
        let base = Path::new(name.trim_end_matches('/'))
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("entry"));
        let target = dir.path().join(base);
        self.decompress_file(name, &target)?;
        Ok((dir, target))
    }

    /// Extract every entry into `destination`
    pub fn decompress_all(&self, destination: &Path) -> Result<()> {
        std::fs::create_dir_all(destination)?;
        let mut archive = self.archive()?;
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            if !is_safe(&path) {
                bail!("Refusing to extract unsafe entry {}", path.display());
            }
            let target = destination.join(&path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            entry.unpack(&target)?;
        }
        Ok(())
    }
}
