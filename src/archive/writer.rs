use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tar::{Builder, Header, HeaderMode};
use tracing::debug;

use super::Sink;
use crate::config::Compression;
use crate::constants::archive::INDEX_ENTRY;
use crate::image::Index;
use crate::part::PartWriter;

/// Creates a new archive
pub struct ArchiveWriter {
    path: PathBuf,
    builder: Builder<Sink>,
    entries: HashSet<String>,
    index_written: bool,
}

impl ArchiveWriter {
    /// Start a fresh archive at `path`, replacing any archive stored there.
    pub fn create(path: impl AsRef<Path>, part_size: u64, compression: Compression) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let parts = PartWriter::create(&path, part_size)
            .with_context(|| format!("Failed to create archive {}", path.display()))?;
        let mut builder = Builder::new(Sink::new(parts, compression));
        builder.mode(HeaderMode::Deterministic);
        Ok(Self {
            path,
            builder,
            entries: HashSet::new(),
            index_written: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether an entry named `name` was already written
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains(name)
    }

    /// Add the file or directory tree at `source` under `name`.
    pub fn write(&mut self, source: &Path, name: &str) -> Result<()> {
        if name == INDEX_ENTRY {
            bail!("{} is reserved for the archive index", INDEX_ENTRY);
        }
        if !self.entries.insert(name.to_string()) {
            debug!("Entry {} already in archive, skipping", name);
            return Ok(());
        }

        let metadata = std::fs::metadata(source)
            .with_context(|| format!("Failed to stat {}", source.display()))?;
        let added = if metadata.is_dir() {
            self.builder.append_dir_all(name, source)
        } else {
            self.builder.append_path_with_name(source, name)
        };
        added.with_context(|| format!("Failed to add {} to archive", source.display()))?;

        debug!("Added {} to {}", name, self.path.display());
        Ok(())
    }

    /// Store `index` under the reserved index entry. Written once per archive.
    pub fn write_index(&mut self, index: &Index) -> Result<()> {
        if self.index_written {
            bail!("Index already written to {}", self.path.display());
        }
        let data = index.to_vec()?;
        self.append_bytes(INDEX_ENTRY, &data)?;
        self.index_written = true;
        Ok(())
    }

    pub(super) fn append_bytes(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        self.builder
            .append_data(&mut header, name, data)
            .with_context(|| format!("Failed to write {} to archive", name))?;
        Ok(())
    }

    pub(super) fn builder(&mut self) -> &mut Builder<Sink> {
        &mut self.builder
    }

    /// Finish the tar stream and close the part files.
    pub fn close(self) -> Result<PathBuf> {
        let sink = self
            .builder
            .into_inner()
            .context("Failed to finish archive")?;
        let parts = sink.finish().context("Failed to finish compression")?;
        parts.close()
    }
}
