use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::{debug, info};

use super::{is_under, open_stream, staging_name, ArchiveReader, ArchiveWriter};
use crate::constants::archive::INDEX_ENTRY;
use crate::image::Index;
use crate::part;

/// Appends to an existing archive.
///
/// New entries go straight into a staged copy beside the original. On
/// [`close`](ArchiveUpdater::close) the original's remaining entries are
/// streamed across, the index is written and the staged copy replaces the
/// original. Until then the original archive is untouched.
pub struct ArchiveUpdater {
    path: PathBuf,
    writer: ArchiveWriter,
    index: Index,
    replaced: BTreeSet<String>,
}

impl ArchiveUpdater {
    /// Open `path` for appending. Fails when the stored index is missing,
    /// unreadable or written by an incompatible version.
    pub fn open(path: impl AsRef<Path>, part_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let reader = ArchiveReader::open(&path)?;
        let index = reader.read_index()?;
        let compression = reader.compression()?;
        let writer = ArchiveWriter::create(staging_name(&path), part_size, compression)?;
        info!(
            "Opened archive {} with {} image(s) for update",
            path.display(),
            index.list.len()
        );
        Ok(Self {
            path,
            writer,
            index,
            replaced: BTreeSet::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Add or overwrite the entry `name` with the tree at `source`.
    pub fn append(&mut self, source: &Path, name: &str) -> Result<()> {
        self.writer.write(source, name)?;
        self.replaced.insert(name.to_string());
        Ok(())
    }

    /// Replace the stored index; written out on close.
    pub fn update_index(&mut self, index: Index) {
        self.index = index;
    }

    pub fn index_mut(&mut self) -> &mut Index {
        &mut self.index
    }

    /// Carry over untouched entries, write the index and swap the staged
    /// archive into place.
    pub fn close(mut self) -> Result<PathBuf> {
        let (stream, _) = open_stream(&self.path)?;
        let mut original = Archive::new(stream);
        let mut carried = 0usize;
        for entry in original.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            if path == Path::new(INDEX_ENTRY)
                || self.replaced.iter().any(|name| is_under(&path, name))
            {
                continue;
            }
            let mut header = entry.header().clone();
            self.writer
                .builder()
                .append_data(&mut header, &path, &mut entry)
                .with_context(|| format!("Failed to carry over {}", path.display()))?;
            carried += 1;
        }
        debug!("Carried {} entries from {}", carried, self.path.display());

        self.index.touch();
        self.writer.write_index(&self.index)?;
        let staged = self.writer.close()?;
        part::rename(&staged, &self.path)
            .with_context(|| format!("Failed to replace archive {}", self.path.display()))?;
        Ok(self.path)
    }
}
