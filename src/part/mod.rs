//! Transparent splitting of one logical file across numbered parts.
//!
//! With splitting enabled a logical file `N` is stored as `N.part0`,
//! `N.part1`, ... each at most `part_size` bytes. With splitting disabled
//! (`part_size == 0`) the writer produces `N.part0` and renames it to `N`
//! when closed, so a single-part file carries no suffix.

use anyhow::Result;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::constants::part::{MAX_PARTS, MAX_SIZE, MIN_SIZE, SUFFIX};
use crate::error::Error;


/// Path of part `index` of the logical file `name`
pub fn part_path(name: &Path, index: u64) -> PathBuf {
    let mut path = name.as_os_str().to_owned();
    path.push(format!("{}{}", SUFFIX, index));
    PathBuf::from(path)
}

pub fn validate_part_size(part_size: u64) -> Result<()> {
    if part_size != 0 && !(MIN_SIZE..=MAX_SIZE).contains(&part_size) {
        return Err(Error::InvalidPartSize(part_size).into());
    }
    Ok(())
}

/// Whether `name` exists on disk, either split or whole
pub fn exists(name: &Path) -> bool {
    part_path(name, 0).exists() || name.exists()
}

/// Every file on disk making up the logical file `name`
pub fn existing_parts(name: &Path) -> Vec<PathBuf> {
    let mut parts = Vec::new();
    for index in 0.. {
        let path = part_path(name, index);
        if !path.exists() {
            break;
        }
        parts.push(path);
    }
    if parts.is_empty() && name.exists() {
        parts.push(name.to_path_buf());
    }
    parts
}

/// Remove the logical file `name` in whichever form it is stored
pub fn remove(name: &Path) -> io::Result<()> {
    for path in existing_parts(name) {
        fs::remove_file(&path)?;
    }
    Ok(())
}

/// Move the logical file `from` to `to`, replacing whatever `to` held
pub fn rename(from: &Path, to: &Path) -> io::Result<()> {
    remove(to)?;
    if part_path(from, 0).exists() {
        for (index, path) in existing_parts(from).into_iter().enumerate() {
            fs::rename(&path, part_path(to, index as u64))?;
        }
        Ok(())
    } else {
        fs::rename(from, to)
    }
}

/// Writes one logical file across size-bounded parts
pub struct PartWriter {
    name: PathBuf,
    part_size: u64,
    max_parts: u64,
    index: u64,
    written: u64,
    file: Option<File>,
}

impl PartWriter {
    /// Create a writer for `name`. Any file already stored under that
    /// logical name is replaced.
    pub fn create(name: impl AsRef<Path>, part_size: u64) -> Result<Self> {
        validate_part_size(part_size)?;
        Self::open(name.as_ref(), part_size, MAX_PARTS)
    }

    fn open(name: &Path, part_size: u64, max_parts: u64) -> Result<Self> {
        let name = name.to_path_buf();
        remove(&name)?;
        let file = File::create(part_path(&name, 0))?;
        debug!("Opened {} for writing (part size {})", name.display(), part_size);
        Ok(Self {
            name,
            part_size,
            max_parts,
            index: 0,
            written: 0,
            file: Some(file),
        })
    }

    pub fn name(&self) -> &Path {
        &self.name
    }

    /// Number of part files written so far
    pub fn parts(&self) -> u64 {
        self.index + 1
    }

    fn current(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("part writer already closed"))
    }

    fn rotate(&mut self) -> io::Result<()> {
        let next = self.index + 1;
        if next >= self.max_parts {
            return Err(io::Error::other(Error::TooManyParts(
                self.name.display().to_string(),
                self.max_parts,
            )));
        }
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        self.file = Some(File::create(part_path(&self.name, next))?);
        self.index = next;
        self.written = 0;
        Ok(())
    }

    /// Flush the last part. When splitting is disabled the single part is
    /// renamed to the bare logical name.
    pub fn close(mut self) -> Result<PathBuf> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_all()?;
        }
        if self.part_size == 0 {
            fs::rename(part_path(&self.name, 0), &self.name)?;
        }
        debug!("Closed {} after {} part(s)", self.name.display(), self.parts());
        Ok(self.name.clone())
    }
}

impl Write for PartWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.part_size == 0 {
            return self.current()?.write(buf);
        }

        let mut consumed = 0;
        while consumed < buf.len() {
            if self.written >= self.part_size {
                self.rotate()?;
            }
            let room = (self.part_size - self.written) as usize;
            let end = consumed + room.min(buf.len() - consumed);
            self.current()?.write_all(&buf[consumed..end])?;
            self.written += (end - consumed) as u64;
            consumed = end;
        }
        Ok(consumed)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.current()?.flush()
    }
}

/// Reads a logical file back, following its parts in order
pub struct PartReader {
    name: PathBuf,
    split: bool,
    index: u64,
    read: u64,
    file: Option<File>,
    failed: Option<io::ErrorKind>,
}

impl PartReader {
    /// Open `name`, preferring its split form when `name.part0` exists
    pub fn open(name: impl AsRef<Path>) -> Result<Self> {
        let name = name.as_ref().to_path_buf();
        let first = part_path(&name, 0);
        let (split, file) = match File::open(&first) {
            Ok(file) => (true, file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => (false, File::open(&name)?),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            name,
            split,
            index: 0,
            read: 0,
            file: Some(file),
            failed: None,
        })
    }

    pub fn is_split(&self) -> bool {
        self.split
    }

    /// Bytes read from the current part
    pub fn position_in_part(&self) -> u64 {
        self.read
    }

    /// Move on to the next part; returns false once the parts run out
    fn advance(&mut self) -> io::Result<bool> {
        if !self.split {
            self.file = None;
            return Ok(false);
        }
        let next = self.index + 1;
        match File::open(part_path(&self.name, next)) {
            Ok(file) => {
                self.file = Some(file);
                self.index = next;
                self.read = 0;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.file = None;
                Ok(false)
            }
            Err(e) => {
                self.failed = Some(e.kind());
                Err(e)
            }
        }
    }
}

impl Read for PartReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(kind) = self.failed {
            return Err(io::Error::new(
                kind,
                format!("part {} of {} is unreadable", self.index + 1, self.name.display()),
            ));
        }
        loop {
            // a finished reader keeps reporting end-of-stream
            let Some(file) = self.file.as_mut() else {
                return Ok(0);
            };
            let n = file.read(buf)?;
            if n > 0 {
                self.read += n as u64;
                return Ok(n);
            }
            if !self.advance()? {
                return Ok(0);
            }
        }
    }
}
