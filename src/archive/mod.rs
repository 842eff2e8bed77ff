//! Archive container for images stored outside a registry.
//!
//! An archive is a tar stream, optionally gzip-compressed, written through
//! [`crate::part`] so it may span several part files. It holds one directory
//! per platform variant under `images/<hex digest>/`, each an OCI image
//! layout, plus the reserved `index.json` entry describing every image.
//!
//! Three roles share the format: [`ArchiveWriter`] creates an archive,
//! [`ArchiveUpdater`] appends to an existing one and [`ArchiveReader`]
//! lists and extracts entries.

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};

use crate::config::Compression;
use crate::constants::archive::IMAGES_DIR;
use crate::manifest::digest_hex;
use crate::part::{PartReader, PartWriter};

mod reader;
mod updater;
mod writer;


pub use reader::ArchiveReader;
pub use updater::ArchiveUpdater;
pub use writer::ArchiveWriter;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Entry name of the directory holding the platform variant `digest`
pub fn image_entry(digest: &str) -> String {
    format!("{}/{}", IMAGES_DIR, digest_hex(digest))
}

/// Whether `path` is `name` itself or lies underneath it
fn is_under(path: &Path, name: &str) -> bool {
    path.starts_with(Path::new(name))
}

/// Entry paths must stay inside the extraction target
fn is_safe(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Output side of an archive: the part writer, optionally behind gzip
enum Sink {
    Plain(PartWriter),
    Gzip(GzEncoder<PartWriter>),
}

impl Sink {
    fn new(parts: PartWriter, compression: Compression) -> Self {
        match compression {
            Compression::None => Sink::Plain(parts),
            Compression::Gzip => {
                Sink::Gzip(GzEncoder::new(parts, flate2::Compression::default()))
            }
        }
    }

    fn finish(self) -> io::Result<PartWriter> {
        match self {
            Sink::Plain(parts) => Ok(parts),
            Sink::Gzip(encoder) => encoder.finish(),
        }
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
        }
    }
}

/// Open the stored stream of `path`, undoing gzip when the magic bytes say so
fn open_stream(path: &Path) -> anyhow::Result<(Box<dyn Read>, Compression)> {
    let mut reader = BufReader::new(PartReader::open(path)?);
    let compressed = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    if compressed {
        Ok((Box::new(MultiGzDecoder::new(reader)), Compression::Gzip))
    } else {
        Ok((Box::new(reader), Compression::None))
    }
}

/// Sibling logical name used while an archive is being rewritten
fn staging_name(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".sync");
    PathBuf::from(name)
}
