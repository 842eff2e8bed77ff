//! Images stored in a directory.
//!
//! Two flavors are supported: an OCI image layout (`oci-layout`,
//! `index.json`, `blobs/<alg>/<hex>`) and the plain directory format
//! (`manifest.json` plus one file per blob named by its hex digest).

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::RawManifest;
use crate::constants::media_type;
use crate::error::Error;
use crate::manifest::{self, digest_hex, sniff_media_type, Descriptor, ManifestList};
use crate::reference::{ImageReference, Kind};

const OCI_LAYOUT_FILE: &str = "oci-layout";
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const OCI_INDEX_FILE: &str = "index.json";
const DIR_MANIFEST_FILE: &str = "manifest.json";
const DIR_VERSION_FILE: &str = "version";
const DIR_VERSION_CONTENT: &str = "Directory Transport Version: 1.1\n";

/// Fail unless `data` hashes to `digest`. Only sha256 digests are checked.
pub fn verify(digest: &str, data: &[u8]) -> Result<()> {
    if digest.starts_with("sha256:") {
        let actual = manifest::digest(data);
        if actual != digest {
            bail!("Digest mismatch: expected {}, got {}", digest, actual);
        }
    }
    Ok(())
}

/// [`verify`] for a file, hashed without loading it whole
pub fn verify_file(digest: &str, path: &Path) -> Result<()> {
    if let Some(expected) = digest.strip_prefix("sha256:") {
        let actual = sha256::try_digest(path)
            .with_context(|| format!("Failed to hash {}", path.display()))?;
        if actual != expected {
            bail!("Digest mismatch: expected {}, got sha256:{}", digest, actual);
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Layout {
    kind: Kind,
    root: PathBuf,
}

impl Layout {
    pub fn new(kind: Kind, root: impl AsRef<Path>) -> Result<Self> {
        if !kind.is_local() {
            bail!("{:?} is not an on-disk image format", kind);
        }
        Ok(Self {
            kind,
            root: root.as_ref().to_path_buf(),
        })
    }

    pub fn open(reference: &ImageReference) -> Result<Self> {
        Self::new(reference.kind, reference.directory()?)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, digest: &str) -> PathBuf {
        match self.kind {
            Kind::OciLayout => {
                let (algorithm, hex) = digest.split_once(':').unwrap_or(("sha256", digest));
                self.root.join("blobs").join(algorithm).join(hex)
            }
            _ => self.root.join(digest_hex(digest)),
        }
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).is_file()
    }

    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        let data =
            fs::read(&path).with_context(|| format!("Failed to read blob {}", path.display()))?;
        verify(digest, &data)?;
        Ok(data)
    }

    pub fn write_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        verify(digest, data)?;
        self.prepare()?;
        let path = self.blob_path(digest);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data).with_context(|| format!("Failed to write blob {}", path.display()))
    }

    /// Move or copy an already verified blob file into place
    pub fn write_blob_file(&self, digest: &str, source: &Path) -> Result<()> {
        self.prepare()?;
        let path = self.blob_path(digest);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, &path)
            .with_context(|| format!("Failed to write blob {}", path.display()))?;
        Ok(())
    }

    /// Create the directory and its marker file
    fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create {}", self.root.display()))?;
        let (marker, content) = match self.kind {
            Kind::OciLayout => (OCI_LAYOUT_FILE, OCI_LAYOUT_CONTENT),
            _ => (DIR_VERSION_FILE, DIR_VERSION_CONTENT),
        };
        let marker = self.root.join(marker);
        if !marker.exists() {
            fs::write(&marker, content)?;
        }
        Ok(())
    }

    fn read_oci_index(&self) -> Result<ManifestList> {
        let path = self.root.join(OCI_INDEX_FILE);
        if !path.exists() {
            return Ok(ManifestList::new(media_type::OCI_INDEX, Vec::new()));
        }
        let data = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_slice(&data).with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn unknown(&self) -> anyhow::Error {
        Error::ManifestUnknown(self.root.display().to_string()).into()
    }

    /// The manifest `digest` points at, or the image's top-level manifest
    pub fn read_manifest(&self, digest: Option<&str>) -> Result<RawManifest> {
        let (data, digest) = match (self.kind, digest) {
            (Kind::OciLayout, Some(digest)) => {
                if !self.has_blob(digest) {
                    return Err(self.unknown());
                }
                (self.read_blob(digest)?, digest.to_string())
            }
            (Kind::OciLayout, None) => {
                let index = self.read_oci_index()?;
                let Some(entry) = index.manifests.last() else {
                    return Err(self.unknown());
                };
                (self.read_blob(&entry.digest)?, entry.digest.clone())
            }
            (_, digest) => {
                let path = self.root.join(DIR_MANIFEST_FILE);
                if !path.is_file() {
                    return Err(self.unknown());
                }
                let data = fs::read(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let actual = manifest::digest(&data);
                if let Some(digest) = digest {
                    if digest != actual {
                        bail!("{} holds {}, not {}", self.root.display(), actual, digest);
                    }
                }
                (data, actual)
            }
        };
        let media_type = sniff_media_type(&data).with_context(|| {
            format!("Manifest in {} carries no media type", self.root.display())
        })?;
        Ok(RawManifest {
            data,
            media_type,
            digest,
        })
    }

    /// Store a manifest that a list references but that is not the image's
    /// top-level manifest
    pub fn write_child_manifest(&self, data: &[u8]) -> Result<String> {
        let digest = manifest::digest(data);
        match self.kind {
            Kind::OciLayout => self.write_blob(&digest, data)?,
            _ => bail!(
                "Directory {} cannot hold a manifest list",
                self.root.display()
            ),
        }
        Ok(digest)
    }

    /// Store `data` as the image's top-level manifest; returns its digest
    pub fn write_manifest(&self, data: &[u8], media_type: &str) -> Result<String> {
        let digest = manifest::digest(data);
        self.prepare()?;
        match self.kind {
            Kind::OciLayout => {
                self.write_blob(&digest, data)?;
                let mut index = self.read_oci_index()?;
                index.manifests.retain(|entry| entry.digest != digest);
                index.manifests.push(Descriptor {
                    media_type: media_type.to_string(),
                    digest: digest.clone(),
                    size: data.len() as i64,
                    platform: None,
                    annotations: None,
                });
                let path = self.root.join(OCI_INDEX_FILE);
                fs::write(&path, serde_json::to_vec(&index)?)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }
            _ => {
                let path = self.root.join(DIR_MANIFEST_FILE);
                fs::write(&path, data)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }
        }
        Ok(digest)
    }
}
