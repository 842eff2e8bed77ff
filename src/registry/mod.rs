//! Registry client boundary.
//!
//! The transfer engine only talks to registries and on-disk image layouts
//! through [`RegistryClient`]: fetch a raw manifest, fetch a config blob,
//! copy an image between two references with content verification, and push
//! a manifest. [`OciRegistryClient`] implements it over `oci-distribution`
//! for registries and over [`layout::Layout`] for `oci:` and `dir:`
//! references.

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;

use crate::reference::ImageReference;

mod client;
pub mod layout;

#[cfg(test)]
pub(crate) mod fake;


pub use client::OciRegistryClient;

/// Manifest bytes exactly as stored, with their media type and digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawManifest {
    pub data: Vec<u8>,
    pub media_type: String,
    pub digest: String,
}

/// Options of one copy call
#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    /// Fail rather than produce a destination manifest with a different digest
    pub preserve_digests: bool,
    /// Re-express the manifest in this media type on write
    pub force_media_type: Option<String>,
    /// Key used to sign the copied image
    pub signing_key: Option<PathBuf>,
}

impl CopyOptions {
    /// Byte-for-byte copy, the default for every platform transfer
    pub fn preserving() -> Self {
        Self {
            preserve_digests: true,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Fetch the manifest `reference` points at
    async fn inspect_manifest(&self, reference: &ImageReference) -> Result<RawManifest>;

    /// Fetch the config blob of the single-platform image at `reference`
    async fn inspect_config(&self, reference: &ImageReference) -> Result<Vec<u8>>;

    /// Copy the image at `source` to `destination`, verifying every blob
    async fn copy(
        &self,
        source: &ImageReference,
        destination: &ImageReference,
        options: &CopyOptions,
    ) -> Result<()>;

    /// Store `data` as the manifest of `destination`; returns its digest
    async fn push_manifest(
        &self,
        destination: &ImageReference,
        data: &[u8],
        media_type: &str,
    ) -> Result<String>;
}
