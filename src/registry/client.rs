use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::{OciDistributionError, OciErrorCode};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::{Client, Reference, RegistryOperation};
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::layout::{verify_file, Layout};
use super::{CopyOptions, RawManifest, RegistryClient};
use crate::auth::Keychain;
use crate::config::Config;
use crate::constants::media_type;
use crate::error::Error;
use crate::manifest::{self, sniff_media_type, Manifest};
use crate::reference::{ImageReference, Kind};

/// Where image content is read from or written to
enum Endpoint {
    Registry { reference: Reference, host: String },
    Local(Layout),
}

/// A blob on disk: spooled from a registry, or a file of a local layout
struct BlobFile {
    path: PathBuf,
    _spool: Option<TempPath>,
}

fn descriptor(digest: &str) -> OciDescriptor {
    OciDescriptor {
        digest: digest.to_string(),
        ..Default::default()
    }
}

fn pinned(reference: &Reference, digest: &str) -> Reference {
    Reference::with_digest(
        reference.registry().to_string(),
        reference.repository().to_string(),
        digest.to_string(),
    )
}

/// `ManifestUnknown` when the registry says the manifest does not exist
fn manifest_error(err: OciDistributionError, reference: &Reference) -> anyhow::Error {
    let unknown = match &err {
        OciDistributionError::ImageManifestNotFoundError(_) => true,
        OciDistributionError::RegistryError { envelope, .. } => envelope.errors.iter().any(|e| {
            matches!(e.code, OciErrorCode::ManifestUnknown | OciErrorCode::NameUnknown)
        }),
        _ => false,
    };
    if unknown {
        return Error::ManifestUnknown(reference.to_string()).into();
    }
    anyhow::Error::new(err).context(format!("Failed to fetch manifest for {}", reference))
}

/// Registry client over `oci-distribution`, with on-disk layouts handled
/// locally.
pub struct OciRegistryClient {
    client: Client,
    keychain: Keychain,
}

impl OciRegistryClient {
    pub fn new(config: &Config) -> Self {
        Self::with_keychain(config, Keychain::new(config))
    }

    pub fn with_keychain(config: &Config, keychain: Keychain) -> Self {
        let client_config = ClientConfig {
            protocol: ClientProtocol::HttpsExcept(config.insecure_registries.clone()),
            ..Default::default()
        };
        Self {
            client: Client::new(client_config),
            keychain,
        }
    }

    fn endpoint(reference: &ImageReference) -> Result<Endpoint> {
        match reference.kind {
            Kind::Registry => {
                let parsed = Reference::from_str(&reference.to_string())
                    .with_context(|| format!("Failed to parse image reference {}", reference))?;
                Ok(Endpoint::Registry {
                    reference: parsed,
                    host: reference.registry.clone(),
                })
            }
            Kind::Daemon => bail!("{}: the docker daemon transport is not supported", reference),
            Kind::Directory | Kind::OciLayout => Ok(Endpoint::Local(Layout::open(reference)?)),
        }
    }

    async fn read_manifest(&self, from: &Endpoint, digest: Option<&str>) -> Result<RawManifest> {
        match from {
            Endpoint::Registry { reference, host } => {
                let reference = match digest {
                    Some(digest) => pinned(reference, digest),
                    None => reference.clone(),
                };
                let auth = self.keychain.registry_auth(host);
                let (data, digest) = self
                    .client
                    .pull_manifest_raw(&reference, &auth, media_type::ACCEPTED)
                    .await
                    .map_err(|err| manifest_error(err, &reference))?;
                let media_type = sniff_media_type(&data)
                    .with_context(|| format!("Manifest of {} carries no media type", reference))?;
                Ok(RawManifest {
                    data,
                    media_type,
                    digest,
                })
            }
            Endpoint::Local(layout) => layout.read_manifest(digest),
        }
    }

    /// Fetch a verified blob onto disk. Layout blobs are used in place.
    async fn fetch_blob(&self, from: &Endpoint, digest: &str) -> Result<BlobFile> {
        let blob = match from {
            Endpoint::Registry { reference, .. } => {
                let spool = tempfile::Builder::new()
                    .prefix("ferry-blob-")
                    .tempfile()
                    .context("Failed to create blob spool file")?
                    .into_temp_path();
                let mut file = tokio::fs::File::create(&spool).await?;
                self.client
                    .pull_blob(reference, &descriptor(digest), &mut file)
                    .await
                    .with_context(|| format!("Failed to fetch blob {} from {}", digest, reference))?;
                file.flush().await?;
                BlobFile {
                    path: spool.to_path_buf(),
                    _spool: Some(spool),
                }
            }
            Endpoint::Local(layout) => BlobFile {
                path: layout.blob_path(digest),
                _spool: None,
            },
        };
        let (expected, path) = (digest.to_string(), blob.path.clone());
        tokio::task::spawn_blocking(move || verify_file(&expected, &path)).await??;
        Ok(blob)
    }

    /// Whether `to` already stores the blob
    async fn has_blob(&self, to: &Endpoint, digest: &str) -> bool {
        match to {
            // the stream is dropped unread, which ends the request
            Endpoint::Registry { reference, .. } => self
                .client
                .pull_blob_stream(reference, &descriptor(digest))
                .await
                .is_ok(),
            Endpoint::Local(layout) => layout.has_blob(digest),
        }
    }

    /// Mount the blob from another repository of the same registry
    async fn mount_blob(&self, from: &Endpoint, to: &Endpoint, digest: &str) -> bool {
        let (
            Endpoint::Registry {
                reference: source,
                host: from_host,
            },
            Endpoint::Registry {
                reference: target,
                host: to_host,
            },
        ) = (from, to)
        else {
            return false;
        };
        if from_host != to_host || source.repository() == target.repository() {
            return false;
        }
        match self.client.mount_blob(target, source, digest).await {
            Ok(()) => true,
            Err(err) => {
                debug!("Mounting {} into {} failed: {}", digest, target, err);
                false
            }
        }
    }

    async fn write_blob(&self, to: &Endpoint, digest: &str, blob: &BlobFile) -> Result<()> {
        match to {
            Endpoint::Registry { reference, .. } => {
                // the registry client uploads from memory
                let data = tokio::fs::read(&blob.path)
                    .await
                    .with_context(|| format!("Failed to read spooled blob {}", digest))?;
                self.client
                    .push_blob(reference, &data, digest)
                    .await
                    .with_context(|| format!("Failed to push blob {} to {}", digest, reference))?;
                Ok(())
            }
            Endpoint::Local(layout) => layout.write_blob_file(digest, &blob.path),
        }
    }

    /// Store a manifest. `child` marks a manifest referenced by a list,
    /// addressed by digest rather than by the destination's tag.
    async fn write_manifest(&self, to: &Endpoint, raw: &RawManifest, child: bool) -> Result<String> {
        match to {
            Endpoint::Registry { reference, .. } => {
                let target = if child {
                    pinned(reference, &raw.digest)
                } else {
                    reference.clone()
                };
                let content_type = http::HeaderValue::from_str(&raw.media_type)
                    .with_context(|| format!("Invalid media type {:?}", raw.media_type))?;
                self.client
                    .push_manifest_raw(&target, raw.data.clone(), content_type)
                    .await
                    .with_context(|| format!("Failed to push manifest to {}", target))?;
                Ok(manifest::digest(&raw.data))
            }
            Endpoint::Local(layout) if child => layout.write_child_manifest(&raw.data),
            Endpoint::Local(layout) => layout.write_manifest(&raw.data, &raw.media_type),
        }
    }

    async fn authorize_push(&self, to: &Endpoint) -> Result<()> {
        if let Endpoint::Registry { reference, host } = to {
            let auth = self.keychain.registry_auth(host);
            self.client
                .auth(reference, &auth, RegistryOperation::Push)
                .await
                .with_context(|| format!("Failed to authenticate with {}", host))?;
        }
        Ok(())
    }

    /// Copy the config and layers of one single-platform manifest
    async fn copy_blobs(
        &self,
        from: &Endpoint,
        to: &Endpoint,
        raw: &RawManifest,
        copied: &mut HashSet<String>,
    ) -> Result<()> {
        let parsed = Manifest::parse(&raw.data, &raw.media_type)?;
        let (config, layers) = parsed
            .blobs()
            .with_context(|| format!("Nested manifest list {} is not supported", raw.digest))?;
        for digest in config.into_iter().chain(layers) {
            if !copied.insert(digest.clone()) {
                continue;
            }
            if self.has_blob(to, &digest).await {
                debug!("Blob {} already present", digest);
                continue;
            }
            if self.mount_blob(from, to, &digest).await {
                debug!("Mounted blob {}", digest);
                continue;
            }
            debug!("Copying blob {}", digest);
            let blob = self.fetch_blob(from, &digest).await?;
            self.write_blob(to, &digest, &blob).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryClient for OciRegistryClient {
    async fn inspect_manifest(&self, reference: &ImageReference) -> Result<RawManifest> {
        let from = Self::endpoint(reference)?;
        self.read_manifest(&from, reference.digest.as_deref()).await
    }

    async fn inspect_config(&self, reference: &ImageReference) -> Result<Vec<u8>> {
        let from = Self::endpoint(reference)?;
        let raw = self.read_manifest(&from, reference.digest.as_deref()).await?;
        match Manifest::parse(&raw.data, &raw.media_type)?.blobs() {
            Some((Some(config), _)) => {
                let blob = self.fetch_blob(&from, &config).await?;
                tokio::fs::read(&blob.path)
                    .await
                    .with_context(|| format!("Failed to read config of {}", reference))
            }
            Some((None, _)) => bail!("{} has no config blob", reference),
            None => bail!("{} is a manifest list, not an image", reference),
        }
    }

    async fn copy(
        &self,
        source: &ImageReference,
        destination: &ImageReference,
        options: &CopyOptions,
    ) -> Result<()> {
        if options.signing_key.is_some() {
            bail!("Signing is not supported by the built-in registry client");
        }
        let from = Self::endpoint(source)?;
        let to = Self::endpoint(destination)?;

        let raw = self.read_manifest(&from, source.digest.as_deref()).await?;
        if let Some(forced) = &options.force_media_type {
            if forced != &raw.media_type {
                bail!(
                    "{}: converting {} manifests to {} is not supported",
                    source,
                    raw.media_type,
                    forced
                );
            }
        }
        self.authorize_push(&to).await?;

        let parsed = Manifest::parse(&raw.data, &raw.media_type)?;
        let mut copied = HashSet::new();
        if parsed.is_list() {
            for entry in parsed.entries() {
                let child = self.read_manifest(&from, Some(&entry.digest)).await?;
                self.copy_blobs(&from, &to, &child, &mut copied).await?;
                self.write_manifest(&to, &child, true).await?;
            }
        } else {
            self.copy_blobs(&from, &to, &raw, &mut copied).await?;
        }

        let digest = self.write_manifest(&to, &raw, false).await?;
        if options.preserve_digests && digest != raw.digest {
            bail!("{}: destination digest {} differs from source", destination, digest);
        }
        info!("Copied {} to {} ({} blobs)", source, destination, copied.len());
        Ok(())
    }

    async fn push_manifest(
        &self,
        destination: &ImageReference,
        data: &[u8],
        media_type: &str,
    ) -> Result<String> {
        let to = Self::endpoint(destination)?;
        self.authorize_push(&to).await?;
        let raw = RawManifest {
            data: data.to_vec(),
            media_type: media_type.to_string(),
            digest: manifest::digest(data),
        };
        self.write_manifest(&to, &raw, destination.digest.is_some()).await
    }
}
