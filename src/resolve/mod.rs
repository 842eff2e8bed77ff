//! Resolving references into their platform variants.
//!
//! [`Source::resolve`] makes the single manifest fetch for a source image,
//! classifies it and lists its platform candidates; list entries that leave
//! out Windows or ARM platform fields are completed from their image config.
//! [`Destination`] records what a destination already stores so the planner
//! can decide skip-copy without further network calls.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::image::{ImageSpec, Index, Platform};
use crate::manifest::{Descriptor, ImageConfig, Manifest};
use crate::reference::ImageReference;
use crate::registry::{RawManifest, RegistryClient};


/// One transferable variant of a source image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub digest: String,
    pub media_type: String,
    pub size: i64,
    pub platform: Platform,
    pub annotations: BTreeMap<String, String>,
}

impl Candidate {
    fn from_descriptor(entry: &Descriptor, platform: Platform) -> Self {
        Self {
            digest: entry.digest.clone(),
            media_type: entry.media_type.clone(),
            size: entry.size,
            platform,
            annotations: entry.annotations.clone().unwrap_or_default(),
        }
    }

    /// Digest of the platform image this candidate attests to
    pub fn attested_digest(&self) -> Option<&str> {
        self.annotations
            .get(crate::constants::annotation::REFERENCE_DIGEST)
            .map(String::as_str)
    }
}

/// A resolved source image
#[derive(Debug, Clone)]
pub struct Source {
    reference: ImageReference,
    raw: RawManifest,
    manifest: Manifest,
    candidates: Vec<Candidate>,
}

impl Source {
    pub async fn resolve(client: &dyn RegistryClient, reference: ImageReference) -> Result<Self> {
        let raw = client
            .inspect_manifest(&reference)
            .await
            .with_context(|| format!("Failed to inspect {}", reference))?;
        let manifest = Manifest::parse(&raw.data, &raw.media_type)
            .with_context(|| format!("Failed to resolve {}", reference))?;
        debug!("{} resolved to {} ({})", reference, raw.digest, raw.media_type);

        let candidates = match &manifest {
            Manifest::DockerList(list) | Manifest::OciIndex(list) => {
                let mut candidates = Vec::with_capacity(list.manifests.len());
                for entry in &list.manifests {
                    let platform = entry.platform.clone().unwrap_or_default();
                    let config = if entry.attested_digest().is_none()
                        && Platform::needs_backfill(&platform)
                    {
                        Some(Self::config(client, &reference.with_digest(&entry.digest)).await?)
                    } else {
                        None
                    };
                    let platform = Platform::from_entry(&platform, config.as_ref());
                    candidates.push(Candidate::from_descriptor(entry, platform));
                }
                candidates
            }
            Manifest::Schema2(image) | Manifest::OciManifest(image) => {
                let config = Self::config(client, &reference.with_digest(&raw.digest)).await?;
                vec![Candidate {
                    digest: raw.digest.clone(),
                    media_type: raw.media_type.clone(),
                    size: raw.data.len() as i64,
                    platform: Platform::from_config(&config),
                    annotations: image.annotations.clone().unwrap_or_default(),
                }]
            }
            Manifest::Schema1(legacy) => vec![Candidate {
                digest: raw.digest.clone(),
                media_type: raw.media_type.clone(),
                size: raw.data.len() as i64,
                platform: Platform {
                    arch: legacy.architecture.clone(),
                    os: "linux".to_string(),
                    ..Default::default()
                },
                annotations: BTreeMap::new(),
            }],
        };

        Ok(Self {
            reference,
            raw,
            manifest,
            candidates,
        })
    }

    async fn config(client: &dyn RegistryClient, reference: &ImageReference) -> Result<ImageConfig> {
        let raw = client
            .inspect_config(reference)
            .await
            .with_context(|| format!("Failed to fetch config of {}", reference))?;
        ImageConfig::parse(&raw)
    }

    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn raw(&self) -> &RawManifest {
        &self.raw
    }

    pub fn digest(&self) -> &str {
        &self.raw.digest
    }

    /// Platform candidates in manifest order
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn is_list(&self) -> bool {
        self.manifest.is_list()
    }

    pub fn is_schema1(&self) -> bool {
        matches!(self.manifest, Manifest::Schema1(_))
    }
}

/// Where a destination lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A registry repository or an on-disk image
    Reference(ImageReference),
    /// An archive; each platform is first copied into a layout under `staging`
    Archive { staging: PathBuf },
}

/// What a destination already stores
#[derive(Debug, Clone)]
pub struct Destination {
    target: Target,
    manifest: Option<RawManifest>,
    digests: BTreeSet<String>,
    list: Option<BTreeSet<String>>,
    recorded: HashMap<String, ImageSpec>,
}

impl Destination {
    /// Probe `reference`. A destination holding no manifest yet is empty;
    /// any other probe failure, cancellation included, is an error.
    pub async fn resolve(
        client: &dyn RegistryClient,
        reference: ImageReference,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let probed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled.into()),
            probed = client.inspect_manifest(&reference) => probed,
        };

        let mut destination = Self {
            target: Target::Reference(reference),
            manifest: None,
            digests: BTreeSet::new(),
            list: None,
            recorded: HashMap::new(),
        };
        let raw = match probed {
            Ok(raw) => raw,
            Err(err) if matches!(crate::error::kind(&err), Some(Error::ManifestUnknown(_))) => {
                debug!("{} does not exist yet", destination.describe());
                return Ok(destination);
            }
            Err(err) => {
                return Err(err.context(format!("Failed to inspect {}", destination.describe())))
            }
        };

        destination.digests.insert(raw.digest.clone());
        match Manifest::parse(&raw.data, &raw.media_type) {
            Ok(manifest) if manifest.is_list() => {
                let entries: BTreeSet<String> =
                    manifest.entries().iter().map(|e| e.digest.clone()).collect();
                destination.digests.extend(entries.iter().cloned());
                destination.list = Some(entries);
            }
            Ok(_) => {}
            Err(err) => warn!("Ignoring manifest of {}: {:#}", destination.describe(), err),
        }
        destination.manifest = Some(raw);
        Ok(destination)
    }

    /// An archive destination, knowing the digests already in its index
    pub fn archive(index: &Index, staging: PathBuf) -> Self {
        let recorded: HashMap<String, ImageSpec> = index
            .list
            .iter()
            .flat_map(|image| image.images.iter())
            .map(|spec| (spec.manifest.clone(), spec.clone()))
            .collect();
        Self {
            target: Target::Archive { staging },
            manifest: None,
            digests: recorded.keys().cloned().collect(),
            list: None,
            recorded,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn reference(&self) -> Option<&ImageReference> {
        match &self.target {
            Target::Reference(reference) => Some(reference),
            Target::Archive { .. } => None,
        }
    }

    pub fn is_archive(&self) -> bool {
        matches!(self.target, Target::Archive { .. })
    }

    /// Whether the destination is a registry (rather than a local directory
    /// or an archive)
    pub fn is_registry(&self) -> bool {
        matches!(&self.target, Target::Reference(r) if r.kind.is_registry())
    }

    /// Manifest currently stored at the destination, if any
    pub fn manifest(&self) -> Option<&RawManifest> {
        self.manifest.as_ref()
    }

    /// Whether the destination already stores the manifest `digest`
    pub fn have_digest(&self, digest: &str) -> bool {
        self.digests.contains(digest)
    }

    /// The platform entry an archive destination already records for `digest`
    pub fn recorded(&self, digest: &str) -> Option<&ImageSpec> {
        self.recorded.get(digest)
    }

    /// Entry digests when the destination serves a manifest list
    pub fn list_digests(&self) -> Option<&BTreeSet<String>> {
        self.list.as_ref()
    }

    fn describe(&self) -> String {
        match &self.target {
            Target::Reference(reference) => reference.to_string(),
            Target::Archive { staging } => staging.display().to_string(),
        }
    }
}
