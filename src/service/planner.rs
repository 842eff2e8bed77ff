//! Per-image transfer decisions.
//!
//! [`TransferPlanner::copy`] walks the selected platforms of one resolved
//! source in manifest order, skips those the destination already stores,
//! copies the rest and records every handled platform. A failed platform
//! does not stop the loop; all failures come back together in the report.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::platform::select;
use crate::constants::media_type;
use crate::error::Error;
use crate::image::{FilterSet, Image, ImageSpec};
use crate::manifest::{self, digest_hex, Manifest, ManifestList};
use crate::reference::{ImageReference, Kind};
use crate::registry::{CopyOptions, RegistryClient};
use crate::resolve::{Candidate, Destination, Source, Target};

/// Outcome of planning one image
#[derive(Debug, Clone, Default)]
pub struct CopyReport {
    /// Every platform handled, copied or skipped, in manifest order
    pub image: Image,
    /// Platforms selected by the filter
    pub processed: usize,
    pub copied: usize,
    pub skipped: usize,
    /// Layout directories written for an archive, keyed by manifest digest
    pub staged: Vec<(String, PathBuf)>,
    /// One message per failed platform
    pub errors: Vec<String>,
}

impl CopyReport {
    fn new(source: &ImageReference) -> Self {
        Self {
            image: Image::new(&source.to_string(), source.tag_name().unwrap_or_default()),
            ..Default::default()
        }
    }

    /// Fail when any platform failed
    pub fn check(&self) -> Result<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(Error::Platforms {
            image: self.image.source.clone(),
            errors: self.errors.clone(),
        }
        .into())
    }
}

pub struct TransferPlanner<'a> {
    client: &'a dyn RegistryClient,
    filter: &'a FilterSet,
    signing_key: Option<&'a Path>,
}

impl<'a> TransferPlanner<'a> {
    pub fn new(
        client: &'a dyn RegistryClient,
        filter: &'a FilterSet,
        signing_key: Option<&'a Path>,
    ) -> Self {
        Self {
            client,
            filter,
            signing_key,
        }
    }

    fn selection<'s>(&self, source: &'s Source) -> Result<Vec<&'s Candidate>> {
        let selected = select(source.candidates(), self.filter);
        if selected.is_empty() {
            return Err(Error::NoAvailablePlatform(source.reference().to_string()).into());
        }
        Ok(selected)
    }

    fn spec(candidate: &Candidate) -> ImageSpec {
        let mut spec = ImageSpec::new(&candidate.platform, &candidate.media_type, &candidate.digest);
        spec.annotations = candidate.annotations.clone();
        spec
    }

    /// Copy the selected platforms of `source` to `destination`.
    ///
    /// Returns an error only when nothing could be attempted (no platform
    /// selected) or the final manifest list could not be pushed. Platform
    /// failures are collected in the report.
    pub async fn copy(&self, source: &Source, destination: &Destination) -> Result<CopyReport> {
        let selected = self.selection(source)?;
        let mut report = CopyReport::new(source.reference());
        report.processed = selected.len();

        for candidate in selected {
            let platform = &candidate.platform;
            if self.signing_key.is_none() && destination.have_digest(&candidate.digest) {
                debug!(
                    "{} {}: {} already present, skipping",
                    source.reference(),
                    platform,
                    candidate.digest
                );
                let spec = destination
                    .recorded(&candidate.digest)
                    .cloned()
                    .unwrap_or_else(|| Self::spec(candidate));
                report.image.push(spec);
                report.skipped += 1;
                continue;
            }

            match self.copy_platform(source, destination, candidate).await {
                Ok((spec, staged)) => {
                    if let Some(path) = staged {
                        report.staged.push((spec.manifest.clone(), path));
                    }
                    report.image.push(spec);
                    report.copied += 1;
                }
                Err(err) => {
                    report.errors.push(format!("{}: {:#}", platform, err));
                }
            }
        }

        if report.errors.is_empty() && source.is_list() && destination.is_registry() {
            self.push_list(source, destination, &report.image).await?;
        }

        info!(
            "{}: {} copied, {} skipped, {} failed",
            source.reference(),
            report.copied,
            report.skipped,
            report.errors.len()
        );
        Ok(report)
    }

    /// Where one platform lands
    fn platform_destination(
        source: &Source,
        destination: &Destination,
        candidate: &Candidate,
    ) -> Result<ImageReference> {
        match destination.target() {
            Target::Reference(reference) if source.is_list() => {
                Ok(reference.with_digest(&candidate.digest))
            }
            Target::Reference(reference) => Ok(reference.clone()),
            Target::Archive { staging } => ImageReference::local(
                Kind::OciLayout,
                staging.join(digest_hex(&candidate.digest)),
            ),
        }
    }

    async fn copy_platform(
        &self,
        source: &Source,
        destination: &Destination,
        candidate: &Candidate,
    ) -> Result<(ImageSpec, Option<PathBuf>)> {
        let from = if source.is_list() {
            source.reference().with_digest(&candidate.digest)
        } else {
            source.reference().clone()
        };
        let to = Self::platform_destination(source, destination, candidate)?;
        let legacy = source.is_schema1();
        let options = CopyOptions {
            preserve_digests: !legacy,
            force_media_type: legacy.then(|| media_type::DOCKER_MANIFEST.to_string()),
            signing_key: self.signing_key.map(Path::to_path_buf),
        };

        debug!("Copying {} to {}", from, to);
        self.client.copy(&from, &to, &options).await?;

        let mut spec = Self::spec(candidate);
        let local = to.kind.is_local();
        if legacy || local {
            let stored = self
                .client
                .inspect_manifest(&to)
                .await
                .with_context(|| format!("Failed to inspect {} after copy", to))?;
            if legacy {
                // conversion gives the destination a digest of its own
                spec.manifest = stored.digest.clone();
                spec.media_type = stored.media_type.clone();
            }
            if local {
                let parsed = Manifest::parse(&stored.data, &stored.media_type)?;
                if let Some((config, layers)) = parsed.blobs() {
                    spec.config = config.unwrap_or_default();
                    spec.layers = layers;
                }
            }
        }

        let staged = match (destination.target(), &to.directory) {
            (Target::Archive { .. }, Some(path)) => Some(path.clone()),
            _ => None,
        };
        Ok((spec, staged))
    }

    /// Point the destination tag at a list of every recorded platform. A
    /// digest-only destination gets the list by its own digest instead.
    async fn push_list(&self, source: &Source, destination: &Destination, image: &Image) -> Result<()> {
        let Some(reference) = destination.reference() else {
            return Ok(());
        };
        let recorded: BTreeSet<String> = image.images.iter().map(|s| s.manifest.clone()).collect();
        if destination.list_digests() == Some(&recorded) {
            debug!("{} already serves the same platforms", reference);
            return Ok(());
        }

        let entries = source.manifest().entries();
        let complete = entries.len() == recorded.len()
            && entries.iter().all(|e| recorded.contains(&e.digest));
        let (data, list_type) = if complete {
            (source.raw().data.clone(), source.raw().media_type.clone())
        } else {
            let manifests = image
                .images
                .iter()
                .filter_map(|spec| entries.iter().find(|e| e.digest == spec.manifest))
                .cloned()
                .collect();
            let list_type = source.manifest().media_type();
            let list = ManifestList::new(list_type, manifests);
            (
                serde_json::to_vec_pretty(&list).context("Failed to serialize manifest list")?,
                list_type.to_string(),
            )
        };

        let target = reference
            .tagged()
            .unwrap_or_else(|| reference.with_digest(&manifest::digest(&data)));
        let digest = self
            .client
            .push_manifest(&target, &data, &list_type)
            .await
            .with_context(|| format!("Failed to push manifest list to {}", target))?;
        info!("Pushed {} platform list {} to {}", recorded.len(), digest, target);
        Ok(())
    }

    /// Check that the destination stores every selected platform, without
    /// copying anything
    pub fn validate(&self, source: &Source, destination: &Destination) -> Result<CopyReport> {
        let selected = self.selection(source)?;
        let mut report = CopyReport::new(source.reference());
        report.processed = selected.len();

        for candidate in selected {
            // converted schema1 images cannot be matched by digest
            let present = if source.is_schema1() {
                destination.manifest().is_some()
            } else {
                destination.have_digest(&candidate.digest)
            };
            if present {
                report.image.push(Self::spec(candidate));
                report.skipped += 1;
            } else {
                report
                    .errors
                    .push(format!("{}: {} missing", candidate.platform, candidate.digest));
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Index;
    use crate::registry::fake::{arch, FakeRegistry};
    use tokio_util::sync::CancellationToken;

    const SOURCE: &str = "docker.io/library/nginx:1.25";
    const MIRROR: &str = "harbor.local/library/nginx:1.25";

    async fn resolve(registry: &FakeRegistry, source: &str, destination: &str) -> (Source, Destination) {
        let source = Source::resolve(registry, ImageReference::parse(source).unwrap())
            .await
            .unwrap();
        let destination = Destination::resolve(
            registry,
            ImageReference::parse(destination).unwrap(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        (source, destination)
    }

    #[tokio::test]
    async fn test_second_copy_skips_everything() {
        let registry = FakeRegistry::new();
        registry.add_list(SOURCE, &[arch("linux", "amd64", ""), arch("linux", "arm64", "")]);
        let filter = FilterSet::default();
        let planner = TransferPlanner::new(&registry, &filter, None);

        let (source, destination) = resolve(&registry, SOURCE, MIRROR).await;
        let first = planner.copy(&source, &destination).await.unwrap();
        assert_eq!(first.copied, 2);
        assert_eq!(registry.copies().len(), 2);
        assert_eq!(registry.pushes(), vec![MIRROR.to_string()]);
        // the complete list keeps its digest
        assert_eq!(registry.get(MIRROR).digest, source.digest());

        let (source, destination) = resolve(&registry, SOURCE, MIRROR).await;
        let second = planner.copy(&source, &destination).await.unwrap();
        assert_eq!(second.skipped, 2);
        assert_eq!(second.copied, 0);
        assert_eq!(registry.copies().len(), 2);
        assert_eq!(registry.pushes().len(), 1);
        assert_eq!(second.image, first.image);
    }

    #[tokio::test]
    async fn test_signing_key_disables_skip() {
        let registry = FakeRegistry::new();
        registry.add_image(SOURCE, arch("linux", "amd64", ""));
        let filter = FilterSet::default();
        let (source, destination) = resolve(&registry, SOURCE, MIRROR).await;
        TransferPlanner::new(&registry, &filter, None)
            .copy(&source, &destination)
            .await
            .unwrap();

        let (source, destination) = resolve(&registry, SOURCE, MIRROR).await;
        let key = PathBuf::from("cosign.key");
        let report = TransferPlanner::new(&registry, &filter, Some(key.as_path()))
            .copy(&source, &destination)
            .await
            .unwrap();
        assert_eq!(report.copied, 1);
        assert_eq!(registry.copies().len(), 2);
    }

    #[tokio::test]
    async fn test_partial_platform_failure() {
        let registry = FakeRegistry::new();
        let digests = registry.add_list(
            SOURCE,
            &[
                arch("linux", "amd64", ""),
                arch("linux", "arm64", ""),
                arch("linux", "s390x", ""),
            ],
        );
        registry.fail_copy(&digests[1]);
        let filter = FilterSet::default();
        let (source, destination) = resolve(&registry, SOURCE, MIRROR).await;

        let report = TransferPlanner::new(&registry, &filter, None)
            .copy(&source, &destination)
            .await
            .unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.copied, 2);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("linux/arm64"));
        let recorded: Vec<_> = report.image.images.iter().map(|s| s.manifest.clone()).collect();
        assert_eq!(recorded, vec![digests[0].clone(), digests[2].clone()]);
        // no list is pushed for a partially copied image
        assert!(registry.pushes().is_empty());

        let err = report.check().unwrap_err();
        match crate::error::kind(&err) {
            Some(Error::Platforms { errors, .. }) => assert!(errors[0].contains("linux/arm64")),
            other => panic!("unexpected error kind: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_filtered_list_gets_a_new_list() {
        let registry = FakeRegistry::new();
        let digests = registry.add_list(
            SOURCE,
            &[arch("linux", "amd64", ""), arch("windows", "amd64", "")],
        );
        let filter = FilterSet::new(vec![], vec!["linux"], vec![]);
        let (source, destination) = resolve(&registry, SOURCE, MIRROR).await;

        let report = TransferPlanner::new(&registry, &filter, None)
            .copy(&source, &destination)
            .await
            .unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.image.os_list, vec!["linux"]);

        let pushed = registry.get(MIRROR);
        assert_ne!(pushed.digest, source.digest());
        let list = Manifest::parse(&pushed.data, &pushed.media_type).unwrap();
        assert_eq!(list.entries().len(), 1);
        assert_eq!(list.entries()[0].digest, digests[0]);
    }

    #[tokio::test]
    async fn test_nothing_selected() {
        let registry = FakeRegistry::new();
        registry.add_image(SOURCE, arch("linux", "amd64", ""));
        let filter = FilterSet::new(vec![], vec!["windows"], vec![]);
        let (source, destination) = resolve(&registry, SOURCE, MIRROR).await;

        let err = TransferPlanner::new(&registry, &filter, None)
            .copy(&source, &destination)
            .await
            .unwrap_err();
        assert!(matches!(
            crate::error::kind(&err),
            Some(Error::NoAvailablePlatform(_))
        ));
        assert!(registry.copies().is_empty());
    }

    #[tokio::test]
    async fn test_schema1_reinspects_destination() {
        let registry = FakeRegistry::new();
        let original = registry.add_schema1("legacy/app:v1", "amd64");
        let filter = FilterSet::default();
        let (source, destination) =
            resolve(&registry, "legacy/app:v1", "harbor.local/legacy/app:v1").await;
        let before = registry.inspections();

        let report = TransferPlanner::new(&registry, &filter, None)
            .copy(&source, &destination)
            .await
            .unwrap();
        assert!(registry.inspections() > before);
        let recorded = &report.image.images[0];
        assert_ne!(recorded.manifest, original);
        assert_eq!(
            recorded.manifest,
            registry.get("harbor.local/legacy/app:v1").digest
        );
        assert_eq!(recorded.media_type, media_type::DOCKER_MANIFEST);
    }

    #[tokio::test]
    async fn test_archive_destination_stages_layouts() {
        let registry = FakeRegistry::new();
        let digests = registry.add_list(SOURCE, &[arch("linux", "arm", "v7")]);
        let staging = tempfile::tempdir().unwrap();
        let filter = FilterSet::default();
        let source = Source::resolve(&registry, ImageReference::parse(SOURCE).unwrap())
            .await
            .unwrap();
        let destination = Destination::archive(&Index::new(), staging.path().to_path_buf());

        let report = TransferPlanner::new(&registry, &filter, None)
            .copy(&source, &destination)
            .await
            .unwrap();
        assert_eq!(report.staged.len(), 1);
        let (digest, path) = &report.staged[0];
        assert_eq!(digest, &digests[0]);
        assert!(path.join("index.json").exists());

        let spec = &report.image.images[0];
        assert_eq!(spec.variant, "v7");
        assert!(spec.config.starts_with("sha256:"));
        assert_eq!(spec.layers.len(), 1);
        assert!(registry.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_validate_reports_missing_platforms() {
        let registry = FakeRegistry::new();
        let digests = registry.add_list(SOURCE, &[arch("linux", "amd64", ""), arch("linux", "arm64", "")]);
        registry.add_index(MIRROR, media_type::DOCKER_MANIFEST_LIST, &[arch("linux", "amd64", "")], false);
        let filter = FilterSet::default();
        let (source, destination) = resolve(&registry, SOURCE, MIRROR).await;

        let report = TransferPlanner::new(&registry, &filter, None)
            .validate(&source, &destination)
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains(&digests[1]));
        assert!(registry.copies().is_empty());
    }
}
