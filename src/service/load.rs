//! Loading archived images into a registry.
//!
//! Every indexed image is pushed to the destination registry under its
//! original repository path, with the registry (and optionally the project)
//! replaced. Platforms the destination already stores are skipped. For a
//! multi-platform image each platform is pushed by digest and a manifest
//! list of the recorded platforms is pushed to the tag.

use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::list::ListEntry;
use super::platform::select;
use super::scheduler::{Job, RunReport};
use super::RunContext;
use crate::archive::{image_entry, ArchiveReader};
use crate::constants::media_type;
use crate::error::Error;
use crate::image::{Image, ImageSpec};
use crate::manifest::{self, Descriptor, ManifestList};
use crate::reference::{ImageReference, Kind};
use crate::registry::CopyOptions;
use crate::resolve::Destination;

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub archive: PathBuf,
    /// Registry the images are loaded into
    pub registry: String,
    /// Project replacing the recorded one
    pub project: Option<String>,
    pub validate: bool,
}

impl LoadOptions {
    /// Tag reference `image` is loaded to. An image recorded without a tag
    /// stays pinned to its source digest.
    pub fn destination(&self, image: &Image) -> Result<ImageReference> {
        let source = ImageReference::parse(&image.source)
            .with_context(|| format!("Invalid source {} in archive index", image.source))?;
        let mut destination = source.with_registry(&self.registry);
        if let Some(project) = &self.project {
            destination = destination.with_project(project);
        }
        if !image.tag.is_empty() {
            destination.tag = Some(image.tag.clone());
            destination.digest = None;
        }
        Ok(destination)
    }
}

/// One archived image, or a listed name the archive does not hold
struct LoadJob {
    name: String,
    image: Option<Image>,
}

impl Job for LoadJob {
    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Pick the indexed images to load, in list order when a list is given
fn jobs(indexed: Vec<Image>, entries: Option<Vec<ListEntry>>) -> Vec<LoadJob> {
    let Some(entries) = entries else {
        return indexed
            .into_iter()
            .map(|image| LoadJob {
                name: image.source.clone(),
                image: Some(image),
            })
            .collect();
    };

    let mut by_source: BTreeMap<String, Vec<Image>> = BTreeMap::new();
    for image in indexed {
        by_source.entry(image.source.clone()).or_default().push(image);
    }
    let mut jobs = Vec::new();
    for entry in entries {
        let key = ImageReference::parse(&entry.source)
            .map(|r| r.to_string())
            .unwrap_or_else(|_| entry.source.clone());
        match by_source.remove(&key) {
            Some(images) => jobs.extend(images.into_iter().map(|image| LoadJob {
                name: entry.source.clone(),
                image: Some(image),
            })),
            None => jobs.push(LoadJob {
                name: entry.source.clone(),
                image: None,
            }),
        }
    }
    jobs
}

pub async fn run(
    ctx: Arc<RunContext>,
    entries: Option<Vec<ListEntry>>,
    options: LoadOptions,
) -> Result<RunReport> {
    let path = options.archive.clone();
    let (reader, index) = tokio::task::spawn_blocking(move || -> Result<_> {
        let reader = ArchiveReader::open(&path)?;
        let index = reader.read_index()?;
        Ok((reader, index))
    })
    .await??;
    let jobs = jobs(index.list, entries);
    info!(
        "{} {} image(s) from {} to {}",
        if options.validate { "Validating" } else { "Loading" },
        jobs.len(),
        options.archive.display(),
        options.registry
    );

    let reader = Arc::new(reader);
    let options = Arc::new(options);
    let scheduler = ctx.scheduler();
    Ok(scheduler
        .run(jobs, move |job: LoadJob, token: CancellationToken| {
            let ctx = ctx.clone();
            let reader = reader.clone();
            let options = options.clone();
            async move {
                let Some(image) = job.image else {
                    bail!("{} is not in archive {}", job.name, options.archive.display());
                };
                load_image(&ctx, reader, &options, image, token).await
            }
        })
        .await)
}

async fn load_image(
    ctx: &RunContext,
    reader: Arc<ArchiveReader>,
    options: &LoadOptions,
    image: Image,
    token: CancellationToken,
) -> Result<()> {
    let target = options.destination(&image)?;
    let destination = Destination::resolve(ctx.client(), target.clone(), &token).await?;

    let selected = select(&image.images, ctx.filter());
    if selected.is_empty() {
        return Err(Error::NoAvailablePlatform(image.source.clone()).into());
    }

    let mut errors = Vec::new();
    if options.validate {
        for spec in selected {
            if !destination.have_digest(&spec.manifest) {
                errors.push(format!("{}: {} missing", spec.platform(), spec.manifest));
            }
        }
        return check(&image, errors);
    }

    // a single-platform image goes straight to the tag
    let single = image.images.len() == 1 && target.tag_name().is_some();
    let mut recorded = Vec::new();
    for spec in selected {
        if ctx.signing_key().is_none() && destination.have_digest(&spec.manifest) {
            debug!("{} {}: already present, skipping", target, spec.platform());
            recorded.push(spec.clone());
            continue;
        }
        let to = if single {
            target.clone()
        } else {
            target.with_digest(&spec.manifest)
        };
        match load_platform(ctx, reader.clone(), spec, &to).await {
            Ok(()) => recorded.push(spec.clone()),
            Err(err) => errors.push(format!("{}: {:#}", spec.platform(), err)),
        }
    }

    if errors.is_empty() && image.images.len() > 1 {
        push_list(ctx, &target, &destination, &recorded).await?;
    }
    info!("{}: {} platform(s) loaded to {}", image.source, recorded.len(), target);
    check(&image, errors)
}

fn check(image: &Image, errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    Err(Error::Platforms {
        image: image.source.clone(),
        errors,
    }
    .into())
}

/// Extract one platform layout and copy it to `to`
async fn load_platform(
    ctx: &RunContext,
    reader: Arc<ArchiveReader>,
    spec: &ImageSpec,
    to: &ImageReference,
) -> Result<()> {
    let name = image_entry(&spec.manifest);
    let (_dir, layout) = tokio::task::spawn_blocking(move || reader.decompress_file_tmp(&name)).await??;
    let from = ImageReference::local(Kind::OciLayout, &layout)?.with_digest(&spec.manifest);
    let options = CopyOptions {
        signing_key: ctx.signing_key().map(|key| key.to_path_buf()),
        ..CopyOptions::preserving()
    };
    debug!("Copying {} to {}", from, to);
    ctx.client().copy(&from, to, &options).await
}

/// Point the tag at a list of every loaded platform, or push the list by
/// digest when the image has no tag
async fn push_list(
    ctx: &RunContext,
    target: &ImageReference,
    destination: &Destination,
    recorded: &[ImageSpec],
) -> Result<()> {
    let digests: BTreeSet<String> = recorded.iter().map(|s| s.manifest.clone()).collect();
    if destination.list_digests() == Some(&digests) {
        debug!("{} already serves the same platforms", target);
        return Ok(());
    }

    let mut manifests = Vec::with_capacity(recorded.len());
    for spec in recorded {
        let stored = ctx
            .client()
            .inspect_manifest(&target.with_digest(&spec.manifest))
            .await
            .with_context(|| format!("Failed to inspect {}@{}", target, spec.manifest))?;
        manifests.push(Descriptor {
            media_type: stored.media_type,
            digest: spec.manifest.clone(),
            size: stored.data.len() as i64,
            platform: Some(spec.platform().to_manifest_platform()),
            annotations: (!spec.annotations.is_empty()).then(|| spec.annotations.clone()),
        });
    }

    let list_type = if recorded.iter().any(|s| s.media_type == media_type::OCI_MANIFEST) {
        media_type::OCI_INDEX
    } else {
        media_type::DOCKER_MANIFEST_LIST
    };
    let data = serde_json::to_vec_pretty(&ManifestList::new(list_type, manifests))
        .context("Failed to serialize manifest list")?;
    let to = target
        .tagged()
        .unwrap_or_else(|| target.with_digest(&manifest::digest(&data)));
    let digest = ctx
        .client()
        .push_manifest(&to, &data, list_type)
        .await
        .with_context(|| format!("Failed to push manifest list to {}", to))?;
    info!("Pushed {} platform list {} to {}", recorded.len(), digest, to);
    Ok(())
}
