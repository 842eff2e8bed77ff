//! Saving images from registries into an archive.
//!
//! Each job copies its platforms into OCI layouts under a private staging
//! directory, then appends them to the archive and records the image in the
//! index. Appending and indexing happen together under one lock; the
//! archive stream cannot take concurrent writers. [`super::sync`] runs the
//! same flow against an existing archive.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::list::ListEntry;
use super::scheduler::RunReport;
use super::RunContext;
use crate::archive::{image_entry, ArchiveReader, ArchiveUpdater, ArchiveWriter};
use crate::config::Compression;
use crate::image::{Image, Index};
use crate::part;
use crate::resolve::{Destination, Source};

#[derive(Debug, Clone)]
pub struct SaveOptions {
    pub archive: PathBuf,
    /// Largest part file in bytes; 0 keeps the archive in one file
    pub part_size: u64,
    pub compression: Compression,
    pub validate: bool,
}

/// Where appended entries go
pub(super) enum Sink {
    Writer(ArchiveWriter),
    Updater(ArchiveUpdater),
}

impl Sink {
    fn append(&mut self, source: &Path, name: &str) -> Result<()> {
        match self {
            Sink::Writer(writer) => writer.write(source, name),
            Sink::Updater(updater) => updater.append(source, name),
        }
    }

    fn close(self, mut index: Index) -> Result<PathBuf> {
        match self {
            Sink::Writer(mut writer) => {
                index.touch();
                writer.write_index(&index)?;
                writer.close()
            }
            Sink::Updater(mut updater) => {
                updater.update_index(index);
                updater.close()
            }
        }
    }
}

/// The open archive and its index, guarded together
pub(super) struct ArchiveState {
    sink: Option<Sink>,
    index: Index,
}

impl ArchiveState {
    pub(super) fn new(sink: Sink, index: Index) -> Self {
        Self {
            sink: Some(sink),
            index,
        }
    }

    /// Append staged platform layouts and record `image`
    fn record(&mut self, staged: &[(String, PathBuf)], image: Image) -> Result<()> {
        let sink = self.sink.as_mut().context("Archive already closed")?;
        for (digest, path) in staged {
            if self.index.has_digest(digest) {
                continue;
            }
            sink.append(path, &image_entry(digest))?;
        }
        if !self.index.append(image) {
            debug!("Nothing new to index");
        }
        Ok(())
    }

    fn close(&mut self) -> Result<PathBuf> {
        let sink = self.sink.take().context("Archive already closed")?;
        sink.close(std::mem::take(&mut self.index))
    }
}

type SharedState = Arc<Mutex<ArchiveState>>;

fn lock(state: &Mutex<ArchiveState>) -> Result<std::sync::MutexGuard<'_, ArchiveState>> {
    state.lock().map_err(|_| anyhow!("Archive state poisoned by a failed writer"))
}

pub async fn run(ctx: Arc<RunContext>, entries: Vec<ListEntry>, options: SaveOptions) -> Result<RunReport> {
    if options.validate {
        return validate(ctx, entries, &options.archive).await;
    }
    part::validate_part_size(options.part_size)?;

    let path = options.archive.clone();
    let writer = tokio::task::spawn_blocking(move || {
        ArchiveWriter::create(&path, options.part_size, options.compression)
    })
    .await??;
    info!("Saving {} image(s) to {}", entries.len(), options.archive.display());
    let state = Arc::new(Mutex::new(ArchiveState::new(Sink::Writer(writer), Index::new())));
    store(ctx, entries, state).await
}

/// Copy every image into the archive behind `state`, then close it
pub(super) async fn store(ctx: Arc<RunContext>, entries: Vec<ListEntry>, state: SharedState) -> Result<RunReport> {
    let staging = Arc::new(
        tempfile::Builder::new()
            .prefix("ferry-staging-")
            .tempdir()
            .context("Failed to create staging directory")?,
    );

    let scheduler = ctx.scheduler();
    let shared = state.clone();
    let report = scheduler
        .run(entries, move |entry: ListEntry, _token: CancellationToken| {
            let ctx = ctx.clone();
            let state = shared.clone();
            let staging = staging.clone();
            async move { save_image(&ctx, state, &staging, entry).await }
        })
        .await;

    let path = tokio::task::spawn_blocking(move || lock(&state)?.close()).await??;
    info!("Archive {} closed", path.display());
    Ok(report)
}

async fn save_image(ctx: &RunContext, state: SharedState, staging: &TempDir, entry: ListEntry) -> Result<()> {
    let source = Source::resolve(ctx.client(), ctx.parse(&entry.source)?).await?;
    let work = staging.path().join(sha256::digest(entry.source.as_str()));
    let destination = {
        let state = lock(&state)?;
        Destination::archive(&state.index, work.clone())
    };

    let report = ctx.planner().copy(&source, &destination).await?;
    let staged = report.staged.clone();
    let image = report.image.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let result = lock(&state)?.record(&staged, image);
        if work.exists() {
            std::fs::remove_dir_all(&work)
                .with_context(|| format!("Failed to clean up {}", work.display()))?;
        }
        result
    })
    .await??;
    report.check()
}

/// Check that every selected platform is already in the archive
pub(super) async fn validate(ctx: Arc<RunContext>, entries: Vec<ListEntry>, archive: &Path) -> Result<RunReport> {
    let path = archive.to_path_buf();
    let index = tokio::task::spawn_blocking(move || ArchiveReader::open(&path)?.read_index()).await??;
    info!(
        "Validating {} image(s) against {} ({} indexed)",
        entries.len(),
        archive.display(),
        index.list.len()
    );
    let destination = Arc::new(Destination::archive(&index, std::env::temp_dir()));

    let scheduler = ctx.scheduler();
    Ok(scheduler
        .run(entries, move |entry: ListEntry, _token: CancellationToken| {
            let ctx = ctx.clone();
            let destination = destination.clone();
            async move {
                let source = Source::resolve(ctx.client(), ctx.parse(&entry.source)?).await?;
                ctx.planner().validate(&source, &destination)?.check()
            }
        })
        .await)
}
