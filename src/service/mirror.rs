//! Registry to registry mirroring.

use anyhow::{bail, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::list::ListEntry;
use super::scheduler::RunReport;
use super::RunContext;
use crate::reference::ImageReference;
use crate::resolve::{Destination, Source};

#[derive(Debug, Clone, Default)]
pub struct MirrorOptions {
    /// Registry every source is mirrored into, unless its line names a
    /// destination of its own
    pub registry: Option<String>,
    /// Project replacing the source project
    pub project: Option<String>,
    pub validate: bool,
}

impl MirrorOptions {
    /// Where `source` is mirrored to
    pub fn destination(&self, ctx: &RunContext, entry: &ListEntry, source: &ImageReference) -> Result<ImageReference> {
        if let Some(destination) = &entry.destination {
            return ctx.parse(destination);
        }
        let Some(registry) = &self.registry else {
            bail!("No destination registry for {}", entry.source);
        };
        let mut destination = source.with_registry(registry);
        if let Some(project) = &self.project {
            destination = destination.with_project(project);
        }
        Ok(destination)
    }
}

pub async fn run(ctx: Arc<RunContext>, entries: Vec<ListEntry>, options: MirrorOptions) -> RunReport {
    info!(
        "{} {} image(s) with {} worker(s)",
        if options.validate { "Validating" } else { "Mirroring" },
        entries.len(),
        ctx.scheduler().workers()
    );
    let options = Arc::new(options);
    let scheduler = ctx.scheduler();
    scheduler
        .run(entries, move |entry: ListEntry, token: CancellationToken| {
            let ctx = ctx.clone();
            let options = options.clone();
            async move { mirror_image(&ctx, &options, entry, token).await }
        })
        .await
}

async fn mirror_image(
    ctx: &RunContext,
    options: &MirrorOptions,
    entry: ListEntry,
    token: CancellationToken,
) -> Result<()> {
    let source = ctx.parse(&entry.source)?;
    let destination = options.destination(ctx, &entry, &source)?;

    let source = Source::resolve(ctx.client(), source).await?;
    let destination = Destination::resolve(ctx.client(), destination, &token).await?;

    let planner = ctx.planner();
    let report = if options.validate {
        planner.validate(&source, &destination)?
    } else {
        planner.copy(&source, &destination).await?
    };
    report.check()
}
