//! Adding images to an existing archive.
//!
//! Platforms already recorded in the archive index are skipped; everything
//! else is copied and appended exactly like [`super::save`].

use anyhow::Result;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;

use super::list::ListEntry;
use super::save::{store, validate, ArchiveState, Sink};
use super::scheduler::RunReport;
use super::RunContext;
use crate::archive::ArchiveUpdater;
use crate::part;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub archive: PathBuf,
    /// Largest part file in bytes for the rewritten archive
    pub part_size: u64,
    pub validate: bool,
}

pub async fn run(ctx: Arc<RunContext>, entries: Vec<ListEntry>, options: SyncOptions) -> Result<RunReport> {
    if options.validate {
        return validate(ctx, entries, &options.archive).await;
    }
    part::validate_part_size(options.part_size)?;

    let path = options.archive.clone();
    let part_size = options.part_size;
    let updater = tokio::task::spawn_blocking(move || ArchiveUpdater::open(&path, part_size)).await??;
    let index = updater.index().clone();
    info!(
        "Syncing {} image(s) into {} ({} already indexed)",
        entries.len(),
        options.archive.display(),
        index.list.len()
    );
    let state = Arc::new(Mutex::new(ArchiveState::new(Sink::Updater(updater), index)));
    store(ctx, entries, state).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveReader;
    use crate::config::{Compression, Config};
    use crate::registry::fake::{arch, FakeRegistry};
    use crate::service::save::{self, SaveOptions};
    use tokio_util::sync::CancellationToken;

    fn context(registry: Arc<FakeRegistry>) -> Arc<RunContext> {
        Arc::new(RunContext::new(registry, &Config::default(), CancellationToken::new()).with_workers(2))
    }

    #[tokio::test]
    async fn test_sync_appends_new_images_only() {
        let registry = Arc::new(FakeRegistry::new());
        registry.add_list("nginx:1.25", &[arch("linux", "amd64", ""), arch("linux", "arm64", "")]);
        registry.add_image("library/redis:7", arch("linux", "amd64", ""));
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("images.tar.gz");

        save::run(
            context(registry.clone()),
            vec![ListEntry::new("nginx:1.25")],
            SaveOptions {
                archive: archive.clone(),
                part_size: 0,
                compression: Compression::Gzip,
                validate: false,
            },
        )
        .await
        .unwrap();
        let copies = registry.copies().len();

        let report = run(
            context(registry.clone()),
            vec![ListEntry::new("nginx:1.25"), ListEntry::new("redis:7")],
            SyncOptions {
                archive: archive.clone(),
                part_size: 0,
                validate: false,
            },
        )
        .await
        .unwrap();
        assert!(report.is_success());
        // nginx platforms were already indexed
        assert_eq!(registry.copies().len(), copies + 1);

        let reader = ArchiveReader::open(&archive).unwrap();
        assert_eq!(reader.compression().unwrap(), Compression::Gzip);
        let index = reader.read_index().unwrap();
        assert_eq!(index.list.len(), 2);
        let nginx = index
            .list
            .iter()
            .find(|i| i.source == "docker.io/library/nginx:1.25")
            .unwrap();
        assert_eq!(nginx.images.len(), 2);
        let entries = reader.entries().unwrap();
        for image in &index.list {
            for spec in &image.images {
                let name = crate::archive::image_entry(&spec.manifest);
                assert!(entries.iter().any(|e| e.trim_end_matches('/') == name));
            }
        }
    }

    #[tokio::test]
    async fn test_sync_requires_an_archive() {
        let registry = Arc::new(FakeRegistry::new());
        let dir = tempfile::tempdir().unwrap();
        let result = run(
            context(registry),
            vec![ListEntry::new("nginx:1.25")],
            SyncOptions {
                archive: dir.path().join("missing.tar"),
                part_size: 0,
                validate: false,
            },
        )
        .await;
        assert!(result.is_err());
    }
}
