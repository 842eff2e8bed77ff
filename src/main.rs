use anyhow::{Context, Result};
use clap::Parser;
use ferry::{
    archive::{ArchiveReader, ArchiveWriter},
    cli::{ArchiveCommands, Cli, Commands, RunArgs},
    config::Config,
    constants::archive::INDEX_ENTRY,
    image::{FilterSet, Index},
    registry::OciRegistryClient,
    service::{
        list::read_list,
        load::{self, LoadOptions},
        mirror::{self, MirrorOptions},
        save::{self, SaveOptions},
        sync::{self, SyncOptions},
        RunContext, RunReport,
    },
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging to stderr; RUST_LOG wins when set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Mirror {
            run,
            destination,
            project,
        } => {
            let config = Config::load()?;
            let entries = read_list(&run.file)?;
            if destination.is_none() && entries.iter().any(|e| e.destination.is_none()) {
                anyhow::bail!("--destination is required unless every line names its destination");
            }
            let ctx = run_context(&config, &run);
            let options = MirrorOptions {
                registry: destination,
                project,
                validate: run.validate,
            };
            let report = mirror::run(ctx, entries, options).await;
            finish(report, run.failed.as_deref(), "mirror")?;
        }
        Commands::Save {
            run,
            archive,
            compress,
        } => {
            let config = Config::load()?;
            let entries = read_list(&run.file)?;
            let ctx = run_context(&config, &run);
            let options = SaveOptions {
                archive: archive.archive,
                part_size: archive.part_size.unwrap_or(config.archive.part_size),
                compression: compress.map_or(config.archive.compression, Into::into),
                validate: run.validate,
            };
            let report = save::run(ctx, entries, options).await?;
            finish(report, run.failed.as_deref(), "save")?;
        }
        Commands::Sync { run, archive } => {
            let config = Config::load()?;
            let entries = read_list(&run.file)?;
            let ctx = run_context(&config, &run);
            let options = SyncOptions {
                archive: archive.archive,
                part_size: archive.part_size.unwrap_or(config.archive.part_size),
                validate: run.validate,
            };
            let report = sync::run(ctx, entries, options).await?;
            finish(report, run.failed.as_deref(), "sync")?;
        }
        Commands::Load {
            file,
            archive,
            destination,
            project,
            arch,
            os,
            variant,
            jobs,
            failed,
            timeout,
            validate,
        } => {
            let config = Config::load()?;
            let entries = file.as_deref().map(read_list).transpose()?;
            let ctx = context(&config, FilterSet::new(arch, os, variant), jobs, timeout);
            let options = LoadOptions {
                archive,
                registry: destination,
                project,
                validate,
            };
            let report = load::run(ctx, entries, options).await?;
            finish(report, failed.as_deref(), "load")?;
        }
        Commands::Archive {
            command: ArchiveCommands::Ls { archive },
        } => {
            list_archive(&archive)?;
        }
        Commands::Compress {
            directory,
            archive,
            part_size,
            compress,
        } => {
            let config = Config::load()?;
            let part_size = part_size.unwrap_or(config.archive.part_size);
            ferry::part::validate_part_size(part_size)?;
            let compression = compress.map_or(config.archive.compression, Into::into);
            let path = compress_directory(&directory, &archive, part_size, compression)?;
            info!("Packed {} into {}", directory.display(), path.display());
        }
        Commands::Decompress { archive, directory } => {
            ArchiveReader::open(&archive)?.decompress_all(&directory)?;
            info!("Unpacked {} into {}", archive.display(), directory.display());
        }
        Commands::Version => {
            println!("ferry {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn run_context(config: &Config, run: &RunArgs) -> Arc<RunContext> {
    let filter = FilterSet::new(run.arch.clone(), run.os.clone(), run.variant.clone());
    context(config, filter, run.jobs, run.timeout)
}

fn context(
    config: &Config,
    filter: FilterSet,
    jobs: Option<usize>,
    timeout: Option<u64>,
) -> Arc<RunContext> {
    let cancel = CancellationToken::new();
    watch_signals(cancel.clone());

    let client = Arc::new(OciRegistryClient::new(config));
    let mut ctx = RunContext::new(client, config, cancel).with_filter(filter);
    if let Some(jobs) = jobs {
        ctx = ctx.with_workers(jobs);
    }
    if let Some(timeout) = timeout {
        ctx = ctx.with_timeout(Duration::from_secs(timeout));
    }
    Arc::new(ctx)
}

/// First Ctrl-C stops admitting work, the second exits at once
fn watch_signals(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupted, finishing in-flight images (press Ctrl-C again to exit now)");
        cancel.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

/// Summarize the run and persist its failed images
fn finish(report: RunReport, failed: Option<&Path>, operation: &str) -> Result<()> {
    info!(
        "{} image(s): {} succeeded, {} failed, {} without a matching platform",
        report.total,
        report.succeeded.len(),
        report.failed.len(),
        report.unavailable.len()
    );
    if !report.is_success() {
        let path = failed
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(format!("{}-failed.txt", operation)));
        match report.write_failed(&path) {
            Ok(()) => error!("Failed images written to {}", path.display()),
            Err(e) => error!("{:#}", e),
        }
    }
    report.into_result().map(|_| ())
}

fn list_archive(path: &Path) -> Result<()> {
    let index = ArchiveReader::open(path)?.read_index()?;
    println!("# {} ({}, {})", path.display(), index.version, index.created_at.to_rfc3339());
    for image in &index.list {
        println!("{}", image.source);
        for spec in &image.images {
            println!("  {:<24} {:<48} {}", spec.platform().to_string(), spec.media_type, spec.manifest);
        }
    }
    Ok(())
}

fn compress_directory(
    directory: &Path,
    archive: &Path,
    part_size: u64,
    compression: ferry::config::Compression,
) -> Result<PathBuf> {
    let mut entries: Vec<_> = std::fs::read_dir(directory)
        .with_context(|| format!("Failed to read {}", directory.display()))?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut writer = ArchiveWriter::create(archive, part_size, compression)?;
    let mut index = None;
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == INDEX_ENTRY {
            let raw = std::fs::read(entry.path())?;
            index = Some(Index::from_slice(&raw)?);
            continue;
        }
        writer.write(&entry.path(), &name)?;
    }
    if let Some(index) = index {
        writer.write_index(&index)?;
    }
    writer.close()
}

