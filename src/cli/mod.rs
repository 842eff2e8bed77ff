use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Compression;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Flags shared by every transfer command
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Image list file, one image per line
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    pub file: PathBuf,

    /// Architectures to copy (e.g., amd64,arm64); all when empty
    #[arg(long, value_delimiter = ',')]
    pub arch: Vec<String>,

    /// Operating systems to copy (e.g., linux,windows); all when empty
    #[arg(long, value_delimiter = ',')]
    pub os: Vec<String>,

    /// Variants to copy (e.g., v7,v8); all when empty
    #[arg(long, value_delimiter = ',')]
    pub variant: Vec<String>,

    /// Number of images handled concurrently (1-20)
    #[arg(short = 'j', long = "jobs", env = "FERRY_JOBS")]
    pub jobs: Option<usize>,

    /// File receiving the images that failed, for a later re-run
    #[arg(long, value_name = "FILE")]
    pub failed: Option<PathBuf>,

    /// Per-image timeout in seconds; 0 disables it
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Only check that the images are already present
    #[arg(long)]
    pub validate: bool,
}

/// Flags of commands that write an archive
#[derive(Args, Debug, Clone)]
pub struct ArchiveArgs {
    /// Archive file
    #[arg(short = 'd', long = "archive", value_name = "FILE", env = "FERRY_ARCHIVE")]
    pub archive: PathBuf,

    /// Split the archive into parts of at most this many bytes; 0 disables
    #[arg(long, value_name = "BYTES")]
    pub part_size: Option<u64>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Copy images from their registries into another registry
    Mirror {
        #[command(flatten)]
        run: RunArgs,

        /// Registry the images are mirrored into
        #[arg(long, env = "FERRY_DESTINATION")]
        destination: Option<String>,

        /// Project replacing the source project at the destination
        #[arg(long)]
        project: Option<String>,
    },

    /// Save images from their registries into a new archive
    Save {
        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        archive: ArchiveArgs,

        /// Compress the archive
        #[arg(long, value_enum)]
        compress: Option<CompressArg>,
    },

    /// Load images from an archive into a registry
    Load {
        /// Image list limiting what is loaded; everything when omitted
        #[arg(short = 'f', long = "file", value_name = "FILE")]
        file: Option<PathBuf>,

        /// Archive file
        #[arg(short = 'd', long = "archive", value_name = "FILE", env = "FERRY_ARCHIVE")]
        archive: PathBuf,

        /// Registry the images are loaded into
        #[arg(long, env = "FERRY_DESTINATION")]
        destination: String,

        /// Project replacing the recorded project
        #[arg(long)]
        project: Option<String>,

        #[arg(long, value_delimiter = ',')]
        arch: Vec<String>,

        #[arg(long, value_delimiter = ',')]
        os: Vec<String>,

        #[arg(long, value_delimiter = ',')]
        variant: Vec<String>,

        #[arg(short = 'j', long = "jobs", env = "FERRY_JOBS")]
        jobs: Option<usize>,

        #[arg(long, value_name = "FILE")]
        failed: Option<PathBuf>,

        #[arg(long, value_name = "SECONDS")]
        timeout: Option<u64>,

        /// Only check that the images are already present
        #[arg(long)]
        validate: bool,
    },

    /// Add images to an existing archive
    Sync {
        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        archive: ArchiveArgs,
    },

    /// Inspect archives
    Archive {
        #[command(subcommand)]
        command: ArchiveCommands,
    },

    /// Pack a directory into an archive
    Compress {
        /// Directory to pack; an index.json at its root becomes the index
        directory: PathBuf,

        /// Archive file to create
        archive: PathBuf,

        #[arg(long)]
        part_size: Option<u64>,

        #[arg(long, value_enum)]
        compress: Option<CompressArg>,
    },

    /// Unpack every entry of an archive into a directory
    Decompress {
        archive: PathBuf,

        directory: PathBuf,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
pub enum ArchiveCommands {
    /// List the images recorded in an archive
    Ls {
        archive: PathBuf,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressArg {
    None,
    Gzip,
}

impl From<CompressArg> for Compression {
    fn from(arg: CompressArg) -> Self {
        match arg {
            CompressArg::None => Compression::None,
            CompressArg::Gzip => Compression::Gzip,
        }
    }
}
