//! Error kinds callers need to tell apart.
//!
//! Most fallible code returns `anyhow::Result`; the conditions below are
//! wrapped into that error and recovered with `downcast_ref` where a caller
//! reacts differently (warn and continue, stop the run, skip a retry).

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Part size outside the allowed range.
    #[error("invalid part size {0}: must be 0 or between 1 MiB and 100 GiB")]
    InvalidPartSize(u64),

    /// A split file would need more parts than allowed.
    #[error("{0}: refusing to create more than {1} parts")]
    TooManyParts(String, u64),

    /// Manifest media type the resolver does not understand.
    #[error("unsupported manifest type {0:?}")]
    UnsupportedManifest(String),

    /// The registry or layout holds no manifest for the reference.
    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),

    /// The platform filter left nothing to transfer.
    #[error("no available platform for {0}")]
    NoAvailablePlatform(String),

    /// One or more platforms of an image failed.
    #[error("{image}: {}", .errors.join("; "))]
    Platforms { image: String, errors: Vec<String> },

    /// A run finished with at least one failed image.
    #[error("some images failed")]
    SomeImagesFailed,

    /// The run was cancelled before the item completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The item did not complete within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Archive written by an incompatible version.
    #[error("incompatible archive index version {0:?}")]
    IncompatibleArchive(String),

    /// Archive carries no index entry.
    #[error("archive {0} has no index")]
    MissingIndex(String),
}

impl Error {
    /// Whether the error came from cancellation or a deadline rather than the
    /// image itself.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Timeout(_))
    }
}

/// Returns the typed kind carried by `err`, if any. Kinds raised inside
/// `io::Write` and `io::Read` impls travel as the payload of an `io::Error`.
pub fn kind(err: &anyhow::Error) -> Option<&Error> {
    err.chain().find_map(find)
}

fn find<'a>(cause: &'a (dyn std::error::Error + 'static)) -> Option<&'a Error> {
    if let Some(kind) = cause.downcast_ref::<Error>() {
        return Some(kind);
    }
    let inner = cause.downcast_ref::<std::io::Error>()?.get_ref()?;
    find(inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platforms_error_joins_messages() {
        let err = Error::Platforms {
            image: "docker.io/library/nginx:latest".to_string(),
            errors: vec!["linux/arm64: boom".to_string(), "linux/s390x: bang".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "docker.io/library/nginx:latest: linux/arm64: boom; linux/s390x: bang"
        );
    }

    #[test]
    fn test_kind_downcast() {
        let err: anyhow::Error = Error::NoAvailablePlatform("x".to_string()).into();
        let err = err.context("while copying");
        assert!(matches!(kind(&err), Some(Error::NoAvailablePlatform(_))));
        assert!(Error::Timeout(Duration::from_secs(1)).is_interrupt());
        assert!(!Error::SomeImagesFailed.is_interrupt());
    }

    #[test]
    fn test_kind_inside_io_error() {
        let io = std::io::Error::other(Error::TooManyParts("images.tar".to_string(), 4));
        let err = anyhow::Error::new(io).context("Failed to append");
        assert!(matches!(kind(&err), Some(Error::TooManyParts(_, 4))));

        let plain = anyhow::Error::new(std::io::Error::other("disk full"));
        assert!(kind(&plain).is_none());
    }
}
