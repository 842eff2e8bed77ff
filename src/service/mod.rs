//! Service layer: the operations behind each subcommand.
//!
//! Every operation reads an image list, hands one job per image to the
//! [`scheduler::Scheduler`] and returns the run's [`scheduler::RunReport`].
//! Per-image work goes through [`planner::TransferPlanner`]; everything a job
//! needs comes from one [`RunContext`] built per run.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::image::FilterSet;
use crate::reference::ImageReference;
use crate::registry::RegistryClient;

pub mod list;
pub mod load;
pub mod mirror;
pub mod planner;
pub mod platform;
pub mod save;
pub mod scheduler;
pub mod sync;

pub use list::ListEntry;
pub use planner::{CopyReport, TransferPlanner};
pub use scheduler::{RunReport, Scheduler};

/// Shared state of one run
pub struct RunContext {
    client: Arc<dyn RegistryClient>,
    filter: FilterSet,
    signing_key: Option<PathBuf>,
    cancel: CancellationToken,
    workers: usize,
    timeout: Option<Duration>,
    default_registry: String,
    default_project: String,
}

impl RunContext {
    pub fn new(client: Arc<dyn RegistryClient>, config: &Config, cancel: CancellationToken) -> Self {
        Self {
            client,
            filter: FilterSet::default(),
            signing_key: None,
            cancel,
            workers: config.workers(),
            timeout: config.timeout(),
            default_registry: config.default_registry.clone(),
            default_project: config.default_project.clone(),
        }
    }

    pub fn with_filter(mut self, filter: FilterSet) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// A zero duration disables the per-image deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Signing key forwarded to every copy; disables skip-copy
    pub fn with_signing_key(mut self, key: Option<PathBuf>) -> Self {
        self.signing_key = key;
        self
    }

    pub fn client(&self) -> &dyn RegistryClient {
        self.client.as_ref()
    }

    pub fn filter(&self) -> &FilterSet {
        &self.filter
    }

    pub fn signing_key(&self) -> Option<&Path> {
        self.signing_key.as_deref()
    }

    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.workers, self.timeout, self.cancel.clone())
    }

    pub fn planner(&self) -> TransferPlanner<'_> {
        TransferPlanner::new(self.client(), &self.filter, self.signing_key())
    }

    /// Parse a reference with the configured registry and project defaults
    pub fn parse(&self, reference: &str) -> Result<ImageReference> {
        ImageReference::parse_with_defaults(reference, &self.default_registry, &self.default_project)
    }
}
