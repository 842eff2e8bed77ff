//! Bounded worker pool shared by every operation.
//!
//! One producer feeds a bounded queue; a fixed number of workers take items
//! and run the operation's handler under an optional per-item deadline.
//! Cancelling the run stops new items from starting; items already running
//! finish or hit their deadline. Failures go to a single error-logging task
//! and into the failed set, keyed by item name. An item whose filter
//! selected nothing is logged as a warning and is not a failure.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::constants::jobs;
use crate::error::{self, Error};

/// A unit of work, named by the image it is about
pub trait Job: Send + 'static {
    fn name(&self) -> String;
}

impl Job for String {
    fn name(&self) -> String {
        self.clone()
    }
}

/// What happened to every item of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub total: usize,
    pub succeeded: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    /// Items the platform filter left nothing to do for
    pub unavailable: BTreeSet<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// `SomeImagesFailed` unless every item succeeded or had nothing to do
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::SomeImagesFailed.into())
        }
    }

    /// Write the failed names, one per line, for a later re-run
    pub fn write_failed(&self, path: &Path) -> Result<()> {
        let mut content = String::new();
        for name in &self.failed {
            content.push_str(name);
            content.push('\n');
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write failed list {}", path.display()))
    }
}

#[derive(Default)]
struct Outcomes {
    succeeded: BTreeSet<String>,
    failed: BTreeSet<String>,
    unavailable: BTreeSet<String>,
}

pub struct Scheduler {
    workers: usize,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// `workers` is clamped to the supported range
    pub fn new(workers: usize, timeout: Option<Duration>, cancel: CancellationToken) -> Self {
        Self {
            workers: workers.clamp(1, jobs::MAX),
            timeout,
            cancel,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `handler` once for every item.
    ///
    /// The handler receives a token cancelled once the item's deadline
    /// passes. After the run is cancelled no new item starts and items never
    /// started are reported as failed.
    pub async fn run<T, F, Fut>(&self, items: Vec<T>, handler: F) -> RunReport
    where
        T: Job,
        F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let total = items.len();
        let (queue, receiver) = mpsc::channel::<T>(self.workers);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let (report_errors, mut error_reports) = mpsc::unbounded_channel::<(String, anyhow::Error)>();
        let outcomes = Arc::new(Mutex::new(Outcomes::default()));
        let handler = Arc::new(handler);

        let logger = tokio::spawn(async move {
            let mut reported = 0usize;
            while let Some((name, err)) = error_reports.recv().await {
                error!("{}: {:#}", name, err);
                reported += 1;
            }
            reported
        });

        let mut workers = Vec::with_capacity(self.workers);
        for id in 0..self.workers {
            let receiver = receiver.clone();
            let handler = handler.clone();
            let outcomes = outcomes.clone();
            let report_errors = report_errors.clone();
            let cancel = self.cancel.clone();
            let timeout = self.timeout;

            workers.push(tokio::spawn(async move {
                loop {
                    let item = {
                        let mut receiver = receiver.lock().await;
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            item = receiver.recv() => item,
                        }
                    };
                    let Some(item) = item else {
                        break;
                    };

                    let name = item.name();
                    debug!("Worker {} processing {}", id, name);
                    let token = CancellationToken::new();
                    let outcome = run_with_deadline(handler(item, token.clone()), timeout).await;
                    token.cancel();

                    let mut outcomes = match outcomes.lock() {
                        Ok(outcomes) => outcomes,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    match outcome {
                        Ok(()) => {
                            outcomes.succeeded.insert(name);
                        }
                        Err(err) if matches!(error::kind(&err), Some(Error::NoAvailablePlatform(_))) => {
                            warn!("{}", err);
                            outcomes.unavailable.insert(name);
                        }
                        Err(err) => {
                            outcomes.failed.insert(name.clone());
                            let _ = report_errors.send((name, err));
                        }
                    }
                }
            }));
        }

        let mut pending = items.into_iter();
        for item in pending.by_ref() {
            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(item),
                permit = queue.reserve() => match permit {
                    Ok(permit) => {
                        permit.send(item);
                        Ok(())
                    }
                    Err(_) => Err(item),
                },
            };
            if let Err(item) = sent {
                fail_unstarted(item, &outcomes, &report_errors);
                break;
            }
        }
        drop(queue);

        for worker in workers {
            if let Err(e) = worker.await {
                error!("Worker task failed: {}", e);
            }
        }

        // whatever is left was never started
        for item in pending {
            fail_unstarted(item, &outcomes, &report_errors);
        }
        {
            let mut receiver = receiver.lock().await;
            while let Ok(item) = receiver.try_recv() {
                fail_unstarted(item, &outcomes, &report_errors);
            }
        }

        drop(report_errors);
        match logger.await {
            Ok(reported) => debug!("{} error(s) reported", reported),
            Err(e) => error!("Error logging task failed: {}", e),
        }

        let outcomes = match Arc::try_unwrap(outcomes) {
            Ok(outcomes) => outcomes.into_inner().unwrap_or_else(|p| p.into_inner()),
            Err(shared) => std::mem::take(&mut *shared.lock().unwrap_or_else(|p| p.into_inner())),
        };
        RunReport {
            total,
            succeeded: outcomes.succeeded,
            failed: outcomes.failed,
            unavailable: outcomes.unavailable,
        }
    }
}

async fn run_with_deadline<Fut>(work: Fut, timeout: Option<Duration>) -> Result<()>
where
    Fut: Future<Output = Result<()>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Timeout(limit).into()),
        },
        None => work.await,
    }
}

fn fail_unstarted<T: Job>(
    item: T,
    outcomes: &Mutex<Outcomes>,
    report_errors: &mpsc::UnboundedSender<(String, anyhow::Error)>,
) {
    let name = item.name();
    let mut outcomes = match outcomes.lock() {
        Ok(outcomes) => outcomes,
        Err(poisoned) => poisoned.into_inner(),
    };
    if outcomes.failed.insert(name.clone()) {
        let _ = report_errors.send((name, Error::Cancelled.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn names(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("registry.local/app/image-{}:v1", i)).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_every_item_runs_once() {
        for workers in [1, 3, 20] {
            let items = names(25);
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = calls.clone();
            let scheduler = Scheduler::new(workers, None, CancellationToken::new());

            let report = scheduler
                .run(items.clone(), move |name: String, _| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let index: usize = name
                            .trim_end_matches(":v1")
                            .rsplit('-')
                            .next()
                            .unwrap()
                            .parse()
                            .unwrap();
                        if index % 3 == 0 {
                            anyhow::bail!("boom");
                        }
                        Ok(())
                    }
                })
                .await;

            assert_eq!(calls.load(Ordering::SeqCst), 25);
            assert_eq!(report.total, 25);
            let expected_failed: BTreeSet<String> = items
                .iter()
                .enumerate()
                .filter(|(i, _)| i % 3 == 0)
                .map(|(_, n)| n.clone())
                .collect();
            assert_eq!(report.failed, expected_failed);
            let all: BTreeSet<String> = report.succeeded.union(&report.failed).cloned().collect();
            assert_eq!(all, items.iter().cloned().collect());
            assert!(report.into_result().is_err());
        }
    }

    #[tokio::test]
    async fn test_unavailable_is_not_a_failure() {
        let scheduler = Scheduler::new(2, None, CancellationToken::new());
        let report = scheduler
            .run(names(2), |name: String, _| async move {
                Err(Error::NoAvailablePlatform(name).into())
            })
            .await;
        assert!(report.failed.is_empty());
        assert_eq!(report.unavailable.len(), 2);
        assert!(report.into_result().is_ok());
    }

    #[tokio::test]
    async fn test_timeout_fails_only_slow_items() {
        let scheduler = Scheduler::new(4, Some(Duration::from_millis(50)), CancellationToken::new());
        let report = scheduler
            .run(names(4), |name: String, token: CancellationToken| async move {
                if name.contains("image-1") {
                    token.cancelled().await;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok(())
            })
            .await;
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed.iter().all(|n| n.contains("image-1")));
        assert_eq!(report.succeeded.len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_unstarted_items() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let scheduler = Scheduler::new(2, None, cancel);
        let report = scheduler
            .run(names(5), |_: String, _| async move { Ok(()) })
            .await;
        assert!(report.succeeded.is_empty());
        assert_eq!(report.failed.len(), 5);
    }

    #[tokio::test]
    async fn test_cancel_lets_in_flight_items_finish() {
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(1, None, cancel.clone());
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();

        let trigger = cancel.clone();
        let report = scheduler
            .run(names(3), move |_: String, token: CancellationToken| {
                let counter = counter.clone();
                let trigger = trigger.clone();
                async move {
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        trigger.cancel();
                    });
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    assert!(!token.is_cancelled());
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(report.succeeded.len(), 1);
        assert!(report.succeeded.contains("registry.local/app/image-0:v1"));
        assert_eq!(report.failed.len(), 2);
    }

    #[test]
    fn test_write_failed_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror-failed.txt");
        let report = RunReport {
            total: 3,
            failed: ["b:v1".to_string(), "a:v1".to_string()].into_iter().collect(),
            ..Default::default()
        };
        report.write_failed(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a:v1\nb:v1\n");
    }

    #[test]
    fn test_workers_are_clamped() {
        assert_eq!(Scheduler::new(0, None, CancellationToken::new()).workers(), 1);
        assert_eq!(Scheduler::new(64, None, CancellationToken::new()).workers(), 20);
    }
}
