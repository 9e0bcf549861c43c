//! Scheduler module for recurring and one-shot jobs.

mod orchestrator;
mod poll;

pub use orchestrator::*;
pub use poll::*;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock, Semaphore};
use uuid::Uuid;

/// Identity of a scheduled job. At most one job exists per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum JobKey {
    /// Recurring frame poll for a device.
    Poll(Uuid),
    /// One-shot discovery scan started from an address.
    Scan(Ipv4Addr),
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKey::Poll(id) => write!(f, "poll:{}", id),
            JobKey::Scan(addr) => write!(f, "scan:{}", addr),
        }
    }
}

/// A unit of scheduled work.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self);
}

/// Scheduler error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("scheduler is full ({0} jobs)")]
    Capacity(usize),
    #[error("job {0} is already scheduled")]
    Duplicate(JobKey),
    #[error("scheduler is shut down")]
    Closed,
}

/// Returned when a job is created. Each creation gets a new generation.
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub key: JobKey,
    pub generation: u64,
    pub interval: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub key: JobKey,
    /// `None` for one-shot jobs.
    pub interval_secs: Option<u64>,
}

struct JobEntry {
    generation: u64,
    interval: Option<Duration>,
    stop_tx: broadcast::Sender<()>,
}

type JobTable = Arc<RwLock<HashMap<JobKey, JobEntry>>>;

/// Job registry. Every create and cancel for a key happens under one write
/// lock, so a cancel and a recreate for the same key cannot interleave.
pub struct Scheduler {
    jobs: JobTable,
    next_generation: AtomicU64,
    max_jobs: usize,
    closed: AtomicBool,
}

impl Scheduler {
    pub fn new(max_jobs: usize) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            max_jobs,
            closed: AtomicBool::new(false),
        }
    }

    /// Run `job` every `interval` until cancelled.
    ///
    /// An existing job under `key` is stopped and replaced, never
    /// reconfigured in place.
    pub async fn schedule_recurring(
        &self,
        key: JobKey,
        interval: Duration,
        job: Arc<dyn Job>,
    ) -> Result<JobHandle, SchedulerError> {
        let mut jobs = self.jobs.write().await;
        self.check_capacity(&jobs, &key)?;

        if let Some(old) = jobs.remove(&key) {
            let _ = old.stop_tx.send(());
            tracing::info!("Scheduler: Replacing job {}", key);
        }

        let (stop_tx, stop_rx) = broadcast::channel(1);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        jobs.insert(
            key,
            JobEntry {
                generation,
                interval: Some(interval),
                stop_tx,
            },
        );
        drop(jobs);

        tracing::info!("Scheduler: Added job {} every {:?}", key, interval);
        tokio::spawn(run_recurring(key, interval, job, stop_rx));

        Ok(JobHandle {
            key,
            generation,
            interval: Some(interval),
        })
    }

    /// Run `job` once. The entry removes itself when the job finishes.
    pub async fn schedule_once(
        &self,
        key: JobKey,
        job: Arc<dyn Job>,
    ) -> Result<JobHandle, SchedulerError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&key) {
            return Err(SchedulerError::Duplicate(key));
        }
        self.check_capacity(&jobs, &key)?;

        let (stop_tx, mut stop_rx) = broadcast::channel(1);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        jobs.insert(
            key,
            JobEntry {
                generation,
                interval: None,
                stop_tx,
            },
        );
        drop(jobs);

        tracing::info!("Scheduler: Added one-shot job {}", key);
        let table = self.jobs.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = stop_rx.recv() => {
                    tracing::info!("Scheduler: One-shot job {} cancelled", key);
                }
                _ = job.run() => {}
            }

            let mut jobs = table.write().await;
            if jobs.get(&key).is_some_and(|e| e.generation == generation) {
                jobs.remove(&key);
                tracing::debug!("Scheduler: One-shot job {} finished", key);
            }
        });

        Ok(JobHandle {
            key,
            generation,
            interval: None,
        })
    }

    /// Stop and remove the job under `key`. Returns `false` if there was none.
    pub async fn cancel(&self, key: &JobKey) -> bool {
        let mut jobs = self.jobs.write().await;

        match jobs.remove(key) {
            Some(entry) => {
                let _ = entry.stop_tx.send(());
                tracing::info!("Scheduler: Removed job {}", key);
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, key: &JobKey) -> bool {
        self.jobs.read().await.contains_key(key)
    }

    pub async fn get(&self, key: &JobKey) -> Option<JobInfo> {
        let jobs = self.jobs.read().await;
        jobs.get(key).map(|e| job_info(*key, e))
    }

    /// All jobs, ordered by key.
    pub async fn jobs(&self) -> Vec<JobInfo> {
        let jobs = self.jobs.read().await;
        let mut list: Vec<JobInfo> = jobs.iter().map(|(k, e)| job_info(*k, e)).collect();
        list.sort_by_key(|j| j.key.to_string());
        list
    }

    /// Stop every job and refuse new ones.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut jobs = self.jobs.write().await;
        tracing::info!("Scheduler: Stopping {} jobs", jobs.len());
        for (_, entry) in jobs.drain() {
            let _ = entry.stop_tx.send(());
        }
    }

    fn check_capacity(
        &self,
        jobs: &HashMap<JobKey, JobEntry>,
        key: &JobKey,
    ) -> Result<(), SchedulerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::Closed);
        }
        if !jobs.contains_key(key) && jobs.len() >= self.max_jobs {
            return Err(SchedulerError::Capacity(self.max_jobs));
        }
        Ok(())
    }
}

fn job_info(key: JobKey, entry: &JobEntry) -> JobInfo {
    JobInfo {
        key,
        interval_secs: entry.interval.map(|d| d.as_secs()),
    }
}

/// Run the tick loop for a single recurring job.
async fn run_recurring(
    key: JobKey,
    period: Duration,
    job: Arc<dyn Job>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    // One permit: a tick never overlaps the previous one.
    let semaphore = Arc::new(Semaphore::new(1));

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.recv() => {
                break;
            }
            _ = interval.tick() => {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        tracing::warn!("Skipping tick for {}: previous run still in progress", key);
                        continue;
                    }
                };

                let job = job.clone();
                tokio::spawn(async move {
                    let _permit = permit; // Hold permit until done
                    job.run().await;
                });
            }
        }
    }

    tracing::debug!("Scheduler: Job {} stopped", key);
}
