//! Subnet discovery and registry reconciliation.
//!
//! A scan probes every host of a subnet through a bounded worker pool, then
//! reconciles each responder against the live registry record at its
//! address: new addresses get a `Stopped` record, `NotReachable` records
//! are resynced from the device, and live records are left alone.

mod range;

pub use range::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::{DbError, Device, DeviceStatus, LifecycleError};
use crate::devices::{DeviceService, ServiceError};
use crate::locks::KeyedLocks;
use crate::probe::{ClientFactory, DeviceInfo};
use crate::scheduler::{Job, JobHandle, JobKey, Scheduler, SchedulerError};

/// Discovery error types.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("invalid subnet mask {0}")]
    InvalidMask(Ipv4Addr),
    #[error("subnet has {hosts} hosts, at most {limit} may be scanned")]
    RangeTooLarge { hosts: usize, limit: usize },
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Failure reconciling a single responder. Collected, never fatal to a scan.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("another live device already uses {0}")]
    Conflict(Ipv4Addr),
    #[error("device at {address} did not return {what}")]
    ResyncIncomplete {
        address: Ipv4Addr,
        what: &'static str,
    },
    #[error("device {device_id} at {address} refused the clock write")]
    ClockWrite { address: Ipv4Addr, device_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Created { id: Uuid, clock_set: bool },
    Resynced(Uuid),
    Unchanged(Uuid),
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanFailure {
    pub address: Ipv4Addr,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub network: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scanned: usize,
    pub found: usize,
    pub created: usize,
    pub resynced: usize,
    pub unchanged: usize,
    pub errors: Vec<ScanFailure>,
}

impl ScanReport {
    fn new(range: &ScanRange) -> Self {
        let now = Utc::now();
        Self {
            network: range.network(),
            broadcast: range.broadcast(),
            started_at: now,
            finished_at: now,
            scanned: range.len(),
            found: 0,
            created: 0,
            resynced: 0,
            unchanged: 0,
            errors: Vec::new(),
        }
    }

    fn record(&mut self, address: Ipv4Addr, result: Result<Reconciled, ReconcileError>) {
        match result {
            Ok(Reconciled::Created { id, clock_set }) => {
                self.created += 1;
                if !clock_set {
                    let error = ReconcileError::ClockWrite {
                        address,
                        device_id: id,
                    };
                    self.fail(address, error);
                }
            }
            Ok(Reconciled::Resynced(_)) => self.resynced += 1,
            Ok(Reconciled::Unchanged(_)) => self.unchanged += 1,
            Err(e) => self.fail(address, e),
        }
    }

    fn fail(&mut self, address: Ipv4Addr, error: ReconcileError) {
        tracing::warn!("Discovery: {} failed: {}", address, error);
        self.errors.push(ScanFailure {
            address,
            error: error.to_string(),
        });
    }
}

/// Largest subnet a scan may cover: a /16.
pub const DEFAULT_MAX_SCAN_HOSTS: usize = 65_534;

pub struct Discovery {
    service: Arc<DeviceService>,
    clients: Arc<dyn ClientFactory>,
    concurrency: usize,
    max_hosts: usize,
    address_locks: KeyedLocks<Ipv4Addr>,
    last_report: RwLock<Option<ScanReport>>,
}

impl Discovery {
    pub fn new(
        service: Arc<DeviceService>,
        clients: Arc<dyn ClientFactory>,
        concurrency: usize,
    ) -> Self {
        Self {
            service,
            clients,
            concurrency: concurrency.max(1),
            max_hosts: DEFAULT_MAX_SCAN_HOSTS,
            address_locks: KeyedLocks::new(),
            last_report: RwLock::new(None),
        }
    }

    pub fn with_max_hosts(mut self, max_hosts: usize) -> Self {
        self.max_hosts = max_hosts;
        self
    }

    pub async fn last_report(&self) -> Option<ScanReport> {
        self.last_report.read().await.clone()
    }

    /// Validate `mask` and the subnet size, then schedule a one-shot scan.
    pub async fn schedule(
        self: &Arc<Self>,
        scheduler: &Scheduler,
        address: Ipv4Addr,
        mask: Ipv4Addr,
    ) -> Result<JobHandle, DiscoveryError> {
        if !ScanRange::is_valid_mask(mask) {
            return Err(DiscoveryError::InvalidMask(mask));
        }

        let range = ScanRange::new(address, mask);
        if range.len() > self.max_hosts {
            return Err(DiscoveryError::RangeTooLarge {
                hosts: range.len(),
                limit: self.max_hosts,
            });
        }

        let job = Arc::new(ScanJob {
            discovery: self.clone(),
            address,
            mask,
        });
        let handle = scheduler
            .schedule_once(JobKey::Scan(range.network()), job)
            .await?;
        Ok(handle)
    }

    /// Probe the subnet of `address`/`mask` and reconcile every responder.
    pub async fn scan(&self, address: Ipv4Addr, mask: Ipv4Addr) -> ScanReport {
        let range = ScanRange::new(address, mask);
        let mut report = ScanReport::new(&range);
        tracing::info!(
            "Discovery: Scanning {} hosts between {} and {}",
            range.len(),
            range.network(),
            range.broadcast()
        );

        let found: Vec<(Ipv4Addr, DeviceInfo)> = stream::iter(range.hosts())
            .map(|addr| {
                let client = self.clients.connect(addr);
                async move { client.probe().await.map(|info| (addr, info)) }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|r| async move { r })
            .collect()
            .await;
        report.found = found.len();

        let results: Vec<(Ipv4Addr, Result<Reconciled, ReconcileError>)> = stream::iter(found)
            .map(|(addr, info)| async move { (addr, self.reconcile(addr, info).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        for (addr, result) in results {
            report.record(addr, result);
        }

        report.finished_at = Utc::now();
        tracing::info!(
            "Discovery: {} found, {} created, {} resynced, {} unchanged, {} errors",
            report.found,
            report.created,
            report.resynced,
            report.unchanged,
            report.errors.len()
        );

        *self.last_report.write().await = Some(report.clone());
        report
    }

    /// Bring the registry in line with a device that answered at `address`.
    pub async fn reconcile(
        &self,
        address: Ipv4Addr,
        info: DeviceInfo,
    ) -> Result<Reconciled, ReconcileError> {
        let _held = self.address_locks.lock(address).await;

        let existing = self.service.registry().find_live(&address.to_string())?;
        match existing {
            None => self.create(address, &info).await,
            Some(device) if device.status() == DeviceStatus::NotReachable => {
                self.resync(device.id, address).await
            }
            Some(device) => {
                tracing::debug!(
                    "Discovery: {} ({}) at {} is {}, leaving it",
                    device.name,
                    device.id,
                    address,
                    device.status()
                );
                Ok(Reconciled::Unchanged(device.id))
            }
        }
    }

    async fn create(
        &self,
        address: Ipv4Addr,
        info: &DeviceInfo,
    ) -> Result<Reconciled, ReconcileError> {
        let device = Device::new(address.to_string(), info);
        if !self.service.registry().create(&device)? {
            return Err(ReconcileError::Conflict(address));
        }
        tracing::info!(
            "Discovery: Created {} ({}) at {}",
            device.name,
            device.id,
            address
        );

        let clock_set = self.clients.connect(address).set_time(Utc::now()).await;
        Ok(Reconciled::Created {
            id: device.id,
            clock_set,
        })
    }

    /// Pull every sub-record from the device, then move it to `Stopped`.
    async fn resync(&self, id: Uuid, address: Ipv4Addr) -> Result<Reconciled, ReconcileError> {
        let client = self.clients.connect(address);
        let turn = self.service.bus().turn(id).await;
        let mut device = self.service.get(id)?;
        if device.status() != DeviceStatus::NotReachable {
            return Ok(Reconciled::Unchanged(id));
        }

        let (info, sensors, filter, firmware, wifi) = tokio::join!(
            client.info(),
            client.sensors(),
            client.filter(),
            client.firmware(),
            client.wifi()
        );
        let frames = client.frames(None).await;

        let missing = |what| ReconcileError::ResyncIncomplete { address, what };
        let info = info.ok_or_else(|| missing("info"))?;
        let sensors = sensors.ok_or_else(|| missing("sensors"))?;
        let filter = filter.ok_or_else(|| missing("filter"))?;
        let firmware = firmware.ok_or_else(|| missing("firmware"))?;
        let wifi = wifi.ok_or_else(|| missing("wifi"))?;
        let frames = frames.ok_or_else(|| missing("frames"))?;

        device.class = info.class;
        device.name = info.name;
        device.sensors = sensors;
        device.filter = filter;
        device.firmware = firmware;
        device.wifi = wifi;
        device.set_frequency(info.frequency);
        let added = device.merge_frames(frames);
        device.set_status(DeviceStatus::Stopped)?;

        self.service.commit(&turn, &mut device).await?;
        tracing::info!(
            "Discovery: Resynced {} ({}) at {}, {} new frames",
            device.name,
            id,
            address,
            added
        );
        Ok(Reconciled::Resynced(id))
    }
}

/// One-shot scheduler job wrapping [`Discovery::scan`].
pub struct ScanJob {
    discovery: Arc<Discovery>,
    address: Ipv4Addr,
    mask: Ipv4Addr,
}

#[async_trait]
impl Job for ScanJob {
    async fn run(&self) {
        self.discovery.scan(self.address, self.mask).await;
    }
}
