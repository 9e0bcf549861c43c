//! Recurring frame poll for one recording device.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::Job;
use crate::db::{DbError, DeviceStatus, Frame, LifecycleError};
use crate::devices::{DeviceService, ServiceError};
use crate::probe::{jitter, parse_address, ClientFactory, ProbeError};

#[derive(Error, Debug)]
pub enum PollError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The device is no longer recording; nothing was fetched or stored.
    Skipped(DeviceStatus),
    /// Frames fetched and stored, counting only new ones.
    Appended(usize),
    /// The device did not answer and was marked not reachable.
    Unreachable,
}

pub struct PollJob {
    device_id: Uuid,
    service: Arc<DeviceService>,
    clients: Arc<dyn ClientFactory>,
}

impl PollJob {
    pub fn new(device_id: Uuid, service: Arc<DeviceService>, clients: Arc<dyn ClientFactory>) -> Self {
        Self {
            device_id,
            service,
            clients,
        }
    }

    /// Fetch frames newer than the last stored one and append them.
    ///
    /// Only the device row and the highest stored index are read; the frame
    /// history stays in the registry. The fetch runs outside the device's
    /// turn and the result is applied to a fresh read taken under the turn.
    pub async fn tick(&self) -> Result<PollOutcome, PollError> {
        let device = self.service.summary(self.device_id)?;
        if device.status() != DeviceStatus::Recording {
            return Ok(PollOutcome::Skipped(device.status()));
        }

        let since = self.service.registry().last_frame_index(self.device_id)?;
        let client = self.clients.connect(parse_address(&device.address)?);
        let fetched = client.frames(since).await;

        let turn = self.service.bus().turn(self.device_id).await;
        let mut device = self.service.summary(self.device_id)?;
        if device.status() != DeviceStatus::Recording {
            return Ok(PollOutcome::Skipped(device.status()));
        }

        match fetched {
            Some(payloads) => {
                let frames: Vec<Frame> = payloads
                    .into_iter()
                    .map(|p| Frame::new(device.id, device.filter, p))
                    .collect();
                let added = self.service.registry().append_frames(&frames)?;
                Ok(PollOutcome::Appended(added))
            }
            None => {
                tracing::warn!(
                    "Poll: Device {} ({}) at {} did not answer",
                    device.name,
                    device.id,
                    device.address
                );
                device.set_status(DeviceStatus::NotReachable)?;
                self.service.commit(&turn, &mut device).await?;
                Ok(PollOutcome::Unreachable)
            }
        }
    }
}

#[async_trait]
impl Job for PollJob {
    async fn run(&self) {
        jitter().await;

        match self.tick().await {
            Ok(PollOutcome::Appended(n)) if n > 0 => {
                tracing::debug!("Poll: Device {} stored {} new frames", self.device_id, n);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Poll: Device {} failed: {}", self.device_id, e);
            }
        }
    }
}
