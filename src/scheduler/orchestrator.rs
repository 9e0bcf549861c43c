//! Keeps exactly one poll job per recording device.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{JobHandle, JobKey, PollJob, Scheduler, SchedulerError};
use crate::db::{DbError, Device, DeviceStatus};
use crate::devices::{DeviceService, PollSupervisor};
use crate::events::{
    DeviceEvent, DeviceFrequencyChangedEvent, DeviceStatusChangedEvent, EventHandler, HandlerError,
};
use crate::probe::ClientFactory;

/// Orchestrator error types.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("device {0} not found")]
    DeviceNotFound(Uuid),
    #[error("could not schedule poll job: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Poll period for a device sampling every `frequency` seconds.
pub fn poll_interval(frequency: u32) -> Duration {
    Duration::from_secs(u64::from(frequency.max(1)))
}

/// Reacts to lifecycle events by creating and removing poll jobs.
///
/// Runs inside the device's turn, so it never takes the turn itself.
pub struct JobOrchestrator {
    scheduler: Arc<Scheduler>,
    service: Arc<DeviceService>,
    clients: Arc<dyn ClientFactory>,
}

impl JobOrchestrator {
    pub fn new(
        scheduler: Arc<Scheduler>,
        service: Arc<DeviceService>,
        clients: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            scheduler,
            service,
            clients,
        }
    }

    pub async fn on_status_changed(
        &self,
        event: &DeviceStatusChangedEvent,
    ) -> Result<Option<JobHandle>, OrchestratorError> {
        let id = event.device.id;
        tracing::info!(
            "Orchestrator: Device {} ({}) {} -> {}",
            event.device.name,
            id,
            event.device.status,
            event.status
        );

        match event.status {
            DeviceStatus::Recording => {
                // Read the stored frequency; the event's snapshot may be stale.
                let device = self.load(id)?;
                let handle = self.start_polling(id, device.frequency()).await?;
                Ok(Some(handle))
            }
            DeviceStatus::Stopped | DeviceStatus::NotReachable | DeviceStatus::Archived => {
                self.stop_polling(id).await;
                Ok(None)
            }
        }
    }

    pub async fn on_frequency_changed(
        &self,
        event: &DeviceFrequencyChangedEvent,
    ) -> Result<Option<JobHandle>, OrchestratorError> {
        let id = event.device.id;
        let device = self.load(id)?;
        if device.status() != DeviceStatus::Recording {
            tracing::debug!(
                "Orchestrator: Device {} not recording, ignoring frequency {}",
                id,
                event.frequency
            );
            return Ok(None);
        }

        tracing::info!(
            "Orchestrator: Device {} ({}) frequency {}s -> {}s",
            event.device.name,
            id,
            event.device.frequency,
            device.frequency()
        );
        // A redelivered event may carry an older value than the record.
        let handle = self.start_polling(id, device.frequency()).await?;
        Ok(Some(handle))
    }

    /// Schedule jobs for every device stored as recording. Used at startup.
    pub async fn restore(&self) -> Result<usize, OrchestratorError> {
        let recording = self
            .service
            .registry()
            .query(&|d: &Device| d.status() == DeviceStatus::Recording)?;

        for device in &recording {
            self.start_polling(device.id, device.frequency()).await?;
        }

        tracing::info!("Orchestrator: Restored {} poll jobs", recording.len());
        Ok(recording.len())
    }

    fn load(&self, id: Uuid) -> Result<Device, OrchestratorError> {
        self.service
            .registry()
            .summary(id)?
            .ok_or(OrchestratorError::DeviceNotFound(id))
    }

    /// Replace any poll job for `id` with a fresh one.
    async fn start_polling(&self, id: Uuid, frequency: u32) -> Result<JobHandle, SchedulerError> {
        let key = JobKey::Poll(id);
        if !self.scheduler.cancel(&key).await {
            tracing::debug!("Orchestrator: No existing job {}", key);
        }

        let job = Arc::new(PollJob::new(
            id,
            self.service.clone(),
            self.clients.clone(),
        ));
        self.scheduler
            .schedule_recurring(key, poll_interval(frequency), job)
            .await
    }

    async fn stop_polling(&self, id: Uuid) -> bool {
        self.scheduler.cancel(&JobKey::Poll(id)).await
    }
}

#[async_trait]
impl EventHandler for JobOrchestrator {
    async fn handle(
        &self,
        event: &DeviceEvent,
        cancel: CancellationToken,
    ) -> Result<(), HandlerError> {
        if cancel.is_cancelled() {
            tracing::debug!("Orchestrator: Shutting down, ignoring {}", event.kind());
            return Ok(());
        }

        match event {
            DeviceEvent::StatusChanged(e) => {
                self.on_status_changed(e).await?;
            }
            DeviceEvent::FrequencyChanged(e) => {
                self.on_frequency_changed(e).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PollSupervisor for JobOrchestrator {
    async fn ensure_polling(&self, device: &Device) -> Result<bool, HandlerError> {
        if self.scheduler.contains(&JobKey::Poll(device.id)).await {
            return Ok(false);
        }
        self.start_polling(device.id, device.frequency()).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::ServiceError;
    use crate::events::DispatchError;
    use crate::testing::Harness;
    use std::net::Ipv4Addr;

    const ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 30);

    async fn poll_secs(h: &Harness, id: Uuid) -> Option<u64> {
        h.scheduler
            .get(&JobKey::Poll(id))
            .await
            .and_then(|j| j.interval_secs)
    }

    #[test]
    fn test_poll_interval_floor() {
        assert_eq!(poll_interval(0), Duration::from_secs(1));
        assert_eq!(poll_interval(1), Duration::from_secs(1));
        assert_eq!(poll_interval(30), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_recording_creates_one_job() {
        let h = Harness::new().await;
        let (_, device) = h.add_device(ADDR, 0);

        h.service
            .set_status(device.id, DeviceStatus::Recording)
            .await
            .unwrap();

        assert_eq!(h.scheduler.jobs().await.len(), 1);
        assert_eq!(poll_secs(&h, device.id).await, Some(1));
        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_leaving_recording_removes_job() {
        for next in [
            DeviceStatus::Stopped,
            DeviceStatus::NotReachable,
            DeviceStatus::Archived,
        ] {
            let h = Harness::new().await;
            let (_, device) = h.add_device(ADDR, 5);
            h.service
                .set_status(device.id, DeviceStatus::Recording)
                .await
                .unwrap();
            assert!(h.scheduler.contains(&JobKey::Poll(device.id)).await);

            h.service.set_status(device.id, next).await.unwrap();
            assert!(h.scheduler.jobs().await.is_empty(), "after {}", next);
        }
    }

    #[tokio::test]
    async fn test_redelivered_event_keeps_one_job() {
        let h = Harness::new().await;
        let (_, device) = h.add_device(ADDR, 4);

        let mut stored = h.service.get(device.id).unwrap();
        stored.set_status(DeviceStatus::Recording).unwrap();
        h.registry.update(&stored).unwrap();
        let event = match stored.take_events().remove(0) {
            DeviceEvent::StatusChanged(e) => e,
            other => panic!("unexpected event {:?}", other),
        };

        let first = h.orchestrator.on_status_changed(&event).await.unwrap().unwrap();
        let second = h.orchestrator.on_status_changed(&event).await.unwrap().unwrap();

        // Recreated, not duplicated.
        assert_ne!(first.generation, second.generation);
        assert_eq!(h.scheduler.jobs().await.len(), 1);
        assert_eq!(poll_secs(&h, device.id).await, Some(4));
        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_frequency_change_recreates_job() {
        let h = Harness::new().await;
        let (_, device) = h.add_device(ADDR, 5);
        h.service
            .set_status(device.id, DeviceStatus::Recording)
            .await
            .unwrap();
        assert_eq!(poll_secs(&h, device.id).await, Some(5));

        h.service.set_frequency(device.id, 12).await.unwrap();
        assert_eq!(poll_secs(&h, device.id).await, Some(12));
        assert_eq!(h.scheduler.jobs().await.len(), 1);
        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_frequency_event_uses_stored_value() {
        let h = Harness::new().await;
        let (_, device) = h.add_device(ADDR, 5);
        h.service
            .set_status(device.id, DeviceStatus::Recording)
            .await
            .unwrap();

        // Capture the 5 -> 8 event, then let a later change to 20 land first.
        let mut stored = h.service.summary(device.id).unwrap();
        stored.set_frequency(8);
        let stale = match stored.take_events().remove(0) {
            DeviceEvent::FrequencyChanged(e) => e,
            other => panic!("unexpected event {:?}", other),
        };
        h.service.set_frequency(device.id, 20).await.unwrap();
        assert_eq!(poll_secs(&h, device.id).await, Some(20));

        h.orchestrator.on_frequency_changed(&stale).await.unwrap();
        assert_eq!(poll_secs(&h, device.id).await, Some(20));
        assert_eq!(h.scheduler.jobs().await.len(), 1);
        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_frequency_change_while_stopped_schedules_nothing() {
        let h = Harness::new().await;
        let (_, device) = h.add_device(ADDR, 5);

        h.service.set_frequency(device.id, 12).await.unwrap();
        assert!(h.scheduler.jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_failure_propagates() {
        let h = Harness::with_capacity(0).await;
        let (_, device) = h.add_device(ADDR, 5);

        let err = h
            .service
            .set_status(device.id, DeviceStatus::Recording)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Dispatch(DispatchError::Handler { .. })
        ));

        // The change is committed; only the job is missing.
        assert_eq!(h.status(&device), DeviceStatus::Recording);
        assert!(h.scheduler.jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_old_job_does_not_block_create() {
        let h = Harness::new().await;
        let (_, device) = h.add_device(ADDR, 3);
        assert!(!h.scheduler.contains(&JobKey::Poll(device.id)).await);

        h.service
            .set_status(device.id, DeviceStatus::Recording)
            .await
            .unwrap();
        assert_eq!(poll_secs(&h, device.id).await, Some(3));
        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_restore_schedules_recording_devices() {
        let h = Harness::new().await;
        let (_, recording) = h.add_device(ADDR, 7);
        let (_, stopped) = h.add_device(Ipv4Addr::new(192, 168, 1, 31), 7);

        let mut stored = h.service.get(recording.id).unwrap();
        stored.set_status(DeviceStatus::Recording).unwrap();
        h.registry.update(&stored).unwrap();

        assert_eq!(h.orchestrator.restore().await.unwrap(), 1);
        assert!(h.scheduler.contains(&JobKey::Poll(recording.id)).await);
        assert!(!h.scheduler.contains(&JobKey::Poll(stopped.id)).await);
        h.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_device_stops_its_own_job() {
        let h = Harness::new().await;
        let (fake, device) = h.add_device(ADDR, 1);
        fake.set_reachable(false);

        h.service
            .set_status(device.id, DeviceStatus::Recording)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(h.status(&device), DeviceStatus::NotReachable);
        assert!(h.scheduler.jobs().await.is_empty());
    }
}
