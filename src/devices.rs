//! Device service: the commit boundary between lifecycle changes and their handlers.
//!
//! Every mutation runs inside the device's [`DeviceTurn`]: read, change,
//! persist, then dispatch the pending events. Handlers therefore only ever
//! observe state that is already in the registry.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::{
    DbError, Device, DeviceRegistry, DeviceStatus, Filter, Firmware, LifecycleError, Wifi,
};
use crate::events::{DeviceTurn, DispatchError, EventBus, HandlerError};
use crate::probe::{parse_address, ClientFactory, DeviceClient, ProbeError};

/// Service error types.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("device {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("device at {address} rejected {what} write")]
    DeviceWrite { address: String, what: &'static str },
    #[error("could not resume polling of device {device_id}: {reason}")]
    Polling {
        device_id: Uuid,
        reason: HandlerError,
    },
}

/// Keeps a recording device's poll job in place.
///
/// Asked when a device is set to `Recording` while it already is, which
/// raises no lifecycle event.
#[async_trait]
pub trait PollSupervisor: Send + Sync {
    /// Schedule a poll job for `device` if it has none. Returns whether one
    /// was created.
    async fn ensure_polling(&self, device: &Device) -> Result<bool, HandlerError>;
}

/// Settings pushed to the device, then stored. Absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceSettings {
    pub display_name: Option<String>,
    pub filter: Option<Filter>,
    pub sensors: Option<u32>,
    pub firmware: Option<Firmware>,
    pub wifi: Option<Wifi>,
}

pub struct DeviceService {
    registry: Arc<dyn DeviceRegistry>,
    bus: Arc<EventBus>,
    clients: Arc<dyn ClientFactory>,
    supervisor: RwLock<Option<Arc<dyn PollSupervisor>>>,
}

impl DeviceService {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        bus: Arc<EventBus>,
        clients: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            registry,
            bus,
            clients,
            supervisor: RwLock::new(None),
        }
    }

    pub async fn supervise(&self, supervisor: Arc<dyn PollSupervisor>) {
        *self.supervisor.write().await = Some(supervisor);
    }

    pub fn registry(&self) -> &Arc<dyn DeviceRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn list(&self) -> Result<Vec<Device>, ServiceError> {
        Ok(self.registry.query(&|_: &Device| true)?)
    }

    pub fn get(&self, id: Uuid) -> Result<Device, ServiceError> {
        self.registry.get(id)?.ok_or(ServiceError::NotFound(id))
    }

    /// The device record without its frame history.
    pub fn summary(&self, id: Uuid) -> Result<Device, ServiceError> {
        self.registry.summary(id)?.ok_or(ServiceError::NotFound(id))
    }

    /// Persist `device`, then hand its pending events to the bus.
    ///
    /// The caller must hold `turn` for this device.
    pub async fn commit(&self, turn: &DeviceTurn, device: &mut Device) -> Result<(), ServiceError> {
        debug_assert_eq!(turn.device_id(), device.id);
        if !self.registry.update(device)? {
            return Err(ServiceError::NotFound(device.id));
        }
        device.mark_saved();

        let events = device.take_events();
        if !events.is_empty() {
            tracing::debug!("Device {}: dispatching {} event(s)", device.id, events.len());
        }
        self.bus.dispatch(turn, events).await?;
        Ok(())
    }

    pub async fn set_status(&self, id: Uuid, status: DeviceStatus) -> Result<Device, ServiceError> {
        let turn = self.bus.turn(id).await;
        let mut device = self.summary(id)?;

        if device.set_status(status)? {
            tracing::info!("Device {} ({}): status -> {}", device.name, device.id, status);
            self.commit(&turn, &mut device).await?;
        } else if status == DeviceStatus::Recording {
            self.ensure_polling(&device).await?;
        }
        Ok(device)
    }

    /// Repeat requests for `Recording` re-create a poll job lost to an
    /// earlier failure.
    async fn ensure_polling(&self, device: &Device) -> Result<(), ServiceError> {
        let Some(supervisor) = self.supervisor.read().await.clone() else {
            return Ok(());
        };
        let created = supervisor
            .ensure_polling(device)
            .await
            .map_err(|reason| ServiceError::Polling {
                device_id: device.id,
                reason,
            })?;
        if created {
            tracing::info!("Device {} ({}): poll job restored", device.name, device.id);
        }
        Ok(())
    }

    /// Change the sample frequency on the device, then in the registry.
    pub async fn set_frequency(&self, id: Uuid, frequency: u32) -> Result<Device, ServiceError> {
        let turn = self.bus.turn(id).await;
        let mut device = self.summary(id)?;
        if device.frequency() == frequency {
            return Ok(device);
        }

        let client = self.client(&device)?;
        if !client.set_frequency(frequency).await {
            return Err(ServiceError::DeviceWrite {
                address: device.address.clone(),
                what: "frequency",
            });
        }

        device.set_frequency(frequency);
        tracing::info!("Device {} ({}): frequency -> {}s", device.name, device.id, frequency);
        self.commit(&turn, &mut device).await?;
        Ok(device)
    }

    pub async fn archive(&self, id: Uuid) -> Result<Device, ServiceError> {
        self.set_status(id, DeviceStatus::Archived).await
    }

    pub async fn apply_settings(
        &self,
        id: Uuid,
        settings: DeviceSettings,
    ) -> Result<Device, ServiceError> {
        let turn = self.bus.turn(id).await;
        let mut device = self.summary(id)?;
        let client = self.client(&device)?;
        let address = device.address.clone();
        let rejected = |what| ServiceError::DeviceWrite {
            address: address.clone(),
            what,
        };

        if let Some(filter) = settings.filter {
            if !client.set_filter(&filter).await {
                return Err(rejected("filter"));
            }
            device.filter = filter;
        }
        if let Some(sensors) = settings.sensors {
            if !client.set_sensors(sensors).await {
                return Err(rejected("sensors"));
            }
            device.sensors = sensors;
        }
        if let Some(firmware) = settings.firmware {
            if !client.set_firmware(&firmware).await {
                return Err(rejected("firmware"));
            }
            device.firmware = firmware;
        }
        if let Some(wifi) = settings.wifi {
            if !client.set_wifi(&wifi).await {
                return Err(rejected("wifi"));
            }
            device.wifi = wifi;
        }
        if settings.display_name.is_some() {
            device.display_name = settings.display_name;
        }

        self.commit(&turn, &mut device).await?;
        Ok(device)
    }

    fn client(&self, device: &Device) -> Result<Arc<dyn DeviceClient>, ServiceError> {
        let address = parse_address(&device.address)?;
        Ok(self.clients.connect(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::JobKey;
    use crate::testing::Harness;
    use std::net::Ipv4Addr;
    use std::sync::atomic::Ordering;

    const ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);

    #[tokio::test]
    async fn test_set_status_persists_before_dispatch() {
        let h = Harness::new().await;
        let (_, device) = h.add_device(ADDR, 5);

        let updated = h.service.set_status(device.id, DeviceStatus::Recording).await.unwrap();
        assert_eq!(updated.status(), DeviceStatus::Recording);
        assert!(updated.pending_events().is_empty());
        assert_eq!(h.status(&device), DeviceStatus::Recording);
        assert!(h.scheduler.contains(&JobKey::Poll(device.id)).await);

        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_transition_is_rejected() {
        let h = Harness::new().await;
        let (_, device) = h.add_device(ADDR, 5);
        h.service.archive(device.id).await.unwrap();

        let err = h
            .service
            .set_status(device.id, DeviceStatus::Recording)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Lifecycle(_)));
        assert_eq!(h.status(&device), DeviceStatus::Archived);
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let h = Harness::new().await;
        let err = h
            .service
            .set_status(Uuid::new_v4(), DeviceStatus::Stopped)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_set_frequency_writes_device_first() {
        let h = Harness::new().await;
        let (fake, device) = h.add_device(ADDR, 5);

        let updated = h.service.set_frequency(device.id, 2).await.unwrap();
        assert_eq!(updated.frequency(), 2);
        assert_eq!(fake.info.lock().unwrap().frequency, 2);

        // A device that refuses the write leaves the record untouched.
        fake.reject_writes.store(true, Ordering::SeqCst);
        let err = h.service.set_frequency(device.id, 9).await.unwrap_err();
        assert!(matches!(err, ServiceError::DeviceWrite { what: "frequency", .. }));
        assert_eq!(h.service.get(device.id).unwrap().frequency(), 2);
    }

    #[tokio::test]
    async fn test_apply_settings() {
        let h = Harness::new().await;
        let (fake, device) = h.add_device(ADDR, 5);

        let filter = Filter {
            spot: false,
            smooth: false,
            noise: true,
        };
        let settings = DeviceSettings {
            display_name: Some("Bedroom".to_string()),
            filter: Some(filter),
            sensors: Some(6),
            ..Default::default()
        };
        h.service.apply_settings(device.id, settings).await.unwrap();

        let stored = h.service.get(device.id).unwrap();
        assert_eq!(stored.display_name.as_deref(), Some("Bedroom"));
        assert_eq!(stored.filter, filter);
        assert_eq!(stored.sensors, 6);
        assert_eq!(fake.writes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_repeated_recording_restores_lost_job() {
        let h = Harness::with_capacity(1).await;
        let (_, device) = h.add_device(ADDR, 5);
        let (_, other) = h.add_device(Ipv4Addr::new(192, 168, 1, 21), 5);

        // The only slot is taken, so the first request commits without a job.
        h.service.set_status(other.id, DeviceStatus::Recording).await.unwrap();
        let err = h
            .service
            .set_status(device.id, DeviceStatus::Recording)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Dispatch(_)));
        assert_eq!(h.status(&device), DeviceStatus::Recording);
        assert!(!h.scheduler.contains(&JobKey::Poll(device.id)).await);

        // Still full: the retry reports the failure instead of succeeding silently.
        let err = h
            .service
            .set_status(device.id, DeviceStatus::Recording)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Polling { .. }));

        h.service.set_status(other.id, DeviceStatus::Stopped).await.unwrap();
        let updated = h
            .service
            .set_status(device.id, DeviceStatus::Recording)
            .await
            .unwrap();
        assert_eq!(updated.status(), DeviceStatus::Recording);
        assert!(h.scheduler.contains(&JobKey::Poll(device.id)).await);
        assert_eq!(h.scheduler.jobs().await.len(), 1);

        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_repeated_recording_keeps_running_job() {
        let h = Harness::new().await;
        let (_, device) = h.add_device(ADDR, 5);
        let recording = h.service.set_status(device.id, DeviceStatus::Recording).await.unwrap();

        h.service.set_status(device.id, DeviceStatus::Recording).await.unwrap();
        assert_eq!(h.scheduler.jobs().await.len(), 1);
        assert!(!h.orchestrator.ensure_polling(&recording).await.unwrap());

        h.scheduler.shutdown().await;
    }
}
