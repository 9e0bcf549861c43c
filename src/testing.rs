//! In-memory device doubles for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;

use crate::db::{Device, DeviceRegistry, DeviceStatus, Filter, Firmware, Store, Wifi};
use crate::devices::DeviceService;
use crate::events::{EventBus, EventKind};
use crate::probe::{ClientFactory, DeviceClient, DeviceInfo, FramePayload};
use crate::scheduler::{JobOrchestrator, Scheduler};

/// A simulated device answering on one address.
pub struct FakeDevice {
    pub info: Mutex<DeviceInfo>,
    pub firmware: Firmware,
    pub wifi: Wifi,
    pub frames: Mutex<Vec<FramePayload>>,
    pub reachable: AtomicBool,
    pub reject_writes: AtomicBool,
    pub clock_writes: AtomicUsize,
    pub writes: AtomicUsize,
}

impl FakeDevice {
    pub fn new(name: &str, frequency: u32) -> Arc<Self> {
        Arc::new(Self {
            info: Mutex::new(DeviceInfo {
                class: "pressure-mat".to_string(),
                name: name.to_string(),
                sensors: 4,
                frequency,
                filter: Filter {
                    spot: true,
                    smooth: true,
                    noise: false,
                },
            }),
            firmware: Firmware {
                version: "2.1.0".to_string(),
                upgrade_channel: "stable".to_string(),
                source_channel: "factory".to_string(),
            },
            wifi: Wifi {
                ssid: "lab".to_string(),
                mode: "station".to_string(),
                networks: vec!["lab".to_string(), "guest".to_string()],
            },
            frames: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            reject_writes: AtomicBool::new(false),
            clock_writes: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        })
    }

    pub fn push_frame(&self, index: i64) {
        self.frames.lock().unwrap().push(frame(index));
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn up(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn write(&self) -> bool {
        if !self.up() || self.reject_writes.load(Ordering::SeqCst) {
            return false;
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        true
    }
}

pub fn frame(index: i64) -> FramePayload {
    FramePayload {
        index,
        timestamp: format!("2024-05-01T10:00:{:02}", index),
        data: vec![vec![index as i32; 4]; 2],
    }
}

/// Factory over a fixed set of fake devices. Counts probes and tracks the
/// highest number of probes in flight at once.
#[derive(Default)]
pub struct FakeFactory {
    devices: Mutex<HashMap<Ipv4Addr, Arc<FakeDevice>>>,
    pub probes: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    pub max_in_flight: Arc<AtomicUsize>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, address: Ipv4Addr, device: Arc<FakeDevice>) {
        self.devices.lock().unwrap().insert(address, device);
    }
}

impl ClientFactory for FakeFactory {
    fn connect(&self, address: Ipv4Addr) -> Arc<dyn DeviceClient> {
        Arc::new(FakeClient {
            address,
            device: self.devices.lock().unwrap().get(&address).cloned(),
            probes: self.probes.clone(),
            in_flight: self.in_flight.clone(),
            max_in_flight: self.max_in_flight.clone(),
        })
    }
}

struct FakeClient {
    address: Ipv4Addr,
    device: Option<Arc<FakeDevice>>,
    probes: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl FakeClient {
    fn live(&self) -> Option<&FakeDevice> {
        self.device.as_deref().filter(|d| d.up())
    }
}

#[async_trait]
impl DeviceClient for FakeClient {
    fn address(&self) -> Ipv4Addr {
        self.address
    }

    async fn probe(&self) -> Option<DeviceInfo> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.info().await
    }

    async fn info(&self) -> Option<DeviceInfo> {
        self.live().map(|d| d.info.lock().unwrap().clone())
    }

    async fn sensors(&self) -> Option<u32> {
        self.live().map(|d| d.info.lock().unwrap().sensors)
    }

    async fn filter(&self) -> Option<Filter> {
        self.live().map(|d| d.info.lock().unwrap().filter)
    }

    async fn firmware(&self) -> Option<Firmware> {
        self.live().map(|d| d.firmware.clone())
    }

    async fn wifi(&self) -> Option<Wifi> {
        self.live().map(|d| d.wifi.clone())
    }

    async fn frames(&self, since: Option<i64>) -> Option<Vec<FramePayload>> {
        self.live().map(|d| {
            d.frames
                .lock()
                .unwrap()
                .iter()
                .filter(|f| since.map_or(true, |s| f.index > s))
                .cloned()
                .collect()
        })
    }

    async fn set_filter(&self, filter: &Filter) -> bool {
        match self.live() {
            Some(d) if d.write() => {
                d.info.lock().unwrap().filter = *filter;
                true
            }
            _ => false,
        }
    }

    async fn set_firmware(&self, _firmware: &Firmware) -> bool {
        self.live().is_some_and(|d| d.write())
    }

    async fn set_frequency(&self, frequency: u32) -> bool {
        match self.live() {
            Some(d) if d.write() => {
                d.info.lock().unwrap().frequency = frequency;
                true
            }
            _ => false,
        }
    }

    async fn set_sensors(&self, sensors: u32) -> bool {
        match self.live() {
            Some(d) if d.write() => {
                d.info.lock().unwrap().sensors = sensors;
                true
            }
            _ => false,
        }
    }

    async fn set_wifi(&self, _wifi: &Wifi) -> bool {
        self.live().is_some_and(|d| d.write())
    }

    async fn set_time(&self, _time: DateTime<Utc>) -> bool {
        match self.live() {
            Some(d) if d.write() => {
                d.clock_writes.fetch_add(1, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }
}

/// A fully wired core on a temporary database.
pub struct Harness {
    _db: NamedTempFile,
    pub registry: Arc<dyn DeviceRegistry>,
    pub clients: Arc<FakeFactory>,
    pub service: Arc<DeviceService>,
    pub scheduler: Arc<Scheduler>,
    pub orchestrator: Arc<JobOrchestrator>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_capacity(64).await
    }

    pub async fn with_capacity(max_jobs: usize) -> Self {
        let db = NamedTempFile::new().unwrap();
        let registry: Arc<dyn DeviceRegistry> = Arc::new(Store::new(db.path()).unwrap());
        let bus = Arc::new(EventBus::new());
        let clients = FakeFactory::new();
        let service = Arc::new(DeviceService::new(
            registry.clone(),
            bus.clone(),
            clients.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(max_jobs));
        let orchestrator = Arc::new(JobOrchestrator::new(
            scheduler.clone(),
            service.clone(),
            clients.clone(),
        ));
        bus.subscribe(EventKind::StatusChanged, orchestrator.clone())
            .await;
        bus.subscribe(EventKind::FrequencyChanged, orchestrator.clone())
            .await;
        service.supervise(orchestrator.clone()).await;

        Self {
            _db: db,
            registry,
            clients,
            service,
            scheduler,
            orchestrator,
        }
    }

    /// Register a fake device and a matching `Stopped` record.
    pub fn add_device(&self, address: Ipv4Addr, frequency: u32) -> (Arc<FakeDevice>, Device) {
        let fake = FakeDevice::new(&format!("mat-{}", address.octets()[3]), frequency);
        self.clients.add(address, fake.clone());

        let info = fake.info.lock().unwrap().clone();
        let device = Device::new(address.to_string(), &info);
        assert!(self.registry.create(&device).unwrap());
        (fake, device)
    }

    pub fn status(&self, device: &Device) -> DeviceStatus {
        self.registry.summary(device.id).unwrap().unwrap().status()
    }
}
