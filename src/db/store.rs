//! Device registry and its SQLite implementation.

use rusqlite::{params, Connection, OptionalExtension, Row, Result as SqlResult, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

use super::models::*;
use crate::probe::DeviceInfo;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("JSON error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("connection lock poisoned")]
    Poisoned,
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Keyed store of device records.
///
/// `get` returns the device with its frame history. `summary` and `query`
/// return device rows only.
pub trait DeviceRegistry: Send + Sync {
    /// Insert a device. Returns `false` when the id or a live record at the
    /// same address already exists.
    fn create(&self, device: &Device) -> Result<bool, DbError>;

    fn get(&self, id: Uuid) -> Result<Option<Device>, DbError>;

    /// The device row without its frame history.
    fn summary(&self, id: Uuid) -> Result<Option<Device>, DbError>;

    /// Write the device row and its unsaved frames. Returns `false` when no
    /// record has this id.
    fn update(&self, device: &Device) -> Result<bool, DbError>;

    /// Store frames for one device, skipping captures already stored.
    /// Returns the number of rows written.
    fn append_frames(&self, frames: &[Frame]) -> Result<usize, DbError>;

    /// Highest stored frame index of a device.
    fn last_frame_index(&self, id: Uuid) -> Result<Option<i64>, DbError>;

    /// Remove the device and its frames.
    fn delete(&self, id: Uuid) -> Result<bool, DbError>;

    fn query(&self, predicate: &dyn Fn(&Device) -> bool) -> Result<Vec<Device>, DbError>;

    /// The non-archived record at `address`, if any.
    fn find_live(&self, address: &str) -> Result<Option<Device>, DbError> {
        let mut found = self.query(&|d: &Device| {
            d.address == address && d.status() != DeviceStatus::Archived
        })?;
        Ok(found.pop())
    }
}

const DEVICE_COLUMNS: &str = "id, address, class, display_name, name, frequency, sensors, status, \
     filter_spot, filter_smooth, filter_noise, fw_version, fw_upgrade_channel, fw_source_channel, \
     wifi_ssid, wifi_mode, wifi_networks";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    fn load_row(conn: &Connection, id: Uuid) -> Result<Option<Device>, DbError> {
        let raw = conn
            .query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"),
                params![id.to_string()],
                RawDevice::from_row,
            )
            .optional()?;
        raw.map(RawDevice::into_device).transpose()
    }

    fn load_frames(conn: &Connection, device_id: Uuid) -> Result<Vec<Frame>, DbError> {
        let mut stmt = conn.prepare(
            "SELECT id, device_id, idx, timestamp, data, filter_spot, filter_smooth, filter_noise
             FROM frames WHERE device_id = ?1 ORDER BY idx ASC",
        )?;
        let raw = stmt
            .query_map(params![device_id.to_string()], RawFrame::from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        raw.into_iter().map(RawFrame::into_frame).collect()
    }
}

impl DeviceRegistry for Store {
    fn create(&self, device: &Device) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let networks = serde_json::to_string(&device.wifi.networks)?;
        let inserted = tx.execute(
            &format!("INSERT OR IGNORE INTO devices ({DEVICE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"),
            params![
                device.id.to_string(),
                device.address,
                device.class,
                device.display_name,
                device.name,
                device.frequency(),
                device.sensors,
                device.status().as_str(),
                device.filter.spot,
                device.filter.smooth,
                device.filter.noise,
                device.firmware.version,
                device.firmware.upgrade_channel,
                device.firmware.source_channel,
                device.wifi.ssid,
                device.wifi.mode,
                networks,
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }

        insert_frames(&tx, &device.frames)?;
        tx.commit()?;
        Ok(true)
    }

    fn get(&self, id: Uuid) -> Result<Option<Device>, DbError> {
        let conn = self.conn()?;
        let Some(mut device) = Self::load_row(&conn, id)? else {
            return Ok(None);
        };
        device.frames = Self::load_frames(&conn, id)?;
        Ok(Some(device))
    }

    fn summary(&self, id: Uuid) -> Result<Option<Device>, DbError> {
        let conn = self.conn()?;
        Self::load_row(&conn, id)
    }

    fn update(&self, device: &Device) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let networks = serde_json::to_string(&device.wifi.networks)?;
        let updated = tx.execute(
            "UPDATE devices SET address=?1, class=?2, display_name=?3, name=?4, frequency=?5, sensors=?6,
             status=?7, filter_spot=?8, filter_smooth=?9, filter_noise=?10, fw_version=?11,
             fw_upgrade_channel=?12, fw_source_channel=?13, wifi_ssid=?14, wifi_mode=?15, wifi_networks=?16
             WHERE id=?17",
            params![
                device.address,
                device.class,
                device.display_name,
                device.name,
                device.frequency(),
                device.sensors,
                device.status().as_str(),
                device.filter.spot,
                device.filter.smooth,
                device.filter.noise,
                device.firmware.version,
                device.firmware.upgrade_channel,
                device.firmware.source_channel,
                device.wifi.ssid,
                device.wifi.mode,
                networks,
                device.id.to_string(),
            ],
        )?;
        if updated == 0 {
            return Ok(false);
        }

        insert_frames(&tx, device.unsaved_frames())?;
        tx.commit()?;
        Ok(true)
    }

    fn append_frames(&self, frames: &[Frame]) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let written = insert_frames(&tx, frames)?;
        tx.commit()?;
        Ok(written)
    }

    fn last_frame_index(&self, id: Uuid) -> Result<Option<i64>, DbError> {
        let conn = self.conn()?;
        let last = conn.query_row(
            "SELECT MAX(idx) FROM frames WHERE device_id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(last)
    }

    fn delete(&self, id: Uuid) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM frames WHERE device_id = ?1", params![id.to_string()])?;
        let deleted = tx.execute("DELETE FROM devices WHERE id = ?1", params![id.to_string()])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    fn query(&self, predicate: &dyn Fn(&Device) -> bool) -> Result<Vec<Device>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {DEVICE_COLUMNS} FROM devices"))?;
        let raw = stmt
            .query_map([], RawDevice::from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut devices = Vec::with_capacity(raw.len());
        for r in raw {
            let device = r.into_device()?;
            if predicate(&device) {
                devices.push(device);
            }
        }
        Ok(devices)
    }
}

/// Insert frames, ignoring captures the device already has. Returns the
/// number of rows written.
fn insert_frames(tx: &Transaction<'_>, frames: &[Frame]) -> Result<usize, DbError> {
    if frames.is_empty() {
        return Ok(0);
    }

    let mut stmt = tx.prepare(
        "INSERT OR IGNORE INTO frames (id, device_id, idx, timestamp, data, filter_spot, filter_smooth, filter_noise)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    let mut written = 0;
    for f in frames {
        written += stmt.execute(params![
            f.id.to_string(),
            f.device_id.to_string(),
            f.index,
            f.timestamp,
            serde_json::to_string(&f.data)?,
            f.filter.spot,
            f.filter.smooth,
            f.filter.noise,
        ])?;
    }
    Ok(written)
}

fn parse_uuid(s: &str) -> Result<Uuid, DbError> {
    Uuid::parse_str(s).map_err(|e| DbError::Corrupt(format!("bad id {}: {}", s, e)))
}

/// Device row as stored, before validation.
struct RawDevice {
    id: String,
    address: String,
    class: String,
    display_name: Option<String>,
    name: String,
    frequency: u32,
    sensors: u32,
    status: String,
    filter: Filter,
    firmware: Firmware,
    wifi_ssid: String,
    wifi_mode: String,
    wifi_networks: String,
}

impl RawDevice {
    fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            address: row.get(1)?,
            class: row.get(2)?,
            display_name: row.get(3)?,
            name: row.get(4)?,
            frequency: row.get(5)?,
            sensors: row.get(6)?,
            status: row.get(7)?,
            filter: Filter {
                spot: row.get(8)?,
                smooth: row.get(9)?,
                noise: row.get(10)?,
            },
            firmware: Firmware {
                version: row.get(11)?,
                upgrade_channel: row.get(12)?,
                source_channel: row.get(13)?,
            },
            wifi_ssid: row.get(14)?,
            wifi_mode: row.get(15)?,
            wifi_networks: row.get(16)?,
        })
    }

    fn into_device(self) -> Result<Device, DbError> {
        let status: DeviceStatus = self.status.parse().map_err(DbError::Corrupt)?;
        let info = DeviceInfo {
            class: self.class,
            name: self.name,
            sensors: self.sensors,
            frequency: self.frequency,
            filter: self.filter,
        };

        let mut device = Device::new(self.address, &info).with_state(status, self.frequency);
        device.id = parse_uuid(&self.id)?;
        device.display_name = self.display_name;
        device.firmware = self.firmware;
        device.wifi = Wifi {
            ssid: self.wifi_ssid,
            mode: self.wifi_mode,
            networks: serde_json::from_str(&self.wifi_networks)?,
        };
        Ok(device)
    }
}

struct RawFrame {
    id: String,
    device_id: String,
    index: i64,
    timestamp: String,
    data: String,
    filter: Filter,
}

impl RawFrame {
    fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            device_id: row.get(1)?,
            index: row.get(2)?,
            timestamp: row.get(3)?,
            data: row.get(4)?,
            filter: Filter {
                spot: row.get(5)?,
                smooth: row.get(6)?,
                noise: row.get(7)?,
            },
        })
    }

    fn into_frame(self) -> Result<Frame, DbError> {
        Ok(Frame {
            id: parse_uuid(&self.id)?,
            device_id: parse_uuid(&self.device_id)?,
            index: self.index,
            timestamp: self.timestamp,
            data: serde_json::from_str(&self.data)?,
            filter: self.filter,
        })
    }
}
