//! Database model types and the device lifecycle.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::events::{DeviceEvent, DeviceFrequencyChangedEvent, DeviceStatusChangedEvent};
use crate::probe::{DeviceInfo, FramePayload};

/// Lifecycle state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Stopped,
    Recording,
    NotReachable,
    Archived,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Stopped => "stopped",
            DeviceStatus::Recording => "recording",
            DeviceStatus::NotReachable => "not_reachable",
            DeviceStatus::Archived => "archived",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: DeviceStatus) -> bool {
        use DeviceStatus::*;
        match self {
            Stopped => matches!(next, Recording | NotReachable | Archived),
            Recording => matches!(next, Stopped | NotReachable | Archived),
            NotReachable => matches!(next, Stopped | Archived),
            Archived => false,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(DeviceStatus::Stopped),
            "recording" => Ok(DeviceStatus::Recording),
            "not_reachable" => Ok(DeviceStatus::NotReachable),
            "archived" => Ok(DeviceStatus::Archived),
            other => Err(format!("unknown device status: {}", other)),
        }
    }
}

/// Lifecycle error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifecycleError {
    #[error("device cannot move from {from} to {to}")]
    InvalidTransition {
        from: DeviceStatus,
        to: DeviceStatus,
    },
}

/// Signal filters applied by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub spot: bool,
    pub smooth: bool,
    pub noise: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Firmware {
    pub version: String,
    pub upgrade_channel: String,
    pub source_channel: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wifi {
    pub ssid: String,
    pub mode: String,
    #[serde(default)]
    pub networks: Vec<String>,
}

/// One captured block of sensor readings.
///
/// Equality ignores `id`: two frames with the same index and timestamp are
/// the same capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: Uuid,
    pub device_id: Uuid,
    pub index: i64,
    pub timestamp: String,
    /// Rows are sensor channels, columns are samples.
    pub data: Vec<Vec<i32>>,
    /// Filter settings in effect when the frame was captured.
    pub filter: Filter,
}

impl Frame {
    pub fn new(device_id: Uuid, filter: Filter, payload: FramePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id,
            index: payload.index,
            timestamp: payload.timestamp,
            data: payload.data,
            filter,
        }
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.timestamp == other.timestamp
    }
}

impl Eq for Frame {}

/// Point-in-time view of a device carried by lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub id: Uuid,
    pub address: String,
    pub name: String,
    pub status: DeviceStatus,
    pub frequency: u32,
    pub sensors: u32,
}

/// A network-attached sensing device.
///
/// `status` and `frequency` are private: they change only through
/// [`Device::set_status`] and [`Device::set_frequency`], which record a
/// pending event for every real change.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: Uuid,
    pub address: String,
    pub class: String,
    pub display_name: Option<String>,
    pub name: String,
    frequency: u32,
    pub sensors: u32,
    status: DeviceStatus,
    pub filter: Filter,
    pub firmware: Firmware,
    pub wifi: Wifi,
    pub frames: Vec<Frame>,
    /// Trailing frames merged since the record was loaded or last saved.
    #[serde(skip)]
    unsaved: usize,
    #[serde(skip)]
    events: Vec<DeviceEvent>,
}

impl Device {
    /// Build a new `Stopped` device from probed metadata.
    pub fn new(address: impl Into<String>, info: &DeviceInfo) -> Self {
        Self {
            id: Uuid::new_v4(),
            address: address.into(),
            class: info.class.clone(),
            display_name: None,
            name: info.name.clone(),
            frequency: info.frequency,
            sensors: info.sensors,
            status: DeviceStatus::Stopped,
            filter: info.filter,
            firmware: Firmware::default(),
            wifi: Wifi::default(),
            frames: Vec::new(),
            unsaved: 0,
            events: Vec::new(),
        }
    }

    /// Rehydrate persisted lifecycle fields without raising events.
    pub(super) fn with_state(mut self, status: DeviceStatus, frequency: u32) -> Self {
        self.status = status;
        self.frequency = frequency;
        self
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.id,
            address: self.address.clone(),
            name: self.name.clone(),
            status: self.status,
            frequency: self.frequency,
            sensors: self.sensors,
        }
    }

    /// Move the device to `status`.
    ///
    /// Returns `Ok(false)` without raising an event when the value is absent
    /// or equal to the current one.
    pub fn set_status(
        &mut self,
        status: impl Into<Option<DeviceStatus>>,
    ) -> Result<bool, LifecycleError> {
        let Some(status) = status.into() else {
            return Ok(false);
        };
        if status == self.status {
            return Ok(false);
        }
        if !self.status.can_transition_to(status) {
            return Err(LifecycleError::InvalidTransition {
                from: self.status,
                to: status,
            });
        }

        let before = self.snapshot();
        self.status = status;
        self.events
            .push(DeviceEvent::StatusChanged(DeviceStatusChangedEvent {
                device: before,
                status,
            }));
        Ok(true)
    }

    /// Change the sample frequency in seconds.
    ///
    /// Returns `false` without raising an event when the value is absent or
    /// unchanged.
    pub fn set_frequency(&mut self, frequency: impl Into<Option<u32>>) -> bool {
        let Some(frequency) = frequency.into() else {
            return false;
        };
        if frequency == self.frequency {
            return false;
        }

        let before = self.snapshot();
        self.frequency = frequency;
        self.events
            .push(DeviceEvent::FrequencyChanged(DeviceFrequencyChangedEvent {
                device: before,
                frequency,
            }));
        true
    }

    pub fn pending_events(&self) -> &[DeviceEvent] {
        &self.events
    }

    /// Drain pending events. Called by the commit boundary after persisting.
    pub fn take_events(&mut self) -> Vec<DeviceEvent> {
        std::mem::take(&mut self.events)
    }

    /// Highest stored frame index, if any.
    pub fn last_frame_index(&self) -> Option<i64> {
        self.frames.iter().map(|f| f.index).max()
    }

    /// Append frames not already present by (index, timestamp).
    ///
    /// Returns the number of frames added.
    pub fn merge_frames(&mut self, payloads: Vec<FramePayload>) -> usize {
        let mut seen: HashSet<(i64, String)> = self
            .frames
            .iter()
            .map(|f| (f.index, f.timestamp.clone()))
            .collect();

        let mut added = 0;
        for payload in payloads {
            if seen.insert((payload.index, payload.timestamp.clone())) {
                self.frames.push(Frame::new(self.id, self.filter, payload));
                added += 1;
            }
        }
        self.unsaved += added;
        added
    }

    /// Frames merged since the record was loaded or last saved.
    pub fn unsaved_frames(&self) -> &[Frame] {
        let start = self.frames.len().saturating_sub(self.unsaved);
        &self.frames[start..]
    }

    /// Called by the commit boundary once the record is persisted.
    pub fn mark_saved(&mut self) {
        self.unsaved = 0;
    }
}
