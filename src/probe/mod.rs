//! Probe module for talking to devices.
//!
//! [`DeviceClient`] is the per-device I/O boundary. Reads return `None` and
//! writes return `false` for any network failure, timeout included.

mod http;

pub use http::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::db::{Filter, Firmware, Wifi};

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("device answered with status {0}")]
    Status(u16),
}

/// Identity and settings a device reports about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "type")]
    pub class: String,
    pub name: String,
    #[serde(default)]
    pub sensors: u32,
    #[serde(default)]
    pub frequency: u32,
    #[serde(default)]
    pub filter: Filter,
}

/// A frame as sent by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramePayload {
    pub index: i64,
    pub timestamp: String,
    #[serde(default)]
    pub data: Vec<Vec<i32>>,
}

#[async_trait]
pub trait DeviceClient: Send + Sync {
    fn address(&self) -> Ipv4Addr;

    /// Short-timeout identity check used by discovery.
    async fn probe(&self) -> Option<DeviceInfo>;

    async fn info(&self) -> Option<DeviceInfo>;
    async fn sensors(&self) -> Option<u32>;
    async fn filter(&self) -> Option<Filter>;
    async fn firmware(&self) -> Option<Firmware>;
    async fn wifi(&self) -> Option<Wifi>;

    /// Frame history, optionally only frames after `since`.
    async fn frames(&self, since: Option<i64>) -> Option<Vec<FramePayload>>;

    async fn set_filter(&self, filter: &Filter) -> bool;
    async fn set_firmware(&self, firmware: &Firmware) -> bool;
    async fn set_frequency(&self, frequency: u32) -> bool;
    async fn set_sensors(&self, sensors: u32) -> bool;
    async fn set_wifi(&self, wifi: &Wifi) -> bool;
    async fn set_time(&self, time: DateTime<Utc>) -> bool;
}

/// Hands out a client for a device address.
pub trait ClientFactory: Send + Sync {
    fn connect(&self, address: Ipv4Addr) -> Arc<dyn DeviceClient>;
}

/// Parse a stored device address.
pub fn parse_address(address: &str) -> Result<Ipv4Addr, ProbeError> {
    address
        .parse()
        .map_err(|_| ProbeError::Config(format!("not an IPv4 address: {:?}", address)))
}

/// Sleep a random 0-99ms to spread out ticks that fire together.
pub async fn jitter() {
    let jitter = rand::random::<u64>() % 100;
    tokio::time::sleep(Duration::from_millis(jitter)).await;
}
