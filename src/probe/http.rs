//! HTTP device client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use super::{ClientFactory, DeviceClient, DeviceInfo, FramePayload, ProbeError};
use crate::db::{Filter, Firmware, Wifi};

#[derive(Serialize, Deserialize)]
struct SensorsBody {
    sensors: u32,
}

#[derive(Serialize)]
struct FrequencyBody {
    frequency: u32,
}

#[derive(Serialize)]
struct TimeBody {
    time: DateTime<Utc>,
}

/// Creates [`HttpDeviceClient`]s sharing one connection pool.
#[derive(Clone)]
pub struct HttpClientFactory {
    http: reqwest::Client,
    port: u16,
    request_timeout: Duration,
    probe_timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(
        request_timeout: Duration,
        probe_timeout: Duration,
        port: u16,
    ) -> Result<Self, ProbeError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;

        Ok(Self {
            http,
            port,
            request_timeout,
            probe_timeout,
        })
    }
}

impl ClientFactory for HttpClientFactory {
    fn connect(&self, address: Ipv4Addr) -> Arc<dyn DeviceClient> {
        Arc::new(HttpDeviceClient {
            address: SocketAddrV4::new(address, self.port),
            base: format!("http://{}:{}", address, self.port),
            http: self.http.clone(),
            request_timeout: self.request_timeout,
            probe_timeout: self.probe_timeout,
        })
    }
}

/// JSON-over-HTTP client for a single device.
pub struct HttpDeviceClient {
    address: SocketAddrV4,
    base: String,
    http: reqwest::Client,
    request_timeout: Duration,
    probe_timeout: Duration,
}

impl HttpDeviceClient {
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<T, ProbeError> {
        let response = self
            .http
            .get(format!("{}{}", self.base, path))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_err(e, timeout))?;
        let response = check_status(response)?;
        response.json::<T>().await.map_err(|e| map_err(e, timeout))
    }

    async fn put_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), ProbeError> {
        let timeout = self.request_timeout;
        let response = self
            .http
            .put(format!("{}{}", self.base, path))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| map_err(e, timeout))?;
        check_status(response)?;
        Ok(())
    }

    fn read<T>(&self, what: &str, result: Result<T, ProbeError>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::debug!("Device {}: {} read failed: {}", self.address, what, e);
                None
            }
        }
    }

    fn write(&self, what: &str, result: Result<(), ProbeError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Device {}: {} write failed: {}", self.address, what, e);
                false
            }
        }
    }
}

fn map_err(e: reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout(timeout)
    } else {
        ProbeError::Network(e.to_string())
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProbeError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(ProbeError::Status(status.as_u16()))
    }
}

#[async_trait]
impl DeviceClient for HttpDeviceClient {
    fn address(&self) -> Ipv4Addr {
        *self.address.ip()
    }

    async fn probe(&self) -> Option<DeviceInfo> {
        let result = self.get_json("/api/info", self.probe_timeout).await;
        self.read("probe", result)
    }

    async fn info(&self) -> Option<DeviceInfo> {
        let result = self.get_json("/api/info", self.request_timeout).await;
        self.read("info", result)
    }

    async fn sensors(&self) -> Option<u32> {
        let result = self.get_json::<SensorsBody>("/api/sensors", self.request_timeout).await;
        self.read("sensors", result).map(|b| b.sensors)
    }

    async fn filter(&self) -> Option<Filter> {
        let result = self.get_json("/api/filter", self.request_timeout).await;
        self.read("filter", result)
    }

    async fn firmware(&self) -> Option<Firmware> {
        let result = self.get_json("/api/firmware", self.request_timeout).await;
        self.read("firmware", result)
    }

    async fn wifi(&self) -> Option<Wifi> {
        let result = self.get_json("/api/wifi", self.request_timeout).await;
        self.read("wifi", result)
    }

    async fn frames(&self, since: Option<i64>) -> Option<Vec<FramePayload>> {
        let path = match since {
            Some(index) => format!("/api/frames?since={}", index),
            None => "/api/frames".to_string(),
        };
        let result = self.get_json(&path, self.request_timeout).await;
        self.read("frames", result)
    }

    async fn set_filter(&self, filter: &Filter) -> bool {
        let result = self.put_json("/api/filter", filter).await;
        self.write("filter", result)
    }

    async fn set_firmware(&self, firmware: &Firmware) -> bool {
        let result = self.put_json("/api/firmware", firmware).await;
        self.write("firmware", result)
    }

    async fn set_frequency(&self, frequency: u32) -> bool {
        let result = self.put_json("/api/frequency", &FrequencyBody { frequency }).await;
        self.write("frequency", result)
    }

    async fn set_sensors(&self, sensors: u32) -> bool {
        let result = self.put_json("/api/sensors", &SensorsBody { sensors }).await;
        self.write("sensors", result)
    }

    async fn set_wifi(&self, wifi: &Wifi) -> bool {
        let result = self.put_json("/api/wifi", wifi).await;
        self.write("wifi", result)
    }

    async fn set_time(&self, time: DateTime<Utc>) -> bool {
        let result = self.put_json("/api/time", &TimeBody { time }).await;
        self.write("time", result)
    }
}
