//! Configuration module for sensorfleet.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use crate::discovery::DEFAULT_MAX_SCAN_HOSTS;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "sensorfleet.db")
    pub db_path: String,
    /// Number of addresses probed at once during discovery (default: 64)
    pub probe_concurrency: usize,
    /// Timeout for a single discovery probe (default: 1500ms)
    pub probe_timeout: Duration,
    /// Timeout for every other device request (default: 5000ms)
    pub request_timeout: Duration,
    /// TCP port of the device HTTP API (default: 80)
    pub device_port: u16,
    /// Maximum number of jobs the scheduler will hold (default: 4096)
    pub max_jobs: usize,
    /// Largest number of hosts one discovery scan may cover (default: 65534, a /16)
    pub max_scan_hosts: usize,
    /// Subnet scanned once at startup, as (address, mask)
    pub startup_scan: Option<(Ipv4Addr, Ipv4Addr)>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "sensorfleet.db".to_string(),
            probe_concurrency: 64,
            probe_timeout: Duration::from_millis(1500),
            request_timeout: Duration::from_millis(5000),
            device_port: 80,
            max_jobs: 4096,
            max_scan_hosts: DEFAULT_MAX_SCAN_HOSTS,
            startup_scan: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `SENSORFLEET_HTTP_PORT`: HTTP port (default: 8080)
    /// - `SENSORFLEET_DB_PATH`: Database file path (default: "sensorfleet.db")
    /// - `SENSORFLEET_PROBE_CONCURRENCY`: discovery worker count (default: 64)
    /// - `SENSORFLEET_PROBE_TIMEOUT_MS`: probe timeout (default: 1500)
    /// - `SENSORFLEET_REQUEST_TIMEOUT_MS`: device request timeout (default: 5000)
    /// - `SENSORFLEET_DEVICE_PORT`: device API port (default: 80)
    /// - `SENSORFLEET_MAX_JOBS`: scheduler capacity (default: 4096)
    /// - `SENSORFLEET_MAX_SCAN_HOSTS`: discovery range limit (default: 65534)
    /// - `SENSORFLEET_SCAN_ADDRESS` / `SENSORFLEET_SCAN_MASK`: startup scan (default: none)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parse_var("SENSORFLEET_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Ok(db_path) = env::var("SENSORFLEET_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(n) = parse_var::<usize>("SENSORFLEET_PROBE_CONCURRENCY") {
            cfg.probe_concurrency = n.max(1);
        }

        if let Some(ms) = parse_var("SENSORFLEET_PROBE_TIMEOUT_MS") {
            cfg.probe_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_var("SENSORFLEET_REQUEST_TIMEOUT_MS") {
            cfg.request_timeout = Duration::from_millis(ms);
        }

        if let Some(port) = parse_var("SENSORFLEET_DEVICE_PORT") {
            cfg.device_port = port;
        }

        if let Some(n) = parse_var("SENSORFLEET_MAX_JOBS") {
            cfg.max_jobs = n;
        }

        if let Some(n) = parse_var("SENSORFLEET_MAX_SCAN_HOSTS") {
            cfg.max_scan_hosts = n;
        }

        let address = parse_var("SENSORFLEET_SCAN_ADDRESS");
        let mask = parse_var("SENSORFLEET_SCAN_MASK");
        if let (Some(address), Some(mask)) = (address, mask) {
            cfg.startup_scan = Some((address, mask));
        }

        cfg
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "sensorfleet.db");
        assert_eq!(cfg.probe_concurrency, 64);
        assert_eq!(cfg.device_port, 80);
        assert_eq!(cfg.max_scan_hosts, 65_534);
        assert!(cfg.startup_scan.is_none());
    }

    #[test]
    fn test_load_reads_scan_host_limit() {
        env::set_var("SENSORFLEET_MAX_SCAN_HOSTS", "1022");
        let cfg = ServerConfig::load();
        env::remove_var("SENSORFLEET_MAX_SCAN_HOSTS");
        assert_eq!(cfg.max_scan_hosts, 1022);
    }

    #[test]
    fn test_parse_var_ignores_garbage() {
        env::set_var("SENSORFLEET_TEST_GARBAGE", "not-a-number");
        assert_eq!(parse_var::<u16>("SENSORFLEET_TEST_GARBAGE"), None);

        env::set_var("SENSORFLEET_TEST_MASK", " 255.255.255.0 ");
        assert_eq!(
            parse_var::<Ipv4Addr>("SENSORFLEET_TEST_MASK"),
            Some(Ipv4Addr::new(255, 255, 255, 0))
        );
    }
}
