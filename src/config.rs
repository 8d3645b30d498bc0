//! Configuration module for Vantage.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API and validator socket (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "vantage.db")
    pub db_path: String,
    /// Minimum time between scheduled checks of one website (default: 60s)
    pub check_interval: Duration,
    /// How often the scheduler looks for due websites (default: 10s)
    pub schedule_interval: Duration,
    /// Deadline for a validator to answer a check request (default: 30s)
    pub check_timeout: Duration,
    /// How often expired checks are swept (default: 1s)
    pub sweep_interval: Duration,
    /// Number of validators asked to check a website per pass (default: 3)
    pub fan_out: usize,
    /// Width of one status bucket (default: 180s)
    pub bucket_width: Duration,
    /// Number of status buckets in the trailing window (default: 10)
    pub window_count: usize,
    /// Resolve validator origins to a location label (default: true)
    pub location_lookup: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "vantage.db".to_string(),
            check_interval: Duration::from_secs(60),
            schedule_interval: Duration::from_secs(10),
            check_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            fan_out: 3,
            bucket_width: Duration::from_secs(180),
            window_count: 10,
            location_lookup: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `VANTAGE_HTTP_PORT`: HTTP port (default: 8080)
    /// - `VANTAGE_DB_PATH`: Database file path (default: "vantage.db")
    /// - `VANTAGE_CHECK_INTERVAL_SECS`: per-website check interval (default: 60)
    /// - `VANTAGE_SCHEDULE_INTERVAL_SECS`: scheduling pass period (default: 10)
    /// - `VANTAGE_CHECK_TIMEOUT_SECS`: reply deadline (default: 30)
    /// - `VANTAGE_SWEEP_INTERVAL_SECS`: deadline sweep period (default: 1)
    /// - `VANTAGE_FAN_OUT`: validators per website per pass (default: 3)
    /// - `VANTAGE_BUCKET_SECS`: status bucket width (default: 180)
    /// - `VANTAGE_WINDOW_COUNT`: number of status buckets (default: 10)
    /// - `VANTAGE_LOCATION_LOOKUP`: `true`/`false` (default: true)
    ///
    /// Unparseable or zero values keep the default.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parse_var("VANTAGE_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Ok(db_path) = env::var("VANTAGE_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(secs) = parse_positive("VANTAGE_CHECK_INTERVAL_SECS") {
            cfg.check_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_positive("VANTAGE_SCHEDULE_INTERVAL_SECS") {
            cfg.schedule_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_positive("VANTAGE_CHECK_TIMEOUT_SECS") {
            cfg.check_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_positive("VANTAGE_SWEEP_INTERVAL_SECS") {
            cfg.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(n) = parse_positive("VANTAGE_FAN_OUT") {
            cfg.fan_out = n as usize;
        }
        if let Some(secs) = parse_positive("VANTAGE_BUCKET_SECS") {
            cfg.bucket_width = Duration::from_secs(secs);
        }
        if let Some(n) = parse_positive("VANTAGE_WINDOW_COUNT") {
            cfg.window_count = n as usize;
        }

        if let Some(enabled) = parse_var("VANTAGE_LOCATION_LOOKUP") {
            cfg.location_lookup = enabled;
        }

        cfg
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok()?.trim().parse().ok()
}

fn parse_positive(name: &str) -> Option<u64> {
    parse_var::<u64>(name).filter(|v| *v > 0)
}
