//! Best-effort mapping of a validator's network origin to a location label.

use async_trait::async_trait;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

pub const UNKNOWN_LOCATION: &str = "unknown";

/// Resolves an IP address to a human readable location.
#[async_trait]
pub trait Geolocate: Send + Sync {
    /// Never fails: lookups that go wrong yield [`UNKNOWN_LOCATION`].
    async fn locate(&self, ip: &str) -> String;
}

/// Response from the ipinfo.io geolocation service
#[derive(Debug, Deserialize)]
struct IpInfoResponse {
    #[serde(default)]
    city: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    country: String,
}

impl IpInfoResponse {
    fn label(&self) -> String {
        let parts: Vec<&str> = [&self.city, &self.region, &self.country]
            .into_iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();

        if parts.is_empty() {
            UNKNOWN_LOCATION.to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Looks locations up at ipinfo.io.
pub struct IpInfoLocator {
    client: reqwest::Client,
    base_url: String,
}

impl IpInfoLocator {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: "https://ipinfo.io".to_string(),
        }
    }

    async fn fetch(&self, ip: &str) -> Result<String, reqwest::Error> {
        let info = self
            .client
            .get(format!("{}/{}/json", self.base_url, ip))
            .send()
            .await?
            .error_for_status()?
            .json::<IpInfoResponse>()
            .await?;
        Ok(info.label())
    }
}

impl Default for IpInfoLocator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Geolocate for IpInfoLocator {
    async fn locate(&self, ip: &str) -> String {
        if !is_public_ip(ip) {
            return UNKNOWN_LOCATION.to_string();
        }

        match self.fetch(ip).await {
            Ok(label) => label,
            Err(e) => {
                tracing::warn!("Failed to get location for {}: {}", ip, e);
                UNKNOWN_LOCATION.to_string()
            }
        }
    }
}

/// Used when lookups are turned off.
pub struct NoLocation;

#[async_trait]
impl Geolocate for NoLocation {
    async fn locate(&self, _ip: &str) -> String {
        UNKNOWN_LOCATION.to_string()
    }
}

/// Whether an address is worth asking a geolocation service about.
fn is_public_ip(ip: &str) -> bool {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        Ok(IpAddr::V6(v6)) => !(v6.is_loopback() || v6.is_unspecified()),
        Err(_) => false,
    }
}
