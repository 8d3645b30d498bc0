//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type WebsiteId = String;
pub type ValidatorId = String;

/// A monitored website.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Website {
    pub id: WebsiteId,
    pub user_id: String,
    pub url: String,
    pub disabled: bool,
}

/// Outcome a validator reported for one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickStatus {
    Good,
    Bad,
}

impl TickStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickStatus::Good => "good",
            TickStatus::Bad => "bad",
        }
    }
}

impl fmt::Display for TickStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TickStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "good" => Ok(TickStatus::Good),
            "bad" => Ok(TickStatus::Bad),
            other => Err(format!("unknown tick status: {}", other)),
        }
    }
}

/// One recorded check result. Never modified after it is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    pub website_id: WebsiteId,
    pub validator_id: ValidatorId,
    pub status: TickStatus,
    /// Latency in milliseconds
    pub latency: u64,
    pub timestamp: DateTime<Utc>,
}

/// Persisted validator identity, keyed by public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorRecord {
    pub id: ValidatorId,
    /// Hex-encoded Ed25519 public key
    pub public_key: String,
    pub location: String,
}
