//! Wire protocol between the hub and validators.
//!
//! Every frame is a JSON object `{"type": ..., "data": {...}}`. The same two
//! tags flow in both directions with different payloads.

mod envelope;

pub use envelope::*;

use serde::{Deserialize, Serialize};

use crate::db::TickStatus;

/// Validator asks for an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    pub ip: String,
    pub public_key: String,
    pub signed_message: String,
    pub callback_id: String,
}

impl SignupRequest {
    pub fn claim(&self) -> SignupClaim<'_> {
        SignupClaim {
            callback_id: &self.callback_id,
            ip: &self.ip,
            public_key: &self.public_key,
        }
    }
}

/// Hub answers a signup with the validator's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupAck {
    pub callback_id: String,
    pub validator_id: String,
}

/// Hub asks a validator to check a URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    pub url: String,
    pub callback_id: String,
    pub website_id: String,
}

/// Validator reports the outcome of a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateReply {
    pub signed_message: String,
    pub callback_id: String,
    pub status: TickStatus,
    /// Latency in milliseconds
    pub latency: u64,
    pub website_id: String,
    pub validator_id: String,
}

impl ValidateReply {
    pub fn claim(&self) -> ValidateClaim<'_> {
        ValidateClaim {
            callback_id: &self.callback_id,
            website_id: &self.website_id,
            validator_id: &self.validator_id,
            status: self.status,
            latency: self.latency,
        }
    }
}

/// Validator → hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum IncomingMessage {
    Signup(SignupRequest),
    Validate(ValidateReply),
}

/// Hub → validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum OutgoingMessage {
    Signup(SignupAck),
    Validate(ValidateRequest),
}

/// Decode a text frame from a validator.
pub fn decode_incoming(raw: &str) -> Result<IncomingMessage, EnvelopeError> {
    serde_json::from_str(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}

/// Encode a frame for a validator.
pub fn encode_outgoing(msg: &OutgoingMessage) -> Result<String, EnvelopeError> {
    serde_json::to_string(msg).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}
