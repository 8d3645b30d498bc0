//! Ed25519 signing and verification of message claims.
//!
//! Only the semantic fields of a message are signed, serialized as compact
//! JSON with a fixed field order. The transport envelope (`type`/`data`
//! wrapper, the `signedMessage` field itself) never takes part.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::Serialize;
use thiserror::Error;

use crate::db::TickStatus;

/// Envelope error types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The message could not be decoded at all.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// The message decoded but its signature does not match.
    #[error("signature verification failed")]
    BadSignature,
}

/// Claim signed by a validator when it signs up.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupClaim<'a> {
    pub callback_id: &'a str,
    pub ip: &'a str,
    pub public_key: &'a str,
}

/// Claim signed by a validator when it reports a check result.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateClaim<'a> {
    pub callback_id: &'a str,
    pub website_id: &'a str,
    pub validator_id: &'a str,
    pub status: TickStatus,
    pub latency: u64,
}

/// Canonical bytes of a claim.
pub fn canonical_bytes<T: Serialize>(claim: &T) -> Result<Vec<u8>, EnvelopeError> {
    serde_json::to_vec(claim).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}

/// Ed25519 keypair as held by a validator.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::RngCore::fill_bytes(&mut OsRng, &mut secret);
        Self::from_secret_bytes(&secret)
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    /// Public key as lowercase hex, the form used on the wire.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a payload, returning the hex signature.
    pub fn sign(&self, payload: &[u8]) -> String {
        sign(payload, &self.signing_key)
    }

    /// Sign the canonical form of a claim.
    pub fn sign_claim<T: Serialize>(&self, claim: &T) -> Result<String, EnvelopeError> {
        Ok(self.sign(&canonical_bytes(claim)?))
    }
}

/// Sign raw bytes. Returns the 64-byte signature as hex.
pub fn sign(payload: &[u8], key: &SigningKey) -> String {
    hex::encode(key.sign(payload).to_bytes())
}

/// Decode a hex public key into a verifying key.
pub fn parse_public_key(public_key_hex: &str) -> Result<VerifyingKey, EnvelopeError> {
    let bytes = hex::decode(public_key_hex)
        .map_err(|e| EnvelopeError::Malformed(format!("public key: {}", e)))?;
    let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        EnvelopeError::Malformed(format!("public key: expected 32 bytes, found {}", bytes.len()))
    })?;
    VerifyingKey::from_bytes(&arr)
        .map_err(|e| EnvelopeError::Malformed(format!("public key: {}", e)))
}

/// Verify a hex signature over `payload`.
///
/// Returns `Ok(true)` if valid, `Ok(false)` if the signature doesn't match,
/// or `Err` if the key or signature cannot be decoded.
pub fn verify(
    payload: &[u8],
    signature_hex: &str,
    public_key_hex: &str,
) -> Result<bool, EnvelopeError> {
    let key = parse_public_key(public_key_hex)?;

    let bytes = hex::decode(signature_hex)
        .map_err(|e| EnvelopeError::Malformed(format!("signature: {}", e)))?;
    let arr: [u8; 64] = bytes.as_slice().try_into().map_err(|_| {
        EnvelopeError::Malformed(format!("signature: expected 64 bytes, found {}", bytes.len()))
    })?;
    let signature = Signature::from_bytes(&arr);

    Ok(key.verify(payload, &signature).is_ok())
}

/// Verify a claim, folding a mismatch into [`EnvelopeError::BadSignature`].
pub fn verify_claim<T: Serialize>(
    claim: &T,
    signature_hex: &str,
    public_key_hex: &str,
) -> Result<(), EnvelopeError> {
    if verify(&canonical_bytes(claim)?, signature_hex, public_key_hex)? {
        Ok(())
    } else {
        Err(EnvelopeError::BadSignature)
    }
}
