//! Validator registry: identities, connection state and dispatch fairness.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::HubError;
use crate::db::{Store, ValidatorId, ValidatorRecord};
use crate::location::UNKNOWN_LOCATION;

/// Connection state of a validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Authenticated,
}

/// A known validator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Validator {
    pub id: ValidatorId,
    /// Hex-encoded Ed25519 public key
    pub public_key: String,
    /// Origin the validator declared at signup
    pub origin: String,
    /// Socket address of the current or last connection
    pub peer_addr: Option<String>,
    pub location: String,
    pub state: ConnectionState,
    pub connected_at: Option<DateTime<Utc>>,
    /// Dispatch sequence number of the last check sent; 0 if none yet
    #[serde(skip)]
    pub last_dispatch: u64,
}

/// Arena of validators keyed by id, with a public key index.
///
/// Both maps are sharded so unrelated validators never contend.
pub struct Registry {
    store: Arc<Store>,
    validators: DashMap<ValidatorId, Validator>,
    by_key: DashMap<String, ValidatorId>,
    dispatch_seq: AtomicU64,
}

impl Registry {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            validators: DashMap::new(),
            by_key: DashMap::new(),
            dispatch_seq: AtomicU64::new(0),
        }
    }

    /// Look up or create the identity for `public_key`. Connection state is
    /// left to the caller.
    ///
    /// Signing up again with a known key returns the same id, including
    /// keys first seen by an earlier run of the hub.
    pub fn register(&self, public_key: &str, origin: &str) -> Result<ValidatorId, HubError> {
        let (id, location) = match self.by_key.entry(public_key.to_string()) {
            Entry::Occupied(e) => (e.get().clone(), None),
            Entry::Vacant(e) => {
                let record = match self.store.find_validator_by_key(public_key)? {
                    Some(record) => record,
                    None => {
                        let record = ValidatorRecord {
                            id: uuid::Uuid::new_v4().to_string(),
                            public_key: public_key.to_string(),
                            location: UNKNOWN_LOCATION.to_string(),
                        };
                        self.store.add_validator(&record)?;
                        tracing::info!("Registry: New validator {}", record.id);
                        record
                    }
                };
                e.insert(record.id.clone());
                (record.id, Some(record.location))
            }
        };

        self.validators
            .entry(id.clone())
            .and_modify(|v| v.origin = origin.to_string())
            .or_insert_with(|| Validator {
                id: id.clone(),
                public_key: public_key.to_string(),
                origin: origin.to_string(),
                peer_addr: None,
                location: location.unwrap_or_else(|| UNKNOWN_LOCATION.to_string()),
                state: ConnectionState::Disconnected,
                connected_at: None,
                last_dispatch: 0,
            });

        Ok(id)
    }

    pub fn lookup(&self, id: &str) -> Option<Validator> {
        self.validators.get(id).map(|v| v.clone())
    }

    pub fn mark_connected(&self, id: &str, peer_addr: SocketAddr) -> bool {
        match self.validators.get_mut(id) {
            Some(mut v) => {
                v.state = ConnectionState::Connected;
                v.peer_addr = Some(peer_addr.to_string());
                true
            }
            None => false,
        }
    }

    pub fn mark_authenticated(&self, id: &str) -> bool {
        match self.validators.get_mut(id) {
            Some(mut v) => {
                v.state = ConnectionState::Authenticated;
                v.connected_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    pub fn mark_disconnected(&self, id: &str) -> bool {
        self.set_state(id, ConnectionState::Disconnected)
    }

    fn set_state(&self, id: &str, state: ConnectionState) -> bool {
        match self.validators.get_mut(id) {
            Some(mut v) => {
                v.state = state;
                true
            }
            None => false,
        }
    }

    /// Record a resolved location label. Persisting it is best-effort.
    pub fn set_location(&self, id: &str, location: &str) {
        if let Some(mut v) = self.validators.get_mut(id) {
            v.location = location.to_string();
        }
        if let Err(e) = self.store.update_validator_location(id, location) {
            tracing::warn!("Registry: Failed to persist location for {}: {}", id, e);
        }
    }

    /// Snapshot of validators that may receive check requests.
    pub fn authenticated(&self) -> Vec<Validator> {
        let mut list: Vec<Validator> = self
            .validators
            .iter()
            .filter(|v| v.state == ConnectionState::Authenticated)
            .map(|v| v.clone())
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Pick up to `count` authenticated validators, least recently used
    /// first, and mark them as used.
    pub fn select_least_recently_used(
        &self,
        count: usize,
        exclude: &[ValidatorId],
    ) -> Vec<ValidatorId> {
        let mut candidates: Vec<(u64, ValidatorId)> = self
            .validators
            .iter()
            .filter(|v| v.state == ConnectionState::Authenticated)
            .filter(|v| !exclude.contains(&v.id))
            .map(|v| (v.last_dispatch, v.id.clone()))
            .collect();
        candidates.sort();

        let chosen: Vec<ValidatorId> = candidates
            .into_iter()
            .take(count)
            .map(|(_, id)| id)
            .collect();
        for id in &chosen {
            self.mark_dispatched(id);
        }
        chosen
    }

    pub fn mark_dispatched(&self, id: &str) {
        let seq = self.dispatch_seq.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(mut v) = self.validators.get_mut(id) {
            v.last_dispatch = seq;
        }
    }
}
