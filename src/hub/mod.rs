//! Coordination core: validator pool, connections and reply correlation.

mod connection;
mod correlator;
mod pending;
mod registry;

pub use connection::*;
pub use correlator::*;
pub use pending::*;
pub use registry::*;

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::db::{DbError, Store, Tick};
use crate::location::Geolocate;

/// Hub error types.
///
/// None of these reach end users: a failed correlation or authentication
/// simply produces no tick.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("stale or duplicate reply for {0}")]
    StaleOrDuplicateReply(String),
    #[error("check {0} timed out")]
    Timeout(String),
    #[error("connection to validator {0} lost")]
    ConnectionLoss(String),
    #[error("validator {0} is not connected")]
    NotConnected(String),
    #[error("store error: {0}")]
    Store(#[from] DbError),
}

/// Shared coordination state.
pub struct Hub {
    registry: Arc<Registry>,
    pending: Arc<PendingChecks>,
    connections: ConnectionManager,
}

impl Hub {
    /// Create a hub. Validated ticks are pushed into `ticks`.
    pub fn new(store: Arc<Store>, locator: Arc<dyn Geolocate>, ticks: mpsc::Sender<Tick>) -> Self {
        let registry = Arc::new(Registry::new(store));
        let pending = Arc::new(PendingChecks::new());
        let connections = ConnectionManager::new(registry.clone(), pending.clone(), locator, ticks);
        Self {
            registry,
            pending,
            connections,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pending(&self) -> &PendingChecks {
        &self.pending
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }
}
