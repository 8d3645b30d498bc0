//! Lifecycle of validator connections.
//!
//! Transport agnostic: the socket layer owns a [`Session`] per connection,
//! feeds it every text frame and drains its outbound queue.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::correlator::Correlator;
use super::pending::PendingChecks;
use super::registry::Registry;
use super::HubError;
use crate::db::{Tick, ValidatorId};
use crate::location::{Geolocate, UNKNOWN_LOCATION};
use crate::protocol::{
    decode_incoming, parse_public_key, verify_claim, EnvelopeError, IncomingMessage,
    OutgoingMessage, SignupAck, SignupRequest,
};

/// Per-connection state, owned by the socket task.
#[derive(Debug)]
pub struct Session {
    conn_id: u64,
    peer_addr: SocketAddr,
    validator_id: Option<ValidatorId>,
    outbound: mpsc::UnboundedSender<OutgoingMessage>,
}

impl Session {
    #[cfg(test)]
    pub fn validator_id(&self) -> Option<&str> {
        self.validator_id.as_deref()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

struct Channel {
    conn_id: u64,
    tx: mpsc::UnboundedSender<OutgoingMessage>,
}

/// Owns one live channel per authenticated validator.
pub struct ConnectionManager {
    registry: Arc<Registry>,
    pending: Arc<PendingChecks>,
    correlator: Correlator,
    locator: Arc<dyn Geolocate>,
    channels: DashMap<ValidatorId, Channel>,
    ticks: mpsc::Sender<Tick>,
    next_conn_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        registry: Arc<Registry>,
        pending: Arc<PendingChecks>,
        locator: Arc<dyn Geolocate>,
        ticks: mpsc::Sender<Tick>,
    ) -> Self {
        Self {
            correlator: Correlator::new(registry.clone(), pending.clone()),
            registry,
            pending,
            locator,
            channels: DashMap::new(),
            ticks,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Accept a raw connection. Nothing is sent to it and nothing it says
    /// is trusted until it signs up.
    pub fn on_connect(
        &self,
        peer_addr: SocketAddr,
    ) -> (Session, mpsc::UnboundedReceiver<OutgoingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session {
            conn_id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            validator_id: None,
            outbound: tx,
        };
        tracing::debug!("Connection {} opened from {}", session.conn_id, peer_addr);
        (session, rx)
    }

    /// Handle one text frame from a connection.
    pub async fn on_message(&self, session: &mut Session, raw: &str) -> Result<(), HubError> {
        let msg = decode_incoming(raw).map_err(|e| HubError::ProtocolViolation(e.to_string()))?;

        match msg {
            IncomingMessage::Signup(req) => self.handle_signup(session, req),
            IncomingMessage::Validate(reply) => {
                let from = session.validator_id.clone().ok_or_else(|| {
                    HubError::AuthenticationFailure("validate reply before signup".to_string())
                })?;

                let tick = self.correlator.handle_reply(&from, &reply, Utc::now())?;
                tracing::debug!(
                    "Check {} resolved: {} {} in {}ms",
                    reply.callback_id,
                    tick.website_id,
                    tick.status,
                    tick.latency
                );
                if self.ticks.send(tick).await.is_err() {
                    tracing::error!(
                        "Tick writer has stopped, dropping tick for {}",
                        reply.website_id
                    );
                }
                Ok(())
            }
        }
    }

    fn handle_signup(&self, session: &mut Session, req: SignupRequest) -> Result<(), HubError> {
        verify_claim(&req.claim(), &req.signed_message, &req.public_key).map_err(|e| match e {
            EnvelopeError::BadSignature => {
                HubError::AuthenticationFailure("bad signature on signup".to_string())
            }
            EnvelopeError::Malformed(reason) => HubError::ProtocolViolation(reason),
        })?;

        // Same key, same identity, whatever hex casing the validator used
        let public_key = parse_public_key(&req.public_key)
            .map(|k| hex::encode(k.to_bytes()))
            .map_err(|e| HubError::ProtocolViolation(e.to_string()))?;

        if let Some(current) = &session.validator_id {
            let same_key = self
                .registry
                .lookup(current)
                .map(|v| v.public_key == public_key)
                .unwrap_or(false);
            if !same_key {
                return Err(HubError::AuthenticationFailure(
                    "session is already bound to another key".to_string(),
                ));
            }
            return self.ack(session, &req.callback_id, current.clone());
        }

        let origin = if req.ip.trim().is_empty() {
            session.peer_addr.ip().to_string()
        } else {
            req.ip.clone()
        };

        let id = self.registry.register(&public_key, &origin)?;
        self.registry.mark_connected(&id, session.peer_addr);

        let channel = Channel {
            conn_id: session.conn_id,
            tx: session.outbound.clone(),
        };
        match self.channels.entry(id.clone()) {
            Entry::Occupied(mut e) => {
                // Requests sent over the old socket can no longer be answered
                let failed = if e.get().conn_id != session.conn_id {
                    self.pending.fail_validator(&id)
                } else {
                    0
                };
                e.insert(channel);
                tracing::info!(
                    "Validator {} reconnected; timed out {} checks on its old connection",
                    id,
                    failed
                );
            }
            Entry::Vacant(e) => {
                e.insert(channel);
            }
        }

        session.validator_id = Some(id.clone());
        self.registry.mark_authenticated(&id);
        tracing::info!("Validator {} signed up from {}", id, origin);

        self.resolve_location(&id, origin);
        self.ack(session, &req.callback_id, id)
    }

    fn ack(
        &self,
        session: &Session,
        callback_id: &str,
        validator_id: ValidatorId,
    ) -> Result<(), HubError> {
        session
            .outbound
            .send(OutgoingMessage::Signup(SignupAck {
                callback_id: callback_id.to_string(),
                validator_id: validator_id.clone(),
            }))
            .map_err(|_| HubError::ConnectionLoss(validator_id))
    }

    fn resolve_location(&self, id: &str, origin: String) {
        let known = self
            .registry
            .lookup(id)
            .map(|v| v.location != UNKNOWN_LOCATION)
            .unwrap_or(false);
        if known {
            return;
        }

        let registry = self.registry.clone();
        let locator = self.locator.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let label = locator.locate(&origin).await;
            if label != UNKNOWN_LOCATION {
                registry.set_location(&id, &label);
            }
        });
    }

    /// Queue a message for a validator.
    pub fn send(&self, validator_id: &str, msg: OutgoingMessage) -> Result<(), HubError> {
        let channel = self
            .channels
            .get(validator_id)
            .ok_or_else(|| HubError::NotConnected(validator_id.to_string()))?;
        channel
            .tx
            .send(msg)
            .map_err(|_| HubError::ConnectionLoss(validator_id.to_string()))
    }

    #[cfg(test)]
    pub fn is_connected(&self, validator_id: &str) -> bool {
        self.channels.contains_key(validator_id)
    }

    /// Tear down a connection. If it was the validator's live channel, the
    /// validator goes Disconnected and all its checks time out now.
    pub fn on_disconnect(&self, session: Session) {
        let Some(id) = session.validator_id else {
            tracing::debug!("Unauthenticated connection {} closed", session.conn_id);
            return;
        };

        // Held across the state change so a concurrent re-signup of the
        // same validator is ordered after it.
        match self.channels.entry(id.clone()) {
            Entry::Occupied(e) if e.get().conn_id == session.conn_id => {
                self.registry.mark_disconnected(&id);
                let failed = self.pending.fail_validator(&id);
                e.remove();
                tracing::info!(
                    "{}; timed out {} pending checks",
                    HubError::ConnectionLoss(id),
                    failed
                );
            }
            _ => {
                tracing::debug!("Superseded connection {} of {} closed", session.conn_id, id);
            }
        }
    }
}

/// Log a rejected frame at the level its kind deserves.
pub fn report(session: &Session, err: &HubError) {
    match err {
        HubError::StaleOrDuplicateReply(_) | HubError::Timeout(_) => {
            tracing::debug!("Dropped frame from {}: {}", session.peer_addr(), err)
        }
        HubError::AuthenticationFailure(_) | HubError::ProtocolViolation(_) => {
            tracing::warn!("Dropped frame from {}: {}", session.peer_addr(), err)
        }
        _ => tracing::error!("Failed to handle frame from {}: {}", session.peer_addr(), err),
    }
}
