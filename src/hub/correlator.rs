//! Matches signed replies to the checks they answer.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::pending::{CheckState, PendingChecks};
use super::registry::Registry;
use super::HubError;
use crate::db::Tick;
use crate::protocol::{verify_claim, EnvelopeError, ValidateReply};

/// Upper bound on a reported latency. No check outlives this, so anything
/// larger is a broken or hostile validator.
pub const MAX_LATENCY_MS: u64 = 24 * 60 * 60 * 1000;

/// Turns validated replies into ticks.
pub struct Correlator {
    registry: Arc<Registry>,
    pending: Arc<PendingChecks>,
}

impl Correlator {
    pub fn new(registry: Arc<Registry>, pending: Arc<PendingChecks>) -> Self {
        Self { registry, pending }
    }

    /// Handle a reply received on the session authenticated as `from`.
    ///
    /// A rejected reply leaves the pending check untouched, so a later
    /// genuine reply for the same correlation id is still accepted.
    pub fn handle_reply(
        &self,
        from: &str,
        reply: &ValidateReply,
        received_at: DateTime<Utc>,
    ) -> Result<Tick, HubError> {
        if reply.validator_id != from {
            return Err(HubError::AuthenticationFailure(format!(
                "reply claims validator {} on a session of {}",
                reply.validator_id, from
            )));
        }

        let validator = self.registry.lookup(from).ok_or_else(|| {
            HubError::AuthenticationFailure(format!("unknown validator {}", from))
        })?;

        verify_claim(&reply.claim(), &reply.signed_message, &validator.public_key).map_err(
            |e| match e {
                EnvelopeError::BadSignature => HubError::AuthenticationFailure(format!(
                    "bad signature on reply {} from {}",
                    reply.callback_id, from
                )),
                EnvelopeError::Malformed(reason) => HubError::ProtocolViolation(reason),
            },
        )?;

        if reply.latency > MAX_LATENCY_MS {
            return Err(HubError::ProtocolViolation(format!(
                "latency {}ms on reply {} is out of range",
                reply.latency, reply.callback_id
            )));
        }

        let check = self
            .pending
            .take_if(&reply.callback_id, |c| {
                c.validator_id == from && c.website_id == reply.website_id
            })
            .ok_or_else(|| HubError::StaleOrDuplicateReply(reply.callback_id.clone()))?;

        let tick = Tick {
            website_id: check.website_id.clone(),
            validator_id: check.validator_id.clone(),
            status: reply.status,
            latency: reply.latency,
            timestamp: received_at,
        };
        self.pending.finish(check, CheckState::Resolved(tick.clone()));

        Ok(tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Store, TickStatus, Website};
    use crate::hub::pending::{Allocation, CheckHandle};
    use crate::hub::registry::ConnectionState;
    use crate::protocol::Keypair;
    use std::time::Duration;

    struct Fixture {
        registry: Arc<Registry>,
        pending: Arc<PendingChecks>,
        correlator: Correlator,
        keypair: Keypair,
        validator_id: String,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(Registry::new(Arc::new(Store::in_memory().unwrap())));
        let pending = Arc::new(PendingChecks::new());
        let keypair = Keypair::generate();
        let validator_id = registry.register(&keypair.public_key_hex(), "1.2.3.4").unwrap();
        registry.mark_authenticated(&validator_id);
        Fixture {
            correlator: Correlator::new(registry.clone(), pending.clone()),
            registry,
            pending,
            keypair,
            validator_id,
        }
    }

    fn dispatch(f: &Fixture, website_id: &str) -> CheckHandle {
        let website = Website {
            id: website_id.to_string(),
            user_id: "u".to_string(),
            url: "https://example.com".to_string(),
            disabled: false,
        };
        match f.pending.allocate(&website, &f.validator_id, Utc::now(), Duration::from_secs(30)) {
            Allocation::Created(h) => h,
            Allocation::Coalesced(_) => panic!("expected a new check"),
        }
    }

    fn reply(
        f: &Fixture,
        callback_id: &str,
        website_id: &str,
        status: TickStatus,
    ) -> ValidateReply {
        let mut reply = ValidateReply {
            signed_message: String::new(),
            callback_id: callback_id.to_string(),
            status,
            latency: 87,
            website_id: website_id.to_string(),
            validator_id: f.validator_id.clone(),
        };
        reply.signed_message = f.keypair.sign_claim(&reply.claim()).unwrap();
        reply
    }

    #[test]
    fn test_valid_reply_resolves_check() {
        let f = fixture();
        let handle = dispatch(&f, "w1");
        let now = Utc::now();

        let bad = reply(&f, &handle.correlation_id, "w1", TickStatus::Bad);
        let tick = f.correlator.handle_reply(&f.validator_id, &bad, now).unwrap();

        assert_eq!(tick.website_id, "w1");
        assert_eq!(tick.status, TickStatus::Bad);
        assert_eq!(tick.latency, 87);
        assert_eq!(tick.timestamp, now);
        assert_eq!(handle.state(), CheckState::Resolved(tick));
        assert!(f.pending.is_empty());
    }

    #[test]
    fn test_duplicate_and_unknown_replies_are_stale() {
        let f = fixture();
        let handle = dispatch(&f, "w1");
        let good = reply(&f, &handle.correlation_id, "w1", TickStatus::Good);

        assert!(f.correlator.handle_reply(&f.validator_id, &good, Utc::now()).is_ok());

        let before = f.registry.lookup(&f.validator_id).unwrap();
        let err = f.correlator.handle_reply(&f.validator_id, &good, Utc::now()).unwrap_err();
        assert!(matches!(err, HubError::StaleOrDuplicateReply(_)));

        let unknown = reply(&f, "no-such-id", "w1", TickStatus::Good);
        let err = f.correlator.handle_reply(&f.validator_id, &unknown, Utc::now()).unwrap_err();
        assert!(matches!(err, HubError::StaleOrDuplicateReply(_)));

        // Registry untouched
        let after = f.registry.lookup(&f.validator_id).unwrap();
        assert_eq!(after.state, ConnectionState::Authenticated);
        assert_eq!(after.last_dispatch, before.last_dispatch);
    }

    #[test]
    fn test_reply_after_timeout_is_stale() {
        let f = fixture();
        let handle = dispatch(&f, "w1");
        f.pending.expire(Utc::now() + chrono::Duration::seconds(31));

        let late = reply(&f, &handle.correlation_id, "w1", TickStatus::Good);
        let err = f.correlator.handle_reply(&f.validator_id, &late, Utc::now()).unwrap_err();
        assert!(matches!(err, HubError::StaleOrDuplicateReply(_)));
        assert_eq!(handle.state(), CheckState::TimedOut);
    }

    #[test]
    fn test_bad_signature_does_not_consume_check() {
        let f = fixture();
        let handle = dispatch(&f, "w1");

        let mut forged = reply(&f, &handle.correlation_id, "w1", TickStatus::Good);
        forged.status = TickStatus::Bad;
        let err = f.correlator.handle_reply(&f.validator_id, &forged, Utc::now()).unwrap_err();
        assert!(matches!(err, HubError::AuthenticationFailure(_)));
        assert_eq!(handle.state(), CheckState::Pending);

        let genuine = reply(&f, &handle.correlation_id, "w1", TickStatus::Good);
        let tick = f.correlator.handle_reply(&f.validator_id, &genuine, Utc::now()).unwrap();
        assert_eq!(tick.status, TickStatus::Good);
    }

    #[test]
    fn test_garbled_signature_is_protocol_violation() {
        let f = fixture();
        let handle = dispatch(&f, "w1");

        let mut garbled = reply(&f, &handle.correlation_id, "w1", TickStatus::Good);
        garbled.signed_message = "zz".to_string();
        let err = f.correlator.handle_reply(&f.validator_id, &garbled, Utc::now()).unwrap_err();
        assert!(matches!(err, HubError::ProtocolViolation(_)));
        assert!(f.pending.contains(&handle.correlation_id));
    }

    #[test]
    fn test_reply_for_someone_elses_session_is_rejected() {
        let f = fixture();
        let handle = dispatch(&f, "w1");
        let good = reply(&f, &handle.correlation_id, "w1", TickStatus::Good);

        let err = f.correlator.handle_reply("other-validator", &good, Utc::now()).unwrap_err();
        assert!(matches!(err, HubError::AuthenticationFailure(_)));
        assert!(f.pending.contains(&handle.correlation_id));
    }

    #[test]
    fn test_absurd_latency_is_rejected() {
        let f = fixture();
        let handle = dispatch(&f, "w1");

        // Correctly signed, but no check takes this long
        let mut huge = reply(&f, &handle.correlation_id, "w1", TickStatus::Good);
        huge.latency = u64::MAX;
        huge.signed_message = f.keypair.sign_claim(&huge.claim()).unwrap();

        let err = f.correlator.handle_reply(&f.validator_id, &huge, Utc::now()).unwrap_err();
        assert!(matches!(err, HubError::ProtocolViolation(_)));
        assert_eq!(handle.state(), CheckState::Pending);

        let mut slowest = reply(&f, &handle.correlation_id, "w1", TickStatus::Good);
        slowest.latency = MAX_LATENCY_MS;
        slowest.signed_message = f.keypair.sign_claim(&slowest.claim()).unwrap();
        let tick = f.correlator.handle_reply(&f.validator_id, &slowest, Utc::now()).unwrap();
        assert_eq!(tick.latency, MAX_LATENCY_MS);
    }

    #[test]
    fn test_reply_for_wrong_website_is_stale() {
        let f = fixture();
        let handle = dispatch(&f, "w1");
        let wrong = reply(&f, &handle.correlation_id, "w2", TickStatus::Good);

        let err = f.correlator.handle_reply(&f.validator_id, &wrong, Utc::now()).unwrap_err();
        assert!(matches!(err, HubError::StaleOrDuplicateReply(_)));
        assert!(f.pending.contains(&handle.correlation_id));
    }
}
