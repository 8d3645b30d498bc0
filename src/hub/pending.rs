//! In-flight check requests, keyed by correlation id.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::watch;

use super::HubError;
use crate::db::{Tick, ValidatorId, Website, WebsiteId};

pub type CorrelationId = String;

/// Lifecycle of a check request. `Resolved` and `TimedOut` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckState {
    Pending,
    Resolved(Tick),
    TimedOut,
}

impl CheckState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CheckState::Pending)
    }
}

/// A check request waiting for its reply.
#[derive(Debug)]
pub struct PendingCheck {
    pub correlation_id: CorrelationId,
    pub website_id: WebsiteId,
    pub url: String,
    pub validator_id: ValidatorId,
    pub issued_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    state: watch::Sender<CheckState>,
}

impl PendingCheck {
    fn handle(&self) -> CheckHandle {
        CheckHandle {
            correlation_id: self.correlation_id.clone(),
            validator_id: self.validator_id.clone(),
            state: self.state.subscribe(),
        }
    }
}

/// Observer of one check's eventual outcome.
#[derive(Debug, Clone)]
pub struct CheckHandle {
    pub correlation_id: CorrelationId,
    pub validator_id: ValidatorId,
    state: watch::Receiver<CheckState>,
}

impl CheckHandle {
    pub fn state(&self) -> CheckState {
        self.state.borrow().clone()
    }

    /// Wait until the check resolves or times out.
    pub async fn outcome(mut self) -> CheckState {
        match self.state.wait_for(CheckState::is_terminal).await {
            Ok(state) => state.clone(),
            // Entry dropped without a verdict
            Err(_) => CheckState::TimedOut,
        }
    }

    /// Like [`CheckHandle::outcome`], giving up after `limit`.
    pub async fn tick(self, limit: Duration) -> Result<Tick, HubError> {
        let id = self.correlation_id.clone();
        match tokio::time::timeout(limit, self.outcome()).await {
            Ok(CheckState::Resolved(tick)) => Ok(tick),
            _ => Err(HubError::Timeout(id)),
        }
    }
}

/// Result of asking for a check on a (website, validator) pair.
#[derive(Debug)]
pub enum Allocation {
    /// A new check was created and still has to be sent.
    Created(CheckHandle),
    /// A live check for the pair already existed.
    Coalesced(CheckHandle),
}

impl Allocation {
    pub fn handle(&self) -> &CheckHandle {
        match self {
            Allocation::Created(h) | Allocation::Coalesced(h) => h,
        }
    }
}

/// The set of live checks.
///
/// Taking an entry out of `checks` is the single point where a check
/// becomes terminal, so a reply and the deadline sweep can race freely:
/// whichever removes the entry first decides the outcome.
#[derive(Default)]
pub struct PendingChecks {
    checks: DashMap<CorrelationId, PendingCheck>,
    by_pair: DashMap<(WebsiteId, ValidatorId), CorrelationId>,
}

impl PendingChecks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a check for `website` on `validator_id`, or hand back the
    /// live one for that pair.
    pub fn allocate(
        &self,
        website: &Website,
        validator_id: &str,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Allocation {
        let key = (website.id.clone(), validator_id.to_string());
        match self.by_pair.entry(key) {
            Entry::Occupied(mut e) => {
                if let Some(existing) = self.checks.get(e.get()) {
                    return Allocation::Coalesced(existing.handle());
                }
                // Finished but not yet unlinked
                let check = self.new_check(website, validator_id, now, timeout);
                let id = check.correlation_id.clone();
                let handle = self.insert(check);
                e.insert(id);
                Allocation::Created(handle)
            }
            Entry::Vacant(e) => {
                // The check must be visible before the pair entry is released
                let check = self.new_check(website, validator_id, now, timeout);
                let id = check.correlation_id.clone();
                let handle = self.insert(check);
                e.insert(id);
                Allocation::Created(handle)
            }
        }
    }

    fn new_check(
        &self,
        website: &Website,
        validator_id: &str,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> PendingCheck {
        let timeout =
            chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(30));
        let (state, _) = watch::channel(CheckState::Pending);
        PendingCheck {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            website_id: website.id.clone(),
            url: website.url.clone(),
            validator_id: validator_id.to_string(),
            issued_at: now,
            deadline: now + timeout,
            state,
        }
    }

    fn insert(&self, check: PendingCheck) -> CheckHandle {
        let handle = check.handle();
        self.checks.insert(check.correlation_id.clone(), check);
        handle
    }

    /// Take the check for `correlation_id` if `matches` accepts it.
    pub fn take_if(
        &self,
        correlation_id: &str,
        matches: impl FnOnce(&PendingCheck) -> bool,
    ) -> Option<PendingCheck> {
        self.checks
            .remove_if(correlation_id, |_, check| matches(check))
            .map(|(_, check)| check)
    }

    /// Publish the final state of a taken check and unlink it.
    pub fn finish(&self, check: PendingCheck, state: CheckState) {
        debug_assert!(state.is_terminal());
        self.by_pair.remove_if(
            &(check.website_id.clone(), check.validator_id.clone()),
            |_, id| *id == check.correlation_id,
        );
        check.state.send_replace(state);
    }

    /// Time out one check. Returns false if it was already terminal.
    pub fn fail(&self, correlation_id: &str) -> bool {
        match self.take_if(correlation_id, |_| true) {
            Some(check) => {
                self.finish(check, CheckState::TimedOut);
                true
            }
            None => false,
        }
    }

    /// Time out every check past its deadline. Returns how many expired.
    pub fn expire(&self, now: DateTime<Utc>) -> usize {
        let overdue: Vec<CorrelationId> = self
            .checks
            .iter()
            .filter(|c| c.deadline <= now)
            .map(|c| c.key().clone())
            .collect();

        let mut expired = 0;
        for id in overdue {
            if let Some(check) = self.take_if(&id, |c| c.deadline <= now) {
                tracing::debug!("{}", HubError::Timeout(check.correlation_id.clone()));
                self.finish(check, CheckState::TimedOut);
                expired += 1;
            }
        }
        expired
    }

    /// Time out every check targeted at a validator. Returns how many.
    pub fn fail_validator(&self, validator_id: &str) -> usize {
        let targeted: Vec<CorrelationId> = self
            .checks
            .iter()
            .filter(|c| c.validator_id == validator_id)
            .map(|c| c.key().clone())
            .collect();

        targeted.iter().filter(|id| self.fail(id)).count()
    }

    /// Handles on the live checks of a website.
    pub fn live_for_website(&self, website_id: &str) -> Vec<CheckHandle> {
        self.checks
            .iter()
            .filter(|c| c.website_id == website_id)
            .map(|c| c.handle())
            .collect()
    }

    pub fn has_live_check(&self, website_id: &str) -> bool {
        self.checks.iter().any(|c| c.website_id == website_id)
    }

    #[cfg(test)]
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.checks.contains_key(correlation_id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}
