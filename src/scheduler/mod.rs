//! Scheduler module for dispatching checks and sweeping expired ones.

mod sweep;
mod writer;

pub use sweep::*;
pub use writer::*;

use crate::config::ServerConfig;
use crate::db::{DbError, Store, ValidatorId, Website, WebsiteId};
use crate::hub::{Allocation, Hub, HubError};
use crate::protocol::{OutgoingMessage, ValidateRequest};

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Scheduling knobs taken from the server config.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub check_interval: Duration,
    pub schedule_interval: Duration,
    pub check_timeout: Duration,
    pub fan_out: usize,
}

impl From<&ServerConfig> for SchedulerSettings {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            check_interval: cfg.check_interval,
            schedule_interval: cfg.schedule_interval,
            check_timeout: cfg.check_timeout,
            fan_out: cfg.fan_out.max(1),
        }
    }
}

/// What one scheduling pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    /// Websites that needed a check
    pub due: usize,
    /// New check requests sent
    pub dispatched: usize,
    /// Websites left for the next pass for lack of validators
    pub deferred: usize,
}

/// Decides which websites get checked and by whom.
pub struct Scheduler {
    store: Arc<Store>,
    hub: Arc<Hub>,
    settings: SchedulerSettings,
    /// On-demand rechecks that found no validator yet
    requested: DashSet<WebsiteId>,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, hub: Arc<Hub>, settings: SchedulerSettings) -> Self {
        Self {
            store,
            hub,
            settings,
            requested: DashSet::new(),
            stop: Arc::new(Mutex::new(None)),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Start the periodic scheduling task.
    pub fn start(self: &Arc<Self>) {
        let scheduler = self.clone();

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = scheduler.stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(scheduler.settings.schedule_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            tracing::info!(
                "Scheduler: Started (every {:?}, fan-out {})",
                scheduler.settings.schedule_interval,
                scheduler.settings.fan_out
            );

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        match scheduler.run_pass(Utc::now()) {
                            Ok(report) if report.due > 0 => {
                                tracing::debug!("Scheduler: {:?}", report);
                            }
                            Ok(_) => {}
                            Err(e) => tracing::error!("Scheduler: Pass failed: {}", e),
                        }
                    }
                }
            }
        });
    }

    /// Stop the scheduling task.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }

    /// Dispatch checks for every website that is due, plus queued rechecks.
    pub fn run_pass(&self, now: DateTime<Utc>) -> Result<PassReport, DbError> {
        let websites = self.store.get_active_websites()?;
        let last_ticks = self.store.get_last_tick_times()?;
        let mut report = PassReport::default();

        for website in websites {
            if self.requested.remove(&website.id).is_some() {
                report.due += 1;
                let allocations = self.request_recheck(&website);
                if allocations.is_empty() {
                    report.deferred += 1;
                }
                report.dispatched += allocations
                    .iter()
                    .filter(|a| matches!(a, Allocation::Created(_)))
                    .count();
                continue;
            }

            if !is_due(last_ticks.get(&website.id), now, self.settings.check_interval)
                || self.hub.pending().has_live_check(&website.id)
            {
                continue;
            }

            report.due += 1;
            let validators = self
                .hub
                .registry()
                .select_least_recently_used(self.settings.fan_out, &[]);
            if validators.is_empty() {
                report.deferred += 1;
                continue;
            }

            for validator_id in validators {
                if let Ok(Allocation::Created(_)) = self.dispatch(&website, &validator_id, now) {
                    report.dispatched += 1;
                }
            }
        }

        if report.deferred > 0 {
            tracing::debug!(
                "Scheduler: No validators connected, {} websites wait",
                report.deferred
            );
        }

        Ok(report)
    }

    /// Check a website now, regardless of when it was last checked.
    ///
    /// Validators already checking the site are reused instead of being asked
    /// twice; the rest of the fan-out goes to the least recently used
    /// validators. An empty result means no validator was available and the
    /// site is queued for the next pass.
    pub fn request_recheck(&self, website: &Website) -> Vec<Allocation> {
        let now = Utc::now();
        let mut allocations = Vec::new();
        let mut busy: Vec<ValidatorId> = Vec::new();

        for live in self.hub.pending().live_for_website(&website.id) {
            if allocations.len() >= self.settings.fan_out {
                break;
            }
            busy.push(live.validator_id.clone());
            if let Ok(allocation) = self.dispatch(website, &live.validator_id, now) {
                allocations.push(allocation);
            }
        }

        let wanted = self.settings.fan_out.saturating_sub(allocations.len());
        if wanted > 0 {
            for validator_id in self.hub.registry().select_least_recently_used(wanted, &busy) {
                if let Ok(allocation) = self.dispatch(website, &validator_id, now) {
                    allocations.push(allocation);
                }
            }
        }

        if allocations.is_empty() {
            tracing::debug!(
                "Scheduler: Recheck of {} queued until a validator connects",
                website.id
            );
            self.requested.insert(website.id.clone());
        }

        allocations
    }

    /// Allocate a check for the pair and send it if it is new. A check whose
    /// request could not be sent is timed out right away.
    fn dispatch(
        &self,
        website: &Website,
        validator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Allocation, HubError> {
        let allocation =
            self.hub
                .pending()
                .allocate(website, validator_id, now, self.settings.check_timeout);

        if let Allocation::Created(handle) = &allocation {
            let request = OutgoingMessage::Validate(ValidateRequest {
                url: website.url.clone(),
                callback_id: handle.correlation_id.clone(),
                website_id: website.id.clone(),
            });
            if let Err(e) = self.hub.connections().send(validator_id, request) {
                tracing::warn!("Scheduler: Failed to dispatch {}: {}", handle.correlation_id, e);
                self.hub.pending().fail(&handle.correlation_id);
                return Err(e);
            }
            tracing::debug!(
                "Scheduler: Sent check {} of {} to {}",
                handle.correlation_id,
                website.url,
                validator_id
            );
        }

        Ok(allocation)
    }

    /// Whether a recheck of the website is queued.
    pub fn is_queued(&self, website_id: &str) -> bool {
        self.requested.contains(website_id)
    }
}

/// A website is due when it has never been checked or its last tick, good or
/// bad, is older than the check interval.
fn is_due(last_tick: Option<&DateTime<Utc>>, now: DateTime<Utc>, interval: Duration) -> bool {
    match last_tick {
        None => true,
        Some(last) => (now - *last).to_std().map(|age| age > interval).unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Tick, TickStatus};
    use crate::hub::{test_support, CheckState};
    use crate::location::NoLocation;
    use tokio::sync::mpsc;

    fn settings(fan_out: usize) -> SchedulerSettings {
        SchedulerSettings {
            check_interval: Duration::from_secs(60),
            schedule_interval: Duration::from_secs(10),
            check_timeout: Duration::from_secs(30),
            fan_out,
        }
    }

    fn setup(fan_out: usize) -> (Arc<Store>, Arc<Hub>, Scheduler, mpsc::Receiver<Tick>) {
        let store = Arc::new(Store::in_memory().unwrap());
        let (tx, rx) = mpsc::channel(16);
        let hub = Arc::new(Hub::new(store.clone(), Arc::new(NoLocation), tx));
        let scheduler = Scheduler::new(store.clone(), hub.clone(), settings(fan_out));
        (store, hub, scheduler, rx)
    }

    fn validate_request(msg: OutgoingMessage) -> ValidateRequest {
        match msg {
            OutgoingMessage::Validate(req) => req,
            other => panic!("expected a validate request, got {:?}", other),
        }
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let interval = Duration::from_secs(60);
        assert!(is_due(None, now, interval));
        assert!(is_due(Some(&(now - chrono::Duration::seconds(61))), now, interval));
        assert!(!is_due(Some(&(now - chrono::Duration::seconds(30))), now, interval));
        // Clock skew: a tick from the future is not due
        assert!(!is_due(Some(&(now + chrono::Duration::seconds(5))), now, interval));
    }

    #[tokio::test]
    async fn test_pass_without_validators_defers() {
        let (store, hub, scheduler, _rx) = setup(3);
        store.add_website("u", "https://a.example").unwrap();

        let report = scheduler.run_pass(Utc::now()).unwrap();
        assert_eq!(report, PassReport { due: 1, dispatched: 0, deferred: 1 });
        assert!(hub.pending().is_empty());

        // Next pass retries
        let (_session, mut outbound, _, _) = test_support::connect_validator(&hub).await;
        let report = scheduler.run_pass(Utc::now()).unwrap();
        assert_eq!(report.dispatched, 1);
        let req = validate_request(outbound.recv().await.unwrap());
        assert_eq!(req.url, "https://a.example");
    }

    #[tokio::test]
    async fn test_pass_skips_fresh_disabled_and_in_flight() {
        let (store, hub, scheduler, _rx) = setup(1);
        let (_session, mut outbound, _, validator_id) = test_support::connect_validator(&hub).await;

        let fresh = store.add_website("u", "https://fresh.example").unwrap();
        let stale = store.add_website("u", "https://stale.example").unwrap();
        let gone = store.add_website("u", "https://gone.example").unwrap();
        store.disable_website(&gone.id, "u").unwrap();

        let now = Utc::now();
        let tick = |website_id: &str, age: i64| Tick {
            website_id: website_id.to_string(),
            validator_id: validator_id.clone(),
            status: TickStatus::Bad,
            latency: 0,
            timestamp: now - chrono::Duration::seconds(age),
        };
        store.add_ticks(&[tick(&fresh.id, 10), tick(&stale.id, 600)]).unwrap();

        let report = scheduler.run_pass(now).unwrap();
        assert_eq!(report, PassReport { due: 1, dispatched: 1, deferred: 0 });
        let req = validate_request(outbound.recv().await.unwrap());
        assert_eq!(req.website_id, stale.id);

        // Still in flight, so not sent again
        let report = scheduler.run_pass(now).unwrap();
        assert_eq!(report, PassReport::default());
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_recheck_is_coalesced() {
        let (store, hub, scheduler, _rx) = setup(3);
        let (_session, mut outbound, _, _) = test_support::connect_validator(&hub).await;
        let website = store.add_website("u", "https://a.example").unwrap();

        let first = scheduler.request_recheck(&website);
        assert_eq!(first.len(), 1);
        assert!(matches!(first[0], Allocation::Created(_)));

        let second = scheduler.request_recheck(&website);
        assert_eq!(second.len(), 1);
        assert!(matches!(second[0], Allocation::Coalesced(_)));
        assert_eq!(second[0].handle().correlation_id, first[0].handle().correlation_id);

        validate_request(outbound.recv().await.unwrap());
        assert!(outbound.try_recv().is_err());
        assert_eq!(hub.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_recheck_fills_fan_out_least_recently_used() {
        let (store, hub, scheduler, _rx) = setup(2);
        let mut validators = Vec::new();
        for _ in 0..3 {
            validators.push(test_support::connect_validator(&hub).await);
        }
        let a = store.add_website("u", "https://a.example").unwrap();
        let b = store.add_website("u", "https://b.example").unwrap();

        let first: Vec<_> = scheduler
            .request_recheck(&a)
            .iter()
            .map(|x| x.handle().validator_id.clone())
            .collect();
        let second: Vec<_> = scheduler
            .request_recheck(&b)
            .iter()
            .map(|x| x.handle().validator_id.clone())
            .collect();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);

        // The validator skipped the first time is picked the second time
        let skipped = validators
            .iter()
            .map(|v| v.3.clone())
            .find(|id| !first.contains(id))
            .unwrap();
        assert!(second.contains(&skipped));
    }

    #[tokio::test]
    async fn test_queued_recheck_runs_when_validator_arrives() {
        let (store, hub, scheduler, _rx) = setup(3);
        let website = store.add_website("u", "https://a.example").unwrap();
        store
            .add_ticks(&[Tick {
                website_id: website.id.clone(),
                validator_id: "v".to_string(),
                status: TickStatus::Good,
                latency: 1,
                timestamp: Utc::now(),
            }])
            .unwrap();

        assert!(scheduler.request_recheck(&website).is_empty());
        assert!(scheduler.is_queued(&website.id));

        let (_session, mut outbound, _, _) = test_support::connect_validator(&hub).await;
        let report = scheduler.run_pass(Utc::now()).unwrap();
        assert_eq!(report.dispatched, 1);
        assert!(!scheduler.is_queued(&website.id));
        assert_eq!(validate_request(outbound.recv().await.unwrap()).website_id, website.id);
    }

    #[tokio::test]
    async fn test_unsendable_check_fails_immediately() {
        let (store, hub, scheduler, _rx) = setup(1);
        let website = store.add_website("u", "https://a.example").unwrap();

        // Authenticated in the registry but without a live channel
        let id = hub.registry().register(&"ab".repeat(32), "1.1.1.1").unwrap();
        hub.registry().mark_authenticated(&id);

        let err = scheduler.dispatch(&website, &id, Utc::now()).unwrap_err();
        assert!(matches!(err, HubError::NotConnected(_)));
        assert!(hub.pending().is_empty());
    }

    #[tokio::test]
    async fn test_waiting_on_a_recheck() {
        let (store, hub, scheduler, mut ticks) = setup(1);
        let (mut session, mut outbound, keypair, validator_id) =
            test_support::connect_validator(&hub).await;
        let website = store.add_website("u", "https://a.example").unwrap();

        let allocations = scheduler.request_recheck(&website);
        let handle = allocations[0].handle().clone();
        let req = validate_request(outbound.recv().await.unwrap());

        let frame =
            test_support::validate_frame(&keypair, &validator_id, &req, TickStatus::Good, 12);
        hub.connections().on_message(&mut session, &frame).await.unwrap();

        let tick = handle.clone().tick(Duration::from_secs(1)).await.unwrap();
        assert_eq!(tick.latency, 12);
        assert!(matches!(handle.state(), CheckState::Resolved(_)));
        assert_eq!(ticks.recv().await.unwrap(), tick);
    }
}
