use chrono::{DateTime, Duration as ChronoDuration, Utc};
use foodlink_core::clock::Clock;
use foodlink_core::models::DonationStatus;
use foodlink_core::repository::{DonationFilter, EntityStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::claims::ClaimCoordinator;
use crate::error::FulfillmentResult;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    /// Already moved on (delivered, released and re-claimed...) by the time
    /// the sweep re-read it
    pub skipped: usize,
    pub failed: usize,
    /// Failed on an earlier sweep and still backing off
    pub deferred: usize,
}

enum Outcome {
    Expired,
    Skipped,
}

const FIRST_DEFERRAL_SECS: i64 = 60;
const MAX_DEFERRAL_SECS: i64 = 3600;

/// Backoff for a donation whose expiry keeps failing
#[derive(Debug, Clone, Copy)]
struct Deferral {
    failures: u32,
    until: DateTime<Utc>,
}

impl Deferral {
    fn after_failure(previous: Option<Deferral>, now: DateTime<Utc>) -> Self {
        let failures = previous.map_or(1, |d| d.failures.saturating_add(1));
        let secs = FIRST_DEFERRAL_SECS
            .saturating_mul(1i64 << (failures - 1).min(16))
            .min(MAX_DEFERRAL_SECS);
        Self {
            failures,
            until: now + ChronoDuration::seconds(secs),
        }
    }
}

/// Persists lazy expiry. Reads already treat past-deadline donations as
/// expired; the sweeper makes it durable and unwinds their claims.
pub struct ExpirySweeper {
    store: Arc<dyn EntityStore>,
    coordinator: ClaimCoordinator,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    batch_size: usize,
    deferred: Mutex<HashMap<Uuid, Deferral>>,
}

impl ExpirySweeper {
    pub fn new(
        store: Arc<dyn EntityStore>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        batch_size: usize,
    ) -> Self {
        Self {
            coordinator: ClaimCoordinator::new(store.clone()),
            store,
            clock,
            retry,
            batch_size: batch_size.max(1),
            deferred: Mutex::new(HashMap::new()),
        }
    }

    fn deferrals(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Deferral>> {
        self.deferred.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Expire up to `batch_size` due donations. Rows that failed recently
    /// are passed over until their backoff ends, so they cannot hold the
    /// head of every batch.
    pub async fn sweep_once(&self) -> FulfillmentResult<SweepReport> {
        let now = self.clock.now();
        let backing_off = {
            let mut deferred = self.deferrals();
            let stale = now - ChronoDuration::seconds(MAX_DEFERRAL_SECS);
            deferred.retain(|_, d| d.until > stale);
            deferred.values().filter(|d| d.until > now).count()
        };
        let due = self
            .store
            .donations(&DonationFilter {
                statuses: Some(DonationStatus::LAPSING.to_vec()),
                deadline_before: Some(now),
                limit: Some(self.batch_size + backing_off),
                ..Default::default()
            })
            .await?;

        let mut report = SweepReport::default();
        let mut attempted = 0;
        for donation in due {
            if attempted == self.batch_size {
                break;
            }
            let deferral = self.deferrals().get(&donation.id).copied();
            if deferral.is_some_and(|d| d.until > now) {
                report.deferred += 1;
                continue;
            }

            attempted += 1;
            match self.expire_one(donation.id).await {
                Ok(outcome) => {
                    self.deferrals().remove(&donation.id);
                    match outcome {
                        Outcome::Expired => report.expired += 1,
                        Outcome::Skipped => report.skipped += 1,
                    }
                }
                Err(e) => {
                    let next = Deferral::after_failure(deferral, now);
                    warn!(
                        donation_id = %donation.id,
                        error = %e,
                        failures = next.failures,
                        retry_after = %next.until,
                        "Failed to expire donation"
                    );
                    self.deferrals().insert(donation.id, next);
                    report.failed += 1;
                }
            }
        }

        if report != SweepReport::default() {
            info!(
                expired = report.expired,
                skipped = report.skipped,
                failed = report.failed,
                deferred = report.deferred,
                "Expiry sweep finished"
            );
        }
        Ok(report)
    }

    /// Each attempt re-reads the donation, so a conflict with a transition
    /// that landed in between is re-evaluated instead of overwritten.
    async fn expire_one(&self, donation_id: Uuid) -> FulfillmentResult<Outcome> {
        self.retry
            .run(|_| async move {
                let now = self.clock.now();
                let Some(current) = self.store.donation(donation_id).await? else {
                    return Ok(Outcome::Skipped);
                };
                if !current.status.lapses_at_deadline() || !current.is_past_deadline(now) {
                    return Ok(Outcome::Skipped);
                }
                self.coordinator.expire(&current, now).await?;
                Ok(Outcome::Expired)
            })
            .await
    }

    /// Sweep every `interval` until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(?interval, "Expiry sweeper started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "Expiry sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Expiry sweeper stopped");
    }
}
