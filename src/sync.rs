//! Sync scheduling for daily aggregates.
//!
//! The scheduler owns the per-day sync state machine (`Pending -> Syncing ->
//! Synced`, with `Failed` re-entering the retry pool on transient errors) and
//! the retry policy. Flushes for one user are strictly serialized, oldest
//! date first, so the replace-by-key upsert on the remote side stays safe:
//! there is exactly one writer per (user, date) and sends are in order.

use crate::core::aggregate::{DailyAggregate, SyncState};
use crate::remote::{FailureKind, RemoteError, UpsertResponse};
use crate::store::LocalStore;
use chrono::{NaiveDate, Utc};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

/// Exponential backoff with jitter for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Floor delay before the first retry. Immediate retries are disallowed.
    pub base: Duration,
    /// Multiplier applied per failed attempt.
    pub factor: f64,
    /// Delay ceiling.
    pub max: Duration,
    /// Jitter fraction; the delay is scaled by a uniform factor in
    /// `[1, 1 + jitter]` so stalled agents do not retry in lockstep. Jitter
    /// only stretches delays, so the base interval stays a hard floor.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            factor: 2.0,
            max: Duration::from_secs(300),
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempts` (1-based). Never below the
    /// base interval, even with jitter.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exp = self.factor.powi(attempts.saturating_sub(1) as i32);
        let raw = self.base.as_secs_f64() * exp;
        let capped = raw.min(self.max.as_secs_f64());

        let scale = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(1.0..=1.0 + self.jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * scale)
    }
}

/// Per-day retry bookkeeping.
#[derive(Debug, Clone)]
struct RetryState {
    attempts: u32,
    next_attempt_at: Instant,
}

/// Result of one flush pass.
#[derive(Debug, Default)]
pub struct FlushReport {
    pub synced: Vec<NaiveDate>,
    pub failed: Vec<(NaiveDate, FailureKind)>,
    /// Set when the pass hit an authentication failure; the caller should
    /// prompt for re-authentication rather than keep retrying.
    pub auth_required: bool,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && !self.auth_required
    }
}

/// Drives pending daily aggregates through the remote upsert.
pub struct SyncScheduler {
    user_id: String,
    policy: RetryPolicy,
    retries: HashMap<NaiveDate, RetryState>,
    /// Days that failed with a non-retryable error. They stay out of the
    /// automatic pool until the operator intervenes (explicit flush).
    blocked: HashSet<NaiveDate>,
    last_error: Option<String>,
}

impl SyncScheduler {
    pub fn new(user_id: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            user_id: user_id.into(),
            policy,
            retries: HashMap::new(),
            blocked: HashSet::new(),
            last_error: None,
        }
    }

    /// Whether a day's backoff window has elapsed.
    fn is_due(&self, date: NaiveDate, now: Instant) -> bool {
        match self.retries.get(&date) {
            Some(state) => now >= state.next_attempt_at,
            None => true,
        }
    }

    /// Re-admit operator-blocked days, e.g. after re-authentication.
    pub fn clear_blocked(&mut self) {
        self.blocked.clear();
    }

    /// Human-readable description of the most recent failure, for the
    /// non-blocking status indicator.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// One flush pass: select all `Pending`/`Failed` days owed to the remote
    /// store, oldest first, and attempt the upsert one at a time through
    /// `upsert`. The pass stops early on a transient or auth failure (the
    /// network or session is down for every remaining day too) and continues
    /// past validation rejections (other days may still be sendable).
    ///
    /// `in_memory` carries copies the caller still holds (the live day, and
    /// days whose persist failed). They are merged with the store scan so a
    /// broken local store never blocks the flush; for a date present in both,
    /// the in-memory copy wins because it is at least as fresh.
    ///
    /// The single-threaded caller guarantees no two passes overlap, which is
    /// what keeps per-key flushes serialized.
    pub fn run_flush_pass<F>(
        &mut self,
        store: &LocalStore,
        in_memory: &[DailyAggregate],
        now: Instant,
        mut upsert: F,
    ) -> FlushReport
    where
        F: FnMut(&DailyAggregate) -> Result<UpsertResponse, RemoteError>,
    {
        let mut report = FlushReport::default();

        let mut by_date: BTreeMap<NaiveDate, DailyAggregate> = BTreeMap::new();
        match store.list_pending(&self.user_id) {
            Ok(scanned) => {
                for aggregate in scanned {
                    by_date.insert(aggregate.date, aggregate);
                }
            }
            Err(e) => {
                tracing::warn!("could not scan pending days, flushing from memory: {e}");
                self.last_error = Some(e.to_string());
            }
        }
        for aggregate in in_memory {
            if matches!(aggregate.sync_state, SyncState::Pending | SyncState::Failed) {
                by_date.insert(aggregate.date, aggregate.clone());
            }
        }

        for (_, mut aggregate) in by_date {
            let date = aggregate.date;

            // Empty days carry nothing the remote store can accept.
            if aggregate.count == 0 {
                continue;
            }
            if self.blocked.contains(&date) || !self.is_due(date, now) {
                continue;
            }

            // Mark in flight and checkpoint before the attempt, so a crash
            // mid-flush is recovered as Failed, never trusted as done. A
            // failed checkpoint does not block the flush; the attempt
            // proceeds from memory and persistence is retried next pass.
            aggregate.sync_state = SyncState::Syncing;
            if let Err(e) = store.put(&aggregate) {
                tracing::warn!("checkpoint before flush failed for {date}: {e}");
            }

            match upsert(&aggregate) {
                Ok(_ack) => {
                    aggregate.sync_state = SyncState::Synced;
                    aggregate.last_synced_at = Some(Utc::now());
                    if let Err(e) = store.put(&aggregate) {
                        tracing::warn!("could not record sync success for {date}: {e}");
                    }
                    self.retries.remove(&date);
                    self.last_error = None;
                    tracing::info!("synced day {date}");
                    report.synced.push(date);
                }
                Err(err) => {
                    let kind = err.classify();
                    self.last_error = Some(err.to_string());

                    aggregate.sync_state = SyncState::Failed;
                    if let Err(e) = store.put(&aggregate) {
                        tracing::warn!("could not record sync failure for {date}: {e}");
                    }
                    report.failed.push((date, kind));

                    match kind {
                        FailureKind::Transient => {
                            let state = self.retries.entry(date).or_insert(RetryState {
                                attempts: 0,
                                next_attempt_at: now,
                            });
                            state.attempts += 1;
                            let delay = self.policy.delay_for(state.attempts);
                            state.next_attempt_at = now + delay;
                            tracing::warn!(
                                "sync of {date} failed (attempt {}), retrying in {:.1}s: {err}",
                                state.attempts,
                                delay.as_secs_f64()
                            );
                            // Network is down for the remaining days too.
                            break;
                        }
                        FailureKind::AuthRequired => {
                            self.blocked.insert(date);
                            report.auth_required = true;
                            tracing::warn!("sync of {date} requires re-authentication: {err}");
                            break;
                        }
                        FailureKind::ValidationRejected => {
                            self.blocked.insert(date);
                            tracing::warn!("remote store rejected day {date}: {err}");
                        }
                    }
                }
            }
        }

        report
    }
}
