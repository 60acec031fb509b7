//! Daily aggregation of posture samples.
//!
//! Samples are folded into one weighted aggregate per local calendar day.
//! Day rollover is detected lazily, on the next fold or a periodic tick,
//! so a process suspended across midnight still seals the old day correctly.

use crate::core::angle::AngleSample;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Sync lifecycle of a daily aggregate. Transitions are driven solely by the
/// sync scheduler; the aggregator only ever resets `Synced` back to `Pending`
/// when a later fold dirties an already-synced day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Has local changes the remote store has not seen.
    Pending,
    /// A flush is in flight. Never trusted across a restart.
    Syncing,
    /// The remote store has acknowledged the current contents.
    Synced,
    /// The last flush failed; retryable failures re-enter the retry pool,
    /// auth/validation failures wait for operator intervention.
    Failed,
}

/// Weighted posture aggregate for one (user, local calendar date).
///
/// `sum_weighted` is the weighted deviation-angle sum: Σ deviation_degrees ×
/// weight_secs. The weighted mean deviation for the day is `sum_weighted /
/// weight_seconds`. The remote upsert replaces the record by key with these
/// cumulative values, so folding and the remote merge agree by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub user_id: String,
    /// Immutable key, in the user's local timezone.
    pub date: NaiveDate,
    pub sum_weighted: f64,
    pub weight_seconds: f64,
    pub count: u64,
    pub sync_state: SyncState,
    pub last_local_update_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl DailyAggregate {
    /// Create an empty aggregate for a new day.
    pub fn new(user_id: impl Into<String>, date: NaiveDate, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            date,
            sum_weighted: 0.0,
            weight_seconds: 0.0,
            count: 0,
            sync_state: SyncState::Pending,
            last_local_update_at: now,
            last_synced_at: None,
        }
    }

    /// Fold one sample into the aggregate.
    pub fn fold(&mut self, sample: &AngleSample, now: DateTime<Utc>) {
        self.sum_weighted += sample.deviation_degrees * sample.weight_secs;
        self.weight_seconds += sample.weight_secs;
        self.count += 1;
        self.last_local_update_at = now;

        // A fold on an already-synced day (backdated correction) makes the
        // remote record stale; re-enter the sync pool.
        if self.sync_state == SyncState::Synced {
            self.sync_state = SyncState::Pending;
        }
    }

    /// ISO key for storage and the wire contract.
    pub fn date_iso(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }

    /// Weighted mean deviation for the day, if any time was observed.
    pub fn weighted_mean_deviation(&self) -> Option<f64> {
        (self.weight_seconds > 0.0).then(|| self.sum_weighted / self.weight_seconds)
    }

    /// An empty aggregate is valid; observed time without samples (or the
    /// reverse) is not.
    pub fn invariants_hold(&self) -> bool {
        self.sum_weighted.is_finite()
            && self.weight_seconds.is_finite()
            && self.weight_seconds >= 0.0
            && (self.count == 0 || self.weight_seconds > 0.0)
    }
}

/// Folds classified samples into the live day's aggregate and seals days as
/// the local date advances.
pub struct LocalAggregator {
    user_id: String,
    tz: Tz,
    current: Option<DailyAggregate>,
    /// Days sealed by rollover, awaiting persist + sync handoff.
    sealed: Vec<DailyAggregate>,
}

impl LocalAggregator {
    pub fn new(user_id: impl Into<String>, tz: Tz) -> Self {
        Self {
            user_id: user_id.into(),
            tz,
            current: None,
            sealed: Vec::new(),
        }
    }

    /// Seed the live aggregate from a previously persisted day, so a restart
    /// mid-day continues the same aggregate instead of starting a second one.
    pub fn resume_from(&mut self, aggregate: DailyAggregate) {
        self.current = Some(aggregate);
    }

    /// Fold a sample into the aggregate for its local calendar date,
    /// creating it (and sealing the previous day) as needed. Never fails;
    /// malformed samples are rejected upstream by the angle computer.
    pub fn fold(&mut self, sample: &AngleSample) {
        let now = Utc::now();
        let date = sample.timestamp.with_timezone(&self.tz).date_naive();

        let needs_new = match &self.current {
            Some(agg) => agg.date != date,
            None => true,
        };
        if needs_new {
            if let Some(prev) = self.current.take() {
                self.sealed.push(prev);
            }
            self.current = Some(DailyAggregate::new(self.user_id.clone(), date, now));
        }

        // Unwrap is fine: the branch above guarantees a current aggregate.
        self.current.as_mut().unwrap().fold(sample, now);
    }

    /// Lazy rollover check, called from the periodic tick so a day with no
    /// further samples still gets sealed shortly after local midnight.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        let today = now.with_timezone(&self.tz).date_naive();
        if let Some(agg) = &self.current {
            if agg.date != today {
                self.sealed.push(self.current.take().unwrap());
            }
        }
    }

    /// Take the sealed days for persist + sync handoff.
    pub fn take_sealed(&mut self) -> Vec<DailyAggregate> {
        std::mem::take(&mut self.sealed)
    }

    pub fn has_sealed(&self) -> bool {
        !self.sealed.is_empty()
    }

    /// Snapshot of the live aggregate for the bounded-cadence persist.
    pub fn snapshot(&self) -> Option<DailyAggregate> {
        self.current.clone()
    }

    pub fn current(&self) -> Option<&DailyAggregate> {
        self.current.as_ref()
    }

    /// Reflect a sync-state transition made by the scheduler back onto the
    /// live aggregate, if it still covers that date. A fold that happened
    /// after the flush snapshot keeps the day `Pending` instead.
    pub fn apply_sync_state(
        &mut self,
        date: NaiveDate,
        state: SyncState,
        synced_at: Option<DateTime<Utc>>,
        snapshot_count: u64,
    ) {
        if let Some(agg) = &mut self.current {
            if agg.date == date {
                if state == SyncState::Synced && agg.count != snapshot_count {
                    // Folds landed while the flush was in flight; the remote
                    // record is already stale again.
                    agg.sync_state = SyncState::Pending;
                } else {
                    agg.sync_state = state;
                }
                if let Some(ts) = synced_at {
                    agg.last_synced_at = Some(ts);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(offset_secs: i64, deviation: f64, weight: f64) -> AngleSample {
        AngleSample {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap()
                + chrono::Duration::seconds(offset_secs),
            angle_degrees: deviation,
            deviation_degrees: deviation,
            is_forward_head_posture: deviation > 15.0,
            weight_secs: weight,
        }
    }

    fn aggregator() -> LocalAggregator {
        LocalAggregator::new("test-user", chrono_tz::UTC)
    }

    #[test]
    fn test_fold_sums_weights_and_counts() {
        let mut agg = aggregator();
        for i in 0..10 {
            agg.fold(&sample(i, 1.0, 0.5));
        }
        let current = agg.current().unwrap();
        assert_eq!(current.count, 10);
        assert!((current.weight_seconds - 5.0).abs() < 1e-9);
        assert!(current.invariants_hold());
    }

    #[test]
    fn test_weighted_scenario() {
        // Three samples with weights 10 s, 5 s, 20 s and contributions
        // 2, 0.5, 6 (deviation x weight).
        let mut agg = aggregator();
        agg.fold(&sample(0, 0.2, 10.0));
        agg.fold(&sample(10, 0.1, 5.0));
        agg.fold(&sample(15, 0.3, 20.0));

        let current = agg.current().unwrap();
        assert!((current.sum_weighted - 8.5).abs() < 1e-9);
        assert!((current.weight_seconds - 35.0).abs() < 1e-9);
        assert_eq!(current.count, 3);
        let mean = current.weighted_mean_deviation().unwrap();
        assert!((mean - 8.5 / 35.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_aggregate_is_valid() {
        let agg = DailyAggregate::new(
            "u",
            NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
            Utc::now(),
        );
        assert_eq!(agg.count, 0);
        assert_eq!(agg.weight_seconds, 0.0);
        assert!(agg.invariants_hold());
        assert!(agg.weighted_mean_deviation().is_none());
    }

    #[test]
    fn test_count_without_weight_violates_invariant() {
        let mut agg = DailyAggregate::new(
            "u",
            NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
            Utc::now(),
        );
        agg.count = 3;
        assert!(!agg.invariants_hold());
    }

    #[test]
    fn test_day_rollover_seals_previous_day() {
        let mut agg = aggregator();
        agg.fold(&sample(0, 1.0, 1.0));
        // Next sample lands after local midnight.
        agg.fold(&sample(13 * 3600, 1.0, 1.0));

        let sealed = agg.take_sealed();
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].date_iso(), "2024-03-05");
        assert_eq!(agg.current().unwrap().date_iso(), "2024-03-06");
    }

    #[test]
    fn test_tick_seals_without_new_samples() {
        let mut agg = aggregator();
        agg.fold(&sample(0, 1.0, 1.0));
        assert!(!agg.has_sealed());

        let next_day = Utc.with_ymd_and_hms(2024, 3, 6, 0, 5, 0).unwrap();
        agg.tick(next_day);
        assert!(agg.has_sealed());
        assert!(agg.current().is_none());
    }

    #[test]
    fn test_fold_on_synced_day_reenters_pending() {
        let mut agg = aggregator();
        agg.fold(&sample(0, 1.0, 1.0));
        let date = agg.current().unwrap().date;
        let count = agg.current().unwrap().count;
        agg.apply_sync_state(date, SyncState::Synced, Some(Utc::now()), count);
        assert_eq!(agg.current().unwrap().sync_state, SyncState::Synced);

        agg.fold(&sample(1, 1.0, 1.0));
        assert_eq!(agg.current().unwrap().sync_state, SyncState::Pending);
    }

    #[test]
    fn test_concurrent_fold_keeps_pending_after_sync_ack() {
        let mut agg = aggregator();
        agg.fold(&sample(0, 1.0, 1.0));
        let date = agg.current().unwrap().date;
        let snapshot_count = agg.current().unwrap().count;

        // A fold lands between the flush snapshot and the acknowledgement.
        agg.fold(&sample(1, 1.0, 1.0));
        agg.apply_sync_state(date, SyncState::Synced, Some(Utc::now()), snapshot_count);
        assert_eq!(agg.current().unwrap().sync_state, SyncState::Pending);
    }

    #[test]
    fn test_timezone_resolves_local_date() {
        let mut agg = LocalAggregator::new("u", chrono_tz::America::Los_Angeles);
        // 03:00 UTC on Mar 6 is still Mar 5 in Los Angeles.
        let s = AngleSample {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 6, 3, 0, 0).unwrap(),
            angle_degrees: 1.0,
            deviation_degrees: 1.0,
            is_forward_head_posture: false,
            weight_secs: 1.0,
        };
        agg.fold(&s);
        assert_eq!(agg.current().unwrap().date_iso(), "2024-03-05");
    }
}
