//! Daily budget governor
//!
//! Tracks token and credit usage against daily ceilings. `reserve`,
//! `commit`, and `reset_day` are serialized behind one mutex, so two
//! concurrent reservations can never jointly exceed a hard cap. The day
//! key rolls over lazily on first touch of the new day, derived from a
//! configured UTC offset.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Enforcement strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetMode {
    Hard,
    Warn,
}

/// Budget tuning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSettings {
    pub daily_token_cap: u64,
    pub daily_credit_cap_micro: u64,
    pub mode: BudgetMode,
    /// Committed usage may exceed the reservation by this many tokens
    /// (streaming output is only measurable after the fact).
    pub overshoot_allowance_tokens: u64,
    /// Offset applied to UTC when deriving the day key.
    pub utc_offset_hours: i32,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            daily_token_cap: 2_000_000,
            daily_credit_cap_micro: 50_000_000,
            mode: BudgetMode::Hard,
            overshoot_allowance_tokens: 2_048,
            utc_offset_hours: 0,
        }
    }
}

/// Why a reservation was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    TokensCap,
    CreditsCap,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::TokensCap => write!(f, "tokens_cap"),
            DenyReason::CreditsCap => write!(f, "credits_cap"),
        }
    }
}

/// A granted claim against the budget. Commit it with actual usage, or
/// release it so a failed call does not consume budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub tokens: u64,
    pub credits_micro: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub day_key: String,
    pub tokens_used: u64,
    pub tokens_reserved: u64,
    pub tokens_cap: u64,
    pub credits_used_micro: u64,
    pub credits_reserved_micro: u64,
    pub credits_cap_micro: u64,
    pub mode: BudgetMode,
    pub overshot: bool,
    pub reset_at: DateTime<Utc>,
}

/// Optional persistence contract. On cold start the tracker reads the
/// current day's record; each commit writes it back. Failures are logged
/// and never surface to requests.
pub trait BudgetStore: Send + Sync {
    fn load(&self, day_key: &str) -> Option<PersistedBudget>;
    fn save(&self, day_key: &str, record: &PersistedBudget);
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedBudget {
    pub tokens_used: u64,
    pub credits_used_micro: u64,
}

#[derive(Debug)]
struct BudgetInner {
    day_key: String,
    tokens_used: u64,
    credits_used_micro: u64,
    tokens_reserved: u64,
    credits_reserved_micro: u64,
    overshot: bool,
    reset_at: DateTime<Utc>,
}

/// The serialized accounting object. One per process.
pub struct BudgetTracker {
    settings: BudgetSettings,
    inner: Mutex<BudgetInner>,
    store: Option<Arc<dyn BudgetStore>>,
}

impl BudgetTracker {
    pub fn new(settings: BudgetSettings) -> Self {
        Self::with_store(settings, None)
    }

    pub fn with_store(settings: BudgetSettings, store: Option<Arc<dyn BudgetStore>>) -> Self {
        let day_key = day_key_for(Utc::now(), settings.utc_offset_hours);
        let persisted = store
            .as_ref()
            .and_then(|s| s.load(&day_key))
            .unwrap_or_default();
        Self {
            inner: Mutex::new(BudgetInner {
                day_key,
                tokens_used: persisted.tokens_used,
                credits_used_micro: persisted.credits_used_micro,
                tokens_reserved: 0,
                credits_reserved_micro: 0,
                overshot: false,
                reset_at: Utc::now(),
            }),
            settings,
            store,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BudgetInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn roll_over_if_needed(&self, inner: &mut BudgetInner) {
        let today = day_key_for(Utc::now(), self.settings.utc_offset_hours);
        if inner.day_key != today {
            info!(from = %inner.day_key, to = %today, "budget day rollover");
            inner.day_key = today;
            inner.tokens_used = 0;
            inner.credits_used_micro = 0;
            inner.tokens_reserved = 0;
            inner.credits_reserved_micro = 0;
            inner.overshot = false;
            inner.reset_at = Utc::now();
        }
    }

    /// Claim estimated usage ahead of a provider call.
    pub fn reserve(
        &self,
        estimated_tokens: u64,
        estimated_cost_micro: u64,
    ) -> Result<Reservation, DenyReason> {
        let mut inner = self.lock();
        self.roll_over_if_needed(&mut inner);

        // After any overshoot in hard mode, nothing more is granted today.
        if self.settings.mode == BudgetMode::Hard && inner.overshot {
            return Err(DenyReason::TokensCap);
        }

        let tokens_after = inner.tokens_used + inner.tokens_reserved + estimated_tokens;
        if tokens_after > self.settings.daily_token_cap {
            return Err(DenyReason::TokensCap);
        }
        let credits_after =
            inner.credits_used_micro + inner.credits_reserved_micro + estimated_cost_micro;
        if credits_after > self.settings.daily_credit_cap_micro {
            return Err(DenyReason::CreditsCap);
        }

        inner.tokens_reserved += estimated_tokens;
        inner.credits_reserved_micro += estimated_cost_micro;
        Ok(Reservation {
            tokens: estimated_tokens,
            credits_micro: estimated_cost_micro,
        })
    }

    /// Record actual usage for a reservation. Actuals may exceed the
    /// reservation by up to the overshoot allowance.
    pub fn commit(&self, reservation: Reservation, actual_tokens: u64, actual_cost_micro: u64) {
        let mut inner = self.lock();
        self.roll_over_if_needed(&mut inner);

        inner.tokens_reserved = inner.tokens_reserved.saturating_sub(reservation.tokens);
        inner.credits_reserved_micro = inner
            .credits_reserved_micro
            .saturating_sub(reservation.credits_micro);

        let allowed_tokens = reservation.tokens + self.settings.overshoot_allowance_tokens;
        let clamped_tokens = actual_tokens.min(allowed_tokens);
        inner.tokens_used += clamped_tokens;
        inner.credits_used_micro += actual_cost_micro;

        if inner.tokens_used > self.settings.daily_token_cap
            || inner.credits_used_micro > self.settings.daily_credit_cap_micro
        {
            inner.overshot = true;
            match self.settings.mode {
                BudgetMode::Hard => {
                    warn!(
                        tokens_used = inner.tokens_used,
                        "budget overshot cap; further reservations denied today"
                    );
                }
                BudgetMode::Warn => {
                    warn!(tokens_used = inner.tokens_used, "budget overshot cap");
                }
            }
        }

        if let Some(store) = &self.store {
            store.save(
                &inner.day_key,
                &PersistedBudget {
                    tokens_used: inner.tokens_used,
                    credits_used_micro: inner.credits_used_micro,
                },
            );
        }
    }

    /// Return a reservation unused; a failed call consumes no budget.
    pub fn release(&self, reservation: Reservation) {
        let mut inner = self.lock();
        inner.tokens_reserved = inner.tokens_reserved.saturating_sub(reservation.tokens);
        inner.credits_reserved_micro = inner
            .credits_reserved_micro
            .saturating_sub(reservation.credits_micro);
    }

    /// Zero the counters and stamp the current day. Idempotent.
    pub fn reset_day(&self) {
        let mut inner = self.lock();
        inner.day_key = day_key_for(Utc::now(), self.settings.utc_offset_hours);
        inner.tokens_used = 0;
        inner.credits_used_micro = 0;
        inner.tokens_reserved = 0;
        inner.credits_reserved_micro = 0;
        inner.overshot = false;
        inner.reset_at = Utc::now();
        info!(day_key = %inner.day_key, "budget counters reset");
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let mut inner = self.lock();
        self.roll_over_if_needed(&mut inner);
        BudgetSnapshot {
            day_key: inner.day_key.clone(),
            tokens_used: inner.tokens_used,
            tokens_reserved: inner.tokens_reserved,
            tokens_cap: self.settings.daily_token_cap,
            credits_used_micro: inner.credits_used_micro,
            credits_reserved_micro: inner.credits_reserved_micro,
            credits_cap_micro: self.settings.daily_credit_cap_micro,
            mode: self.settings.mode,
            overshot: inner.overshot,
            reset_at: inner.reset_at,
        }
    }

    #[cfg(test)]
    pub fn preload_used(&self, tokens: u64, credits_micro: u64) {
        let mut inner = self.lock();
        inner.tokens_used = tokens;
        inner.credits_used_micro = credits_micro;
    }
}

/// `YYYY-MM-DD` in the configured offset.
fn day_key_for(now: DateTime<Utc>, utc_offset_hours: i32) -> String {
    let offset = FixedOffset::east_opt(utc_offset_hours * 3600)
        .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"));
    now.with_timezone(&offset).format("%Y-%m-%d").to_string()
}

/// In-memory store used by tests and dev mode.
pub struct MemoryBudgetStore {
    records: dashmap::DashMap<String, PersistedBudget>,
}

impl MemoryBudgetStore {
    pub fn new() -> Self {
        Self {
            records: dashmap::DashMap::new(),
        }
    }
}

impl Default for MemoryBudgetStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BudgetStore for MemoryBudgetStore {
    fn load(&self, day_key: &str) -> Option<PersistedBudget> {
        self.records.get(day_key).map(|r| r.clone())
    }

    fn save(&self, day_key: &str, record: &PersistedBudget) {
        self.records.insert(day_key.to_string(), record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(cap: u64, mode: BudgetMode) -> BudgetTracker {
        BudgetTracker::new(BudgetSettings {
            daily_token_cap: cap,
            daily_credit_cap_micro: 1_000_000,
            mode,
            overshoot_allowance_tokens: 100,
            utc_offset_hours: 0,
        })
    }

    #[test]
    fn reserve_and_commit_accumulate() {
        let t = tracker(1000, BudgetMode::Hard);
        let r = t.reserve(100, 50).unwrap();
        t.commit(r, 90, 45);
        let snap = t.snapshot();
        assert_eq!(snap.tokens_used, 90);
        assert_eq!(snap.credits_used_micro, 45);
        assert_eq!(snap.tokens_reserved, 0);
    }

    #[test]
    fn reservation_near_cap_denied() {
        let t = tracker(1000, BudgetMode::Hard);
        t.preload_used(990, 0);
        assert_eq!(t.reserve(11, 0).unwrap_err(), DenyReason::TokensCap);
        assert!(t.reserve(10, 0).is_ok());
    }

    #[test]
    fn concurrent_style_reservations_cannot_jointly_exceed_cap() {
        let t = tracker(1000, BudgetMode::Hard);
        let a = t.reserve(600, 0).unwrap();
        // The second reservation sees the first still outstanding.
        assert_eq!(t.reserve(600, 0).unwrap_err(), DenyReason::TokensCap);
        t.release(a);
        assert!(t.reserve(600, 0).is_ok());
    }

    #[test]
    fn credits_cap_reported_distinctly() {
        let t = BudgetTracker::new(BudgetSettings {
            daily_token_cap: 1_000_000,
            daily_credit_cap_micro: 100,
            mode: BudgetMode::Hard,
            overshoot_allowance_tokens: 0,
            utc_offset_hours: 0,
        });
        assert_eq!(t.reserve(10, 101).unwrap_err(), DenyReason::CreditsCap);
    }

    #[test]
    fn hard_mode_locks_out_after_overshoot() {
        let t = tracker(100, BudgetMode::Hard);
        let r = t.reserve(100, 0).unwrap();
        // Streaming produced more than reserved, within the allowance.
        t.commit(r, 150, 0);
        assert!(t.snapshot().overshot);
        assert!(t.reserve(1, 0).is_err());
    }

    #[test]
    fn warn_mode_keeps_granting_until_cap() {
        let t = tracker(1000, BudgetMode::Warn);
        let r = t.reserve(500, 0).unwrap();
        t.commit(r, 590, 0);
        // Not over the cap yet; 590 used.
        assert!(t.reserve(300, 0).is_ok());
    }

    #[test]
    fn overshoot_is_clamped_to_allowance() {
        let t = tracker(10_000, BudgetMode::Hard);
        let r = t.reserve(100, 0).unwrap();
        t.commit(r, 100 + 100 + 500, 0);
        // Only reservation + allowance counted.
        assert_eq!(t.snapshot().tokens_used, 200);
    }

    #[test]
    fn release_refunds_reservation() {
        let t = tracker(1000, BudgetMode::Hard);
        let r = t.reserve(800, 0).unwrap();
        t.release(r);
        let snap = t.snapshot();
        assert_eq!(snap.tokens_reserved, 0);
        assert_eq!(snap.tokens_used, 0);
    }

    #[test]
    fn reset_day_is_idempotent() {
        let t = tracker(1000, BudgetMode::Hard);
        let r = t.reserve(100, 10).unwrap();
        t.commit(r, 100, 10);
        t.reset_day();
        let first = t.snapshot();
        t.reset_day();
        let second = t.snapshot();
        assert_eq!(first.tokens_used, 0);
        assert_eq!(second.tokens_used, 0);
        assert_eq!(first.day_key, second.day_key);
    }

    #[test]
    fn store_roundtrip_on_cold_start() {
        let store = Arc::new(MemoryBudgetStore::new());
        let settings = BudgetSettings::default();
        let t = BudgetTracker::with_store(settings.clone(), Some(store.clone()));
        let r = t.reserve(100, 10).unwrap();
        t.commit(r, 100, 10);

        let warm = BudgetTracker::with_store(settings, Some(store));
        assert_eq!(warm.snapshot().tokens_used, 100);
    }

    #[test]
    fn day_key_respects_offset() {
        let now = DateTime::parse_from_rfc3339("2026-08-01T23:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(day_key_for(now, 0), "2026-08-01");
        assert_eq!(day_key_for(now, 1), "2026-08-02");
        assert_eq!(day_key_for(now, -1), "2026-08-01");
    }
}
