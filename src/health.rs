//! Per-provider health tracking and circuit breaking
//!
//! Every provider call reports exactly one success or failure here. A
//! small per-provider state machine gates admission: `Closed` admits
//! everything, `Open` rejects without touching the adapter, `HalfOpen`
//! admits a single probe. Rolling windows are bounded both by time
//! (`w_ms`) and by sample count (`s_max`); whichever is stricter applies.
//!
//! All mutation happens under the per-provider mutex and never awaits, so
//! transitions are serialized and readers always see a consistent
//! snapshot.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker state for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker tuning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSettings {
    /// Consecutive failures that trip the breaker outright.
    pub f_open: u32,
    /// Windowed error rate that trips the breaker.
    pub r_open: f64,
    /// Time bound of the rolling window.
    pub w_ms: u64,
    /// Sample bound of the rolling window.
    pub s_max: usize,
    /// Minimum samples before the error-rate rule applies.
    pub n_min: usize,
    /// How long an open breaker rejects before probing.
    pub cooldown_ms: u64,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            f_open: 5,
            r_open: 0.5,
            w_ms: 60_000,
            s_max: 128,
            n_min: 8,
            cooldown_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    ok: bool,
    latency_ms: u64,
}

#[derive(Debug)]
struct HealthInner {
    state: CircuitState,
    consecutive_failures: u32,
    samples: VecDeque<Sample>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl HealthInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            samples: VecDeque::new(),
            last_failure_at: None,
            last_success_at: None,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn prune(&mut self, settings: &CircuitSettings, now: Instant) {
        let horizon = Duration::from_millis(settings.w_ms);
        while let Some(front) = self.samples.front() {
            if now.duration_since(front.at) > horizon {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > settings.s_max {
            self.samples.pop_front();
        }
    }

    fn error_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failures = self.samples.iter().filter(|s| !s.ok).count();
        failures as f64 / self.samples.len() as f64
    }

    fn latency_percentile(&self, quantile: f64) -> u64 {
        let mut latencies: Vec<u64> = self
            .samples
            .iter()
            .filter(|s| s.ok)
            .map(|s| s.latency_ms)
            .collect();
        if latencies.is_empty() {
            return 0;
        }
        latencies.sort_unstable();
        let rank = ((latencies.len() as f64 - 1.0) * quantile).round() as usize;
        latencies[rank.min(latencies.len() - 1)]
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }
}

/// Read-only view of one provider's health, captured atomically.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub error_rate: f64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub samples: usize,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Remaining cooldown when the breaker is open.
    pub retry_after_ms: Option<u64>,
}

/// Whether the breaker admits a call right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed normally.
    Admitted,
    /// Proceed, but this call is the single half-open probe.
    AdmittedProbe,
    /// Breaker open (or probe already in flight); do not call.
    Rejected { retry_after_ms: u64 },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

/// Process-wide tracker, one entry per provider name.
pub struct HealthTracker {
    settings: CircuitSettings,
    providers: DashMap<String, Mutex<HealthInner>>,
}

impl HealthTracker {
    pub fn new(settings: CircuitSettings) -> Self {
        Self {
            settings,
            providers: DashMap::new(),
        }
    }

    /// Ensure an entry exists for a provider.
    pub fn register(&self, name: &str) {
        self.providers
            .entry(name.to_string())
            .or_insert_with(|| Mutex::new(HealthInner::new()));
    }

    fn with_inner<R>(&self, name: &str, f: impl FnOnce(&mut HealthInner) -> R) -> R {
        let entry = self
            .providers
            .entry(name.to_string())
            .or_insert_with(|| Mutex::new(HealthInner::new()));
        let mut inner = entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut inner)
    }

    /// Gate a call. Lazily transitions `Open → HalfOpen` once the
    /// cooldown has elapsed; at most one probe is ever in flight.
    pub fn try_admit(&self, name: &str) -> Admission {
        let cooldown = Duration::from_millis(self.settings.cooldown_ms);
        self.with_inner(name, |inner| {
            let now = Instant::now();
            match inner.state {
                CircuitState::Closed => Admission::Admitted,
                CircuitState::Open => {
                    let opened_at = inner.opened_at.unwrap_or(now);
                    let elapsed = now.duration_since(opened_at);
                    if elapsed >= cooldown {
                        inner.state = CircuitState::HalfOpen;
                        inner.probe_in_flight = true;
                        info!(provider = %name, "circuit half-open, admitting probe");
                        Admission::AdmittedProbe
                    } else {
                        Admission::Rejected {
                            retry_after_ms: (cooldown - elapsed).as_millis() as u64,
                        }
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.probe_in_flight {
                        // Concurrent attempts observe the breaker as open
                        // until the probe settles.
                        Admission::Rejected {
                            retry_after_ms: self.settings.cooldown_ms,
                        }
                    } else {
                        inner.probe_in_flight = true;
                        Admission::AdmittedProbe
                    }
                }
            }
        })
    }

    /// Undo a probe admission that never turned into a call (e.g. the
    /// budget vetoed the provider after admission).
    pub fn abort_probe(&self, name: &str) {
        self.with_inner(name, |inner| {
            if inner.state == CircuitState::HalfOpen && inner.probe_in_flight {
                inner.probe_in_flight = false;
            }
        });
    }

    /// Record a successful call.
    pub fn observe_success(&self, name: &str, latency_ms: u64) {
        let settings = self.settings.clone();
        self.with_inner(name, |inner| {
            let now = Instant::now();
            inner.last_success_at = Some(Utc::now());
            inner.consecutive_failures = 0;
            if inner.state == CircuitState::HalfOpen {
                // Probe succeeded: close and start from a clean window.
                inner.state = CircuitState::Closed;
                inner.probe_in_flight = false;
                inner.opened_at = None;
                inner.samples.clear();
                info!(provider = %name, "circuit closed after successful probe");
            }
            inner.samples.push_back(Sample {
                at: now,
                ok: true,
                latency_ms,
            });
            inner.prune(&settings, now);
        });
    }

    /// Record a failed call; may trip the breaker.
    pub fn observe_failure(&self, name: &str, latency_ms: u64) {
        let settings = self.settings.clone();
        self.with_inner(name, |inner| {
            let now = Instant::now();
            inner.last_failure_at = Some(Utc::now());
            inner.consecutive_failures += 1;

            if inner.state == CircuitState::HalfOpen {
                // Probe failed: reopen and restart the cooldown.
                inner.open(now);
                warn!(provider = %name, "probe failed, circuit reopened");
                return;
            }

            inner.samples.push_back(Sample {
                at: now,
                ok: false,
                latency_ms,
            });
            inner.prune(&settings, now);

            let consecutive_trip = inner.consecutive_failures >= settings.f_open;
            let rate_trip = inner.samples.len() >= settings.n_min
                && inner.error_rate() >= settings.r_open;
            if inner.state == CircuitState::Closed && (consecutive_trip || rate_trip) {
                inner.open(now);
                warn!(
                    provider = %name,
                    consecutive = inner.consecutive_failures,
                    error_rate = inner.error_rate(),
                    "circuit opened"
                );
            }
        });
    }

    /// Atomic `(state, latency, error-rate)` snapshot for one provider.
    pub fn snapshot(&self, name: &str) -> HealthSnapshot {
        let cooldown = Duration::from_millis(self.settings.cooldown_ms);
        let settings = self.settings.clone();
        self.with_inner(name, |inner| {
            let now = Instant::now();
            inner.prune(&settings, now);
            let retry_after_ms = match (inner.state, inner.opened_at) {
                (CircuitState::Open, Some(opened_at)) => Some(
                    cooldown
                        .saturating_sub(now.duration_since(opened_at))
                        .as_millis() as u64,
                ),
                _ => None,
            };
            HealthSnapshot {
                state: inner.state,
                consecutive_failures: inner.consecutive_failures,
                error_rate: inner.error_rate(),
                p50_latency_ms: inner.latency_percentile(0.50),
                p95_latency_ms: inner.latency_percentile(0.95),
                samples: inner.samples.len(),
                last_failure_at: inner.last_failure_at,
                last_success_at: inner.last_success_at,
                retry_after_ms,
            }
        })
    }

    /// Snapshots for every registered provider.
    pub fn snapshot_all(&self) -> Vec<(String, HealthSnapshot)> {
        let names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        names
            .into_iter()
            .map(|name| {
                let snap = self.snapshot(&name);
                (name, snap)
            })
            .collect()
    }

    /// Shortest remaining cooldown across open breakers, for the
    /// retry-after hint when every provider is open.
    pub fn shortest_cooldown_ms(&self) -> Option<u64> {
        self.snapshot_all()
            .into_iter()
            .filter_map(|(_, snap)| snap.retry_after_ms)
            .min()
    }

    /// Force a breaker open (test and operations hook).
    #[cfg(test)]
    pub fn force_open(&self, name: &str) {
        self.with_inner(name, |inner| inner.open(Instant::now()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(settings: CircuitSettings) -> HealthTracker {
        let t = HealthTracker::new(settings);
        t.register("p");
        t
    }

    #[test]
    fn closed_admits_and_tracks_latency() {
        let t = tracker(CircuitSettings::default());
        assert_eq!(t.try_admit("p"), Admission::Admitted);
        t.observe_success("p", 100);
        t.observe_success("p", 300);
        let snap = t.snapshot("p");
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.samples, 2);
        assert!(snap.p95_latency_ms >= snap.p50_latency_ms);
    }

    #[test]
    fn consecutive_failures_trip_breaker() {
        let t = tracker(CircuitSettings {
            f_open: 3,
            ..Default::default()
        });
        for _ in 0..3 {
            t.observe_failure("p", 50);
        }
        let snap = t.snapshot("p");
        assert_eq!(snap.state, CircuitState::Open);
        assert!(snap.retry_after_ms.is_some());
        assert!(matches!(t.try_admit("p"), Admission::Rejected { .. }));
    }

    #[test]
    fn error_rate_trips_after_n_min_samples() {
        let t = tracker(CircuitSettings {
            f_open: 100,
            r_open: 0.5,
            n_min: 4,
            ..Default::default()
        });
        // Alternate so consecutive failures never accumulate.
        t.observe_success("p", 10);
        t.observe_failure("p", 10);
        t.observe_failure("p", 10);
        let before = t.snapshot("p");
        assert_eq!(before.state, CircuitState::Closed);
        t.observe_failure("p", 10);
        // 3 of 4 samples failed, above the 0.5 rate.
        assert_eq!(t.snapshot("p").state, CircuitState::Open);
    }

    #[test]
    fn open_transitions_to_half_open_and_admits_one_probe() {
        let t = tracker(CircuitSettings {
            f_open: 1,
            cooldown_ms: 0,
            ..Default::default()
        });
        t.observe_failure("p", 10);
        assert_eq!(t.snapshot("p").state, CircuitState::Open);
        // Zero cooldown: the next admission attempt becomes the probe.
        assert_eq!(t.try_admit("p"), Admission::AdmittedProbe);
        // A concurrent attempt is rejected until the probe settles.
        assert!(matches!(t.try_admit("p"), Admission::Rejected { .. }));
        t.observe_success("p", 20);
        assert_eq!(t.snapshot("p").state, CircuitState::Closed);
        assert_eq!(t.try_admit("p"), Admission::Admitted);
    }

    #[test]
    fn failed_probe_reopens() {
        let t = tracker(CircuitSettings {
            f_open: 1,
            cooldown_ms: 0,
            ..Default::default()
        });
        t.observe_failure("p", 10);
        assert_eq!(t.try_admit("p"), Admission::AdmittedProbe);
        t.observe_failure("p", 10);
        assert_eq!(t.snapshot("p").state, CircuitState::Open);
    }

    #[test]
    fn aborted_probe_frees_the_slot() {
        let t = tracker(CircuitSettings {
            f_open: 1,
            cooldown_ms: 0,
            ..Default::default()
        });
        t.observe_failure("p", 10);
        assert_eq!(t.try_admit("p"), Admission::AdmittedProbe);
        t.abort_probe("p");
        assert_eq!(t.try_admit("p"), Admission::AdmittedProbe);
    }

    #[test]
    fn window_is_sample_bounded() {
        let t = tracker(CircuitSettings {
            s_max: 4,
            f_open: 100,
            n_min: 100,
            ..Default::default()
        });
        for _ in 0..10 {
            t.observe_success("p", 10);
        }
        assert_eq!(t.snapshot("p").samples, 4);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let t = tracker(CircuitSettings {
            f_open: 3,
            ..Default::default()
        });
        t.observe_failure("p", 10);
        t.observe_failure("p", 10);
        t.observe_success("p", 10);
        t.observe_failure("p", 10);
        t.observe_failure("p", 10);
        assert_eq!(t.snapshot("p").state, CircuitState::Closed);
    }
}
