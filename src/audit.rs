//! Audit records and in-process metrics
//!
//! Every request produces exactly one immutable audit record, emitted as
//! a single JSON object per line through an [`AuditSink`]. The record
//! never contains raw PII: the prompt it references is the redacted one,
//! and only the fingerprint identifies the content.
//!
//! Counters stay plain atomics so the decision path never depends on an
//! observability library.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::classify::Classification;
use crate::guard::{PostGuardAction, PreGuardAction};
use crate::providers::TokenCounts;
use crate::routing::RoutingDecision;

/// Guard verdicts attached to a request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FiltersApplied {
    pub pre_guard: PreGuardAction,
    pub post_guard: PostGuardAction,
}

/// The one-per-request audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub fingerprint: String,
    pub classification: Option<Classification>,
    pub routing: Option<RoutingDecision>,
    pub filters: FiltersApplied,
    pub tokens: TokenCounts,
    pub cost_micro: u64,
    pub latency_ms: u64,
    pub finish_reason: String,
    pub cached: bool,
    pub post_guard_redacted: bool,
    pub post_guard_blocked: bool,
    /// Set for alert-worthy failures (auth, invalid responses, internal).
    pub error_code: Option<String>,
    pub received_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Destination for audit records.
pub trait AuditSink: Send + Sync {
    fn emit(&self, record: &AuditRecord);
}

/// Default sink: one JSON object per line on the `audit` tracing target.
pub struct JsonlAuditSink;

impl AuditSink for JsonlAuditSink {
    fn emit(&self, record: &AuditRecord) {
        match serde_json::to_string(record) {
            Ok(line) => info!(target: "audit", "{}", line),
            Err(e) => info!(target: "audit", id = %record.id, "unserializable audit record: {}", e),
        }
    }
}

/// Capturing sink for tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, record: &AuditRecord) {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record.clone());
    }
}

/// Stage that blocked a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStage {
    PreGuard,
    PostGuard,
}

/// Confidence histogram bucket edges.
const CONFIDENCE_BUCKETS: [f64; 4] = [0.25, 0.5, 0.75, 1.0];

/// In-process counter surface, exposed read-only to the admin API.
pub struct Metrics {
    requests_by_provider: DashMap<String, u64>,
    requests_by_reason: DashMap<String, u64>,
    requests_by_outcome: DashMap<String, u64>,
    escalations_by_tier: DashMap<String, u64>,
    provider_errors: DashMap<String, u64>,
    blocked_pre_guard: AtomicU64,
    blocked_post_guard: AtomicU64,
    cache_hits: AtomicU64,
    confidence_buckets: [AtomicU64; 4],
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests_by_provider: DashMap::new(),
            requests_by_reason: DashMap::new(),
            requests_by_outcome: DashMap::new(),
            escalations_by_tier: DashMap::new(),
            provider_errors: DashMap::new(),
            blocked_pre_guard: AtomicU64::new(0),
            blocked_post_guard: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            confidence_buckets: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
        }
    }

    pub fn record_request(&self, provider: &str, reason: &str, outcome: &str) {
        *self
            .requests_by_provider
            .entry(provider.to_string())
            .or_insert(0) += 1;
        *self.requests_by_reason.entry(reason.to_string()).or_insert(0) += 1;
        *self
            .requests_by_outcome
            .entry(outcome.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_confidence(&self, confidence: f64) {
        for (i, edge) in CONFIDENCE_BUCKETS.iter().enumerate() {
            if confidence <= *edge {
                self.confidence_buckets[i].fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.confidence_buckets[CONFIDENCE_BUCKETS.len() - 1].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_escalation(&self, target_tier: &str) {
        *self
            .escalations_by_tier
            .entry(target_tier.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_block(&self, stage: BlockStage) {
        match stage {
            BlockStage::PreGuard => self.blocked_pre_guard.fetch_add(1, Ordering::Relaxed),
            BlockStage::PostGuard => self.blocked_post_guard.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_provider_error(&self, provider: &str) {
        *self
            .provider_errors
            .entry(provider.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// JSON view for the admin surface.
    pub fn snapshot(&self) -> serde_json::Value {
        let map_of = |m: &DashMap<String, u64>| {
            m.iter()
                .map(|e| (e.key().clone(), serde_json::json!(*e.value())))
                .collect::<serde_json::Map<String, serde_json::Value>>()
        };
        serde_json::json!({
            "requests_by_provider": map_of(&self.requests_by_provider),
            "requests_by_reason": map_of(&self.requests_by_reason),
            "requests_by_outcome": map_of(&self.requests_by_outcome),
            "escalations_by_tier": map_of(&self.escalations_by_tier),
            "provider_errors": map_of(&self.provider_errors),
            "blocked": {
                "pre_guard": self.blocked_pre_guard.load(Ordering::Relaxed),
                "post_guard": self.blocked_post_guard.load(Ordering::Relaxed),
            },
            "cache_hits": self.cache_hits.load(Ordering::Relaxed),
            "confidence_buckets": {
                "le_0_25": self.confidence_buckets[0].load(Ordering::Relaxed),
                "le_0_50": self.confidence_buckets[1].load(Ordering::Relaxed),
                "le_0_75": self.confidence_buckets[2].load(Ordering::Relaxed),
                "le_1_00": self.confidence_buckets[3].load(Ordering::Relaxed),
            },
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
