//! Routing engine: provider selection, escalation, fallback
//!
//! Chooses the initial provider from classification plus health and
//! budget snapshots, walks the fixed fallback order when a candidate is
//! ineligible, and gates the single confidence-driven escalation. All
//! selection logic is synchronous; no lock is held across provider I/O.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::budget::{BudgetTracker, DenyReason, Reservation};
use crate::classify::{Classification, Complexity, RequestFlags};
use crate::health::{Admission, HealthTracker};
use crate::providers::{cost_micro, Provider, ProviderSet, Tier, TokenCounts};

/// Admin-tunable routing thresholds. Swapped atomically; every request
/// captures one snapshot and uses it end-to-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    /// Confidence strictly below this escalates to the advanced tier.
    pub conf_threshold: f64,
    /// RAG support below this biases selection toward reasoning tiers.
    pub support_threshold: f64,
    /// Ceiling on chain-of-thought tokens for reasoning backends.
    pub max_cot_tokens: u32,
    /// Operator-forced provider, still subject to health/budget gates.
    pub forced_override: Option<String>,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            conf_threshold: 0.62,
            support_threshold: 0.55,
            max_cot_tokens: 4096,
            forced_override: None,
        }
    }
}

/// Partial threshold update from the admin surface.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThresholdsUpdate {
    pub conf_threshold: Option<f64>,
    pub support_threshold: Option<f64>,
    pub max_cot_tokens: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum ThresholdError {
    #[error("{field} must be within [0, 1], got {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

/// Why a provider was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    SimpleQuery,
    ComplexQuery,
    LowConfidenceEscalation,
    DegradedFallback,
    BudgetFallback,
    CircuitOpenFallback,
    ForcedOverride,
}

impl std::fmt::Display for RouteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RouteReason::SimpleQuery => "simple_query",
            RouteReason::ComplexQuery => "complex_query",
            RouteReason::LowConfidenceEscalation => "low_confidence_escalation",
            RouteReason::DegradedFallback => "degraded_fallback",
            RouteReason::BudgetFallback => "budget_fallback",
            RouteReason::CircuitOpenFallback => "circuit_open_fallback",
            RouteReason::ForcedOverride => "forced_override",
        };
        write!(f, "{}", s)
    }
}

/// The record a request carries about how it was routed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub chosen: String,
    pub reason: RouteReason,
    pub candidates_tried: Vec<String>,
    pub classification: Classification,
    pub confidence_before: Option<f64>,
    pub confidence_after: Option<f64>,
}

/// A gated, budget-reserved provider choice ready to execute.
pub struct Selection {
    pub provider: Arc<dyn Provider>,
    pub reason: RouteReason,
    /// Candidates gated out before this one was chosen.
    pub candidates_tried: Vec<String>,
    /// `None` for the cost-free local tier.
    pub reservation: Option<Reservation>,
    /// This call is the provider's single half-open probe.
    pub probe: bool,
    pub cot_budget: Option<u32>,
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selection")
            .field("provider", &self.provider.descriptor().name)
            .field("reason", &self.reason)
            .field("candidates_tried", &self.candidates_tried)
            .field("reservation", &self.reservation)
            .field("probe", &self.probe)
            .field("cot_budget", &self.cot_budget)
            .finish()
    }
}

/// Terminal failure of a selection walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteFailure {
    /// Every candidate was rejected by an open breaker.
    AllCircuitsOpen { retry_after_ms: u64 },
    /// Budget denied the remote tiers and the local tier was unusable.
    BudgetExhausted,
    /// No provider could be selected for a mix of reasons.
    AllUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateOutcome {
    Circuit { retry_after_ms: u64 },
    Budget(DenyReason),
}

/// Expected output tokens assumed when reserving budget ahead of a call.
const RESERVE_OUTPUT_TOKENS: u32 = 512;

pub struct RoutingEngine {
    health: Arc<HealthTracker>,
    budget: Arc<BudgetTracker>,
    thresholds: RwLock<Arc<Thresholds>>,
    provider_order: Vec<Tier>,
}

impl RoutingEngine {
    pub fn new(
        health: Arc<HealthTracker>,
        budget: Arc<BudgetTracker>,
        thresholds: Thresholds,
        provider_order: Vec<Tier>,
    ) -> Self {
        let order = if provider_order.is_empty() {
            Tier::FALLBACK_ORDER.to_vec()
        } else {
            provider_order
        };
        Self {
            health,
            budget,
            thresholds: RwLock::new(Arc::new(thresholds)),
            provider_order: order,
        }
    }

    /// Current threshold snapshot; cheap to clone and safe to hold for a
    /// whole request.
    pub fn thresholds(&self) -> Arc<Thresholds> {
        self.thresholds
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Validated partial update, applied as one atomic swap.
    pub fn update_thresholds(&self, update: ThresholdsUpdate) -> Result<Thresholds, ThresholdError> {
        let mut next = (*self.thresholds()).clone();
        if let Some(v) = update.conf_threshold {
            if !(0.0..=1.0).contains(&v) {
                return Err(ThresholdError::OutOfRange {
                    field: "conf_threshold",
                    value: v,
                });
            }
            next.conf_threshold = v;
        }
        if let Some(v) = update.support_threshold {
            if !(0.0..=1.0).contains(&v) {
                return Err(ThresholdError::OutOfRange {
                    field: "support_threshold",
                    value: v,
                });
            }
            next.support_threshold = v;
        }
        if let Some(v) = update.max_cot_tokens {
            next.max_cot_tokens = v;
        }
        self.swap_thresholds(next.clone());
        Ok(next)
    }

    pub fn set_forced_override(&self, provider: Option<String>) -> Thresholds {
        let mut next = (*self.thresholds()).clone();
        next.forced_override = provider;
        self.swap_thresholds(next.clone());
        next
    }

    fn swap_thresholds(&self, next: Thresholds) {
        let mut guard = self.thresholds.write().unwrap_or_else(|p| p.into_inner());
        *guard = Arc::new(next);
    }

    /// Escalation gate: strictly below the threshold, never from the
    /// advanced tier itself.
    pub fn should_escalate(&self, confidence: f64, current_tier: Tier) -> bool {
        let thresholds = self.thresholds();
        current_tier != Tier::Advanced && confidence < thresholds.conf_threshold
    }

    /// Preferred tier from classification and grounding support.
    fn preferred_tier(
        &self,
        classification: &Classification,
        flags: RequestFlags,
        support_score: Option<f64>,
    ) -> Tier {
        let thresholds = self.thresholds();
        let base = match classification.complexity {
            Complexity::Simple => Tier::Fast,
            Complexity::Complex | Complexity::Hard => Tier::Reasoning,
        };
        // Weak grounding support biases at least up to the reasoning tier.
        if flags.grounding_required
            && support_score.map_or(false, |s| s < thresholds.support_threshold)
            && base == Tier::Fast
        {
            Tier::Reasoning
        } else {
            base
        }
    }

    /// Chain-of-thought budget modulated by classification and the
    /// provider's confidence prior: the less trusted the backend, the
    /// more room it gets to think, never above the ceiling.
    fn cot_budget(&self, classification: &Classification, tier: Tier, prior: f64) -> Option<u32> {
        if !matches!(tier, Tier::Reasoning | Tier::Advanced) {
            return None;
        }
        let thresholds = self.thresholds();
        let max = thresholds.max_cot_tokens;
        let base = match classification.complexity {
            Complexity::Simple => max / 4,
            Complexity::Complex => max / 2,
            Complexity::Hard => max,
        };
        let bonus = ((1.0 - prior.clamp(0.0, 1.0)) * (max as f64 / 2.0)) as u32;
        Some((base.saturating_add(bonus)).min(max))
    }

    /// Select the initial provider for a request.
    pub fn select_initial(
        &self,
        set: &ProviderSet,
        classification: &Classification,
        flags: RequestFlags,
        support_score: Option<f64>,
    ) -> Result<Selection, RouteFailure> {
        let thresholds = self.thresholds();
        let preferred = self.preferred_tier(classification, flags, support_score);
        let default_reason = match classification.complexity {
            Complexity::Simple => RouteReason::SimpleQuery,
            _ => RouteReason::ComplexQuery,
        };

        let mut candidates: Vec<Arc<dyn Provider>> = Vec::new();
        let mut forced = false;
        if let Some(name) = &thresholds.forced_override {
            if let Some(provider) = set.get(name) {
                candidates.push(provider);
                forced = true;
            }
        }
        candidates.extend(self.chain_from(set, preferred));

        self.walk(classification, candidates, &[], move |position| {
            if position == 0 && forced {
                RouteReason::ForcedOverride
            } else {
                default_reason
            }
        })
    }

    /// Walk to the next eligible provider after `failed` providers
    /// errored mid-request.
    pub fn next_after_failure(
        &self,
        set: &ProviderSet,
        classification: &Classification,
        flags: RequestFlags,
        support_score: Option<f64>,
        failed: &[String],
    ) -> Result<Selection, RouteFailure> {
        let preferred = self.preferred_tier(classification, flags, support_score);
        let candidates = self.chain_from(set, preferred);
        let mut selection = self.walk(classification, candidates, failed, |_| {
            RouteReason::DegradedFallback
        })?;
        selection.reason = RouteReason::DegradedFallback;
        Ok(selection)
    }

    /// Gate the advanced tier for the single escalation. `None` when the
    /// tier is missing, unhealthy, or unbudgeted.
    pub fn escalation_target(
        &self,
        set: &ProviderSet,
        classification: &Classification,
        exclude: &[String],
    ) -> Option<Selection> {
        let candidates = self.rank(set.in_tier(Tier::Advanced));
        let mut selection = self
            .walk(classification, candidates, exclude, |_| {
                RouteReason::LowConfidenceEscalation
            })
            .ok()?;
        selection.reason = RouteReason::LowConfidenceEscalation;
        Some(selection)
    }

    /// Candidates in the fixed fallback order, starting from the
    /// preferred tier, each tier ranked by the deterministic tie-break.
    fn chain_from(&self, set: &ProviderSet, preferred: Tier) -> Vec<Arc<dyn Provider>> {
        let start = self
            .provider_order
            .iter()
            .position(|t| *t == preferred)
            .unwrap_or(0);
        let mut out = Vec::new();
        for tier in &self.provider_order[start..] {
            out.extend(self.rank(set.in_tier(*tier)));
        }
        out
    }

    /// Tie-break: lower p95 latency, then lower output cost, then name.
    fn rank(&self, mut providers: Vec<Arc<dyn Provider>>) -> Vec<Arc<dyn Provider>> {
        providers.sort_by(|a, b| {
            let ha = self.health.snapshot(&a.descriptor().name);
            let hb = self.health.snapshot(&b.descriptor().name);
            ha.p95_latency_ms
                .cmp(&hb.p95_latency_ms)
                .then(
                    a.descriptor()
                        .cost_per_1k_output_micro
                        .cmp(&b.descriptor().cost_per_1k_output_micro),
                )
                .then(a.descriptor().name.cmp(&b.descriptor().name))
        });
        providers
    }

    /// Try candidates in order, applying health and budget gates. The
    /// chosen selection's reason reflects the gate that displaced the
    /// earlier candidates.
    fn walk(
        &self,
        classification: &Classification,
        candidates: Vec<Arc<dyn Provider>>,
        exclude: &[String],
        base_reason: impl Fn(usize) -> RouteReason,
    ) -> Result<Selection, RouteFailure> {
        let mut tried: Vec<String> = Vec::new();
        let mut last_gate: Option<GateOutcome> = None;
        let mut shortest_cooldown: Option<u64> = None;
        let mut any_budget_denial = false;
        let mut all_circuit = true;
        let mut position = 0usize;

        for provider in candidates {
            let descriptor = provider.descriptor().clone();
            if exclude.contains(&descriptor.name) || tried.contains(&descriptor.name) {
                continue;
            }
            let index = position;
            position += 1;

            let admission = self.health.try_admit(&descriptor.name);
            let probe = match admission {
                Admission::Admitted => false,
                Admission::AdmittedProbe => true,
                Admission::Rejected { retry_after_ms } => {
                    debug!(provider = %descriptor.name, "gated by open circuit");
                    tried.push(descriptor.name.clone());
                    last_gate = Some(GateOutcome::Circuit { retry_after_ms });
                    shortest_cooldown = Some(
                        shortest_cooldown.map_or(retry_after_ms, |c: u64| c.min(retry_after_ms)),
                    );
                    continue;
                }
            };

            let reservation = if descriptor.tier == Tier::Local {
                // The terminal tier is free and exempt from accounting.
                None
            } else {
                let est_tokens = TokenCounts {
                    prompt: classification.est_prompt_tokens,
                    output: RESERVE_OUTPUT_TOKENS.min(descriptor.max_output_tokens),
                };
                let est_cost = cost_micro(&descriptor, est_tokens);
                match self
                    .budget
                    .reserve(est_tokens.total() as u64, est_cost)
                {
                    Ok(reservation) => Some(reservation),
                    Err(reason) => {
                        debug!(provider = %descriptor.name, %reason, "gated by budget");
                        if probe {
                            self.health.abort_probe(&descriptor.name);
                        }
                        tried.push(descriptor.name.clone());
                        last_gate = Some(GateOutcome::Budget(reason));
                        any_budget_denial = true;
                        all_circuit = false;
                        continue;
                    }
                }
            };

            let reason = match (index, last_gate) {
                (0, _) | (_, None) => base_reason(index),
                (_, Some(GateOutcome::Circuit { .. })) => RouteReason::CircuitOpenFallback,
                (_, Some(GateOutcome::Budget(_))) => RouteReason::BudgetFallback,
            };

            let cot_budget =
                self.cot_budget(classification, descriptor.tier, descriptor.confidence_prior);

            return Ok(Selection {
                provider,
                reason,
                candidates_tried: tried,
                reservation,
                probe,
                cot_budget,
            });
        }

        if position == 0 {
            return Err(RouteFailure::AllUnavailable);
        }
        if all_circuit {
            Err(RouteFailure::AllCircuitsOpen {
                retry_after_ms: shortest_cooldown.unwrap_or(0),
            })
        } else if any_budget_denial {
            Err(RouteFailure::BudgetExhausted)
        } else {
            Err(RouteFailure::AllUnavailable)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetMode, BudgetSettings};
    use crate::classify::{Classifier, RiskClass};
    use crate::health::CircuitSettings;
    use crate::providers::{
        FinishReason, GenerationLimits, GenerationOutcome, GenerationRequest, GenerationStream,
        ProviderDescriptor, ProviderError, StreamDelta,
    };
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct StubProvider {
        descriptor: ProviderDescriptor,
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn descriptor(&self) -> &ProviderDescriptor {
            &self.descriptor
        }

        async fn generate(
            &self,
            request: &GenerationRequest,
            _limits: &GenerationLimits,
        ) -> Result<GenerationOutcome, ProviderError> {
            Ok(GenerationOutcome {
                text: format!("answer to {}", request.prompt),
                finish_reason: FinishReason::Stop,
                tokens: crate::providers::TokenCounts {
                    prompt: 10,
                    output: 20,
                },
                latency_ms: 5,
                provider: self.descriptor.name.clone(),
                confidence: 0.9,
                cost_micro: 10,
                error: None,
            })
        }

        async fn generate_stream(
            &self,
            request: GenerationRequest,
            limits: GenerationLimits,
            _cancel: CancellationToken,
        ) -> Result<GenerationStream, ProviderError> {
            let outcome = self.generate(&request, &limits).await?;
            Ok(Box::pin(futures::stream::iter(vec![Ok(
                StreamDelta::finished(outcome),
            )])))
        }
    }

    fn descriptor(name: &str, tier: Tier) -> ProviderDescriptor {
        ProviderDescriptor {
            name: name.to_string(),
            tier,
            cost_per_1k_prompt_micro: if tier == Tier::Local { 0 } else { 500 },
            cost_per_1k_output_micro: if tier == Tier::Local { 0 } else { 1500 },
            max_output_tokens: 1024,
            supports_streaming: true,
            confidence_prior: 0.7,
            endpoint: String::new(),
            model: name.to_string(),
            api_key_env: None,
        }
    }

    fn full_set() -> ProviderSet {
        ProviderSet::from_providers(vec![
            Arc::new(StubProvider {
                descriptor: descriptor("fast-1", Tier::Fast),
            }),
            Arc::new(StubProvider {
                descriptor: descriptor("reasoning-1", Tier::Reasoning),
            }),
            Arc::new(StubProvider {
                descriptor: descriptor("advanced-1", Tier::Advanced),
            }),
            Arc::new(StubProvider {
                descriptor: descriptor("local-1", Tier::Local),
            }),
        ])
    }

    fn engine_with(
        health: Arc<HealthTracker>,
        budget: Arc<BudgetTracker>,
    ) -> RoutingEngine {
        RoutingEngine::new(
            health,
            budget,
            Thresholds::default(),
            Tier::FALLBACK_ORDER.to_vec(),
        )
    }

    fn engine() -> RoutingEngine {
        engine_with(
            Arc::new(HealthTracker::new(CircuitSettings::default())),
            Arc::new(BudgetTracker::new(BudgetSettings::default())),
        )
    }

    fn classification(complexity: Complexity) -> Classification {
        Classification {
            complexity,
            est_prompt_tokens: 10,
            needs_reasoning: complexity != Complexity::Simple,
            risk_class: RiskClass::Benign,
        }
    }

    #[test]
    fn simple_routes_to_fast_tier() {
        let selection = engine()
            .select_initial(
                &full_set(),
                &classification(Complexity::Simple),
                RequestFlags::default(),
                None,
            )
            .unwrap();
        assert_eq!(selection.provider.descriptor().name, "fast-1");
        assert_eq!(selection.reason, RouteReason::SimpleQuery);
        assert!(selection.candidates_tried.is_empty());
        assert!(selection.cot_budget.is_none());
    }

    #[test]
    fn hard_routes_to_reasoning_with_cot_budget() {
        let selection = engine()
            .select_initial(
                &full_set(),
                &classification(Complexity::Hard),
                RequestFlags::default(),
                None,
            )
            .unwrap();
        assert_eq!(selection.provider.descriptor().name, "reasoning-1");
        assert_eq!(selection.reason, RouteReason::ComplexQuery);
        let cot = selection.cot_budget.unwrap();
        assert!(cot > 0 && cot <= Thresholds::default().max_cot_tokens);
    }

    #[test]
    fn open_circuit_falls_back_with_reason() {
        let health = Arc::new(HealthTracker::new(CircuitSettings::default()));
        health.force_open("fast-1");
        let eng = engine_with(
            health,
            Arc::new(BudgetTracker::new(BudgetSettings::default())),
        );
        let selection = eng
            .select_initial(
                &full_set(),
                &classification(Complexity::Simple),
                RequestFlags::default(),
                None,
            )
            .unwrap();
        assert_eq!(selection.provider.descriptor().name, "reasoning-1");
        assert_eq!(selection.reason, RouteReason::CircuitOpenFallback);
        assert_eq!(selection.candidates_tried, vec!["fast-1".to_string()]);
    }

    #[test]
    fn budget_denial_falls_back_to_local() {
        let budget = Arc::new(BudgetTracker::new(BudgetSettings {
            daily_token_cap: 1_000,
            ..Default::default()
        }));
        budget.preload_used(990, 0);
        let eng = engine_with(
            Arc::new(HealthTracker::new(CircuitSettings::default())),
            budget.clone(),
        );
        let selection = eng
            .select_initial(
                &full_set(),
                &classification(Complexity::Simple),
                RequestFlags::default(),
                None,
            )
            .unwrap();
        assert_eq!(selection.provider.descriptor().tier, Tier::Local);
        assert_eq!(selection.reason, RouteReason::BudgetFallback);
        assert!(selection.reservation.is_none());
        // Non-local counters untouched.
        assert_eq!(budget.snapshot().tokens_reserved, 0);
    }

    #[test]
    fn budget_beats_circuit_when_it_is_the_last_gate() {
        // Fast and reasoning circuits open, advanced denied by budget:
        // local is chosen with the budget reason, not the circuit one.
        let health = Arc::new(HealthTracker::new(CircuitSettings::default()));
        health.force_open("fast-1");
        health.force_open("reasoning-1");
        let budget = Arc::new(BudgetTracker::new(BudgetSettings {
            daily_token_cap: 1,
            ..Default::default()
        }));
        let eng = engine_with(health, budget);
        let selection = eng
            .select_initial(
                &full_set(),
                &classification(Complexity::Simple),
                RequestFlags::default(),
                None,
            )
            .unwrap();
        assert_eq!(selection.provider.descriptor().tier, Tier::Local);
        assert_eq!(selection.reason, RouteReason::BudgetFallback);
        assert_eq!(selection.candidates_tried.len(), 3);
    }

    #[test]
    fn all_open_reports_shortest_cooldown() {
        let health = Arc::new(HealthTracker::new(CircuitSettings::default()));
        for name in ["fast-1", "reasoning-1", "advanced-1", "local-1"] {
            health.force_open(name);
        }
        let eng = engine_with(
            health,
            Arc::new(BudgetTracker::new(BudgetSettings::default())),
        );
        let failure = eng
            .select_initial(
                &full_set(),
                &classification(Complexity::Simple),
                RequestFlags::default(),
                None,
            )
            .unwrap_err();
        assert!(matches!(failure, RouteFailure::AllCircuitsOpen { .. }));
    }

    #[test]
    fn forced_override_wins_when_healthy() {
        let eng = engine();
        eng.set_forced_override(Some("advanced-1".to_string()));
        let selection = eng
            .select_initial(
                &full_set(),
                &classification(Complexity::Simple),
                RequestFlags::default(),
                None,
            )
            .unwrap();
        assert_eq!(selection.provider.descriptor().name, "advanced-1");
        assert_eq!(selection.reason, RouteReason::ForcedOverride);
    }

    #[test]
    fn forced_override_still_gated_by_health() {
        let health = Arc::new(HealthTracker::new(CircuitSettings::default()));
        health.force_open("advanced-1");
        let eng = engine_with(
            health,
            Arc::new(BudgetTracker::new(BudgetSettings::default())),
        );
        eng.set_forced_override(Some("advanced-1".to_string()));
        let selection = eng
            .select_initial(
                &full_set(),
                &classification(Complexity::Simple),
                RequestFlags::default(),
                None,
            )
            .unwrap();
        assert_eq!(selection.provider.descriptor().name, "fast-1");
        assert!(selection
            .candidates_tried
            .contains(&"advanced-1".to_string()));
    }

    #[test]
    fn grounding_with_weak_support_biases_to_reasoning() {
        let eng = engine();
        let flags = RequestFlags {
            grounding_required: true,
            ..Default::default()
        };
        let selection = eng
            .select_initial(
                &full_set(),
                &classification(Complexity::Simple),
                flags,
                Some(0.2),
            )
            .unwrap();
        assert_eq!(selection.provider.descriptor().tier, Tier::Reasoning);
    }

    #[test]
    fn escalation_boundary_is_strict() {
        let eng = engine();
        let threshold = eng.thresholds().conf_threshold;
        assert!(!eng.should_escalate(threshold, Tier::Reasoning));
        assert!(eng.should_escalate(threshold - 0.01, Tier::Reasoning));
        assert!(!eng.should_escalate(0.0, Tier::Advanced));
    }

    #[test]
    fn escalation_target_is_advanced_tier() {
        let eng = engine();
        let selection = eng
            .escalation_target(&full_set(), &classification(Complexity::Hard), &[])
            .unwrap();
        assert_eq!(selection.provider.descriptor().tier, Tier::Advanced);
        assert_eq!(selection.reason, RouteReason::LowConfidenceEscalation);
    }

    #[test]
    fn threshold_update_validates_range() {
        let eng = engine();
        assert!(eng
            .update_thresholds(ThresholdsUpdate {
                conf_threshold: Some(1.5),
                ..Default::default()
            })
            .is_err());
        let updated = eng
            .update_thresholds(ThresholdsUpdate {
                conf_threshold: Some(0.8),
                max_cot_tokens: Some(2048),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(updated.conf_threshold, 0.8);
        assert_eq!(updated.max_cot_tokens, 2048);
        assert_eq!(eng.thresholds().conf_threshold, 0.8);
    }

    #[test]
    fn degraded_fallback_excludes_failed_providers() {
        let eng = engine();
        let selection = eng
            .next_after_failure(
                &full_set(),
                &classification(Complexity::Simple),
                RequestFlags::default(),
                None,
                &["fast-1".to_string()],
            )
            .unwrap();
        assert_eq!(selection.provider.descriptor().name, "reasoning-1");
        assert_eq!(selection.reason, RouteReason::DegradedFallback);
    }

    #[test]
    fn tie_break_prefers_cheaper_then_lexicographic() {
        let mut cheap = descriptor("zeta", Tier::Fast);
        cheap.cost_per_1k_output_micro = 100;
        let expensive = descriptor("alpha", Tier::Fast);
        let set = ProviderSet::from_providers(vec![
            Arc::new(StubProvider {
                descriptor: expensive,
            }),
            Arc::new(StubProvider { descriptor: cheap }),
        ]);
        let selection = engine()
            .select_initial(
                &set,
                &classification(Complexity::Simple),
                RequestFlags::default(),
                None,
            )
            .unwrap();
        // No latency history: cost decides.
        assert_eq!(selection.provider.descriptor().name, "zeta");
    }
}
