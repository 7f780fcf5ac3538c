//! Provider adapter layer
//!
//! Presents a uniform generation capability over heterogeneous backends:
//! remote chat models of varying cost and capability plus a local CPU
//! fallback. Concrete implementations differ only in transport and cost
//! model; the router and pipeline speak only to the [`Provider`] trait.

pub mod local;
pub mod remote;
pub mod sse;

pub use local::LocalProvider;
pub use remote::RemoteProvider;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Capability class of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Fast,
    Reasoning,
    Advanced,
    Local,
}

impl Tier {
    /// The fixed fallback order the routing engine walks.
    pub const FALLBACK_ORDER: [Tier; 4] = [Tier::Fast, Tier::Reasoning, Tier::Advanced, Tier::Local];
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Fast => write!(f, "fast"),
            Tier::Reasoning => write!(f, "reasoning"),
            Tier::Advanced => write!(f, "advanced"),
            Tier::Local => write!(f, "local"),
        }
    }
}

/// Static description of one backend. The table of descriptors is set at
/// startup and atomically swapped on admin reload; any in-flight request
/// keeps the snapshot it captured at entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub tier: Tier,
    pub cost_per_1k_prompt_micro: u64,
    pub cost_per_1k_output_micro: u64,
    pub max_output_tokens: u32,
    pub supports_streaming: bool,
    /// Prior confidence assumed when the backend reports no self-score.
    pub confidence_prior: f64,
    /// Base URL of the backend; unused by the local tier.
    #[serde(default)]
    pub endpoint: String,
    /// Backend-side model identifier.
    #[serde(default)]
    pub model: String,
    /// Environment variable holding the credential. The core passes the
    /// token through without parsing it.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

/// Token accounting for one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub prompt: u32,
    pub output: u32,
}

impl TokenCounts {
    pub fn total(&self) -> u32 {
        self.prompt + self.output
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Filtered,
    Cancelled,
    Error,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinishReason::Stop => write!(f, "stop"),
            FinishReason::Length => write!(f, "length"),
            FinishReason::Filtered => write!(f, "filtered"),
            FinishReason::Cancelled => write!(f, "cancelled"),
            FinishReason::Error => write!(f, "error"),
        }
    }
}

/// Final result of one provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub text: String,
    pub finish_reason: FinishReason,
    pub tokens: TokenCounts,
    pub latency_ms: u64,
    pub provider: String,
    pub confidence: f64,
    pub cost_micro: u64,
    pub error: Option<String>,
}

impl GenerationOutcome {
    /// Outcome for a call cancelled mid-flight: partial deltas already
    /// emitted stay valid but no totals are reported.
    pub fn cancelled(provider: &str) -> Self {
        Self {
            text: String::new(),
            finish_reason: FinishReason::Cancelled,
            tokens: TokenCounts::default(),
            latency_ms: 0,
            provider: provider.to_string(),
            confidence: 0.0,
            cost_micro: 0,
            error: Some("cancelled".to_string()),
        }
    }
}

/// One element of a streaming generation. The sequence is finite and
/// non-restartable; exactly the last element carries `is_final = true`
/// together with the totals in `outcome`.
#[derive(Debug, Clone)]
pub struct StreamDelta {
    pub text_delta: String,
    pub is_final: bool,
    pub partial_tokens_output: u32,
    pub outcome: Option<GenerationOutcome>,
}

impl StreamDelta {
    pub fn text(delta: impl Into<String>, partial_tokens_output: u32) -> Self {
        Self {
            text_delta: delta.into(),
            is_final: false,
            partial_tokens_output,
            outcome: None,
        }
    }

    pub fn finished(outcome: GenerationOutcome) -> Self {
        Self {
            text_delta: String::new(),
            is_final: true,
            partial_tokens_output: outcome.tokens.output,
            outcome: Some(outcome),
        }
    }
}

/// Lazy, finite sequence of stream deltas.
pub type GenerationStream = Pin<Box<dyn Stream<Item = Result<StreamDelta, ProviderError>> + Send>>;

/// Failure classification for provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unavailable,
    Timeout,
    RateLimited,
    Auth,
    InvalidResponse,
    FilteredByBackend,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Unavailable => write!(f, "unavailable"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::RateLimited => write!(f, "rate_limited"),
            ErrorKind::Auth => write!(f, "auth"),
            ErrorKind::InvalidResponse => write!(f, "invalid_response"),
            ErrorKind::FilteredByBackend => write!(f, "filtered_by_backend"),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Provider call failure. `retry_safe` says whether retrying the same
/// provider is sensible; the fallback chain consults it before the walk.
#[derive(Debug, Clone, thiserror::Error)]
#[error("provider error ({kind}): {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
    pub retry_safe: bool,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let retry_safe = matches!(
            kind,
            ErrorKind::Unavailable | ErrorKind::Timeout | ErrorKind::RateLimited
        );
        Self {
            kind,
            message: message.into(),
            retry_safe,
        }
    }

    /// Permanent failures are alert-worthy in the audit trail.
    pub fn is_permanent(&self) -> bool {
        matches!(self.kind, ErrorKind::Auth | ErrorKind::InvalidResponse)
    }
}

/// What the pipeline asks a provider to generate.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub id: Uuid,
    pub prompt: String,
    /// Chain-of-thought token ceiling for reasoning-capable backends.
    pub cot_budget_tokens: Option<u32>,
}

/// Per-call limits.
#[derive(Debug, Clone, Copy)]
pub struct GenerationLimits {
    pub max_output_tokens: u32,
    pub deadline_ms: u64,
}

/// Uniform generation capability. One implementation per backend kind;
/// instances are cheap to share behind `Arc`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// The descriptor this instance was built from.
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Unary generation: the degenerate single-frame case of the
    /// streaming contract.
    async fn generate(
        &self,
        request: &GenerationRequest,
        limits: &GenerationLimits,
    ) -> Result<GenerationOutcome, ProviderError>;

    /// Streaming generation. Must stop promptly and release the
    /// connection when `cancel` fires; the final delta then carries a
    /// `Cancelled` outcome with no totals.
    async fn generate_stream(
        &self,
        request: GenerationRequest,
        limits: GenerationLimits,
        cancel: CancellationToken,
    ) -> Result<GenerationStream, ProviderError>;
}

/// Cost in micro-units, rounded up per 1k tokens.
pub fn cost_micro(descriptor: &ProviderDescriptor, tokens: TokenCounts) -> u64 {
    let prompt = (tokens.prompt as u64 * descriptor.cost_per_1k_prompt_micro + 999) / 1000;
    let output = (tokens.output as u64 * descriptor.cost_per_1k_output_micro + 999) / 1000;
    prompt + output
}

/// Refusal openers used by the structural confidence estimator.
const REFUSAL_MARKERS: &[&str] = &["i can't", "i cannot", "i'm sorry", "i am unable", "as an ai"];

/// Heuristic confidence for backends without a self-reported score:
/// tier prior, plus a small bonus for substantive length, minus
/// penalties for refusal openers and truncation.
pub fn estimate_confidence(
    descriptor: &ProviderDescriptor,
    text: &str,
    finish_reason: FinishReason,
) -> f64 {
    let mut score = descriptor.confidence_prior;
    if crate::classify::estimate_tokens(text) >= 64 {
        score += 0.05;
    }
    let lowered = text.trim_start().to_lowercase();
    if REFUSAL_MARKERS.iter().any(|m| lowered.starts_with(m)) {
        score -= 0.25;
    }
    if finish_reason == FinishReason::Length {
        score -= 0.15;
    }
    score.clamp(0.0, 1.0)
}

/// An immutable set of live provider instances built from one descriptor
/// table. Requests capture an `Arc<ProviderSet>` at entry and keep it for
/// their whole lifetime.
pub struct ProviderSet {
    providers: Vec<Arc<dyn Provider>>,
    by_name: HashMap<String, usize>,
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet")
            .field(
                "providers",
                &self
                    .providers
                    .iter()
                    .map(|p| p.descriptor().name.clone())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ProviderSet {
    /// Build live instances from descriptors. Remote tiers get a
    /// [`RemoteProvider`]; the local tier gets a [`LocalProvider`].
    /// Credentials are re-read from the environment here, which is what
    /// makes the admin reload pick up rotated secrets.
    pub fn from_descriptors(descriptors: &[ProviderDescriptor]) -> Result<Self, ProviderError> {
        let mut providers: Vec<Arc<dyn Provider>> = Vec::with_capacity(descriptors.len());
        let mut by_name = HashMap::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if by_name.contains_key(&descriptor.name) {
                return Err(ProviderError::new(
                    ErrorKind::Unknown,
                    format!("duplicate provider name: {}", descriptor.name),
                ));
            }
            let provider: Arc<dyn Provider> = match descriptor.tier {
                Tier::Local => Arc::new(LocalProvider::new(descriptor.clone())),
                _ => Arc::new(RemoteProvider::from_env(descriptor.clone())?),
            };
            by_name.insert(descriptor.name.clone(), providers.len());
            providers.push(provider);
        }
        Ok(Self { providers, by_name })
    }

    /// Assemble a set from prebuilt instances (tests and dev harnesses).
    pub fn from_providers(providers: Vec<Arc<dyn Provider>>) -> Self {
        let by_name = providers
            .iter()
            .enumerate()
            .map(|(i, p)| (p.descriptor().name.clone(), i))
            .collect();
        Self { providers, by_name }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.by_name.get(name).map(|&i| self.providers[i].clone())
    }

    /// Providers of a tier, in table order.
    pub fn in_tier(&self, tier: Tier) -> Vec<Arc<dyn Provider>> {
        self.providers
            .iter()
            .filter(|p| p.descriptor().tier == tier)
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.providers.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|p| p.descriptor().name.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }
}

/// Process-wide holder of the current [`ProviderSet`]. Readers take an
/// `Arc` snapshot; admin reload swaps the whole set atomically, so no
/// reader ever observes a partial table.
pub struct ProviderRegistry {
    current: RwLock<Arc<ProviderSet>>,
}

impl ProviderRegistry {
    pub fn new(set: ProviderSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(set)),
        }
    }

    pub fn snapshot(&self) -> Arc<ProviderSet> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn swap(&self, set: ProviderSet) {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(set);
    }
}
