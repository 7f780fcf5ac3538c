//! # DS-Router
//!
//! An intelligent LLM request router that fronts a small set of
//! heterogeneous generation backends (remote chat models of varying cost
//! and capability plus a local CPU fallback) and answers chat requests
//! while enforcing safety, cost, and availability constraints.
//!
//! ## Core components
//!
//! - [`classify`]: request fingerprinting and complexity classification
//! - [`guard`]: the safety sandwich (PreGuard on input, PostGuard on
//!   output)
//! - [`providers`]: the uniform `Provider` capability over remote and
//!   local backends
//! - [`health`]: per-provider reliability accounting and circuit
//!   breaking
//! - [`budget`]: daily token/credit ceilings with hard/warn enforcement
//! - [`routing`]: provider selection, confidence-gated escalation, and
//!   the fallback chain
//! - [`cache`]: the consumed lookup/store contract of the external
//!   semantic cache
//! - [`pipeline`]: the end-to-end request lifecycle, including token
//!   streaming
//! - [`audit`]: per-request audit records and counter emission
//! - [`api`]: the HTTP boundary (chat + admin surfaces)
//! - [`config`]: settings loading and validation

pub mod api;
pub mod audit;
pub mod budget;
pub mod cache;
pub mod classify;
pub mod config;
pub mod guard;
pub mod health;
pub mod pipeline;
pub mod providers;
pub mod routing;

// Flat re-exports of the types most callers need.
pub use audit::{AuditRecord, AuditSink, JsonlAuditSink, Metrics};
pub use budget::{BudgetMode, BudgetSettings, BudgetTracker};
pub use cache::{MemoryCache, NoopCache, ResponseCache};
pub use classify::{Classification, Classifier, Complexity, RequestFlags};
pub use guard::{PostGuard, PreGuard};
pub use health::{CircuitSettings, CircuitState, HealthTracker};
pub use pipeline::{ChatRequest, ChatResponse, Pipeline, PipelineSettings, StreamFrame};
pub use providers::{
    GenerationOutcome, Provider, ProviderDescriptor, ProviderRegistry, ProviderSet, Tier,
};
pub use routing::{RouteReason, RoutingDecision, RoutingEngine, Thresholds};

use thiserror::Error;

/// Top-level error for embedding the router as a library.
#[derive(Error, Debug)]
pub enum RouterError {
    /// Configuration failed to load or validate.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// The provider table could not be built.
    #[error("provider bootstrap error: {0}")]
    ProviderBootstrap(#[from] providers::ProviderError),

    /// A malformed request was rejected before processing.
    #[error("request error: {0}")]
    Request(#[from] pipeline::PipelineError),

    /// JSON serialization failure at the boundary.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias using [`RouterError`].
pub type Result<T> = std::result::Result<T, RouterError>;
