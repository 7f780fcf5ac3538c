//! Wire types for the chat and admin HTTP surfaces

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::health::CircuitState;
use crate::providers::Tier;
use crate::routing::Thresholds;

/// Stable failure envelope for unary responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub ok: bool,
    pub code: String,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// `POST /admin/router/set-thresholds` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdsResponse {
    pub current_thresholds: Thresholds,
}

/// Simple status acknowledgements (`budget_reset`, `reloaded`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

/// `POST /admin/router/force-override` body. `null` clears.
#[derive(Debug, Clone, Deserialize)]
pub struct ForceOverrideRequest {
    pub provider: Option<String>,
}

/// Per-provider entry of `GET /providers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatusEntry {
    pub status: String,
    pub tier: Tier,
    pub p95_latency_ms: u64,
    pub error_rate: f64,
    pub circuit_state: CircuitState,
}

/// `GET /providers` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersResponse {
    pub providers: HashMap<String, ProviderStatusEntry>,
    pub router_active: bool,
    pub timestamp: DateTime<Utc>,
}
