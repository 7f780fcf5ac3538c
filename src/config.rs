//! Settings loading and validation
//!
//! Settings come from an optional TOML file layered under `DS_ROUTER_*`
//! environment overrides (double underscore separates nesting, e.g.
//! `DS_ROUTER_BUDGET__DAILY_TOKEN_CAP=1000`). Everything has a sensible
//! default so the server boots with zero configuration, serving the
//! local fallback provider only.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget::BudgetSettings;
use crate::classify::ClassifierSettings;
use crate::health::CircuitSettings;
use crate::pipeline::PipelineSettings;
use crate::providers::{ProviderDescriptor, Tier};
use crate::routing::Thresholds;

/// Process exit codes for the binaries.
pub const EXIT_CONFIG_ERROR: i32 = 2;
pub const EXIT_PROVIDER_BOOTSTRAP: i32 = 3;
pub const EXIT_SINK_ERROR: i32 = 4;

/// HTTP server options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Bearer credential required on every admin route. Empty disables
    /// the admin surface entirely.
    pub admin_token: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8700,
            admin_token: String::new(),
        }
    }
}

/// The full settings tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub router: RouterSettings,
    pub circuit: CircuitSettings,
    pub budget: BudgetSettings,
    pub pipeline: PipelineSettings,
    pub classifier: ClassifierSettings,
    pub providers: Vec<ProviderDescriptor>,
}

/// Routing thresholds plus the fallback order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    pub conf_threshold: f64,
    pub support_threshold: f64,
    pub max_cot_tokens: u32,
    pub forced_override: Option<String>,
    pub provider_order: Vec<Tier>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        let thresholds = Thresholds::default();
        Self {
            conf_threshold: thresholds.conf_threshold,
            support_threshold: thresholds.support_threshold,
            max_cot_tokens: thresholds.max_cot_tokens,
            forced_override: None,
            provider_order: Tier::FALLBACK_ORDER.to_vec(),
        }
    }
}

impl RouterSettings {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            conf_threshold: self.conf_threshold,
            support_threshold: self.support_threshold,
            max_cot_tokens: self.max_cot_tokens,
            forced_override: self.forced_override.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Settings {
    /// Load from `path` (optional file) plus environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix("DS_ROUTER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Range and consistency checks beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("router.conf_threshold", self.router.conf_threshold),
            ("router.support_threshold", self.router.support_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.circuit.r_open) {
            return Err(ConfigError::Invalid(format!(
                "circuit.r_open must be within [0, 1], got {}",
                self.circuit.r_open
            )));
        }
        if self.circuit.s_max == 0 {
            return Err(ConfigError::Invalid(
                "circuit.s_max must be at least 1".to_string(),
            ));
        }
        if !(-14..=14).contains(&self.budget.utc_offset_hours) {
            return Err(ConfigError::Invalid(format!(
                "budget.utc_offset_hours must be within [-14, 14], got {}",
                self.budget.utc_offset_hours
            )));
        }
        for descriptor in &self.providers {
            if descriptor.name.is_empty() {
                return Err(ConfigError::Invalid(
                    "provider descriptors require a name".to_string(),
                ));
            }
            if !(0.0..=1.0).contains(&descriptor.confidence_prior) {
                return Err(ConfigError::Invalid(format!(
                    "provider {} confidence_prior must be within [0, 1]",
                    descriptor.name
                )));
            }
            if descriptor.tier != Tier::Local && descriptor.endpoint.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "provider {} needs an endpoint",
                    descriptor.name
                )));
            }
        }
        if let Some(forced) = &self.router.forced_override {
            if !self.descriptors().iter().any(|d| &d.name == forced) {
                return Err(ConfigError::Invalid(format!(
                    "forced_override names unknown provider {}",
                    forced
                )));
            }
        }
        Ok(())
    }

    /// Provider table to boot with. A local-tier descriptor is appended
    /// when the operator configures none, so the terminal fallback always
    /// exists.
    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        let mut descriptors = self.providers.clone();
        if !descriptors.iter().any(|d| d.tier == Tier::Local) {
            descriptors.push(default_local_descriptor());
        }
        descriptors
    }
}

/// The always-present terminal fallback.
pub fn default_local_descriptor() -> ProviderDescriptor {
    ProviderDescriptor {
        name: "local-cpu".to_string(),
        tier: Tier::Local,
        cost_per_1k_prompt_micro: 0,
        cost_per_1k_output_micro: 0,
        max_output_tokens: 512,
        supports_streaming: true,
        confidence_prior: 0.35,
        endpoint: String::new(),
        model: "local-fallback".to_string(),
        api_key_env: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn default_descriptors_include_local_fallback() {
        let settings = Settings::default();
        let descriptors = settings.descriptors();
        assert!(descriptors.iter().any(|d| d.tier == Tier::Local));
    }

    #[test]
    fn out_of_range_threshold_rejected() {
        let mut settings = Settings::default();
        settings.router.conf_threshold = 1.2;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn remote_provider_without_endpoint_rejected() {
        let mut settings = Settings::default();
        settings.providers.push(ProviderDescriptor {
            name: "fast-1".to_string(),
            tier: Tier::Fast,
            cost_per_1k_prompt_micro: 100,
            cost_per_1k_output_micro: 300,
            max_output_tokens: 1024,
            supports_streaming: true,
            confidence_prior: 0.7,
            endpoint: String::new(),
            model: "fast-chat".to_string(),
            api_key_env: None,
        });
        assert!(settings.validate().is_err());
    }

    #[test]
    fn forced_override_must_name_known_provider() {
        let mut settings = Settings::default();
        settings.router.forced_override = Some("ghost".to_string());
        assert!(settings.validate().is_err());
        settings.router.forced_override = Some("local-cpu".to_string());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn thresholds_projection_matches_router_settings() {
        let settings = Settings::default();
        let thresholds = settings.router.thresholds();
        assert_eq!(thresholds.conf_threshold, settings.router.conf_threshold);
        assert_eq!(thresholds.max_cot_tokens, settings.router.max_cot_tokens);
    }
}
