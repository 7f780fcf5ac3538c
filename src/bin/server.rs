//! DS-Router server binary
//!
//! The composition root: loads settings, builds every core service as an
//! explicitly owned object (no module singletons), wires them into the
//! pipeline, and serves the HTTP surface. Run with: cargo run --bin server

use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info, warn};

use ds_router::api::{serve, AppState};
use ds_router::audit::{JsonlAuditSink, Metrics};
use ds_router::budget::BudgetTracker;
use ds_router::cache::{MemoryCache, NoopCache, ResponseCache};
use ds_router::classify::Classifier;
use ds_router::config::{Settings, EXIT_CONFIG_ERROR, EXIT_PROVIDER_BOOTSTRAP};
use ds_router::guard::{PostGuard, PreGuard};
use ds_router::health::HealthTracker;
use ds_router::pipeline::Pipeline;
use ds_router::providers::{ProviderRegistry, ProviderSet, Tier};
use ds_router::routing::RoutingEngine;

#[derive(Parser)]
#[command(name = "ds-router")]
#[command(about = "Intelligent LLM request router")]
struct Cli {
    /// Path to the configuration file (TOML). Environment variables with
    /// the DS_ROUTER_ prefix override file values.
    #[arg(long, env = "DS_ROUTER_CONFIG")]
    config: Option<String>,

    /// Use the in-memory response cache instead of running cache-less.
    #[arg(long)]
    memory_cache: bool,
}

#[tokio::main]
async fn main() {
    // .env is optional; deployments set real environment variables.
    if dotenv().is_err() {
        eprintln!("note: no .env file found; using process environment only");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting DS-Router...");
    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("configuration error: {}", e);
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    info!("Server: {}:{}", settings.server.host, settings.server.port);
    info!(
        "Budget: {} tokens/day, {} micro-credits/day, mode {:?}",
        settings.budget.daily_token_cap,
        settings.budget.daily_credit_cap_micro,
        settings.budget.mode
    );
    if settings.server.admin_token.is_empty() {
        warn!("no admin token configured; the admin surface is disabled");
    }

    let descriptors = settings.descriptors();
    for descriptor in &descriptors {
        if descriptor.tier != Tier::Local {
            match &descriptor.api_key_env {
                Some(var) if std::env::var(var).is_ok() => {
                    info!("provider {} configured ({} tier)", descriptor.name, descriptor.tier);
                }
                Some(var) => {
                    warn!(
                        "provider {} has no credential in ${}; calls will fail over",
                        descriptor.name, var
                    );
                }
                None => info!(
                    "provider {} configured without credential ({} tier)",
                    descriptor.name, descriptor.tier
                ),
            }
        }
    }

    let set = match ProviderSet::from_descriptors(&descriptors) {
        Ok(set) => set,
        Err(e) => {
            error!("provider bootstrap failed: {}", e);
            std::process::exit(EXIT_PROVIDER_BOOTSTRAP);
        }
    };
    info!("provider table ready: {:?}", set.names());

    let health = Arc::new(HealthTracker::new(settings.circuit.clone()));
    for name in set.names() {
        health.register(&name);
    }
    let budget = Arc::new(BudgetTracker::new(settings.budget.clone()));
    let engine = Arc::new(RoutingEngine::new(
        health.clone(),
        budget.clone(),
        settings.router.thresholds(),
        settings.router.provider_order.clone(),
    ));
    let registry = Arc::new(ProviderRegistry::new(set));
    let cache: Arc<dyn ResponseCache> = if cli.memory_cache {
        info!("using in-memory response cache");
        Arc::new(MemoryCache::new())
    } else {
        Arc::new(NoopCache)
    };

    let pipeline = Arc::new(Pipeline::new(
        Classifier::new(settings.classifier.clone()),
        PreGuard::new(),
        PostGuard::new(),
        registry,
        engine,
        health,
        budget,
        cache,
        Arc::new(JsonlAuditSink),
        Arc::new(Metrics::new()),
        settings.pipeline.clone(),
    ));

    let state = AppState {
        pipeline,
        admin_token: settings.server.admin_token.clone(),
        config_path: cli.config.clone(),
    };

    if let Err(e) = serve(state, &settings.server.host, settings.server.port).await {
        error!("server error: {}", e);
        std::process::exit(1);
    }
}
