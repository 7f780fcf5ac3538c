//! DS-Router admin CLI
//!
//! Drives the admin HTTP surface: threshold tuning, budget reset,
//! provider reload, health queries, and the forced override. Exit codes:
//! 0 success, 2 configuration error, 3 provider bootstrap failure,
//! 4 persistent sink error.

use anyhow::Result;
use clap::{Parser, Subcommand};
use ds_router::config::{EXIT_CONFIG_ERROR, EXIT_PROVIDER_BOOTSTRAP, EXIT_SINK_ERROR};
use tracing::error;

#[derive(Parser)]
#[command(name = "ds-router-admin")]
#[command(about = "DS-Router admin CLI - runtime control over a running router")]
#[command(version = "1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Base URL of the running router
    #[arg(long, env = "DS_ROUTER_URL", default_value = "http://127.0.0.1:8700")]
    url: String,

    /// Admin bearer credential
    #[arg(long, env = "DS_ROUTER_ADMIN_TOKEN")]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show per-provider health and circuit state
    Health,

    /// Show current routing thresholds
    GetThresholds,

    /// Update routing thresholds (partial)
    SetThresholds {
        /// Confidence threshold in [0, 1]
        #[arg(long)]
        conf: Option<f64>,

        /// Support threshold in [0, 1]
        #[arg(long)]
        support: Option<f64>,

        /// Chain-of-thought token ceiling
        #[arg(long)]
        max_cot: Option<u32>,
    },

    /// Show budget usage for the current day
    Budget,

    /// Reset the daily budget counters
    ResetBudget {
        /// Confirm the reset
        #[arg(long)]
        confirm: bool,
    },

    /// Reload provider descriptors and credentials
    Reload,

    /// Force routing to a single provider (empty to clear)
    ForceOverride {
        /// Provider name; omit to clear the override
        provider: Option<String>,
    },

    /// Show the in-process metrics counters
    Metrics,
}

struct AdminClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl AdminClient {
    fn new(base_url: String, token: Option<String>) -> Self {
        Self {
            base_url,
            token,
            http: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url.trim_end_matches('/'), path));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value> {
        let response = self.request(reqwest::Method::GET, path).send().await?;
        Self::into_json(response).await
    }

    async fn post(&self, path: &str, body: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let mut builder = self.request(reqwest::Method::POST, path);
        if let Some(body) = body {
            builder = builder.json(&body);
        } else {
            builder = builder.json(&serde_json::json!({}));
        }
        Self::into_json(builder.send().await?).await
    }

    async fn into_json(response: reqwest::Response) -> Result<serde_json::Value> {
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            anyhow::bail!(
                "request failed ({}): {}",
                status,
                body["message"].as_str().unwrap_or("unknown error")
            );
        }
        Ok(body)
    }
}

fn print_json(value: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

/// Map a failure to the documented exit codes.
fn exit_code_for(error: &anyhow::Error) -> i32 {
    let text = error.to_string();
    if text.contains("configuration") || text.contains("validation") {
        EXIT_CONFIG_ERROR
    } else if text.contains("bootstrap") || text.contains("provider") {
        EXIT_PROVIDER_BOOTSTRAP
    } else if text.contains("audit") || text.contains("sink") {
        EXIT_SINK_ERROR
    } else {
        1
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let client = AdminClient::new(cli.url.clone(), cli.token.clone());

    let result = run(&client, cli.command).await;
    if let Err(e) = result {
        error!("{}", e);
        eprintln!("error: {}", e);
        std::process::exit(exit_code_for(&e));
    }
}

async fn run(client: &AdminClient, command: Commands) -> Result<()> {
    match command {
        Commands::Health => {
            let value = client.get("/providers").await?;
            print_json(&value);
        }
        Commands::GetThresholds => {
            let value = client.get("/admin/router/thresholds").await?;
            print_json(&value);
        }
        Commands::SetThresholds { conf, support, max_cot } => {
            let mut body = serde_json::Map::new();
            if let Some(conf) = conf {
                body.insert("conf_threshold".to_string(), serde_json::json!(conf));
            }
            if let Some(support) = support {
                body.insert("support_threshold".to_string(), serde_json::json!(support));
            }
            if let Some(max_cot) = max_cot {
                body.insert("max_cot_tokens".to_string(), serde_json::json!(max_cot));
            }
            if body.is_empty() {
                anyhow::bail!("configuration error: no threshold values given");
            }
            let value = client
                .post(
                    "/admin/router/set-thresholds",
                    Some(serde_json::Value::Object(body)),
                )
                .await?;
            print_json(&value);
        }
        Commands::Budget => {
            let value = client.get("/admin/budget").await?;
            print_json(&value);
        }
        Commands::ResetBudget { confirm } => {
            if !confirm {
                anyhow::bail!("configuration error: pass --confirm to reset the daily budget");
            }
            let value = client.post("/admin/budget/reset", None).await?;
            print_json(&value);
        }
        Commands::Reload => {
            let value = client.post("/admin/router/reload-secrets", None).await?;
            print_json(&value);
        }
        Commands::ForceOverride { provider } => {
            let value = client
                .post(
                    "/admin/router/force-override",
                    Some(serde_json::json!({ "provider": provider })),
                )
                .await?;
            print_json(&value);
        }
        Commands::Metrics => {
            let value = client.get("/admin/metrics").await?;
            print_json(&value);
        }
    }
    Ok(())
}
