//! tollgate CLI - quota admission and provider fallback from the command line.
//!
//! # Examples
//!
//! ```bash
//! # Check a configuration file
//! tollgate validate gateway.yaml
//!
//! # Current usage for every tier
//! tollgate -c gateway.yaml usage
//!
//! # Would a 2k-token request be admitted on the free tier?
//! tollgate -c gateway.yaml admit --tier free --tokens 2000 --cost 0.01
//!
//! # Run one generation through the fallback chain
//! tollgate -c gateway.yaml generate --tier pro "Summarize RFC 9110 in one line"
//!
//! # Move past months of the ledger into archive/
//! tollgate -c gateway.yaml archive
//! ```

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tollgate_core::{
    AdmissionGate, CircuitBreaker, Clock, GatewayConfig, LedgerStore, QuotaLedger, QuotaScope,
    SystemClock, UsageSnapshot,
};
use tollgate_runtime::{Gateway, GatewayError, GenerationOptions, GenerationRequest};

/// Quota admission and provider fallback for LLM gateways.
#[derive(Parser)]
#[command(name = "tollgate")]
#[command(version)]
#[command(about = "Quota admission and provider fallback for LLM gateways")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Gateway configuration file (YAML or JSON).
    #[arg(long, short, default_value = "tollgate.yaml", global = true)]
    config: PathBuf,

    /// Output format.
    #[arg(long, short = 'f', default_value = "text", global = true)]
    format: OutputFormat,

    /// Verbose output (debug logging).
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file.
    Validate {
        /// File to validate; defaults to --config.
        path: Option<PathBuf>,
    },

    /// Show current usage per tier.
    Usage {
        /// Only this tier.
        #[arg(long, short)]
        tier: Option<String>,
    },

    /// Dry-run an admission decision.
    Admit {
        #[arg(long, short)]
        tier: String,

        /// Estimated total tokens.
        #[arg(long)]
        tokens: u64,

        /// Estimated cost in USD.
        #[arg(long, default_value_t = 0.0)]
        cost: f64,
    },

    /// Run a generation through admission, fallback routing and recording.
    Generate {
        #[arg(long, short)]
        tier: String,

        prompt: String,

        #[arg(long, default_value_t = 1024)]
        max_tokens: u32,

        #[arg(long, default_value_t = 0.7)]
        temperature: f32,

        /// Per-attempt timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Try this provider first.
        #[arg(long, short)]
        provider: Option<String>,
    },

    /// Archive ledger files from previous months.
    Archive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match &cli.command {
        Commands::Validate { path } => validate(path.as_deref().unwrap_or(&cli.config), &cli),
        Commands::Usage { tier } => usage(tier.as_deref(), &cli),
        Commands::Admit { tier, tokens, cost } => admit(tier, *tokens, *cost, &cli),
        Commands::Generate {
            tier,
            prompt,
            max_tokens,
            temperature,
            timeout_ms,
            provider,
        } => {
            let options = GenerationOptions {
                max_tokens: *max_tokens,
                temperature: *temperature,
                timeout_ms: *timeout_ms,
                preferred_provider: provider.clone(),
            };
            generate(tier, prompt, options, &cli).await
        }
        Commands::Archive => archive(&cli),
    }
}

fn load_config(path: &Path) -> Result<GatewayConfig> {
    GatewayConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn validate(path: &Path, cli: &Cli) -> Result<()> {
    let config = load_config(path)?;
    let tiers = config.resolved_tiers()?;

    if cli.format == OutputFormat::Json {
        return print_json(&serde_json::json!({
            "valid": true,
            "tiers": tiers,
            "providers": config.providers.iter().map(|p| &p.name).collect::<Vec<_>>(),
        }));
    }

    println!("{} is valid", path.display());
    for (name, tier) in &tiers {
        println!(
            "  tier {:<12} {:>6} req/h {:>8} req/day {:>10} tok/day  ${:.2}/day",
            name, tier.hourly_requests, tier.daily_requests, tier.daily_tokens, tier.daily_cost_limit
        );
    }
    for provider in &config.providers {
        println!(
            "  provider {:<10} type={} priority={}{}",
            provider.name,
            provider.provider_type,
            provider.priority,
            if provider.enabled { "" } else { " (disabled)" }
        );
    }
    Ok(())
}

/// Admission gate over the persisted ledger, without building providers.
fn offline_gate(config: &GatewayConfig) -> Result<AdmissionGate> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let records = match &config.ledger.directory {
        Some(dir) => {
            let store = LedgerStore::open(dir)
                .with_context(|| format!("Failed to open ledger at {}", dir.display()))?;
            store.load_current(clock.now())?.records
        }
        None => Vec::new(),
    };

    let mut gate = AdmissionGate::new();
    for (name, tier) in config.resolved_tiers()? {
        let history = records.iter().filter(|r| r.tier() == Some(name.as_str()));
        let ledger = QuotaLedger::from_records(name.clone(), tier, clock.clone(), history);
        let breaker = CircuitBreaker::new(name, config.circuit_breaker.clone(), clock.clone());
        gate.insert(Arc::new(QuotaScope::new(Arc::new(ledger), Arc::new(breaker))));
    }
    Ok(gate)
}

fn usage(only: Option<&str>, cli: &Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    let gate = offline_gate(&config)?;

    let snapshots: Vec<(String, UsageSnapshot)> = gate
        .scopes()
        .filter(|scope| only.map_or(true, |t| scope.name() == t))
        .map(|scope| (scope.name().to_string(), scope.ledger.current_usage()))
        .collect();
    if let (Some(tier), true) = (only, snapshots.is_empty()) {
        bail!("Unknown tier: '{}'", tier);
    }

    if cli.format == OutputFormat::Json {
        let map: serde_json::Map<String, serde_json::Value> = snapshots
            .into_iter()
            .map(|(name, snap)| -> Result<(String, serde_json::Value)> {
                Ok((name, serde_json::to_value(snap)?))
            })
            .collect::<Result<_>>()?;
        return print_json(&map);
    }

    for (name, snap) in snapshots {
        let (period, worst) = snap.worst();
        println!("{} (worst: {:.1}% {})", name, worst, period);
        for window in [&snap.hourly, &snap.daily] {
            println!(
                "  {:<7} {:>6} requests {:>9} tokens  ${:.4}  resets {}",
                window.period.label(),
                window.request_count,
                window.token_count,
                window.cost_accumulated,
                window.window_end.format("%Y-%m-%d %H:%M UTC")
            );
        }
    }
    Ok(())
}

fn admit(tier: &str, tokens: u64, cost: f64, cli: &Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    let gate = offline_gate(&config)?;
    let decision = gate.admit(tokens, cost, tier)?;

    if cli.format == OutputFormat::Json {
        return print_json(&serde_json::json!({
            "allowed": decision.allowed,
            "http_status": decision.http_status,
            "headers": decision.headers().into_iter().collect::<std::collections::BTreeMap<_, _>>(),
            "body": decision.rejection_body(),
        }));
    }

    println!("HTTP {}", decision.http_status);
    for (name, value) in decision.headers() {
        println!("{}: {}", name, value);
    }
    if let Some(body) = decision.rejection_body() {
        println!();
        println!("{}", serde_json::to_string_pretty(&body)?);
    }
    Ok(())
}

async fn generate(
    tier: &str,
    prompt: &str,
    options: GenerationOptions,
    cli: &Cli,
) -> Result<()> {
    let config = load_config(&cli.config)?;
    let gateway = Gateway::builder()
        .config(config)
        .build()
        .context("Failed to start gateway")?;

    let request = GenerationRequest::new(prompt).with_options(options);
    let result = gateway.generate(tier, request).await;
    gateway.shutdown().await;

    match result {
        Ok(reply) => {
            if cli.format == OutputFormat::Json {
                return print_json(&reply);
            }
            println!("{}", reply.text);
            eprintln!(
                "-- {} ({}), {} tokens, ${:.5}, {} fallback attempt(s)",
                reply.provider_used,
                reply.model,
                reply.usage.total(),
                reply.cost,
                reply.fallback_attempts.len()
            );
            Ok(())
        }
        Err(GatewayError::Rejected(decision)) => {
            if let Some(body) = decision.rejection_body() {
                println!("{}", serde_json::to_string_pretty(&body)?);
            }
            bail!(
                "Request rejected (HTTP {}), retry after {}s",
                decision.http_status,
                decision.retry_after_seconds
            )
        }
        Err(e) => Err(e).context("Generation failed"),
    }
}

fn archive(cli: &Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    let Some(dir) = &config.ledger.directory else {
        bail!("No ledger.directory configured in {}", cli.config.display());
    };
    let store = LedgerStore::open(dir)
        .with_context(|| format!("Failed to open ledger at {}", dir.display()))?;

    let moved = store.archive_before(Utc::now())?;
    if cli.format == OutputFormat::Json {
        return print_json(&moved);
    }
    if moved.is_empty() {
        println!("Nothing to archive");
    }
    for path in moved {
        println!("archived {}", path.display());
    }
    Ok(())
}
