use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratemux::config::{load_ratelimits, load_settings};
use ratemux::expr::{Identity, Request};
use ratemux::ratelimit::{
    setup_rate_limits, Decision, EventLimiter, Fallback, HttpLimiter, LocalEventLimiter,
};
use ratemux::store::{MemoryStore, RedisStore, WindowStore};

#[derive(Parser)]
#[command(name = "ratemux")]
#[command(about = "Grouped HTTP admission control")]
#[command(version)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, default_value = "ratemux.yaml", global = true)]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the configuration and build the multiplexer
    Validate {
        /// Print the effective rate limit configuration
        #[arg(long)]
        dump: bool,
    },
    /// Run rate limit decisions for a synthetic request
    Check {
        /// Request path
        #[arg(long)]
        path: String,

        /// Request method
        #[arg(long, default_value = "GET")]
        method: String,

        /// Subject of the caller identity
        #[arg(long)]
        subject: Option<String>,

        /// Tenant of the caller identity
        #[arg(long, requires = "subject")]
        tenant: Option<String>,

        /// Treat the subject as a device instead of a user
        #[arg(long, requires = "subject")]
        device: bool,

        /// Request header as NAME=VALUE, may be repeated
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Number of decisions to run
        #[arg(long, default_value_t = 1)]
        repeat: u32,

        /// Redis URL of the shared window store; in-memory when omitted
        #[arg(long)]
        redis: Option<String>,

        /// Service key prefix in the store
        #[arg(long, default_value = "ratemux")]
        prefix: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting ratemux");

    let settings = load_settings(Some(cli.config.as_path()))
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Validate { dump } => {
            let Some(lims) = load_ratelimits(&settings)? else {
                info!("Rate limiting is disabled");
                return Ok(());
            };
            let mux = HttpLimiter::from_config(&lims, |_, params| {
                Arc::new(LocalEventLimiter::new(params.quota, params.interval))
                    as Arc<dyn EventLimiter>
            })
            .context("invalid rate limit configuration")?;
            info!(
                groups = mux.group_names().count(),
                rules = mux.rule_count(),
                "Configuration is valid"
            );
            if dump {
                print!("{}", serde_yaml::to_string(&lims)?);
            }
        }
        Commands::Check {
            path,
            method,
            subject,
            tenant,
            device,
            headers,
            repeat,
            redis,
            prefix,
        } => {
            let store: Arc<dyn WindowStore> = match redis {
                Some(url) => Arc::new(RedisStore::connect(&url).await?),
                None => Arc::new(MemoryStore::new()),
            };
            let mux = match setup_rate_limits(store, &prefix, &settings) {
                Ok(mux) => mux,
                Err(err) if err.is_disabled() => {
                    warn!(%err, "Rate limiting is disabled, every request is admitted");
                    return Ok(());
                }
                Err(err) => return Err(err).context("invalid rate limit configuration"),
            };

            let mut request = Request::new(&method, &path);
            for (name, value) in &headers {
                request = request.with_header(name, value.as_str());
            }
            if let Some(subject) = subject {
                let mut identity = if device {
                    Identity::device(subject)
                } else {
                    Identity::user(subject)
                };
                if let Some(tenant) = tenant {
                    identity = identity.with_tenant(tenant);
                }
                request = request.with_identity(identity);
            }

            for _ in 0..repeat {
                let decision = mux.decide(&request).await?;
                println!("{}", decision_line(&decision));
            }

            let stats = mux.stats();
            if stats.unknown_group > 0 || stats.evaluation_failed > 0 {
                warn!(
                    unknown_group = stats.unknown_group,
                    evaluation_failed = stats.evaluation_failed,
                    "Some requests fell back to the default group"
                );
            }
        }
    }

    Ok(())
}

fn decision_line(decision: &Decision) -> serde_json::Value {
    let fallback = decision.fallback.as_ref().map(|fallback| match fallback {
        Fallback::UnknownGroup(name) => json!({ "unknown_group": name }),
        Fallback::EvaluationFailed(reason) => json!({ "evaluation_failed": reason }),
    });
    json!({
        "group": decision.group,
        "event_id": decision.event_id,
        "ok": decision.is_ok(),
        "tokens": decision.reservation.tokens(),
        "delay_ms": decision.reservation.delay().as_millis() as u64,
        "retry_after": decision.reservation.retry_after_secs(),
        "fallback": fallback,
    })
}

fn parse_header(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got \"{}\"", raw)),
    }
}
