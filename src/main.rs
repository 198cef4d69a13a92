use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hivelimit::config::{HivelimitConfig, LoggingConfig};
use hivelimit::store::LocalStore;
use hivelimit::{LimiterConfig, RateLimiter};

/// Send bursts of requests through a rate limiter backed by a local store.
#[derive(Debug, Parser)]
#[command(name = "hivelimit", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Window length in milliseconds (overrides the configuration)
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Accepted requests per window (overrides the configuration)
    #[arg(long)]
    slots: Option<u64>,

    /// Key to rate limit
    #[arg(long, default_value = "1.1.1.1")]
    key: String,

    /// Requests per burst. The first burst runs on a limiter of its own; the
    /// rest share one, with a sleep of one interval before the last burst
    #[arg(long, value_delimiter = ',', default_value = "5,10,10")]
    bursts: Vec<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = HivelimitConfig::load(args.config.as_deref())?;
    if let Some(interval_ms) = args.interval_ms {
        config.rate_limiting.interval_ms = interval_ms;
    }
    if let Some(slots) = args.slots {
        config.rate_limiting.slots = slots;
    }

    init_tracing(&config.logging);

    info!("Starting Hivelimit");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let Some((&first, rest)) = args.bursts.split_first() else {
        anyhow::bail!("at least one burst is required");
    };

    let warmup = new_limiter(&config)?;
    send(&warmup, &args.key, first).await;

    let limiter = new_limiter(&config)?;
    for (i, amount) in rest.iter().copied().enumerate() {
        if i + 1 == rest.len() && i > 0 {
            sleep(limiter.interval()).await;
        }
        send(&limiter, &args.key, amount).await;
    }

    let stats = limiter.metrics_exporter().snapshot();
    info!(stats = %serde_json::to_string(&stats)?, "Cache group statistics");

    Ok(())
}

/// Build a rate limiter on a fresh local store.
fn new_limiter(config: &HivelimitConfig) -> anyhow::Result<RateLimiter> {
    let store = Arc::new(LocalStore::new());
    info!(node_id = %store.node_id(), "Local store initialized");

    let limiter = RateLimiter::new(LimiterConfig::from_settings(&config.rate_limiting, store))?;
    info!(
        namespace = %limiter.namespace(),
        interval = ?limiter.interval(),
        slots = limiter.slots(),
        "Rate limiter initialized"
    );
    Ok(limiter)
}

/// Install the global tracing subscriber.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn sleep(d: Duration) {
    info!("sleeping {:?}", d);
    tokio::time::sleep(d).await;
}

/// Consume `amount` times and log the outcome.
async fn send(limiter: &RateLimiter, key: &str, amount: usize) {
    let mut accepts = 0;
    let mut errors = 0;

    for i in 1..=amount {
        match limiter.consume(key).await {
            Ok(true) => accepts += 1,
            Ok(false) => {}
            Err(e) => {
                errors += 1;
                warn!(error = %e, "send {}/{}: errors={}", i, amount, errors);
            }
        }
    }

    info!(
        amount = amount,
        accepts = accepts,
        rejects = amount - accepts - errors,
        errors = errors,
        "send"
    );
}
