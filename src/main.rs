//! apiguard-sim - drives a synthetic flaky backend through a `Guard`.
//!
//! Each simulated call sleeps for the configured latency and then fails with
//! a network error, a 503 or a 429 according to the configured ratios. At
//! the end the limiter stats and retry metrics are printed as JSON.

use apiguard_core::guard::{RandomSource, RetryPreset, SeededRandom, ThreadRandom};
use apiguard_core::types::{Failure, NetworkErrorKind, RequestId};
use apiguard_core::{Config, Error, Guard, RetryableRequest};
use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "apiguard-sim")]
#[command(about = "Run simulated calls through the rate limiter and retry policy", long_about = None)]
struct Cli {
    /// JSON config file.
    #[arg(short, long, env = "APIGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Retry preset (development, testing, production). Overrides the config.
    #[arg(short, long)]
    preset: Option<String>,

    /// Number of concurrent calls.
    #[arg(short = 'n', long, default_value_t = 50)]
    requests: usize,

    /// Probability that an attempt fails with a transient error.
    #[arg(long, default_value_t = 0.3)]
    failure_rate: f64,

    /// Probability that an attempt is rejected with 429.
    #[arg(long, default_value_t = 0.05)]
    rate_limit_rate: f64,

    /// Simulated backend latency in milliseconds.
    #[arg(long, default_value_t = 20)]
    latency_ms: u64,

    /// Seed for reproducible runs.
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug)]
struct FlakyBackend {
    rng: Arc<dyn RandomSource>,
    failure_rate: f64,
    rate_limit_rate: f64,
    latency: Duration,
}

impl FlakyBackend {
    async fn call(&self) -> Result<(), Failure> {
        tokio::time::sleep(self.latency).await;
        let roll = self.rng.next_f64();
        if roll < self.rate_limit_rate {
            return Err(Failure::rate_limited(Some(Duration::from_millis(250))));
        }
        if roll < self.rate_limit_rate + self.failure_rate {
            return Err(if self.rng.next_f64() < 0.5 {
                Failure::network(NetworkErrorKind::Connection, "connection reset by peer")
            } else {
                Failure::api(503, "service unavailable")
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
struct SimulatedCall {
    id: RequestId,
    description: String,
    backend: Arc<FlakyBackend>,
}

#[async_trait]
impl RetryableRequest for SimulatedCall {
    type Output = ();

    fn id(&self) -> &RequestId {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self) -> Result<(), Failure> {
        self.backend.call().await
    }
}

#[derive(Debug, Default, serde::Serialize)]
struct Outcomes {
    succeeded: usize,
    exhausted: usize,
    circuit_open: usize,
    queue_full: usize,
    other: usize,
}

impl Outcomes {
    fn record(&mut self, result: &apiguard_core::Result<()>) {
        match result {
            Ok(()) => self.succeeded += 1,
            Err(Error::RetriesExhausted { .. }) => self.exhausted += 1,
            Err(Error::CircuitOpen { .. }) => self.circuit_open += 1,
            Err(Error::QueueFull { .. }) => self.queue_full += 1,
            Err(_) => self.other += 1,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(name) = &cli.preset {
        config.retry = RetryPreset::from_name(name)?;
    }
    apiguard_core::observability::init_tracing_with(&config.observability);

    let rng: Arc<dyn RandomSource> = match cli.seed {
        Some(seed) => Arc::new(SeededRandom::new(seed)),
        None => Arc::new(ThreadRandom),
    };
    let backend = Arc::new(FlakyBackend {
        rng,
        failure_rate: cli.failure_rate.clamp(0.0, 1.0),
        rate_limit_rate: cli.rate_limit_rate.clamp(0.0, 1.0),
        latency: Duration::from_millis(cli.latency_ms),
    });
    let guard = Guard::from_config(&config)?;

    tracing::info!(
        requests = cli.requests,
        max_requests = config.rate_limit.max_requests,
        window_ms = config.rate_limit.window.as_millis() as u64,
        "simulation starting"
    );

    let calls = (0..cli.requests).map(|n| {
        let guard = guard.clone();
        let call = SimulatedCall {
            id: RequestId::new(),
            description: format!("simulated call #{n}"),
            backend: Arc::clone(&backend),
        };
        tokio::spawn(async move { guard.execute(&call).await })
    });

    let mut outcomes = Outcomes::default();
    for joined in futures::future::join_all(calls).await {
        outcomes.record(&joined?);
    }

    let report = serde_json::json!({
        "outcomes": outcomes,
        "rate_limiter": guard.stats(),
        "retry": guard.metrics(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
