//! # Telemetry Pipeline
//!
//! Runs a pipeline from a YAML configuration, serves pull exporters at
//! `/metrics` and optionally drives it with synthetic request spans.
//!
//! ## Running
//!
//! ```bash
//! # Built-in demo pipeline with generated traffic
//! cargo run -p telemetry_pipeline --bin telemetry-pipeline -- --demo
//!
//! # Your own pipeline
//! cargo run -p telemetry_pipeline --bin telemetry-pipeline -- \
//!     --config crates/telemetry_pipeline/config/pipeline.yaml --log-format json
//!
//! curl http://127.0.0.1:9464/metrics
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use rand::Rng;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use telemetry_pipeline::{
    init_logging, server, LogFormat, LogLevel, Pipeline, PipelineConfig, ReceiverHandle, SpanTimer,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

const DEMO_CONFIG: &str = include_str!("../config/demo.yaml");

/// Simulated operations and their typical latency in milliseconds.
const OPERATIONS: &[(&str, u64)] = &[
    ("GET /users", 40),
    ("GET /search", 180),
    ("POST /checkout", 600),
    ("POST /login", 90),
];

#[derive(Debug, Parser)]
#[command(name = "telemetry-pipeline", version, about)]
struct Cli {
    /// Pipeline configuration (YAML). Defaults to the built-in demo pipeline.
    #[arg(short, long, env = "TELEMETRY_PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Address for the /metrics endpoint
    #[arg(long, default_value = "127.0.0.1:9464")]
    listen: SocketAddr,

    /// Overrides `log.level` from the configuration
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Overrides `log.format` from the configuration
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Generate synthetic request spans into the first receiver
    #[arg(long)]
    demo: bool,

    /// Generated requests per second
    #[arg(long, default_value_t = 50.0)]
    rate: f64,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    duration: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::from_yaml_str(DEMO_CONFIG).context("built-in demo configuration")?,
    };
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    if let Some(format) = cli.log_format {
        config.log.format = format;
    }
    init_logging(&config.log).context("failed to initialise logging")?;

    let pipeline = Pipeline::build(&config).context("invalid pipeline configuration")?;
    let (stop_tx, stop_rx) = watch::channel(false);

    let pull = pipeline.pull_exporters();
    let server = if pull.is_empty() {
        None
    } else {
        let listener = TcpListener::bind(cli.listen)
            .await
            .with_context(|| format!("failed to bind {}", cli.listen))?;
        let mut stop = stop_rx.clone();
        let shutdown = async move {
            let _ = stop.wait_for(|&stopped| stopped).await;
        };
        Some(tokio::spawn(server::serve(
            listener,
            server::metrics_router(pull),
            shutdown,
        )))
    };

    let generator = if cli.demo || cli.config.is_none() {
        let Some(receiver) = pipeline.receivers().into_iter().next() else {
            bail!("--demo needs a pipeline with a receiver stage");
        };
        if !(cli.rate > 0.0 && cli.rate.is_finite()) {
            bail!("--rate must be a positive number, got {}", cli.rate);
        }
        tracing::info!(receiver = receiver.name(), rate = cli.rate, "Generating demo traffic");
        Some(tokio::spawn(generate(receiver, cli.rate, stop_rx.clone())))
    } else {
        None
    };

    match cli.duration {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?,
    }
    tracing::info!("Stop requested");
    let _ = stop_tx.send(true);

    if let Some(generator) = generator {
        let requests = generator.await.context("demo generator panicked")?;
        tracing::info!(requests, "Demo traffic stopped");
    }

    let report = pipeline.shutdown().await;

    if let Some(server) = server {
        server
            .await
            .context("metrics server panicked")?
            .context("metrics server failed")?;
    }

    if report.records_dropped > 0 || report.records_abandoned > 0 {
        tracing::warn!(
            records_dropped = report.records_dropped,
            records_abandoned = report.records_abandoned,
            "Some telemetry was not delivered"
        );
    }
    Ok(())
}

/// Starts simulated requests at `rate` per second until `stop` flips.
async fn generate(receiver: Arc<ReceiverHandle>, rate: f64, mut stop: watch::Receiver<bool>) -> u64 {
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / rate));
    let mut requests = JoinSet::new();
    let mut started = 0u64;

    loop {
        tokio::select! {
            _ = stop.wait_for(|&stopped| stopped) => break,
            _ = ticker.tick() => {
                requests.spawn(simulate_request(Arc::clone(&receiver)));
                started += 1;
            }
            Some(_) = requests.join_next(), if !requests.is_empty() => {}
        }
    }

    // In-flight requests still finish their spans.
    while requests.join_next().await.is_some() {}
    started
}

/// One request span with a nested database span; about 5% fail.
async fn simulate_request(receiver: Arc<ReceiverHandle>) {
    let (operation, latency, failed) = {
        let mut rng = rand::thread_rng();
        let (operation, typical) = OPERATIONS[rng.gen_range(0..OPERATIONS.len())];
        let latency = Duration::from_millis(rng.gen_range(typical / 2..=typical * 2));
        (operation, latency, rng.gen_range(0..100) < 5)
    };

    let mut span = SpanTimer::root(receiver, operation);
    span.set_attribute("service.name", "demo");
    span.set_attribute("http.method", operation.split(' ').next().unwrap_or("GET"));

    let mut query = span.child("db.query");
    query.set_attribute("db.system", "postgresql");
    tokio::time::sleep(latency / 3).await;
    drop(query);

    tokio::time::sleep(latency - latency / 3).await;
    if failed {
        span.set_attribute("http.status_code", 500i64);
        span.fail();
    } else {
        span.set_attribute("http.status_code", 200i64);
    }
}
