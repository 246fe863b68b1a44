//! provisio: runs spot datafeed subscription acceptance scenarios against a
//! simulated eventually-consistent cloud.
//!
//! - Creates the subscription and waits for it to become visible
//! - Checks existence, import round trip or out-of-band disappearance
//! - Deletes and waits until reads report the subscription gone
//! - Prints a JSON report

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use provisio::clients::{SimulatedCloud, SimulatedCloudConfig};
use provisio::scenario::{self, Scenario, ScenarioContext};
use provisio::{DriftEvent, RetryPolicy};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScenarioArg {
    Basic,
    Import,
    Disappears,
}

impl From<ScenarioArg> for Scenario {
    fn from(s: ScenarioArg) -> Self {
        match s {
            ScenarioArg::Basic => Scenario::Basic,
            ScenarioArg::Import => Scenario::Import,
            ScenarioArg::Disappears => Scenario::Disappears,
        }
    }
}

/// provisio scenario runner
#[derive(Parser, Debug)]
#[command(name = "provisio", version, about)]
struct Args {
    /// Scenario to run
    #[arg(long, value_enum, default_value = "basic")]
    scenario: ScenarioArg,

    /// Delivery bucket (random if not provided)
    #[arg(long)]
    bucket: Option<String>,

    /// Key prefix for delivered files
    #[arg(long)]
    prefix: Option<String>,

    /// Maximum time to wait for each verification, in seconds
    #[arg(long, default_value = "2400")]
    max_wait_secs: u64,

    /// Initial poll interval in milliseconds
    #[arg(long, default_value = "1000")]
    poll_interval_ms: u64,

    /// Poll interval cap in milliseconds
    #[arg(long, default_value = "30000")]
    max_poll_interval_ms: u64,

    /// Delay before a created resource is visible, in milliseconds
    #[arg(long, default_value = "2000")]
    create_delay_ms: u64,

    /// Delay before a deleted resource disappears, in milliseconds
    #[arg(long, default_value = "5000")]
    delete_delay_ms: u64,

    /// Backend requests per second shared by all sessions
    #[arg(long)]
    rate_limit: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "provisio=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let policy = RetryPolicy::with_backoff(
        Duration::from_secs(args.max_wait_secs),
        Duration::from_millis(args.poll_interval_ms),
        Duration::from_millis(args.max_poll_interval_ms),
    );
    policy
        .validate()
        .map_err(anyhow::Error::msg)
        .context("Invalid poll settings")?;

    let cloud = SimulatedCloud::new(SimulatedCloudConfig {
        create_visibility_delay: Duration::from_millis(args.create_delay_ms),
        delete_visibility_delay: Duration::from_millis(args.delete_delay_ms),
        requests_per_second: args.rate_limit,
    });

    let bucket = args.bucket.unwrap_or_else(|| {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("tf-spot-datafeed-{}", &suffix[..8])
    });

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            ctrl_c_cancel.cancel();
        }
    });

    let (drift_tx, drift_rx) = mpsc::unbounded_channel::<DriftEvent>();
    let drift_handle = tokio::spawn(async move {
        let mut events = UnboundedReceiverStream::new(drift_rx);
        let mut count = 0usize;
        while let Some(event) = events.next().await {
            count += 1;
            warn!(
                identity = %event.identity,
                resource_type = %event.resource_type,
                "Drift detected"
            );
        }
        count
    });

    let ctx = ScenarioContext {
        cloud,
        policy,
        cancel,
        drift_tx: Some(drift_tx),
    };

    info!("Running {:?} scenario with bucket {}", args.scenario, bucket);
    let result = scenario::run(
        args.scenario.into(),
        &ctx,
        &bucket,
        args.prefix.as_deref(),
    )
    .await;

    // Close the drift channel so the consumer finishes.
    drop(ctx);
    let drift_events = drift_handle.await.context("Drift consumer failed")?;

    let report = result.context("Scenario failed")?;
    let json = serde_json::json!({
        "report": report,
        "driftEvents": drift_events,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&json).context("Failed to serialize report")?
    );

    Ok(())
}
