//! EAnp tester: runs a command script from a client broker against an
//! in-process server broker over the loopback transport.
//!
//! # Usage
//!
//! Built-in sample script:
//! ```bash
//! cargo run --bin eanp-tester
//! ```
//!
//! Custom script, with one send in ten severing the link:
//! ```bash
//! cargo run --bin eanp-tester -- --script commands.json --seed 42 --fault-probability 0.1
//! ```
//!
//! Exits with status 1 when the run stops before the queue drains. Failure
//! results from the server count in the summary but leave the status at 0.

use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use clap::Parser;
use eanp::{
    BrokerConfig, BrokerRole, CommandStatus, Coordinator, DriverOutcome, LoopbackConfig,
    LoopbackNetwork, Script, Tester,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "eanp-tester")]
#[command(about = "Drive an EAnp peer with a script of commands", long_about = None)]
struct Args {
    /// JSON command script (defaults to the built-in sample)
    #[arg(long)]
    script: Option<PathBuf>,

    /// Seed of the loopback fault injection
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Probability that a send severs the loopback link
    #[arg(long, default_value = "0.0")]
    fault_probability: f64,

    /// Maximum number of channels the server accepts
    #[arg(long)]
    max_channels: Option<usize>,

    /// Give up after this many seconds
    #[arg(long, default_value = "10")]
    timeout_secs: u64,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let script = match &args.script {
        Some(path) => Script::load(path)?,
        None => Script::sample(),
    };
    tracing::info!(
        commands = script.len(),
        seed = args.seed,
        fault_probability = args.fault_probability,
        "Starting EAnp tester"
    );

    let coordinator = Coordinator::new();
    let network = LoopbackNetwork::new(LoopbackConfig::new(args.seed, args.fault_probability));

    let mut server_config = BrokerConfig::server();
    if let Some(max_channels) = args.max_channels {
        server_config = server_config.with_max_channels(max_channels);
    }
    let server = Tester::setup(
        &coordinator,
        BrokerRole::Server,
        Rc::new(network.server_transport()),
        server_config,
        None,
    )?;
    let client = Tester::setup(
        &coordinator,
        BrokerRole::Client,
        Rc::new(network.client_transport()),
        BrokerConfig::client(),
        Some(&script),
    )?;

    let run = coordinator.run_until(|| client.is_finished() || !client.broker().is_running());
    if tokio::time::timeout(Duration::from_secs(args.timeout_secs), run)
        .await
        .is_err()
    {
        tracing::error!(timeout_secs = args.timeout_secs, "Tester timed out");
    }

    client.shutdown();
    server.shutdown();
    coordinator.run_pending();

    let reports = client.driver().reports();
    let failures = reports
        .iter()
        .filter(|r| !matches!(r.status, CommandStatus::Completed(_)))
        .count();
    tracing::info!(
        sent = client.driver().sent().len(),
        completed = reports.len() - failures,
        failed = failures,
        frames = network.frames_delivered(),
        faults = network.faults_injected(),
        "Run summary"
    );

    match client.outcome() {
        Some(DriverOutcome::Drained) => Ok(()),
        Some(outcome) => {
            tracing::error!(?outcome, "Run did not complete");
            std::process::exit(1);
        }
        None => {
            tracing::error!("Run never reached the peer");
            std::process::exit(1);
        }
    }
}
