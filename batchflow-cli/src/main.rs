use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use batchflow_core::{BatchConfig, Pipeline, WorkerPool};

const DEFAULT_INPUTS: [&str; 4] = ["1", "11", "111", "1111"];

#[derive(Parser)]
#[command(name = "batchflow")]
#[command(version = "0.1.0")]
#[command(
    about = "batchflow - coalesce single submissions into batched pipelines",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the binary-length demo pipeline
    Demo {
        /// Maximum number of items per batch
        #[arg(short, long, default_value_t = 2)]
        batch_size: usize,

        /// Flush interval in seconds
        #[arg(short, long, default_value_t = 300)]
        timeout_secs: u64,

        /// Inputs to submit (defaults to 1 11 111 1111)
        inputs: Vec<String>,
    },

    /// Print the effective batch configuration (defaults plus BATCHFLOW_* environment)
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("batchflow=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo { batch_size, timeout_secs, inputs } => {
            let inputs = if inputs.is_empty() {
                DEFAULT_INPUTS.iter().map(|s| s.to_string()).collect()
            } else {
                inputs
            };
            run_demo(batch_size, Duration::from_secs(timeout_secs), inputs).await?;
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&BatchConfig::from_env())?);
        }
    }

    Ok(())
}

async fn run_demo(
    batch_size: usize,
    timeout: Duration,
    inputs: Vec<String>,
) -> anyhow::Result<()> {
    if timeout.is_zero() {
        anyhow::bail!("--timeout-secs must be greater than zero");
    }

    let config = BatchConfig {
        max_batch_size: batch_size,
        batch_timeout: timeout,
        ..BatchConfig::from_env()
    };

    info!(
        batch_size = config.max_batch_size,
        timeout_secs = timeout.as_secs(),
        inputs = inputs.len(),
        "Starting demo pipeline"
    );

    let pipeline = Pipeline::builder(WorkerPool::current()?)
        .batched_with(config)
        .map(|s: String| s.len())
        .map(|n: usize| format!("{n:b}"))
        .sequential()?
        .build();

    // Submit everything before waiting so submissions share batches
    let handles: Vec<_> = inputs.iter().map(|input| pipeline.submit(input.clone())).collect();

    // Once every input is buffered, closing flushes a trailing partial batch
    // instead of leaving it for the timer
    loop {
        let metrics = &pipeline.metrics()[0];
        if metrics.items_submitted + metrics.items_rejected >= inputs.len() as u64 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    pipeline.close();

    println!("=== Results ===");
    for (input, handle) in inputs.iter().zip(handles) {
        match handle.await {
            Ok(output) => println!("{} -> {}", input, output),
            Err(e) => println!("{} -> error: {}", input, e),
        }
    }
    println!();

    pipeline.shutdown().await;

    println!("=== Metrics ===");
    println!("{}", serde_json::to_string_pretty(&pipeline.metrics())?);

    Ok(())
}
