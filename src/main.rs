use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use eyre::WrapErr;
use ssi_bench::{
    BenchConfig, BenchmarkRunner,
    config::OperationMix,
    ledger::HttpLedger,
    workload::OperationKind,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ssi-bench", about = "Benchmark the SSI contracts on a permissioned ledger")]
struct Args {
    /// JSON benchmark configuration.
    #[arg(long, short)]
    config: PathBuf,

    /// Override the number of concurrent workers.
    #[arg(long)]
    workers: Option<usize>,

    /// Override the operations each worker runs.
    #[arg(long)]
    iterations: Option<usize>,

    /// Run the full bootstrap on every worker.
    #[arg(long)]
    force_bootstrap: bool,

    /// Run only this operation instead of the configured mix.
    #[arg(long, value_enum)]
    operation: Option<OperationKind>,

    /// Override the node URL.
    #[arg(long)]
    rpc_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), eyre::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = BenchConfig::from_file(&args.config)
        .wrap_err_with(|| format!("loading {}", args.config.display()))?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(iterations) = args.iterations {
        config.iterations = iterations;
    }
    if let Some(kind) = args.operation {
        config.operation_mix = OperationMix::single(kind);
    }
    if let Some(url) = args.rpc_url {
        config.rpc_url = url;
    }
    config.force_bootstrap |= args.force_bootstrap;
    config.validate()?;

    info!(target: "ssi_bench", rpc = %config.rpc_url, chain_id = config.chain_id, "connecting");
    let ledger = Arc::new(HttpLedger::new(config.rpc_url.clone()));
    let report = BenchmarkRunner::new(config, ledger).run().await?;
    report.print_summary();

    if report.aborted_workers() == report.workers.len() {
        eyre::bail!("every worker aborted during bootstrap");
    }
    Ok(())
}
