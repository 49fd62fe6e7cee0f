//! Wires account discovery, signers, bootstrap and the workload drivers into one run.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use alloy_primitives::Address;
use eyre::{WrapErr, eyre};
use rand::{SeedableRng, rngs::StdRng};
use tracing::{error, info, warn};

use crate::{
    account::{AccountPool, WorkerAccounts},
    bootstrap::{BootstrapSequencer, BootstrapState, auxiliary_accounts},
    config::{BenchConfig, SignerConfig},
    context::WorkerContext,
    contracts::Role,
    discovery::{AccountDiscovery, default_strategies},
    dispatcher::{DispatchSettings, Dispatcher},
    ledger::LedgerRpc,
    metrics::{self, OperationMetrics, OperationSummary},
    nonce::NonceLedger,
    signer::{JsonRpcSigner, RestSigner, TransactionSigner, select_signer},
    tracker::TrackerStats,
    workload::{OperationOutcome, WorkloadDriver},
};

/// How one worker fared.
#[derive(Debug, Clone, Default)]
pub struct WorkerReport {
    pub worker_index: usize,
    pub accounts: Vec<Address>,
    pub shared_account: bool,
    pub bootstrap: Option<BootstrapState>,
    /// Set when bootstrap failed and the worker never ran its workload.
    pub aborted: Option<String>,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub resyncs: u64,
    pub tracker: TrackerStats,
    pub consistency_issues: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub wall: Duration,
    pub account_source: &'static str,
    pub signer: &'static str,
    pub operations: Vec<OperationSummary>,
    pub workers: Vec<WorkerReport>,
}

impl RunReport {
    pub fn completed(&self) -> usize {
        self.workers.iter().map(|worker| worker.completed).sum()
    }

    pub fn failed(&self) -> usize {
        self.workers.iter().map(|worker| worker.failed).sum()
    }

    pub fn skipped(&self) -> usize {
        self.workers.iter().map(|worker| worker.skipped).sum()
    }

    pub fn aborted_workers(&self) -> usize {
        self.workers.iter().filter(|worker| worker.aborted.is_some()).count()
    }

    pub fn print_summary(&self) {
        println!();
        println!(
            "accounts from {} ({} workers), signer {}",
            self.account_source,
            self.workers.len(),
            self.signer
        );
        for worker in &self.workers {
            let health = worker
                .bootstrap
                .as_ref()
                .map_or_else(|| "aborted".to_string(), |state| state.system_health.to_string());
            println!(
                "  worker {:>3}  {:>6} ok  {:>6} failed  {:>6} skipped  {:>4} resyncs  {:>3} accounts{}  bootstrap {}",
                worker.worker_index,
                worker.completed,
                worker.failed,
                worker.skipped,
                worker.resyncs,
                worker.accounts.len(),
                if worker.shared_account { " (shared)" } else { "" },
                health,
            );
            if let Some(reason) = &worker.aborted {
                println!("             {reason}");
            }
            for issue in &worker.consistency_issues {
                println!("             {issue}");
            }
        }
        metrics::print_summary(&self.operations, self.wall);
    }
}

/// Remote signer described by `config`, if it is not the local one.
pub fn remote_signer(config: &SignerConfig) -> Option<Arc<dyn TransactionSigner>> {
    match config {
        SignerConfig::Local => None,
        SignerConfig::JsonRpc { url } => Some(Arc::new(JsonRpcSigner::new(url.clone()))),
        SignerConfig::Rest { url } => Some(Arc::new(RestSigner::new(url.clone()))),
    }
}

pub struct BenchmarkRunner {
    config: Arc<BenchConfig>,
    ledger: Arc<dyn LedgerRpc>,
    signer: Option<Arc<dyn TransactionSigner>>,
    fallback: Option<Arc<dyn TransactionSigner>>,
    discovery: Option<Vec<Box<dyn AccountDiscovery>>>,
    metrics: Arc<OperationMetrics>,
}

impl BenchmarkRunner {
    pub fn new(config: BenchConfig, ledger: Arc<dyn LedgerRpc>) -> Self {
        Self {
            config: Arc::new(config),
            ledger,
            signer: None,
            fallback: None,
            discovery: None,
            metrics: OperationMetrics::new(),
        }
    }

    /// Use `signer` instead of the one the configuration describes.
    pub fn with_signer(mut self, signer: Arc<dyn TransactionSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_fallback_signer(mut self, signer: Arc<dyn TransactionSigner>) -> Self {
        self.fallback = Some(signer);
        self
    }

    /// Replace the default account discovery order.
    pub fn with_discovery(mut self, strategies: Vec<Box<dyn AccountDiscovery>>) -> Self {
        self.discovery = Some(strategies);
        self
    }

    pub fn metrics(&self) -> Arc<OperationMetrics> {
        self.metrics.clone()
    }

    pub async fn run(self) -> eyre::Result<RunReport> {
        let started = Instant::now();
        let config = self.config.clone();
        self.check_chain_id().await?;

        let remote = remote_signer(&config.signer);
        let defaults = if self.discovery.is_some() {
            Vec::new()
        } else {
            default_strategies(config.accounts.clone(), self.ledger.clone(), remote.clone())
        };
        let strategies = self.discovery.as_deref().unwrap_or(&defaults);
        let mut pool = AccountPool::initialize(strategies)
            .await
            .wrap_err("account discovery failed")?;

        let (signer, fallback) = self.resolve_signers(&pool, remote).await?;
        let privileged = config
            .privileged_account
            .or_else(|| pool.accounts().first().map(|account| account.address))
            .ok_or_else(|| eyre!("no privileged account available"))?;
        let auxiliary = auxiliary_accounts(&pool, privileged);
        let settings = DispatchSettings::from_config(&config);

        info!(
            target: "ssi_bench::runner",
            workers = config.workers,
            iterations = config.iterations,
            accounts = pool.len(),
            source = pool.source(),
            signer = signer.name(),
            %privileged,
            "starting benchmark"
        );

        let mut handles = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let accounts = pool.assign(index, config.workers)?;
            let dispatcher = Dispatcher::new(
                self.ledger.clone(),
                NonceLedger::new(self.ledger.clone()),
                signer.clone(),
                settings.clone(),
            )
            .with_fallback(fallback.clone());
            let worker = Worker {
                ctx: WorkerContext::new(index, config.workers, config.clone()),
                dispatcher,
                accounts,
                privileged,
                auxiliary: auxiliary.clone(),
                metrics: self.metrics.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }

        let mut workers = Vec::with_capacity(handles.len());
        for handle in handles {
            workers.push(handle.await.wrap_err("worker task panicked")?);
        }

        let report = RunReport {
            wall: started.elapsed(),
            account_source: pool.source(),
            signer: signer.name(),
            operations: self.metrics.snapshot(),
            workers,
        };
        info!(
            target: "ssi_bench::runner",
            completed = report.completed(),
            failed = report.failed(),
            skipped = report.skipped(),
            aborted = report.aborted_workers(),
            elapsed_ms = report.wall.as_millis() as u64,
            "benchmark finished"
        );
        Ok(report)
    }

    async fn check_chain_id(&self) -> eyre::Result<()> {
        match self.ledger.chain_id().await {
            Ok(chain_id) if chain_id != self.config.chain_id => Err(eyre!(
                "ledger reports chain id {chain_id}, config expects {}",
                self.config.chain_id
            )),
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(target: "ssi_bench::runner", %err, "could not read chain id");
                Ok(())
            }
        }
    }

    /// Primary and fallback signer, ordered by health.
    async fn resolve_signers(
        &self,
        pool: &AccountPool,
        remote: Option<Arc<dyn TransactionSigner>>,
    ) -> eyre::Result<(Arc<dyn TransactionSigner>, Option<Arc<dyn TransactionSigner>>)> {
        let primary: Arc<dyn TransactionSigner> = match (&self.signer, remote) {
            (Some(signer), _) => signer.clone(),
            (None, Some(remote)) => remote,
            (None, None) => Arc::new(pool.local_signer()?),
        };
        let fallback: Option<Arc<dyn TransactionSigner>> = match (&self.fallback, &self.config.fallback_signer) {
            (Some(signer), _) => Some(signer.clone()),
            (None, Some(SignerConfig::Local)) => Some(Arc::new(pool.local_signer()?)),
            (None, Some(config)) => remote_signer(config),
            (None, None) => None,
        };

        let mut candidates = vec![primary.clone()];
        candidates.extend(fallback);
        let chosen = select_signer(&candidates).await.unwrap_or(primary);
        let other = candidates.into_iter().find(|candidate| !Arc::ptr_eq(candidate, &chosen));
        Ok((chosen, other))
    }
}

struct Worker {
    ctx: WorkerContext,
    dispatcher: Dispatcher,
    accounts: WorkerAccounts,
    privileged: Address,
    auxiliary: Vec<(Address, Role)>,
    metrics: Arc<OperationMetrics>,
}

impl Worker {
    async fn run(self) -> WorkerReport {
        let mut report = WorkerReport {
            worker_index: self.ctx.worker_index(),
            accounts: self.accounts.accounts().iter().map(|account| account.address).collect(),
            shared_account: self.accounts.is_shared(),
            ..Default::default()
        };

        let bootstrap = BootstrapSequencer::new(&self.ctx, &self.dispatcher, self.privileged)
            .with_auxiliary(self.auxiliary.clone())
            .run()
            .await;
        match bootstrap {
            Ok(state) => report.bootstrap = Some(state),
            Err(err) => {
                error!(target: "ssi_bench::runner", worker = report.worker_index, %err, "worker aborted");
                report.aborted = Some(err.to_string());
                return report;
            }
        }

        let nonces = self.dispatcher.nonces().clone();
        let mix = self.ctx.config().operation_mix.clone();
        let iterations = self.ctx.config().iterations;
        let mut rng = StdRng::from_os_rng();
        let mut driver = WorkloadDriver::new(self.ctx, self.dispatcher, self.accounts, self.metrics);

        for _ in 0..iterations {
            let Some(kind) = mix.pick(&mut rng) else {
                break;
            };
            match driver.execute(kind).await {
                OperationOutcome::Completed(_) => report.completed += 1,
                OperationOutcome::Skipped(_) => report.skipped += 1,
                OperationOutcome::Failed(_) => report.failed += 1,
            }
        }

        report.resyncs = nonces.resync_count();
        report.tracker = driver.tracker().statistics();
        report.consistency_issues = driver.tracker().consistency_issues();
        info!(
            target: "ssi_bench::runner",
            worker = report.worker_index,
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            resyncs = report.resyncs,
            "worker finished"
        );
        report
    }
}
