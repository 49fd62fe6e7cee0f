//! One-time health check and TRUSTEE remediation run before any workload is dispatched.

use std::{
    fmt,
    time::{Duration, Instant},
};

use alloy_primitives::{Address, address};
use tracing::{error, info, warn};

use crate::{
    account::AccountPool,
    context::WorkerContext,
    contracts::{CallOutput, ContractCall, ContractName, Role},
    dispatcher::Dispatcher,
    error::DispatchError,
    rpc::RpcError,
};

/// Genesis accounts that receive baseline roles when the pool is too small.
pub const FALLBACK_AUXILIARY: [(Address, Role); 3] = [
    (address!("0xfe3b557e8fb62b89f4916b721be55ceb828dbd73"), Role::Issuer),
    (address!("0x627306090abaB3A6e1400e9345bC60c78a8BEf57"), Role::Holder),
    (address!("0xf17f52151EbEF6C7334FAD080c5704D77216b732"), Role::Trustee),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SystemHealth {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl fmt::Display for SystemHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BootstrapPhase {
    #[default]
    NotStarted,
    Checking,
    Remediating,
    Healthy,
    Failed,
}

/// What the sequencer found, kept for the run report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapState {
    pub completed: bool,
    pub system_health: SystemHealth,
    /// Raw role value read for the privileged account.
    pub privileged_account_role: u8,
    pub phase: BootstrapPhase,
    pub remediation_attempts: u32,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub duration: Duration,
}

impl BootstrapState {
    pub fn is_healthy(&self) -> bool {
        self.system_health == SystemHealth::Healthy
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("ledger unreachable: {0}")]
    Unreachable(#[source] DispatchError),
    #[error("could not read code of {contract}: {source}")]
    Code {
        contract: ContractName,
        #[source]
        source: RpcError,
    },
    #[error("no contract code for {contract} at {address}")]
    MissingContract { contract: ContractName, address: Address },
    #[error("self-assignment of TRUSTEE to {account} failed: {source}")]
    Remediation {
        account: Address,
        #[source]
        source: DispatchError,
    },
    #[error("{account} holds role {role} after remediation, expected TRUSTEE")]
    NotConfirmed { account: Address, role: u8 },
    #[error("system not ready: {0}")]
    NotReady(String),
}

/// Auxiliary role grants: the first three pool accounts other than `privileged`,
/// or [`FALLBACK_AUXILIARY`] when the pool cannot supply three.
pub fn auxiliary_accounts(pool: &AccountPool, privileged: Address) -> Vec<(Address, Role)> {
    let others: Vec<Address> = pool
        .accounts()
        .iter()
        .map(|account| account.address)
        .filter(|address| *address != privileged)
        .take(3)
        .collect();
    if others.len() < 3 {
        return FALLBACK_AUXILIARY.to_vec();
    }
    others
        .into_iter()
        .zip([Role::Issuer, Role::Holder, Role::Trustee])
        .collect()
}

/// Runs the check-and-remediate sequence for one worker.
pub struct BootstrapSequencer<'a> {
    ctx: &'a WorkerContext,
    dispatcher: &'a Dispatcher,
    privileged: Address,
    auxiliary: Vec<(Address, Role)>,
}

impl<'a> BootstrapSequencer<'a> {
    pub fn new(ctx: &'a WorkerContext, dispatcher: &'a Dispatcher, privileged: Address) -> Self {
        Self {
            ctx,
            dispatcher,
            privileged,
            auxiliary: Vec::new(),
        }
    }

    pub fn with_auxiliary(mut self, auxiliary: Vec<(Address, Role)>) -> Self {
        self.auxiliary = auxiliary;
        self
    }

    /// Full sequence on the leading worker, read-only readiness elsewhere.
    ///
    /// A failed full sequence is fatal for this worker. A failed light check is
    /// recorded and the worker proceeds; the leader may still be remediating.
    pub async fn run(&self) -> Result<BootstrapState, BootstrapError> {
        let started = Instant::now();
        let mut state = BootstrapState {
            phase: BootstrapPhase::Checking,
            ..Default::default()
        };

        if !self.ctx.leads_bootstrap() {
            match self.check_readiness(&mut state).await {
                Ok(()) => mark_healthy(&mut state),
                Err(err) => {
                    warn!(
                        target: "ssi_bench::bootstrap",
                        worker = self.ctx.worker_index(),
                        %err,
                        "system not ready yet, proceeding"
                    );
                    state.system_health = SystemHealth::Unhealthy;
                    state.errors.push(err.to_string());
                }
            }
            state.duration = started.elapsed();
            return Ok(state);
        }

        info!(
            target: "ssi_bench::bootstrap",
            worker = self.ctx.worker_index(),
            privileged = %self.privileged,
            "running bootstrap"
        );
        match self.full_sequence(&mut state).await {
            Ok(()) => {
                mark_healthy(&mut state);
                state.duration = started.elapsed();
                info!(
                    target: "ssi_bench::bootstrap",
                    worker = self.ctx.worker_index(),
                    elapsed_ms = state.duration.as_millis() as u64,
                    warnings = state.warnings.len(),
                    "bootstrap complete"
                );
                Ok(state)
            }
            Err(err) => {
                state.phase = BootstrapPhase::Failed;
                state.system_health = SystemHealth::Unhealthy;
                state.errors.push(err.to_string());
                self.log_guidance(&state, &err);
                Err(err)
            }
        }
    }

    async fn full_sequence(&self, state: &mut BootstrapState) -> Result<(), BootstrapError> {
        self.verify_contracts().await?;

        let role = self.role_of(self.privileged).await.map_err(BootstrapError::Unreachable)?;
        state.privileged_account_role = role;
        if role != Role::Trustee.as_u8() {
            state.phase = BootstrapPhase::Remediating;
            state.remediation_attempts += 1;
            warn!(
                target: "ssi_bench::bootstrap",
                account = %self.privileged,
                role,
                "privileged account lacks TRUSTEE, self-assigning"
            );
            self.dispatcher
                .send(
                    ContractCall::AssignRole {
                        role: Role::Trustee,
                        account: self.privileged,
                    },
                    self.privileged,
                )
                .await
                .map_err(|source| BootstrapError::Remediation {
                    account: self.privileged,
                    source,
                })?;

            let confirmed = self.role_of(self.privileged).await.map_err(BootstrapError::Unreachable)?;
            state.privileged_account_role = confirmed;
            if confirmed != Role::Trustee.as_u8() {
                return Err(BootstrapError::NotConfirmed {
                    account: self.privileged,
                    role: confirmed,
                });
            }
            info!(target: "ssi_bench::bootstrap", account = %self.privileged, "TRUSTEE self-assignment confirmed");
        }

        self.grant_auxiliary_roles(state).await;
        self.check_readiness(state).await
    }

    async fn verify_contracts(&self) -> Result<(), BootstrapError> {
        let contracts = self.dispatcher.settings().contracts;
        for contract in ContractName::ALL {
            let address = contracts.address_of(contract);
            let code = self
                .dispatcher
                .ledger()
                .code(address)
                .await
                .map_err(|source| BootstrapError::Code { contract, source })?;
            if code.is_empty() {
                return Err(BootstrapError::MissingContract { contract, address });
            }
        }
        Ok(())
    }

    /// Grant baseline roles. Failures are warnings only.
    async fn grant_auxiliary_roles(&self, state: &mut BootstrapState) {
        for &(account, role) in &self.auxiliary {
            if account == self.privileged {
                continue;
            }
            match self
                .dispatcher
                .read(ContractCall::HasRole { role, account }, self.privileged)
                .await
            {
                Ok(CallOutput::Bool(true)) => continue,
                Ok(_) => {}
                Err(err) => {
                    warn!(target: "ssi_bench::bootstrap", %account, %err, "could not read auxiliary role");
                    state.warnings.push(err.to_string());
                    continue;
                }
            }
            match self
                .dispatcher
                .send(ContractCall::AssignRole { role, account }, self.privileged)
                .await
            {
                Ok(_) => info!(target: "ssi_bench::bootstrap", %account, %role, "auxiliary role granted"),
                Err(err) => {
                    warn!(target: "ssi_bench::bootstrap", %account, %role, %err, "auxiliary role grant failed");
                    state.warnings.push(err.to_string());
                }
            }
        }
    }

    /// Privileged account holds TRUSTEE and at least one TRUSTEE is counted.
    async fn check_readiness(&self, state: &mut BootstrapState) -> Result<(), BootstrapError> {
        let role = self.role_of(self.privileged).await.map_err(BootstrapError::Unreachable)?;
        state.privileged_account_role = role;
        if role != Role::Trustee.as_u8() {
            return Err(BootstrapError::NotReady(format!(
                "privileged account {} holds role {role}, expected TRUSTEE",
                self.privileged
            )));
        }

        let trustees = self
            .dispatcher
            .read(ContractCall::GetRoleCount { role: Role::Trustee }, self.privileged)
            .await
            .map_err(BootstrapError::Unreachable)?
            .as_count()
            .unwrap_or_default();
        if trustees < 1 {
            return Err(BootstrapError::NotReady("no TRUSTEE accounts on the ledger".into()));
        }
        Ok(())
    }

    async fn role_of(&self, account: Address) -> Result<u8, DispatchError> {
        let output = self
            .dispatcher
            .read(ContractCall::GetRole { account }, self.privileged)
            .await?;
        Ok(match output {
            CallOutput::Role(raw) => raw,
            _ => 0,
        })
    }

    fn log_guidance(&self, state: &BootstrapState, err: &BootstrapError) {
        let role_control = self.dispatcher.settings().contracts.role_control;
        error!(target: "ssi_bench::bootstrap", %err, "bootstrap failed");
        error!(
            target: "ssi_bench::bootstrap",
            privileged = %self.privileged,
            %role_control,
            role = state.privileged_account_role,
            health = %state.system_health,
            errors = state.errors.len(),
            "RoleControl must grant TRUSTEE to the privileged account at deployment"
        );
        error!(
            target: "ssi_bench::bootstrap",
            "check that the RoleControl constructor assigns TRUSTEE to its deployer, that the \
             configured privileged account is the deployer, or grant TRUSTEE from an existing \
             TRUSTEE account and rerun"
        );
    }
}

fn mark_healthy(state: &mut BootstrapState) {
    state.completed = true;
    state.phase = BootstrapPhase::Healthy;
    state.system_health = SystemHealth::Healthy;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        account::Account,
        config::BenchConfig,
        dispatcher::DispatchSettings,
        nonce::NonceLedger,
        nullables::{NullLedger, NullSigner, test_config},
        signer::LocalKeySigner,
    };
    use alloy_signer_local::PrivateKeySigner;

    struct Harness {
        ledger: Arc<NullLedger>,
        dispatcher: Dispatcher,
        privileged: Address,
    }

    fn harness() -> Harness {
        let key = PrivateKeySigner::random();
        let privileged = key.address();
        let ledger = Arc::new(NullLedger::deployed());
        let config = test_config();
        let dispatcher = Dispatcher::new(
            ledger.clone(),
            NonceLedger::new(ledger.clone()),
            Arc::new(NullSigner::delegating(LocalKeySigner::new([key]))),
            DispatchSettings::from_config(&config),
        );
        Harness {
            ledger,
            dispatcher,
            privileged,
        }
    }

    fn ctx(index: usize, config: BenchConfig) -> WorkerContext {
        WorkerContext::new(index, 2, Arc::new(config))
    }

    #[tokio::test]
    async fn missing_trustee_is_self_assigned_once() {
        let h = harness();
        let ctx = ctx(0, test_config());
        let state = BootstrapSequencer::new(&ctx, &h.dispatcher, h.privileged)
            .run()
            .await
            .unwrap();

        assert!(state.is_healthy());
        assert_eq!(state.privileged_account_role, Role::Trustee.as_u8());
        assert_eq!(state.remediation_attempts, 1);
        assert_eq!(h.ledger.role_grants_to(h.privileged), 1);
    }

    #[tokio::test]
    async fn healthy_ledger_needs_no_transactions() {
        let h = harness();
        h.ledger.set_role(h.privileged, Role::Trustee);
        let ctx = ctx(0, test_config());
        let state = BootstrapSequencer::new(&ctx, &h.dispatcher, h.privileged)
            .run()
            .await
            .unwrap();

        assert!(state.is_healthy());
        assert_eq!(state.remediation_attempts, 0);
        assert_eq!(h.ledger.count("eth_sendRawTransaction"), 0);
    }

    #[tokio::test]
    async fn failed_remediation_is_fatal() {
        let h = harness();
        h.ledger.set_role(Address::repeat_byte(1), Role::Trustee);
        let ctx = ctx(0, test_config());
        let err = BootstrapSequencer::new(&ctx, &h.dispatcher, h.privileged)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Remediation { .. }), "{err}");
    }

    #[tokio::test]
    async fn missing_contract_code_is_fatal() {
        let h = harness();
        h.ledger.remove_code(NullLedger::CONTRACTS.credential_registry);
        let ctx = ctx(0, test_config());
        let err = BootstrapSequencer::new(&ctx, &h.dispatcher, h.privileged)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::MissingContract {
                contract: ContractName::CredentialRegistry,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn followers_only_check_readiness() {
        let h = harness();
        let ctx = ctx(1, test_config());
        let state = BootstrapSequencer::new(&ctx, &h.dispatcher, h.privileged)
            .run()
            .await
            .unwrap();

        assert_eq!(state.system_health, SystemHealth::Unhealthy);
        assert_eq!(state.errors.len(), 1);
        assert_eq!(h.ledger.count("eth_sendRawTransaction"), 0);
    }

    #[tokio::test]
    async fn forced_bootstrap_runs_on_any_worker() {
        let h = harness();
        let ctx = ctx(1, BenchConfig {
            force_bootstrap: true,
            ..test_config()
        });
        let state = BootstrapSequencer::new(&ctx, &h.dispatcher, h.privileged)
            .run()
            .await
            .unwrap();
        assert!(state.is_healthy());
        assert_eq!(h.ledger.role_grants_to(h.privileged), 1);
    }

    #[tokio::test]
    async fn auxiliary_grants_skip_held_roles_and_tolerate_failures() {
        let h = harness();
        let issuer = Address::repeat_byte(0x11);
        let holder = Address::repeat_byte(0x22);
        let unassignable = Address::repeat_byte(0x33);
        h.ledger.set_role(holder, Role::Holder);
        h.ledger.set_role(unassignable, Role::Issuer);
        let ctx = ctx(0, test_config());
        let auxiliary = vec![
            (issuer, Role::Issuer),
            (holder, Role::Holder),
            (h.privileged, Role::Issuer),
            (unassignable, Role::None),
        ];
        let state = BootstrapSequencer::new(&ctx, &h.dispatcher, h.privileged)
            .with_auxiliary(auxiliary)
            .run()
            .await
            .unwrap();

        assert!(state.is_healthy());
        assert_eq!(h.ledger.role_of(issuer), Role::Issuer.as_u8());
        assert_eq!(h.ledger.role_grants_to(holder), 0);
        assert_eq!(h.ledger.role_grants_to(h.privileged), 1);
        // NONE is not assignable, so the last grant only warns.
        assert_eq!(state.warnings.len(), 1);
    }

    #[test]
    fn small_pools_use_genesis_accounts() {
        let privileged = Address::repeat_byte(1);
        let small = AccountPool::from_accounts("test", vec![Account::new(privileged), Account::new(Address::repeat_byte(2))]);
        assert_eq!(auxiliary_accounts(&small, privileged), FALLBACK_AUXILIARY.to_vec());

        let large = AccountPool::from_accounts(
            "test",
            (1..=4).map(|i| Account::new(Address::repeat_byte(i))).collect(),
        );
        assert_eq!(
            auxiliary_accounts(&large, privileged),
            vec![
                (Address::repeat_byte(2), Role::Issuer),
                (Address::repeat_byte(3), Role::Holder),
                (Address::repeat_byte(4), Role::Trustee),
            ]
        );
    }
}
