//! Argument generation for each benchmarked operation.

use std::{fmt, sync::Arc};

use alloy_primitives::{Address, B256, hex};
use serde::Deserialize;
use tracing::debug;

use crate::{
    account::WorkerAccounts,
    config::RoleBalance,
    context::WorkerContext,
    contracts::{ContractCall, CredentialStatus, Role},
    dispatcher::{DispatchOutcome, Dispatcher},
    error::DispatchError,
    metrics::OperationMetrics,
    tracker::{CredentialEntity, DidEntity, EntityTracker, Prerequisites},
    transaction::TransactionRequest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    AssignRole,
    RevokeRole,
    CreateDid,
    UpdateDid,
    DeactivateDid,
    ResolveDid,
    IssueCredential,
    UpdateCredentialStatus,
    ResolveCredential,
}

impl OperationKind {
    pub const ALL: [OperationKind; 9] = [
        OperationKind::AssignRole,
        OperationKind::RevokeRole,
        OperationKind::CreateDid,
        OperationKind::UpdateDid,
        OperationKind::DeactivateDid,
        OperationKind::ResolveDid,
        OperationKind::IssueCredential,
        OperationKind::UpdateCredentialStatus,
        OperationKind::ResolveCredential,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AssignRole => "assign-role",
            Self::RevokeRole => "revoke-role",
            Self::CreateDid => "create-did",
            Self::UpdateDid => "update-did",
            Self::DeactivateDid => "deactivate-did",
            Self::ResolveDid => "resolve-did",
            Self::IssueCredential => "issue-credential",
            Self::UpdateCredentialStatus => "update-credential-status",
            Self::ResolveCredential => "resolve-credential",
        }
    }

    pub fn is_read_only(self) -> bool {
        matches!(self, Self::ResolveDid | Self::ResolveCredential)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracker mutation applied only once the call has been confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Effect {
    None,
    AssignRole { account: Address, role: Role },
    RevokeRole { account: Address },
    CreateDid(DidEntity),
    UpdateDid { id: String, public_key: B256, service_endpoint: String },
    DeactivateDid(String),
    IssueCredential(CredentialEntity),
    CredentialStatus { id: B256, status: CredentialStatus },
}

/// A generated call together with what it will change in the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedOperation {
    pub kind: OperationKind,
    pub call: ContractCall,
    effect: Effect,
}

#[derive(Debug)]
pub enum OperationOutcome {
    Completed(DispatchOutcome),
    /// Prerequisites were missing; nothing was sent.
    Skipped(Prerequisites),
    Failed(DispatchError),
}

impl OperationOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Generates and dispatches operations for one worker.
pub struct WorkloadDriver {
    ctx: WorkerContext,
    dispatcher: Dispatcher,
    accounts: WorkerAccounts,
    tracker: EntityTracker,
    balance: RoleBalance,
    rotation: usize,
    revisions: u64,
    metrics: Arc<OperationMetrics>,
}

impl WorkloadDriver {
    pub fn new(
        ctx: WorkerContext,
        dispatcher: Dispatcher,
        accounts: WorkerAccounts,
        metrics: Arc<OperationMetrics>,
    ) -> Self {
        let tracker = EntityTracker::new(ctx.prefix());
        let balance = ctx.config().role_balance;
        Self {
            ctx,
            dispatcher,
            accounts,
            tracker,
            balance,
            rotation: 0,
            revisions: 0,
            metrics,
        }
    }

    pub fn with_tracker(mut self, tracker: EntityTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn tracker(&self) -> &EntityTracker {
        &self.tracker
    }

    pub fn worker_index(&self) -> usize {
        self.ctx.worker_index()
    }

    /// Generate arguments for `kind`, or report which prior entities are missing.
    pub fn plan(&mut self, kind: OperationKind) -> Result<PlannedOperation, Prerequisites> {
        let prerequisites = self.tracker.prerequisites(kind);
        if !prerequisites.can_proceed() {
            return Err(prerequisites);
        }
        let planned = match kind {
            OperationKind::AssignRole => self.assign_role(),
            OperationKind::RevokeRole => self.revoke_role(),
            OperationKind::CreateDid => Some(self.create_did()),
            OperationKind::UpdateDid => self.update_did(),
            OperationKind::DeactivateDid => self.deactivate_did(),
            OperationKind::ResolveDid => self.resolve_did(),
            OperationKind::IssueCredential => self.issue_credential(),
            OperationKind::UpdateCredentialStatus => self.update_credential_status(),
            OperationKind::ResolveCredential => self.resolve_credential(),
        };
        planned.ok_or(prerequisites)
    }

    /// Plan, dispatch and, on success, commit one operation.
    pub async fn execute(&mut self, kind: OperationKind) -> OperationOutcome {
        let planned = match self.plan(kind) {
            Ok(planned) => planned,
            Err(prerequisites) => {
                debug!(
                    target: "ssi_bench::workload",
                    worker = self.ctx.worker_index(),
                    operation = %kind,
                    missing = ?prerequisites.missing,
                    "skipping operation"
                );
                self.metrics.record_skip(kind);
                return OperationOutcome::Skipped(prerequisites);
            }
        };

        let from = self.accounts.next().address;
        let mut request = TransactionRequest::new(planned.call, from);
        let timer = self.metrics.start(kind);
        match self.dispatcher.dispatch(&mut request).await {
            Ok(outcome) => {
                timer.succeed();
                self.commit(planned.effect);
                OperationOutcome::Completed(outcome)
            }
            Err(err) => {
                timer.fail(err.class());
                OperationOutcome::Failed(err)
            }
        }
    }

    fn commit(&mut self, effect: Effect) {
        match effect {
            Effect::None => {}
            Effect::AssignRole { account, role } => self.tracker.record_role(account, role),
            Effect::RevokeRole { account } => {
                self.tracker.revoke_role(account);
            }
            Effect::CreateDid(did) => self.tracker.record_did(did),
            Effect::UpdateDid {
                id,
                public_key,
                service_endpoint,
            } => {
                self.tracker.update_did(&id, public_key, service_endpoint);
            }
            Effect::DeactivateDid(id) => {
                self.tracker.deactivate_did(&id);
            }
            Effect::IssueCredential(credential) => self.tracker.record_credential(credential),
            Effect::CredentialStatus { id, status } => {
                self.tracker.set_credential_status(id, status);
            }
        }
    }

    /// ISSUER until the target is met, then HOLDER and TRUSTEE in turn.
    fn next_role(&mut self, issuers: usize) -> Role {
        if issuers < self.balance.issuer_target {
            return Role::Issuer;
        }
        let role = if self.rotation % 2 == 0 { Role::Holder } else { Role::Trustee };
        self.rotation += 1;
        role
    }

    fn assign_role(&mut self) -> Option<PlannedOperation> {
        let account = self.tracker.random_address();
        let role = self.next_role(self.tracker.count_assignments(Role::Issuer));
        Some(PlannedOperation {
            kind: OperationKind::AssignRole,
            call: ContractCall::AssignRole { role, account },
            effect: Effect::AssignRole { account, role },
        })
    }

    fn revoke_role(&mut self) -> Option<PlannedOperation> {
        let assignment = self.tracker.random_assignment()?;
        Some(PlannedOperation {
            kind: OperationKind::RevokeRole,
            call: ContractCall::RevokeRole {
                role: assignment.role,
                account: assignment.account,
            },
            effect: Effect::RevokeRole {
                account: assignment.account,
            },
        })
    }

    fn create_did(&mut self) -> PlannedOperation {
        let id = self.tracker.next_did_id();
        let public_key = self.tracker.random_key();
        let service_endpoint = self.tracker.next_service_endpoint(&id);
        let role = self.next_role(self.tracker.count_active_dids(Role::Issuer));
        PlannedOperation {
            kind: OperationKind::CreateDid,
            call: ContractCall::CreateDid {
                did: id.clone(),
                public_key,
                service_endpoint: service_endpoint.clone(),
                role,
            },
            effect: Effect::CreateDid(DidEntity {
                id,
                public_key,
                service_endpoint,
                role,
                active: true,
            }),
        }
    }

    fn update_did(&mut self) -> Option<PlannedOperation> {
        let did = self.tracker.random_did(true)?;
        self.revisions += 1;
        let public_key = self.tracker.random_key();
        let service_endpoint = format!("{}?rev={}", self.tracker.next_service_endpoint(&did.id), self.revisions);
        Some(PlannedOperation {
            kind: OperationKind::UpdateDid,
            call: ContractCall::UpdateDid {
                did: did.id.clone(),
                public_key,
                service_endpoint: service_endpoint.clone(),
            },
            effect: Effect::UpdateDid {
                id: did.id,
                public_key,
                service_endpoint,
            },
        })
    }

    fn deactivate_did(&mut self) -> Option<PlannedOperation> {
        let did = self.tracker.random_did(true)?;
        Some(PlannedOperation {
            kind: OperationKind::DeactivateDid,
            call: ContractCall::DeactivateDid { did: did.id.clone() },
            effect: Effect::DeactivateDid(did.id),
        })
    }

    fn resolve_did(&mut self) -> Option<PlannedOperation> {
        let did = self.tracker.random_did(false)?;
        Some(PlannedOperation {
            kind: OperationKind::ResolveDid,
            call: ContractCall::ResolveDid { did: did.id },
            effect: Effect::None,
        })
    }

    fn issue_credential(&mut self) -> Option<PlannedOperation> {
        let issuer = self.tracker.random_did_with_role(Role::Issuer)?;
        let holder = self.tracker.random_did_with_role(Role::Holder)?;
        let id = self.tracker.next_credential_id();
        let cid = format!("bafk{}", hex::encode(&id[16..]));
        Some(PlannedOperation {
            kind: OperationKind::IssueCredential,
            call: ContractCall::IssueCredential {
                id,
                issuer_did: issuer.id.clone(),
                holder_did: holder.id.clone(),
                credential_cid: cid.clone(),
            },
            effect: Effect::IssueCredential(CredentialEntity {
                id,
                issuer: issuer.id,
                holder: holder.id,
                cid,
                status: CredentialStatus::Active,
            }),
        })
    }

    fn update_credential_status(&mut self) -> Option<PlannedOperation> {
        let credential = self.tracker.random_credential(Some(CredentialStatus::Active))?;
        let status = if self.tracker.coin_flip() {
            CredentialStatus::Revoked
        } else {
            CredentialStatus::Suspended
        };
        Some(PlannedOperation {
            kind: OperationKind::UpdateCredentialStatus,
            call: ContractCall::UpdateCredentialStatus {
                id: credential.id,
                status,
            },
            effect: Effect::CredentialStatus {
                id: credential.id,
                status,
            },
        })
    }

    fn resolve_credential(&mut self) -> Option<PlannedOperation> {
        let credential = self.tracker.random_credential(None)?;
        Some(PlannedOperation {
            kind: OperationKind::ResolveCredential,
            call: ContractCall::ResolveCredential { id: credential.id },
            effect: Effect::None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        account::{Account, AccountPool},
        config::BenchConfig,
        dispatcher::DispatchSettings,
        nonce::NonceLedger,
        nullables::{NullLedger, NullSigner, test_config},
        signer::LocalKeySigner,
    };
    use alloy_signer_local::PrivateKeySigner;

    fn driver(config: BenchConfig) -> (WorkloadDriver, Arc<NullLedger>) {
        let key = PrivateKeySigner::random();
        let mut pool = AccountPool::from_accounts("test", vec![Account::new(key.address())]);
        let ledger = Arc::new(NullLedger::deployed());
        let config = Arc::new(config);
        let ctx = WorkerContext::new(0, 1, config.clone());
        let dispatcher = Dispatcher::new(
            ledger.clone(),
            NonceLedger::new(ledger.clone()),
            Arc::new(NullSigner::delegating(LocalKeySigner::new([key]))),
            DispatchSettings::from_config(&config),
        );
        let accounts = pool.assign(0, 1).unwrap();
        let driver = WorkloadDriver::new(ctx, dispatcher, accounts, Arc::default())
            .with_tracker(EntityTracker::seeded("w1", 42));
        (driver, ledger)
    }

    #[test]
    fn operation_names_are_kebab_case() {
        for kind in OperationKind::ALL {
            let parsed: OperationKind = serde_json::from_value(serde_json::json!(kind.as_str())).unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn role_balance_fills_issuers_first() {
        let (mut driver, _) = driver(test_config());
        driver.balance.issuer_target = 2;
        assert_eq!(driver.next_role(0), Role::Issuer);
        assert_eq!(driver.next_role(1), Role::Issuer);
        assert_eq!(driver.next_role(2), Role::Holder);
        assert_eq!(driver.next_role(2), Role::Trustee);
        assert_eq!(driver.next_role(2), Role::Holder);
    }

    #[tokio::test]
    async fn issue_credential_without_issuers_sends_nothing() {
        let (mut driver, ledger) = driver(test_config());
        let outcome = driver.execute(OperationKind::IssueCredential).await;
        match outcome {
            OperationOutcome::Skipped(prerequisites) => {
                assert!(prerequisites.missing.contains(&"an active ISSUER DID"))
            }
            other => panic!("expected skip, got {other:?}"),
        }
        assert_eq!(ledger.total_calls(), 0);
    }

    #[tokio::test]
    async fn dependent_operations_target_prior_entities() {
        let (mut driver, ledger) = driver(test_config());
        // Default balance: one ISSUER, then a HOLDER.
        assert!(driver.execute(OperationKind::CreateDid).await.is_completed());
        assert!(driver.execute(OperationKind::CreateDid).await.is_completed());
        assert!(driver.execute(OperationKind::IssueCredential).await.is_completed());
        assert!(driver.execute(OperationKind::UpdateCredentialStatus).await.is_completed());
        assert!(driver.execute(OperationKind::ResolveCredential).await.is_completed());
        assert!(driver.execute(OperationKind::UpdateDid).await.is_completed());
        assert!(driver.execute(OperationKind::ResolveDid).await.is_completed());

        let stats = driver.tracker().statistics();
        assert_eq!(stats.dids, 2);
        assert_eq!(stats.credentials, 1);
        assert!(driver.tracker().credentials()[0].status != CredentialStatus::Active);
        assert_eq!(ledger.credentials().len(), 1);
        assert!(driver.tracker().consistency_issues().is_empty());
    }

    #[tokio::test]
    async fn failed_dispatch_leaves_tracker_untouched() {
        let (mut driver, ledger) = driver(test_config());
        ledger.fail_next(100);
        let outcome = driver.execute(OperationKind::CreateDid).await;
        assert!(matches!(outcome, OperationOutcome::Failed(_)));
        assert!(driver.tracker().dids().is_empty());
    }

    #[tokio::test]
    async fn deactivated_dids_are_not_updated() {
        let (mut driver, _) = driver(test_config());
        assert!(driver.execute(OperationKind::CreateDid).await.is_completed());
        assert!(driver.execute(OperationKind::DeactivateDid).await.is_completed());
        assert!(matches!(
            driver.execute(OperationKind::UpdateDid).await,
            OperationOutcome::Skipped(_)
        ));
        assert!(driver.execute(OperationKind::ResolveDid).await.is_completed());
    }

    #[tokio::test]
    async fn assigned_roles_can_be_revoked() {
        let (mut driver, ledger) = driver(test_config());
        let sender = driver.accounts.first().address;
        ledger.set_role(sender, Role::Trustee);

        assert!(driver.execute(OperationKind::AssignRole).await.is_completed());
        let assigned = driver.tracker().roles()[0].clone();
        assert_eq!(assigned.role, Role::Issuer);
        assert_eq!(ledger.role_of(assigned.account), Role::Issuer.as_u8());

        assert!(driver.execute(OperationKind::RevokeRole).await.is_completed());
        assert_eq!(ledger.role_of(assigned.account), Role::None.as_u8());
        assert!(driver.tracker().roles()[0].revoked);
    }
}
