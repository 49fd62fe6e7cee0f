//! Per-worker memory of the ledger entities this worker has created.

use std::collections::HashMap;

use alloy_primitives::{Address, B256};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    contracts::{CredentialStatus, Role},
    workload::OperationKind,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DidEntity {
    pub id: String,
    pub public_key: B256,
    pub service_endpoint: String,
    pub role: Role,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleAssignment {
    pub account: Address,
    pub role: Role,
    pub revoked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialEntity {
    pub id: B256,
    pub issuer: String,
    pub holder: String,
    pub cid: String,
    pub status: CredentialStatus,
}

/// Whether an operation has the prior entities it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prerequisites {
    pub missing: Vec<&'static str>,
}

impl Prerequisites {
    pub fn can_proceed(&self) -> bool {
        self.missing.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub dids: usize,
    pub active_dids: usize,
    pub dids_by_role: HashMap<Role, usize>,
    pub role_assignments: usize,
    pub revoked_roles: usize,
    pub credentials: usize,
    pub credentials_by_status: HashMap<CredentialStatus, usize>,
}

pub struct EntityTracker {
    prefix: String,
    did_counter: u64,
    credential_counter: u64,
    dids: Vec<DidEntity>,
    did_index: HashMap<String, usize>,
    roles: Vec<RoleAssignment>,
    credentials: Vec<CredentialEntity>,
    credential_index: HashMap<B256, usize>,
    rng: StdRng,
}

impl EntityTracker {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self::with_rng(prefix, StdRng::from_os_rng())
    }

    pub fn seeded(prefix: impl Into<String>, seed: u64) -> Self {
        Self::with_rng(prefix, StdRng::seed_from_u64(seed))
    }

    fn with_rng(prefix: impl Into<String>, rng: StdRng) -> Self {
        Self {
            prefix: prefix.into(),
            did_counter: 0,
            credential_counter: 0,
            dids: Vec::new(),
            did_index: HashMap::new(),
            roles: Vec::new(),
            credentials: Vec::new(),
            credential_index: HashMap::new(),
            rng,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Fresh DID identifier; unique within the run because the prefix is per worker.
    pub fn next_did_id(&mut self) -> String {
        self.did_counter += 1;
        format!("did:ssi:{}-{}", self.prefix, self.did_counter)
    }

    pub fn next_service_endpoint(&self, did: &str) -> String {
        let suffix = did.rsplit('-').next().unwrap_or_default();
        format!("https://{}.ssi.example/{}", self.prefix, suffix)
    }

    /// Fresh credential id, derived from the prefix, a counter and random bytes.
    pub fn next_credential_id(&mut self) -> B256 {
        self.credential_counter += 1;
        let mut id: [u8; 32] = self.rng.random();
        let tag = format!("{}-{}", self.prefix, self.credential_counter);
        let tag = tag.as_bytes();
        let len = tag.len().min(16);
        id[..len].copy_from_slice(&tag[..len]);
        B256::from(id)
    }

    pub fn random_key(&mut self) -> B256 {
        B256::from(self.rng.random::<[u8; 32]>())
    }

    pub fn random_address(&mut self) -> Address {
        Address::from(self.rng.random::<[u8; 20]>())
    }

    pub fn coin_flip(&mut self) -> bool {
        self.rng.random_bool(0.5)
    }

    pub fn record_did(&mut self, did: DidEntity) {
        match self.did_index.get(&did.id) {
            Some(&index) => self.dids[index] = did,
            None => {
                self.did_index.insert(did.id.clone(), self.dids.len());
                self.dids.push(did);
            }
        }
    }

    pub fn update_did(&mut self, id: &str, public_key: B256, service_endpoint: String) -> bool {
        match self.did_mut(id) {
            Some(did) => {
                did.public_key = public_key;
                did.service_endpoint = service_endpoint;
                true
            }
            None => false,
        }
    }

    pub fn deactivate_did(&mut self, id: &str) -> bool {
        match self.did_mut(id) {
            Some(did) => {
                did.active = false;
                true
            }
            None => false,
        }
    }

    pub fn record_role(&mut self, account: Address, role: Role) {
        match self.roles.iter_mut().find(|assignment| assignment.account == account) {
            Some(assignment) => {
                assignment.role = role;
                assignment.revoked = false;
            }
            None => self.roles.push(RoleAssignment {
                account,
                role,
                revoked: false,
            }),
        }
    }

    pub fn revoke_role(&mut self, account: Address) -> bool {
        match self.roles.iter_mut().find(|assignment| assignment.account == account) {
            Some(assignment) => {
                assignment.revoked = true;
                true
            }
            None => false,
        }
    }

    pub fn record_credential(&mut self, credential: CredentialEntity) {
        match self.credential_index.get(&credential.id) {
            Some(&index) => self.credentials[index] = credential,
            None => {
                self.credential_index.insert(credential.id, self.credentials.len());
                self.credentials.push(credential);
            }
        }
    }

    pub fn set_credential_status(&mut self, id: B256, status: CredentialStatus) -> bool {
        match self.credential_index.get(&id) {
            Some(&index) => {
                self.credentials[index].status = status;
                true
            }
            None => false,
        }
    }

    pub fn did(&self, id: &str) -> Option<&DidEntity> {
        self.did_index.get(id).map(|&index| &self.dids[index])
    }

    pub fn credential(&self, id: B256) -> Option<&CredentialEntity> {
        self.credential_index.get(&id).map(|&index| &self.credentials[index])
    }

    pub fn dids(&self) -> &[DidEntity] {
        &self.dids
    }

    pub fn roles(&self) -> &[RoleAssignment] {
        &self.roles
    }

    pub fn credentials(&self) -> &[CredentialEntity] {
        &self.credentials
    }

    /// Active DIDs holding `role`.
    pub fn count_active_dids(&self, role: Role) -> usize {
        self.dids.iter().filter(|did| did.active && did.role == role).count()
    }

    pub fn count_assignments(&self, role: Role) -> usize {
        self.roles
            .iter()
            .filter(|assignment| !assignment.revoked && assignment.role == role)
            .count()
    }

    /// Uniformly random DID, optionally restricted to active ones.
    pub fn random_did(&mut self, active_only: bool) -> Option<DidEntity> {
        let candidates: Vec<usize> = (0..self.dids.len())
            .filter(|&index| !active_only || self.dids[index].active)
            .collect();
        self.pick(&candidates).map(|index| self.dids[index].clone())
    }

    /// Uniformly random active DID holding `role`.
    pub fn random_did_with_role(&mut self, role: Role) -> Option<DidEntity> {
        let candidates: Vec<usize> = (0..self.dids.len())
            .filter(|&index| self.dids[index].active && self.dids[index].role == role)
            .collect();
        self.pick(&candidates).map(|index| self.dids[index].clone())
    }

    pub fn random_assignment(&mut self) -> Option<RoleAssignment> {
        let candidates: Vec<usize> = (0..self.roles.len())
            .filter(|&index| !self.roles[index].revoked)
            .collect();
        self.pick(&candidates).map(|index| self.roles[index].clone())
    }

    /// Uniformly random credential, optionally restricted to one status.
    pub fn random_credential(&mut self, status: Option<CredentialStatus>) -> Option<CredentialEntity> {
        let candidates: Vec<usize> = (0..self.credentials.len())
            .filter(|&index| status.is_none_or(|status| self.credentials[index].status == status))
            .collect();
        self.pick(&candidates).map(|index| self.credentials[index].clone())
    }

    fn pick(&mut self, candidates: &[usize]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[self.rng.random_range(0..candidates.len())])
    }

    fn did_mut(&mut self, id: &str) -> Option<&mut DidEntity> {
        let index = *self.did_index.get(id)?;
        self.dids.get_mut(index)
    }

    /// What `kind` still needs before it can produce valid arguments.
    pub fn prerequisites(&self, kind: OperationKind) -> Prerequisites {
        let has_did = !self.dids.is_empty();
        let has_active_did = self.dids.iter().any(|did| did.active);
        let mut missing = Vec::new();
        match kind {
            OperationKind::AssignRole | OperationKind::CreateDid => {}
            OperationKind::RevokeRole => {
                if !self.roles.iter().any(|assignment| !assignment.revoked) {
                    missing.push("an unrevoked role assignment");
                }
            }
            OperationKind::UpdateDid | OperationKind::DeactivateDid => {
                if !has_active_did {
                    missing.push("an active DID");
                }
            }
            OperationKind::ResolveDid => {
                if !has_did {
                    missing.push("a created DID");
                }
            }
            OperationKind::IssueCredential => {
                if self.count_active_dids(Role::Issuer) == 0 {
                    missing.push("an active ISSUER DID");
                }
                if self.count_active_dids(Role::Holder) == 0 {
                    missing.push("an active HOLDER DID");
                }
            }
            OperationKind::UpdateCredentialStatus => {
                if !self
                    .credentials
                    .iter()
                    .any(|credential| credential.status == CredentialStatus::Active)
                {
                    missing.push("an ACTIVE credential");
                }
            }
            OperationKind::ResolveCredential => {
                if self.credentials.is_empty() {
                    missing.push("an issued credential");
                }
            }
        }
        Prerequisites { missing }
    }

    pub fn statistics(&self) -> TrackerStats {
        let mut stats = TrackerStats {
            dids: self.dids.len(),
            active_dids: self.dids.iter().filter(|did| did.active).count(),
            role_assignments: self.roles.len(),
            revoked_roles: self.roles.iter().filter(|assignment| assignment.revoked).count(),
            credentials: self.credentials.len(),
            ..TrackerStats::default()
        };
        for did in &self.dids {
            *stats.dids_by_role.entry(did.role).or_default() += 1;
        }
        for credential in &self.credentials {
            *stats.credentials_by_status.entry(credential.status).or_default() += 1;
        }
        stats
    }

    /// Credentials whose issuer or holder the tracker does not know.
    pub fn consistency_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        for credential in &self.credentials {
            if self.did(&credential.issuer).is_none() {
                issues.push(format!("credential {} references unknown issuer {}", credential.id, credential.issuer));
            }
            if self.did(&credential.holder).is_none() {
                issues.push(format!("credential {} references unknown holder {}", credential.id, credential.holder));
            }
        }
        if self.did_index.len() != self.dids.len() {
            issues.push(format!(
                "did index holds {} entries for {} DIDs",
                self.did_index.len(),
                self.dids.len()
            ));
        }
        issues
    }
}
