//! Signing identities available to the benchmark and their split across workers.

use std::fmt;

use alloy_primitives::Address;
use tracing::{info, warn};

use crate::{
    contracts::Role,
    discovery::AccountDiscovery,
    signer::{LocalKeySigner, SignerError, parse_private_key},
};

/// Opaque reference to key material. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyRef(String);

impl KeyRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyRef(<redacted>)")
    }
}

/// A sending identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub address: Address,
    key: Option<KeyRef>,
    /// Last role observed on the ledger, `None` while unknown.
    pub role: Option<Role>,
    pub leased: bool,
}

impl Account {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            key: None,
            role: None,
            leased: false,
        }
    }

    pub fn with_key(mut self, key: KeyRef) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn key(&self) -> Option<&KeyRef> {
        self.key.as_ref()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no accounts available from any source (tried: {})", tried.join(", "))]
    Empty { tried: Vec<&'static str> },
    #[error("invalid worker assignment {worker_index}/{total_workers}")]
    InvalidAssignment { worker_index: usize, total_workers: usize },
}

/// The accounts discovered for this run, in discovery order.
#[derive(Debug, Clone)]
pub struct AccountPool {
    accounts: Vec<Account>,
    source: &'static str,
}

impl AccountPool {
    /// Try each discovery strategy in order and keep the first non-empty result.
    pub async fn initialize(strategies: &[Box<dyn AccountDiscovery>]) -> Result<Self, PoolError> {
        let mut tried = Vec::with_capacity(strategies.len());
        for strategy in strategies {
            tried.push(strategy.name());
            match strategy.discover().await {
                Ok(accounts) if !accounts.is_empty() => {
                    let pool = Self::from_accounts(strategy.name(), accounts);
                    info!(
                        target: "ssi_bench::account",
                        source = pool.source,
                        accounts = pool.len(),
                        "account pool initialised"
                    );
                    return Ok(pool);
                }
                Ok(_) => {
                    warn!(target: "ssi_bench::account", source = strategy.name(), "source returned no accounts");
                }
                Err(err) => {
                    warn!(target: "ssi_bench::account", source = strategy.name(), %err, "account source failed");
                }
            }
        }
        Err(PoolError::Empty { tried })
    }

    /// Build a pool directly, dropping duplicate addresses but keeping order.
    pub fn from_accounts(source: &'static str, accounts: Vec<Account>) -> Self {
        let mut unique: Vec<Account> = Vec::with_capacity(accounts.len());
        for account in accounts {
            match unique.iter_mut().find(|known| known.address == account.address) {
                Some(known) => {
                    if known.key.is_none() {
                        known.key = account.key;
                    }
                }
                None => unique.push(account),
            }
        }
        Self {
            accounts: unique,
            source,
        }
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Local signer over every account that carries a key.
    pub fn local_signer(&self) -> Result<LocalKeySigner, SignerError> {
        let mut signer = LocalKeySigner::default();
        for key in self.accounts.iter().filter_map(Account::key) {
            signer.insert(parse_private_key(key.expose())?);
        }
        Ok(signer)
    }

    /// Accounts whose index satisfies `index % total_workers == worker_index`.
    ///
    /// With more workers than accounts, the surplus workers share
    /// `accounts[worker_index % len]` with a lower-indexed worker.
    pub fn assign(&mut self, worker_index: usize, total_workers: usize) -> Result<WorkerAccounts, PoolError> {
        if total_workers == 0 || worker_index >= total_workers {
            return Err(PoolError::InvalidAssignment {
                worker_index,
                total_workers,
            });
        }
        if self.accounts.is_empty() {
            return Err(PoolError::Empty { tried: vec![self.source] });
        }

        let mut assigned: Vec<Account> = Vec::new();
        for (index, account) in self.accounts.iter_mut().enumerate() {
            if index % total_workers == worker_index {
                account.leased = true;
                assigned.push(account.clone());
            }
        }

        let shared = assigned.is_empty();
        if shared {
            let account_count = self.accounts.len();
            let account = &mut self.accounts[worker_index % account_count];
            account.leased = true;
            assigned.push(account.clone());
            warn!(
                target: "ssi_bench::account",
                worker = worker_index,
                account = %account.address,
                "more workers than accounts, sharing an account"
            );
        }

        Ok(WorkerAccounts {
            accounts: assigned,
            cursor: 0,
            shared,
        })
    }
}

/// The accounts leased to one worker, handed out round-robin.
#[derive(Debug, Clone)]
pub struct WorkerAccounts {
    accounts: Vec<Account>,
    cursor: usize,
    shared: bool,
}

impl WorkerAccounts {
    /// Next account in round-robin order. Never empty by construction.
    pub fn next(&mut self) -> &Account {
        let index = self.cursor % self.accounts.len();
        self.cursor = self.cursor.wrapping_add(1);
        &self.accounts[index]
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn first(&self) -> &Account {
        &self.accounts[0]
    }

    /// True when the account is also leased to another worker.
    pub fn is_shared(&self) -> bool {
        self.shared
    }
}
