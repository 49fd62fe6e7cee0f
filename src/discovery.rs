//! Sources the account pool is initialised from, tried in priority order.

use std::sync::Arc;

use alloy_primitives::{Address, address};
use async_trait::async_trait;

use crate::{
    account::{Account, KeyRef},
    config::AccountConfig,
    ledger::LedgerRpc,
    signer::TransactionSigner,
};

/// Addresses provisioned on the reference network; used only when every other source fails.
pub const EMERGENCY_ACCOUNTS: [Address; 6] = [
    address!("0x06d06c366b213f716b51bca6dc1874afc05467d0"),
    address!("0x2d501ff683a6dcb43b4b12cf334ea7a9692a9f1c"),
    address!("0x8dd478dee59d3b7c16a2e34cb5d321ed23d2677d"),
    address!("0xc9c913c8c3c1cd416d80a0abf475db2062f161f6"),
    address!("0x9b790656b9ec0db1936ed84b3bea605873558198"),
    address!("0xe43f47c497e0efc3fe96a85b2041aff2f0d317a5"),
];

#[derive(Debug, thiserror::Error)]
#[error("{source_name} unavailable: {reason}")]
pub struct NotAvailable {
    pub source_name: &'static str,
    pub reason: String,
}

#[async_trait]
pub trait AccountDiscovery: Send + Sync {
    fn name(&self) -> &'static str;

    async fn discover(&self) -> Result<Vec<Account>, NotAvailable>;
}

/// Accounts listed in the configuration file.
pub struct ConfiguredAccounts {
    accounts: Vec<AccountConfig>,
}

impl ConfiguredAccounts {
    pub fn new(accounts: Vec<AccountConfig>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl AccountDiscovery for ConfiguredAccounts {
    fn name(&self) -> &'static str {
        "configured"
    }

    async fn discover(&self) -> Result<Vec<Account>, NotAvailable> {
        Ok(self
            .accounts
            .iter()
            .map(|config| {
                let account = Account::new(config.address);
                match &config.private_key {
                    Some(key) => account.with_key(KeyRef::new(key.clone())),
                    None => account,
                }
            })
            .collect())
    }
}

/// Accounts unlocked on the node itself.
pub struct NodeAccounts {
    ledger: Arc<dyn LedgerRpc>,
}

impl NodeAccounts {
    pub fn new(ledger: Arc<dyn LedgerRpc>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl AccountDiscovery for NodeAccounts {
    fn name(&self) -> &'static str {
        "node"
    }

    async fn discover(&self) -> Result<Vec<Account>, NotAvailable> {
        let addresses = self.ledger.accounts().await.map_err(|err| NotAvailable {
            source_name: self.name(),
            reason: err.to_string(),
        })?;
        Ok(addresses.into_iter().map(Account::new).collect())
    }
}

/// Keys exposed by a remote signer.
pub struct SignerAccounts {
    signer: Arc<dyn TransactionSigner>,
}

impl SignerAccounts {
    pub fn new(signer: Arc<dyn TransactionSigner>) -> Self {
        Self { signer }
    }
}

#[async_trait]
impl AccountDiscovery for SignerAccounts {
    fn name(&self) -> &'static str {
        "signer"
    }

    async fn discover(&self) -> Result<Vec<Account>, NotAvailable> {
        let addresses = self.signer.list_accounts().await.map_err(|err| NotAvailable {
            source_name: self.name(),
            reason: err.to_string(),
        })?;
        Ok(addresses.into_iter().map(Account::new).collect())
    }
}

pub struct EmergencyAccounts;

#[async_trait]
impl AccountDiscovery for EmergencyAccounts {
    fn name(&self) -> &'static str {
        "emergency"
    }

    async fn discover(&self) -> Result<Vec<Account>, NotAvailable> {
        Ok(EMERGENCY_ACCOUNTS.into_iter().map(Account::new).collect())
    }
}

/// Default priority order: configuration, node, remote signer, emergency list.
pub fn default_strategies(
    configured: Vec<AccountConfig>,
    ledger: Arc<dyn LedgerRpc>,
    remote_signer: Option<Arc<dyn TransactionSigner>>,
) -> Vec<Box<dyn AccountDiscovery>> {
    let mut strategies: Vec<Box<dyn AccountDiscovery>> = vec![
        Box::new(ConfiguredAccounts::new(configured)),
        Box::new(NodeAccounts::new(ledger)),
    ];
    if let Some(signer) = remote_signer {
        strategies.push(Box::new(SignerAccounts::new(signer)));
    }
    strategies.push(Box::new(EmergencyAccounts));
    strategies
}
