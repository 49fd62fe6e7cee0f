use std::collections::HashMap;

use alloy_consensus::TypedTransaction;
use alloy_primitives::{Address, Bytes, TxKind, U256};
use alloy_rpc_types_eth::{TransactionInput, TransactionRequest as RpcTransactionRequest};
use once_cell::sync::Lazy;

use crate::contracts::{ContractCall, ContractName};

/// Used when neither the request nor the configuration names a gas limit.
pub const FALLBACK_GAS_LIMIT: u64 = 200_000;

/// 10 gwei.
pub const FALLBACK_GAS_PRICE: u128 = 10_000_000_000;

static FALLBACK_GAS_LIMITS: Lazy<HashMap<&'static str, u64>> = Lazy::new(|| {
    HashMap::from([
        ("assignRole", 200_000),
        ("revokeRole", 80_000),
        ("createDid", 165_000),
        ("updateDid", 65_000),
        ("deactivateDid", 50_000),
        ("issueCredential", 150_000),
        ("updateCredentialStatus", 75_000),
        ("getRole", 50_000),
        ("hasRole", 50_000),
        ("getRoleCount", 50_000),
        ("resolveDid", 50_000),
        ("resolveCredential", 50_000),
    ])
});

/// Hardcoded per-method gas limit.
pub fn fallback_gas_limit(method: &str) -> u64 {
    FALLBACK_GAS_LIMITS
        .get(method)
        .copied()
        .unwrap_or(FALLBACK_GAS_LIMIT)
}

/// One contract call to be dispatched from `from`.
///
/// Everything but the nonce is fixed once built; the dispatcher assigns the nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    call: ContractCall,
    from: Address,
    read_only: bool,
    gas_limit: Option<u64>,
    gas_price: Option<u128>,
    nonce: Option<u64>,
}

impl TransactionRequest {
    pub fn new(call: ContractCall, from: Address) -> Self {
        let read_only = call.is_read_only();
        Self {
            call,
            from,
            read_only,
            gas_limit: None,
            gas_price: None,
            nonce: None,
        }
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }

    pub fn with_gas_price(mut self, gas_price: u128) -> Self {
        self.gas_price = Some(gas_price);
        self
    }

    pub fn call(&self) -> &ContractCall {
        &self.call
    }

    pub fn contract(&self) -> ContractName {
        self.call.contract()
    }

    pub fn method(&self) -> &'static str {
        self.call.method()
    }

    pub fn from(&self) -> Address {
        self.from
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn gas_limit(&self) -> Option<u64> {
        self.gas_limit
    }

    pub fn gas_price(&self) -> Option<u128> {
        self.gas_price
    }

    pub fn nonce(&self) -> Option<u64> {
        self.nonce
    }

    pub(crate) fn assign_nonce(&mut self, nonce: u64) {
        self.nonce = Some(nonce);
    }
}

/// Fully resolved legacy transaction, ready for a signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub chain_id: u64,
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: u128,
    pub value: U256,
    pub input: Bytes,
}

impl UnsignedTransaction {
    /// Typed form for local signing. Gas price without an access list yields a legacy tx.
    pub fn typed(&self) -> Option<TypedTransaction> {
        tx(self).build_typed_tx().ok()
    }
}

/// Builds a legacy transaction request.
fn tx(unsigned: &UnsignedTransaction) -> RpcTransactionRequest {
    RpcTransactionRequest {
        from: Some(unsigned.from),
        nonce: Some(unsigned.nonce),
        value: Some(unsigned.value),
        to: Some(TxKind::Call(unsigned.to)),
        gas: Some(unsigned.gas_limit),
        gas_price: Some(unsigned.gas_price),
        chain_id: Some(unsigned.chain_id),
        input: TransactionInput {
            input: Some(unsigned.input.clone()),
            data: None,
        },
        ..Default::default()
    }
}
