//! Per-account nonce cache with resync on conflict.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use alloy_primitives::Address;
use tracing::{debug, info, warn};

use crate::{
    ledger::{BlockTag, LedgerRpc},
    rpc::RpcError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceState {
    Uninitialized,
    /// Value matches the ledger's pending count as of the last fetch.
    Synced,
    /// Value was advanced locally past the last fetch.
    Ahead,
    /// A conflict was reported and a resync is underway.
    Conflicted,
}

#[derive(Debug, Clone)]
pub struct NonceRecord {
    pub address: Address,
    pub value: u64,
    pub last_synced_at: Instant,
    pub state: NonceState,
}

impl NonceRecord {
    fn synced(address: Address, value: u64) -> Self {
        Self {
            address,
            value,
            last_synced_at: Instant::now(),
            state: NonceState::Synced,
        }
    }
}

/// Nonce cache shared by every dispatcher of one worker.
///
/// The record map is locked only for in-memory reads and writes; ledger
/// queries happen with the lock released.
#[derive(Clone)]
pub struct NonceLedger {
    ledger: Arc<dyn LedgerRpc>,
    records: Arc<Mutex<HashMap<Address, NonceRecord>>>,
    resyncs: Arc<AtomicU64>,
}

impl NonceLedger {
    pub fn new(ledger: Arc<dyn LedgerRpc>) -> Self {
        Self {
            ledger,
            records: Arc::default(),
            resyncs: Arc::default(),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<Address, NonceRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next nonce to use for `address`, fetched from the ledger on first use.
    pub async fn get(&self, address: Address) -> Result<u64, RpcError> {
        if let Some(record) = self.records().get(&address) {
            return Ok(record.value);
        }

        let fetched = self.fetch(address).await?;
        let mut records = self.records();
        // Another task may have initialised the record while we were fetching.
        let record = records
            .entry(address)
            .or_insert_with(|| NonceRecord::synced(address, fetched));
        info!(target: "ssi_bench::nonce", %address, nonce = record.value, "initialised nonce");
        Ok(record.value)
    }

    /// Record that the ledger accepted a transaction at the cached nonce.
    pub fn advance(&self, address: Address) {
        let mut records = self.records();
        match records.get_mut(&address) {
            Some(record) => {
                record.value += 1;
                record.state = NonceState::Ahead;
                debug!(target: "ssi_bench::nonce", %address, next = record.value, "advanced nonce");
            }
            None => warn!(target: "ssi_bench::nonce", %address, "advance on untracked account"),
        }
    }

    /// Discard the cached value and reload it from the ledger's pending count.
    pub async fn resync(&self, address: Address) -> Result<u64, RpcError> {
        if let Some(record) = self.records().get_mut(&address) {
            record.state = NonceState::Conflicted;
        }

        let fetched = self.fetch(address).await?;
        self.resyncs.fetch_add(1, Ordering::Relaxed);

        let mut records = self.records();
        let previous = records.insert(address, NonceRecord::synced(address, fetched));
        info!(
            target: "ssi_bench::nonce",
            %address,
            previous = previous.map(|record| record.value),
            nonce = fetched,
            "resynced nonce"
        );
        Ok(fetched)
    }

    pub fn state(&self, address: Address) -> NonceState {
        self.records()
            .get(&address)
            .map_or(NonceState::Uninitialized, |record| record.state)
    }

    pub fn record(&self, address: Address) -> Option<NonceRecord> {
        self.records().get(&address).cloned()
    }

    /// Number of resyncs performed since creation.
    pub fn resync_count(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }

    async fn fetch(&self, address: Address) -> Result<u64, RpcError> {
        match self.ledger.transaction_count(address, BlockTag::Pending).await {
            Ok(nonce) => Ok(nonce),
            Err(err @ RpcError::Transport { .. }) => Err(err),
            Err(err) => {
                warn!(
                    target: "ssi_bench::nonce",
                    %address,
                    %err,
                    "pending block tag not supported, falling back to latest"
                );
                self.ledger.transaction_count(address, BlockTag::Latest).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nullables::NullLedger;

    fn ledger() -> Arc<NullLedger> {
        Arc::new(NullLedger::deployed())
    }

    #[tokio::test]
    async fn first_get_reads_pending_count() {
        let null = ledger();
        let account = Address::repeat_byte(4);
        null.set_nonce(account, 9);
        let nonces = NonceLedger::new(null.clone());

        assert_eq!(nonces.state(account), NonceState::Uninitialized);
        assert_eq!(nonces.get(account).await.unwrap(), 9);
        assert_eq!(nonces.get(account).await.unwrap(), 9);
        assert_eq!(null.count("eth_getTransactionCount"), 1);
        assert_eq!(nonces.state(account), NonceState::Synced);
    }

    #[tokio::test]
    async fn advance_is_local() {
        let null = ledger();
        let account = Address::repeat_byte(5);
        let nonces = NonceLedger::new(null.clone());
        nonces.get(account).await.unwrap();
        nonces.advance(account);
        nonces.advance(account);

        assert_eq!(nonces.get(account).await.unwrap(), 2);
        assert_eq!(nonces.state(account), NonceState::Ahead);
        assert_eq!(null.count("eth_getTransactionCount"), 1);
    }

    #[tokio::test]
    async fn resync_overwrites_cached_value() {
        let null = ledger();
        let account = Address::repeat_byte(6);
        let nonces = NonceLedger::new(null.clone());
        nonces.get(account).await.unwrap();
        nonces.advance(account);
        null.set_nonce(account, 17);

        assert_eq!(nonces.resync(account).await.unwrap(), 17);
        assert_eq!(nonces.get(account).await.unwrap(), 17);
        assert_eq!(nonces.state(account), NonceState::Synced);
        assert_eq!(nonces.resync_count(), 1);
    }

    #[tokio::test]
    async fn pending_tag_falls_back_to_latest() {
        let null = ledger();
        null.reject_pending_tag();
        let account = Address::repeat_byte(7);
        null.set_nonce(account, 3);
        let nonces = NonceLedger::new(null.clone());

        assert_eq!(nonces.get(account).await.unwrap(), 3);
        assert_eq!(null.count("eth_getTransactionCount"), 2);
    }

    #[tokio::test]
    async fn unreachable_ledger_is_reported() {
        let null = ledger();
        null.fail_next(10);
        let nonces = NonceLedger::new(null.clone());
        let err = nonces.get(Address::repeat_byte(8)).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport { .. }));
        assert_eq!(nonces.state(Address::repeat_byte(8)), NonceState::Uninitialized);
    }
}
