//! Turns a [`TransactionRequest`] into a confirmed receipt or a decoded read.

use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    config::{BenchConfig, GasConfig, ReceiptPolicy, RetryPolicy},
    contracts::{CallOutput, ContractAddresses, ContractCall},
    error::{DispatchError, DispatchErrorKind, ErrorClass},
    ledger::{CallRequest, LedgerRpc, Receipt},
    nonce::NonceLedger,
    signer::TransactionSigner,
    transaction::{FALLBACK_GAS_PRICE, TransactionRequest, UnsignedTransaction, fallback_gas_limit},
};

/// Knobs the dispatcher reads on every call.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub chain_id: u64,
    pub contracts: ContractAddresses,
    pub gas: GasConfig,
    pub retry: RetryPolicy,
    pub receipt: ReceiptPolicy,
    pub estimate_gas: bool,
}

impl DispatchSettings {
    pub fn from_config(config: &BenchConfig) -> Self {
        Self {
            chain_id: config.chain_id,
            contracts: config.contracts,
            gas: config.gas.clone(),
            retry: config.retry,
            receipt: config.receipt,
            estimate_gas: config.estimate_gas,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Read(CallOutput),
    Confirmed(Receipt),
}

impl DispatchOutcome {
    pub fn receipt(&self) -> Option<&Receipt> {
        match self {
            Self::Confirmed(receipt) => Some(receipt),
            Self::Read(_) => None,
        }
    }

    pub fn output(&self) -> Option<&CallOutput> {
        match self {
            Self::Read(output) => Some(output),
            Self::Confirmed(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    ledger: Arc<dyn LedgerRpc>,
    nonces: NonceLedger,
    signer: Arc<dyn TransactionSigner>,
    fallback: Option<Arc<dyn TransactionSigner>>,
    settings: Arc<DispatchSettings>,
}

impl Dispatcher {
    pub fn new(
        ledger: Arc<dyn LedgerRpc>,
        nonces: NonceLedger,
        signer: Arc<dyn TransactionSigner>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            ledger,
            nonces,
            signer,
            fallback: None,
            settings: Arc::new(settings),
        }
    }

    /// Signer tried once after the primary path is exhausted.
    pub fn with_fallback(mut self, fallback: Option<Arc<dyn TransactionSigner>>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerRpc> {
        &self.ledger
    }

    pub fn nonces(&self) -> &NonceLedger {
        &self.nonces
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Read-only call from `from`, decoded.
    pub async fn read(&self, call: ContractCall, from: Address) -> Result<CallOutput, DispatchError> {
        let mut request = TransactionRequest::new(call, from);
        match self.dispatch(&mut request).await? {
            DispatchOutcome::Read(output) => Ok(output),
            DispatchOutcome::Confirmed(_) => Err(self.fail(
                &request,
                1,
                DispatchErrorKind::Encoding("write method used as a read".into()),
            )),
        }
    }

    /// State-changing call from `from`, confirmed.
    pub async fn send(&self, call: ContractCall, from: Address) -> Result<Receipt, DispatchError> {
        let mut request = TransactionRequest::new(call, from);
        match self.dispatch(&mut request).await? {
            DispatchOutcome::Confirmed(receipt) => Ok(receipt),
            DispatchOutcome::Read(_) => Err(self.fail(
                &request,
                1,
                DispatchErrorKind::Encoding("read method used as a transaction".into()),
            )),
        }
    }

    /// Dispatch `request`, filling in its nonce.
    ///
    /// Connectivity failures and nonce conflicts are retried up to the policy's
    /// attempt count with linear backoff; a nonce conflict triggers at most one
    /// resync per call. Reverts and receipt timeouts are returned at once.
    pub async fn dispatch(&self, request: &mut TransactionRequest) -> Result<DispatchOutcome, DispatchError> {
        if request.is_read_only() {
            return self.call(request).await;
        }

        let max_attempts = self.settings.retry.attempts();
        let mut attempts = 0;
        let mut resynced = false;
        let mut last_error = None;

        while attempts < max_attempts {
            attempts += 1;
            let kind = match self.submit(request, self.signer.as_ref()).await {
                Ok(receipt) => return Ok(DispatchOutcome::Confirmed(receipt)),
                Err(kind) => kind,
            };

            match kind.class() {
                ErrorClass::NonceConflict if !resynced => {
                    resynced = true;
                    warn!(
                        target: "ssi_bench::dispatch",
                        account = %request.from(),
                        attempt = attempts,
                        %kind,
                        "nonce conflict, resyncing"
                    );
                    if let Err(err) = self.nonces.resync(request.from()).await {
                        return Err(self.fail(request, attempts, DispatchErrorKind::from_rpc(err)));
                    }
                }
                ErrorClass::Connectivity => {
                    warn!(
                        target: "ssi_bench::dispatch",
                        method = request.method(),
                        attempt = attempts,
                        %kind,
                        "ledger unreachable"
                    );
                }
                ErrorClass::SignerUnavailable => {
                    last_error = Some(kind);
                    break;
                }
                _ => return Err(self.fail(request, attempts, kind)),
            }
            last_error = Some(kind);

            if attempts < max_attempts {
                sleep(self.settings.retry.delay_after(attempts)).await;
            }
        }

        if let Some(fallback) = &self.fallback {
            attempts += 1;
            info!(
                target: "ssi_bench::dispatch",
                method = request.method(),
                signer = fallback.name(),
                "primary path exhausted, trying fallback signer"
            );
            return match self.submit(request, fallback.as_ref()).await {
                Ok(receipt) => Ok(DispatchOutcome::Confirmed(receipt)),
                Err(kind) => Err(self.fail(request, attempts, kind)),
            };
        }

        let kind = last_error.unwrap_or_else(|| DispatchErrorKind::Encoding("no attempt was made".into()));
        Err(self.fail(request, attempts, kind))
    }

    async fn submit(
        &self,
        request: &mut TransactionRequest,
        signer: &dyn TransactionSigner,
    ) -> Result<Receipt, DispatchErrorKind> {
        let from = request.from();
        let to = self.settings.contracts.address_of(request.contract());
        let input = request.call().calldata();

        let nonce = self.nonces.get(from).await.map_err(DispatchErrorKind::from_rpc)?;
        request.assign_nonce(nonce);

        let mut gas_limit = self.gas_limit(request);
        if self.settings.estimate_gas {
            let preflight = CallRequest {
                from: Some(from),
                to,
                data: input.clone(),
                gas: None,
            };
            let estimate = self
                .ledger
                .estimate_gas(&preflight)
                .await
                .map_err(DispatchErrorKind::from_preflight)?;
            gas_limit = gas_limit.max(estimate);
        }

        let gas_price = self.gas_price(request).await;
        let unsigned = UnsignedTransaction {
            chain_id: self.settings.chain_id,
            from,
            to,
            nonce,
            gas_limit,
            gas_price,
            value: U256::ZERO,
            input,
        };
        let raw = signer.sign(&unsigned).await?;

        let hash = self
            .ledger
            .send_raw_transaction(&raw)
            .await
            .map_err(DispatchErrorKind::from_rpc)?;
        self.nonces.advance(from);
        debug!(
            target: "ssi_bench::dispatch",
            %hash,
            method = request.method(),
            %from,
            nonce,
            gas_limit,
            "transaction accepted"
        );

        let receipt = self.await_receipt(hash).await?;
        if !receipt.success {
            return Err(DispatchErrorKind::Revert(format!(
                "transaction {hash} reverted in block {}",
                receipt.block_number.map_or_else(|| "?".to_string(), |n| n.to_string())
            )));
        }
        Ok(receipt)
    }

    async fn call(&self, request: &TransactionRequest) -> Result<DispatchOutcome, DispatchError> {
        let call = CallRequest {
            from: Some(request.from()),
            to: self.settings.contracts.address_of(request.contract()),
            data: request.call().calldata(),
            gas: None,
        };
        let max_attempts = self.settings.retry.attempts();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let kind = match self.ledger.call(&call).await {
                Ok(data) => match request.call().decode_output(&data) {
                    Ok(Some(output)) => return Ok(DispatchOutcome::Read(output)),
                    Ok(None) => DispatchErrorKind::Encoding(format!("{} has no return value", request.method())),
                    Err(err) => DispatchErrorKind::Encoding(err.to_string()),
                },
                Err(err) => DispatchErrorKind::from_rpc(err),
            };
            if kind.class() == ErrorClass::Connectivity && attempts < max_attempts {
                sleep(self.settings.retry.delay_after(attempts)).await;
                continue;
            }
            return Err(self.fail(request, attempts, kind));
        }
    }

    async fn await_receipt(&self, hash: B256) -> Result<Receipt, DispatchErrorKind> {
        let polls = self.settings.receipt.poll_attempts.max(1);
        for poll in 1..=polls {
            match self.ledger.transaction_receipt(hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(err) => debug!(target: "ssi_bench::dispatch", %hash, poll, %err, "receipt poll failed"),
            }
            if poll < polls {
                sleep(self.settings.receipt.poll_interval()).await;
            }
        }
        Err(DispatchErrorKind::ReceiptTimeout { hash, polls })
    }

    /// Request value, else configured per-method limit, else the built-in table.
    fn gas_limit(&self, request: &TransactionRequest) -> u64 {
        request
            .gas_limit()
            .or_else(|| self.settings.gas.limits.get(request.method()).copied())
            .unwrap_or_else(|| fallback_gas_limit(request.method()))
    }

    /// Request value, else configured default, else the node's `eth_gasPrice`, else the built-in price.
    async fn gas_price(&self, request: &TransactionRequest) -> u128 {
        if let Some(price) = request.gas_price().or(self.settings.gas.default_price) {
            return price;
        }
        match self.ledger.gas_price().await {
            Ok(price) => price,
            Err(err) => {
                warn!(target: "ssi_bench::dispatch", %err, fallback = FALLBACK_GAS_PRICE, "could not read gas price");
                FALLBACK_GAS_PRICE
            }
        }
    }

    fn fail(&self, request: &TransactionRequest, attempts: u32, kind: DispatchErrorKind) -> DispatchError {
        let err = DispatchError {
            contract: request.contract(),
            method: request.method(),
            account: request.from(),
            attempts,
            kind,
        };
        warn!(target: "ssi_bench::dispatch", class = %err.class(), %err, "dispatch failed");
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        contracts::Role,
        nullables::{NullLedger, NullSigner},
        signer::LocalKeySigner,
    };
    use alloy_signer_local::PrivateKeySigner;

    struct Harness {
        ledger: Arc<NullLedger>,
        account: Address,
        local: Arc<NullSigner>,
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            chain_id: NullLedger::CHAIN_ID,
            contracts: NullLedger::CONTRACTS,
            gas: GasConfig::default(),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
            },
            receipt: ReceiptPolicy {
                poll_attempts: 3,
                poll_interval_ms: 1,
            },
            estimate_gas: true,
        }
    }

    fn harness() -> Harness {
        let key = PrivateKeySigner::random();
        let account = key.address();
        Harness {
            ledger: Arc::new(NullLedger::deployed()),
            account,
            local: Arc::new(NullSigner::delegating(LocalKeySigner::new([key]))),
        }
    }

    impl Harness {
        fn dispatcher(&self, settings: DispatchSettings) -> Dispatcher {
            Dispatcher::new(
                self.ledger.clone(),
                NonceLedger::new(self.ledger.clone()),
                self.local.clone(),
                settings,
            )
        }
    }

    fn create_did(n: u32) -> ContractCall {
        ContractCall::CreateDid {
            did: format!("did:ssi:w1-{n}"),
            public_key: B256::repeat_byte(1),
            service_endpoint: format!("https://w1.example/{n}"),
            role: Role::Holder,
        }
    }

    #[tokio::test]
    async fn write_advances_nonce_after_acceptance() {
        let h = harness();
        let dispatcher = h.dispatcher(settings());

        let mut request = TransactionRequest::new(create_did(1), h.account);
        let outcome = dispatcher.dispatch(&mut request).await.unwrap();

        assert!(outcome.receipt().unwrap().success);
        assert_eq!(request.nonce(), Some(0));
        assert_eq!(dispatcher.nonces().get(h.account).await.unwrap(), 1);
        assert_eq!(h.ledger.nonce_of(h.account), 1);
    }

    #[tokio::test]
    async fn reads_bypass_nonce_and_signer() {
        let h = harness();
        let dispatcher = h.dispatcher(settings());

        let output = dispatcher
            .read(ContractCall::GetRole { account: h.account }, h.account)
            .await
            .unwrap();

        assert_eq!(output.as_role(), Some(Role::None));
        assert_eq!(h.ledger.count("eth_getTransactionCount"), 0);
        assert_eq!(h.local.sign_count(), 0);
    }

    #[tokio::test]
    async fn preflight_revert_is_not_sent() {
        let h = harness();
        let dispatcher = h.dispatcher(settings());

        let err = dispatcher
            .send(
                ContractCall::DeactivateDid {
                    did: "did:ssi:missing".into(),
                },
                h.account,
            )
            .await
            .unwrap_err();

        assert_eq!(err.class(), ErrorClass::Revert);
        assert_eq!(err.attempts, 1);
        assert!(err.to_string().contains("DID not found"), "{err}");
        assert_eq!(h.ledger.count("eth_sendRawTransaction"), 0);
        assert_eq!(h.local.sign_count(), 0);
    }

    #[tokio::test]
    async fn nonce_conflict_resyncs_once_and_succeeds() {
        let h = harness();
        let dispatcher = h.dispatcher(settings());
        dispatcher.send(create_did(1), h.account).await.unwrap();

        h.ledger.bump_nonce(h.account, 2);
        dispatcher.send(create_did(2), h.account).await.unwrap();

        assert_eq!(dispatcher.nonces().resync_count(), 1);
        assert_eq!(h.ledger.nonce_of(h.account), 4);
        assert_eq!(h.ledger.dids().len(), 2);
    }

    #[tokio::test]
    async fn persistent_nonce_conflict_is_surfaced() {
        let h = harness();
        let dispatcher = h.dispatcher(settings());
        h.ledger.reject_sends_with_nonce_error(10);

        let err = dispatcher.send(create_did(1), h.account).await.unwrap_err();

        assert_eq!(err.class(), ErrorClass::NonceConflict);
        assert_eq!(err.attempts, 2);
        assert_eq!(dispatcher.nonces().resync_count(), 1);
    }

    #[tokio::test]
    async fn connectivity_is_retried_within_bounds() {
        let h = harness();
        let dispatcher = h.dispatcher(settings());
        h.ledger.fail_sends(2);
        dispatcher.send(create_did(1), h.account).await.unwrap();
        assert_eq!(h.ledger.count("eth_sendRawTransaction"), 3);

        h.ledger.fail_sends(10);
        let err = dispatcher.send(create_did(2), h.account).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Connectivity);
        assert_eq!(err.attempts, 3);
        assert_eq!(h.ledger.count("eth_sendRawTransaction"), 6);
    }

    #[tokio::test]
    async fn unavailable_signer_uses_fallback_once() {
        let h = harness();
        let primary = Arc::new(NullSigner::unavailable());
        let dispatcher = Dispatcher::new(
            h.ledger.clone(),
            NonceLedger::new(h.ledger.clone()),
            primary.clone(),
            settings(),
        )
        .with_fallback(Some(h.local.clone() as Arc<dyn TransactionSigner>));

        dispatcher.send(create_did(1), h.account).await.unwrap();

        assert_eq!(primary.sign_count(), 1);
        assert_eq!(h.local.sign_count(), 1);
    }

    #[tokio::test]
    async fn unavailable_signer_without_fallback_fails() {
        let h = harness();
        let dispatcher = Dispatcher::new(
            h.ledger.clone(),
            NonceLedger::new(h.ledger.clone()),
            Arc::new(NullSigner::unavailable()),
            settings(),
        );
        let err = dispatcher.send(create_did(1), h.account).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::SignerUnavailable);
        assert_eq!(h.ledger.count("eth_sendRawTransaction"), 0);
    }

    #[tokio::test]
    async fn receipt_timeout_is_not_retried() {
        let h = harness();
        let dispatcher = h.dispatcher(settings());
        h.ledger.withhold_receipts(true);

        let err = dispatcher.send(create_did(1), h.account).await.unwrap_err();

        assert_eq!(err.class(), ErrorClass::ReceiptTimeout);
        assert_eq!(h.ledger.count("eth_sendRawTransaction"), 1);
        assert_eq!(h.ledger.count("eth_getTransactionReceipt"), 3);
        assert_eq!(dispatcher.nonces().get(h.account).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn mined_revert_consumes_nonce_without_retry() {
        let h = harness();
        let dispatcher = h.dispatcher(DispatchSettings {
            estimate_gas: false,
            ..settings()
        });

        let err = dispatcher
            .send(
                ContractCall::UpdateDid {
                    did: "did:ssi:missing".into(),
                    public_key: B256::ZERO,
                    service_endpoint: String::new(),
                },
                h.account,
            )
            .await
            .unwrap_err();

        assert_eq!(err.class(), ErrorClass::Revert);
        assert_eq!(h.ledger.count("eth_sendRawTransaction"), 1);
        assert_eq!(h.ledger.nonce_of(h.account), 1);
    }

    #[tokio::test]
    async fn gas_limit_precedence() {
        let h = harness();
        let mut settings = settings();
        settings.gas.limits.insert("createDid".into(), 300_000);
        let dispatcher = h.dispatcher(settings);

        let configured = TransactionRequest::new(create_did(1), h.account);
        assert_eq!(dispatcher.gas_limit(&configured), 300_000);
        let explicit = TransactionRequest::new(create_did(1), h.account).with_gas_limit(90_000);
        assert_eq!(dispatcher.gas_limit(&explicit), 90_000);
        let table = TransactionRequest::new(
            ContractCall::DeactivateDid { did: "x".into() },
            h.account,
        );
        assert_eq!(dispatcher.gas_limit(&table), 50_000);
    }

    #[tokio::test]
    async fn gas_price_precedence() {
        let h = harness();
        h.ledger.set_gas_price(7);
        let request = TransactionRequest::new(create_did(1), h.account);
        let dispatcher = h.dispatcher(settings());

        let explicit = TransactionRequest::new(create_did(1), h.account).with_gas_price(42);
        assert_eq!(dispatcher.gas_price(&explicit).await, 42);
        assert_eq!(h.ledger.count("eth_gasPrice"), 0);

        assert_eq!(dispatcher.gas_price(&request).await, 7);
        assert_eq!(h.ledger.count("eth_gasPrice"), 1);

        h.ledger.fail_next(1);
        assert_eq!(dispatcher.gas_price(&request).await, FALLBACK_GAS_PRICE);

        let mut configured = settings();
        configured.gas.default_price = Some(3);
        assert_eq!(h.dispatcher(configured).gas_price(&request).await, 3);
        assert_eq!(h.ledger.count("eth_gasPrice"), 2);
    }

    #[tokio::test]
    async fn sent_transactions_use_node_gas_price() {
        let h = harness();
        h.ledger.set_gas_price(5);
        h.dispatcher(settings()).send(create_did(1), h.account).await.unwrap();

        assert_eq!(h.ledger.sent()[0].gas_price, 5);
    }
}
