//! In-memory ledger and signer that behave like the real ones, for tests and dry runs.
//!
//! [`NullLedger`] decodes signed transactions, enforces exact nonces and runs a
//! small model of the three contracts. Faults can be injected per method.

use std::{
    collections::{BTreeMap, HashMap},
    io,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use alloy_consensus::{Transaction, TxEnvelope, transaction::SignerRecoverable};
use alloy_eips::eip2718::Decodable2718;
use alloy_primitives::{Address, B256, Bytes, U256, address, keccak256};
use alloy_sol_types::{SolInterface, SolValue};
use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::{
    config::{BenchConfig, ReceiptPolicy, RetryPolicy},
    contracts::{
        ContractAddresses, ContractName, CredentialRecord, CredentialRegistry::CredentialRegistryCalls, CredentialStatus,
        DidRecord, DidRegistry::DidRegistryCalls, Role, RoleControl::RoleControlCalls,
    },
    ledger::{BlockTag, CallRequest, LedgerRpc, Receipt},
    rpc::RpcError,
    signer::{LocalKeySigner, SignerError, TransactionSigner},
    transaction::UnsignedTransaction,
};

const ESTIMATED_GAS: u64 = 60_000;
const TRUSTEE: u8 = Role::Trustee as u8;

/// A transaction the ledger accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTransaction {
    pub hash: B256,
    pub from: Address,
    pub nonce: u64,
    pub gas_price: u128,
    pub contract: Option<ContractName>,
    /// Account argument of a role call.
    pub role_target: Option<Address>,
    pub success: bool,
}

#[derive(Default)]
struct NullState {
    roles: HashMap<Address, u8>,
    dids: BTreeMap<String, DidRecord>,
    credentials: BTreeMap<B256, CredentialRecord>,
    nonces: HashMap<Address, u64>,
    receipts: HashMap<B256, Receipt>,
    sent: Vec<SentTransaction>,
    calls: HashMap<&'static str, usize>,
    node_accounts: Vec<Address>,
    without_code: Vec<Address>,
    block: u64,
    gas_price: u128,
    fail_next: usize,
    fail_sends: usize,
    nonce_errors: usize,
    reject_pending: bool,
    withhold_receipts: bool,
}

impl NullState {
    fn role(&self, account: Address) -> u8 {
        self.roles.get(&account).copied().unwrap_or_default()
    }

    fn role_count(&self, role: u8) -> usize {
        self.roles.values().filter(|held| **held == role).count()
    }

    fn nonce(&self, account: Address) -> u64 {
        self.nonces.get(&account).copied().unwrap_or_default()
    }

    /// Run `input` against the contract at `to`. State changes only when `commit`.
    fn execute(
        &mut self,
        contracts: &ContractAddresses,
        from: Address,
        to: Address,
        input: &[u8],
        commit: bool,
    ) -> Result<Vec<u8>, String> {
        match contracts.contract_at(to) {
            Some(ContractName::RoleControl) => self.role_control(from, input, commit),
            Some(ContractName::DidRegistry) => self.did_registry(from, input, commit),
            Some(ContractName::CredentialRegistry) => self.credential_registry(input, commit),
            None => Ok(Vec::new()),
        }
    }

    fn role_control(&mut self, from: Address, input: &[u8], commit: bool) -> Result<Vec<u8>, String> {
        let call = RoleControlCalls::abi_decode(input).map_err(|err| err.to_string())?;
        let output = match call {
            RoleControlCalls::getRole(call) => {
                <alloy_sol_types::sol_data::Uint<8> as alloy_sol_types::SolType>::abi_encode(&self.role(call.account))
            }
            RoleControlCalls::hasRole(call) => (self.role(call.account) == call.role).abi_encode(),
            RoleControlCalls::getRoleCount(call) => U256::from(self.role_count(call.role)).abi_encode(),
            RoleControlCalls::assignRole(call) => {
                if matches!(Role::from_u8(call.role), None | Some(Role::None)) {
                    return Err("Invalid role".into());
                }
                // The first TRUSTEE may appoint itself.
                let first_trustee = self.role_count(TRUSTEE) == 0 && from == call.account && call.role == TRUSTEE;
                if self.role(from) != TRUSTEE && !first_trustee {
                    return Err("Caller is not a TRUSTEE".into());
                }
                if commit {
                    self.roles.insert(call.account, call.role);
                }
                Vec::new()
            }
            RoleControlCalls::revokeRole(call) => {
                if self.role(from) != TRUSTEE {
                    return Err("Caller is not a TRUSTEE".into());
                }
                if self.role(call.account) != call.role {
                    return Err("Account does not hold role".into());
                }
                if commit {
                    self.roles.remove(&call.account);
                }
                Vec::new()
            }
        };
        Ok(output)
    }

    fn did_registry(&mut self, from: Address, input: &[u8], commit: bool) -> Result<Vec<u8>, String> {
        let call = DidRegistryCalls::abi_decode(input).map_err(|err| err.to_string())?;
        match call {
            DidRegistryCalls::createDid(call) => {
                if self.dids.contains_key(&call.did) {
                    return Err("DID already exists".into());
                }
                if Role::from_u8(call.role).is_none() {
                    return Err("Invalid role".into());
                }
                if commit {
                    self.dids.insert(
                        call.did.clone(),
                        DidRecord {
                            did: call.did,
                            publicKey: call.publicKey,
                            serviceEndpoint: call.serviceEndpoint,
                            role: call.role,
                            active: true,
                            owner: from,
                        },
                    );
                }
                Ok(Vec::new())
            }
            DidRegistryCalls::updateDid(call) => {
                let record = active_did(&mut self.dids, &call.did)?;
                if commit {
                    record.publicKey = call.publicKey;
                    record.serviceEndpoint = call.serviceEndpoint;
                }
                Ok(Vec::new())
            }
            DidRegistryCalls::deactivateDid(call) => {
                let record = active_did(&mut self.dids, &call.did)?;
                if commit {
                    record.active = false;
                }
                Ok(Vec::new())
            }
            DidRegistryCalls::resolveDid(call) => self
                .dids
                .get(&call.did)
                .map(SolValue::abi_encode)
                .ok_or_else(|| "DID not found".to_string()),
        }
    }

    fn credential_registry(&mut self, input: &[u8], commit: bool) -> Result<Vec<u8>, String> {
        let call = CredentialRegistryCalls::abi_decode(input).map_err(|err| err.to_string())?;
        match call {
            CredentialRegistryCalls::issueCredential(call) => {
                if self.credentials.contains_key(&call.id) {
                    return Err("Credential already exists".into());
                }
                if !self.did_holds(&call.issuerDid, Role::Issuer) {
                    return Err("Issuer DID is not an active ISSUER".into());
                }
                if !self.did_holds(&call.holderDid, Role::Holder) {
                    return Err("Holder DID is not an active HOLDER".into());
                }
                if commit {
                    self.credentials.insert(
                        call.id,
                        CredentialRecord {
                            id: call.id,
                            issuerDid: call.issuerDid,
                            holderDid: call.holderDid,
                            credentialCid: call.credentialCid,
                            status: CredentialStatus::Active.as_u8(),
                        },
                    );
                }
                Ok(Vec::new())
            }
            CredentialRegistryCalls::updateCredentialStatus(call) => {
                if matches!(CredentialStatus::from_u8(call.status), None | Some(CredentialStatus::None)) {
                    return Err("Invalid status".into());
                }
                let record = self
                    .credentials
                    .get_mut(&call.id)
                    .ok_or_else(|| "Credential not found".to_string())?;
                if commit {
                    record.status = call.status;
                }
                Ok(Vec::new())
            }
            CredentialRegistryCalls::resolveCredential(call) => self
                .credentials
                .get(&call.id)
                .map(SolValue::abi_encode)
                .ok_or_else(|| "Credential not found".to_string()),
        }
    }

    fn did_holds(&self, did: &str, role: Role) -> bool {
        self.dids
            .get(did)
            .is_some_and(|record| record.active && record.role == role.as_u8())
    }
}

fn active_did<'a>(dids: &'a mut BTreeMap<String, DidRecord>, did: &str) -> Result<&'a mut DidRecord, String> {
    match dids.get_mut(did) {
        Some(record) if record.active => Ok(record),
        Some(_) => Err("DID is deactivated".into()),
        None => Err("DID not found".into()),
    }
}

fn transport(method: &str) -> RpcError {
    RpcError::Transport {
        method: method.into(),
        reason: "connection refused".into(),
    }
}

fn rpc_error(method: &str, code: i64, message: &str) -> RpcError {
    RpcError::Rpc {
        method: method.into(),
        code,
        message: message.into(),
        data: None,
    }
}

fn reverted(method: &str, reason: String) -> RpcError {
    RpcError::Rpc {
        method: method.into(),
        code: 3,
        message: "execution reverted".into(),
        data: Some(reason),
    }
}

/// An in-memory ledger with the three contracts deployed.
pub struct NullLedger {
    contracts: ContractAddresses,
    state: Mutex<NullState>,
}

impl NullLedger {
    pub const CHAIN_ID: u64 = 1337;

    pub const CONTRACTS: ContractAddresses = ContractAddresses {
        role_control: address!("0x0000000000000000000000000000000000001111"),
        did_registry: address!("0x0000000000000000000000000000000000003333"),
        credential_registry: address!("0x0000000000000000000000000000000000005555"),
    };

    /// A fresh ledger with the contracts at [`Self::CONTRACTS`].
    pub fn deployed() -> Self {
        Self::new(Self::CONTRACTS)
    }

    pub fn new(contracts: ContractAddresses) -> Self {
        Self {
            contracts,
            state: Mutex::new(NullState::default()),
        }
    }

    pub fn contracts(&self) -> ContractAddresses {
        self.contracts
    }

    fn lock(&self) -> MutexGuard<'_, NullState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call and apply any pending injected failure.
    fn enter(&self, method: &'static str) -> Result<MutexGuard<'_, NullState>, RpcError> {
        let mut state = self.lock();
        *state.calls.entry(method).or_default() += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(transport(method));
        }
        Ok(state)
    }

    // Setup and inspection.

    pub fn set_nonce(&self, account: Address, nonce: u64) {
        self.lock().nonces.insert(account, nonce);
    }

    pub fn set_gas_price(&self, price: u128) {
        self.lock().gas_price = price;
    }

    /// Advance the on-ledger nonce behind the client's back.
    pub fn bump_nonce(&self, account: Address, by: u64) {
        let mut state = self.lock();
        let next = state.nonce(account) + by;
        state.nonces.insert(account, next);
    }

    pub fn nonce_of(&self, account: Address) -> u64 {
        self.lock().nonce(account)
    }

    pub fn set_role(&self, account: Address, role: Role) {
        let mut state = self.lock();
        match role {
            Role::None => state.roles.remove(&account),
            role => state.roles.insert(account, role.as_u8()),
        };
    }

    pub fn role_of(&self, account: Address) -> u8 {
        self.lock().role(account)
    }

    pub fn set_node_accounts(&self, accounts: Vec<Address>) {
        self.lock().node_accounts = accounts;
    }

    /// Make `eth_getCode` report nothing deployed at `address`.
    pub fn remove_code(&self, address: Address) {
        self.lock().without_code.push(address);
    }

    /// Number of calls made to `method`, failed ones included.
    pub fn count(&self, method: &str) -> usize {
        self.lock().calls.get(method).copied().unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    pub fn dids(&self) -> Vec<DidRecord> {
        self.lock().dids.values().cloned().collect()
    }

    pub fn credentials(&self) -> Vec<CredentialRecord> {
        self.lock().credentials.values().cloned().collect()
    }

    pub fn sent(&self) -> Vec<SentTransaction> {
        self.lock().sent.clone()
    }

    /// Accepted RoleControl transactions whose account argument is `account`.
    pub fn role_grants_to(&self, account: Address) -> usize {
        self.lock()
            .sent
            .iter()
            .filter(|tx| tx.role_target == Some(account))
            .count()
    }

    // Fault injection.

    /// Fail the next `n` calls of any method with a transport error.
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// Fail the next `n` raw transaction submissions with a transport error.
    pub fn fail_sends(&self, n: usize) {
        self.lock().fail_sends = n;
    }

    /// Reject the next `n` submissions as if their nonce were stale.
    pub fn reject_sends_with_nonce_error(&self, n: usize) {
        self.lock().nonce_errors = n;
    }

    /// Answer `pending` nonce queries with an error, as some nodes do.
    pub fn reject_pending_tag(&self) {
        self.lock().reject_pending = true;
    }

    /// Accept transactions but never report a receipt while set.
    pub fn withhold_receipts(&self, withhold: bool) {
        self.lock().withhold_receipts = withhold;
    }

    fn simulate(&self, method: &'static str, call: &CallRequest) -> Result<Vec<u8>, RpcError> {
        let mut state = self.enter(method)?;
        let from = call.from.unwrap_or_default();
        state
            .execute(&self.contracts, from, call.to, &call.data, false)
            .map_err(|reason| reverted(method, reason))
    }
}

impl Default for NullLedger {
    fn default() -> Self {
        Self::deployed()
    }
}

#[async_trait]
impl LedgerRpc for NullLedger {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        self.enter("eth_chainId")?;
        Ok(Self::CHAIN_ID)
    }

    async fn accounts(&self) -> Result<Vec<Address>, RpcError> {
        let state = self.enter("eth_accounts")?;
        Ok(state.node_accounts.clone())
    }

    async fn transaction_count(&self, address: Address, tag: BlockTag) -> Result<u64, RpcError> {
        const METHOD: &str = "eth_getTransactionCount";
        let state = self.enter(METHOD)?;
        if state.reject_pending && tag == BlockTag::Pending {
            return Err(rpc_error(METHOD, -32602, "Invalid params: unsupported block tag"));
        }
        Ok(state.nonce(address))
    }

    async fn estimate_gas(&self, call: &CallRequest) -> Result<u64, RpcError> {
        self.simulate("eth_estimateGas", call)?;
        Ok(ESTIMATED_GAS)
    }

    async fn gas_price(&self) -> Result<u128, RpcError> {
        Ok(self.enter("eth_gasPrice")?.gas_price)
    }

    async fn call(&self, call: &CallRequest) -> Result<Bytes, RpcError> {
        self.simulate("eth_call", call).map(Bytes::from)
    }

    async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256, RpcError> {
        const METHOD: &str = "eth_sendRawTransaction";
        let mut state = self.enter(METHOD)?;
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(transport(METHOD));
        }

        let envelope = TxEnvelope::decode_2718(&mut raw.as_ref())
            .map_err(|err| rpc_error(METHOD, -32602, &format!("Invalid transaction: {err}")))?;
        let from = envelope
            .recover_signer()
            .map_err(|err| rpc_error(METHOD, -32000, &format!("Invalid signature: {err}")))?;
        if envelope.chain_id() != Some(Self::CHAIN_ID) {
            return Err(rpc_error(METHOD, -32000, "Invalid chain id"));
        }
        if state.nonce_errors > 0 {
            state.nonce_errors -= 1;
            return Err(rpc_error(METHOD, -32000, "Nonce too low"));
        }
        let expected = state.nonce(from);
        let nonce = envelope.nonce();
        if nonce < expected {
            return Err(rpc_error(METHOD, -32000, "Nonce too low"));
        }
        if nonce > expected {
            return Err(rpc_error(METHOD, -32000, "Nonce too high"));
        }

        let to = envelope.to().unwrap_or_default();
        let contract = self.contracts.contract_at(to);
        let role_target = match contract {
            Some(ContractName::RoleControl) => match RoleControlCalls::abi_decode(envelope.input()) {
                Ok(RoleControlCalls::assignRole(call)) => Some(call.account),
                Ok(RoleControlCalls::revokeRole(call)) => Some(call.account),
                _ => None,
            },
            _ => None,
        };

        // Reverted transactions are still mined and consume the nonce.
        state.nonces.insert(from, expected + 1);
        let success = state
            .execute(&self.contracts, from, to, envelope.input(), true)
            .is_ok();
        state.block += 1;

        let hash = keccak256(raw);
        let receipt = Receipt {
            transaction_hash: hash,
            block_number: Some(state.block),
            gas_used: ESTIMATED_GAS.min(envelope.gas_limit()),
            success,
        };
        state.receipts.insert(hash, receipt);
        state.sent.push(SentTransaction {
            hash,
            from,
            nonce,
            gas_price: envelope.gas_price().unwrap_or_default(),
            contract,
            role_target,
            success,
        });
        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<Receipt>, RpcError> {
        let state = self.enter("eth_getTransactionReceipt")?;
        if state.withhold_receipts {
            return Ok(None);
        }
        Ok(state.receipts.get(&hash).cloned())
    }

    async fn code(&self, address: Address) -> Result<Bytes, RpcError> {
        let state = self.enter("eth_getCode")?;
        let deployed = self.contracts.contract_at(address).is_some() && !state.without_code.contains(&address);
        Ok(if deployed {
            Bytes::from_static(&[0x60, 0x80, 0x60, 0x40])
        } else {
            Bytes::new()
        })
    }
}

/// A signer whose availability is chosen by the test.
pub struct NullSigner {
    inner: Option<LocalKeySigner>,
    accounts: Vec<Address>,
    signs: AtomicUsize,
}

impl NullSigner {
    /// Refuses every signature.
    pub fn unavailable() -> Self {
        Self {
            inner: None,
            accounts: Vec::new(),
            signs: AtomicUsize::new(0),
        }
    }

    /// Signs with `inner` and counts the requests.
    pub fn delegating(inner: LocalKeySigner) -> Self {
        Self {
            inner: Some(inner),
            ..Self::unavailable()
        }
    }

    /// Lists `accounts` but cannot sign for them.
    pub fn with_accounts(accounts: Vec<Address>) -> Self {
        Self {
            accounts,
            ..Self::unavailable()
        }
    }

    /// Signature requests received, refused ones included.
    pub fn sign_count(&self) -> usize {
        self.signs.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TransactionSigner for NullSigner {
    fn name(&self) -> &'static str {
        "null"
    }

    async fn sign(&self, tx: &UnsignedTransaction) -> Result<Bytes, SignerError> {
        self.signs.fetch_add(1, Ordering::Relaxed);
        match &self.inner {
            Some(inner) => inner.sign(tx).await,
            None => Err(SignerError::Unavailable {
                backend: self.name(),
                reason: "connection refused".into(),
            }),
        }
    }

    async fn list_accounts(&self) -> Result<Vec<Address>, SignerError> {
        match &self.inner {
            Some(inner) => inner.list_accounts().await,
            None => Ok(self.accounts.clone()),
        }
    }

    async fn health_check(&self) -> bool {
        self.inner.is_some()
    }
}

/// Configuration pointing at a [`NullLedger`], with short retry and receipt delays.
pub fn test_config() -> BenchConfig {
    BenchConfig {
        chain_id: NullLedger::CHAIN_ID,
        rpc_url: "null://ledger".into(),
        contracts: NullLedger::CONTRACTS,
        signer: Default::default(),
        fallback_signer: None,
        accounts: Vec::new(),
        privileged_account: None,
        gas: Default::default(),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
        },
        receipt: ReceiptPolicy {
            poll_attempts: 3,
            poll_interval_ms: 1,
        },
        workers: 1,
        iterations: 10,
        force_bootstrap: false,
        role_balance: Default::default(),
        operation_mix: Default::default(),
        estimate_gas: true,
    }
}

/// Local HTTP endpoint answering every request for a path with a fixed status and JSON body.
/// Paths not listed get 404. Runs until the runtime shuts down.
pub async fn serve_stub_http(routes: Vec<(&'static str, u16, String)>) -> io::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("http://{}", listener.local_addr()?);
    let routes: Arc<HashMap<&'static str, (u16, String)>> = Arc::new(
        routes
            .into_iter()
            .map(|(path, status, body)| (path, (status, body)))
            .collect(),
    );
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let routes = routes.clone();
            tokio::spawn(async move {
                let _ = answer_stub(stream, &routes).await;
            });
        }
    });
    Ok(url)
}

async fn answer_stub(mut stream: TcpStream, routes: &HashMap<&'static str, (u16, String)>) -> io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or_default();
    // Drain the body so the client never sees a reset.
    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let path = head.split_whitespace().nth(1).unwrap_or("/");
    let (status, body) = routes.get(path).cloned().unwrap_or((404, String::new()));
    let response = format!(
        "HTTP/1.1 {status} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// URL of a local port with nothing listening on it.
pub fn closed_local_url() -> io::Result<String> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let address = listener.local_addr()?;
    drop(listener);
    Ok(format!("http://{address}"))
}
