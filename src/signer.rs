//! Signing backends. Only signed raw transactions ever reach the ledger.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use alloy_eips::eip2718::Encodable2718;
use alloy_network::TxSignerSync;
use alloy_primitives::{Address, Bytes, hex};
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::{
    rpc::{JsonRpcClient, RpcError},
    transaction::UnsignedTransaction,
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SignerError {
    #[error("signer {backend} unavailable: {reason}")]
    Unavailable { backend: &'static str, reason: String },
    #[error("signer {backend} holds no key for {account}")]
    UnknownAccount { backend: &'static str, account: Address },
    #[error("invalid private key: {0}")]
    InvalidKey(String),
}

#[async_trait]
pub trait TransactionSigner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Sign `tx` and return the EIP-2718 encoded bytes.
    async fn sign(&self, tx: &UnsignedTransaction) -> Result<Bytes, SignerError>;

    async fn list_accounts(&self) -> Result<Vec<Address>, SignerError>;

    async fn health_check(&self) -> bool;
}

/// Pick the first healthy signer in priority order.
///
/// Health is advisory: when no candidate reports healthy the first one is used anyway.
pub async fn select_signer(candidates: &[Arc<dyn TransactionSigner>]) -> Option<Arc<dyn TransactionSigner>> {
    for candidate in candidates {
        if candidate.health_check().await {
            debug!(target: "ssi_bench::signer", signer = candidate.name(), "selected signer");
            return Some(candidate.clone());
        }
        warn!(target: "ssi_bench::signer", signer = candidate.name(), "signer failed health check");
    }
    candidates.first().cloned()
}

/// Parse a hex private key, with or without `0x`.
pub fn parse_private_key(key: &str) -> Result<PrivateKeySigner, SignerError> {
    let mut privkey_bytes = [0u8; 32];
    hex::decode_to_slice(key.trim().trim_start_matches("0x"), &mut privkey_bytes)
        .map_err(|err| SignerError::InvalidKey(err.to_string()))?;
    let signing_key = SigningKey::from_slice(&privkey_bytes).map_err(|err| SignerError::InvalidKey(err.to_string()))?;
    Ok(PrivateKeySigner::from_signing_key(signing_key))
}

/// Signs in-process with keys held in memory.
#[derive(Default)]
pub struct LocalKeySigner {
    keys: HashMap<Address, PrivateKeySigner>,
}

impl LocalKeySigner {
    pub fn new(signers: impl IntoIterator<Item = PrivateKeySigner>) -> Self {
        let keys = signers.into_iter().map(|signer| (signer.address(), signer)).collect();
        Self { keys }
    }

    pub fn insert(&mut self, signer: PrivateKeySigner) {
        self.keys.insert(signer.address(), signer);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl fmt::Debug for LocalKeySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeySigner")
            .field("accounts", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl TransactionSigner for LocalKeySigner {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn sign(&self, tx: &UnsignedTransaction) -> Result<Bytes, SignerError> {
        let signer = self.keys.get(&tx.from).ok_or(SignerError::UnknownAccount {
            backend: self.name(),
            account: tx.from,
        })?;
        let mut typed_tx = tx.typed().ok_or_else(|| SignerError::Unavailable {
            backend: self.name(),
            reason: "incomplete transaction".into(),
        })?;
        let signature = signer
            .sign_transaction_sync(&mut typed_tx)
            .map_err(|err| SignerError::Unavailable {
                backend: self.name(),
                reason: err.to_string(),
            })?;
        let envelope = typed_tx.into_envelope(signature);
        Ok(envelope.encoded_2718().into())
    }

    async fn list_accounts(&self) -> Result<Vec<Address>, SignerError> {
        let mut accounts: Vec<Address> = self.keys.keys().copied().collect();
        accounts.sort();
        Ok(accounts)
    }

    async fn health_check(&self) -> bool {
        !self.keys.is_empty()
    }
}

/// Request body shared by both remote signer protocols.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignPayload {
    from: Address,
    to: Address,
    gas: String,
    gas_price: String,
    value: String,
    data: Bytes,
    nonce: String,
    chain_id: String,
}

impl From<&UnsignedTransaction> for SignPayload {
    fn from(tx: &UnsignedTransaction) -> Self {
        Self {
            from: tx.from,
            to: tx.to,
            gas: format!("{:#x}", tx.gas_limit),
            gas_price: format!("{:#x}", tx.gas_price),
            value: format!("0x{:x}", tx.value),
            data: tx.input.clone(),
            nonce: format!("{:#x}", tx.nonce),
            chain_id: format!("{:#x}", tx.chain_id),
        }
    }
}

fn decode_signed(backend: &'static str, raw: &str) -> Result<Bytes, SignerError> {
    hex::decode(raw.trim())
        .map(Bytes::from)
        .map_err(|err| SignerError::Unavailable {
            backend,
            reason: format!("signer returned invalid hex: {err}"),
        })
}

/// Remote signer speaking `eth_signTransaction` / `eth_accounts`.
#[derive(Debug)]
pub struct JsonRpcSigner {
    client: JsonRpcClient,
}

impl JsonRpcSigner {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: JsonRpcClient::new(url),
        }
    }

    fn unavailable(&self, err: RpcError) -> SignerError {
        SignerError::Unavailable {
            backend: self.name(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl TransactionSigner for JsonRpcSigner {
    fn name(&self) -> &'static str {
        "json-rpc"
    }

    async fn sign(&self, tx: &UnsignedTransaction) -> Result<Bytes, SignerError> {
        let signed: String = self
            .client
            .request("eth_signTransaction", (SignPayload::from(tx),))
            .await
            .map_err(|err| self.unavailable(err))?;
        decode_signed(self.name(), &signed)
    }

    async fn list_accounts(&self) -> Result<Vec<Address>, SignerError> {
        self.client
            .request("eth_accounts", json!([]))
            .await
            .map_err(|err| self.unavailable(err))
    }

    async fn health_check(&self) -> bool {
        upcheck(self.client.http(), self.client.url()).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignResponse {
    signed_transaction: String,
}

/// Remote signer exposing the eth1 REST endpoints.
#[derive(Debug)]
pub struct RestSigner {
    http: reqwest::Client,
    base_url: String,
}

impl RestSigner {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn unavailable(&self, reason: impl fmt::Display) -> SignerError {
        SignerError::Unavailable {
            backend: self.name(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl TransactionSigner for RestSigner {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn sign(&self, tx: &UnsignedTransaction) -> Result<Bytes, SignerError> {
        let response = self
            .http
            .post(format!("{}/api/v1/eth1/sign", self.base_url))
            .json(&SignPayload::from(tx))
            .send()
            .await
            .map_err(|err| self.unavailable(err))?;
        if !response.status().is_success() {
            return Err(self.unavailable(format!("http status {}", response.status())));
        }
        let body: SignResponse = response.json().await.map_err(|err| self.unavailable(err))?;
        decode_signed(self.name(), &body.signed_transaction)
    }

    async fn list_accounts(&self) -> Result<Vec<Address>, SignerError> {
        let response = self
            .http
            .get(format!("{}/api/v1/eth1/publicKeys", self.base_url))
            .send()
            .await
            .map_err(|err| self.unavailable(err))?;
        if !response.status().is_success() {
            return Err(self.unavailable(format!("http status {}", response.status())));
        }
        let keys: Vec<Value> = response.json().await.map_err(|err| self.unavailable(err))?;
        Ok(keys
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|key| {
                let address = address_from_key(key);
                if address.is_none() {
                    warn!(target: "ssi_bench::signer", key, "skipping unrecognised public key");
                }
                address
            })
            .collect())
    }

    async fn health_check(&self) -> bool {
        upcheck(&self.http, &self.base_url).await
    }
}

/// Liveness of a remote signer: `GET <base>/upcheck` answers with a success status.
async fn upcheck(http: &reqwest::Client, base_url: &str) -> bool {
    match http
        .get(format!("{}/upcheck", base_url.trim_end_matches('/')))
        .send()
        .await
    {
        Ok(response) => response.status().is_success(),
        Err(err) => {
            debug!(target: "ssi_bench::signer", %err, "upcheck failed");
            false
        }
    }
}

/// Accept a 20-byte address, a 64-byte raw public key or a 65-byte uncompressed one.
fn address_from_key(key: &str) -> Option<Address> {
    let bytes = hex::decode(key.trim()).ok()?;
    match bytes.len() {
        20 => Some(Address::from_slice(&bytes)),
        64 => Some(Address::from_raw_public_key(&bytes)),
        65 if bytes[0] == 0x04 => Some(Address::from_raw_public_key(&bytes[1..])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_consensus::{Transaction, TxEnvelope, transaction::SignerRecoverable};
    use alloy_eips::eip2718::Decodable2718;
    use alloy_primitives::U256;
    use k256::elliptic_curve::sec1::ToEncodedPoint;

    use crate::nullables::{closed_local_url, serve_stub_http};

    fn unsigned(from: Address) -> UnsignedTransaction {
        UnsignedTransaction {
            chain_id: 1337,
            from,
            to: Address::repeat_byte(9),
            nonce: 7,
            gas_limit: 165_000,
            gas_price: 1_000,
            value: U256::ZERO,
            input: Bytes::from_static(&[0xaa, 0xbb]),
        }
    }

    #[tokio::test]
    async fn local_signer_produces_recoverable_envelope() {
        let key = PrivateKeySigner::random();
        let address = key.address();
        let signer = LocalKeySigner::new([key]);

        let raw = signer.sign(&unsigned(address)).await.unwrap();
        let envelope = TxEnvelope::decode_2718(&mut raw.as_ref()).unwrap();
        assert_eq!(envelope.recover_signer().unwrap(), address);
        assert_eq!(envelope.nonce(), 7);
        assert_eq!(envelope.gas_limit(), 165_000);
        assert_eq!(envelope.chain_id(), Some(1337));
    }

    #[tokio::test]
    async fn local_signer_rejects_unknown_account() {
        let signer = LocalKeySigner::new([PrivateKeySigner::random()]);
        let err = signer.sign(&unsigned(Address::repeat_byte(1))).await.unwrap_err();
        assert!(matches!(err, SignerError::UnknownAccount { .. }));
    }

    #[test]
    fn parses_hex_keys_with_prefix() {
        let key = PrivateKeySigner::random();
        let encoded = format!("0x{}", hex::encode(key.to_bytes()));
        assert_eq!(parse_private_key(&encoded).unwrap().address(), key.address());
        assert_eq!(parse_private_key(&encoded[2..]).unwrap().address(), key.address());
        assert!(parse_private_key("0x1234").is_err());
    }

    #[test]
    fn public_keys_map_to_addresses() {
        let key = PrivateKeySigner::random();
        let point = key.credential().verifying_key().to_encoded_point(false);
        let uncompressed = hex::encode(point.as_bytes());
        assert_eq!(address_from_key(&uncompressed), Some(key.address()));
        assert_eq!(address_from_key(&uncompressed[2..]), Some(key.address()));
        assert_eq!(address_from_key("0x1234"), None);
    }

    #[tokio::test]
    async fn unreachable_remote_signers_fail_health_check() {
        let url = closed_local_url().unwrap();
        let rest: Arc<dyn TransactionSigner> = Arc::new(RestSigner::new(url.clone()));
        let rpc: Arc<dyn TransactionSigner> = Arc::new(JsonRpcSigner::new(url));
        assert!(!rest.health_check().await);
        assert!(!rpc.health_check().await);
        let chosen = select_signer(&[rest.clone(), rpc]).await.unwrap();
        assert!(Arc::ptr_eq(&chosen, &rest));
        assert!(select_signer(&[]).await.is_none());
    }

    #[tokio::test]
    async fn json_rpc_signer_health_follows_upcheck() {
        let no_keys = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found"}}"#;
        let up = serve_stub_http(vec![("/upcheck", 200, "OK".into()), ("/", 200, no_keys.into())])
            .await
            .unwrap();
        let signer = JsonRpcSigner::new(format!("{up}/"));
        assert!(signer.list_accounts().await.is_err());
        assert!(signer.health_check().await);

        let with_keys = format!(r#"{{"jsonrpc":"2.0","id":1,"result":["{}"]}}"#, Address::repeat_byte(4));
        let down = serve_stub_http(vec![("/upcheck", 503, String::new()), ("/", 200, with_keys)])
            .await
            .unwrap();
        let signer = JsonRpcSigner::new(down);
        assert_eq!(signer.list_accounts().await.unwrap(), vec![Address::repeat_byte(4)]);
        assert!(!signer.health_check().await);
    }

    #[tokio::test]
    async fn selection_prefers_first_healthy() {
        let empty: Arc<dyn TransactionSigner> = Arc::new(LocalKeySigner::default());
        let loaded: Arc<dyn TransactionSigner> = Arc::new(LocalKeySigner::new([PrivateKeySigner::random()]));
        let chosen = select_signer(&[empty, loaded.clone()]).await.unwrap();
        assert!(Arc::ptr_eq(&chosen, &loaded));
    }
}
