//! The ledger adapter: the only JSON-RPC surface the benchmark needs from the node.

use alloy_primitives::{Address, B256, Bytes};
use alloy_rpc_types_eth::TransactionRequest as RpcTransactionRequest;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::rpc::{JsonRpcClient, RpcError, parse_quantity, parse_quantity_u128, quantity_or_malformed};

/// Block tag for nonce lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Pending,
}

impl BlockTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::Pending => "pending",
        }
    }
}

/// Parameters for `eth_call` and `eth_estimateGas`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Option<Address>,
    pub to: Address,
    pub data: Bytes,
    pub gas: Option<u64>,
}

impl CallRequest {
    fn to_rpc(&self) -> RpcTransactionRequest {
        let mut request = RpcTransactionRequest::default().to(self.to).input(self.data.clone().into());
        if let Some(from) = self.from {
            request = request.from(from);
        }
        if let Some(gas) = self.gas {
            request = request.gas_limit(gas);
        }
        request
    }
}

/// Normalised transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_hash: B256,
    pub block_number: Option<u64>,
    pub gas_used: u64,
    pub success: bool,
}

#[async_trait]
pub trait LedgerRpc: Send + Sync {
    async fn chain_id(&self) -> Result<u64, RpcError>;

    /// Accounts the node itself manages (`eth_accounts`).
    async fn accounts(&self) -> Result<Vec<Address>, RpcError>;

    async fn transaction_count(&self, address: Address, tag: BlockTag) -> Result<u64, RpcError>;

    async fn estimate_gas(&self, call: &CallRequest) -> Result<u64, RpcError>;

    async fn gas_price(&self) -> Result<u128, RpcError>;

    async fn call(&self, call: &CallRequest) -> Result<Bytes, RpcError>;

    async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256, RpcError>;

    /// `Ok(None)` while the transaction is not yet mined.
    async fn transaction_receipt(&self, hash: B256) -> Result<Option<Receipt>, RpcError>;

    async fn code(&self, address: Address) -> Result<Bytes, RpcError>;
}

/// [`LedgerRpc`] over HTTP JSON-RPC.
#[derive(Debug)]
pub struct HttpLedger {
    client: JsonRpcClient,
}

impl HttpLedger {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: JsonRpcClient::new(url),
        }
    }

    pub fn url(&self) -> &str {
        self.client.url()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: B256,
    #[serde(default)]
    block_number: Option<Value>,
    #[serde(default)]
    gas_used: Option<Value>,
    #[serde(default)]
    status: Option<Value>,
}

impl RawReceipt {
    fn normalise(self) -> Receipt {
        Receipt {
            transaction_hash: self.transaction_hash,
            block_number: self.block_number.as_ref().and_then(parse_quantity),
            gas_used: self.gas_used.as_ref().and_then(parse_quantity).unwrap_or_default(),
            // Pre-Byzantium receipts carry no status; treat them as successful.
            success: self.status.as_ref().and_then(parse_quantity).is_none_or(|status| status == 1),
        }
    }
}

#[async_trait]
impl LedgerRpc for HttpLedger {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        let value: Value = self.client.request("eth_chainId", json!([])).await?;
        quantity_or_malformed("eth_chainId", &value)
    }

    async fn accounts(&self) -> Result<Vec<Address>, RpcError> {
        self.client.request("eth_accounts", json!([])).await
    }

    async fn transaction_count(&self, address: Address, tag: BlockTag) -> Result<u64, RpcError> {
        let value: Value = self
            .client
            .request("eth_getTransactionCount", (address, tag.as_str()))
            .await?;
        quantity_or_malformed("eth_getTransactionCount", &value)
    }

    async fn estimate_gas(&self, call: &CallRequest) -> Result<u64, RpcError> {
        let value: Value = self.client.request("eth_estimateGas", (call.to_rpc(),)).await?;
        quantity_or_malformed("eth_estimateGas", &value)
    }

    async fn gas_price(&self) -> Result<u128, RpcError> {
        let value: Value = self.client.request("eth_gasPrice", json!([])).await?;
        parse_quantity_u128(&value).ok_or_else(|| RpcError::Malformed {
            method: "eth_gasPrice".into(),
            reason: format!("expected a quantity, got {value}"),
        })
    }

    async fn call(&self, call: &CallRequest) -> Result<Bytes, RpcError> {
        self.client.request("eth_call", (call.to_rpc(), "latest")).await
    }

    async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256, RpcError> {
        self.client.request("eth_sendRawTransaction", (raw,)).await
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<Receipt>, RpcError> {
        let receipt: Option<RawReceipt> = self.client.request("eth_getTransactionReceipt", (hash,)).await?;
        Ok(receipt.map(RawReceipt::normalise))
    }

    async fn code(&self, address: Address) -> Result<Bytes, RpcError> {
        self.client.request("eth_getCode", (address, "latest")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_quantities_are_normalised() {
        let raw: RawReceipt = serde_json::from_value(json!({
            "transactionHash": format!("{}", B256::repeat_byte(1)),
            "blockNumber": "0x10",
            "gasUsed": 52000,
            "status": "0x0",
        }))
        .unwrap();
        let receipt = raw.normalise();
        assert_eq!(receipt.block_number, Some(16));
        assert_eq!(receipt.gas_used, 52_000);
        assert!(!receipt.success);
    }

    #[test]
    fn receipt_without_status_counts_as_success() {
        let raw: RawReceipt = serde_json::from_value(json!({
            "transactionHash": format!("{}", B256::ZERO),
        }))
        .unwrap();
        assert!(raw.normalise().success);
    }

    #[test]
    fn call_request_serialises_target_and_input() {
        let call = CallRequest {
            from: Some(Address::repeat_byte(0xaa)),
            to: Address::repeat_byte(0xbb),
            data: Bytes::from_static(&[0xde, 0xad]),
            gas: None,
        };
        let value = serde_json::to_value(call.to_rpc()).unwrap();
        assert_eq!(value["input"], json!("0xdead"));
        assert!(value["to"].as_str().unwrap().to_lowercase().ends_with("bbbb"));
    }
}
