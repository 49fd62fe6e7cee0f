//! Minimal JSON-RPC 2.0 client shared by the ledger adapter and the remote signer.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::trace;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The request never produced a well-formed answer (refused, reset, timed out, 5xx).
    #[error("transport failure calling {method}: {reason}")]
    Transport { method: String, reason: String },
    /// The node answered with a JSON-RPC error object.
    #[error("{method} failed with code {code}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
        data: Option<String>,
    },
    #[error("malformed response to {method}: {reason}")]
    Malformed { method: String, reason: String },
}

impl RpcError {
    pub fn method(&self) -> &str {
        match self {
            Self::Transport { method, .. } | Self::Rpc { method, .. } | Self::Malformed { method, .. } => method,
        }
    }

    /// Message text plus revert data, lowercased for substring checks.
    pub fn detail(&self) -> String {
        match self {
            Self::Rpc { message, data, .. } => match data {
                Some(data) => format!("{message} {data}").to_lowercase(),
                None => message.to_lowercase(),
            },
            Self::Transport { reason, .. } | Self::Malformed { reason, .. } => reason.to_lowercase(),
        }
    }
}

#[derive(Serialize)]
struct Request<'a, P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

#[derive(Deserialize)]
struct ErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Posts JSON-RPC requests to a single endpoint.
#[derive(Debug)]
pub struct JsonRpcClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Send one request. A `null` result deserializes into `R` as-is, so
    /// callers that expect "not found" should ask for an `Option`.
    pub async fn request<P, R>(&self, method: &str, params: P) -> Result<R, RpcError>
    where
        P: Serialize + Send,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(target: "ssi_bench::rpc", id, method, url = %self.url, "request");

        let response = self
            .http
            .post(&self.url)
            .json(&Request {
                jsonrpc: "2.0",
                id,
                method,
                params,
            })
            .send()
            .await
            .map_err(|err| transport(method, &err))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(RpcError::Transport {
                method: method.to_string(),
                reason: format!("http status {status}"),
            });
        }

        let body: Response = response.json().await.map_err(|err| {
            if err.is_decode() {
                RpcError::Malformed {
                    method: method.to_string(),
                    reason: err.to_string(),
                }
            } else {
                transport(method, &err)
            }
        })?;

        if let Some(error) = body.error {
            return Err(RpcError::Rpc {
                method: method.to_string(),
                code: error.code,
                message: error.message,
                data: error.data.map(|data| match data {
                    Value::String(text) => text,
                    other => other.to_string(),
                }),
            });
        }

        serde_json::from_value(body.result.unwrap_or(Value::Null)).map_err(|err| RpcError::Malformed {
            method: method.to_string(),
            reason: err.to_string(),
        })
    }
}

fn transport(method: &str, err: &reqwest::Error) -> RpcError {
    RpcError::Transport {
        method: method.to_string(),
        reason: err.to_string(),
    }
}

/// Accept a quantity as a JSON number, a `0x` hex string or a decimal string.
pub fn parse_quantity(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => {
            let text = text.trim();
            match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                Some("") => Some(0),
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => text.parse().ok(),
            }
        }
        _ => None,
    }
}

/// Same as [`parse_quantity`] but wide enough for gas prices.
pub fn parse_quantity_u128(value: &Value) -> Option<u128> {
    match value {
        Value::Number(number) => number.as_u64().map(u128::from),
        Value::String(text) => {
            let text = text.trim();
            match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                Some("") => Some(0),
                Some(hex) => u128::from_str_radix(hex, 16).ok(),
                None => text.parse().ok(),
            }
        }
        _ => None,
    }
}

pub(crate) fn quantity_or_malformed(method: &str, value: &Value) -> Result<u64, RpcError> {
    parse_quantity(value).ok_or_else(|| RpcError::Malformed {
        method: method.to_string(),
        reason: format!("expected a quantity, got {value}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quantities_in_every_shape() {
        assert_eq!(parse_quantity(&json!(5)), Some(5));
        assert_eq!(parse_quantity(&json!("0x1f")), Some(31));
        assert_eq!(parse_quantity(&json!("0x")), Some(0));
        assert_eq!(parse_quantity(&json!("42")), Some(42));
        assert_eq!(parse_quantity(&json!("0xzz")), None);
        assert_eq!(parse_quantity(&json!(null)), None);
        assert_eq!(parse_quantity_u128(&json!("0x2540be400")), Some(10_000_000_000));
    }

    #[test]
    fn detail_includes_revert_data() {
        let err = RpcError::Rpc {
            method: "eth_estimateGas".into(),
            code: 3,
            message: "Execution reverted".into(),
            data: Some("Caller is not a TRUSTEE".into()),
        };
        assert_eq!(err.detail(), "execution reverted caller is not a trustee");
        assert_eq!(err.method(), "eth_estimateGas");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        let url = crate::nullables::closed_local_url().unwrap();
        let client = JsonRpcClient::with_timeout(url, Duration::from_millis(200));
        let err = client.request::<_, Value>("eth_chainId", ()).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport { .. }), "{err}");
    }
}
