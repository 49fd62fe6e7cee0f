//! Dispatch failures and their classification.

use std::fmt;

use alloy_primitives::{Address, B256};

use crate::{contracts::ContractName, rpc::RpcError, signer::SignerError};

/// Category of a dispatch failure. Only connectivity and nonce conflicts are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Connectivity,
    NonceConflict,
    Revert,
    SignerUnavailable,
    ReceiptTimeout,
    Encoding,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Connectivity | Self::NonceConflict)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connectivity => "connectivity",
            Self::NonceConflict => "nonce-conflict",
            Self::Revert => "revert",
            Self::SignerUnavailable => "signer-unavailable",
            Self::ReceiptTimeout => "receipt-timeout",
            Self::Encoding => "encoding",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const NONCE_MARKERS: &[&str] = &[
    "nonce",
    "replacement transaction underpriced",
    "known transaction",
    "already known",
];

const CONGESTION_MARKERS: &[&str] = &[
    "transaction pool is full",
    "txpool is full",
    "try again",
    "temporarily unavailable",
    "too many requests",
    "rate limit",
    "timeout",
    "timed out",
];

const LIMIT_EXCEEDED: i64 = -32005;

/// Map a ledger error onto a class. JSON-RPC codes are checked before message text.
pub fn classify(err: &RpcError) -> ErrorClass {
    match err {
        RpcError::Transport { .. } => ErrorClass::Connectivity,
        RpcError::Malformed { .. } => ErrorClass::Encoding,
        RpcError::Rpc { code, .. } => {
            // EIP-1474 execution reverted
            if *code == 3 {
                return ErrorClass::Revert;
            }
            let detail = err.detail();
            if NONCE_MARKERS.iter().any(|marker| detail.contains(marker)) {
                ErrorClass::NonceConflict
            } else if *code == LIMIT_EXCEEDED || CONGESTION_MARKERS.iter().any(|marker| detail.contains(marker)) {
                ErrorClass::Connectivity
            } else {
                ErrorClass::Revert
            }
        }
    }
}

/// What went wrong, independent of which call it happened to.
#[derive(Debug, thiserror::Error)]
pub enum DispatchErrorKind {
    #[error("ledger unreachable: {0}")]
    Connectivity(#[source] RpcError),
    #[error("nonce conflict: {0}")]
    NonceConflict(String),
    #[error("reverted: {0}")]
    Revert(String),
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error("no receipt for {hash} after {polls} polls")]
    ReceiptTimeout { hash: B256, polls: u32 },
    #[error("encoding failure: {0}")]
    Encoding(String),
}

impl DispatchErrorKind {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Connectivity(_) => ErrorClass::Connectivity,
            Self::NonceConflict(_) => ErrorClass::NonceConflict,
            Self::Revert(_) => ErrorClass::Revert,
            Self::Signer(_) => ErrorClass::SignerUnavailable,
            Self::ReceiptTimeout { .. } => ErrorClass::ReceiptTimeout,
            Self::Encoding(_) => ErrorClass::Encoding,
        }
    }

    /// The ledger's own message is kept verbatim so revert reasons survive.
    pub fn from_rpc(err: RpcError) -> Self {
        match classify(&err) {
            ErrorClass::Connectivity => Self::Connectivity(err),
            ErrorClass::NonceConflict => Self::NonceConflict(reason_of(&err)),
            ErrorClass::Encoding => Self::Encoding(err.to_string()),
            _ => Self::Revert(reason_of(&err)),
        }
    }

    /// Gas estimation failures: anything the node answered is taken as a revert.
    pub fn from_preflight(err: RpcError) -> Self {
        match classify(&err) {
            ErrorClass::Connectivity => Self::Connectivity(err),
            ErrorClass::Encoding => Self::Encoding(err.to_string()),
            _ => Self::Revert(reason_of(&err)),
        }
    }
}

fn reason_of(err: &RpcError) -> String {
    match err {
        RpcError::Rpc {
            message, data: Some(data), ..
        } => format!("{message} ({data})"),
        RpcError::Rpc { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

/// A failed dispatch with the call it belonged to.
#[derive(Debug, thiserror::Error)]
#[error("{contract}.{method} from {account} failed after {attempts} attempt(s): {kind}")]
pub struct DispatchError {
    pub contract: ContractName,
    pub method: &'static str,
    pub account: Address,
    pub attempts: u32,
    #[source]
    pub kind: DispatchErrorKind,
}

impl DispatchError {
    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc(code: i64, message: &str) -> RpcError {
        RpcError::Rpc {
            method: "eth_sendRawTransaction".into(),
            code,
            message: message.into(),
            data: None,
        }
    }

    #[test]
    fn transport_is_connectivity() {
        let err = RpcError::Transport {
            method: "eth_call".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(classify(&err), ErrorClass::Connectivity);
        assert!(classify(&err).is_retryable());
    }

    #[test]
    fn nonce_messages_are_conflicts() {
        assert_eq!(classify(&rpc(-32000, "Nonce too low")), ErrorClass::NonceConflict);
        assert_eq!(
            classify(&rpc(-32000, "replacement transaction underpriced")),
            ErrorClass::NonceConflict
        );
    }

    #[test]
    fn code_three_wins_over_message_text() {
        assert_eq!(classify(&rpc(3, "execution reverted: nonce already used by DID")), ErrorClass::Revert);
    }

    #[test]
    fn congestion_is_retryable() {
        assert_eq!(classify(&rpc(-32000, "Transaction pool is full")), ErrorClass::Connectivity);
        assert_eq!(classify(&rpc(-32005, "limit exceeded")), ErrorClass::Connectivity);
    }

    #[test]
    fn unknown_rpc_error_is_terminal() {
        let class = classify(&rpc(-32000, "Caller is not a TRUSTEE"));
        assert_eq!(class, ErrorClass::Revert);
        assert!(!class.is_retryable());
    }

    #[test]
    fn revert_reason_is_preserved() {
        let kind = DispatchErrorKind::from_rpc(RpcError::Rpc {
            method: "eth_estimateGas".into(),
            code: 3,
            message: "execution reverted".into(),
            data: Some("DID already exists".into()),
        });
        assert_eq!(kind.to_string(), "reverted: execution reverted (DID already exists)");
    }
}
