use std::{collections::HashMap, fs, path::Path, time::Duration};

use alloy_primitives::Address;
use rand::Rng;
use serde::Deserialize;

use crate::{contracts::ContractAddresses, workload::OperationKind};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which signer backend to use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SignerConfig {
    #[default]
    Local,
    JsonRpc {
        url: String,
    },
    Rest {
        url: String,
    },
}

/// A configured sending account. The key is optional when a remote signer holds it.
#[derive(Clone, Deserialize)]
pub struct AccountConfig {
    pub address: Address,
    #[serde(default)]
    pub private_key: Option<String>,
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("address", &self.address)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GasConfig {
    /// Gas price for every write, in wei. Unset means the node's `eth_gasPrice`.
    #[serde(default)]
    pub default_price: Option<u128>,
    /// Per-method gas limits overriding the built-in table.
    #[serde(default)]
    pub limits: HashMap<String, u64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub const MAX_ATTEMPTS: u32 = 3;

    /// Attempts per dispatch, clamped to `1..=3`.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.clamp(1, Self::MAX_ATTEMPTS)
    }

    /// Linear backoff: `attempt * base_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(attempt.into()))
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ReceiptPolicy {
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ReceiptPolicy {
    fn default() -> Self {
        Self {
            poll_attempts: default_poll_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ReceiptPolicy {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RoleBalance {
    /// ISSUER DIDs/assignments to create before rotating through HOLDER and TRUSTEE.
    #[serde(default = "default_issuer_target")]
    pub issuer_target: usize,
}

impl Default for RoleBalance {
    fn default() -> Self {
        Self {
            issuer_target: default_issuer_target(),
        }
    }
}

/// Relative weights of the operations a worker runs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct OperationMix(HashMap<OperationKind, u32>);

impl Default for OperationMix {
    fn default() -> Self {
        Self::single(OperationKind::CreateDid)
    }
}

impl OperationMix {
    pub fn single(kind: OperationKind) -> Self {
        Self(HashMap::from([(kind, 1)]))
    }

    pub fn weighted(weights: impl IntoIterator<Item = (OperationKind, u32)>) -> Self {
        Self(weights.into_iter().collect())
    }

    /// Sum of all weights, widened so no mix of `u32` weights can overflow.
    pub fn total_weight(&self) -> u64 {
        self.0.values().map(|weight| u64::from(*weight)).sum()
    }

    /// Kinds with a non-zero weight, in a stable order.
    pub fn kinds(&self) -> Vec<OperationKind> {
        let mut kinds: Vec<_> = self
            .0
            .iter()
            .filter(|(_, weight)| **weight > 0)
            .map(|(kind, _)| *kind)
            .collect();
        kinds.sort();
        kinds
    }

    /// Weighted random pick; `None` when every weight is zero.
    pub fn pick(&self, rng: &mut impl Rng) -> Option<OperationKind> {
        let total = self.total_weight();
        if total == 0 {
            return None;
        }
        let mut roll = rng.random_range(0..total);
        for kind in self.kinds() {
            let weight = u64::from(self.0[&kind]);
            if roll < weight {
                return Some(kind);
            }
            roll -= weight;
        }
        None
    }
}

/// Everything a benchmark run needs, loaded from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct BenchConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub contracts: ContractAddresses,
    #[serde(default)]
    pub signer: SignerConfig,
    #[serde(default)]
    pub fallback_signer: Option<SignerConfig>,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    /// Account that must hold TRUSTEE; defaults to the first pool account.
    #[serde(default)]
    pub privileged_account: Option<Address>,
    #[serde(default)]
    pub gas: GasConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub receipt: ReceiptPolicy,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default)]
    pub force_bootstrap: bool,
    #[serde(default)]
    pub role_balance: RoleBalance,
    #[serde(default)]
    pub operation_mix: OperationMix,
    #[serde(default = "default_true")]
    pub estimate_gas: bool,
}

impl BenchConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc_url.trim().is_empty() {
            return Err(ConfigError::Invalid("rpc_url must not be empty".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.operation_mix.total_weight() == 0 {
            return Err(ConfigError::Invalid("operation_mix needs a non-zero weight".into()));
        }
        for signer in std::iter::once(&self.signer).chain(self.fallback_signer.as_ref()) {
            match signer {
                SignerConfig::JsonRpc { url } | SignerConfig::Rest { url } if url.trim().is_empty() => {
                    return Err(ConfigError::Invalid("remote signer url must not be empty".into()));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_poll_attempts() -> u32 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_issuer_target() -> usize {
    1
}

fn default_workers() -> usize {
    1
}

fn default_iterations() -> usize {
    10
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};
    use std::io::Write;

    const MINIMAL: &str = r#"{
        "chain_id": 1337,
        "rpc_url": "http://127.0.0.1:8545",
        "contracts": {
            "role_control": "0x0000000000000000000000000000000000001111",
            "did_registry": "0x0000000000000000000000000000000000002222",
            "credential_registry": "0x0000000000000000000000000000000000003333"
        }
    }"#;

    #[test]
    fn defaults_fill_missing_sections() {
        let config = BenchConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.signer, SignerConfig::Local);
        assert_eq!(config.retry.attempts(), 3);
        assert_eq!(config.workers, 1);
        assert!(config.estimate_gas);
        assert_eq!(config.operation_mix.kinds(), vec![OperationKind::CreateDid]);
    }

    #[test]
    fn retry_attempts_are_clamped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
        };
        assert_eq!(policy.attempts(), 3);
        assert_eq!(
            RetryPolicy {
                max_attempts: 0,
                ..policy
            }
            .attempts(),
            1
        );
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
    }

    #[test]
    fn remote_signer_and_mix_parse() {
        let raw = MINIMAL.replacen(
            "\"chain_id\": 1337,",
            r#""chain_id": 1337,
            "signer": { "kind": "rest", "url": "http://signer:9000" },
            "operation_mix": { "create-did": 3, "resolve-did": 1 },"#,
            1,
        );
        let config = BenchConfig::from_json(&raw).unwrap();
        assert_eq!(
            config.signer,
            SignerConfig::Rest {
                url: "http://signer:9000".into()
            }
        );
        assert_eq!(config.operation_mix.total_weight(), 4);
    }

    #[test]
    fn rejects_zero_workers() {
        let raw = MINIMAL.replacen("\"chain_id\": 1337,", "\"chain_id\": 1337, \"workers\": 0,", 1);
        assert!(matches!(BenchConfig::from_json(&raw), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = BenchConfig::from_file(file.path()).unwrap();
        assert_eq!(config.chain_id, 1337);
    }

    #[test]
    fn weighted_pick_only_returns_weighted_kinds() {
        let mix = OperationMix::weighted([
            (OperationKind::CreateDid, 2),
            (OperationKind::ResolveDid, 0),
            (OperationKind::AssignRole, 1),
        ]);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let kind = mix.pick(&mut rng).unwrap();
            assert!(matches!(kind, OperationKind::CreateDid | OperationKind::AssignRole));
        }
    }

    #[test]
    fn saturated_weights_do_not_overflow() {
        let mix = OperationMix::weighted([
            (OperationKind::CreateDid, u32::MAX),
            (OperationKind::ResolveDid, u32::MAX),
            (OperationKind::IssueCredential, 1),
        ]);
        assert_eq!(mix.total_weight(), 2 * u64::from(u32::MAX) + 1);

        let mut rng = StdRng::seed_from_u64(11);
        let picks: Vec<_> = (0..200).filter_map(|_| mix.pick(&mut rng)).collect();
        assert_eq!(picks.len(), 200);
        assert!(picks.contains(&OperationKind::CreateDid));
        assert!(picks.contains(&OperationKind::ResolveDid));

        let raw = MINIMAL.replacen(
            "\"chain_id\": 1337,",
            r#""chain_id": 1337, "operation_mix": { "create-did": 4294967295, "update-did": 4294967295 },"#,
            1,
        );
        assert!(BenchConfig::from_json(&raw).is_ok());
    }

    #[test]
    fn private_keys_are_redacted_in_debug() {
        let account = AccountConfig {
            address: Address::ZERO,
            private_key: Some("deadbeef".into()),
        };
        assert!(!format!("{account:?}").contains("deadbeef"));
    }
}
