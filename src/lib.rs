//! Load generator for a permissioned SSI ledger: role control, DID registry and
//! credential registry contracts driven by concurrent workers.

pub mod account;
pub mod bootstrap;
pub mod config;
pub mod context;
pub mod contracts;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod nonce;
#[cfg(any(test, feature = "nullables"))]
pub mod nullables;
pub mod rpc;
pub mod runner;
pub mod signer;
pub mod tracker;
pub mod transaction;
pub mod workload;

pub use config::BenchConfig;
pub use runner::{BenchmarkRunner, RunReport};
