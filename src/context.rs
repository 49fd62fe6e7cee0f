use std::sync::Arc;

use crate::config::BenchConfig;

/// Identity of one concurrent worker within a run.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    worker_index: usize,
    total_workers: usize,
    config: Arc<BenchConfig>,
}

impl WorkerContext {
    pub fn new(worker_index: usize, total_workers: usize, config: Arc<BenchConfig>) -> Self {
        Self {
            worker_index,
            total_workers: total_workers.max(1),
            config,
        }
    }

    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    pub fn total_workers(&self) -> usize {
        self.total_workers
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn shared_config(&self) -> Arc<BenchConfig> {
        self.config.clone()
    }

    /// Worker 0 runs the full bootstrap, as does any worker when forced.
    pub fn leads_bootstrap(&self) -> bool {
        self.worker_index == 0 || self.config.force_bootstrap
    }

    /// Short prefix that keeps entity identifiers unique across workers.
    pub fn prefix(&self) -> String {
        worker_prefix(self.worker_index)
    }
}

/// `w` followed by the base-36 digits of `index + 1`.
pub fn worker_prefix(index: usize) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut value = index + 1;
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(DIGITS[value % 36] as char);
        value /= 36;
    }
    let mut prefix = String::from("w");
    prefix.extend(digits.iter().rev());
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_are_base36() {
        assert_eq!(worker_prefix(0), "w1");
        assert_eq!(worker_prefix(9), "wa");
        assert_eq!(worker_prefix(35), "w10");
        assert_eq!(worker_prefix(1295), "w100");
    }
}
