// src/metrics.rs
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use crate::{error::ErrorClass, workload::OperationKind};

#[derive(Debug, Default, Clone)]
struct Accum {
    total: Duration, // time spent in completed dispatches
    max: Duration,
    succeeded: u64,
    failed: u64,
    skipped: u64,
    failures: HashMap<ErrorClass, u64>,
}

/// Per-operation counters shared by every worker of a run.
#[derive(Debug, Default)]
pub struct OperationMetrics {
    sections: Mutex<HashMap<OperationKind, Accum>>,
}

impl OperationMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start timing one dispatch. Dropping the timer without an outcome counts as a failure.
    pub fn start(self: &Arc<Self>, kind: OperationKind) -> OperationTimer {
        OperationTimer {
            metrics: self.clone(),
            kind,
            start: Instant::now(),
            outcome: TimerOutcome::Abandoned,
        }
    }

    pub fn record_skip(&self, kind: OperationKind) {
        self.with_entry(kind, |entry| entry.skipped += 1);
    }

    fn record(&self, kind: OperationKind, elapsed: Duration, outcome: TimerOutcome) {
        self.with_entry(kind, |entry| {
            entry.total += elapsed;
            entry.max = entry.max.max(elapsed);
            match outcome {
                TimerOutcome::Succeeded => entry.succeeded += 1,
                TimerOutcome::Failed(class) => {
                    entry.failed += 1;
                    *entry.failures.entry(class).or_default() += 1;
                }
                TimerOutcome::Abandoned => entry.failed += 1,
            }
        });
    }

    fn with_entry(&self, kind: OperationKind, update: impl FnOnce(&mut Accum)) {
        let mut map = self.sections.lock().unwrap_or_else(PoisonError::into_inner);
        update(map.entry(kind).or_default());
    }

    /// Rows in a stable order.
    pub fn snapshot(&self) -> Vec<OperationSummary> {
        let map = self.sections.lock().unwrap_or_else(PoisonError::into_inner);
        let mut rows: Vec<OperationSummary> = map
            .iter()
            .map(|(kind, acc)| {
                let mut failures: Vec<_> = acc.failures.iter().map(|(class, n)| (*class, *n)).collect();
                failures.sort_by_key(|(class, _)| class.as_str());
                OperationSummary {
                    kind: *kind,
                    succeeded: acc.succeeded,
                    failed: acc.failed,
                    skipped: acc.skipped,
                    total: acc.total,
                    max: acc.max,
                    failures,
                }
            })
            .collect();
        rows.sort_by_key(|row| row.kind);
        rows
    }

    pub fn print_summary(&self, wall: Duration) {
        print_summary(&self.snapshot(), wall);
    }
}

#[derive(Debug, Clone, Copy)]
enum TimerOutcome {
    Abandoned,
    Succeeded,
    Failed(ErrorClass),
}

/// Times one dispatch and records it when dropped.
pub struct OperationTimer {
    metrics: Arc<OperationMetrics>,
    kind: OperationKind,
    start: Instant,
    outcome: TimerOutcome,
}

impl OperationTimer {
    pub fn succeed(mut self) {
        self.outcome = TimerOutcome::Succeeded;
    }

    pub fn fail(mut self, class: ErrorClass) {
        self.outcome = TimerOutcome::Failed(class);
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        self.metrics.record(self.kind, self.start.elapsed(), self.outcome);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSummary {
    pub kind: OperationKind,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub total: Duration,
    pub max: Duration,
    pub failures: Vec<(ErrorClass, u64)>,
}

impl OperationSummary {
    pub fn dispatched(&self) -> u64 {
        self.succeeded + self.failed
    }

    pub fn avg_ms(&self) -> f64 {
        match self.dispatched() {
            0 => 0.0,
            n => self.total.as_secs_f64() * 1000.0 / n as f64,
        }
    }
}

// ---------- Printing ----------
pub fn print_summary(rows: &[OperationSummary], wall: Duration) {
    let mut name_w = "Operation".len();
    for row in rows {
        name_w = name_w.max(row.kind.as_str().len());
    }

    println!();
    println!("{:-<1$}", "", name_w + 72);
    println!(
        "{:<name_w$}  {:>8}  {:>8}  {:>8}  {:>8}  {:>14}  {:>14}",
        "Operation",
        "OK",
        "Failed",
        "Skipped",
        "Count",
        "Avg (ms)",
        "Max (ms)",
        name_w = name_w
    );
    println!("{:-<1$}", "", name_w + 72);

    let mut confirmed = 0u64;
    for row in rows {
        confirmed += row.succeeded;
        println!(
            "{:<name_w$}  {:>8}  {:>8}  {:>8}  {:>8}  {:>14.3}  {:>14.3}",
            row.kind.as_str(),
            row.succeeded,
            row.failed,
            row.skipped,
            row.dispatched(),
            row.avg_ms(),
            row.max.as_secs_f64() * 1000.0,
            name_w = name_w
        );
        for (class, n) in &row.failures {
            println!("{:<name_w$}    {n} {class}", "", name_w = name_w);
        }
    }
    println!("{:-<1$}", "", name_w + 72);

    let wall_s = wall.as_secs_f64();
    let throughput = if wall_s > 0.0 { confirmed as f64 / wall_s } else { 0.0 };
    println!("{:<name_w$}  {:>14.3} ms", "TOTAL (wall)", wall_s * 1000.0, name_w = name_w);
    println!("{:<name_w$}  {:>14.2} ops/s", "Throughput", throughput, name_w = name_w);
    println!("{:-<1$}", "", name_w + 72);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_record_on_drop() {
        let metrics = OperationMetrics::new();
        metrics.start(OperationKind::CreateDid).succeed();
        metrics.start(OperationKind::CreateDid).fail(ErrorClass::Revert);
        drop(metrics.start(OperationKind::CreateDid));
        metrics.record_skip(OperationKind::IssueCredential);

        let rows = metrics.snapshot();
        assert_eq!(rows.len(), 2);
        let create = &rows[0];
        assert_eq!(create.kind, OperationKind::CreateDid);
        assert_eq!((create.succeeded, create.failed, create.dispatched()), (1, 2, 3));
        assert_eq!(create.failures, vec![(ErrorClass::Revert, 1)]);
        assert_eq!(rows[1].skipped, 1);
        assert_eq!(rows[1].avg_ms(), 0.0);
    }
}
