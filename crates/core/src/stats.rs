//! Per-action outcome counters and the composite run failure.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{ApplyOperation, DeleteOperation, PruneOperation, WaitOperation};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyStats {
    pub server_side: u64,
    pub created: u64,
    pub unchanged: u64,
    pub configured: u64,
    pub failed: u64,
}

impl ApplyStats {
    pub fn inc(&mut self, op: ApplyOperation) {
        match op {
            ApplyOperation::ServerSideApplied => self.server_side += 1,
            ApplyOperation::Created => self.created += 1,
            ApplyOperation::Unchanged => self.unchanged += 1,
            ApplyOperation::Configured => self.configured += 1,
            ApplyOperation::Unspecified => {}
        }
    }

    pub fn inc_failed(&mut self) { self.failed += 1 }

    pub fn sum(&self) -> u64 { self.server_side + self.created + self.unchanged + self.configured + self.failed }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneStats {
    pub pruned: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl PruneStats {
    pub fn inc(&mut self, op: PruneOperation) {
        match op {
            PruneOperation::Pruned => self.pruned += 1,
            PruneOperation::Skipped => self.skipped += 1,
            PruneOperation::Unspecified => {}
        }
    }

    pub fn inc_failed(&mut self) { self.failed += 1 }

    pub fn sum(&self) -> u64 { self.pruned + self.skipped + self.failed }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteStats {
    pub deleted: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl DeleteStats {
    pub fn inc(&mut self, op: DeleteOperation) {
        match op {
            DeleteOperation::Deleted => self.deleted += 1,
            DeleteOperation::Skipped => self.skipped += 1,
            DeleteOperation::Unspecified => {}
        }
    }

    pub fn inc_failed(&mut self) { self.failed += 1 }

    pub fn sum(&self) -> u64 { self.deleted + self.skipped + self.failed }
}

/// `timeout` and `cancelled` are broken out for display but are also counted
/// in `failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitStats {
    pub reconciled: u64,
    pub skipped: u64,
    pub timeout: u64,
    pub cancelled: u64,
    pub failed: u64,
}

impl WaitStats {
    pub fn inc(&mut self, op: WaitOperation) {
        match op {
            WaitOperation::Reconciled => self.reconciled += 1,
            WaitOperation::ReconcileSkipped => self.skipped += 1,
            WaitOperation::ReconcileTimeout => {
                self.timeout += 1;
                self.failed += 1;
            }
            WaitOperation::Cancelled => {
                self.cancelled += 1;
                self.failed += 1;
            }
            WaitOperation::ReconcileFailed => self.failed += 1,
            WaitOperation::Pending => {}
        }
    }

    pub fn sum(&self) -> u64 { self.reconciled + self.skipped + self.failed }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub apply: ApplyStats,
    pub prune: PruneStats,
    pub delete: DeleteStats,
    pub wait: WaitStats,
}

impl Stats {
    pub fn failed_count(&self) -> u64 { self.apply.failed + self.prune.failed + self.delete.failed + self.wait.failed }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.apply.sum() > 0 {
            let a = &self.apply;
            parts.push(format!(
                "{} applied ({} created, {} unchanged, {} configured, {} server-side, {} failed)",
                a.sum(),
                a.created,
                a.unchanged,
                a.configured,
                a.server_side,
                a.failed
            ));
        }
        if self.prune.sum() > 0 {
            let p = &self.prune;
            parts.push(format!("{} pruned ({} skipped, {} failed)", p.pruned, p.skipped, p.failed));
        }
        if self.delete.sum() > 0 {
            let d = &self.delete;
            parts.push(format!("{} deleted ({} skipped, {} failed)", d.deleted, d.skipped, d.failed));
        }
        if self.wait.sum() > 0 {
            let w = &self.wait;
            parts.push(format!(
                "{} reconciled ({} skipped, {} failed, {} timed out)",
                w.reconciled, w.skipped, w.failed, w.timeout
            ));
        }
        if parts.is_empty() {
            return f.write_str("nothing to do");
        }
        f.write_str(&parts.join("; "))
    }
}

/// A run finished with at least one failed or timed-out object.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{} resource(s) failed: {stats}", .stats.failed_count())]
pub struct ResultError {
    pub stats: Stats,
}
