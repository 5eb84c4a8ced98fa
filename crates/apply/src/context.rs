//! Run-scoped state shared by the runner, its tasks and the status poller.

use std::sync::{Mutex, MutexGuard, RwLock};

use keel_core::event::Event;
use keel_core::object::ObjectIdentifier;
use keel_core::status::ResourceStatus;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Default)]
struct Ledger {
    applied_uids: FxHashSet<String>,
    applied_generations: FxHashMap<ObjectIdentifier, i64>,
    apply_failures: FxHashSet<ObjectIdentifier>,
    invalid: FxHashSet<ObjectIdentifier>,
    /// Prune/delete candidates left in place, with whether they stay in the inventory.
    removal_skips: FxHashMap<ObjectIdentifier, bool>,
    removal_failures: FxHashSet<ObjectIdentifier>,
    removed: FxHashSet<ObjectIdentifier>,
}

pub struct TaskContext {
    events: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
    statuses: RwLock<FxHashMap<ObjectIdentifier, ResourceStatus>>,
    epoch: watch::Sender<u64>,
    ledger: Mutex<Ledger>,
}

impl TaskContext {
    pub fn new(events: mpsc::UnboundedSender<Event>, cancel: CancellationToken) -> Self {
        let (epoch, _) = watch::channel(0u64);
        Self { events, cancel, statuses: RwLock::new(FxHashMap::default()), epoch, ledger: Mutex::new(Ledger::default()) }
    }

    /// Send fails only when the caller dropped the stream; the run goes on regardless.
    pub fn send(&self, ev: Event) {
        if self.events.send(ev).is_err() {
            trace!("runner: event receiver dropped");
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken { &self.cancel }

    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }

    /// Record a status; returns whether it differs from the last one seen.
    /// Any change wakes the waiters.
    pub fn update_status(&self, rs: ResourceStatus) -> bool {
        let changed = {
            let mut map = self.statuses.write().unwrap_or_else(|e| e.into_inner());
            match map.get(&rs.identifier) {
                Some(prev) if prev == &rs => false,
                _ => {
                    map.insert(rs.identifier.clone(), rs);
                    true
                }
            }
        };
        if changed {
            self.epoch.send_modify(|e| *e += 1);
        }
        changed
    }

    pub fn status(&self, id: &ObjectIdentifier) -> Option<ResourceStatus> {
        self.statuses.read().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
    }

    /// Ticks on every status change.
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.epoch.subscribe() }

    fn ledger(&self) -> MutexGuard<'_, Ledger> { self.ledger.lock().unwrap_or_else(|e| e.into_inner()) }

    pub fn record_applied(&self, id: &ObjectIdentifier, uid: Option<&str>, generation: Option<i64>) {
        let mut l = self.ledger();
        if let Some(uid) = uid {
            l.applied_uids.insert(uid.to_string());
        }
        if let Some(g) = generation {
            l.applied_generations.insert(id.clone(), g);
        }
    }

    pub fn record_apply_failure(&self, id: &ObjectIdentifier) { self.ledger().apply_failures.insert(id.clone()); }

    pub fn mark_invalid(&self, id: &ObjectIdentifier) { self.ledger().invalid.insert(id.clone()); }

    pub fn is_invalid(&self, id: &ObjectIdentifier) -> bool { self.ledger().invalid.contains(id) }

    /// Apply failed or the object was invalid; its wait is skipped.
    pub fn apply_skipped(&self, id: &ObjectIdentifier) -> bool {
        let l = self.ledger();
        l.apply_failures.contains(id) || l.invalid.contains(id)
    }

    pub fn applied_uids(&self) -> FxHashSet<String> { self.ledger().applied_uids.clone() }

    pub fn applied_generation(&self, id: &ObjectIdentifier) -> Option<i64> { self.ledger().applied_generations.get(id).copied() }

    pub fn record_removal_skip(&self, id: &ObjectIdentifier, retain: bool) { self.ledger().removal_skips.insert(id.clone(), retain); }

    pub fn record_removal_failure(&self, id: &ObjectIdentifier) { self.ledger().removal_failures.insert(id.clone()); }

    pub fn record_removed(&self, id: &ObjectIdentifier) { self.ledger().removed.insert(id.clone()); }

    /// Prune/delete was skipped or failed; its wait is skipped.
    pub fn removal_skipped(&self, id: &ObjectIdentifier) -> bool {
        let l = self.ledger();
        l.removal_skips.contains_key(id) || l.removal_failures.contains(id)
    }

    /// Candidates that must stay in the inventory: failed removals and
    /// skips that were not released to another owner.
    pub fn retained(&self) -> Vec<ObjectIdentifier> {
        let l = self.ledger();
        let mut out: Vec<ObjectIdentifier> = l
            .removal_skips
            .iter()
            .filter(|(_, retain)| **retain)
            .map(|(id, _)| id)
            .chain(l.removal_failures.iter())
            .filter(|id| !l.removed.contains(*id))
            .cloned()
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::status::Status;

    fn ctx() -> (TaskContext, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TaskContext::new(tx, CancellationToken::new()), rx)
    }

    #[test]
    fn status_updates_bump_epoch_only_on_change() {
        let (ctx, _rx) = ctx();
        let rx = ctx.subscribe();
        let id = ObjectIdentifier::new("", "Pod", "ns", "p");
        assert!(ctx.update_status(ResourceStatus::new(id.clone(), Status::InProgress)));
        assert!(!ctx.update_status(ResourceStatus::new(id.clone(), Status::InProgress)));
        assert!(ctx.update_status(ResourceStatus::new(id.clone(), Status::Current)));
        assert_eq!(*rx.borrow(), 2);
        assert_eq!(ctx.status(&id).map(|s| s.status), Some(Status::Current));
    }

    #[test]
    fn retained_excludes_released_and_removed() {
        let (ctx, _rx) = ctx();
        let a = ObjectIdentifier::new("", "Pod", "ns", "a");
        let b = ObjectIdentifier::new("", "Pod", "ns", "b");
        let c = ObjectIdentifier::new("", "Pod", "ns", "c");
        ctx.record_removal_skip(&a, true);
        ctx.record_removal_skip(&b, false);
        ctx.record_removal_failure(&c);
        assert_eq!(ctx.retained(), vec![a.clone(), c.clone()]);
        assert!(ctx.removal_skipped(&b));
        ctx.record_apply_failure(&a);
        assert!(ctx.apply_skipped(&a));
        assert!(!ctx.apply_skipped(&b));
    }
}
