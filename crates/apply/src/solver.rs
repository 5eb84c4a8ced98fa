//! Task queue builder: turns the desired and prune sets into ordered phases.

use std::time::Duration;

use keel_core::event::ResourceAction;
use keel_core::object::{Object, ObjectIdentifier};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{ApplyError, ApplyResult};
use crate::task::{Task, TaskQueue, WaitCondition};

/// Wait settings for one phase. No wait task is planned when disabled or the
/// timeout is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPlan {
    pub enabled: bool,
    pub timeout: Duration,
}

impl WaitPlan {
    pub fn new(timeout: Duration) -> Self { Self { enabled: true, timeout } }

    pub fn disabled() -> Self { Self { enabled: false, timeout: Duration::ZERO } }

    fn active(&self) -> bool { self.enabled && !self.timeout.is_zero() }
}

/// Namespaces and CRDs first, everything else after. Each tier is sorted.
fn tiers<T>(items: Vec<T>, id_of: impl Fn(&T) -> ObjectIdentifier) -> Vec<Vec<T>> {
    let (mut infra, mut rest): (Vec<T>, Vec<T>) = items.into_iter().partition(|t| id_of(t).is_infrastructure());
    infra.sort_by_cached_key(|t| id_of(t));
    rest.sort_by_cached_key(|t| id_of(t));
    vec![infra, rest].into_iter().filter(|t| !t.is_empty()).collect()
}

#[derive(Default)]
pub struct TaskQueueBuilder {
    tasks: Vec<Task>,
    counters: FxHashMap<ResourceAction, usize>,
}

impl TaskQueueBuilder {
    pub fn new() -> Self { Self::default() }

    fn next_name(&mut self, action: ResourceAction) -> String {
        let n = self.counters.entry(action).or_insert(0);
        *n += 1;
        format!("{}-{}", action.as_str(), n)
    }

    fn push_wait(&mut self, ids: Vec<ObjectIdentifier>, condition: WaitCondition, plan: WaitPlan) {
        if plan.active() {
            let name = self.next_name(ResourceAction::Wait);
            self.tasks.push(Task::Wait { name, ids, condition, timeout: plan.timeout });
        }
    }

    /// Record `ids` in the inventory before anything is mutated.
    pub fn append_inv_add_task(mut self, ids: Vec<ObjectIdentifier>) -> Self {
        let name = self.next_name(ResourceAction::InventoryAdd);
        self.tasks.push(Task::InventoryAdd { name, ids });
        self
    }

    pub fn append_apply_wait_tasks(mut self, objects: Vec<Object>, wait: WaitPlan) -> Self {
        for tier in tiers(objects, Object::identifier) {
            let ids: Vec<ObjectIdentifier> = tier.iter().map(Object::identifier).collect();
            let name = self.next_name(ResourceAction::Apply);
            self.tasks.push(Task::Apply { name, objects: tier });
            self.push_wait(ids, WaitCondition::Current, wait);
        }
        self
    }

    /// Dependents go before the namespaces and CRDs they live in.
    pub fn append_prune_wait_tasks(mut self, ids: Vec<ObjectIdentifier>, wait: WaitPlan) -> Self {
        for tier in tiers(ids, Clone::clone).into_iter().rev() {
            let name = self.next_name(ResourceAction::Prune);
            self.tasks.push(Task::Prune { name, ids: tier.clone() });
            self.push_wait(tier, WaitCondition::NotFound, wait);
        }
        self
    }

    pub fn append_delete_wait_tasks(mut self, ids: Vec<ObjectIdentifier>, wait: WaitPlan) -> Self {
        for tier in tiers(ids, Clone::clone).into_iter().rev() {
            let name = self.next_name(ResourceAction::Delete);
            self.tasks.push(Task::Delete { name, ids: tier.clone() });
            self.push_wait(tier, WaitCondition::NotFound, wait);
        }
        self
    }

    /// Final inventory commit. `delete_when_empty` removes the inventory when
    /// nothing is left to record.
    pub fn append_inv_set_task(mut self, ids: Vec<ObjectIdentifier>, delete_when_empty: bool) -> Self {
        let name = self.next_name(ResourceAction::InventorySet);
        self.tasks.push(Task::InventorySet { name, ids, delete_when_empty });
        self
    }

    /// Checks that no identifier is planned twice for the same action.
    pub fn build(self) -> ApplyResult<TaskQueue> {
        let mut seen: FxHashMap<ResourceAction, FxHashSet<ObjectIdentifier>> = FxHashMap::default();
        for task in &self.tasks {
            let action = task.action();
            if matches!(action, ResourceAction::InventoryAdd | ResourceAction::InventorySet) {
                continue;
            }
            let ids = task.identifiers();
            if ids.is_empty() {
                return Err(ApplyError::InvalidPlan(format!("{} has no objects", task.name())));
            }
            let set = seen.entry(action).or_default();
            for id in ids {
                if !set.insert(id.clone()) {
                    return Err(ApplyError::InvalidPlan(format!("{} planned twice for {}", id.short(), action)));
                }
            }
        }
        Ok(TaskQueue::new(self.tasks))
    }
}
