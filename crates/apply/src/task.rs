//! Planned tasks and the environment they execute in.

use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_core::client::{DryRunStrategy, PropagationPolicy, ResourceClient};
use keel_core::event::{ActionGroup, ResourceAction};
use keel_core::inventory::{InventoryClient, InventoryInfo, InventoryPolicy};
use keel_core::object::{Object, ObjectIdentifier};
use metrics::histogram;
use tracing::info;

use crate::context::TaskContext;
use crate::error::{ApplyError, ApplyResult};
use crate::filter::ValidationFilter;
use crate::{mutate, remove, wait};

/// What a wait task waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    /// Reconciled (`Current`) at or beyond the applied generation.
    Current,
    /// Gone from the remote system.
    NotFound,
}

#[derive(Debug, Clone)]
pub enum Task {
    InventoryAdd { name: String, ids: Vec<ObjectIdentifier> },
    Apply { name: String, objects: Vec<Object> },
    Wait { name: String, ids: Vec<ObjectIdentifier>, condition: WaitCondition, timeout: Duration },
    Prune { name: String, ids: Vec<ObjectIdentifier> },
    Delete { name: String, ids: Vec<ObjectIdentifier> },
    /// Commit `ids` plus whatever removals left behind.
    InventorySet { name: String, ids: Vec<ObjectIdentifier>, delete_when_empty: bool },
}

impl Task {
    pub fn name(&self) -> &str {
        match self {
            Task::InventoryAdd { name, .. }
            | Task::Apply { name, .. }
            | Task::Wait { name, .. }
            | Task::Prune { name, .. }
            | Task::Delete { name, .. }
            | Task::InventorySet { name, .. } => name,
        }
    }

    pub fn action(&self) -> ResourceAction {
        match self {
            Task::InventoryAdd { .. } => ResourceAction::InventoryAdd,
            Task::Apply { .. } => ResourceAction::Apply,
            Task::Wait { .. } => ResourceAction::Wait,
            Task::Prune { .. } => ResourceAction::Prune,
            Task::Delete { .. } => ResourceAction::Delete,
            Task::InventorySet { .. } => ResourceAction::InventorySet,
        }
    }

    pub fn identifiers(&self) -> Vec<ObjectIdentifier> {
        match self {
            Task::Apply { objects, .. } => objects.iter().map(Object::identifier).collect(),
            Task::InventoryAdd { ids, .. }
            | Task::Wait { ids, .. }
            | Task::Prune { ids, .. }
            | Task::Delete { ids, .. }
            | Task::InventorySet { ids, .. } => ids.clone(),
        }
    }

    pub fn action_group(&self) -> ActionGroup {
        ActionGroup { name: self.name().to_string(), action: self.action(), identifiers: self.identifiers() }
    }

    /// Per-object failures are recorded as events; an `Err` aborts the run.
    pub(crate) async fn execute(&self, ctx: &TaskContext, env: &RunEnv) -> ApplyResult<()> {
        match self {
            Task::InventoryAdd { ids, .. } => store_inventory(env, ids, false).await,
            Task::Apply { name, objects } => {
                mutate::apply_objects(ctx, env, name, objects).await;
                Ok(())
            }
            Task::Wait { name, ids, condition, timeout } => {
                wait::wait_for(ctx, name, ids, *condition, *timeout).await;
                Ok(())
            }
            Task::Prune { name, ids } => {
                remove::remove_objects(ctx, env, name, ids, remove::Mode::Prune).await;
                Ok(())
            }
            Task::Delete { name, ids } => {
                remove::remove_objects(ctx, env, name, ids, remove::Mode::Delete).await;
                Ok(())
            }
            Task::InventorySet { ids, delete_when_empty, .. } => {
                let mut all = ids.clone();
                all.extend(ctx.retained());
                all.sort();
                all.dedup();
                store_inventory(env, &all, *delete_when_empty).await
            }
        }
    }
}

async fn store_inventory(env: &RunEnv, ids: &[ObjectIdentifier], delete_when_empty: bool) -> ApplyResult<()> {
    let started = Instant::now();
    let res = if ids.is_empty() && delete_when_empty {
        env.inventory.delete(&env.inv, env.dry_run).await
    } else {
        env.inventory.store(&env.inv, ids, env.dry_run).await
    };
    histogram!("inventory_store_ms", started.elapsed().as_secs_f64() * 1000.0);
    res.map_err(|e| ApplyError::fatal("writing inventory", e))?;
    info!(inventory = %env.inv.name, objects = ids.len(), dry_run = ?env.dry_run, "inventory: updated");
    Ok(())
}

/// Immutable plan produced by the task queue builder.
#[derive(Debug, Clone, Default)]
pub struct TaskQueue {
    tasks: Vec<Task>,
}

impl TaskQueue {
    pub(crate) fn new(tasks: Vec<Task>) -> Self { Self { tasks } }

    pub fn tasks(&self) -> &[Task] { &self.tasks }

    pub fn len(&self) -> usize { self.tasks.len() }

    pub fn is_empty(&self) -> bool { self.tasks.is_empty() }

    pub fn action_groups(&self) -> Vec<ActionGroup> { self.tasks.iter().map(Task::action_group).collect() }
}

/// Collaborators and settings shared by every task of one run.
pub(crate) struct RunEnv {
    pub client: Arc<dyn ResourceClient>,
    pub inventory: Arc<dyn InventoryClient>,
    pub inv: InventoryInfo,
    pub dry_run: DryRunStrategy,
    pub server_side_apply: bool,
    pub force_conflicts: bool,
    pub field_manager: String,
    pub inventory_policy: InventoryPolicy,
    pub propagation: PropagationPolicy,
    pub concurrency: usize,
    /// Filters in evaluation order for prune and delete tasks.
    pub filters: Vec<Arc<dyn ValidationFilter>>,
    /// Append a current-UID filter fed by this run's applies when pruning.
    pub uid_filter: bool,
}

pub(crate) fn concurrency_from_env() -> usize {
    std::env::var("KEEL_APPLY_CONCURRENCY").ok().and_then(|s| s.parse::<usize>().ok()).filter(|n| *n > 0).unwrap_or(8)
}
