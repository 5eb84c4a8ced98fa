//! Destroyer: deletes everything an inventory owns.

use std::sync::Arc;
use std::time::Duration;

use keel_core::client::{DryRunStrategy, PropagationPolicy, ResourceClient, StatusSource};
use keel_core::event::{Event, InitEvent};
use keel_core::inventory::{InventoryClient, InventoryInfo, InventoryPolicy};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::applier::{fail, Collaborators, EventStream};
use crate::context::TaskContext;
use crate::error::ApplyResult;
use crate::filter::{InventoryPolicyFilter, PreventRemoveFilter, ValidationFilter};
use crate::runner::Runner;
use crate::solver::{TaskQueueBuilder, WaitPlan};
use crate::task::{concurrency_from_env, RunEnv};

#[derive(Debug, Clone)]
pub struct DestroyerOptions {
    pub dry_run: DryRunStrategy,
    pub propagation_policy: PropagationPolicy,
    /// Zero skips waiting for deletions to finish.
    pub delete_timeout: Duration,
    pub poll_interval: Duration,
    pub emit_status_events: bool,
    pub inventory_policy: InventoryPolicy,
    pub concurrency: usize,
}

impl Default for DestroyerOptions {
    fn default() -> Self {
        Self {
            dry_run: DryRunStrategy::None,
            propagation_policy: PropagationPolicy::Background,
            delete_timeout: Duration::ZERO,
            poll_interval: Duration::from_secs(2),
            emit_status_events: true,
            inventory_policy: InventoryPolicy::MustMatch,
            concurrency: concurrency_from_env(),
        }
    }
}

#[derive(Clone)]
pub struct Destroyer {
    parts: Collaborators,
}

impl Destroyer {
    pub fn new(client: Arc<dyn ResourceClient>, inventory: Arc<dyn InventoryClient>, status: Arc<dyn StatusSource>) -> Self {
        Self { parts: Collaborators { client, inventory, status, extra_filters: Vec::new() } }
    }

    /// Add a delete filter evaluated after the built-in ones.
    pub fn with_filter(mut self, filter: impl ValidationFilter + 'static) -> Self {
        self.parts.extra_filters.push(Arc::new(filter));
        self
    }

    /// Delete every object in `inventory`, dependents before namespaces and CRDs.
    /// Objects left behind stay in the inventory; an emptied inventory is removed.
    pub fn run(&self, cancel: CancellationToken, inventory: InventoryInfo, opts: DestroyerOptions) -> ApplyResult<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(TaskContext::new(tx, cancel));
        let parts = self.parts.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrate(parts, Arc::clone(&ctx), inventory, opts).await {
                fail(&ctx, e);
            }
        });
        Ok(EventStream::new(rx))
    }
}

async fn orchestrate(parts: Collaborators, ctx: Arc<TaskContext>, inv: InventoryInfo, opts: DestroyerOptions) -> ApplyResult<()> {
    let mut ids = parts.load_inventory(&inv).await?;
    ids.sort();
    ids.dedup();
    info!(inventory = %inv.name, objects = ids.len(), dry_run = ?opts.dry_run, "destroyer: run start");
    let wait = if opts.dry_run.is_dry_run() { WaitPlan::disabled() } else { WaitPlan::new(opts.delete_timeout) };

    let mut filters: Vec<Arc<dyn ValidationFilter>> =
        vec![Arc::new(PreventRemoveFilter), Arc::new(InventoryPolicyFilter::new(&inv, opts.inventory_policy))];
    filters.extend(parts.extra_filters.iter().cloned());

    let queue = TaskQueueBuilder::new().append_delete_wait_tasks(ids, wait).append_inv_set_task(Vec::new(), true).build()?;
    ctx.send(Event::Init(InitEvent { action_groups: queue.action_groups() }));

    let env = RunEnv {
        client: parts.client,
        inventory: parts.inventory,
        inv,
        dry_run: opts.dry_run,
        server_side_apply: false,
        force_conflicts: false,
        field_manager: String::new(),
        inventory_policy: opts.inventory_policy,
        propagation: opts.propagation_policy,
        concurrency: opts.concurrency,
        filters,
        uid_filter: false,
    };
    let runner = Runner {
        queue,
        ctx,
        env,
        status: parts.status,
        poll_interval: opts.poll_interval,
        emit_status_events: opts.emit_status_events,
    };
    runner.run().await;
    Ok(())
}
