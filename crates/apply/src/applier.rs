//! Applier: validates a desired set, plans the run and streams its events.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use keel_core::client::{DryRunStrategy, PropagationPolicy, ResourceClient, StatusSource};
use keel_core::event::{ErrorEvent, Event, InitEvent, ValidationEvent};
use keel_core::inventory::{InventoryClient, InventoryInfo, InventoryPolicy};
use keel_core::object::{Object, ObjectIdentifier};
use metrics::histogram;
use rustc_hash::FxHashSet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::TaskContext;
use crate::diff::prune_candidates;
use crate::error::{ApplyError, ApplyResult};
use crate::filter::{InventoryPolicyFilter, LocalNamespacesFilter, PreventRemoveFilter, ValidationFilter};
use crate::runner::Runner;
use crate::solver::{TaskQueueBuilder, WaitPlan};
use crate::task::{concurrency_from_env, RunEnv};

#[derive(Debug, Clone)]
pub struct ApplierOptions {
    pub server_side_apply: bool,
    pub force_conflicts: bool,
    pub field_manager: String,
    /// Zero means fire-and-forget: no wait tasks.
    pub reconcile_timeout: Duration,
    pub poll_interval: Duration,
    pub emit_status_events: bool,
    pub prune: bool,
    pub dry_run: DryRunStrategy,
    pub prune_propagation_policy: PropagationPolicy,
    pub prune_timeout: Duration,
    pub inventory_policy: InventoryPolicy,
    /// Mutations in flight per group.
    pub concurrency: usize,
}

impl Default for ApplierOptions {
    fn default() -> Self {
        Self {
            server_side_apply: false,
            force_conflicts: false,
            field_manager: "keel".into(),
            reconcile_timeout: Duration::ZERO,
            poll_interval: Duration::from_secs(2),
            emit_status_events: true,
            prune: true,
            dry_run: DryRunStrategy::None,
            prune_propagation_policy: PropagationPolicy::Background,
            prune_timeout: Duration::ZERO,
            inventory_policy: InventoryPolicy::MustMatch,
            concurrency: concurrency_from_env(),
        }
    }
}

/// Ordered event stream of one run. Ends once the run has finished.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Event>) -> Self { Self { rx } }

    pub async fn recv(&mut self) -> Option<Event> { self.rx.recv().await }

    /// Drain the stream to completion.
    pub async fn collect_all(mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Some(ev) = self.rx.recv().await {
            out.push(ev);
        }
        out
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> { self.rx.poll_recv(cx) }
}

/// Collaborators shared by the applier and the destroyer.
#[derive(Clone)]
pub(crate) struct Collaborators {
    pub client: Arc<dyn ResourceClient>,
    pub inventory: Arc<dyn InventoryClient>,
    pub status: Arc<dyn StatusSource>,
    /// Appended after the built-in prune/delete filters.
    pub extra_filters: Vec<Arc<dyn ValidationFilter>>,
}

impl Collaborators {
    pub async fn load_inventory(&self, inv: &InventoryInfo) -> ApplyResult<Vec<ObjectIdentifier>> {
        let started = Instant::now();
        let res = self.inventory.load(inv).await.map_err(|e| ApplyError::fatal("reading inventory", e));
        histogram!("inventory_load_ms", started.elapsed().as_secs_f64() * 1000.0);
        res
    }
}

pub(crate) fn fail(ctx: &TaskContext, err: ApplyError) {
    warn!(error = %err, "applier: run aborted");
    ctx.send(Event::Error(ErrorEvent { error: err.to_string() }));
}

#[derive(Clone)]
pub struct Applier {
    parts: Collaborators,
}

impl Applier {
    pub fn new(client: Arc<dyn ResourceClient>, inventory: Arc<dyn InventoryClient>, status: Arc<dyn StatusSource>) -> Self {
        Self { parts: Collaborators { client, inventory, status, extra_filters: Vec::new() } }
    }

    /// Add a prune filter evaluated after the built-in ones.
    pub fn with_filter(mut self, filter: impl ValidationFilter + 'static) -> Self {
        self.parts.extra_filters.push(Arc::new(filter));
        self
    }

    /// Start a run. Returns immediately; the work happens on a background task
    /// whose events arrive on the returned stream, `Init` first.
    pub fn run(
        &self,
        cancel: CancellationToken,
        inventory: Option<InventoryInfo>,
        objects: Vec<Object>,
        opts: ApplierOptions,
    ) -> ApplyResult<EventStream> {
        let inv = inventory.ok_or_else(|| ApplyError::Validation("an inventory is required".into()))?;
        let inv_id = inv.identifier();
        if objects.iter().any(|o| o.identifier() == inv_id) {
            return Err(ApplyError::Validation(format!(
                "inventory object {} must not be part of the applied objects",
                inv_id.short()
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(TaskContext::new(tx, cancel));
        let parts = self.parts.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrate(parts, Arc::clone(&ctx), inv, objects, opts).await {
                fail(&ctx, e);
            }
        });
        Ok(EventStream::new(rx))
    }
}

/// Split off repeated identifiers; the first occurrence is kept.
fn dedupe(objects: Vec<Object>) -> (Vec<Object>, Vec<ObjectIdentifier>) {
    let mut seen = FxHashSet::default();
    let mut dups = Vec::new();
    let mut keep = Vec::with_capacity(objects.len());
    for obj in objects {
        let id = obj.identifier();
        if seen.insert(id.clone()) {
            keep.push(obj);
        } else if !dups.contains(&id) {
            dups.push(id);
        }
    }
    (keep, dups)
}

async fn orchestrate(
    parts: Collaborators,
    ctx: Arc<TaskContext>,
    inv: InventoryInfo,
    objects: Vec<Object>,
    opts: ApplierOptions,
) -> ApplyResult<()> {
    info!(inventory = %inv.name, objects = objects.len(), dry_run = ?opts.dry_run, "applier: run start");
    let previous = parts.load_inventory(&inv).await?;

    let (objects, duplicates) = dedupe(objects);
    let desired: Vec<ObjectIdentifier> = objects.iter().map(Object::identifier).collect();

    // Kinds introduced by CRDs in this set cannot be resolved until those CRDs land.
    let crd_kinds: FxHashSet<(String, String)> = objects.iter().filter_map(Object::crd_defines).collect();
    let resolvable: Vec<ObjectIdentifier> =
        desired.iter().filter(|id| !crd_kinds.contains(&(id.group.clone(), id.kind.clone()))).cloned().collect();
    parts.client.resolve(&resolvable).await.map_err(|e| ApplyError::fatal("resolving resource kinds", e))?;

    let candidates = if opts.prune { prune_candidates(&previous, &desired) } else { Vec::new() };
    let kept = if opts.prune { Vec::new() } else { prune_candidates(&previous, &desired) };
    let waits = !opts.dry_run.is_dry_run();
    let apply_wait = if waits { WaitPlan::new(opts.reconcile_timeout) } else { WaitPlan::disabled() };
    let prune_wait = if waits { WaitPlan::new(opts.prune_timeout) } else { WaitPlan::disabled() };

    let mut first = previous.clone();
    first.extend(desired.iter().cloned());
    first.sort();
    first.dedup();
    let mut last = desired.clone();
    last.extend(kept);

    let mut filters: Vec<Arc<dyn ValidationFilter>> = vec![
        Arc::new(PreventRemoveFilter),
        Arc::new(InventoryPolicyFilter::new(&inv, opts.inventory_policy)),
        Arc::new(LocalNamespacesFilter::local_to(&inv, &objects)),
    ];
    filters.extend(parts.extra_filters.iter().cloned());

    let queue = TaskQueueBuilder::new()
        .append_inv_add_task(first)
        .append_apply_wait_tasks(objects, apply_wait)
        .append_prune_wait_tasks(candidates, prune_wait)
        .append_inv_set_task(last, false)
        .build()?;

    ctx.send(Event::Init(InitEvent { action_groups: queue.action_groups() }));
    if !duplicates.is_empty() {
        for id in &duplicates {
            ctx.mark_invalid(id);
        }
        ctx.send(Event::Validation(ValidationEvent {
            identifiers: duplicates,
            error: "duplicate object identifier in the desired set".into(),
        }));
    }

    let env = RunEnv {
        client: parts.client,
        inventory: parts.inventory,
        inv,
        dry_run: opts.dry_run,
        server_side_apply: opts.server_side_apply,
        force_conflicts: opts.force_conflicts,
        field_manager: opts.field_manager,
        inventory_policy: opts.inventory_policy,
        propagation: opts.prune_propagation_policy,
        concurrency: opts.concurrency,
        filters,
        uid_filter: true,
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(name: &str) -> Object {
        Object::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "ns"}})).unwrap()
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let (keep, dups) = dedupe(vec![cm("a"), cm("b"), cm("a"), cm("a")]);
        assert_eq!(keep.len(), 2);
        assert_eq!(dups, vec![cm("a").identifier()]);
    }

    #[test]
    fn defaults_follow_documented_values() {
        let o = ApplierOptions::default();
        assert_eq!(o.poll_interval, Duration::from_secs(2));
        assert_eq!(o.prune_propagation_policy, PropagationPolicy::Background);
        assert!(o.prune);
        assert_eq!(o.field_manager, "keel");
        assert!(o.concurrency > 0);
    }
}
