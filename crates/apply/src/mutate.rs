//! Apply task: create, patch or server-side apply each desired object.

use std::time::Instant;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use keel_core::client::{MutateOptions, PatchStrategy};
use keel_core::event::{ApplyEvent, ApplyOperation, Event};
use keel_core::object::{Object, ObjectIdentifier, OWNING_INVENTORY_ANNOTATION};
use metrics::{counter, histogram};
use tracing::{debug, warn};

use crate::context::TaskContext;
use crate::diff::is_unchanged;
use crate::inventory::can_apply;
use crate::task::RunEnv;

pub(crate) async fn apply_objects(ctx: &TaskContext, env: &RunEnv, group: &str, objects: &[Object]) {
    // Boxed up front so the spawned run future stays Send.
    let pending: Vec<BoxFuture<'_, (ObjectIdentifier, Result<ApplyOperation, String>)>> =
        objects.iter().cloned().map(|obj| apply_one(ctx, env, obj).boxed()).collect();
    let mut results = stream::iter(pending).buffered(env.concurrency.max(1));
    while let Some((identifier, res)) = results.next().await {
        let (operation, error) = match res {
            Ok(op) => (op, None),
            Err(e) => {
                warn!(object = %identifier.short(), error = %e, "apply: failed");
                ctx.record_apply_failure(&identifier);
                (ApplyOperation::Unspecified, Some(e))
            }
        };
        ctx.send(Event::Apply(ApplyEvent { group_name: group.to_string(), identifier, operation, error }));
    }
}

async fn apply_one(ctx: &TaskContext, env: &RunEnv, mut obj: Object) -> (ObjectIdentifier, Result<ApplyOperation, String>) {
    let id = obj.identifier();
    if ctx.is_invalid(&id) {
        return (id, Err("invalid object: duplicate identifier in the desired set".to_string()));
    }
    let started = Instant::now();
    obj.set_annotation(OWNING_INVENTORY_ANNOTATION, &env.inv.id);
    let res = mutate(ctx, env, &id, &obj).await;
    histogram!("apply_object_ms", started.elapsed().as_secs_f64() * 1000.0);
    match &res {
        Ok(op) => {
            counter!("apply_ok", 1u64);
            debug!(object = %id.short(), operation = ?op, "apply: done");
        }
        Err(_) => {
            counter!("apply_err", 1u64);
        }
    }
    (id, res)
}

async fn mutate(ctx: &TaskContext, env: &RunEnv, id: &ObjectIdentifier, obj: &Object) -> Result<ApplyOperation, String> {
    let live = env.client.get(id).await.map_err(|e| format!("reading live object: {e:#}"))?;
    can_apply(&env.inv.id, live.as_ref(), env.inventory_policy)?;

    if env.dry_run.client_only() {
        return Ok(match &live {
            _ if env.server_side_apply => ApplyOperation::ServerSideApplied,
            None => ApplyOperation::Created,
            Some(live) if is_unchanged(obj, live) => ApplyOperation::Unchanged,
            Some(_) => ApplyOperation::Configured,
        });
    }

    let opts = MutateOptions { dry_run: env.dry_run.server(), field_manager: env.field_manager.clone() };
    let (op, result) = if env.server_side_apply {
        let strategy = PatchStrategy::ServerSideApply { force: env.force_conflicts };
        (ApplyOperation::ServerSideApplied, env.client.patch(obj, strategy, &opts).await)
    } else {
        match live {
            None => (ApplyOperation::Created, env.client.create(obj, &opts).await),
            Some(live) if is_unchanged(obj, &live) => (ApplyOperation::Unchanged, Ok(live)),
            Some(_) => (ApplyOperation::Configured, env.client.patch(obj, PatchStrategy::Merge, &opts).await),
        }
    };
    let applied = result.map_err(|e| format!("{e:#}"))?;
    ctx.record_applied(id, applied.uid(), applied.generation());
    Ok(op)
}
