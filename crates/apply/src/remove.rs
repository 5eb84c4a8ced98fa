//! Prune and delete tasks: run the filter chain, then delete what passes.

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use keel_core::client::DeleteOptions;
use keel_core::event::{DeleteEvent, DeleteOperation, Event, PruneEvent, PruneOperation};
use keel_core::object::ObjectIdentifier;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::context::TaskContext;
use crate::filter::{evaluate, CurrentUidFilter, ValidationFilter, Verdict};
use crate::task::RunEnv;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Prune,
    Delete,
}

enum Outcome {
    Removed,
    Skipped { reason: String },
    Failed { reason: Option<String>, error: String },
}

pub(crate) async fn remove_objects(ctx: &TaskContext, env: &RunEnv, group: &str, ids: &[ObjectIdentifier], mode: Mode) {
    let uid_filter = (mode == Mode::Prune && env.uid_filter).then(|| CurrentUidFilter::new(ctx.applied_uids()));
    let mut chain: Vec<&dyn ValidationFilter> = env.filters.iter().map(|f| f.as_ref()).collect();
    if let Some(f) = &uid_filter {
        chain.push(f);
    }
    let chain = &chain;
    let pending: Vec<BoxFuture<'_, (ObjectIdentifier, Outcome)>> =
        ids.iter().map(|id| remove_one(ctx, env, chain, id).boxed()).collect();
    let mut results = stream::iter(pending).buffered(env.concurrency.max(1));
    while let Some((id, outcome)) = results.next().await {
        ctx.send(event_for(group, id, outcome, mode));
    }
}

async fn remove_one(
    ctx: &TaskContext,
    env: &RunEnv,
    chain: &[&dyn ValidationFilter],
    id: &ObjectIdentifier,
) -> (ObjectIdentifier, Outcome) {
    let outcome = match env.client.get(id).await {
        Err(e) => Outcome::Failed { reason: None, error: format!("reading live object: {e:#}") },
        Ok(None) => {
            debug!(object = %id.short(), "prune: already gone");
            Outcome::Removed
        }
        Ok(Some(live)) => match evaluate(chain.iter().copied(), &live) {
            Some(decision) => {
                let reason = decision.to_string();
                match decision.verdict {
                    Verdict::Skip { retain, .. } => {
                        ctx.record_removal_skip(id, retain);
                        Outcome::Skipped { reason }
                    }
                    Verdict::Fail { error, retain } => {
                        ctx.record_removal_skip(id, retain);
                        Outcome::Failed { reason: Some(decision.filter.to_string()), error }
                    }
                    Verdict::Allow => Outcome::Removed,
                }
            }
            None if env.dry_run.client_only() => Outcome::Removed,
            None => {
                let opts = DeleteOptions { dry_run: env.dry_run.server(), propagation: env.propagation };
                match env.client.delete(id, &opts).await {
                    Ok(()) => Outcome::Removed,
                    Err(e) => Outcome::Failed { reason: None, error: format!("{e:#}") },
                }
            }
        },
    };
    match &outcome {
        Outcome::Removed => {
            ctx.record_removed(id);
            counter!("prune_ok", 1u64);
            info!(object = %id.short(), dry_run = ?env.dry_run, "prune: removed");
        }
        Outcome::Skipped { reason } => {
            counter!("prune_skipped", 1u64);
            info!(object = %id.short(), %reason, "prune: skipped");
        }
        Outcome::Failed { error, .. } => {
            if !ctx.removal_skipped(id) {
                ctx.record_removal_failure(id);
            }
            counter!("prune_err", 1u64);
            warn!(object = %id.short(), %error, "prune: failed");
        }
    }
    (id.clone(), outcome)
}

fn event_for(group: &str, identifier: ObjectIdentifier, outcome: Outcome, mode: Mode) -> Event {
    let group_name = group.to_string();
    match mode {
        Mode::Prune => {
            let (operation, reason, error) = match outcome {
                Outcome::Removed => (PruneOperation::Pruned, None, None),
                Outcome::Skipped { reason } => (PruneOperation::Skipped, Some(reason), None),
                Outcome::Failed { reason: Some(r), error } => (PruneOperation::Skipped, Some(r), Some(error)),
                Outcome::Failed { reason: None, error } => (PruneOperation::Unspecified, None, Some(error)),
            };
            Event::Prune(PruneEvent { group_name, identifier, operation, reason, error })
        }
        Mode::Delete => {
            let (operation, reason, error) = match outcome {
                Outcome::Removed => (DeleteOperation::Deleted, None, None),
                Outcome::Skipped { reason } => (DeleteOperation::Skipped, Some(reason), None),
                Outcome::Failed { reason: Some(r), error } => (DeleteOperation::Skipped, Some(r), Some(error)),
                Outcome::Failed { reason: None, error } => (DeleteOperation::Unspecified, None, Some(error)),
            };
            Event::Delete(DeleteEvent { group_name, identifier, operation, reason, error })
        }
    }
}
