//! Wait task: block until every identifier reaches its terminal status,
//! the timeout elapses or the run is cancelled.

use std::time::Duration;

use keel_core::event::{Event, WaitEvent, WaitOperation};
use keel_core::object::ObjectIdentifier;
use keel_core::status::Status;
use metrics::counter;
use tracing::{debug, info};

use crate::context::TaskContext;
use crate::task::WaitCondition;

pub(crate) async fn wait_for(ctx: &TaskContext, group: &str, ids: &[ObjectIdentifier], condition: WaitCondition, timeout: Duration) {
    let emit = |identifier: &ObjectIdentifier, operation: WaitOperation| {
        ctx.send(Event::Wait(WaitEvent { group_name: group.to_string(), identifier: identifier.clone(), operation }));
    };

    let mut pending = Vec::with_capacity(ids.len());
    for id in ids {
        let skipped = match condition {
            WaitCondition::Current => ctx.apply_skipped(id),
            WaitCondition::NotFound => ctx.removal_skipped(id),
        };
        if skipped {
            emit(id, WaitOperation::ReconcileSkipped);
        } else {
            pending.push(id.clone());
        }
    }

    let mut rx = ctx.subscribe();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    debug!(group, pending = pending.len(), ?timeout, "wait: start");
    loop {
        rx.borrow_and_update();
        pending.retain(|id| match resolve(ctx, id, condition) {
            Some(op) => {
                emit(id, op);
                false
            }
            None => true,
        });
        if pending.is_empty() {
            break;
        }
        tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => {
                for id in &pending {
                    emit(id, WaitOperation::Cancelled);
                }
                info!(group, unresolved = pending.len(), "wait: cancelled");
                break;
            }
            _ = &mut deadline => {
                for id in &pending {
                    emit(id, WaitOperation::ReconcileTimeout);
                }
                counter!("wait_timeout", pending.len() as u64);
                info!(group, unresolved = pending.len(), "wait: timed out");
                break;
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    // Status feed gone; nothing can resolve before the deadline.
                    tokio::select! {
                        _ = ctx.cancel_token().cancelled() => {}
                        _ = &mut deadline => {}
                    }
                }
            }
        }
    }
}

fn resolve(ctx: &TaskContext, id: &ObjectIdentifier, condition: WaitCondition) -> Option<WaitOperation> {
    let rs = ctx.status(id)?;
    match condition {
        WaitCondition::Current => {
            // A status observed before our mutation says nothing about it.
            let stale = matches!((ctx.applied_generation(id), rs.generation), (Some(want), Some(seen)) if seen < want);
            match rs.status {
                _ if stale => None,
                Status::Current => Some(WaitOperation::Reconciled),
                Status::Failed => Some(WaitOperation::ReconcileFailed),
                _ => None,
            }
        }
        WaitCondition::NotFound => match rs.status {
            Status::NotFound => Some(WaitOperation::Reconciled),
            _ => None,
        },
    }
}
