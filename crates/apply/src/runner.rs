//! Executes a task queue in order, feeding status into the shared context.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use keel_core::client::StatusSource;
use keel_core::event::{ErrorEvent, Event, ResourceAction, StatusEvent};
use keel_core::object::ObjectIdentifier;
use keel_core::status::ResourceStatus;
use metrics::histogram;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::TaskContext;
use crate::error::ApplyError;
use crate::task::{RunEnv, TaskQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Fatal,
}

pub(crate) struct Runner {
    pub queue: TaskQueue,
    pub ctx: Arc<TaskContext>,
    pub env: RunEnv,
    pub status: Arc<dyn StatusSource>,
    pub poll_interval: Duration,
    pub emit_status_events: bool,
}

impl Runner {
    /// Identifiers the status poller has to watch: every object the run applies,
    /// prunes or deletes, whether or not a wait is planned for it.
    fn watched(&self) -> Vec<ObjectIdentifier> {
        let mut ids: Vec<ObjectIdentifier> = self
            .queue
            .tasks()
            .iter()
            .filter(|t| !matches!(t.action(), ResourceAction::InventoryAdd | ResourceAction::InventorySet))
            .flat_map(|t| t.identifiers())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    fn spawn_poller(&self, ids: Vec<ObjectIdentifier>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut statuses = self.status.poll(ids, self.poll_interval, cancel);
        let ctx = Arc::clone(&self.ctx);
        let emit = self.emit_status_events;
        tokio::spawn(async move {
            while let Some(rs) = statuses.next().await {
                record_status(&ctx, rs, emit);
            }
            debug!("runner: status feed closed");
        })
    }

    /// One last poll once every task is done, so each watched object ends the
    /// run with a post-mutation status even when no wait was planned.
    async fn final_sweep(&self, ids: Vec<ObjectIdentifier>) {
        let n = ids.len();
        let cancel = self.ctx.cancel_token().child_token();
        let batch: Vec<ResourceStatus> = self.status.poll(ids, self.poll_interval, cancel.clone()).take(n).collect().await;
        cancel.cancel();
        debug!(statuses = batch.len(), "runner: final status sweep");
        for rs in batch {
            record_status(&self.ctx, rs, self.emit_status_events);
        }
    }

    pub async fn run(self) -> RunState {
        let started = Instant::now();
        debug!(state = ?RunState::Pending, tasks = self.queue.len(), "runner: start");
        let watched = self.watched();
        let poll_cancel = self.ctx.cancel_token().child_token();
        let poller = (!watched.is_empty()).then(|| self.spawn_poller(watched.clone(), poll_cancel.clone()));

        debug!(state = ?RunState::Running, "runner: executing");
        let mut failure: Option<ApplyError> = None;
        for task in self.queue.tasks() {
            if self.ctx.is_cancelled() {
                failure = Some(ApplyError::Cancelled);
                break;
            }
            debug!(task = task.name(), "runner: task start");
            if let Err(e) = task.execute(&self.ctx, &self.env).await {
                failure = Some(e);
                break;
            }
        }
        if failure.is_none() && self.ctx.is_cancelled() {
            failure = Some(ApplyError::Cancelled);
        }
        if failure.is_none() && !watched.is_empty() {
            self.final_sweep(watched).await;
        }

        poll_cancel.cancel();
        if let Some(handle) = poller {
            if let Err(e) = handle.await {
                warn!(error = %e, "runner: status poller panicked");
            }
        }

        let state = match failure {
            None => RunState::Completed,
            Some(e) => {
                let next = if e == ApplyError::Cancelled { RunState::Cancelled } else { RunState::Fatal };
                warn!(error = %e, "runner: stopped");
                self.ctx.send(Event::Error(ErrorEvent { error: e.to_string() }));
                next
            }
        };
        histogram!("run_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(?state, took_ms = started.elapsed().as_millis() as u64, "runner: done");
        state
    }
}

/// Cache `rs` and, when it changed and the caller asked for them, emit a Status event.
fn record_status(ctx: &TaskContext, rs: ResourceStatus, emit: bool) {
    let identifier = rs.identifier.clone();
    if ctx.update_status(rs.clone()) && emit {
        ctx.send(Event::Status(StatusEvent { identifier, resource: rs }));
    }
}
