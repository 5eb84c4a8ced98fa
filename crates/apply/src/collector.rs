//! Resource state collector: folds the event stream into per-object state.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::{Stream, StreamExt};
use keel_core::event::{
    ActionGroup, ApplyOperation, DeleteOperation, Event, PruneOperation, ResourceAction, WaitOperation,
};
use keel_core::object::ObjectIdentifier;
use keel_core::stats::{ResultError, Stats};
use keel_core::status::{ResourceStatus, Status};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollectorError {
    #[error("validation event without identifiers: {0}")]
    EmptyValidation(String),
    #[error("run failed: {0}")]
    Run(String),
    #[error(transparent)]
    Failed(#[from] ResultError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub identifier: ObjectIdentifier,
    pub action: ResourceAction,
    pub status: ResourceStatus,
    pub apply_op: ApplyOperation,
    pub prune_op: PruneOperation,
    pub delete_op: DeleteOperation,
    pub wait_op: WaitOperation,
    pub error: Option<String>,
}

impl ResourceInfo {
    fn new(identifier: ObjectIdentifier, action: ResourceAction) -> Self {
        Self {
            status: ResourceStatus::unknown(identifier.clone()),
            identifier,
            action,
            apply_op: ApplyOperation::Unspecified,
            prune_op: PruneOperation::Unspecified,
            delete_op: DeleteOperation::Unspecified,
            wait_op: WaitOperation::Pending,
            error: None,
        }
    }

    pub fn sub_resources(&self) -> &[ResourceStatus] { &self.status.generated }
}

/// Copy of the collector state at one moment, sorted by identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceState {
    pub resources: Vec<ResourceInfo>,
    pub error: Option<String>,
}

#[derive(Default)]
struct State {
    infos: FxHashMap<ObjectIdentifier, ResourceInfo>,
    error: Option<String>,
}

#[derive(Default)]
pub struct ResourceStateCollector {
    state: RwLock<State>,
}

impl ResourceStateCollector {
    /// Track the objects of the planned groups. Wait and inventory groups add nothing.
    pub fn new(groups: &[ActionGroup]) -> Self {
        let me = Self::default();
        me.register(groups);
        me
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> { self.state.write().unwrap_or_else(|e| e.into_inner()) }

    fn read(&self) -> RwLockReadGuard<'_, State> { self.state.read().unwrap_or_else(|e| e.into_inner()) }

    fn register(&self, groups: &[ActionGroup]) {
        let mut st = self.write();
        for g in groups {
            if !matches!(g.action, ResourceAction::Apply | ResourceAction::Prune | ResourceAction::Delete) {
                continue;
            }
            for id in &g.identifiers {
                st.infos.entry(id.clone()).or_insert_with(|| ResourceInfo::new(id.clone(), g.action));
            }
        }
    }

    /// Fold one event. Unknown identifiers are ignored. An `Error` event is
    /// kept as the run error and returned.
    pub fn process_event(&self, ev: &Event) -> Result<(), CollectorError> {
        if let Event::Init(init) = ev {
            self.register(&init.action_groups);
            return Ok(());
        }
        let mut st = self.write();
        match ev {
            Event::Init(_) => {}
            Event::Error(e) => {
                st.error = Some(e.error.clone());
                return Err(CollectorError::Run(e.error.clone()));
            }
            Event::Validation(v) => {
                if v.identifiers.is_empty() {
                    return Err(CollectorError::EmptyValidation(v.error.clone()));
                }
                for id in &v.identifiers {
                    if let Some(info) = st.infos.get_mut(id) {
                        info.status = ResourceStatus::new(id.clone(), Status::Invalid).with_message(v.error.clone());
                    }
                }
            }
            Event::Apply(e) => with_info(&mut st, &e.identifier, |info| {
                info.apply_op = e.operation;
                info.error = e.error.clone();
            }),
            Event::Prune(e) => with_info(&mut st, &e.identifier, |info| {
                info.prune_op = e.operation;
                info.error = e.error.clone();
            }),
            Event::Delete(e) => with_info(&mut st, &e.identifier, |info| {
                info.delete_op = e.operation;
                info.error = e.error.clone();
            }),
            Event::Wait(e) => with_info(&mut st, &e.identifier, |info| info.wait_op = e.operation),
            Event::Status(e) => with_info(&mut st, &e.identifier, |info| info.status = e.resource.clone()),
        }
        Ok(())
    }

    /// Fold a whole stream, calling `on_event` for each event after it is
    /// recorded. Stops at the first collector error.
    pub async fn listen<S, F>(&self, events: S, mut on_event: F) -> Result<(), CollectorError>
    where
        S: Stream<Item = Event>,
        F: FnMut(&Event),
    {
        futures::pin_mut!(events);
        while let Some(ev) = events.next().await {
            let res = self.process_event(&ev);
            on_event(&ev);
            res?;
        }
        Ok(())
    }

    pub fn latest_state(&self) -> ResourceState {
        let st = self.read();
        let mut resources: Vec<ResourceInfo> = st.infos.values().cloned().collect();
        resources.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        ResourceState { resources, error: st.error.clone() }
    }

    pub fn stats(&self) -> Stats {
        let st = self.read();
        let mut s = Stats::default();
        for info in st.infos.values() {
            let failed = info.error.is_some();
            match info.action {
                ResourceAction::Apply if failed => s.apply.inc_failed(),
                ResourceAction::Apply => s.apply.inc(info.apply_op),
                ResourceAction::Prune if failed => s.prune.inc_failed(),
                ResourceAction::Prune => s.prune.inc(info.prune_op),
                ResourceAction::Delete if failed => s.delete.inc_failed(),
                ResourceAction::Delete => s.delete.inc(info.delete_op),
                _ => {}
            }
            s.wait.inc(info.wait_op);
        }
        s
    }

    /// The run error if one was seen, else a composite failure when any
    /// object failed or timed out.
    pub fn result(&self) -> Result<(), CollectorError> {
        if let Some(err) = self.read().error.clone() {
            return Err(CollectorError::Run(err));
        }
        let stats = self.stats();
        if stats.failed_count() > 0 {
            return Err(ResultError { stats }.into());
        }
        Ok(())
    }
}

fn with_info(st: &mut State, id: &ObjectIdentifier, f: impl FnOnce(&mut ResourceInfo)) {
    match st.infos.get_mut(id) {
        Some(info) => f(info),
        None => debug!(object = %id, "collector: event for unknown object ignored"),
    }
}
