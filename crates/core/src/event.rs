//! Events emitted by a run. The stream is the only channel leaving the engine;
//! the order of events is significant.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::object::ObjectIdentifier;
use crate::status::ResourceStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceAction {
    Apply,
    Wait,
    Prune,
    Delete,
    InventoryAdd,
    InventorySet,
}

impl ResourceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceAction::Apply => "apply",
            ResourceAction::Wait => "wait",
            ResourceAction::Prune => "prune",
            ResourceAction::Delete => "delete",
            ResourceAction::InventoryAdd => "inventory-add",
            ResourceAction::InventorySet => "inventory-set",
        }
    }
}

impl fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// One planned phase step. Produced once by the task queue builder and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionGroup {
    pub name: String,
    pub action: ResourceAction,
    pub identifiers: Vec<ObjectIdentifier>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOperation {
    #[default]
    Unspecified,
    ServerSideApplied,
    Created,
    Unchanged,
    Configured,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PruneOperation {
    #[default]
    Unspecified,
    Pruned,
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteOperation {
    #[default]
    Unspecified,
    Deleted,
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitOperation {
    #[default]
    Pending,
    Reconciled,
    ReconcileSkipped,
    ReconcileTimeout,
    ReconcileFailed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitEvent {
    pub action_groups: Vec<ActionGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyEvent {
    pub group_name: String,
    pub identifier: ObjectIdentifier,
    pub operation: ApplyOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneEvent {
    pub group_name: String,
    pub identifier: ObjectIdentifier,
    pub operation: PruneOperation,
    /// Name of the filter that skipped the object, with its reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteEvent {
    pub group_name: String,
    pub identifier: ObjectIdentifier,
    pub operation: DeleteOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitEvent {
    pub group_name: String,
    pub identifier: ObjectIdentifier,
    pub operation: WaitOperation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub identifier: ObjectIdentifier,
    pub resource: ResourceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationEvent {
    pub identifiers: Vec<ObjectIdentifier>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Init(InitEvent),
    Apply(ApplyEvent),
    Prune(PruneEvent),
    Delete(DeleteEvent),
    Wait(WaitEvent),
    Status(StatusEvent),
    Validation(ValidationEvent),
    Error(ErrorEvent),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Init(_) => "init",
            Event::Apply(_) => "apply",
            Event::Prune(_) => "prune",
            Event::Delete(_) => "delete",
            Event::Wait(_) => "wait",
            Event::Status(_) => "status",
            Event::Validation(_) => "validation",
            Event::Error(_) => "error",
        }
    }

    pub fn identifier(&self) -> Option<&ObjectIdentifier> {
        match self {
            Event::Apply(e) => Some(&e.identifier),
            Event::Prune(e) => Some(&e.identifier),
            Event::Delete(e) => Some(&e.identifier),
            Event::Wait(e) => Some(&e.identifier),
            Event::Status(e) => Some(&e.identifier),
            Event::Init(_) | Event::Validation(_) | Event::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Event::Apply(e) => e.error.as_deref(),
            Event::Prune(e) => e.error.as_deref(),
            Event::Delete(e) => e.error.as_deref(),
            Event::Validation(e) => Some(&e.error),
            Event::Error(e) => Some(&e.error),
            Event::Init(_) | Event::Wait(_) | Event::Status(_) => None,
        }
    }
}
