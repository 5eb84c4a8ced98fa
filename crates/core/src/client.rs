//! Capabilities the engine consumes from the remote system.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::object::{Object, ObjectIdentifier};
use crate::status::ResourceStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DryRunStrategy {
    #[default]
    None,
    /// Nothing is sent to the remote system.
    Client,
    /// Mutations are sent with the remote dry-run flag.
    Server,
}

impl DryRunStrategy {
    pub fn is_dry_run(&self) -> bool { !matches!(self, DryRunStrategy::None) }
    pub fn client_only(&self) -> bool { matches!(self, DryRunStrategy::Client) }
    pub fn server(&self) -> bool { matches!(self, DryRunStrategy::Server) }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropagationPolicy {
    #[default]
    Background,
    Foreground,
    Orphan,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutateOptions {
    pub dry_run: bool,
    pub field_manager: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStrategy {
    /// JSON merge patch of the desired document over the live one.
    Merge,
    ServerSideApply { force: bool },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub dry_run: bool,
    pub propagation: PropagationPolicy,
}

/// Remote CRUD. Errors are opaque and surfaced verbatim in per-object events.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Verify every `(group, kind)` is served by the remote system.
    async fn resolve(&self, ids: &[ObjectIdentifier]) -> anyhow::Result<()>;
    /// Live object, `None` when absent.
    async fn get(&self, id: &ObjectIdentifier) -> anyhow::Result<Option<Object>>;
    async fn list(
        &self,
        group: &str,
        kind: &str,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> anyhow::Result<Vec<Object>>;
    async fn create(&self, obj: &Object, opts: &MutateOptions) -> anyhow::Result<Object>;
    async fn patch(&self, obj: &Object, strategy: PatchStrategy, opts: &MutateOptions) -> anyhow::Result<Object>;
    /// Deleting an absent object is not an error.
    async fn delete(&self, id: &ObjectIdentifier, opts: &DeleteOptions) -> anyhow::Result<()>;
}

/// Source of status notifications. The stream ends when `cancel` fires.
pub trait StatusSource: Send + Sync {
    fn poll(&self, ids: Vec<ObjectIdentifier>, interval: Duration, cancel: CancellationToken) -> BoxStream<'static, ResourceStatus>;
}
