//! Reconcile status of remote objects.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::object::ObjectIdentifier;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Unknown,
    InProgress,
    Current,
    Failed,
    Terminating,
    NotFound,
    /// Synthesized locally when an object fails validation.
    Invalid,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unknown => "Unknown",
            Status::InProgress => "InProgress",
            Status::Current => "Current",
            Status::Failed => "Failed",
            Status::Terminating => "Terminating",
            Status::NotFound => "NotFound",
            Status::Invalid => "Invalid",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Latest observed status of one object, including the objects it generated
/// (e.g. ReplicaSets and Pods of a Deployment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub identifier: ObjectIdentifier,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// `metadata.generation` of the object the status was computed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated: Vec<ResourceStatus>,
}

impl ResourceStatus {
    pub fn new(identifier: ObjectIdentifier, status: Status) -> Self {
        Self { identifier, status, message: None, generation: None, generated: Vec::new() }
    }

    pub fn unknown(identifier: ObjectIdentifier) -> Self { Self::new(identifier, Status::Unknown) }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_generated(mut self, generated: Vec<ResourceStatus>) -> Self {
        self.generated = generated;
        self
    }
}

/// Build a status stream that calls `probe` for the watched set every `interval`
/// until `cancel` fires. The first probe runs immediately.
pub fn poll_stream<F, Fut>(
    ids: Vec<ObjectIdentifier>,
    interval: Duration,
    cancel: CancellationToken,
    probe: F,
) -> BoxStream<'static, ResourceStatus>
where
    F: Fn(Vec<ObjectIdentifier>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<ResourceStatus>> + Send + 'static,
{
    let probe = Arc::new(probe);
    stream::unfold(true, move |first| {
        let ids = ids.clone();
        let cancel = cancel.clone();
        let probe = Arc::clone(&probe);
        async move {
            if first {
                if cancel.is_cancelled() {
                    return None;
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            let batch = tokio::select! {
                _ = cancel.cancelled() => return None,
                batch = probe(ids) => batch,
            };
            Some((batch, false))
        }
    })
    .flat_map(stream::iter)
    .boxed()
}
