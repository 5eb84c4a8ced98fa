//! Kubernetes readiness computed from live documents, and a polling status
//! source that reads them through any [`ResourceClient`].

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::FutureExt;
use keel_core::client::{ResourceClient, StatusSource};
use keel_core::object::{Object, ObjectIdentifier};
use keel_core::status::{poll_stream, ResourceStatus, Status};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::warn;

fn int(obj: &Object, path: &[&str]) -> Option<i64> { obj.get_path(path).and_then(Json::as_i64) }

fn text<'a>(obj: &'a Object, path: &[&str]) -> Option<&'a str> { obj.get_path(path).and_then(Json::as_str) }

/// `(status, reason, message)` of condition `kind`, if present.
fn condition<'a>(obj: &'a Object, kind: &str) -> Option<(&'a str, &'a str, &'a str)> {
    let conds = obj.get_path(&["status", "conditions"])?.as_array()?;
    conds.iter().find(|c| c.get("type").and_then(Json::as_str) == Some(kind)).map(|c| {
        let field = move |k: &str| c.get(k).and_then(Json::as_str).unwrap_or_default();
        (field("status"), field("reason"), field("message"))
    })
}

fn is_true(obj: &Object, kind: &str) -> bool { matches!(condition(obj, kind), Some(("True", _, _))) }

type Verdict = (Status, String);

fn current(msg: impl Into<String>) -> Verdict { (Status::Current, msg.into()) }

fn progressing(msg: impl Into<String>) -> Verdict { (Status::InProgress, msg.into()) }

/// Status of one live object. Absent objects are handled by the caller.
pub fn compute_status(obj: &Object) -> ResourceStatus {
    let (status, message) = verdict(obj);
    ResourceStatus::new(obj.identifier(), status).with_message(message).with_generation(obj.generation())
}

fn verdict(obj: &Object) -> Verdict {
    if obj.get_path(&["metadata", "deletionTimestamp"]).is_some() {
        return (Status::Terminating, "deletion in progress".into());
    }
    if let (Some(generation), Some(observed)) = (obj.generation(), int(obj, &["status", "observedGeneration"])) {
        if observed < generation {
            return progressing(format!("observed generation {observed} behind {generation}"));
        }
    }
    match (obj.group(), obj.kind()) {
        ("", "Namespace") => namespace(obj),
        ("", "Pod") => pod(obj),
        ("", "PersistentVolumeClaim") => pvc(obj),
        ("apps", "Deployment") => deployment(obj),
        ("apps", "StatefulSet") => statefulset(obj),
        ("apps", "DaemonSet") => daemonset(obj),
        ("apps", "ReplicaSet") => replicaset(obj),
        ("batch", "Job") => job(obj),
        ("apiextensions.k8s.io", "CustomResourceDefinition") => crd(obj),
        _ => generic(obj),
    }
}

fn namespace(obj: &Object) -> Verdict {
    match text(obj, &["status", "phase"]) {
        Some("Terminating") => (Status::Terminating, "namespace terminating".into()),
        _ => current("namespace active"),
    }
}

fn pod(obj: &Object) -> Verdict {
    match text(obj, &["status", "phase"]) {
        Some("Succeeded") => current("pod succeeded"),
        Some("Failed") => (Status::Failed, "pod failed".into()),
        Some("Running") if is_true(obj, "Ready") => current("pod running and ready"),
        Some(phase) => progressing(format!("pod phase {phase}")),
        None => progressing("pod not scheduled"),
    }
}

fn pvc(obj: &Object) -> Verdict {
    match text(obj, &["status", "phase"]) {
        Some("Bound") => current("claim bound"),
        Some("Lost") => (Status::Failed, "claim lost".into()),
        _ => progressing("claim not bound"),
    }
}

fn replicas_wanted(obj: &Object) -> i64 { int(obj, &["spec", "replicas"]).unwrap_or(1) }

fn deployment(obj: &Object) -> Verdict {
    if let Some(("False", "ProgressDeadlineExceeded", msg)) = condition(obj, "Progressing") {
        return (Status::Failed, msg.to_string());
    }
    let want = replicas_wanted(obj);
    let updated = int(obj, &["status", "updatedReplicas"]).unwrap_or(0);
    let ready = int(obj, &["status", "readyReplicas"]).unwrap_or(0);
    let available = int(obj, &["status", "availableReplicas"]).unwrap_or(0);
    let total = int(obj, &["status", "replicas"]).unwrap_or(0);
    if updated < want {
        return progressing(format!("updated replicas {updated}/{want}"));
    }
    if total > updated {
        return progressing(format!("pending termination {}", total - updated));
    }
    if available < want || ready < want {
        return progressing(format!("available replicas {available}/{want}"));
    }
    current(format!("deployment ready {ready}/{want}"))
}

fn statefulset(obj: &Object) -> Verdict {
    let want = replicas_wanted(obj);
    let ready = int(obj, &["status", "readyReplicas"]).unwrap_or(0);
    if ready < want {
        return progressing(format!("ready replicas {ready}/{want}"));
    }
    let current_rev = text(obj, &["status", "currentRevision"]);
    let update_rev = text(obj, &["status", "updateRevision"]);
    if update_rev.is_some() && current_rev != update_rev {
        return progressing("rolling update in progress");
    }
    current(format!("statefulset ready {ready}/{want}"))
}

fn daemonset(obj: &Object) -> Verdict {
    let want = int(obj, &["status", "desiredNumberScheduled"]).unwrap_or(0);
    let updated = int(obj, &["status", "updatedNumberScheduled"]).unwrap_or(0);
    let ready = int(obj, &["status", "numberReady"]).unwrap_or(0);
    let available = int(obj, &["status", "numberAvailable"]).unwrap_or(0);
    if obj.get_path(&["status", "desiredNumberScheduled"]).is_none() {
        return progressing("daemonset not observed");
    }
    if updated < want || ready < want || available < want {
        return progressing(format!("ready pods {ready}/{want}"));
    }
    current(format!("daemonset ready {ready}/{want}"))
}

fn replicaset(obj: &Object) -> Verdict {
    if is_true(obj, "ReplicaFailure") {
        let msg = condition(obj, "ReplicaFailure").map(|(_, _, m)| m).unwrap_or_default();
        return (Status::Failed, msg.to_string());
    }
    let want = replicas_wanted(obj);
    let ready = int(obj, &["status", "readyReplicas"]).unwrap_or(0);
    let available = int(obj, &["status", "availableReplicas"]).unwrap_or(0);
    if ready < want || available < want {
        return progressing(format!("ready replicas {ready}/{want}"));
    }
    current(format!("replicaset ready {ready}/{want}"))
}

fn job(obj: &Object) -> Verdict {
    if is_true(obj, "Complete") {
        return current("job complete");
    }
    if let Some(("True", reason, msg)) = condition(obj, "Failed") {
        return (Status::Failed, format!("job failed: {reason} {msg}").trim_end().to_string());
    }
    let active = int(obj, &["status", "active"]).unwrap_or(0);
    progressing(format!("job in progress, {active} active"))
}

fn crd(obj: &Object) -> Verdict {
    if let Some(("False", _, msg)) = condition(obj, "NamesAccepted") {
        return (Status::Failed, msg.to_string());
    }
    if is_true(obj, "Established") {
        return current("crd established");
    }
    progressing("crd not established")
}

/// Objects following the kstatus condition conventions.
fn generic(obj: &Object) -> Verdict {
    if let Some(("True", _, msg)) = condition(obj, "Stalled") {
        return (Status::Failed, msg.to_string());
    }
    if let Some(("True", _, msg)) = condition(obj, "Reconciling") {
        return progressing(msg);
    }
    match condition(obj, "Ready") {
        Some(("False", _, msg)) => progressing(msg),
        Some(("True", _, _)) => current("ready"),
        _ => current("resource is current"),
    }
}

/// Kinds whose objects own the workloads reported as generated sub-resources.
fn generated_kinds(obj: &Object) -> &'static [(&'static str, &'static str)] {
    match (obj.group(), obj.kind()) {
        ("apps", "Deployment") => &[("apps", "ReplicaSet")],
        ("apps", "ReplicaSet") | ("apps", "StatefulSet") | ("apps", "DaemonSet") | ("batch", "Job") => &[("", "Pod")],
        _ => &[],
    }
}

fn owned_by(child: &Object, uid: &str) -> bool {
    child
        .get_path(&["metadata", "ownerReferences"])
        .and_then(Json::as_array)
        .map_or(false, |refs| refs.iter().any(|r| r.get("uid").and_then(Json::as_str) == Some(uid)))
}

/// Status source reading live objects through a [`ResourceClient`] every
/// interval. Workloads carry their generated objects (ReplicaSets, Pods).
#[derive(Clone)]
pub struct ClientStatusPoller {
    client: Arc<dyn ResourceClient>,
}

impl ClientStatusPoller {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self { Self { client } }

    /// One read of `id`. Read errors become `Unknown` with the error as message.
    pub async fn observe(&self, id: &ObjectIdentifier) -> ResourceStatus {
        match self.client.get(id).await {
            Ok(Some(obj)) => self.with_generated(obj).await,
            Ok(None) => ResourceStatus::new(id.clone(), Status::NotFound),
            Err(e) => {
                warn!(object = %id, error = %e, "status: poll failed");
                ResourceStatus::unknown(id.clone()).with_message(format!("{e:#}"))
            }
        }
    }

    fn with_generated(&self, obj: Object) -> BoxFuture<'_, ResourceStatus> {
        async move {
            let status = compute_status(&obj);
            let (Some(uid), Some(ns)) = (obj.uid(), obj.namespace()) else { return status };
            let mut generated = Vec::new();
            for (group, kind) in generated_kinds(&obj) {
                let children = match self.client.list(group, kind, Some(ns), None).await {
                    Ok(children) => children,
                    Err(e) => {
                        warn!(object = %obj.identifier(), error = %e, "status: listing generated objects failed");
                        continue;
                    }
                };
                for child in children.into_iter().filter(|c| owned_by(c, uid)) {
                    generated.push(self.with_generated(child).await);
                }
            }
            generated.sort_by(|a, b| a.identifier.cmp(&b.identifier));
            status.with_generated(generated)
        }
        .boxed()
    }
}

impl StatusSource for ClientStatusPoller {
    fn poll(&self, ids: Vec<ObjectIdentifier>, interval: Duration, cancel: CancellationToken) -> BoxStream<'static, ResourceStatus> {
        let me = self.clone();
        poll_stream(ids, interval, cancel, move |ids| {
            let me = me.clone();
            async move {
                let mut out = Vec::with_capacity(ids.len());
                for id in &ids {
                    out.push(me.observe(id).await);
                }
                out
            }
        })
    }
}
