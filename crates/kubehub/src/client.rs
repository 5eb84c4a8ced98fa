//! Resource client over the Kubernetes API using dynamic objects and a
//! discovery cache keyed by `(group, kind)`.

use std::sync::RwLock;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use keel_core::client::{DeleteOptions, MutateOptions, PatchStrategy, PropagationPolicy, ResourceClient};
use keel_core::object::{Object, ObjectIdentifier};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta};
use kube::discovery::{Discovery, Scope};
use kube::Client;
use metrics::{counter, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum KubeError {
    #[error("no matches for kind {kind:?} in group {group:?}")]
    UnknownKind { group: String, kind: String },
    #[error("malformed object from server: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone)]
struct Resolved {
    ar: ApiResource,
    namespaced: bool,
}

pub struct KubeResourceClient {
    client: Client,
    cache: RwLock<FxHashMap<(String, String), Resolved>>,
}

impl KubeResourceClient {
    pub fn new(client: Client) -> Self { Self { client, cache: RwLock::new(FxHashMap::default()) } }

    /// Client from the ambient kubeconfig or in-cluster environment.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self::new(client))
    }

    /// Re-run discovery and replace the cache (served kinds incl. CRDs).
    pub async fn refresh(&self) -> Result<()> {
        let started = Instant::now();
        let discovery = Discovery::new(self.client.clone()).run().await.context("running api discovery")?;
        let mut map = FxHashMap::default();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                map.insert((ar.group.clone(), ar.kind.clone()), Resolved { ar, namespaced });
            }
        }
        info!(kinds = map.len(), "kubehub: discovery refreshed");
        histogram!("kube_discovery_ms", started.elapsed().as_secs_f64() * 1000.0);
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = map;
        Ok(())
    }

    fn cached(&self, group: &str, kind: &str) -> Option<Resolved> {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).get(&(group.to_string(), kind.to_string())).cloned()
    }

    /// Cached resolution, refreshing discovery once on a miss.
    async fn lookup(&self, group: &str, kind: &str) -> Result<Resolved> {
        if let Some(r) = self.cached(group, kind) {
            return Ok(r);
        }
        debug!(group, kind, "kubehub: discovery cache miss");
        self.refresh().await?;
        self.cached(group, kind).ok_or_else(|| KubeError::UnknownKind { group: group.into(), kind: kind.into() }.into())
    }

    fn api(&self, r: &Resolved, namespace: &str) -> Api<DynamicObject> {
        match (r.namespaced, namespace.is_empty()) {
            (true, false) => Api::namespaced_with(self.client.clone(), namespace, &r.ar),
            (true, true) => Api::default_namespaced_with(self.client.clone(), &r.ar),
            (false, _) => Api::all_with(self.client.clone(), &r.ar),
        }
    }

    /// Api pinned to the version the document was written against.
    async fn api_for(&self, obj: &Object) -> Result<(Api<DynamicObject>, ApiResource)> {
        let r = self.lookup(obj.group(), obj.kind()).await?;
        let ar = pinned_resource(obj, &r.ar);
        let api = self.api(&Resolved { ar: ar.clone(), namespaced: r.namespaced }, obj.namespace().unwrap_or_default());
        Ok((api, ar))
    }
}

fn pinned_resource(obj: &Object, served: &ApiResource) -> ApiResource {
    let version = obj.api_version().rsplit('/').next().unwrap_or_default();
    if version.is_empty() || version == served.version {
        return served.clone();
    }
    let gvk = GroupVersionKind::gvk(obj.group(), version, obj.kind());
    ApiResource::from_gvk_with_plural(&gvk, &served.plural)
}

fn to_dynamic(obj: &Object) -> Result<DynamicObject> {
    serde_json::from_value(obj.to_value()).with_context(|| format!("encoding {}", obj.identifier().short()))
}

fn from_dynamic(mut obj: DynamicObject, ar: &ApiResource) -> Result<Object> {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    }
    obj.metadata.managed_fields = None;
    let raw = serde_json::to_value(&obj).context("serializing DynamicObject")?;
    Object::from_value(raw).map_err(|e| KubeError::Malformed(e.to_string()).into())
}

fn is_not_found(err: &kube::Error) -> bool { matches!(err, kube::Error::Api(ae) if ae.code == 404) }

fn propagation(p: PropagationPolicy) -> kube::api::PropagationPolicy {
    match p {
        PropagationPolicy::Background => kube::api::PropagationPolicy::Background,
        PropagationPolicy::Foreground => kube::api::PropagationPolicy::Foreground,
        PropagationPolicy::Orphan => kube::api::PropagationPolicy::Orphan,
    }
}

fn field_manager(opts: &MutateOptions) -> Option<String> { Some(opts.field_manager.clone()).filter(|s| !s.is_empty()) }

fn observe<T>(verb: &'static str, started: Instant, res: &Result<T, kube::Error>) {
    histogram!("kube_request_ms", started.elapsed().as_secs_f64() * 1000.0, "verb" => verb);
    if let Err(e) = res {
        if !is_not_found(e) {
            counter!("kube_request_err", 1u64, "verb" => verb);
        }
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn resolve(&self, ids: &[ObjectIdentifier]) -> Result<()> {
        let kinds: FxHashSet<(&str, &str)> = ids.iter().map(|id| (id.group.as_str(), id.kind.as_str())).collect();
        for (group, kind) in kinds {
            self.lookup(group, kind).await?;
        }
        Ok(())
    }

    async fn get(&self, id: &ObjectIdentifier) -> Result<Option<Object>> {
        let r = self.lookup(&id.group, &id.kind).await?;
        let started = Instant::now();
        let res = self.api(&r, &id.namespace).get_opt(&id.name).await;
        observe("get", started, &res);
        match res.with_context(|| format!("getting {}", id.short()))? {
            Some(obj) => Ok(Some(from_dynamic(obj, &r.ar)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, group: &str, kind: &str, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<Object>> {
        let r = self.lookup(group, kind).await?;
        let api: Api<DynamicObject> = match namespace {
            Some(ns) if r.namespaced => Api::namespaced_with(self.client.clone(), ns, &r.ar),
            _ => Api::all_with(self.client.clone(), &r.ar),
        };
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        let started = Instant::now();
        let res = api.list(&lp).await;
        observe("list", started, &res);
        let list = res.with_context(|| format!("listing {kind}.{group}"))?;
        list.items.into_iter().map(|o| from_dynamic(o, &r.ar)).collect()
    }

    async fn create(&self, obj: &Object, opts: &MutateOptions) -> Result<Object> {
        let (api, ar) = self.api_for(obj).await?;
        let pp = PostParams { dry_run: opts.dry_run, field_manager: field_manager(opts) };
        let started = Instant::now();
        let res = api.create(&pp, &to_dynamic(obj)?).await;
        observe("create", started, &res);
        from_dynamic(res.with_context(|| format!("creating {}", obj.identifier().short()))?, &ar)
    }

    async fn patch(&self, obj: &Object, strategy: PatchStrategy, opts: &MutateOptions) -> Result<Object> {
        let (api, ar) = self.api_for(obj).await?;
        let body = obj.to_value();
        let (pp, patch) = match strategy {
            PatchStrategy::Merge => {
                (PatchParams { dry_run: opts.dry_run, field_manager: field_manager(opts), ..Default::default() }, Patch::Merge(&body))
            }
            PatchStrategy::ServerSideApply { force } => {
                let mut pp = PatchParams::apply(&field_manager(opts).unwrap_or_else(|| "keel".into()));
                if force {
                    pp = pp.force();
                }
                pp.dry_run = opts.dry_run;
                (pp, Patch::Apply(&body))
            }
        };
        let started = Instant::now();
        let res = api.patch(obj.name(), &pp, &patch).await;
        observe("patch", started, &res);
        from_dynamic(res.with_context(|| format!("patching {}", obj.identifier().short()))?, &ar)
    }

    async fn delete(&self, id: &ObjectIdentifier, opts: &DeleteOptions) -> Result<()> {
        let r = self.lookup(&id.group, &id.kind).await?;
        let dp = DeleteParams { dry_run: opts.dry_run, propagation_policy: Some(propagation(opts.propagation)), ..Default::default() };
        let started = Instant::now();
        let res = self.api(&r, &id.namespace).delete(&id.name, &dp).await;
        observe("delete", started, &res);
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context(format!("deleting {}", id.short()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment_resource() -> ApiResource {
        ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("apps", "v1", "Deployment"), "deployments")
    }

    #[test]
    fn dynamic_conversion_fills_types_and_drops_managed_fields() {
        let raw = json!({
            "metadata": { "name": "foo", "namespace": "bar", "managedFields": [{ "manager": "kubectl" }] },
            "spec": { "replicas": 2 }
        });
        let dynamic: DynamicObject = serde_json::from_value(raw).unwrap();
        let obj = from_dynamic(dynamic, &deployment_resource()).unwrap();
        assert_eq!(obj.identifier(), ObjectIdentifier::new("apps", "Deployment", "bar", "foo"));
        assert!(obj.get_path(&["metadata", "managedFields"]).is_none());
        assert_eq!(obj.get_path(&["spec", "replicas"]), Some(&json!(2)));

        let back = to_dynamic(&obj).unwrap();
        assert_eq!(back.metadata.name.as_deref(), Some("foo"));
    }

    #[test]
    fn mutations_target_the_document_version() {
        let served = deployment_resource();
        let legacy = Object::from_value(json!({
            "apiVersion": "apps/v1beta2", "kind": "Deployment", "metadata": { "name": "foo" }
        }))
        .unwrap();
        let ar = pinned_resource(&legacy, &served);
        assert_eq!(ar.version, "v1beta2");
        assert_eq!(ar.plural, "deployments");
        let current = Object::from_value(json!({ "apiVersion": "apps/v1", "kind": "Deployment", "metadata": { "name": "foo" } })).unwrap();
        assert_eq!(pinned_resource(&current, &served).version, "v1");
    }

    #[test]
    fn not_found_is_recognised() {
        let err = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "deployments.apps \"foo\" not found".into(),
            reason: "NotFound".into(),
            code: 404,
        });
        assert!(is_not_found(&err));
        let conflict = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "conflict".into(),
            reason: "Conflict".into(),
            code: 409,
        });
        assert!(!is_not_found(&conflict));
    }

    #[test]
    fn propagation_maps_each_policy() {
        assert!(matches!(propagation(PropagationPolicy::Foreground), kube::api::PropagationPolicy::Foreground));
        assert!(matches!(propagation(PropagationPolicy::Orphan), kube::api::PropagationPolicy::Orphan));
        assert!(matches!(propagation(PropagationPolicy::default()), kube::api::PropagationPolicy::Background));
    }
}
