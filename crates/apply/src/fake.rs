//! In-memory resource client and status source for tests and previews.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use keel_core::client::{DeleteOptions, MutateOptions, PatchStrategy, ResourceClient, StatusSource};
use keel_core::object::{Object, ObjectIdentifier};
use keel_core::status::{poll_stream, ResourceStatus, Status};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Map, Value as Json};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Patch,
    Delete,
}

impl Verb {
    pub fn is_mutating(&self) -> bool { matches!(self, Verb::Create | Verb::Patch | Verb::Delete) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub id: Option<ObjectIdentifier>,
    pub dry_run: bool,
}

#[derive(Default)]
struct FakeState {
    objects: BTreeMap<ObjectIdentifier, Object>,
    calls: Vec<Call>,
    failures: FxHashMap<(Verb, ObjectIdentifier), String>,
    unresolvable: FxHashSet<(String, String)>,
    next_uid: u64,
}

impl FakeState {
    fn stamp_new(&mut self, obj: &mut Object) {
        self.next_uid += 1;
        let uid = format!("uid-{}", self.next_uid);
        set_meta(obj, "uid", Json::String(uid));
        set_meta(obj, "generation", Json::from(1));
    }
}

fn set_meta(obj: &mut Object, key: &str, value: Json) {
    let mut raw = obj.to_value();
    if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.insert(key.to_string(), value);
    }
    if let Ok(updated) = Object::from_value(raw) {
        *obj = updated;
    }
}

/// RFC 7386 merge patch.
fn merge_patch(target: &mut Json, patch: &Json) {
    let Json::Object(p) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(Map::new());
    }
    if let Some(t) = target.as_object_mut() {
        for (k, v) in p {
            if v.is_null() {
                t.remove(k);
            } else {
                merge_patch(t.entry(k.clone()).or_insert(Json::Null), v);
            }
        }
    }
}

/// Everything but metadata and status.
fn content(obj: &Object) -> Map<String, Json> {
    obj.raw().iter().filter(|(k, _)| k.as_str() != "metadata" && k.as_str() != "status").map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Carry identity over from `live` and bump the generation when content changed.
fn carry_over(next: &mut Object, live: &Object) {
    if let Some(uid) = live.uid() {
        set_meta(next, "uid", Json::String(uid.to_string()));
    }
    let generation = live.generation().unwrap_or(1) + i64::from(content(next) != content(live));
    set_meta(next, "generation", Json::from(generation));
}

fn labels_match(obj: &Object, selector: &str) -> bool {
    selector.split(',').map(str::trim).filter(|s| !s.is_empty()).all(|term| match term.split_once('=') {
        Some((k, v)) => obj.label(k.trim()) == Some(v.trim()),
        None => obj.label(term).is_some(),
    })
}

/// Stateful in-memory stand-in for a remote cluster.
#[derive(Default)]
pub struct FakeClient {
    state: Mutex<FakeState>,
}

impl FakeClient {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, FakeState> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Seed a live object. A missing uid or generation is filled in.
    pub fn insert(&self, mut obj: Object) {
        let mut st = self.lock();
        if obj.uid().is_none() {
            st.stamp_new(&mut obj);
        } else if obj.generation().is_none() {
            set_meta(&mut obj, "generation", Json::from(1));
        }
        st.objects.insert(obj.identifier(), obj);
    }

    pub fn with_object(self, obj: Object) -> Self {
        self.insert(obj);
        self
    }

    pub fn object(&self, id: &ObjectIdentifier) -> Option<Object> { self.lock().objects.get(id).cloned() }

    pub fn objects(&self) -> Vec<Object> { self.lock().objects.values().cloned().collect() }

    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    pub fn mutating_calls(&self) -> Vec<Call> { self.calls().into_iter().filter(|c| c.verb.is_mutating()).collect() }

    /// Make `verb` on `id` fail with `msg`.
    pub fn fail(&self, verb: Verb, id: &ObjectIdentifier, msg: &str) { self.lock().failures.insert((verb, id.clone()), msg.to_string()); }

    /// Make the kind unknown to `resolve`.
    pub fn unresolvable(&self, group: &str, kind: &str) { self.lock().unresolvable.insert((group.to_string(), kind.to_string())); }

    fn record(&self, verb: Verb, id: Option<&ObjectIdentifier>, dry_run: bool) -> anyhow::Result<()> {
        let mut st = self.lock();
        st.calls.push(Call { verb, id: id.cloned(), dry_run });
        if let Some(id) = id {
            if let Some(msg) = st.failures.get(&(verb, id.clone())) {
                return Err(anyhow::anyhow!(msg.clone()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceClient for FakeClient {
    async fn resolve(&self, ids: &[ObjectIdentifier]) -> anyhow::Result<()> {
        let st = self.lock();
        match ids.iter().find(|id| st.unresolvable.contains(&(id.group.clone(), id.kind.clone()))) {
            Some(id) => Err(anyhow::anyhow!("no matches for kind {:?} in group {:?}", id.kind, id.group)),
            None => Ok(()),
        }
    }

    async fn get(&self, id: &ObjectIdentifier) -> anyhow::Result<Option<Object>> {
        self.record(Verb::Get, Some(id), false)?;
        Ok(self.object(id))
    }

    async fn list(&self, group: &str, kind: &str, namespace: Option<&str>, label_selector: Option<&str>) -> anyhow::Result<Vec<Object>> {
        self.record(Verb::List, None, false)?;
        let st = self.lock();
        Ok(st
            .objects
            .iter()
            .filter(|(id, _)| id.group == group && id.kind == kind)
            .filter(|(id, _)| namespace.map_or(true, |ns| id.namespace == ns))
            .filter(|(_, obj)| label_selector.map_or(true, |sel| labels_match(obj, sel)))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &Object, opts: &MutateOptions) -> anyhow::Result<Object> {
        let id = obj.identifier();
        self.record(Verb::Create, Some(&id), opts.dry_run)?;
        let mut st = self.lock();
        if st.objects.contains_key(&id) {
            anyhow::bail!("{} already exists", id.short());
        }
        let mut created = obj.clone();
        st.stamp_new(&mut created);
        if !opts.dry_run {
            st.objects.insert(id, created.clone());
        }
        Ok(created)
    }

    async fn patch(&self, obj: &Object, strategy: PatchStrategy, opts: &MutateOptions) -> anyhow::Result<Object> {
        let id = obj.identifier();
        self.record(Verb::Patch, Some(&id), opts.dry_run)?;
        let mut st = self.lock();
        let live = st.objects.get(&id).cloned();
        let next = match (strategy, live) {
            (PatchStrategy::Merge, None) => anyhow::bail!("{} not found", id.short()),
            (PatchStrategy::Merge, Some(live)) => {
                let mut merged = live.to_value();
                merge_patch(&mut merged, &obj.to_value());
                let mut next = Object::from_value(merged)?;
                carry_over(&mut next, &live);
                next
            }
            (PatchStrategy::ServerSideApply { .. }, Some(live)) => {
                let mut next = obj.clone();
                carry_over(&mut next, &live);
                next
            }
            (PatchStrategy::ServerSideApply { .. }, None) => {
                let mut next = obj.clone();
                st.stamp_new(&mut next);
                next
            }
        };
        if !opts.dry_run {
            st.objects.insert(id, next.clone());
        }
        Ok(next)
    }

    async fn delete(&self, id: &ObjectIdentifier, opts: &DeleteOptions) -> anyhow::Result<()> {
        self.record(Verb::Delete, Some(id), opts.dry_run)?;
        if !opts.dry_run {
            self.lock().objects.remove(id);
        }
        Ok(())
    }
}

/// Reports `Current` for objects present in a [`FakeClient`] and `NotFound`
/// for absent ones, unless a status was pinned with [`FakeStatusSource::set`].
#[derive(Clone)]
pub struct FakeStatusSource {
    client: Arc<FakeClient>,
    pinned: Arc<Mutex<FxHashMap<ObjectIdentifier, ResourceStatus>>>,
}

impl FakeStatusSource {
    pub fn new(client: Arc<FakeClient>) -> Self { Self { client, pinned: Arc::default() } }

    pub fn set(&self, status: ResourceStatus) {
        self.pinned.lock().unwrap_or_else(|e| e.into_inner()).insert(status.identifier.clone(), status);
    }

    pub fn set_status(&self, id: &ObjectIdentifier, status: Status) { self.set(ResourceStatus::new(id.clone(), status)) }

    pub fn clear(&self, id: &ObjectIdentifier) { self.pinned.lock().unwrap_or_else(|e| e.into_inner()).remove(id); }

    fn observe(&self, id: &ObjectIdentifier) -> ResourceStatus {
        if let Some(rs) = self.pinned.lock().unwrap_or_else(|e| e.into_inner()).get(id) {
            return rs.clone();
        }
        match self.client.object(id) {
            Some(obj) => ResourceStatus::new(id.clone(), Status::Current).with_generation(obj.generation()),
            None => ResourceStatus::new(id.clone(), Status::NotFound),
        }
    }
}

impl StatusSource for FakeStatusSource {
    fn poll(&self, ids: Vec<ObjectIdentifier>, interval: Duration, cancel: CancellationToken) -> BoxStream<'static, ResourceStatus> {
        let me = self.clone();
        poll_stream(ids, interval, cancel, move |ids| {
            let batch: Vec<ResourceStatus> = ids.iter().map(|id| me.observe(id)).collect();
            async move { batch }
        })
    }
}
