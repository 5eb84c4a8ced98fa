use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keel_apply::fake::{FakeClient, FakeStatusSource, Verb};
use keel_apply::{
    Applier, ApplierOptions, ApplyError, CollectorError, Destroyer, DestroyerOptions, MemoryInventory, ResourceStateCollector,
    ValidationFilter, Verdict,
};
use keel_core::client::DryRunStrategy;
use keel_core::event::{ApplyOperation, DeleteOperation, Event, PruneOperation, WaitOperation};
use keel_core::inventory::InventoryInfo;
use keel_core::object::{Object, ObjectIdentifier, ON_REMOVE_ANNOTATION, OWNING_INVENTORY_ANNOTATION};
use keel_core::status::{ResourceStatus, Status};
use serde_json::json;
use tokio_util::sync::CancellationToken;

struct Harness {
    client: Arc<FakeClient>,
    inventory: Arc<MemoryInventory>,
    status: FakeStatusSource,
    inv: InventoryInfo,
}

impl Harness {
    fn new() -> Self {
        let client = Arc::new(FakeClient::new());
        let status = FakeStatusSource::new(client.clone());
        Self { client, inventory: Arc::new(MemoryInventory::new()), status, inv: InventoryInfo::new("inventory", "ops", "inv-1") }
    }

    fn applier(&self) -> Applier { Applier::new(self.client.clone(), self.inventory.clone(), Arc::new(self.status.clone())) }

    fn destroyer(&self) -> Destroyer { Destroyer::new(self.client.clone(), self.inventory.clone(), Arc::new(self.status.clone())) }

    fn seed(&self, ids: Vec<ObjectIdentifier>) { self.inventory.seed(&self.inv, ids) }

    async fn apply(&self, objects: Vec<Object>, opts: ApplierOptions) -> Vec<Event> {
        self.applier().run(CancellationToken::new(), Some(self.inv.clone()), objects, opts).expect("run starts").collect_all().await
    }
}

fn opts() -> ApplierOptions { ApplierOptions { poll_interval: Duration::from_millis(10), ..Default::default() } }

fn doc(api_version: &str, kind: &str, ns: Option<&str>, name: &str) -> Object {
    let mut meta = json!({ "name": name });
    if let Some(ns) = ns {
        meta["namespace"] = json!(ns);
    }
    Object::from_value(json!({ "apiVersion": api_version, "kind": kind, "metadata": meta })).unwrap()
}

fn deployment() -> Object { doc("apps/v1", "Deployment", Some("bar"), "foo") }

fn cm(ns: &str, name: &str) -> Object { doc("v1", "ConfigMap", Some(ns), name) }

fn owned(mut obj: Object, owner: &str) -> Object {
    obj.set_annotation(OWNING_INVENTORY_ANNOTATION, owner);
    obj
}

/// Event kinds without the status noise.
fn kinds(events: &[Event]) -> Vec<&'static str> {
    events.iter().filter(|e| !matches!(e, Event::Status(_))).map(Event::kind).collect()
}

fn collect(events: &[Event]) -> ResourceStateCollector {
    let c = ResourceStateCollector::default();
    for ev in events {
        let _ = c.process_event(ev);
    }
    c
}

fn apply_ops(events: &[Event]) -> Vec<(String, ApplyOperation, Option<String>)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Apply(a) => Some((a.identifier.name.clone(), a.operation, a.error.clone())),
            _ => None,
        })
        .collect()
}

fn prune_ops(events: &[Event]) -> Vec<(String, PruneOperation)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Prune(p) => Some((p.identifier.name.clone(), p.operation)),
            _ => None,
        })
        .collect()
}

fn wait_ops(events: &[Event]) -> Vec<WaitOperation> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Wait(w) => Some(w.operation),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn deployment_is_created_and_reconciled() {
    let h = Harness::new();
    let events = h.apply(vec![deployment()], ApplierOptions { reconcile_timeout: Duration::from_secs(5), ..opts() }).await;

    let Event::Init(init) = &events[0] else { panic!("first event must be Init: {:?}", events[0]) };
    let groups: Vec<&str> = init.action_groups.iter().map(|g| g.name.as_str()).collect();
    assert_eq!(groups, vec!["inventory-add-1", "apply-1", "wait-1", "inventory-set-1"]);
    assert_eq!(kinds(&events), vec!["init", "apply", "wait"]);
    assert_eq!(apply_ops(&events), vec![("foo".to_string(), ApplyOperation::Created, None)]);
    assert_eq!(wait_ops(&events), vec![WaitOperation::Reconciled]);

    let c = collect(&events);
    assert_eq!(c.stats().apply.created, 1);
    assert!(c.result().is_ok());

    let live = h.client.object(&deployment().identifier()).expect("created");
    assert_eq!(live.annotation(OWNING_INVENTORY_ANNOTATION), Some("inv-1"));
    assert_eq!(h.inventory.contents(&h.inv), Some(vec![deployment().identifier()]));
}

#[tokio::test]
async fn wait_timeout_is_a_failure_but_not_fatal() {
    let h = Harness::new();
    h.status.set_status(&deployment().identifier(), Status::InProgress);
    let events = h.apply(vec![deployment()], ApplierOptions { reconcile_timeout: Duration::from_millis(150), ..opts() }).await;

    assert_eq!(kinds(&events), vec!["init", "apply", "wait"]);
    assert_eq!(wait_ops(&events), vec![WaitOperation::ReconcileTimeout]);
    let c = collect(&events);
    let stats = c.stats();
    assert_eq!(stats.apply.created, 1);
    assert_eq!(stats.wait.failed, 1);
    assert_eq!(stats.wait.timeout, 1);
    assert!(matches!(c.result(), Err(CollectorError::Failed(e)) if e.stats == stats));
    assert!(h.inventory.contents(&h.inv).is_some(), "inventory still committed");
}

#[tokio::test]
async fn current_status_must_reach_applied_generation() {
    let h = Harness::new();
    let with_data = |v: &str| {
        Object::from_value(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": "cfg", "namespace": "ns" },
            "data": { "k": v }
        }))
        .unwrap()
    };
    h.client.insert(owned(with_data("1"), "inv-1"));
    let desired = with_data("2");
    let id = desired.identifier();
    h.status.set(ResourceStatus::new(id.clone(), Status::Current).with_generation(Some(1)));

    let events = h.apply(vec![desired], ApplierOptions { reconcile_timeout: Duration::from_millis(150), ..opts() }).await;
    assert_eq!(apply_ops(&events), vec![("cfg".to_string(), ApplyOperation::Configured, None)]);
    assert_eq!(h.client.object(&id).and_then(|o| o.generation()), Some(2));
    assert_eq!(wait_ops(&events), vec![WaitOperation::ReconcileTimeout]);
}

#[tokio::test]
async fn stale_failed_status_does_not_end_the_wait() {
    let h = Harness::new();
    let with_data = |v: &str| {
        Object::from_value(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": "cfg", "namespace": "ns" },
            "data": { "k": v }
        }))
        .unwrap()
    };
    h.client.insert(owned(with_data("1"), "inv-1"));
    let desired = with_data("2");
    let id = desired.identifier();
    h.status.set(ResourceStatus::new(id.clone(), Status::Failed).with_generation(Some(1)));
    let status = h.status.clone();
    let pinned = id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        status.clear(&pinned);
    });

    let events = h.apply(vec![desired], ApplierOptions { reconcile_timeout: Duration::from_secs(5), ..opts() }).await;
    assert_eq!(h.client.object(&id).and_then(|o| o.generation()), Some(2));
    assert_eq!(wait_ops(&events), vec![WaitOperation::Reconciled]);
    assert!(collect(&events).result().is_ok());
}

#[tokio::test]
async fn status_events_flow_without_waits() {
    let h = Harness::new();
    let events = h.apply(vec![cm("ns", "cfg")], opts()).await;
    assert_eq!(kinds(&events), vec!["init", "apply"]);
    let statuses: Vec<(String, Status)> = events
        .iter()
        .filter_map(|e| match e {
            Event::Status(s) => Some((s.identifier.name.clone(), s.resource.status)),
            _ => None,
        })
        .collect();
    assert_eq!(statuses.last(), Some(&("cfg".to_string(), Status::Current)));

    let c = ResourceStateCollector::default();
    for ev in &events {
        c.process_event(ev).unwrap();
    }
    let state = c.latest_state();
    assert_eq!(state.resources.len(), 1);
    assert_eq!(state.resources[0].status.status, Status::Current);

    let quiet = h.apply(vec![cm("ns", "cfg")], ApplierOptions { emit_status_events: false, ..opts() }).await;
    assert!(quiet.iter().all(|e| !matches!(e, Event::Status(_))));
}

#[tokio::test]
async fn runs_from_a_spawned_task() {
    let h = Harness::new();
    let applier = h.applier();
    let inv = h.inv.clone();
    let events = tokio::spawn(async move {
        applier.run(CancellationToken::new(), Some(inv), vec![cm("ns", "a")], opts()).expect("run starts").collect_all().await
    })
    .await
    .expect("apply task");
    assert_eq!(apply_ops(&events), vec![("a".to_string(), ApplyOperation::Created, None)]);

    let destroyer = h.destroyer();
    let inv = h.inv.clone();
    let events = tokio::spawn(async move {
        destroyer.run(CancellationToken::new(), inv, DestroyerOptions::default()).expect("run starts").collect_all().await
    })
    .await
    .expect("destroy task");
    assert_eq!(kinds(&events), vec!["init", "delete"]);
    assert!(h.client.object(&cm("ns", "a").identifier()).is_none());
}

#[tokio::test]
async fn unchanged_and_server_side_apply_outcomes() {
    let h = Harness::new();
    h.client.insert(owned(cm("ns", "same"), "inv-1"));
    let events = h.apply(vec![cm("ns", "same")], opts()).await;
    assert_eq!(apply_ops(&events), vec![("same".to_string(), ApplyOperation::Unchanged, None)]);
    assert!(h.client.calls().iter().all(|c| c.verb != Verb::Patch));

    let events = h.apply(vec![cm("ns", "same"), cm("ns", "new")], ApplierOptions { server_side_apply: true, ..opts() }).await;
    let ops: Vec<ApplyOperation> = apply_ops(&events).into_iter().map(|(_, op, _)| op).collect();
    assert_eq!(ops, vec![ApplyOperation::ServerSideApplied, ApplyOperation::ServerSideApplied]);
    assert!(h.client.object(&cm("ns", "new").identifier()).is_some());
}

#[tokio::test]
async fn prune_skips_object_whose_uid_was_just_applied() {
    let h = Harness::new();
    let mut current = owned(deployment(), "inv-1");
    let mut legacy = owned(doc("extensions/v1beta1", "Deployment", Some("bar"), "foo"), "inv-1");
    for o in [&mut current, &mut legacy] {
        let mut v = o.to_value();
        v["metadata"]["uid"] = json!("uid-shared");
        *o = Object::from_value(v).unwrap();
    }
    let pdb = owned(doc("policy/v1", "PodDisruptionBudget", Some("bar"), "pdb-1"), "inv-1");
    h.client.insert(current);
    h.client.insert(legacy.clone());
    h.client.insert(pdb.clone());
    h.seed(vec![legacy.identifier(), pdb.identifier()]);

    let events = h.apply(vec![deployment()], opts()).await;
    assert_eq!(kinds(&events), vec!["init", "apply", "prune", "prune"]);
    assert_eq!(prune_ops(&events), vec![("foo".to_string(), PruneOperation::Skipped), ("pdb-1".to_string(), PruneOperation::Pruned)]);
    let skipped = events.iter().find_map(|e| match e {
        Event::Prune(p) if p.operation == PruneOperation::Skipped => p.reason.clone(),
        _ => None,
    });
    assert!(skipped.unwrap_or_default().starts_with("CurrentUIDFilter"));
    assert!(h.client.object(&pdb.identifier()).is_none());
    assert!(h.client.object(&legacy.identifier()).is_some());

    let mut want = vec![deployment().identifier(), legacy.identifier()];
    want.sort();
    assert_eq!(h.inventory.contents(&h.inv), Some(want));
}

#[tokio::test]
async fn namespaces_in_use_are_never_pruned() {
    let h = Harness::new();
    let team = owned(doc("v1", "Namespace", None, "team"), "inv-1");
    let own_ns = owned(doc("v1", "Namespace", None, "ops"), "inv-1");
    let gone = owned(doc("v1", "Namespace", None, "gone"), "inv-1");
    let old = owned(cm("team", "old"), "inv-1");
    for o in [&team, &own_ns, &gone, &old] {
        h.client.insert(o.clone());
    }
    h.seed(vec![team.identifier(), own_ns.identifier(), gone.identifier(), old.identifier()]);

    let events = h.apply(vec![cm("team", "cfg")], opts()).await;
    assert_eq!(
        prune_ops(&events),
        vec![
            ("old".to_string(), PruneOperation::Pruned),
            ("gone".to_string(), PruneOperation::Pruned),
            ("ops".to_string(), PruneOperation::Skipped),
            ("team".to_string(), PruneOperation::Skipped),
        ]
    );
    let stats = collect(&events).stats();
    assert_eq!((stats.prune.pruned, stats.prune.skipped, stats.prune.failed), (2, 2, 0));
    assert!(h.client.object(&team.identifier()).is_some());
    assert!(h.client.object(&own_ns.identifier()).is_some());
}

struct Counting(Arc<AtomicUsize>);

impl ValidationFilter for Counting {
    fn name(&self) -> &'static str { "Counting" }

    fn filter(&self, _obj: &Object) -> anyhow::Result<Verdict> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(Verdict::Allow)
    }
}

#[tokio::test]
async fn first_skipping_filter_decides() {
    let h = Harness::new();
    let mut keep = owned(cm("ns", "keep"), "inv-1");
    keep.set_annotation(ON_REMOVE_ANNOTATION, "keep");
    let drop = owned(cm("ns", "drop"), "inv-1");
    h.client.insert(keep.clone());
    h.client.insert(drop.clone());
    h.seed(vec![keep.identifier(), drop.identifier()]);

    let count = Arc::new(AtomicUsize::new(0));
    let applier = h.applier().with_filter(Counting(count.clone()));
    let events = applier.run(CancellationToken::new(), Some(h.inv.clone()), vec![], opts()).unwrap().collect_all().await;

    assert_eq!(prune_ops(&events), vec![("drop".to_string(), PruneOperation::Pruned), ("keep".to_string(), PruneOperation::Skipped)]);
    assert_eq!(count.load(Ordering::SeqCst), 1, "filter after the skipping one never ran for 'keep'");
    assert_eq!(h.inventory.contents(&h.inv), Some(vec![keep.identifier()]));
}

#[tokio::test]
async fn foreign_owned_objects_are_left_alone() {
    let h = Harness::new();
    h.client.insert(owned(deployment(), "someone-else"));
    let theirs = owned(cm("ns", "theirs"), "someone-else");
    h.client.insert(theirs.clone());
    h.seed(vec![theirs.identifier()]);

    let events = h.apply(vec![deployment()], ApplierOptions { reconcile_timeout: Duration::from_secs(1), ..opts() }).await;
    let applied = apply_ops(&events);
    assert_eq!(applied[0].1, ApplyOperation::Unspecified);
    assert!(applied[0].2.as_deref().unwrap_or_default().contains("owned by inventory"));
    assert!(wait_ops(&events).contains(&WaitOperation::ReconcileSkipped));
    assert_eq!(prune_ops(&events), vec![("theirs".to_string(), PruneOperation::Skipped)]);
    assert!(h.client.mutating_calls().is_empty());

    let stats = collect(&events).stats();
    assert_eq!(stats.apply.failed, 1);
    assert_eq!(stats.prune.failed, 1);
    assert_eq!(h.inventory.contents(&h.inv), Some(vec![deployment().identifier()]), "foreign object released");
}

#[tokio::test]
async fn client_dry_run_never_mutates() {
    let h = Harness::new();
    let stale = owned(cm("ns", "stale"), "inv-1");
    h.client.insert(stale.clone());
    h.seed(vec![stale.identifier()]);
    let events = h
        .apply(
            vec![deployment()],
            ApplierOptions { dry_run: DryRunStrategy::Client, reconcile_timeout: Duration::from_secs(5), ..opts() },
        )
        .await;

    assert_eq!(kinds(&events), vec!["init", "apply", "prune"]);
    assert_eq!(apply_ops(&events)[0].1, ApplyOperation::Created);
    assert_eq!(prune_ops(&events), vec![("stale".to_string(), PruneOperation::Pruned)]);
    assert!(h.client.mutating_calls().is_empty());
    assert!(h.client.object(&stale.identifier()).is_some());
    assert_eq!(h.inventory.contents(&h.inv), Some(vec![stale.identifier()]), "inventory untouched");
}

#[tokio::test]
async fn server_dry_run_passes_the_flag() {
    let h = Harness::new();
    let stale = owned(cm("ns", "stale"), "inv-1");
    h.client.insert(stale.clone());
    h.seed(vec![stale.identifier()]);
    let events = h.apply(vec![deployment()], ApplierOptions { dry_run: DryRunStrategy::Server, ..opts() }).await;

    assert_eq!(apply_ops(&events)[0].1, ApplyOperation::Created);
    assert_eq!(prune_ops(&events), vec![("stale".to_string(), PruneOperation::Pruned)]);
    let mutating = h.client.mutating_calls();
    assert_eq!(mutating.iter().map(|c| c.verb).collect::<Vec<_>>(), vec![Verb::Create, Verb::Delete]);
    assert!(mutating.iter().all(|c| c.dry_run));
    assert!(h.client.object(&deployment().identifier()).is_none());
    assert!(h.client.object(&stale.identifier()).is_some());
}

#[tokio::test]
async fn prune_disabled_keeps_previous_objects_in_inventory() {
    let h = Harness::new();
    let old = owned(cm("ns", "old"), "inv-1");
    h.client.insert(old.clone());
    h.seed(vec![old.identifier()]);
    let events = h.apply(vec![cm("ns", "new")], ApplierOptions { prune: false, ..opts() }).await;
    assert!(prune_ops(&events).is_empty());
    let stored = h.inventory.contents(&h.inv).unwrap();
    assert!(stored.contains(&old.identifier()));
    assert!(stored.contains(&cm("ns", "new").identifier()));
}

#[tokio::test]
async fn duplicates_are_reported_invalid() {
    let h = Harness::new();
    let events = h.apply(vec![cm("ns", "a"), cm("ns", "b"), cm("ns", "a")], opts()).await;
    assert_eq!(kinds(&events), vec!["init", "validation", "apply", "apply"]);
    let Event::Validation(v) = &events[1] else { panic!("expected validation event") };
    assert_eq!(v.identifiers, vec![cm("ns", "a").identifier()]);
    let ops = apply_ops(&events);
    assert!(ops[0].2.is_some(), "duplicate fails its apply");
    assert_eq!(ops[1].1, ApplyOperation::Created);
    let c = collect(&events);
    let state = c.latest_state();
    assert_eq!(state.resources[0].status.status, Status::Invalid);
    assert_eq!(c.stats().apply.failed, 1);
}

#[tokio::test]
async fn unresolvable_kind_is_fatal() {
    let h = Harness::new();
    h.client.unresolvable("example.io", "Widget");
    let events = h.apply(vec![doc("example.io/v1", "Widget", Some("ns"), "w")], opts()).await;
    assert_eq!(kinds(&events), vec!["error"]);
    assert!(events[0].error().unwrap_or_default().contains("resolving resource kinds"));
    assert!(h.client.mutating_calls().is_empty());
}

#[tokio::test]
async fn kinds_defined_by_crds_in_the_set_skip_resolution() {
    let h = Harness::new();
    h.client.unresolvable("example.io", "Widget");
    let crd = Object::from_value(json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": { "name": "widgets.example.io" },
        "spec": { "group": "example.io", "names": { "kind": "Widget" } }
    }))
    .unwrap();
    let events = h.apply(vec![doc("example.io/v1", "Widget", Some("ns"), "w"), crd], opts()).await;
    assert_eq!(kinds(&events), vec!["init", "apply", "apply"]);
    assert_eq!(apply_ops(&events)[0].0, "widgets.example.io", "CRD applied in the first group");
}

#[tokio::test]
async fn inventory_id_mismatch_is_fatal() {
    let h = Harness::new();
    h.inventory.seed(&InventoryInfo::new("inventory", "ops", "somebody-else"), vec![]);
    let events = h.apply(vec![deployment()], opts()).await;
    assert_eq!(kinds(&events), vec!["error"]);
    assert!(events[0].error().unwrap_or_default().contains("reading inventory"));
}

#[tokio::test]
async fn synchronous_validation_errors() {
    let h = Harness::new();
    let err = h.applier().run(CancellationToken::new(), None, vec![deployment()], opts()).err().expect("needs inventory");
    assert!(matches!(err, ApplyError::Validation(_)));

    let inv_obj = cm("ops", "inventory");
    let err = h.applier().run(CancellationToken::new(), Some(h.inv.clone()), vec![inv_obj], opts()).err().expect("rejects inventory object");
    assert!(matches!(err, ApplyError::Validation(_)));
}

#[tokio::test]
async fn cancellation_interrupts_waits() {
    let h = Harness::new();
    h.status.set_status(&deployment().identifier(), Status::InProgress);
    let cancel = CancellationToken::new();
    let mut stream = h
        .applier()
        .run(cancel.clone(), Some(h.inv.clone()), vec![deployment()], ApplierOptions { reconcile_timeout: Duration::from_secs(60), ..opts() })
        .unwrap();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let mut events = Vec::new();
    while let Some(ev) = stream.recv().await {
        events.push(ev);
    }
    assert_eq!(kinds(&events), vec!["init", "apply", "wait", "error"]);
    assert_eq!(wait_ops(&events), vec![WaitOperation::Cancelled]);
    assert_eq!(events.last().and_then(Event::error), Some("run cancelled"));
    assert!(matches!(collect(&events).result(), Err(CollectorError::Run(_))));
}

#[tokio::test]
async fn destroy_survives_a_single_delete_failure() {
    let h = Harness::new();
    let objs: Vec<Object> = ["a", "b", "c"].iter().map(|n| owned(cm("ns", n), "inv-1")).collect();
    for o in &objs {
        h.client.insert(o.clone());
    }
    h.seed(objs.iter().map(Object::identifier).collect());
    h.client.fail(Verb::Delete, &objs[1].identifier(), "expected delete error");

    let events = h.destroyer().run(CancellationToken::new(), h.inv.clone(), DestroyerOptions::default()).unwrap().collect_all().await;
    assert_eq!(kinds(&events), vec!["init", "delete", "delete", "delete"]);
    let deletes: Vec<(String, DeleteOperation, Option<String>)> = events
        .iter()
        .filter_map(|e| match e {
            Event::Delete(d) => Some((d.identifier.name.clone(), d.operation, d.error.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(deletes[0], ("a".to_string(), DeleteOperation::Deleted, None));
    assert_eq!(deletes[1].2.as_deref(), Some("expected delete error"));
    assert_eq!(deletes[2], ("c".to_string(), DeleteOperation::Deleted, None));

    let stats = collect(&events).stats();
    assert_eq!((stats.delete.deleted, stats.delete.failed), (2, 1));
    assert_eq!(h.inventory.contents(&h.inv), Some(vec![objs[1].identifier()]));
}

#[tokio::test]
async fn destroy_removes_the_inventory_once_empty() {
    let h = Harness::new();
    let mut keep = owned(cm("ns", "keep"), "inv-1");
    keep.set_annotation(ON_REMOVE_ANNOTATION, "keep");
    let ns = owned(doc("v1", "Namespace", None, "ns"), "inv-1");
    let plain = owned(cm("ns", "plain"), "inv-1");
    for o in [&keep, &ns, &plain] {
        h.client.insert(o.clone());
    }
    h.seed(vec![ns.identifier(), keep.identifier(), plain.identifier()]);

    let events = h
        .destroyer()
        .run(CancellationToken::new(), h.inv.clone(), DestroyerOptions { delete_timeout: Duration::from_secs(5), poll_interval: Duration::from_millis(10), ..Default::default() })
        .unwrap()
        .collect_all()
        .await;
    let Event::Init(init) = &events[0] else { panic!("Init first") };
    let groups: Vec<&str> = init.action_groups.iter().map(|g| g.name.as_str()).collect();
    assert_eq!(groups, vec!["delete-1", "wait-1", "delete-2", "wait-2", "inventory-set-1"]);
    let stats = collect(&events).stats();
    assert_eq!((stats.delete.deleted, stats.delete.skipped), (2, 1));
    assert_eq!(stats.wait.reconciled, 2);
    assert_eq!(stats.wait.skipped, 1);
    assert_eq!(h.inventory.contents(&h.inv), Some(vec![keep.identifier()]));

    let h2 = Harness::new();
    h2.client.insert(plain.clone());
    h2.seed(vec![plain.identifier()]);
    let events = h2.destroyer().run(CancellationToken::new(), h2.inv.clone(), DestroyerOptions::default()).unwrap().collect_all().await;
    assert!(collect(&events).result().is_ok());
    assert_eq!(h2.inventory.contents(&h2.inv), None);
}

#[tokio::test]
async fn destroy_tolerates_repeated_inventory_entries() {
    let h = Harness::new();
    let a = owned(cm("ns", "a"), "inv-1");
    h.client.insert(a.clone());
    h.seed(vec![a.identifier(), a.identifier()]);

    let events = h.destroyer().run(CancellationToken::new(), h.inv.clone(), DestroyerOptions::default()).unwrap().collect_all().await;
    assert_eq!(kinds(&events), vec!["init", "delete"]);
    let Event::Init(init) = &events[0] else { panic!("Init first") };
    assert_eq!(init.action_groups[0].identifiers, vec![a.identifier()]);
    assert!(collect(&events).result().is_ok());
    assert_eq!(h.inventory.contents(&h.inv), None);
}
