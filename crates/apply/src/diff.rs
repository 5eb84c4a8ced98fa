//! Inventory differ and the live-vs-desired document comparison.

use keel_core::object::{Object, ObjectIdentifier};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Objects recorded by the previous run that are no longer desired, in
/// inventory order. Empty when `previous` is a subset of `desired`.
pub fn prune_candidates(previous: &[ObjectIdentifier], desired: &[ObjectIdentifier]) -> Vec<ObjectIdentifier> {
    let keep: FxHashSet<&ObjectIdentifier> = desired.iter().collect();
    let mut seen: FxHashSet<&ObjectIdentifier> = FxHashSet::default();
    previous.iter().filter(|id| !keep.contains(id) && seen.insert(*id)).cloned().collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// Drop fields the server owns so only declared content is compared.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for key in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            meta.remove(key);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Count field-level differences of `target` against `base`. Keys present
/// only in `base` count as removes.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, out: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, out),
                        None => out.adds += 1,
                    }
                }
                out.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                out.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                out.adds += aa.len().saturating_sub(bb.len());
                out.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) if av != bv => out.updates += 1,
            _ => {}
        }
    }
    let mut out = DiffSummary::default();
    walk(target, base, &mut out);
    out
}

/// The live object already carries every field the desired document declares.
/// Server-populated extras on the live side do not count.
pub fn is_unchanged(desired: &Object, live: &Object) -> bool {
    let s = diff_summary(&strip_noisy(desired.to_value()), &strip_noisy(live.to_value()));
    s.adds == 0 && s.updates == 0
}
