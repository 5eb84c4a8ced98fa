//! Prune/delete validation filters. Filters run in order and the first one
//! that does not allow the object decides.

use std::fmt;

use keel_core::inventory::{InventoryInfo, InventoryPolicy};
use keel_core::object::{
    Object, LIFECYCLE_DELETION_ANNOTATION, LIFECYCLE_DETACH, ON_REMOVE_ANNOTATION, ON_REMOVE_KEEP, OWNING_INVENTORY_ANNOTATION,
};
use rustc_hash::FxHashSet;

use crate::inventory::{owner_match, OwnerMatch};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    /// Leave the object alone. `retain` keeps it in the inventory.
    Skip { reason: String, retain: bool },
    /// Leave the object alone and report an error for it.
    Fail { error: String, retain: bool },
}

impl Verdict {
    pub fn skip(reason: impl Into<String>) -> Self { Verdict::Skip { reason: reason.into(), retain: true } }

    /// Skip and drop from the inventory; the object belongs to someone else.
    pub fn release(reason: impl Into<String>) -> Self { Verdict::Skip { reason: reason.into(), retain: false } }

    pub fn is_allow(&self) -> bool { matches!(self, Verdict::Allow) }
}

pub trait ValidationFilter: Send + Sync {
    fn name(&self) -> &'static str;
    /// An `Err` is treated as `Verdict::Fail` with the object retained.
    fn filter(&self, obj: &Object) -> anyhow::Result<Verdict>;
}

/// Outcome of running a filter chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub filter: &'static str,
    pub verdict: Verdict,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.verdict {
            Verdict::Allow => write!(f, "allowed"),
            Verdict::Skip { reason, .. } => write!(f, "{}: {}", self.filter, reason),
            Verdict::Fail { error, .. } => write!(f, "{}: {}", self.filter, error),
        }
    }
}

/// Run `filters` in order; `None` means every filter allowed the object.
pub fn evaluate<'a, I>(filters: I, obj: &Object) -> Option<Decision>
where
    I: IntoIterator<Item = &'a dyn ValidationFilter>,
{
    for f in filters {
        let verdict = match f.filter(obj) {
            Ok(v) => v,
            Err(e) => Verdict::Fail { error: format!("{e:#}"), retain: true },
        };
        if !verdict.is_allow() {
            return Some(Decision { filter: f.name(), verdict });
        }
    }
    None
}

/// Objects annotated to be kept on removal are never deleted.
pub struct PreventRemoveFilter;

impl ValidationFilter for PreventRemoveFilter {
    fn name(&self) -> &'static str { "PreventRemoveFilter" }

    fn filter(&self, obj: &Object) -> anyhow::Result<Verdict> {
        if obj.annotation(ON_REMOVE_ANNOTATION) == Some(ON_REMOVE_KEEP) {
            return Ok(Verdict::skip(format!("annotated {ON_REMOVE_ANNOTATION}: {ON_REMOVE_KEEP}")));
        }
        if obj.annotation(LIFECYCLE_DELETION_ANNOTATION) == Some(LIFECYCLE_DETACH) {
            return Ok(Verdict::skip(format!("annotated {LIFECYCLE_DELETION_ANNOTATION}: {LIFECYCLE_DETACH}")));
        }
        Ok(Verdict::Allow)
    }
}

/// Only delete objects this inventory owns, relaxed by the policy.
pub struct InventoryPolicyFilter {
    pub inventory_id: String,
    pub policy: InventoryPolicy,
}

impl InventoryPolicyFilter {
    pub fn new(inv: &InventoryInfo, policy: InventoryPolicy) -> Self { Self { inventory_id: inv.id.clone(), policy } }
}

impl ValidationFilter for InventoryPolicyFilter {
    fn name(&self) -> &'static str { "InventoryPolicyFilter" }

    fn filter(&self, obj: &Object) -> anyhow::Result<Verdict> {
        let owner = obj.annotation(OWNING_INVENTORY_ANNOTATION).unwrap_or_default();
        Ok(match (owner_match(&self.inventory_id, obj), self.policy) {
            (OwnerMatch::Match, _) | (_, InventoryPolicy::AdoptAll) => Verdict::Allow,
            (OwnerMatch::Empty, InventoryPolicy::AdoptIfNoInventory) => Verdict::Allow,
            (OwnerMatch::Empty, _) => {
                Verdict::Fail { error: "object has no owning inventory annotation (policy MustMatch)".into(), retain: true }
            }
            (OwnerMatch::NoMatch, InventoryPolicy::MustMatch) => {
                Verdict::Fail { error: format!("object is owned by inventory {owner:?} (policy MustMatch)"), retain: false }
            }
            (OwnerMatch::NoMatch, _) => Verdict::release(format!("object is owned by inventory {owner:?}")),
        })
    }
}

/// Protects Namespaces still referenced by desired objects or holding the inventory.
pub struct LocalNamespacesFilter {
    namespaces: FxHashSet<String>,
}

impl LocalNamespacesFilter {
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let namespaces = namespaces.into_iter().map(|s| s.as_ref().trim().to_lowercase()).filter(|s| !s.is_empty()).collect();
        Self { namespaces }
    }

    /// Namespaces of `desired` plus the inventory namespace.
    pub fn local_to(inv: &InventoryInfo, desired: &[Object]) -> Self {
        Self::new(desired.iter().filter_map(|o| o.namespace()).chain(std::iter::once(inv.namespace.as_str())))
    }

    pub fn contains(&self, ns: &str) -> bool { self.namespaces.contains(&ns.trim().to_lowercase()) }
}

impl ValidationFilter for LocalNamespacesFilter {
    fn name(&self) -> &'static str { "LocalNamespacesFilter" }

    fn filter(&self, obj: &Object) -> anyhow::Result<Verdict> {
        if obj.identifier().is_namespace() && self.contains(obj.name()) {
            return Ok(Verdict::skip("namespace is still in use"));
        }
        Ok(Verdict::Allow)
    }
}

/// Skips objects whose live UID was just applied under another identifier.
pub struct CurrentUidFilter {
    uids: FxHashSet<String>,
}

impl CurrentUidFilter {
    pub fn new(uids: FxHashSet<String>) -> Self { Self { uids } }
}

impl ValidationFilter for CurrentUidFilter {
    fn name(&self) -> &'static str { "CurrentUIDFilter" }

    fn filter(&self, obj: &Object) -> anyhow::Result<Verdict> {
        match obj.uid() {
            Some(uid) if self.uids.contains(uid) => Ok(Verdict::skip(format!("object with uid {uid} was applied in this run"))),
            _ => Ok(Verdict::Allow),
        }
    }
}
