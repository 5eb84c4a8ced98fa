//! Ownership checks and inventory backends that live on top of the resource client.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use keel_core::client::{DeleteOptions, DryRunStrategy, MutateOptions, PatchStrategy, ResourceClient};
use keel_core::inventory::{InventoryClient, InventoryInfo, InventoryPolicy};
use keel_core::object::{Object, ObjectIdentifier, INVENTORY_LABEL, OWNING_INVENTORY_ANNOTATION};
use rustc_hash::FxHashMap;
use serde_json::{json, Map, Value as Json};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerMatch {
    /// No owning-inventory annotation.
    Empty,
    Match,
    NoMatch,
}

pub fn owner_match(inv_id: &str, obj: &Object) -> OwnerMatch {
    match obj.annotation(OWNING_INVENTORY_ANNOTATION) {
        None | Some("") => OwnerMatch::Empty,
        Some(owner) if owner == inv_id => OwnerMatch::Match,
        Some(_) => OwnerMatch::NoMatch,
    }
}

pub fn can_prune(inv_id: &str, obj: &Object, policy: InventoryPolicy) -> bool {
    match owner_match(inv_id, obj) {
        OwnerMatch::Match => true,
        OwnerMatch::Empty => policy != InventoryPolicy::MustMatch,
        OwnerMatch::NoMatch => policy == InventoryPolicy::AdoptAll,
    }
}

/// Whether an apply may take over `live`. The error names the reason.
pub fn can_apply(inv_id: &str, live: Option<&Object>, policy: InventoryPolicy) -> Result<(), String> {
    let Some(live) = live else { return Ok(()) };
    match (owner_match(inv_id, live), policy) {
        (OwnerMatch::Match, _) | (_, InventoryPolicy::AdoptAll) => Ok(()),
        (OwnerMatch::Empty, InventoryPolicy::AdoptIfNoInventory) => Ok(()),
        (OwnerMatch::Empty, _) => {
            Err(format!("{} exists and is not owned by any inventory (policy {:?})", live.identifier().short(), policy))
        }
        (OwnerMatch::NoMatch, _) => Err(format!(
            "{} is owned by inventory {:?} (policy {:?})",
            live.identifier().short(),
            live.annotation(OWNING_INVENTORY_ANNOTATION).unwrap_or_default(),
            policy
        )),
    }
}

fn id_mismatch(inv: &InventoryInfo, stored: &str) -> anyhow::Error {
    anyhow::anyhow!("inventory {}/{} has id {:?}, expected {:?}", inv.namespace, inv.name, stored, inv.id)
}

/// Process-local inventory store, keyed by inventory namespace and name.
#[derive(Default)]
pub struct MemoryInventory {
    state: Mutex<FxHashMap<(String, String), (String, Vec<ObjectIdentifier>)>>,
}

impl MemoryInventory {
    pub fn new() -> Self { Self::default() }

    /// Seed an inventory as if a previous run had stored it.
    pub fn seed(&self, inv: &InventoryInfo, ids: Vec<ObjectIdentifier>) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.insert((inv.namespace.clone(), inv.name.clone()), (inv.id.clone(), ids));
    }

    pub fn contents(&self, inv: &InventoryInfo) -> Option<Vec<ObjectIdentifier>> {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.get(&(inv.namespace.clone(), inv.name.clone())).map(|(_, ids)| ids.clone())
    }
}

#[async_trait]
impl InventoryClient for MemoryInventory {
    async fn load(&self, inv: &InventoryInfo) -> anyhow::Result<Vec<ObjectIdentifier>> {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match st.get(&(inv.namespace.clone(), inv.name.clone())) {
            None => Ok(Vec::new()),
            Some((id, _)) if id != &inv.id => Err(id_mismatch(inv, id)),
            Some((_, ids)) => Ok(ids.clone()),
        }
    }

    async fn store(&self, inv: &InventoryInfo, ids: &[ObjectIdentifier], dry_run: DryRunStrategy) -> anyhow::Result<()> {
        if dry_run.is_dry_run() {
            return Ok(());
        }
        self.seed(inv, ids.to_vec());
        Ok(())
    }

    async fn delete(&self, inv: &InventoryInfo, dry_run: DryRunStrategy) -> anyhow::Result<()> {
        if dry_run.is_dry_run() {
            return Ok(());
        }
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.remove(&(inv.namespace.clone(), inv.name.clone()));
        Ok(())
    }
}

/// Inventory kept in a ConfigMap: one `data` key per owned object in the
/// `namespace_name_group_kind` encoding, labelled with the inventory id.
pub struct ConfigMapInventory {
    client: Arc<dyn ResourceClient>,
    field_manager: String,
}

impl ConfigMapInventory {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self { Self { client, field_manager: "keel".into() } }

    pub fn with_field_manager(mut self, fm: impl Into<String>) -> Self {
        self.field_manager = fm.into();
        self
    }

    /// The ConfigMap document for `ids`.
    pub fn render(inv: &InventoryInfo, ids: &[ObjectIdentifier]) -> anyhow::Result<Object> {
        let data: Map<String, Json> = ids.iter().map(|id| (id.to_string(), Json::String(String::new()))).collect();
        let doc = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": inv.name,
                "namespace": inv.namespace,
                "labels": { INVENTORY_LABEL: inv.id },
            },
            "data": data,
        });
        Ok(Object::from_value(doc)?)
    }

    /// Decode identifiers from an inventory ConfigMap.
    pub fn parse(obj: &Object) -> anyhow::Result<Vec<ObjectIdentifier>> {
        let Some(data) = obj.get_path(&["data"]).and_then(|d| d.as_object()) else { return Ok(Vec::new()) };
        let mut ids = data.keys().map(|k| ObjectIdentifier::parse(k)).collect::<Result<Vec<_>, _>>()?;
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl InventoryClient for ConfigMapInventory {
    async fn load(&self, inv: &InventoryInfo) -> anyhow::Result<Vec<ObjectIdentifier>> {
        let Some(cm) = self.client.get(&inv.identifier()).await? else {
            debug!(namespace = %inv.namespace, name = %inv.name, "inventory: not found, starting empty");
            return Ok(Vec::new());
        };
        match cm.label(INVENTORY_LABEL) {
            Some(id) if id == inv.id => Self::parse(&cm),
            Some(id) => Err(id_mismatch(inv, id)),
            None => Err(id_mismatch(inv, "")),
        }
    }

    async fn store(&self, inv: &InventoryInfo, ids: &[ObjectIdentifier], dry_run: DryRunStrategy) -> anyhow::Result<()> {
        if dry_run.client_only() {
            return Ok(());
        }
        let cm = Self::render(inv, ids)?;
        let opts = MutateOptions { dry_run: dry_run.server(), field_manager: self.field_manager.clone() };
        self.client.patch(&cm, PatchStrategy::ServerSideApply { force: true }, &opts).await?;
        info!(namespace = %inv.namespace, name = %inv.name, objects = ids.len(), dry_run = dry_run.server(), "inventory: stored");
        Ok(())
    }

    async fn delete(&self, inv: &InventoryInfo, dry_run: DryRunStrategy) -> anyhow::Result<()> {
        if dry_run.client_only() {
            return Ok(());
        }
        let opts = DeleteOptions { dry_run: dry_run.server(), ..Default::default() };
        self.client.delete(&inv.identifier(), &opts).await?;
        info!(namespace = %inv.namespace, name = %inv.name, "inventory: deleted");
        Ok(())
    }
}
