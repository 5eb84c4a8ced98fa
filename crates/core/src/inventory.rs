//! Inventory: the persisted set of identifiers a named apply group owns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::client::DryRunStrategy;
use crate::object::{Object, ObjectIdentifier, INVENTORY_LABEL};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryInfo {
    pub name: String,
    pub namespace: String,
    /// Stable id stamped on owned objects as the owning-inventory annotation.
    pub id: String,
}

impl InventoryInfo {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: namespace.into(), id: id.into() }
    }

    /// Identifier of the ConfigMap backing this inventory.
    pub fn identifier(&self) -> ObjectIdentifier { ObjectIdentifier::new("", "ConfigMap", &self.namespace, &self.name) }

    /// Read an inventory handle off a ConfigMap carrying the inventory label.
    pub fn from_object(obj: &Object) -> Option<Self> {
        let id = obj.label(INVENTORY_LABEL)?;
        Some(Self::new(obj.name(), obj.namespace().unwrap_or_default(), id))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InventoryPolicy {
    /// Only touch objects whose owning-inventory annotation equals ours.
    #[default]
    MustMatch,
    /// Also take objects with no owner.
    AdoptIfNoInventory,
    /// Take objects regardless of owner.
    AdoptAll,
}

#[async_trait]
pub trait InventoryClient: Send + Sync {
    /// Previously stored identifiers; empty when the inventory does not exist yet.
    async fn load(&self, inv: &InventoryInfo) -> anyhow::Result<Vec<ObjectIdentifier>>;
    /// Replace the stored set. `Client` dry-run must not persist anything.
    async fn store(&self, inv: &InventoryInfo, ids: &[ObjectIdentifier], dry_run: DryRunStrategy) -> anyhow::Result<()>;
    /// Remove the inventory itself. Backends without a separate record just store an empty set.
    async fn delete(&self, inv: &InventoryInfo, dry_run: DryRunStrategy) -> anyhow::Result<()> {
        self.store(inv, &[], dry_run).await
    }
}
