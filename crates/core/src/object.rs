//! Object identity and the opaque remote document.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::{CoreError, CoreResult};

/// Annotation recording which inventory applied (and therefore owns) an object.
pub const OWNING_INVENTORY_ANNOTATION: &str = "config.k8s.io/owning-inventory";
/// Lifecycle annotation; `keep` prevents prune and destroy from deleting the object.
pub const ON_REMOVE_ANNOTATION: &str = "cli-utils.sigs.k8s.io/on-remove";
pub const ON_REMOVE_KEEP: &str = "keep";
/// Legacy spelling of the same lifecycle directive.
pub const LIFECYCLE_DELETION_ANNOTATION: &str = "client.lifecycle.config.k8s.io/deletion";
pub const LIFECYCLE_DETACH: &str = "detach";
/// Label carried by inventory objects holding the inventory id.
pub const INVENTORY_LABEL: &str = "cli-utils.sigs.k8s.io/inventory-id";

const CRD_GROUP: &str = "apiextensions.k8s.io";
const CRD_KIND: &str = "CustomResourceDefinition";

/// Identifies one resource across a run. Ordered by namespace, group, kind, name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectIdentifier {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectIdentifier {
    pub fn new(group: impl Into<String>, kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { group: group.into(), kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }

    pub fn is_namespace(&self) -> bool { self.group.is_empty() && self.kind == "Namespace" }

    pub fn is_crd(&self) -> bool { self.group == CRD_GROUP && self.kind == CRD_KIND }

    /// Namespaces and CRDs must exist before the objects that live in / are typed by them.
    pub fn is_infrastructure(&self) -> bool { self.is_namespace() || self.is_crd() }

    /// Parse the inventory encoding `namespace_name_group_kind`. Colons in names
    /// (RBAC objects) are stored as `__`.
    pub fn parse(s: &str) -> CoreResult<Self> {
        let parts: Vec<&str> = s.split('_').collect();
        if parts.len() < 4 {
            return Err(CoreError::InvalidIdentifier(s.to_string()));
        }
        let namespace = parts[0];
        let kind = parts[parts.len() - 1];
        let group = parts[parts.len() - 2];
        let name = parts[1..parts.len() - 2].join("_").replace("__", ":");
        if name.is_empty() || kind.is_empty() {
            return Err(CoreError::InvalidIdentifier(s.to_string()));
        }
        Ok(Self::new(group, kind, namespace, name))
    }

    /// Short human form, e.g. `deployment.apps/foo`.
    pub fn short(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.kind.to_lowercase(), self.name)
        } else {
            format!("{}.{}/{}", self.kind.to_lowercase(), self.group, self.name)
        }
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}_{}", self.namespace, self.name.replace(':', "__"), self.group, self.kind)
    }
}

impl Ord for ObjectIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.namespace
            .cmp(&other.namespace)
            .then_with(|| self.group.cmp(&other.group))
            .then_with(|| self.kind.cmp(&other.kind))
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for ObjectIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

/// A remote resource document. Only `apiVersion`, `kind` and `metadata` are
/// interpreted; everything else is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Object {
    raw: Map<String, Json>,
}

impl Object {
    pub fn from_value(raw: Json) -> CoreResult<Self> {
        let Json::Object(raw) = raw else { return Err(CoreError::NotAnObject) };
        if raw.get("apiVersion").and_then(|v| v.as_str()).map_or(true, str::is_empty) {
            return Err(CoreError::MissingField("apiVersion"));
        }
        if raw.get("kind").and_then(|v| v.as_str()).map_or(true, str::is_empty) {
            return Err(CoreError::MissingField("kind"));
        }
        let meta = raw.get("metadata").and_then(|m| m.as_object()).ok_or(CoreError::MissingField("metadata"))?;
        if meta.get("name").and_then(|v| v.as_str()).map_or(true, str::is_empty) {
            return Err(CoreError::MissingField("metadata.name"));
        }
        Ok(Self { raw })
    }

    pub fn raw(&self) -> &Map<String, Json> { &self.raw }

    pub fn to_value(&self) -> Json { Json::Object(self.raw.clone()) }

    pub fn into_value(self) -> Json { Json::Object(self.raw) }

    pub fn api_version(&self) -> &str { self.raw.get("apiVersion").and_then(|v| v.as_str()).unwrap_or_default() }

    pub fn group(&self) -> &str {
        match self.api_version().split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }

    pub fn kind(&self) -> &str { self.raw.get("kind").and_then(|v| v.as_str()).unwrap_or_default() }

    fn metadata(&self) -> Option<&Map<String, Json>> { self.raw.get("metadata").and_then(|m| m.as_object()) }

    fn meta_str(&self, key: &str) -> Option<&str> { self.metadata().and_then(|m| m.get(key)).and_then(|v| v.as_str()) }

    pub fn name(&self) -> &str { self.meta_str("name").unwrap_or_default() }

    pub fn namespace(&self) -> Option<&str> { self.meta_str("namespace").filter(|s| !s.is_empty()) }

    pub fn uid(&self) -> Option<&str> { self.meta_str("uid").filter(|s| !s.is_empty()) }

    pub fn generation(&self) -> Option<i64> { self.metadata().and_then(|m| m.get("generation")).and_then(|v| v.as_i64()) }

    pub fn identifier(&self) -> ObjectIdentifier {
        ObjectIdentifier::new(self.group(), self.kind(), self.namespace().unwrap_or_default(), self.name())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata().and_then(|m| m.get("annotations")).and_then(|a| a.get(key)).and_then(|v| v.as_str())
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata().and_then(|m| m.get("labels")).and_then(|a| a.get(key)).and_then(|v| v.as_str())
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) { self.set_meta_entry("annotations", key, value) }

    pub fn set_label(&mut self, key: &str, value: &str) { self.set_meta_entry("labels", key, value) }

    fn set_meta_entry(&mut self, map: &str, key: &str, value: &str) {
        let meta = self.raw.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
        if let Some(meta) = meta.as_object_mut() {
            let entries = meta.entry(map).or_insert_with(|| Json::Object(Map::new()));
            if !entries.is_object() {
                *entries = Json::Object(Map::new());
            }
            if let Some(entries) = entries.as_object_mut() {
                entries.insert(key.to_string(), Json::String(value.to_string()));
            }
        }
    }

    /// For CRD documents, the `(group, kind)` the definition introduces.
    pub fn crd_defines(&self) -> Option<(String, String)> {
        if self.group() != CRD_GROUP || self.kind() != CRD_KIND {
            return None;
        }
        let spec = self.raw.get("spec")?;
        let group = spec.get("group")?.as_str()?;
        let kind = spec.get("names")?.get("kind")?.as_str()?;
        Some((group.to_string(), kind.to_string()))
    }

    /// Nested lookup by path segments, e.g. `["status", "phase"]`.
    pub fn get_path(&self, path: &[&str]) -> Option<&Json> {
        let (first, rest) = path.split_first()?;
        let mut cur = self.raw.get(*first)?;
        for seg in rest {
            cur = cur.get(*seg)?;
        }
        Some(cur)
    }
}

impl TryFrom<Json> for Object {
    type Error = CoreError;

    fn try_from(v: Json) -> CoreResult<Self> { Self::from_value(v) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment() -> Object {
        Object::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "foo", "namespace": "bar", "uid": "u-1", "generation": 3 }
        }))
        .unwrap()
    }

    #[test]
    fn identifier_from_document() {
        let id = deployment().identifier();
        assert_eq!(id, ObjectIdentifier::new("apps", "Deployment", "bar", "foo"));
        assert_eq!(id.short(), "deployment.apps/foo");
        assert_eq!(deployment().generation(), Some(3));
    }

    #[test]
    fn from_value_rejects_incomplete_documents() {
        assert_eq!(Object::from_value(serde_json::json!([])), Err(CoreError::NotAnObject));
        let e = Object::from_value(serde_json::json!({"kind": "Pod", "metadata": {"name": "x"}})).unwrap_err();
        assert_eq!(e, CoreError::MissingField("apiVersion"));
        let e = Object::from_value(serde_json::json!({"apiVersion": "v1", "kind": "Pod", "metadata": {}})).unwrap_err();
        assert_eq!(e, CoreError::MissingField("metadata.name"));
    }

    #[test]
    fn ordering_is_namespace_group_kind_name() {
        let mut ids = vec![
            ObjectIdentifier::new("apps", "Deployment", "b", "a"),
            ObjectIdentifier::new("", "Pod", "a", "z"),
            ObjectIdentifier::new("", "ConfigMap", "a", "z"),
            ObjectIdentifier::new("", "ConfigMap", "a", "y"),
        ];
        ids.sort();
        let names: Vec<String> = ids.iter().map(|i| format!("{}/{}/{}", i.namespace, i.kind, i.name)).collect();
        assert_eq!(names, vec!["a/ConfigMap/y", "a/ConfigMap/z", "a/Pod/z", "b/Deployment/a"]);
    }

    #[test]
    fn inventory_encoding_roundtrips_rbac_names() {
        let id = ObjectIdentifier::new("rbac.authorization.k8s.io", "ClusterRole", "", "system:viewer");
        let s = id.to_string();
        assert_eq!(s, "_system__viewer_rbac.authorization.k8s.io_ClusterRole");
        assert_eq!(ObjectIdentifier::parse(&s).unwrap(), id);
        assert!(ObjectIdentifier::parse("ns_name_kind").is_err());
    }

    #[test]
    fn set_annotation_creates_missing_maps() {
        let mut obj = deployment();
        obj.set_annotation(OWNING_INVENTORY_ANNOTATION, "inv-1");
        assert_eq!(obj.annotation(OWNING_INVENTORY_ANNOTATION), Some("inv-1"));
        assert_eq!(obj.label(INVENTORY_LABEL), None);
    }

    #[test]
    fn crd_defines_reads_group_and_kind() {
        let crd = Object::from_value(serde_json::json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": { "name": "widgets.example.io" },
            "spec": { "group": "example.io", "names": { "kind": "Widget" } }
        }))
        .unwrap();
        assert!(crd.identifier().is_crd());
        assert_eq!(crd.crd_defines(), Some(("example.io".to_string(), "Widget".to_string())));
        assert_eq!(deployment().crd_defines(), None);
    }
}
