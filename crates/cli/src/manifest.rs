//! Manifest loading: multi-document YAML files into remote documents.

use std::io::Read;

use anyhow::{anyhow, Context, Result};
use keel_core::object::Object;
use serde::Deserialize;
use serde_json::Value as Json;

pub fn max_yaml_bytes() -> usize {
    std::env::var("KEEL_MAX_YAML_BYTES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(8_000_000)
}

pub fn max_yaml_nodes() -> usize {
    std::env::var("KEEL_MAX_YAML_NODES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(100_000)
}

/// True once `v` holds `max` nodes or more. Stops walking at the limit.
pub fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parse every document of a YAML stream. Empty documents are skipped and
/// `List` kinds are flattened into their items.
pub fn parse_documents(source: &str, yaml: &str) -> Result<Vec<Object>> {
    if yaml.len() > max_yaml_bytes() {
        return Err(anyhow!("{source}: YAML payload too large (>{} bytes)", max_yaml_bytes()));
    }
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).with_context(|| format!("{source}: parsing document {}", i + 1))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).with_context(|| format!("{source}: converting document {} to JSON", i + 1))?;
        if json_node_budget_exceeded(&json, max_yaml_nodes()) {
            return Err(anyhow!("{source}: document {} too complex (>{} nodes)", i + 1, max_yaml_nodes()));
        }
        push_document(&mut out, json).with_context(|| format!("{source}: document {}", i + 1))?;
    }
    Ok(out)
}

fn push_document(out: &mut Vec<Object>, json: Json) -> Result<()> {
    let is_list = json.get("kind").and_then(Json::as_str).map_or(false, |k| k.ends_with("List"));
    if let (true, Some(items)) = (is_list, json.get("items").and_then(Json::as_array)) {
        for item in items {
            out.push(Object::from_value(item.clone())?);
        }
        return Ok(());
    }
    out.push(Object::from_value(json)?);
    Ok(())
}

/// Load every path in order; `-` reads stdin.
pub fn load(paths: &[String]) -> Result<Vec<Object>> {
    let mut out = Vec::new();
    for path in paths {
        let text = if path == "-" {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
            buf
        } else {
            std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?
        };
        out.extend(parse_documents(path, &text)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_document_stream() {
        let yaml = "\
apiVersion: v1
kind: Namespace
metadata:
  name: shop
---
---
apiVersion: v1
kind: List
items:
  - apiVersion: v1
    kind: ConfigMap
    metadata: { name: a, namespace: shop }
  - apiVersion: apps/v1
    kind: Deployment
    metadata: { name: web, namespace: shop }
";
        let objs = parse_documents("test.yaml", yaml).unwrap();
        let names: Vec<String> = objs.iter().map(|o| o.identifier().short()).collect();
        assert_eq!(names, vec!["namespace/shop", "configmap/a", "deployment.apps/web"]);
    }

    #[test]
    fn incomplete_document_names_its_position() {
        let yaml = "apiVersion: v1\nkind: ConfigMap\nmetadata: { name: a }\n---\nkind: ConfigMap\nmetadata: { name: b }\n";
        let err = format!("{:#}", parse_documents("bad.yaml", yaml).unwrap_err());
        assert!(err.contains("bad.yaml: document 2"), "{err}");
        assert!(err.contains("apiVersion"), "{err}");
    }

    #[test]
    fn node_budget_stops_early() {
        let v = serde_json::json!({ "a": [1, 2, 3], "b": { "c": true } });
        assert!(!json_node_budget_exceeded(&v, 100));
        assert!(json_node_budget_exceeded(&v, 4));
    }
}
