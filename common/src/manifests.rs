//! Embedded operand manifests, decoded into typed objects keyed by (kind, name).
use crate::{Error, ManagedKind, ManagedObject, Result};
use serde::Deserialize;
use std::{collections::BTreeMap, str::FromStr};

static WORKER: &str = include_str!("../assets/worker.yaml");
static MASTER: &str = include_str!("../assets/master.yaml");
static TOPOLOGY: &str = include_str!("../assets/topology-updater.yaml");
static GC: &str = include_str!("../assets/gc.yaml");
static PRUNE: &str = include_str!("../assets/prune.yaml");

/// Template objects, one per (kind, name)
#[derive(Clone, Debug, Default)]
pub struct ManifestRegistry {
    objects: BTreeMap<(ManagedKind, String), ManagedObject>,
}

/// Decode one YAML document, selecting the target type from its `kind`
pub fn decode_document(doc: serde_yaml::Value) -> Result<ManagedObject> {
    let value: serde_json::Value = serde_json::to_value(doc)?;
    let kind = value
        .get("kind")
        .and_then(|k| k.as_str())
        .ok_or(Error::MissingObjectKey(".kind"))?;
    let kind = ManagedKind::from_str(kind)?;
    ManagedObject::from_value(kind, value)
}

impl ManifestRegistry {
    /// Registry holding every embedded manifest
    pub fn load() -> Result<Self> {
        let mut reg = Self::default();
        for set in [WORKER, MASTER, TOPOLOGY, GC, PRUNE] {
            reg.add_yaml(set)?;
        }
        Ok(reg)
    }

    /// Add every document of a multi-document YAML string
    pub fn add_yaml(&mut self, yaml: &str) -> Result<()> {
        for de in serde_yaml::Deserializer::from_str(yaml) {
            let doc = serde_yaml::Value::deserialize(de)?;
            if doc.is_null() {
                continue;
            }
            let obj = decode_document(doc)?;
            if obj.name().is_empty() {
                return Err(Error::MissingObjectKey(".metadata.name"));
            }
            self.objects.insert((obj.kind(), obj.name()), obj);
        }
        Ok(())
    }

    /// A fresh copy of the template for `kind`/`name`
    pub fn get(&self, kind: ManagedKind, name: &str) -> Result<ManagedObject> {
        self.objects
            .get(&(kind, name.to_string()))
            .cloned()
            .ok_or_else(|| Error::MissingManifest(format!("{kind} {name}")))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_manifests_decode() {
        let reg = ManifestRegistry::load().unwrap();
        assert!(!reg.is_empty());
        assert!(matches!(
            reg.get(ManagedKind::DaemonSet, "nfd-worker").unwrap(),
            ManagedObject::DaemonSet(_)
        ));
        assert!(matches!(
            reg.get(ManagedKind::Job, "nfd-prune").unwrap(),
            ManagedObject::Job(_)
        ));
        assert!(matches!(
            reg.get(ManagedKind::SecurityContextConstraints, "nfd-topology-updater").unwrap(),
            ManagedObject::SecurityContextConstraints(_)
        ));
    }

    #[test]
    fn test_missing_manifest() {
        let reg = ManifestRegistry::load().unwrap();
        assert!(matches!(
            reg.get(ManagedKind::ConfigMap, "nope"),
            Err(Error::MissingManifest(m)) if m == "ConfigMap nope"
        ));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let mut reg = ManifestRegistry::default();
        let res = reg.add_yaml("apiVersion: v1\nkind: Pod\nmetadata:\n  name: p\n");
        assert!(matches!(res, Err(Error::UnknownKind(k)) if k == "Pod"));
    }

    #[test]
    fn test_missing_kind_is_rejected() {
        let mut reg = ManifestRegistry::default();
        let res = reg.add_yaml("apiVersion: v1\nmetadata:\n  name: p\n");
        assert!(matches!(res, Err(Error::MissingObjectKey(".kind"))));
    }

    #[test]
    fn test_multi_document() {
        let mut reg = ManifestRegistry::default();
        reg.add_yaml(
            "---\napiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\ndata:\n  k: v\n",
        )
        .unwrap();
        assert_eq!(reg.len(), 2);
    }
}
