use crate::conditions::InstanceCondition;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer guarding the cleanup of everything an instance deployed
pub static FINALIZER: &str = "nfd.k8s-sigs.io/finalizer";

pub static DEFAULT_PULL_POLICY: &str = "Always";
pub const DEFAULT_SERVICE_PORT: i32 = 12000;

/// Operand (nfd-master, nfd-worker, ...) container settings
#[derive(Serialize, Deserialize, Default, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperandSpec {
    /// Image of the operand, defaults to the operator configured image
    pub image: Option<String>,
    /// Pull policy of the operand image. Default to "Always"
    pub image_pull_policy: Option<String>,
    /// Port the nfd-master service listens on. Default to 12000
    pub service_port: Option<i32>,
}

/// Raw configuration file content
#[derive(Serialize, Deserialize, Default, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapSpec {
    /// Content of the configuration file
    #[serde(default)]
    pub config_data: String,
}

/// Describe a node-feature-discovery deployment
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "NodeFeatureDiscovery",
    status = "NodeFeatureDiscoveryStatus",
    shortname = "nfd",
    group = "nfd.k8s-sigs.io",
    version = "v1",
    namespaced
)]
#[kube(
    doc = "Custom resource representing a node-feature-discovery deployment",
    printcolumn = r#"
    {"name":"topology", "type":"boolean", "description":"Topology updater enabled", "jsonPath":".spec.topologyUpdater"},
    {"name":"available", "type":"string", "description":"Available", "jsonPath":".status.conditions[?(@.type == 'Available')].status"},
    {"name":"degraded", "type":"string", "description":"Degraded", "jsonPath":".status.conditions[?(@.type == 'Degraded')].status"},
    {"name":"message", "type":"string", "description":"Errors", "jsonPath":".status.conditions[?(@.status == 'True')].message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeFeatureDiscoverySpec {
    /// Operand container settings
    #[serde(default)]
    pub operand: OperandSpec,
    /// nfd-worker configuration file
    #[serde(default)]
    pub worker_config: ConfigMapSpec,
    /// Extra configuration shipped alongside the worker configuration
    pub custom_config: Option<ConfigMapSpec>,
    /// Deploy the topology updater daemon
    #[serde(default)]
    pub topology_updater: bool,
    /// Run the prune job to clean node labels when the instance is deleted
    #[serde(default)]
    pub pruner_on_delete: bool,
    /// Instance name, allows several nfd deployments on the same cluster
    pub instance: Option<String>,
    /// Extra label namespaces nfd-master is allowed to publish
    pub extra_label_ns: Option<Vec<String>>,
    /// Regular expression filtering the published label names
    pub label_white_list: Option<String>,
    /// Feature names published as extended resources
    pub resource_labels: Option<Vec<String>>,
}

/// The status object of `NodeFeatureDiscovery`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeFeatureDiscoveryStatus {
    /// Available, Upgradeable, Progressing and Degraded conditions
    #[serde(default)]
    pub conditions: Vec<InstanceCondition>,
    /// Generation the conditions were computed for
    pub observed_generation: Option<i64>,
}

#[must_use]
pub fn has_finalizer(finalizers: &[String], finalizer: &str) -> bool {
    finalizers.iter().any(|f| f == finalizer)
}

/// Append `finalizer` when missing, keeping the other entries in place
pub fn add_finalizer(finalizers: &mut Vec<String>, finalizer: &str) -> bool {
    if has_finalizer(finalizers, finalizer) {
        false
    } else {
        finalizers.push(finalizer.to_string());
        true
    }
}

/// Drop every occurrence of `finalizer`, keeping the relative order of the rest
pub fn remove_finalizer(finalizers: &mut Vec<String>, finalizer: &str) -> bool {
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    before != finalizers.len()
}

impl NodeFeatureDiscovery {
    #[must_use]
    pub fn has_finalizer(&self) -> bool {
        has_finalizer(self.finalizers(), FINALIZER)
    }

    pub fn add_finalizer(&mut self) -> bool {
        add_finalizer(self.metadata.finalizers.get_or_insert_with(Vec::new), FINALIZER)
    }

    pub fn remove_finalizer(&mut self) -> bool {
        match self.metadata.finalizers.as_mut() {
            Some(list) => remove_finalizer(list, FINALIZER),
            None => false,
        }
    }

    #[must_use]
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    #[must_use]
    pub fn operand_image(&self, default: &str) -> String {
        self.spec
            .operand
            .image
            .clone()
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    #[must_use]
    pub fn pull_policy(&self) -> String {
        self.spec
            .operand
            .image_pull_policy
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_PULL_POLICY.to_string())
    }

    #[must_use]
    pub fn service_port(&self) -> i32 {
        self.spec
            .operand
            .service_port
            .filter(|p| *p > 0)
            .unwrap_or(DEFAULT_SERVICE_PORT)
    }

    #[must_use]
    pub fn conditions(&self) -> &[InstanceCondition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_has_finalizer_is_exact_match() {
        let l = list(&["a", "nfd.k8s-sigs.io/finalizer-old", "b"]);
        assert!(!has_finalizer(&l, FINALIZER));
        let l = list(&["a", FINALIZER]);
        assert!(has_finalizer(&l, FINALIZER));
    }

    #[test]
    fn test_add_finalizer_appends_once() {
        let mut l = list(&["x", "y"]);
        assert!(add_finalizer(&mut l, FINALIZER));
        assert!(!add_finalizer(&mut l, FINALIZER));
        assert_eq!(l, list(&["x", "y", FINALIZER]));
    }

    #[test]
    fn test_remove_finalizer_keeps_order() {
        let mut l = list(&["x", FINALIZER, "y", "z"]);
        assert!(remove_finalizer(&mut l, FINALIZER));
        assert_eq!(l, list(&["x", "y", "z"]));
        assert!(!remove_finalizer(&mut l, FINALIZER));
    }

    #[test]
    fn test_instance_finalizer_helpers() {
        let mut inst = NodeFeatureDiscovery::new("nfd", NodeFeatureDiscoverySpec::default());
        assert!(!inst.has_finalizer());
        assert!(!inst.remove_finalizer());
        assert!(inst.add_finalizer());
        assert!(inst.has_finalizer());
        assert!(inst.remove_finalizer());
        assert_eq!(inst.metadata.finalizers, Some(vec![]));
    }

    #[test]
    fn test_operand_defaults() {
        let mut inst = NodeFeatureDiscovery::new("nfd", NodeFeatureDiscoverySpec::default());
        assert_eq!(inst.operand_image("img:1"), "img:1");
        assert_eq!(inst.pull_policy(), "Always");
        assert_eq!(inst.service_port(), 12000);
        inst.spec.operand = OperandSpec {
            image: Some("img:2".to_string()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            service_port: Some(9000),
        };
        assert_eq!(inst.operand_image("img:1"), "img:2");
        assert_eq!(inst.pull_policy(), "IfNotPresent");
        assert_eq!(inst.service_port(), 9000);
    }
}
