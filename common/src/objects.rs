//! Typed registry of every object kind the operator manages.
//!
//! `ManagedKind` is the discriminant, `ManagedObject` carries the typed payload.
//! Both are generated from a single kind list so that adding a kind is a
//! one-line change and every `match` stays exhaustive.
use crate::{Error, Result};
use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, Deployment},
        batch::v1::Job,
        core::v1::{ConfigMap, Service, ServiceAccount},
        rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding},
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::{api::DynamicObject, discovery::ApiResource};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// OpenShift SecurityContextConstraints, cluster scoped and not part of k8s-openapi
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContextConstraints {
    #[serde(default = "scc_api_version")]
    pub api_version: String,
    #[serde(default = "scc_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub allow_host_dir_volume_plugin: bool,
    #[serde(default, rename = "allowHostIPC")]
    pub allow_host_ipc: bool,
    #[serde(default)]
    pub allow_host_network: bool,
    #[serde(default, rename = "allowHostPID")]
    pub allow_host_pid: bool,
    #[serde(default)]
    pub allow_host_ports: bool,
    #[serde(default)]
    pub allow_privileged_container: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_privilege_escalation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_capabilities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_add_capabilities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_drop_capabilities: Option<Vec<String>>,
    #[serde(default)]
    pub read_only_root_filesystem: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_group: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub se_linux_context: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplemental_groups: Option<serde_json::Value>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
}

fn scc_api_version() -> String {
    <SecurityContextConstraints as k8s_openapi::Resource>::API_VERSION.to_string()
}

fn scc_kind() -> String {
    <SecurityContextConstraints as k8s_openapi::Resource>::KIND.to_string()
}

impl k8s_openapi::Resource for SecurityContextConstraints {
    type Scope = k8s_openapi::ClusterResourceScope;

    const API_VERSION: &'static str = "security.openshift.io/v1";
    const GROUP: &'static str = "security.openshift.io";
    const KIND: &'static str = "SecurityContextConstraints";
    const URL_PATH_SEGMENT: &'static str = "securitycontextconstraints";
    const VERSION: &'static str = "v1";
}

impl k8s_openapi::Metadata for SecurityContextConstraints {
    type Ty = ObjectMeta;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

macro_rules! managed_objects {
    ($($variant:ident => $ty:ty),+ $(,)?) => {
        /// Discriminant of every supported managed kind
        #[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum ManagedKind {
            $($variant),+
        }

        impl ManagedKind {
            pub const ALL: &'static [ManagedKind] = &[$(ManagedKind::$variant),+];

            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(ManagedKind::$variant => <$ty as k8s_openapi::Resource>::KIND),+
                }
            }

            #[must_use]
            pub fn api_version(self) -> &'static str {
                match self {
                    $(ManagedKind::$variant => <$ty as k8s_openapi::Resource>::API_VERSION),+
                }
            }

            #[must_use]
            pub fn api_resource(self) -> ApiResource {
                match self {
                    $(ManagedKind::$variant => ApiResource::erase::<$ty>(&())),+
                }
            }
        }

        impl FromStr for ManagedKind {
            type Err = Error;

            fn from_str(kind: &str) -> Result<Self> {
                match kind {
                    $(k if k == <$ty as k8s_openapi::Resource>::KIND => Ok(ManagedKind::$variant),)+
                    other => Err(Error::UnknownKind(other.to_string())),
                }
            }
        }

        /// A managed object with its typed payload
        #[derive(Clone, Debug, PartialEq)]
        pub enum ManagedObject {
            $($variant($ty)),+
        }

        impl ManagedObject {
            #[must_use]
            pub fn kind(&self) -> ManagedKind {
                match self {
                    $(ManagedObject::$variant(_) => ManagedKind::$variant),+
                }
            }

            #[must_use]
            pub fn meta(&self) -> &ObjectMeta {
                match self {
                    $(ManagedObject::$variant(o) => &o.metadata),+
                }
            }

            pub fn meta_mut(&mut self) -> &mut ObjectMeta {
                match self {
                    $(ManagedObject::$variant(o) => &mut o.metadata),+
                }
            }

            pub fn to_value(&self) -> Result<serde_json::Value> {
                match self {
                    $(ManagedObject::$variant(o) => Ok(serde_json::to_value(o)?)),+
                }
            }

            /// Decode a JSON document into the typed payload selected by `kind`
            pub fn from_value(kind: ManagedKind, value: serde_json::Value) -> Result<Self> {
                match kind {
                    $(ManagedKind::$variant => Ok(ManagedObject::$variant(serde_json::from_value(value)?))),+
                }
            }
        }

        $(
            impl From<$ty> for ManagedObject {
                fn from(o: $ty) -> Self {
                    ManagedObject::$variant(o)
                }
            }
        )+
    };
}

managed_objects! {
    ServiceAccount => ServiceAccount,
    Role => Role,
    RoleBinding => RoleBinding,
    ClusterRole => ClusterRole,
    ClusterRoleBinding => ClusterRoleBinding,
    ConfigMap => ConfigMap,
    DaemonSet => DaemonSet,
    Deployment => Deployment,
    Service => Service,
    SecurityContextConstraints => SecurityContextConstraints,
    Job => Job,
}

impl ManagedKind {
    #[must_use]
    pub fn is_cluster_scoped(self) -> bool {
        matches!(
            self,
            ManagedKind::ClusterRole | ManagedKind::ClusterRoleBinding | ManagedKind::SecurityContextConstraints
        )
    }
}

impl fmt::Display for ManagedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ManagedObject {
    #[must_use]
    pub fn name(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }

    #[must_use]
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            kind: self.kind(),
            namespace: if self.kind().is_cluster_scoped() {
                None
            } else {
                self.meta().namespace.clone()
            },
            name: self.name(),
        }
    }

    pub fn from_dynamic(kind: ManagedKind, obj: DynamicObject) -> Result<Self> {
        Self::from_value(kind, serde_json::to_value(obj)?)
    }

    pub fn to_dynamic(&self) -> Result<DynamicObject> {
        Ok(serde_json::from_value(self.to_value()?)?)
    }
}

/// Identity of a managed object: (kind, namespace, name)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: ManagedKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    #[must_use]
    pub fn namespaced(kind: ManagedKind, namespace: &str, name: &str) -> Self {
        ObjectKey {
            kind,
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    #[must_use]
    pub fn cluster(kind: ManagedKind, name: &str) -> Self {
        ObjectKey {
            kind,
            namespace: None,
            name: name.to_string(),
        }
    }

    /// Key for `name` of `kind` as owned by an instance living in `namespace`.
    /// Cluster scoped kinds drop the namespace.
    #[must_use]
    pub fn for_instance(kind: ManagedKind, namespace: &str, name: &str) -> Self {
        if kind.is_cluster_scoped() {
            Self::cluster(kind, name)
        } else {
            Self::namespaced(kind, namespace, name)
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_from_str() {
        assert_eq!(ManagedKind::from_str("DaemonSet").unwrap(), ManagedKind::DaemonSet);
        assert_eq!(
            ManagedKind::from_str("SecurityContextConstraints").unwrap(),
            ManagedKind::SecurityContextConstraints
        );
        assert!(matches!(ManagedKind::from_str("Pod"), Err(Error::UnknownKind(k)) if k == "Pod"));
    }

    #[test]
    fn test_every_kind_parses_its_own_name() {
        for kind in ManagedKind::ALL {
            assert_eq!(ManagedKind::from_str(kind.as_str()).unwrap(), *kind);
        }
    }

    #[test]
    fn test_scope() {
        assert!(ManagedKind::ClusterRole.is_cluster_scoped());
        assert!(ManagedKind::SecurityContextConstraints.is_cluster_scoped());
        assert!(!ManagedKind::RoleBinding.is_cluster_scoped());
        assert_eq!(
            ObjectKey::for_instance(ManagedKind::ClusterRoleBinding, "ns1", "nfd-master").namespace,
            None
        );
        assert_eq!(
            ObjectKey::for_instance(ManagedKind::ConfigMap, "ns1", "nfd-worker").namespace,
            Some("ns1".to_string())
        );
    }

    #[test]
    fn test_key_display() {
        let key = ObjectKey::cluster(ManagedKind::ClusterRole, "nfd-gc");
        assert_eq!(key.to_string(), "ClusterRole nfd-gc");
    }

    #[test]
    fn test_scc_decoding_fills_type_meta() {
        let obj = ManagedObject::from_value(
            ManagedKind::SecurityContextConstraints,
            json!({"metadata": {"name": "nfd-worker"}, "allowHostNetwork": true, "users": ["a"]}),
        )
        .unwrap();
        let ManagedObject::SecurityContextConstraints(scc) = &obj else {
            panic!("wrong variant")
        };
        assert_eq!(scc.api_version, "security.openshift.io/v1");
        assert_eq!(scc.kind, "SecurityContextConstraints");
        assert!(scc.allow_host_network);
        assert_eq!(obj.key(), ObjectKey::cluster(ManagedKind::SecurityContextConstraints, "nfd-worker"));
    }

    #[test]
    fn test_from_value_rejects_mismatched_api_version() {
        let res = ManagedObject::from_value(
            ManagedKind::ConfigMap,
            json!({"apiVersion": "apps/v1", "kind": "ConfigMap", "metadata": {"name": "x"}}),
        );
        assert!(res.is_err());
    }
}
