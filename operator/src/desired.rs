//! Desired state of every managed object, rendered from the embedded templates.
use common::{ManagedKind, ManagedObject, NodeFeatureDiscovery, Result, manifests::ManifestRegistry};
use k8s_openapi::{
    api::core::v1::{KeyToPath, PodSpec},
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::ResourceExt;
use serde_json::Value;

pub static MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub static MANAGED_BY: &str = "nfd-operator";
pub static INSTANCE_LABEL: &str = "nfd.k8s-sigs.io/instance";

pub static WORKER_CONFIG_KEY: &str = "nfd-worker.conf";
pub static CUSTOM_CONFIG_KEY: &str = "custom.conf";
static WORKER_CONFIG_DIR: &str = "/etc/kubernetes/node-feature-discovery";

fn instance_arg(inst: &NodeFeatureDiscovery) -> Option<String> {
    inst.spec
        .instance
        .as_ref()
        .filter(|i| !i.is_empty())
        .map(|i| format!("-instance={i}"))
}

fn master_args(inst: &NodeFeatureDiscovery) -> Vec<String> {
    let mut args = vec![format!("-port={}", inst.service_port())];
    args.extend(instance_arg(inst));
    if let Some(ns) = inst.spec.extra_label_ns.as_ref().filter(|l| !l.is_empty()) {
        args.push(format!("-extra-label-ns={}", ns.join(",")));
    }
    if let Some(re) = inst.spec.label_white_list.as_ref().filter(|l| !l.is_empty()) {
        args.push(format!("-label-whitelist={re}"));
    }
    if let Some(res) = inst.spec.resource_labels.as_ref().filter(|l| !l.is_empty()) {
        args.push(format!("-resource-labels={}", res.join(",")));
    }
    args
}

fn worker_args(inst: &NodeFeatureDiscovery) -> Vec<String> {
    let mut args = vec![
        format!("-config={WORKER_CONFIG_DIR}/{WORKER_CONFIG_KEY}"),
        format!("-server=nfd-master:{}", inst.service_port()),
    ];
    args.extend(instance_arg(inst));
    args
}

fn custom_config(inst: &NodeFeatureDiscovery) -> Option<&str> {
    inst.spec
        .custom_config
        .as_ref()
        .map(|c| c.config_data.as_str())
        .filter(|c| !c.is_empty())
}

/// Image and pull policy of every container of a pod template
fn set_containers(pod: &mut PodSpec, image: &str, pull_policy: &str) {
    for c in pod.containers.iter_mut() {
        c.image = Some(image.to_string());
        c.image_pull_policy = Some(pull_policy.to_string());
    }
}

fn first_container_args(pod: &mut PodSpec, args: Vec<String>) {
    if let Some(c) = pod.containers.first_mut() {
        c.args = Some(args);
    }
}

/// Rewrite `system:serviceaccount:<ns>:<sa>` users into the instance namespace
fn scc_user(user: &str, namespace: &str) -> String {
    match user.strip_prefix("system:serviceaccount:").and_then(|r| r.split_once(':')) {
        Some((_, sa)) => format!("system:serviceaccount:{namespace}:{sa}"),
        None => user.to_string(),
    }
}

/// Apply the instance settings on top of a template (or a live copy of it)
pub fn set_desired(obj: &mut ManagedObject, inst: &NodeFeatureDiscovery, image: &str) {
    let namespace = inst.namespace().unwrap_or_default();
    let pull_policy = inst.pull_policy();
    let cluster_scoped = obj.kind().is_cluster_scoped();
    {
        let meta = obj.meta_mut();
        if !cluster_scoped {
            meta.namespace = Some(namespace.clone());
        }
        let labels = meta.labels.get_or_insert_with(Default::default);
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
        if !cluster_scoped {
            labels.insert(INSTANCE_LABEL.to_string(), inst.name_any());
        }
    }
    match obj {
        ManagedObject::RoleBinding(rb) => {
            for s in rb.subjects.iter_mut().flatten() {
                s.namespace = Some(namespace.clone());
            }
        }
        ManagedObject::ClusterRoleBinding(crb) => {
            for s in crb.subjects.iter_mut().flatten() {
                s.namespace = Some(namespace.clone());
            }
        }
        ManagedObject::SecurityContextConstraints(scc) => {
            scc.users = scc.users.iter().map(|u| scc_user(u, &namespace)).collect();
        }
        ManagedObject::ConfigMap(cm) => {
            let mut data = std::collections::BTreeMap::new();
            data.insert(WORKER_CONFIG_KEY.to_string(), inst.spec.worker_config.config_data.clone());
            if let Some(custom) = custom_config(inst) {
                data.insert(CUSTOM_CONFIG_KEY.to_string(), custom.to_string());
            }
            cm.data = Some(data);
        }
        ManagedObject::DaemonSet(ds) => {
            let is_worker = ds.metadata.name.as_deref() == Some("nfd-worker");
            let pod = ds.spec.as_mut().and_then(|s| s.template.spec.as_mut());
            if let Some(pod) = pod {
                set_containers(pod, image, &pull_policy);
                if is_worker {
                    first_container_args(pod, worker_args(inst));
                    set_worker_config_items(pod, custom_config(inst).is_some());
                }
            }
        }
        ManagedObject::Deployment(dep) => {
            let is_master = dep.metadata.name.as_deref() == Some("nfd-master");
            let port = inst.service_port();
            let pod = dep.spec.as_mut().and_then(|s| s.template.spec.as_mut());
            if let Some(pod) = pod {
                set_containers(pod, image, &pull_policy);
                if is_master {
                    first_container_args(pod, master_args(inst));
                    if let Some(p) = pod
                        .containers
                        .first_mut()
                        .and_then(|c| c.ports.as_mut())
                        .and_then(|p| p.first_mut())
                    {
                        p.container_port = port;
                    }
                }
            }
        }
        ManagedObject::Service(svc) => {
            let port = inst.service_port();
            if let Some(p) = svc
                .spec
                .as_mut()
                .and_then(|s| s.ports.as_mut())
                .and_then(|p| p.first_mut())
            {
                p.port = port;
                p.target_port = Some(IntOrString::Int(port));
            }
        }
        ManagedObject::Job(job) => {
            if let Some(pod) = job.spec.as_mut().and_then(|s| s.template.spec.as_mut()) {
                set_containers(pod, image, &pull_policy);
                let args = pod.containers.first_mut().map(|c| c.args.get_or_insert_with(Vec::new));
                if let (Some(args), Some(arg)) = (args, instance_arg(inst)) {
                    if !args.contains(&arg) {
                        args.push(arg);
                    }
                }
            }
        }
        ManagedObject::ServiceAccount(_) | ManagedObject::Role(_) | ManagedObject::ClusterRole(_) => {}
    }
}

fn set_worker_config_items(pod: &mut PodSpec, with_custom: bool) {
    let cm = pod
        .volumes
        .iter_mut()
        .flatten()
        .find_map(|v| v.config_map.as_mut());
    if let Some(cm) = cm {
        let mut items = vec![KeyToPath {
            key: WORKER_CONFIG_KEY.to_string(),
            path: WORKER_CONFIG_KEY.to_string(),
            mode: None,
        }];
        if with_custom {
            items.push(KeyToPath {
                key: CUSTOM_CONFIG_KEY.to_string(),
                path: CUSTOM_CONFIG_KEY.to_string(),
                mode: None,
            });
        }
        cm.items = Some(items);
    }
}

/// Fresh desired object for `kind`/`name`
pub fn render(
    registry: &ManifestRegistry,
    inst: &NodeFeatureDiscovery,
    kind: ManagedKind,
    name: &str,
    image: &str,
) -> Result<ManagedObject> {
    let mut obj = registry.get(kind, name)?;
    set_desired(&mut obj, inst, image);
    Ok(obj)
}

/// Recursively lay `desired` over `live`.
///
/// Objects merge key by key, arrays of the same length merge item by item,
/// anything else in `desired` replaces the live value. Fields only the
/// server sets survive.
pub fn merge_values(live: &mut Value, desired: &Value) {
    match (live, desired) {
        (Value::Object(l), Value::Object(d)) => {
            for (k, v) in d {
                match l.get_mut(k) {
                    Some(lv) => merge_values(lv, v),
                    None => {
                        l.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (Value::Array(l), Value::Array(d)) if l.len() == d.len() => {
            for (lv, dv) in l.iter_mut().zip(d) {
                merge_values(lv, dv);
            }
        }
        (l, d) => *l = d.clone(),
    }
}

/// The live object once the desired state is laid over it
pub fn desired_on_live(live: &ManagedObject, desired: &ManagedObject) -> Result<ManagedObject> {
    let mut value = live.to_value()?;
    let mut wanted = desired.to_value()?;
    if let ManagedObject::ConfigMap(_) = desired {
        // keys dropped from the spec must disappear
        if let (Some(obj), Some(data)) = (value.as_object_mut(), wanted.get("data")) {
            obj.insert("data".to_string(), data.clone());
        }
    }
    if let Some(meta) = wanted.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.remove("resourceVersion");
        meta.remove("uid");
    }
    merge_values(&mut value, &wanted);
    ManagedObject::from_value(live.kind(), value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{
        NodeFeatureDiscoverySpec,
        instance::{ConfigMapSpec, OperandSpec},
    };
    use serde_json::json;

    fn instance() -> NodeFeatureDiscovery {
        let mut inst = NodeFeatureDiscovery::new("nfd", NodeFeatureDiscoverySpec {
            worker_config: ConfigMapSpec {
                config_data: "core:\n  sleepInterval: 60s\n".to_string(),
            },
            ..Default::default()
        });
        inst.metadata.namespace = Some("openshift-nfd".to_string());
        inst
    }

    fn reg() -> ManifestRegistry {
        ManifestRegistry::load().unwrap()
    }

    #[test]
    fn test_namespace_and_subjects() {
        let inst = instance();
        let rb = render(&reg(), &inst, ManagedKind::ClusterRoleBinding, "nfd-master", "img").unwrap();
        let ManagedObject::ClusterRoleBinding(crb) = rb else {
            panic!("wrong variant")
        };
        assert_eq!(crb.metadata.namespace, None);
        let subjects = crb.subjects.unwrap();
        assert_eq!(subjects[0].namespace.as_deref(), Some("openshift-nfd"));
        let labels = crb.metadata.labels.unwrap();
        assert_eq!(labels.get(MANAGED_BY_LABEL).map(String::as_str), Some(MANAGED_BY));
        assert!(!labels.contains_key(INSTANCE_LABEL));
    }

    #[test]
    fn test_scc_users_follow_the_instance_namespace() {
        let obj = render(&reg(), &instance(), ManagedKind::SecurityContextConstraints, "nfd-worker", "img").unwrap();
        let ManagedObject::SecurityContextConstraints(scc) = obj else {
            panic!("wrong variant")
        };
        assert_eq!(scc.users, vec!["system:serviceaccount:openshift-nfd:nfd-worker".to_string()]);
        assert_eq!(scc_user("admin", "x"), "admin");
    }

    #[test]
    fn test_worker_daemonset() {
        let mut inst = instance();
        inst.spec.instance = Some("blue".to_string());
        inst.spec.custom_config = Some(ConfigMapSpec {
            config_data: "x: y".to_string(),
        });
        let obj = render(&reg(), &inst, ManagedKind::DaemonSet, "nfd-worker", "nfd:v1").unwrap();
        let ManagedObject::DaemonSet(ds) = obj else {
            panic!("wrong variant")
        };
        assert_eq!(ds.metadata.namespace.as_deref(), Some("openshift-nfd"));
        let pod = ds.spec.unwrap().template.spec.unwrap();
        let c = &pod.containers[0];
        assert_eq!(c.image.as_deref(), Some("nfd:v1"));
        assert_eq!(c.image_pull_policy.as_deref(), Some("Always"));
        let args = c.args.clone().unwrap();
        assert!(args.contains(&"-server=nfd-master:12000".to_string()));
        assert!(args.contains(&"-instance=blue".to_string()));
        let items = pod
            .volumes
            .unwrap()
            .into_iter()
            .find_map(|v| v.config_map)
            .unwrap()
            .items
            .unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_master_args_and_service_port() {
        let mut inst = instance();
        inst.spec.operand = OperandSpec {
            image: None,
            image_pull_policy: Some("IfNotPresent".to_string()),
            service_port: Some(9000),
        };
        inst.spec.extra_label_ns = Some(vec!["a.io".to_string(), "b.io".to_string()]);
        let obj = render(&reg(), &inst, ManagedKind::Deployment, "nfd-master", "img").unwrap();
        let ManagedObject::Deployment(dep) = obj else {
            panic!("wrong variant")
        };
        let c = dep.spec.unwrap().template.spec.unwrap().containers.remove(0);
        assert_eq!(c.args.unwrap(), vec!["-port=9000".to_string(), "-extra-label-ns=a.io,b.io".to_string()]);
        assert_eq!(c.ports.unwrap()[0].container_port, 9000);
        assert_eq!(c.image_pull_policy.as_deref(), Some("IfNotPresent"));

        let obj = render(&reg(), &inst, ManagedKind::Service, "nfd-master", "img").unwrap();
        let ManagedObject::Service(svc) = obj else {
            panic!("wrong variant")
        };
        let port = &svc.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.port, 9000);
        assert_eq!(port.target_port, Some(IntOrString::Int(9000)));
    }

    #[test]
    fn test_worker_config_map() {
        let obj = render(&reg(), &instance(), ManagedKind::ConfigMap, "nfd-worker", "img").unwrap();
        let ManagedObject::ConfigMap(cm) = obj else {
            panic!("wrong variant")
        };
        let data = cm.data.unwrap();
        assert_eq!(data.len(), 1);
        assert!(data[WORKER_CONFIG_KEY].contains("sleepInterval"));
    }

    #[test]
    fn test_prune_job_instance_arg_is_added_once() {
        let mut inst = instance();
        inst.spec.instance = Some("blue".to_string());
        let mut obj = render(&reg(), &inst, ManagedKind::Job, "nfd-prune", "img").unwrap();
        set_desired(&mut obj, &inst, "img");
        let ManagedObject::Job(job) = obj else {
            panic!("wrong variant")
        };
        let args = job.spec.unwrap().template.spec.unwrap().containers[0].args.clone().unwrap();
        assert_eq!(args, vec!["-prune".to_string(), "-instance=blue".to_string()]);
    }

    #[test]
    fn test_merge_keeps_server_fields() {
        let mut live = json!({"spec": {"clusterIP": "10.0.0.1", "ports": [{"port": 1, "protocol": "TCP"}]}});
        merge_values(&mut live, &json!({"spec": {"ports": [{"port": 2}]}}));
        assert_eq!(live, json!({"spec": {"clusterIP": "10.0.0.1", "ports": [{"port": 2, "protocol": "TCP"}]}}));
        let mut live = json!({"args": ["a", "b"]});
        merge_values(&mut live, &json!({"args": ["a"]}));
        assert_eq!(live, json!({"args": ["a"]}));
    }

    #[test]
    fn test_desired_on_live_drops_removed_config_keys() {
        let mut inst = instance();
        inst.spec.custom_config = Some(ConfigMapSpec {
            config_data: "x: y".to_string(),
        });
        let live = render(&reg(), &inst, ManagedKind::ConfigMap, "nfd-worker", "img").unwrap();
        inst.spec.custom_config = None;
        let desired = render(&reg(), &inst, ManagedKind::ConfigMap, "nfd-worker", "img").unwrap();
        let merged = desired_on_live(&live, &desired).unwrap();
        let ManagedObject::ConfigMap(cm) = merged else {
            panic!("wrong variant")
        };
        assert!(!cm.data.unwrap().contains_key(CUSTOM_CONFIG_KEY));
    }
}
