//! Teardown of everything an instance deployed, before its finalizer is released.
use crate::{
    convergence,
    handlers::ReconcileState,
    prune::{self, PruneState},
};
use common::{ManagedKind, NodeFeatureDiscovery, ObjectKey, Result};
use kube::{ResourceExt, runtime::controller::Action};
use tracing::{info, warn};

use ManagedKind::*;

/// True when an instance living in another namespace is not being deleted.
/// Cluster wide objects are then still in use and must survive.
pub async fn other_instance_active(state: &ReconcileState) -> Result<bool> {
    let namespace = state.instance.namespace();
    Ok(state
        .ctx
        .store
        .list_instances()
        .await?
        .iter()
        .any(|other| other.namespace() != namespace && !other.is_deleting()))
}

/// Objects to delete, in order.
/// Topology objects are listed even when the updater is disabled, it may have run before.
#[must_use]
pub fn deletion_plan(inst: &NodeFeatureDiscovery, shared: bool, manage_scc: bool) -> Vec<ObjectKey> {
    let ns = inst.namespace().unwrap_or_default();
    let key = |kind, name| ObjectKey::for_instance(kind, &ns, name);
    let mut plan = vec![key(DaemonSet, "nfd-topology-updater")];
    if !shared {
        plan.push(key(ClusterRoleBinding, "nfd-topology-updater"));
        plan.push(key(ClusterRole, "nfd-topology-updater"));
    }
    plan.push(key(ServiceAccount, "nfd-topology-updater"));
    if !shared && manage_scc {
        plan.push(key(SecurityContextConstraints, "nfd-topology-updater"));
    }
    plan.push(key(DaemonSet, "nfd-worker"));
    plan.push(key(Deployment, "nfd-master"));
    plan.push(key(Service, "nfd-master"));
    plan.push(key(Deployment, "nfd-gc"));
    plan.push(key(Role, "nfd-worker"));
    if !shared {
        plan.push(key(ClusterRole, "nfd-master"));
        plan.push(key(ClusterRole, "nfd-gc"));
        plan.push(key(ClusterRoleBinding, "nfd-master"));
        plan.push(key(ClusterRoleBinding, "nfd-gc"));
        if manage_scc {
            plan.push(key(SecurityContextConstraints, "nfd-worker"));
        }
    }
    plan.push(key(RoleBinding, "nfd-worker"));
    plan.push(key(RoleBinding, "nfd-master"));
    plan.push(key(ServiceAccount, "nfd-worker"));
    plan.push(key(ServiceAccount, "nfd-master"));
    plan.push(key(ServiceAccount, "nfd-gc"));
    plan.push(key(ConfigMap, "nfd-worker"));
    plan
}

/// Run the teardown, then release the finalizer once nothing is left
pub async fn finalize(state: &ReconcileState) -> Result<Action> {
    let ctx = &state.ctx;
    let inst = &state.instance;
    let shared = other_instance_active(state).await?;
    if shared {
        info!("Another instance is active, keeping the cluster wide objects");
    }
    let plan = deletion_plan(inst, shared, ctx.config.manage_security_policies);
    for key in &plan {
        convergence::delete_with_retry(ctx, key).await?;
    }

    let mut remaining = Vec::new();
    for key in &plan {
        if convergence::exists(ctx, key).await? {
            remaining.push(key.to_string());
        }
    }
    if !remaining.is_empty() {
        info!("Waiting for {} to disappear", remaining.join(", "));
        return Ok(Action::requeue(ctx.config.finalize_requeue));
    }

    if prune::run(state).await? == PruneState::InProgress {
        return Ok(Action::requeue(ctx.config.prune_requeue));
    }

    let mut updated = inst.clone();
    if updated.remove_finalizer() {
        match ctx.store.update_instance(&updated).await {
            Ok(_) => info!("Finalizer removed"),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!("Unable to remove the finalizer: {e}");
                return Ok(Action::requeue(ctx.config.finalize_requeue));
            }
        }
    }
    ctx.reset_retry(&format!("{}/{}", inst.namespace().unwrap_or_default(), inst.name_any()));
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(ns: &str) -> NodeFeatureDiscovery {
        let mut inst = NodeFeatureDiscovery::new("nfd", common::NodeFeatureDiscoverySpec::default());
        inst.metadata.namespace = Some(ns.to_string());
        inst
    }

    fn names(plan: &[ObjectKey]) -> Vec<String> {
        plan.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_plan_order() {
        let plan = deletion_plan(&instance("ns1"), false, true);
        assert_eq!(names(&plan), vec![
            "DaemonSet ns1/nfd-topology-updater",
            "ClusterRoleBinding nfd-topology-updater",
            "ClusterRole nfd-topology-updater",
            "ServiceAccount ns1/nfd-topology-updater",
            "SecurityContextConstraints nfd-topology-updater",
            "DaemonSet ns1/nfd-worker",
            "Deployment ns1/nfd-master",
            "Service ns1/nfd-master",
            "Deployment ns1/nfd-gc",
            "Role ns1/nfd-worker",
            "ClusterRole nfd-master",
            "ClusterRole nfd-gc",
            "ClusterRoleBinding nfd-master",
            "ClusterRoleBinding nfd-gc",
            "SecurityContextConstraints nfd-worker",
            "RoleBinding ns1/nfd-worker",
            "RoleBinding ns1/nfd-master",
            "ServiceAccount ns1/nfd-worker",
            "ServiceAccount ns1/nfd-master",
            "ServiceAccount ns1/nfd-gc",
            "ConfigMap ns1/nfd-worker",
        ]);
    }

    #[test]
    fn test_shared_plan_keeps_cluster_objects() {
        let plan = deletion_plan(&instance("ns1"), true, true);
        assert!(plan.iter().all(|k| k.namespace.is_some()));
        assert_eq!(names(&plan[..3]), vec![
            "DaemonSet ns1/nfd-topology-updater",
            "ServiceAccount ns1/nfd-topology-updater",
            "DaemonSet ns1/nfd-worker",
        ]);
    }

    #[test]
    fn test_plan_without_scc() {
        let plan = deletion_plan(&instance("ns1"), false, false);
        assert!(plan.iter().all(|k| k.kind != SecurityContextConstraints));
        assert_eq!(plan.len(), 19);
    }
}
