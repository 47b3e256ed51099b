//! The ordered handler chain run on every reconcile of a live instance.
use crate::{
    convergence::{self, ManagedResource},
    manager::Context,
    status,
};
use common::{ManagedKind, NodeFeatureDiscovery, Result};
use std::sync::Arc;
use tracing::debug;

use ManagedKind::*;

const SECURITY_POLICY: &[ManagedResource] = &[ManagedResource::new(SecurityContextConstraints, "nfd-worker")];

const MASTER: &[ManagedResource] = &[
    ManagedResource::new(ServiceAccount, "nfd-master"),
    ManagedResource::new(ClusterRole, "nfd-master"),
    ManagedResource::new(ClusterRoleBinding, "nfd-master"),
    ManagedResource::new(RoleBinding, "nfd-master"),
    ManagedResource::new(Deployment, "nfd-master"),
    ManagedResource::new(Service, "nfd-master"),
];

const WORKER: &[ManagedResource] = &[
    ManagedResource::new(ServiceAccount, "nfd-worker"),
    ManagedResource::new(Role, "nfd-worker"),
    ManagedResource::new(RoleBinding, "nfd-worker"),
    ManagedResource::new(ConfigMap, "nfd-worker"),
    ManagedResource::new(DaemonSet, "nfd-worker"),
];

const TOPOLOGY_UPDATER: &[ManagedResource] = &[
    ManagedResource::new(ServiceAccount, "nfd-topology-updater"),
    ManagedResource::new(ClusterRole, "nfd-topology-updater"),
    ManagedResource::new(ClusterRoleBinding, "nfd-topology-updater"),
    ManagedResource::new(SecurityContextConstraints, "nfd-topology-updater"),
    ManagedResource::new(DaemonSet, "nfd-topology-updater"),
];

const GARBAGE_COLLECTOR: &[ManagedResource] = &[
    ManagedResource::new(ServiceAccount, "nfd-gc"),
    ManagedResource::new(ClusterRole, "nfd-gc"),
    ManagedResource::new(ClusterRoleBinding, "nfd-gc"),
    ManagedResource::new(Deployment, "nfd-gc"),
];

/// Everything one reconcile pass works on. Built fresh for every call.
pub struct ReconcileState {
    pub ctx: Arc<Context>,
    pub instance: NodeFeatureDiscovery,
    /// Operand image resolved from the instance and the operator default
    pub image: String,
}

impl ReconcileState {
    #[must_use]
    pub fn new(ctx: Arc<Context>, instance: NodeFeatureDiscovery) -> Self {
        let image = instance.operand_image(&ctx.config.default_image);
        Self { ctx, instance, image }
    }

    /// SecurityContextConstraints only exist on OpenShift
    #[must_use]
    pub fn manages(&self, kind: ManagedKind) -> bool {
        kind != SecurityContextConstraints || self.ctx.config.manage_security_policies
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handler {
    SecurityPolicy,
    Master,
    Worker,
    TopologyUpdater,
    GarbageCollector,
    Status,
}

impl Handler {
    pub const CHAIN: [Handler; 6] = [
        Handler::SecurityPolicy,
        Handler::Master,
        Handler::Worker,
        Handler::TopologyUpdater,
        Handler::GarbageCollector,
        Handler::Status,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Handler::SecurityPolicy => "SecurityPolicy",
            Handler::Master => "Master",
            Handler::Worker => "Worker",
            Handler::TopologyUpdater => "TopologyUpdater",
            Handler::GarbageCollector => "GarbageCollector",
            Handler::Status => "Status",
        }
    }

    #[must_use]
    pub fn enabled(self, state: &ReconcileState) -> bool {
        match self {
            Handler::SecurityPolicy => state.ctx.config.manage_security_policies,
            Handler::TopologyUpdater => state.instance.spec.topology_updater,
            _ => true,
        }
    }

    #[must_use]
    pub fn resources(self) -> &'static [ManagedResource] {
        match self {
            Handler::SecurityPolicy => SECURITY_POLICY,
            Handler::Master => MASTER,
            Handler::Worker => WORKER,
            Handler::TopologyUpdater => TOPOLOGY_UPDATER,
            Handler::GarbageCollector => GARBAGE_COLLECTOR,
            Handler::Status => &[],
        }
    }

    /// Resources of this handler that apply to the current cluster
    pub fn managed(self, state: &ReconcileState) -> impl Iterator<Item = ManagedResource> + '_ {
        self.resources().iter().copied().filter(|r| state.manages(r.kind))
    }

    pub async fn run(self, state: &ReconcileState) -> Result<()> {
        debug!("Running {} handler", self.name());
        if self == Handler::Status {
            status::update_status(state).await?;
            return Ok(());
        }
        for res in self.managed(state) {
            convergence::apply(&state.ctx, &state.instance, res, &state.image).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{NodeFeatureDiscoverySpec, OperatorConfig, memstore::MemoryStore};

    fn state(topology: bool, scc: bool) -> ReconcileState {
        let config = OperatorConfig {
            manage_security_policies: scc,
            ..Default::default()
        };
        let ctx = Context::new(Arc::new(MemoryStore::new()), config).unwrap();
        let inst = NodeFeatureDiscovery::new("nfd", NodeFeatureDiscoverySpec {
            topology_updater: topology,
            ..Default::default()
        });
        ReconcileState::new(Arc::new(ctx), inst)
    }

    #[test]
    fn test_chain_order() {
        let names: Vec<_> = Handler::CHAIN.iter().map(|h| h.name()).collect();
        assert_eq!(names, vec![
            "SecurityPolicy",
            "Master",
            "Worker",
            "TopologyUpdater",
            "GarbageCollector",
            "Status"
        ]);
    }

    #[test]
    fn test_enabled_handlers() {
        let s = state(false, true);
        assert!(!Handler::TopologyUpdater.enabled(&s));
        assert!(Handler::SecurityPolicy.enabled(&s));
        let s = state(true, false);
        assert!(Handler::TopologyUpdater.enabled(&s));
        assert!(!Handler::SecurityPolicy.enabled(&s));
        assert!(
            Handler::TopologyUpdater
                .managed(&s)
                .all(|r| r.kind != SecurityContextConstraints)
        );
    }

    #[test]
    fn test_default_image() {
        let s = state(false, true);
        assert_eq!(s.image, common::context::DEFAULT_OPERAND_IMAGE);
    }

    #[test]
    fn test_every_resource_has_a_template() {
        let s = state(true, true);
        for h in Handler::CHAIN {
            for r in h.resources() {
                assert!(s.ctx.manifests.get(r.kind, r.name).is_ok(), "{:?} {}", r.kind, r.name);
            }
        }
    }
}
