//! Prune job run on instance deletion to strip the labels nfd published on nodes.
//!
//! Never waits: every call inspects the job once and reports where it stands.
use crate::{
    convergence::{self, ManagedResource},
    handlers::ReconcileState,
};
use common::{Error, InstanceEvent, ManagedKind, ManagedObject, Result, conditions};
use tracing::{info, warn};

pub const PRUNE_JOB: ManagedResource = ManagedResource::new(ManagedKind::Job, "nfd-prune");

/// Created in this order, deleted in reverse
const PRUNE_RESOURCES: [ManagedResource; 4] = [
    ManagedResource::new(ManagedKind::ServiceAccount, "nfd-prune"),
    ManagedResource::new(ManagedKind::ClusterRole, "nfd-prune"),
    ManagedResource::new(ManagedKind::ClusterRoleBinding, "nfd-prune"),
    PRUNE_JOB,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PruneState {
    /// Nothing left to do, the finalizer may go
    Done,
    /// The job is running (or was just created), check again later
    InProgress,
}

pub async fn run(state: &ReconcileState) -> Result<PruneState> {
    let inst = &state.instance;
    if !inst.spec.pruner_on_delete {
        return Ok(PruneState::Done);
    }
    let key = PRUNE_JOB.key(inst);
    let job = match state.ctx.store.get(&key).await? {
        None => {
            for res in PRUNE_RESOURCES {
                convergence::apply(&state.ctx, inst, res, &state.image).await?;
            }
            info!("Started {key}");
            return Ok(PruneState::InProgress);
        }
        Some(ManagedObject::Job(job)) => job,
        Some(other) => {
            return Err(Error::UnexpectedKind {
                expected: ManagedKind::Job,
                found: other.kind(),
            });
        }
    };
    let status = job.status.unwrap_or_default();
    if status.succeeded.unwrap_or(0) >= 1 {
        info!("{key} succeeded, cleaning up");
        for res in PRUNE_RESOURCES.iter().rev() {
            convergence::delete_with_retry(&state.ctx, &res.key(inst)).await?;
        }
        return Ok(PruneState::Done);
    }
    let failed = status.failed.unwrap_or(0);
    if failed >= 1 {
        warn!("{key} failed, keeping the finalizer");
        let err = Error::PruneJobFailed {
            namespace: key.namespace.clone().unwrap_or_default(),
            name: key.name.clone(),
            failed,
        };
        // the event goes out once, later retries find the failure already reported
        if conditions::degraded_reason(inst.conditions()) != Some(err.reason()) {
            let event = InstanceEvent::warning(
                err.reason(),
                "Pruning node labels",
                &format!("{key} has {failed} failed pods"),
            );
            if let Err(e) = state.ctx.store.publish_event(inst, event).await {
                warn!("Failed to publish event for {key}: {e}");
            }
        }
        return Err(err);
    }
    Ok(PruneState::InProgress)
}
