use crate::handlers::{Handler, ReconcileState};
use common::{
    Error, NodeFeatureDiscovery, NodeFeatureDiscoveryStatus, ObjectStore, Result,
    conditions::{self, InstanceCondition},
};
use tracing::{debug, info, warn};

/// Classify every resource of the enabled handlers and publish the aggregate
pub async fn update_status(state: &ReconcileState) -> Result<bool> {
    let mut results = Vec::new();
    for handler in Handler::CHAIN.into_iter().filter(|h| h.enabled(state)) {
        for res in handler.managed(state) {
            let key = res.key(&state.instance);
            let obj = state.ctx.store.get(&key).await?;
            results.push((key.clone(), conditions::classify(&key, obj.as_ref())?));
        }
    }
    let conditions = conditions::aggregate(&results);
    write_conditions(state.ctx.store.as_ref(), &state.instance, conditions).await
}

/// Persist `conditions` unless they match what the instance already reports.
/// Returns whether a write happened.
pub async fn write_conditions(
    store: &dyn ObjectStore,
    inst: &NodeFeatureDiscovery,
    conditions: Vec<InstanceCondition>,
) -> Result<bool> {
    let current = inst.conditions();
    let generation = inst.metadata.generation;
    let observed = inst.status.as_ref().and_then(|s| s.observed_generation);
    if !conditions::conditions_changed(current, &conditions) && observed == generation {
        debug!("Conditions unchanged");
        return Ok(false);
    }
    let mut updated = inst.clone();
    updated.status = Some(NodeFeatureDiscoveryStatus {
        conditions: conditions::carry_transition_times(current, conditions),
        observed_generation: generation,
    });
    store.update_instance_status(&updated).await?;
    if let Some(active) = updated.conditions().iter().find(|c| c.is_true()) {
        info!("Instance is now {:?}", active.condition_type);
    }
    Ok(true)
}

/// Report a failed handler as Degraded, best effort
pub async fn report_failure(state: &ReconcileState, handler: Handler, err: &Error) {
    report_error(state, &format!("{}Failed", handler.name()), err).await;
}

/// Write Degraded with `reason` and the error text. Conflicts are left to the next run.
pub async fn report_error(state: &ReconcileState, reason: &str, err: &Error) {
    if err.is_conflict() {
        return;
    }
    let conditions = conditions::degraded(reason, &err.to_string());
    if let Err(e) = write_conditions(state.ctx.store.as_ref(), &state.instance, conditions).await {
        warn!("Unable to report {reason}: {e}");
    }
}
