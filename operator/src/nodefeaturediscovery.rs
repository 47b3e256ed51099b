use crate::{
    finalize,
    handlers::{Handler, ReconcileState},
    manager::Context,
    status,
};
use chrono::Utc;
use common::{Error, NodeFeatureDiscovery, Result};
use kube::{ResourceExt, runtime::controller::Action};
use std::{sync::Arc, time::Duration};
use tracing::{Span, debug, field, info, instrument, warn};

#[instrument(skip(ctx, inst), fields(namespace, name))]
pub async fn reconcile(inst: Arc<NodeFeatureDiscovery>, ctx: Arc<Context>) -> Result<Action> {
    let ns = inst.namespace().unwrap_or_default(); // inst is namespace scoped
    let name = inst.name_any();
    Span::current().record("namespace", field::display(&ns));
    Span::current().record("name", field::display(&name));
    let _mes = ctx.metrics.reconcile.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let res = reconcile_instance(&ctx, &ns, &name).await;
    if res.is_ok() {
        ctx.reset_retry(&format!("{ns}/{name}"));
    }
    res
}

/// One reconcile pass over the instance `namespace/name`, read fresh from the store
pub async fn reconcile_instance(ctx: &Arc<Context>, namespace: &str, name: &str) -> Result<Action> {
    let Some(inst) = ctx.store.get_instance(namespace, name).await? else {
        info!("NodeFeatureDiscovery {namespace}/{name} is gone");
        ctx.reset_retry(&format!("{namespace}/{name}"));
        return Ok(Action::await_change());
    };
    let state = ReconcileState::new(ctx.clone(), inst);

    if state.instance.is_deleting() {
        if !state.instance.has_finalizer() {
            return Ok(Action::await_change());
        }
        return match finalize::finalize(&state).await {
            Err(e) => {
                warn!("Finalization failed: {e}");
                status::report_error(&state, e.reason(), &e).await;
                Err(e)
            }
            done => done,
        };
    }

    if !state.instance.has_finalizer() {
        let mut updated = state.instance.clone();
        updated.add_finalizer();
        ctx.store.update_instance(&updated).await?;
        debug!("Finalizer added");
        return Ok(Action::requeue(Duration::ZERO));
    }

    for handler in Handler::CHAIN {
        if !handler.enabled(&state) {
            continue;
        }
        if let Err(e) = handler.run(&state).await {
            warn!("{} handler failed: {e}", handler.name());
            status::report_failure(&state, handler, &e).await;
            return Err(e);
        }
    }
    Ok(Action::requeue(ctx.config.resync))
}

#[must_use]
pub fn error_policy(inst: Arc<NodeFeatureDiscovery>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = format!("{}/{}", inst.namespace().unwrap_or_default(), inst.name_any());
    warn!("reconcile failed for '{key}': {error}");
    ctx.metrics.reconcile.reconcile_failure(&inst, error);
    Action::requeue(ctx.retry_delay(&key, error))
}
