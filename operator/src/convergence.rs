//! Create-or-update and delete primitives shared by every handler.
use crate::{desired, manager::Context};
use common::{Error, InstanceEvent, ManagedKind, ManagedObject, NodeFeatureDiscovery, ObjectKey, Result};
use kube::{Resource, ResourceExt};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// A template object, identified by kind and name
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ManagedResource {
    pub kind: ManagedKind,
    pub name: &'static str,
}

impl ManagedResource {
    #[must_use]
    pub const fn new(kind: ManagedKind, name: &'static str) -> Self {
        Self { kind, name }
    }

    #[must_use]
    pub fn key(&self, inst: &NodeFeatureDiscovery) -> ObjectKey {
        ObjectKey::for_instance(self.kind, &inst.namespace().unwrap_or_default(), self.name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Unchanged,
}

/// Make the instance the controller of a namespaced object.
/// Cluster scoped objects cannot be owned by a namespaced instance and are left alone.
pub fn set_owner_reference(obj: &mut ManagedObject, inst: &NodeFeatureDiscovery) -> Result<()> {
    if obj.kind().is_cluster_scoped() {
        return Ok(());
    }
    let owner = inst.controller_owner_ref(&()).ok_or_else(|| Error::OwnerReference {
        key: obj.key(),
        reason: "the instance has no uid".to_string(),
    })?;
    let key = obj.key();
    let refs = obj.meta_mut().owner_references.get_or_insert_with(Vec::new);
    if let Some(other) = refs
        .iter()
        .find(|r| r.controller == Some(true) && r.uid != owner.uid)
    {
        return Err(Error::OwnerReference {
            key,
            reason: format!("already controlled by {} {}", other.kind, other.name),
        });
    }
    match refs.iter_mut().find(|r| r.uid == owner.uid) {
        Some(r) => *r = owner,
        None => refs.push(owner),
    }
    Ok(())
}

/// Fields the API server allocates that a replace must carry over
fn preserve_server_fields(obj: &mut ManagedObject, live: &ManagedObject) {
    obj.meta_mut().resource_version = live.meta().resource_version.clone();
    if let (ManagedObject::Service(svc), ManagedObject::Service(current)) = (obj, live) {
        if let (Some(spec), Some(cur)) = (svc.spec.as_mut(), current.spec.as_ref()) {
            spec.cluster_ip = cur.cluster_ip.clone();
            spec.cluster_ips = cur.cluster_ips.clone();
        }
    }
}

async fn notify(ctx: &Context, inst: &NodeFeatureDiscovery, action: &str, key: &ObjectKey) {
    let event = InstanceEvent::normal(
        &format!("Reconciling `{}`", inst.name_any()),
        &format!("{action} `{}` {}", key.name, key.kind),
        &format!("{action} {key}"),
    );
    if let Err(e) = ctx.store.publish_event(inst, event).await {
        warn!("Failed to publish event for {key}: {e}");
    }
}

/// Converge one resource to its desired state, writing only when something changed
pub async fn apply(
    ctx: &Context,
    inst: &NodeFeatureDiscovery,
    res: ManagedResource,
    image: &str,
) -> Result<Applied> {
    let key = res.key(inst);
    debug!("Applying {key}");
    let desired = desired::render(&ctx.manifests, inst, res.kind, res.name, image)?;
    match ctx.store.get(&key).await? {
        None => {
            let mut obj = desired;
            set_owner_reference(&mut obj, inst)?;
            ctx.store.create(&obj).await?;
            info!("Created {key}");
            notify(ctx, inst, "Creating", &key).await;
            Ok(Applied::Created)
        }
        Some(live) => {
            let mut obj = desired::desired_on_live(&live, &desired)?;
            set_owner_reference(&mut obj, inst)?;
            preserve_server_fields(&mut obj, &live);
            if obj.to_value()? == live.to_value()? {
                debug!("{key} is up to date");
                return Ok(Applied::Unchanged);
            }
            ctx.store.update(&obj).await?;
            info!("Updated {key}");
            notify(ctx, inst, "Updating", &key).await;
            Ok(Applied::Updated)
        }
    }
}

pub async fn exists(ctx: &Context, key: &ObjectKey) -> Result<bool> {
    Ok(ctx.store.get(key).await?.is_some())
}

/// Delete an object; an object that is already gone is not an error
pub async fn delete(ctx: &Context, key: &ObjectKey) -> Result<()> {
    debug!("Deleting {key}");
    if !exists(ctx, key).await? {
        return Ok(());
    }
    match ctx.store.delete(key).await {
        Ok(()) => {
            info!("Deleted {key}");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Delete and wait until the object is gone, within the configured retry policy
pub async fn delete_with_retry(ctx: &Context, key: &ObjectKey) -> Result<()> {
    let policy = &ctx.config.delete_retry;
    let attempt = async {
        loop {
            delete(ctx, key).await?;
            if !exists(ctx, key).await? {
                return Ok(());
            }
            debug!("{key} still present, retrying in {:?}", policy.interval);
            sleep(policy.interval).await;
        }
    };
    match timeout(policy.timeout, attempt).await {
        Ok(res) => res,
        Err(_) => Err(Error::DeleteTimeout {
            key: key.clone(),
            timeout: policy.timeout,
        }),
    }
}
