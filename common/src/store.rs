//! Access to the cluster objects the operator reads and writes.
//!
//! `ObjectStore` is the narrow CRUD surface the reconciler needs. `KubeStore`
//! talks to the API server, `memstore::MemoryStore` keeps everything in memory.
use crate::{
    Error, ManagedObject, NodeFeatureDiscovery, ObjectKey, Result,
    context::{get_client_name, get_reporter},
};
use async_trait::async_trait;
use kube::{
    Client, Resource, ResourceExt,
    api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    runtime::events::{Event, EventType, Recorder},
};
use serde_json::json;

/// Kubernetes event attached to an instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceEvent {
    pub warning: bool,
    pub reason: String,
    pub action: String,
    pub note: String,
}

impl InstanceEvent {
    #[must_use]
    pub fn normal(reason: &str, action: &str, note: &str) -> Self {
        InstanceEvent {
            warning: false,
            reason: reason.to_string(),
            action: action.to_string(),
            note: note.to_string(),
        }
    }

    #[must_use]
    pub fn warning(reason: &str, action: &str, note: &str) -> Self {
        InstanceEvent {
            warning: true,
            ..Self::normal(reason, action, note)
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a managed object, `None` when it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>>;
    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject>;
    /// Replace an object; a stale resourceVersion is rejected with a conflict
    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject>;
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    async fn get_instance(&self, namespace: &str, name: &str) -> Result<Option<NodeFeatureDiscovery>>;
    /// Every instance of the cluster, whatever namespace is watched
    async fn list_instances(&self) -> Result<Vec<NodeFeatureDiscovery>>;
    /// Replace the instance metadata and spec (finalizers)
    async fn update_instance(&self, inst: &NodeFeatureDiscovery) -> Result<NodeFeatureDiscovery>;
    /// Write the instance status subresource
    async fn update_instance_status(&self, inst: &NodeFeatureDiscovery) -> Result<NodeFeatureDiscovery>;

    async fn publish_event(&self, inst: &NodeFeatureDiscovery, event: InstanceEvent) -> Result<()>;
}

/// `ObjectStore` backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, key: &ObjectKey) -> Api<DynamicObject> {
        let ar = key.kind.api_resource();
        match &key.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn instances(&self, namespace: &str) -> Api<NodeFeatureDiscovery> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(get_client_name()),
        }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>> {
        match self.api(key).get_opt(&key.name).await {
            Ok(Some(obj)) => Ok(Some(ManagedObject::from_dynamic(key.kind, obj)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(Error::object("get", key, e)),
        }
    }

    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject> {
        let key = obj.key();
        let created = self
            .api(&key)
            .create(&Self::post_params(), &obj.to_dynamic()?)
            .await
            .map_err(|e| Error::object("create", &key, e))?;
        ManagedObject::from_dynamic(key.kind, created)
    }

    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject> {
        let key = obj.key();
        let updated = self
            .api(&key)
            .replace(&key.name, &Self::post_params(), &obj.to_dynamic()?)
            .await
            .map_err(|e| Error::object("update", &key, e))?;
        ManagedObject::from_dynamic(key.kind, updated)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.api(key)
            .delete(&key.name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| Error::object("delete", key, e))
    }

    async fn get_instance(&self, namespace: &str, name: &str) -> Result<Option<NodeFeatureDiscovery>> {
        self.instances(namespace).get_opt(name).await.map_err(Error::KubeError)
    }

    async fn list_instances(&self) -> Result<Vec<NodeFeatureDiscovery>> {
        let api: Api<NodeFeatureDiscovery> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await.map_err(Error::KubeError)?.items)
    }

    async fn update_instance(&self, inst: &NodeFeatureDiscovery) -> Result<NodeFeatureDiscovery> {
        let ns = inst.namespace().ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        self.instances(&ns)
            .replace(&inst.name_any(), &Self::post_params(), inst)
            .await
            .map_err(Error::KubeError)
    }

    async fn update_instance_status(&self, inst: &NodeFeatureDiscovery) -> Result<NodeFeatureDiscovery> {
        let ns = inst.namespace().ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        // resourceVersion turns the merge patch into a conditional write
        let patch = Patch::Merge(json!({
            "apiVersion": NodeFeatureDiscovery::api_version(&()),
            "kind": NodeFeatureDiscovery::kind(&()),
            "metadata": { "resourceVersion": inst.resource_version() },
            "status": inst.status,
        }));
        self.instances(&ns)
            .patch_status(&inst.name_any(), &PatchParams::default(), &patch)
            .await
            .map_err(Error::KubeError)
    }

    async fn publish_event(&self, inst: &NodeFeatureDiscovery, event: InstanceEvent) -> Result<()> {
        let recorder = Recorder::new(self.client.clone(), get_reporter(), inst.object_ref(&()));
        let ev = Event {
            type_: if event.warning {
                EventType::Warning
            } else {
                EventType::Normal
            },
            reason: event.reason,
            note: Some(event.note),
            action: event.action,
            secondary: None,
        };
        match recorder.publish(ev).await {
            Ok(()) => Ok(()),
            Err(kube::Error::Api(src)) => {
                tracing::warn!("Ignoring {:?} while sending an event", src);
                Ok(())
            }
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}
