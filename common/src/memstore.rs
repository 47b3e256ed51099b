//! In-memory `ObjectStore` used by tests.
//!
//! Mimics the API server rules the reconciler relies on: create on an
//! existing name and writes with a stale resourceVersion are conflicts,
//! missing objects are not found, and an instance marked for deletion
//! disappears (with its owned objects) once its finalizers are gone.
use crate::{
    InstanceEvent, ManagedObject, NodeFeatureDiscovery, ObjectKey, ObjectStore, Result,
    objects::ManagedKind,
};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::{
    api::{
        apps::v1::{DaemonSetStatus, DeploymentCondition, DeploymentStatus},
        batch::v1::JobStatus,
    },
    apimachinery::pkg::apis::meta::v1::Time,
};
use kube::{ResourceExt, core::ErrorResponse};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Delete,
    Status,
    Event,
}

/// One store call, in the order the store received them
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Object(Verb, ObjectKey),
    /// Instance calls, identified as `namespace/name`
    Instance(Verb, String),
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, ManagedObject>,
    instances: BTreeMap<(String, String), NodeFeatureDiscovery>,
    calls: Vec<Call>,
    events: Vec<InstanceEvent>,
    failures: BTreeMap<(Verb, ObjectKey), u16>,
    sticky: BTreeSet<ObjectKey>,
    version: u64,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn injected(&self, verb: Verb, key: &ObjectKey) -> Result<()> {
        match self.failures.get(&(verb, key.clone())) {
            Some(code) => Err(crate::Error::object(verb_name(verb), key, api_error(*code, "Injected"))),
            None => Ok(()),
        }
    }

    /// Drop the instance once it is deleting without finalizers, with everything it owns
    fn collect_instance(&mut self, ns: &str, name: &str) {
        let id = (ns.to_string(), name.to_string());
        let done = self
            .instances
            .get(&id)
            .is_some_and(|i| i.is_deleting() && i.finalizers().is_empty());
        if !done {
            return;
        }
        if let Some(inst) = self.instances.remove(&id) {
            let uid = inst.uid();
            self.objects.retain(|_, obj| {
                !obj.meta()
                    .owner_references
                    .as_ref()
                    .is_some_and(|refs| refs.iter().any(|r| Some(&r.uid) == uid.as_ref()))
            });
        }
    }
}

fn verb_name(verb: Verb) -> &'static str {
    match verb {
        Verb::Get => "get",
        Verb::List => "list",
        Verb::Create => "create",
        Verb::Update => "update",
        Verb::Delete => "delete",
        Verb::Status => "status",
        Verb::Event => "event",
    }
}

fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} ({code})"),
        reason: reason.to_string(),
        code,
    })
}

fn instance_id(inst: &NodeFeatureDiscovery) -> (String, String) {
    (inst.namespace().unwrap_or_default(), inst.name_any())
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an object as-is, as if someone else created it
    pub fn insert(&self, obj: ManagedObject) -> ManagedObject {
        let mut inner = self.lock();
        let mut obj = obj;
        let version = inner.next_version();
        let meta = obj.meta_mut();
        meta.resource_version = Some(version.clone());
        meta.uid.get_or_insert_with(|| format!("uid-{version}"));
        inner.objects.insert(obj.key(), obj.clone());
        obj
    }

    pub fn insert_instance(&self, inst: NodeFeatureDiscovery) -> NodeFeatureDiscovery {
        let mut inner = self.lock();
        let mut inst = inst;
        let version = inner.next_version();
        inst.metadata.resource_version = Some(version.clone());
        inst.metadata.uid.get_or_insert_with(|| format!("uid-{version}"));
        inst.metadata.generation.get_or_insert(1);
        inner.instances.insert(instance_id(&inst), inst.clone());
        inst
    }

    /// Set the deletion timestamp, like a `kubectl delete` would
    pub fn mark_deleting(&self, namespace: &str, name: &str) {
        let mut inner = self.lock();
        let version = inner.next_version();
        if let Some(inst) = inner.instances.get_mut(&(namespace.to_string(), name.to_string())) {
            inst.metadata.deletion_timestamp.get_or_insert(Time(Utc::now()));
            inst.metadata.resource_version = Some(version);
        }
        inner.collect_instance(namespace, name);
    }

    /// Bump the generation, like a spec edit would
    pub fn edit_instance(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut NodeFeatureDiscovery)) {
        let mut inner = self.lock();
        let version = inner.next_version();
        if let Some(inst) = inner.instances.get_mut(&(namespace.to_string(), name.to_string())) {
            edit(inst);
            inst.metadata.generation = Some(inst.metadata.generation.unwrap_or(0) + 1);
            inst.metadata.resource_version = Some(version);
        }
    }

    /// Make every `verb` call on `key` fail with the given HTTP code
    pub fn fail_on(&self, verb: Verb, key: &ObjectKey, code: u16) {
        self.lock().failures.insert((verb, key.clone()), code);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Accept deletes of `key` without ever removing it
    pub fn keep_on_delete(&self, key: &ObjectKey) {
        self.lock().sticky.insert(key.clone());
    }

    /// Change an object in place without touching its resourceVersion
    pub fn modify(&self, key: &ObjectKey, change: impl FnOnce(&mut ManagedObject)) {
        if let Some(obj) = self.lock().objects.get_mut(key) {
            change(obj);
        }
    }

    pub fn set_job_status(&self, key: &ObjectKey, succeeded: i32, failed: i32) {
        self.modify(key, |obj| {
            if let ManagedObject::Job(job) = obj {
                job.status = Some(JobStatus {
                    succeeded: Some(succeeded),
                    failed: Some(failed),
                    ..Default::default()
                });
            }
        });
    }

    /// Report every DaemonSet and Deployment of a namespace as fully rolled out
    pub fn mark_workloads_ready(&self, namespace: &str) {
        let mut inner = self.lock();
        for (key, obj) in inner.objects.iter_mut() {
            if key.namespace.as_deref() != Some(namespace) {
                continue;
            }
            match obj {
                ManagedObject::DaemonSet(ds) => {
                    ds.status = Some(DaemonSetStatus {
                        desired_number_scheduled: 2,
                        current_number_scheduled: 2,
                        number_ready: 2,
                        number_available: Some(2),
                        number_unavailable: Some(0),
                        updated_number_scheduled: Some(2),
                        ..Default::default()
                    });
                }
                ManagedObject::Deployment(dep) => {
                    let cond = |t: &str| DeploymentCondition {
                        type_: t.to_string(),
                        status: "True".to_string(),
                        ..Default::default()
                    };
                    dep.status = Some(DeploymentStatus {
                        conditions: Some(vec![cond("Available"), cond("Progressing")]),
                        ..Default::default()
                    });
                }
                _ => {}
            }
        }
    }

    #[must_use]
    pub fn object(&self, key: &ObjectKey) -> Option<ManagedObject> {
        self.lock().objects.get(key).cloned()
    }

    #[must_use]
    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.lock().objects.contains_key(key)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.lock().objects.keys().cloned().collect()
    }

    #[must_use]
    pub fn keys_of(&self, kind: ManagedKind) -> Vec<ObjectKey> {
        self.lock().objects.keys().filter(|k| k.kind == kind).cloned().collect()
    }

    #[must_use]
    pub fn instance(&self, namespace: &str, name: &str) -> Option<NodeFeatureDiscovery> {
        self.lock()
            .instances
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Keys targeted by object calls of `verb`, in call order
    #[must_use]
    pub fn object_calls(&self, verb: Verb) -> Vec<ObjectKey> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Object(v, key) if *v == verb => Some(key.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn instance_calls(&self, verb: Verb) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Instance(v, _) if *v == verb))
            .count()
    }

    /// Number of mutating calls (objects, instance metadata and status)
    #[must_use]
    pub fn writes(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    Call::Object(Verb::Create | Verb::Update | Verb::Delete, _)
                        | Call::Instance(Verb::Update | Verb::Status, _)
                )
            })
            .count()
    }

    pub fn clear_calls(&self) {
        let mut inner = self.lock();
        inner.calls.clear();
        inner.events.clear();
    }

    #[must_use]
    pub fn events(&self) -> Vec<InstanceEvent> {
        self.lock().events.clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>> {
        let mut inner = self.lock();
        inner.calls.push(Call::Object(Verb::Get, key.clone()));
        inner.injected(Verb::Get, key)?;
        Ok(inner.objects.get(key).cloned())
    }

    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject> {
        let key = obj.key();
        let mut inner = self.lock();
        inner.calls.push(Call::Object(Verb::Create, key.clone()));
        inner.injected(Verb::Create, &key)?;
        if inner.objects.contains_key(&key) {
            return Err(crate::Error::object("create", &key, api_error(409, "AlreadyExists")));
        }
        let mut obj = obj.clone();
        let version = inner.next_version();
        let meta = obj.meta_mut();
        meta.resource_version = Some(version.clone());
        meta.uid = Some(format!("uid-{version}"));
        inner.objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject> {
        let key = obj.key();
        let mut inner = self.lock();
        inner.calls.push(Call::Object(Verb::Update, key.clone()));
        inner.injected(Verb::Update, &key)?;
        let Some(current) = inner.objects.get(&key) else {
            return Err(crate::Error::object("update", &key, api_error(404, "NotFound")));
        };
        if obj.meta().resource_version.is_some() && obj.meta().resource_version != current.meta().resource_version {
            return Err(crate::Error::object("update", &key, api_error(409, "Conflict")));
        }
        let uid = current.meta().uid.clone();
        let mut obj = obj.clone();
        let version = inner.next_version();
        let meta = obj.meta_mut();
        meta.resource_version = Some(version);
        meta.uid = uid;
        inner.objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut inner = self.lock();
        inner.calls.push(Call::Object(Verb::Delete, key.clone()));
        inner.injected(Verb::Delete, key)?;
        if !inner.objects.contains_key(key) {
            return Err(crate::Error::object("delete", key, api_error(404, "NotFound")));
        }
        if !inner.sticky.contains(key) {
            inner.objects.remove(key);
        }
        Ok(())
    }

    async fn get_instance(&self, namespace: &str, name: &str) -> Result<Option<NodeFeatureDiscovery>> {
        let mut inner = self.lock();
        inner.calls.push(Call::Instance(Verb::Get, format!("{namespace}/{name}")));
        Ok(inner
            .instances
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_instances(&self) -> Result<Vec<NodeFeatureDiscovery>> {
        let mut inner = self.lock();
        inner.calls.push(Call::Instance(Verb::List, String::new()));
        Ok(inner.instances.values().cloned().collect())
    }

    async fn update_instance(&self, inst: &NodeFeatureDiscovery) -> Result<NodeFeatureDiscovery> {
        let (ns, name) = instance_id(inst);
        let mut inner = self.lock();
        inner.calls.push(Call::Instance(Verb::Update, format!("{ns}/{name}")));
        let version = inner.next_version();
        let Some(current) = inner.instances.get_mut(&(ns.clone(), name.clone())) else {
            return Err(api_error(404, "NotFound").into());
        };
        if inst.metadata.resource_version.is_some() && inst.metadata.resource_version != current.metadata.resource_version {
            return Err(api_error(409, "Conflict").into());
        }
        current.metadata.finalizers = inst.metadata.finalizers.clone();
        current.metadata.labels = inst.metadata.labels.clone();
        current.metadata.annotations = inst.metadata.annotations.clone();
        current.metadata.resource_version = Some(version);
        if serde_json::to_value(&current.spec).ok() != serde_json::to_value(&inst.spec).ok() {
            current.spec = inst.spec.clone();
            current.metadata.generation = Some(current.metadata.generation.unwrap_or(0) + 1);
        }
        let updated = current.clone();
        inner.collect_instance(&ns, &name);
        Ok(updated)
    }

    async fn update_instance_status(&self, inst: &NodeFeatureDiscovery) -> Result<NodeFeatureDiscovery> {
        let (ns, name) = instance_id(inst);
        let mut inner = self.lock();
        inner.calls.push(Call::Instance(Verb::Status, format!("{ns}/{name}")));
        let version = inner.next_version();
        let Some(current) = inner.instances.get_mut(&(ns, name)) else {
            return Err(api_error(404, "NotFound").into());
        };
        if inst.metadata.resource_version.is_some() && inst.metadata.resource_version != current.metadata.resource_version {
            return Err(api_error(409, "Conflict").into());
        }
        current.status = inst.status.clone();
        current.metadata.resource_version = Some(version);
        Ok(current.clone())
    }

    async fn publish_event(&self, inst: &NodeFeatureDiscovery, event: InstanceEvent) -> Result<()> {
        let (ns, name) = instance_id(inst);
        let mut inner = self.lock();
        inner.calls.push(Call::Instance(Verb::Event, format!("{ns}/{name}")));
        inner.events.push(event);
        Ok(())
    }
}
