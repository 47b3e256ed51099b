use crate::{Metrics, nodefeaturediscovery};
use chrono::{DateTime, Utc};
use common::{
    Error, KubeStore, NodeFeatureDiscovery, ObjectStore, OperatorConfig, Result, context::get_reporter,
    manifests::ManifestRegistry,
};
use futures::{FutureExt, StreamExt, future::BoxFuture};
use k8s_openapi::{
    NamespaceResourceScope,
    api::{
        apps::v1::{DaemonSet, Deployment},
        batch::v1::Job,
        core::v1::{ConfigMap, Service},
    },
};
use kube::{
    Resource,
    api::{Api, ListParams},
    client::Client,
    runtime::{controller::Controller, events::Reporter, watcher::Config},
};
use prometheus_client::encoding::text::encode;
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::{debug, warn};

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Cluster objects access
    pub store: Arc<dyn ObjectStore>,
    /// Operand templates
    pub manifests: Arc<ManifestRegistry>,
    pub config: OperatorConfig,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Consecutive failures per instance, with the time of the last one
    failures: Arc<Mutex<HashMap<String, (u32, Instant)>>>,
}

impl Context {
    pub fn new(store: Arc<dyn ObjectStore>, config: OperatorConfig) -> Result<Self> {
        Ok(Self {
            store,
            manifests: Arc::new(ManifestRegistry::load()?),
            config,
            diagnostics: Arc::default(),
            metrics: Metrics::default(),
            failures: Arc::default(),
        })
    }

    /// Delay before retrying a failed instance, doubled on each consecutive failure.
    /// Entries idle for twice the maximum delay belong to vanished instances and are dropped.
    pub fn retry_delay(&self, instance: &str, error: &Error) -> Duration {
        if error.is_conflict() {
            return Duration::from_secs(1);
        }
        let now = Instant::now();
        let stale = self.config.max_error_requeue.saturating_mul(2);
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.retain(|_, (_, last)| now.duration_since(*last) < stale);
        let (count, last) = failures.entry(instance.to_string()).or_insert((0, now));
        let delay = self
            .config
            .error_requeue
            .saturating_mul(2u32.saturating_pow(*count))
            .min(self.config.max_error_requeue);
        *count = count.saturating_add(1);
        *last = now;
        delay
    }

    pub fn reset_retry(&self, instance: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance);
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: get_reporter(),
        }
    }
}

/// Data owned by the Manager
#[derive(Clone, Default)]
pub struct Manager {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    metrics: Metrics,
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Manager that owns a Controller for NodeFeatureDiscovery
impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` that drives a `Controller` + a future to be awaited
    /// It is up to `main` to wait for the controller stream.
    pub async fn new(config: OperatorConfig) -> Result<(Self, BoxFuture<'static, ()>)> {
        let client = Client::try_default().await?;
        let manager = Manager::default();
        let ns = config.watch_namespace.clone();
        let mut context = Context::new(Arc::new(KubeStore::new(client.clone())), config)?;
        context.diagnostics = manager.diagnostics.clone();
        context.metrics = manager.metrics.clone();
        let context = Arc::new(context);

        let nfds: Api<NodeFeatureDiscovery> = scoped_api(&client, ns.as_deref());
        // Ensure CRD is installed before loop-watching
        nfds.list(&ListParams::default().limit(1)).await.map_err(|e| {
            Error::Config(format!(
                "is the crd installed? please run: cargo run --bin crdgen | kubectl apply -f - ({e})"
            ))
        })?;

        let owned = || Config::default().any_semantic();
        let controller = Controller::new(nfds, Config::default().any_semantic())
            .owns(scoped_api::<DaemonSet>(&client, ns.as_deref()), owned())
            .owns(scoped_api::<Deployment>(&client, ns.as_deref()), owned())
            .owns(scoped_api::<ConfigMap>(&client, ns.as_deref()), owned())
            .owns(scoped_api::<Service>(&client, ns.as_deref()), owned())
            .owns(scoped_api::<Job>(&client, ns.as_deref()), owned())
            .shutdown_on_signal()
            .run(nodefeaturediscovery::reconcile, nodefeaturediscovery::error_policy, context)
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("reconciled {:?}", o),
                    Err(e) => warn!("reconcile failed: {}", e),
                }
            })
            .boxed();

        Ok((manager, controller))
    }

    /// Metrics getter
    #[must_use]
    pub fn metrics(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.metrics.registry) {
            warn!("Failed to encode metrics: {e}");
        }
        buffer
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}
