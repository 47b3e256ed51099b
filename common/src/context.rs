use crate::{Error, Result};
use kube::runtime::events::Reporter;
use std::time::Duration;

pub static DEFAULT_OPERAND_IMAGE: &str = "registry.k8s.io/nfd/node-feature-discovery:v0.16.4";
pub static DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Bounded retry applied to each delete step
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Operator settings, read from the environment
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Operand image used when the instance does not name one
    pub default_image: String,
    /// Restrict the controller to a single namespace
    pub watch_namespace: Option<String>,
    /// Manage OpenShift SecurityContextConstraints
    pub manage_security_policies: bool,
    pub delete_retry: RetryPolicy,
    /// Delay before re-checking that finalized objects are gone
    pub finalize_requeue: Duration,
    /// Delay between two prune job state checks
    pub prune_requeue: Duration,
    /// Periodic resync of a converged instance
    pub resync: Duration,
    /// First retry delay after a failure, doubled on each consecutive failure
    pub error_requeue: Duration,
    pub max_error_requeue: Duration,
    pub bind_address: String,
    pub json_logs: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            default_image: DEFAULT_OPERAND_IMAGE.to_string(),
            watch_namespace: None,
            manage_security_policies: true,
            delete_retry: RetryPolicy::default(),
            finalize_requeue: Duration::from_secs(10),
            prune_requeue: Duration::from_secs(10),
            resync: Duration::from_secs(5 * 60),
            error_requeue: Duration::from_secs(5),
            max_error_requeue: Duration::from_secs(5 * 60),
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            json_logs: false,
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(v) => v
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| Error::Config(format!("{name}={v}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match std::env::var(name) {
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(Error::Config(format!("{name}={v} is not a boolean"))),
        },
        Err(_) => Ok(default),
    }
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self> {
        let default = Self::default();
        let config = Self {
            default_image: std::env::var("NODE_FEATURE_DISCOVERY_IMAGE").unwrap_or(default.default_image),
            watch_namespace: std::env::var("WATCH_NAMESPACE").ok().filter(|ns| !ns.is_empty()),
            manage_security_policies: env_bool("MANAGE_SCC", default.manage_security_policies)?,
            delete_retry: RetryPolicy {
                interval: env_secs("DELETE_RETRY_INTERVAL_SECS", default.delete_retry.interval)?,
                timeout: env_secs("DELETE_TIMEOUT_SECS", default.delete_retry.timeout)?,
            },
            finalize_requeue: env_secs("FINALIZE_REQUEUE_SECS", default.finalize_requeue)?,
            prune_requeue: env_secs("PRUNE_REQUEUE_SECS", default.prune_requeue)?,
            resync: env_secs("RESYNC_SECS", default.resync)?,
            error_requeue: env_secs("ERROR_REQUEUE_SECS", default.error_requeue)?,
            max_error_requeue: env_secs("MAX_ERROR_REQUEUE_SECS", default.max_error_requeue)?,
            bind_address: std::env::var("BIND_ADDRESS").unwrap_or(default.bind_address),
            json_logs: std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")),
        };
        if config.delete_retry.interval > config.delete_retry.timeout {
            return Err(Error::Config(
                "DELETE_RETRY_INTERVAL_SECS is larger than DELETE_TIMEOUT_SECS".to_string(),
            ));
        }
        Ok(config)
    }
}

pub fn get_client_name() -> String {
    "nfd-operator.nfd.k8s-sigs.io".to_string()
}

pub fn get_reporter() -> Reporter {
    Reporter {
        controller: "nfd-operator".to_string(),
        instance: Some(std::env::var("POD_NAME").unwrap_or_else(|_| "unknown".to_string())),
    }
}
