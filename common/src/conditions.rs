//! Status conditions of a `NodeFeatureDiscovery` instance.
//!
//! An instance always reports the same four conditions. Component health is
//! first classified per resource, then aggregated into the condition set.
use crate::{Error, ManagedObject, ObjectKey, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema)]
pub enum ConditionsType {
    Available,
    Upgradeable,
    Progressing,
    Degraded,
}

impl ConditionsType {
    pub const ALL: [ConditionsType; 4] = [
        ConditionsType::Available,
        ConditionsType::Upgradeable,
        ConditionsType::Progressing,
        ConditionsType::Degraded,
    ];
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
pub enum ConditionsStatus {
    True,
    #[default]
    False,
}

/// InstanceCondition describes one aspect of the instance health
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceCondition {
    /// LastTransitionTime is the time the condition last changed
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Type of the condition
    #[serde(rename = "type")]
    pub condition_type: ConditionsType,
    /// Status ("True" or "False")
    pub status: ConditionsStatus,
    /// Machine readable reason of the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human readable details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl InstanceCondition {
    #[must_use]
    pub fn new(condition_type: ConditionsType, active: bool, reason: Option<&str>, message: Option<&str>) -> Self {
        InstanceCondition {
            last_transition_time: Some(Utc::now()),
            condition_type,
            status: if active {
                ConditionsStatus::True
            } else {
                ConditionsStatus::False
            },
            reason: reason.map(str::to_string),
            message: message.map(str::to_string),
        }
    }

    #[must_use]
    pub fn is_true(&self) -> bool {
        self.status == ConditionsStatus::True
    }

    /// Same type, status, reason and message; timestamps are ignored
    #[must_use]
    pub fn same_as(&self, other: &InstanceCondition) -> bool {
        self.condition_type == other.condition_type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

fn condition_set(active: ConditionsType, reason: &str, message: &str) -> Vec<InstanceCondition> {
    ConditionsType::ALL
        .into_iter()
        .map(|t| {
            if t == active {
                InstanceCondition::new(t, true, Some(reason), Some(message))
            } else {
                InstanceCondition::new(t, false, None, None)
            }
        })
        .collect()
}

#[must_use]
pub fn available() -> Vec<InstanceCondition> {
    condition_set(
        ConditionsType::Available,
        "AllComponentsReady",
        "All node-feature-discovery components are available",
    )
}

#[must_use]
pub fn progressing(reason: &str, message: &str) -> Vec<InstanceCondition> {
    condition_set(ConditionsType::Progressing, reason, message)
}

#[must_use]
pub fn degraded(reason: &str, message: &str) -> Vec<InstanceCondition> {
    condition_set(ConditionsType::Degraded, reason, message)
}

#[must_use]
pub fn is_available(conditions: &[InstanceCondition]) -> bool {
    conditions
        .iter()
        .any(|c| c.condition_type == ConditionsType::Available && c.is_true())
}

/// Reason of the Degraded condition, when it is active
#[must_use]
pub fn degraded_reason(conditions: &[InstanceCondition]) -> Option<&str> {
    conditions
        .iter()
        .find(|c| c.condition_type == ConditionsType::Degraded && c.is_true())
        .and_then(|c| c.reason.as_deref())
}

/// True when `new` differs from `old` in any type, status, reason or message
#[must_use]
pub fn conditions_changed(old: &[InstanceCondition], new: &[InstanceCondition]) -> bool {
    old.len() != new.len()
        || new
            .iter()
            .any(|n| !old.iter().any(|o| o.same_as(n)))
}

/// Keep the previous transition time of every condition that did not change
#[must_use]
pub fn carry_transition_times(old: &[InstanceCondition], new: Vec<InstanceCondition>) -> Vec<InstanceCondition> {
    new.into_iter()
        .map(|mut n| {
            if let Some(o) = old.iter().find(|o| o.same_as(&n)) {
                n.last_transition_time = o.last_transition_time;
            }
            n
        })
        .collect()
}

/// Health of a single resource, in the shape of the instance conditions
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classification {
    Available,
    Progressing { reason: String, message: String },
    Degraded { reason: String, message: String },
}

impl Classification {
    fn progressing(reason: &str, message: String) -> Self {
        Classification::Progressing {
            reason: reason.to_string(),
            message,
        }
    }

    fn degraded(reason: &str, message: String) -> Self {
        Classification::Degraded {
            reason: reason.to_string(),
            message,
        }
    }
}

/// Pick the single active classification, rejecting zero or several
fn exactly_one(key: &ObjectKey, candidates: Vec<(bool, Classification)>) -> Result<Classification> {
    let mut active: Vec<Classification> = candidates
        .into_iter()
        .filter_map(|(on, c)| on.then_some(c))
        .collect();
    if active.len() == 1 {
        Ok(active.remove(0))
    } else {
        Err(Error::AmbiguousCondition {
            key: key.clone(),
            active: active.len(),
        })
    }
}

fn classify_daemonset(key: &ObjectKey, ds: &DaemonSet) -> Result<Classification> {
    let Some(status) = ds.status.as_ref() else {
        return Ok(Classification::progressing(
            "DaemonSetPending",
            format!("{key} has not reported any status yet"),
        ));
    };
    let desired = status.desired_number_scheduled;
    let ready = status.number_ready;
    let unavailable = status.number_unavailable.unwrap_or(0);
    let updated = status.updated_number_scheduled.unwrap_or(desired);
    let available = desired > 0 && ready >= desired && unavailable == 0 && updated >= desired;
    exactly_one(key, vec![
        (available, Classification::Available),
        (
            desired > 0 && !available,
            Classification::progressing(
                "DaemonSetRollout",
                format!("{key}: {ready}/{desired} pods ready, {unavailable} unavailable"),
            ),
        ),
        (
            desired <= 0,
            Classification::degraded("NoSchedulableNodes", format!("{key} has no pod scheduled on any node")),
        ),
    ])
}

fn deployment_condition(dep: &Deployment, type_: &str) -> Option<bool> {
    dep.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_)
        .map(|c| c.status == "True")
}

fn classify_deployment(key: &ObjectKey, dep: &Deployment) -> Result<Classification> {
    let reported = dep
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|c| !c.is_empty());
    if !reported {
        return Ok(Classification::progressing(
            "DeploymentPending",
            format!("{key} has not reported any condition yet"),
        ));
    }
    let available = deployment_condition(dep, "Available") == Some(true);
    let replica_failure = deployment_condition(dep, "ReplicaFailure") == Some(true);
    let progressing = deployment_condition(dep, "Progressing");
    let degraded = replica_failure || progressing == Some(false);
    exactly_one(key, vec![
        (available, Classification::Available),
        (
            !available && progressing == Some(true) && !replica_failure,
            Classification::progressing("DeploymentRollout", format!("{key} is rolling out")),
        ),
        (
            degraded,
            Classification::degraded(
                if replica_failure {
                    "ReplicaFailure"
                } else {
                    "ProgressDeadlineExceeded"
                },
                format!("{key} cannot reach its desired replicas"),
            ),
        ),
    ])
}

/// Classify one expected resource. A missing resource is still being created.
pub fn classify(key: &ObjectKey, obj: Option<&ManagedObject>) -> Result<Classification> {
    match obj {
        None => Ok(Classification::progressing("ResourceMissing", format!("{key} does not exist yet"))),
        Some(ManagedObject::DaemonSet(ds)) => classify_daemonset(key, ds),
        Some(ManagedObject::Deployment(dep)) => classify_deployment(key, dep),
        Some(_) => Ok(Classification::Available),
    }
}

/// Fold per-resource classifications into the instance condition set.
/// The first degraded resource wins over the first progressing one.
#[must_use]
pub fn aggregate(results: &[(ObjectKey, Classification)]) -> Vec<InstanceCondition> {
    let degraded = results.iter().find_map(|(_, c)| match c {
        Classification::Degraded { reason, message } => Some((reason, message)),
        _ => None,
    });
    if let Some((reason, message)) = degraded {
        return self::degraded(reason, message);
    }
    let progressing = results.iter().find_map(|(_, c)| match c {
        Classification::Progressing { reason, message } => Some((reason, message)),
        _ => None,
    });
    if let Some((reason, message)) = progressing {
        return self::progressing(reason, message);
    }
    available()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManagedKind;
    use k8s_openapi::api::apps::v1::{DaemonSetStatus, DeploymentCondition, DeploymentStatus};

    fn ds_key() -> ObjectKey {
        ObjectKey::namespaced(ManagedKind::DaemonSet, "openshift-nfd", "nfd-worker")
    }

    fn dep_key() -> ObjectKey {
        ObjectKey::namespaced(ManagedKind::Deployment, "openshift-nfd", "nfd-master")
    }

    fn daemonset(desired: i32, ready: i32, unavailable: Option<i32>) -> ManagedObject {
        ManagedObject::DaemonSet(DaemonSet {
            status: Some(DaemonSetStatus {
                desired_number_scheduled: desired,
                number_ready: ready,
                current_number_scheduled: desired,
                number_unavailable: unavailable,
                updated_number_scheduled: Some(desired),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn deployment(conds: &[(&str, &str)]) -> ManagedObject {
        ManagedObject::Deployment(Deployment {
            status: Some(DeploymentStatus {
                conditions: Some(
                    conds
                        .iter()
                        .map(|(t, s)| DeploymentCondition {
                            type_: t.to_string(),
                            status: s.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn count_true(conds: &[InstanceCondition]) -> usize {
        conds.iter().filter(|c| c.is_true()).count()
    }

    #[test]
    fn test_condition_sets_have_exactly_one_true() {
        for set in [available(), progressing("r", "m"), degraded("r", "m")] {
            assert_eq!(set.len(), 4);
            assert_eq!(count_true(&set), 1);
        }
        assert!(is_available(&available()));
        assert!(!is_available(&degraded("r", "m")));
        assert_eq!(degraded_reason(&degraded("Boom", "m")), Some("Boom"));
        assert_eq!(degraded_reason(&progressing("Boom", "m")), None);
        let d = degraded("Boom", "it broke");
        let active = d.iter().find(|c| c.is_true()).unwrap();
        assert_eq!(active.condition_type, ConditionsType::Degraded);
        assert_eq!(active.reason.as_deref(), Some("Boom"));
    }

    #[test]
    fn test_timestamp_only_change_is_not_a_change() {
        let old = available();
        let mut new = available();
        for c in new.iter_mut() {
            c.last_transition_time = Some(Utc::now() + chrono::Duration::hours(1));
        }
        assert!(!conditions_changed(&old, &new));
        assert!(conditions_changed(&old, &progressing("r", "m")));
        assert!(conditions_changed(&[], &available()));
    }

    #[test]
    fn test_message_change_is_a_change() {
        assert!(conditions_changed(&degraded("r", "a"), &degraded("r", "b")));
    }

    #[test]
    fn test_carry_transition_times() {
        let mut old = degraded("r", "m");
        let stamp = Utc::now() - chrono::Duration::days(1);
        for c in old.iter_mut() {
            c.last_transition_time = Some(stamp);
        }
        let new = carry_transition_times(&old, available());
        let avail = new.iter().find(|c| c.condition_type == ConditionsType::Available).unwrap();
        assert_ne!(avail.last_transition_time, Some(stamp));
        let upg = new.iter().find(|c| c.condition_type == ConditionsType::Upgradeable).unwrap();
        assert_eq!(upg.last_transition_time, Some(stamp));
    }

    #[test]
    fn test_missing_resource_is_progressing() {
        let c = classify(&ds_key(), None).unwrap();
        assert!(matches!(c, Classification::Progressing { reason, .. } if reason == "ResourceMissing"));
    }

    #[test]
    fn test_daemonset_classification() {
        assert_eq!(
            classify(&ds_key(), Some(&daemonset(3, 3, None))).unwrap(),
            Classification::Available
        );
        assert!(matches!(
            classify(&ds_key(), Some(&daemonset(3, 1, Some(2)))).unwrap(),
            Classification::Progressing { .. }
        ));
        assert!(matches!(
            classify(&ds_key(), Some(&daemonset(0, 0, None))).unwrap(),
            Classification::Degraded { reason, .. } if reason == "NoSchedulableNodes"
        ));
        assert!(matches!(
            classify(&ds_key(), Some(&ManagedObject::DaemonSet(DaemonSet::default()))).unwrap(),
            Classification::Progressing { .. }
        ));
    }

    #[test]
    fn test_deployment_classification() {
        let avail = deployment(&[("Available", "True"), ("Progressing", "True")]);
        assert_eq!(classify(&dep_key(), Some(&avail)).unwrap(), Classification::Available);
        let rolling = deployment(&[("Available", "False"), ("Progressing", "True")]);
        assert!(matches!(
            classify(&dep_key(), Some(&rolling)).unwrap(),
            Classification::Progressing { .. }
        ));
        let stuck = deployment(&[("Available", "False"), ("Progressing", "False")]);
        assert!(matches!(
            classify(&dep_key(), Some(&stuck)).unwrap(),
            Classification::Degraded { reason, .. } if reason == "ProgressDeadlineExceeded"
        ));
    }

    #[test]
    fn test_ambiguous_deployment_is_an_error() {
        let both = deployment(&[("Available", "True"), ("ReplicaFailure", "True")]);
        let err = classify(&dep_key(), Some(&both)).unwrap_err();
        assert!(matches!(err, Error::AmbiguousCondition { active: 2, .. }));
        let none = deployment(&[("Available", "False")]);
        let err = classify(&dep_key(), Some(&none)).unwrap_err();
        assert!(matches!(err, Error::AmbiguousCondition { active: 0, .. }));
    }

    #[test]
    fn test_aggregate_priorities() {
        let ok = (ds_key(), Classification::Available);
        let prog = (dep_key(), Classification::progressing("P", "p".to_string()));
        let deg = (ds_key(), Classification::degraded("D", "d".to_string()));
        assert!(is_available(&aggregate(&[ok.clone()])));
        let c = aggregate(&[ok.clone(), prog.clone()]);
        assert!(c.iter().any(|c| c.condition_type == ConditionsType::Progressing && c.is_true()));
        let c = aggregate(&[prog, deg, ok]);
        let active = c.iter().find(|c| c.is_true()).unwrap();
        assert_eq!(active.condition_type, ConditionsType::Degraded);
        assert_eq!(active.reason.as_deref(), Some("D"));
        assert!(is_available(&aggregate(&[])));
    }
}
