//! Cached pods: identity, QoS classification and the lazily-built
//! per-container affinity table.

use std::{cell::OnceCell, collections::BTreeMap};

use serde::{Deserialize, Serialize};

use crate::{
    affinity::{self, AffinityMap, DEFAULT_WEIGHT, parse_affinities},
    annotations,
    expression::{EvalValue, Evaluable, Expression, Operator, Result as EvalResult},
    messages::{PodCreateRequest, PodListEntry},
    resources::ResourceRequirements,
};

/// Label the kubelet attaches carrying the pod UID.
const UID_LABEL: &str = "io.kubernetes.pod.uid";

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
pub enum PodState {
    #[default]
    Ready,
    NotReady,
    /// Absent from the latest refresh listing, about to be removed.
    Stale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
}

/// A pod known to the cache. Containers reference their pod through its
/// sandbox id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pod {
    /// Runtime sandbox id.
    pub id: String,

    /// Stable unique id; may be empty when neither metadata, labels nor
    /// the cgroup parent reveal it.
    pub uid: String,

    pub name: String,
    pub namespace: String,
    pub state: PodState,

    /// Immutable for the pod's lifetime once set.
    pub qos_class: QosClass,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub cgroup_parent: String,

    /// Webhook-annotated per-container resource requirements.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRequirements>,

    /// Affinity table parsed from annotations on first access and
    /// memoized for the pod's lifetime.
    #[serde(skip)]
    affinity: OnceCell<AffinityMap>,
}

impl PartialEq for Pod {
    /// The memoized affinity table is derived state and not part of pod
    /// identity.
    fn eq(&self, other: &Self) -> bool {
        (
            &self.id,
            &self.uid,
            &self.name,
            &self.namespace,
            self.state,
            self.qos_class,
            &self.labels,
            &self.annotations,
            &self.cgroup_parent,
            &self.resources,
        ) == (
            &other.id,
            &other.uid,
            &other.name,
            &other.namespace,
            other.state,
            other.qos_class,
            &other.labels,
            &other.annotations,
            &other.cgroup_parent,
            &other.resources,
        )
    }
}

impl Pod {
    pub fn from_create_request(id: impl Into<String>, request: PodCreateRequest) -> Self {
        let uid = derive_uid(&request.uid, &request.labels, &request.cgroup_parent);
        let resources = webhook_resources(&request.annotations);
        let qos_class = qos_from_cgroup_parent(&request.cgroup_parent)
            .unwrap_or_else(|| qos_from_resources(&resources));

        Self {
            id: id.into(),
            uid,
            name: request.name,
            namespace: request.namespace,
            state: PodState::Ready,
            qos_class,
            labels: request.labels,
            annotations: request.annotations,
            cgroup_parent: request.cgroup_parent,
            resources,
            affinity: OnceCell::new(),
        }
    }

    pub fn from_list_entry(entry: PodListEntry) -> Self {
        let uid = derive_uid(&entry.uid, &entry.labels, "");
        let resources = webhook_resources(&entry.annotations);
        let qos_class = qos_from_resources(&resources);

        Self {
            id: entry.id,
            uid,
            name: entry.name,
            namespace: entry.namespace,
            state: entry.state,
            qos_class,
            labels: entry.labels,
            annotations: entry.annotations,
            cgroup_parent: String::new(),
            resources,
            affinity: OnceCell::new(),
        }
    }

    /// The scope expression selecting this pod's own containers.
    pub fn scope_expression(&self) -> Expression {
        Expression::new("pod/uid", Operator::Equals, [self.uid.as_str()])
    }

    /// The affinity table parsed from the `affinity` and `anti-affinity`
    /// annotations, keyed by container name. Computed on first access
    /// and memoized; later annotation changes are not reflected.
    pub fn affinity_map(&self) -> Result<&AffinityMap, affinity::Error> {
        if let Some(map) = self.affinity.get() {
            return Ok(map);
        }
        let map = self.build_affinity_map()?;
        Ok(self.affinity.get_or_init(|| map))
    }

    fn build_affinity_map(&self) -> Result<AffinityMap, affinity::Error> {
        let scope = self.scope_expression();
        let mut map = AffinityMap::new();

        if let Some(value) = annotations::pod_annotation(&self.annotations, annotations::AFFINITY)
        {
            merge_affinities(&mut map, parse_affinities(value, &scope, DEFAULT_WEIGHT)?);
        }
        if let Some(value) =
            annotations::pod_annotation(&self.annotations, annotations::ANTI_AFFINITY)
        {
            merge_affinities(&mut map, parse_affinities(value, &scope, -DEFAULT_WEIGHT)?);
        }

        Ok(map)
    }

    /// Webhook-annotated requirements for one container, if present.
    pub fn container_requirements(&self, container_name: &str) -> Option<&ResourceRequirements> {
        self.resources.get(container_name)
    }
}

fn merge_affinities(into: &mut AffinityMap, from: AffinityMap) {
    for (container, mut affinities) in from {
        into.entry(container).or_default().append(&mut affinities);
    }
}

/// Derives the pod UID from metadata, the kubelet's uid label, or the
/// cgroup parent path, in that order.
fn derive_uid(meta_uid: &str, labels: &BTreeMap<String, String>, cgroup_parent: &str) -> String {
    if !meta_uid.is_empty() {
        return meta_uid.to_owned();
    }
    if let Some(uid) = labels.get(UID_LABEL) {
        return uid.clone();
    }
    uid_from_cgroup_parent(cgroup_parent).unwrap_or_default()
}

/// Extracts the pod UID from a cgroupfs (`.../pod<uid>`) or systemd
/// (`...-pod<uid with underscores>.slice`) cgroup parent path.
fn uid_from_cgroup_parent(path: &str) -> Option<String> {
    for component in path.split('/') {
        if component.is_empty() {
            continue;
        }
        if let Some(slice) = component.strip_suffix(".slice") {
            if let Some(idx) = slice.rfind("pod") {
                let uid = &slice[idx + "pod".len()..];
                if !uid.is_empty() {
                    return Some(uid.replace('_', "-"));
                }
            }
            continue;
        }
        if let Some(uid) = component.strip_prefix("pod") {
            if !uid.is_empty() {
                return Some(uid.to_owned());
            }
        }
    }
    None
}

/// Classifies QoS from the cgroup parent path. An empty path defers to
/// resource-based derivation.
fn qos_from_cgroup_parent(path: &str) -> Option<QosClass> {
    if path.is_empty() {
        return None;
    }
    if path.contains("besteffort") {
        return Some(QosClass::BestEffort);
    }
    if path.contains("burstable") {
        return Some(QosClass::Burstable);
    }
    Some(QosClass::Guaranteed)
}

/// Kubernetes QoS rules over the webhook-annotated requirements:
/// Guaranteed needs cpu and memory limits on every container with
/// requests absent or equal; any other request or limit is Burstable;
/// nothing at all is BestEffort.
fn qos_from_resources(resources: &BTreeMap<String, ResourceRequirements>) -> QosClass {
    if resources.is_empty()
        || resources
            .values()
            .all(|r| r.requests.is_empty() && r.limits.is_empty())
    {
        return QosClass::BestEffort;
    }

    let guaranteed = resources.values().all(|r| {
        ["cpu", "memory"].iter().all(|resource| {
            let Some(limit) = r.limits.get(*resource) else {
                return false;
            };
            r.requests.get(*resource).is_none_or(|request| request == limit)
        })
    });

    if guaranteed {
        QosClass::Guaranteed
    } else {
        QosClass::Burstable
    }
}

/// Parses the webhook resource annotation: a map from container name to
/// requirements. Malformed values are ignored.
fn webhook_resources(
    annotations: &BTreeMap<String, String>,
) -> BTreeMap<String, ResourceRequirements> {
    let Some(value) = annotations::pod_annotation(annotations, annotations::RESOURCES) else {
        return BTreeMap::new();
    };
    serde_yaml::from_str(value).unwrap_or_default()
}

impl Evaluable for Pod {
    fn eval(&self, key: &str) -> EvalResult<EvalValue<'_>> {
        match key {
            "name" => Ok(EvalValue::Str(self.name.clone())),
            "namespace" => Ok(EvalValue::Str(self.namespace.clone())),
            "qosclass" => Ok(EvalValue::Str(self.qos_class.to_string())),
            "labels" => Ok(EvalValue::Map(self.labels.clone())),
            "id" => Ok(EvalValue::Str(self.id.clone())),
            "uid" => Ok(EvalValue::Str(self.uid.clone())),
            key => crate::expression::UnknownKeySnafu { key }.fail(),
        }
    }
}
