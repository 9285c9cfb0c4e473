//! Cached containers: identity, derived attributes, topology hints and
//! per-controller pending-change tracking.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    str::FromStr,
    sync::LazyLock,
};

use regex::Regex;
use resmgr_idset::CpuSet;
use resmgr_topology::{TopologyHint, TopologyHints, hints_for_device, merge_hints};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    annotations,
    expression::{EvalValue, Evaluable, Result as EvalResult, UnknownKeySnafu},
    messages::{ContainerCreateRequest, ContainerListEntry},
    pod::Pod,
    quantity::MemQuantity,
    resources::{LinuxResources, ResourceRequirements},
};

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
pub enum ContainerState {
    #[default]
    Creating,
    Created,
    Running,
    Exited,
    Unknown,
    /// Absent from the latest refresh listing, about to be removed.
    Stale,
}

/// Controllers that apply pending container mutations.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
pub enum Controller {
    #[strum(serialize = "cri")]
    Cri,

    #[strum(serialize = "rdt")]
    Rdt,

    #[strum(serialize = "blockio")]
    Blockio,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub container_path: String,
    pub host_path: String,

    #[serde(default)]
    pub read_only: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub container_path: String,
    pub host_path: String,

    #[serde(default)]
    pub permissions: String,
}

/// A container known to the cache.
///
/// Identified by a stable cache id (`<pod-uid>:<name>`, or a counter form
/// when the pod uid is unknown) and, once the runtime has answered the
/// create request, by the runtime id as well.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub cache_id: String,

    /// Empty until the runtime's create response arrives.
    #[serde(default)]
    pub runtime_id: String,

    /// Sandbox id of the owning pod.
    pub pod_id: String,

    pub name: String,
    pub namespace: String,
    pub state: ContainerState,

    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Free-form key/value pairs policies attach to the container.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Mounts keyed by container path.
    #[serde(default)]
    pub mounts: BTreeMap<String, Mount>,

    /// Devices keyed by container path.
    #[serde(default)]
    pub devices: BTreeMap<String, Device>,

    /// Topology hints keyed by provider.
    #[serde(default)]
    pub hints: TopologyHints,

    /// Requirements from the webhook annotation, or estimated from the
    /// Linux resources when the annotation is absent.
    #[serde(default)]
    pub requirements: ResourceRequirements,

    #[serde(default)]
    pub toptier_limit: Option<u64>,

    resources: LinuxResources,

    #[serde(default)]
    rdt_class: Option<String>,

    #[serde(default)]
    blockio_class: Option<String>,

    #[serde(default)]
    pending: BTreeSet<Controller>,

    #[serde(default)]
    pending_request: Option<serde_json::Value>,

    pretty: String,
}

impl Container {
    pub(crate) fn from_create_request(
        cache_id: impl Into<String>,
        request: ContainerCreateRequest,
        pod: &Pod,
    ) -> Self {
        let mounts = request
            .mounts
            .into_iter()
            .map(|mount| (mount.container_path.clone(), mount))
            .collect();
        let devices = request
            .devices
            .into_iter()
            .map(|device| (device.container_path.clone(), device))
            .collect();

        let mut container = Self {
            cache_id: cache_id.into(),
            runtime_id: String::new(),
            pod_id: request.pod_sandbox_id,
            name: request.name,
            namespace: pod.namespace.clone(),
            state: ContainerState::Creating,
            image: request.image,
            command: request.command,
            args: request.args,
            labels: request.labels,
            annotations: request.annotations,
            env: request.env,
            tags: BTreeMap::new(),
            mounts,
            devices,
            hints: TopologyHints::new(),
            requirements: ResourceRequirements::default(),
            toptier_limit: None,
            resources: request.resources,
            rdt_class: None,
            blockio_class: None,
            pending: BTreeSet::new(),
            pending_request: None,
            pretty: String::new(),
        };
        container.finish_setup(pod);
        container
    }

    pub(crate) fn from_list_entry(
        cache_id: impl Into<String>,
        entry: ContainerListEntry,
        pod: &Pod,
    ) -> Self {
        let mut container = Self {
            cache_id: cache_id.into(),
            runtime_id: entry.id,
            pod_id: entry.pod_sandbox_id,
            name: entry.name,
            namespace: pod.namespace.clone(),
            state: entry.state,
            image: entry.image,
            command: Vec::new(),
            args: Vec::new(),
            labels: entry.labels,
            annotations: entry.annotations,
            env: BTreeMap::new(),
            tags: BTreeMap::new(),
            mounts: BTreeMap::new(),
            devices: BTreeMap::new(),
            hints: TopologyHints::new(),
            requirements: ResourceRequirements::default(),
            toptier_limit: None,
            resources: LinuxResources::default(),
            rdt_class: None,
            blockio_class: None,
            pending: BTreeSet::new(),
            pending_request: None,
            pretty: String::new(),
        };
        container.finish_setup(pod);
        container
    }

    /// Fills attributes derived from the owning pod: the pretty name and
    /// the class/limit annotations resolved through the pod.
    fn finish_setup(&mut self, pod: &Pod) {
        self.pretty = format!("{}/{}:{}", pod.namespace, pod.name, self.name);

        self.rdt_class =
            annotations::effective_annotation(&pod.annotations, annotations::RDT_CLASS, &self.name)
                .map(ToOwned::to_owned);
        self.blockio_class = annotations::effective_annotation(
            &pod.annotations,
            annotations::BLOCKIO_CLASS,
            &self.name,
        )
        .map(ToOwned::to_owned);

        self.toptier_limit = annotations::effective_annotation(
            &pod.annotations,
            annotations::TOPTIER_LIMIT,
            &self.name,
        )
        .and_then(|value| match MemQuantity::from_str(value) {
            Ok(quantity) => Some(quantity.as_bytes()),
            Err(err) => {
                debug!(container = %self.pretty, value, error = %err, "invalid toptierlimit");
                None
            }
        });
    }

    /// Walks mounts and devices, deriving topology hints from their
    /// backing sysfs devices, and synthesizes a kubelet hint from the
    /// container's cpuset assignment.
    pub(crate) fn collect_hints(&mut self, sys_dir: &Path) {
        for mount in self.mounts.values() {
            merge_hints(
                &mut self.hints,
                get_topology_hints(sys_dir, &mount.host_path, &mount.container_path, mount.read_only),
            );
        }
        for device in self.devices.values() {
            merge_hints(
                &mut self.hints,
                get_topology_hints(sys_dir, &device.host_path, &device.container_path, false),
            );
        }

        if !self.resources.cpuset_cpus.is_empty() || !self.resources.cpuset_mems.is_empty() {
            let hint = TopologyHint {
                provider: resmgr_topology::PROVIDER_KUBELET.to_owned(),
                cpus: self.resources.cpuset_cpus.clone(),
                nodes: self.resources.cpuset_mems.clone().into_inner(),
                sockets: Default::default(),
            };
            self.hints.entry(hint.provider.clone()).or_insert(hint);
        }
    }

    /// `namespace/pod:container`, cached at construction.
    pub fn pretty_name(&self) -> &str {
        &self.pretty
    }

    pub fn resources(&self) -> &LinuxResources {
        &self.resources
    }

    pub fn rdt_class(&self) -> Option<&str> {
        self.rdt_class.as_deref()
    }

    pub fn blockio_class(&self) -> Option<&str> {
        self.blockio_class.as_deref()
    }

    /// Estimated CPU request in milli-CPUs, from the cgroup shares.
    pub fn cpu_request_milli(&self) -> i64 {
        crate::resources::shares_to_milli_cpu(self.resources.cpu_shares)
    }

    /// Estimated CPU limit in milli-CPUs, from the CFS quota.
    pub fn cpu_limit_milli(&self) -> i64 {
        crate::resources::quota_to_milli_cpu(self.resources.cpu_quota, self.resources.cpu_period)
    }

    /// Sets the CPU request as milli-CPUs, translating to cgroup shares.
    pub fn set_cpu_request_milli(&mut self, milli_cpu: i64) {
        self.set_cpu_shares(crate::resources::milli_cpu_to_shares(milli_cpu));
    }

    /// Sets the CPU limit as milli-CPUs, translating to a CFS quota over
    /// the container's current period.
    pub fn set_cpu_limit_milli(&mut self, milli_cpu: i64) {
        let period = match self.resources.cpu_period {
            0 => crate::resources::DEFAULT_CPU_PERIOD,
            period => period,
        };
        self.set_cpu_quota(crate::resources::milli_cpu_to_quota(milli_cpu, period));
    }

    pub fn set_cpuset_cpus(&mut self, cpus: CpuSet) {
        self.resources.cpuset_cpus = cpus;
        self.mark_pending(Controller::Cri);
    }

    pub fn set_cpuset_mems(&mut self, mems: CpuSet) {
        self.resources.cpuset_mems = mems;
        self.mark_pending(Controller::Cri);
    }

    pub fn set_cpu_shares(&mut self, shares: i64) {
        self.resources.cpu_shares = shares;
        self.mark_pending(Controller::Cri);
    }

    pub fn set_cpu_quota(&mut self, quota: i64) {
        self.resources.cpu_quota = quota;
        self.mark_pending(Controller::Cri);
    }

    pub fn set_cpu_period(&mut self, period: i64) {
        self.resources.cpu_period = period;
        self.mark_pending(Controller::Cri);
    }

    pub fn set_memory_limit(&mut self, limit: i64) {
        self.resources.memory_limit = limit;
        self.mark_pending(Controller::Cri);
    }

    pub fn set_rdt_class(&mut self, class: Option<String>) {
        self.rdt_class = class;
        self.mark_pending(Controller::Rdt);
    }

    pub fn set_blockio_class(&mut self, class: Option<String>) {
        self.blockio_class = class;
        self.mark_pending(Controller::Blockio);
    }

    pub fn mark_pending(&mut self, controller: Controller) {
        self.pending.insert(controller);
    }

    pub(crate) fn clear_pending(&mut self, controller: Controller) {
        self.pending.remove(&controller);
    }

    pub fn has_pending(&self, controller: Controller) -> bool {
        self.pending.contains(&controller)
    }

    pub fn pending_controllers(&self) -> &BTreeSet<Controller> {
        &self.pending
    }

    pub(crate) fn pending_request(&self) -> Option<&serde_json::Value> {
        self.pending_request.as_ref()
    }

    pub(crate) fn set_pending_request(&mut self, request: serde_json::Value) -> bool {
        if self.pending_request.is_some() {
            return false;
        }
        self.pending_request = Some(request);
        true
    }

    pub(crate) fn take_pending_request(&mut self) -> Option<serde_json::Value> {
        self.pending_request.take()
    }
}

/// Path prefixes that never produce topology hints: infra mounts whose
/// backing device says nothing about where the workload should run.
const FILTERED_PATH_PREFIXES: &[&str] = &[
    "/.cri-resmgr",
    "/etc/",
    "/dev/termination-log",
    "/lib/",
    "/lib64/",
    "/usr/lib/",
    "/usr/lib32/",
    "/usr/lib64/",
];

/// Kubelet-projected configmap/secret volumes, matched anywhere in the
/// path.
static FILTERED_VOLUME_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(kubelet)?/pods/[0-9a-fA-F-]+/volumes/kubernetes\.io~(configmap|secret)/")
        .expect("failed to compile volume path regex")
});

fn path_filtered(path: &str) -> bool {
    FILTERED_PATH_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
        || FILTERED_VOLUME_PATH.is_match(path)
}

/// Derives topology hints for one mount or device. Filtered paths and
/// read-only mounts yield nothing; so do resolution failures, which are
/// only worth a debug log.
pub fn get_topology_hints(
    sys_dir: &Path,
    host_path: &str,
    container_path: &str,
    read_only: bool,
) -> TopologyHints {
    if read_only || path_filtered(host_path) || path_filtered(container_path) {
        return TopologyHints::new();
    }

    match hints_for_device(sys_dir, Path::new(host_path)) {
        Ok(hints) => hints,
        Err(err) => {
            debug!(host_path, error = %err, "no topology hints for path");
            TopologyHints::new()
        }
    }
}

/// Expression-engine view of a container, resolving keys against the
/// container and, through `pod`, its owning pod.
pub struct ContainerEval<'a> {
    pub container: &'a Container,
    pub pod: Option<&'a Pod>,
}

impl Evaluable for ContainerEval<'_> {
    fn eval(&self, key: &str) -> EvalResult<EvalValue<'_>> {
        match key {
            "name" => Ok(EvalValue::Str(self.container.name.clone())),
            "namespace" => Ok(EvalValue::Str(self.container.namespace.clone())),
            "qosclass" => Ok(self.pod.map_or(EvalValue::Missing, |pod| {
                EvalValue::Str(pod.qos_class.to_string())
            })),
            "labels" => Ok(EvalValue::Map(self.container.labels.clone())),
            "tags" => Ok(EvalValue::Map(self.container.tags.clone())),
            "id" => Ok(EvalValue::Str(self.container.runtime_id.clone())),
            "uid" => Ok(self
                .pod
                .map_or(EvalValue::Missing, |pod| EvalValue::Str(pod.uid.clone()))),
            "pod" => Ok(self
                .pod
                .map_or(EvalValue::Missing, |pod| EvalValue::Object(Box::new(pod)))),
            key => UnknownKeySnafu { key }.fail(),
        }
    }
}
