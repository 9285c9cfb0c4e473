//! Reconstruction of Kubernetes-style resource requests and limits from
//! plain Linux container resources, used when no webhook annotation is
//! present.

use std::collections::BTreeMap;

use resmgr_idset::CpuSet;
use serde::{Deserialize, Serialize};

use crate::pod::QosClass;

/// cgroup CPU shares assigned to containers with no CPU request.
pub const MIN_SHARES: i64 = 2;

/// Default CFS period, used when a container has none set.
pub const DEFAULT_CPU_PERIOD: i64 = 100_000;

/// OOM score adjustment the kubelet gives Guaranteed pods.
pub const OOM_ADJ_GUARANTEED: i64 = -998;

/// OOM score adjustment the kubelet gives BestEffort pods.
pub const OOM_ADJ_BEST_EFFORT: i64 = 1000;

/// Linux resource parameters of a container, as they appear in the CRI
/// container config.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinuxResources {
    #[serde(default)]
    pub cpu_shares: i64,

    #[serde(default)]
    pub cpu_quota: i64,

    #[serde(default)]
    pub cpu_period: i64,

    #[serde(default)]
    pub memory_limit: i64,

    #[serde(default)]
    pub oom_score_adj: i64,

    #[serde(default)]
    pub cpuset_cpus: CpuSet,

    #[serde(default)]
    pub cpuset_mems: CpuSet,
}

/// Requests and limits as resource-name to quantity-string maps, the
/// shape the webhook annotation carries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,

    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

/// Converts cgroup CPU shares to milli-CPUs. `MIN_SHARES` is what the
/// kubelet assigns when there is no request at all.
pub fn shares_to_milli_cpu(shares: i64) -> i64 {
    if shares <= MIN_SHARES {
        return 0;
    }
    (shares * 1000 + 512) / 1024
}

pub fn milli_cpu_to_shares(milli_cpu: i64) -> i64 {
    (milli_cpu * 1024 + 500) / 1000
}

/// Converts a CFS quota/period pair to milli-CPUs.
pub fn quota_to_milli_cpu(quota: i64, period: i64) -> i64 {
    if quota <= 0 || period <= 0 {
        return 0;
    }
    (quota * 1000 + period / 2) / period
}

pub fn milli_cpu_to_quota(milli_cpu: i64, period: i64) -> i64 {
    milli_cpu * period / 1000
}

/// Inverts the kubelet's OOM score adjustment back to a memory request.
///
/// The kubelet computes `adj = 1000 - 1000 * request / capacity` for
/// Burstable pods; Guaranteed and BestEffort pods get fixed sentinel
/// values instead. Values within ±1 of a sentinel clamp to that
/// boundary: the BestEffort boundary is "no request", the Guaranteed
/// boundary is "request equals limit".
pub fn oom_adj_to_mem_request(oom_score_adj: i64, mem_capacity: u64, mem_limit: i64) -> i64 {
    if (oom_score_adj - OOM_ADJ_BEST_EFFORT).abs() <= 1 {
        return 0;
    }
    if (oom_score_adj - OOM_ADJ_GUARANTEED).abs() <= 1 {
        return mem_limit;
    }

    let request = (mem_capacity as i128) * (1000 - i128::from(oom_score_adj)) / 1000;
    request.clamp(0, i128::from(i64::MAX)) as i64
}

/// Estimates Kubernetes-style requirements from Linux resources.
///
/// For Guaranteed pods the CPU limit mirrors the CPU request and the
/// memory request mirrors the memory limit, matching how the kubelet
/// derives the cgroup parameters in the first place.
pub fn estimate_requirements(
    resources: &LinuxResources,
    qos: QosClass,
    mem_capacity: u64,
) -> ResourceRequirements {
    let mut requests = BTreeMap::new();
    let mut limits = BTreeMap::new();

    let cpu_request = shares_to_milli_cpu(resources.cpu_shares);
    let mut cpu_limit = quota_to_milli_cpu(resources.cpu_quota, resources.cpu_period);
    let mut mem_request =
        oom_adj_to_mem_request(resources.oom_score_adj, mem_capacity, resources.memory_limit);
    let mem_limit = resources.memory_limit;

    if qos == QosClass::Guaranteed {
        cpu_limit = cpu_request;
        mem_request = mem_limit;
    }

    if cpu_request > 0 {
        requests.insert("cpu".to_owned(), format_milli_cpu(cpu_request));
    }
    if cpu_limit > 0 {
        limits.insert("cpu".to_owned(), format_milli_cpu(cpu_limit));
    }
    if mem_request > 0 {
        requests.insert("memory".to_owned(), mem_request.to_string());
    }
    if mem_limit > 0 {
        limits.insert("memory".to_owned(), mem_limit.to_string());
    }

    ResourceRequirements { requests, limits }
}

fn format_milli_cpu(milli_cpu: i64) -> String {
    crate::quantity::CpuQuantity::from_millis(milli_cpu).to_string()
}
