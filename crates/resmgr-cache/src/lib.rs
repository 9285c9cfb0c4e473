//! The workload-aware resource cache: an in-memory, persisted model of
//! the pods and containers known to a node-local policy, the expression
//! and affinity engines evaluated over it, and the policy-entry store
//! policies use to survive restarts.
//!
//! The cache is driven by runtime ingress messages (see [`messages`]),
//! consults [`resmgr_topology`] for hardware facts, and writes a JSON
//! snapshot after every mutation.

pub mod affinity;
pub mod annotations;
pub mod cache;
pub mod container;
pub mod expression;
pub mod messages;
pub mod metrics;
pub mod pod;
pub mod quantity;
pub mod resources;
pub mod store;

pub use affinity::{Affinity, AffinityMap, ImplicitAffinity, USER_WEIGHT_CUTOFF, sum_weights};
pub use cache::{Cache, CacheOptions, RefreshResult, SNAPSHOT_VERSION};
pub use container::{Container, ContainerEval, ContainerState, Controller, Device, Mount};
pub use expression::{EvalValue, Evaluable, Expression, Operator};
pub use messages::{
    ContainerCreateRequest, ContainerCreateResponse, ContainerIngress, ContainerListEntry,
    PodCreateRequest, PodIngress, PodListEntry,
};
pub use metrics::MetricsRing;
pub use pod::{Pod, PodState, QosClass};
pub use resources::{LinuxResources, ResourceRequirements};
pub use store::{Cachable, CacheEntry};
