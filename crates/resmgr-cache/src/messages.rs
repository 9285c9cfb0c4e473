//! Runtime ingress messages.
//!
//! The relay translates CRI traffic into these tagged variants before
//! handing them to the cache, so every cache operation dispatches with an
//! exhaustive match instead of probing opaque payload shapes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    container::{ContainerState, Device, Mount},
    pod::PodState,
    resources::LinuxResources,
};

/// Pod-level ingress: either an intercepted sandbox-creation request or
/// one entry of a full sandbox listing.
#[derive(Clone, Debug, PartialEq)]
pub enum PodIngress {
    CreateRequest(PodCreateRequest),
    ListEntry(PodListEntry),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PodCreateRequest {
    pub name: String,
    pub namespace: String,
    pub uid: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub cgroup_parent: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PodListEntry {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub state: PodState,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Container-level ingress: an intercepted container-creation request or
/// one entry of a full container listing.
#[derive(Clone, Debug, PartialEq)]
pub enum ContainerIngress {
    CreateRequest(ContainerCreateRequest),
    ListEntry(ContainerListEntry),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerCreateRequest {
    pub pod_sandbox_id: String,
    pub name: String,

    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub mounts: Vec<Mount>,

    #[serde(default)]
    pub devices: Vec<Device>,

    #[serde(default)]
    pub resources: LinuxResources,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerListEntry {
    /// Runtime-assigned container id.
    pub id: String,
    pub pod_sandbox_id: String,
    pub name: String,
    pub state: ContainerState,

    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// The runtime's answer to a create-container request, carrying the
/// runtime-assigned container id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerCreateResponse {
    pub container_id: String,
}
