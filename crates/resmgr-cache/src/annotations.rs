//! The resource-manager annotation vocabulary and its resolution rules.

use std::collections::BTreeMap;

/// Annotation namespace of the resource manager.
pub const NAMESPACE: &str = "cri-resource-manager.intel.com";

/// Container-to-container affinity (simple or full form).
pub const AFFINITY: &str = "affinity";

/// Container-to-container anti-affinity (simple or full form).
pub const ANTI_AFFINITY: &str = "anti-affinity";

/// Opt-in/out boolean for sysfs-derived topology hints.
pub const TOPOLOGY_HINTS: &str = "topologyhints";

/// RDT class assignment.
pub const RDT_CLASS: &str = "rdtclass";

/// Block I/O class assignment.
pub const BLOCKIO_CLASS: &str = "blockioclass";

/// Top-tier memory limit, a Kubernetes resource quantity.
pub const TOPTIER_LIMIT: &str = "toptierlimit";

/// Webhook-annotated per-container resource requirements.
pub const RESOURCES: &str = "resources";

/// Resolves annotation key `key` for container `container_name`, walking
/// `<ns>/<key>/container.<name>`, `<ns>/<key>/pod`, `<ns>/<key>` and
/// returning the first hit.
pub fn effective_annotation<'a>(
    annotations: &'a BTreeMap<String, String>,
    key: &str,
    container_name: &str,
) -> Option<&'a str> {
    [
        format!("{NAMESPACE}/{key}/container.{container_name}"),
        format!("{NAMESPACE}/{key}/pod"),
        format!("{NAMESPACE}/{key}"),
    ]
    .iter()
    .find_map(|key| annotations.get(key).map(String::as_str))
}

/// Looks up the unscoped (pod-wide) variant of an annotation key.
pub fn pod_annotation<'a>(
    annotations: &'a BTreeMap<String, String>,
    key: &str,
) -> Option<&'a str> {
    annotations.get(&format!("{NAMESPACE}/{key}")).map(String::as_str)
}

/// Interprets an annotation value as a boolean. Anything but the literal
/// `true`/`false` yields `None`.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}
