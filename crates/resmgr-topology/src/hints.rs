//! Topology hints: per-device locality facts derived from the sysfs
//! device tree, consumed by policies to steer placement.

use std::{
    collections::BTreeMap,
    io,
    os::unix::fs::{FileTypeExt, MetadataExt},
    path::{Path, PathBuf},
};

use resmgr_idset::{CpuSet, IdSet};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::sysfs;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to stat device path {}", path.display()))]
    StatDevice { source: io::Error, path: PathBuf },

    #[snafu(display("failed to resolve sysfs device link {}", path.display()))]
    ResolveDevice { source: io::Error, path: PathBuf },

    #[snafu(display("failed to read hint attributes under {}", path.display()))]
    ReadHint {
        source: sysfs::Error,
        path: PathBuf,
    },
}

/// Provider string of hints synthesized from kubelet cpuset assignments.
pub const PROVIDER_KUBELET: &str = "kubelet";

/// Locality of one hint provider: the CPUs, NUMA nodes and packages the
/// provider is attached to. Any of the sets may be empty.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyHint {
    pub provider: String,
    pub cpus: CpuSet,
    pub nodes: IdSet,
    pub sockets: IdSet,
}

/// Hints keyed by provider. The merge rule across sources is
/// first-writer-wins per provider.
pub type TopologyHints = BTreeMap<String, TopologyHint>;

/// Merges `new` into `into`, keeping existing entries on provider
/// collisions.
pub fn merge_hints(into: &mut TopologyHints, new: TopologyHints) {
    for (provider, hint) in new {
        into.entry(provider).or_insert(hint);
    }
}

/// Derives topology hints for a host path by resolving the backing sysfs
/// device directory.
///
/// Character and block device nodes resolve through their `major:minor`
/// link under `<sys>/dev/{char,block}`; anything else (a mount source,
/// eventually) resolves through the block device of the filesystem it
/// lives on. A path whose device has no sysfs presence yields no hints.
pub fn hints_for_device(sys_root: &Path, dev_path: &Path) -> Result<TopologyHints> {
    let meta = std::fs::metadata(dev_path).context(StatDeviceSnafu { path: dev_path })?;
    let file_type = meta.file_type();

    let (kind, rdev) = if file_type.is_char_device() {
        ("char", meta.rdev())
    } else if file_type.is_block_device() {
        ("block", meta.rdev())
    } else {
        ("block", meta.dev())
    };

    let link = sys_root
        .join("dev")
        .join(kind)
        .join(format!("{}:{}", dev_major(rdev), dev_minor(rdev)));

    let device_dir = match std::fs::canonicalize(&link) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(TopologyHints::new()),
        Err(err) => return Err(err).context(ResolveDeviceSnafu { path: link }),
    };

    hints_for_sysfs_path(sys_root, &device_dir)
}

/// Derives topology hints for an already-resolved sysfs device directory.
///
/// Walks from the device directory up towards `<sys>/devices`, stopping
/// at the first directory that exposes locality (`local_cpulist` or a
/// valid `numa_node`). That directory's path becomes the hint provider.
pub fn hints_for_sysfs_path(sys_root: &Path, device_dir: &Path) -> Result<TopologyHints> {
    let devices_root = canonical(&sys_root.join("devices"));

    let mut hints = TopologyHints::new();
    let mut dir = canonical(device_dir);
    while dir.starts_with(&devices_root) && dir != devices_root {
        if let Some(hint) = hint_at(&dir)? {
            hints.insert(hint.provider.clone(), hint);
            break;
        }
        if !dir.pop() {
            break;
        }
    }

    Ok(hints)
}

fn hint_at(dir: &Path) -> Result<Option<TopologyHint>> {
    let cpus: CpuSet = sysfs::read_optional_value(dir, "local_cpulist")
        .context(ReadHintSnafu { path: dir })?
        .unwrap_or_default();

    // The kernel reports -1 for devices with no NUMA affinity.
    let node: Option<i64> = sysfs::read_optional_value(dir, "numa_node")
        .context(ReadHintSnafu { path: dir })?
        .filter(|node| *node >= 0);

    if cpus.is_empty() && node.is_none() {
        return Ok(None);
    }

    let mut nodes = IdSet::new();
    if let Some(node) = node {
        nodes.add(node as usize);
    }

    Ok(Some(TopologyHint {
        provider: dir.display().to_string(),
        cpus,
        nodes,
        sockets: IdSet::new(),
    }))
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_owned())
}

// Linux dev_t encoding, as in glibc's major()/minor().
fn dev_major(rdev: u64) -> u64 {
    ((rdev >> 32) & 0xffff_f000) | ((rdev >> 8) & 0xfff)
}

fn dev_minor(rdev: u64) -> u64 {
    ((rdev >> 12) & 0xffff_ff00) | (rdev & 0xff)
}
