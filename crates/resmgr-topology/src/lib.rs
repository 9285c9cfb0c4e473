//! Hardware topology discovery for node-local resource policies.
//!
//! The model is a tree of `Package → Die → NUMA node → CPU`, read on
//! demand from sysfs. All readers take an explicit filesystem root so the
//! whole crate can be exercised against a mock `/sys` tree in tests.

pub mod hints;
pub mod sysfs;
pub mod system;

pub use hints::{
    PROVIDER_KUBELET, TopologyHint, TopologyHints, hints_for_device, hints_for_sysfs_path,
    merge_hints,
};
pub use system::{Cpu, CpuCacheType, DiscoverOpts, Epp, MemType, Node, Package, System};
